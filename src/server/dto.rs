use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::authz::Decision;
use crate::server::response::ApiError;
use crate::types::{
    ChildPermissionMap, EntityRef, InheritanceMode, InstanceRef, Permission, PermissionGrant,
    Subject, SubjectKind, Target,
};

/// A permission level as sent by clients: a number or a level name.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PermissionInput {
    Level(i64),
    Name(String),
}

impl PermissionInput {
    pub fn parse(&self) -> Result<Permission, ApiError> {
        match self {
            PermissionInput::Level(n) => Permission::try_from(*n).map_err(|n| {
                ApiError::bad_request(format!("Permission level must be between 0 and 7, got {n}"))
            }),
            PermissionInput::Name(name) => Permission::parse(name)
                .ok_or_else(|| ApiError::bad_request(format!("Invalid permission: {name}"))),
        }
    }
}

fn parse_subject_kind(kind: &str) -> Result<SubjectKind, ApiError> {
    SubjectKind::parse(kind)
        .ok_or_else(|| ApiError::bad_request(format!("Invalid subject kind: {kind}")))
}

#[derive(Debug, Deserialize)]
pub struct CheckRequest {
    pub principal_id: String,
    pub entity_type: String,
    pub instance_id: String,
    pub permission: PermissionInput,
}

#[derive(Debug, Serialize)]
pub struct CheckResponse {
    pub allowed: bool,
}

#[derive(Debug, Deserialize)]
pub struct AccessibleRequest {
    pub principal_id: String,
    pub entity_type: String,
    pub permission: PermissionInput,
}

#[derive(Debug, Serialize)]
pub struct ResolveResponse {
    pub decision: &'static str,
    pub level: i8,
}

impl From<Decision> for ResolveResponse {
    fn from(decision: Decision) -> Self {
        let label = match decision {
            Decision::Denied => "denied",
            Decision::NoAccess => "no_access",
            Decision::Granted(_) => "granted",
        };
        Self {
            decision: label,
            level: decision.as_level(),
        }
    }
}

/// Grant in its transport shape, before validation.
#[derive(Debug, Deserialize)]
pub struct GrantRequest {
    pub subject_kind: String,
    pub subject_id: String,
    pub entity_type: String,
    pub entity_instance_id: String,
    pub permission: PermissionInput,
    #[serde(default)]
    pub is_deny: bool,
    #[serde(default)]
    pub inheritance_mode: Option<String>,
    #[serde(default)]
    pub child_permission_map: Option<serde_json::Value>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl GrantRequest {
    pub fn into_grant(self) -> Result<PermissionGrant, ApiError> {
        let subject = Subject {
            kind: parse_subject_kind(&self.subject_kind)?,
            id: self.subject_id,
        };
        let target = Target {
            entity_type: self.entity_type,
            instance: InstanceRef::from(self.entity_instance_id),
        };
        let mut grant = PermissionGrant::new(&subject, &target, self.permission.parse()?);
        grant.is_deny = self.is_deny;
        grant.expires_at = self.expires_at;

        if let Some(mode) = self.inheritance_mode {
            grant.inheritance_mode = InheritanceMode::parse(&mode)
                .ok_or_else(|| ApiError::bad_request(format!("Invalid inheritance mode: {mode}")))?;
        }

        grant.child_permission_map = match self.child_permission_map {
            None | Some(serde_json::Value::Null) => None,
            Some(value) => Some(
                serde_json::from_value::<ChildPermissionMap>(value).map_err(|e| {
                    ApiError::bad_request(format!("Malformed child_permission_map: {e}"))
                })?,
            ),
        };

        Ok(grant)
    }
}

#[derive(Debug, Deserialize)]
pub struct RevokeRequest {
    pub subject_kind: String,
    pub subject_id: String,
    pub entity_type: String,
    pub entity_instance_id: String,
}

impl RevokeRequest {
    pub fn subject_and_target(self) -> Result<(Subject, Target), ApiError> {
        let subject = Subject {
            kind: parse_subject_kind(&self.subject_kind)?,
            id: self.subject_id,
        };
        let target = Target {
            entity_type: self.entity_type,
            instance: InstanceRef::from(self.entity_instance_id),
        };
        Ok((subject, target))
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ListGrantsParams {
    #[serde(default)]
    pub entity_type: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateRoleRequest {
    pub name: String,
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SetRoleActiveRequest {
    pub active: bool,
}

#[derive(Debug, Deserialize)]
pub struct LinkRequest {
    pub parent_type: String,
    pub parent_id: String,
    pub child_type: String,
    pub child_id: String,
    #[serde(default)]
    pub ownership_flag: Option<bool>,
}

impl LinkRequest {
    #[must_use]
    pub fn endpoints(&self) -> (EntityRef, EntityRef) {
        (
            EntityRef::new(&self.parent_type, &self.parent_id),
            EntityRef::new(&self.child_type, &self.child_id),
        )
    }
}

#[derive(Debug, Serialize)]
pub struct UnlinkEntityResponse {
    pub removed: usize,
}

#[derive(Debug, Default, Deserialize)]
pub struct PaginationParams {
    #[serde(default)]
    pub cursor: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(json: serde_json::Value) -> GrantRequest {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_grant_request_wire_shape() {
        let grant = request(serde_json::json!({
            "subject_kind": "role", "subject_id": "r-1",
            "entity_type": "project", "entity_instance_id": "ALL",
            "permission": 7, "is_deny": false,
            "inheritance_mode": "mapped",
            "child_permission_map": {"task": 3, "_default": 0},
            "expires_at": null
        }))
        .into_grant()
        .unwrap();

        assert_eq!(grant.subject(), Subject::role("r-1"));
        assert_eq!(grant.permission, Permission::OWNER);
        assert!(grant.entity_instance_id.is_wildcard());
        assert_eq!(grant.inherited_level("task"), Some(Permission::EDIT));
    }

    #[test]
    fn test_grant_request_rejects_bad_level() {
        let result = request(serde_json::json!({
            "subject_kind": "role", "subject_id": "r-1",
            "entity_type": "project", "entity_instance_id": "p-1",
            "permission": 8
        }))
        .into_grant();
        assert!(result.is_err());
    }

    #[test]
    fn test_grant_request_rejects_non_map() {
        let result = request(serde_json::json!({
            "subject_kind": "role", "subject_id": "r-1",
            "entity_type": "project", "entity_instance_id": "p-1",
            "permission": "edit", "inheritance_mode": "mapped",
            "child_permission_map": ["task"]
        }))
        .into_grant();
        assert!(result.is_err());
    }

    #[test]
    fn test_resolve_response_labels() {
        let r = ResolveResponse::from(Decision::Granted(Permission::SHARE));
        assert_eq!((r.decision, r.level), ("granted", 4));
        let r = ResolveResponse::from(Decision::Denied);
        assert_eq!((r.decision, r.level), ("denied", -1));
    }
}
