use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Permission;

/// Reserved instance id meaning "every instance of the entity type".
pub const WILDCARD: &str = "ALL";

/// Reserved key of a child permission map used when no entry names the child type.
pub const DEFAULT_CHILD_KEY: &str = "_default";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubjectKind {
    Principal,
    Role,
}

impl SubjectKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            SubjectKind::Principal => "principal",
            SubjectKind::Role => "role",
        }
    }

    pub fn parse(s: &str) -> Option<SubjectKind> {
        match s {
            "principal" => Some(SubjectKind::Principal),
            "role" => Some(SubjectKind::Role),
            _ => None,
        }
    }
}

impl fmt::Display for SubjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The holder of a grant: a principal directly, or a role.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subject {
    pub kind: SubjectKind,
    pub id: String,
}

impl Subject {
    pub fn principal(id: impl Into<String>) -> Self {
        Self {
            kind: SubjectKind::Principal,
            id: id.into(),
        }
    }

    pub fn role(id: impl Into<String>) -> Self {
        Self {
            kind: SubjectKind::Role,
            id: id.into(),
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Instance part of a grant target: one instance or the whole type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum InstanceRef {
    All,
    Id(String),
}

impl InstanceRef {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            InstanceRef::All => WILDCARD,
            InstanceRef::Id(id) => id,
        }
    }

    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        matches!(self, InstanceRef::All)
    }

    /// True if this target covers the given concrete instance.
    #[must_use]
    pub fn covers(&self, instance_id: &str) -> bool {
        match self {
            InstanceRef::All => true,
            InstanceRef::Id(id) => id == instance_id,
        }
    }
}

impl From<String> for InstanceRef {
    fn from(s: String) -> Self {
        if s == WILDCARD {
            InstanceRef::All
        } else {
            InstanceRef::Id(s)
        }
    }
}

impl From<&str> for InstanceRef {
    fn from(s: &str) -> Self {
        InstanceRef::from(s.to_string())
    }
}

impl From<InstanceRef> for String {
    fn from(r: InstanceRef) -> Self {
        match r {
            InstanceRef::All => WILDCARD.to_string(),
            InstanceRef::Id(id) => id,
        }
    }
}

impl fmt::Display for InstanceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A concrete entity instance, e.g. `task/t-17`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityRef {
    pub entity_type: String,
    pub instance_id: String,
}

impl EntityRef {
    pub fn new(entity_type: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            instance_id: instance_id.into(),
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity_type, self.instance_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InheritanceMode {
    #[default]
    None,
    Cascade,
    Mapped,
}

impl InheritanceMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            InheritanceMode::None => "none",
            InheritanceMode::Cascade => "cascade",
            InheritanceMode::Mapped => "mapped",
        }
    }

    pub fn parse(s: &str) -> Option<InheritanceMode> {
        match s {
            "none" => Some(InheritanceMode::None),
            "cascade" => Some(InheritanceMode::Cascade),
            "mapped" => Some(InheritanceMode::Mapped),
            _ => None,
        }
    }
}

/// Per-child-type levels for a mapped grant, with an optional `_default` entry.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChildPermissionMap(BTreeMap<String, Permission>);

impl ChildPermissionMap {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, child_type: impl Into<String>, level: Permission) -> Self {
        self.0.insert(child_type.into(), level);
        self
    }

    /// Level inherited by `child_type`, falling back to the `_default` entry.
    #[must_use]
    pub fn level_for(&self, child_type: &str) -> Option<Permission> {
        self.0
            .get(child_type)
            .or_else(|| self.0.get(DEFAULT_CHILD_KEY))
            .copied()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Permission)> {
        self.0.iter()
    }
}

impl FromIterator<(String, Permission)> for ChildPermissionMap {
    fn from_iter<I: IntoIterator<Item = (String, Permission)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// A stored grant, serialized in the flat wire shape used for transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionGrant {
    pub subject_kind: SubjectKind,
    pub subject_id: String,
    pub entity_type: String,
    pub entity_instance_id: InstanceRef,
    pub permission: Permission,
    #[serde(default)]
    pub is_deny: bool,
    #[serde(default)]
    pub inheritance_mode: InheritanceMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_permission_map: Option<ChildPermissionMap>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl PermissionGrant {
    pub fn new(subject: &Subject, target: &Target, permission: Permission) -> Self {
        let now = Utc::now();
        Self {
            subject_kind: subject.kind,
            subject_id: subject.id.clone(),
            entity_type: target.entity_type.clone(),
            entity_instance_id: target.instance.clone(),
            permission,
            is_deny: false,
            inheritance_mode: InheritanceMode::None,
            child_permission_map: None,
            expires_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn deny(mut self) -> Self {
        self.is_deny = true;
        self
    }

    #[must_use]
    pub fn cascade(mut self) -> Self {
        self.inheritance_mode = InheritanceMode::Cascade;
        self
    }

    #[must_use]
    pub fn mapped(mut self, map: ChildPermissionMap) -> Self {
        self.inheritance_mode = InheritanceMode::Mapped;
        self.child_permission_map = Some(map);
        self
    }

    #[must_use]
    pub fn expiring(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    #[must_use]
    pub fn subject(&self) -> Subject {
        Subject {
            kind: self.subject_kind,
            id: self.subject_id.clone(),
        }
    }

    #[must_use]
    pub fn target(&self) -> Target {
        Target {
            entity_type: self.entity_type.clone(),
            instance: self.entity_instance_id.clone(),
        }
    }

    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Level this grant passes down to a descendant of type `child_type`.
    /// Deny grants never pass anything down.
    #[must_use]
    pub fn inherited_level(&self, child_type: &str) -> Option<Permission> {
        if self.is_deny {
            return None;
        }
        match self.inheritance_mode {
            InheritanceMode::None => None,
            InheritanceMode::Cascade => Some(self.permission),
            InheritanceMode::Mapped => self
                .child_permission_map
                .as_ref()
                .and_then(|map| map.level_for(child_type)),
        }
    }
}

/// Target of a grant: an entity type plus an instance or the wildcard.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    pub entity_type: String,
    pub instance: InstanceRef,
}

impl Target {
    pub fn instance(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            instance: InstanceRef::Id(id.into()),
        }
    }

    pub fn all(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            instance: InstanceRef::All,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity_type, self.instance)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Role {
    pub id: String,
    pub name: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipLink {
    pub parent_type: String,
    pub parent_id: String,
    pub child_type: String,
    pub child_id: String,
    pub ownership_flag: bool,
}

impl RelationshipLink {
    #[must_use]
    pub fn parent(&self) -> EntityRef {
        EntityRef::new(&self.parent_type, &self.parent_id)
    }

    #[must_use]
    pub fn child(&self) -> EntityRef {
        EntityRef::new(&self.child_type, &self.child_id)
    }
}

/// One edge seen from the child side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentEdge {
    pub parent: EntityRef,
    pub ownership_flag: bool,
}

/// One edge seen from the parent side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildEdge {
    pub child: EntityRef,
    pub ownership_flag: bool,
}

/// Declared child relation of an entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "ChildRelationRepr")]
pub struct ChildRelation {
    pub entity_type: String,
    pub ownership_flag: bool,
}

// Older configuration lists children as bare type codes; those are owned relations.
#[derive(Deserialize)]
#[serde(untagged)]
enum ChildRelationRepr {
    Legacy(String),
    Full {
        entity_type: String,
        #[serde(default = "owned_by_default")]
        ownership_flag: bool,
    },
}

fn owned_by_default() -> bool {
    true
}

impl From<ChildRelationRepr> for ChildRelation {
    fn from(repr: ChildRelationRepr) -> Self {
        match repr {
            ChildRelationRepr::Legacy(entity_type) => ChildRelation {
                entity_type,
                ownership_flag: true,
            },
            ChildRelationRepr::Full {
                entity_type,
                ownership_flag,
            } => ChildRelation {
                entity_type,
                ownership_flag,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityType {
    pub code: String,
    #[serde(default, alias = "root_level_flag")]
    pub root_level: bool,
    #[serde(default)]
    pub children: Vec<ChildRelation>,
}

impl EntityType {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            root_level: false,
            children: Vec::new(),
        }
    }

    #[must_use]
    pub fn root(mut self) -> Self {
        self.root_level = true;
        self
    }

    #[must_use]
    pub fn owns(mut self, child_type: impl Into<String>) -> Self {
        self.children.push(ChildRelation {
            entity_type: child_type.into(),
            ownership_flag: true,
        });
        self
    }

    #[must_use]
    pub fn references(mut self, child_type: impl Into<String>) -> Self {
        self.children.push(ChildRelation {
            entity_type: child_type.into(),
            ownership_flag: false,
        });
        self
    }
}
