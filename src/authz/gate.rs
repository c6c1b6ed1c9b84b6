use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use super::cache::PermissionCache;
use super::registry::EntityRegistry;
use super::resolver::{Ancestor, Decision, Resolver};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::store::Store;
use crate::types::*;

/// Result of a list-authorization query.
///
/// When `type_level` is true the caller has access to every instance of the
/// type and must not filter by `ids`; it still has to drop `denied_ids`.
/// Otherwise access is limited to exactly `ids`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AccessibleIds {
    pub type_level: bool,
    pub ids: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub denied_ids: Vec<String>,
}

/// Public entry point of the engine: authorization checks plus the
/// administrative mutations that keep the cache coherent.
pub struct Gate {
    store: Arc<dyn Store>,
    registry: EntityRegistry,
    cache: Arc<PermissionCache>,
    max_depth: usize,
    timeout: Duration,
}

impl Gate {
    pub fn new(store: Arc<dyn Store>, config: &EngineConfig) -> Self {
        let cache = Arc::new(PermissionCache::new(config.cache_ttl()));
        store.subscribe(cache.clone());

        Self {
            store,
            registry: EntityRegistry::from_config(config),
            cache,
            max_depth: config.max_depth,
            timeout: config.request_timeout(),
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    #[must_use]
    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    #[must_use]
    pub fn cache(&self) -> &PermissionCache {
        &self.cache
    }

    /// Default deadline for the `*_within` variants.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn resolver(&self) -> Resolver<'_> {
        Resolver::new(self.store.as_ref(), &self.registry, self.max_depth)
    }

    fn subjects(&self, resolver: &Resolver<'_>, principal_id: &str) -> Result<Vec<Subject>> {
        let roles = self
            .cache
            .roles(principal_id, || resolver.roles_of(principal_id))?;
        Ok(resolver.subjects(principal_id, roles))
    }

    /// Resolves the effective decision for a principal on one instance.
    pub fn resolve(&self, principal_id: &str, entity_type: &str, instance_id: &str) -> Result<Decision> {
        validate_identifier("principal id", principal_id)?;
        validate_identifier("entity type", entity_type)?;
        validate_instance_id(instance_id)?;

        let resolver = self.resolver();
        let target = EntityRef::new(entity_type, instance_id);
        let instance = InstanceRef::Id(instance_id.to_string());
        let subjects = self.subjects(&resolver, principal_id)?;

        // Every deny set is consulted before any allow is looked at.
        for subject in &subjects {
            let denied = self.cache.deny(subject, entity_type, || {
                resolver.deny_targets(subject, entity_type)
            })?;
            if denied.contains(&InstanceRef::All) || denied.contains(&instance) {
                tracing::debug!("{target} denied for {principal_id} by {subject}");
                return Ok(Decision::Denied);
            }
        }

        let mut ancestors: Option<Vec<Ancestor>> = None;
        let mut best = None;
        for subject in &subjects {
            let level = self.cache.instance_level(subject, &target, || {
                if ancestors.is_none() {
                    ancestors = Some(resolver.ancestors(&target)?);
                }
                let chain = ancestors.as_deref().unwrap_or(&[]);
                resolver.subject_level(subject, &target, chain)
            })?;
            best = best.max(level);
        }

        Ok(Decision::from_level(best))
    }

    /// True if the principal holds at least `required` on the instance.
    /// "No access" is a normal `false`; errors mean the store failed.
    pub fn check(
        &self,
        principal_id: &str,
        entity_type: &str,
        instance_id: &str,
        required: Permission,
    ) -> Result<bool> {
        Ok(self
            .resolve(principal_id, entity_type, instance_id)?
            .allows(required))
    }

    /// [`Gate::check`] on the blocking pool with a deadline; a timeout denies.
    pub async fn check_within(
        self: &Arc<Self>,
        principal_id: &str,
        entity_type: &str,
        instance_id: &str,
        required: Permission,
        timeout: Duration,
    ) -> Result<bool> {
        let gate = Arc::clone(self);
        let (principal_id, entity_type, instance_id) = (
            principal_id.to_string(),
            entity_type.to_string(),
            instance_id.to_string(),
        );
        let task = tokio::task::spawn_blocking(move || {
            gate.check(&principal_id, &entity_type, &instance_id, required)
        });

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                tracing::error!("Authorization check aborted: {e}");
                Ok(false)
            }
            Err(_) => {
                tracing::warn!("Authorization check timed out after {timeout:?}, denying");
                Ok(false)
            }
        }
    }

    /// Instances of `entity_type` the principal holds `required` on.
    pub fn accessible_ids(
        &self,
        principal_id: &str,
        entity_type: &str,
        required: Permission,
    ) -> Result<AccessibleIds> {
        validate_identifier("principal id", principal_id)?;
        validate_identifier("entity type", entity_type)?;

        let resolver = self.resolver();
        let subjects = self.subjects(&resolver, principal_id)?;

        let mut denied = BTreeSet::new();
        for subject in &subjects {
            let targets = self.cache.deny(subject, entity_type, || {
                resolver.deny_targets(subject, entity_type)
            })?;
            for target in targets.iter() {
                match target {
                    InstanceRef::All => return Ok(AccessibleIds::default()),
                    InstanceRef::Id(id) => {
                        denied.insert(id.clone());
                    }
                }
            }
        }

        let mut type_level = None;
        for subject in &subjects {
            let level = self.cache.type_level(subject, entity_type, || {
                resolver.type_level(subject, entity_type)
            })?;
            type_level = type_level.max(level);
        }
        if type_level.is_some_and(|level| level.satisfies(required)) {
            return Ok(AccessibleIds {
                type_level: true,
                ids: Vec::new(),
                denied_ids: denied.into_iter().collect(),
            });
        }

        let candidates = self.candidate_ids(&resolver, &subjects, entity_type)?;
        let mut ids = Vec::new();
        for id in candidates {
            if denied.contains(&id) {
                continue;
            }
            if self.check(principal_id, entity_type, &id, required)? {
                ids.push(id);
            }
        }

        Ok(AccessibleIds {
            type_level: false,
            ids,
            denied_ids: Vec::new(),
        })
    }

    /// [`Gate::accessible_ids`] with a deadline; a timeout yields no ids.
    pub async fn accessible_ids_within(
        self: &Arc<Self>,
        principal_id: &str,
        entity_type: &str,
        required: Permission,
        timeout: Duration,
    ) -> Result<AccessibleIds> {
        let gate = Arc::clone(self);
        let (principal_id, entity_type) = (principal_id.to_string(), entity_type.to_string());
        let task = tokio::task::spawn_blocking(move || {
            gate.accessible_ids(&principal_id, &entity_type, required)
        });

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                tracing::error!("Accessible-ids query aborted: {e}");
                Ok(AccessibleIds::default())
            }
            Err(_) => {
                tracing::warn!("Accessible-ids query timed out after {timeout:?}, returning none");
                Ok(AccessibleIds::default())
            }
        }
    }

    // Every instance that could possibly be reachable; each one is re-checked.
    fn candidate_ids(
        &self,
        resolver: &Resolver<'_>,
        subjects: &[Subject],
        entity_type: &str,
    ) -> Result<BTreeSet<String>> {
        let mut candidates = BTreeSet::new();

        for subject in subjects {
            for grant in self.store.list_all_grants_by_subject(subject)? {
                if grant.is_deny {
                    continue;
                }
                if grant.entity_type == entity_type
                    && let InstanceRef::Id(id) = &grant.entity_instance_id
                {
                    candidates.insert(id.clone());
                }
                if grant.inheritance_mode == InheritanceMode::None {
                    continue;
                }

                let origins = match &grant.entity_instance_id {
                    InstanceRef::Id(id) => vec![id.clone()],
                    InstanceRef::All => self.store.linked_instances(&grant.entity_type)?,
                };
                for origin in origins {
                    let origin = EntityRef::new(&grant.entity_type, origin);
                    candidates.extend(resolver.descendants_of_type(&origin, entity_type)?);
                }
            }
        }

        Ok(candidates)
    }

    /// Validates and upserts a grant. Deny grants are stored without
    /// inheritance settings.
    pub fn grant(&self, mut grant: PermissionGrant) -> Result<PermissionGrant> {
        validate_identifier("subject id", &grant.subject_id)?;
        self.validate_entity_type(&grant.entity_type)?;
        if let InstanceRef::Id(id) = &grant.entity_instance_id {
            validate_identifier("entity instance id", id)?;
            if grant.permission == Permission::CREATE && !grant.is_deny {
                return Err(Error::validation(
                    "CREATE can only be granted on a type-level target",
                ));
            }
        }

        if grant.is_deny {
            grant.inheritance_mode = InheritanceMode::None;
            grant.child_permission_map = None;
        } else {
            match (grant.inheritance_mode, &grant.child_permission_map) {
                (InheritanceMode::Mapped, Some(map)) if !map.is_empty() => {}
                (InheritanceMode::Mapped, _) => {
                    return Err(Error::validation(
                        "mapped inheritance requires a non-empty child_permission_map",
                    ));
                }
                (_, Some(_)) => {
                    return Err(Error::validation(
                        "child_permission_map is only allowed with mapped inheritance",
                    ));
                }
                (_, None) => {}
            }
        }

        grant.updated_at = Utc::now();
        self.store.put_grant(&grant)?;
        tracing::info!(
            "Granted {} {} on {} to {}",
            if grant.is_deny { "deny" } else { "allow" },
            grant.permission,
            grant.target(),
            grant.subject()
        );
        Ok(grant)
    }

    /// Hard-deletes the grant; returns false if there was none.
    pub fn revoke(&self, subject: &Subject, target: &Target) -> Result<bool> {
        validate_identifier("subject id", &subject.id)?;
        validate_identifier("entity type", &target.entity_type)?;

        let removed = self.store.delete_grant(subject, target)?;
        if removed {
            tracing::info!("Revoked grant on {target} from {subject}");
        }
        Ok(removed)
    }

    pub fn list_grants(
        &self,
        subject: &Subject,
        entity_type: Option<&str>,
    ) -> Result<Vec<PermissionGrant>> {
        match entity_type {
            Some(entity_type) => self.store.list_grants_by_subject(subject, entity_type),
            None => self.store.list_all_grants_by_subject(subject),
        }
    }

    /// Links `child` under `parent`. The ownership flag defaults to the
    /// declared relation between the two types.
    pub fn link(
        &self,
        parent: &EntityRef,
        child: &EntityRef,
        ownership_flag: Option<bool>,
    ) -> Result<RelationshipLink> {
        for entity in [parent, child] {
            self.validate_entity_type(&entity.entity_type)?;
            validate_instance_id(&entity.instance_id)?;
        }
        if parent == child {
            return Err(Error::validation("a link cannot point an entity at itself"));
        }

        let link = RelationshipLink {
            parent_type: parent.entity_type.clone(),
            parent_id: parent.instance_id.clone(),
            child_type: child.entity_type.clone(),
            child_id: child.instance_id.clone(),
            ownership_flag: ownership_flag.unwrap_or_else(|| {
                self.registry
                    .default_ownership(&parent.entity_type, &child.entity_type)
            }),
        };
        self.store.link(&link)?;
        tracing::debug!(
            "Linked {child} under {parent} ({})",
            if link.ownership_flag { "owned" } else { "lookup" }
        );
        Ok(link)
    }

    pub fn unlink(&self, parent: &EntityRef, child: &EntityRef) -> Result<bool> {
        self.store.unlink(parent, child)
    }

    /// Drops every link touching `entity`, as when it is destroyed.
    pub fn unlink_entity(&self, entity: &EntityRef) -> Result<usize> {
        validate_identifier("entity type", &entity.entity_type)?;
        validate_instance_id(&entity.instance_id)?;

        let removed = self.store.unlink_all(entity)?;
        tracing::info!("Removed {removed} links touching {entity}");
        Ok(removed)
    }

    pub fn add_member(&self, role_id: &str, principal_id: &str) -> Result<()> {
        validate_identifier("principal id", principal_id)?;
        self.store.add_member(role_id, principal_id)
    }

    pub fn remove_member(&self, role_id: &str, principal_id: &str) -> Result<bool> {
        self.store.remove_member(role_id, principal_id)
    }

    pub fn members(&self, role_id: &str) -> Result<Vec<String>> {
        if self.store.get_role(role_id)?.is_none() {
            return Err(Error::NotFound);
        }
        self.store.members_of(role_id)
    }

    /// Creates an active role. A random id is assigned when none is given.
    pub fn create_role(&self, name: &str, id: Option<&str>) -> Result<Role> {
        validate_identifier("role name", name)?;
        let role = Role {
            id: match id {
                Some(id) => {
                    validate_identifier("role id", id)?;
                    id.to_string()
                }
                None => Uuid::new_v4().to_string(),
            },
            name: name.trim().to_string(),
            active: true,
            created_at: Utc::now(),
        };
        self.store.create_role(&role)?;
        tracing::info!("Created role {} ({})", role.name, role.id);
        Ok(role)
    }

    pub fn set_role_active(&self, role_id: &str, active: bool) -> Result<Role> {
        self.store.set_role_active(role_id, active)?;
        self.store.get_role(role_id)?.ok_or(Error::NotFound)
    }

    /// Deletes the role together with its memberships and grants.
    pub fn delete_role(&self, role_id: &str) -> Result<bool> {
        let removed = self.store.delete_role(role_id)?;
        if removed {
            tracing::info!("Deleted role {role_id}");
        }
        Ok(removed)
    }

    fn validate_entity_type(&self, entity_type: &str) -> Result<()> {
        validate_identifier("entity type", entity_type)?;
        if self.registry.is_strict() && !self.registry.is_declared(entity_type) {
            return Err(Error::validation(format!(
                "unknown entity type: {entity_type}"
            )));
        }
        Ok(())
    }
}

fn validate_identifier(what: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::validation(format!("{what} cannot be empty")));
    }
    Ok(())
}

fn validate_instance_id(instance_id: &str) -> Result<()> {
    validate_identifier("instance id", instance_id)?;
    if instance_id == WILDCARD {
        return Err(Error::validation(format!(
            "instance id '{WILDCARD}' is reserved for type-level grants"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;

    fn gate() -> Arc<Gate> {
        let store = SqliteStore::in_memory().unwrap();
        store.initialize().unwrap();
        Arc::new(Gate::new(Arc::new(store), &EngineConfig::default()))
    }

    #[test]
    fn test_grant_rejects_mapped_without_map() {
        let gate = gate();
        let mut grant = PermissionGrant::new(
            &Subject::role("r-1"),
            &Target::all("project"),
            Permission::EDIT,
        );
        grant.inheritance_mode = InheritanceMode::Mapped;
        assert!(matches!(gate.grant(grant), Err(Error::Validation(_))));
    }

    #[test]
    fn test_grant_rejects_map_without_mapped_mode() {
        let gate = gate();
        let mut grant = PermissionGrant::new(
            &Subject::role("r-1"),
            &Target::all("project"),
            Permission::EDIT,
        );
        grant.child_permission_map = Some(ChildPermissionMap::new().with("task", Permission::VIEW));
        assert!(matches!(gate.grant(grant), Err(Error::Validation(_))));
    }

    #[test]
    fn test_create_only_at_type_level() {
        let gate = gate();
        let subject = Subject::role("r-1");
        let on_instance =
            PermissionGrant::new(&subject, &Target::instance("project", "p-1"), Permission::CREATE);
        assert!(matches!(gate.grant(on_instance), Err(Error::Validation(_))));

        let on_type = PermissionGrant::new(&subject, &Target::all("project"), Permission::CREATE);
        assert!(gate.grant(on_type).is_ok());
    }

    #[test]
    fn test_deny_grant_is_normalized() {
        let gate = gate();
        let grant = PermissionGrant::new(
            &Subject::role("r-1"),
            &Target::all("project"),
            Permission::VIEW,
        )
        .cascade()
        .deny();
        let stored = gate.grant(grant).unwrap();
        assert_eq!(stored.inheritance_mode, InheritanceMode::None);
    }

    #[test]
    fn test_wildcard_instance_id_rejected_in_check() {
        let gate = gate();
        let result = gate.check("u-1", "project", WILDCARD, Permission::VIEW);
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[test]
    fn test_self_link_rejected() {
        let gate = gate();
        let task = EntityRef::new("task", "t-1");
        assert!(matches!(
            gate.link(&task, &task, None),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_link_defaults_ownership_from_registry() {
        let gate = gate();
        let project = EntityRef::new("project", "p-1");
        let owned = gate.link(&project, &EntityRef::new("task", "t-1"), None).unwrap();
        let lookup = gate.link(&project, &EntityRef::new("person", "u-1"), None).unwrap();
        let explicit = gate
            .link(&project, &EntityRef::new("person", "u-2"), Some(true))
            .unwrap();
        assert!(owned.ownership_flag);
        assert!(!lookup.ownership_flag);
        assert!(explicit.ownership_flag);
    }

    #[test]
    fn test_strict_types() {
        let store = SqliteStore::in_memory().unwrap();
        store.initialize().unwrap();
        let config = EngineConfig {
            strict_types: true,
            ..EngineConfig::default()
        };
        let gate = Gate::new(Arc::new(store), &config);
        let result = gate.link(
            &EntityRef::new("project", "p-1"),
            &EntityRef::new("invoice", "i-1"),
            None,
        );
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[test]
    fn test_role_lifecycle() {
        let gate = gate();
        let role = gate.create_role("Reviewers", None).unwrap();
        assert!(role.active);
        assert!(matches!(
            gate.create_role("Reviewers", Some(&role.id)),
            Err(Error::AlreadyExists)
        ));

        gate.add_member(&role.id, "u-1").unwrap();
        assert_eq!(gate.members(&role.id).unwrap(), vec!["u-1".to_string()]);

        let role = gate.set_role_active(&role.id, false).unwrap();
        assert!(!role.active);

        assert!(gate.delete_role(&role.id).unwrap());
        assert!(matches!(gate.members(&role.id), Err(Error::NotFound)));
        assert!(matches!(
            gate.set_role_active(&role.id, true),
            Err(Error::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_check_within_allows() {
        let gate = gate();
        gate.grant(PermissionGrant::new(
            &Subject::principal("u-1"),
            &Target::instance("project", "p-1"),
            Permission::EDIT,
        ))
        .unwrap();

        let allowed = gate
            .check_within("u-1", "project", "p-1", Permission::EDIT, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(allowed);
    }

    /// Delegates to SQLite but stalls on role lookups.
    struct SlowStore {
        inner: SqliteStore,
        delay: Duration,
    }

    impl Store for SlowStore {
        fn initialize(&self) -> Result<()> {
            self.inner.initialize()
        }
        fn subscribe(&self, sink: Arc<dyn crate::store::InvalidationSink>) {
            self.inner.subscribe(sink)
        }
        fn put_grant(&self, grant: &PermissionGrant) -> Result<()> {
            self.inner.put_grant(grant)
        }
        fn delete_grant(&self, subject: &Subject, target: &Target) -> Result<bool> {
            self.inner.delete_grant(subject, target)
        }
        fn get_grant(&self, subject: &Subject, target: &Target) -> Result<Option<PermissionGrant>> {
            self.inner.get_grant(subject, target)
        }
        fn list_grants_by_subject(&self, s: &Subject, t: &str) -> Result<Vec<PermissionGrant>> {
            self.inner.list_grants_by_subject(s, t)
        }
        fn list_all_grants_by_subject(&self, s: &Subject) -> Result<Vec<PermissionGrant>> {
            self.inner.list_all_grants_by_subject(s)
        }
        fn create_role(&self, role: &Role) -> Result<()> {
            self.inner.create_role(role)
        }
        fn get_role(&self, id: &str) -> Result<Option<Role>> {
            self.inner.get_role(id)
        }
        fn list_roles(&self, cursor: &str, limit: i32) -> Result<Vec<Role>> {
            self.inner.list_roles(cursor, limit)
        }
        fn set_role_active(&self, id: &str, active: bool) -> Result<()> {
            self.inner.set_role_active(id, active)
        }
        fn delete_role(&self, id: &str) -> Result<bool> {
            self.inner.delete_role(id)
        }
        fn add_member(&self, role_id: &str, principal_id: &str) -> Result<()> {
            self.inner.add_member(role_id, principal_id)
        }
        fn remove_member(&self, role_id: &str, principal_id: &str) -> Result<bool> {
            self.inner.remove_member(role_id, principal_id)
        }
        fn roles_of(&self, principal_id: &str) -> Result<Vec<String>> {
            std::thread::sleep(self.delay);
            self.inner.roles_of(principal_id)
        }
        fn members_of(&self, role_id: &str) -> Result<Vec<String>> {
            self.inner.members_of(role_id)
        }
        fn link(&self, link: &RelationshipLink) -> Result<()> {
            self.inner.link(link)
        }
        fn unlink(&self, parent: &EntityRef, child: &EntityRef) -> Result<bool> {
            self.inner.unlink(parent, child)
        }
        fn unlink_all(&self, entity: &EntityRef) -> Result<usize> {
            self.inner.unlink_all(entity)
        }
        fn parents_of(&self, entity: &EntityRef) -> Result<Vec<ParentEdge>> {
            self.inner.parents_of(entity)
        }
        fn children_of(&self, entity: &EntityRef) -> Result<Vec<ChildEdge>> {
            self.inner.children_of(entity)
        }
        fn linked_instances(&self, entity_type: &str) -> Result<Vec<String>> {
            self.inner.linked_instances(entity_type)
        }
        fn close(&self) -> Result<()> {
            self.inner.close()
        }
    }

    #[tokio::test]
    async fn test_check_within_timeout_fails_closed() {
        let inner = SqliteStore::in_memory().unwrap();
        inner.initialize().unwrap();
        let store = SlowStore {
            inner,
            delay: Duration::from_millis(500),
        };
        let gate = Arc::new(Gate::new(Arc::new(store), &EngineConfig::default()));
        gate.grant(PermissionGrant::new(
            &Subject::principal("u-1"),
            &Target::all("project"),
            Permission::OWNER,
        ))
        .unwrap();

        let allowed = gate
            .check_within("u-1", "project", "p-1", Permission::VIEW, Duration::from_millis(20))
            .await
            .unwrap();
        assert!(!allowed);

        let listed = gate
            .accessible_ids_within("u-1", "project", Permission::VIEW, Duration::from_millis(20))
            .await
            .unwrap();
        assert!(!listed.type_level);
        assert!(listed.ids.is_empty());
    }
}
