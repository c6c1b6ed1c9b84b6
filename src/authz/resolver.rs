//! Permission resolution over grants, role membership and the relationship graph.
//!
//! A principal's level on an instance is the maximum of:
//! - grants held by the principal or any of its active roles on the instance
//!   itself or on the whole type,
//! - levels inherited from grants on ancestors reached by walking parent links
//!   upward, bounded by the configured depth and stopping at root-level types.
//!
//! Any deny grant on the instance or its type, held by any of those subjects,
//! overrides everything. A lookup (non-owning) link on the way up caps what
//! flows through it at COMMENT.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::registry::EntityRegistry;
use crate::error::Result;
use crate::store::Store;
use crate::types::*;

/// Ceiling applied to levels inherited through a lookup link.
pub const LOOKUP_CAP: Permission = Permission::COMMENT;

/// Outcome of resolving a principal against one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", content = "level", rename_all = "snake_case")]
pub enum Decision {
    Denied,
    NoAccess,
    Granted(Permission),
}

impl Decision {
    pub fn from_level(level: Option<Permission>) -> Self {
        level.map_or(Decision::NoAccess, Decision::Granted)
    }

    #[must_use]
    pub fn allows(self, required: Permission) -> bool {
        match self {
            Decision::Granted(level) => level.satisfies(required),
            Decision::Denied | Decision::NoAccess => false,
        }
    }

    /// Integer form: the level, or -1 when nothing applies or access is denied.
    #[must_use]
    pub fn as_level(self) -> i8 {
        match self {
            Decision::Granted(level) => level.level() as i8,
            Decision::Denied | Decision::NoAccess => -1,
        }
    }

    #[must_use]
    pub fn is_denied(self) -> bool {
        matches!(self, Decision::Denied)
    }
}

/// An ancestor reached by the upward walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ancestor {
    pub entity: EntityRef,
    /// A lookup link lies somewhere between this ancestor and the target.
    ///
    /// The flag is carried upward: once a lookup link is crossed, every
    /// ancestor above it stays capped, not only the one directly over the link.
    pub capped: bool,
}

/// A resolved value together with the moment the earliest grant it was
/// derived from expires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expiring<T> {
    pub value: T,
    pub expires_at: Option<DateTime<Utc>>,
}

impl<T> Expiring<T> {
    pub fn never(value: T) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn from_grants<'g>(value: T, grants: impl IntoIterator<Item = &'g PermissionGrant>) -> Self {
        Self {
            value,
            expires_at: grants.into_iter().filter_map(|g| g.expires_at).min(),
        }
    }
}

pub struct Resolver<'a> {
    store: &'a dyn Store,
    registry: &'a EntityRegistry,
    max_depth: usize,
}

impl<'a> Resolver<'a> {
    pub fn new(store: &'a dyn Store, registry: &'a EntityRegistry, max_depth: usize) -> Self {
        Self {
            store,
            registry,
            max_depth,
        }
    }

    /// The principal itself followed by each of its active roles.
    pub fn subjects(&self, principal_id: &str, roles: Vec<String>) -> Vec<Subject> {
        std::iter::once(Subject::principal(principal_id))
            .chain(roles.into_iter().map(Subject::role))
            .collect()
    }

    pub fn roles_of(&self, principal_id: &str) -> Result<Vec<String>> {
        self.store.roles_of(principal_id)
    }

    /// Targets of `entity_type` on which `subject` holds a live deny grant.
    pub fn deny_targets(
        &self,
        subject: &Subject,
        entity_type: &str,
    ) -> Result<Expiring<HashSet<InstanceRef>>> {
        let denies: Vec<PermissionGrant> = self
            .store
            .list_grants_by_subject(subject, entity_type)?
            .into_iter()
            .filter(|g| g.is_deny)
            .collect();
        let targets: HashSet<InstanceRef> =
            denies.iter().map(|g| g.entity_instance_id.clone()).collect();
        Ok(Expiring::from_grants(targets, &denies))
    }

    /// Highest allow level `subject` holds on the whole of `entity_type`.
    pub fn type_level(
        &self,
        subject: &Subject,
        entity_type: &str,
    ) -> Result<Expiring<Option<Permission>>> {
        let allows: Vec<PermissionGrant> = self
            .store
            .list_grants_by_subject(subject, entity_type)?
            .into_iter()
            .filter(|g| !g.is_deny && g.entity_instance_id.is_wildcard())
            .collect();
        let level = allows.iter().map(|g| g.permission).max();
        Ok(Expiring::from_grants(level, &allows))
    }

    /// Walks parent links upward from `target`.
    ///
    /// Root-level types contribute their own grants but are not walked past,
    /// and a root-level target has no ancestors at all. When an ancestor is
    /// reachable both through a lookup link and without one, the uncapped path
    /// wins. Chains longer than the depth limit are truncated.
    pub fn ancestors(&self, target: &EntityRef) -> Result<Vec<Ancestor>> {
        if self.registry.is_root(&target.entity_type) {
            return Ok(Vec::new());
        }

        let mut seen: HashMap<EntityRef, bool> = HashMap::new();
        let mut order: Vec<EntityRef> = Vec::new();
        let mut frontier = vec![(target.clone(), false)];

        for depth in 1..=self.max_depth {
            let mut next = Vec::new();
            for (node, capped) in frontier {
                for edge in self.store.parents_of(&node)? {
                    if edge.parent == *target {
                        continue;
                    }
                    let capped = capped || !edge.ownership_flag;
                    match seen.get(&edge.parent) {
                        Some(&prev) if !prev || capped => continue,
                        Some(_) => {}
                        None => order.push(edge.parent.clone()),
                    }
                    seen.insert(edge.parent.clone(), capped);
                    if !self.registry.is_root(&edge.parent.entity_type) {
                        next.push((edge.parent, capped));
                    }
                }
            }

            if next.is_empty() {
                break;
            }
            if depth == self.max_depth {
                tracing::debug!(
                    "Ancestor walk from {target} truncated at depth {}",
                    self.max_depth
                );
            }
            frontier = next;
        }

        Ok(order
            .into_iter()
            .map(|entity| {
                let capped = seen.get(&entity).copied().unwrap_or(true);
                Ancestor { entity, capped }
            })
            .collect())
    }

    /// Level `subject` holds on `target` from direct, type-level and inherited grants.
    /// Deny grants are not considered here.
    pub fn subject_level(
        &self,
        subject: &Subject,
        target: &EntityRef,
        ancestors: &[Ancestor],
    ) -> Result<Expiring<Option<Permission>>> {
        let mut by_type: HashMap<&str, Vec<PermissionGrant>> = HashMap::new();
        let mut expires_at: Option<DateTime<Utc>> = None;
        let mut note_expiry = |grant: &PermissionGrant| {
            if let Some(at) = grant.expires_at {
                expires_at = Some(expires_at.map_or(at, |current| current.min(at)));
            }
        };

        let mut best = None;
        for grant in self
            .store
            .list_grants_by_subject(subject, &target.entity_type)?
            .iter()
            .filter(|g| !g.is_deny && g.entity_instance_id.covers(&target.instance_id))
        {
            note_expiry(grant);
            best = best.max(Some(grant.permission));
        }

        for ancestor in ancestors {
            let entity_type = ancestor.entity.entity_type.as_str();
            if !by_type.contains_key(entity_type) {
                let grants = self.store.list_grants_by_subject(subject, entity_type)?;
                by_type.insert(entity_type, grants);
            }
            let grants = by_type.get(entity_type).map(Vec::as_slice).unwrap_or(&[]);

            for grant in grants
                .iter()
                .filter(|g| g.entity_instance_id.covers(&ancestor.entity.instance_id))
            {
                let Some(mut level) = grant.inherited_level(&target.entity_type) else {
                    continue;
                };
                note_expiry(grant);
                if ancestor.capped {
                    level = level.capped_at(LOOKUP_CAP);
                }
                best = best.max(Some(level));
            }
        }

        Ok(Expiring {
            value: best,
            expires_at,
        })
    }

    /// Resolves without any caching.
    pub fn resolve(&self, principal_id: &str, target: &EntityRef) -> Result<Decision> {
        let subjects = self.subjects(principal_id, self.roles_of(principal_id)?);
        let instance = InstanceRef::Id(target.instance_id.clone());

        for subject in &subjects {
            let denied = self.deny_targets(subject, &target.entity_type)?.value;
            if denied.contains(&InstanceRef::All) || denied.contains(&instance) {
                tracing::debug!("{target} denied for {principal_id} by {subject}");
                return Ok(Decision::Denied);
            }
        }

        let ancestors = self.ancestors(target)?;
        let mut best = None;
        for subject in &subjects {
            best = best.max(self.subject_level(subject, target, &ancestors)?.value);
        }
        Ok(Decision::from_level(best))
    }

    /// Instances of `entity_type` below `origin` that could inherit from it.
    /// The walk does not descend into root-level types, mirroring where the
    /// upward walk stops.
    pub fn descendants_of_type(&self, origin: &EntityRef, entity_type: &str) -> Result<BTreeSet<String>> {
        let mut found = BTreeSet::new();
        let mut visited: HashSet<EntityRef> = HashSet::from([origin.clone()]);
        let mut queue = VecDeque::from([(origin.clone(), 0usize)]);

        while let Some((node, depth)) = queue.pop_front() {
            if depth >= self.max_depth {
                continue;
            }
            for edge in self.store.children_of(&node)? {
                if self.registry.is_root(&edge.child.entity_type) {
                    continue;
                }
                if !visited.insert(edge.child.clone()) {
                    continue;
                }
                if edge.child.entity_type == entity_type {
                    found.insert(edge.child.instance_id.clone());
                }
                queue.push_back((edge.child, depth + 1));
            }
        }

        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::store::SqliteStore;

    fn setup() -> (SqliteStore, EntityRegistry) {
        let store = SqliteStore::in_memory().unwrap();
        store.initialize().unwrap();
        (store, EntityRegistry::from_config(&EngineConfig::default()))
    }

    fn link(store: &SqliteStore, parent: (&str, &str), child: (&str, &str), owned: bool) {
        store
            .link(&RelationshipLink {
                parent_type: parent.0.into(),
                parent_id: parent.1.into(),
                child_type: child.0.into(),
                child_id: child.1.into(),
                ownership_flag: owned,
            })
            .unwrap();
    }

    #[test]
    fn test_decision_levels() {
        assert_eq!(Decision::NoAccess.as_level(), -1);
        assert_eq!(Decision::Denied.as_level(), -1);
        assert_eq!(Decision::Granted(Permission::EDIT).as_level(), 3);
        assert!(Decision::Granted(Permission::EDIT).allows(Permission::VIEW));
        assert!(!Decision::Granted(Permission::VIEW).allows(Permission::EDIT));
        assert!(!Decision::Denied.allows(Permission::VIEW));
    }

    #[test]
    fn test_ancestors_stop_at_root() {
        let (store, registry) = setup();
        link(&store, ("business", "b-1"), ("project", "p-1"), true);
        link(&store, ("project", "p-1"), ("task", "t-1"), true);
        link(&store, ("task", "t-1"), ("task", "t-2"), true);

        let resolver = Resolver::new(&store, &registry, 10);
        let chain = resolver.ancestors(&EntityRef::new("task", "t-2")).unwrap();
        let entities: Vec<_> = chain.iter().map(|a| a.entity.to_string()).collect();
        assert_eq!(entities, vec!["task/t-1", "project/p-1"]);

        // A root-level target has no ancestors.
        let chain = resolver.ancestors(&EntityRef::new("project", "p-1")).unwrap();
        assert!(chain.is_empty());
    }

    #[test]
    fn test_ancestors_carry_lookup_cap() {
        let (store, registry) = setup();
        link(&store, ("project", "p-1"), ("task", "t-1"), true);
        link(&store, ("task", "t-1"), ("task", "t-2"), false);

        let resolver = Resolver::new(&store, &registry, 10);
        let chain = resolver.ancestors(&EntityRef::new("task", "t-2")).unwrap();
        assert!(chain.iter().all(|a| a.capped));
    }

    #[test]
    fn test_uncapped_path_wins() {
        let (store, registry) = setup();
        link(&store, ("project", "p-1"), ("task", "t-1"), false);
        link(&store, ("project", "p-1"), ("task", "t-2"), true);
        link(&store, ("task", "t-2"), ("task", "t-1"), true);

        let resolver = Resolver::new(&store, &registry, 10);
        let chain = resolver.ancestors(&EntityRef::new("task", "t-1")).unwrap();
        let project = chain
            .iter()
            .find(|a| a.entity == EntityRef::new("project", "p-1"))
            .unwrap();
        assert!(!project.capped);
    }

    #[test]
    fn test_depth_limit_truncates() {
        let (store, registry) = setup();
        for i in 0..15 {
            link(
                &store,
                ("task", &format!("t-{}", i + 1)),
                ("task", &format!("t-{i}")),
                true,
            );
        }

        let resolver = Resolver::new(&store, &registry, 10);
        let chain = resolver.ancestors(&EntityRef::new("task", "t-0")).unwrap();
        assert_eq!(chain.len(), 10);
        assert_eq!(chain.last().unwrap().entity, EntityRef::new("task", "t-10"));
    }

    #[test]
    fn test_cycle_terminates() {
        let (store, registry) = setup();
        link(&store, ("task", "a"), ("task", "b"), true);
        link(&store, ("task", "b"), ("task", "c"), true);
        link(&store, ("task", "c"), ("task", "a"), true);

        let resolver = Resolver::new(&store, &registry, 10);
        let chain = resolver.ancestors(&EntityRef::new("task", "a")).unwrap();
        assert_eq!(chain.len(), 2);
    }

    #[test]
    fn test_mapped_grant_uses_target_type() {
        let (store, registry) = setup();
        link(&store, ("project", "p-1"), ("task", "t-1"), true);
        link(&store, ("project", "p-1"), ("artifact", "a-1"), true);
        let subject = Subject::role("r-1");
        store
            .put_grant(
                &PermissionGrant::new(&subject, &Target::instance("project", "p-1"), Permission::OWNER)
                    .mapped(
                        ChildPermissionMap::new()
                            .with("task", Permission::EDIT)
                            .with("_default", Permission::VIEW),
                    ),
            )
            .unwrap();

        let resolver = Resolver::new(&store, &registry, 10);
        let task = EntityRef::new("task", "t-1");
        let artifact = EntityRef::new("artifact", "a-1");
        let task_level = resolver
            .subject_level(&subject, &task, &resolver.ancestors(&task).unwrap())
            .unwrap()
            .value;
        let artifact_level = resolver
            .subject_level(&subject, &artifact, &resolver.ancestors(&artifact).unwrap())
            .unwrap()
            .value;
        assert_eq!(task_level, Some(Permission::EDIT));
        assert_eq!(artifact_level, Some(Permission::VIEW));
    }

    #[test]
    fn test_subject_level_reports_earliest_expiry() {
        let (store, registry) = setup();
        link(&store, ("project", "p-1"), ("task", "t-1"), true);
        let subject = Subject::principal("u-1");
        let soon = Utc::now() + chrono::Duration::minutes(5);
        let later = soon + chrono::Duration::hours(1);
        store
            .put_grant(
                &PermissionGrant::new(&subject, &Target::instance("project", "p-1"), Permission::EDIT)
                    .cascade()
                    .expiring(soon),
            )
            .unwrap();
        store
            .put_grant(
                &PermissionGrant::new(&subject, &Target::instance("task", "t-1"), Permission::VIEW)
                    .expiring(later),
            )
            .unwrap();

        let resolver = Resolver::new(&store, &registry, 10);
        let task = EntityRef::new("task", "t-1");
        let level = resolver
            .subject_level(&subject, &task, &resolver.ancestors(&task).unwrap())
            .unwrap();
        assert_eq!(level.value, Some(Permission::EDIT));
        assert_eq!(level.expires_at, Some(soon));

        let type_level = resolver.type_level(&subject, "task").unwrap();
        assert_eq!(type_level, Expiring::never(None));
    }

    #[test]
    fn test_descendants_skip_root_types() {
        let (store, registry) = setup();
        link(&store, ("business", "b-1"), ("project", "p-1"), true);
        link(&store, ("project", "p-1"), ("task", "t-1"), true);
        link(&store, ("task", "t-1"), ("task", "t-2"), true);

        let resolver = Resolver::new(&store, &registry, 10);
        let below_project = resolver
            .descendants_of_type(&EntityRef::new("project", "p-1"), "task")
            .unwrap();
        assert_eq!(below_project.into_iter().collect::<Vec<_>>(), vec!["t-1", "t-2"]);

        let below_business = resolver
            .descendants_of_type(&EntityRef::new("business", "b-1"), "task")
            .unwrap();
        assert!(below_business.is_empty());
    }
}
