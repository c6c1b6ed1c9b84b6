mod schema;
mod sqlite;

use std::sync::Arc;

pub use sqlite::SqliteStore;

use crate::error::Result;
use crate::types::*;

/// Change notification published by a store after a mutation has been applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invalidation {
    /// Grants held by this subject changed.
    Subject(Subject),
    /// The role set of this principal changed.
    Membership(String),
    /// A relationship link was added or removed.
    Graph,
}

/// Receiver of store invalidation events, typically the permission cache.
pub trait InvalidationSink: Send + Sync {
    fn invalidate(&self, event: &Invalidation);
}

/// Store defines the persistence interface used by the authorization engine.
pub trait Store: Send + Sync {
    fn initialize(&self) -> Result<()>;

    /// Registers a sink notified after every committed mutation.
    fn subscribe(&self, sink: Arc<dyn InvalidationSink>);

    // Grant operations
    fn put_grant(&self, grant: &PermissionGrant) -> Result<()>;
    fn delete_grant(&self, subject: &Subject, target: &Target) -> Result<bool>;
    fn get_grant(&self, subject: &Subject, target: &Target) -> Result<Option<PermissionGrant>>;
    /// Non-expired grants of `subject` on `entity_type`, wildcard and instance scope.
    fn list_grants_by_subject(
        &self,
        subject: &Subject,
        entity_type: &str,
    ) -> Result<Vec<PermissionGrant>>;
    /// Non-expired grants of `subject` on every entity type.
    fn list_all_grants_by_subject(&self, subject: &Subject) -> Result<Vec<PermissionGrant>>;

    // Role operations
    fn create_role(&self, role: &Role) -> Result<()>;
    fn get_role(&self, id: &str) -> Result<Option<Role>>;
    fn list_roles(&self, cursor: &str, limit: i32) -> Result<Vec<Role>>;
    fn set_role_active(&self, id: &str, active: bool) -> Result<()>;
    fn delete_role(&self, id: &str) -> Result<bool>;

    // Role membership operations
    fn add_member(&self, role_id: &str, principal_id: &str) -> Result<()>;
    fn remove_member(&self, role_id: &str, principal_id: &str) -> Result<bool>;
    /// Ids of the active roles `principal_id` belongs to.
    fn roles_of(&self, principal_id: &str) -> Result<Vec<String>>;
    fn members_of(&self, role_id: &str) -> Result<Vec<String>>;

    // Relationship graph operations
    fn link(&self, link: &RelationshipLink) -> Result<()>;
    fn unlink(&self, parent: &EntityRef, child: &EntityRef) -> Result<bool>;
    /// Removes every link touching `entity`, for when the instance is destroyed.
    fn unlink_all(&self, entity: &EntityRef) -> Result<usize>;
    fn parents_of(&self, entity: &EntityRef) -> Result<Vec<ParentEdge>>;
    fn children_of(&self, entity: &EntityRef) -> Result<Vec<ChildEdge>>;
    /// Instance ids of `entity_type` that appear on either side of a link.
    fn linked_instances(&self, entity_type: &str) -> Result<Vec<String>>;

    fn close(&self) -> Result<()>;
}
