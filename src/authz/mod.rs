mod cache;
mod gate;
mod registry;
mod resolver;

pub use cache::{CacheStats, PermissionCache};
pub use gate::{AccessibleIds, Gate};
pub use registry::EntityRegistry;
pub use resolver::{Ancestor, Decision, Expiring, LOOKUP_CAP, Resolver};
