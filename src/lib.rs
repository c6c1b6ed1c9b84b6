//! # Gatehouse
//!
//! Role-based permission resolution over a hierarchy of business entities,
//! usable both as a standalone server and as a library.
//!
//! A principal's effective level on an instance is the maximum of its own
//! grants and those of its active roles, after explicit denies, looking at
//! the instance itself, its type-level wildcard grants, and grants inherited
//! down from ancestors in the relationship graph.
//!
//! ## Library Usage
//!
//! ```toml
//! [dependencies]
//! gatehouse = { version = "0.0.1", default-features = false }
//! ```
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use gatehouse::authz::Gate;
//! use gatehouse::config::EngineConfig;
//! use gatehouse::store::{SqliteStore, Store};
//! use gatehouse::types::Permission;
//!
//! let store = SqliteStore::new("./data/gatehouse.db").unwrap();
//! store.initialize().unwrap();
//!
//! let gate = Gate::new(Arc::new(store), &EngineConfig::default());
//! let allowed = gate.check("user-1", "task", "task-9", Permission::EDIT).unwrap();
//! ```
//!
//! ## Feature Flags
//!
//! - `cli` (default): Includes CLI module. Disable with `default-features = false`.

pub mod authz;
#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod error;
pub mod server;
pub mod store;
pub mod types;
