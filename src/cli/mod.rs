mod access;
mod commands;
mod grant;
mod graph;
mod role;

pub use access::{run_accessible, run_check};
pub use commands::{GrantCommands, GrantTargetArgs, LinkArgs, RoleCommands, StoreArgs};
pub use grant::{run_grant_add, run_grant_list, run_revoke};
pub use graph::{run_link, run_unlink, run_unlink_entity};
pub use role::{run_role_add_member, run_role_create, run_role_remove_member};

use std::path::Path;
use std::sync::Arc;

use crate::authz::Gate;
use crate::config::{EngineConfig, ServerConfig};
use crate::store::{SqliteStore, Store};
use crate::types::SubjectKind;

/// Engine config from `path`, or the built-in registry when none is given.
pub fn load_engine_config(path: Option<&Path>) -> anyhow::Result<EngineConfig> {
    match path {
        Some(path) => Ok(EngineConfig::load(path)?),
        None => Ok(EngineConfig::default()),
    }
}

/// Initialize store from data directory, checking it exists
pub fn init_store(data_dir: &Path) -> anyhow::Result<SqliteStore> {
    let config = ServerConfig {
        data_dir: data_dir.to_path_buf(),
        ..ServerConfig::default()
    };
    let db_path = config.db_path();

    if !db_path.exists() {
        anyhow::bail!(
            "Database not found at {}. Run 'gatehouse init' first.",
            db_path.display()
        );
    }

    let store = SqliteStore::new(&db_path)?;
    store.initialize()?;
    Ok(store)
}

/// Opens the local database behind a gate so CLI writes go through the
/// same validation as the HTTP API.
pub fn open_gate(args: &StoreArgs) -> anyhow::Result<Arc<Gate>> {
    let config = load_engine_config(args.config.as_deref())?;
    let store = init_store(&args.data_dir)?;
    Ok(Arc::new(Gate::new(Arc::new(store), &config)))
}

pub(crate) fn parse_subject_kind(kind: &str) -> anyhow::Result<SubjectKind> {
    SubjectKind::parse(kind)
        .ok_or_else(|| anyhow::anyhow!("Invalid subject kind: {kind} (expected principal or role)"))
}
