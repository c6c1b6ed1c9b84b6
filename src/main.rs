use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::bail;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use gatehouse::authz::Gate;
use gatehouse::cli::{
    GrantCommands, GrantTargetArgs, LinkArgs, RoleCommands, StoreArgs, load_engine_config,
    run_accessible, run_check, run_grant_add, run_grant_list, run_link, run_revoke,
    run_role_add_member, run_role_create, run_role_remove_member, run_unlink, run_unlink_entity,
};
use gatehouse::config::ServerConfig;
use gatehouse::server::{AppState, create_router};
use gatehouse::store::{SqliteStore, Store};

#[derive(Parser)]
#[command(name = "gatehouse")]
#[command(about = "Role-based permission resolution for hierarchical entities", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server
    Serve {
        /// Host to bind to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Port to bind to
        #[arg(long, short, default_value = "8080")]
        port: u16,

        /// Data directory for the database
        #[arg(long, default_value = "./data")]
        data_dir: String,

        /// Engine config file (TOML)
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Create the data directory and database
    Init {
        /// Data directory for the database
        #[arg(long, default_value = "./data")]
        data_dir: String,
    },

    /// Manage grants
    Grant {
        #[command(subcommand)]
        command: GrantCommands,
    },

    /// Delete a grant
    Revoke {
        #[command(flatten)]
        store: StoreArgs,

        #[command(flatten)]
        target: GrantTargetArgs,
    },

    /// Check whether a principal holds a permission on an instance
    Check {
        #[command(flatten)]
        store: StoreArgs,

        #[arg(long)]
        principal_id: String,

        #[arg(long)]
        entity_type: String,

        #[arg(long)]
        instance_id: String,

        /// Level name (view..owner) or number 0-7
        #[arg(long)]
        permission: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// List the instances of a type a principal can access
    Accessible {
        #[command(flatten)]
        store: StoreArgs,

        #[arg(long)]
        principal_id: String,

        #[arg(long)]
        entity_type: String,

        /// Level name (view..owner) or number 0-7
        #[arg(long)]
        permission: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Manage roles and their members
    Role {
        #[command(subcommand)]
        command: RoleCommands,
    },

    /// Link a child entity under a parent
    Link {
        #[command(flatten)]
        store: StoreArgs,

        #[command(flatten)]
        link: LinkArgs,

        /// Owned (true) or lookup (false); defaults to the declared relation
        #[arg(long)]
        ownership_flag: Option<bool>,
    },

    /// Remove a parent-child link
    Unlink {
        #[command(flatten)]
        store: StoreArgs,

        #[command(flatten)]
        link: LinkArgs,
    },

    /// Remove every link touching an entity, e.g. after deleting it
    UnlinkEntity {
        #[command(flatten)]
        store: StoreArgs,

        #[arg(long)]
        entity_type: String,

        #[arg(long)]
        instance_id: String,
    },
}

fn run_init(data_dir: String) -> anyhow::Result<()> {
    let config = ServerConfig {
        data_dir: data_dir.into(),
        ..ServerConfig::default()
    };
    fs::create_dir_all(&config.data_dir)?;

    let db_path = config.db_path();
    let existed = db_path.exists();

    let store = SqliteStore::new(&db_path)?;
    store.initialize()?;

    if existed {
        println!("Database already initialized at {}", db_path.display());
    } else {
        println!("Initialized database at {}", db_path.display());
    }

    Ok(())
}

async fn run_serve(config: ServerConfig) -> anyhow::Result<()> {
    let db_path = config.db_path();
    if !db_path.exists() {
        bail!("Database not found at {}. Run 'gatehouse init' first.", db_path.display());
    }

    let engine = load_engine_config(config.engine_config.as_deref())?;
    let store = SqliteStore::new(&db_path)?;
    store.initialize()?;

    info!(
        "Engine: {} entity types, max depth {}, cache ttl {}s",
        engine.entity_types.len(),
        engine.max_depth,
        engine.cache_ttl_secs
    );

    let gate = Arc::new(Gate::new(Arc::new(store), &engine));
    let app = create_router(Arc::new(AppState::new(gate)));
    let addr = config.socket_addr()?;

    info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("gatehouse=info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            host,
            port,
            data_dir,
            config,
        } => {
            run_serve(ServerConfig {
                host,
                port,
                data_dir: data_dir.into(),
                engine_config: config,
            })
            .await?;
        }
        Commands::Init { data_dir } => run_init(data_dir)?,
        Commands::Grant { command } => match command {
            GrantCommands::Add {
                store,
                target,
                permission,
                deny,
                mode,
                map,
                expires_at,
            } => run_grant_add(store, target, permission, deny, mode, map, expires_at)?,
            GrantCommands::List {
                store,
                subject_kind,
                subject_id,
                entity_type,
                json,
            } => run_grant_list(store, subject_kind, subject_id, entity_type, json)?,
        },
        Commands::Revoke { store, target } => run_revoke(store, target)?,
        Commands::Check {
            store,
            principal_id,
            entity_type,
            instance_id,
            permission,
            json,
        } => run_check(store, principal_id, entity_type, instance_id, permission, json)?,
        Commands::Accessible {
            store,
            principal_id,
            entity_type,
            permission,
            json,
        } => run_accessible(store, principal_id, entity_type, permission, json)?,
        Commands::Role { command } => match command {
            RoleCommands::Create { store, name, id } => run_role_create(store, name, id)?,
            RoleCommands::AddMember {
                store,
                role_id,
                principal_id,
            } => run_role_add_member(store, role_id, principal_id)?,
            RoleCommands::RemoveMember {
                store,
                role_id,
                principal_id,
            } => run_role_remove_member(store, role_id, principal_id)?,
        },
        Commands::Link {
            store,
            link,
            ownership_flag,
        } => run_link(store, link, ownership_flag)?,
        Commands::Unlink { store, link } => run_unlink(store, link)?,
        Commands::UnlinkEntity {
            store,
            entity_type,
            instance_id,
        } => run_unlink_entity(store, entity_type, instance_id)?,
    }

    Ok(())
}
