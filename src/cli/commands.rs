use std::path::PathBuf;

use clap::{Args, Subcommand};

/// Location of the local database and the optional engine config.
#[derive(Args, Debug, Clone)]
pub struct StoreArgs {
    /// Data directory holding the database
    #[arg(long, default_value = "./data")]
    pub data_dir: PathBuf,

    /// Engine config file (TOML) with entity type declarations
    #[arg(long)]
    pub config: Option<PathBuf>,
}

/// A subject and target pair, shared by grant and revoke.
#[derive(Args, Debug, Clone)]
pub struct GrantTargetArgs {
    /// Subject kind: principal or role
    #[arg(long, default_value = "principal")]
    pub subject_kind: String,

    /// Principal or role id receiving the grant
    #[arg(long)]
    pub subject_id: String,

    /// Entity type code (e.g. project)
    #[arg(long)]
    pub entity_type: String,

    /// Instance id, or ALL for every instance of the type
    #[arg(long, default_value = "ALL")]
    pub instance_id: String,
}

#[derive(Subcommand)]
pub enum GrantCommands {
    /// Create or replace a grant
    Add {
        #[command(flatten)]
        store: StoreArgs,

        #[command(flatten)]
        target: GrantTargetArgs,

        /// Level name (view..owner) or number 0-7
        #[arg(long)]
        permission: String,

        /// Record an explicit deny instead of an allow
        #[arg(long)]
        deny: bool,

        /// Inheritance mode: none, cascade or mapped
        #[arg(long, default_value = "none")]
        mode: String,

        /// Child levels for mapped mode (e.g. "task=edit,_default=view")
        #[arg(long)]
        map: Option<String>,

        /// Expiry as an RFC 3339 timestamp
        #[arg(long)]
        expires_at: Option<String>,
    },

    /// List the grants held by a subject
    List {
        #[command(flatten)]
        store: StoreArgs,

        /// Subject kind: principal or role
        #[arg(long, default_value = "principal")]
        subject_kind: String,

        /// Principal or role id
        #[arg(long)]
        subject_id: String,

        /// Only list grants on this entity type
        #[arg(long)]
        entity_type: Option<String>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
pub enum RoleCommands {
    /// Create a role
    Create {
        #[command(flatten)]
        store: StoreArgs,

        /// Display name
        #[arg(long)]
        name: String,

        /// Explicit role id (random when omitted)
        #[arg(long)]
        id: Option<String>,
    },

    /// Add a principal to a role
    AddMember {
        #[command(flatten)]
        store: StoreArgs,

        #[arg(long)]
        role_id: String,

        #[arg(long)]
        principal_id: String,
    },

    /// Remove a principal from a role
    RemoveMember {
        #[command(flatten)]
        store: StoreArgs,

        #[arg(long)]
        role_id: String,

        #[arg(long)]
        principal_id: String,
    },
}

/// Both ends of a relationship link.
#[derive(Args, Debug, Clone)]
pub struct LinkArgs {
    #[arg(long)]
    pub parent_type: String,

    #[arg(long)]
    pub parent_id: String,

    #[arg(long)]
    pub child_type: String,

    #[arg(long)]
    pub child_id: String,
}
