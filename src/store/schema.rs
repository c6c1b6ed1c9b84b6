pub const SCHEMA: &str = r#"
-- Roles group principals; grants are usually attached to roles
CREATE TABLE IF NOT EXISTS roles (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    active INTEGER NOT NULL DEFAULT 1,  -- inactive roles confer nothing
    created_at TEXT DEFAULT (datetime('now'))
);

-- Principals are owned by the identity system; only their ids appear here
CREATE TABLE IF NOT EXISTS role_members (
    role_id TEXT NOT NULL REFERENCES roles(id) ON DELETE CASCADE,
    principal_id TEXT NOT NULL,
    created_at TEXT DEFAULT (datetime('now')),
    PRIMARY KEY (role_id, principal_id)
);

-- One row per (subject, target); revoke is a hard delete
CREATE TABLE IF NOT EXISTS permission_grants (
    subject_kind TEXT NOT NULL CHECK (subject_kind IN ('principal', 'role')),
    subject_id TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    entity_instance_id TEXT NOT NULL,  -- 'ALL' = every instance of the type
    permission INTEGER NOT NULL CHECK (permission BETWEEN 0 AND 7),
    is_deny INTEGER NOT NULL DEFAULT 0,
    inheritance_mode TEXT NOT NULL DEFAULT 'none',
    child_permission_map TEXT,         -- JSON object, mapped mode only
    expires_at TEXT,                   -- NULL = never
    created_at TEXT DEFAULT (datetime('now')),
    updated_at TEXT DEFAULT (datetime('now')),
    PRIMARY KEY (subject_kind, subject_id, entity_type, entity_instance_id)
);

-- Directed parent -> child links between entity instances
CREATE TABLE IF NOT EXISTS relationship_links (
    parent_type TEXT NOT NULL,
    parent_id TEXT NOT NULL,
    child_type TEXT NOT NULL,
    child_id TEXT NOT NULL,
    ownership_flag INTEGER NOT NULL DEFAULT 1,  -- 0 = lookup, inheritance capped
    created_at TEXT DEFAULT (datetime('now')),
    PRIMARY KEY (parent_type, parent_id, child_type, child_id),
    CHECK (NOT (parent_type = child_type AND parent_id = child_id))
);

CREATE INDEX IF NOT EXISTS idx_role_members_principal ON role_members(principal_id);
CREATE INDEX IF NOT EXISTS idx_grants_subject_type ON permission_grants(subject_kind, subject_id, entity_type);
CREATE INDEX IF NOT EXISTS idx_grants_target ON permission_grants(entity_type, entity_instance_id);
CREATE INDEX IF NOT EXISTS idx_links_child ON relationship_links(child_type, child_id);
CREATE INDEX IF NOT EXISTS idx_links_parent_type ON relationship_links(parent_type);
"#;
