use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};

use super::schema::SCHEMA;
use super::{Invalidation, InvalidationSink, Store};
use crate::error::{Error, Result};
use crate::types::*;

pub struct SqliteStore {
    conn: Mutex<Connection>,
    sinks: RwLock<Vec<Arc<dyn InvalidationSink>>>,
}

impl SqliteStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path)?;

        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "journal_mode", "WAL")?;

        Ok(Self::from_connection(conn))
    }

    /// Opens a private in-memory database, mostly for tests and embedding.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
            sinks: RwLock::new(Vec::new()),
        }
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    // Callers must have released the connection guard; the write is already committed.
    fn publish(&self, event: Invalidation) {
        let sinks = self.sinks.read().unwrap_or_else(|e| e.into_inner());
        tracing::debug!(?event, "publishing invalidation");
        for sink in sinks.iter() {
            sink.invalidate(&event);
        }
    }

    fn role_exists(&self, id: &str) -> Result<bool> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM roles WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            // Handle SQLite's default datetime format: "YYYY-MM-DD HH:MM:SS"
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .unwrap_or_else(|e| {
            tracing::error!("Invalid datetime in database: '{}' - {}", s, e);
            Utc::now()
        })
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

const GRANT_COLUMNS: &str = "subject_kind, subject_id, entity_type, entity_instance_id, permission,
     is_deny, inheritance_mode, child_permission_map, expires_at, created_at, updated_at";

fn grant_from_row(row: &Row<'_>) -> rusqlite::Result<PermissionGrant> {
    let kind: String = row.get(0)?;
    let subject_kind = SubjectKind::parse(&kind).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("unknown subject kind: {kind}").into(),
        )
    })?;
    let level: i64 = row.get(4)?;
    let permission =
        Permission::try_from(level).map_err(|v| rusqlite::Error::IntegralValueOutOfRange(4, v))?;
    let is_deny: bool = row.get(5)?;
    let mode: String = row.get(6)?;
    let raw_map: Option<String> = row.get(7)?;
    let entity_type: String = row.get(2)?;

    // Anything but a well-formed mapped grant is read back as non-inheriting.
    let (inheritance_mode, child_permission_map) = if is_deny {
        (InheritanceMode::None, None)
    } else {
        match InheritanceMode::parse(&mode) {
            Some(InheritanceMode::Mapped) => {
                match raw_map
                    .as_deref()
                    .map(serde_json::from_str::<ChildPermissionMap>)
                {
                    Some(Ok(map)) if !map.is_empty() => (InheritanceMode::Mapped, Some(map)),
                    _ => {
                        tracing::warn!(
                            "Malformed child_permission_map on {kind} grant for {entity_type}, \
                             treating as non-inheriting"
                        );
                        (InheritanceMode::None, None)
                    }
                }
            }
            Some(mode) => (mode, None),
            None => {
                tracing::warn!("Unknown inheritance mode '{mode}', treating as none");
                (InheritanceMode::None, None)
            }
        }
    };

    Ok(PermissionGrant {
        subject_kind,
        subject_id: row.get(1)?,
        entity_type,
        entity_instance_id: InstanceRef::from(row.get::<_, String>(3)?),
        permission,
        is_deny,
        inheritance_mode,
        child_permission_map,
        expires_at: row
            .get::<_, Option<String>>(8)?
            .map(|s| parse_datetime(&s)),
        created_at: parse_datetime(&row.get::<_, String>(9)?),
        updated_at: parse_datetime(&row.get::<_, String>(10)?),
    })
}

fn role_from_row(row: &Row<'_>) -> rusqlite::Result<Role> {
    Ok(Role {
        id: row.get(0)?,
        name: row.get(1)?,
        active: row.get(2)?,
        created_at: parse_datetime(&row.get::<_, String>(3)?),
    })
}

impl Store for SqliteStore {
    fn initialize(&self) -> Result<()> {
        self.conn().execute_batch(SCHEMA)?;
        Ok(())
    }

    fn subscribe(&self, sink: Arc<dyn InvalidationSink>) {
        self.sinks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(sink);
    }

    // Grant operations

    fn put_grant(&self, grant: &PermissionGrant) -> Result<()> {
        let map_json = match (&grant.inheritance_mode, &grant.child_permission_map) {
            (InheritanceMode::Mapped, Some(map)) if !grant.is_deny => {
                Some(serde_json::to_string(map)?)
            }
            _ => None,
        };
        let mode = if grant.is_deny {
            InheritanceMode::None
        } else {
            grant.inheritance_mode
        };

        self.conn().execute(
            "INSERT INTO permission_grants (subject_kind, subject_id, entity_type, entity_instance_id,
                permission, is_deny, inheritance_mode, child_permission_map, expires_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT (subject_kind, subject_id, entity_type, entity_instance_id) DO UPDATE SET
                permission = excluded.permission,
                is_deny = excluded.is_deny,
                inheritance_mode = excluded.inheritance_mode,
                child_permission_map = excluded.child_permission_map,
                expires_at = excluded.expires_at,
                updated_at = excluded.updated_at",
            params![
                grant.subject_kind.as_str(),
                grant.subject_id,
                grant.entity_type,
                grant.entity_instance_id.as_str(),
                i64::from(grant.permission),
                grant.is_deny,
                mode.as_str(),
                map_json,
                grant.expires_at.as_ref().map(format_datetime),
                format_datetime(&grant.created_at),
                format_datetime(&grant.updated_at),
            ],
        )?;

        self.publish(Invalidation::Subject(grant.subject()));
        Ok(())
    }

    fn delete_grant(&self, subject: &Subject, target: &Target) -> Result<bool> {
        let rows = self.conn().execute(
            "DELETE FROM permission_grants
             WHERE subject_kind = ?1 AND subject_id = ?2 AND entity_type = ?3 AND entity_instance_id = ?4",
            params![
                subject.kind.as_str(),
                subject.id,
                target.entity_type,
                target.instance.as_str()
            ],
        )?;

        if rows > 0 {
            self.publish(Invalidation::Subject(subject.clone()));
        }
        Ok(rows > 0)
    }

    fn get_grant(&self, subject: &Subject, target: &Target) -> Result<Option<PermissionGrant>> {
        let conn = self.conn();
        conn.query_row(
            &format!(
                "SELECT {GRANT_COLUMNS} FROM permission_grants
                 WHERE subject_kind = ?1 AND subject_id = ?2 AND entity_type = ?3 AND entity_instance_id = ?4"
            ),
            params![
                subject.kind.as_str(),
                subject.id,
                target.entity_type,
                target.instance.as_str()
            ],
            grant_from_row,
        )
        .optional()
        .map_err(Error::from)
    }

    fn list_grants_by_subject(
        &self,
        subject: &Subject,
        entity_type: &str,
    ) -> Result<Vec<PermissionGrant>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {GRANT_COLUMNS} FROM permission_grants
             WHERE subject_kind = ?1 AND subject_id = ?2 AND entity_type = ?3
             ORDER BY entity_instance_id"
        ))?;

        let rows = stmt.query_map(
            params![subject.kind.as_str(), subject.id, entity_type],
            grant_from_row,
        )?;

        let now = Utc::now();
        let grants = rows.collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(grants.into_iter().filter(|g| !g.is_expired_at(now)).collect())
    }

    fn list_all_grants_by_subject(&self, subject: &Subject) -> Result<Vec<PermissionGrant>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {GRANT_COLUMNS} FROM permission_grants
             WHERE subject_kind = ?1 AND subject_id = ?2
             ORDER BY entity_type, entity_instance_id"
        ))?;

        let rows = stmt.query_map(params![subject.kind.as_str(), subject.id], grant_from_row)?;

        let now = Utc::now();
        let grants = rows.collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(grants.into_iter().filter(|g| !g.is_expired_at(now)).collect())
    }

    // Role operations

    fn create_role(&self, role: &Role) -> Result<()> {
        let result = self.conn().execute(
            "INSERT INTO roles (id, name, active, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                role.id,
                role.name,
                role.active,
                format_datetime(&role.created_at)
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(Error::AlreadyExists)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn get_role(&self, id: &str) -> Result<Option<Role>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT id, name, active, created_at FROM roles WHERE id = ?1",
            params![id],
            role_from_row,
        )
        .optional()
        .map_err(Error::from)
    }

    fn list_roles(&self, cursor: &str, limit: i32) -> Result<Vec<Role>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, name, active, created_at FROM roles WHERE id > ?1 ORDER BY id LIMIT ?2",
        )?;

        let rows = stmt.query_map(params![cursor, limit], role_from_row)?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn set_role_active(&self, id: &str, active: bool) -> Result<()> {
        let rows = self.conn().execute(
            "UPDATE roles SET active = ?1 WHERE id = ?2",
            params![active, id],
        )?;

        if rows == 0 {
            return Err(Error::NotFound);
        }

        for principal_id in self.members_of(id)? {
            self.publish(Invalidation::Membership(principal_id));
        }
        Ok(())
    }

    fn delete_role(&self, id: &str) -> Result<bool> {
        let members = self.members_of(id)?;

        let rows = {
            let mut conn = self.conn();
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM permission_grants WHERE subject_kind = 'role' AND subject_id = ?1",
                params![id],
            )?;
            let rows = tx.execute("DELETE FROM roles WHERE id = ?1", params![id])?;
            tx.commit()?;
            rows
        };

        if rows > 0 {
            self.publish(Invalidation::Subject(Subject::role(id)));
            for principal_id in members {
                self.publish(Invalidation::Membership(principal_id));
            }
        }
        Ok(rows > 0)
    }

    // Role membership operations

    fn add_member(&self, role_id: &str, principal_id: &str) -> Result<()> {
        if !self.role_exists(role_id)? {
            return Err(Error::NotFound);
        }

        self.conn().execute(
            "INSERT OR IGNORE INTO role_members (role_id, principal_id, created_at) VALUES (?1, ?2, ?3)",
            params![role_id, principal_id, format_datetime(&Utc::now())],
        )?;

        self.publish(Invalidation::Membership(principal_id.to_string()));
        Ok(())
    }

    fn remove_member(&self, role_id: &str, principal_id: &str) -> Result<bool> {
        let rows = self.conn().execute(
            "DELETE FROM role_members WHERE role_id = ?1 AND principal_id = ?2",
            params![role_id, principal_id],
        )?;

        if rows > 0 {
            self.publish(Invalidation::Membership(principal_id.to_string()));
        }
        Ok(rows > 0)
    }

    fn roles_of(&self, principal_id: &str) -> Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT m.role_id FROM role_members m
             JOIN roles r ON r.id = m.role_id
             WHERE m.principal_id = ?1 AND r.active = 1
             ORDER BY m.role_id",
        )?;

        let rows = stmt.query_map(params![principal_id], |row| row.get(0))?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn members_of(&self, role_id: &str) -> Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT principal_id FROM role_members WHERE role_id = ?1 ORDER BY principal_id",
        )?;

        let rows = stmt.query_map(params![role_id], |row| row.get(0))?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    // Relationship graph operations

    fn link(&self, link: &RelationshipLink) -> Result<()> {
        if link.parent() == link.child() {
            return Err(Error::validation("a link cannot point an entity at itself"));
        }

        self.conn().execute(
            "INSERT INTO relationship_links (parent_type, parent_id, child_type, child_id, ownership_flag, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (parent_type, parent_id, child_type, child_id) DO UPDATE SET
                ownership_flag = excluded.ownership_flag",
            params![
                link.parent_type,
                link.parent_id,
                link.child_type,
                link.child_id,
                link.ownership_flag,
                format_datetime(&Utc::now()),
            ],
        )?;

        self.publish(Invalidation::Graph);
        Ok(())
    }

    fn unlink(&self, parent: &EntityRef, child: &EntityRef) -> Result<bool> {
        let rows = self.conn().execute(
            "DELETE FROM relationship_links
             WHERE parent_type = ?1 AND parent_id = ?2 AND child_type = ?3 AND child_id = ?4",
            params![
                parent.entity_type,
                parent.instance_id,
                child.entity_type,
                child.instance_id
            ],
        )?;

        if rows > 0 {
            self.publish(Invalidation::Graph);
        }
        Ok(rows > 0)
    }

    fn unlink_all(&self, entity: &EntityRef) -> Result<usize> {
        let rows = self.conn().execute(
            "DELETE FROM relationship_links
             WHERE (parent_type = ?1 AND parent_id = ?2) OR (child_type = ?1 AND child_id = ?2)",
            params![entity.entity_type, entity.instance_id],
        )?;

        if rows > 0 {
            self.publish(Invalidation::Graph);
        }
        Ok(rows)
    }

    fn parents_of(&self, entity: &EntityRef) -> Result<Vec<ParentEdge>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT parent_type, parent_id, ownership_flag FROM relationship_links
             WHERE child_type = ?1 AND child_id = ?2
             ORDER BY parent_type, parent_id",
        )?;

        let rows = stmt.query_map(params![entity.entity_type, entity.instance_id], |row| {
            Ok(ParentEdge {
                parent: EntityRef::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?),
                ownership_flag: row.get(2)?,
            })
        })?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn children_of(&self, entity: &EntityRef) -> Result<Vec<ChildEdge>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT child_type, child_id, ownership_flag FROM relationship_links
             WHERE parent_type = ?1 AND parent_id = ?2
             ORDER BY child_type, child_id",
        )?;

        let rows = stmt.query_map(params![entity.entity_type, entity.instance_id], |row| {
            Ok(ChildEdge {
                child: EntityRef::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?),
                ownership_flag: row.get(2)?,
            })
        })?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn linked_instances(&self, entity_type: &str) -> Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT parent_id FROM relationship_links WHERE parent_type = ?1
             UNION
             SELECT child_id FROM relationship_links WHERE child_type = ?1
             ORDER BY 1",
        )?;

        let rows = stmt.query_map(params![entity_type], |row| row.get(0))?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}
