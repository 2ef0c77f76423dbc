//! SQLite metadata store
//!
//! The registry of applications is the single source of truth for what is
//! deployed. It also holds the operation journal used to reconcile work
//! interrupted by a crash or Ctrl-C.

use crate::error::DeployError;
use crate::models::{AppRecord, ConfigOverrides, ProcessSpec, SourceRef};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 2;

const ENV_SOURCE_MERGED: &str = "env";
const ENV_SOURCE_OVERRIDE: &str = "override";

/// Kind of a journaled operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Add,
    Update,
    Remove,
    Restore,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Add => "add",
            OperationKind::Update => "update",
            OperationKind::Remove => "remove",
            OperationKind::Restore => "restore",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "add" => Ok(OperationKind::Add),
            "update" => Ok(OperationKind::Update),
            "remove" => Ok(OperationKind::Remove),
            "restore" => Ok(OperationKind::Restore),
            other => anyhow::bail!("Unknown operation kind in journal: {}", other),
        }
    }
}

/// An operation that began side effects and has not yet finished
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub app_name: String,
    pub kind: OperationKind,
    /// Snapshot to roll back to, for update and restore
    pub backup_id: Option<String>,
    pub started_at: DateTime<Utc>,
}

/// Database connection wrapper with thread-safe access
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path).context("Failed to open database")?;

        // WAL lets the poller read while a CLI command writes
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.run_migrations()?;

        debug!("Database opened at {}", path.display());
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory database")?;

        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let current_version: i32 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )?;

        if current_version < SCHEMA_VERSION {
            info!(
                "Running migrations from v{} to v{}",
                current_version, SCHEMA_VERSION
            );

            if current_version < 1 {
                Self::migrate_v1(&conn)?;
            }

            if current_version < 2 {
                Self::migrate_v2(&conn)?;
            }
        }

        Ok(())
    }

    /// Migration v1: application registry
    fn migrate_v1(conn: &Connection) -> Result<()> {
        debug!("Applying migration v1: application registry");

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS apps (
                name TEXT PRIMARY KEY,
                repository TEXT NOT NULL,
                branch TEXT NOT NULL,
                subfolder TEXT,
                config_overrides TEXT NOT NULL DEFAULT '{}',
                revision TEXT,
                created_at TEXT NOT NULL,
                last_deployed_at TEXT,
                backup_ref TEXT
            );

            CREATE TABLE IF NOT EXISTS app_processes (
                app_name TEXT NOT NULL,
                name TEXT NOT NULL,
                position INTEGER NOT NULL,
                command TEXT NOT NULL,
                port INTEGER,
                is_primary INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (app_name, name),
                FOREIGN KEY (app_name) REFERENCES apps(name) ON DELETE CASCADE
            );

            -- Ports are unique across every application on the host
            CREATE UNIQUE INDEX IF NOT EXISTS idx_app_processes_port
                ON app_processes(port) WHERE port IS NOT NULL;

            CREATE TABLE IF NOT EXISTS app_env (
                app_name TEXT NOT NULL,
                source TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (app_name, source, key),
                FOREIGN KEY (app_name) REFERENCES apps(name) ON DELETE CASCADE
            );

            INSERT INTO schema_migrations (version) VALUES (1);
        "#,
        )?;

        Ok(())
    }

    /// Migration v2: operation journal
    fn migrate_v2(conn: &Connection) -> Result<()> {
        debug!("Applying migration v2: operation journal");

        conn.execute_batch(
            r#"
            -- Not tied to apps: an interrupted add has no app row yet
            CREATE TABLE IF NOT EXISTS operations (
                app_name TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                backup_id TEXT,
                started_at TEXT NOT NULL
            );

            INSERT INTO schema_migrations (version) VALUES (2);
        "#,
        )?;

        Ok(())
    }

    // ==================== Applications ====================

    /// Insert a new application. Name and port collisions surface as
    /// `NameConflict` and `PortConflict`.
    pub fn insert_app(&self, app: &AppRecord) -> crate::error::Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let inserted = tx.execute(
            "INSERT INTO apps (name, repository, branch, subfolder, config_overrides,
                revision, created_at, last_deployed_at, backup_ref)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                app.name,
                app.source.repository,
                app.source.branch,
                app.source.subfolder,
                serde_json::to_string(&app.config_overrides).context("encode overrides")?,
                app.revision,
                app.created_at.to_rfc3339(),
                app.last_deployed_at.map(|t| t.to_rfc3339()),
                app.backup_ref,
            ],
        );
        if let Err(e) = inserted {
            return Err(map_constraint(&tx, app, e));
        }

        if let Err(e) = Self::write_children(&tx, app) {
            return Err(map_constraint(&tx, app, e));
        }

        tx.commit()?;
        debug!(app = %app.name, "Inserted application record");
        Ok(())
    }

    /// Replace an existing application's record
    pub fn update_app(&self, app: &AppRecord) -> crate::error::Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let changed = tx.execute(
            "UPDATE apps SET repository = ?2, branch = ?3, subfolder = ?4,
                config_overrides = ?5, revision = ?6, created_at = ?7,
                last_deployed_at = ?8, backup_ref = ?9
             WHERE name = ?1",
            params![
                app.name,
                app.source.repository,
                app.source.branch,
                app.source.subfolder,
                serde_json::to_string(&app.config_overrides).context("encode overrides")?,
                app.revision,
                app.created_at.to_rfc3339(),
                app.last_deployed_at.map(|t| t.to_rfc3339()),
                app.backup_ref,
            ],
        )?;
        if changed == 0 {
            return Err(DeployError::NotFound(app.name.clone()));
        }

        tx.execute("DELETE FROM app_processes WHERE app_name = ?1", [&app.name])?;
        tx.execute("DELETE FROM app_env WHERE app_name = ?1", [&app.name])?;
        if let Err(e) = Self::write_children(&tx, app) {
            return Err(map_constraint(&tx, app, e));
        }

        tx.commit()?;
        debug!(app = %app.name, "Updated application record");
        Ok(())
    }

    fn write_children(tx: &Transaction<'_>, app: &AppRecord) -> rusqlite::Result<()> {
        for (position, process) in app.processes.iter().enumerate() {
            tx.execute(
                "INSERT INTO app_processes (app_name, name, position, command, port, is_primary)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    app.name,
                    process.name,
                    position as i64,
                    process.command,
                    process.port,
                    process.primary,
                ],
            )?;
        }

        for (source, vars) in [
            (ENV_SOURCE_MERGED, &app.env),
            (ENV_SOURCE_OVERRIDE, &app.overrides),
        ] {
            for (key, value) in vars {
                tx.execute(
                    "INSERT INTO app_env (app_name, source, key, value) VALUES (?1, ?2, ?3, ?4)",
                    params![app.name, source, key, value],
                )?;
            }
        }

        Ok(())
    }

    /// Get an application by name
    pub fn get_app(&self, name: &str) -> Result<Option<AppRecord>> {
        let conn = self.conn.lock();
        load_app(&conn, name)
    }

    pub fn app_exists(&self, name: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM apps WHERE name = ?1",
            [name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// List all applications, ordered by name
    pub fn list_apps(&self) -> Result<Vec<AppRecord>> {
        let conn = self.conn.lock();
        let names: Vec<String> = {
            let mut stmt = conn.prepare("SELECT name FROM apps ORDER BY name")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect::<rusqlite::Result<_>>()?
        };

        let mut apps = Vec::with_capacity(names.len());
        for name in names {
            if let Some(app) = load_app(&conn, &name)? {
                apps.push(app);
            }
        }
        Ok(apps)
    }

    /// Delete an application (processes and env cascade)
    pub fn delete_app(&self, name: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute("DELETE FROM apps WHERE name = ?1", [name])?;
        Ok(rows > 0)
    }

    // ==================== Ports ====================

    /// Application that claims `port`, if any
    pub fn port_owner(&self, port: u16) -> Result<Option<String>> {
        let conn = self.conn.lock();
        port_owner(&conn, port)
    }

    /// Every port claimed by any application except `exclude`
    pub fn claimed_ports(&self, exclude: Option<&str>) -> Result<HashSet<u16>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT port FROM app_processes
             WHERE port IS NOT NULL AND (?1 IS NULL OR app_name != ?1)",
        )?;
        let ports = stmt
            .query_map([exclude], |row| row.get::<_, u16>(0))?
            .collect::<rusqlite::Result<HashSet<_>>>()?;
        Ok(ports)
    }

    // ==================== Operation journal ====================

    /// Record that an operation is about to cause side effects
    pub fn begin_operation(
        &self,
        app_name: &str,
        kind: OperationKind,
        backup_id: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO operations (app_name, kind, backup_id, started_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![app_name, kind.as_str(), backup_id, Utc::now().to_rfc3339()],
        )?;
        debug!(app = %app_name, kind = kind.as_str(), "Journal entry written");
        Ok(())
    }

    pub fn get_operation(&self, app_name: &str) -> Result<Option<JournalEntry>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT app_name, kind, backup_id, started_at FROM operations WHERE app_name = ?1",
                [app_name],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(app_name, kind, backup_id, started_at)| {
            Ok(JournalEntry {
                app_name,
                kind: OperationKind::parse(&kind)?,
                backup_id,
                started_at: parse_time(&started_at)?,
            })
        })
        .transpose()
    }

    pub fn clear_operation(&self, app_name: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM operations WHERE app_name = ?1", [app_name])?;
        Ok(())
    }
}

fn load_app(conn: &Connection, name: &str) -> Result<Option<AppRecord>> {
    let row = conn
        .query_row(
            "SELECT name, repository, branch, subfolder, config_overrides, revision,
                    created_at, last_deployed_at, backup_ref
             FROM apps WHERE name = ?1",
            [name],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, Option<String>>(7)?,
                    row.get::<_, Option<String>>(8)?,
                ))
            },
        )
        .optional()?;

    let Some((
        name,
        repository,
        branch,
        subfolder,
        overrides_json,
        revision,
        created_at,
        last_deployed_at,
        backup_ref,
    )) = row
    else {
        return Ok(None);
    };

    let processes = {
        let mut stmt = conn.prepare(
            "SELECT name, command, port, is_primary FROM app_processes
             WHERE app_name = ?1 ORDER BY position",
        )?;
        let rows = stmt.query_map([&name], |row| {
            Ok(ProcessSpec {
                name: row.get(0)?,
                command: row.get(1)?,
                port: row.get(2)?,
                primary: row.get(3)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()?
    };

    let mut env = BTreeMap::new();
    let mut overrides = BTreeMap::new();
    {
        let mut stmt =
            conn.prepare("SELECT source, key, value FROM app_env WHERE app_name = ?1")?;
        let rows = stmt.query_map([&name], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        for row in rows {
            let (source, key, value) = row?;
            if source == ENV_SOURCE_OVERRIDE {
                overrides.insert(key, value);
            } else {
                env.insert(key, value);
            }
        }
    }

    let config_overrides: ConfigOverrides = serde_json::from_str(&overrides_json)
        .with_context(|| format!("Corrupt config overrides for {}", name))?;

    Ok(Some(AppRecord {
        name,
        source: SourceRef {
            repository,
            branch,
            subfolder,
        },
        processes,
        config_overrides,
        env,
        overrides,
        revision,
        created_at: parse_time(&created_at)?,
        last_deployed_at: last_deployed_at.as_deref().map(parse_time).transpose()?,
        backup_ref,
    }))
}

fn port_owner(conn: &Connection, port: u16) -> Result<Option<String>> {
    let owner = conn
        .query_row(
            "SELECT app_name FROM app_processes WHERE port = ?1",
            [port],
            |row| row.get(0),
        )
        .optional()?;
    Ok(owner)
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("Invalid timestamp in store: {}", s))?
        .with_timezone(&Utc))
}

/// Translate a uniqueness violation into the matching domain error
fn map_constraint(tx: &Transaction<'_>, app: &AppRecord, e: rusqlite::Error) -> DeployError {
    let message = e.to_string();
    if message.contains("UNIQUE constraint failed: apps.name") {
        return DeployError::NameConflict(app.name.clone());
    }
    if message.contains("UNIQUE constraint failed: app_processes.port") {
        for port in app.ports() {
            if let Ok(Some(owner)) = port_owner(tx, port) {
                if owner != app.name {
                    return DeployError::PortConflict { port, owner };
                }
            }
        }
    }
    DeployError::Internal(anyhow::Error::new(e).context("Failed to write application record"))
}
