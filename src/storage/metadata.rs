//! Service, instance and session registry.
//!
//! This module provides the metadata store used by every storage backend:
//! - Idempotent registration of services and instances
//! - Allocation of globally unique session identifiers
//! - Session start/finish bookkeeping
//! - Discovery queries for the query API

use crate::core::{
    types::{from_unix_nanos, to_unix_nanos},
    HeapwatchError, InstanceDescription, Result, SessionDescription, SessionInfo, SessionMetadata,
};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::Arc;

const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS services (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE
);
CREATE TABLE IF NOT EXISTS instances (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    service_id INTEGER NOT NULL REFERENCES services(id),
    UNIQUE (service_id, name)
);
CREATE TABLE IF NOT EXISTS sessions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    started_at INTEGER NOT NULL,
    finished_at INTEGER,
    instance_id INTEGER NOT NULL REFERENCES instances(id)
);
CREATE INDEX IF NOT EXISTS sessions_by_instance ON sessions(instance_id);
";

const INSTANCE_ID_SQL: &str = "
SELECT i.id FROM instances i
JOIN services s ON s.id = i.service_id
WHERE s.name = ?1 AND i.name = ?2";

/// Registry of services, instances and their sessions.
#[async_trait]
pub trait MetadataStorage: Send + Sync {
    /// Registers the instance (and its service) if needed and opens a new
    /// session stamped with the current time.
    async fn start_session(&self, instance: &InstanceDescription) -> Result<SessionDescription>;

    /// Stamps the session as finished. A session can only be stopped once.
    async fn stop_session(&self, session: &SessionDescription) -> Result<()>;

    async fn get_services(&self) -> Result<Vec<String>>;

    async fn get_instances(&self, service_name: &str) -> Result<Vec<InstanceDescription>>;

    async fn get_sessions(&self, instance: &InstanceDescription) -> Result<Vec<SessionInfo>>;

    async fn get_session_metadata(&self, session: &SessionDescription) -> Result<SessionMetadata>;
}

/// SQLite backed [`MetadataStorage`].
#[derive(Clone)]
pub struct SqliteMetadataStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteMetadataStorage {
    /// Opens or creates the database file, creating its schema.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        Self::init(conn)
    }

    /// Volatile database, mostly for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        let user_version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if user_version > SCHEMA_VERSION {
            return Err(HeapwatchError::storage(format!(
                "metadata schema version {} is newer than supported {}",
                user_version, SCHEMA_VERSION
            )));
        }

        conn.execute_batch(SCHEMA)?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            f(&mut conn)
        })
        .await?
    }
}

fn instance_id(conn: &Connection, instance: &InstanceDescription) -> Result<Option<i64>> {
    Ok(conn
        .query_row(
            INSTANCE_ID_SQL,
            params![instance.service_name, instance.instance_name],
            |row| row.get(0),
        )
        .optional()?)
}

fn session_row(conn: &Connection, session: &SessionDescription) -> Result<SessionMetadata> {
    let not_found = || HeapwatchError::not_found(format!("session {session}"));

    let instance_id = instance_id(conn, &session.instance)?.ok_or_else(not_found)?;
    let row: Option<(i64, Option<i64>)> = conn
        .query_row(
            "SELECT started_at, finished_at FROM sessions WHERE id = ?1 AND instance_id = ?2",
            params![session.session_id, instance_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    let (started_at, finished_at) = row.ok_or_else(not_found)?;
    Ok(SessionMetadata {
        started_at: from_unix_nanos(started_at),
        finished_at: finished_at.map(from_unix_nanos),
    })
}

#[async_trait]
impl MetadataStorage for SqliteMetadataStorage {
    async fn start_session(&self, instance: &InstanceDescription) -> Result<SessionDescription> {
        instance.validate()?;
        let instance = instance.clone();
        let started_at = to_unix_nanos(Utc::now())?;

        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            tx.execute(
                "INSERT OR IGNORE INTO services (name) VALUES (?1)",
                params![instance.service_name],
            )?;
            let service_id: i64 = tx.query_row(
                "SELECT id FROM services WHERE name = ?1",
                params![instance.service_name],
                |row| row.get(0),
            )?;

            tx.execute(
                "INSERT OR IGNORE INTO instances (name, service_id) VALUES (?1, ?2)",
                params![instance.instance_name, service_id],
            )?;
            let instance_id: i64 = tx.query_row(
                "SELECT id FROM instances WHERE service_id = ?1 AND name = ?2",
                params![service_id, instance.instance_name],
                |row| row.get(0),
            )?;

            tx.execute(
                "INSERT INTO sessions (started_at, instance_id) VALUES (?1, ?2)",
                params![started_at, instance_id],
            )?;
            let session_id = tx.last_insert_rowid();
            tx.commit()?;

            tracing::debug!("Started session {} for {}", session_id, instance);
            Ok(SessionDescription::new(instance, session_id))
        })
        .await
    }

    async fn stop_session(&self, session: &SessionDescription) -> Result<()> {
        let session = session.clone();
        let finished_at = to_unix_nanos(Utc::now())?;

        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let metadata = session_row(&tx, &session)?;
            if !metadata.is_active() {
                return Err(HeapwatchError::storage(format!("session {session} is already stopped")));
            }

            tx.execute(
                "UPDATE sessions SET finished_at = ?1 WHERE id = ?2",
                params![finished_at, session.session_id],
            )?;
            tx.commit()?;

            tracing::debug!("Stopped session {}", session);
            Ok(())
        })
        .await
    }

    async fn get_services(&self) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT name FROM services ORDER BY name")?;
            let names = stmt
                .query_map([], |row| row.get(0))?
                .collect::<std::result::Result<Vec<String>, _>>()?;
            Ok(names)
        })
        .await
    }

    async fn get_instances(&self, service_name: &str) -> Result<Vec<InstanceDescription>> {
        let service_name = service_name.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT i.name FROM instances i
                 JOIN services s ON s.id = i.service_id
                 WHERE s.name = ?1 ORDER BY i.name",
            )?;
            let instances = stmt
                .query_map(params![service_name], |row| row.get::<_, String>(0))?
                .map(|name| {
                    Ok(InstanceDescription {
                        service_name: service_name.clone(),
                        instance_name: name?,
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(instances)
        })
        .await
    }

    async fn get_sessions(&self, instance: &InstanceDescription) -> Result<Vec<SessionInfo>> {
        let instance = instance.clone();
        self.with_conn(move |conn| {
            let Some(instance_id) = instance_id(conn, &instance)? else {
                return Ok(Vec::new());
            };

            let mut stmt = conn.prepare(
                "SELECT id, started_at, finished_at FROM sessions
                 WHERE instance_id = ?1 ORDER BY id",
            )?;
            let rows = stmt
                .query_map(params![instance_id], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, Option<i64>>(2)?,
                    ))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows
                .into_iter()
                .map(|(id, started_at, finished_at)| SessionInfo {
                    description: SessionDescription::new(instance.clone(), id),
                    metadata: SessionMetadata {
                        started_at: from_unix_nanos(started_at),
                        finished_at: finished_at.map(from_unix_nanos),
                    },
                })
                .collect())
        })
        .await
    }

    async fn get_session_metadata(&self, session: &SessionDescription) -> Result<SessionMetadata> {
        let session = session.clone();
        self.with_conn(move |conn| session_row(conn, &session)).await
    }
}
