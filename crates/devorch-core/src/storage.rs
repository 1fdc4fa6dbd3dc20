//! OrchestratorStore: SQLite WAL persistence
//!
//! Holds what must survive a restart:
//! - finished command records (history reload)
//! - saved commands
//! - running services, so live processes can be re-adopted
//!
//! Writes coming from the state store go through [`PersistHandle`], a
//! queue drained by one background task, so the mutation path never waits
//! on disk I/O.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::types::{CommandRecord, SavedCommand, Service, ServiceId, Timestamp};

/// Store shared between the writer task and direct queries
pub type SharedStore = Arc<Mutex<OrchestratorStore>>;

pub struct OrchestratorStore {
    conn: Connection,
}

impl std::fmt::Debug for OrchestratorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestratorStore")
            .field("path", &self.conn.path())
            .finish()
    }
}

fn millis(ts: &Timestamp) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> Timestamp {
    chrono::DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

impl OrchestratorStore {
    /// Open (or create) the database in WAL mode.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating database directory '{}'", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("opening SQLite database '{}'", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("configuring SQLite WAL pragmas")?;

        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    /// Throwaway database for tests and path-less configurations
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("opening in-memory SQLite")?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn into_shared(self) -> SharedStore {
        Arc::new(Mutex::new(self))
    }

    fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
            CREATE TABLE IF NOT EXISTS commands (
                id              TEXT PRIMARY KEY,
                status          TEXT NOT NULL,
                submitted_at_ms INTEGER NOT NULL,
                finished_at_ms  INTEGER,
                payload_json    TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_commands_submitted
                ON commands(submitted_at_ms DESC);

            CREATE TABLE IF NOT EXISTS saved_commands (
                id                TEXT PRIMARY KEY,
                name              TEXT NOT NULL,
                command           TEXT NOT NULL,
                working_directory TEXT,
                description       TEXT,
                tags_json         TEXT NOT NULL DEFAULT '[]',
                created_at_ms     INTEGER NOT NULL,
                last_used_ms      INTEGER
            );

            CREATE TABLE IF NOT EXISTS services (
                id            TEXT PRIMARY KEY,
                name          TEXT NOT NULL,
                pid           INTEGER,
                port          INTEGER,
                payload_json  TEXT NOT NULL
            );
            ",
            )
            .context("migrating SQLite schema")?;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Commands
    // ---------------------------------------------------------------------

    pub fn upsert_command(&self, record: &CommandRecord) -> Result<()> {
        let payload = serde_json::to_string(record).context("serializing command record")?;
        self.conn
            .execute(
                "INSERT INTO commands (id, status, submitted_at_ms, finished_at_ms, payload_json)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                    status = excluded.status,
                    finished_at_ms = excluded.finished_at_ms,
                    payload_json = excluded.payload_json",
                params![
                    record.id.as_str(),
                    record.status.as_str(),
                    millis(&record.submitted_at),
                    record.finished_at.as_ref().map(millis),
                    payload
                ],
            )
            .context("upserting command")?;
        Ok(())
    }

    /// The most recent `limit` commands, oldest first
    pub fn recent_commands(&self, limit: usize) -> Result<Vec<CommandRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT payload_json FROM commands
             ORDER BY submitted_at_ms DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |row| row.get::<_, String>(0))
            .context("querying commands")?;

        let mut records = Vec::new();
        for payload in rows {
            let payload = payload.context("reading command row")?;
            match serde_json::from_str::<CommandRecord>(&payload) {
                Ok(record) => records.push(record),
                Err(err) => tracing::warn!(%err, "skipping unreadable command row"),
            }
        }
        records.reverse();
        Ok(records)
    }

    // ---------------------------------------------------------------------
    // Saved commands
    // ---------------------------------------------------------------------

    pub fn insert_saved_command(&self, saved: &SavedCommand) -> Result<()> {
        let tags = serde_json::to_string(&saved.tags).context("serializing tags")?;
        self.conn
            .execute(
                "INSERT INTO saved_commands
                 (id, name, command, working_directory, description, tags_json, created_at_ms, last_used_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    saved.id,
                    saved.name,
                    saved.command,
                    saved
                        .working_directory
                        .as_ref()
                        .map(|p| p.display().to_string()),
                    saved.description,
                    tags,
                    millis(&saved.created_at),
                    saved.last_used.as_ref().map(millis),
                ],
            )
            .context("INSERT saved_commands")?;
        Ok(())
    }

    pub fn saved_commands(&self) -> Result<Vec<SavedCommand>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, command, working_directory, description, tags_json, created_at_ms, last_used_ms
             FROM saved_commands
             ORDER BY COALESCE(last_used_ms, created_at_ms) DESC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                let tags_json: String = row.get(5)?;
                let working_directory: Option<String> = row.get(3)?;
                let last_used: Option<i64> = row.get(7)?;
                Ok(SavedCommand {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    command: row.get(2)?,
                    working_directory: working_directory.map(Into::into),
                    description: row.get(4)?,
                    tags: serde_json::from_str(&tags_json).unwrap_or_default(),
                    created_at: from_millis(row.get(6)?),
                    last_used: last_used.map(from_millis),
                })
            })
            .context("querying saved_commands")?;

        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("collecting saved commands")
    }

    pub fn saved_command(&self, id: &str) -> Result<Option<SavedCommand>> {
        Ok(self.saved_commands()?.into_iter().find(|s| s.id == id))
    }

    /// Returns false when no such saved command exists
    pub fn delete_saved_command(&self, id: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute("DELETE FROM saved_commands WHERE id = ?1", params![id])
            .context("DELETE saved_commands")?;
        Ok(changed > 0)
    }

    pub fn touch_saved_command(&self, id: &str, at: &Timestamp) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE saved_commands SET last_used_ms = ?2 WHERE id = ?1",
                params![id, millis(at)],
            )
            .context("UPDATE saved_commands")?;
        Ok(changed > 0)
    }

    // ---------------------------------------------------------------------
    // Services
    // ---------------------------------------------------------------------

    pub fn upsert_service(&self, service: &Service) -> Result<()> {
        let payload = serde_json::to_string(service).context("serializing service")?;
        self.conn
            .execute(
                "INSERT INTO services (id, name, pid, port, payload_json)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                    pid = excluded.pid,
                    port = excluded.port,
                    payload_json = excluded.payload_json",
                params![
                    service.id.as_str(),
                    service.name,
                    service.pid,
                    service.port,
                    payload
                ],
            )
            .context("upserting service")?;
        Ok(())
    }

    pub fn delete_service(&self, id: &ServiceId) -> Result<()> {
        self.conn
            .execute("DELETE FROM services WHERE id = ?1", params![id.as_str()])
            .context("DELETE services")?;
        Ok(())
    }

    pub fn services(&self) -> Result<Vec<Service>> {
        let mut stmt = self
            .conn
            .prepare("SELECT payload_json FROM services ORDER BY name")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .context("querying services")?;

        let mut services = Vec::new();
        for payload in rows {
            let payload = payload.context("reading service row")?;
            services.push(serde_json::from_str(&payload).context("parsing service row")?);
        }
        Ok(services)
    }

    pub fn service(&self, id: &ServiceId) -> Result<Option<Service>> {
        let payload: Option<String> = self
            .conn
            .query_row(
                "SELECT payload_json FROM services WHERE id = ?1",
                params![id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .context("querying service")?;
        payload
            .map(|p| serde_json::from_str(&p).context("parsing service row"))
            .transpose()
    }

    fn apply(&self, op: &PersistOp) -> Result<()> {
        match op {
            PersistOp::Command(record) => self.upsert_command(record),
            PersistOp::Service(service) => self.upsert_service(service),
            PersistOp::RemoveService(id) => self.delete_service(id),
            PersistOp::Flush(_) => Ok(()),
        }
    }
}

/// A write queued by the state store
#[derive(Debug)]
pub enum PersistOp {
    Command(CommandRecord),
    Service(Service),
    RemoveService(ServiceId),
    /// Completes once every earlier op has been applied
    Flush(oneshot::Sender<()>),
}

/// Sending side of the background writer
#[derive(Debug, Clone)]
pub struct PersistHandle {
    tx: mpsc::UnboundedSender<PersistOp>,
}

impl PersistHandle {
    /// Start the writer task on the current runtime
    pub fn spawn(store: SharedStore) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<PersistOp>();
        let task = tokio::spawn(async move {
            while let Some(op) = rx.recv().await {
                if let PersistOp::Flush(done) = op {
                    let _ = done.send(());
                    continue;
                }
                let store = store.clone();
                let outcome = tokio::task::spawn_blocking(move || store.lock().apply(&op)).await;
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => tracing::warn!("persistence write failed: {:#}", err),
                    Err(err) => tracing::warn!(%err, "persistence task panicked"),
                }
            }
            tracing::debug!("persistence writer stopped");
        });
        (Self { tx }, task)
    }

    pub fn send(&self, op: PersistOp) {
        if self.tx.send(op).is_err() {
            tracing::debug!("persistence writer gone, dropping write");
        }
    }

    /// Wait until every write queued so far is on disk
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        self.send(PersistOp::Flush(done));
        let _ = wait.await;
    }
}
