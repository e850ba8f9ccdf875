mod checkpoint;
mod status;
mod stream;

use anyhow::Result;
use async_trait::async_trait;
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;

use crate::core::types::StatusReport;

pub use status::StatusRecord;

/// Durable home for worker state blobs, keyed by agent id. Last write wins.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn upsert(&self, agent_id: &str, state_json: &str) -> Result<()>;

    async fn get(&self, agent_id: &str) -> Result<Option<String>>;
}

/// Sink for worker self-reported status, upserted by agent id.
#[async_trait]
pub trait StatusReporter: Send + Sync {
    async fn report(&self, agent_id: &str, report: &StatusReport) -> Result<()>;
}

/// One SQLite database backing checkpoints, status rows and inbox logs.
pub struct SqliteStore {
    db: Arc<Mutex<Connection>>,
    poll_interval: Duration,
}

impl SqliteStore {
    pub async fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let db = Connection::open(db_path)?;
        db.busy_timeout(Duration::from_secs(5))?;
        info!("Opened agentbox store at {}", db_path.display());
        Self::from_connection(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(db: Connection) -> Result<Self> {
        db.execute(
            "CREATE TABLE IF NOT EXISTS agent_state (
                agent_id TEXT PRIMARY KEY,
                state_json TEXT NOT NULL,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        db.execute(
            "CREATE TABLE IF NOT EXISTS agent_status (
                agent_id TEXT PRIMARY KEY,
                phase TEXT NOT NULL,
                step TEXT,
                progress TEXT,
                message TEXT,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        db.execute(
            "CREATE TABLE IF NOT EXISTS stream_entries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                stream_key TEXT NOT NULL,
                data TEXT NOT NULL,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_stream_entries_key_id ON stream_entries(stream_key, id)",
            [],
        )?;

        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            poll_interval: Duration::from_millis(200),
        })
    }

    /// How often a blocked inbox read re-queries the log table.
    #[cfg(test)]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}
