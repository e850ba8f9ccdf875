use anyhow::Result;
use async_trait::async_trait;
use rusqlite::{OptionalExtension, params};

use super::{SqliteStore, StatusReporter};
use crate::core::types::StatusReport;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusRecord {
    pub agent_id: String,
    pub phase: String,
    pub step: Option<String>,
    pub progress: Option<String>,
    pub message: Option<String>,
    pub updated_at: String,
}

#[async_trait]
impl StatusReporter for SqliteStore {
    async fn report(&self, agent_id: &str, report: &StatusReport) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO agent_status (agent_id, phase, step, progress, message, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, CURRENT_TIMESTAMP)
             ON CONFLICT(agent_id)
             DO UPDATE SET phase = excluded.phase, step = excluded.step,
                           progress = excluded.progress, message = excluded.message,
                           updated_at = CURRENT_TIMESTAMP",
            params![
                agent_id,
                report.phase.as_str(),
                report.step,
                report.progress,
                report.message
            ],
        )?;
        Ok(())
    }
}

impl SqliteStore {
    pub async fn get_status(&self, agent_id: &str) -> Result<Option<StatusRecord>> {
        let db = self.db.lock().await;
        let record = db
            .query_row(
                "SELECT agent_id, phase, step, progress, message, updated_at
                 FROM agent_status WHERE agent_id = ?1",
                params![agent_id],
                |row| {
                    Ok(StatusRecord {
                        agent_id: row.get(0)?,
                        phase: row.get(1)?,
                        step: row.get(2)?,
                        progress: row.get(3)?,
                        message: row.get(4)?,
                        updated_at: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }
}
