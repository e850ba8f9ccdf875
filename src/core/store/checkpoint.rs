use anyhow::Result;
use async_trait::async_trait;
use rusqlite::{OptionalExtension, params};

use super::{CheckpointStore, SqliteStore};

#[async_trait]
impl CheckpointStore for SqliteStore {
    async fn upsert(&self, agent_id: &str, state_json: &str) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO agent_state (agent_id, state_json, updated_at)
             VALUES (?1, ?2, CURRENT_TIMESTAMP)
             ON CONFLICT(agent_id)
             DO UPDATE SET state_json = excluded.state_json, updated_at = CURRENT_TIMESTAMP",
            params![agent_id, state_json],
        )?;
        Ok(())
    }

    async fn get(&self, agent_id: &str) -> Result<Option<String>> {
        let db = self.db.lock().await;
        let state = db
            .query_row(
                "SELECT state_json FROM agent_state WHERE agent_id = ?1",
                params![agent_id],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(state)
    }
}
