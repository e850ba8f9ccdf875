use anyhow::Result;
use async_trait::async_trait;
use rusqlite::{OptionalExtension, params};

use super::SqliteStore;
use crate::core::messaging::{LogBroker, LogEntry};

fn next_entry(
    db: &rusqlite::Connection,
    stream_key: &str,
    after: u64,
) -> Result<Option<LogEntry>> {
    let entry = db
        .query_row(
            "SELECT id, data FROM stream_entries
             WHERE stream_key = ?1 AND id > ?2
             ORDER BY id ASC LIMIT 1",
            params![stream_key, after as i64],
            |row| {
                Ok(LogEntry {
                    id: row.get::<_, i64>(0)? as u64,
                    data: row.get(1)?,
                })
            },
        )
        .optional()?;
    Ok(entry)
}

#[async_trait]
impl LogBroker for SqliteStore {
    async fn append(&self, stream_key: &str, data: &str) -> Result<u64> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO stream_entries (stream_key, data) VALUES (?1, ?2)",
            params![stream_key, data],
        )?;
        Ok(db.last_insert_rowid() as u64)
    }

    async fn read_next(&self, stream_key: &str, after: u64) -> Result<LogEntry> {
        loop {
            let entry = {
                let db = self.db.lock().await;
                next_entry(&db, stream_key, after)?
            };
            if let Some(entry) = entry {
                return Ok(entry);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn entries_are_read_in_append_order_per_stream() {
        let store = SqliteStore::open_in_memory().unwrap();
        let a1 = store.append("agent:a:inbox", "one").await.unwrap();
        store.append("agent:b:inbox", "other").await.unwrap();
        let a2 = store.append("agent:a:inbox", "two").await.unwrap();
        assert!(a2 > a1);

        let first = store.read_next("agent:a:inbox", 0).await.unwrap();
        assert_eq!(first.data, "one");
        let second = store.read_next("agent:a:inbox", first.id).await.unwrap();
        assert_eq!(second.data, "two");
    }

    #[tokio::test]
    async fn read_blocks_until_an_entry_arrives() {
        let store = std::sync::Arc::new(
            SqliteStore::open_in_memory()
                .unwrap()
                .with_poll_interval(Duration::from_millis(10)),
        );
        let reader = store.clone();
        let handle = tokio::spawn(async move { reader.read_next("agent:a:inbox", 0).await });

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!handle.is_finished());
        store.append("agent:a:inbox", "late").await.unwrap();

        let entry = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(entry.data, "late");
    }
}
