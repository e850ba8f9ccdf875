use anyhow::{Result, bail};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::{Mutex, Notify};

use super::{LogBroker, LogEntry};

/// Process-local broker. Supports failure injection for transport tests.
#[derive(Default)]
pub struct InMemoryBroker {
    streams: Mutex<HashMap<String, Vec<LogEntry>>>,
    next_id: Mutex<u64>,
    appended: Notify,
    failing_reads: AtomicUsize,
    failing_appends: AtomicBool,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` reads fail.
    pub fn fail_next_reads(&self, count: usize) {
        self.failing_reads.store(count, Ordering::SeqCst);
    }

    pub fn fail_appends(&self, fail: bool) {
        self.failing_appends.store(fail, Ordering::SeqCst);
    }

    pub async fn entries(&self, stream_key: &str) -> Vec<LogEntry> {
        self.streams
            .lock()
            .await
            .get(stream_key)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl LogBroker for InMemoryBroker {
    async fn append(&self, stream_key: &str, data: &str) -> Result<u64> {
        if self.failing_appends.load(Ordering::SeqCst) {
            bail!("broker unavailable");
        }
        let mut streams = self.streams.lock().await;
        let id = {
            let mut next_id = self.next_id.lock().await;
            *next_id += 1;
            *next_id
        };
        streams
            .entry(stream_key.to_string())
            .or_default()
            .push(LogEntry {
                id,
                data: data.to_string(),
            });
        drop(streams);
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn read_next(&self, stream_key: &str, after: u64) -> Result<LogEntry> {
        let failed = self
            .failing_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            bail!("connection reset while reading {}", stream_key);
        }
        loop {
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let found = self
                .streams
                .lock()
                .await
                .get(stream_key)
                .and_then(|entries| entries.iter().find(|e| e.id > after).cloned());
            if let Some(entry) = found {
                return Ok(entry);
            }
            notified.await;
        }
    }
}
