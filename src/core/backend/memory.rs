//! In-process backend with an injectable clock. Enforces idle expiry the way
//! the cluster operator does, so TTL behaviour can be tested without a cluster.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::Mutex;
use tracing::info;

use super::{BackendError, LabelSelector, OrchestrationBackend, matches_selector};
use crate::core::clock::Clock;
use crate::core::types::{WorkerPhase, WorkerRecord, WorkerSpec};

pub struct InMemoryBackend {
    clock: Arc<dyn Clock>,
    records: Mutex<BTreeMap<String, WorkerRecord>>,
    create_calls: AtomicUsize,
    reject_creates: AtomicUsize,
    conflict_creates: AtomicUsize,
    unreachable_calls: AtomicUsize,
    auto_ready: AtomicBool,
}

impl InMemoryBackend {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            records: Mutex::new(BTreeMap::new()),
            create_calls: AtomicUsize::new(0),
            reject_creates: AtomicUsize::new(0),
            conflict_creates: AtomicUsize::new(0),
            unreachable_calls: AtomicUsize::new(0),
            auto_ready: AtomicBool::new(false),
        }
    }

    /// New records start in `Running` instead of `Pending`.
    pub fn with_auto_ready(self) -> Self {
        self.auto_ready.store(true, Ordering::SeqCst);
        self
    }

    /// Reject the next `count` create requests.
    #[cfg(test)]
    pub fn reject_next_creates(&self, count: usize) {
        self.reject_creates.store(count, Ordering::SeqCst);
    }

    /// Answer the next `count` create requests as if the name were taken.
    #[cfg(test)]
    pub fn conflict_next_creates(&self, count: usize) {
        self.conflict_creates.store(count, Ordering::SeqCst);
    }

    /// Fail the next `count` get, list or touch requests as a transport error.
    #[cfg(test)]
    pub fn fail_next_reads(&self, count: usize) {
        self.unreachable_calls.store(count, Ordering::SeqCst);
    }

    fn unreachable(&self, what: &str) -> Result<(), BackendError> {
        let failed = self
            .unreachable_calls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(BackendError::Transport(format!("connection refused during {}", what)));
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    /// Simulate the scheduler moving a worker to a new phase.
    #[cfg(test)]
    pub async fn set_phase(&self, name: &str, phase: WorkerPhase) -> bool {
        let mut records = self.records.lock().await;
        match records.get_mut(name) {
            Some(record) => {
                record.phase = phase;
                true
            }
            None => false,
        }
    }

    /// Delete every record whose idle time has reached its TTL.
    pub async fn expire_idle(&self) -> Vec<String> {
        let now = self.clock.now();
        let mut records = self.records.lock().await;
        let expired: Vec<String> = records
            .values()
            .filter(|r| is_expired(r, now))
            .map(|r| r.spec.name.clone())
            .collect();
        for name in &expired {
            records.remove(name);
            info!("Worker {} expired after idle TTL", name);
        }
        expired
    }
}

fn is_expired(record: &WorkerRecord, now: DateTime<Utc>) -> bool {
    let (Some(ttl), Some(last)) = (record.spec.ttl_seconds, record.last_activity_time) else {
        return false;
    };
    now.signed_duration_since(last) >= chrono::Duration::seconds(ttl as i64)
}

#[async_trait]
impl OrchestrationBackend for InMemoryBackend {
    async fn create(&self, spec: &WorkerSpec) -> Result<(), BackendError> {
        self.expire_idle().await;
        self.create_calls.fetch_add(1, Ordering::SeqCst);

        let rejected = self
            .reject_creates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            return Err(BackendError::Rejected(format!(
                "quota exceeded creating {}",
                spec.name
            )));
        }

        let collided = self
            .conflict_creates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();

        let mut records = self.records.lock().await;
        if collided || records.contains_key(&spec.name) {
            return Err(BackendError::Conflict(spec.name.clone()));
        }
        let now = self.clock.now();
        let phase = if self.auto_ready.load(Ordering::SeqCst) {
            WorkerPhase::Running
        } else {
            WorkerPhase::Pending
        };
        records.insert(
            spec.name.clone(),
            WorkerRecord {
                spec: spec.clone(),
                last_activity_time: Some(now),
                created_at: Some(now),
                phase,
                message: None,
            },
        );
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), BackendError> {
        self.expire_idle().await;
        match self.records.lock().await.remove(name) {
            Some(_) => Ok(()),
            None => Err(BackendError::NotFound(name.to_string())),
        }
    }

    async fn get(&self, name: &str) -> Result<WorkerRecord, BackendError> {
        self.unreachable("get")?;
        self.expire_idle().await;
        self.records
            .lock()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(name.to_string()))
    }

    async fn list(&self, selector: &LabelSelector) -> Result<Vec<WorkerRecord>, BackendError> {
        self.unreachable("list")?;
        self.expire_idle().await;
        Ok(self
            .records
            .lock()
            .await
            .values()
            .filter(|r| matches_selector(&r.spec.labels, selector))
            .cloned()
            .collect())
    }

    async fn touch(&self, name: &str, at: DateTime<Utc>) -> Result<(), BackendError> {
        self.unreachable("touch")?;
        self.expire_idle().await;
        let mut records = self.records.lock().await;
        let record = records
            .get_mut(name)
            .ok_or_else(|| BackendError::NotFound(name.to_string()))?;
        record.last_activity_time = Some(at);
        Ok(())
    }
}
