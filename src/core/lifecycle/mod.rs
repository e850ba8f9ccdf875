//! Worker lifecycle: provisioning, teardown, readiness and idle-timer refresh
//! against the orchestration backend.
//!
//! Every operation folds backend errors into a logged boolean or `None`;
//! callers decide whether to retry. A record can vanish between calls when
//! TTL expiry races a refresh.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::core::backend::{BackendError, LabelSelector, OrchestrationBackend};
use crate::core::clock::Clock;
use crate::core::types::{WorkerPhase, WorkerRecord, WorkerSpec, WorkerStatus};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

pub struct LifecycleManager {
    backend: Arc<dyn OrchestrationBackend>,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
}

impl LifecycleManager {
    pub fn new(backend: Arc<dyn OrchestrationBackend>, clock: Arc<dyn Clock>) -> Self {
        Self {
            backend,
            clock,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Create a worker record, surfacing the backend's reason.
    pub async fn try_create(&self, spec: &WorkerSpec) -> Result<(), BackendError> {
        info!(
            "Provisioning worker {} (type: {}, image: {}, ttl: {:?})",
            spec.name, spec.worker_type, spec.image, spec.ttl_seconds
        );
        match self.backend.create(spec).await {
            Ok(()) => {
                info!("Worker {} created", spec.name);
                Ok(())
            }
            Err(e) => {
                error!("Failed to create worker {}: {}", spec.name, e);
                Err(e)
            }
        }
    }

    pub async fn create(&self, spec: &WorkerSpec) -> bool {
        self.try_create(spec).await.is_ok()
    }

    /// Delete a worker record. `false` when the backend refused or the record
    /// was already gone; either way no such worker remains afterwards.
    pub async fn delete(&self, name: &str) -> bool {
        match self.backend.delete(name).await {
            Ok(()) => {
                info!("Worker {} deleted", name);
                true
            }
            Err(BackendError::NotFound(_)) => {
                warn!("Worker {} already absent", name);
                false
            }
            Err(e) => {
                error!("Failed to delete worker {}: {}", name, e);
                false
            }
        }
    }

    pub async fn describe(&self, name: &str) -> Option<WorkerRecord> {
        match self.backend.get(name).await {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("Failed to read worker {}: {}", name, e);
                None
            }
        }
    }

    /// `None` on any read error, not only on absence.
    pub async fn get_status(&self, name: &str) -> Option<WorkerStatus> {
        self.describe(name).await.map(|r| r.status())
    }

    pub async fn is_ready(&self, name: &str) -> bool {
        matches!(
            self.get_status(name).await,
            Some(WorkerStatus {
                phase: WorkerPhase::Running,
                ..
            })
        )
    }

    /// Poll `is_ready` every poll interval until it holds or `timeout` elapses.
    pub async fn wait_ready(&self, name: &str, timeout: Duration) -> bool {
        let started = Instant::now();
        loop {
            if self.is_ready(name).await {
                return true;
            }
            if started.elapsed() >= timeout {
                warn!("Timed out waiting for worker {} to be ready", name);
                return false;
            }
            info!("Waiting for worker {} to be ready...", name);
            let remaining = timeout.saturating_sub(started.elapsed());
            tokio::time::sleep(self.poll_interval.min(remaining)).await;
        }
    }

    /// Reset the worker's idle timer to now, surfacing the backend's reason.
    /// `NotFound` is the only error that means the record is gone.
    pub async fn try_refresh_activity(&self, name: &str) -> Result<(), BackendError> {
        match self.backend.touch(name, self.clock.now()).await {
            Ok(()) => {
                info!("Refreshed last activity for worker {}", name);
                Ok(())
            }
            Err(e) => {
                warn!("Failed to refresh last activity for worker {}: {}", name, e);
                Err(e)
            }
        }
    }

    /// Empty on read error.
    pub async fn list(&self, selector: Option<&LabelSelector>) -> Vec<WorkerRecord> {
        let empty = LabelSelector::new();
        match self.backend.list(selector.unwrap_or(&empty)).await {
            Ok(records) => records,
            Err(e) => {
                error!("Failed to list workers: {}", e);
                Vec::new()
            }
        }
    }
}
