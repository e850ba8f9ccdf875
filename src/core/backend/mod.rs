//! Orchestration backend seam: declarative CRUD over worker records.
//!
//! The control plane writes `spec` fields and reads `status.phase`; it never
//! expects the backend to reconcile spec changes mid-life other than the
//! last-activity timestamp.

mod kube;
mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use crate::core::types::{WorkerRecord, WorkerSpec};

pub use kube::KubeBackend;
pub use memory::InMemoryBackend;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("worker '{0}' not found")]
    NotFound(String),
    #[error("worker '{0}' already exists")]
    Conflict(String),
    #[error("backend rejected request: {0}")]
    Rejected(String),
    #[error("backend unreachable: {0}")]
    Transport(String),
}

/// Label equality filter applied to `list`.
pub type LabelSelector = BTreeMap<String, String>;

#[async_trait]
pub trait OrchestrationBackend: Send + Sync {
    async fn create(&self, spec: &WorkerSpec) -> Result<(), BackendError>;

    async fn delete(&self, name: &str) -> Result<(), BackendError>;

    async fn get(&self, name: &str) -> Result<WorkerRecord, BackendError>;

    async fn list(&self, selector: &LabelSelector) -> Result<Vec<WorkerRecord>, BackendError>;

    /// Set `lastActivityTime` on the record, resetting its idle timer.
    async fn touch(&self, name: &str, at: DateTime<Utc>) -> Result<(), BackendError>;
}

pub(crate) fn matches_selector(labels: &BTreeMap<String, String>, selector: &LabelSelector) -> bool {
    selector
        .iter()
        .all(|(k, v)| labels.get(k).is_some_and(|actual| actual == v))
}

/// Render a selector in `k=v,k2=v2` form.
pub(crate) fn selector_query(selector: &LabelSelector) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}
