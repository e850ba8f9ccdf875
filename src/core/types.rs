use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Observed lifecycle phase of a worker record, as computed by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerPhase {
    Pending,
    Running,
    Completed,
    Failed,
    #[serde(other)]
    Unknown,
}

impl WorkerPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerPhase::Pending => "pending",
            WorkerPhase::Running => "running",
            WorkerPhase::Completed => "completed",
            WorkerPhase::Failed => "failed",
            WorkerPhase::Unknown => "unknown",
        }
    }

    pub fn from_status(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "pending" => WorkerPhase::Pending,
            "running" => WorkerPhase::Running,
            "completed" | "succeeded" => WorkerPhase::Completed,
            "failed" | "terminated" => WorkerPhase::Failed,
            _ => WorkerPhase::Unknown,
        }
    }

    /// Pending or running workers can still serve messages.
    pub fn is_live(self) -> bool {
        matches!(self, WorkerPhase::Pending | WorkerPhase::Running)
    }
}

impl std::fmt::Display for WorkerPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// Desired state of a worker, written by the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WorkerSpec {
    pub name: String,
    pub worker_type: String,
    pub image: String,
    pub run_once: bool,
    pub env: BTreeMap<String, String>,
    pub service_account: Option<String>,
    /// Idle expiry in seconds. `None` means the worker never expires.
    pub ttl_seconds: Option<u64>,
    pub labels: BTreeMap<String, String>,
}

impl WorkerSpec {
    pub fn new(
        name: impl Into<String>,
        worker_type: impl Into<String>,
        image: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            worker_type: worker_type.into(),
            image: image.into(),
            ..Default::default()
        }
    }

    pub fn run_once(mut self, run_once: bool) -> Self {
        self.run_once = run_once;
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn service_account(mut self, account: Option<String>) -> Self {
        self.service_account = account;
        self
    }

    /// A TTL of zero is the same as no TTL.
    pub fn ttl_seconds(mut self, ttl: Option<u64>) -> Self {
        self.ttl_seconds = ttl.filter(|t| *t > 0);
        self
    }
}

/// A worker resource as held by the orchestration backend.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerRecord {
    pub spec: WorkerSpec,
    pub last_activity_time: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
    pub phase: WorkerPhase,
    pub message: Option<String>,
}

impl WorkerRecord {
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn status(&self) -> WorkerStatus {
        WorkerStatus {
            phase: self.phase,
            message: self.message.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerStatus {
    pub phase: WorkerPhase,
    pub message: Option<String>,
}

/// A message read from (or written to) a worker inbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub sender: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(rename = "type", default)]
    pub kind: String,
}

impl InboundMessage {
    pub fn new(
        id: impl Into<String>,
        sender: impl Into<String>,
        kind: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            sender: sender.into(),
            reply_to: None,
            payload,
            kind: kind.into(),
        }
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    /// The `text` field of the payload, if present.
    pub fn text(&self) -> Option<&str> {
        self.payload.get("text").and_then(|v| v.as_str())
    }
}

/// Terminal and progress phases a worker reports about itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusPhase {
    Running,
    Completed,
    Failed,
}

impl StatusPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            StatusPhase::Running => "running",
            StatusPhase::Completed => "completed",
            StatusPhase::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub phase: StatusPhase,
    pub step: Option<String>,
    pub progress: Option<String>,
    pub message: Option<String>,
}

impl StatusReport {
    pub fn new(phase: StatusPhase) -> Self {
        Self {
            phase,
            step: None,
            progress: None,
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}
