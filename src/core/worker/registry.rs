use anyhow::{Result, bail};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::{RunOptions, RunOutcome, WorkerContext};
use crate::core::clock::Clock;
use crate::core::config::AgentboxConfig;
use crate::core::lifecycle::LifecycleManager;

/// Everything a launcher needs to build its hooks and run them.
pub struct WorkerRuntime {
    pub context: WorkerContext,
    pub lifecycle: Arc<LifecycleManager>,
    pub clock: Arc<dyn Clock>,
    pub config: AgentboxConfig,
    pub options: RunOptions,
    pub shutdown: CancellationToken,
}

pub type LaunchFuture = Pin<Box<dyn Future<Output = Result<RunOutcome>> + Send>>;

pub type WorkerLauncher = fn(WorkerRuntime) -> LaunchFuture;

/// Frozen worker-type → launcher table. Build it once with
/// [`WorkerRegistry::builder`]; it cannot change afterwards.
pub struct WorkerRegistry {
    launchers: BTreeMap<String, WorkerLauncher>,
}

#[derive(Default)]
pub struct WorkerRegistryBuilder {
    launchers: BTreeMap<String, WorkerLauncher>,
}

impl WorkerRegistryBuilder {
    pub fn register(mut self, worker_type: &str, launcher: WorkerLauncher) -> Result<Self> {
        if self.launchers.contains_key(worker_type) {
            bail!("Worker type '{}' registered twice", worker_type);
        }
        self.launchers.insert(worker_type.to_string(), launcher);
        Ok(self)
    }

    pub fn freeze(self) -> WorkerRegistry {
        WorkerRegistry {
            launchers: self.launchers,
        }
    }
}

impl WorkerRegistry {
    pub fn builder() -> WorkerRegistryBuilder {
        WorkerRegistryBuilder::default()
    }

    pub fn get(&self, worker_type: &str) -> Result<WorkerLauncher> {
        match self.launchers.get(worker_type) {
            Some(launcher) => Ok(*launcher),
            None => bail!(
                "Unknown worker type '{}' (known: {})",
                worker_type,
                self.types().collect::<Vec<_>>().join(", ")
            ),
        }
    }

    pub fn types(&self) -> impl Iterator<Item = &str> {
        self.launchers.keys().map(String::as_str)
    }

    /// Look up the launcher for `runtime.context.agent_type` and run it.
    pub async fn launch(&self, runtime: WorkerRuntime) -> Result<RunOutcome> {
        let launcher = self.get(&runtime.context.agent_type)?;
        launcher(runtime).await
    }
}
