use anyhow::{Result, bail};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::core::agent::default_registry;
use crate::core::backend::{InMemoryBackend, KubeBackend, OrchestrationBackend};
use crate::core::clock::{Clock, SystemClock};
use crate::core::config::{AgentboxConfig, BackendKind, WorkerIdentity};
use crate::core::lifecycle::LifecycleManager;
use crate::core::messaging::Messaging;
use crate::core::store::SqliteStore;
use crate::core::terminal::print_success;
use crate::core::worker::{RunOptions, RunOutcome, WorkerContext, WorkerRegistry, WorkerRuntime};

static REGISTRY: OnceLock<WorkerRegistry> = OnceLock::new();

fn registry() -> Result<&'static WorkerRegistry> {
    if let Some(registry) = REGISTRY.get() {
        return Ok(registry);
    }
    let built = default_registry()?;
    Ok(REGISTRY.get_or_init(|| built))
}

pub(crate) fn build_lifecycle(
    config: &AgentboxConfig,
    clock: Arc<dyn Clock>,
) -> Result<Arc<LifecycleManager>> {
    let backend: Arc<dyn OrchestrationBackend> = match config.backend.kind {
        BackendKind::Kube => Arc::new(KubeBackend::from_config(&config.backend)?),
        BackendKind::Memory => {
            warn!("Using the in-memory backend; worker records live only in this process");
            Arc::new(InMemoryBackend::new(clock.clone()).with_auto_ready())
        }
    };
    Ok(Arc::new(
        LifecycleManager::new(backend, clock)
            .with_poll_interval(Duration::from_secs(config.backend.poll_interval_secs.max(1))),
    ))
}

/// Resolves on Ctrl-C, or SIGTERM where available.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}

pub async fn run_worker_command(config: AgentboxConfig) -> Result<()> {
    let identity = WorkerIdentity::from_env(|key| std::env::var(key).ok());
    let registry = registry()?;
    // unknown types fail before touching the store or backend
    registry.get(&identity.agent_type)?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let lifecycle = build_lifecycle(&config, clock.clone())?;
    let store = Arc::new(SqliteStore::open(config.db_path()).await?);

    let context = WorkerContext {
        agent_id: identity.agent_id.clone(),
        agent_type: identity.agent_type.clone(),
        checkpoints: store.clone(),
        status: store.clone(),
        messaging: Messaging::new(store, &identity.agent_type, &identity.agent_id),
    };

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown requested");
        trigger.cancel();
    });

    let outcome = registry
        .launch(WorkerRuntime {
            context,
            lifecycle,
            clock,
            config,
            options: RunOptions {
                run_once: identity.run_once,
            },
            shutdown,
        })
        .await?;

    match outcome {
        RunOutcome::Shutdown => Ok(()),
        RunOutcome::Completed => {
            print_success(&format!("Worker {} completed.", identity.agent_id));
            Ok(())
        }
        RunOutcome::Failed(reason) => bail!("Worker {} failed: {}", identity.agent_id, reason),
    }
}
