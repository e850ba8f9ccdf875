//! Generic worker run-loop.
//!
//! A worker type supplies its state type and lifecycle hooks; `run_worker`
//! drives them through hydrate, initialize, the receive/periodic loop and
//! termination (status report, cleanup, final checkpoint).

pub mod registry;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::messaging::Messaging;
use crate::core::store::{CheckpointStore, StatusReporter};
use crate::core::types::{InboundMessage, StatusPhase, StatusReport};

pub use registry::{WorkerLauncher, WorkerRegistry, WorkerRuntime};

/// Application state owned by one worker type.
pub trait WorkerState:
    Serialize + DeserializeOwned + Default + Clone + Send + Sync + 'static
{
    /// Bump when the serialized shape changes incompatibly.
    const SCHEMA_VERSION: u32 = 1;
}

/// Returned (wrapped in `anyhow`) by a hook to stop the worker instead of
/// replying with an error and carrying on.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct FatalWorkerError(pub String);

/// Lifecycle hooks of one worker type.
///
/// Hooks report failure by returning an error. A panic skips cleanup and the
/// final checkpoint, and release builds abort on panic.
#[async_trait]
pub trait WorkerHooks: Send {
    type State: WorkerState;

    async fn initialize(&mut self, _ctx: &WorkerContext, _state: &mut Self::State) -> Result<()> {
        Ok(())
    }

    async fn handle_message(
        &mut self,
        ctx: &WorkerContext,
        state: &mut Self::State,
        message: &InboundMessage,
    ) -> Result<()>;

    async fn periodic(&mut self, _ctx: &WorkerContext, _state: &mut Self::State) -> Result<()> {
        Ok(())
    }

    /// `None` disables `periodic`.
    fn periodic_interval(&self) -> Option<Duration> {
        None
    }

    async fn cleanup(&mut self, _ctx: &WorkerContext, _state: &mut Self::State) {}
}

/// Collaborators handed to every hook.
pub struct WorkerContext {
    pub agent_id: String,
    pub agent_type: String,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub status: Arc<dyn StatusReporter>,
    pub messaging: Messaging,
}

/// Stored form of a checkpoint. `cursor` is the last inbox entry consumed.
#[derive(Serialize, Deserialize)]
struct StateEnvelope<S> {
    schema_version: u32,
    #[serde(default)]
    cursor: u64,
    state: S,
}

impl WorkerContext {
    /// Load the last checkpoint and resume the inbox after its cursor.
    /// Missing or outdated state yields the default.
    pub async fn hydrate<S: WorkerState>(&self) -> Result<S> {
        let Some(blob) = self
            .checkpoints
            .get(&self.agent_id)
            .await
            .with_context(|| format!("Failed to load state for {}", self.agent_id))?
        else {
            info!("No stored state for {}, starting fresh", self.agent_id);
            return Ok(S::default());
        };

        let envelope: StateEnvelope<serde_json::Value> = serde_json::from_str(&blob)
            .with_context(|| format!("Stored state for {} is not a state envelope", self.agent_id))?;
        self.messaging.resume_after(envelope.cursor);
        if envelope.schema_version != S::SCHEMA_VERSION {
            warn!(
                "Ignoring stored state for {}: schema version {} (expected {})",
                self.agent_id,
                envelope.schema_version,
                S::SCHEMA_VERSION
            );
            return Ok(S::default());
        }
        let state = serde_json::from_value(envelope.state)
            .with_context(|| format!("Stored state for {} does not decode", self.agent_id))?;
        info!("State loaded for {}", self.agent_id);
        Ok(state)
    }

    pub async fn checkpoint<S: WorkerState>(&self, state: &S) -> Result<()> {
        let blob = serde_json::to_string(&StateEnvelope {
            schema_version: S::SCHEMA_VERSION,
            cursor: self.messaging.cursor(),
            state,
        })?;
        self.checkpoints.upsert(&self.agent_id, &blob).await
    }

    async fn checkpoint_logged<S: WorkerState>(&self, state: &S) {
        if let Err(e) = self.checkpoint(state).await {
            error!("Checkpoint for {} failed: {}", self.agent_id, e);
        }
    }

    /// Status reporting never fails the caller.
    pub async fn report_status(&self, report: StatusReport) {
        if let Err(e) = self.status.report(&self.agent_id, &report).await {
            warn!(
                "Failed to report {} status for {}: {}",
                report.phase.as_str(),
                self.agent_id,
                e
            );
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Stop after the first successfully handled message.
    pub run_once: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Shutdown,
    Completed,
    Failed(String),
}

enum LoopExit {
    Shutdown,
    Completed,
}

/// Drive `hooks` until shutdown, completion or a fatal error.
///
/// Cleanup runs on every exit path. The final checkpoint is written on every
/// exit path except a failed hydrate, where the stored state is left alone.
pub async fn run_worker<H: WorkerHooks>(
    ctx: &WorkerContext,
    hooks: &mut H,
    options: RunOptions,
    shutdown: CancellationToken,
) -> RunOutcome {
    info!("Starting worker {} ({})", ctx.agent_id, ctx.agent_type);

    let mut state = match ctx.hydrate::<H::State>().await {
        Ok(state) => state,
        Err(e) => {
            let reason = format!("{:#}", e);
            error!("Error in {}: {}", ctx.agent_id, reason);
            ctx.report_status(StatusReport::new(StatusPhase::Failed).with_message(reason.clone()))
                .await;
            hooks.cleanup(ctx, &mut <H::State as Default>::default()).await;
            return RunOutcome::Failed(reason);
        }
    };

    let outcome = match run_loop(ctx, hooks, &mut state, options, &shutdown).await {
        Ok(LoopExit::Shutdown) => {
            info!("Shutting down {}", ctx.agent_id);
            RunOutcome::Shutdown
        }
        Ok(LoopExit::Completed) => {
            info!("Worker {} completed", ctx.agent_id);
            ctx.report_status(StatusReport::new(StatusPhase::Completed))
                .await;
            RunOutcome::Completed
        }
        Err(e) => {
            let reason = format!("{:#}", e);
            error!("Error in {}: {}", ctx.agent_id, reason);
            ctx.report_status(StatusReport::new(StatusPhase::Failed).with_message(reason.clone()))
                .await;
            RunOutcome::Failed(reason)
        }
    };

    hooks.cleanup(ctx, &mut state).await;
    ctx.checkpoint_logged(&state).await;
    outcome
}

async fn run_loop<H: WorkerHooks>(
    ctx: &WorkerContext,
    hooks: &mut H,
    state: &mut H::State,
    options: RunOptions,
    shutdown: &CancellationToken,
) -> Result<LoopExit> {
    let snapshot = state.clone();
    if let Err(e) = hooks.initialize(ctx, state).await {
        *state = snapshot;
        return Err(e.context("initialize failed"));
    }
    ctx.report_status(StatusReport::new(StatusPhase::Running))
        .await;

    let interval = hooks.periodic_interval().filter(|d| !d.is_zero());
    let mut last_tick = Instant::now();
    info!("Worker {} waiting for messages on {}", ctx.agent_id, ctx.messaging.inbox());

    loop {
        if shutdown.is_cancelled() {
            return Ok(LoopExit::Shutdown);
        }

        if let Some(every) = interval
            && last_tick.elapsed() >= every
        {
            let snapshot = state.clone();
            if let Err(e) = hooks.periodic(ctx, state).await {
                *state = snapshot;
                return Err(e.context("periodic operation failed"));
            }
            last_tick = Instant::now();
            ctx.checkpoint_logged(state).await;
        }

        let received = tokio::select! {
            _ = shutdown.cancelled() => return Ok(LoopExit::Shutdown),
            received = next_message(ctx, interval.map(|every| every.saturating_sub(last_tick.elapsed()))) => received,
        };
        let Some(message) = received else {
            continue;
        };
        debug!(
            "Received message {} from {} ({})",
            message.id, message.sender, message.kind
        );

        let snapshot = state.clone();
        match hooks.handle_message(ctx, state, &message).await {
            Ok(()) => {
                ctx.checkpoint_logged(state).await;
                if options.run_once {
                    return Ok(LoopExit::Completed);
                }
            }
            Err(e) => {
                *state = snapshot;
                if e.downcast_ref::<FatalWorkerError>().is_some() {
                    return Err(e);
                }
                error!("Error processing message {}: {:#}", message.id, e);
                ctx.messaging
                    .reply(
                        &message,
                        json!({ "text": format!("Error processing message: {}", e) }),
                    )
                    .await;
            }
        }
    }
}

/// Unbounded receive, or bounded by the time left until the next tick.
async fn next_message(ctx: &WorkerContext, until_tick: Option<Duration>) -> Option<InboundMessage> {
    match until_tick {
        Some(wait) => ctx.messaging.receive_timeout(wait).await,
        None => Some(ctx.messaging.receive().await),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::messaging::{InMemoryBroker, LogBroker};
    use crate::core::store::SqliteStore;
    use anyhow::bail;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
    struct Tally {
        seen: Vec<String>,
        ticks: u32,
    }

    impl WorkerState for Tally {}

    #[derive(Default)]
    struct Counter {
        fail_on: Option<&'static str>,
        fatal_on: Option<&'static str>,
        tick_every: Option<Duration>,
        fail_initialize: bool,
        fail_periodic: bool,
        cleaned_up: Arc<AtomicBool>,
        initialized: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl WorkerHooks for Counter {
        type State = Tally;

        async fn initialize(&mut self, _ctx: &WorkerContext, _state: &mut Tally) -> Result<()> {
            self.initialized.fetch_add(1, Ordering::SeqCst);
            if self.fail_initialize {
                bail!("no model endpoint");
            }
            Ok(())
        }

        async fn handle_message(
            &mut self,
            ctx: &WorkerContext,
            state: &mut Tally,
            message: &InboundMessage,
        ) -> Result<()> {
            let text = message.text().unwrap_or_default().to_string();
            state.seen.push(text.clone());
            if self.fatal_on == Some(text.as_str()) {
                return Err(FatalWorkerError(format!("cannot continue after {text}")).into());
            }
            if self.fail_on == Some(text.as_str()) {
                bail!("bad input {}", text);
            }
            ctx.messaging
                .reply(message, json!({ "text": format!("ack {}", text) }))
                .await;
            Ok(())
        }

        async fn periodic(&mut self, _ctx: &WorkerContext, state: &mut Tally) -> Result<()> {
            state.ticks += 1;
            if self.fail_periodic {
                bail!("tick broke");
            }
            Ok(())
        }

        fn periodic_interval(&self) -> Option<Duration> {
            self.tick_every
        }

        async fn cleanup(&mut self, _ctx: &WorkerContext, _state: &mut Tally) {
            self.cleaned_up.store(true, Ordering::SeqCst);
        }
    }

    struct Harness {
        store: Arc<SqliteStore>,
        broker: Arc<InMemoryBroker>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                store: Arc::new(SqliteStore::open_in_memory().unwrap()),
                broker: Arc::new(InMemoryBroker::new()),
            }
        }

        fn context(&self) -> WorkerContext {
            WorkerContext {
                agent_id: "w1".into(),
                agent_type: "counter".into(),
                checkpoints: self.store.clone(),
                status: self.store.clone(),
                messaging: Messaging::new(self.broker.clone(), "counter", "w1"),
            }
        }

        async fn push(&self, id: &str, text: &str) {
            let msg = InboundMessage::new(id, "u1", "message", json!({ "text": text }));
            self.broker
                .append("agent:counter:w1:inbox", &serde_json::to_string(&msg).unwrap())
                .await
                .unwrap();
        }

        async fn replies(&self) -> Vec<InboundMessage> {
            self.broker
                .entries("agent:u1:inbox")
                .await
                .iter()
                .map(|e| serde_json::from_str(&e.data).unwrap())
                .collect()
        }

        async fn stored(&self) -> Option<Tally> {
            let ctx = self.context();
            self.store.get("w1").await.unwrap()?;
            Some(ctx.hydrate::<Tally>().await.unwrap())
        }

        async fn wait_for_replies(&self, count: usize) -> Vec<InboundMessage> {
            for _ in 0..200 {
                let replies = self.replies().await;
                if replies.len() >= count {
                    return replies;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            panic!("timed out waiting for {count} replies");
        }
    }

    #[tokio::test]
    async fn missing_checkpoint_hydrates_default() {
        let h = Harness::new();
        let state: Tally = h.context().hydrate().await.unwrap();
        assert_eq!(state, Tally::default());
    }

    #[tokio::test]
    async fn outdated_schema_version_falls_back_to_default() {
        let h = Harness::new();
        h.store
            .upsert("w1", r#"{"schema_version":99,"state":{"seen":["old"],"ticks":3}}"#)
            .await
            .unwrap();
        let state: Tally = h.context().hydrate().await.unwrap();
        assert_eq!(state, Tally::default());
    }

    #[tokio::test]
    async fn run_once_handles_one_message_and_completes() {
        let h = Harness::new();
        h.push("m1", "hi").await;
        h.push("m2", "ignored").await;
        let ctx = h.context();
        let mut hooks = Counter::default();

        let outcome = run_worker(
            &ctx,
            &mut hooks,
            RunOptions { run_once: true },
            CancellationToken::new(),
        )
        .await;

        assert_eq!(outcome, RunOutcome::Completed);
        assert_eq!(h.stored().await.unwrap().seen, vec!["hi".to_string()]);
        assert_eq!(h.store.get_status("w1").await.unwrap().unwrap().phase, "completed");
        assert!(hooks.cleaned_up.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn restart_resumes_after_last_handled_message() {
        let h = Harness::new();
        h.push("m1", "first").await;
        h.push("m2", "second").await;

        for _ in 0..2 {
            let ctx = h.context();
            let outcome = run_worker(
                &ctx,
                &mut Counter::default(),
                RunOptions { run_once: true },
                CancellationToken::new(),
            )
            .await;
            assert_eq!(outcome, RunOutcome::Completed);
        }

        assert_eq!(
            h.stored().await.unwrap().seen,
            vec!["first".to_string(), "second".to_string()]
        );
        let replies = h.replies().await;
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[1].payload, json!({ "text": "ack second" }));
    }

    #[tokio::test]
    async fn handler_error_replies_and_loop_continues() {
        let h = Harness::new();
        h.push("m1", "bad").await;
        h.push("m2", "good").await;
        let ctx = h.context();
        let shutdown = CancellationToken::new();
        let mut hooks = Counter {
            fail_on: Some("bad"),
            ..Default::default()
        };

        let stop = shutdown.clone();
        let run = async { run_worker(&ctx, &mut hooks, RunOptions::default(), shutdown).await };
        let watch = async {
            let replies = h.wait_for_replies(2).await;
            stop.cancel();
            replies
        };
        let (outcome, replies) = tokio::join!(run, watch);

        assert_eq!(outcome, RunOutcome::Shutdown);
        assert_eq!(
            replies[0].payload,
            json!({ "text": "Error processing message: bad input bad" })
        );
        assert_eq!(replies[0].reply_to.as_deref(), Some("m1"));
        assert_eq!(replies[1].payload, json!({ "text": "ack good" }));
        // the failed message leaves no trace in the committed state
        assert_eq!(h.stored().await.unwrap().seen, vec!["good".to_string()]);
    }

    #[tokio::test]
    async fn fatal_error_reports_failed_and_keeps_prior_state() {
        let h = Harness::new();
        h.push("m1", "one").await;
        h.push("m2", "two").await;
        h.push("m3", "explode").await;
        let ctx = h.context();
        let mut hooks = Counter {
            fatal_on: Some("explode"),
            ..Default::default()
        };

        let outcome = run_worker(
            &ctx,
            &mut hooks,
            RunOptions::default(),
            CancellationToken::new(),
        )
        .await;

        match outcome {
            RunOutcome::Failed(reason) => assert!(reason.contains("cannot continue after explode")),
            other => panic!("unexpected outcome {other:?}"),
        }
        let status = h.store.get_status("w1").await.unwrap().unwrap();
        assert_eq!(status.phase, "failed");
        assert!(status.message.unwrap().contains("explode"));
        assert!(hooks.cleaned_up.load(Ordering::SeqCst));
        assert_eq!(
            h.stored().await.unwrap().seen,
            vec!["one".to_string(), "two".to_string()]
        );
    }

    #[tokio::test]
    async fn shutdown_interrupts_blocking_receive() {
        let h = Harness::new();
        let ctx = h.context();
        let shutdown = CancellationToken::new();
        let mut hooks = Counter::default();

        let stop = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            stop.cancel();
        });
        let outcome = tokio::time::timeout(
            Duration::from_secs(2),
            run_worker(&ctx, &mut hooks, RunOptions::default(), shutdown),
        )
        .await
        .unwrap();

        assert_eq!(outcome, RunOutcome::Shutdown);
        assert!(hooks.cleaned_up.load(Ordering::SeqCst));
        assert_eq!(hooks.initialized.load(Ordering::SeqCst), 1);
        assert_eq!(h.store.get_status("w1").await.unwrap().unwrap().phase, "running");
        assert_eq!(h.stored().await, Some(Tally::default()));
    }

    #[tokio::test]
    async fn periodic_ticks_while_inbox_is_idle() {
        let h = Harness::new();
        let ctx = h.context();
        let shutdown = CancellationToken::new();
        let mut hooks = Counter {
            tick_every: Some(Duration::from_millis(10)),
            ..Default::default()
        };

        let stop = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(80)).await;
            stop.cancel();
        });
        let outcome = run_worker(&ctx, &mut hooks, RunOptions::default(), shutdown).await;

        assert_eq!(outcome, RunOutcome::Shutdown);
        assert!(h.stored().await.unwrap().ticks >= 2);
    }

    #[tokio::test]
    async fn initialize_error_is_fatal() {
        let h = Harness::new();
        h.push("m1", "never handled").await;
        let ctx = h.context();
        let mut hooks = Counter {
            fail_initialize: true,
            ..Default::default()
        };

        let outcome = run_worker(
            &ctx,
            &mut hooks,
            RunOptions::default(),
            CancellationToken::new(),
        )
        .await;

        match outcome {
            RunOutcome::Failed(reason) => {
                assert_eq!(reason, "initialize failed: no model endpoint")
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        let status = h.store.get_status("w1").await.unwrap().unwrap();
        assert_eq!(status.phase, "failed");
        assert!(hooks.cleaned_up.load(Ordering::SeqCst));
        assert_eq!(h.stored().await, Some(Tally::default()));
        assert!(h.replies().await.is_empty());
    }

    #[tokio::test]
    async fn periodic_error_is_fatal_and_rolls_back_the_tick() {
        let h = Harness::new();
        h.push("m1", "hi").await;
        let ctx = h.context();
        let mut hooks = Counter {
            tick_every: Some(Duration::from_millis(20)),
            fail_periodic: true,
            ..Default::default()
        };

        let outcome = tokio::time::timeout(
            Duration::from_secs(2),
            run_worker(&ctx, &mut hooks, RunOptions::default(), CancellationToken::new()),
        )
        .await
        .unwrap();

        match outcome {
            RunOutcome::Failed(reason) => {
                assert_eq!(reason, "periodic operation failed: tick broke")
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        let status = h.store.get_status("w1").await.unwrap().unwrap();
        assert_eq!(status.phase, "failed");
        assert!(hooks.cleaned_up.load(Ordering::SeqCst));
        let stored = h.stored().await.unwrap();
        assert_eq!(stored.seen, vec!["hi".to_string()]);
        assert_eq!(stored.ticks, 0);
    }

    #[tokio::test]
    async fn unreadable_checkpoint_is_fatal_and_left_untouched() {
        let h = Harness::new();
        h.store.upsert("w1", "garbage").await.unwrap();
        let ctx = h.context();
        let mut hooks = Counter::default();

        let outcome = run_worker(
            &ctx,
            &mut hooks,
            RunOptions::default(),
            CancellationToken::new(),
        )
        .await;

        assert!(matches!(outcome, RunOutcome::Failed(_)));
        assert_eq!(hooks.initialized.load(Ordering::SeqCst), 0);
        assert!(hooks.cleaned_up.load(Ordering::SeqCst));
        assert_eq!(h.store.get("w1").await.unwrap().as_deref(), Some("garbage"));
    }
}
