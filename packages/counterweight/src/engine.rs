//! Counterweight Engine - optimistic apply, side effect, commit or compensate.
//!
//! The Engine runs one interaction definition at a time per identity:
//!
//! ```text
//! execute(def) → admit → discover participants → capture snapshot
//!     → apply_optimistic (fan-out) → side effect (under timeout)
//!     → commit (fan-out) | rollback (fan-out) → emit result
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use counterweight::{Engine, ExecuteOptions, InteractionDefinition};
//!
//! let engine = Engine::builder()
//!     .with_config(EngineConfig::from_env()?)
//!     .with_participant(LikeCounter::default())
//!     .with_executor(LikeApi::new(client))
//!     .build();
//!
//! let like = InteractionDefinition::builder("like-post")
//!     .payload(Payload::encode(&LikePost { post_id: 7 })?)
//!     .timeout(Duration::from_secs(5))
//!     .build()?;
//!
//! let result = engine.execute(like, ExecuteOptions::default()).await?;
//! if result.is_rollback() {
//!     // the like counter has already been undone
//! }
//! ```
//!
//! # Deferred Commit
//!
//! With [`ExecuteOptions::defer_commit`] a successful optimistic run keeps
//! its snapshot and does not commit. The caller finalizes it later with
//! [`Engine::confirm_success`] or [`Engine::rollback`]. Unless auto-expiry
//! is switched off, a timer rolls the run back once its timeout elapses
//! without confirmation. Rolling back a run whose side effect already
//! happened submits the definition's compensating interaction, if any.
//!
//! ```ignore
//! let result = engine
//!     .execute(upload, ExecuteOptions::new().defer_commit(true))
//!     .await?;
//! let cid = result.correlation_id().cloned().unwrap();
//!
//! if user_kept_the_upload {
//!     engine.confirm_success(&cid).await;
//! } else {
//!     engine.rollback(&cid).await;
//! }
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::ResultBus;
use crate::config::EngineConfig;
use crate::core::{CorrelationId, Run, RunPhase};
use crate::definition::InteractionDefinition;
use crate::error::{BatchReport, EngineError, FanOutPhase};
use crate::fanout::{capture_states, fan_out, guarded};
use crate::participant::{Participant, SideEffectExecutor};
use crate::queue::{AdmissionTicket, ExecutionQueue, QueueStrategy};
use crate::registry::Registry;
use crate::result::{
    InteractionResult, METADATA_APPLY_FAILURES, METADATA_COMMIT_FAILURES, METADATA_IDENTITY,
    METADATA_PHASE,
};
use crate::snapshot::{RemovedSnapshot, RunClaim, Snapshot, SnapshotPhase, SnapshotStore};
use crate::timer::ExpiryTimer;

// =============================================================================
// Execute Options
// =============================================================================

/// Per-call overrides for [`Engine::execute`].
#[derive(Clone)]
pub struct ExecuteOptions {
    /// Overrides the definition's optimistic flag.
    pub optimistic: Option<bool>,
    /// Overrides the definition's timeout.
    pub timeout: Option<Duration>,
    /// Arm an expiry timer for deferred commits. Default `true`.
    pub auto_expire: bool,
    /// Keep the snapshot after a successful side effect and wait for
    /// confirmation instead of committing. Default `false`.
    pub defer_commit: bool,
    participants: Option<Vec<Arc<dyn Participant>>>,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            optimistic: None,
            timeout: None,
            auto_expire: true,
            defer_commit: false,
            participants: None,
        }
    }
}

impl ExecuteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn optimistic(mut self, optimistic: bool) -> Self {
        self.optimistic = Some(optimistic);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn auto_expire(mut self, auto_expire: bool) -> Self {
        self.auto_expire = auto_expire;
        self
    }

    pub fn defer_commit(mut self, defer_commit: bool) -> Self {
        self.defer_commit = defer_commit;
        self
    }

    /// Use an externally resolved participant list instead of the registry.
    ///
    /// Participants are still filtered by `can_handle`.
    pub fn with_participants<I>(mut self, participants: I) -> Self
    where
        I: IntoIterator<Item = Arc<dyn Participant>>,
    {
        self.participants = Some(participants.into_iter().collect());
        self
    }
}

impl std::fmt::Debug for ExecuteOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecuteOptions")
            .field("optimistic", &self.optimistic)
            .field("timeout", &self.timeout)
            .field("auto_expire", &self.auto_expire)
            .field("defer_commit", &self.defer_commit)
            .field(
                "participants",
                &self.participants.as_ref().map(|ps| {
                    ps.iter()
                        .map(|p| p.handler_id().to_string())
                        .collect::<Vec<_>>()
                }),
            )
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RollbackReason {
    SideEffect,
    Manual,
    Expired,
}

impl RollbackReason {
    fn as_str(&self) -> &'static str {
        match self {
            RollbackReason::SideEffect => "side_effect",
            RollbackReason::Manual => "manual",
            RollbackReason::Expired => "expired",
        }
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Interaction execution engine.
///
/// Cheap to clone; clones share the same registry, snapshot store, queue
/// and result bus. Construct one per process (or per test) and pass it to
/// call sites.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: EngineConfig,
    registry: Registry,
    snapshots: SnapshotStore,
    queue: Arc<ExecutionQueue>,
    bus: ResultBus,
    shutdown: CancellationToken,
    disposed: AtomicBool,
    sequence: AtomicU64,
}

impl Engine {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                registry: Registry::new(),
                snapshots: SnapshotStore::new(config.snapshot_capacity),
                queue: Arc::new(ExecutionQueue::new(config.queue_strategy)),
                bus: ResultBus::with_capacity(config.result_channel_capacity),
                shutdown: CancellationToken::new(),
                disposed: AtomicBool::new(false),
                sequence: AtomicU64::new(0),
                config,
            }),
        }
    }

    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    // -------------------------------------------------------------------------
    // Registration
    // -------------------------------------------------------------------------

    /// Register a participant, replacing any participant with the same id.
    ///
    /// Returns true if an existing registration was replaced.
    pub fn register_participant<P: Participant>(&self, participant: P) -> bool {
        self.register_shared_participant(Arc::new(participant))
    }

    pub fn register_shared_participant(&self, participant: Arc<dyn Participant>) -> bool {
        self.inner.registry.register(participant)
    }

    pub fn unregister_participant(&self, handler_id: &str) -> bool {
        self.inner.registry.unregister(handler_id)
    }

    /// Remove every participant. Global executors stay registered.
    pub fn unregister_all(&self) {
        self.inner.registry.clear_participants();
    }

    /// Register a global side-effect executor. Executors are tried in
    /// registration order.
    pub fn register_executor<E: SideEffectExecutor>(&self, executor: E) {
        self.inner.registry.register_executor(Arc::new(executor));
    }

    // -------------------------------------------------------------------------
    // Execution
    // -------------------------------------------------------------------------

    /// Run a definition to completion.
    ///
    /// Admission errors (duplicate in-flight identity, disposed engine) and
    /// invalid definitions are returned as `Err` without touching any
    /// participant. Side-effect failures and timeouts are an `Ok` result with
    /// `success == false`.
    ///
    /// The run executes on its own task, so dropping the returned future does
    /// not interrupt a fan-out halfway.
    pub async fn execute(
        &self,
        definition: InteractionDefinition,
        options: ExecuteOptions,
    ) -> Result<InteractionResult, EngineError> {
        if self.is_disposed() {
            return Err(EngineError::Disposed);
        }
        if !definition.validate() {
            return Err(EngineError::InvalidDefinition {
                errors: definition.validation_errors(),
            });
        }

        let ticket = self.inner.queue.admit(definition.id())?;
        let identity = definition.id().to_string();
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(inner.run(ticket, definition, options));

        match task.await {
            Ok(outcome) => outcome,
            Err(join_error) => {
                error!(identity = %identity, error = %join_error, "run task failed");
                let result = InteractionResult::failure(format!("run failed: {}", join_error))
                    .with_metadata(METADATA_IDENTITY, Value::String(identity));
                // subscribers see every run, including one that never finished
                self.inner.bus.emit(result.clone());
                Ok(result)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Manual Control
    // -------------------------------------------------------------------------

    /// Roll back an outstanding run out of band.
    ///
    /// Returns true only if the snapshot existed and every targeted
    /// participant rolled back successfully.
    pub async fn rollback(&self, cid: &CorrelationId) -> bool {
        self.rollback_report(cid)
            .await
            .map(|report| report.is_complete())
            .unwrap_or(false)
    }

    /// Roll back an outstanding run and return the per-participant outcome.
    ///
    /// A run still dispatching its optimistic apply is rolled back once the
    /// apply settles, and its side effect is skipped. Returns `None` if no
    /// snapshot exists for `cid` or the run applied nothing optimistically.
    pub async fn rollback_report(&self, cid: &CorrelationId) -> Option<BatchReport> {
        let mut removed = self.inner.snapshots.take_out_of_band(cid).await?;
        if let Some(timer) = removed.expiry.take() {
            timer.disarm();
        }
        info!(%cid, phase = ?removed.snapshot.phase, "manual rollback requested");

        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            inner
                .rollback_out_of_band(removed, RollbackReason::Manual)
                .await
        });
        match task.await {
            Ok(report) => Some(report),
            Err(join_error) => {
                error!(%cid, error = %join_error, "manual rollback task failed");
                None
            }
        }
    }

    /// Confirm a deferred run: commit it, disarm its expiry and drop the
    /// snapshot.
    ///
    /// Returns false if `cid` is not awaiting confirmation.
    pub async fn confirm_success(&self, cid: &CorrelationId) -> bool {
        self.confirm_report(cid).await.is_some()
    }

    /// Confirm a deferred run and return the commit outcome.
    pub async fn confirm_report(&self, cid: &CorrelationId) -> Option<BatchReport> {
        let mut removed = self.inner.snapshots.take_awaiting(cid)?;
        if let Some(timer) = removed.expiry.take() {
            timer.disarm();
        }
        info!(%cid, "confirming deferred run");

        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move { inner.confirm(removed).await });
        match task.await {
            Ok(report) => Some(report),
            Err(join_error) => {
                error!(%cid, error = %join_error, "confirmation task failed");
                None
            }
        }
    }

    // -------------------------------------------------------------------------
    // Observability
    // -------------------------------------------------------------------------

    /// Subscribe to every result the engine emits from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<InteractionResult> {
        self.inner.bus.subscribe()
    }

    /// Results as a `Stream`. Ends when the engine is disposed.
    pub fn result_stream(&self) -> impl Stream<Item = InteractionResult> + Send + 'static {
        self.inner.bus.stream()
    }

    /// Number of outstanding snapshots.
    pub fn pending_count(&self) -> usize {
        self.inner.snapshots.len()
    }

    /// Correlation ids with an outstanding snapshot, oldest first.
    pub fn pending_ids(&self) -> Vec<CorrelationId> {
        self.inner.snapshots.ids()
    }

    pub fn is_pending(&self, cid: &CorrelationId) -> bool {
        self.inner.snapshots.contains(cid)
    }

    pub fn snapshot(&self, cid: &CorrelationId) -> Option<Snapshot> {
        self.inner.snapshots.get(cid)
    }

    pub fn has_expiry(&self, cid: &CorrelationId) -> bool {
        self.inner.snapshots.has_timer(cid)
    }

    pub fn snapshot_capacity(&self) -> usize {
        self.inner.snapshots.capacity()
    }

    /// Runs admitted and not yet finished, including those waiting for a lane.
    pub fn queued_count(&self) -> usize {
        self.inner.queue.queued_count()
    }

    /// Whether a run of `identity` is currently admitted.
    pub fn is_processing(&self, identity: &str) -> bool {
        self.inner.queue.is_processing(identity)
    }

    pub fn queue_strategy(&self) -> QueueStrategy {
        self.inner.queue.strategy()
    }

    pub fn participant_count(&self) -> usize {
        self.inner.registry.participant_count()
    }

    pub fn executor_count(&self) -> usize {
        self.inner.registry.executor_count()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    // -------------------------------------------------------------------------
    // Disposal
    // -------------------------------------------------------------------------

    /// Tear the engine down. Idempotent.
    ///
    /// New submissions fail with [`EngineError::Disposed`], runs in flight or
    /// waiting for a lane end with the same error, all expiry timers are
    /// cancelled, snapshots and registrations are dropped and the result bus
    /// is closed.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.queue.close();
        self.inner.shutdown.cancel();
        let dropped = self.inner.snapshots.close();
        self.inner.registry.clear();
        self.inner.bus.close();
        info!(dropped_snapshots = dropped, "engine disposed");
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("participants", &self.participant_count())
            .field("executors", &self.executor_count())
            .field("pending", &self.pending_count())
            .field("queue", &self.inner.queue)
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Orchestration
// =============================================================================

impl EngineInner {
    async fn run(
        self: Arc<Self>,
        mut ticket: AdmissionTicket,
        definition: InteractionDefinition,
        options: ExecuteOptions,
    ) -> Result<InteractionResult, EngineError> {
        let shutdown = self.shutdown.clone();
        let identity = ticket.identity().to_string();

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                warn!(identity = %identity, "run cancelled by engine disposal");
                Err(EngineError::Disposed)
            }
            outcome = async {
                ticket.wait_turn().await?;
                Ok::<_, EngineError>(self.orchestrate(definition, options).await)
            } => outcome,
        }
    }

    async fn orchestrate(
        self: &Arc<Self>,
        definition: InteractionDefinition,
        options: ExecuteOptions,
    ) -> InteractionResult {
        let created_at = Utc::now();
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let mut run = Run::new(definition, created_at, sequence);
        let timeout = options
            .timeout
            .unwrap_or_else(|| run.definition.timeout_or(self.config.default_timeout));
        info!(cid = %run.cid, identity = %run.definition.id(), "run admitted");

        run.participants = match options.participants {
            Some(hinted) => hinted
                .into_iter()
                .filter(|p| p.can_handle(&run.definition))
                .collect(),
            None => self.registry.discover(&run.definition),
        };
        run.advance(RunPhase::ParticipantsDiscovered);
        debug!(cid = %run.cid, participants = ?run.handler_ids(), "participants discovered");

        if run.participants.is_empty() {
            let result = self.side_effect(&run, timeout).await;
            run.advance(RunPhase::ApiOnlyExecuted);
            return self.finish(run, result);
        }

        let mut optimistic = options
            .optimistic
            .unwrap_or_else(|| run.definition.supports_optimistic());
        let states = capture_states(&run.participants, &run.cid);
        let snapshot = Snapshot::new(run.cid.clone(), run.definition.clone(), states, created_at);
        let evicted = self.snapshots.insert(snapshot, run.participants.clone());
        if !evicted.is_empty() {
            debug!(cid = %run.cid, evicted = evicted.len(), "older snapshots evicted");
        }
        run.advance(RunPhase::SnapshotCaptured);

        if optimistic && !self.snapshots.begin_apply(&run.cid, run.handler_ids()) {
            // Evicted before anything was applied.
            debug!(cid = %run.cid, "snapshot gone before optimistic apply, skipping apply");
            optimistic = false;
        }

        let mut apply_report = None;
        if optimistic {
            let report = fan_out(
                FanOutPhase::ApplyOptimistic,
                &run.participants,
                &run.cid,
                &run.definition,
            )
            .await;
            if self.snapshots.finish_apply(&run.cid) {
                debug!(cid = %run.cid, "snapshot handed to a waiting manual rollback");
            }
            if report.is_partial() {
                warn!(cid = %run.cid, report = %report, "optimistic apply partially failed");
            }
            run.advance(RunPhase::OptimisticApplied);
            apply_report = Some(report);
        }

        let mut result = if self.snapshots.is_claimed(&run.cid) {
            info!(cid = %run.cid, "run rolled back manually before its side effect, skipping it");
            InteractionResult::failure("rolled back before the side effect ran")
        } else {
            let result = self.side_effect(&run, timeout).await;
            run.advance(RunPhase::SideEffectExecuted);
            result
        };
        if let Some(report) = &apply_report {
            result = result.with_failures(METADATA_APPLY_FAILURES, report);
        }

        if optimistic && options.defer_commit && result.is_success() {
            if self
                .snapshots
                .set_phase(&run.cid, SnapshotPhase::AwaitingConfirmation)
            {
                run.advance(RunPhase::AwaitingConfirmation);
                if options.auto_expire && self.arm_expiry(&run.cid, timeout) {
                    run.advance(RunPhase::ExpiryArmed);
                }
                return self.finish(run, result);
            }
            debug!(cid = %run.cid, "snapshot gone before commit could be deferred");
        }

        let result = match self.snapshots.take_for_run(&run.cid) {
            RunClaim::Owned(removed) => {
                let rollback_targets = removed.applied_participants();
                self.settle(&mut run, result, optimistic, rollback_targets)
                    .await
            }
            RunClaim::Missing => {
                warn!(cid = %run.cid, "snapshot was evicted mid-run, settling from the run record");
                let rollback_targets = if optimistic {
                    run.participants.clone()
                } else {
                    Vec::new()
                };
                self.settle(&mut run, result, optimistic, rollback_targets)
                    .await
            }
            RunClaim::Claimed => {
                info!(cid = %run.cid, "run was rolled back manually while in flight");
                if result.is_success() {
                    // the side effect landed before the claim
                    self.submit_compensation(&run.definition, &run.cid);
                }
                run.advance(RunPhase::RolledBack);
                result.with_rollback(
                    &BatchReport::new(FanOutPhase::Rollback),
                    RollbackReason::Manual.as_str(),
                )
            }
        };

        self.finish(run, result)
    }

    /// Commit on success, roll back an optimistic run on failure.
    async fn settle(
        &self,
        run: &mut Run,
        result: InteractionResult,
        optimistic: bool,
        rollback_targets: Vec<Arc<dyn Participant>>,
    ) -> InteractionResult {
        if result.is_success() {
            let report = fan_out(
                FanOutPhase::Commit,
                &run.participants,
                &run.cid,
                &run.definition,
            )
            .await;
            if report.is_partial() {
                warn!(cid = %run.cid, report = %report, "commit partially failed");
            }
            run.advance(RunPhase::Committed);
            return result.with_failures(METADATA_COMMIT_FAILURES, &report);
        }

        if !optimistic {
            // nothing was applied speculatively, so there is nothing to undo
            return result;
        }

        error!(
            cid = %run.cid,
            error = result.error().unwrap_or("unknown"),
            "side effect failed, rolling back"
        );
        let report = fan_out(
            FanOutPhase::Rollback,
            &rollback_targets,
            &run.cid,
            &run.definition,
        )
        .await;
        if report.is_partial() {
            warn!(cid = %run.cid, report = %report, "rollback partially failed");
        }
        run.advance(RunPhase::RolledBack);
        result.with_rollback(&report, RollbackReason::SideEffect.as_str())
    }

    /// Run the side effect on its own task under `timeout`.
    ///
    /// A timed-out side effect is not aborted; its eventual outcome is
    /// ignored.
    async fn side_effect(&self, run: &Run, timeout: Duration) -> InteractionResult {
        let participants = run.participants.clone();
        let executors = self.registry.executors();
        let definition = run.definition.clone();
        let cid = run.cid.clone();

        let task = tokio::spawn(async move {
            perform_side_effect(&cid, &definition, &participants, &executors).await
        });

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => {
                error!(cid = %run.cid, error = %join_error, "side effect task failed");
                InteractionResult::failure(format!("side effect task failed: {}", join_error))
            }
            Err(_) => {
                warn!(cid = %run.cid, ?timeout, "side effect timed out");
                InteractionResult::timed_out(timeout)
            }
        }
    }

    fn finish(&self, mut run: Run, result: InteractionResult) -> InteractionResult {
        let phase = run.phase();
        let finalized = phase.is_terminal();
        if !finalized {
            debug!(cid = %run.cid, phase = %phase, "run returns with finalization outstanding");
        }
        run.advance(RunPhase::Done);
        debug!(cid = %run.cid, history = ?run.history(), "run phase history");

        let result = result
            .with_correlation(run.cid.clone())
            .with_metadata(METADATA_PHASE, Value::String(phase.as_str().to_string()));
        let delivered = self.bus.emit(result.clone());
        info!(
            cid = %run.cid,
            identity = %run.definition.id(),
            success = result.is_success(),
            phase = %phase,
            finalized,
            delivered,
            "run finished"
        );
        result
    }

    // -------------------------------------------------------------------------
    // Deferred finalization
    // -------------------------------------------------------------------------

    fn arm_expiry(self: &Arc<Self>, cid: &CorrelationId, after: Duration) -> bool {
        let engine = Arc::downgrade(self);
        let expiring = cid.clone();
        let timer = ExpiryTimer::arm(after, move || async move {
            if let Some(inner) = engine.upgrade() {
                inner.expire(expiring).await;
            }
        });
        debug!(%cid, deadline = ?timer.deadline(), "expiry armed");
        self.snapshots.arm(cid, timer)
    }

    async fn expire(self: Arc<Self>, cid: CorrelationId) {
        let Some(mut removed) = self.snapshots.take_out_of_band(&cid).await else {
            debug!(%cid, "expiry fired for a run that was already finalized");
            return;
        };
        // This task is the timer; dropping its handle would abort us.
        if let Some(timer) = removed.expiry.take() {
            timer.defuse();
        }
        info!(%cid, "confirmation deadline passed, rolling back");
        self.rollback_out_of_band(removed, RollbackReason::Expired)
            .await;
    }

    async fn rollback_out_of_band(
        self: &Arc<Self>,
        removed: RemovedSnapshot,
        reason: RollbackReason,
    ) -> BatchReport {
        let cid = removed.snapshot.correlation_id.clone();
        let targets = removed.applied_participants();
        let report = fan_out(
            FanOutPhase::Rollback,
            &targets,
            &cid,
            &removed.snapshot.definition,
        )
        .await;
        if report.is_partial() {
            warn!(%cid, report = %report, "rollback partially failed");
        }

        // An in-flight run reports the rollback in its own result.
        if removed.snapshot.phase == SnapshotPhase::AwaitingConfirmation {
            let (phase, message) = match reason {
                RollbackReason::Expired => (
                    RunPhase::ExpiredRollback,
                    "confirmation deadline expired",
                ),
                _ => (RunPhase::RolledBack, "rolled back before confirmation"),
            };
            let result = InteractionResult::failure(message)
                .with_correlation(cid.clone())
                .with_rollback(&report, reason.as_str())
                .with_metadata(METADATA_PHASE, Value::String(phase.as_str().to_string()));
            self.bus.emit(result);
            self.submit_compensation(&removed.snapshot.definition, &cid);
        }

        report
    }

    async fn confirm(self: Arc<Self>, removed: RemovedSnapshot) -> BatchReport {
        let cid = removed.snapshot.correlation_id.clone();
        let targets = removed.applied_participants();
        let report = fan_out(
            FanOutPhase::Commit,
            &targets,
            &cid,
            &removed.snapshot.definition,
        )
        .await;
        if report.is_partial() {
            warn!(%cid, report = %report, "commit partially failed");
        }

        let result = InteractionResult::success(None)
            .with_correlation(cid.clone())
            .with_failures(METADATA_COMMIT_FAILURES, &report)
            .with_metadata(
                METADATA_PHASE,
                Value::String(RunPhase::Confirmed.as_str().to_string()),
            );
        let delivered = self.bus.emit(result);
        info!(%cid, delivered, "deferred run confirmed");
        report
    }

    /// Submit the compensating interaction of a rolled back run in the
    /// background, as a non-optimistic run.
    fn submit_compensation(self: &Arc<Self>, definition: &InteractionDefinition, cid: &CorrelationId) {
        let Some(compensation) = definition.compensation().cloned() else {
            return;
        };
        if self.disposed.load(Ordering::Acquire) {
            warn!(%cid, "engine disposed, dropping compensating interaction");
            return;
        }

        info!(%cid, compensation = %compensation.id(), "submitting compensating interaction");
        let engine = Engine {
            inner: Arc::clone(self),
        };
        let origin = cid.clone();
        tokio::spawn(async move {
            match engine
                .execute(compensation, ExecuteOptions::new().optimistic(false))
                .await
            {
                Ok(result) => {
                    debug!(cid = %origin, success = result.is_success(), "compensation finished")
                }
                Err(e) => warn!(cid = %origin, error = %e, "compensation was not admitted"),
            }
        });
    }
}

/// First participant that performs the side effect wins; otherwise the
/// global executors are tried in order until one does not fail.
async fn perform_side_effect(
    cid: &CorrelationId,
    definition: &InteractionDefinition,
    participants: &[Arc<dyn Participant>],
    executors: &[Arc<dyn SideEffectExecutor>],
) -> InteractionResult {
    for participant in participants {
        match guarded(participant.execute(definition)).await {
            Ok(Some(result)) => {
                debug!(%cid, handler_id = participant.handler_id(), "participant performed the side effect");
                return result;
            }
            Ok(None) => {}
            Err(e) => {
                error!(%cid, handler_id = participant.handler_id(), error = %e, "participant side effect failed");
                return InteractionResult::failure(format!("{:#}", e));
            }
        }
    }

    let mut last_error = None;
    for (index, executor) in executors.iter().enumerate() {
        match guarded(executor.execute(definition)).await {
            Ok(result) => return result,
            Err(e) => {
                warn!(%cid, executor = index, error = %e, "global executor failed, trying next");
                last_error = Some(e);
            }
        }
    }

    match last_error {
        Some(e) => InteractionResult::failure(format!("all executors failed: {:#}", e)),
        None => InteractionResult::failure("no participant or executor performed the side effect"),
    }
}

// =============================================================================
// Engine Builder
// =============================================================================

/// Builder for constructing an Engine with participants and executors.
///
/// # Example
///
/// ```ignore
/// let engine = Engine::builder()
///     .with_config(EngineConfig::default().with_snapshot_capacity(500))
///     .with_participant(CartParticipant::new(cart))
///     .with_participant(BadgeParticipant::new(badge))
///     .with_executor(FnExecutor::new(|def: InteractionDefinition| async move {
///         api.send(def.payload()).await
///     }))
///     .build();
/// ```
#[derive(Default)]
pub struct EngineBuilder {
    config: EngineConfig,
    participants: Vec<Arc<dyn Participant>>,
    executors: Vec<Arc<dyn SideEffectExecutor>>,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a participant. Later registrations with the same handler id
    /// replace earlier ones.
    pub fn with_participant<P: Participant>(mut self, participant: P) -> Self {
        self.participants.push(Arc::new(participant));
        self
    }

    pub fn with_shared_participant(mut self, participant: Arc<dyn Participant>) -> Self {
        self.participants.push(participant);
        self
    }

    /// Register a global executor. Executors are tried in registration order.
    pub fn with_executor<E: SideEffectExecutor>(mut self, executor: E) -> Self {
        self.executors.push(Arc::new(executor));
        self
    }

    pub fn build(self) -> Engine {
        let engine = Engine::with_config(self.config);
        for participant in self.participants {
            engine.inner.registry.register(participant);
        }
        for executor in self.executors {
            engine.inner.registry.register_executor(executor);
        }
        engine
    }
}

impl std::fmt::Debug for EngineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineBuilder")
            .field("config", &self.config)
            .field("participants", &self.participants.len())
            .field("executors", &self.executors.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::Payload;
    use crate::participant::FnExecutor;
    use crate::result::METADATA_ROLLBACK_FAILURES;
    use crate::testing::{shared_latch, ExecuteBehavior, ParticipantCall, RecordingParticipant};
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::broadcast::error::RecvError;

    fn def(id: &str) -> InteractionDefinition {
        InteractionDefinition::builder(id).build().unwrap()
    }

    fn timed_def(id: &str, timeout: Duration) -> InteractionDefinition {
        InteractionDefinition::builder(id)
            .timeout(timeout)
            .build()
            .unwrap()
    }

    fn phase_of(result: &InteractionResult) -> &str {
        result
            .metadata_value(METADATA_PHASE)
            .and_then(Value::as_str)
            .unwrap_or("")
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        while !condition() {
            tokio::task::yield_now().await;
        }
    }

    // -------------------------------------------------------------------------
    // Commit / rollback scenarios
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_successful_side_effect_commits() {
        let engine = Engine::new();
        let spy = RecordingParticipant::new("cart").succeeding();
        engine.register_participant(spy.clone());

        let result = engine
            .execute(def("add-to-cart"), ExecuteOptions::new().optimistic(true))
            .await
            .unwrap();

        assert!(result.is_success());
        assert!(!result.is_rollback());
        assert_eq!(phase_of(&result), "committed");
        let log = spy.log();
        assert_eq!(log.count(ParticipantCall::ApplyOptimistic), 1);
        assert_eq!(log.count(ParticipantCall::Commit), 1);
        assert_eq!(log.count(ParticipantCall::Rollback), 0);
        // apply happens before commit
        let calls = log.calls();
        let apply_at = calls
            .iter()
            .position(|c| *c == ParticipantCall::ApplyOptimistic)
            .unwrap();
        let commit_at = calls
            .iter()
            .position(|c| *c == ParticipantCall::Commit)
            .unwrap();
        assert!(apply_at < commit_at);
        assert_eq!(engine.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_side_effect_rolls_back() {
        let engine = Engine::new();
        let spy = RecordingParticipant::new("cart").failing("payment declined");
        engine.register_participant(spy.clone());

        let result = engine
            .execute(def("checkout"), ExecuteOptions::new().optimistic(true))
            .await
            .unwrap();

        assert!(result.is_error());
        assert!(result.is_rollback());
        assert_eq!(result.error(), Some("payment declined"));
        assert_eq!(phase_of(&result), "rolled_back");
        assert_eq!(spy.log().count(ParticipantCall::ApplyOptimistic), 1);
        assert_eq!(spy.log().count(ParticipantCall::Rollback), 1);
        assert_eq!(spy.log().count(ParticipantCall::Commit), 0);
        assert_eq!(engine.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_executor_error_counts_as_failure() {
        let engine = Engine::new();
        let spy = RecordingParticipant::new("cart")
            .executing(ExecuteBehavior::Error("connection reset".into()));
        engine.register_participant(spy.clone());

        let result = engine.execute(def("checkout"), ExecuteOptions::new()).await.unwrap();

        assert!(result.is_rollback());
        assert!(result.error().unwrap().contains("connection reset"));
        assert_eq!(spy.log().count(ParticipantCall::Rollback), 1);
    }

    #[tokio::test]
    async fn test_panicking_executor_is_a_failure() {
        let engine = Engine::new();
        let spy = RecordingParticipant::new("cart").executing(ExecuteBehavior::Panic);
        engine.register_participant(spy.clone());

        let result = engine.execute(def("checkout"), ExecuteOptions::new()).await.unwrap();

        assert!(result.is_error());
        assert!(result.error().unwrap().contains("panicked"));
        assert_eq!(spy.log().count(ParticipantCall::Rollback), 1);
        assert!(!engine.is_processing("checkout"));
    }

    #[tokio::test]
    async fn test_apply_failure_is_isolated() {
        let engine = Engine::new();
        let bad = RecordingParticipant::new("bad").failing_apply();
        let good = RecordingParticipant::new("good").succeeding();
        engine.register_participant(bad.clone());
        engine.register_participant(good.clone());

        let result = engine.execute(def("like-post"), ExecuteOptions::new()).await.unwrap();

        assert!(result.is_success());
        assert_eq!(good.log().count(ParticipantCall::ApplyOptimistic), 1);
        assert_eq!(bad.log().count(ParticipantCall::ApplyOptimistic), 1);
        assert_eq!(result.handler_ids(METADATA_APPLY_FAILURES), vec!["bad"]);
        // both still commit
        assert_eq!(bad.log().count(ParticipantCall::Commit), 1);
        assert_eq!(good.log().count(ParticipantCall::Commit), 1);
    }

    #[tokio::test]
    async fn test_partial_rollback_reports_failures() {
        let engine = Engine::new();
        let stuck = RecordingParticipant::new("stuck").failing_rollback();
        let fine = RecordingParticipant::new("fine").failing("api down");
        engine.register_participant(stuck.clone());
        engine.register_participant(fine.clone());

        let result = engine.execute(def("checkout"), ExecuteOptions::new()).await.unwrap();

        assert!(result.is_rollback());
        assert_eq!(result.handler_ids(METADATA_ROLLBACK_FAILURES), vec!["stuck"]);
        assert_eq!(stuck.log().count(ParticipantCall::Rollback), 1);
        assert_eq!(fine.log().count(ParticipantCall::Rollback), 1);
    }

    #[tokio::test]
    async fn test_commit_failure_does_not_change_result() {
        let engine = Engine::new();
        let spy = RecordingParticipant::new("cart").succeeding().failing_commit();
        engine.register_participant(spy.clone());

        let result = engine.execute(def("checkout"), ExecuteOptions::new()).await.unwrap();

        assert!(result.is_success());
        assert_eq!(result.handler_ids(METADATA_COMMIT_FAILURES), vec!["cart"]);
        assert_eq!(spy.log().count(ParticipantCall::Rollback), 0);
    }

    #[tokio::test]
    async fn test_pessimistic_run_commits_after_side_effect() {
        let engine = Engine::new();
        let spy = RecordingParticipant::new("cart").succeeding();
        engine.register_participant(spy.clone());

        let result = engine
            .execute(def("checkout"), ExecuteOptions::new().optimistic(false))
            .await
            .unwrap();

        assert!(result.is_success());
        assert_eq!(
            spy.log().calls(),
            vec![
                ParticipantCall::CurrentState,
                ParticipantCall::Execute,
                ParticipantCall::Commit
            ]
        );
    }

    #[tokio::test]
    async fn test_pessimistic_failure_has_nothing_to_undo() {
        let engine = Engine::new();
        let spy = RecordingParticipant::new("cart").failing("nope");
        engine.register_participant(spy.clone());

        let definition = InteractionDefinition::builder("checkout")
            .optimistic(false)
            .build()
            .unwrap();
        let result = engine.execute(definition, ExecuteOptions::new()).await.unwrap();

        assert!(result.is_error());
        assert!(!result.is_rollback());
        assert_eq!(spy.log().count(ParticipantCall::ApplyOptimistic), 0);
        assert_eq!(spy.log().count(ParticipantCall::Rollback), 0);
        assert_eq!(spy.log().count(ParticipantCall::Commit), 0);
        assert_eq!(engine.pending_count(), 0);
    }

    // -------------------------------------------------------------------------
    // Side effect resolution
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_no_participants_uses_global_executor_only() {
        let engine = Engine::new();
        let bystander = RecordingParticipant::new("bystander").handling_only("something-else");
        engine.register_participant(bystander.clone());
        engine.register_executor(FnExecutor::new(|def: InteractionDefinition| async move {
            Ok(InteractionResult::success(Some(Payload::from(def.id().to_string()))))
        }));

        let result = engine.execute(def("ping"), ExecuteOptions::new()).await.unwrap();

        assert!(result.is_success());
        assert_eq!(result.data(), Some(&Payload::Text("ping".into())));
        assert_eq!(phase_of(&result), "api_only_executed");
        assert!(bystander.log().is_empty());
        assert_eq!(engine.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_global_executors_tried_in_order() {
        let engine = Engine::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let first_calls = calls.clone();
        engine.register_executor(FnExecutor::new(move |_def: InteractionDefinition| {
            let calls = first_calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<InteractionResult, _>(anyhow::anyhow!("primary down"))
            }
        }));
        engine.register_executor(FnExecutor::new(|_def: InteractionDefinition| async move {
            Ok(InteractionResult::success(Some(Payload::from("fallback"))))
        }));

        let result = engine.execute(def("ping"), ExecuteOptions::new()).await.unwrap();

        assert!(result.is_success());
        assert_eq!(result.data(), Some(&Payload::Text("fallback".into())));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(engine.executor_count(), 2);
    }

    #[tokio::test]
    async fn test_all_executors_failing_is_an_error() {
        let engine = Engine::new();
        engine.register_executor(FnExecutor::new(|_def: InteractionDefinition| async move {
            Err::<InteractionResult, _>(anyhow::anyhow!("down"))
        }));

        let result = engine.execute(def("ping"), ExecuteOptions::new()).await.unwrap();
        assert!(result.is_error());
        assert!(result.error().unwrap().contains("down"));

        let bare = Engine::new();
        let result = bare.execute(def("ping"), ExecuteOptions::new()).await.unwrap();
        assert!(result.is_error());
    }

    #[tokio::test]
    async fn test_first_participant_executor_wins() {
        let engine = Engine::new();
        let deferring = RecordingParticipant::new("deferring");
        let first = RecordingParticipant::new("first")
            .executing(ExecuteBehavior::Succeed(Some(Payload::from("first"))));
        let second = RecordingParticipant::new("second")
            .executing(ExecuteBehavior::Succeed(Some(Payload::from("second"))));
        engine.register_participant(deferring.clone());
        engine.register_participant(first.clone());
        engine.register_participant(second.clone());

        let result = engine.execute(def("x"), ExecuteOptions::new()).await.unwrap();

        assert_eq!(result.data(), Some(&Payload::Text("first".into())));
        assert_eq!(second.log().count(ParticipantCall::Execute), 0);
        // all matched participants commit
        assert_eq!(deferring.log().count(ParticipantCall::Commit), 1);
        assert_eq!(second.log().count(ParticipantCall::Commit), 1);
    }

    #[tokio::test]
    async fn test_participant_deferring_falls_back_to_executor() {
        let engine = Engine::new();
        let spy = RecordingParticipant::new("cart");
        engine.register_participant(spy.clone());
        engine.register_executor(FnExecutor::new(|_def: InteractionDefinition| async move {
            Ok(InteractionResult::success(None))
        }));

        let result = engine.execute(def("x"), ExecuteOptions::new()).await.unwrap();

        assert!(result.is_success());
        assert_eq!(spy.log().count(ParticipantCall::Commit), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_side_effect_timeout() {
        let engine = Engine::new();
        let slow = RecordingParticipant::new("slow")
            .succeeding()
            .with_execute_delay(Duration::from_millis(500));
        engine.register_participant(slow.clone());

        let started = tokio::time::Instant::now();
        let result = engine
            .execute(timed_def("upload", Duration::from_millis(100)), ExecuteOptions::new())
            .await
            .unwrap();
        let elapsed = started.elapsed();

        assert!(result.is_error());
        assert!(result.is_timeout());
        assert!(result.is_rollback());
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_millis(150));
        assert_eq!(slow.log().count(ParticipantCall::Rollback), 1);
        assert_eq!(slow.log().count(ParticipantCall::Commit), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_override_wins() {
        let engine = Engine::new();
        engine.register_participant(
            RecordingParticipant::new("slow")
                .succeeding()
                .with_execute_delay(Duration::from_millis(200)),
        );

        let result = engine
            .execute(
                timed_def("upload", Duration::from_millis(50)),
                ExecuteOptions::new().timeout(Duration::from_secs(1)),
            )
            .await
            .unwrap();
        assert!(result.is_success());
    }

    // -------------------------------------------------------------------------
    // Admission
    // -------------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_identity_rejected_while_in_flight() {
        let engine = Engine::new();
        let spy = RecordingParticipant::new("likes")
            .succeeding()
            .with_execute_delay(Duration::from_millis(100));
        engine.register_participant(spy.clone());

        let first = tokio::spawn({
            let engine = engine.clone();
            async move { engine.execute(def("like-post"), ExecuteOptions::new()).await }
        });
        wait_until(|| engine.is_processing("like-post")).await;

        let second = engine.execute(def("like-post"), ExecuteOptions::new()).await;
        assert_eq!(
            second.unwrap_err(),
            EngineError::DuplicateInFlight {
                identity: "like-post".into()
            }
        );

        let first = first.await.unwrap().unwrap();
        assert!(first.is_success());
        assert_eq!(spy.log().count(ParticipantCall::ApplyOptimistic), 1);
        assert_eq!(spy.log().count(ParticipantCall::Execute), 1);
        assert_eq!(spy.log().count(ParticipantCall::Commit), 1);

        // once finished the identity can run again
        assert!(engine
            .execute(def("like-post"), ExecuteOptions::new())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_invalid_definition_rejected() {
        let engine = Engine::new();
        let definition: InteractionDefinition =
            serde_json::from_value(serde_json::json!({ "id": "  " })).unwrap();

        let err = engine
            .execute(definition, ExecuteOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidDefinition { .. }));
        assert_eq!(engine.queued_count(), 0);
    }

    #[tokio::test]
    async fn test_repeated_runs_get_distinct_correlation_ids() {
        let engine = Engine::new();
        engine.register_participant(RecordingParticipant::new("p").succeeding());

        let a = engine.execute(def("x"), ExecuteOptions::new()).await.unwrap();
        let b = engine.execute(def("x"), ExecuteOptions::new()).await.unwrap();

        let a = a.correlation_id().unwrap();
        let b = b.correlation_id().unwrap();
        assert_ne!(a, b);
        assert_eq!(a.identity(), "x");
        assert_eq!(b.identity(), "x");
    }

    #[tokio::test(start_paused = true)]
    async fn test_serial_strategy_runs_one_at_a_time() {
        let engine = Engine::new();
        engine.register_participant(
            RecordingParticipant::new("slow")
                .succeeding()
                .with_execute_delay(Duration::from_millis(100)),
        );

        let started = tokio::time::Instant::now();
        let (a, b) = tokio::join!(
            engine.execute(def("a"), ExecuteOptions::new()),
            engine.execute(def("b"), ExecuteOptions::new()),
        );
        assert!(a.unwrap().is_success());
        assert!(b.unwrap().is_success());
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_identity_strategy_runs_in_parallel() {
        let engine = Engine::with_config(
            EngineConfig::default().with_queue_strategy(QueueStrategy::PerIdentity),
        );
        engine.register_participant(
            RecordingParticipant::new("slow")
                .succeeding()
                .with_execute_delay(Duration::from_millis(100)),
        );

        let started = tokio::time::Instant::now();
        let (a, b) = tokio::join!(
            engine.execute(def("a"), ExecuteOptions::new()),
            engine.execute(def("b"), ExecuteOptions::new()),
        );
        assert!(a.unwrap().is_success());
        assert!(b.unwrap().is_success());
        assert!(started.elapsed() < Duration::from_millis(200));
    }

    // -------------------------------------------------------------------------
    // Snapshots and deferred commit
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_snapshot_store_stays_bounded() {
        let engine = Engine::new();
        engine.register_participant(RecordingParticipant::new("p").succeeding());
        let options = ExecuteOptions::new()
            .optimistic(true)
            .defer_commit(true)
            .auto_expire(false);

        for n in 0..150 {
            let result = engine
                .execute(def(&format!("op-{}", n)), options.clone())
                .await
                .unwrap();
            assert!(result.is_success());
            assert!(engine.pending_count() <= 100);
        }

        assert_eq!(engine.pending_count(), 100);
        // the oldest fifty were evicted
        let oldest = &engine.pending_ids()[0];
        assert_eq!(oldest.identity(), "op-50");
    }

    #[tokio::test]
    async fn test_snapshot_records_state_and_targets() {
        let engine = Engine::new();
        engine.register_participant(
            RecordingParticipant::new("counter")
                .succeeding()
                .with_state("likes", 41.into()),
        );
        engine.register_participant(RecordingParticipant::new("stateless"));

        let result = engine
            .execute(
                def("like-post"),
                ExecuteOptions::new().defer_commit(true).auto_expire(false),
            )
            .await
            .unwrap();
        let cid = result.correlation_id().unwrap();

        let snapshot = engine.snapshot(cid).unwrap();
        assert_eq!(snapshot.phase, SnapshotPhase::AwaitingConfirmation);
        assert_eq!(snapshot.applied_to, vec!["counter", "stateless"]);
        assert_eq!(snapshot.state_of("counter").unwrap()["likes"], 41);
        assert!(snapshot.state_of("stateless").is_none());
    }

    #[tokio::test]
    async fn test_deferred_commit_waits_for_confirmation() {
        let engine = Engine::new();
        let spy = RecordingParticipant::new("cart").succeeding();
        engine.register_participant(spy.clone());
        let mut results = engine.subscribe();

        let result = engine
            .execute(
                def("upload"),
                ExecuteOptions::new().defer_commit(true).auto_expire(false),
            )
            .await
            .unwrap();
        let cid = result.correlation_id().unwrap().clone();

        assert!(result.is_success());
        assert_eq!(phase_of(&result), "awaiting_confirmation");
        assert_eq!(engine.pending_count(), 1);
        assert!(!engine.has_expiry(&cid));
        assert_eq!(spy.log().count(ParticipantCall::Commit), 0);

        assert!(engine.confirm_success(&cid).await);
        assert!(!engine.confirm_success(&cid).await);
        assert_eq!(spy.log().count(ParticipantCall::Commit), 1);
        assert_eq!(spy.log().count(ParticipantCall::Rollback), 0);
        assert_eq!(engine.pending_count(), 0);

        let emitted = results.recv().await.unwrap();
        assert_eq!(phase_of(&emitted), "awaiting_confirmation");
        let confirmed = results.recv().await.unwrap();
        assert_eq!(phase_of(&confirmed), "confirmed");
        assert_eq!(confirmed.correlation_id(), Some(&cid));
    }

    #[tokio::test]
    async fn test_manual_rollback_of_deferred_run_compensates() {
        let engine = Engine::new();
        let spy = RecordingParticipant::new("likes")
            .succeeding()
            .handling_only("like-post");
        engine.register_participant(spy.clone());
        let compensations = Arc::new(AtomicUsize::new(0));
        let seen = compensations.clone();
        engine.register_executor(FnExecutor::new(move |def: InteractionDefinition| {
            let seen = seen.clone();
            async move {
                if def.id() == "unlike-post" {
                    seen.fetch_add(1, Ordering::SeqCst);
                }
                Ok(InteractionResult::success(None))
            }
        }));
        let mut results = engine.subscribe();

        let like = InteractionDefinition::builder("like-post")
            .compensation(def("unlike-post"))
            .build()
            .unwrap();
        let result = engine
            .execute(like, ExecuteOptions::new().defer_commit(true))
            .await
            .unwrap();
        let cid = result.correlation_id().unwrap().clone();
        assert!(engine.has_expiry(&cid));

        assert!(engine.rollback(&cid).await);
        assert!(!engine.rollback(&cid).await);
        assert_eq!(spy.log().count(ParticipantCall::Rollback), 1);
        assert_eq!(spy.log().count(ParticipantCall::Commit), 0);

        // run result, rollback notification, compensation result
        let _run = results.recv().await.unwrap();
        let rollback = results.recv().await.unwrap();
        assert!(rollback.is_rollback());
        assert_eq!(phase_of(&rollback), "rolled_back");
        let compensation = results.recv().await.unwrap();
        assert_eq!(compensation.correlation_id().unwrap().identity(), "unlike-post");
        assert_eq!(compensations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rollback_report_lists_failed_participants() {
        let engine = Engine::new();
        engine.register_participant(RecordingParticipant::new("ok").succeeding());
        engine.register_participant(RecordingParticipant::new("stuck").failing_rollback());

        let result = engine
            .execute(
                def("upload"),
                ExecuteOptions::new().defer_commit(true).auto_expire(false),
            )
            .await
            .unwrap();
        let cid = result.correlation_id().unwrap();

        let report = engine.rollback_report(cid).await.unwrap();
        assert!(report.is_partial());
        assert_eq!(report.failed_ids(), vec!["stuck"]);
        assert!(engine.rollback_report(cid).await.is_none());
    }

    #[tokio::test]
    async fn test_every_run_is_broadcast() {
        let engine = Engine::new();
        engine.register_participant(RecordingParticipant::new("p").succeeding());
        let latch = shared_latch(3);
        let mut results = engine.subscribe();
        let listener = tokio::spawn({
            let latch = latch.clone();
            async move {
                while results.recv().await.is_ok() {
                    latch.dec();
                    if latch.remaining() == 0 {
                        break;
                    }
                }
            }
        });

        for id in ["a", "b", "c"] {
            engine.execute(def(id), ExecuteOptions::new()).await.unwrap();
        }

        latch.await_zero().await;
        listener.await.unwrap();
    }

    #[tokio::test]
    async fn test_rollback_unknown_run_is_false() {
        let engine = Engine::new();
        assert!(!engine.rollback(&CorrelationId::from("nothing:0:0")).await);
        assert!(!engine.confirm_success(&CorrelationId::from("nothing:0:0")).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_rolls_back_unconfirmed_run() {
        let engine = Engine::new();
        let spy = RecordingParticipant::new("cart").succeeding();
        engine.register_participant(spy.clone());
        let mut results = engine.subscribe();

        let result = engine
            .execute(
                timed_def("upload", Duration::from_millis(100)),
                ExecuteOptions::new().defer_commit(true),
            )
            .await
            .unwrap();
        assert_eq!(phase_of(&result), "expiry_armed");
        let cid = result.correlation_id().unwrap().clone();
        assert!(engine.has_expiry(&cid));
        let _run = results.recv().await.unwrap();

        let expired = tokio::time::timeout(Duration::from_secs(1), results.recv())
            .await
            .expect("expiry should emit a result")
            .unwrap();
        assert!(expired.is_rollback());
        assert_eq!(phase_of(&expired), "expired_rollback");
        assert_eq!(expired.correlation_id(), Some(&cid));
        assert_eq!(spy.log().count(ParticipantCall::Rollback), 1);
        assert_eq!(spy.log().count(ParticipantCall::Commit), 0);
        assert_eq!(engine.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirmation_disarms_expiry() {
        let engine = Engine::new();
        let spy = RecordingParticipant::new("cart").succeeding();
        engine.register_participant(spy.clone());

        let result = engine
            .execute(
                timed_def("upload", Duration::from_millis(100)),
                ExecuteOptions::new().defer_commit(true),
            )
            .await
            .unwrap();
        let cid = result.correlation_id().unwrap().clone();

        assert!(engine.confirm_success(&cid).await);
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(spy.log().count(ParticipantCall::Commit), 1);
        assert_eq!(spy.log().count(ParticipantCall::Rollback), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_commit_arms_no_timer() {
        let engine = Engine::new();
        let spy = RecordingParticipant::new("cart").succeeding();
        engine.register_participant(spy.clone());

        let result = engine
            .execute(
                timed_def("upload", Duration::from_millis(50)),
                ExecuteOptions::new().auto_expire(true),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(phase_of(&result), "committed");
        assert_eq!(spy.log().count(ParticipantCall::Commit), 1);
        assert_eq!(spy.log().count(ParticipantCall::Rollback), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_rollback_while_in_flight() {
        let engine = Engine::new();
        let spy = RecordingParticipant::new("cart")
            .succeeding()
            .with_execute_delay(Duration::from_millis(100));
        engine.register_participant(spy.clone());

        let run = tokio::spawn({
            let engine = engine.clone();
            async move { engine.execute(def("upload"), ExecuteOptions::new()).await }
        });
        wait_until(|| spy.log().count(ParticipantCall::Execute) == 1).await;

        let cid = engine.pending_ids()[0].clone();
        assert!(engine.rollback(&cid).await);

        let result = run.await.unwrap().unwrap();
        assert!(result.is_rollback());
        assert_eq!(phase_of(&result), "rolled_back");
        assert_eq!(spy.log().count(ParticipantCall::Rollback), 1);
        assert_eq!(spy.log().count(ParticipantCall::Commit), 0);
        assert_eq!(engine.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_manual_rollback_of_pessimistic_run_is_refused() {
        let engine = Engine::new();
        let spy = RecordingParticipant::new("payments")
            .succeeding()
            .with_execute_delay(Duration::from_millis(100));
        engine.register_participant(spy.clone());

        let run = tokio::spawn({
            let engine = engine.clone();
            async move {
                engine
                    .execute(def("pay"), ExecuteOptions::new().optimistic(false))
                    .await
            }
        });
        wait_until(|| spy.log().count(ParticipantCall::Execute) == 1).await;

        // nothing was applied, so there is nothing to roll back
        let cid = engine.pending_ids()[0].clone();
        assert!(engine.rollback_report(&cid).await.is_none());

        let result = run.await.unwrap().unwrap();
        assert!(result.is_success());
        assert!(!result.is_rollback());
        assert_eq!(phase_of(&result), "committed");
        assert_eq!(spy.log().count(ParticipantCall::Commit), 1);
        assert_eq!(spy.log().count(ParticipantCall::Rollback), 0);
        assert_eq!(engine.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_rollback_waits_for_optimistic_apply() {
        let engine = Engine::new();
        let spy = RecordingParticipant::new("cart")
            .succeeding()
            .with_callback_delay(Duration::from_millis(100));
        engine.register_participant(spy.clone());

        let run = tokio::spawn({
            let engine = engine.clone();
            async move { engine.execute(def("add-item"), ExecuteOptions::new()).await }
        });
        wait_until(|| spy.log().count(ParticipantCall::ApplyOptimistic) == 1).await;

        let cid = engine.pending_ids()[0].clone();
        let started = tokio::time::Instant::now();
        assert!(engine.rollback(&cid).await);
        // the apply settles (100ms) before the rollback callback runs (100ms)
        assert!(started.elapsed() >= Duration::from_millis(200));

        let result = run.await.unwrap().unwrap();
        assert!(result.is_error());
        assert!(result.is_rollback());
        assert_eq!(phase_of(&result), "rolled_back");
        assert_eq!(
            spy.log().calls(),
            vec![
                ParticipantCall::CurrentState,
                ParticipantCall::ApplyOptimistic,
                ParticipantCall::Rollback
            ]
        );
        assert_eq!(spy.log().count(ParticipantCall::Execute), 0);
        assert!(!engine.is_pending(&cid));
        assert!(!engine.is_processing("add-item"));
    }

    #[tokio::test]
    async fn test_failed_run_task_is_broadcast() {
        struct Exploding;

        #[async_trait::async_trait]
        impl Participant for Exploding {
            fn handler_id(&self) -> &str {
                "exploding"
            }

            fn can_handle(&self, _definition: &InteractionDefinition) -> bool {
                panic!("discovery blew up")
            }

            async fn apply_optimistic(
                &self,
                _cid: &CorrelationId,
                _definition: &InteractionDefinition,
            ) -> anyhow::Result<()> {
                Ok(())
            }

            async fn rollback(
                &self,
                _cid: &CorrelationId,
                _definition: &InteractionDefinition,
            ) -> anyhow::Result<()> {
                Ok(())
            }

            async fn commit(
                &self,
                _cid: &CorrelationId,
                _definition: &InteractionDefinition,
            ) -> anyhow::Result<()> {
                Ok(())
            }
        }

        let engine = Engine::new();
        engine.register_participant(Exploding);
        let mut rx = engine.subscribe();

        let result = engine
            .execute(def("boom"), ExecuteOptions::new())
            .await
            .unwrap();
        assert!(result.is_error());
        assert!(result.error().unwrap().starts_with("run failed"));
        assert_eq!(
            result.metadata_value(METADATA_IDENTITY),
            Some(&Value::String("boom".into()))
        );

        let broadcast = rx.recv().await.unwrap();
        assert_eq!(broadcast.error(), result.error());
        assert!(!engine.is_processing("boom"));
    }

    // -------------------------------------------------------------------------
    // Registry, hints and disposal
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_discovery_hint_replaces_registry() {
        let engine = Engine::new();
        let registered = RecordingParticipant::new("registered").succeeding();
        engine.register_participant(registered.clone());
        let hinted = RecordingParticipant::new("hinted").succeeding();
        let ignored = RecordingParticipant::new("ignored").handling_only("other");

        let result = engine
            .execute(
                def("x"),
                ExecuteOptions::new().with_participants(vec![
                    Arc::new(hinted.clone()) as Arc<dyn Participant>,
                    Arc::new(ignored.clone()) as Arc<dyn Participant>,
                ]),
            )
            .await
            .unwrap();

        assert!(result.is_success());
        assert_eq!(hinted.log().count(ParticipantCall::Commit), 1);
        assert!(ignored.log().is_empty());
        assert!(registered.log().is_empty());
    }

    #[tokio::test]
    async fn test_registration_accessors() {
        let engine = Engine::builder()
            .with_participant(RecordingParticipant::new("a"))
            .with_participant(RecordingParticipant::new("b"))
            .with_participant(RecordingParticipant::new("a"))
            .with_executor(FnExecutor::new(|_def: InteractionDefinition| async move {
                Ok(InteractionResult::success(None))
            }))
            .build();

        assert_eq!(engine.participant_count(), 2);
        assert_eq!(engine.executor_count(), 1);
        assert!(engine.unregister_participant("a"));
        assert_eq!(engine.participant_count(), 1);
        engine.unregister_all();
        assert_eq!(engine.participant_count(), 0);
        assert_eq!(engine.executor_count(), 1);
    }

    #[tokio::test]
    async fn test_dispose_rejects_new_work_and_closes_stream() {
        let engine = Engine::new();
        engine.register_participant(RecordingParticipant::new("a"));
        let mut results = engine.subscribe();

        engine.dispose();
        engine.dispose();

        assert!(engine.is_disposed());
        assert_eq!(engine.participant_count(), 0);
        assert_eq!(
            engine
                .execute(def("x"), ExecuteOptions::new())
                .await
                .unwrap_err(),
            EngineError::Disposed
        );
        assert!(matches!(results.recv().await, Err(RecvError::Closed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_cancels_in_flight_runs_and_timers() {
        let engine = Engine::new();
        let slow = RecordingParticipant::new("slow")
            .succeeding()
            .with_execute_delay(Duration::from_secs(10))
            .handling_only("slow-op");
        let quick = RecordingParticipant::new("quick")
            .succeeding()
            .handling_only("quick-op");
        engine.register_participant(slow.clone());
        engine.register_participant(quick.clone());

        let deferred = engine
            .execute(
                timed_def("quick-op", Duration::from_millis(100)),
                ExecuteOptions::new().defer_commit(true),
            )
            .await
            .unwrap();
        assert!(engine.has_expiry(deferred.correlation_id().unwrap()));

        let in_flight = tokio::spawn({
            let engine = engine.clone();
            async move { engine.execute(def("slow-op"), ExecuteOptions::new()).await }
        });
        wait_until(|| slow.log().count(ParticipantCall::Execute) == 1).await;

        engine.dispose();

        assert_eq!(in_flight.await.unwrap().unwrap_err(), EngineError::Disposed);
        assert_eq!(engine.pending_count(), 0);
        assert_eq!(engine.queued_count(), 0);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(quick.log().count(ParticipantCall::Rollback), 0);
    }
}
