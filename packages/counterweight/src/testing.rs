//! Testing utilities for engines and participants.
//!
//! # Feature Flag
//!
//! This module is only available with the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! counterweight = { version = "0.1", features = ["testing"] }
//! ```
//!
//! # Recording Participant
//!
//! ```ignore
//! use counterweight::testing::{ParticipantCall, RecordingParticipant};
//!
//! let spy = RecordingParticipant::new("cart").succeeding();
//! engine.register_participant(spy.clone());
//!
//! engine.execute(definition, ExecuteOptions::default()).await?;
//!
//! assert_eq!(spy.log().count(ParticipantCall::ApplyOptimistic), 1);
//! assert_eq!(spy.log().count(ParticipantCall::Commit), 1);
//! assert_eq!(spy.log().count(ParticipantCall::Rollback), 0);
//! ```
//!
//! Several spies can share one [`CallLog`] with [`RecordingParticipant::with_log`]
//! to assert ordering across participants.
//!
//! # Result Latch
//!
//! ```ignore
//! let latch = shared_latch(3);
//! let mut results = engine.subscribe();
//! tokio::spawn({
//!     let latch = latch.clone();
//!     async move {
//!         while results.recv().await.is_ok() {
//!             latch.dec();
//!         }
//!     }
//! });
//! latch.await_zero().await;
//! ```

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Notify;

use crate::core::CorrelationId;
use crate::definition::{InteractionDefinition, Payload};
use crate::participant::{Participant, StateBag};
use crate::result::InteractionResult;

// =============================================================================
// Call Log
// =============================================================================

/// A participant callback observed by a [`RecordingParticipant`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParticipantCall {
    ApplyOptimistic,
    Commit,
    Rollback,
    Execute,
    CurrentState,
}

/// One recorded callback.
#[derive(Debug, Clone, PartialEq)]
pub struct CallRecord {
    pub handler_id: String,
    pub call: ParticipantCall,
    /// Correlation id for lifecycle callbacks, `None` for execute/state.
    pub cid: Option<CorrelationId>,
    pub identity: Option<String>,
}

/// Shared, append-only log of participant callbacks.
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    records: Arc<Mutex<Vec<CallRecord>>>,
}

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, record: CallRecord) {
        self.records.lock().unwrap().push(record);
    }

    /// Every record, in the order the callbacks started.
    pub fn records(&self) -> Vec<CallRecord> {
        self.records.lock().unwrap().clone()
    }

    /// Just the call kinds, in order.
    pub fn calls(&self) -> Vec<ParticipantCall> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.call)
            .collect()
    }

    pub fn count(&self, call: ParticipantCall) -> usize {
        self.records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.call == call)
            .count()
    }

    /// Count of `call` recorded by `handler_id`.
    pub fn count_for(&self, handler_id: &str, call: ParticipantCall) -> usize {
        self.records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.call == call && r.handler_id == handler_id)
            .count()
    }

    /// Count of `call` recorded for a specific run.
    pub fn count_for_run(&self, cid: &CorrelationId, call: ParticipantCall) -> usize {
        self.records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.call == call && r.cid.as_ref() == Some(cid))
            .count()
    }

    /// Count of `call` recorded for runs of a definition identity.
    pub fn count_for_identity(&self, identity: &str, call: ParticipantCall) -> usize {
        self.records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.call == call && r.identity.as_deref() == Some(identity))
            .count()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().unwrap().is_empty()
    }

    pub fn clear(&self) {
        self.records.lock().unwrap().clear();
    }
}

// =============================================================================
// Recording Participant
// =============================================================================

/// What a [`RecordingParticipant`] does when asked to execute the side effect.
#[derive(Debug, Clone)]
pub enum ExecuteBehavior {
    /// Return `Ok(None)` and defer to other executors.
    Defer,
    /// Return a success result with the given data.
    Succeed(Option<Payload>),
    /// Return an error result.
    Fail(String),
    /// Return `Err`.
    Error(String),
    /// Panic.
    Panic,
}

#[derive(Debug, Clone, Default)]
struct Faults {
    apply: bool,
    commit: bool,
    rollback: bool,
    panic_rollback: bool,
    state: bool,
}

/// Configurable spy participant that records every callback.
///
/// Clones share the same log and configuration snapshot, so a clone can be
/// registered with an engine while the original is kept for assertions.
#[derive(Debug, Clone)]
pub struct RecordingParticipant {
    handler_id: String,
    only: Option<String>,
    log: CallLog,
    execute: ExecuteBehavior,
    execute_delay: Option<Duration>,
    callback_delay: Option<Duration>,
    faults: Faults,
    state: Option<StateBag>,
}

impl RecordingParticipant {
    /// A participant that handles every definition and defers execution.
    pub fn new(handler_id: impl Into<String>) -> Self {
        Self {
            handler_id: handler_id.into(),
            only: None,
            log: CallLog::new(),
            execute: ExecuteBehavior::Defer,
            execute_delay: None,
            callback_delay: None,
            faults: Faults::default(),
            state: None,
        }
    }

    /// Only handle definitions with this identity.
    pub fn handling_only(mut self, identity: impl Into<String>) -> Self {
        self.only = Some(identity.into());
        self
    }

    /// Record into a shared log.
    pub fn with_log(mut self, log: CallLog) -> Self {
        self.log = log;
        self
    }

    pub fn executing(mut self, behavior: ExecuteBehavior) -> Self {
        self.execute = behavior;
        self
    }

    /// Execute the side effect successfully with no data.
    pub fn succeeding(self) -> Self {
        self.executing(ExecuteBehavior::Succeed(None))
    }

    /// Execute the side effect and report an error result.
    pub fn failing(self, message: impl Into<String>) -> Self {
        self.executing(ExecuteBehavior::Fail(message.into()))
    }

    /// Delay the side effect, e.g. to exceed a timeout.
    pub fn with_execute_delay(mut self, delay: Duration) -> Self {
        self.execute_delay = Some(delay);
        self
    }

    /// Delay apply/commit/rollback.
    pub fn with_callback_delay(mut self, delay: Duration) -> Self {
        self.callback_delay = Some(delay);
        self
    }

    pub fn failing_apply(mut self) -> Self {
        self.faults.apply = true;
        self
    }

    pub fn failing_commit(mut self) -> Self {
        self.faults.commit = true;
        self
    }

    pub fn failing_rollback(mut self) -> Self {
        self.faults.rollback = true;
        self
    }

    pub fn panicking_rollback(mut self) -> Self {
        self.faults.panic_rollback = true;
        self
    }

    pub fn failing_state(mut self) -> Self {
        self.faults.state = true;
        self
    }

    /// Report `key = value` from `current_state`.
    pub fn with_state(mut self, key: impl Into<String>, value: Value) -> Self {
        self.state
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value);
        self
    }

    pub fn log(&self) -> &CallLog {
        &self.log
    }

    fn record(&self, call: ParticipantCall, cid: Option<&CorrelationId>, identity: Option<&str>) {
        self.log.push(CallRecord {
            handler_id: self.handler_id.clone(),
            call,
            cid: cid.cloned(),
            identity: identity.map(str::to_string),
        });
    }

    async fn pause(&self) {
        if let Some(delay) = self.callback_delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl Participant for RecordingParticipant {
    fn handler_id(&self) -> &str {
        &self.handler_id
    }

    fn can_handle(&self, definition: &InteractionDefinition) -> bool {
        self.only
            .as_deref()
            .map(|only| only == definition.id())
            .unwrap_or(true)
    }

    async fn apply_optimistic(&self, cid: &CorrelationId, def: &InteractionDefinition) -> Result<()> {
        self.record(ParticipantCall::ApplyOptimistic, Some(cid), Some(def.id()));
        self.pause().await;
        if self.faults.apply {
            return Err(anyhow!("{} refused optimistic apply", self.handler_id));
        }
        Ok(())
    }

    async fn rollback(&self, cid: &CorrelationId, def: &InteractionDefinition) -> Result<()> {
        self.record(ParticipantCall::Rollback, Some(cid), Some(def.id()));
        self.pause().await;
        if self.faults.panic_rollback {
            panic!("{} exploded during rollback", self.handler_id);
        }
        if self.faults.rollback {
            return Err(anyhow!("{} could not roll back", self.handler_id));
        }
        Ok(())
    }

    async fn commit(&self, cid: &CorrelationId, def: &InteractionDefinition) -> Result<()> {
        self.record(ParticipantCall::Commit, Some(cid), Some(def.id()));
        self.pause().await;
        if self.faults.commit {
            return Err(anyhow!("{} could not commit", self.handler_id));
        }
        Ok(())
    }

    async fn execute(&self, def: &InteractionDefinition) -> Result<Option<InteractionResult>> {
        if matches!(self.execute, ExecuteBehavior::Defer) {
            return Ok(None);
        }
        self.record(ParticipantCall::Execute, None, Some(def.id()));
        if let Some(delay) = self.execute_delay {
            tokio::time::sleep(delay).await;
        }
        match &self.execute {
            ExecuteBehavior::Defer => Ok(None),
            ExecuteBehavior::Succeed(data) => Ok(Some(InteractionResult::success(data.clone()))),
            ExecuteBehavior::Fail(message) => Ok(Some(InteractionResult::failure(message.clone()))),
            ExecuteBehavior::Error(message) => Err(anyhow!(message.clone())),
            ExecuteBehavior::Panic => panic!("{} exploded during execute", self.handler_id),
        }
    }

    fn current_state(&self) -> Result<Option<StateBag>> {
        self.record(ParticipantCall::CurrentState, None, None);
        if self.faults.state {
            return Err(anyhow!("{} state unavailable", self.handler_id));
        }
        Ok(self.state.clone())
    }
}

// =============================================================================
// Result Latch
// =============================================================================

/// Counts down as results arrive and wakes waiters at zero.
#[derive(Debug)]
pub struct ResultLatch {
    remaining: AtomicUsize,
    notify: Notify,
}

impl ResultLatch {
    pub fn new(expected: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(expected),
            notify: Notify::new(),
        }
    }

    /// # Panics
    ///
    /// Panics if called more times than expected.
    pub fn dec(&self) {
        let prev = self.remaining.fetch_sub(1, Ordering::AcqRel);
        if prev == 0 {
            panic!("ResultLatch decremented below zero - more results than expected");
        }
        if prev == 1 {
            self.notify.notify_waiters();
        }
    }

    pub async fn await_zero(&self) {
        loop {
            // Register for notification before checking the count
            let notified = self.notify.notified();
            if self.remaining.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }
}

pub type SharedResultLatch = Arc<ResultLatch>;

pub fn shared_latch(expected: usize) -> SharedResultLatch {
    Arc::new(ResultLatch::new(expected))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_clones_share_log() {
        let spy = RecordingParticipant::new("cart").succeeding();
        let registered = spy.clone();
        let def = InteractionDefinition::builder("add").build().unwrap();
        let cid = CorrelationId::from("add:1:1");

        registered.apply_optimistic(&cid, &def).await.unwrap();
        let result = registered.execute(&def).await.unwrap().unwrap();
        assert!(result.is_success());

        assert_eq!(
            spy.log().calls(),
            vec![ParticipantCall::ApplyOptimistic, ParticipantCall::Execute]
        );
        assert_eq!(spy.log().count_for_run(&cid, ParticipantCall::ApplyOptimistic), 1);
        assert_eq!(spy.log().count_for_identity("add", ParticipantCall::Execute), 1);
    }

    #[tokio::test]
    async fn test_shared_log_across_participants() {
        let log = CallLog::new();
        let a = RecordingParticipant::new("a").with_log(log.clone());
        let b = RecordingParticipant::new("b").with_log(log.clone());
        let def = InteractionDefinition::builder("x").build().unwrap();
        let cid = CorrelationId::from("x:1:1");

        a.commit(&cid, &def).await.unwrap();
        b.rollback(&cid, &def).await.unwrap();

        assert_eq!(log.len(), 2);
        assert_eq!(log.count_for("a", ParticipantCall::Commit), 1);
        assert_eq!(log.count_for("b", ParticipantCall::Rollback), 1);
    }

    #[test]
    fn test_handling_only_filters_by_identity() {
        let spy = RecordingParticipant::new("picky").handling_only("like-post");
        let like = InteractionDefinition::builder("like-post").build().unwrap();
        let other = InteractionDefinition::builder("follow").build().unwrap();
        assert!(spy.can_handle(&like));
        assert!(!spy.can_handle(&other));
    }

    #[tokio::test]
    async fn test_latch_releases_at_zero() {
        let latch = shared_latch(2);
        let waiter = tokio::spawn({
            let latch = latch.clone();
            async move { latch.await_zero().await }
        });
        latch.dec();
        latch.dec();
        waiter.await.unwrap();
        assert_eq!(latch.remaining(), 0);
    }
}
