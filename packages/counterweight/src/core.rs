//! Core identifiers and the per-run state machine.
//!
//! # Correlation
//!
//! A definition identity (for example `"like-post"`) is reused across many
//! executions. Each execution is a *run* and gets its own [`CorrelationId`],
//! derived from the identity plus the run's creation time and an engine-wide
//! sequence number, so repeated executions of the same identity never share
//! a correlation id.
//!
//! # Run phases
//!
//! ```text
//! Admitted → ParticipantsDiscovered ─┬─► ApiOnlyExecuted → Done
//!                                    │
//!                                    └─► SnapshotCaptured → [OptimisticApplied]
//!                                          → SideEffectExecuted → Committed | RolledBack
//!                                          → [ExpiryArmed → Confirmed | ExpiredRollback] → Done
//! ```

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::definition::InteractionDefinition;
use crate::participant::Participant;

/// Correlation id for a single run of an interaction definition.
///
/// Format: `{identity}:{unix_millis}:{sequence}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Derive a correlation id for a run of `identity`.
    pub fn for_run(identity: &str, created_at: DateTime<Utc>, sequence: u64) -> Self {
        Self(format!(
            "{}:{}:{}",
            identity,
            created_at.timestamp_millis(),
            sequence
        ))
    }

    /// The definition identity this correlation id was derived from.
    pub fn identity(&self) -> &str {
        // Identities may themselves contain ':' so split from the right.
        let mut parts = self.0.rsplitn(3, ':');
        let _sequence = parts.next();
        let _millis = parts.next();
        parts.next().unwrap_or(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl AsRef<str> for CorrelationId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Phase of a run in the orchestration state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Admitted,
    ParticipantsDiscovered,
    ApiOnlyExecuted,
    SnapshotCaptured,
    OptimisticApplied,
    SideEffectExecuted,
    Committed,
    RolledBack,
    /// Side effect succeeded, commit is deferred until confirmation.
    AwaitingConfirmation,
    ExpiryArmed,
    Confirmed,
    ExpiredRollback,
    Done,
}

impl RunPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunPhase::Admitted => "admitted",
            RunPhase::ParticipantsDiscovered => "participants_discovered",
            RunPhase::ApiOnlyExecuted => "api_only_executed",
            RunPhase::SnapshotCaptured => "snapshot_captured",
            RunPhase::OptimisticApplied => "optimistic_applied",
            RunPhase::SideEffectExecuted => "side_effect_executed",
            RunPhase::Committed => "committed",
            RunPhase::RolledBack => "rolled_back",
            RunPhase::AwaitingConfirmation => "awaiting_confirmation",
            RunPhase::ExpiryArmed => "expiry_armed",
            RunPhase::Confirmed => "confirmed",
            RunPhase::ExpiredRollback => "expired_rollback",
            RunPhase::Done => "done",
        }
    }

    /// Terminal phases end a run's involvement with its participants.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunPhase::ApiOnlyExecuted
                | RunPhase::Committed
                | RunPhase::RolledBack
                | RunPhase::Confirmed
                | RunPhase::ExpiredRollback
                | RunPhase::Done
        )
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One execution of a definition. Engine-internal.
pub(crate) struct Run {
    pub(crate) cid: CorrelationId,
    pub(crate) definition: InteractionDefinition,
    pub(crate) participants: Vec<Arc<dyn Participant>>,
    pub(crate) created_at: DateTime<Utc>,
    phase: RunPhase,
    history: Vec<RunPhase>,
}

impl Run {
    pub(crate) fn new(
        definition: InteractionDefinition,
        created_at: DateTime<Utc>,
        sequence: u64,
    ) -> Self {
        let cid = CorrelationId::for_run(definition.id(), created_at, sequence);
        Self {
            cid,
            definition,
            participants: Vec::new(),
            created_at,
            phase: RunPhase::Admitted,
            history: vec![RunPhase::Admitted],
        }
    }

    pub(crate) fn phase(&self) -> RunPhase {
        self.phase
    }

    pub(crate) fn history(&self) -> &[RunPhase] {
        &self.history
    }

    pub(crate) fn advance(&mut self, next: RunPhase) {
        debug!(cid = %self.cid, from = %self.phase, to = %next, "run phase transition");
        self.phase = next;
        self.history.push(next);
    }

    pub(crate) fn handler_ids(&self) -> Vec<String> {
        self.participants
            .iter()
            .map(|p| p.handler_id().to_string())
            .collect()
    }
}

impl fmt::Debug for Run {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Run")
            .field("cid", &self.cid)
            .field("identity", &self.definition.id())
            .field("participants", &self.handler_ids())
            .field("created_at", &self.created_at)
            .field("phase", &self.phase)
            .finish()
    }
}
