//! Structured error types and best-effort batch reports for counterweight.
//!
//! `EngineError` provides pattern-matchable errors for the failures that the
//! engine surfaces to callers directly (admission and validation). Failures of
//! the side effect itself are not errors at this level: they come back as an
//! [`InteractionResult`](crate::InteractionResult) with `success == false`.
//!
//! # The Error Boundary Rule
//!
//! > **No `anyhow::Error` ever crosses the engine boundary.**
//!
//! - `anyhow` is internal transport (ergonomic for participants and executors)
//! - `EngineError`, `InteractionResult` and `BatchReport` are what callers see
//!
//! # BatchReport Example
//!
//! ```ignore
//! if let Some(report) = engine.rollback_report(&cid).await {
//!     for failed in report.failures() {
//!         eprintln!("{} could not roll back: {}", failed.handler_id, failed.error_message().unwrap_or_default());
//!     }
//! }
//! ```

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// =============================================================================
// Engine Error
// =============================================================================

/// Structured error type for engine operations.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    /// Another run of the same definition identity has not finished yet.
    #[error("interaction {identity} is already in flight")]
    DuplicateInFlight {
        /// Identity of the definition that was rejected.
        identity: String,
    },

    /// The engine has been disposed and accepts no more work.
    #[error("engine has been disposed")]
    Disposed,

    /// A definition failed validation.
    #[error("invalid interaction definition: {}", errors.join("; "))]
    InvalidDefinition {
        /// Human-readable validation errors.
        errors: Vec<String>,
    },

    /// A side effect did not finish within its deadline.
    #[error("side effect timed out after {duration:?}")]
    Timeout {
        /// The deadline that was exceeded.
        duration: Duration,
    },

    /// A value could not be turned into a payload.
    #[error("payload encode failed: {message}")]
    PayloadEncode {
        /// The underlying serde message.
        message: String,
    },

    /// A payload could not be viewed as the requested type.
    #[error("payload decode failed: {message}")]
    PayloadDecode {
        /// The underlying serde message.
        message: String,
    },
}

impl EngineError {
    /// Returns true for errors raised by admission control.
    pub fn is_admission(&self) -> bool {
        matches!(
            self,
            EngineError::DuplicateInFlight { .. } | EngineError::Disposed
        )
    }
}

// =============================================================================
// Batch Report
// =============================================================================

/// Which participant callback a fan-out invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanOutPhase {
    ApplyOptimistic,
    Commit,
    Rollback,
}

impl fmt::Display for FanOutPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FanOutPhase::ApplyOptimistic => write!(f, "apply_optimistic"),
            FanOutPhase::Commit => write!(f, "commit"),
            FanOutPhase::Rollback => write!(f, "rollback"),
        }
    }
}

/// Outcome of one participant's callback inside a fan-out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantOutcome {
    /// Handler id of the participant.
    pub handler_id: String,
    /// `Ok(())` if the callback succeeded, otherwise the error message.
    pub outcome: Result<(), String>,
}

impl ParticipantOutcome {
    pub fn succeeded(handler_id: impl Into<String>) -> Self {
        Self {
            handler_id: handler_id.into(),
            outcome: Ok(()),
        }
    }

    pub fn failed(handler_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            handler_id: handler_id.into(),
            outcome: Err(message.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn error_message(&self) -> Option<&str> {
        self.outcome.as_ref().err().map(String::as_str)
    }
}

/// Outcome of a best-effort fan-out across participants.
///
/// Counterweight does not pretend a fan-out is atomic. Each participant's
/// callback is awaited independently and its outcome recorded, so callers
/// and tests can assert partial failure instead of reading logs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    /// The callback that was fanned out.
    pub phase: FanOutPhase,
    /// One entry per targeted participant, in fan-out order.
    pub outcomes: Vec<ParticipantOutcome>,
}

impl BatchReport {
    pub fn new(phase: FanOutPhase) -> Self {
        Self {
            phase,
            outcomes: Vec::new(),
        }
    }

    /// Returns true if every targeted participant succeeded.
    ///
    /// An empty report is complete.
    pub fn is_complete(&self) -> bool {
        self.outcomes.iter().all(ParticipantOutcome::is_success)
    }

    /// Returns true if at least one participant failed.
    pub fn is_partial(&self) -> bool {
        !self.is_complete()
    }

    pub fn succeeded_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &ParticipantOutcome> {
        self.outcomes.iter().filter(|o| !o.is_success())
    }

    /// Handler ids of the participants whose callback failed.
    pub fn failed_ids(&self) -> Vec<String> {
        self.failures().map(|o| o.handler_id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }
}

impl fmt::Display for BatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_complete() {
            write!(f, "{} complete for {} participant(s)", self.phase, self.len())
        } else {
            write!(
                f,
                "{} partial: {} of {} succeeded, failed: {}",
                self.phase,
                self.succeeded_count(),
                self.len(),
                self.failed_ids().join(", ")
            )
        }
    }
}
