//! Admission control for runs.
//!
//! Every submission first claims its definition identity in the set of
//! identities currently processing. A second submission of an identity that
//! is still processing is rejected immediately with
//! [`EngineError::DuplicateInFlight`] and never reaches a participant.
//!
//! Admitted runs then wait for a lane according to the [`QueueStrategy`]:
//!
//! - `Serial`: one global FIFO lane, runs complete in submission order.
//! - `PerIdentity`: no shared lane, different identities run in parallel.
//!   Same-identity exclusion still comes from the processing set.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::error::EngineError;

/// How admitted runs are scheduled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStrategy {
    #[default]
    Serial,
    PerIdentity,
}

impl QueueStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStrategy::Serial => "serial",
            QueueStrategy::PerIdentity => "per_identity",
        }
    }
}

impl fmt::Display for QueueStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "serial" => Ok(QueueStrategy::Serial),
            "per_identity" | "per-identity" => Ok(QueueStrategy::PerIdentity),
            other => Err(format!(
                "unknown queue strategy '{}', expected 'serial' or 'per_identity'",
                other
            )),
        }
    }
}

// =============================================================================
// Execution Queue
// =============================================================================

pub(crate) struct ExecutionQueue {
    strategy: QueueStrategy,
    processing: DashSet<String>,
    /// Admitted runs that have not finished yet.
    queued: AtomicUsize,
    lane: Arc<Semaphore>,
}

impl ExecutionQueue {
    pub(crate) fn new(strategy: QueueStrategy) -> Self {
        Self {
            strategy,
            processing: DashSet::new(),
            queued: AtomicUsize::new(0),
            // tokio semaphores are fair, so waiters acquire in FIFO order
            lane: Arc::new(Semaphore::new(1)),
        }
    }

    pub(crate) fn strategy(&self) -> QueueStrategy {
        self.strategy
    }

    /// Claim `identity` for a new run.
    ///
    /// The claim is held by the returned ticket and released when it drops,
    /// including when the run's task is cancelled or panics.
    pub(crate) fn admit(self: &Arc<Self>, identity: &str) -> Result<AdmissionTicket, EngineError> {
        if self.lane.is_closed() {
            return Err(EngineError::Disposed);
        }
        if !self.processing.insert(identity.to_string()) {
            debug!(identity, "rejecting duplicate in-flight submission");
            return Err(EngineError::DuplicateInFlight {
                identity: identity.to_string(),
            });
        }
        self.queued.fetch_add(1, Ordering::AcqRel);
        Ok(AdmissionTicket {
            queue: Arc::clone(self),
            identity: identity.to_string(),
            lane: None,
        })
    }

    pub(crate) fn is_processing(&self, identity: &str) -> bool {
        self.processing.contains(identity)
    }

    pub(crate) fn processing_count(&self) -> usize {
        self.processing.len()
    }

    pub(crate) fn queued_count(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    /// Stop handing out lanes. Waiting runs observe [`EngineError::Disposed`].
    pub(crate) fn close(&self) {
        self.lane.close();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.lane.is_closed()
    }

    fn release(&self, identity: &str) {
        self.processing.remove(identity);
        self.queued.fetch_sub(1, Ordering::AcqRel);
    }
}

impl fmt::Debug for ExecutionQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionQueue")
            .field("strategy", &self.strategy)
            .field("processing", &self.processing_count())
            .field("queued", &self.queued_count())
            .finish()
    }
}

// =============================================================================
// Admission Ticket (RAII)
// =============================================================================

/// Proof of admission for one run.
///
/// Dropping the ticket releases the identity and the lane.
pub(crate) struct AdmissionTicket {
    queue: Arc<ExecutionQueue>,
    identity: String,
    lane: Option<OwnedSemaphorePermit>,
}

impl AdmissionTicket {
    pub(crate) fn identity(&self) -> &str {
        &self.identity
    }

    /// Wait for this run's turn according to the queue strategy.
    pub(crate) async fn wait_turn(&mut self) -> Result<(), EngineError> {
        if self.queue.strategy == QueueStrategy::PerIdentity || self.lane.is_some() {
            return if self.queue.is_closed() {
                Err(EngineError::Disposed)
            } else {
                Ok(())
            };
        }
        let permit = Arc::clone(&self.queue.lane)
            .acquire_owned()
            .await
            .map_err(|_| EngineError::Disposed)?;
        self.lane = Some(permit);
        Ok(())
    }
}

impl Drop for AdmissionTicket {
    fn drop(&mut self) {
        // Release the lane before the identity so the next waiter can start.
        self.lane.take();
        self.queue.release(&self.identity);
    }
}

impl fmt::Debug for AdmissionTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionTicket")
            .field("identity", &self.identity)
            .field("has_lane", &self.lane.is_some())
            .finish()
    }
}
