//! Captured participant state and the bounded store that holds it.
//!
//! A [`Snapshot`] exists for a correlation id exactly while that run has an
//! optimistic apply outstanding (not yet committed, rolled back, or
//! confirmed). The store is insertion-ordered and bounded: inserting into a
//! full store evicts the oldest entry by insertion order, together with any
//! expiry timer armed for it.
//!
//! # Finalization ownership
//!
//! Whoever takes a snapshot out of the store finalizes it. The run itself
//! takes it with [`SnapshotStore::take_for_run`]; manual rollback and expiry
//! take it with [`SnapshotStore::take_out_of_band`]. When an out-of-band
//! caller takes the snapshot of a run that is still in flight, the store
//! remembers the claim under the same lock, so the run later learns that it
//! must not call its participants again.
//!
//! A snapshot whose run applied nothing cannot be taken out of band: there
//! is nothing to undo and the run still owns its commit. While the apply
//! fan-out is running the snapshot is [`SnapshotPhase::Applying`]; an
//! out-of-band take registers itself and the run hands the snapshot over
//! once the apply settles, before the side effect starts.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::core::CorrelationId;
use crate::definition::InteractionDefinition;
use crate::participant::{Participant, StateBag};
use crate::timer::ExpiryTimer;

/// Default number of snapshots kept before the oldest is evicted.
pub const DEFAULT_SNAPSHOT_CAPACITY: usize = 100;

/// Where an outstanding snapshot is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotPhase {
    /// The optimistic apply fan-out has not settled yet.
    Applying,
    /// The run is still executing its side effect.
    InFlight,
    /// The side effect succeeded and commit waits for confirmation.
    AwaitingConfirmation,
}

/// Pre-operation state of every participant affected by a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub correlation_id: CorrelationId,
    pub definition: InteractionDefinition,
    /// Captured state per handler id; participants without state are absent.
    pub states: BTreeMap<String, StateBag>,
    pub created_at: DateTime<Utc>,
    /// Handler ids the optimistic apply was dispatched to. Rollback targets
    /// exactly this list.
    pub applied_to: Vec<String>,
    pub phase: SnapshotPhase,
}

impl Snapshot {
    pub fn new(
        correlation_id: CorrelationId,
        definition: InteractionDefinition,
        states: BTreeMap<String, StateBag>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            correlation_id,
            definition,
            states,
            created_at,
            applied_to: Vec::new(),
            phase: SnapshotPhase::InFlight,
        }
    }

    pub fn state_of(&self, handler_id: &str) -> Option<&StateBag> {
        self.states.get(handler_id)
    }
}

/// A snapshot taken out of the store, with what is needed to finalize it.
pub(crate) struct RemovedSnapshot {
    pub(crate) snapshot: Snapshot,
    pub(crate) participants: Vec<Arc<dyn Participant>>,
    pub(crate) expiry: Option<ExpiryTimer>,
}

impl RemovedSnapshot {
    /// Participants the optimistic apply was dispatched to.
    pub(crate) fn applied_participants(&self) -> Vec<Arc<dyn Participant>> {
        self.participants
            .iter()
            .filter(|p| {
                self.snapshot
                    .applied_to
                    .iter()
                    .any(|id| id == p.handler_id())
            })
            .cloned()
            .collect()
    }
}

/// Result of a run trying to take its own snapshot back.
pub(crate) enum RunClaim {
    /// The run owns finalization.
    Owned(RemovedSnapshot),
    /// A manual rollback already finalized the run.
    Claimed,
    /// The snapshot was evicted; the run finalizes from its own record.
    Missing,
}

/// Outcome of a single, non-waiting out-of-band take.
enum OutOfBand {
    Taken(RemovedSnapshot),
    /// The apply fan-out is still running; the run hands the snapshot over.
    Waiting(oneshot::Receiver<RemovedSnapshot>),
    /// Missing, nothing was applied, or another taker is already waiting.
    Unavailable,
}

struct Slot {
    seq: u64,
    snapshot: Snapshot,
    participants: Vec<Arc<dyn Participant>>,
    expiry: Option<ExpiryTimer>,
    handoff: Option<oneshot::Sender<RemovedSnapshot>>,
}

impl Slot {
    fn into_removed(self) -> RemovedSnapshot {
        RemovedSnapshot {
            snapshot: self.snapshot,
            participants: self.participants,
            expiry: self.expiry,
        }
    }
}

#[derive(Default)]
struct StoreInner {
    slots: HashMap<CorrelationId, Slot>,
    order: BTreeMap<u64, CorrelationId>,
    claimed: HashSet<CorrelationId>,
    next_seq: u64,
    closed: bool,
}

impl StoreInner {
    fn take(&mut self, cid: &CorrelationId) -> Option<Slot> {
        let slot = self.slots.remove(cid)?;
        self.order.remove(&slot.seq);
        Some(slot)
    }

    fn pop_oldest(&mut self) -> Option<Slot> {
        let (_, cid) = self.order.pop_first()?;
        self.slots.remove(&cid)
    }

    /// Put a taken snapshot back at its original position.
    fn restore(&mut self, seq: u64, removed: RemovedSnapshot) {
        let cid = removed.snapshot.correlation_id.clone();
        self.order.insert(seq, cid.clone());
        self.slots.insert(
            cid,
            Slot {
                seq,
                snapshot: removed.snapshot,
                participants: removed.participants,
                expiry: removed.expiry,
                handoff: None,
            },
        );
    }
}

/// Bounded, insertion-ordered map from correlation id to snapshot.
pub(crate) struct SnapshotStore {
    inner: Mutex<StoreInner>,
    capacity: usize,
}

impl SnapshotStore {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(StoreInner::default()),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            warn!("snapshot store mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    /// Insert a snapshot, evicting the oldest entries while the store is full.
    ///
    /// Returns the evicted snapshots. Their expiry timers are aborted.
    pub(crate) fn insert(
        &self,
        snapshot: Snapshot,
        participants: Vec<Arc<dyn Participant>>,
    ) -> Vec<Snapshot> {
        let mut evicted = Vec::new();
        let mut inner = self.lock();
        if inner.closed {
            warn!(cid = %snapshot.correlation_id, "snapshot store closed, snapshot not kept");
            return evicted;
        }
        let correlation_id = snapshot.correlation_id.clone();

        // Re-inserting a correlation id replaces the entry and its timer.
        drop(inner.take(&snapshot.correlation_id));

        while inner.slots.len() >= self.capacity {
            match inner.pop_oldest() {
                Some(slot) => {
                    warn!(
                        cid = %slot.snapshot.correlation_id,
                        capacity = self.capacity,
                        "snapshot store full, evicting oldest snapshot"
                    );
                    // dropping the slot aborts its expiry timer
                    evicted.push(slot.snapshot);
                }
                None => break,
            }
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.order.insert(seq, correlation_id.clone());
        inner.slots.insert(
            correlation_id,
            Slot {
                seq,
                snapshot,
                participants,
                expiry: None,
                handoff: None,
            },
        );
        evicted
    }

    /// Take a run's own snapshot back at the end of the run.
    pub(crate) fn take_for_run(&self, cid: &CorrelationId) -> RunClaim {
        let mut inner = self.lock();
        match inner.take(cid) {
            Some(slot) => RunClaim::Owned(slot.into_removed()),
            None if inner.claimed.remove(cid) => RunClaim::Claimed,
            None => RunClaim::Missing,
        }
    }

    /// Take a snapshot for manual rollback or expiry.
    ///
    /// While the run's apply fan-out is still running this waits for the run
    /// to hand the snapshot over. Returns `None` if the snapshot is gone, its
    /// run applied nothing, or another taker is already waiting for it.
    pub(crate) async fn take_out_of_band(&self, cid: &CorrelationId) -> Option<RemovedSnapshot> {
        match self.try_take_out_of_band(cid) {
            OutOfBand::Taken(removed) => Some(removed),
            OutOfBand::Unavailable => None,
            OutOfBand::Waiting(handoff) => {
                debug!(%cid, "waiting for optimistic apply to settle");
                // Eviction or close drops the sender.
                handoff.await.ok()
            }
        }
    }

    fn try_take_out_of_band(&self, cid: &CorrelationId) -> OutOfBand {
        let mut inner = self.lock();
        let Some(slot) = inner.slots.get_mut(cid) else {
            return OutOfBand::Unavailable;
        };
        if slot.snapshot.phase == SnapshotPhase::Applying {
            if slot.handoff.is_some() {
                return OutOfBand::Unavailable;
            }
            let (sender, receiver) = oneshot::channel();
            slot.handoff = Some(sender);
            return OutOfBand::Waiting(receiver);
        }
        if slot.snapshot.applied_to.is_empty() {
            return OutOfBand::Unavailable;
        }

        let Some(slot) = inner.take(cid) else {
            return OutOfBand::Unavailable;
        };
        if slot.snapshot.phase == SnapshotPhase::InFlight {
            inner.claimed.insert(cid.clone());
        }
        OutOfBand::Taken(slot.into_removed())
    }

    /// Whether a manual rollback has claimed this in-flight run.
    pub(crate) fn is_claimed(&self, cid: &CorrelationId) -> bool {
        self.lock().claimed.contains(cid)
    }

    /// Take a snapshot only if it is waiting for confirmation.
    pub(crate) fn take_awaiting(&self, cid: &CorrelationId) -> Option<RemovedSnapshot> {
        let mut inner = self.lock();
        let awaiting = inner
            .slots
            .get(cid)
            .map(|slot| slot.snapshot.phase == SnapshotPhase::AwaitingConfirmation)
            .unwrap_or(false);
        if !awaiting {
            return None;
        }
        inner.take(cid).map(Slot::into_removed)
    }

    /// Record which participants the optimistic apply is dispatched to and
    /// mark the snapshot [`SnapshotPhase::Applying`].
    pub(crate) fn begin_apply(&self, cid: &CorrelationId, handler_ids: Vec<String>) -> bool {
        match self.lock().slots.get_mut(cid) {
            Some(slot) => {
                slot.snapshot.applied_to = handler_ids;
                slot.snapshot.phase = SnapshotPhase::Applying;
                true
            }
            None => false,
        }
    }

    /// The apply fan-out settled: the snapshot goes back to
    /// [`SnapshotPhase::InFlight`], or to the out-of-band taker waiting for
    /// it. Returns true if it was handed over and the run is now claimed.
    pub(crate) fn finish_apply(&self, cid: &CorrelationId) -> bool {
        let mut inner = self.lock();
        let Some(slot) = inner.slots.get_mut(cid) else {
            return false;
        };
        if slot.snapshot.phase == SnapshotPhase::Applying {
            slot.snapshot.phase = SnapshotPhase::InFlight;
        }
        let Some(handoff) = slot.handoff.take() else {
            return false;
        };
        let Some(slot) = inner.take(cid) else {
            return false;
        };

        let seq = slot.seq;
        inner.claimed.insert(cid.clone());
        match handoff.send(slot.into_removed()) {
            Ok(()) => true,
            Err(removed) => {
                debug!(%cid, "out-of-band taker went away, run keeps its snapshot");
                inner.claimed.remove(cid);
                inner.restore(seq, removed);
                false
            }
        }
    }

    pub(crate) fn set_phase(&self, cid: &CorrelationId, phase: SnapshotPhase) -> bool {
        match self.lock().slots.get_mut(cid) {
            Some(slot) => {
                slot.snapshot.phase = phase;
                true
            }
            None => false,
        }
    }

    /// Attach an expiry timer. If the snapshot is already gone the timer is
    /// dropped (and aborted) and false is returned.
    pub(crate) fn arm(&self, cid: &CorrelationId, timer: ExpiryTimer) -> bool {
        let mut inner = self.lock();
        match inner.slots.get_mut(cid) {
            Some(slot) => {
                // Replacing an existing timer aborts it.
                slot.expiry = Some(timer);
                true
            }
            None => {
                drop(inner);
                drop(timer);
                false
            }
        }
    }

    pub(crate) fn has_timer(&self, cid: &CorrelationId) -> bool {
        self.lock()
            .slots
            .get(cid)
            .map(|slot| slot.expiry.is_some())
            .unwrap_or(false)
    }

    pub(crate) fn get(&self, cid: &CorrelationId) -> Option<Snapshot> {
        self.lock().slots.get(cid).map(|slot| slot.snapshot.clone())
    }

    pub(crate) fn contains(&self, cid: &CorrelationId) -> bool {
        self.lock().slots.contains_key(cid)
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().slots.len()
    }

    /// Correlation ids, oldest first.
    pub(crate) fn ids(&self) -> Vec<CorrelationId> {
        self.lock().order.values().cloned().collect()
    }

    /// Drop every snapshot and claim, aborting every timer. Later inserts
    /// are ignored.
    pub(crate) fn close(&self) -> usize {
        let slots = {
            let mut inner = self.lock();
            inner.closed = true;
            inner.order.clear();
            inner.claimed.clear();
            std::mem::take(&mut inner.slots)
        };
        // Timers are aborted and waiting takers released here, outside the lock.
        slots.len()
    }
}

impl std::fmt::Debug for SnapshotStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotStore")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}
