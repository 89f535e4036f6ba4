//! Registry of participants and global side-effect executors.
//!
//! Both lists are shared engine state and guarded by `RwLock`s. Lock guards
//! are never held across an await: discovery clones the matching `Arc`s out.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, warn};

use crate::definition::InteractionDefinition;
use crate::participant::{Participant, SideEffectExecutor};

#[derive(Default)]
pub(crate) struct Registry {
    participants: RwLock<Vec<Arc<dyn Participant>>>,
    executors: RwLock<Vec<Arc<dyn SideEffectExecutor>>>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| {
        warn!("registry lock was poisoned, recovering");
        poisoned.into_inner()
    })
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| {
        warn!("registry lock was poisoned, recovering");
        poisoned.into_inner()
    })
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a participant, replacing any participant with the same id.
    ///
    /// Returns true if an existing registration was replaced.
    pub(crate) fn register(&self, participant: Arc<dyn Participant>) -> bool {
        let mut participants = write(&self.participants);
        let id = participant.handler_id().to_string();
        match participants.iter().position(|p| p.handler_id() == id) {
            Some(index) => {
                debug!(handler_id = %id, "replacing participant registration");
                participants[index] = participant;
                true
            }
            None => {
                debug!(handler_id = %id, "registering participant");
                participants.push(participant);
                false
            }
        }
    }

    pub(crate) fn unregister(&self, handler_id: &str) -> bool {
        let mut participants = write(&self.participants);
        let before = participants.len();
        participants.retain(|p| p.handler_id() != handler_id);
        participants.len() != before
    }

    pub(crate) fn register_executor(&self, executor: Arc<dyn SideEffectExecutor>) {
        write(&self.executors).push(executor);
    }

    /// Participants whose predicate accepts `definition`, in registration order.
    pub(crate) fn discover(&self, definition: &InteractionDefinition) -> Vec<Arc<dyn Participant>> {
        read(&self.participants)
            .iter()
            .filter(|p| p.can_handle(definition))
            .cloned()
            .collect()
    }

    pub(crate) fn executors(&self) -> Vec<Arc<dyn SideEffectExecutor>> {
        read(&self.executors).clone()
    }

    pub(crate) fn participant_count(&self) -> usize {
        read(&self.participants).len()
    }

    pub(crate) fn executor_count(&self) -> usize {
        read(&self.executors).len()
    }

    pub(crate) fn clear(&self) {
        write(&self.participants).clear();
        write(&self.executors).clear();
    }

    pub(crate) fn clear_participants(&self) {
        write(&self.participants).clear();
    }
}
