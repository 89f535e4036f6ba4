//! Expiry timers for deferred finalization.
//!
//! An [`ExpiryTimer`] runs a callback once its deadline passes unless it is
//! disarmed first. Dropping an armed timer aborts it, so a timer stored next
//! to a snapshot dies with the snapshot (eviction, confirmation, rollback).
//!
//! The callback of a firing timer usually removes the very snapshot the
//! timer is stored with. That path must call [`ExpiryTimer::defuse`] on the
//! timer it removed, otherwise dropping it would abort the running callback.

use std::future::Future;
use std::time::Duration;

use tokio::task::AbortHandle;
use tokio::time::Instant;

pub(crate) struct ExpiryTimer {
    handle: Option<AbortHandle>,
    deadline: Instant,
}

impl ExpiryTimer {
    /// Spawn a timer that runs `on_expire` after `after`.
    pub(crate) fn arm<F, Fut>(after: Duration, on_expire: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let deadline = Instant::now() + after;
        let task = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            on_expire().await;
        });
        Self {
            handle: Some(task.abort_handle()),
            deadline,
        }
    }

    /// Cancel the timer. A no-op if it already fired.
    pub(crate) fn disarm(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    /// Forget the timer without aborting its task.
    pub(crate) fn defuse(mut self) {
        self.handle = None;
    }

    pub(crate) fn deadline(&self) -> Instant {
        self.deadline
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.handle
            .as_ref()
            .map(AbortHandle::is_finished)
            .unwrap_or(true)
    }
}

impl Drop for ExpiryTimer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for ExpiryTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpiryTimer")
            .field("deadline", &self.deadline)
            .field("armed", &self.handle.is_some())
            .field("finished", &self.is_finished())
            .finish()
    }
}
