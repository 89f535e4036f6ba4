//! Broadcast channel for run results.
//!
//! # Guarantees
//!
//! - **At-most-once delivery**: slow receivers may miss results
//! - **In-memory only**: results are not persisted
//! - **No replay**: subscribers only see results emitted after subscribing,
//!   lagged receivers get `RecvError::Lagged`
//!
//! Results are emitted in the order runs complete. Closing the bus (engine
//! disposal) ends every subscription: receivers get `RecvError::Closed` and
//! streams terminate.

use std::sync::{Mutex, MutexGuard};

use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::warn;

use crate::result::InteractionResult;

/// Default channel capacity for the result bus.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Broadcast bus carrying every [`InteractionResult`] the engine produces.
///
/// # Example
///
/// ```ignore
/// let mut results = engine.subscribe();
///
/// engine.execute(definition, ExecuteOptions::default()).await?;
///
/// let result = results.recv().await?;
/// if result.is_rollback() {
///     println!("rolled back: {:?}", result.error());
/// }
/// ```
pub struct ResultBus {
    sender: Mutex<Option<broadcast::Sender<InteractionResult>>>,
}

impl ResultBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a bus buffering up to `capacity` results per slow receiver.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Mutex::new(Some(sender)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<broadcast::Sender<InteractionResult>>> {
        self.sender.lock().unwrap_or_else(|poisoned| {
            warn!("result bus mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Emit a result to all subscribers.
    ///
    /// Returns the number of receivers that received it (zero once closed).
    pub fn emit(&self, result: InteractionResult) -> usize {
        match self.lock().as_ref() {
            Some(sender) => sender.send(result).unwrap_or(0),
            None => 0,
        }
    }

    /// Subscribe to results.
    ///
    /// On a closed bus the returned receiver is already closed.
    pub fn subscribe(&self) -> broadcast::Receiver<InteractionResult> {
        match self.lock().as_ref() {
            Some(sender) => sender.subscribe(),
            None => {
                let (sender, receiver) = broadcast::channel(1);
                drop(sender);
                receiver
            }
        }
    }

    /// Subscribe as a `Stream`, skipping over results missed due to lag.
    pub fn stream(&self) -> impl Stream<Item = InteractionResult> + Send + 'static {
        BroadcastStream::new(self.subscribe()).filter_map(|item| match item {
            Ok(result) => Some(result),
            Err(lagged) => {
                warn!(error = %lagged, "result stream lagged, results were dropped");
                None
            }
        })
    }

    /// Close the bus. Idempotent.
    pub fn close(&self) {
        self.lock().take();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().is_none()
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock()
            .as_ref()
            .map(broadcast::Sender::receiver_count)
            .unwrap_or(0)
    }
}

impl Default for ResultBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ResultBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultBus")
            .field("subscriber_count", &self.subscriber_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}
