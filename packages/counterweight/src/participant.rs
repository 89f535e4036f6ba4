//! Participant and side-effect executor contracts.
//!
//! Participants are application-owned collaborators that hold provisional
//! state for the interactions they recognise. For one run the engine calls:
//!
//! ```text
//! current_state()         (best effort, before anything is mutated)
//! apply_optimistic(cid)   (if optimistic)
//! execute(definition)     (only the first participant returning Some is used)
//! commit(cid) | rollback(cid)
//! ```
//!
//! Participant errors are isolated: a failing callback is logged and
//! reported in a [`BatchReport`](crate::BatchReport), it never aborts the
//! run or its sibling participants.
//!
//! # Example
//!
//! ```ignore
//! use counterweight::{async_trait, CorrelationId, InteractionDefinition, Participant};
//!
//! struct LikeCounter {
//!     likes: Mutex<HashMap<u64, u64>>,
//! }
//!
//! #[async_trait]
//! impl Participant for LikeCounter {
//!     fn handler_id(&self) -> &str {
//!         "like-counter"
//!     }
//!
//!     fn can_handle(&self, definition: &InteractionDefinition) -> bool {
//!         definition.id() == "like-post"
//!     }
//!
//!     async fn apply_optimistic(&self, _cid: &CorrelationId, def: &InteractionDefinition) -> Result<()> {
//!         let like: LikePost = def.payload().decode()?;
//!         *self.likes.lock().unwrap().entry(like.post_id).or_default() += 1;
//!         Ok(())
//!     }
//!
//!     async fn rollback(&self, _cid: &CorrelationId, def: &InteractionDefinition) -> Result<()> {
//!         let like: LikePost = def.payload().decode()?;
//!         *self.likes.lock().unwrap().entry(like.post_id).or_default() -= 1;
//!         Ok(())
//!     }
//!
//!     async fn commit(&self, _cid: &CorrelationId, _def: &InteractionDefinition) -> Result<()> {
//!         Ok(())
//!     }
//! }
//! ```

use std::collections::BTreeMap;
use std::future::Future;
use std::marker::PhantomData;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::core::CorrelationId;
use crate::definition::InteractionDefinition;
use crate::result::InteractionResult;

/// Opaque captured state of one participant.
pub type StateBag = BTreeMap<String, Value>;

/// A collaborator that applies, commits or undoes provisional effects.
///
/// `handler_id` must be stable and unique among registered participants;
/// registering another participant with the same id replaces this one.
#[async_trait]
pub trait Participant: Send + Sync + 'static {
    /// Stable identifier of this participant.
    fn handler_id(&self) -> &str;

    /// Whether this participant takes part in runs of `definition`.
    fn can_handle(&self, definition: &InteractionDefinition) -> bool;

    /// Apply the speculative effect before the real side effect is known.
    async fn apply_optimistic(
        &self,
        cid: &CorrelationId,
        definition: &InteractionDefinition,
    ) -> Result<()>;

    /// Undo the speculative effect.
    async fn rollback(&self, cid: &CorrelationId, definition: &InteractionDefinition)
        -> Result<()>;

    /// Finalize the speculative effect after the side effect succeeded.
    async fn commit(&self, cid: &CorrelationId, definition: &InteractionDefinition) -> Result<()>;

    /// Perform the real side effect.
    ///
    /// `Ok(None)` defers to the next participant or to the global executors.
    /// An `Err` is the side effect's failure.
    async fn execute(&self, _definition: &InteractionDefinition) -> Result<Option<InteractionResult>> {
        Ok(None)
    }

    /// Snapshot of the participant's current state, if it keeps one.
    fn current_state(&self) -> Result<Option<StateBag>> {
        Ok(None)
    }
}

/// Fallback executor used when no matched participant performs the side
/// effect itself.
#[async_trait]
pub trait SideEffectExecutor: Send + Sync + 'static {
    /// Perform the side effect. An `Err` moves on to the next executor.
    async fn execute(&self, definition: &InteractionDefinition) -> Result<InteractionResult>;
}

/// Adapter turning an async closure into a [`SideEffectExecutor`].
///
/// ```ignore
/// engine.register_executor(FnExecutor::new(|def: InteractionDefinition| async move {
///     api.send(def.payload()).await?;
///     Ok(InteractionResult::success(None))
/// }));
/// ```
pub struct FnExecutor<F, Fut> {
    f: F,
    _marker: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnExecutor<F, Fut>
where
    F: Fn(InteractionDefinition) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<InteractionResult>> + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut> SideEffectExecutor for FnExecutor<F, Fut>
where
    F: Fn(InteractionDefinition) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<InteractionResult>> + Send + 'static,
{
    async fn execute(&self, definition: &InteractionDefinition) -> Result<InteractionResult> {
        (self.f)(definition.clone()).await
    }
}
