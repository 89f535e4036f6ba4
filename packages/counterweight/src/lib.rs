//! # Counterweight
//!
//! An interaction execution engine: apply an optimistic effect across every
//! interested participant, perform the real side effect under a deadline,
//! then commit or compensate.
//!
//! ## Core Concepts
//!
//! - [`InteractionDefinition`] = what the user asked for (identity, payload,
//!   timeout, optional compensating interaction)
//! - [`Participant`] = a piece of local state that reacts to definitions
//!   (apply optimistically, commit, roll back, optionally perform the side
//!   effect itself)
//! - [`SideEffectExecutor`] = global fallback that performs the side effect
//!   when no participant does
//! - [`InteractionResult`] = the outcome of a run, broadcast to subscribers
//!
//! The key principle: **the UI moves first, the world catches up**. Local
//! state is updated before the side effect, and a failed or timed-out side
//! effect restores it.
//!
//! ## Architecture
//!
//! ```text
//! engine.execute(def)
//!     │
//!     ▼ admit (duplicate identities rejected)
//! ExecutionQueue ── lane ──┐
//!                          ▼
//!                   discover participants
//!                          │
//!            ┌─────────────┴──────────────┐
//!            │ none                       │ some
//!            ▼                            ▼
//!     global executors            capture Snapshot ─► SnapshotStore (bounded)
//!            │                            │
//!            │                            ▼
//!            │                  apply_optimistic (fan-out)
//!            │                            │
//!            │                            ▼
//!            │                side effect (under timeout)
//!            │                            │
//!            │              ┌─────────────┼───────────────┐
//!            │              ▼             ▼               ▼
//!            │           commit       rollback     await confirmation
//!            │          (fan-out)     (fan-out)    (expiry timer armed)
//!            │              │             │               │
//!            └──────────────┴──────┬──────┴───────────────┘
//!                                  ▼
//!                              ResultBus
//! ```
//!
//! ## Key Invariants
//!
//! 1. **One run per identity** - A second submission of an identity that is
//!    still in flight is rejected with [`EngineError::DuplicateInFlight`]
//! 2. **Snapshots are bounded** - At most `snapshot_capacity` runs keep a
//!    snapshot; the oldest is evicted first
//! 3. **Finalize once** - Each applied participant sees exactly one commit or
//!    one rollback per run
//! 4. **Best-effort fan-out** - One failing participant never prevents the
//!    others from being called
//!
//! ## Guarantees
//!
//! - **At-most-once delivery**: slow result subscribers may miss results
//! - **In-memory only**: snapshots and results are not persisted
//! - **Timeouts do not cancel**: a timed-out side effect keeps running; its
//!   outcome is ignored
//!
//! ## Example
//!
//! ```ignore
//! use counterweight::{async_trait, Engine, ExecuteOptions, InteractionDefinition, Participant};
//!
//! struct LikeCounter { likes: AtomicI64 }
//!
//! #[async_trait]
//! impl Participant for LikeCounter {
//!     fn handler_id(&self) -> &str { "like-counter" }
//!
//!     fn can_handle(&self, def: &InteractionDefinition) -> bool {
//!         def.id() == "like-post"
//!     }
//!
//!     async fn apply_optimistic(&self, _cid: &CorrelationId, _def: &InteractionDefinition) -> anyhow::Result<()> {
//!         self.likes.fetch_add(1, Ordering::SeqCst);
//!         Ok(())
//!     }
//!
//!     async fn rollback(&self, _cid: &CorrelationId, _def: &InteractionDefinition) -> anyhow::Result<()> {
//!         self.likes.fetch_sub(1, Ordering::SeqCst);
//!         Ok(())
//!     }
//!
//!     async fn commit(&self, _cid: &CorrelationId, _def: &InteractionDefinition) -> anyhow::Result<()> {
//!         Ok(())
//!     }
//! }
//!
//! let engine = Engine::builder()
//!     .with_participant(LikeCounter { likes: AtomicI64::new(0) })
//!     .with_executor(FnExecutor::new(|def: InteractionDefinition| async move {
//!         api.like(def.payload()).await?;
//!         Ok(InteractionResult::success(None))
//!     }))
//!     .build();
//!
//! let like = InteractionDefinition::builder("like-post").build()?;
//! let result = engine.execute(like, ExecuteOptions::default()).await?;
//! ```
//!
//! ## What This Is Not
//!
//! Counterweight is **not**:
//! - A distributed transaction manager
//! - A durable job queue
//! - A retry framework

// Core modules
mod bus;
mod config;
mod core;
mod definition;
mod engine;
mod error;
mod fanout;
mod participant;
mod queue;
mod registry;
mod result;
mod snapshot;
mod timer;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;


// Re-export core types
pub use crate::core::{CorrelationId, RunPhase};

// Re-export definition types
pub use definition::{InteractionDefinition, InteractionDefinitionBuilder, Payload, MAX_IDENTITY_LEN};

// Re-export result types
pub use result::{
    InteractionResult, ResultKind, METADATA_APPLY_FAILURES, METADATA_COMMIT_FAILURES,
    METADATA_IDENTITY, METADATA_PHASE, METADATA_ROLLBACK, METADATA_ROLLBACK_FAILURES,
    METADATA_ROLLBACK_REASON, METADATA_TIMEOUT,
};

// Re-export error types
pub use crate::error::{BatchReport, EngineError, FanOutPhase, ParticipantOutcome};

// Re-export participant types
pub use participant::{FnExecutor, Participant, SideEffectExecutor, StateBag};

// Re-export snapshot types
pub use snapshot::{Snapshot, SnapshotPhase, DEFAULT_SNAPSHOT_CAPACITY};

// Re-export queue types
pub use queue::QueueStrategy;

// Re-export bus types
pub use bus::ResultBus;

// Re-export configuration
pub use config::{EngineConfig, DEFAULT_TIMEOUT};

// Re-export engine types (primary entry point)
pub use engine::{Engine, EngineBuilder, ExecuteOptions};

// Re-export commonly used external types
pub use async_trait::async_trait;
