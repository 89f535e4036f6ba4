//! Best-effort fan-out of participant callbacks.
//!
//! All members of a fan-out run concurrently and are awaited together. A
//! member that errors or panics is recorded as failed in the
//! [`BatchReport`]; it never aborts its siblings.

use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::anyhow;
use futures::future::join_all;
use futures::FutureExt;
use tracing::{error, warn};

use crate::core::CorrelationId;
use crate::definition::InteractionDefinition;
use crate::error::{BatchReport, FanOutPhase, ParticipantOutcome};
use crate::participant::{Participant, StateBag};

/// Fan `phase` out to every participant and collect the outcomes in order.
pub(crate) async fn fan_out(
    phase: FanOutPhase,
    participants: &[Arc<dyn Participant>],
    cid: &CorrelationId,
    definition: &InteractionDefinition,
) -> BatchReport {
    let calls = participants.iter().map(|participant| async move {
        let handler_id = participant.handler_id().to_string();
        let call = async {
            match phase {
                FanOutPhase::ApplyOptimistic => participant.apply_optimistic(cid, definition).await,
                FanOutPhase::Commit => participant.commit(cid, definition).await,
                FanOutPhase::Rollback => participant.rollback(cid, definition).await,
            }
        };

        match guarded(call).await {
            Ok(()) => ParticipantOutcome::succeeded(handler_id),
            Err(e) => {
                warn!(%cid, handler_id = %handler_id, %phase, error = %e, "participant callback failed");
                ParticipantOutcome::failed(handler_id, format!("{:#}", e))
            }
        }
    });

    BatchReport {
        phase,
        outcomes: join_all(calls).await,
    }
}

/// Query every participant's current state.
///
/// Errors and panics are logged and treated as "no state available".
pub(crate) fn capture_states(
    participants: &[Arc<dyn Participant>],
    cid: &CorrelationId,
) -> BTreeMap<String, StateBag> {
    let mut states = BTreeMap::new();
    for participant in participants {
        let handler_id = participant.handler_id();
        let captured = std::panic::catch_unwind(AssertUnwindSafe(|| participant.current_state()));
        match captured {
            Ok(Ok(Some(state))) => {
                states.insert(handler_id.to_string(), state);
            }
            Ok(Ok(None)) => {}
            Ok(Err(e)) => {
                warn!(%cid, handler_id, error = %e, "state capture failed, continuing without state");
            }
            Err(panic_info) => {
                let panic_msg = extract_panic_message(&panic_info);
                error!(%cid, handler_id, panic = %panic_msg, "state capture panicked");
            }
        }
    }
    states
}

/// Await `fut`, turning a panic into an error.
pub(crate) async fn guarded<T, F>(fut: F) -> anyhow::Result<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    // AssertUnwindSafe is required because participants are not UnwindSafe
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(panic_info) => {
            let panic_msg = extract_panic_message(&panic_info);
            error!(panic = %panic_msg, "participant code panicked");
            Err(anyhow!("panicked: {}", panic_msg))
        }
    }
}

fn extract_panic_message(panic_info: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic_info.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic_info.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
