//! Counterweight demo
//!
//! Runs one interaction that commits and one that is rolled back against two
//! in-memory participants, printing the results as they are broadcast.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use counterweight::{
    async_trait, CorrelationId, Engine, EngineConfig, ExecuteOptions, FnExecutor,
    InteractionDefinition, InteractionResult, Participant, Payload, StateBag,
};
use tokio_stream::StreamExt;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Counter bumped optimistically for every matching interaction.
struct Counter {
    id: &'static str,
    handles: &'static str,
    value: AtomicI64,
}

impl Counter {
    fn new(id: &'static str, handles: &'static str) -> Arc<Self> {
        Arc::new(Self {
            id,
            handles,
            value: AtomicI64::new(0),
        })
    }
}

#[async_trait]
impl Participant for Counter {
    fn handler_id(&self) -> &str {
        self.id
    }

    fn can_handle(&self, definition: &InteractionDefinition) -> bool {
        definition.id().starts_with(self.handles)
    }

    async fn apply_optimistic(&self, cid: &CorrelationId, _def: &InteractionDefinition) -> Result<()> {
        let now = self.value.fetch_add(1, Ordering::SeqCst) + 1;
        info!(%cid, counter = self.id, value = now, "optimistic +1");
        Ok(())
    }

    async fn rollback(&self, cid: &CorrelationId, _def: &InteractionDefinition) -> Result<()> {
        let now = self.value.fetch_sub(1, Ordering::SeqCst) - 1;
        info!(%cid, counter = self.id, value = now, "rolled back");
        Ok(())
    }

    async fn commit(&self, cid: &CorrelationId, _def: &InteractionDefinition) -> Result<()> {
        info!(%cid, counter = self.id, "committed");
        Ok(())
    }

    fn current_state(&self) -> Result<Option<StateBag>> {
        let mut state = BTreeMap::new();
        state.insert("value".to_string(), self.value.load(Ordering::SeqCst).into());
        Ok(Some(state))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,counterweight=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    let config = EngineConfig::from_env().context("Failed to load engine configuration")?;
    info!(?config, "starting counterweight demo");

    let likes = Counter::new("likes", "like");
    let follows = Counter::new("follows", "follow");

    let engine = Engine::builder()
        .with_config(config)
        .with_shared_participant(likes.clone())
        .with_shared_participant(follows.clone())
        .with_executor(FnExecutor::new(|def: InteractionDefinition| async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            if def.payload().get("blocked").and_then(|v| v.as_bool()) == Some(true) {
                Ok(InteractionResult::failure("remote service refused the request"))
            } else {
                Ok(InteractionResult::success(None))
            }
        }))
        .build();

    let stream = engine.result_stream();
    let printer = tokio::spawn(async move {
        tokio::pin!(stream);
        while let Some(result) = stream.next().await {
            info!(
                cid = ?result.correlation_id(),
                kind = ?result.kind(),
                error = result.error().unwrap_or(""),
                "result broadcast"
            );
        }
    });

    let like = InteractionDefinition::builder("like-post")
        .payload(Payload::from(serde_json::json!({ "post_id": 7 })))
        .timeout(Duration::from_secs(2))
        .build()?;
    let result = engine.execute(like, ExecuteOptions::default()).await?;
    info!(success = result.is_success(), likes = likes.value.load(Ordering::SeqCst), "like finished");

    let follow = InteractionDefinition::builder("follow-user")
        .payload(Payload::from(serde_json::json!({ "user_id": 3, "blocked": true })))
        .build()?;
    let result = engine.execute(follow, ExecuteOptions::default()).await?;
    info!(
        rolled_back = result.is_rollback(),
        follows = follows.value.load(Ordering::SeqCst),
        "follow finished"
    );

    engine.dispose();
    printer.await.context("result printer failed")?;
    Ok(())
}
