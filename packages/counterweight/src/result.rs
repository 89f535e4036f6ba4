//! Immutable outcome of a run.
//!
//! A result is either a success, an error, or an error that also records a
//! rollback. Rollback and timeout are marked through well-known metadata
//! keys so that consumers of the result stream can filter on them without a
//! separate event type.
//!
//! `with_*` methods consume the value and return a new one; nothing mutates
//! a result after it has been handed out.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::CorrelationId;
use crate::definition::Payload;
use crate::error::{BatchReport, EngineError};

/// Metadata key set to `true` on results that report a rollback.
pub const METADATA_ROLLBACK: &str = "rollback";
/// Metadata key set to `true` on results produced by a side-effect timeout.
pub const METADATA_TIMEOUT: &str = "timeout";
/// Metadata key listing handler ids whose rollback failed.
pub const METADATA_ROLLBACK_FAILURES: &str = "rollback_failures";
/// Metadata key listing handler ids whose commit failed.
pub const METADATA_COMMIT_FAILURES: &str = "commit_failures";
/// Metadata key listing handler ids whose optimistic apply failed.
pub const METADATA_APPLY_FAILURES: &str = "apply_failures";
/// Metadata key carrying the run phase the result was produced in.
pub const METADATA_PHASE: &str = "phase";
/// Metadata key naming why a rollback happened (`side_effect`, `manual`, `expired`).
pub const METADATA_ROLLBACK_REASON: &str = "rollback_reason";
/// Metadata key carrying the definition identity of a run that has no
/// correlation id because its task failed.
pub const METADATA_IDENTITY: &str = "identity";

/// Coarse classification of a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultKind {
    Success,
    Error,
    Rollback,
}

/// Outcome of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionResult {
    success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Payload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    correlation_id: Option<CorrelationId>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    metadata: BTreeMap<String, Value>,
}

impl InteractionResult {
    /// A successful result with an optional payload.
    pub fn success(data: Option<Payload>) -> Self {
        Self {
            success: true,
            data,
            error: None,
            timestamp: Utc::now(),
            correlation_id: None,
            metadata: BTreeMap::new(),
        }
    }

    /// A failed result with a human-readable description.
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            timestamp: Utc::now(),
            correlation_id: None,
            metadata: BTreeMap::new(),
        }
    }

    /// A failed result describing an exceeded side-effect deadline.
    pub fn timed_out(duration: Duration) -> Self {
        Self::failure(EngineError::Timeout { duration }.to_string())
            .with_metadata(METADATA_TIMEOUT, Value::Bool(true))
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    pub fn is_error(&self) -> bool {
        !self.success
    }

    pub fn data(&self) -> Option<&Payload> {
        self.data.as_ref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn correlation_id(&self) -> Option<&CorrelationId> {
        self.correlation_id.as_ref()
    }

    pub fn metadata(&self) -> &BTreeMap<String, Value> {
        &self.metadata
    }

    pub fn metadata_value(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    fn flag(&self, key: &str) -> bool {
        self.metadata
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn is_rollback(&self) -> bool {
        self.flag(METADATA_ROLLBACK)
    }

    pub fn is_timeout(&self) -> bool {
        self.flag(METADATA_TIMEOUT)
    }

    pub fn kind(&self) -> ResultKind {
        if self.is_rollback() {
            ResultKind::Rollback
        } else if self.success {
            ResultKind::Success
        } else {
            ResultKind::Error
        }
    }

    /// Handler ids listed under a metadata key (empty if absent).
    pub fn handler_ids(&self, key: &str) -> Vec<String> {
        self.metadata
            .get(key)
            .and_then(Value::as_array)
            .map(|ids| {
                ids.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn with_correlation(mut self, cid: CorrelationId) -> Self {
        self.correlation_id = Some(cid);
        self
    }

    pub fn with_data(mut self, data: Payload) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Mark the result as reporting a rollback, recording which participants
    /// failed to roll back.
    pub fn with_rollback(self, report: &BatchReport, reason: &str) -> Self {
        let failed = report.failed_ids();
        let marked = self
            .with_metadata(METADATA_ROLLBACK, Value::Bool(true))
            .with_metadata(METADATA_ROLLBACK_REASON, Value::String(reason.to_string()));
        if failed.is_empty() {
            marked
        } else {
            marked.with_metadata(METADATA_ROLLBACK_FAILURES, ids_value(failed))
        }
    }

    /// Record the failing handler ids of a fan-out under `key`, if any.
    pub fn with_failures(self, key: &str, report: &BatchReport) -> Self {
        let failed = report.failed_ids();
        if failed.is_empty() {
            self
        } else {
            self.with_metadata(key, ids_value(failed))
        }
    }
}

fn ids_value(ids: Vec<String>) -> Value {
    Value::Array(ids.into_iter().map(Value::String).collect())
}
