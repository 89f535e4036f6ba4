//! Interaction definitions: immutable descriptions of a mutating operation.
//!
//! A definition names the operation (its *identity*), carries a typed
//! [`Payload`], and optionally a timeout, an optimistic-support flag, a
//! priority, tags and a compensating definition. Definitions are built with
//! [`InteractionDefinitionBuilder`], whose `build()` re-runs validation and
//! refuses to hand back an invalid value.
//!
//! # Example
//!
//! ```ignore
//! use counterweight::{InteractionDefinition, Payload};
//!
//! let like = InteractionDefinition::builder("like-post")
//!     .payload(Payload::encode(&LikePost { post_id: 42 })?)
//!     .timeout(Duration::from_secs(5))
//!     .tag("social")
//!     .compensation(
//!         InteractionDefinition::builder("unlike-post")
//!             .payload(Payload::encode(&UnlikePost { post_id: 42 })?)
//!             .build()?,
//!     )
//!     .build()?;
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EngineError;

/// Longest identity accepted by validation.
pub const MAX_IDENTITY_LEN: usize = 256;

// =============================================================================
// Payload
// =============================================================================

/// Payload carried by a definition or a result.
///
/// A tagged union instead of an untyped blob: participants either match on
/// the variant or ask for a typed view with [`Payload::decode`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Payload {
    #[default]
    Empty,
    Text(String),
    Number(f64),
    Flag(bool),
    Map(BTreeMap<String, Value>),
    Json(Value),
}

impl Payload {
    /// Build a payload from any serializable value.
    pub fn encode<T: Serialize>(value: &T) -> Result<Self, EngineError> {
        serde_json::to_value(value)
            .map(Self::from_value)
            .map_err(|e| EngineError::PayloadEncode {
                message: e.to_string(),
            })
    }

    /// Classify a JSON value into the closest variant.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Null => Payload::Empty,
            Value::Bool(b) => Payload::Flag(b),
            Value::String(s) => Payload::Text(s),
            Value::Object(map) => Payload::Map(map.into_iter().collect()),
            other => Payload::Json(other),
        }
    }

    /// View the payload as a JSON value.
    pub fn to_value(&self) -> Value {
        match self {
            Payload::Empty => Value::Null,
            Payload::Text(s) => Value::String(s.clone()),
            Payload::Number(n) => Value::from(*n),
            Payload::Flag(b) => Value::Bool(*b),
            Payload::Map(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            ),
            Payload::Json(v) => v.clone(),
        }
    }

    /// Decode the payload into a concrete type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, EngineError> {
        serde_json::from_value(self.to_value()).map_err(|e| EngineError::PayloadDecode {
            message: e.to_string(),
        })
    }

    /// Look up a key when the payload is a map (or a JSON object).
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Payload::Map(map) => map.get(key),
            Payload::Json(Value::Object(map)) => map.get(key),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Payload::Empty)
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Payload::Text(value)
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Payload::Text(value.to_string())
    }
}

impl From<f64> for Payload {
    fn from(value: f64) -> Self {
        Payload::Number(value)
    }
}

impl From<bool> for Payload {
    fn from(value: bool) -> Self {
        Payload::Flag(value)
    }
}

impl From<BTreeMap<String, Value>> for Payload {
    fn from(value: BTreeMap<String, Value>) -> Self {
        Payload::Map(value)
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::from_value(value)
    }
}

// =============================================================================
// Interaction Definition
// =============================================================================

/// Immutable description of a mutating operation.
///
/// The identity is chosen by the application and reused across executions;
/// it is the key for duplicate-in-flight admission control.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionDefinition {
    id: String,
    #[serde(default)]
    payload: Payload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    compensation: Option<Box<InteractionDefinition>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timeout: Option<Duration>,
    #[serde(default = "default_supports_optimistic")]
    supports_optimistic: bool,
    #[serde(default)]
    priority: i32,
    #[serde(default)]
    tags: BTreeSet<String>,
}

fn default_supports_optimistic() -> bool {
    true
}

impl InteractionDefinition {
    /// Start building a definition with the given identity.
    pub fn builder(id: impl Into<String>) -> InteractionDefinitionBuilder {
        InteractionDefinitionBuilder::new(id)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn compensation(&self) -> Option<&InteractionDefinition> {
        self.compensation.as_deref()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Timeout to apply when the definition does not carry its own.
    pub fn timeout_or(&self, default: Duration) -> Duration {
        self.timeout.unwrap_or(default)
    }

    pub fn supports_optimistic(&self) -> bool {
        self.supports_optimistic
    }

    /// Informational; the engine does not order runs by priority.
    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    /// Returns true if the definition is valid. Pure.
    pub fn validate(&self) -> bool {
        self.validation_errors().is_empty()
    }

    /// Human-readable validation errors; empty if and only if valid.
    pub fn validation_errors(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.id.trim().is_empty() {
            errors.push("id must not be empty".to_string());
        } else if self.id.len() > MAX_IDENTITY_LEN {
            errors.push(format!(
                "id must be at most {} bytes, got {}",
                MAX_IDENTITY_LEN,
                self.id.len()
            ));
        }

        if self.timeout == Some(Duration::ZERO) {
            errors.push("timeout must be greater than zero".to_string());
        }

        if self.tags.iter().any(|t| t.trim().is_empty()) {
            errors.push("tags must not be blank".to_string());
        }

        if let Some(compensation) = &self.compensation {
            if compensation.id == self.id {
                errors.push("compensation must not share the definition's id".to_string());
            }
            errors.extend(
                compensation
                    .validation_errors()
                    .into_iter()
                    .map(|e| format!("compensation: {}", e)),
            );
        }

        errors
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`InteractionDefinition`].
#[derive(Debug, Clone)]
pub struct InteractionDefinitionBuilder {
    definition: InteractionDefinition,
}

impl InteractionDefinitionBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            definition: InteractionDefinition {
                id: id.into(),
                payload: Payload::Empty,
                compensation: None,
                timeout: None,
                supports_optimistic: true,
                priority: 0,
                tags: BTreeSet::new(),
            },
        }
    }

    pub fn payload(mut self, payload: impl Into<Payload>) -> Self {
        self.definition.payload = payload.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.definition.timeout = Some(timeout);
        self
    }

    pub fn optimistic(mut self, supports_optimistic: bool) -> Self {
        self.definition.supports_optimistic = supports_optimistic;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.definition.priority = priority;
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.definition.tags.insert(tag.into());
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.definition
            .tags
            .extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn compensation(mut self, compensation: InteractionDefinition) -> Self {
        self.definition.compensation = Some(Box::new(compensation));
        self
    }

    /// Validate and return the definition.
    pub fn build(self) -> Result<InteractionDefinition, EngineError> {
        let errors = self.definition.validation_errors();
        if errors.is_empty() {
            Ok(self.definition)
        } else {
            Err(EngineError::InvalidDefinition { errors })
        }
    }
}
