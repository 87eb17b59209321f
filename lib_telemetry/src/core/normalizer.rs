//! # Message Normalizer
//!
//! Collectors are allowed to send three shapes of payload:
//!
//! 1. a JSON array of metric records, wrapped as `{"metrics": [...]}`;
//! 2. an object that already carries a `metrics` array, forwarded unchanged;
//! 3. a single metric record object, wrapped as `{"metrics": [record]}`.
//!
//! The shape is decided once by [`PayloadShape::classify`] and then handled by
//! an exhaustive match. Scalars and `null` are rejected.

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

/// Why a collector payload could not be turned into an envelope.
#[derive(Debug, Error)]
pub enum NormalizationError {
    /// The payload is not valid JSON.
    #[error("payload is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    /// The payload parsed but has a shape that cannot carry metrics.
    #[error("unsupported payload shape: {0}")]
    UnsupportedShape(&'static str),
}

/// # Message Envelope
///
/// The canonical broadcast unit: a JSON object whose `metrics` key holds a list
/// of opaque records (normally carrying at least `name` and `fields`). A
/// pre-wrapped payload is kept as the exact object the collector sent, so its
/// keys reach clients in their original order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct MessageEnvelope {
    body: Map<String, Value>,
}

impl MessageEnvelope {
    /// Wraps a list of records as `{"metrics": [...]}`.
    pub fn from_metrics(metrics: Vec<Value>) -> Self {
        let mut body = Map::new();
        body.insert("metrics".to_string(), Value::Array(metrics));
        Self { body }
    }

    /// The metric records in producer order.
    pub fn metrics(&self) -> &[Value] {
        self.body
            .get("metrics")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// The whole envelope object.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.body
    }

    /// Serializes the envelope to the text sent to clients.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// The closed set of payload shapes a collector can send.
#[derive(Debug, Clone, PartialEq)]
pub enum PayloadShape {
    /// A bare JSON array of records.
    Sequence(Vec<Value>),
    /// An object whose `metrics` key is an array, kept exactly as received.
    WrappedMapping(Map<String, Value>),
    /// A single metric record.
    BareMapping(Map<String, Value>),
    /// Anything else, tagged with the JSON type name.
    Invalid(&'static str),
}

impl PayloadShape {
    /// Inspects a parsed value and decides its shape.
    pub fn classify(value: Value) -> Self {
        match value {
            Value::Array(items) => PayloadShape::Sequence(items),
            // A `metrics` key that is not a list makes the object a record itself.
            Value::Object(map) => match map.get("metrics") {
                Some(Value::Array(_)) => PayloadShape::WrappedMapping(map),
                _ => PayloadShape::BareMapping(map),
            },
            Value::Null => PayloadShape::Invalid("null"),
            Value::Bool(_) => PayloadShape::Invalid("boolean"),
            Value::Number(_) => PayloadShape::Invalid("number"),
            Value::String(_) => PayloadShape::Invalid("string"),
        }
    }

    /// Converts the shape into an envelope, or fails for `Invalid`.
    pub fn into_envelope(self) -> Result<MessageEnvelope, NormalizationError> {
        match self {
            PayloadShape::Sequence(items) => Ok(MessageEnvelope::from_metrics(items)),
            PayloadShape::WrappedMapping(body) => Ok(MessageEnvelope { body }),
            PayloadShape::BareMapping(record) => {
                Ok(MessageEnvelope::from_metrics(vec![Value::Object(record)]))
            }
            PayloadShape::Invalid(kind) => Err(NormalizationError::UnsupportedShape(kind)),
        }
    }
}

/// # Normalize
///
/// Parses raw collector bytes (UTF-8 JSON text) and returns the envelope to
/// broadcast. A failure means the message is dropped.
pub fn normalize(raw: &[u8]) -> Result<MessageEnvelope, NormalizationError> {
    let value: Value = serde_json::from_slice(raw)?;
    PayloadShape::classify(value).into_envelope()
}
