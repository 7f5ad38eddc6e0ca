//! Text-frame wire model for the realtime editor channels.
//!
//! This crate owns the wire representation shared by the `realtime` client
//! library and the relay `server`. Frames are UTF-8 text. Structured frames
//! are JSON objects tagged with a `type` field (`{type, ...fields}`); anything
//! that does not parse as JSON travels as opaque text.
//!
//! DESIGN
//! ======
//! Inbound text is classified exactly once, at the transport boundary, into an
//! [`Envelope`]. Keep-alive traffic (`ping` / `pong`) gets its own variants so
//! callers never have to string-match on `type` to filter heartbeats out of
//! application traffic.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

/// Frame key carrying the message discriminator.
pub const FIELD_TYPE: &str = "type";

/// Frame key carrying the heartbeat timestamp (milliseconds since epoch).
pub const FIELD_TIMESTAMP: &str = "timestamp";

/// `type` value of a keep-alive request.
pub const TYPE_PING: &str = "ping";

/// `type` value of a keep-alive reply.
pub const TYPE_PONG: &str = "pong";

/// `type` value of editor progress reports.
pub const TYPE_PROCESSING_UPDATE: &str = "processing_update";

/// `type` value of batch job progress reports.
pub const TYPE_BATCH_UPDATE: &str = "batch_update";

/// Error returned when a payload cannot be read as a typed message.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The payload is opaque text, not structured JSON.
    #[error("payload is not structured json")]
    NotJson,
    /// The JSON payload does not match the requested shape.
    #[error("failed to decode json payload: {0}")]
    Json(#[from] serde_json::Error),
}

// =============================================================================
// PAYLOAD
// =============================================================================

/// Application-level frame content.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    /// Opaque text, transmitted unchanged.
    Text(String),
    /// Structured value, transmitted as compact JSON.
    Json(Value),
}

impl Payload {
    /// Build a `{type, ...fields}` object payload.
    #[must_use]
    pub fn typed(kind: &str, fields: Map<String, Value>) -> Self {
        let mut map = fields;
        map.insert(FIELD_TYPE.to_owned(), Value::String(kind.to_owned()));
        Self::Json(Value::Object(map))
    }

    /// Parse wire text: JSON when it parses, opaque text otherwise.
    #[must_use]
    pub fn from_wire(text: &str) -> Self {
        serde_json::from_str::<Value>(text).map_or_else(|_| Self::Text(text.to_owned()), Self::Json)
    }

    /// Serialize into the text sent on the wire.
    #[must_use]
    pub fn encode(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Json(value) => value.to_string(),
        }
    }

    /// The `type` discriminator, when the payload is a tagged JSON object.
    #[must_use]
    pub fn message_type(&self) -> Option<&str> {
        match self {
            Self::Json(value) => value.get(FIELD_TYPE).and_then(Value::as_str),
            Self::Text(_) => None,
        }
    }

    #[must_use]
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(value) => Some(value),
            Self::Text(_) => None,
        }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Json(_) => None,
        }
    }

    /// Deserialize a structured payload into `T`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::NotJson`] for opaque text and
    /// [`CodecError::Json`] when the value does not match `T`.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        match self {
            Self::Json(value) => Ok(T::deserialize(value)?),
            Self::Text(_) => Err(CodecError::NotJson),
        }
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Self::Text(text.to_owned())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

// =============================================================================
// ENVELOPE
// =============================================================================

/// A decoded wire frame.
#[derive(Clone, Debug, PartialEq)]
pub enum Envelope {
    /// Keep-alive request. Receivers answer it and still hand the frame to
    /// application subscribers.
    Ping { timestamp: i64 },
    /// Keep-alive reply. Never forwarded to application subscribers.
    Pong { timestamp: Option<i64> },
    /// Everything else.
    Message(Payload),
}

impl Envelope {
    /// Keep-alive request stamped with the current time.
    #[must_use]
    pub fn ping() -> Self {
        Self::Ping { timestamp: now_ms() }
    }

    /// Reply to a ping, echoing its timestamp.
    #[must_use]
    pub fn pong(timestamp: i64) -> Self {
        Self::Pong { timestamp: Some(timestamp) }
    }
}

/// Classify one inbound text frame.
///
/// Never fails: text that is not JSON is returned as [`Payload::Text`].
#[must_use]
pub fn decode(text: &str) -> Envelope {
    let Ok(value) = serde_json::from_str::<Value>(text) else {
        return Envelope::Message(Payload::Text(text.to_owned()));
    };

    let timestamp = value.get(FIELD_TIMESTAMP).and_then(Value::as_i64);
    match value.get(FIELD_TYPE).and_then(Value::as_str) {
        Some(TYPE_PING) => Envelope::Ping { timestamp: timestamp.unwrap_or(0) },
        Some(TYPE_PONG) => Envelope::Pong { timestamp },
        _ => Envelope::Message(Payload::Json(value)),
    }
}

/// Serialize an envelope into wire text.
#[must_use]
pub fn encode(envelope: &Envelope) -> String {
    match envelope {
        Envelope::Ping { timestamp } => {
            serde_json::json!({ FIELD_TYPE: TYPE_PING, FIELD_TIMESTAMP: timestamp }).to_string()
        }
        Envelope::Pong { timestamp: Some(timestamp) } => {
            serde_json::json!({ FIELD_TYPE: TYPE_PONG, FIELD_TIMESTAMP: timestamp }).to_string()
        }
        Envelope::Pong { timestamp: None } => serde_json::json!({ FIELD_TYPE: TYPE_PONG }).to_string(),
        Envelope::Message(payload) => payload.encode(),
    }
}

/// Current time as milliseconds since the Unix epoch.
#[must_use]
pub fn now_ms() -> i64 {
    let Ok(dur) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(dur.as_millis()).unwrap_or(0)
}

// =============================================================================
// CHANNEL MESSAGES
// =============================================================================

/// Progress of a photo being processed in the editor.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct ProcessingUpdate {
    /// Percent complete, `0.0..=100.0`.
    pub progress: f64,
    #[serde(default)]
    pub status: String,
}

/// Progress of a batch job.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct BatchUpdate {
    pub completed: u64,
    pub total: u64,
    #[serde(default)]
    pub status: String,
}

impl From<&ProcessingUpdate> for Payload {
    fn from(update: &ProcessingUpdate) -> Self {
        let mut fields = Map::new();
        fields.insert("progress".to_owned(), serde_json::json!(update.progress));
        fields.insert("status".to_owned(), Value::String(update.status.clone()));
        Self::typed(TYPE_PROCESSING_UPDATE, fields)
    }
}

impl From<&BatchUpdate> for Payload {
    fn from(update: &BatchUpdate) -> Self {
        let mut fields = Map::new();
        fields.insert("completed".to_owned(), Value::from(update.completed));
        fields.insert("total".to_owned(), Value::from(update.total));
        fields.insert("status".to_owned(), Value::String(update.status.clone()));
        Self::typed(TYPE_BATCH_UPDATE, fields)
    }
}

#[cfg(test)]
#[path = "lib_test.rs"]
mod tests;
