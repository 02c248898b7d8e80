//! Call and reply envelopes bridged between bus messages and the generic handler.
//!
//! The reply wire shape is `{"code": <int>, "data": <any>}` encoded as JSON.
//! `data` is omitted for a pure acknowledgement.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Map-shaped request payload handed to the generic handler.
pub type Payload = Map<String, Value>;

/// Application status codes carried in `Reply::code`.
pub mod codes {
    pub const OK: i64 = 0;
    pub const BAD_REQUEST: i64 = 400;
    pub const INTERNAL: i64 = 500;
    pub const UNAVAILABLE: i64 = 503;
}

// ---------------------------------------------------------------------------
// CallId
// ---------------------------------------------------------------------------

/// Correlation identifier for one call within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallId(pub u64);

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// CallContext / CallEnvelope
// ---------------------------------------------------------------------------

/// Caller context carried with every call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallContext {
    /// Bus subject the request arrived on.
    pub subject: String,
    /// Subject the reply is published to, if the caller asked for one.
    pub reply_to: Option<String>,
    pub trace_id: String,
    /// Milliseconds since the Unix epoch when the request was received.
    pub received_at_ms: u64,
    pub metadata: BTreeMap<String, String>,
}

impl CallContext {
    /// A context for a request received now on `subject`.
    #[must_use]
    pub fn received(subject: impl Into<String>, reply_to: Option<String>) -> Self {
        let received_at_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or_default();
        Self {
            subject: subject.into(),
            reply_to,
            trace_id: String::new(),
            received_at_ms,
            metadata: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self
    }
}

/// A decoded request travelling from a session to the generic handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallEnvelope {
    pub call_id: CallId,
    pub method: String,
    pub service: String,
    pub context: CallContext,
    pub payload: Payload,
}

// ---------------------------------------------------------------------------
// Reply
// ---------------------------------------------------------------------------

/// Reply produced by the generic handler and sent back to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub code: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Reply {
    #[must_use]
    pub fn ok(data: Value) -> Self {
        Self {
            code: codes::OK,
            data: Some(data),
        }
    }

    /// Acknowledgement without payload.
    #[must_use]
    pub fn ack() -> Self {
        Self {
            code: codes::OK,
            data: None,
        }
    }

    /// Error-shaped reply: `{"code": code, "data": {"error": message}}`.
    #[must_use]
    pub fn error(code: i64, message: impl Into<String>) -> Self {
        let mut data = Map::new();
        data.insert("error".to_string(), Value::String(message.into()));
        Self {
            code,
            data: Some(Value::Object(data)),
        }
    }

    #[must_use]
    pub fn from_failure(failure: &HandlerFailure) -> Self {
        Self::error(codes::INTERNAL, failure.reason.clone())
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.code == codes::OK
    }

    /// Encodes the reply in its wire shape.
    ///
    /// # Errors
    ///
    /// Returns an error if `data` holds a value JSON cannot represent
    /// (e.g. a map with non-string keys produced by a custom serializer).
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decodes a reply from its wire shape.
    ///
    /// # Errors
    ///
    /// Returns an error if `bytes` is not a JSON object with an integer `code`.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// The generic handler failed to produce a reply.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("handler failed: {reason}")]
pub struct HandlerFailure {
    pub reason: String,
}

impl HandlerFailure {
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Outcome of one call as delivered back to the waiting caller.
pub type ReplyEnvelope = Result<Reply, HandlerFailure>;

// ---------------------------------------------------------------------------
// Payload decoding
// ---------------------------------------------------------------------------

/// Decodes a request body into a map-shaped payload.
///
/// An empty body decodes to an empty map. A JSON value that is not an object
/// is wrapped as `{"value": <value>}`.
///
/// # Errors
///
/// Returns an error if the body is not valid JSON.
pub fn decode_payload(bytes: &[u8]) -> Result<Payload, serde_json::Error> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Payload::new());
    }
    match serde_json::from_slice::<Value>(bytes)? {
        Value::Object(map) => Ok(map),
        other => {
            let mut map = Payload::new();
            map.insert("value".to_string(), other);
            Ok(map)
        }
    }
}
