//! Envelope and wire contract shared by every node.
//!
//! One JSON object per line: `{src, dest, body}`. The body always carries
//! `type`, optionally `msg_id` and `in_reply_to`, plus whatever
//! type-specific fields the protocol defines. Those stay in a flattened
//! map so the runtime can route messages without knowing every payload
//! shape; protocol crates move them in and out of typed structs.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Message wrapper exchanged between nodes and clients.
///
/// Immutable once sent; `msg_id` is assigned exactly once per outbound
/// message by the runtime.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub src: String,
    #[serde(default)]
    pub dest: String,
    pub body: Body,
}

/// Message body: routing fields plus the protocol-specific payload.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Body {
    /// Message type, e.g. `broadcast` or `read_ok`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Process-local monotonically increasing id, unique per sender.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<u64>,
    /// Echoes a peer's `msg_id` to correlate a reply.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<u64>,
    /// Type-specific fields, preserved verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Body {
    /// A body with no payload fields.
    pub fn new(kind: impl Into<String>) -> Self {
        Body {
            kind: kind.into(),
            ..Body::default()
        }
    }

    /// Build a body from a serializable payload struct.
    ///
    /// The payload must serialize to a JSON object; its fields become the
    /// body's type-specific fields.
    pub fn from_payload<T: Serialize>(
        kind: impl Into<String>,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        let extra = match serde_json::to_value(payload)? {
            Value::Object(map) => map,
            other => {
                return Err(serde::ser::Error::custom(format!(
                    "payload must be a JSON object, got {other}"
                )))
            }
        };
        Ok(Body {
            kind: kind.into(),
            msg_id: None,
            in_reply_to: None,
            extra,
        })
    }

    /// Deserialize the type-specific fields into a payload struct.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(Value::Object(self.extra.clone()))
    }

    /// Build an `error` body with the given harness error code.
    pub fn error(code: i64, text: impl Into<String>) -> Self {
        let mut extra = Map::new();
        extra.insert("code".into(), Value::from(code));
        extra.insert("text".into(), Value::from(text.into()));
        Body {
            kind: "error".into(),
            msg_id: None,
            in_reply_to: None,
            extra,
        }
    }

    /// Whether this is an `error` body.
    pub fn is_error(&self) -> bool {
        self.kind == "error"
    }
}

/// Payload of an `error` body.
#[derive(Clone, Debug, Deserialize)]
pub struct ErrorPayload {
    pub code: i64,
    #[serde(default)]
    pub text: Option<String>,
}

/// Harness error codes used on the wire.
pub mod codes {
    /// The request hit a node that cannot serve it right now; retryable.
    pub const TEMPORARILY_UNAVAILABLE: i64 = 11;
    /// The request was structurally invalid.
    pub const MALFORMED_REQUEST: i64 = 12;
    /// Read of a key that does not exist.
    pub const KEY_NOT_FOUND: i64 = 20;
    /// Compare-and-swap precondition failed.
    pub const PRECONDITION_FAILED: i64 = 22;
}
