//! JSON hub frames.
//!
//! Every frame is a JSON object terminated by the ASCII record separator
//! (`0x1E`). A single transport message may carry several frames, so decoding
//! works on batches.
//!
//! ```text
//! client                               hub
//!   │ {"protocol":"json","version":1}␞  │
//!   │──────────────────────────────────>│
//!   │ {}␞                               │
//!   │<──────────────────────────────────│
//!   │ {"type":1,"target":...}␞          │  invocations both ways
//!   │<─────────────────────────────────>│
//! ```
//!
//! Frame types: 1 invocation, 3 completion, 6 ping, 7 close. Streaming frames
//! (2, 4, 5) are not used by either hub and decode as
//! [`ProtocolError::UnsupportedFrameType`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{ProtocolError, Result};

/// Record separator terminating every frame.
pub const RECORD_SEPARATOR: char = '\u{1e}';

const TYPE_INVOCATION: u64 = 1;
const TYPE_COMPLETION: u64 = 3;
const TYPE_PING: u64 = 6;
const TYPE_CLOSE: u64 = 7;

/// Decoded hub frame.
#[derive(Debug, Clone, PartialEq)]
pub enum HubFrame {
    /// Method call. `invocation_id` is set when the caller wants a completion.
    Invocation {
        /// Correlation id for the completion. `None` for fire-and-forget.
        invocation_id: Option<String>,
        /// Hub method name.
        target: String,
        /// Positional arguments.
        arguments: Vec<Value>,
    },
    /// Result of an invocation that carried an id.
    Completion {
        /// Id of the invocation this completes.
        invocation_id: String,
        /// Return value. `None` for void methods.
        result: Option<Value>,
        /// Error text. `None` on success.
        error: Option<String>,
    },
    /// Keepalive.
    Ping,
    /// Server is closing the connection.
    Close {
        /// Reason. `None` for a clean close.
        error: Option<String>,
        /// Whether the server permits reconnecting.
        allow_reconnect: bool,
    },
}

/// Flat wire shape shared by all frame types.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireFrame {
    #[serde(rename = "type")]
    kind: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    invocation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    arguments: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    allow_reconnect: Option<bool>,
}

impl HubFrame {
    /// Build a fire-and-forget invocation.
    pub fn invocation(target: impl Into<String>, arguments: Vec<Value>) -> Self {
        Self::Invocation { invocation_id: None, target: target.into(), arguments }
    }

    /// Encode as JSON followed by the record separator.
    pub fn encode(&self) -> Result<String> {
        let wire = match self {
            Self::Invocation { invocation_id, target, arguments } => WireFrame {
                kind: TYPE_INVOCATION,
                invocation_id: invocation_id.clone(),
                target: Some(target.clone()),
                arguments: Some(arguments.clone()),
                ..WireFrame::default()
            },
            Self::Completion { invocation_id, result, error } => WireFrame {
                kind: TYPE_COMPLETION,
                invocation_id: Some(invocation_id.clone()),
                result: result.clone(),
                error: error.clone(),
                ..WireFrame::default()
            },
            Self::Ping => WireFrame { kind: TYPE_PING, ..WireFrame::default() },
            Self::Close { error, allow_reconnect } => WireFrame {
                kind: TYPE_CLOSE,
                error: error.clone(),
                allow_reconnect: Some(*allow_reconnect),
                ..WireFrame::default()
            },
        };

        let mut text =
            serde_json::to_string(&wire).map_err(|e| ProtocolError::Encode(e.to_string()))?;
        text.push(RECORD_SEPARATOR);
        Ok(text)
    }

    /// Decode one frame body (without the separator).
    pub fn decode(body: &str) -> Result<Self> {
        let wire: WireFrame = serde_json::from_str(body)?;

        match wire.kind {
            TYPE_INVOCATION => {
                let target = wire
                    .target
                    .ok_or(ProtocolError::MissingField { frame_type: wire.kind, field: "target" })?;
                Ok(Self::Invocation {
                    invocation_id: wire.invocation_id,
                    target,
                    arguments: wire.arguments.unwrap_or_default(),
                })
            },
            TYPE_COMPLETION => {
                let invocation_id = wire.invocation_id.ok_or(ProtocolError::MissingField {
                    frame_type: wire.kind,
                    field: "invocationId",
                })?;
                Ok(Self::Completion { invocation_id, result: wire.result, error: wire.error })
            },
            TYPE_PING => Ok(Self::Ping),
            TYPE_CLOSE => Ok(Self::Close {
                error: wire.error,
                allow_reconnect: wire.allow_reconnect.unwrap_or(false),
            }),
            other => Err(ProtocolError::UnsupportedFrameType(other)),
        }
    }

    /// Decode every frame in a transport message.
    ///
    /// Each frame decodes independently: one malformed frame does not hide
    /// its neighbours. Empty segments (the tail after the final separator)
    /// are skipped.
    pub fn decode_batch(text: &str) -> Vec<Result<Self>> {
        text.split(RECORD_SEPARATOR)
            .filter(|segment| !segment.trim().is_empty())
            .map(Self::decode)
            .collect()
    }
}

/// First message a client sends after the transport opens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    /// Hub protocol name.
    pub protocol: String,
    /// Hub protocol version.
    pub version: u32,
}

impl Default for HandshakeRequest {
    fn default() -> Self {
        Self { protocol: "json".to_string(), version: 1 }
    }
}

impl HandshakeRequest {
    /// Encode with trailing record separator.
    pub fn encode(&self) -> Result<String> {
        let mut text =
            serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))?;
        text.push(RECORD_SEPARATOR);
        Ok(text)
    }
}

/// Hub reply to the handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    /// Rejection reason. `None` when accepted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HandshakeResponse {
    /// Parse the handshake reply at the start of `text`.
    ///
    /// Returns the remainder after the separator, which may already contain
    /// hub frames.
    ///
    /// # Errors
    ///
    /// - `IncompleteHandshake` if no separator is present
    /// - `HandshakeRejected` if the hub returned an error
    pub fn parse(text: &str) -> Result<&str> {
        let (body, rest) =
            text.split_once(RECORD_SEPARATOR).ok_or(ProtocolError::IncompleteHandshake)?;
        let response: HandshakeResponse = serde_json::from_str(body)?;

        match response.error {
            Some(reason) => Err(ProtocolError::HandshakeRejected(reason)),
            None => Ok(rest),
        }
    }

    /// Encode with trailing record separator.
    pub fn encode(&self) -> Result<String> {
        let mut text =
            serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))?;
        text.push(RECORD_SEPARATOR);
        Ok(text)
    }
}
