//! Protocol and payload errors.
//!
//! [`ProtocolError`] covers framing: bad JSON, unknown frame types, handshake
//! rejections. [`PayloadError`] covers the content of a well-formed frame that
//! does not carry what the hub method promises (missing identifiers, wrong
//! argument counts). Callers drop payload errors with a warning; they never
//! abort the inbound stream.

use thiserror::Error;

/// Result alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Framing-level errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Frame text is not valid JSON.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// Frame carried a `type` we do not understand.
    #[error("unsupported frame type {0}")]
    UnsupportedFrameType(u64),

    /// Frame is missing a field required by its type.
    #[error("frame type {frame_type} missing field `{field}`")]
    MissingField {
        /// Numeric frame type.
        frame_type: u64,
        /// Name of the missing field.
        field: &'static str,
    },

    /// Server refused the handshake.
    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    /// Handshake reply arrived without its record separator.
    #[error("incomplete handshake response")]
    IncompleteHandshake,

    /// Encoding a frame failed.
    #[error("encode failed: {0}")]
    Encode(String),
}

/// Errors resolving a hub payload into a canonical value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PayloadError {
    /// Hub method name is not one we handle.
    #[error("unknown hub method `{0}`")]
    UnknownTarget(String),

    /// Wrong number of arguments for the hub method.
    #[error("`{target}` expects {expected} argument(s), got {actual}")]
    ArgumentCount {
        /// Hub method name.
        target: &'static str,
        /// Expected count.
        expected: usize,
        /// Actual count.
        actual: usize,
    },

    /// Argument was not a JSON object.
    #[error("`{target}` argument is not an object")]
    NotAnObject {
        /// Hub method name.
        target: &'static str,
    },

    /// Required canonical field is absent under every known wire name.
    #[error("missing `{0}`")]
    MissingField(&'static str),

    /// Field present but unusable (wrong type, non-numeric id, bad date).
    #[error("invalid `{field}`: {reason}")]
    InvalidField {
        /// Canonical field name.
        field: &'static str,
        /// What was wrong.
        reason: String,
    },
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        Self::MalformedFrame(err.to_string())
    }
}
