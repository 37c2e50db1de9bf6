//! Hub protocol for evsync.
//!
//! Canonical model types shared by every layer, the JSON hub wire codec, and
//! the wire-format adapter that turns loosely-shaped backend payloads into
//! canonical values.
//!
//! # Layers
//!
//! - [`model`]: canonical types (`ConversationId`, `Message`, ...). Internal
//!   code only ever sees these.
//! - [`frame`]: record-separated JSON frames and the handshake.
//! - [`event`]: typed inbound events and outbound invocations, mapped to and
//!   from frames by hub method name.
//! - [`wire`]: the single boundary where backend field-name variants are
//!   resolved.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod errors;
pub mod event;
pub mod frame;
pub mod model;
pub mod wire;

pub use errors::{PayloadError, ProtocolError, Result};
pub use event::{HubInvocation, InboundEvent};
pub use frame::{HandshakeRequest, HandshakeResponse, HubFrame, RECORD_SEPARATOR};
pub use model::{
    CenterReassignment, ConversationId, ConversationSummary, Credential, InvalidConversationId,
    Message, MessageId, MessageStatus, Notification, NotificationId, NotificationStatus,
    ReadMarker, TypingSignal, Typist, UserId,
};
