//! Client errors.
//!
//! Only local validation and runtime shutdown are reported to callers.
//! Connection and invocation failures are handled inside the clients and show
//! up as status transitions and log lines instead.

use evsync_proto::{ConversationId, InvalidConversationId};
use thiserror::Error;

#[cfg(feature = "transport")]
use crate::transport::{RestError, TransportError};

/// Errors returned to callers of the chat and notification clients.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Conversation id text was not canonical.
    #[error(transparent)]
    InvalidConversation(#[from] InvalidConversationId),

    /// Message content was empty or whitespace.
    #[error("empty message for conversation {conversation}")]
    EmptyMessage {
        /// Target conversation.
        conversation: ConversationId,
    },

    /// The hub runtime is gone (session disposed).
    #[error("{hub} hub has shut down")]
    Closed {
        /// Hub name.
        hub: &'static str,
    },

    /// Endpoint configuration was unusable.
    #[cfg(feature = "transport")]
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A REST collaborator call failed.
    #[cfg(feature = "transport")]
    #[error(transparent)]
    Rest(#[from] RestError),
}
