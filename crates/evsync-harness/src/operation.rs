//! Operations for model-based testing.
//!
//! Operations represent everything that can happen to a set of sessions:
//! user intents, network faults and the passage of time. They are generated
//! randomly by proptest (or `arbitrary` in fuzzing) and applied to a
//! [`crate::SimWorld`].

use arbitrary::Arbitrary;
use evsync_proto::ConversationId;

/// Client identifier (0-indexed, wrapped to the number of clients).
pub type ClientId = u8;

/// Conversation identifier (small to make collisions likely).
pub type ModelConversationId = u8;

/// Number of distinct conversations operations address.
pub const CONVERSATIONS: u8 = 4;

/// Map a model conversation onto a real id.
pub fn conversation(id: ModelConversationId) -> ConversationId {
    ConversationId::new(u64::from(id % CONVERSATIONS) + 1)
}

/// Which hub of a session an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Arbitrary)]
pub enum HubKind {
    /// Conversation hub.
    Chat,
    /// Notification hub.
    Notifications,
}

/// Operations that can be applied to the system.
#[derive(Debug, Clone, Arbitrary)]
pub enum Operation {
    /// Start connecting both hubs.
    Connect {
        /// Client performing the operation.
        client_id: ClientId,
    },

    /// Force both hubs to `Disconnected`.
    Disconnect {
        /// Client performing the operation.
        client_id: ClientId,
    },

    /// Open a conversation.
    Join {
        /// Client performing the operation.
        client_id: ClientId,
        /// Conversation to open.
        conversation: ModelConversationId,
    },

    /// Close a conversation.
    Leave {
        /// Client performing the operation.
        client_id: ClientId,
        /// Conversation to close.
        conversation: ModelConversationId,
    },

    /// Send a message.
    Send {
        /// Client performing the operation.
        client_id: ClientId,
        /// Target conversation.
        conversation: ModelConversationId,
        /// Seed for the message text.
        seed: u8,
    },

    /// Type in a conversation.
    Typing {
        /// Client performing the operation.
        client_id: ClientId,
        /// Conversation typed in.
        conversation: ModelConversationId,
    },

    /// Read a conversation.
    MarkRead {
        /// Client performing the operation.
        client_id: ClientId,
        /// Conversation read.
        conversation: ModelConversationId,
    },

    /// The hub pushes a notification to the client's user.
    PushNotification {
        /// Recipient.
        client_id: ClientId,
    },

    /// Clear the notification badge.
    MarkAllNotificationsRead {
        /// Client performing the operation.
        client_id: ClientId,
    },

    /// The link of one hub breaks.
    DropLink {
        /// Affected client.
        client_id: ClientId,
        /// Affected hub.
        hub: HubKind,
    },

    /// The hub refuses the next dials.
    RefuseDials {
        /// Affected hub.
        hub: HubKind,
        /// Dials to refuse.
        count: u8,
    },

    /// Advance simulation time, firing retries and typing timers.
    AdvanceTime {
        /// Milliseconds to advance.
        millis: u16,
    },

    /// Deliver every queued link event and frame.
    DeliverPending,
}
