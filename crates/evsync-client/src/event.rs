//! Client events and notices.

use evsync_proto::{
    CenterReassignment, ConversationId, ConversationSummary, Message, MessageId, Notification,
    NotificationId, ReadMarker, Typist, UserId,
};

use crate::hub::Lifecycle;

/// Events the caller feeds into a [`crate::ChatClient`].
///
/// The caller is responsible for:
/// - Reporting link outcomes and received frames (`Lifecycle::Link`)
/// - Driving time forward via ticks
/// - Forwarding application intents (join, send, typing, ...)
///
/// Generic over `I` (Instant type) to support both production
/// (`tokio::time::Instant`) and simulation environments.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent<I> {
    /// Connection lifecycle.
    Lifecycle(Lifecycle),

    /// Time tick for reconnect retries and typing timers.
    Tick {
        /// Current time from the environment.
        now: I,
    },

    /// Open a conversation. Deferred while not connected.
    Join(ConversationId),

    /// Close a conversation.
    Leave(ConversationId),

    /// Send a message.
    SendMessage {
        /// Target conversation.
        conversation: ConversationId,
        /// Message text.
        content: String,
    },

    /// The local user typed in a conversation.
    Typing(ConversationId),

    /// The local user cleared the input without sending.
    StopTyping(ConversationId),

    /// The local user has seen everything in a conversation.
    MarkRead(ConversationId),

    /// A history page was loaded over REST.
    MergeHistory {
        /// Conversation the page belongs to.
        conversation: ConversationId,
        /// Messages in the page.
        messages: Vec<Message>,
    },
}

/// Typed conversation events for subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatNotice {
    /// A local send was recorded as `Sending`.
    MessageQueued(Message),

    /// A message arrived.
    MessageReceived {
        /// The stored message.
        message: Message,
        /// Sent by someone else.
        from_peer: bool,
    },

    /// The hub echoed one of our sends.
    MessageAcknowledged {
        /// Provisional id the message had.
        local: MessageId,
        /// The message under its backend id.
        message: Message,
    },

    /// Own messages became read.
    MessagesRead {
        /// Conversation.
        conversation: ConversationId,
        /// Messages promoted to `Read`.
        messages: Vec<MessageId>,
    },

    /// A participant's read marker advanced.
    ReadReceipt(ReadMarker),

    /// The local user read a conversation. The marker goes to the REST
    /// conversation store; it is `None` for guest sessions.
    MarkedRead {
        /// Conversation.
        conversation: ConversationId,
        /// Marker to store.
        marker: Option<ReadMarker>,
    },

    /// Unread count of a conversation changed.
    UnreadChanged {
        /// Conversation.
        conversation: ConversationId,
        /// Its unread count.
        unread: u32,
        /// Unread count across all conversations.
        total: u32,
    },

    /// Active typists of a conversation changed.
    TypingChanged {
        /// Conversation.
        conversation: ConversationId,
        /// Who is typing now.
        typists: Vec<Typist>,
    },

    /// Participant set of a conversation changed.
    ParticipantsChanged {
        /// Conversation.
        conversation: ConversationId,
        /// Known participants.
        participants: Vec<UserId>,
    },

    /// The backend created a conversation for us.
    ConversationCreated(ConversationSummary),

    /// A conversation moved to another service center.
    CenterReassigned(CenterReassignment),

    /// A history page was merged.
    HistoryMerged {
        /// Conversation.
        conversation: ConversationId,
    },
}

/// Events the caller feeds into a [`crate::NotificationClient`].
#[derive(Debug, Clone, PartialEq)]
pub enum NotificationEvent<I> {
    /// Connection lifecycle.
    Lifecycle(Lifecycle),

    /// Time tick for reconnect retries.
    Tick {
        /// Current time from the environment.
        now: I,
    },

    /// The user opened one notification.
    MarkRead(NotificationId),

    /// The user cleared the badge.
    MarkAllRead,

    /// A REST listing was loaded.
    Reconcile(Vec<Notification>),
}

/// Typed notification events for subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationNotice {
    /// A new notification arrived.
    Received(Notification),

    /// Notifications were marked read locally. Forwarded to the REST
    /// notification store.
    MarkedRead(Vec<NotificationId>),

    /// The unread badge count changed.
    UnreadChanged(usize),
}
