//! Observable state snapshots for invariant checking.
//!
//! Snapshots capture the observable state of the system at a point in time.
//! Invariants operate on snapshots rather than live clients so every check
//! sees one consistent view.

use std::collections::BTreeMap;

use evsync_core::ConnectionStatus;
use evsync_proto::{ConversationId, MessageId};

/// Snapshot of every simulated session.
#[derive(Debug, Clone, Default)]
pub struct SystemSnapshot {
    /// Per-client state snapshots.
    pub clients: Vec<ClientSnapshot>,
}

impl SystemSnapshot {
    /// Create an empty snapshot (no clients).
    pub fn empty() -> Self {
        Self::default()
    }

    /// Create a snapshot with a single client.
    pub fn single(client: ClientSnapshot) -> Self {
        Self { clients: vec![client] }
    }

    /// Create a snapshot from multiple clients.
    pub fn from_clients(clients: Vec<ClientSnapshot>) -> Self {
        Self { clients }
    }
}

/// Observable state of one hub connection of a client.
#[derive(Debug, Clone, Default)]
pub struct HubSnapshot {
    /// Every status the connection went through, starting with the initial
    /// `Disconnected`.
    pub status_history: Vec<ConnectionStatus>,
    /// Frames the client asked to send while not `Connected`.
    pub offline_sends: usize,
}

/// Snapshot of a single session.
#[derive(Debug, Clone, Default)]
pub struct ClientSnapshot {
    /// Client index in the simulation.
    pub id: usize,
    /// Conversation hub connection.
    pub chat: HubSnapshot,
    /// Notification hub connection.
    pub notifications: HubSnapshot,
    /// Conversations with stored messages or membership.
    pub conversations: BTreeMap<ConversationId, ConversationSnapshot>,
    /// Unread badge as reported by the notification client.
    pub notification_unread: usize,
    /// Notifications whose status is `NEW`.
    pub notifications_new: usize,
}

impl ClientSnapshot {
    /// Create a new client snapshot.
    pub fn new(id: usize) -> Self {
        Self { id, ..Default::default() }
    }
}

/// Snapshot of one conversation as a client sees it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationSnapshot {
    /// Message ids in display order.
    pub message_ids: Vec<MessageId>,
    /// Messages sent by someone else.
    pub peer_messages: usize,
    /// Unread count reported by the client.
    pub unread: u32,
}
