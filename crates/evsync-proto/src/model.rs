//! Canonical model types.
//!
//! Everything past the wire adapter operates on these types only. Backend
//! spelling variants never leak beyond [`crate::wire`].

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Conversation identifier in canonical numeric form.
///
/// The hub exchanges conversation ids as integers. Parsing from text rejects
/// anything that is not a plain unsigned decimal number, so malformed ids are
/// caught before a remote call is attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(u64);

impl ConversationId {
    /// Wrap a numeric id.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Numeric value sent on the wire.
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ConversationId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Conversation id text was not a canonical number.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid conversation id {input:?}: expected an unsigned integer")]
pub struct InvalidConversationId {
    /// Rejected input.
    pub input: String,
}

impl FromStr for ConversationId {
    type Err = InvalidConversationId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
            return Err(InvalidConversationId { input: s.to_string() });
        }
        trimmed.parse::<u64>().map(Self).map_err(|_| InvalidConversationId { input: s.to_string() })
    }
}

/// User identifier as issued by the identity service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Wrap a user id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Bearer credential presented on every connection attempt.
///
/// `Debug` never prints the token.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    /// Wrap a bearer token.
    pub fn bearer(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Raw token for the transport layer.
    pub fn token(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

/// Message identifier.
///
/// Backend ids are opaque text (numbers are canonicalized to their decimal
/// form). Locally sent messages carry a provisional id until the hub echoes
/// them back.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageId {
    /// Assigned by the backend.
    Remote(String),
    /// Provisional id for a message we are still sending.
    Local(u64),
}

impl MessageId {
    /// Backend-assigned id.
    pub fn remote(id: impl Into<String>) -> Self {
        Self::Remote(id.into())
    }

    /// True for provisional ids.
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local(_))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Remote(id) => f.write_str(id),
            Self::Local(n) => write!(f, "local-{n}"),
        }
    }
}

/// Delivery status of a message.
///
/// Ordered: a status only ever moves forward, see [`MessageStatus::promote`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// Sent locally, not yet acknowledged.
    Sending,
    /// Acknowledged by the hub.
    Sent,
    /// Delivered to the recipient.
    Delivered,
    /// Read by the recipient.
    Read,
}

impl MessageStatus {
    /// Move to `next` if it is further along. Returns whether it changed.
    ///
    /// # Invariants
    ///
    /// - Status never regresses: `Read` stays `Read`.
    pub fn promote(&mut self, next: MessageStatus) -> bool {
        if next > *self {
            *self = next;
            true
        } else {
            false
        }
    }
}

/// Canonical chat message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Unique id within the conversation.
    pub id: MessageId,
    /// Conversation the message belongs to.
    pub conversation: ConversationId,
    /// Author.
    pub sender: UserId,
    /// Text content.
    pub content: String,
    /// Server (or local, while sending) timestamp.
    pub sent_at: DateTime<Utc>,
    /// Delivery status.
    pub status: MessageStatus,
}

/// Notification identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NotificationId(String);

impl NotificationId {
    /// Wrap a notification id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NotificationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Notification read status. Moves NEW→READ only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NotificationStatus {
    /// Not yet seen.
    New,
    /// Marked read.
    Read,
}

/// Canonical system notification (booking updates, approvals, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Unique id.
    pub id: NotificationId,
    /// Recipient. `None` for broadcast staff notifications.
    pub user: Option<UserId>,
    /// Short title.
    pub title: String,
    /// Body text.
    pub message: String,
    /// Read status at the time this value was produced.
    pub status: NotificationStatus,
    /// Category reported by the backend (e.g. `Booking`). `None` if absent.
    pub kind: Option<String>,
    /// Creation time. `None` if the backend did not send one.
    pub created_at: Option<DateTime<Utc>>,
}

/// Who is typing: an authenticated user or an anonymous guest session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Typist {
    /// Authenticated user.
    User(UserId),
    /// Guest chat session.
    Guest(String),
}

impl fmt::Display for Typist {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(user) => write!(f, "user:{user}"),
            Self::Guest(session) => write!(f, "guest:{session}"),
        }
    }
}

/// Inbound typing indicator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingSignal {
    /// Conversation being typed in.
    pub conversation: ConversationId,
    /// Who is typing.
    pub typist: Typist,
    /// `true` for start/refresh, `false` for explicit stop.
    pub is_typing: bool,
}

/// "Read up to" marker for one participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadMarker {
    /// Conversation the marker applies to.
    pub conversation: ConversationId,
    /// Participant who read.
    pub reader: UserId,
    /// Everything at or before this instant has been read.
    pub last_read_at: DateTime<Utc>,
}

/// A conversation the backend just created for us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationSummary {
    /// New conversation id.
    pub id: ConversationId,
    /// Known participants.
    pub participants: Vec<UserId>,
    /// Subject line. `None` if the backend sent none.
    pub subject: Option<String>,
}

/// A conversation was moved to a different service center.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CenterReassignment {
    /// Affected conversation.
    pub conversation: ConversationId,
    /// New service center id. `None` if the backend omitted it.
    pub center_id: Option<String>,
    /// New service center display name. `None` if omitted.
    pub center_name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversation_id_accepts_digits_only() {
        assert_eq!("42".parse::<ConversationId>(), Ok(ConversationId::new(42)));
        assert_eq!(" 7 ".parse::<ConversationId>(), Ok(ConversationId::new(7)));

        assert!("".parse::<ConversationId>().is_err());
        assert!("-1".parse::<ConversationId>().is_err());
        assert!("12a".parse::<ConversationId>().is_err());
        assert!("conv-12".parse::<ConversationId>().is_err());
        assert!("99999999999999999999999".parse::<ConversationId>().is_err());
    }

    #[test]
    fn status_never_regresses() {
        let mut status = MessageStatus::Sending;
        assert!(status.promote(MessageStatus::Sent));
        assert!(status.promote(MessageStatus::Read));
        assert!(!status.promote(MessageStatus::Delivered));
        assert_eq!(status, MessageStatus::Read);
    }

    #[test]
    fn credential_debug_is_redacted() {
        let credential = Credential::bearer("secret-token");
        assert!(!format!("{credential:?}").contains("secret"));
        assert_eq!(credential.token(), "secret-token");
    }
}
