//! Typed hub methods.
//!
//! [`InboundEvent`] covers every method the hubs call on the client;
//! [`HubInvocation`] covers every method the client calls on the hubs. Both
//! map to [`HubFrame::Invocation`] by method name.
//!
//! # Invariants
//!
//! Each variant maps to exactly one hub method name (enforced by exhaustive
//! matches in [`HubInvocation::target`] and [`InboundEvent::from_invocation`]).

use serde_json::{Value, json};

use crate::{
    errors::PayloadError,
    frame::HubFrame,
    model::{
        CenterReassignment, ConversationId, ConversationSummary, Message, Notification,
        ReadMarker, TypingSignal, UserId,
    },
    wire,
};

/// Hub method names.
pub mod methods {
    /// Conversation hub → client: new message.
    pub const RECEIVE_MESSAGE: &str = "ReceiveMessage";
    /// Conversation hub → client: typing indicator.
    pub const USER_TYPING: &str = "UserTyping";
    /// Conversation hub → client: participant joined.
    pub const USER_JOINED: &str = "UserJoined";
    /// Conversation hub → client: participant left.
    pub const USER_LEFT: &str = "UserLeft";
    /// Conversation hub → client: read marker.
    pub const MESSAGE_READ: &str = "MessageRead";
    /// Conversation hub → client: conversation created.
    pub const NEW_CONVERSATION: &str = "NewConversation";
    /// Conversation hub → client: conversation moved to another center.
    pub const CENTER_REASSIGNED: &str = "CenterReassigned";
    /// Notification hub → client: system notification.
    pub const RECEIVE_NOTIFICATION: &str = "ReceiveNotification";

    /// Client → conversation hub.
    pub const JOIN_CONVERSATION: &str = "JoinConversation";
    /// Client → conversation hub.
    pub const LEAVE_CONVERSATION: &str = "LeaveConversation";
    /// Client → conversation hub.
    pub const SEND_MESSAGE: &str = "SendMessage";
    /// Client → conversation hub.
    pub const NOTIFY_TYPING: &str = "NotifyTyping";
    /// Client → conversation hub.
    pub const JOIN_USER_GROUP: &str = "JoinUserGroup";
    /// Client → conversation hub.
    pub const LEAVE_USER_GROUP: &str = "LeaveUserGroup";
    /// Client → notification hub.
    pub const JOIN_STAFF_GROUP: &str = "JoinStaffGroup";
}

/// Event pushed by a hub, already normalized to canonical types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    /// `ReceiveMessage(payload)`
    ReceiveMessage(Message),
    /// `UserTyping(payload)`
    UserTyping(TypingSignal),
    /// `UserJoined(userId, conversationId)`
    UserJoined {
        /// Participant that joined.
        user: UserId,
        /// Conversation joined.
        conversation: ConversationId,
    },
    /// `UserLeft(userId, conversationId)`
    UserLeft {
        /// Participant that left.
        user: UserId,
        /// Conversation left.
        conversation: ConversationId,
    },
    /// `MessageRead(payload)`
    MessageRead(ReadMarker),
    /// `NewConversation(payload)`
    NewConversation(ConversationSummary),
    /// `CenterReassigned(payload)`
    CenterReassigned(CenterReassignment),
    /// `ReceiveNotification(notification)`
    ReceiveNotification(Notification),
}

impl InboundEvent {
    /// Resolve a hub invocation into a typed event.
    ///
    /// # Errors
    ///
    /// - `UnknownTarget` for methods neither hub defines
    /// - `ArgumentCount` / field errors for malformed payloads
    pub fn from_invocation(target: &str, arguments: &[Value]) -> Result<Self, PayloadError> {
        match target {
            methods::RECEIVE_MESSAGE => single(methods::RECEIVE_MESSAGE, arguments)
                .and_then(wire::message)
                .map(Self::ReceiveMessage),
            methods::USER_TYPING => {
                single(methods::USER_TYPING, arguments).and_then(wire::typing).map(Self::UserTyping)
            },
            methods::USER_JOINED => {
                let (user, conversation) = membership_args(methods::USER_JOINED, arguments)?;
                Ok(Self::UserJoined { user, conversation })
            },
            methods::USER_LEFT => {
                let (user, conversation) = membership_args(methods::USER_LEFT, arguments)?;
                Ok(Self::UserLeft { user, conversation })
            },
            methods::MESSAGE_READ => single(methods::MESSAGE_READ, arguments)
                .and_then(wire::read_marker)
                .map(Self::MessageRead),
            methods::NEW_CONVERSATION => single(methods::NEW_CONVERSATION, arguments)
                .and_then(wire::conversation_summary)
                .map(Self::NewConversation),
            methods::CENTER_REASSIGNED => single(methods::CENTER_REASSIGNED, arguments)
                .and_then(wire::center_reassignment)
                .map(Self::CenterReassigned),
            methods::RECEIVE_NOTIFICATION => single(methods::RECEIVE_NOTIFICATION, arguments)
                .and_then(wire::notification)
                .map(Self::ReceiveNotification),
            other => Err(PayloadError::UnknownTarget(other.to_string())),
        }
    }

    /// Hub method name this event arrived on.
    pub fn target(&self) -> &'static str {
        match self {
            Self::ReceiveMessage(_) => methods::RECEIVE_MESSAGE,
            Self::UserTyping(_) => methods::USER_TYPING,
            Self::UserJoined { .. } => methods::USER_JOINED,
            Self::UserLeft { .. } => methods::USER_LEFT,
            Self::MessageRead(_) => methods::MESSAGE_READ,
            Self::NewConversation(_) => methods::NEW_CONVERSATION,
            Self::CenterReassigned(_) => methods::CENTER_REASSIGNED,
            Self::ReceiveNotification(_) => methods::RECEIVE_NOTIFICATION,
        }
    }
}

fn single<'a>(target: &'static str, arguments: &'a [Value]) -> Result<&'a Value, PayloadError> {
    match arguments {
        [payload] => Ok(payload),
        _ => Err(PayloadError::ArgumentCount { target, expected: 1, actual: arguments.len() }),
    }
}

fn membership_args(
    target: &'static str,
    arguments: &[Value],
) -> Result<(UserId, ConversationId), PayloadError> {
    match arguments {
        [user, conversation] => Ok((wire::user_id(user)?, wire::conversation_id(conversation)?)),
        _ => Err(PayloadError::ArgumentCount { target, expected: 2, actual: arguments.len() }),
    }
}

/// Method the client calls on a hub.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HubInvocation {
    /// `JoinConversation(conversationId)`
    JoinConversation(ConversationId),
    /// `LeaveConversation(conversationId)`
    LeaveConversation(ConversationId),
    /// `SendMessage(conversationId, content)`
    SendMessage {
        /// Target conversation.
        conversation: ConversationId,
        /// Message text.
        content: String,
    },
    /// `NotifyTyping(conversationId, isTyping, userId, guestSessionId)`
    NotifyTyping {
        /// Conversation being typed in.
        conversation: ConversationId,
        /// Start/refresh or stop.
        is_typing: bool,
        /// Our user id. `None` for guests.
        user: Option<UserId>,
        /// Our guest session. `None` for authenticated users.
        guest_session: Option<String>,
    },
    /// `JoinUserGroup(userId)`
    JoinUserGroup(UserId),
    /// `LeaveUserGroup(userId)`
    LeaveUserGroup(UserId),
    /// `JoinStaffGroup()`
    JoinStaffGroup,
}

impl HubInvocation {
    /// Hub method name.
    pub fn target(&self) -> &'static str {
        match self {
            Self::JoinConversation(_) => methods::JOIN_CONVERSATION,
            Self::LeaveConversation(_) => methods::LEAVE_CONVERSATION,
            Self::SendMessage { .. } => methods::SEND_MESSAGE,
            Self::NotifyTyping { .. } => methods::NOTIFY_TYPING,
            Self::JoinUserGroup(_) => methods::JOIN_USER_GROUP,
            Self::LeaveUserGroup(_) => methods::LEAVE_USER_GROUP,
            Self::JoinStaffGroup => methods::JOIN_STAFF_GROUP,
        }
    }

    /// Positional arguments in wire form.
    pub fn arguments(&self) -> Vec<Value> {
        match self {
            Self::JoinConversation(id) | Self::LeaveConversation(id) => vec![json!(id.get())],
            Self::SendMessage { conversation, content } => {
                vec![json!(conversation.get()), json!(content)]
            },
            Self::NotifyTyping { conversation, is_typing, user, guest_session } => vec![
                json!(conversation.get()),
                json!(is_typing),
                user.as_ref().map_or(Value::Null, |u| json!(u.as_str())),
                guest_session.as_ref().map_or(Value::Null, |g| json!(g)),
            ],
            Self::JoinUserGroup(user) | Self::LeaveUserGroup(user) => vec![json!(user.as_str())],
            Self::JoinStaffGroup => Vec::new(),
        }
    }

    /// Conversation this invocation targets. `None` for group methods.
    pub fn conversation(&self) -> Option<ConversationId> {
        match self {
            Self::JoinConversation(id) | Self::LeaveConversation(id) => Some(*id),
            Self::SendMessage { conversation, .. } | Self::NotifyTyping { conversation, .. } => {
                Some(*conversation)
            },
            Self::JoinUserGroup(_) | Self::LeaveUserGroup(_) | Self::JoinStaffGroup => None,
        }
    }

    /// Build the invocation frame. Pass an id to request a completion.
    pub fn to_frame(&self, invocation_id: Option<String>) -> HubFrame {
        HubFrame::Invocation {
            invocation_id,
            target: self.target().to_string(),
            arguments: self.arguments(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_joined_takes_two_positional_args() {
        let event =
            InboundEvent::from_invocation("UserJoined", &[json!("tech-1"), json!("15")]).unwrap();
        assert_eq!(event, InboundEvent::UserJoined {
            user: UserId::from("tech-1"),
            conversation: ConversationId::new(15),
        });

        let err = InboundEvent::from_invocation("UserLeft", &[json!("tech-1")]).unwrap_err();
        assert!(matches!(err, PayloadError::ArgumentCount { expected: 2, actual: 1, .. }));
    }

    #[test]
    fn unknown_method_is_reported() {
        let err = InboundEvent::from_invocation("Shrug", &[]).unwrap_err();
        assert_eq!(err, PayloadError::UnknownTarget("Shrug".into()));
    }

    #[test]
    fn notify_typing_sends_nulls_for_absent_identity() {
        let invocation = HubInvocation::NotifyTyping {
            conversation: ConversationId::new(3),
            is_typing: true,
            user: None,
            guest_session: Some("g-9".into()),
        };

        assert_eq!(invocation.arguments(), vec![json!(3), json!(true), Value::Null, json!("g-9")]);
    }
}
