//! Wire-format adapter.
//!
//! The backend serializes the same logical field under different names
//! depending on which endpoint produced the payload: camelCase from the hub,
//! PascalCase from older REST handlers, plus a few legacy aliases. Each
//! canonical field lists every known spelling here, checked in order; the
//! first non-null hit wins. Identifiers may arrive as JSON numbers or numeric
//! strings, timestamps as RFC 3339, zone-less ISO 8601 (assumed UTC), or Unix
//! milliseconds.
//!
//! Nothing outside this module looks at raw payload field names.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde_json::{Map, Value};

use crate::{
    errors::PayloadError,
    model::{
        CenterReassignment, ConversationId, ConversationSummary, Message, MessageId,
        MessageStatus, Notification, NotificationId, NotificationStatus, ReadMarker,
        TypingSignal, Typist, UserId,
    },
};

const MESSAGE_ID: &[&str] = &["messageId", "MessageId", "id", "Id"];
const CONVERSATION_ID: &[&str] = &["conversationId", "ConversationId"];
const SENDER_ID: &[&str] = &["senderId", "SenderId", "userId", "UserId"];
const CONTENT: &[&str] = &["content", "Content", "message", "Message", "text", "Text"];
const SENT_AT: &[&str] =
    &["sentAt", "SentAt", "timestamp", "Timestamp", "createdAt", "CreatedAt"];
const IS_READ: &[&str] = &["isRead", "IsRead"];

const TYPIST_USER: &[&str] = &["userId", "UserId"];
const TYPIST_GUEST: &[&str] = &["guestSessionId", "GuestSessionId"];
const IS_TYPING: &[&str] = &["isTyping", "IsTyping"];

const READER_ID: &[&str] = &["userId", "UserId", "readerId", "ReaderId", "readBy", "ReadBy"];
const LAST_READ_AT: &[&str] = &["lastReadAt", "LastReadAt", "readAt", "ReadAt"];

const SUMMARY_ID: &[&str] = &["conversationId", "ConversationId", "id", "Id"];
const PARTICIPANTS: &[&str] = &["participantIds", "ParticipantIds", "participants", "Participants"];
const PARTICIPANT_USER: &[&str] = &["userId", "UserId", "id", "Id"];
const SUBJECT: &[&str] = &["subject", "Subject", "title", "Title"];

const CENTER_ID: &[&str] = &["newCenterId", "NewCenterId", "centerId", "CenterId"];
const CENTER_NAME: &[&str] = &["newCenterName", "NewCenterName", "centerName", "CenterName"];

const NOTIFICATION_ID: &[&str] = &["notificationId", "NotificationId", "id", "Id"];
const NOTIFICATION_USER: &[&str] = &["userId", "UserId"];
const TITLE: &[&str] = &["title", "Title"];
const BODY: &[&str] = &["message", "Message", "content", "Content", "body", "Body"];
const STATUS: &[&str] = &["status", "Status"];
const KIND: &[&str] = &["type", "Type", "notificationType", "NotificationType"];
const CREATED_AT: &[&str] = &["createdAt", "CreatedAt", "timestamp", "Timestamp"];

const LISTING: &[&str] = &[
    "items",
    "Items",
    "data",
    "Data",
    "messages",
    "Messages",
    "notifications",
    "Notifications",
];

/// View over a JSON object that resolves canonical fields by alias list.
struct Fields<'a> {
    object: &'a Map<String, Value>,
}

impl<'a> Fields<'a> {
    fn of(value: &'a Value, target: &'static str) -> Result<Self, PayloadError> {
        value.as_object().map(|object| Self { object }).ok_or(PayloadError::NotAnObject { target })
    }

    fn get(&self, names: &[&str]) -> Option<&'a Value> {
        names.iter().filter_map(|name| self.object.get(*name)).find(|value| !value.is_null())
    }

    fn text(&self, names: &[&str]) -> Option<String> {
        self.get(names).and_then(text)
    }

    fn require_text(&self, names: &[&str], field: &'static str) -> Result<String, PayloadError> {
        self.text(names).ok_or(PayloadError::MissingField(field))
    }

    fn bool(&self, names: &[&str]) -> Option<bool> {
        self.get(names).and_then(Value::as_bool)
    }

    fn conversation(&self, names: &[&str]) -> Result<ConversationId, PayloadError> {
        let value = self.get(names).ok_or(PayloadError::MissingField("conversationId"))?;
        conversation_id(value)
    }

    fn timestamp(
        &self,
        names: &[&str],
        field: &'static str,
    ) -> Result<Option<DateTime<Utc>>, PayloadError> {
        self.get(names).map(|value| timestamp(value, field)).transpose()
    }
}

/// Scalar as non-empty text. Numbers are rendered in decimal.
fn text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Resolve a conversation id from a JSON number or numeric string.
pub fn conversation_id(value: &Value) -> Result<ConversationId, PayloadError> {
    match value {
        Value::Number(n) => n.as_u64().map(ConversationId::new).ok_or_else(|| {
            PayloadError::InvalidField {
                field: "conversationId",
                reason: format!("{n} is not an unsigned integer"),
            }
        }),
        Value::String(s) => s.parse::<ConversationId>().map_err(|e| PayloadError::InvalidField {
            field: "conversationId",
            reason: e.to_string(),
        }),
        _ => Err(PayloadError::InvalidField {
            field: "conversationId",
            reason: "expected number or numeric string".to_string(),
        }),
    }
}

/// Resolve a user id from a JSON string or number.
pub fn user_id(value: &Value) -> Result<UserId, PayloadError> {
    text(value).map(UserId::new).ok_or(PayloadError::MissingField("userId"))
}

/// Parse a timestamp in any of the formats the backend emits.
pub fn timestamp(value: &Value, field: &'static str) -> Result<DateTime<Utc>, PayloadError> {
    let invalid = |reason: String| PayloadError::InvalidField { field, reason };

    match value {
        Value::String(s) => {
            if let Ok(parsed) = DateTime::parse_from_rfc3339(s) {
                return Ok(parsed.with_timezone(&Utc));
            }
            NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                .map(|naive| Utc.from_utc_datetime(&naive))
                .map_err(|e| invalid(format!("{s:?}: {e}")))
        },
        Value::Number(n) => n
            .as_i64()
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
            .ok_or_else(|| invalid(format!("{n} is not a millisecond timestamp"))),
        _ => Err(invalid("expected string or number".to_string())),
    }
}

/// Normalize a `ReceiveMessage` payload.
///
/// The status is `Delivered` (or `Read` if the payload says so). The message
/// dispatcher adjusts it for echoes of our own sends.
pub fn message(value: &Value) -> Result<Message, PayloadError> {
    let fields = Fields::of(value, "ReceiveMessage")?;

    let id = fields.require_text(MESSAGE_ID, "messageId")?;
    let conversation = fields.conversation(CONVERSATION_ID)?;
    let sender = fields.require_text(SENDER_ID, "senderId").map(UserId::new)?;
    let content = fields.get(CONTENT).and_then(Value::as_str).unwrap_or_default().to_string();
    let sent_at = fields.timestamp(SENT_AT, "sentAt")?.ok_or(PayloadError::MissingField("sentAt"))?;
    let status = if fields.bool(IS_READ).unwrap_or(false) {
        MessageStatus::Read
    } else {
        MessageStatus::Delivered
    };

    Ok(Message { id: MessageId::Remote(id), conversation, sender, content, sent_at, status })
}

/// Normalize a REST history entry of `conversation`.
///
/// History endpoints are scoped to one conversation and often omit its id
/// from each entry.
pub fn history_message(
    value: &Value,
    conversation: ConversationId,
) -> Result<Message, PayloadError> {
    let fields = Fields::of(value, "history")?;
    if fields.get(CONVERSATION_ID).is_some() {
        return message(value);
    }

    let mut object = fields.object.clone();
    object.insert("conversationId".to_string(), Value::from(conversation.get()));
    message(&Value::Object(object))
}

/// Entries of a REST listing: either a bare array or an envelope object
/// wrapping one.
pub fn listing(value: &Value) -> &[Value] {
    match value {
        Value::Array(items) => items,
        Value::Object(object) => {
            Fields { object }.get(LISTING).and_then(Value::as_array).map_or(&[], Vec::as_slice)
        },
        _ => &[],
    }
}

/// Normalize a `UserTyping` payload.
///
/// A participant is identified by user id or, for anonymous web chat, by
/// guest session id. One of them must be present.
pub fn typing(value: &Value) -> Result<TypingSignal, PayloadError> {
    let fields = Fields::of(value, "UserTyping")?;

    let conversation = fields.conversation(CONVERSATION_ID)?;
    let typist = match (fields.text(TYPIST_USER), fields.text(TYPIST_GUEST)) {
        (Some(user), _) => Typist::User(UserId::new(user)),
        (None, Some(guest)) => Typist::Guest(guest),
        (None, None) => return Err(PayloadError::MissingField("userId")),
    };
    let is_typing = fields.bool(IS_TYPING).unwrap_or(true);

    Ok(TypingSignal { conversation, typist, is_typing })
}

/// Normalize a `MessageRead` payload.
pub fn read_marker(value: &Value) -> Result<ReadMarker, PayloadError> {
    let fields = Fields::of(value, "MessageRead")?;

    let conversation = fields.conversation(CONVERSATION_ID)?;
    let reader = fields.require_text(READER_ID, "userId").map(UserId::new)?;
    let last_read_at = fields
        .timestamp(LAST_READ_AT, "lastReadAt")?
        .ok_or(PayloadError::MissingField("lastReadAt"))?;

    Ok(ReadMarker { conversation, reader, last_read_at })
}

/// Normalize a `NewConversation` payload.
pub fn conversation_summary(value: &Value) -> Result<ConversationSummary, PayloadError> {
    let fields = Fields::of(value, "NewConversation")?;

    let id = fields.conversation(SUMMARY_ID)?;
    let participants = match fields.get(PARTICIPANTS) {
        Some(Value::Array(items)) => items.iter().filter_map(participant).collect(),
        _ => Vec::new(),
    };

    Ok(ConversationSummary { id, participants, subject: fields.text(SUBJECT) })
}

/// A participant entry is either a bare id or an object carrying one.
fn participant(value: &Value) -> Option<UserId> {
    match value {
        Value::Object(object) => {
            Fields { object }.text(PARTICIPANT_USER).map(UserId::new)
        },
        other => text(other).map(UserId::new),
    }
}

/// Normalize a `CenterReassigned` payload.
pub fn center_reassignment(value: &Value) -> Result<CenterReassignment, PayloadError> {
    let fields = Fields::of(value, "CenterReassigned")?;

    Ok(CenterReassignment {
        conversation: fields.conversation(CONVERSATION_ID)?,
        center_id: fields.text(CENTER_ID),
        center_name: fields.text(CENTER_NAME),
    })
}

/// Normalize a `ReceiveNotification` payload or a REST notification entry.
///
/// Status comes from a `status` string (`NEW`/`READ`, any case) or an
/// `isRead` flag; absent both, the notification is new.
pub fn notification(value: &Value) -> Result<Notification, PayloadError> {
    let fields = Fields::of(value, "ReceiveNotification")?;

    let id = fields.require_text(NOTIFICATION_ID, "notificationId").map(NotificationId::new)?;
    let status = match (fields.text(STATUS), fields.bool(IS_READ)) {
        (Some(status), _) if status.eq_ignore_ascii_case("read") => NotificationStatus::Read,
        (Some(status), _) if status.eq_ignore_ascii_case("new") => NotificationStatus::New,
        (Some(status), _) => {
            return Err(PayloadError::InvalidField {
                field: "status",
                reason: format!("unknown status {status:?}"),
            });
        },
        (None, Some(true)) => NotificationStatus::Read,
        (None, _) => NotificationStatus::New,
    };

    Ok(Notification {
        id,
        user: fields.text(NOTIFICATION_USER).map(UserId::new),
        title: fields.text(TITLE).unwrap_or_default(),
        message: fields.text(BODY).unwrap_or_default(),
        status,
        kind: fields.text(KIND),
        created_at: fields.timestamp(CREATED_AT, "createdAt")?,
    })
}
