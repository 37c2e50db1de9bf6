//! In-memory hub backend.
//!
//! `SimHub` plays the server side of one hub endpoint: it tracks connections
//! and their groups, assigns message ids, echoes messages to every member of
//! a conversation and completes each invocation. It performs no I/O; callers
//! route the returned [`Delivery`] values to the right link.
//!
//! Faults are scripted: refuse the next N dials with a given error, or mark
//! the endpoint missing so every dial fails with `NotFound`.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use chrono::{DateTime, Utc};
use evsync_core::{ConnectionError, Environment};
use evsync_proto::{
    ConversationId, HubFrame, Message, MessageId, MessageStatus, ReadMarker, UserId,
    event::methods,
};
use serde_json::{Value, json};
use tracing::debug;

use crate::SimEnv;

/// Server-side connection handle.
pub type ConnId = u64;

/// A frame the hub wants written to one connection.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Receiving connection.
    pub conn: ConnId,
    /// Frame to write.
    pub frame: HubFrame,
}

/// A message as the hub stored it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    /// Backend id.
    pub id: u64,
    /// Sender user id or guest session.
    pub sender: String,
    /// Text.
    pub content: String,
    /// Hub timestamp.
    pub sent_at: DateTime<Utc>,
}

impl StoredMessage {
    /// The message as the REST history endpoint returns it.
    pub fn to_message(&self, conversation: ConversationId) -> Message {
        Message {
            id: MessageId::remote(self.id.to_string()),
            conversation,
            sender: UserId::from(self.sender.as_str()),
            content: self.content.clone(),
            sent_at: self.sent_at,
            status: MessageStatus::Sent,
        }
    }
}

#[derive(Debug, Default)]
struct HubConnection {
    /// User id or guest session presented at dial time.
    principal: String,
    conversations: BTreeSet<ConversationId>,
    user_group: bool,
    staff_group: bool,
}

/// Server side of one hub endpoint.
#[derive(Debug)]
pub struct SimHub {
    env: SimEnv,
    name: &'static str,
    connections: BTreeMap<ConnId, HubConnection>,
    next_conn: ConnId,
    next_message: u64,
    next_notification: u64,
    history: BTreeMap<ConversationId, Vec<StoredMessage>>,
    refusals: VecDeque<ConnectionError>,
    missing: bool,
    dials: usize,
}

impl SimHub {
    /// Hub named `name` (used in logs and `NotFound` errors).
    pub fn new(env: SimEnv, name: &'static str) -> Self {
        Self {
            env,
            name,
            connections: BTreeMap::new(),
            next_conn: 1,
            next_message: 1,
            next_notification: 1,
            history: BTreeMap::new(),
            refusals: VecDeque::new(),
            missing: false,
            dials: 0,
        }
    }

    /// Fail the next `count` dials with `error`.
    pub fn refuse_next(&mut self, count: usize, error: &ConnectionError) {
        self.refusals.extend(std::iter::repeat_n(error.clone(), count));
    }

    /// Make the endpoint disappear (every dial fails with `NotFound`) or
    /// come back.
    pub fn set_missing(&mut self, missing: bool) {
        self.missing = missing;
    }

    /// Drop every scripted fault.
    pub fn heal(&mut self) {
        self.refusals.clear();
        self.missing = false;
    }

    /// Number of dial attempts seen.
    pub fn dials(&self) -> usize {
        self.dials
    }

    /// Accept or refuse a dial from `principal`.
    ///
    /// # Errors
    ///
    /// - `NotFound` while the endpoint is missing
    /// - The scripted error while refusals are pending
    pub fn dial(&mut self, principal: &str) -> Result<ConnId, ConnectionError> {
        self.dials += 1;
        if self.missing {
            return Err(ConnectionError::NotFound { endpoint: format!("sim://{}", self.name) });
        }
        if let Some(error) = self.refusals.pop_front() {
            return Err(error);
        }

        let conn = self.next_conn;
        self.next_conn += 1;
        let connection = HubConnection { principal: principal.to_string(), ..Default::default() };
        self.connections.insert(conn, connection);
        debug!(hub = self.name, conn, principal, "accepted");
        Ok(conn)
    }

    /// Forget a connection. Group memberships go with it.
    pub fn close(&mut self, conn: ConnId) {
        if self.connections.remove(&conn).is_some() {
            debug!(hub = self.name, conn, "closed");
        }
    }

    /// Live connection ids.
    pub fn connections(&self) -> impl Iterator<Item = ConnId> + '_ {
        self.connections.keys().copied()
    }

    /// True if `conn` joined `conversation`.
    pub fn is_joined(&self, conn: ConnId, conversation: ConversationId) -> bool {
        self.connections.get(&conn).is_some_and(|c| c.conversations.contains(&conversation))
    }

    /// True if `conn` is in its user group.
    pub fn in_user_group(&self, conn: ConnId) -> bool {
        self.connections.get(&conn).is_some_and(|c| c.user_group)
    }

    /// True if `conn` is in the staff group.
    pub fn in_staff_group(&self, conn: ConnId) -> bool {
        self.connections.get(&conn).is_some_and(|c| c.staff_group)
    }

    /// Messages stored for `conversation`, in send order.
    pub fn history(&self, conversation: ConversationId) -> &[StoredMessage] {
        self.history.get(&conversation).map_or(&[], Vec::as_slice)
    }

    /// Handle a frame written by `conn`.
    pub fn receive(&mut self, conn: ConnId, frame: HubFrame) -> Vec<Delivery> {
        let HubFrame::Invocation { invocation_id, target, arguments } = frame else {
            return Vec::new();
        };

        let mut out = Vec::new();
        let result = self.invoke(conn, &target, &arguments, &mut out);
        if let Some(invocation_id) = invocation_id {
            let error = result.err();
            let frame = HubFrame::Completion { invocation_id, result: None, error };
            out.insert(0, Delivery { conn, frame });
        }
        out
    }

    /// Broadcast a read marker stored over REST to the conversation.
    pub fn store_read_marker(&self, marker: &ReadMarker) -> Vec<Delivery> {
        let payload = json!({
            "conversationId": marker.conversation.get(),
            "userId": marker.reader.as_str(),
            "lastReadAt": marker.last_read_at.to_rfc3339(),
        });
        let frame = HubFrame::invocation(methods::MESSAGE_READ, vec![payload]);
        self.members(marker.conversation, None)
            .into_iter()
            .map(|conn| Delivery { conn, frame: frame.clone() })
            .collect()
    }

    /// Push a new notification to every connection of `user`.
    pub fn push_notification(&mut self, user: &UserId, title: &str) -> Vec<Delivery> {
        let id = self.next_notification;
        self.next_notification += 1;

        let payload = json!({
            "notificationId": format!("n-{id}"),
            "userId": user.as_str(),
            "title": title,
            "message": format!("{title} ({id})"),
            "status": "NEW",
            "createdAt": self.env.wall_clock().to_rfc3339(),
        });
        let frame = HubFrame::invocation(methods::RECEIVE_NOTIFICATION, vec![payload]);
        self.connections
            .iter()
            .filter(|(_, c)| c.principal == user.as_str())
            .map(|(&conn, _)| Delivery { conn, frame: frame.clone() })
            .collect()
    }

    fn invoke(
        &mut self,
        conn: ConnId,
        target: &str,
        arguments: &[Value],
        out: &mut Vec<Delivery>,
    ) -> Result<(), String> {
        let principal = self
            .connections
            .get(&conn)
            .map(|c| c.principal.clone())
            .ok_or_else(|| "unknown connection".to_string())?;

        match target {
            methods::JOIN_CONVERSATION => {
                let conversation = conversation_arg(arguments)?;
                self.connection(conn)?.conversations.insert(conversation);
                let frame = HubFrame::invocation(methods::USER_JOINED, vec![
                    json!(principal),
                    json!(conversation.get()),
                ]);
                self.broadcast(conversation, Some(conn), &frame, out);
            },
            methods::LEAVE_CONVERSATION => {
                let conversation = conversation_arg(arguments)?;
                if self.connection(conn)?.conversations.remove(&conversation) {
                    let frame = HubFrame::invocation(methods::USER_LEFT, vec![
                        json!(principal),
                        json!(conversation.get()),
                    ]);
                    self.broadcast(conversation, Some(conn), &frame, out);
                }
            },
            methods::SEND_MESSAGE => {
                let conversation = conversation_arg(arguments)?;
                let content = arguments.get(1).and_then(Value::as_str).ok_or("missing content")?;

                let id = self.next_message;
                self.next_message += 1;
                let sent_at = self.env.wall_clock();
                let stored = StoredMessage {
                    id,
                    sender: principal.clone(),
                    content: content.to_string(),
                    sent_at,
                };
                self.history.entry(conversation).or_default().push(stored);

                let payload = json!({
                    "messageId": id,
                    "conversationId": conversation.get(),
                    "senderId": principal,
                    "content": content,
                    "sentAt": sent_at.to_rfc3339(),
                });
                let frame = HubFrame::invocation(methods::RECEIVE_MESSAGE, vec![payload]);
                // Participants may post without holding the live group; the
                // caller still gets its echo
                if !self.is_joined(conn, conversation) {
                    out.push(Delivery { conn, frame: frame.clone() });
                }
                self.broadcast(conversation, None, &frame, out);
            },
            methods::NOTIFY_TYPING => {
                let conversation = conversation_arg(arguments)?;
                let is_typing = arguments.get(1).and_then(Value::as_bool).unwrap_or(true);
                let payload = json!({
                    "conversationId": conversation.get(),
                    "userId": arguments.get(2).cloned().unwrap_or(Value::Null),
                    "guestSessionId": arguments.get(3).cloned().unwrap_or(Value::Null),
                    "isTyping": is_typing,
                });
                let frame = HubFrame::invocation(methods::USER_TYPING, vec![payload]);
                self.broadcast(conversation, Some(conn), &frame, out);
            },
            methods::JOIN_USER_GROUP => self.connection(conn)?.user_group = true,
            methods::LEAVE_USER_GROUP => self.connection(conn)?.user_group = false,
            methods::JOIN_STAFF_GROUP => self.connection(conn)?.staff_group = true,
            other => return Err(format!("unknown method {other}")),
        }
        Ok(())
    }

    fn connection(&mut self, conn: ConnId) -> Result<&mut HubConnection, String> {
        self.connections.get_mut(&conn).ok_or_else(|| "unknown connection".to_string())
    }

    fn members(&self, conversation: ConversationId, except: Option<ConnId>) -> Vec<ConnId> {
        self.connections
            .iter()
            .filter(|(conn, c)| Some(**conn) != except && c.conversations.contains(&conversation))
            .map(|(&conn, _)| conn)
            .collect()
    }

    fn broadcast(
        &self,
        conversation: ConversationId,
        except: Option<ConnId>,
        frame: &HubFrame,
        out: &mut Vec<Delivery>,
    ) {
        for conn in self.members(conversation, except) {
            out.push(Delivery { conn, frame: frame.clone() });
        }
    }
}

fn conversation_arg(arguments: &[Value]) -> Result<ConversationId, String> {
    arguments
        .first()
        .and_then(Value::as_u64)
        .map(ConversationId::new)
        .ok_or_else(|| "missing conversation id".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(target: &str, id: u64, arguments: Vec<Value>) -> HubFrame {
        HubFrame::Invocation {
            invocation_id: Some(id.to_string()),
            target: target.to_string(),
            arguments,
        }
    }

    fn completion_error(deliveries: &[Delivery]) -> Option<String> {
        deliveries.iter().find_map(|d| match &d.frame {
            HubFrame::Completion { error, .. } => error.clone(),
            _ => None,
        })
    }

    #[test]
    fn message_is_echoed_to_every_member() {
        let mut hub = SimHub::new(SimEnv::new(), "chat");
        let tech = hub.dial("tech").unwrap();
        let customer = hub.dial("customer").unwrap();
        hub.receive(tech, call("JoinConversation", 1, vec![json!(3)]));
        hub.receive(customer, call("JoinConversation", 1, vec![json!(3)]));

        let deliveries = hub.receive(tech, call("SendMessage", 2, vec![json!(3), json!("hi")]));

        let recipients: Vec<ConnId> = deliveries
            .iter()
            .filter(|d| matches!(&d.frame, HubFrame::Invocation { .. }))
            .map(|d| d.conn)
            .collect();
        assert_eq!(recipients, vec![tech, customer]);
        assert_eq!(hub.history(ConversationId::new(3)).len(), 1);
    }

    #[test]
    fn send_outside_group_echoes_to_caller_only() {
        let mut hub = SimHub::new(SimEnv::new(), "chat");
        let tech = hub.dial("tech").unwrap();
        let other = hub.dial("customer").unwrap();

        let deliveries = hub.receive(tech, call("SendMessage", 1, vec![json!(3), json!("hi")]));

        assert_eq!(completion_error(&deliveries), None);
        assert!(deliveries.iter().all(|d| d.conn == tech));
        assert!(!deliveries.iter().any(|d| d.conn == other));
        assert_eq!(hub.history(ConversationId::new(3)).len(), 1);
    }

    #[test]
    fn malformed_send_completes_with_error() {
        let mut hub = SimHub::new(SimEnv::new(), "chat");
        let tech = hub.dial("tech").unwrap();

        let deliveries = hub.receive(tech, call("SendMessage", 1, vec![json!(3)]));

        assert_eq!(completion_error(&deliveries).as_deref(), Some("missing content"));
        assert!(hub.history(ConversationId::new(3)).is_empty());
    }

    #[test]
    fn scripted_refusals_then_accept() {
        let mut hub = SimHub::new(SimEnv::new(), "chat");
        hub.refuse_next(2, &ConnectionError::Transport("refused".into()));

        assert!(hub.dial("tech").is_err());
        assert!(hub.dial("tech").is_err());
        assert!(hub.dial("tech").is_ok());
        assert_eq!(hub.dials(), 3);
    }

    #[test]
    fn missing_endpoint_reports_not_found() {
        let mut hub = SimHub::new(SimEnv::new(), "notifications");
        hub.set_missing(true);

        let err = hub.dial("tech").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn closing_drops_group_membership() {
        let mut hub = SimHub::new(SimEnv::new(), "chat");
        let tech = hub.dial("tech").unwrap();
        hub.receive(tech, call("JoinConversation", 1, vec![json!(3)]));

        hub.close(tech);

        assert!(!hub.is_joined(tech, ConversationId::new(3)));
        assert_eq!(hub.connections().count(), 0);
    }
}
