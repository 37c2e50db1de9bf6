//! Message dispatch.
//!
//! Keeps one ordered message list per conversation. Live messages are
//! appended in arrival order; history loaded over REST is merged by id and
//! the list re-sorted by timestamp (stable, so ties keep arrival order).
//!
//! Own sends are recorded immediately as `Sending` under a provisional local
//! id. When the hub echoes the message back, it is matched to the oldest
//! pending local message with the same content and takes over the backend
//! id.
//!
//! # Invariants
//!
//! - A message id appears at most once per conversation
//! - Message status never regresses

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use evsync_proto::{ConversationId, Message, MessageId, MessageStatus, PayloadError, wire};
use serde_json::Value;
use tracing::warn;

use crate::identity::Identity;

/// Result of dispatching one inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// New message appended.
    Appended {
        /// The stored message.
        message: Message,
        /// Sent by someone else: unread count was incremented.
        from_peer: bool,
    },
    /// Echo of our own pending send.
    Acknowledged {
        /// Provisional id the message had.
        local: MessageId,
        /// The stored message, now under its backend id.
        message: Message,
    },
    /// Already present; dropped.
    Duplicate,
}

/// Per-conversation message state.
#[derive(Debug, Clone, Default)]
pub struct MessageDispatcher {
    identity: Identity,
    conversations: BTreeMap<ConversationId, Vec<Message>>,
    unread: BTreeMap<ConversationId, u32>,
    next_local: u64,
}

impl MessageDispatcher {
    /// Create a dispatcher for `identity`.
    pub fn new(identity: Identity) -> Self {
        Self { identity, ..Self::default() }
    }

    /// Normalize a raw `ReceiveMessage` payload.
    pub fn normalize(raw: &Value) -> Result<Message, PayloadError> {
        wire::message(raw)
    }

    /// Record a local send. Returns the provisional message.
    pub fn record_local(
        &mut self,
        conversation: ConversationId,
        content: String,
        now: DateTime<Utc>,
    ) -> Message {
        self.next_local += 1;
        let message = Message {
            id: MessageId::Local(self.next_local),
            conversation,
            sender: self.identity.sender(),
            content,
            sent_at: now,
            status: MessageStatus::Sending,
        };
        self.conversations.entry(conversation).or_default().push(message.clone());
        message
    }

    /// Dispatch a live inbound message.
    pub fn on_message(&mut self, mut message: Message) -> DispatchOutcome {
        let own = self.identity.is_self(&message.sender);
        let list = self.conversations.entry(message.conversation).or_default();

        if list.iter().any(|existing| existing.id == message.id) {
            return DispatchOutcome::Duplicate;
        }

        if own {
            let incoming = own_status(message.status);
            if let Some(pending) = list.iter_mut().find(|existing| {
                existing.id.is_local()
                    && existing.status == MessageStatus::Sending
                    && existing.content == message.content
            }) {
                let local = std::mem::replace(&mut pending.id, message.id);
                pending.status.promote(incoming);
                pending.sent_at = message.sent_at;
                return DispatchOutcome::Acknowledged { local, message: pending.clone() };
            }

            // Sent from another device
            message.status = incoming;
            list.push(message.clone());
            return DispatchOutcome::Appended { message, from_peer: false };
        }

        list.push(message.clone());
        *self.unread.entry(message.conversation).or_default() += 1;
        DispatchOutcome::Appended { message, from_peer: true }
    }

    /// Merge a history batch loaded over REST.
    ///
    /// Known ids keep their entry (status may advance); unknown ids are
    /// added. Entries belonging to another conversation are skipped. History
    /// never changes unread counts.
    pub fn merge_history(&mut self, conversation: ConversationId, batch: Vec<Message>) {
        let list = self.conversations.entry(conversation).or_default();

        for mut incoming in batch {
            if incoming.conversation != conversation {
                let id = &incoming.id;
                warn!(%conversation, other = %incoming.conversation, %id, "foreign history entry");
                continue;
            }
            if let Some(existing) = list.iter_mut().find(|existing| existing.id == incoming.id) {
                existing.status.promote(incoming.status);
                continue;
            }

            let own = self.identity.is_self(&incoming.sender);
            let pending = if own {
                list.iter_mut().find(|existing| {
                    existing.status == MessageStatus::Sending
                        && existing.id.is_local()
                        && existing.content == incoming.content
                })
            } else {
                None
            };
            match pending {
                Some(pending) => {
                    pending.id = incoming.id;
                    pending.sent_at = incoming.sent_at;
                    pending.status.promote(own_status(incoming.status));
                },
                None => {
                    if own {
                        incoming.status = own_status(incoming.status);
                    }
                    list.push(incoming);
                },
            }
        }

        list.sort_by_key(|message| message.sent_at);
    }

    /// Promote own messages at or before `up_to` to `Read`.
    ///
    /// Returns the ids that changed.
    pub fn promote_read(
        &mut self,
        conversation: ConversationId,
        up_to: DateTime<Utc>,
    ) -> Vec<MessageId> {
        let Some(list) = self.conversations.get_mut(&conversation) else {
            return Vec::new();
        };

        list.iter_mut()
            .filter(|message| self.identity.is_self(&message.sender) && message.sent_at <= up_to)
            .filter(|message| !message.id.is_local())
            .filter_map(|message| {
                message.status.promote(MessageStatus::Read).then(|| message.id.clone())
            })
            .collect()
    }

    /// Messages of `conversation` in display order.
    pub fn messages(&self, conversation: ConversationId) -> &[Message] {
        self.conversations.get(&conversation).map(Vec::as_slice).unwrap_or_default()
    }

    /// Unread count of `conversation`.
    pub fn unread(&self, conversation: ConversationId) -> u32 {
        self.unread.get(&conversation).copied().unwrap_or(0)
    }

    /// Unread count across all conversations.
    pub fn total_unread(&self) -> u32 {
        self.unread.values().sum()
    }

    /// Reset the unread count. Returns true if it was non-zero.
    pub fn reset_unread(&mut self, conversation: ConversationId) -> bool {
        self.unread.remove(&conversation).is_some_and(|count| count > 0)
    }

    /// Timestamp of the newest message in `conversation`.
    pub fn latest(&self, conversation: ConversationId) -> Option<DateTime<Utc>> {
        self.messages(conversation).iter().map(|message| message.sent_at).max()
    }

    /// Drop all state for `conversation`.
    pub fn clear(&mut self, conversation: ConversationId) {
        self.conversations.remove(&conversation);
        self.unread.remove(&conversation);
    }
}

/// Status of an own message reported back by the backend. Delivery is only
/// meaningful for peers, so anything short of read means sent.
fn own_status(reported: MessageStatus) -> MessageStatus {
    if reported == MessageStatus::Read { MessageStatus::Read } else { MessageStatus::Sent }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use evsync_proto::UserId;

    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).single().unwrap()
    }

    fn remote(id: &str, sender: &str, content: &str, secs: i64) -> Message {
        Message {
            id: MessageId::remote(id),
            conversation: ConversationId::new(1),
            sender: UserId::from(sender),
            content: content.to_string(),
            sent_at: at(secs),
            status: MessageStatus::Delivered,
        }
    }

    #[test]
    fn duplicate_ids_store_once() {
        let mut dispatcher = MessageDispatcher::new(Identity::user("me"));

        let first = dispatcher.on_message(remote("m1", "tech", "hello", 0));
        assert!(matches!(first, DispatchOutcome::Appended { from_peer: true, .. }));
        let again = dispatcher.on_message(remote("m1", "tech", "hello", 0));
        assert_eq!(again, DispatchOutcome::Duplicate);

        assert_eq!(dispatcher.messages(ConversationId::new(1)).len(), 1);
        assert_eq!(dispatcher.unread(ConversationId::new(1)), 1);
    }

    #[test]
    fn echo_acknowledges_oldest_pending_send() {
        let mut dispatcher = MessageDispatcher::new(Identity::user("me"));
        let conversation = ConversationId::new(1);

        let first = dispatcher.record_local(conversation, "ok".into(), at(0));
        dispatcher.record_local(conversation, "ok".into(), at(1));

        let outcome = dispatcher.on_message(remote("m7", "me", "ok", 2));
        let DispatchOutcome::Acknowledged { local, message } = outcome else {
            panic!("expected acknowledgement, got {outcome:?}");
        };
        assert_eq!(local, first.id);
        assert_eq!(message.id, MessageId::remote("m7"));
        assert_eq!(message.status, MessageStatus::Sent);

        let statuses: Vec<_> =
            dispatcher.messages(conversation).iter().map(|m| m.status).collect();
        assert_eq!(statuses, vec![MessageStatus::Sent, MessageStatus::Sending]);
        assert_eq!(dispatcher.unread(conversation), 0);
    }

    #[test]
    fn history_merges_by_id_and_sorts() {
        let mut dispatcher = MessageDispatcher::new(Identity::user("me"));
        let conversation = ConversationId::new(1);

        dispatcher.on_message(remote("m3", "tech", "three", 30));
        dispatcher.merge_history(conversation, vec![
            remote("m1", "tech", "one", 10),
            remote("m3", "tech", "three", 30),
            remote("m2", "tech", "two", 20),
        ]);

        let ids: Vec<_> =
            dispatcher.messages(conversation).iter().map(|m| m.id.to_string()).collect();
        assert_eq!(ids, vec!["m1", "m2", "m3"]);
        assert_eq!(dispatcher.unread(conversation), 1);
    }

    #[test]
    fn history_ties_keep_arrival_order() {
        let mut dispatcher = MessageDispatcher::new(Identity::user("me"));
        let conversation = ConversationId::new(1);

        dispatcher.merge_history(conversation, vec![
            remote("b", "tech", "first", 5),
            remote("a", "tech", "second", 5),
        ]);

        let ids: Vec<_> =
            dispatcher.messages(conversation).iter().map(|m| m.id.to_string()).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[test]
    fn history_skips_entries_of_other_conversations() {
        let mut dispatcher = MessageDispatcher::new(Identity::user("me"));
        let mut foreign = remote("x9", "tech", "elsewhere", 15);
        foreign.conversation = ConversationId::new(9);

        dispatcher.merge_history(ConversationId::new(1), vec![
            remote("m1", "tech", "one", 10),
            foreign,
        ]);

        let ids: Vec<_> =
            dispatcher.messages(ConversationId::new(1)).iter().map(|m| m.id.to_string()).collect();
        assert_eq!(ids, vec!["m1"]);
        assert!(dispatcher.messages(ConversationId::new(9)).is_empty());
    }

    #[test]
    fn own_history_is_sent_not_delivered() {
        let mut dispatcher = MessageDispatcher::new(Identity::user("me"));
        let conversation = ConversationId::new(1);

        dispatcher.merge_history(conversation, vec![remote("m1", "me", "mine", 10)]);

        assert_eq!(dispatcher.messages(conversation)[0].status, MessageStatus::Sent);
    }

    #[test]
    fn read_promotion_is_bounded_and_own_only() {
        let mut dispatcher = MessageDispatcher::new(Identity::user("me"));
        let conversation = ConversationId::new(1);

        for (id, secs) in [("t1", 1), ("t2", 2), ("t3", 3)] {
            let mut message = remote(id, "me", id, secs);
            message.status = MessageStatus::Sent;
            dispatcher.merge_history(conversation, vec![message]);
        }
        dispatcher.on_message(remote("p1", "tech", "peer", 1));

        let promoted = dispatcher.promote_read(conversation, at(2));
        assert_eq!(promoted, vec![MessageId::remote("t1"), MessageId::remote("t2")]);

        let status = |id: &str| {
            dispatcher
                .messages(conversation)
                .iter()
                .find(|m| m.id == MessageId::remote(id))
                .map(|m| m.status)
        };
        assert_eq!(status("t3"), Some(MessageStatus::Sent));
        assert_eq!(status("p1"), Some(MessageStatus::Delivered));
    }

    #[test]
    fn reset_unread() {
        let mut dispatcher = MessageDispatcher::new(Identity::user("me"));
        let conversation = ConversationId::new(1);

        dispatcher.on_message(remote("m1", "tech", "a", 0));
        dispatcher.on_message(remote("m2", "tech", "b", 1));
        assert_eq!(dispatcher.total_unread(), 2);

        assert!(dispatcher.reset_unread(conversation));
        assert!(!dispatcher.reset_unread(conversation));
        assert_eq!(dispatcher.unread(conversation), 0);
    }
}
