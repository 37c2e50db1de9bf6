//! Read receipts.
//!
//! Keeps the latest "read up to" instant per participant per conversation.
//! A peer's marker promotes our own messages at or before it to `Read`; our
//! own marker (from `mark_read` or another device) only advances our own
//! position. Own messages that show up after a peer's marker (history pages,
//! late echoes, other devices) are promoted against it with [`reapply`].
//!
//! [`reapply`]: ReadReceiptTracker::reapply
//!
//! # Invariants
//!
//! - A participant's marker only moves forward; older markers are ignored

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use evsync_proto::{ConversationId, MessageId, ReadMarker, UserId};

use crate::{dispatcher::MessageDispatcher, identity::Identity};

/// Result of applying an inbound read marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiptOutcome {
    /// Marker was not newer than what we had.
    Stale,
    /// Marker advanced. Lists own messages promoted to `Read`.
    Advanced {
        /// Messages that became read.
        promoted: Vec<MessageId>,
    },
}

/// Read marker bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct ReadReceiptTracker {
    identity: Identity,
    markers: BTreeMap<ConversationId, BTreeMap<UserId, DateTime<Utc>>>,
}

impl ReadReceiptTracker {
    /// Create a tracker for `identity`.
    pub fn new(identity: Identity) -> Self {
        Self { identity, markers: BTreeMap::new() }
    }

    /// The local user read `conversation` up to `now`.
    ///
    /// Resets the conversation's unread count. Returns the marker to send to
    /// the backend, or `None` for sessions without a user id.
    pub fn mark_read(
        &mut self,
        conversation: ConversationId,
        now: DateTime<Utc>,
        dispatcher: &mut MessageDispatcher,
    ) -> Option<ReadMarker> {
        dispatcher.reset_unread(conversation);

        let reader = self.identity.user.clone()?;
        let last_read_at = dispatcher.latest(conversation).map_or(now, |latest| latest.max(now));
        self.advance(conversation, &reader, last_read_at);

        Some(ReadMarker { conversation, reader, last_read_at })
    }

    /// Apply a read marker pushed by the hub.
    pub fn on_read_marker(
        &mut self,
        marker: &ReadMarker,
        dispatcher: &mut MessageDispatcher,
    ) -> ReceiptOutcome {
        if !self.advance(marker.conversation, &marker.reader, marker.last_read_at) {
            return ReceiptOutcome::Stale;
        }

        if self.identity.is_self(&marker.reader) {
            return ReceiptOutcome::Advanced { promoted: Vec::new() };
        }

        let promoted = dispatcher.promote_read(marker.conversation, marker.last_read_at);
        ReceiptOutcome::Advanced { promoted }
    }

    /// Promote own messages of `conversation` against the furthest peer
    /// marker already recorded. Returns the ids that became read.
    pub fn reapply(
        &self,
        conversation: ConversationId,
        dispatcher: &mut MessageDispatcher,
    ) -> Vec<MessageId> {
        match self.peer_read_at(conversation) {
            Some(up_to) => dispatcher.promote_read(conversation, up_to),
            None => Vec::new(),
        }
    }

    /// Furthest read instant reported by any peer in `conversation`.
    pub fn peer_read_at(&self, conversation: ConversationId) -> Option<DateTime<Utc>> {
        self.markers
            .get(&conversation)?
            .iter()
            .filter(|(reader, _)| !self.identity.is_self(reader))
            .map(|(_, at)| *at)
            .max()
    }

    /// Last read instant of `participant` in `conversation`.
    pub fn last_read_at(
        &self,
        conversation: ConversationId,
        participant: &UserId,
    ) -> Option<DateTime<Utc>> {
        self.markers.get(&conversation).and_then(|markers| markers.get(participant)).copied()
    }

    /// Drop markers for `conversation`.
    pub fn clear(&mut self, conversation: ConversationId) {
        self.markers.remove(&conversation);
    }

    fn advance(
        &mut self,
        conversation: ConversationId,
        reader: &UserId,
        at: DateTime<Utc>,
    ) -> bool {
        let markers = self.markers.entry(conversation).or_default();
        match markers.get(reader) {
            Some(current) if *current >= at => false,
            _ => {
                markers.insert(reader.clone(), at);
                true
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use evsync_proto::{Message, MessageStatus};

    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).single().unwrap()
    }

    fn conversation() -> ConversationId {
        ConversationId::new(12)
    }

    fn seeded() -> MessageDispatcher {
        let mut dispatcher = MessageDispatcher::new(Identity::user("me"));
        let batch = [("t1", 1), ("t2", 2), ("t3", 3)]
            .into_iter()
            .map(|(id, secs)| Message {
                id: MessageId::remote(id),
                conversation: conversation(),
                sender: UserId::from("me"),
                content: id.to_string(),
                sent_at: at(secs),
                status: MessageStatus::Sent,
            })
            .collect();
        dispatcher.merge_history(conversation(), batch);
        dispatcher
    }

    fn marker(reader: &str, secs: i64) -> ReadMarker {
        ReadMarker {
            conversation: conversation(),
            reader: UserId::from(reader),
            last_read_at: at(secs),
        }
    }

    fn statuses(dispatcher: &MessageDispatcher) -> Vec<MessageStatus> {
        dispatcher.messages(conversation()).iter().map(|m| m.status).collect()
    }

    #[test]
    fn peer_marker_promotes_up_to_timestamp() {
        let mut dispatcher = seeded();
        let mut tracker = ReadReceiptTracker::new(Identity::user("me"));

        let outcome = tracker.on_read_marker(&marker("tech", 2), &mut dispatcher);
        assert_eq!(outcome, ReceiptOutcome::Advanced {
            promoted: vec![MessageId::remote("t1"), MessageId::remote("t2")],
        });
        assert_eq!(statuses(&dispatcher), vec![
            MessageStatus::Read,
            MessageStatus::Read,
            MessageStatus::Sent
        ]);

        // Older marker changes nothing
        let outcome = tracker.on_read_marker(&marker("tech", 1), &mut dispatcher);
        assert_eq!(outcome, ReceiptOutcome::Stale);
        assert_eq!(tracker.last_read_at(conversation(), &UserId::from("tech")), Some(at(2)));
        assert_eq!(statuses(&dispatcher)[2], MessageStatus::Sent);
    }

    #[test]
    fn own_marker_from_other_device_only_advances() {
        let mut dispatcher = seeded();
        let mut tracker = ReadReceiptTracker::new(Identity::user("me"));

        let outcome = tracker.on_read_marker(&marker("me", 3), &mut dispatcher);
        assert_eq!(outcome, ReceiptOutcome::Advanced { promoted: Vec::new() });
        assert!(statuses(&dispatcher).iter().all(|status| *status == MessageStatus::Sent));
    }

    #[test]
    fn late_own_history_is_promoted_against_earlier_marker() {
        let mut dispatcher = MessageDispatcher::new(Identity::user("me"));
        let mut tracker = ReadReceiptTracker::new(Identity::user("me"));
        tracker.on_read_marker(&marker("tech", 20), &mut dispatcher);
        tracker.on_read_marker(&marker("me", 40), &mut dispatcher);
        assert_eq!(tracker.peer_read_at(conversation()), Some(at(20)));

        let own = |id: &str, secs| Message {
            id: MessageId::remote(id),
            conversation: conversation(),
            sender: UserId::from("me"),
            content: id.to_string(),
            sent_at: at(secs),
            status: MessageStatus::Sent,
        };
        dispatcher.merge_history(conversation(), vec![own("h1", 10), own("h2", 30)]);

        let promoted = tracker.reapply(conversation(), &mut dispatcher);
        assert_eq!(promoted, vec![MessageId::remote("h1")]);
        assert_eq!(statuses(&dispatcher), vec![MessageStatus::Read, MessageStatus::Sent]);
        assert!(tracker.reapply(conversation(), &mut dispatcher).is_empty());
    }

    #[test]
    fn mark_read_resets_unread_and_emits_marker() {
        let mut dispatcher = seeded();
        let mut tracker = ReadReceiptTracker::new(Identity::user("me"));
        dispatcher.on_message(Message {
            id: MessageId::remote("p1"),
            conversation: conversation(),
            sender: UserId::from("tech"),
            content: "done".into(),
            sent_at: at(10),
            status: MessageStatus::Delivered,
        });
        assert_eq!(dispatcher.unread(conversation()), 1);

        let emitted = tracker.mark_read(conversation(), at(5), &mut dispatcher).unwrap();
        assert_eq!(emitted.reader, UserId::from("me"));
        assert_eq!(emitted.last_read_at, at(10));
        assert_eq!(dispatcher.unread(conversation()), 0);
        assert_eq!(tracker.last_read_at(conversation(), &UserId::from("me")), Some(at(10)));
    }

    #[test]
    fn guests_reset_unread_without_marker() {
        let mut dispatcher = MessageDispatcher::new(Identity::guest("g-1"));
        let mut tracker = ReadReceiptTracker::new(Identity::guest("g-1"));

        assert!(tracker.mark_read(conversation(), at(0), &mut dispatcher).is_none());
    }
}
