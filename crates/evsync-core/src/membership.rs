//! Conversation membership.
//!
//! Tracks which conversations this session is in and whether the hub knows
//! about it on the current link. The hub forgets group membership when a
//! link drops, so after every reconnect each conversation is joined again,
//! once, in the order it was first joined.
//!
//! Calls are only issued while connected. A join made while disconnected is
//! remembered as a not-yet-joined entry and goes out with the rejoins on the
//! next link; a leave made while disconnected just forgets the entry.
//!
//! # Invariants
//!
//! - At most one `JoinConversation` per conversation per link
//! - `LeaveConversation` only for conversations joined on the current link

use std::collections::{BTreeMap, BTreeSet};

use evsync_proto::{ConversationId, ConversationSummary, HubInvocation, UserId};

#[derive(Debug, Clone)]
struct Entry {
    id: ConversationId,
    /// Joined on the current link.
    live: bool,
}

/// Conversation membership and participant sets.
#[derive(Debug, Clone, Default)]
pub struct Membership {
    /// Join order.
    entries: Vec<Entry>,
    participants: BTreeMap<ConversationId, BTreeSet<UserId>>,
}

impl Membership {
    /// Create an empty membership.
    pub fn new() -> Self {
        Self::default()
    }

    /// Join `conversation` on a live link.
    ///
    /// Returns the call to make, or `None` if already joined.
    pub fn join(&mut self, conversation: ConversationId) -> Option<HubInvocation> {
        match self.entries.iter_mut().find(|entry| entry.id == conversation) {
            Some(entry) if entry.live => None,
            Some(entry) => {
                entry.live = true;
                Some(HubInvocation::JoinConversation(conversation))
            },
            None => {
                self.entries.push(Entry { id: conversation, live: true });
                Some(HubInvocation::JoinConversation(conversation))
            },
        }
    }

    /// Remember `conversation` while disconnected so the next link joins it.
    ///
    /// Returns false if it was already a member.
    pub fn remember(&mut self, conversation: ConversationId) -> bool {
        if self.is_member(conversation) {
            return false;
        }
        self.entries.push(Entry { id: conversation, live: false });
        true
    }

    /// Leave `conversation`.
    ///
    /// Returns the call to make, or `None` if it was not joined on the
    /// current link. Never fails for non-members.
    pub fn leave(&mut self, conversation: ConversationId) -> Option<HubInvocation> {
        let index = self.entries.iter().position(|entry| entry.id == conversation)?;
        let entry = self.entries.remove(index);
        self.participants.remove(&conversation);

        entry.live.then_some(HubInvocation::LeaveConversation(conversation))
    }

    /// Forget `conversation` without a remote call, so it is not joined
    /// again after a reconnect.
    pub fn forget(&mut self, conversation: ConversationId) {
        self.entries.retain(|entry| entry.id != conversation);
    }

    /// The link dropped: the hub no longer has us in any group.
    pub fn connection_lost(&mut self) {
        for entry in &mut self.entries {
            entry.live = false;
        }
    }

    /// A link came up. Returns joins for every conversation not yet joined on
    /// it, in join order.
    pub fn on_connected(&mut self) -> Vec<HubInvocation> {
        self.entries
            .iter_mut()
            .filter(|entry| !entry.live)
            .map(|entry| {
                entry.live = true;
                HubInvocation::JoinConversation(entry.id)
            })
            .collect()
    }

    /// A join call failed; it will be retried on the next link.
    pub fn join_failed(&mut self, conversation: ConversationId) {
        if let Some(entry) = self.entries.iter_mut().find(|entry| entry.id == conversation) {
            entry.live = false;
        }
    }

    /// True if `conversation` is joined on the current link.
    pub fn is_joined(&self, conversation: ConversationId) -> bool {
        self.entries.iter().any(|entry| entry.id == conversation && entry.live)
    }

    /// True if the session is a member of `conversation`, live or not.
    pub fn is_member(&self, conversation: ConversationId) -> bool {
        self.entries.iter().any(|entry| entry.id == conversation)
    }

    /// Conversations in join order.
    pub fn conversations(&self) -> impl Iterator<Item = ConversationId> + '_ {
        self.entries.iter().map(|entry| entry.id)
    }

    /// Record a participant joining. Returns true if the set changed.
    pub fn participant_joined(&mut self, conversation: ConversationId, user: UserId) -> bool {
        self.participants.entry(conversation).or_default().insert(user)
    }

    /// Record a participant leaving. Returns true if the set changed.
    pub fn participant_left(&mut self, conversation: ConversationId, user: &UserId) -> bool {
        self.participants.get_mut(&conversation).is_some_and(|set| set.remove(user))
    }

    /// Seed participants from a newly created conversation.
    pub fn conversation_created(&mut self, summary: &ConversationSummary) {
        let participants = self.participants.entry(summary.id).or_default();
        participants.extend(summary.participants.iter().cloned());
    }

    /// Known participants of `conversation`.
    pub fn participants(&self, conversation: ConversationId) -> Vec<UserId> {
        self.participants
            .get(&conversation)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u64) -> ConversationId {
        ConversationId::new(n)
    }

    #[test]
    fn join_is_idempotent() {
        let mut membership = Membership::new();

        assert_eq!(membership.join(id(1)), Some(HubInvocation::JoinConversation(id(1))));
        assert_eq!(membership.join(id(1)), None);
        assert!(membership.is_joined(id(1)));
    }

    #[test]
    fn leave_only_calls_for_joined() {
        let mut membership = Membership::new();

        assert_eq!(membership.leave(id(9)), None);

        membership.join(id(2));
        assert_eq!(membership.leave(id(2)), Some(HubInvocation::LeaveConversation(id(2))));
        assert_eq!(membership.leave(id(2)), None);
    }

    #[test]
    fn reconnect_rejoins_in_join_order_once() {
        let mut membership = Membership::new();
        membership.join(id(3));
        membership.join(id(1));
        membership.join(id(2));

        membership.connection_lost();
        assert!(!membership.is_joined(id(1)));
        assert_eq!(membership.leave(id(1)), None);

        assert_eq!(membership.on_connected(), vec![
            HubInvocation::JoinConversation(id(3)),
            HubInvocation::JoinConversation(id(2)),
        ]);
        assert!(membership.on_connected().is_empty());
    }

    #[test]
    fn failed_join_retries_next_link() {
        let mut membership = Membership::new();
        membership.join(id(5));
        membership.join_failed(id(5));

        assert_eq!(membership.on_connected(), vec![HubInvocation::JoinConversation(id(5))]);
    }

    #[test]
    fn remembered_conversation_joins_on_next_link() {
        let mut membership = Membership::new();
        membership.join(id(1));
        membership.connection_lost();

        assert!(membership.remember(id(4)));
        assert!(!membership.remember(id(4)));
        assert!(!membership.remember(id(1)));
        assert!(!membership.is_joined(id(4)));
        assert_eq!(membership.conversations().collect::<Vec<_>>(), vec![id(1), id(4)]);

        assert_eq!(membership.on_connected(), vec![
            HubInvocation::JoinConversation(id(1)),
            HubInvocation::JoinConversation(id(4)),
        ]);
        assert!(membership.is_joined(id(4)));
    }

    #[test]
    fn forgotten_conversation_is_not_rejoined() {
        let mut membership = Membership::new();
        membership.join(id(5));
        membership.connection_lost();
        membership.forget(id(5));

        assert!(membership.on_connected().is_empty());
        assert!(!membership.is_member(id(5)));
    }

    #[test]
    fn participants_follow_events() {
        let mut membership = Membership::new();
        membership.conversation_created(&ConversationSummary {
            id: id(4),
            participants: vec![UserId::from("a"), UserId::from("b")],
            subject: None,
        });

        assert!(membership.participant_joined(id(4), UserId::from("c")));
        assert!(!membership.participant_joined(id(4), UserId::from("a")));
        assert!(membership.participant_left(id(4), &UserId::from("b")));
        assert!(!membership.participant_left(id(8), &UserId::from("b")));

        assert_eq!(membership.participants(id(4)), vec![UserId::from("a"), UserId::from("c")]);
    }
}
