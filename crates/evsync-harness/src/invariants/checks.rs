//! Standard invariant checks.
//!
//! These invariants capture behavioral properties that must always hold.
//! They verify WHAT must be true, not specific test scenarios.

use std::collections::BTreeSet;

use evsync_core::ConnectionStatus;

use super::{HubSnapshot, Invariant, InvariantResult, SystemSnapshot, Violation};

/// Status changes follow the connection state machine.
///
/// Every consecutive pair in a hub's status history must be a legal edge, and
/// the history starts at `Disconnected`.
pub struct LegalStatusTransitions;

impl LegalStatusTransitions {
    fn check_hub(&self, client: usize, hub: &str, snapshot: &HubSnapshot) -> InvariantResult {
        if let Some(first) = snapshot.status_history.first()
            && *first != ConnectionStatus::Disconnected
        {
            return Err(Violation {
                invariant: self.name(),
                message: format!("client {client} {hub}: history starts at {first}"),
            });
        }

        for window in snapshot.status_history.windows(2) {
            if !window[0].can_transition_to(window[1]) {
                return Err(Violation {
                    invariant: self.name(),
                    message: format!(
                        "client {client} {hub}: illegal transition {} → {}",
                        window[0], window[1]
                    ),
                });
            }
        }
        Ok(())
    }
}

impl Invariant for LegalStatusTransitions {
    fn name(&self) -> &'static str {
        "legal_status_transitions"
    }

    fn check(&self, state: &SystemSnapshot) -> InvariantResult {
        for client in &state.clients {
            self.check_hub(client.id, "chat", &client.chat)?;
            self.check_hub(client.id, "notifications", &client.notifications)?;
        }
        Ok(())
    }
}

/// Nothing is written to a hub that is not `Connected`.
///
/// Operations issued while offline must be deferred, not sent into a dead
/// link.
pub struct NoSendWhileOffline;

impl Invariant for NoSendWhileOffline {
    fn name(&self) -> &'static str {
        "no_send_while_offline"
    }

    fn check(&self, state: &SystemSnapshot) -> InvariantResult {
        for client in &state.clients {
            let hubs = [("chat", &client.chat), ("notifications", &client.notifications)];
            for (hub, snapshot) in hubs {
                if snapshot.offline_sends > 0 {
                    return Err(Violation {
                        invariant: self.name(),
                        message: format!(
                            "client {} {hub}: {} frames sent while offline",
                            client.id, snapshot.offline_sends
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}

/// A message id appears at most once per conversation.
pub struct UniqueMessageIds;

impl Invariant for UniqueMessageIds {
    fn name(&self) -> &'static str {
        "unique_message_ids"
    }

    fn check(&self, state: &SystemSnapshot) -> InvariantResult {
        for client in &state.clients {
            for (conversation, snapshot) in &client.conversations {
                let mut seen = BTreeSet::new();
                if let Some(duplicate) = snapshot.message_ids.iter().find(|id| !seen.insert(*id)) {
                    return Err(Violation {
                        invariant: self.name(),
                        message: format!(
                            "client {} conversation {conversation}: {duplicate:?} stored twice",
                            client.id
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Unread counts never exceed the number of messages from peers.
pub struct UnreadBounded;

impl Invariant for UnreadBounded {
    fn name(&self) -> &'static str {
        "unread_bounded"
    }

    fn check(&self, state: &SystemSnapshot) -> InvariantResult {
        for client in &state.clients {
            for (conversation, snapshot) in &client.conversations {
                if snapshot.unread as usize > snapshot.peer_messages {
                    return Err(Violation {
                        invariant: self.name(),
                        message: format!(
                            "client {} conversation {conversation}: unread {} > {} peer messages",
                            client.id, snapshot.unread, snapshot.peer_messages
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}

/// The notification badge equals the number of `NEW` notifications.
pub struct BadgeMatchesInbox;

impl Invariant for BadgeMatchesInbox {
    fn name(&self) -> &'static str {
        "badge_matches_inbox"
    }

    fn check(&self, state: &SystemSnapshot) -> InvariantResult {
        for client in &state.clients {
            if client.notification_unread != client.notifications_new {
                return Err(Violation {
                    invariant: self.name(),
                    message: format!(
                        "client {}: badge {} but {} new notifications",
                        client.id, client.notification_unread, client.notifications_new
                    ),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use evsync_proto::{ConversationId, MessageId};

    use super::*;
    use crate::invariants::{ClientSnapshot, ConversationSnapshot};

    fn with_history(history: Vec<ConnectionStatus>) -> SystemSnapshot {
        let mut client = ClientSnapshot::new(0);
        client.chat.status_history = history;
        SystemSnapshot::single(client)
    }

    #[test]
    fn legal_history_passes() {
        let snapshot = with_history(vec![
            ConnectionStatus::Disconnected,
            ConnectionStatus::Connecting,
            ConnectionStatus::Connected,
            ConnectionStatus::Reconnecting,
            ConnectionStatus::Connected,
            ConnectionStatus::Disconnected,
        ]);

        assert!(LegalStatusTransitions.check(&snapshot).is_ok());
    }

    #[test]
    fn skipping_connecting_is_caught() {
        let snapshot =
            with_history(vec![ConnectionStatus::Disconnected, ConnectionStatus::Connected]);

        let violation = LegalStatusTransitions.check(&snapshot).unwrap_err();
        assert_eq!(violation.invariant, "legal_status_transitions");
    }

    #[test]
    fn duplicate_id_is_caught() {
        let mut client = ClientSnapshot::new(1);
        client.conversations.insert(ConversationId::new(2), ConversationSnapshot {
            message_ids: vec![MessageId::remote("7"), MessageId::remote("7")],
            peer_messages: 2,
            unread: 0,
        });

        let result = UniqueMessageIds.check(&SystemSnapshot::single(client));
        assert!(result.is_err());
    }

    #[test]
    fn inflated_unread_is_caught() {
        let mut client = ClientSnapshot::new(1);
        client.conversations.insert(ConversationId::new(2), ConversationSnapshot {
            message_ids: vec![MessageId::remote("7")],
            peer_messages: 1,
            unread: 2,
        });

        assert!(UnreadBounded.check(&SystemSnapshot::single(client)).is_err());
    }
}
