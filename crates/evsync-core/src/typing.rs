//! Typing indicators.
//!
//! Outbound, keystrokes are debounced into at most one start signal per
//! window, and a stop signal follows automatically once the user goes idle.
//! Inbound, each start signal creates or refreshes an entry that expires on
//! its own; a stop signal removes it early.
//!
//! # Invariants
//!
//! - At most one outbound start per conversation per debounce window
//! - No inbound entry is reported after its expiry, swept or not
//! - The session's own typing signals are never reported back

use std::{collections::BTreeMap, time::Duration};

use evsync_proto::{ConversationId, HubInvocation, TypingSignal, Typist};

use crate::{env::Monotonic, identity::Identity};

/// Minimum spacing of outbound start signals.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(300);

/// Idle time after the last keystroke before an automatic stop.
pub const DEFAULT_IDLE_STOP: Duration = Duration::from_secs(3);

/// Lifetime of an inbound entry without a refresh.
pub const DEFAULT_TYPING_TTL: Duration = Duration::from_secs(5);

/// Typing timings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingConfig {
    /// Minimum spacing of outbound start signals.
    pub debounce: Duration,
    /// Idle time before an automatic stop.
    pub idle_stop: Duration,
    /// Inbound entry lifetime.
    pub ttl: Duration,
}

impl Default for TypingConfig {
    fn default() -> Self {
        Self { debounce: DEFAULT_DEBOUNCE, idle_stop: DEFAULT_IDLE_STOP, ttl: DEFAULT_TYPING_TTL }
    }
}

/// Actions returned by the typing coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypingAction {
    /// Send this `NotifyTyping` call.
    Transmit(HubInvocation),
    /// The active typist set of a conversation changed.
    Changed(ConversationId),
}

#[derive(Debug, Clone, Copy)]
struct Outbound<I> {
    last_sent: I,
    last_keystroke: I,
}

/// Typing coordinator for one session.
#[derive(Debug, Clone)]
pub struct TypingCoordinator<I>
where
    I: Monotonic,
{
    config: TypingConfig,
    identity: Identity,
    outbound: BTreeMap<ConversationId, Outbound<I>>,
    /// Expiry per typist.
    inbound: BTreeMap<ConversationId, BTreeMap<Typist, I>>,
}

impl<I> TypingCoordinator<I>
where
    I: Monotonic,
{
    /// Create a coordinator for `identity`.
    pub fn new(config: TypingConfig, identity: Identity) -> Self {
        Self { config, identity, outbound: BTreeMap::new(), inbound: BTreeMap::new() }
    }

    /// Timings in use.
    pub fn config(&self) -> &TypingConfig {
        &self.config
    }

    /// The local user typed in `conversation`.
    ///
    /// Returns a start signal if none went out within the debounce window.
    pub fn notify_typing(&mut self, conversation: ConversationId, now: I) -> Option<HubInvocation> {
        let debounce = self.config.debounce;
        match self.outbound.get_mut(&conversation) {
            Some(state) => {
                state.last_keystroke = now;
                if now - state.last_sent < debounce {
                    return None;
                }
                state.last_sent = now;
            },
            None => {
                let outbound = Outbound { last_sent: now, last_keystroke: now };
                self.outbound.insert(conversation, outbound);
            },
        }
        Some(self.signal(conversation, true))
    }

    /// Stop typing in `conversation` now (message sent or input cleared).
    ///
    /// Returns a stop signal if a start had gone out.
    pub fn stop_typing(&mut self, conversation: ConversationId) -> Option<HubInvocation> {
        self.outbound.remove(&conversation).map(|_| self.signal(conversation, false))
    }

    /// Apply an inbound typing signal. Returns true if the active set changed.
    pub fn on_signal(&mut self, signal: &TypingSignal, now: I) -> bool {
        if self.identity.is_typist(&signal.typist) {
            return false;
        }

        let entries = self.inbound.entry(signal.conversation).or_default();
        if signal.is_typing {
            let previous = entries.insert(signal.typist.clone(), now + self.config.ttl);
            previous.is_none_or(|expires_at| expires_at <= now)
        } else {
            let removed = entries.remove(&signal.typist).is_some_and(|expires_at| expires_at > now);
            if entries.is_empty() {
                self.inbound.remove(&signal.conversation);
            }
            removed
        }
    }

    /// Active typists in `conversation`, expired entries excluded.
    pub fn active(&self, conversation: ConversationId, now: I) -> Vec<Typist> {
        self.inbound
            .get(&conversation)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|(_, expires_at)| **expires_at > now)
                    .map(|(typist, _)| typist.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drop all inbound state for `conversation` (left it).
    pub fn clear(&mut self, conversation: ConversationId) {
        self.inbound.remove(&conversation);
        self.outbound.remove(&conversation);
    }

    /// Sweep expired inbound entries and send idle stops.
    pub fn tick(&mut self, now: I) -> Vec<TypingAction> {
        let mut actions = Vec::new();

        let idle_stop = self.config.idle_stop;
        let idle: Vec<ConversationId> = self
            .outbound
            .iter()
            .filter(|(_, state)| now - state.last_keystroke >= idle_stop)
            .map(|(conversation, _)| *conversation)
            .collect();
        for conversation in idle {
            self.outbound.remove(&conversation);
            actions.push(TypingAction::Transmit(self.signal(conversation, false)));
        }

        self.inbound.retain(|conversation, entries| {
            let before = entries.len();
            entries.retain(|_, expires_at| *expires_at > now);
            if entries.len() != before {
                actions.push(TypingAction::Changed(*conversation));
            }
            !entries.is_empty()
        });

        actions
    }

    /// Earliest instant at which [`TypingCoordinator::tick`] has work.
    pub fn next_deadline(&self) -> Option<I> {
        let idle = self.outbound.values().map(|state| state.last_keystroke + self.config.idle_stop);
        let expiry = self.inbound.values().flat_map(|entries| entries.values().copied());
        idle.chain(expiry).min()
    }

    fn signal(&self, conversation: ConversationId, is_typing: bool) -> HubInvocation {
        HubInvocation::NotifyTyping {
            conversation,
            is_typing,
            user: self.identity.user.clone(),
            guest_session: self.identity.guest_session.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use evsync_proto::UserId;

    use super::*;

    fn coordinator() -> TypingCoordinator<Instant> {
        TypingCoordinator::new(TypingConfig::default(), Identity::user("advisor-1"))
    }

    fn start(conversation: u64, user: &str) -> TypingSignal {
        TypingSignal {
            conversation: ConversationId::new(conversation),
            typist: Typist::User(UserId::from(user)),
            is_typing: true,
        }
    }

    #[test]
    fn keystrokes_within_window_send_once() {
        let t0 = Instant::now();
        let mut typing = coordinator();
        let conversation = ConversationId::new(1);

        let sent = (0..10)
            .filter_map(|i| typing.notify_typing(conversation, t0 + Duration::from_millis(i * 20)))
            .count();
        assert_eq!(sent, 1);

        // Window elapsed: refresh goes out
        assert!(typing.notify_typing(conversation, t0 + Duration::from_millis(300)).is_some());
    }

    #[test]
    fn idle_sends_trailing_stop() {
        let t0 = Instant::now();
        let mut typing = coordinator();
        let conversation = ConversationId::new(1);

        typing.notify_typing(conversation, t0);
        typing.notify_typing(conversation, t0 + Duration::from_secs(1));

        assert!(typing.tick(t0 + Duration::from_millis(3999)).is_empty());
        assert_eq!(typing.tick(t0 + Duration::from_secs(4)), vec![TypingAction::Transmit(
            HubInvocation::NotifyTyping {
                conversation,
                is_typing: false,
                user: Some(UserId::from("advisor-1")),
                guest_session: None,
            }
        )]);
        assert!(typing.tick(t0 + Duration::from_secs(10)).is_empty());
    }

    #[test]
    fn stop_only_after_start() {
        let t0 = Instant::now();
        let mut typing = coordinator();
        let conversation = ConversationId::new(2);

        assert!(typing.stop_typing(conversation).is_none());
        typing.notify_typing(conversation, t0);
        assert!(typing.stop_typing(conversation).is_some());
        assert!(typing.tick(t0 + Duration::from_secs(5)).is_empty());
    }

    #[test]
    fn inbound_entries_expire_without_stop() {
        let t0 = Instant::now();
        let mut typing = coordinator();
        let conversation = ConversationId::new(3);

        assert!(typing.on_signal(&start(3, "customer-9"), t0));
        assert_eq!(typing.active(conversation, t0 + Duration::from_millis(4999)).len(), 1);

        // Query filters before any sweep
        assert!(typing.active(conversation, t0 + Duration::from_secs(5)).is_empty());
        assert_eq!(typing.tick(t0 + Duration::from_secs(5)), vec![TypingAction::Changed(
            conversation
        )]);
        assert_eq!(typing.next_deadline(), None);
    }

    #[test]
    fn refresh_extends_expiry() {
        let t0 = Instant::now();
        let mut typing = coordinator();
        let conversation = ConversationId::new(3);

        typing.on_signal(&start(3, "customer-9"), t0);
        assert!(!typing.on_signal(&start(3, "customer-9"), t0 + Duration::from_secs(4)));
        assert_eq!(typing.active(conversation, t0 + Duration::from_secs(8)).len(), 1);
    }

    #[test]
    fn explicit_stop_removes_entry() {
        let t0 = Instant::now();
        let mut typing = coordinator();

        typing.on_signal(&start(3, "customer-9"), t0);
        let stop = TypingSignal { is_typing: false, ..start(3, "customer-9") };
        assert!(typing.on_signal(&stop, t0));
        assert!(typing.active(ConversationId::new(3), t0).is_empty());
        assert!(!typing.on_signal(&stop, t0));
    }

    #[test]
    fn own_signals_are_ignored() {
        let t0 = Instant::now();
        let mut typing = coordinator();

        assert!(!typing.on_signal(&start(3, "advisor-1"), t0));
        assert!(typing.active(ConversationId::new(3), t0).is_empty());
    }
}
