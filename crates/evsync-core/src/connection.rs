//! Hub connection lifecycle.
//!
//! Manages connect, disconnect and automatic reconnect for one hub. Uses the
//! action pattern: methods take time as input and return actions for the
//! driver to execute. The driver dials, reports the outcome back with the
//! generation it was given, and calls [`Connection::tick`] when
//! [`Connection::next_deadline`] passes.
//!
//! # State Machine
//!
//! ```text
//!                  connect()
//! ┌──────────────┐─────────────>┌────────────┐ established ┌───────────┐
//! │ Disconnected │              │ Connecting │────────────>│ Connected │
//! └──────────────┘<─────────────└────────────┘             └───────────┘
//!        ↑   ↑     fatal/404          │ retryable failure   │       │
//!        │   │                        ↓                     │ lost  │
//!        │   │    exhausted    ┌──────────────┐<────────────┘       │
//!        │   └─────────────────│ Reconnecting │────────────────────>│
//!        │                     └──────────────┘  established        │
//!        └──────────────────────────────────────────────────────────┘
//!                          disconnect() (any state)
//! ```
//!
//! # Invariants
//!
//! - Status changes only along the edges above
//! - `Reconnecting → Connected` only after at least one retry attempt
//! - Dial results from an older generation are ignored, so a disconnect
//!   always wins over an in-flight dial

use std::{fmt, time::Duration};

use evsync_proto::Credential;
use tracing::debug;

use crate::{env::Monotonic, error::ConnectionError};

/// Retry delays, indexed by attempt. The last entry repeats.
pub const DEFAULT_RECONNECT_DELAYS: [Duration; 4] = [
    Duration::ZERO,
    Duration::from_secs(2),
    Duration::from_secs(10),
    Duration::from_secs(30),
];

/// Retry attempts before giving up and going to `Disconnected`.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 6;

/// Connection status, as reported to status observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    /// No link and no attempt pending. Terminal until `connect`.
    Disconnected,
    /// First attempt after `connect` in progress.
    Connecting,
    /// Link up, handshake complete.
    Connected,
    /// Link lost or initial attempt failed; retrying on schedule.
    Reconnecting,
}

impl ConnectionStatus {
    /// Whether `self → next` is a legal edge.
    pub fn can_transition_to(self, next: ConnectionStatus) -> bool {
        matches!(
            (self, next),
            (Self::Disconnected, Self::Connecting)
                | (Self::Connecting, Self::Connected | Self::Reconnecting | Self::Disconnected)
                | (Self::Connected, Self::Reconnecting | Self::Disconnected)
                | (Self::Reconnecting, Self::Connected | Self::Disconnected)
        )
    }

    /// True when the link is usable.
    pub fn is_connected(self) -> bool {
        self == Self::Connected
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
        })
    }
}

/// Reconnect schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before each retry attempt. The last entry repeats once the
    /// schedule runs past its end.
    pub delays: Vec<Duration>,
    /// Retry attempts before giving up.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self { delays: DEFAULT_RECONNECT_DELAYS.to_vec(), max_attempts: DEFAULT_MAX_ATTEMPTS }
    }
}

impl ReconnectPolicy {
    /// Delay before retry `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let Some(last) = self.delays.len().checked_sub(1) else {
            return Duration::ZERO;
        };
        let index = (attempt.saturating_sub(1) as usize).min(last);
        self.delays[index]
    }
}

/// Actions returned by the connection state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionAction {
    /// Open a link. Report the outcome with the same `generation`.
    Dial {
        /// Epoch this dial belongs to.
        generation: u64,
        /// Retry attempt, 0 for the first dial after `connect`.
        attempt: u32,
        /// Credential to present.
        credential: Credential,
    },
    /// Tear down the link (or in-flight dial) of this generation.
    CloseLink {
        /// Epoch being closed.
        generation: u64,
    },
    /// Status changed. Observers are notified in registration order.
    StatusChanged {
        /// Previous status.
        from: ConnectionStatus,
        /// New status.
        to: ConnectionStatus,
    },
}

/// Connection state machine for one hub.
///
/// Pure: no I/O and no clock. Generic over the instant type so simulation
/// can drive it with virtual time.
#[derive(Debug, Clone)]
pub struct Connection<I>
where
    I: Monotonic,
{
    status: ConnectionStatus,
    policy: ReconnectPolicy,
    /// Bumped on every `connect` from `Disconnected` and every `disconnect`.
    generation: u64,
    /// Retry attempts since the last successful handshake.
    attempt: u32,
    /// A dial of the current generation is outstanding.
    dialing: bool,
    retry_at: Option<I>,
    credential: Option<Credential>,
    last_error: Option<ConnectionError>,
    /// Endpoint missing; no automatic retries until the next `connect`.
    degraded: bool,
    connected_since: Option<I>,
}

impl<I> Connection<I>
where
    I: Monotonic,
{
    /// Create a connection in [`ConnectionStatus::Disconnected`].
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            policy,
            generation: 0,
            attempt: 0,
            dialing: false,
            retry_at: None,
            credential: None,
            last_error: None,
            degraded: false,
            connected_since: None,
        }
    }

    /// Current status.
    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    /// Current generation.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Retry attempts since the last successful handshake.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Most recent link error. Cleared on success and on `connect`.
    pub fn last_error(&self) -> Option<&ConnectionError> {
        self.last_error.as_ref()
    }

    /// True once the endpoint was found missing.
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// When the current link came up. `None` unless connected.
    pub fn connected_since(&self) -> Option<I> {
        self.connected_since
    }

    /// Reconnect schedule in use.
    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Next time [`Connection::tick`] has work to do.
    pub fn next_deadline(&self) -> Option<I> {
        if self.dialing { None } else { self.retry_at }
    }

    /// Replace the credential used by subsequent dials.
    pub fn renew_credential(&mut self, credential: Credential) {
        self.credential = Some(credential);
    }

    /// Start connecting.
    ///
    /// Idempotent: already connected or an attempt in flight returns no
    /// actions. The credential is kept for later retries either way.
    pub fn connect(&mut self, credential: Credential) -> Vec<ConnectionAction> {
        self.credential = Some(credential.clone());

        if self.status != ConnectionStatus::Disconnected {
            return Vec::new();
        }

        self.generation += 1;
        self.attempt = 0;
        self.retry_at = None;
        self.last_error = None;
        self.degraded = false;

        let mut actions = Vec::new();
        self.transition(ConnectionStatus::Connecting, &mut actions);
        self.dialing = true;
        let generation = self.generation;
        actions.push(ConnectionAction::Dial { generation, attempt: 0, credential });
        actions
    }

    /// Force `Disconnected` from any state, cancelling retries.
    pub fn disconnect(&mut self) -> Vec<ConnectionAction> {
        self.retry_at = None;
        if self.status == ConnectionStatus::Disconnected {
            return Vec::new();
        }

        let closing = self.generation;
        self.generation += 1;
        self.attempt = 0;
        self.dialing = false;
        self.connected_since = None;

        let mut actions = vec![ConnectionAction::CloseLink { generation: closing }];
        self.transition(ConnectionStatus::Disconnected, &mut actions);
        actions
    }

    /// The dial of `generation` completed its handshake.
    ///
    /// A stale generation returns `CloseLink` so the driver drops the link.
    pub fn link_established(&mut self, generation: u64, now: I) -> Vec<ConnectionAction> {
        if generation != self.generation || !self.dialing {
            return vec![ConnectionAction::CloseLink { generation }];
        }

        let mut actions = Vec::new();
        self.dialing = false;
        self.transition(ConnectionStatus::Connected, &mut actions);
        self.attempt = 0;
        self.retry_at = None;
        self.last_error = None;
        self.degraded = false;
        self.connected_since = Some(now);
        actions
    }

    /// The dial of `generation` failed.
    pub fn link_failed(
        &mut self,
        generation: u64,
        error: ConnectionError,
        now: I,
    ) -> Vec<ConnectionAction> {
        if generation != self.generation || !self.dialing {
            return Vec::new();
        }

        self.dialing = false;
        self.fail(error, now)
    }

    /// The established link of `generation` went away.
    pub fn link_lost(
        &mut self,
        generation: u64,
        error: ConnectionError,
        now: I,
    ) -> Vec<ConnectionAction> {
        if generation != self.generation || self.status != ConnectionStatus::Connected {
            return Vec::new();
        }

        self.connected_since = None;
        self.attempt = 0;
        self.fail(error, now)
    }

    /// Fire a due retry.
    pub fn tick(&mut self, now: I) -> Vec<ConnectionAction> {
        if self.status != ConnectionStatus::Reconnecting || self.dialing {
            return Vec::new();
        }
        match self.retry_at {
            Some(at) if at <= now => {},
            _ => return Vec::new(),
        }
        let Some(credential) = self.credential.clone() else {
            return Vec::new();
        };

        self.retry_at = None;
        self.dialing = true;
        let (generation, attempt) = (self.generation, self.attempt);
        vec![ConnectionAction::Dial { generation, attempt, credential }]
    }

    fn fail(&mut self, error: ConnectionError, now: I) -> Vec<ConnectionAction> {
        let mut actions = Vec::new();
        let retryable = error.is_retryable();
        self.degraded |= error.is_not_found();
        self.last_error = Some(error);

        if !retryable || self.attempt >= self.policy.max_attempts {
            debug!(retryable, attempts = self.attempt, degraded = self.degraded, "not retrying");
            self.retry_at = None;
            self.transition(ConnectionStatus::Disconnected, &mut actions);
            return actions;
        }

        self.attempt += 1;
        let delay = self.policy.delay_for(self.attempt);
        debug!(attempt = self.attempt, ?delay, generation = self.generation, "retry scheduled");
        self.retry_at = Some(now + delay);
        if self.status != ConnectionStatus::Reconnecting {
            self.transition(ConnectionStatus::Reconnecting, &mut actions);
        }
        actions.extend(self.tick(now));
        actions
    }

    fn transition(&mut self, to: ConnectionStatus, actions: &mut Vec<ConnectionAction>) {
        let from = self.status;
        debug_assert!(from.can_transition_to(to), "illegal transition {from} -> {to}");
        debug_assert!(
            !(from == ConnectionStatus::Reconnecting && to == ConnectionStatus::Connected)
                || self.attempt > 0,
            "reconnected without a retry attempt"
        );

        self.status = to;
        actions.push(ConnectionAction::StatusChanged { from, to });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    fn credential() -> Credential {
        Credential::bearer("token")
    }

    fn statuses(actions: &[ConnectionAction]) -> Vec<(ConnectionStatus, ConnectionStatus)> {
        actions
            .iter()
            .filter_map(|action| match action {
                ConnectionAction::StatusChanged { from, to } => Some((*from, *to)),
                _ => None,
            })
            .collect()
    }

    fn dial(actions: &[ConnectionAction]) -> Option<(u64, u32)> {
        actions.iter().find_map(|action| match action {
            ConnectionAction::Dial { generation, attempt, .. } => Some((*generation, *attempt)),
            _ => None,
        })
    }

    #[test]
    fn connect_dials_and_establishes() {
        let t0 = Instant::now();
        let mut conn = Connection::new(ReconnectPolicy::default());

        let actions = conn.connect(credential());
        assert_eq!(conn.status(), ConnectionStatus::Connecting);
        assert_eq!(statuses(&actions), vec![(
            ConnectionStatus::Disconnected,
            ConnectionStatus::Connecting
        )]);
        let (generation, attempt) = dial(&actions).unwrap();
        assert_eq!(attempt, 0);

        let actions = conn.link_established(generation, t0);
        assert_eq!(statuses(&actions), vec![(
            ConnectionStatus::Connecting,
            ConnectionStatus::Connected
        )]);
        assert_eq!(conn.connected_since(), Some(t0));
    }

    #[test]
    fn connect_is_idempotent() {
        let mut conn = Connection::<Instant>::new(ReconnectPolicy::default());

        assert!(dial(&conn.connect(credential())).is_some());
        assert!(conn.connect(credential()).is_empty());
        assert_eq!(conn.status(), ConnectionStatus::Connecting);
    }

    #[test]
    fn retry_schedule_exhausts_to_disconnected() {
        let t0 = Instant::now();
        let policy = ReconnectPolicy {
            delays: vec![Duration::ZERO, Duration::from_secs(2), Duration::from_secs(10)],
            max_attempts: 3,
        };
        let mut conn = Connection::new(policy);

        let (generation, _) = dial(&conn.connect(credential())).unwrap();
        conn.link_established(generation, t0);

        // Drop: immediate retry
        let actions = conn.link_lost(generation, ConnectionError::Transport("reset".into()), t0);
        assert_eq!(conn.status(), ConnectionStatus::Reconnecting);
        assert_eq!(dial(&actions), Some((generation, 1)));

        // Attempt 1 fails: next in 2s
        conn.link_failed(generation, ConnectionError::Transport("refused".into()), t0);
        assert!(conn.tick(t0 + Duration::from_millis(1999)).is_empty());
        let t2 = t0 + Duration::from_secs(2);
        assert_eq!(conn.next_deadline(), Some(t2));
        assert_eq!(dial(&conn.tick(t2)), Some((generation, 2)));

        // Attempt 2 fails: next in 10s
        conn.link_failed(generation, ConnectionError::Transport("refused".into()), t2);
        let t12 = t2 + Duration::from_secs(10);
        assert!(conn.tick(t12 - Duration::from_millis(1)).is_empty());
        assert_eq!(dial(&conn.tick(t12)), Some((generation, 3)));

        // Attempt 3 fails: give up
        let actions =
            conn.link_failed(generation, ConnectionError::Transport("refused".into()), t12);
        assert_eq!(statuses(&actions), vec![(
            ConnectionStatus::Reconnecting,
            ConnectionStatus::Disconnected
        )]);
        assert!(conn.tick(t12 + Duration::from_secs(3600)).is_empty());
        assert_eq!(conn.next_deadline(), None);
    }

    #[test]
    fn delay_repeats_at_ceiling() {
        let policy = ReconnectPolicy::default();

        assert_eq!(policy.delay_for(1), Duration::ZERO);
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(4), Duration::from_secs(30));
        assert_eq!(policy.delay_for(9), Duration::from_secs(30));

        let empty = ReconnectPolicy { delays: Vec::new(), max_attempts: 1 };
        assert_eq!(empty.delay_for(3), Duration::ZERO);
    }

    #[test]
    fn reconnect_resets_attempts() {
        let t0 = Instant::now();
        let mut conn = Connection::new(ReconnectPolicy::default());

        let (generation, _) = dial(&conn.connect(credential())).unwrap();
        conn.link_established(generation, t0);
        conn.link_lost(generation, ConnectionError::Transport("reset".into()), t0);
        assert_eq!(conn.attempt(), 1);

        let actions = conn.link_established(generation, t0);
        assert_eq!(statuses(&actions), vec![(
            ConnectionStatus::Reconnecting,
            ConnectionStatus::Connected
        )]);
        assert_eq!(conn.attempt(), 0);
        assert!(conn.last_error().is_none());
    }

    #[test]
    fn initial_failure_enters_reconnecting() {
        let t0 = Instant::now();
        let mut conn = Connection::new(ReconnectPolicy::default());

        let (generation, _) = dial(&conn.connect(credential())).unwrap();
        let actions = conn.link_failed(generation, ConnectionError::Timeout {
            elapsed: Duration::from_secs(10),
        }, t0);

        assert_eq!(statuses(&actions), vec![(
            ConnectionStatus::Connecting,
            ConnectionStatus::Reconnecting
        )]);
        // First retry is immediate
        assert_eq!(dial(&actions), Some((generation, 1)));
    }

    #[test]
    fn missing_endpoint_is_permanent_degraded_mode() {
        let t0 = Instant::now();
        let mut conn = Connection::new(ReconnectPolicy::default());

        let (generation, _) = dial(&conn.connect(credential())).unwrap();
        let actions = conn.link_failed(
            generation,
            ConnectionError::NotFound { endpoint: "wss://hub/notifications".into() },
            t0,
        );

        assert_eq!(conn.status(), ConnectionStatus::Disconnected);
        assert!(conn.is_degraded());
        assert!(dial(&actions).is_none());
        assert!(conn.tick(t0 + Duration::from_secs(60)).is_empty());

        // Explicit connect clears the flag and tries again
        assert!(dial(&conn.connect(credential())).is_some());
        assert!(!conn.is_degraded());
    }

    #[test]
    fn close_without_reconnect_is_terminal() {
        let t0 = Instant::now();
        let mut conn = Connection::new(ReconnectPolicy::default());

        let (generation, _) = dial(&conn.connect(credential())).unwrap();
        conn.link_established(generation, t0);
        let kicked = ConnectionError::ClosedByServer {
            reason: Some("kicked".into()),
            allow_reconnect: false,
        };
        let actions = conn.link_lost(generation, kicked, t0);

        assert_eq!(statuses(&actions), vec![(
            ConnectionStatus::Connected,
            ConnectionStatus::Disconnected
        )]);
        assert!(dial(&actions).is_none());
    }

    #[test]
    fn disconnect_wins_over_inflight_dial() {
        let t0 = Instant::now();
        let mut conn = Connection::new(ReconnectPolicy::default());

        let (stale, _) = dial(&conn.connect(credential())).unwrap();
        let actions = conn.disconnect();
        assert!(actions.contains(&ConnectionAction::CloseLink { generation: stale }));
        assert_eq!(conn.status(), ConnectionStatus::Disconnected);

        // Late success from the old dial is rejected
        let actions = conn.link_established(stale, t0);
        assert_eq!(actions, vec![ConnectionAction::CloseLink { generation: stale }]);
        assert_eq!(conn.status(), ConnectionStatus::Disconnected);

        // Late failure is ignored
        assert!(conn.link_failed(stale, ConnectionError::Transport("x".into()), t0).is_empty());
    }

    #[test]
    fn disconnect_is_safe_when_idle() {
        let mut conn = Connection::<Instant>::new(ReconnectPolicy::default());
        assert!(conn.disconnect().is_empty());
        assert!(conn.disconnect().is_empty());
    }

    #[test]
    fn dials_use_renewed_credential() {
        let t0 = Instant::now();
        let mut conn = Connection::new(ReconnectPolicy::default());

        let (generation, _) = dial(&conn.connect(credential())).unwrap();
        conn.link_established(generation, t0);
        conn.renew_credential(Credential::bearer("fresh"));

        let actions = conn.link_lost(generation, ConnectionError::Transport("reset".into()), t0);
        let dialed = actions.iter().find_map(|action| match action {
            ConnectionAction::Dial { credential, .. } => Some(credential.token().to_string()),
            _ => None,
        });
        assert_eq!(dialed.as_deref(), Some("fresh"));
    }

    #[test]
    fn edges_match_table() {
        use ConnectionStatus::{Connected, Connecting, Disconnected, Reconnecting};

        assert!(Disconnected.can_transition_to(Connecting));
        assert!(!Disconnected.can_transition_to(Connected));
        assert!(!Disconnected.can_transition_to(Reconnecting));
        assert!(!Connected.can_transition_to(Connecting));
        assert!(!Reconnecting.can_transition_to(Connecting));
        assert!(Reconnecting.can_transition_to(Connected));
    }
}
