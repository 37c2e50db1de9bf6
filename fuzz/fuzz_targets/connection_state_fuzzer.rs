//! Fuzz target for the hub connection state machine
//!
//! Drives `Connection` with arbitrary lifecycle calls, link reports (current
//! and stale generations) and clock steps.
//!
//! # Invariants
//!
//! - Every reported status change is a legal edge and chains from the last
//! - Generation never decreases
//! - At most one dial is outstanding, and only while connecting or
//!   reconnecting
//! - Retries never exceed the policy's attempt budget
//! - Not found leaves the connection disconnected and degraded

#![no_main]

use std::time::Duration;

use arbitrary::Arbitrary;
use evsync_core::{
    Connection, ConnectionAction, ConnectionError, ConnectionStatus, Environment, ReconnectPolicy,
};
use evsync_harness::{SimEnv, SimInstant};
use evsync_proto::Credential;
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Clone, Arbitrary)]
enum ConnectionOp {
    Connect,
    Disconnect,
    Established { stale: bool },
    Failed { stale: bool, error: ErrorChoice },
    Lost { stale: bool, error: ErrorChoice },
    Tick,
    Advance { millis: u16 },
}

#[derive(Debug, Clone, Arbitrary)]
enum ErrorChoice {
    NotFound,
    Unauthorized,
    Rejected,
    Timeout,
    Closed { allow_reconnect: bool },
    Transport,
}

impl ErrorChoice {
    fn error(&self) -> ConnectionError {
        match self {
            Self::NotFound => ConnectionError::NotFound { endpoint: "/hubs/chat".into() },
            Self::Unauthorized => ConnectionError::Unauthorized,
            Self::Rejected => ConnectionError::HandshakeRejected("bad protocol".into()),
            Self::Timeout => ConnectionError::Timeout { elapsed: Duration::from_secs(10) },
            Self::Closed { allow_reconnect } => ConnectionError::ClosedByServer {
                reason: None,
                allow_reconnect: *allow_reconnect,
            },
            Self::Transport => ConnectionError::Transport("reset".into()),
        }
    }
}

struct Model {
    status: ConnectionStatus,
    generation: u64,
    dialing: Option<u64>,
    retries: u32,
}

impl Model {
    fn observe(&mut self, conn: &Connection<SimInstant>, actions: &[ConnectionAction]) {
        for action in actions {
            match action {
                ConnectionAction::StatusChanged { from, to } => {
                    assert_eq!(*from, self.status, "status change does not chain");
                    assert!(from.can_transition_to(*to), "illegal edge {from} -> {to}");
                    self.status = *to;
                    if *to != ConnectionStatus::Reconnecting {
                        self.dialing = None;
                    }
                    if matches!(to, ConnectionStatus::Connected | ConnectionStatus::Disconnected)
                    {
                        self.retries = 0;
                    }
                },
                ConnectionAction::Dial { generation, attempt, .. } => {
                    assert!(self.dialing.is_none(), "second dial while one is outstanding");
                    assert!(
                        matches!(
                            self.status,
                            ConnectionStatus::Connecting | ConnectionStatus::Reconnecting
                        ),
                        "dial while {}",
                        self.status
                    );
                    if *attempt > 0 {
                        self.retries += 1;
                        assert!(self.retries <= conn.policy().max_attempts);
                    }
                    self.dialing = Some(*generation);
                },
                ConnectionAction::CloseLink { .. } => {},
            }
        }

        assert!(conn.generation() >= self.generation, "generation went backwards");
        self.generation = conn.generation();
        assert_eq!(conn.status(), self.status);
    }

    fn settle(&mut self) {
        self.dialing = None;
    }
}

fuzz_target!(|ops: Vec<ConnectionOp>| {
    let env = SimEnv::new();
    let mut conn: Connection<SimInstant> = Connection::new(ReconnectPolicy::default());
    let mut model = Model {
        status: ConnectionStatus::Disconnected,
        generation: 0,
        dialing: None,
        retries: 0,
    };

    for op in ops {
        let now = env.now();
        let current = conn.generation();
        let pick = |stale: bool| if stale { current.wrapping_sub(1) } else { current };

        let actions = match op {
            ConnectionOp::Connect => conn.connect(Credential::bearer("t")),
            ConnectionOp::Disconnect => conn.disconnect(),
            ConnectionOp::Established { stale } => {
                let generation = pick(stale);
                let actions = conn.link_established(generation, now);
                if model.dialing == Some(generation) {
                    model.settle();
                }
                actions
            },
            ConnectionOp::Failed { stale, error } => {
                let generation = pick(stale);
                let not_found = matches!(error, ErrorChoice::NotFound);
                let live = model.dialing == Some(generation);
                let actions = conn.link_failed(generation, error.error(), now);
                if live {
                    model.settle();
                    if not_found {
                        assert_eq!(conn.status(), ConnectionStatus::Disconnected);
                        assert!(conn.is_degraded());
                    }
                }
                actions
            },
            ConnectionOp::Lost { stale, error } => {
                conn.link_lost(pick(stale), error.error(), now)
            },
            ConnectionOp::Tick => conn.tick(now),
            ConnectionOp::Advance { millis } => {
                env.advance(Duration::from_millis(u64::from(millis) * 10));
                Vec::new()
            },
        };

        model.observe(&conn, &actions);
    }
});
