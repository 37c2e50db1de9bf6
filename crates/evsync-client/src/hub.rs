//! Shared hub plumbing.
//!
//! Both hubs speak the same protocol and share one lifecycle: a
//! [`Connection`], invocation ids with completion tracking, and a queue of
//! operations deferred while the link is down. [`HubChannel`] owns those; the
//! chat and notification clients layer their own state on top and react to
//! the [`Edge`]s it reports.

use std::collections::BTreeMap;

use evsync_core::{
    Connection, ConnectionAction, ConnectionError, ConnectionStatus, DeferredQueue,
    Environment, ReconnectPolicy, deferred::DEFAULT_DEFERRED_CAPACITY,
};
use evsync_proto::{Credential, HubFrame, HubInvocation};
use serde_json::Value;
use tracing::{debug, info, warn};

/// Per-hub configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubConfig {
    /// Reconnect schedule.
    pub reconnect: ReconnectPolicy,
    /// Operations held while disconnected before the oldest are dropped.
    pub deferred_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self { reconnect: ReconnectPolicy::default(), deferred_capacity: DEFAULT_DEFERRED_CAPACITY }
    }
}

/// Link-level events reported by the driver.
///
/// Every event carries the generation of the [`HubAction::Dial`] that
/// produced the link, so results from before a `disconnect` are discarded.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// Transport open and handshake accepted.
    Established {
        /// Generation of the dial.
        generation: u64,
    },
    /// Dial or handshake failed.
    Failed {
        /// Generation of the dial.
        generation: u64,
        /// Why.
        error: ConnectionError,
    },
    /// Established link went away.
    Lost {
        /// Generation of the link.
        generation: u64,
        /// Why.
        error: ConnectionError,
    },
    /// Frame received on the link.
    Frame {
        /// Generation of the link.
        generation: u64,
        /// Decoded frame.
        frame: HubFrame,
    },
}

/// Lifecycle requests common to both hubs.
#[derive(Debug, Clone, PartialEq)]
pub enum Lifecycle {
    /// Start connecting with `credential`. Idempotent.
    Connect(Credential),
    /// Use a fresh credential for subsequent dials.
    RenewCredential(Credential),
    /// Force `Disconnected`, keeping deferred intents for the next connect.
    Disconnect,
    /// Orderly shutdown: leave server-side groups, disconnect, drop
    /// everything pending.
    Dispose,
    /// Driver report about the link.
    Link(LinkEvent),
}

/// Actions a hub client returns for the driver to execute.
#[derive(Debug, Clone, PartialEq)]
pub enum HubAction<N> {
    /// Open a link and report the outcome as [`LinkEvent`]s with this
    /// generation.
    Dial {
        /// Epoch of the dial.
        generation: u64,
        /// Retry attempt, 0 for the first dial after `connect`.
        attempt: u32,
        /// Credential to present.
        credential: Credential,
    },
    /// Close the link or in-flight dial of `generation`.
    CloseLink {
        /// Epoch being closed.
        generation: u64,
    },
    /// Send a frame on the current link.
    Send(HubFrame),
    /// Connection status changed.
    StatusChanged {
        /// Previous status.
        from: ConnectionStatus,
        /// New status.
        to: ConnectionStatus,
    },
    /// Typed event for subscribers.
    Notice(N),
}

/// A hub client the runtime can drive.
///
/// Implemented by [`crate::ChatClient`] and [`crate::NotificationClient`].
pub trait HubClient: Send + 'static {
    /// Environment supplying time.
    type Env: Environment;

    /// Typed events for subscribers.
    type Notice: Clone + std::fmt::Debug + Send + 'static;

    /// Hub name for logs.
    const HUB: &'static str;

    /// Apply a lifecycle request.
    fn lifecycle(&mut self, request: Lifecycle) -> Vec<HubAction<Self::Notice>>;

    /// Drive timers.
    fn tick(&mut self, now: <Self::Env as Environment>::Instant) -> Vec<HubAction<Self::Notice>>;

    /// Earliest instant at which `tick` has work.
    fn next_deadline(&self) -> Option<<Self::Env as Environment>::Instant>;

    /// Current connection status.
    fn status(&self) -> ConnectionStatus;
}

/// Change of link availability caused by a lifecycle request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Edge {
    /// Became `Connected`.
    Up,
    /// Left `Connected`. Carries invocations that never completed.
    Down(Vec<HubInvocation>),
}

/// What a received frame means to the client.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum FrameOutcome {
    /// Nothing for the client (ping, success completion, stale frame).
    Handled,
    /// Server closed the link.
    Edge(Edge),
    /// Hub method call for the client.
    Invocation {
        /// Hub method name.
        target: String,
        /// Positional arguments.
        arguments: Vec<Value>,
    },
    /// An invocation completed with an error.
    Failed {
        /// The call that failed.
        invocation: HubInvocation,
        /// Error text from the hub.
        reason: String,
    },
}

/// Connection, completion tracking and deferred queue for one hub.
#[derive(Debug)]
pub(crate) struct HubChannel<E>
where
    E: Environment,
{
    env: E,
    hub: &'static str,
    connection: Connection<E::Instant>,
    /// Invocations awaiting a completion, by invocation id.
    pending: BTreeMap<u64, HubInvocation>,
    next_invocation: u64,
    deferred: DeferredQueue,
}

impl<E> HubChannel<E>
where
    E: Environment,
{
    pub(crate) fn new(env: E, hub: &'static str, config: HubConfig) -> Self {
        Self {
            env,
            hub,
            connection: Connection::new(config.reconnect),
            pending: BTreeMap::new(),
            next_invocation: 0,
            deferred: DeferredQueue::new(config.deferred_capacity),
        }
    }

    pub(crate) fn env(&self) -> &E {
        &self.env
    }

    pub(crate) fn connection(&self) -> &Connection<E::Instant> {
        &self.connection
    }

    pub(crate) fn status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connection.status().is_connected()
    }

    pub(crate) fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    pub(crate) fn next_deadline(&self) -> Option<E::Instant> {
        self.connection.next_deadline()
    }

    pub(crate) fn connect<N>(
        &mut self,
        credential: Credential,
        out: &mut Vec<HubAction<N>>,
    ) -> Option<Edge> {
        let actions = self.connection.connect(credential);
        self.absorb(actions, out)
    }

    pub(crate) fn renew_credential(&mut self, credential: Credential) {
        debug!(hub = self.hub, "credential renewed");
        self.connection.renew_credential(credential);
    }

    pub(crate) fn disconnect<N>(&mut self, out: &mut Vec<HubAction<N>>) -> Option<Edge> {
        let actions = self.connection.disconnect();
        self.absorb(actions, out)
    }

    /// Drop deferred operations and outstanding completions.
    pub(crate) fn reset(&mut self) {
        self.deferred.clear();
        self.pending.clear();
    }

    pub(crate) fn tick<N>(&mut self, now: E::Instant, out: &mut Vec<HubAction<N>>) -> Option<Edge> {
        let actions = self.connection.tick(now);
        self.absorb(actions, out)
    }

    /// Apply a driver report that is not a frame.
    pub(crate) fn link<N>(
        &mut self,
        event: LinkEvent,
        out: &mut Vec<HubAction<N>>,
    ) -> FrameOutcome {
        let now = self.env.now();
        let before = self.status();
        let actions = match event {
            LinkEvent::Established { generation } => {
                self.connection.link_established(generation, now)
            },
            LinkEvent::Failed { generation, error } => {
                warn!(hub = self.hub, generation, %error, "dial failed");
                self.connection.link_failed(generation, error, now)
            },
            LinkEvent::Lost { generation, error } => {
                warn!(hub = self.hub, generation, %error, "link lost");
                self.connection.link_lost(generation, error, now)
            },
            LinkEvent::Frame { generation, frame } => return self.frame(generation, frame, out),
        };

        let edge = self.absorb(actions, out);
        if let Some(error) = self.connection.last_error()
            && before != ConnectionStatus::Disconnected
            && self.status() == ConnectionStatus::Disconnected
        {
            warn!(hub = self.hub, %error, degraded = self.connection.is_degraded(), "giving up");
        }

        match edge {
            Some(edge) => FrameOutcome::Edge(edge),
            None => FrameOutcome::Handled,
        }
    }

    fn frame<N>(
        &mut self,
        generation: u64,
        frame: HubFrame,
        out: &mut Vec<HubAction<N>>,
    ) -> FrameOutcome {
        if generation != self.connection.generation() || !self.is_connected() {
            debug!(hub = self.hub, generation, "dropping frame from stale link");
            return FrameOutcome::Handled;
        }

        match frame {
            HubFrame::Invocation { target, arguments, .. } => {
                FrameOutcome::Invocation { target, arguments }
            },
            HubFrame::Completion { invocation_id, error, .. } => {
                let pending = invocation_id.parse().ok().and_then(|id| self.pending.remove(&id));
                let Some(invocation) = pending else {
                    debug!(hub = self.hub, invocation_id, "completion for unknown invocation");
                    return FrameOutcome::Handled;
                };
                match error {
                    Some(reason) => FrameOutcome::Failed { invocation, reason },
                    None => FrameOutcome::Handled,
                }
            },
            HubFrame::Ping => FrameOutcome::Handled,
            HubFrame::Close { error, allow_reconnect } => {
                let error = ConnectionError::ClosedByServer { reason: error, allow_reconnect };
                self.link(LinkEvent::Lost { generation, error }, out)
            },
        }
    }

    /// Send `invocation` on the live link, tracking its completion.
    pub(crate) fn invoke<N>(&mut self, invocation: HubInvocation, out: &mut Vec<HubAction<N>>) {
        self.next_invocation += 1;
        let id = self.next_invocation;
        debug!(hub = self.hub, invocation_id = id, target = invocation.target(), "invoke");

        out.push(HubAction::Send(invocation.to_frame(Some(id.to_string()))));
        self.pending.insert(id, invocation);
    }

    /// Hold `invocation` until the next `Connected`.
    pub(crate) fn defer(&mut self, invocation: HubInvocation) {
        let target = invocation.target();
        debug!(hub = self.hub, target, status = %self.status(), "deferring until connected");
        if let Some(dropped) = self.deferred.push(invocation) {
            warn!(hub = self.hub, ?dropped, "deferred queue full, dropping");
        }
    }

    pub(crate) fn drain_deferred(&mut self) -> Vec<HubInvocation> {
        self.deferred.drain()
    }

    /// Translate connection actions and detect link edges.
    fn absorb<N>(
        &mut self,
        actions: Vec<ConnectionAction>,
        out: &mut Vec<HubAction<N>>,
    ) -> Option<Edge> {
        let mut edge = None;

        for action in actions {
            match action {
                ConnectionAction::Dial { generation, attempt, credential } => {
                    if attempt > 0 {
                        info!(hub = self.hub, generation, attempt, "reconnecting");
                    }
                    out.push(HubAction::Dial { generation, attempt, credential });
                },
                ConnectionAction::CloseLink { generation } => {
                    out.push(HubAction::CloseLink { generation });
                },
                ConnectionAction::StatusChanged { from, to } => {
                    info!(hub = self.hub, %from, %to, "status changed");
                    if to.is_connected() {
                        edge = Some(Edge::Up);
                    } else if from.is_connected() {
                        let failed = std::mem::take(&mut self.pending).into_values().collect();
                        edge = Some(Edge::Down(failed));
                    }
                    out.push(HubAction::StatusChanged { from, to });
                },
            }
        }

        edge
    }
}
