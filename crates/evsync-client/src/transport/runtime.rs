//! Hub runtime.
//!
//! Each hub runs as an actor: one task owns the Sans-IO client, the current
//! [`HubLink`] and any in-flight dial. [`HubHandle`]s send it operations over
//! an unbounded channel, so there is one logical thread of control per hub
//! and no locking around client state.
//!
//! The loop:
//! 1. Applies handle operations and executes the resulting actions
//! 2. Reports dial outcomes and link messages back as [`LinkEvent`]s
//! 3. Ticks the client whenever its next deadline passes

use std::{sync::Arc, time::Duration};

use evsync_core::{ConnectionError, ConnectionStatus, Observers, SubscriptionId};
use evsync_proto::Credential;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::link::{Connector, HubLink, LinkMessage};
use crate::{ClientError, Environment, HubAction, HubClient, Lifecycle, LinkEvent};

/// Default bound on one dial plus handshake.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Runtime settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Bound on one dial plus handshake. Expiry counts as a retryable
    /// failure.
    pub dial_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self { dial_timeout: DEFAULT_DIAL_TIMEOUT }
    }
}

/// Connection status transition, as seen by status observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusChange {
    /// Previous status.
    pub from: ConnectionStatus,
    /// New status.
    pub to: ConnectionStatus,
}

type Operation<C> =
    Box<dyn FnOnce(&mut C) -> Vec<HubAction<<C as HubClient>::Notice>> + Send + 'static>;

struct Command<C: HubClient> {
    operation: Operation<C>,
    done: oneshot::Sender<Vec<C::Notice>>,
}

type Shared<T> = Arc<Mutex<Observers<T>>>;

/// Handle to a running hub actor.
///
/// Cheap to clone. Observers are called on the actor task, synchronously and
/// in registration order; they must not subscribe or unsubscribe from inside
/// a callback.
pub struct HubHandle<C: HubClient> {
    commands: mpsc::UnboundedSender<Command<C>>,
    status: watch::Receiver<ConnectionStatus>,
    status_observers: Shared<StatusChange>,
    notice_observers: Shared<C::Notice>,
}

impl<C: HubClient> Clone for HubHandle<C> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
            status: self.status.clone(),
            status_observers: Arc::clone(&self.status_observers),
            notice_observers: Arc::clone(&self.notice_observers),
        }
    }
}

impl<C: HubClient> std::fmt::Debug for HubHandle<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubHandle")
            .field("hub", &C::HUB)
            .field("status", &*self.status.borrow())
            .finish_non_exhaustive()
    }
}

impl<C: HubClient> HubHandle<C> {
    /// Start the actor for `client`.
    ///
    /// The actor stops when `cancel` fires or every handle is dropped, and
    /// disposes the client on the way out.
    pub fn spawn<K>(
        env: C::Env,
        client: C,
        connector: K,
        config: RuntimeConfig,
        cancel: CancellationToken,
    ) -> Self
    where
        K: Connector,
    {
        let (commands, inbox) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(client.status());
        let status_observers: Shared<StatusChange> = Arc::new(Mutex::new(Observers::new()));
        let notice_observers: Shared<C::Notice> = Arc::new(Mutex::new(Observers::new()));
        let (dial_tx, dial_rx) = mpsc::unbounded_channel();

        let actor = HubActor {
            env,
            client,
            connector: Arc::new(connector),
            config,
            link: None,
            dialing: None,
            dial_tx,
            status: status_tx,
            status_observers: Arc::clone(&status_observers),
            notice_observers: Arc::clone(&notice_observers),
        };
        tokio::spawn(actor.run(inbox, dial_rx, cancel));

        Self { commands, status, status_observers, notice_observers }
    }

    /// Run `operation` on the actor and execute the actions it returns.
    ///
    /// Resolves after the actions ran, with the operation's value and the
    /// notices that were emitted.
    pub async fn apply<R, F>(&self, operation: F) -> Result<(R, Vec<C::Notice>), ClientError>
    where
        R: Send + 'static,
        F: FnOnce(&mut C) -> (Vec<HubAction<C::Notice>>, R) + Send + 'static,
    {
        let (value_tx, value_rx) = oneshot::channel();
        let operation: Operation<C> = Box::new(move |client: &mut C| {
            let (actions, value) = operation(client);
            let _ = value_tx.send(value);
            actions
        });

        let (done, notices) = oneshot::channel();
        self.commands.send(Command { operation, done }).map_err(|_| Self::closed())?;
        let notices = notices.await.map_err(|_| Self::closed())?;
        let value = value_rx.await.map_err(|_| Self::closed())?;
        Ok((value, notices))
    }

    /// Read client state on the actor.
    pub async fn query<R, F>(&self, query: F) -> Result<R, ClientError>
    where
        R: Send + 'static,
        F: FnOnce(&C) -> R + Send + 'static,
    {
        let (value, _) = self.apply(move |client: &mut C| (Vec::new(), query(client))).await?;
        Ok(value)
    }

    /// Apply a lifecycle request.
    pub async fn lifecycle(&self, request: Lifecycle) -> Result<(), ClientError> {
        self.apply(move |client: &mut C| (client.lifecycle(request), ())).await?;
        Ok(())
    }

    /// Start connecting and wait up to `timeout` for the first resolution.
    ///
    /// Returns the status at that point. `Connecting` or `Reconnecting` means
    /// the timeout expired and attempts continue in the background; the
    /// caller proceeds in degraded mode meanwhile.
    pub async fn connect(
        &self,
        credential: Credential,
        timeout: Duration,
    ) -> Result<ConnectionStatus, ClientError> {
        self.lifecycle(Lifecycle::Connect(credential)).await?;

        let mut status = self.status.clone();
        let settled = status.wait_for(|s| {
            matches!(s, ConnectionStatus::Connected | ConnectionStatus::Disconnected)
        });
        match tokio::time::timeout(timeout, settled).await {
            Ok(Ok(status)) => Ok(*status),
            Ok(Err(_)) => Err(Self::closed()),
            Err(_) => {
                let status = *self.status.borrow();
                info!(hub = C::HUB, ?timeout, %status, "connect pending, continuing degraded");
                Ok(status)
            },
        }
    }

    /// Force `Disconnected`. Deferred intents survive for the next connect.
    pub async fn disconnect(&self) -> Result<(), ClientError> {
        self.lifecycle(Lifecycle::Disconnect).await
    }

    /// Orderly shutdown of the hub connection.
    pub async fn dispose(&self) -> Result<(), ClientError> {
        self.lifecycle(Lifecycle::Dispose).await
    }

    /// Use `credential` for every later dial.
    pub async fn renew_credential(&self, credential: Credential) -> Result<(), ClientError> {
        self.lifecycle(Lifecycle::RenewCredential(credential)).await
    }

    /// Current status.
    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    /// Status channel for async waiters.
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Register a status observer.
    pub fn on_status_changed(
        &self,
        handler: impl FnMut(&StatusChange) + Send + 'static,
    ) -> SubscriptionId {
        self.status_observers.lock().subscribe(handler)
    }

    /// Register a notice observer.
    pub fn on_notice(&self, handler: impl FnMut(&C::Notice) + Send + 'static) -> SubscriptionId {
        self.notice_observers.lock().subscribe(handler)
    }

    /// Remove a status or notice observer.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.status_observers.lock().unsubscribe(id) || self.notice_observers.lock().unsubscribe(id)
    }

    fn closed() -> ClientError {
        ClientError::Closed { hub: C::HUB }
    }
}

struct ActiveLink {
    generation: u64,
    link: HubLink,
}

struct Dialing {
    generation: u64,
    abort: tokio::task::AbortHandle,
}

type DialOutcome = (u64, Result<HubLink, ConnectionError>);

struct HubActor<C: HubClient, K> {
    env: C::Env,
    client: C,
    connector: Arc<K>,
    config: RuntimeConfig,
    link: Option<ActiveLink>,
    dialing: Option<Dialing>,
    dial_tx: mpsc::UnboundedSender<DialOutcome>,
    status: watch::Sender<ConnectionStatus>,
    status_observers: Shared<StatusChange>,
    notice_observers: Shared<C::Notice>,
}

impl<C, K> HubActor<C, K>
where
    C: HubClient,
    K: Connector,
{
    async fn run(
        mut self,
        mut inbox: mpsc::UnboundedReceiver<Command<C>>,
        mut dials: mpsc::UnboundedReceiver<DialOutcome>,
        cancel: CancellationToken,
    ) {
        debug!(hub = C::HUB, "hub actor started");
        loop {
            let deadline = self.client.next_deadline();
            tokio::select! {
                () = cancel.cancelled() => break,
                command = inbox.recv() => match command {
                    Some(Command { operation, done }) => {
                        let actions = operation(&mut self.client);
                        let notices = self.execute(actions);
                        let _ = done.send(notices);
                    },
                    None => break,
                },
                Some((generation, outcome)) = dials.recv() => {
                    self.dial_finished(generation, outcome);
                },
                (generation, message) = next_link_message(&mut self.link) => {
                    self.link_message(generation, message);
                },
                () = sleep_until(&self.env, deadline) => {
                    let actions = self.client.tick(self.env.now());
                    self.execute(actions);
                },
            }
        }

        let actions = self.client.lifecycle(Lifecycle::Dispose);
        self.execute(actions);
        if let Some(dialing) = self.dialing.take() {
            dialing.abort.abort();
        }
        debug!(hub = C::HUB, "hub actor stopped");
    }

    fn execute(&mut self, actions: Vec<HubAction<C::Notice>>) -> Vec<C::Notice> {
        let mut notices = Vec::new();

        for action in actions {
            match action {
                HubAction::Dial { generation, attempt, credential } => {
                    self.dial(generation, attempt, credential);
                },
                HubAction::CloseLink { generation } => {
                    if let Some(dialing) = self.dialing.take_if(|d| d.generation == generation) {
                        debug!(hub = C::HUB, generation, "cancelling dial");
                        dialing.abort.abort();
                    }
                    if let Some(active) = self.link.take_if(|l| l.generation == generation) {
                        debug!(hub = C::HUB, generation, "closing link");
                        active.link.close();
                    }
                },
                HubAction::Send(frame) => self.send(&frame),
                HubAction::StatusChanged { from, to } => {
                    self.status.send_replace(to);
                    self.status_observers.lock().emit(&StatusChange { from, to });
                },
                HubAction::Notice(notice) => {
                    self.notice_observers.lock().emit(&notice);
                    notices.push(notice);
                },
            }
        }

        notices
    }

    fn dial(&mut self, generation: u64, attempt: u32, credential: Credential) {
        if let Some(previous) = self.dialing.take() {
            previous.abort.abort();
        }

        let connector = Arc::clone(&self.connector);
        let results = self.dial_tx.clone();
        let timeout = self.config.dial_timeout;
        debug!(hub = C::HUB, generation, attempt, "dial started");

        let handle = tokio::spawn(async move {
            let dial = tokio::time::timeout(timeout, connector.connect(&credential));
            let outcome = match dial.await {
                Ok(outcome) => outcome,
                Err(_) => Err(ConnectionError::Timeout { elapsed: timeout }),
            };
            let _ = results.send((generation, outcome));
        });
        self.dialing = Some(Dialing { generation, abort: handle.abort_handle() });
    }

    fn dial_finished(&mut self, generation: u64, outcome: Result<HubLink, ConnectionError>) {
        if self.dialing.take_if(|d| d.generation == generation).is_none() {
            debug!(hub = C::HUB, generation, "discarding result of cancelled dial");
            if let Ok(link) = outcome {
                link.close();
            }
            return;
        }

        let event = match outcome {
            Ok(link) => {
                if let Some(stale) = self.link.replace(ActiveLink { generation, link }) {
                    stale.link.close();
                }
                LinkEvent::Established { generation }
            },
            Err(error) => LinkEvent::Failed { generation, error },
        };
        let actions = self.client.lifecycle(Lifecycle::Link(event));
        self.execute(actions);
    }

    fn link_message(&mut self, generation: u64, message: LinkMessage) {
        let event = match message {
            LinkMessage::Frame(frame) => LinkEvent::Frame { generation, frame },
            LinkMessage::Closed(error) => {
                self.link = None;
                LinkEvent::Lost { generation, error }
            },
        };
        let actions = self.client.lifecycle(Lifecycle::Link(event));
        self.execute(actions);
    }

    fn send(&self, frame: &evsync_proto::HubFrame) {
        let Some(active) = &self.link else {
            debug!(hub = C::HUB, "no link, dropping frame");
            return;
        };
        match frame.encode() {
            Ok(text) => {
                if !active.link.send(text) {
                    debug!(hub = C::HUB, generation = active.generation, "link task gone");
                }
            },
            Err(error) => warn!(hub = C::HUB, %error, "failed to encode frame"),
        }
    }
}

async fn next_link_message(link: &mut Option<ActiveLink>) -> (u64, LinkMessage) {
    let Some(active) = link else {
        return std::future::pending().await;
    };
    let message = active.link.recv().await.unwrap_or_else(|| {
        LinkMessage::Closed(ConnectionError::Transport("link task ended".to_string()))
    });
    (active.generation, message)
}

async fn sleep_until<E: Environment>(env: &E, deadline: Option<E::Instant>) {
    match deadline {
        Some(deadline) => env.sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
