//! Hubs served over turmoil TCP.
//!
//! [`WsHost`] accepts real websocket upgrades on a turmoil listener and
//! routes each path to a [`SharedHub`]. The production [`Session`] runs
//! unchanged against it: [`SimConnector`] dials with the same upgrade request
//! as the websocket connector, and [`SimStore`] answers REST calls from the
//! hub state. The `access_token` query parameter names the principal.
//!
//! [`Session`]: evsync_client::transport::Session

use std::{
    collections::HashMap,
    io,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use evsync_client::transport::{
    Connector, ConversationStore, HistoryPage, HubLink, NotificationStore, RestError,
    WsConnector, upgrade_error, upgrade_request,
};
use evsync_core::ConnectionError;
use evsync_proto::{
    ConversationId, Credential, HandshakeResponse, HubFrame, Message, Notification,
    NotificationId, NotificationStatus, ReadMarker, UserId,
};
use futures_util::{SinkExt, StreamExt};
use tokio::{sync::mpsc, time::MissedTickBehavior};
use tokio_tungstenite::tungstenite::{
    Message as WsMessage,
    handshake::server::{ErrorResponse, Request, Response},
    http::{StatusCode, Uri},
};
use tracing::{debug, info, warn};
use turmoil::net::{TcpListener, TcpStream};

use crate::sim_hub::{ConnId, Delivery, SimHub};

/// Interval of server pings on every hub connection.
const PING_INTERVAL: std::time::Duration = std::time::Duration::from_secs(15);

#[derive(Debug)]
struct HubState {
    hub: SimHub,
    outboxes: HashMap<ConnId, mpsc::UnboundedSender<HubFrame>>,
    notifications: HashMap<UserId, Vec<Notification>>,
}

impl HubState {
    fn dispatch(&self, deliveries: Vec<Delivery>) {
        for Delivery { conn, frame } in deliveries {
            if let Some(outbox) = self.outboxes.get(&conn) {
                let _ = outbox.send(frame);
            }
        }
    }
}

/// A [`SimHub`] shared between the host's connection tasks and the test.
#[derive(Debug, Clone)]
pub struct SharedHub(Arc<Mutex<HubState>>);

impl SharedHub {
    /// Share `hub`.
    pub fn new(hub: SimHub) -> Self {
        Self(Arc::new(Mutex::new(HubState {
            hub,
            outboxes: HashMap::new(),
            notifications: HashMap::new(),
        })))
    }

    /// Run `f` against the hub, for queries and fault scripting.
    pub fn with<R>(&self, f: impl FnOnce(&mut SimHub) -> R) -> R {
        f(&mut self.lock().hub)
    }

    /// Push a notification to every connection of `user` and keep it for
    /// REST listings.
    pub fn push_notification(&self, user: &UserId, title: &str) {
        let mut state = self.lock();
        let deliveries = state.hub.push_notification(user, title);
        if let Some(payload) = deliveries.first().and_then(|d| notification_payload(&d.frame)) {
            state.notifications.entry(user.clone()).or_default().push(payload);
        }
        state.dispatch(deliveries);
    }

    /// Drop the websocket of `conn` without a close handshake from the
    /// client.
    pub fn kick(&self, conn: ConnId) {
        let mut state = self.lock();
        if state.outboxes.remove(&conn).is_some() {
            info!(conn, "kicking connection");
        }
        state.hub.close(conn);
    }

    /// Live connections with an open websocket.
    pub fn open_connections(&self) -> Vec<ConnId> {
        let state = self.lock();
        let mut conns: Vec<_> = state.outboxes.keys().copied().collect();
        conns.sort_unstable();
        conns
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn notification_payload(frame: &HubFrame) -> Option<Notification> {
    let HubFrame::Invocation { arguments, .. } = frame else {
        return None;
    };
    evsync_proto::wire::notification(arguments.first()?).ok()
}

/// Websocket host routing upgrade paths to hubs.
#[derive(Debug, Clone, Default)]
pub struct WsHost {
    routes: HashMap<String, SharedHub>,
}

impl WsHost {
    /// Host with no routes. Every upgrade gets 404.
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `hub` at `path`.
    #[must_use]
    pub fn route(mut self, path: &str, hub: SharedHub) -> Self {
        self.routes.insert(path.to_string(), hub);
        self
    }

    /// Accept connections on `address` until the simulation ends.
    ///
    /// # Errors
    ///
    /// - Binding or accepting on the turmoil listener failed
    pub async fn serve(self, address: &str) -> io::Result<()> {
        let listener = TcpListener::bind(address).await?;
        let routes = Arc::new(self.routes);
        info!(address, "hub host listening");

        loop {
            let (stream, peer) = listener.accept().await?;
            debug!(%peer, "tcp accepted");
            tokio::spawn(serve_connection(stream, Arc::clone(&routes)));
        }
    }
}

fn reject(status: StatusCode) -> ErrorResponse {
    let mut response = ErrorResponse::new(None);
    *response.status_mut() = status;
    response
}

fn access_token(uri: &Uri) -> Option<String> {
    uri.query()?
        .split('&')
        .find_map(|pair| pair.strip_prefix("access_token="))
        .map(str::to_string)
}

async fn serve_connection(stream: TcpStream, routes: Arc<HashMap<String, SharedHub>>) {
    let mut accepted: Option<(SharedHub, ConnId)> = None;

    let callback = |request: &Request, response: Response| {
        let Some(hub) = routes.get(request.uri().path()) else {
            return Err(reject(StatusCode::NOT_FOUND));
        };
        let Some(principal) = access_token(request.uri()) else {
            return Err(reject(StatusCode::UNAUTHORIZED));
        };

        match hub.lock().hub.dial(&principal) {
            Ok(conn) => {
                accepted = Some((hub.clone(), conn));
                Ok(response)
            },
            Err(ConnectionError::NotFound { .. }) => Err(reject(StatusCode::NOT_FOUND)),
            Err(ConnectionError::Unauthorized) => Err(reject(StatusCode::UNAUTHORIZED)),
            Err(_) => Err(reject(StatusCode::SERVICE_UNAVAILABLE)),
        }
    };

    let upgraded = tokio_tungstenite::accept_hdr_async(stream, callback).await;
    let (ws, (hub, conn)) = match (upgraded, accepted) {
        (Ok(ws), Some(accepted)) => (ws, accepted),
        (Err(error), Some((hub, conn))) => {
            debug!(%error, conn, "upgrade failed after dial");
            hub.lock().hub.close(conn);
            return;
        },
        (result, None) => {
            debug!(ok = result.is_ok(), "upgrade refused");
            return;
        },
    };

    let (outbox, mut inbox) = mpsc::unbounded_channel();
    hub.lock().outboxes.insert(conn, outbox);
    let (mut sink, mut stream) = ws.split();

    // Handshake request, then an empty response
    match stream.next().await {
        Some(Ok(WsMessage::Text(_))) => {},
        _ => {
            hub.kick(conn);
            return;
        },
    }
    let handshake = match HandshakeResponse::default().encode() {
        Ok(text) => text,
        Err(error) => {
            warn!(%error, "handshake encoding failed");
            hub.kick(conn);
            return;
        },
    };
    if sink.send(WsMessage::text(handshake)).await.is_err() {
        hub.kick(conn);
        return;
    }

    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ping.reset();

    loop {
        tokio::select! {
            message = stream.next() => match message {
                Some(Ok(WsMessage::Text(text))) => {
                    let mut state = hub.lock();
                    for frame in HubFrame::decode_batch(text.as_str()) {
                        match frame {
                            Ok(frame) => {
                                let deliveries = state.hub.receive(conn, frame);
                                state.dispatch(deliveries);
                            },
                            Err(error) => warn!(%error, conn, "malformed frame from client"),
                        }
                    }
                },
                Some(Ok(WsMessage::Close(_)) | Err(_)) | None => break,
                Some(Ok(_)) => {},
            },
            frame = inbox.recv() => {
                let Some(frame) = frame else {
                    // Kicked
                    let _ = sink.close().await;
                    return;
                };
                let Ok(text) = frame.encode() else { continue };
                if sink.send(WsMessage::text(text)).await.is_err() {
                    break;
                }
            },
            _ = ping.tick() => {
                let Ok(text) = HubFrame::Ping.encode() else { continue };
                if sink.send(WsMessage::text(text)).await.is_err() {
                    break;
                }
            },
        }
    }

    debug!(conn, "client went away");
    hub.kick(conn);
}

/// Dials a [`WsHost`] over turmoil TCP.
#[derive(Debug, Clone)]
pub struct SimConnector {
    address: String,
    endpoint: WsConnector,
}

impl SimConnector {
    /// Connector for `path` on the host at `address` (`host:port`).
    ///
    /// # Errors
    ///
    /// - `Transport` if the pair does not form a URL
    pub fn new(address: &str, path: &str) -> Result<Self, ConnectionError> {
        let endpoint = WsConnector::new(&format!("ws://{address}{path}"))?;
        Ok(Self { address: address.to_string(), endpoint })
    }
}

impl Connector for SimConnector {
    async fn connect(&self, credential: &Credential) -> Result<HubLink, ConnectionError> {
        let request = upgrade_request(self.endpoint.endpoint(), credential)?;
        let stream = TcpStream::connect(self.address.as_str())
            .await
            .map_err(|e| ConnectionError::Transport(e.to_string()))?;

        match tokio_tungstenite::client_async(request, stream).await {
            Ok((ws, _response)) => HubLink::establish(ws).await,
            Err(err) => Err(upgrade_error(self.endpoint.endpoint(), err)),
        }
    }
}

/// REST backend answering from hub state.
///
/// Read markers are stored on the conversation hub, which broadcasts them
/// to members. Notification listings are what the notification hub pushed.
#[derive(Debug, Clone)]
pub struct SimStore {
    chat: SharedHub,
    notifications: SharedHub,
    user: UserId,
}

impl SimStore {
    /// Store for `user` backed by the two hubs.
    pub fn new(chat: SharedHub, notifications: SharedHub, user: UserId) -> Self {
        Self { chat, notifications, user }
    }
}

#[async_trait]
impl ConversationStore for SimStore {
    async fn history(
        &self,
        conversation: ConversationId,
        page: HistoryPage,
    ) -> Result<Vec<Message>, RestError> {
        let state = self.chat.lock();
        let stored = state.hub.history(conversation);
        let size = page.size as usize;
        let end = stored.len().saturating_sub(page.page as usize * size);
        let start = end.saturating_sub(size);
        Ok(stored[start..end].iter().map(|m| m.to_message(conversation)).collect())
    }

    async fn mark_read(&self, marker: &ReadMarker) -> Result<(), RestError> {
        let state = self.chat.lock();
        let deliveries = state.hub.store_read_marker(marker);
        state.dispatch(deliveries);
        Ok(())
    }
}

#[async_trait]
impl NotificationStore for SimStore {
    async fn list(&self) -> Result<Vec<Notification>, RestError> {
        let state = self.notifications.lock();
        Ok(state.notifications.get(&self.user).cloned().unwrap_or_default())
    }

    async fn mark_read(&self, ids: &[NotificationId]) -> Result<(), RestError> {
        let mut state = self.notifications.lock();
        if let Some(listing) = state.notifications.get_mut(&self.user) {
            for notification in listing.iter_mut().filter(|n| ids.contains(&n.id)) {
                notification.status = NotificationStatus::Read;
            }
        }
        Ok(())
    }
}
