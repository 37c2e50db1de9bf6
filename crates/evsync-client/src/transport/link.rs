//! Websocket link to one hub.
//!
//! [`HubLink`] is a thin layer over a websocket stream: it performs the hub
//! handshake, then a background task splits transport messages into
//! [`HubFrame`]s and writes outgoing text. Everything above frames lives in
//! the Sans-IO clients.

use std::{future::Future, time::Duration};

use evsync_core::ConnectionError;
use evsync_proto::{Credential, HandshakeRequest, HandshakeResponse, HubFrame};
use futures_util::{SinkExt, StreamExt};
use reqwest::Url;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
    time::{Instant, MissedTickBehavior},
};
use tokio_tungstenite::{
    WebSocketStream,
    tungstenite::{
        self, Message,
        client::IntoClientRequest,
        handshake::client::Request,
        http::{HeaderValue, header::AUTHORIZATION},
        protocol::CloseFrame,
    },
};
use tracing::{debug, warn};

use super::TransportError;

/// Interval between keepalive pings sent to the hub.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Silence from the hub after which the link is considered dead.
pub const SERVER_TIMEOUT: Duration = Duration::from_secs(30);

/// Inbound frames buffered between the link task and its owner.
const INBOUND_BUFFER: usize = 64;

/// What the link task reports.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkMessage {
    /// A frame from the hub.
    Frame(HubFrame),
    /// The link ended. Always the last message.
    Closed(ConnectionError),
}

#[derive(Debug)]
enum Outbound {
    Text(String),
    Close,
}

/// Handle to an established hub link.
///
/// Frames are sent/received via channels; an internal task handles the
/// websocket I/O.
#[derive(Debug)]
pub struct HubLink {
    to_hub: mpsc::UnboundedSender<Outbound>,
    from_hub: mpsc::Receiver<LinkMessage>,
    abort_handle: tokio::task::AbortHandle,
}

impl HubLink {
    /// Perform the hub handshake on an open websocket and start the link
    /// task.
    ///
    /// # Errors
    ///
    /// - `HandshakeRejected` if the hub refused the protocol
    /// - `Protocol` if the reply was not a handshake response
    /// - `Transport` if the socket failed or closed during the handshake
    pub async fn establish<S>(mut ws: WebSocketStream<S>) -> Result<Self, ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let request = HandshakeRequest::default().encode()?;
        ws.send(Message::text(request)).await.map_err(TransportError::from)?;

        let remainder = loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    break HandshakeResponse::parse(text.as_str())?.to_string();
                },
                Some(Ok(Message::Close(frame))) => return Err(closed_by_hub(frame)),
                Some(Ok(_)) => {},
                Some(Err(err)) => return Err(TransportError::from(err).into()),
                None => {
                    return Err(ConnectionError::Transport("closed during handshake".to_string()));
                },
            }
        };

        let (to_hub, outbound) = mpsc::unbounded_channel();
        let (inbound, from_hub) = mpsc::channel(INBOUND_BUFFER);
        let handle = tokio::spawn(run_link(ws, outbound, inbound, remainder));

        Ok(Self { to_hub, from_hub, abort_handle: handle.abort_handle() })
    }

    /// Queue encoded frame text. Returns false if the link task is gone.
    pub fn send(&self, text: String) -> bool {
        self.to_hub.send(Outbound::Text(text)).is_ok()
    }

    /// Close the websocket after flushing queued text.
    pub fn close(&self) {
        let _ = self.to_hub.send(Outbound::Close);
    }

    /// Next message from the link. `None` once the task is gone and the
    /// closing message was consumed.
    pub async fn recv(&mut self) -> Option<LinkMessage> {
        self.from_hub.recv().await
    }

    /// Stop the link task immediately.
    pub fn abort(&self) {
        self.abort_handle.abort();
    }
}

/// Opens hub links. The seam where an alternative transport plugs in.
pub trait Connector: Send + Sync + 'static {
    /// Dial the hub and complete the handshake.
    fn connect(
        &self,
        credential: &Credential,
    ) -> impl Future<Output = Result<HubLink, ConnectionError>> + Send;
}

/// Dials a hub endpoint over websocket.
///
/// The credential is presented twice: as the `access_token` query parameter
/// (what browsers can do) and as an `Authorization: Bearer` header.
#[derive(Debug, Clone)]
pub struct WsConnector {
    endpoint: Url,
}

impl WsConnector {
    /// Connector for `endpoint` (`ws://` or `wss://`).
    ///
    /// # Errors
    ///
    /// - `InvalidEndpoint` if `endpoint` is not a URL
    pub fn new(endpoint: &str) -> Result<Self, TransportError> {
        let endpoint = Url::parse(endpoint).map_err(|e| TransportError::InvalidEndpoint {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self { endpoint })
    }

    /// The configured endpoint, without credentials.
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

impl Connector for WsConnector {
    async fn connect(&self, credential: &Credential) -> Result<HubLink, ConnectionError> {
        let request = upgrade_request(&self.endpoint, credential)?;

        debug!(endpoint = %self.endpoint, "dialing hub");
        match tokio_tungstenite::connect_async(request).await {
            Ok((ws, _response)) => HubLink::establish(ws).await,
            Err(err) => Err(upgrade_error(&self.endpoint, err)),
        }
    }
}

/// Websocket upgrade request for `endpoint` carrying `credential`.
///
/// # Errors
///
/// - `Transport` if the URL or the credential cannot form a request
pub fn upgrade_request(
    endpoint: &Url,
    credential: &Credential,
) -> Result<Request, ConnectionError> {
    let mut url = endpoint.clone();
    url.query_pairs_mut().append_pair("access_token", credential.token());

    let mut request = url.as_str().into_client_request().map_err(TransportError::from)?;
    let bearer = HeaderValue::from_str(&format!("Bearer {}", credential.token()))
        .map_err(|e| ConnectionError::Transport(format!("invalid credential header: {e}")))?;
    request.headers_mut().insert(AUTHORIZATION, bearer);
    Ok(request)
}

/// Classify a failed upgrade. A 404 means the hub is not deployed at
/// `endpoint`; 401 and 403 mean the credential was refused.
pub fn upgrade_error(endpoint: &Url, err: tungstenite::Error) -> ConnectionError {
    match err {
        tungstenite::Error::Http(response) => match response.status().as_u16() {
            404 => ConnectionError::NotFound { endpoint: endpoint.to_string() },
            401 | 403 => ConnectionError::Unauthorized,
            status => ConnectionError::Transport(format!("upgrade rejected with HTTP {status}")),
        },
        err => TransportError::from(err).into(),
    }
}

/// Run the link, bridging between channels and the websocket.
async fn run_link<S>(
    mut ws: WebSocketStream<S>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    inbound: mpsc::Sender<LinkMessage>,
    remainder: String,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    // Frames may ride along with the handshake reply
    if !forward(&remainder, &inbound).await {
        return;
    }

    let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
    keepalive.reset();
    let mut last_heard = Instant::now();

    let reason = loop {
        tokio::select! {
            message = ws.next() => {
                last_heard = Instant::now();
                match message {
                    Some(Ok(Message::Text(text))) => {
                        if !forward(text.as_str(), &inbound).await {
                            return;
                        }
                    },
                    Some(Ok(Message::Close(frame))) => break closed_by_hub(frame),
                    Some(Ok(Message::Binary(_))) => warn!("ignoring binary message"),
                    Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {},
                    Some(Err(err)) => break TransportError::from(err).into(),
                    None => break ConnectionError::Transport("stream ended".to_string()),
                }
            },
            command = outbound.recv() => match command {
                Some(Outbound::Text(text)) => {
                    if let Err(err) = ws.send(Message::text(text)).await {
                        break TransportError::from(err).into();
                    }
                },
                Some(Outbound::Close) | None => {
                    let _ = ws.close(None).await;
                    return;
                },
            },
            _ = keepalive.tick() => {
                let ping = match HubFrame::Ping.encode() {
                    Ok(ping) => ping,
                    Err(err) => break err.into(),
                };
                if let Err(err) = ws.send(Message::text(ping)).await {
                    break TransportError::from(err).into();
                }
            },
            () = tokio::time::sleep_until(last_heard + SERVER_TIMEOUT) => {
                break ConnectionError::Timeout { elapsed: SERVER_TIMEOUT };
            },
        }
    };

    debug!(%reason, "link closed");
    let _ = inbound.send(LinkMessage::Closed(reason)).await;
}

/// Decode every frame in one transport message and pass them on. Returns
/// false if the owner went away.
async fn forward(text: &str, inbound: &mpsc::Sender<LinkMessage>) -> bool {
    for frame in HubFrame::decode_batch(text) {
        match frame {
            Ok(frame) => {
                if inbound.send(LinkMessage::Frame(frame)).await.is_err() {
                    return false;
                }
            },
            Err(error) => warn!(%error, "dropping malformed frame"),
        }
    }
    true
}

fn closed_by_hub(frame: Option<CloseFrame>) -> ConnectionError {
    let reason = frame.map(|f| f.reason.as_str().to_string()).filter(|r| !r.is_empty());
    ConnectionError::ClosedByServer { reason, allow_reconnect: true }
}
