//! Session wiring.
//!
//! A [`Session`] is created when a user signs in and disposed on logout. It
//! owns one actor per hub, the REST stores, the degraded poller and the
//! cancellation token tying their lifetimes together. There is no global
//! instance; the application keeps the session in its own context.
//!
//! Dropping a session without [`Session::dispose`] still stops every
//! background task, but skips leaving the server-side groups.

use std::{sync::Arc, time::Duration};

use evsync_core::{ConnectionStatus, Identity, TypingConfig};
use evsync_proto::Credential;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{
    hubs::{ChatHub, NotificationHub},
    link::{Connector, WsConnector},
    poller::{DEFAULT_POLL_INTERVAL, DegradedPoller},
    rest::{
        ConversationStore, HttpConversationStore, HttpNotificationStore, NotificationStore,
        SharedCredential,
    },
    runtime::{HubHandle, RuntimeConfig},
};
use crate::{ChatClient, ClientError, Environment, HubConfig, NotificationClient};

/// Default bound on the initial wait in [`Session::init`].
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Endpoints and tuning for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Conversation hub websocket URL.
    pub chat_endpoint: String,
    /// Notification hub websocket URL.
    pub notification_endpoint: String,
    /// REST API base URL.
    pub api_base: String,
    /// How long `init` waits for each hub before continuing degraded.
    pub connect_timeout: Duration,
    /// Runtime settings shared by both hubs.
    pub runtime: RuntimeConfig,
    /// Reconnect schedule and deferred queue, shared by both hubs.
    pub hub: HubConfig,
    /// Typing debounce and expiry.
    pub typing: TypingConfig,
    /// Interval of REST polling while a hub is down.
    pub poll_interval: Duration,
}

impl SessionConfig {
    /// Configuration with default tuning.
    pub fn new(
        chat_endpoint: impl Into<String>,
        notification_endpoint: impl Into<String>,
        api_base: impl Into<String>,
    ) -> Self {
        Self {
            chat_endpoint: chat_endpoint.into(),
            notification_endpoint: notification_endpoint.into(),
            api_base: api_base.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            runtime: RuntimeConfig::default(),
            hub: HubConfig::default(),
            typing: TypingConfig::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Transports and stores a session talks to.
pub struct Collaborators<K> {
    /// Dialer for the conversation hub.
    pub chat: K,
    /// Dialer for the notification hub.
    pub notifications: K,
    /// History and read markers.
    pub conversation_store: Arc<dyn ConversationStore>,
    /// Notification listing and read state.
    pub notification_store: Arc<dyn NotificationStore>,
}

impl Collaborators<WsConnector> {
    /// Websocket hubs and HTTP stores from `config`.
    ///
    /// # Errors
    ///
    /// - `Transport` if an endpoint or the API base is not a valid URL
    pub fn http(config: &SessionConfig, credential: SharedCredential) -> Result<Self, ClientError> {
        Ok(Self {
            chat: WsConnector::new(&config.chat_endpoint)?,
            notifications: WsConnector::new(&config.notification_endpoint)?,
            conversation_store: Arc::new(HttpConversationStore::new(
                &config.api_base,
                Arc::clone(&credential),
            )?),
            notification_store: Arc::new(HttpNotificationStore::new(&config.api_base, credential)?),
        })
    }
}

/// Both hubs of one signed-in user.
#[derive(Debug)]
pub struct Session<E: Environment> {
    chat: ChatHub<E>,
    notifications: NotificationHub<E>,
    credential: SharedCredential,
    cancel: CancellationToken,
}

impl<E: Environment> Session<E> {
    /// Start a session against the configured websocket and HTTP endpoints.
    ///
    /// See [`Session::init_with`].
    pub async fn init(
        env: E,
        identity: Identity,
        credential: Credential,
        config: SessionConfig,
    ) -> Result<Self, ClientError> {
        let shared = Arc::new(RwLock::new(credential));
        let collaborators = Collaborators::http(&config, Arc::clone(&shared))?;
        Self::init_with(env, identity, shared, config, collaborators).await
    }

    /// Start a session with explicit collaborators.
    ///
    /// Connects both hubs concurrently and waits up to `connect_timeout`.
    /// Neither an unreachable nor a missing hub fails the call: the session
    /// comes back degraded, reconnecting in the background where that makes
    /// sense, and the poller fills in over REST.
    pub async fn init_with<K: Connector>(
        env: E,
        identity: Identity,
        credential: SharedCredential,
        config: SessionConfig,
        collaborators: Collaborators<K>,
    ) -> Result<Self, ClientError> {
        let cancel = CancellationToken::new();
        let chat_client =
            ChatClient::new(env.clone(), identity.clone(), config.hub.clone(), config.typing);
        let notification_client = NotificationClient::new(env.clone(), identity, config.hub);

        let chat = ChatHub::new(
            HubHandle::spawn(
                env.clone(),
                chat_client,
                collaborators.chat,
                config.runtime,
                cancel.child_token(),
            ),
            collaborators.conversation_store,
        );
        let notifications = NotificationHub::new(
            HubHandle::spawn(
                env.clone(),
                notification_client,
                collaborators.notifications,
                config.runtime,
                cancel.child_token(),
            ),
            collaborators.notification_store,
        );

        let current = credential.read().clone();
        let (chat_status, notification_status) = tokio::join!(
            chat.handle().connect(current.clone(), config.connect_timeout),
            notifications.handle().connect(current, config.connect_timeout),
        );
        let (chat_status, notification_status) = (chat_status?, notification_status?);
        info!(chat = %chat_status, notifications = %notification_status, "session started");

        if notification_status != ConnectionStatus::Connected
            && let Err(error) = notifications.refresh().await
        {
            debug!(%error, "initial notification listing failed");
        }

        let poller =
            DegradedPoller::new(env, chat.clone(), notifications.clone(), config.poll_interval);
        tokio::spawn(poller.run(cancel.child_token()));

        Ok(Self { chat, notifications, credential, cancel })
    }

    /// Conversation hub.
    pub fn chat(&self) -> &ChatHub<E> {
        &self.chat
    }

    /// Notification hub.
    pub fn notifications(&self) -> &NotificationHub<E> {
        &self.notifications
    }

    /// Swap the credential used by later dials and REST calls.
    pub async fn renew_credential(&self, credential: Credential) -> Result<(), ClientError> {
        *self.credential.write() = credential.clone();
        self.chat.renew_credential(credential.clone()).await?;
        self.notifications.renew_credential(credential).await
    }

    /// End the session: leave server-side groups, disconnect both hubs and
    /// stop every background task. In-flight dials are discarded.
    pub async fn dispose(self) {
        if let Err(error) = self.chat.dispose().await {
            debug!(%error, "chat hub already stopped");
        }
        if let Err(error) = self.notifications.dispose().await {
            debug!(%error, "notification hub already stopped");
        }
        self.cancel.cancel();
        info!("session disposed");
    }
}

impl<E: Environment> Drop for Session<E> {
    fn drop(&mut self) {
        if !self.cancel.is_cancelled() {
            debug!("session dropped without dispose, stopping hubs");
            self.cancel.cancel();
        }
    }
}
