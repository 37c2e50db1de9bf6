//! Websocket transport, hub runtime and REST collaborators.
//!
//! This layer owns all I/O. Protocol logic stays in the Sans-IO
//! [`crate::ChatClient`] and [`crate::NotificationClient`]; the runtime only
//! executes the actions they return and feeds back what the network reports.
//!
//! - [`link`]: one websocket link speaking the hub protocol
//! - [`runtime`]: the per-hub actor and its [`HubHandle`]
//! - [`hubs`]: typed facades over the two handles
//! - [`rest`]: conversation and notification stores
//! - [`session`]: wiring of everything above for one signed-in user
//! - [`poller`]: REST polling while a hub is unavailable

pub mod hubs;
pub mod link;
pub mod poller;
pub mod rest;
pub mod runtime;
pub mod session;
mod system_env;

use evsync_core::ConnectionError;
use thiserror::Error;

pub use hubs::{ChatHub, NotificationHub};
pub use link::{
    Connector, HubLink, LinkMessage, WsConnector, upgrade_error, upgrade_request,
};
pub use poller::DegradedPoller;
pub use rest::{
    ConversationStore, HistoryPage, HttpConversationStore, HttpNotificationStore,
    NotificationStore, RestError, SharedCredential,
};
pub use runtime::{HubHandle, RuntimeConfig, StatusChange};
pub use session::{Collaborators, Session, SessionConfig};
pub use system_env::SystemEnv;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Endpoint URL could not be parsed.
    #[error("invalid endpoint {endpoint}: {reason}")]
    InvalidEndpoint {
        /// Endpoint as configured.
        endpoint: String,
        /// Parser error.
        reason: String,
    },

    /// Websocket error.
    #[error("websocket error: {0}")]
    Websocket(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Websocket(err.to_string())
    }
}

impl From<TransportError> for ConnectionError {
    fn from(err: TransportError) -> Self {
        Self::Transport(err.to_string())
    }
}
