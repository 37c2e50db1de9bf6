//! REST collaborators.
//!
//! Message history and notification lists live in the backend's REST API,
//! not on the hubs. The hubs also have no method for read markers, so those
//! go through [`ConversationStore::mark_read`].

use std::sync::Arc;

use async_trait::async_trait;
use evsync_proto::{
    ConversationId, Credential, Message, Notification, NotificationId, PayloadError, ReadMarker,
    wire,
};
use parking_lot::RwLock;
use reqwest::{Method, RequestBuilder, Url};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, warn};

use super::TransportError;

/// Page size used when none is given.
pub const DEFAULT_PAGE_SIZE: u32 = 50;

/// Credential shared by both hubs and the REST stores, swapped on renewal.
pub type SharedCredential = Arc<RwLock<Credential>>;

/// REST errors.
#[derive(Debug, Error)]
pub enum RestError {
    /// Request could not be sent or the body could not be read.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-success status.
    #[error("{url} returned {status}")]
    Status {
        /// Requested URL.
        url: String,
        /// HTTP status code.
        status: u16,
    },

    /// Base URL cannot carry path segments.
    #[error("invalid base url {0}")]
    Url(String),

    /// Response body did not carry what the endpoint promises.
    #[error(transparent)]
    Payload(#[from] PayloadError),
}

/// One page of conversation history, newest page first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryPage {
    /// Zero-based page index.
    pub page: u32,
    /// Messages per page.
    pub size: u32,
}

impl HistoryPage {
    /// The most recent page.
    pub fn latest() -> Self {
        Self { page: 0, size: DEFAULT_PAGE_SIZE }
    }
}

impl Default for HistoryPage {
    fn default() -> Self {
        Self::latest()
    }
}

/// Conversation history and read markers.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Load one page of history.
    async fn history(
        &self,
        conversation: ConversationId,
        page: HistoryPage,
    ) -> Result<Vec<Message>, RestError>;

    /// Store the local user's read marker.
    async fn mark_read(&self, marker: &ReadMarker) -> Result<(), RestError>;
}

/// Notification listing and read state.
#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// All notifications of the signed-in user.
    async fn list(&self) -> Result<Vec<Notification>, RestError>;

    /// Mark notifications read.
    async fn mark_read(&self, ids: &[NotificationId]) -> Result<(), RestError>;
}

/// Authenticated JSON requests against the API base URL.
#[derive(Debug, Clone)]
struct RestClient {
    http: reqwest::Client,
    base: Url,
    credential: SharedCredential,
}

impl RestClient {
    fn new(base: &str, credential: SharedCredential) -> Result<Self, TransportError> {
        let base = Url::parse(base).map_err(|e| TransportError::InvalidEndpoint {
            endpoint: base.to_string(),
            reason: e.to_string(),
        })?;
        if base.cannot_be_a_base() {
            return Err(TransportError::InvalidEndpoint {
                endpoint: base.to_string(),
                reason: "cannot be a base".to_string(),
            });
        }
        Ok(Self { http: reqwest::Client::new(), base, credential })
    }

    fn url(&self, segments: &[&str]) -> Result<Url, RestError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| RestError::Url(self.base.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let token = self.credential.read().token().to_string();
        self.http.request(method, url).bearer_auth(token)
    }

    async fn send(&self, request: RequestBuilder) -> Result<reqwest::Response, RestError> {
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(RestError::Status {
                url: response.url().to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response)
    }
}

/// [`ConversationStore`] over the backend REST API.
///
/// - `GET {base}/conversations/{id}/messages?page=&pageSize=`
/// - `POST {base}/conversations/{id}/read` with `{"lastReadAt": ...}`
#[derive(Debug, Clone)]
pub struct HttpConversationStore {
    rest: RestClient,
}

impl HttpConversationStore {
    /// Store rooted at `base`.
    ///
    /// # Errors
    ///
    /// - `InvalidEndpoint` if `base` is not an absolute URL
    pub fn new(base: &str, credential: SharedCredential) -> Result<Self, TransportError> {
        Ok(Self { rest: RestClient::new(base, credential)? })
    }
}

#[async_trait]
impl ConversationStore for HttpConversationStore {
    async fn history(
        &self,
        conversation: ConversationId,
        page: HistoryPage,
    ) -> Result<Vec<Message>, RestError> {
        let id = conversation.to_string();
        let mut url = self.rest.url(&["conversations", &id, "messages"])?;
        url.query_pairs_mut()
            .append_pair("page", &page.page.to_string())
            .append_pair("pageSize", &page.size.to_string());

        let response = self.rest.send(self.rest.request(Method::GET, url)).await?;
        let body: Value = response.json().await?;

        let mut messages = Vec::new();
        for entry in wire::listing(&body) {
            match wire::history_message(entry, conversation) {
                Ok(message) => messages.push(message),
                Err(error) => warn!(%conversation, %error, "skipping malformed history entry"),
            }
        }
        debug!(%conversation, page = page.page, count = messages.len(), "history loaded");
        Ok(messages)
    }

    async fn mark_read(&self, marker: &ReadMarker) -> Result<(), RestError> {
        let id = marker.conversation.to_string();
        let url = self.rest.url(&["conversations", &id, "read"])?;
        let body = json!({ "lastReadAt": marker.last_read_at.to_rfc3339() });

        self.rest.send(self.rest.request(Method::POST, url).json(&body)).await?;
        Ok(())
    }
}

/// [`NotificationStore`] over the backend REST API.
///
/// - `GET {base}/notifications`
/// - `POST {base}/notifications/{id}/read`
#[derive(Debug, Clone)]
pub struct HttpNotificationStore {
    rest: RestClient,
}

impl HttpNotificationStore {
    /// Store rooted at `base`.
    ///
    /// # Errors
    ///
    /// - `InvalidEndpoint` if `base` is not an absolute URL
    pub fn new(base: &str, credential: SharedCredential) -> Result<Self, TransportError> {
        Ok(Self { rest: RestClient::new(base, credential)? })
    }
}

#[async_trait]
impl NotificationStore for HttpNotificationStore {
    async fn list(&self) -> Result<Vec<Notification>, RestError> {
        let url = self.rest.url(&["notifications"])?;
        let response = self.rest.send(self.rest.request(Method::GET, url)).await?;
        let body: Value = response.json().await?;

        let mut notifications = Vec::new();
        for entry in wire::listing(&body) {
            match wire::notification(entry) {
                Ok(notification) => notifications.push(notification),
                Err(error) => warn!(%error, "skipping malformed notification"),
            }
        }
        Ok(notifications)
    }

    async fn mark_read(&self, ids: &[NotificationId]) -> Result<(), RestError> {
        for id in ids {
            let url = self.rest.url(&["notifications", id.as_str(), "read"])?;
            self.rest.send(self.rest.request(Method::POST, url)).await?;
        }
        Ok(())
    }
}
