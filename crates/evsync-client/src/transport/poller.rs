//! Degraded-mode polling.
//!
//! While a hub is not `Connected` its real-time feed is missing, so the
//! poller periodically pulls the same state from the REST stores. It stops
//! polling a hub as soon as that hub is back, and exits with the session's
//! cancellation token.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    hubs::{ChatHub, NotificationHub},
    rest::HistoryPage,
};
use crate::Environment;

/// Default interval between polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Polls REST stores for hubs that are down.
#[derive(Debug)]
pub struct DegradedPoller<E: Environment> {
    env: E,
    chat: ChatHub<E>,
    notifications: NotificationHub<E>,
    interval: Duration,
}

impl<E: Environment> DegradedPoller<E> {
    /// Poller over both hubs.
    pub fn new(
        env: E,
        chat: ChatHub<E>,
        notifications: NotificationHub<E>,
        interval: Duration,
    ) -> Self {
        Self { env, chat, notifications, interval }
    }

    /// Poll every `interval` until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        debug!(interval = ?self.interval, "degraded poller started");
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = self.env.sleep(self.interval) => self.poll_once().await,
            }
        }
        debug!("degraded poller stopped");
    }

    /// One round: refresh whatever hub is not connected.
    pub async fn poll_once(&self) {
        if !self.notifications.status().is_connected()
            && let Err(error) = self.notifications.refresh().await
        {
            warn!(%error, "notification poll failed");
        }

        if self.chat.status().is_connected() {
            return;
        }
        let conversations = match self.chat.conversations().await {
            Ok(conversations) => conversations,
            Err(error) => {
                warn!(%error, "conversation poll skipped");
                return;
            },
        };
        for conversation in conversations {
            if let Err(error) = self.chat.load_history(conversation, HistoryPage::latest()).await {
                warn!(%conversation, %error, "history poll failed");
            }
        }
    }
}
