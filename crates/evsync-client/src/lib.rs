//! Client
//!
//! Action-based clients for the two evsync hubs. [`ChatClient`] drives the
//! conversation hub (membership, typing, messages, read receipts);
//! [`NotificationClient`] drives the independent notification hub.
//!
//! # Architecture
//!
//! The clients follow the same Sans-IO and Action-Based patterns as
//! [`evsync_core`]. They receive events ([`ChatEvent`], [`NotificationEvent`]),
//! process them through pure state machine logic, and return actions
//! ([`HubAction`]) for the caller to execute. Each client owns exactly one
//! connection; a drop on one hub never touches the other.
//!
//! # Components
//!
//! - [`ChatClient`]: conversation hub state machine
//! - [`NotificationClient`]: notification hub state machine
//! - [`HubClient`]: what a runtime needs to drive either one
//! - [`ChatNotice`], [`NotificationNotice`]: typed events for subscribers
//!
//! # Transport (optional)
//!
//! With the `transport` feature enabled, this crate also provides:
//! - [`transport::Session`]: both hubs plus REST collaborators, ready to use
//! - [`transport::HubHandle`]: actor driving one client over a websocket
//! - [`transport::WsConnector`]: websocket dialer with bearer credentials

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod chat;
mod error;
mod event;
mod hub;
mod notification;

#[cfg(feature = "transport")]
pub mod transport;

pub use chat::{ChatAction, ChatClient};
pub use error::ClientError;
pub use event::{ChatEvent, ChatNotice, NotificationEvent, NotificationNotice};
pub use evsync_core::{ConnectionStatus, Environment, Identity, TypingConfig};
pub use hub::{HubAction, HubClient, HubConfig, Lifecycle, LinkEvent};
pub use notification::{NotificationAction, NotificationClient};

#[cfg(test)]
pub(crate) mod test_env {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicU64, Ordering},
        },
        time::{Duration, Instant},
    };

    use chrono::{DateTime, TimeZone, Utc};

    use crate::Environment;

    /// Manually advanced clock for unit tests.
    #[derive(Clone)]
    pub(crate) struct ManualEnv {
        origin: Instant,
        elapsed_ms: Arc<AtomicU64>,
    }

    impl ManualEnv {
        pub(crate) fn new() -> Self {
            Self { origin: Instant::now(), elapsed_ms: Arc::new(AtomicU64::new(0)) }
        }

        pub(crate) fn advance(&self, by: Duration) {
            self.elapsed_ms.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
        }

        fn elapsed(&self) -> Duration {
            Duration::from_millis(self.elapsed_ms.load(Ordering::SeqCst))
        }
    }

    impl Environment for ManualEnv {
        type Instant = Instant;

        fn now(&self) -> Instant {
            self.origin + self.elapsed()
        }

        fn wall_clock(&self) -> DateTime<Utc> {
            let origin = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
            origin + chrono::Duration::from_std(self.elapsed()).unwrap()
        }

        async fn sleep(&self, duration: Duration) {
            self.advance(duration);
        }
    }
}
