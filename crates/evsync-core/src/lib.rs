//! Synchronization core for evsync.
//!
//! Pure state machines with no I/O. Every method that depends on time takes
//! `now` as a parameter and returns what the driver must do next, so the same
//! logic runs under a real clock in production and a virtual clock in
//! simulation.
//!
//! # Components
//!
//! - [`connection`]: lifecycle of one hub connection, reconnect schedule
//! - [`membership`]: which conversations are joined on the current link
//! - [`typing`]: outbound debounce and inbound expiry of typing indicators
//! - [`dispatcher`]: per-conversation message lists, dedup, unread counts
//! - [`receipts`]: read markers and own-message read promotion
//! - [`notifications`]: notification inbox and unread badge
//! - [`deferred`]: operations held while disconnected
//! - [`observer`]: typed subscriber lists

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod connection;
pub mod deferred;
pub mod dispatcher;
pub mod env;
pub mod error;
pub mod identity;
pub mod membership;
pub mod notifications;
pub mod observer;
pub mod receipts;
pub mod typing;

pub use connection::{
    Connection, ConnectionAction, ConnectionStatus, DEFAULT_MAX_ATTEMPTS, ReconnectPolicy,
};
pub use deferred::DeferredQueue;
pub use dispatcher::{DispatchOutcome, MessageDispatcher};
pub use env::{Environment, Monotonic};
pub use error::ConnectionError;
pub use identity::Identity;
pub use membership::Membership;
pub use notifications::NotificationInbox;
pub use observer::{Observers, SubscriptionId};
pub use receipts::{ReadReceiptTracker, ReceiptOutcome};
pub use typing::{TypingAction, TypingConfig, TypingCoordinator};
