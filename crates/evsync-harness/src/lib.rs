//! Deterministic simulation harness for evsync session testing.
//!
//! Two levels of simulation share one in-memory hub backend ([`SimHub`]):
//!
//! - [`SimWorld`] drives the Sans-IO clients directly. Link events and hub
//!   frames are queued and delivered only when the test says so, which makes
//!   interleavings explicit and runs fully reproducible from a seed.
//! - [`WsHost`] serves the same hubs as websockets over turmoil TCP, so the
//!   production session, runtime and link code run unchanged under
//!   simulated network faults.
//!
//! # Model-Based Testing
//!
//! The `operation` module defines [`Operation`]s generated by proptest (or
//! `arbitrary` in fuzzing) and applied to a [`SimWorld`].
//!
//! # Invariant Testing
//!
//! The `invariants` module checks behavioral properties against a
//! [`SystemSnapshot`] after every operation. Use
//! [`InvariantRegistry::standard()`] for the session invariants.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod invariants;
pub mod operation;
pub mod sim_env;
pub mod sim_hub;
pub mod sim_world;
pub mod sim_ws;

pub use invariants::{
    BadgeMatchesInbox, ClientSnapshot, ConversationSnapshot, HubSnapshot, Invariant,
    InvariantRegistry, InvariantResult, LegalStatusTransitions, NoSendWhileOffline,
    SystemSnapshot, UniqueMessageIds, UnreadBounded, Violation,
};
pub use operation::{ClientId, HubKind, ModelConversationId, Operation};
pub use sim_env::{SimEnv, SimInstant};
pub use sim_hub::{ConnId, Delivery, SimHub, StoredMessage};
pub use sim_world::{SimClient, SimWorld};
pub use sim_ws::{SharedHub, SimConnector, SimStore, WsHost};
