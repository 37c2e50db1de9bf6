//! Environment abstraction for deterministic testing.
//!
//! Decouples synchronization logic from system resources. Production uses
//! the tokio clock and the system wall clock; simulation uses turmoil's
//! virtual time and a fixed wall-clock origin.

use std::{
    fmt::Debug,
    ops::{Add, Sub},
    time::Duration,
};

use chrono::{DateTime, Utc};

/// Monotonic instant usable by the state machines.
///
/// Implemented for any type with the arithmetic the state machines need,
/// notably `std::time::Instant` and `tokio::time::Instant`.
pub trait Monotonic:
    Copy
    + Ord
    + Debug
    + Send
    + Sync
    + 'static
    + Sub<Output = Duration>
    + Add<Duration, Output = Self>
{
}

impl<T> Monotonic for T where
    T: Copy
        + Ord
        + Debug
        + Send
        + Sync
        + 'static
        + Sub<Output = Duration>
        + Add<Duration, Output = Self>
{
}

/// Abstract environment providing time and async sleeping.
///
/// # Invariants
///
/// - `now()` never goes backwards
/// - `wall_clock()` is only used for message and marker timestamps, never for
///   scheduling
pub trait Environment: Clone + Send + Sync + 'static {
    /// The specific instant type used by this environment.
    type Instant: Monotonic;

    /// Current time (monotonic).
    fn now(&self) -> Self::Instant;

    /// Current wall-clock time, for timestamps exchanged with the backend.
    fn wall_clock(&self) -> DateTime<Utc>;

    /// Sleeps for the specified duration.
    ///
    /// Only driver code awaits this; state machines take `now` instead.
    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send;

    /// Sleeps until `deadline`. Returns immediately if it already passed.
    fn sleep_until(
        &self,
        deadline: Self::Instant,
    ) -> impl std::future::Future<Output = ()> + Send {
        let remaining = if deadline > self.now() { deadline - self.now() } else { Duration::ZERO };
        self.sleep(remaining)
    }
}
