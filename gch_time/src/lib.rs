//! Time abstraction and request identity for the gateway.
//!
//! All gateway components that need wall-clock time take an
//! `Arc<dyn TimeProvider>` so that TTL expiry and cache-key derivation can
//! be driven deterministically in tests.

use std::{ops::Add, sync::Arc, time::Duration};

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::RwLock;

mod ident;

pub use ident::{backend_query_id, request_id};

/// A UTC timestamp returned by a [`TimeProvider`].
///
/// Intentionally opaque; the gateway only ever needs whole epoch seconds
/// and date rendering from it.
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub struct Time(DateTime<Utc>);

impl Add<Duration> for Time {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self::Output {
        let duration = chrono::Duration::from_std(rhs).expect("duration in range");
        Self(self.0 + duration)
    }
}

impl std::fmt::Debug for Time {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

impl std::fmt::Display for Time {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

impl Time {
    /// Makes a new `Time` from the number of non-leap seconds
    /// since January 1, 1970 0:00:00 UTC (aka "UNIX timestamp").
    pub fn from_timestamp(secs: i64) -> Self {
        Self(
            Utc.timestamp_opt(secs, 0)
                .single()
                .expect("timestamp in range"),
        )
    }

    /// Returns the number of seconds since January 1, 1970 UTC.
    pub fn timestamp(&self) -> i64 {
        self.0.timestamp()
    }

    /// Renders the calendar date of this timestamp as `YYYY-MM-DD`.
    ///
    /// Finder cache keys carry the date (not the full timestamp) of the
    /// window bounds, so that all requests for the same day share keys.
    pub fn format_date(&self) -> String {
        self.0.format("%Y-%m-%d").to_string()
    }
}

/// Floor a unix timestamp to a multiple of `step`.
///
/// Collapses near-simultaneous requests onto the same cache timestamp; a
/// 60 s step turns every timestamp within the same minute into the minute
/// boundary.
pub fn timestamp_truncate(ts: i64, step: Duration) -> i64 {
    let step = step.as_secs() as i64;
    if step <= 0 {
        return ts;
    }
    ts - ts.rem_euclid(step)
}

/// A source of wall-clock time.
pub trait TimeProvider: std::fmt::Debug + Send + Sync + 'static {
    /// Returns the current time.
    fn now(&self) -> Time;
}

/// [`TimeProvider`] backed by the system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProvider {}

impl SystemProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TimeProvider for SystemProvider {
    fn now(&self) -> Time {
        Time(Utc::now())
    }
}

/// [`TimeProvider`] that returns a programmable time, for tests.
#[derive(Debug)]
pub struct MockProvider {
    now: RwLock<Time>,
}

impl MockProvider {
    pub fn new(now: Time) -> Self {
        Self {
            now: RwLock::new(now),
        }
    }

    pub fn set(&self, now: Time) {
        *self.now.write() = now;
    }

    pub fn inc(&self, duration: Duration) -> Time {
        let mut now = self.now.write();
        *now = *now + duration;
        *now
    }
}

impl TimeProvider for MockProvider {
    fn now(&self) -> Time {
        *self.now.read()
    }
}

impl<T: TimeProvider> TimeProvider for Arc<T> {
    fn now(&self) -> Time {
        (**self).now()
    }
}
