//! Time abstraction used by the partition cache so that tests can control
//! `last_seen` / staleness arithmetic deterministically.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::RwLock;
use std::fmt::Debug;
use std::ops::{Add, Sub};
use std::time::Duration;

/// An instant, internally UTC with nanosecond precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Time(DateTime<Utc>);

impl Time {
    /// From whole seconds and additional nanoseconds since the epoch.
    pub fn from_timestamp(secs: i64, nanos: u32) -> Self {
        Self(Utc.timestamp(secs, nanos))
    }

    /// From milliseconds since the epoch.
    pub fn from_timestamp_millis(millis: i64) -> Self {
        Self(Utc.timestamp_millis(millis))
    }

    /// From nanoseconds since the epoch.
    pub fn from_timestamp_nanos(nanos: i64) -> Self {
        Self(Utc.timestamp_nanos(nanos))
    }

    /// Nanoseconds since the epoch.
    pub fn timestamp_nanos(&self) -> i64 {
        self.0.timestamp_nanos()
    }

    /// The underlying UTC datetime.
    pub fn date_time(&self) -> DateTime<Utc> {
        self.0
    }

    /// Saturating duration since `earlier`; zero if `earlier` is later.
    pub fn checked_duration_since(&self, earlier: Self) -> Option<Duration> {
        (self.0 - earlier.0).to_std().ok()
    }
}

impl Add<Duration> for Time {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self {
        Self(self.0 + chrono::Duration::from_std(rhs).expect("duration overflow"))
    }
}

impl Sub<Duration> for Time {
    type Output = Self;

    fn sub(self, rhs: Duration) -> Self {
        Self(self.0 - chrono::Duration::from_std(rhs).expect("duration overflow"))
    }
}

impl std::fmt::Display for Time {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%dT%H:%M:%S%.fZ"))
    }
}

/// A source of [`Time`].
pub trait TimeProvider: Debug + Send + Sync + 'static {
    /// The current instant.
    fn now(&self) -> Time;
}

/// Wall-clock [`TimeProvider`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProvider {}

impl SystemProvider {
    /// Create a wall-clock provider.
    pub fn new() -> Self {
        Self::default()
    }
}

impl TimeProvider for SystemProvider {
    fn now(&self) -> Time {
        Time(Utc::now())
    }
}

/// A [`TimeProvider`] whose `now` is set by the test.
#[derive(Debug)]
pub struct MockProvider {
    now: RwLock<Time>,
}

impl MockProvider {
    /// Create a provider frozen at `start`.
    pub fn new(start: Time) -> Self {
        Self {
            now: RwLock::new(start),
        }
    }

    /// Jump to `time`.
    pub fn set(&self, time: Time) {
        *self.now.write() = time
    }

    /// Advance by `duration` and return the new instant.
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

impl<T: TimeProvider> TimeProvider for std::sync::Arc<T> {
    fn now(&self) -> Time {
        (**self).now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_provider_moves_forward() {
        let provider = SystemProvider::new();
        let a = provider.now();
        let b = provider.now();
        assert!(b >= a);
    }

    #[test]
    fn mock_provider_is_controlled() {
        let provider = MockProvider::new(Time::from_timestamp(100, 0));
        assert_eq!(provider.now().timestamp_nanos(), 100_000_000_000);

        provider.inc(Duration::from_secs(5));
        assert_eq!(provider.now().timestamp_nanos(), 105_000_000_000);

        provider.set(Time::from_timestamp_nanos(42));
        assert_eq!(provider.now().timestamp_nanos(), 42);
    }

    #[test]
    fn time_arithmetic() {
        let t = Time::from_timestamp(10, 0);
        let later = t + Duration::from_secs(5);
        assert_eq!(
            later.checked_duration_since(t),
            Some(Duration::from_secs(5))
        );
        assert_eq!(t.checked_duration_since(later), None);
        assert_eq!(later - Duration::from_secs(5), t);
    }
}
