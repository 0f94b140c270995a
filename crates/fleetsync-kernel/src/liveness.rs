//! [`Liveness`] – record freshness.
//!
//! A device or robot is *live* when its last update was less than the
//! liveness window ago (3000 ms by default). Every consumer asks this type
//! rather than comparing timestamps itself, so the rule cannot drift.
//!
//! Timestamps are ingestion times, never producer clocks.
//!
//! # Example
//!
//! ```
//! use chrono::{Duration, Utc};
//! use fleetsync_kernel::liveness::Liveness;
//!
//! let liveness = Liveness::default();
//! let now = Utc::now();
//! assert!(liveness.is_live(Some(now - Duration::milliseconds(2_999)), now));
//! assert!(!liveness.is_live(Some(now - Duration::milliseconds(3_000)), now));
//! assert!(!liveness.is_live(None, now));
//! ```

use chrono::{DateTime, Duration, Utc};

/// Default liveness window.
pub const DEFAULT_LIVENESS_MS: u64 = 3_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Liveness {
    window: Duration,
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new(DEFAULT_LIVENESS_MS)
    }
}

impl Liveness {
    pub fn new(window_ms: u64) -> Self {
        Self {
            window: millis(window_ms),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// `true` when `now − last_update < window`. A record that never
    /// reported is not live.
    pub fn is_live(&self, last_update: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        last_update.is_some_and(|t| now - t < self.window)
    }

    /// `true` when the record has been silent for at least `ttl`.
    pub fn is_stale(&self, last_seen: DateTime<Utc>, now: DateTime<Utc>, ttl: Duration) -> bool {
        now - last_seen >= ttl
    }
}

/// Millisecond count to a [`Duration`], saturating on overflow.
pub fn millis(ms: u64) -> Duration {
    Duration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX / 1_000))
}
