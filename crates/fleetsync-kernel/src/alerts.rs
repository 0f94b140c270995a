//! [`AlertLog`] – bounded, deduplicating alert history.
//!
//! # Algorithm
//!
//! Alerts are deduplicated by message. The log remembers when each message
//! was last appended; a new alert whose message was appended less than the
//! dedup window ago (30 s by default) is suppressed. Clearing an alert does
//! not reset that memory, so a condition the operator dismissed does not
//! bounce straight back.
//!
//! The visible list keeps the most recent `capacity` alerts (50 by default),
//! newest first.
//!
//! # Example
//!
//! ```rust
//! use chrono::{Duration, Utc};
//! use fleetsync_kernel::alerts::AlertLog;
//! use fleetsync_types::{Alert, AlertLevel};
//!
//! let mut log = AlertLog::default();
//! let t0 = Utc::now();
//! let alert = |t| Alert {
//!     id: uuid::Uuid::new_v4(),
//!     severity: AlertLevel::Warning,
//!     device_id: "dev-1".into(),
//!     robot_id: None,
//!     message: "Temperature warning on dev-1".into(),
//!     value: Some(30.0),
//!     timestamp: t,
//! };
//!
//! assert!(log.push(alert(t0)).is_some());
//! assert!(log.push(alert(t0 + Duration::seconds(10))).is_none());
//! assert!(log.push(alert(t0 + Duration::seconds(31))).is_some());
//! assert_eq!(log.len(), 2);
//! ```

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use fleetsync_types::Alert;
use tracing::debug;
use uuid::Uuid;

pub const DEFAULT_ALERT_CAPACITY: usize = 50;
pub const DEFAULT_DEDUP_WINDOW_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct AlertLog {
    capacity: usize,
    dedup_window: Duration,
    /// Newest at the front.
    entries: VecDeque<Alert>,
    last_appended: HashMap<String, DateTime<Utc>>,
}

impl Default for AlertLog {
    fn default() -> Self {
        Self::new(DEFAULT_ALERT_CAPACITY, DEFAULT_DEDUP_WINDOW_SECS)
    }
}

impl AlertLog {
    /// `capacity` is raised to at least 1.
    pub fn new(capacity: usize, dedup_window_secs: u64) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            dedup_window: Duration::seconds(i64::try_from(dedup_window_secs).unwrap_or(i64::MAX / 1_000)),
            entries: VecDeque::with_capacity(capacity),
            last_appended: HashMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append `alert` unless its message was appended within the dedup
    /// window. Returns the alert when it was appended.
    pub fn push(&mut self, alert: Alert) -> Option<Alert> {
        if let Some(last) = self.last_appended.get(&alert.message) {
            if alert.timestamp - *last < self.dedup_window {
                debug!(message = %alert.message, "alert suppressed by dedup window");
                return None;
            }
        }
        self.prune(alert.timestamp);
        self.last_appended
            .insert(alert.message.clone(), alert.timestamp);
        self.entries.push_front(alert.clone());
        self.entries.truncate(self.capacity);
        Some(alert)
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let window = self.dedup_window;
        self.last_appended.retain(|_, t| now - *t < window);
    }

    /// Alerts, most recent first.
    pub fn list(&self) -> Vec<Alert> {
        self.entries.iter().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Alert> {
        self.entries.iter()
    }

    /// Remove one alert. Returns `false` when no alert has that id.
    pub fn clear(&mut self, id: Uuid) -> bool {
        let before = self.entries.len();
        self.entries.retain(|a| a.id != id);
        self.entries.len() != before
    }

    pub fn clear_all(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
