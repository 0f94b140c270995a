//! Process-local task identifiers.
//!
//! Ids have the form `TASK-{unix_millis}-{counter}`. The counter is shared by
//! every caller in the process, so two ids minted in the same millisecond
//! still differ. Uniqueness holds within one process only.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;

static COUNTER: AtomicU64 = AtomicU64::new(0);

/// Mint a new task id.
pub fn generate_task_id() -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("TASK-{}-{:04}", Utc::now().timestamp_millis(), n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn ids_have_expected_shape() {
        let id = generate_task_id();
        let parts: Vec<&str> = id.split('-').collect();
        assert_eq!(parts.len(), 3, "{id}");
        assert_eq!(parts[0], "TASK");
        assert!(parts[1].parse::<i64>().is_ok());
        assert!(parts[2].parse::<u64>().is_ok());
    }

    #[test]
    fn ids_are_unique_in_a_tight_loop() {
        let ids: HashSet<String> = (0..1_000).map(|_| generate_task_id()).collect();
        assert_eq!(ids.len(), 1_000);
    }

    #[test]
    fn counter_is_monotonic() {
        let counter = |id: &str| id.rsplit('-').next().and_then(|n| n.parse::<u64>().ok());
        let a = counter(&generate_task_id()).unwrap();
        let b = counter(&generate_task_id()).unwrap();
        assert!(b > a);
    }
}
