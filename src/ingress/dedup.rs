// Bounded-window event dedup for webhook retries.
//
// The platform redelivers events it thinks we dropped. Entries are kept
// in a lock-free map and swept periodically; state is in-memory only
// (resets on restart, like the rate-limit buckets it is modeled on).

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Tracks event ids seen within the dedup window.
pub struct DedupWindow {
    seen: DashMap<String, Instant>,
    window: Duration,
}

impl DedupWindow {
    pub fn new(window_seconds: u64) -> Self {
        Self {
            seen: DashMap::new(),
            window: Duration::from_secs(window_seconds),
        }
    }

    /// Records `event_id` and returns true if this is its first delivery
    /// within the window.
    pub fn check_and_record(&self, event_id: &str) -> bool {
        let now = Instant::now();
        match self.seen.entry(event_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                if now.duration_since(*entry.get()) > self.window {
                    // Window elapsed — treat as a fresh event
                    entry.insert(now);
                    true
                } else {
                    false
                }
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(now);
                true
            }
        }
    }

    /// Drops entries older than the window.
    pub fn sweep(&self) {
        let now = Instant::now();
        self.seen
            .retain(|_, seen_at| now.duration_since(*seen_at) <= self.window);
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// Background task that periodically sweeps the dedup window.
pub async fn run_dedup_sweep(window: Arc<DedupWindow>, interval_seconds: u64) {
    let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(interval_seconds));

    loop {
        interval.tick().await;
        window.sweep();
        tracing::debug!(tracked = window.len(), "Dedup sweep complete");
    }
}
