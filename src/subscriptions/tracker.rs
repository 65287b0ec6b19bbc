//! In-memory tracker for provisional "subscribed via polling" messages.
//!
//! When a subscribe lands in polling mode the caller may post a provisional
//! message hinting at the install URL; if the installation arrives within the
//! window, the upgrade path edits that message in place. Entries are
//! consumed on upgrade or swept after 60 seconds.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const MAX_AGE: Duration = Duration::from_secs(60);

struct PromptEntry {
    message_event_id: String,
    recorded_at: Instant,
}

#[derive(Default)]
pub struct PromptTracker {
    entries: Mutex<HashMap<(String, String), PromptEntry>>,
}

impl PromptTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, channel_id: &str, repo_full_name: &str, message_event_id: String) {
        let mut entries = self.entries.lock().expect("prompt tracker poisoned");
        entries.insert(
            (channel_id.to_string(), repo_full_name.to_lowercase()),
            PromptEntry {
                message_event_id,
                recorded_at: Instant::now(),
            },
        );
    }

    /// Remove and return the tracked message id, if any. The entry is gone
    /// either way; edit failures must not leave a retry loop behind.
    pub fn take(&self, channel_id: &str, repo_full_name: &str) -> Option<String> {
        let mut entries = self.entries.lock().expect("prompt tracker poisoned");
        entries
            .remove(&(channel_id.to_string(), repo_full_name.to_lowercase()))
            .map(|e| e.message_event_id)
    }

    /// Drop entries older than the window. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        self.sweep_older_than(MAX_AGE)
    }

    fn sweep_older_than(&self, max_age: Duration) -> usize {
        let mut entries = self.entries.lock().expect("prompt tracker poisoned");
        let before = entries.len();
        entries.retain(|_, e| e.recorded_at.elapsed() < max_age);
        before - entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_consumes_the_entry() {
        let tracker = PromptTracker::new();
        tracker.record("chan-1", "Acme/Widget", "evt-1".into());
        assert_eq!(tracker.take("chan-1", "acme/widget").as_deref(), Some("evt-1"));
        assert_eq!(tracker.take("chan-1", "acme/widget"), None);
    }

    #[test]
    fn repo_lookup_is_case_insensitive() {
        let tracker = PromptTracker::new();
        tracker.record("chan-1", "acme/widget", "evt-1".into());
        assert!(tracker.take("chan-1", "ACME/Widget").is_some());
    }

    #[test]
    fn sweep_drops_aged_entries_only() {
        let tracker = PromptTracker::new();
        tracker.record("chan-1", "acme/widget", "evt-1".into());
        assert_eq!(tracker.sweep_older_than(Duration::from_secs(60)), 0);
        assert_eq!(tracker.sweep_older_than(Duration::ZERO), 1);
        assert_eq!(tracker.take("chan-1", "acme/widget"), None);
    }
}
