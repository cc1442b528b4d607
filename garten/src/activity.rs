use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Per-handle "last active" bookkeeping backing the grace-time sweep
/// (spec §9's open question: "a background daemon timer that calls
/// Destroy after the configured idle interval, where idle means no
/// active Run/Attach processes"). Lives outside the Property Store
/// because it's process-local, non-persistent bookkeeping, not part of
/// the container's externally visible state.
#[derive(Default)]
pub struct ActivityTracker {
    last_active: Mutex<HashMap<String, Instant>>,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records activity now (called on Create, Run, Attach).
    pub fn touch(&self, handle: &str) {
        self.last_active.lock().expect("lock poisoned").insert(handle.to_owned(), Instant::now());
    }

    pub fn forget(&self, handle: &str) {
        self.last_active.lock().expect("lock poisoned").remove(handle);
    }

    /// How long a handle has been idle, or `None` if it was never
    /// touched (treated as "not idle yet" by the sweep, not "forever
    /// idle").
    pub fn idle_for(&self, handle: &str) -> Option<Duration> {
        self.last_active
            .lock()
            .expect("lock poisoned")
            .get(handle)
            .map(|instant| instant.elapsed())
    }

    pub fn handles(&self) -> Vec<String> {
        self.last_active.lock().expect("lock poisoned").keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_for_is_none_until_touched() {
        let tracker = ActivityTracker::new();

        assert!(tracker.idle_for("handle-a").is_none());

        tracker.touch("handle-a");

        assert!(tracker.idle_for("handle-a").unwrap() < Duration::from_secs(1));
    }

    #[test]
    fn forget_removes_the_entry() {
        let tracker = ActivityTracker::new();
        tracker.touch("handle-a");

        tracker.forget("handle-a");

        assert!(tracker.idle_for("handle-a").is_none());
    }
}
