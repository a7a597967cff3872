//! A queue whose items are only released once their individual delay has elapsed.
//!
//! Used by the inotify backend's move grouper to hold a lone `MOVED_FROM` for the
//! move-pairing window before giving up and re-emitting it as a deletion.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

struct Entry<T> {
    ready_at: Instant,
    value: T,
}

/// A FIFO of `(value, delay)` pairs, ordered by insertion but released by deadline.
pub struct DelayedQueue<T> {
    entries: VecDeque<Entry<T>>,
}

impl<T> Default for DelayedQueue<T> {
    fn default() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }
}

impl<T> DelayedQueue<T> {
    /// Builds an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules `value` to become ready after `delay`.
    pub fn push(&mut self, value: T, delay: Duration) {
        self.entries.push_back(Entry {
            ready_at: Instant::now() + delay,
            value,
        });
    }

    /// Removes and returns every entry whose delay has elapsed, in the order they were
    /// pushed.
    pub fn drain_ready(&mut self) -> Vec<T> {
        let now = Instant::now();
        let mut ready = Vec::new();
        while let Some(front) = self.entries.front() {
            if front.ready_at <= now {
                ready.push(self.entries.pop_front().unwrap().value);
            } else {
                break;
            }
        }
        ready
    }

    /// How long until the next entry becomes ready, if any are pending.
    pub fn next_deadline(&self) -> Option<Duration> {
        self.entries
            .front()
            .map(|e| e.ready_at.saturating_duration_since(Instant::now()))
    }

    /// Removes and returns the first entry matching `predicate`, regardless of readiness.
    /// Used to pull a pending `MOVED_FROM` out early when its `MOVED_TO` pair arrives.
    pub fn remove_matching<F>(&mut self, mut predicate: F) -> Option<T>
    where
        F: FnMut(&T) -> bool,
    {
        let pos = self.entries.iter().position(|e| predicate(&e.value))?;
        Some(self.entries.remove(pos).unwrap().value)
    }

    /// Number of entries still pending.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the queue holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn entry_is_not_ready_before_its_delay() {
        let mut q = DelayedQueue::new();
        q.push("a", Duration::from_millis(50));
        assert!(q.drain_ready().is_empty());
    }

    #[test]
    fn entry_becomes_ready_after_its_delay() {
        let mut q = DelayedQueue::new();
        q.push("a", Duration::from_millis(5));
        sleep(Duration::from_millis(20));
        assert_eq!(q.drain_ready(), vec!["a"]);
    }

    #[test]
    fn remove_matching_pulls_out_before_deadline() {
        let mut q = DelayedQueue::new();
        q.push(("cookie-1", "from-a"), Duration::from_millis(500));
        let removed = q.remove_matching(|(cookie, _)| *cookie == "cookie-1");
        assert_eq!(removed, Some(("cookie-1", "from-a")));
        assert!(q.is_empty());
    }
}
