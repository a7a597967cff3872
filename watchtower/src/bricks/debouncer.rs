//! Collapses bursts of events on the same path into a single event.
//!
//! Offered to handlers as a convenience; the core emitters and dispatcher do not use this
//! themselves (they rely on the event queue's adjacent-duplicate collapsing instead, which is
//! a narrower and always-on guarantee — see [`crate::EventQueue`]).

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

#[cfg(test)]
use mock_instant::Instant;
#[cfg(not(test))]
use std::time::Instant;

use watchtower_types::Event;

struct Pending {
    event: Event,
    ready_at: Instant,
}

/// Buffers events per path, re-keying to the latest event seen and only releasing it once
/// `window` has passed without a further event on that path.
pub struct EventDebouncer {
    window: Duration,
    pending: HashMap<PathBuf, Pending>,
}

impl EventDebouncer {
    /// Builds a debouncer that collapses bursts within `window`.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: HashMap::new(),
        }
    }

    /// Feeds one event into the debouncer. The path used for keying is the event's primary
    /// path (for moves, the destination); events without a path bypass debouncing entirely.
    pub fn push(&mut self, event: Event) -> Option<Event> {
        let key = match event.dest_path().or_else(|| event.src_path()) {
            Some(path) => path.to_path_buf(),
            None => return Some(event),
        };
        self.pending.insert(
            key,
            Pending {
                event,
                ready_at: Instant::now() + self.window,
            },
        );
        None
    }

    /// Drains every event whose window has elapsed without being superseded.
    pub fn drain_ready(&mut self) -> Vec<Event> {
        let now = Instant::now();
        let ready_keys: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, pending)| pending.ready_at <= now)
            .map(|(path, _)| path.clone())
            .collect();
        ready_keys
            .into_iter()
            .filter_map(|key| self.pending.remove(&key).map(|p| p.event))
            .collect()
    }

    /// Whether any event is still buffered.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mock_instant::MockClock;
    use pretty_assertions::assert_eq;

    // These tests drive the mocked clock directly rather than sleeping, so they're immune to
    // scheduling jitter. MockClock is process-global, so every test pins its own start time.

    #[test]
    fn burst_on_same_path_collapses_to_the_latest_event() {
        MockClock::set_time(Duration::default());
        let mut deb = EventDebouncer::new(Duration::from_millis(20));
        deb.push(Event::file_modified("/tmp/x/a".into()));
        deb.push(Event::file_modified("/tmp/x/a".into()));
        deb.push(Event::file_deleted("/tmp/x/a".into()));
        MockClock::advance(Duration::from_millis(40));
        let ready = deb.drain_ready();
        assert_eq!(ready, vec![Event::file_deleted("/tmp/x/a".into())]);
    }

    #[test]
    fn distinct_paths_debounce_independently() {
        MockClock::set_time(Duration::default());
        let mut deb = EventDebouncer::new(Duration::from_millis(10));
        deb.push(Event::file_modified("/tmp/x/a".into()));
        deb.push(Event::file_modified("/tmp/x/b".into()));
        MockClock::advance(Duration::from_millis(20));
        assert_eq!(deb.drain_ready().len(), 2);
    }

    #[test]
    fn nothing_is_ready_before_the_window_elapses() {
        MockClock::set_time(Duration::default());
        let mut deb = EventDebouncer::new(Duration::from_millis(50));
        deb.push(Event::file_modified("/tmp/x/a".into()));
        MockClock::advance(Duration::from_millis(10));
        assert!(deb.drain_ready().is_empty());
        assert!(!deb.is_empty());
    }
}
