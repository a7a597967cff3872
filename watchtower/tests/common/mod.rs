//! Shared end-to-end test harness: a channel-backed [`Handler`] plus a small DSL for asserting
//! on the events an [`Observer`] produced, without each test hand-rolling a polling loop.

use std::sync::mpsc;
use std::time::{Duration, Instant};

use watchtower::{Event, Handler};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// A [`Handler`] that forwards every dispatched event over an `mpsc` channel to the test
/// thread, paired with a [`RecordedEvents`] receiver side.
pub struct ChannelHandler {
    tx: mpsc::Sender<Event>,
}

impl Handler for ChannelHandler {
    fn on_any_event(&mut self, event: &Event) {
        let _ = self.tx.send(event.clone());
    }
}

/// The receiving half of a [`ChannelHandler`], used to make assertions from the test thread.
pub struct RecordedEvents {
    rx: mpsc::Receiver<Event>,
}

/// Builds a connected `(ChannelHandler, RecordedEvents)` pair.
pub fn channel_handler() -> (ChannelHandler, RecordedEvents) {
    let (tx, rx) = mpsc::channel();
    (ChannelHandler { tx }, RecordedEvents { rx })
}

impl RecordedEvents {
    /// Blocks until an event with the given label is seen, or panics after [`DEFAULT_TIMEOUT`].
    /// Events with other labels seen while waiting are discarded.
    pub fn expect(&self, label: &str) -> Event {
        self.expect_within(label, DEFAULT_TIMEOUT)
    }

    /// Like [`RecordedEvents::expect`] with an explicit timeout.
    pub fn expect_within(&self, label: &str, timeout: Duration) -> Event {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                panic!("timed out waiting for `{label}` event");
            }
            match self.rx.recv_timeout(remaining) {
                Ok(event) if event.label() == label => return event,
                Ok(_other) => continue,
                Err(_) => panic!("timed out waiting for `{label}` event"),
            }
        }
    }

    /// Blocks until events with exactly the given labels have been seen, in that order,
    /// ignoring any other labels interleaved between them. Panics after [`DEFAULT_TIMEOUT`] per
    /// label if the sequence never completes.
    pub fn wait_ordered(&self, labels: &[&str]) {
        for label in labels {
            self.expect(label);
        }
    }

    /// Asserts that no event arrives within `window`. Used to check that a filtered or
    /// out-of-scope mutation produces nothing.
    pub fn expect_none(&self, window: Duration) {
        if let Ok(event) = self.rx.recv_timeout(window) {
            panic!("expected no event, got `{}` for {:?}", event.label(), event.paths);
        }
    }
}
