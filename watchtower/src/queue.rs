//! The bounded, de-duplicating queue between emitters and the dispatcher.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use watchtower_types::Event;

use crate::watch::ObservedWatch;

/// One queued item: a canonical event together with the watch that produced it.
#[derive(Clone)]
pub struct QueuedEvent {
    /// The event itself.
    pub event: Event,
    /// The watch whose emitter produced the event.
    pub watch: ObservedWatch,
}

impl PartialEq for QueuedEvent {
    fn eq(&self, other: &Self) -> bool {
        self.event == other.event && self.watch == other.watch
    }
}

/// Failure mode of [`EventQueue::get`].
#[derive(Debug, PartialEq, Eq)]
pub enum RecvError {
    /// No item arrived before the timeout elapsed.
    Timeout,
    /// The queue was closed and is now empty; no further items will ever arrive.
    Closed,
}

struct Inner {
    items: VecDeque<QueuedEvent>,
    closed: bool,
}

/// A bounded multi-producer, single-consumer queue of `(event, watch)` pairs.
///
/// Consecutive structurally-equal entries are collapsed: if the new entry equals the current
/// tail, it is silently dropped rather than enqueued again. This absorbs the inconsistency of
/// kernel-level coalescing across platforms without reordering distinct events.
pub struct EventQueue {
    inner: Mutex<Inner>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl EventQueue {
    /// Creates a queue bounded at `capacity` items (0 means unbounded).
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        }
    }

    /// Enqueues an `(event, watch)` pair, blocking while the queue is at capacity.
    ///
    /// Returns `false` without blocking if the queue has been [`close`](Self::close)d.
    pub fn put(&self, event: Event, watch: ObservedWatch) -> bool {
        let item = QueuedEvent { event, watch };
        let mut guard = self.inner.lock().unwrap();
        loop {
            if guard.closed {
                return false;
            }
            if self.capacity == 0 || guard.items.len() < self.capacity {
                break;
            }
            guard = self.not_full.wait(guard).unwrap();
        }
        if guard.items.back().map(|tail| *tail == item) == Some(true) {
            log::trace!("event queue dropping duplicate tail entry");
            return true;
        }
        guard.items.push_back(item);
        self.not_empty.notify_one();
        true
    }

    /// Dequeues the oldest entry, waiting up to `timeout`.
    ///
    /// Returns [`RecvError::Closed`] immediately if the queue is closed and empty, or
    /// [`RecvError::Timeout`] if nothing arrives in time.
    pub fn get(&self, timeout: Duration) -> Result<QueuedEvent, RecvError> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.inner.lock().unwrap();
        loop {
            if let Some(item) = guard.items.pop_front() {
                self.not_full.notify_one();
                return Ok(item);
            }
            if guard.closed {
                return Err(RecvError::Closed);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(RecvError::Timeout);
            }
            let (next_guard, timeout_result) =
                self.not_empty.wait_timeout(guard, deadline - now).unwrap();
            guard = next_guard;
            if timeout_result.timed_out() && guard.items.is_empty() && !guard.closed {
                return Err(RecvError::Timeout);
            }
        }
    }

    /// Marks the queue closed; any blocked or future `put` fails, and `get` drains whatever
    /// remains before reporting [`RecvError::Closed`].
    pub fn close(&self) {
        let mut guard = self.inner.lock().unwrap();
        guard.closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Whether the queue has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    /// Number of items currently queued.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    /// Whether the queue currently holds no items.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn watch(dir: &tempfile::TempDir) -> ObservedWatch {
        ObservedWatch::new(dir.path(), true, None).unwrap()
    }

    #[test]
    fn put_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let w = watch(&dir);
        let q = EventQueue::new(8);
        q.put(Event::file_created(PathBuf::from("a")), w.clone());
        let item = q.get(Duration::from_millis(50)).unwrap();
        assert_eq!(item.event.label(), "file_created");
    }

    #[test]
    fn adjacent_duplicates_collapse() {
        let dir = tempfile::tempdir().unwrap();
        let w = watch(&dir);
        let q = EventQueue::new(8);
        q.put(Event::file_created(PathBuf::from("a")), w.clone());
        q.put(Event::file_created(PathBuf::from("a")), w.clone());
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn non_adjacent_duplicates_are_not_collapsed() {
        let dir = tempfile::tempdir().unwrap();
        let w = watch(&dir);
        let q = EventQueue::new(8);
        q.put(Event::file_created(PathBuf::from("a")), w.clone());
        q.put(Event::file_created(PathBuf::from("b")), w.clone());
        q.put(Event::file_created(PathBuf::from("a")), w.clone());
        assert_eq!(q.len(), 3);
    }

    #[test]
    fn get_times_out_when_empty() {
        let q = EventQueue::new(8);
        let err = q.get(Duration::from_millis(20)).unwrap_err();
        assert_eq!(err, RecvError::Timeout);
    }

    #[test]
    fn closed_queue_drains_then_reports_closed() {
        let dir = tempfile::tempdir().unwrap();
        let w = watch(&dir);
        let q = EventQueue::new(8);
        q.put(Event::file_created(PathBuf::from("a")), w);
        q.close();
        assert!(q.get(Duration::from_millis(10)).is_ok());
        assert_eq!(
            q.get(Duration::from_millis(10)).unwrap_err(),
            RecvError::Closed
        );
    }

    #[test]
    fn put_blocks_until_capacity_frees_up() {
        let dir = tempfile::tempdir().unwrap();
        let w = watch(&dir);
        let q = Arc::new(EventQueue::new(1));
        q.put(Event::file_created(PathBuf::from("a")), w.clone());

        let q2 = q.clone();
        let w2 = w.clone();
        let handle = std::thread::spawn(move || {
            q2.put(Event::file_created(PathBuf::from("b")), w2);
        });

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(q.len(), 1);
        q.get(Duration::from_millis(50)).unwrap();
        handle.join().unwrap();
        assert_eq!(q.len(), 1);
    }
}
