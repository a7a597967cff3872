//! Portable fallback backend: periodically re-walks every watched path and diffs the result
//! against its previous snapshot.
//!
//! One thread serves every watch registered against a given `PollBackend`, sleeping for the
//! configured interval between rounds; this is what the spec calls out as the form any host
//! without a native kernel mechanism falls back to, and it is also useful deliberately (e.g.
//! network filesystems that don't deliver inotify events reliably).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::backend::{Backend, BackendKind};
use crate::config::Config;
use crate::error::Result;
use crate::queue::EventQueue;
use crate::registry::EmitterHandle;
use crate::snapshot::{diff, Snapshot, Walker};
use crate::watch::ObservedWatch;

struct PollEntry {
    watch: ObservedWatch,
    snapshot: Snapshot,
}

struct Shared {
    entries: Mutex<HashMap<u64, PollEntry>>,
    shutdown: std::sync::atomic::AtomicBool,
}

/// Snapshot-diff polling backend.
pub(crate) struct PollBackend {
    shared: Arc<Shared>,
    next_id: AtomicU64,
    thread: Option<JoinHandle<()>>,
}

struct PollEmitter {
    shared: Arc<Shared>,
    id: u64,
}

impl EmitterHandle for PollEmitter {
    fn stop(&mut self) {
        self.shared.entries.lock().unwrap().remove(&self.id);
    }
}

impl PollBackend {
    pub(crate) fn new(queue: Arc<EventQueue>, config: &Config) -> Result<Self> {
        let interval = config.poll_interval().unwrap_or(Duration::from_secs(1));
        let ignore_device = config.ignore_device();
        let shared = Arc::new(Shared {
            entries: Mutex::new(HashMap::new()),
            shutdown: std::sync::atomic::AtomicBool::new(false),
        });

        let worker_shared = shared.clone();
        let thread = std::thread::Builder::new()
            .name("watchtower-poll".into())
            .spawn(move || run(worker_shared, queue, interval, ignore_device))
            .map_err(crate::error::Error::from)?;

        Ok(Self {
            shared,
            next_id: AtomicU64::new(0),
            thread: Some(thread),
        })
    }
}

impl Drop for PollBackend {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Backend for PollBackend {
    fn watch(&self, watch: &ObservedWatch, config: &Config) -> Result<Box<dyn EmitterHandle>> {
        let snapshot = if config.emit_initial_catch_up() {
            Snapshot::empty()
        } else {
            let walker = Walker::new(config.ignore_device());
            walker.walk(watch.path(), watch.recursive())
        };
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.shared.entries.lock().unwrap().insert(
            id,
            PollEntry {
                watch: watch.clone(),
                snapshot,
            },
        );
        Ok(Box::new(PollEmitter {
            shared: self.shared.clone(),
            id,
        }))
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Poll
    }
}

fn run(shared: Arc<Shared>, queue: Arc<EventQueue>, interval: Duration, ignore_device: bool) {
    let walker = Walker::new(ignore_device);
    while !shared.shutdown.load(Ordering::SeqCst) {
        std::thread::sleep(interval);
        if shared.shutdown.load(Ordering::SeqCst) {
            break;
        }
        let watches: Vec<(u64, ObservedWatch)> = shared
            .entries
            .lock()
            .unwrap()
            .iter()
            .map(|(id, entry)| (*id, entry.watch.clone()))
            .collect();
        for (id, watch) in watches {
            let fresh = walker.walk(watch.path(), watch.recursive());
            let mut entries = shared.entries.lock().unwrap();
            let Some(entry) = entries.get_mut(&id) else {
                continue;
            };
            let events = diff(&entry.snapshot, &fresh);
            entry.snapshot = fresh;
            drop(entries);
            for event in events {
                if !queue.put(event, watch.clone()) {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::RecvError;
    use std::time::Duration as StdDuration;

    #[test]
    fn detects_a_file_created_after_the_initial_watch() {
        let dir = tempfile::tempdir().unwrap();
        let watch = ObservedWatch::new(dir.path(), true, None).unwrap();
        let queue = Arc::new(EventQueue::new(32));
        let config = Config::default().with_poll_interval(StdDuration::from_millis(20));
        let backend = PollBackend::new(queue.clone(), &config).unwrap();
        let _handle = backend.watch(&watch, &config).unwrap();

        std::fs::write(dir.path().join("a"), b"hi").unwrap();

        let item = queue.get(StdDuration::from_secs(2)).unwrap();
        assert_eq!(item.event.label(), "file_created");
    }

    #[test]
    fn first_tick_synthesizes_created_events_for_pre_existing_entries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("already-here"), b"hi").unwrap();
        let watch = ObservedWatch::new(dir.path(), true, None).unwrap();
        let queue = Arc::new(EventQueue::new(32));
        let config = Config::default().with_poll_interval(StdDuration::from_millis(20));
        let backend = PollBackend::new(queue.clone(), &config).unwrap();
        let _handle = backend.watch(&watch, &config).unwrap();

        let item = queue.get(StdDuration::from_secs(2)).unwrap();
        assert_eq!(item.event.label(), "file_created");
    }

    #[test]
    fn opting_out_of_catch_up_suppresses_events_for_pre_existing_entries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("already-here"), b"hi").unwrap();
        let watch = ObservedWatch::new(dir.path(), true, None).unwrap();
        let queue = Arc::new(EventQueue::new(32));
        let config = Config::default()
            .with_poll_interval(StdDuration::from_millis(20))
            .with_emit_initial_catch_up(false);
        let backend = PollBackend::new(queue.clone(), &config).unwrap();
        let _handle = backend.watch(&watch, &config).unwrap();

        std::thread::sleep(StdDuration::from_millis(80));
        assert_eq!(queue.get(StdDuration::from_millis(10)).unwrap_err(), RecvError::Timeout);
    }

    #[test]
    fn stopping_the_emitter_stops_further_polling_of_that_watch() {
        let dir = tempfile::tempdir().unwrap();
        let watch = ObservedWatch::new(dir.path(), true, None).unwrap();
        let queue = Arc::new(EventQueue::new(32));
        let config = Config::default().with_poll_interval(StdDuration::from_millis(20));
        let backend = PollBackend::new(queue.clone(), &config).unwrap();
        let mut handle = backend.watch(&watch, &config).unwrap();
        handle.stop();

        std::fs::write(dir.path().join("a"), b"hi").unwrap();
        std::thread::sleep(StdDuration::from_millis(100));
        assert_eq!(queue.get(StdDuration::from_millis(10)).unwrap_err(), RecvError::Timeout);
    }
}
