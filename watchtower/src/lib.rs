//! `watchtower`: a cross-platform filesystem-event observation engine.
//!
//! Scheduling a path returns an [`ObservedWatch`]; attach one or more [`Handler`]s to it, then
//! call [`Observer::start`] to begin dispatching canonical events on a background thread.
//!
//! ```no_run
//! use watchtower::{recommended_observer, Config, Handler, RecursiveMode, WatchPathConfig};
//! use watchtower_types::Event;
//!
//! struct Logger;
//! impl Handler for Logger {
//!     fn on_any_event(&mut self, event: &Event) {
//!         println!("{}: {:?}", event.label(), event.paths);
//!     }
//! }
//!
//! # fn main() -> watchtower::Result<()> {
//! let observer = recommended_observer(Config::default())?;
//! let watch = observer.schedule(
//!     std::path::Path::new("."),
//!     WatchPathConfig::new(RecursiveMode::Recursive),
//! )?;
//! observer.add_handler_for_watch(&watch, Box::new(Logger))?;
//! observer.start()?;
//! # observer.stop();
//! # Ok(())
//! # }
//! ```

mod backend;
pub mod bricks;
mod channel;
mod config;
mod error;
mod handler;
mod observer;
mod queue;
mod registry;
mod snapshot;
mod watch;

pub use backend::BackendKind;
pub use config::{Config, RecursiveMode, WatchPathConfig};
pub use error::{Error, ErrorKind, Result};
pub use handler::Handler;
pub use observer::Observer;
pub use queue::{EventQueue, QueuedEvent, RecvError};
pub use registry::HandlerId;
pub use snapshot::{diff, DefaultStatProvider, EntryType, Snapshot, SnapshotEntry, StatProvider, Walker};
pub use watch::ObservedWatch;

pub use watchtower_fileid::{get_file_id, FileId};
pub use watchtower_types::{
    AccessKind, AccessMode, CreateKind, DataChange, Event, EventAttributes, EventKind,
    EventKindMask, Flag, MetadataKind, ModifyKind, RemoveKind, RenameMode,
};

/// Builds an [`Observer`] with the recommended backend for the current platform and the given
/// configuration, ready to [`Observer::schedule`] paths against.
pub fn recommended_observer(config: Config) -> Result<Observer> {
    Observer::new(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    struct Counting(Arc<AtomicUsize>);
    impl Handler for Counting {
        fn on_any_event(&mut self, _event: &Event) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn recommended_observer_builds_and_schedules() {
        let dir = tempfile::tempdir().unwrap();
        let observer =
            recommended_observer(Config::default().with_poll_interval(Duration::from_millis(20)))
                .unwrap();
        let watch = observer
            .schedule(dir.path(), WatchPathConfig::new(RecursiveMode::Recursive))
            .unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        observer
            .add_handler_for_watch(&watch, Box::new(Counting(hits.clone())))
            .unwrap();
        observer.start().unwrap();

        std::fs::write(dir.path().join("a"), b"hi").unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while hits.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(hits.load(Ordering::SeqCst) > 0);
        observer.stop();
    }
}
