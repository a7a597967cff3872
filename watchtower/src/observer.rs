//! The Observer: the public entry point tying together watch registration, the selected
//! backend, and the single dispatcher thread that drains the shared [`EventQueue`].
//!
//! Scheduling a path is synchronous and side-effecting (it talks to the backend right away);
//! dispatch is asynchronous and only begins once [`Observer::start`] is called, mirroring the
//! teacher's own separation between `watch()` (immediate) and the background thread that
//! actually delivers events.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::backend::{self, Backend, BackendKind};
use crate::config::{Config, WatchPathConfig};
use crate::error::{Error, Result};
use crate::handler::Handler;
use crate::queue::{EventQueue, RecvError};
use crate::registry::{HandlerId, WatchRegistry};
use crate::watch::ObservedWatch;

/// How long the dispatcher waits on an empty queue before checking whether it should stop.
const DISPATCH_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Default capacity of the shared event queue.
const DEFAULT_QUEUE_CAPACITY: usize = 4096;

/// Owns one backend instance, the watch registry, and (once started) the dispatcher thread.
pub struct Observer {
    config: Config,
    backend: Box<dyn Backend>,
    registry: Arc<Mutex<WatchRegistry>>,
    queue: Arc<EventQueue>,
    running: Arc<AtomicBool>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Observer {
    /// Builds an observer with the platform's recommended backend, ready to schedule watches.
    /// Dispatch does not begin until [`Observer::start`] is called.
    pub fn new(config: Config) -> Result<Self> {
        let queue = Arc::new(EventQueue::new(DEFAULT_QUEUE_CAPACITY));
        let backend = backend::recommended(queue.clone(), &config)?;
        Ok(Self {
            config,
            backend,
            registry: Arc::new(Mutex::new(WatchRegistry::new())),
            queue,
            running: Arc::new(AtomicBool::new(false)),
            dispatcher: Mutex::new(None),
        })
    }

    /// Which backend this observer is driving.
    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    /// The configuration this observer was built with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Registers `path` with the backend under the given per-watch configuration, returning a
    /// handle usable with [`Observer::add_handler_for_watch`]. Scheduling the same
    /// `(path, recursive_mode)` pair twice returns the existing watch rather than starting a
    /// second emitter.
    pub fn schedule(&self, path: &Path, watch_config: WatchPathConfig) -> Result<ObservedWatch> {
        let watch = ObservedWatch::new(
            path,
            watch_config.recursive_mode().is_recursive(),
            watch_config.event_filter().map(|f| f.to_vec()),
        )?;

        let mut registry = self.registry.lock().unwrap();
        if registry.is_watched(&watch) {
            return Ok(watch);
        }
        let emitter = self.backend.watch(&watch, &self.config)?;
        registry.insert_watch(watch.clone(), emitter)?;
        Ok(watch)
    }

    /// Unschedules `watch` unconditionally, stopping its emitter and dropping every handler
    /// attached to it. A no-op if the watch is not currently registered.
    pub fn unschedule(&self, watch: &ObservedWatch) -> Result<()> {
        self.registry.lock().unwrap().unschedule(watch)
    }

    /// Unschedules every watch.
    pub fn unschedule_all(&self) {
        self.registry.lock().unwrap().unschedule_all();
    }

    /// Attaches `handler` to `watch`, returning an id usable with
    /// [`Observer::remove_handler_for_watch`].
    pub fn add_handler_for_watch(
        &self,
        watch: &ObservedWatch,
        handler: Box<dyn Handler>,
    ) -> Result<HandlerId> {
        self.registry.lock().unwrap().add_handler(watch, handler)
    }

    /// Detaches `handler_id` from `watch`. If it was the last handler on that watch, the watch
    /// is unscheduled and `Ok(true)` is returned.
    pub fn remove_handler_for_watch(
        &self,
        watch: &ObservedWatch,
        handler_id: HandlerId,
    ) -> Result<bool> {
        self.registry
            .lock()
            .unwrap()
            .remove_handler(watch, handler_id)
    }

    /// Every watch currently covering `path`.
    pub fn watches_covering(&self, path: &Path) -> Vec<ObservedWatch> {
        self.registry.lock().unwrap().watches_covering(path)
    }

    /// Starts the dispatcher thread. Calling `start` twice without an intervening `stop` is a
    /// no-op; the existing thread keeps running.
    pub fn start(&self) -> Result<()> {
        let mut slot = self.dispatcher.lock().unwrap();
        if slot.is_some() {
            return Ok(());
        }
        self.running.store(true, Ordering::SeqCst);

        let registry = self.registry.clone();
        let queue = self.queue.clone();
        let running = self.running.clone();
        let handle = std::thread::Builder::new()
            .name("watchtower-dispatch".into())
            .spawn(move || dispatch_loop(registry, queue, running))
            .map_err(Error::from)?;
        *slot = Some(handle);
        Ok(())
    }

    /// Stops the dispatcher thread, unschedules every watch, and waits for the thread to exit.
    /// Idempotent: calling `stop` when nothing is running is a no-op.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.queue.close();
        self.unschedule_all();
        self.join();
    }

    /// Blocks until the dispatcher thread exits, without requesting it to stop. Returns
    /// immediately if the dispatcher was never started or has already exited.
    pub fn join(&self) {
        let handle = self.dispatcher.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    /// Whether the dispatcher thread is currently running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for Observer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn dispatch_loop(registry: Arc<Mutex<WatchRegistry>>, queue: Arc<EventQueue>, running: Arc<AtomicBool>) {
    while running.load(Ordering::SeqCst) {
        match queue.get(DISPATCH_POLL_INTERVAL) {
            Ok(item) => {
                let stopped = item.event.flag() == Some(watchtower_types::Flag::EmitterStopped);
                registry.lock().unwrap().dispatch(&item.watch, &item.event);
                // The backend already tore down its own resources; this just drops the
                // now-dead watch from the registry's bookkeeping so it stops showing up as
                // scheduled.
                if stopped {
                    let _ = registry.lock().unwrap().unschedule(&item.watch);
                }
            }
            Err(RecvError::Timeout) => continue,
            Err(RecvError::Closed) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RecursiveMode;
    use std::sync::atomic::AtomicUsize;

    struct Counting(Arc<AtomicUsize>);
    impl Handler for Counting {
        fn on_any_event(&mut self, _event: &watchtower_types::Event) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn scheduling_the_same_path_twice_reuses_the_watch() {
        let dir = tempfile::tempdir().unwrap();
        let observer = Observer::new(Config::default().with_manual_polling()).unwrap();
        let a = observer
            .schedule(dir.path(), WatchPathConfig::new(RecursiveMode::Recursive))
            .unwrap();
        let b = observer
            .schedule(dir.path(), WatchPathConfig::new(RecursiveMode::Recursive))
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(observer.watches_covering(dir.path()).len(), 1);
    }

    #[test]
    fn end_to_end_dispatch_sees_a_file_creation() {
        let dir = tempfile::tempdir().unwrap();
        let observer = Observer::new(
            Config::default().with_poll_interval(Duration::from_millis(20)),
        )
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

    #[test]
    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn root_deletion_unschedules_the_watch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_path_buf();
        let observer = Observer::new(
            Config::default().with_poll_interval(Duration::from_millis(20)),
        )
        .unwrap();
        let watch = observer
            .schedule(&path, WatchPathConfig::new(RecursiveMode::Recursive))
            .unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        observer
            .add_handler_for_watch(&watch, Box::new(Counting(hits.clone())))
            .unwrap();
        observer.start().unwrap();

        drop(dir);

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !observer.watches_covering(&path).is_empty() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(observer.watches_covering(&path).is_empty());
        observer.stop();
    }

    #[test]
    fn stop_is_idempotent() {
        let observer = Observer::new(Config::default().with_manual_polling()).unwrap();
        observer.start().unwrap();
        observer.stop();
        observer.stop();
    }
}
