//! Bookkeeping of scheduled watches, their handlers, and the emitter backing each one.
//!
//! One [`ObservedWatch`] maps to exactly one live emitter; many handlers may be attached to the
//! same watch. Removing the last handler from a watch unschedules it automatically, which is
//! the registry's only self-driven side effect — everything else is plain bookkeeping invoked
//! by [`crate::Observer`].

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;

use crate::bricks::OrderedSet;
use crate::error::{Error, Result};
use crate::handler::Handler;
use crate::watch::ObservedWatch;

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Opaque identifier for a registered handler, stable for the life of its registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

/// Anything capable of tearing down the backend resources behind one watch.
///
/// Each backend adapter returns a boxed emitter handle from its `watch` call; the registry
/// only ever calls `stop` on it, once, when the watch's last handler is removed or the watch
/// is explicitly unscheduled.
pub trait EmitterHandle: Send {
    /// Tears down whatever kernel resources back this watch. Called at most once.
    fn stop(&mut self);
}

struct Registration {
    watch: ObservedWatch,
    handlers: OrderedSet<HandlerId>,
    emitter: Box<dyn EmitterHandle>,
}

/// Tracks every live `(watch, handlers, emitter)` triple.
#[derive(Default)]
pub struct WatchRegistry {
    next_id: u64,
    handlers: HashMap<HandlerId, Box<dyn Handler>>,
    by_watch: HashMap<ObservedWatch, Registration>,
}

impl WatchRegistry {
    /// Builds an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a freshly created watch and its backing emitter, with no handlers attached
    /// yet. Returns [`Error`] with [`crate::error::ErrorKind::IllegalState`] if the watch is
    /// already registered (callers are expected to check `is_watched` first).
    pub fn insert_watch(
        &mut self,
        watch: ObservedWatch,
        emitter: Box<dyn EmitterHandle>,
    ) -> Result<()> {
        if self.by_watch.contains_key(&watch) {
            return Err(Error::illegal_state("watch already registered"));
        }
        self.by_watch.insert(
            watch.clone(),
            Registration {
                watch,
                handlers: OrderedSet::new(),
                emitter,
            },
        );
        Ok(())
    }

    /// Whether `watch` currently has a live emitter.
    pub fn is_watched(&self, watch: &ObservedWatch) -> bool {
        self.by_watch.contains_key(watch)
    }

    /// Attaches `handler` to `watch`, allocating a fresh id for it.
    pub fn add_handler(&mut self, watch: &ObservedWatch, handler: Box<dyn Handler>) -> Result<HandlerId> {
        let reg = self
            .by_watch
            .get_mut(watch)
            .ok_or_else(|| Error::illegal_state("add_handler on an unregistered watch"))?;
        let id = HandlerId(self.next_id);
        self.next_id += 1;
        reg.handlers.insert(id);
        self.handlers.insert(id, handler);
        Ok(id)
    }

    /// Detaches `handler_id` from `watch`. If no handlers remain on the watch afterward, the
    /// watch's emitter is stopped and the watch is removed from the registry; the caller does
    /// not need to separately call `unschedule`. Returns whether the watch was unscheduled as a
    /// result.
    pub fn remove_handler(&mut self, watch: &ObservedWatch, handler_id: HandlerId) -> Result<bool> {
        let reg = self
            .by_watch
            .get_mut(watch)
            .ok_or_else(|| Error::illegal_state("remove_handler on an unregistered watch"))?;
        reg.handlers.remove(&handler_id);
        self.handlers.remove(&handler_id);
        if reg.handlers.is_empty() {
            self.unschedule(watch)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Unschedules `watch` unconditionally: stops its emitter, drops every attached handler,
    /// and removes it from the registry. A no-op, returning `Ok(())`, if the watch is not
    /// currently registered (matches the public API's "unwatching a dead path is not an
    /// error" contract).
    pub fn unschedule(&mut self, watch: &ObservedWatch) -> Result<()> {
        let Some(mut reg) = self.by_watch.remove(watch) else {
            return Ok(());
        };
        for id in reg.handlers.iter() {
            self.handlers.remove(id);
        }
        reg.emitter.stop();
        Ok(())
    }

    /// Unschedules every watch, in no particular order.
    pub fn unschedule_all(&mut self) {
        let watches: Vec<ObservedWatch> = self.by_watch.keys().cloned().collect();
        for watch in watches {
            let _ = self.unschedule(&watch);
        }
    }

    /// Every watch that covers `path`, most-specific (non-recursive, exact match) not
    /// distinguished from recursive ancestors — callers receive all matches and dispatch to
    /// each in turn, per the "many watches can observe one path" invariant.
    pub fn watches_covering(&self, path: &Path) -> Vec<ObservedWatch> {
        self.by_watch
            .values()
            .filter(|reg| reg.watch.covers(path))
            .map(|reg| reg.watch.clone())
            .collect()
    }

    /// The handler ids currently attached to `watch`, in attachment order.
    pub fn handler_ids(&self, watch: &ObservedWatch) -> Vec<HandlerId> {
        self.by_watch
            .get(watch)
            .map(|reg| reg.handlers.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Dispatches `event` to every handler attached to `watch`, in attachment order, skipping
    /// handlers whose watch-level event filter rejects the event's label.
    pub fn dispatch(&mut self, watch: &ObservedWatch, event: &watchtower_types::Event) {
        if !watch.accepts(event.label()) {
            return;
        }
        let ids = self.handler_ids(watch);
        for id in ids {
            if let Some(handler) = self.handlers.get_mut(&id) {
                let result = panic::catch_unwind(AssertUnwindSafe(|| handler.dispatch(event)));
                if let Err(payload) = result {
                    log::error!("handler {id:?} panicked on {}: {}", event.label(), panic_message(&payload));
                }
            }
        }
    }

    /// Total number of registered watches.
    pub fn len(&self) -> usize {
        self.by_watch.len()
    }

    /// Whether the registry has no registered watches.
    pub fn is_empty(&self) -> bool {
        self.by_watch.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct NullEmitter {
        stopped: Arc<AtomicUsize>,
    }

    impl EmitterHandle for NullEmitter {
        fn stop(&mut self) {
            self.stopped.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Counting(Arc<AtomicUsize>);
    impl Handler for Counting {
        fn on_any_event(&mut self, _event: &watchtower_types::Event) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn watch(dir: &tempfile::TempDir) -> ObservedWatch {
        ObservedWatch::new(dir.path(), true, None).unwrap()
    }

    #[test]
    fn last_handler_removal_unschedules_and_stops_emitter() {
        let dir = tempfile::tempdir().unwrap();
        let w = watch(&dir);
        let stopped = Arc::new(AtomicUsize::new(0));
        let mut reg = WatchRegistry::new();
        reg.insert_watch(w.clone(), Box::new(NullEmitter { stopped: stopped.clone() }))
            .unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let id = reg.add_handler(&w, Box::new(Counting(hits))).unwrap();

        let unscheduled = reg.remove_handler(&w, id).unwrap();
        assert!(unscheduled);
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
        assert!(!reg.is_watched(&w));
    }

    #[test]
    fn removing_one_handler_leaves_another_attached() {
        let dir = tempfile::tempdir().unwrap();
        let w = watch(&dir);
        let stopped = Arc::new(AtomicUsize::new(0));
        let mut reg = WatchRegistry::new();
        reg.insert_watch(w.clone(), Box::new(NullEmitter { stopped: stopped.clone() }))
            .unwrap();
        let hits_a = Arc::new(AtomicUsize::new(0));
        let hits_b = Arc::new(AtomicUsize::new(0));
        let id_a = reg.add_handler(&w, Box::new(Counting(hits_a.clone()))).unwrap();
        let _id_b = reg.add_handler(&w, Box::new(Counting(hits_b.clone()))).unwrap();

        let unscheduled = reg.remove_handler(&w, id_a).unwrap();
        assert!(!unscheduled);
        assert_eq!(stopped.load(Ordering::SeqCst), 0);
        assert!(reg.is_watched(&w));

        reg.dispatch(&w, &watchtower_types::Event::file_created(PathBuf::from("x")));
        assert_eq!(hits_a.load(Ordering::SeqCst), 0);
        assert_eq!(hits_b.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unschedule_on_unknown_watch_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let w = watch(&dir);
        let mut reg = WatchRegistry::new();
        assert!(reg.unschedule(&w).is_ok());
    }

    #[test]
    fn unschedule_all_stops_every_emitter() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let mut reg = WatchRegistry::new();
        let stopped = Arc::new(AtomicUsize::new(0));
        reg.insert_watch(watch(&dir_a), Box::new(NullEmitter { stopped: stopped.clone() }))
            .unwrap();
        reg.insert_watch(watch(&dir_b), Box::new(NullEmitter { stopped: stopped.clone() }))
            .unwrap();
        reg.unschedule_all();
        assert_eq!(stopped.load(Ordering::SeqCst), 2);
        assert!(reg.is_empty());
    }

    #[test]
    fn watches_covering_returns_every_matching_watch() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let mut reg = WatchRegistry::new();
        let stopped = Arc::new(AtomicUsize::new(0));
        let w = watch(&dir);
        reg.insert_watch(w.clone(), Box::new(NullEmitter { stopped })).unwrap();
        let nested = dir.path().join("sub").join("f");
        assert_eq!(reg.watches_covering(&nested), vec![w]);
    }

    struct Panicking;
    impl Handler for Panicking {
        fn on_any_event(&mut self, _event: &watchtower_types::Event) {
            panic!("handler blew up");
        }
    }

    #[test]
    fn a_panicking_handler_does_not_stop_dispatch_to_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let w = watch(&dir);
        let stopped = Arc::new(AtomicUsize::new(0));
        let mut reg = WatchRegistry::new();
        reg.insert_watch(w.clone(), Box::new(NullEmitter { stopped })).unwrap();
        reg.add_handler(&w, Box::new(Panicking)).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        reg.add_handler(&w, Box::new(Counting(hits.clone()))).unwrap();

        reg.dispatch(&w, &watchtower_types::Event::file_created(PathBuf::from("x")));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dispatch_respects_watch_level_event_filter() {
        let dir = tempfile::tempdir().unwrap();
        let filtered =
            ObservedWatch::new(dir.path(), true, Some(vec!["file_deleted"])).unwrap();
        let mut reg = WatchRegistry::new();
        let stopped = Arc::new(AtomicUsize::new(0));
        reg.insert_watch(filtered.clone(), Box::new(NullEmitter { stopped }))
            .unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        reg.add_handler(&filtered, Box::new(Counting(hits.clone()))).unwrap();

        reg.dispatch(&filtered, &watchtower_types::Event::file_created(PathBuf::from("x")));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        reg.dispatch(&filtered, &watchtower_types::Event::file_deleted(PathBuf::from("x")));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
