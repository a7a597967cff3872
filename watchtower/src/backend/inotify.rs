//! Linux backend built on inotify.
//!
//! One event loop thread per [`InotifyBackend`] owns the inotify file descriptor and drives a
//! `mio::Poll` with two sources: the descriptor itself, and a waker used to deliver
//! `AddWatch`/`RemoveWatch`/`Shutdown` messages from other threads. `MOVED_FROM`/`MOVED_TO`
//! pairs sharing a cookie are joined into a single move event; a lone `MOVED_FROM` is held in a
//! [`DelayedQueue`] for `move_pairing_window` before being re-emitted as a plain deletion (a
//! cross-filesystem move, or a move whose destination falls outside every watched tree, never
//! produces a `MOVED_TO` at all).

use std::collections::HashMap;
use std::ffi::OsStr;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use inotify::{EventMask, Inotify, WatchDescriptor, WatchMask};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use watchtower_types::{Event, EventKindMask, Flag};

use crate::backend::{Backend, BackendKind};
use crate::bricks::DelayedQueue;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::queue::EventQueue;
use crate::registry::EmitterHandle;
use crate::snapshot::{diff, Snapshot, Walker};
use crate::watch::ObservedWatch;

const INOTIFY_TOKEN: Token = Token(0);
const WAKE_TOKEN: Token = Token(1);

/// Converts the engine's [`EventKindMask`] into the corresponding inotify watch mask.
///
/// Recursive watches always include `CREATE | MOVED_TO` regardless of the requested mask, so
/// new subdirectories can be discovered and watched as they appear.
fn event_kind_mask_to_watch_mask(mask: EventKindMask, is_recursive: bool) -> WatchMask {
    let mut watch_mask = WatchMask::empty();

    if is_recursive {
        watch_mask |= WatchMask::CREATE | WatchMask::MOVED_TO;
    }
    if mask.intersects(EventKindMask::CREATE) {
        watch_mask |= WatchMask::CREATE | WatchMask::MOVED_TO;
    }
    if mask.intersects(EventKindMask::REMOVE) {
        watch_mask |= WatchMask::DELETE | WatchMask::MOVED_FROM;
    }
    if mask.intersects(EventKindMask::MODIFY_DATA) {
        watch_mask |= WatchMask::MODIFY;
    }
    if mask.intersects(EventKindMask::MODIFY_META) {
        watch_mask |= WatchMask::ATTRIB;
    }
    if mask.intersects(EventKindMask::MODIFY_NAME) {
        watch_mask |= WatchMask::MOVE_SELF;
    }
    if mask.intersects(EventKindMask::ACCESS_OPEN) {
        watch_mask |= WatchMask::OPEN;
    }
    if mask.intersects(EventKindMask::ACCESS_CLOSE) {
        watch_mask |= WatchMask::CLOSE_WRITE;
    }
    if mask.intersects(EventKindMask::ACCESS_CLOSE_NOWRITE) {
        watch_mask |= WatchMask::CLOSE_NOWRITE;
    }

    watch_mask
}

struct WatchState {
    descriptor: WatchDescriptor,
    root: PathBuf,
    recursive: bool,
    observed: ObservedWatch,
}

enum Msg {
    Add(ObservedWatch, Config),
    Remove(PathBuf),
    Shutdown,
}

struct EventLoop {
    inotify: Inotify,
    queue: Arc<EventQueue>,
    rx: crate::channel::Receiver<Msg>,
    waker: Arc<Waker>,
    poll: Poll,
    /// Every directory-level watch, keyed by the descriptor inotify hands back.
    by_descriptor: HashMap<WatchDescriptor, WatchState>,
    by_path: HashMap<PathBuf, WatchDescriptor>,
    event_kind_mask: EventKindMask,
    pending_moves: DelayedQueue<(u32, PathBuf)>,
    move_pairing_window: Duration,
}

impl EventLoop {
    fn run(mut self) {
        let mut events = Events::with_capacity(128);
        loop {
            let timeout = self
                .pending_moves
                .next_deadline()
                .unwrap_or(Duration::from_millis(250));
            if let Err(err) = self.poll.poll(&mut events, Some(timeout)) {
                log::warn!("inotify poll failed: {err}");
                continue;
            }

            let mut should_stop = false;
            for event in &events {
                match event.token() {
                    WAKE_TOKEN => {
                        while let Ok(msg) = self.rx.try_recv() {
                            if self.handle_message(msg) {
                                should_stop = true;
                            }
                        }
                    }
                    INOTIFY_TOKEN => self.drain_inotify(),
                    _ => {}
                }
            }
            self.flush_expired_moves();
            if should_stop {
                return;
            }
        }
    }

    fn handle_message(&mut self, msg: Msg) -> bool {
        match msg {
            Msg::Add(watch, config) => {
                if let Err(err) = self.add_watch(&watch, &config) {
                    log::warn!("failed to add inotify watch for {}: {err}", watch.path().display());
                }
                false
            }
            Msg::Remove(path) => {
                self.remove_watch(&path);
                false
            }
            Msg::Shutdown => true,
        }
    }

    fn add_watch(&mut self, watch: &ObservedWatch, config: &Config) -> Result<()> {
        self.event_kind_mask = config.event_kinds();
        self.move_pairing_window = config.move_pairing_window();
        self.add_watch_recursive(watch.path(), watch, config)
    }

    fn add_watch_recursive(
        &mut self,
        root: &Path,
        watch: &ObservedWatch,
        config: &Config,
    ) -> Result<()> {
        self.add_single_watch(root, watch, config)?;
        if watch.recursive() && root.is_dir() {
            for entry in walkdir::WalkDir::new(root)
                .min_depth(1)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_dir())
            {
                self.add_single_watch(entry.path(), watch, config)?;
            }
        }
        Ok(())
    }

    fn add_single_watch(&mut self, dir: &Path, watch: &ObservedWatch, config: &Config) -> Result<()> {
        if self.by_path.contains_key(dir) {
            return Ok(());
        }
        let mask = event_kind_mask_to_watch_mask(config.event_kinds(), watch.recursive())
            | WatchMask::DELETE_SELF
            | WatchMask::MOVE_SELF;
        let descriptor = self
            .inotify
            .watches()
            .add(dir, mask)
            .map_err(|err| Error::from(err).add_path(dir.to_path_buf()))?;
        self.by_path.insert(dir.to_path_buf(), descriptor.clone());
        self.by_descriptor.insert(
            descriptor.clone(),
            WatchState {
                descriptor,
                root: dir.to_path_buf(),
                recursive: watch.recursive(),
                observed: watch.clone(),
            },
        );
        Ok(())
    }

    fn remove_watch(&mut self, root: &Path) {
        let doomed: Vec<PathBuf> = self
            .by_path
            .keys()
            .filter(|p| p.starts_with(root))
            .cloned()
            .collect();
        for path in doomed {
            if let Some(descriptor) = self.by_path.remove(&path) {
                let _ = self.inotify.watches().remove(descriptor.clone());
                self.by_descriptor.remove(&descriptor);
            }
        }
    }

    fn drain_inotify(&mut self) {
        let mut buffer = [0u8; 4096];
        let raw_events: Vec<_> = match self.inotify.read_events(&mut buffer) {
            Ok(events) => events.collect(),
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => return,
            Err(err) => {
                log::warn!("inotify read failed: {err}");
                return;
            }
        };

        for raw in raw_events {
            self.handle_raw_event(raw);
        }
    }

    fn handle_raw_event(&mut self, raw: inotify::Event<&OsStr>) {
        // The kernel dropped events because our read loop fell behind; wd carries no useful
        // descriptor for this one (it's usually -1), so this has to be checked before the
        // by_descriptor lookup below would otherwise silently discard it.
        if raw.mask.contains(EventMask::Q_OVERFLOW) {
            self.resync_all();
            return;
        }

        let Some(state) = self.by_descriptor.get(&raw.wd) else {
            return;
        };
        let root = state.root.clone();
        let recursive = state.recursive;
        let observed = state.observed.clone();
        let is_dir = raw.mask.contains(EventMask::ISDIR);
        let name = raw.name.map(PathBuf::from);
        let path = match &name {
            Some(name) => root.join(name),
            None => root.clone(),
        };

        if raw.mask.contains(EventMask::DELETE_SELF) {
            let is_root = observed.path() == root;
            let mut event = Event::dir_deleted(root.clone());
            if is_root {
                event = event.set_flag(Flag::EmitterStopped);
                self.remove_watch(&root);
            } else {
                self.by_path.remove(&root);
                self.by_descriptor.remove(&raw.wd);
            }
            self.queue.put(event, observed);
            return;
        }

        if raw.mask.contains(EventMask::MOVED_FROM) {
            if let Some(name) = &name {
                self.pending_moves
                    .push((raw.cookie, root.join(name)), self.move_pairing_window);
            }
            return;
        }

        if raw.mask.contains(EventMask::MOVED_TO) {
            let from = self
                .pending_moves
                .remove_matching(|(cookie, _)| *cookie == raw.cookie)
                .map(|(_, from_path)| from_path);
            let event = match (from, is_dir) {
                (Some(from), true) => Event::dir_moved(from, path.clone()),
                (Some(from), false) => Event::file_moved(from, path.clone()),
                (None, true) => Event::dir_created(path.clone()),
                (None, false) => Event::file_created(path.clone()),
            };
            self.emit(event, &observed, is_dir, recursive, &path, &root);
            return;
        }

        let event = if raw.mask.contains(EventMask::CREATE) {
            if is_dir {
                Event::dir_created(path.clone())
            } else {
                Event::file_created(path.clone())
            }
        } else if raw.mask.contains(EventMask::DELETE) {
            if is_dir {
                Event::dir_deleted(path.clone())
            } else {
                Event::file_deleted(path.clone())
            }
        } else if raw.mask.contains(EventMask::MODIFY) {
            Event::file_modified(path.clone())
        } else if raw.mask.contains(EventMask::ATTRIB) {
            if is_dir {
                Event::dir_modified(path.clone())
            } else {
                Event::file_modified(path.clone())
            }
        } else if raw.mask.contains(EventMask::OPEN) {
            Event::file_opened(path.clone())
        } else if raw.mask.contains(EventMask::CLOSE_WRITE) {
            Event::file_closed(path.clone())
        } else if raw.mask.contains(EventMask::CLOSE_NOWRITE) {
            Event::file_closed_no_write(path.clone())
        } else {
            return;
        };

        self.emit(event, &observed, is_dir, recursive, &path, &root);
    }

    fn emit(
        &mut self,
        event: Event,
        observed: &ObservedWatch,
        is_dir: bool,
        recursive: bool,
        path: &Path,
        watch_root: &Path,
    ) {
        self.queue.put(event, observed.clone());

        if is_dir && recursive && path.is_dir() {
            let dummy_config = Config::default().with_event_kinds(self.event_kind_mask);
            if let Err(err) = self.add_single_watch(path, observed, &dummy_config) {
                log::debug!("could not watch newly created directory {}: {err}", path.display());
            }
            // A directory can arrive already populated if it was moved in, or if files were
            // written into it before this watch existed; replay its contents as creations.
            for entry in Walker::new(true).walk(path, true).entries() {
                let synthetic = if entry.entry_type == crate::snapshot::EntryType::Directory {
                    Event::dir_created(entry.path.clone())
                } else {
                    Event::file_created(entry.path.clone())
                }
                .set_synthetic(true);
                self.queue.put(synthetic, observed.clone());
            }
        }
        let _ = watch_root;
    }

    /// Handles `IN_Q_OVERFLOW`: the kernel may have dropped an unknown number of events, so
    /// in-memory state for every watched root is no longer trustworthy. Signals each watch with
    /// a [`Flag::Rescan`]-flagged event, then replays its current contents as creations, the
    /// same catch-up a fresh [`crate::backend::poll::PollBackend`] watch performs.
    fn resync_all(&mut self) {
        let mut roots: Vec<(PathBuf, bool, ObservedWatch)> = self
            .by_descriptor
            .values()
            .filter(|state| state.observed.path() == state.root)
            .map(|state| (state.root.clone(), state.recursive, state.observed.clone()))
            .collect();
        roots.sort_by(|a, b| a.0.cmp(&b.0));
        roots.dedup_by(|a, b| a.0 == b.0);

        for (root, recursive, observed) in roots {
            log::warn!("inotify queue overflowed; resynchronizing watch on {}", root.display());
            self.queue.put(
                Event::new(watchtower_types::EventKind::Other)
                    .add_path(root.clone())
                    .set_flag(Flag::Rescan),
                observed.clone(),
            );
            let fresh = Walker::new(true).walk(&root, recursive);
            for event in diff(&Snapshot::empty(), &fresh) {
                self.queue.put(event, observed.clone());
            }
        }
    }

    fn flush_expired_moves(&mut self) {
        for (_, from_path) in self.pending_moves.drain_ready() {
            let event = if from_path.is_dir() {
                Event::dir_deleted(from_path)
            } else {
                Event::file_deleted(from_path)
            };
            if let Some(state) = self.by_descriptor.values().find(|s| from_path_under(&s.root, &event)) {
                self.queue.put(event, state.observed.clone());
            }
        }
    }
}

fn from_path_under(root: &Path, event: &Event) -> bool {
    event.paths.first().map(|p| p.starts_with(root)).unwrap_or(false)
}

fn set_nonblocking(fd: std::os::unix::io::RawFd) -> std::io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error());
    }
    let result = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if result < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

struct InotifyEmitter {
    tx: crate::channel::Sender<Msg>,
    waker: Arc<Waker>,
    path: PathBuf,
}

impl EmitterHandle for InotifyEmitter {
    fn stop(&mut self) {
        let _ = self.tx.send(Msg::Remove(self.path.clone()));
        let _ = self.waker.wake();
    }
}

/// inotify-backed backend.
pub(crate) struct InotifyBackend {
    tx: crate::channel::Sender<Msg>,
    waker: Arc<Waker>,
    thread: Option<JoinHandle<()>>,
    watch_count: Arc<AtomicUsize>,
}

impl InotifyBackend {
    pub(crate) fn new(queue: Arc<EventQueue>, config: &Config) -> Result<Self> {
        let inotify = Inotify::init().map_err(Error::from)?;
        set_nonblocking(inotify.as_raw_fd()).map_err(Error::from)?;
        let poll = Poll::new().map_err(Error::from)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN).map_err(Error::from)?);
        poll.registry()
            .register(
                &mut SourceFd(&inotify.as_raw_fd()),
                INOTIFY_TOKEN,
                Interest::READABLE,
            )
            .map_err(Error::from)?;

        let (tx, rx) = crate::channel::unbounded();
        let event_loop = EventLoop {
            inotify,
            queue,
            rx,
            waker: waker.clone(),
            poll,
            by_descriptor: HashMap::new(),
            by_path: HashMap::new(),
            event_kind_mask: config.event_kinds(),
            pending_moves: DelayedQueue::new(),
            move_pairing_window: config.move_pairing_window(),
        };
        let thread = std::thread::Builder::new()
            .name("watchtower-inotify".into())
            .spawn(move || event_loop.run())
            .map_err(Error::from)?;

        Ok(Self {
            tx,
            waker,
            thread: Some(thread),
            watch_count: Arc::new(AtomicUsize::new(0)),
        })
    }
}

impl Drop for InotifyBackend {
    fn drop(&mut self) {
        let _ = self.tx.send(Msg::Shutdown);
        let _ = self.waker.wake();
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Backend for InotifyBackend {
    fn watch(&self, watch: &ObservedWatch, config: &Config) -> Result<Box<dyn EmitterHandle>> {
        self.watch_count.fetch_add(1, Ordering::SeqCst);
        self.tx
            .send(Msg::Add(watch.clone(), config.clone()))
            .map_err(|_| Error::illegal_state("inotify event loop has shut down"))?;
        let _ = self.waker.wake();
        Ok(Box::new(InotifyEmitter {
            tx: self.tx.clone(),
            waker: self.waker.clone(),
            path: watch.path().to_path_buf(),
        }))
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Inotify
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recursive_mask_always_includes_create_and_moved_to() {
        let mask = event_kind_mask_to_watch_mask(EventKindMask::empty(), true);
        assert!(mask.contains(WatchMask::CREATE));
        assert!(mask.contains(WatchMask::MOVED_TO));
    }

    #[test]
    fn core_mask_excludes_access_events() {
        let mask = event_kind_mask_to_watch_mask(EventKindMask::CORE, false);
        assert!(!mask.contains(WatchMask::OPEN));
        assert!(!mask.contains(WatchMask::CLOSE_WRITE));
        assert!(!mask.contains(WatchMask::CLOSE_NOWRITE));
        assert!(mask.contains(WatchMask::CREATE));
        assert!(mask.contains(WatchMask::MODIFY));
    }

    #[test]
    fn all_access_mask_includes_every_close_variant() {
        let mask = event_kind_mask_to_watch_mask(EventKindMask::ALL_ACCESS, false);
        assert!(mask.contains(WatchMask::OPEN));
        assert!(mask.contains(WatchMask::CLOSE_WRITE));
        assert!(mask.contains(WatchMask::CLOSE_NOWRITE));
    }

    #[test]
    fn deleting_the_watched_root_stops_the_emitter() {
        let dir = tempfile::tempdir().unwrap();
        let watch = ObservedWatch::new(dir.path(), true, None).unwrap();
        let queue = Arc::new(EventQueue::new(32));
        let config = Config::default();
        let backend = InotifyBackend::new(queue.clone(), &config).unwrap();
        let _handle = backend.watch(&watch, &config).unwrap();
        std::thread::sleep(Duration::from_millis(50));

        std::fs::remove_dir(dir.path()).unwrap();

        let item = queue.get(Duration::from_secs(2)).unwrap();
        assert_eq!(item.event.label(), "dir_deleted");
        assert_eq!(item.event.flag(), Some(Flag::EmitterStopped));
    }

    #[test]
    fn deleting_a_nested_watched_directory_does_not_stop_the_emitter() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        let watch = ObservedWatch::new(dir.path(), true, None).unwrap();
        let queue = Arc::new(EventQueue::new(32));
        let config = Config::default();
        let backend = InotifyBackend::new(queue.clone(), &config).unwrap();
        let _handle = backend.watch(&watch, &config).unwrap();
        std::thread::sleep(Duration::from_millis(50));

        std::fs::remove_dir(&sub).unwrap();

        let item = queue.get(Duration::from_secs(2)).unwrap();
        assert_eq!(item.event.label(), "dir_deleted");
        assert_eq!(item.event.flag(), None);

        // the root is still alive, so further activity on it is still reported
        std::fs::write(dir.path().join("a"), b"hi").unwrap();
        let item = queue.get(Duration::from_secs(2)).unwrap();
        assert_eq!(item.event.label(), "file_created");
    }
}
