//! macOS/BSD backend built on kqueue's `EVFILT_VNODE` filter.
//!
//! kqueue only watches file descriptors it already has open, so recursive coverage means
//! opening one descriptor per file and directory under a root and re-scanning on every
//! `NOTE_WRITE` against a directory to discover what's new. One event loop thread per
//! [`KqueueBackend`] owns the `kqueue::Watcher` and drives a `mio::Poll` with two sources: the
//! kqueue descriptor itself, and a waker used to deliver `Add`/`Remove`/`Shutdown` messages
//! from other threads.
//!
//! kqueue never reports the new name of a renamed entry, only that the watched path is gone;
//! the inode number cached at watch time and a listing of the parent directory are what let us
//! tell a rename-within-the-subtree from a move-or-delete. Watching one descriptor per entry
//! also means recursive trees can exhaust the process's open-file limit, so every new watch is
//! checked against `RLIMIT_NOFILE` before the `open` is attempted.

use std::collections::HashMap;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;

use kqueue::{EventData, EventFilter, FilterFlag, Ident};
use mio::{Events, Interest, Poll, Token, Waker};
use watchtower_fileid::FileId;
use watchtower_types::{CreateKind, DataChange, Event, MetadataKind, ModifyKind, RemoveKind};

use crate::backend::{Backend, BackendKind};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::queue::EventQueue;
use crate::registry::EmitterHandle;
use crate::watch::ObservedWatch;

const KQUEUE_TOKEN: Token = Token(0);
const WAKE_TOKEN: Token = Token(1);

/// Descriptors kqueue itself and the mio waker hold open, reserved out of `RLIMIT_NOFILE` so
/// the accounting below never tries to watch right up to the edge of the limit.
const RESERVED_DESCRIPTORS: u64 = 4;

/// The process's current `RLIMIT_NOFILE` soft limit, or a conservative fallback if it can't be
/// read.
fn nofile_limit() -> u64 {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    let rc = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) };
    if rc == 0 {
        limit.rlim_cur as u64
    } else {
        1024
    }
}

fn filter_flags() -> FilterFlag {
    FilterFlag::NOTE_DELETE
        | FilterFlag::NOTE_WRITE
        | FilterFlag::NOTE_EXTEND
        | FilterFlag::NOTE_ATTRIB
        | FilterFlag::NOTE_LINK
        | FilterFlag::NOTE_RENAME
        | FilterFlag::NOTE_REVOKE
}

/// Finds a renamed entry's new location by scanning its (former) parent directory for the
/// cached inode. `None` means it landed outside `parent`, or the parent is gone too.
fn resolve_renamed_path(old_path: &Path, file_id: Option<FileId>) -> Option<PathBuf> {
    let parent = old_path.parent()?;
    let file_id = file_id?;
    std::fs::read_dir(parent)
        .ok()?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .find(|candidate| watchtower_fileid::get_file_id(candidate).ok() == Some(file_id))
}

enum Msg {
    Add(ObservedWatch),
    Remove(PathBuf),
    Shutdown,
}

/// Bookkeeping kept for every path we hold a kqueue descriptor on.
#[derive(Clone)]
struct WatchedPath {
    owner: ObservedWatch,
    recursive: bool,
    is_dir: bool,
    /// Cached at watch time; a rename leaves nothing at `path` to stat anymore, so this is the
    /// only way to recognize the entry by inode once it resurfaces under a new name.
    file_id: Option<FileId>,
}

struct EventLoop {
    kqueue: kqueue::Watcher,
    queue: Arc<EventQueue>,
    rx: crate::channel::Receiver<Msg>,
    waker: Arc<Waker>,
    poll: Poll,
    /// Every watched path, directory or file.
    watches: HashMap<PathBuf, WatchedPath>,
    descriptor_limit: u64,
}

impl EventLoop {
    fn run(mut self) {
        let mut events = Events::with_capacity(16);
        loop {
            if let Err(err) = self.poll.poll(&mut events, None) {
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                log::warn!("kqueue poll failed: {err}");
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
                    KQUEUE_TOKEN => self.drain_kqueue(),
                    _ => {}
                }
            }
            if should_stop {
                return;
            }
        }
    }

    fn handle_message(&mut self, msg: Msg) -> bool {
        match msg {
            Msg::Add(watch) => {
                if let Err(err) = self.add_watch(watch.path(), &watch, watch.recursive()) {
                    log::warn!("failed to add kqueue watch for {}: {err}", watch.path().display());
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

    fn add_watch(&mut self, path: &Path, owner: &ObservedWatch, is_recursive: bool) -> Result<()> {
        if !is_recursive || !path.is_dir() {
            self.add_single_watch(path, owner, is_recursive)?;
        } else {
            for entry in walkdir::WalkDir::new(path)
                .follow_links(false)
                .into_iter()
                .filter_map(|e| e.ok())
            {
                self.add_single_watch(entry.path(), owner, is_recursive)?;
            }
        }
        self.kqueue.watch().map_err(Error::from)?;
        Ok(())
    }

    fn add_single_watch(&mut self, path: &Path, owner: &ObservedWatch, is_recursive: bool) -> Result<()> {
        if self.watches.contains_key(path) {
            return Ok(());
        }
        if self.watches.len() as u64 + RESERVED_DESCRIPTORS >= self.descriptor_limit {
            log::warn!(
                "open file descriptor limit ({}) reached; not watching {}",
                self.descriptor_limit,
                path.display()
            );
            self.queue.put(
                Event::new(watchtower_types::EventKind::Other)
                    .set_info("descriptor limit reached; directory not watched")
                    .add_path(path.to_path_buf()),
                owner.clone(),
            );
            return Ok(());
        }
        self.kqueue
            .add_filename(path, EventFilter::EVFILT_VNODE, filter_flags())
            .map_err(|err| Error::from(err).add_path(path.to_path_buf()))?;
        let is_dir = std::fs::metadata(path).map(|m| m.is_dir()).unwrap_or(false);
        let file_id = watchtower_fileid::get_file_id(path).ok();
        self.watches.insert(
            path.to_path_buf(),
            WatchedPath {
                owner: owner.clone(),
                recursive: is_recursive,
                is_dir,
                file_id,
            },
        );
        Ok(())
    }

    fn remove_watch(&mut self, root: &Path) {
        let doomed: Vec<PathBuf> = self
            .watches
            .keys()
            .filter(|p| p.starts_with(root))
            .cloned()
            .collect();
        for path in doomed {
            self.watches.remove(&path);
            let _ = self.kqueue.remove_filename(&path, EventFilter::EVFILT_VNODE);
        }
        let _ = self.kqueue.watch();
    }

    fn drain_kqueue(&mut self) {
        let mut add_paths = Vec::new();
        let mut remove_paths = Vec::new();

        while let Some(raw) = self.kqueue.poll(Some(std::time::Duration::ZERO)) {
            let kqueue::Event {
                data: EventData::Vnode(vnode),
                ident: Ident::Filename(_, name),
            } = raw
            else {
                continue;
            };
            let path = PathBuf::from(name);
            let Some(watched) = self.watches.get(&path).cloned() else {
                continue;
            };
            let WatchedPath {
                owner,
                recursive,
                is_dir: cached_is_dir,
                file_id,
            } = watched;

            // The path may no longer exist (deleted, or renamed away); fall back to the
            // directory-ness cached when the watch was established.
            let is_dir = std::fs::metadata(&path)
                .map(|m| m.is_dir())
                .unwrap_or(cached_is_dir);
            let event = match vnode {
                kqueue::Vnode::Delete => {
                    remove_paths.push(path.clone());
                    Some(
                        Event::new(watchtower_types::EventKind::Remove(if is_dir {
                            RemoveKind::Folder
                        } else {
                            RemoveKind::File
                        }))
                        .add_path(path.clone())
                        .set_directory(is_dir),
                    )
                }
                kqueue::Vnode::Write if is_dir => {
                    self.diff_directory(&path, &owner, recursive, &mut add_paths)
                }
                kqueue::Vnode::Write => Some(
                    Event::new(watchtower_types::EventKind::Modify(ModifyKind::Data(
                        DataChange::Any,
                    )))
                    .add_path(path.clone()),
                ),
                kqueue::Vnode::Extend | kqueue::Vnode::Truncate => Some(
                    Event::new(watchtower_types::EventKind::Modify(ModifyKind::Data(
                        DataChange::Size,
                    )))
                    .add_path(path.clone()),
                ),
                kqueue::Vnode::Attrib => Some(
                    Event::new(watchtower_types::EventKind::Modify(ModifyKind::Metadata(
                        MetadataKind::Any,
                    )))
                    .add_path(path.clone())
                    .set_directory(is_dir),
                ),
                // The link count changed: a subdirectory was created or removed under a
                // watched directory. We can't tell which without a diff, so drop and re-walk.
                kqueue::Vnode::Link => {
                    remove_paths.push(path.clone());
                    add_paths.push(path.clone());
                    Some(
                        Event::new(watchtower_types::EventKind::Modify(ModifyKind::Any))
                            .add_path(path.clone())
                            .set_directory(true),
                    )
                }
                // kqueue never tells us the new name; resolve it by looking for the cached
                // inode in what used to be the entry's parent directory.
                kqueue::Vnode::Rename => {
                    remove_paths.push(path.clone());
                    match resolve_renamed_path(&path, file_id) {
                        Some(new_path) => Some(if is_dir {
                            Event::dir_moved(path.clone(), new_path)
                        } else {
                            Event::file_moved(path.clone(), new_path)
                        }),
                        None => Some(
                            Event::new(watchtower_types::EventKind::Remove(if is_dir {
                                RemoveKind::Folder
                            } else {
                                RemoveKind::File
                            }))
                            .add_path(path.clone())
                            .set_directory(is_dir),
                        ),
                    }
                }
                kqueue::Vnode::Revoke => {
                    remove_paths.push(path.clone());
                    Some(
                        Event::new(watchtower_types::EventKind::Remove(RemoveKind::Any))
                            .add_path(path.clone()),
                    )
                }
                #[allow(unreachable_patterns)]
                _ => None,
            };

            if let Some(event) = event {
                self.queue.put(event, owner);
            }
        }

        for path in remove_paths {
            self.remove_watch(&path);
        }
        for path in add_paths {
            if let Some(watched) = self.watches.get(&path).cloned() {
                let _ = self.add_watch(&path, &watched.owner, watched.recursive);
            }
        }
    }

    /// A write landed on a watched directory: find the new entry by comparing its contents
    /// against what we already hold a descriptor for.
    fn diff_directory(
        &self,
        path: &Path,
        owner: &ObservedWatch,
        recursive: bool,
        add_paths: &mut Vec<PathBuf>,
    ) -> Option<Event> {
        let new_entry = std::fs::read_dir(path)
            .ok()?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .find(|p| !self.watches.contains_key(p));

        match new_entry {
            Some(entry) => {
                if recursive {
                    add_paths.push(entry.clone());
                }
                let is_dir = entry.is_dir();
                Some(
                    Event::new(watchtower_types::EventKind::Create(if is_dir {
                        CreateKind::Folder
                    } else {
                        CreateKind::File
                    }))
                    .add_path(entry)
                    .set_directory(is_dir),
                )
            }
            None => {
                let _ = owner;
                Some(
                    Event::new(watchtower_types::EventKind::Modify(ModifyKind::Data(
                        DataChange::Any,
                    )))
                    .add_path(path.to_path_buf())
                    .set_directory(true),
                )
            }
        }
    }
}

struct KqueueEmitter {
    tx: crate::channel::Sender<Msg>,
    waker: Arc<Waker>,
    path: PathBuf,
}

impl EmitterHandle for KqueueEmitter {
    fn stop(&mut self) {
        let _ = self.tx.send(Msg::Remove(self.path.clone()));
        let _ = self.waker.wake();
    }
}

/// kqueue-backed backend, used on macOS (behind the `macos_kqueue` feature) and the BSDs.
pub(crate) struct KqueueBackend {
    tx: crate::channel::Sender<Msg>,
    waker: Arc<Waker>,
    thread: Option<JoinHandle<()>>,
}

impl KqueueBackend {
    pub(crate) fn new(queue: Arc<EventQueue>, _config: &Config) -> Result<Self> {
        let kqueue = kqueue::Watcher::new().map_err(Error::from)?;
        let poll = Poll::new().map_err(Error::from)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN).map_err(Error::from)?);
        poll.registry()
            .register(
                &mut mio::unix::SourceFd(&kqueue.as_raw_fd()),
                KQUEUE_TOKEN,
                Interest::READABLE,
            )
            .map_err(Error::from)?;

        let (tx, rx) = crate::channel::unbounded();
        let event_loop = EventLoop {
            kqueue,
            queue,
            rx,
            waker: waker.clone(),
            poll,
            watches: HashMap::new(),
            descriptor_limit: nofile_limit(),
        };
        let thread = std::thread::Builder::new()
            .name("watchtower-kqueue".into())
            .spawn(move || event_loop.run())
            .map_err(Error::from)?;

        Ok(Self {
            tx,
            waker,
            thread: Some(thread),
        })
    }
}

impl Drop for KqueueBackend {
    fn drop(&mut self) {
        let _ = self.tx.send(Msg::Shutdown);
        let _ = self.waker.wake();
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Backend for KqueueBackend {
    fn watch(&self, watch: &ObservedWatch, _config: &Config) -> Result<Box<dyn EmitterHandle>> {
        self.tx
            .send(Msg::Add(watch.clone()))
            .map_err(|_| Error::illegal_state("kqueue event loop has shut down"))?;
        let _ = self.waker.wake();
        Ok(Box::new(KqueueEmitter {
            tx: self.tx.clone(),
            waker: self.waker.clone(),
            path: watch.path().to_path_buf(),
        }))
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Kqueue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn filter_flags_cover_every_vnode_transition_we_translate() {
        let flags = filter_flags();
        assert!(flags.contains(FilterFlag::NOTE_DELETE));
        assert!(flags.contains(FilterFlag::NOTE_WRITE));
        assert!(flags.contains(FilterFlag::NOTE_RENAME));
        assert!(flags.contains(FilterFlag::NOTE_REVOKE));
    }

    #[test]
    fn backend_construction_starts_and_stops_cleanly() {
        let queue = Arc::new(EventQueue::new(16));
        let backend =
            KqueueBackend::new(queue, &Config::default()).expect("kqueue backend should initialize");
        drop(backend);
    }

    #[test]
    fn resolve_renamed_path_finds_the_entry_by_inode_in_its_parent() {
        let dir = tempfile::tempdir().unwrap();
        let old_path = dir.path().join("old");
        std::fs::write(&old_path, b"hi").unwrap();
        let file_id = watchtower_fileid::get_file_id(&old_path).unwrap();

        let new_path = dir.path().join("new");
        std::fs::rename(&old_path, &new_path).unwrap();

        let resolved = resolve_renamed_path(&old_path, Some(file_id));
        assert_eq!(resolved, Some(new_path));
    }

    #[test]
    fn resolve_renamed_path_is_none_when_the_entry_left_the_parent() {
        let dir = tempfile::tempdir().unwrap();
        let old_path = dir.path().join("old");
        std::fs::write(&old_path, b"hi").unwrap();
        let file_id = watchtower_fileid::get_file_id(&old_path).unwrap();
        std::fs::remove_file(&old_path).unwrap();

        assert_eq!(resolve_renamed_path(&old_path, Some(file_id)), None);
    }

    #[test]
    fn nofile_limit_returns_a_positive_value() {
        assert!(nofile_limit() > 0);
    }
}
