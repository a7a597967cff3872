//! macOS backend built on the FSEvents API.
//!
//! One stream, rescheduled on the same `CFRunLoop` thread every time a path is added or
//! removed, backs every watch registered against a given [`FsEventBackend`]. FSEvents reports
//! each side of a rename as its own callback invocation, but the two always arrive with
//! consecutive event ids; the callback buffers the first half and pairs it with the next
//! `ItemRenamed` notification whose id is exactly one greater, turning them into a single
//! `Moved` event. A [`StreamFlags::MUST_SCAN_SUBDIRS`] or [`StreamFlags::IDS_WRAPPED`] flag
//! means our view of the tree may have drifted, so the callback re-walks every watched root and
//! diffs it against an empty snapshot, replaying the result as synthetic events — the same
//! catch-up [`crate::backend::inotify`] performs after `IN_Q_OVERFLOW`.

#![allow(non_upper_case_globals)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::{Arc, Mutex};
use std::thread;

use objc2_core_foundation as cf;
use objc2_core_services as fs;
use watchtower_types::{
    AccessMode, CreateKind, DataChange, Event, EventKind, Flag, MetadataKind, ModifyKind,
    RemoveKind, RenameMode,
};

use crate::backend::{Backend, BackendKind};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::queue::EventQueue;
use crate::registry::EmitterHandle;
use crate::snapshot::{diff, Snapshot, Walker};
use crate::watch::ObservedWatch;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy)]
    struct StreamFlags: u32 {
        const NONE = fs::kFSEventStreamEventFlagNone;
        const MUST_SCAN_SUBDIRS = fs::kFSEventStreamEventFlagMustScanSubDirs;
        const USER_DROPPED = fs::kFSEventStreamEventFlagUserDropped;
        const KERNEL_DROPPED = fs::kFSEventStreamEventFlagKernelDropped;
        const IDS_WRAPPED = fs::kFSEventStreamEventFlagEventIdsWrapped;
        const HISTORY_DONE = fs::kFSEventStreamEventFlagHistoryDone;
        const ITEM_CREATED = fs::kFSEventStreamEventFlagItemCreated;
        const ITEM_REMOVED = fs::kFSEventStreamEventFlagItemRemoved;
        const INODE_META_MOD = fs::kFSEventStreamEventFlagItemInodeMetaMod;
        const ITEM_RENAMED = fs::kFSEventStreamEventFlagItemRenamed;
        const ITEM_MODIFIED = fs::kFSEventStreamEventFlagItemModified;
        const FINDER_INFO_MOD = fs::kFSEventStreamEventFlagItemFinderInfoMod;
        const ITEM_CHANGE_OWNER = fs::kFSEventStreamEventFlagItemChangeOwner;
        const ITEM_XATTR_MOD = fs::kFSEventStreamEventFlagItemXattrMod;
        const IS_FILE = fs::kFSEventStreamEventFlagItemIsFile;
        const IS_DIR = fs::kFSEventStreamEventFlagItemIsDir;
        const OWN_EVENT = fs::kFSEventStreamEventFlagOwnEvent;
    }
}

/// Whether a flag combination should trigger a full catch-up walk of the affected root: our
/// bookkeeping may be stale and a plain diff-based replay is the only way to recover.
fn needs_catch_up_walk(flags: StreamFlags) -> bool {
    flags.intersects(StreamFlags::MUST_SCAN_SUBDIRS | StreamFlags::IDS_WRAPPED)
}

/// Re-walks `root` and diffs it against an empty snapshot, synthesizing a `Created` for every
/// entry found — the same baseline a fresh poll-backend watch starts from.
fn catch_up_events(root: &Path, recursive: bool) -> Vec<Event> {
    let fresh = Walker::new(true).walk(root, recursive);
    diff(&Snapshot::empty(), &fresh)
}

fn stamp_own_event(event: Event, own: bool) -> Event {
    if own {
        event.set_process_id(std::process::id())
    } else {
        event
    }
}

fn translate_flags(flags: StreamFlags, path: PathBuf) -> Vec<Event> {
    let mut evs = Vec::new();
    if flags.contains(StreamFlags::HISTORY_DONE) {
        return evs;
    }

    let is_dir = flags.contains(StreamFlags::IS_DIR);

    if needs_catch_up_walk(flags) {
        let info = if flags.contains(StreamFlags::USER_DROPPED) {
            "rescan: user dropped"
        } else if flags.contains(StreamFlags::KERNEL_DROPPED) {
            "rescan: kernel dropped"
        } else if flags.contains(StreamFlags::IDS_WRAPPED) {
            "rescan: event ids wrapped"
        } else {
            "rescan"
        };
        evs.push(
            Event::new(EventKind::Other)
                .set_flag(Flag::Rescan)
                .set_info(info)
                .add_path(path.clone()),
        );
    }

    if flags.contains(StreamFlags::ITEM_CREATED) {
        evs.push(
            Event::new(EventKind::Create(if is_dir {
                CreateKind::Folder
            } else {
                CreateKind::File
            }))
            .set_directory(is_dir)
            .add_path(path.clone()),
        );
    }

    // ITEM_RENAMED is handled by the callback, which pairs consecutive event ids into a single
    // `Moved` event; it needs state `translate_flags` does not have access to.

    if flags.contains(StreamFlags::INODE_META_MOD) {
        evs.push(
            Event::new(EventKind::Modify(ModifyKind::Metadata(MetadataKind::Any)))
                .set_directory(is_dir)
                .add_path(path.clone()),
        );
    }
    if flags.contains(StreamFlags::FINDER_INFO_MOD) {
        evs.push(
            Event::new(EventKind::Modify(ModifyKind::Metadata(MetadataKind::Other)))
                .set_directory(is_dir)
                .add_path(path.clone()),
        );
    }
    if flags.contains(StreamFlags::ITEM_CHANGE_OWNER) {
        evs.push(
            Event::new(EventKind::Modify(ModifyKind::Metadata(
                MetadataKind::Ownership,
            )))
            .set_directory(is_dir)
            .add_path(path.clone()),
        );
    }
    if flags.contains(StreamFlags::ITEM_XATTR_MOD) {
        evs.push(
            Event::new(EventKind::Modify(ModifyKind::Metadata(
                MetadataKind::Extended,
            )))
            .set_directory(is_dir)
            .add_path(path.clone()),
        );
    }
    if flags.contains(StreamFlags::ITEM_MODIFIED) {
        evs.push(
            Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Content)))
                .set_directory(is_dir)
                .add_path(path.clone()),
        );
    }
    if flags.contains(StreamFlags::ITEM_REMOVED) {
        evs.push(
            Event::new(EventKind::Remove(if is_dir {
                RemoveKind::Folder
            } else {
                RemoveKind::File
            }))
            .set_directory(is_dir)
            .add_path(path.clone()),
        );
    }

    let own = flags.contains(StreamFlags::OWN_EVENT);
    evs.into_iter().map(|ev| stamp_own_event(ev, own)).collect()
}

/// Pairs the two halves of a rename. FSEvents never tells us old-name/new-name directly, but it
/// always assigns the "from" and "to" notifications consecutive event ids. Returns the paired
/// `Moved` event once the second half arrives; if a buffered first half's pair never shows up
/// (the id sequence skips, e.g. another event was coalesced in between), it is flushed as a
/// single-sided rename so it isn't silently dropped.
fn pair_rename(
    pending: &mut Option<(fs::FSEventStreamEventId, PathBuf, bool)>,
    event_id: fs::FSEventStreamEventId,
    path: PathBuf,
    is_dir: bool,
) -> Option<Event> {
    match pending.take() {
        Some((prev_id, prev_path, prev_is_dir)) if event_id == prev_id + 1 => Some(if prev_is_dir {
            Event::dir_moved(prev_path, path)
        } else {
            Event::file_moved(prev_path, path)
        }),
        Some((_, prev_path, prev_is_dir)) => {
            let lone = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Any)))
                .set_directory(prev_is_dir)
                .add_path(prev_path);
            *pending = Some((event_id, path, is_dir));
            Some(lone)
        }
        None => {
            *pending = Some((event_id, path, is_dir));
            None
        }
    }
}

struct StreamContext {
    queue: Arc<EventQueue>,
    /// Canonical root -> (observed watch, recursive) for every path currently in the stream.
    roots: HashMap<PathBuf, (ObservedWatch, bool)>,
    /// First half of a rename still waiting for its paired `ItemRenamed` notification.
    pending_rename: Option<(fs::FSEventStreamEventId, PathBuf, bool)>,
}

unsafe extern "C-unwind" fn release_context(info: *const std::ffi::c_void) {
    unsafe {
        drop(Box::from_raw(info as *const Mutex<StreamContext> as *mut Mutex<StreamContext>));
    }
}

unsafe extern "C-unwind" fn fsevents_callback(
    _stream_ref: fs::ConstFSEventStreamRef,
    client_info: *mut std::ffi::c_void,
    num_events: usize,
    event_paths: *mut std::ffi::c_void,
    event_flags: *const fs::FSEventStreamEventFlags,
    event_ids: *const fs::FSEventStreamEventId,
) {
    let ctx = unsafe { &*(client_info as *const Mutex<StreamContext>) };
    let paths = event_paths as *const *const std::os::raw::c_char;
    let mut guard = ctx.lock().unwrap();
    for i in 0..num_events {
        let raw_path = unsafe {
            let c_str = std::ffi::CStr::from_ptr(*paths.add(i));
            PathBuf::from(c_str.to_string_lossy().into_owned())
        };
        let flags = StreamFlags::from_bits_truncate(unsafe { *event_flags.add(i) });
        let event_id = unsafe { *event_ids.add(i) };
        let is_dir = flags.contains(StreamFlags::IS_DIR);
        let own = flags.contains(StreamFlags::OWN_EVENT);

        let Some((root, (watch, recursive))) = guard
            .roots
            .iter()
            .find(|(root, _)| raw_path.starts_with(*root))
            .map(|(root, v)| (root.clone(), v.clone()))
        else {
            continue;
        };

        let mut events = translate_flags(flags, raw_path.clone());

        if flags.contains(StreamFlags::ITEM_RENAMED) {
            if let Some(renamed) = pair_rename(&mut guard.pending_rename, event_id, raw_path.clone(), is_dir) {
                events.push(stamp_own_event(renamed, own));
            }
        }

        if needs_catch_up_walk(flags) {
            log::warn!("fsevents stream may have missed changes; resynchronizing watch on {}", root.display());
            events.extend(catch_up_events(&root, recursive));
        }

        for event in events {
            guard.queue.put(event, watch.clone());
        }
    }
}

enum Msg {
    Add(ObservedWatch),
    Remove(PathBuf),
    Shutdown,
}

struct Inner {
    tx: crate::channel::Sender<Msg>,
    thread: Option<thread::JoinHandle<()>>,
}

/// FSEvents-backed backend.
pub(crate) struct FsEventBackend {
    inner: Mutex<Inner>,
}

impl FsEventBackend {
    pub(crate) fn new(queue: Arc<EventQueue>, _config: &Config) -> Result<Self> {
        let (tx, rx) = crate::channel::unbounded();
        let thread = thread::Builder::new()
            .name("watchtower-fsevent".into())
            .spawn(move || run_loop(queue, rx))
            .map_err(Error::from)?;
        Ok(Self {
            inner: Mutex::new(Inner {
                tx,
                thread: Some(thread),
            }),
        })
    }
}

impl Drop for FsEventBackend {
    fn drop(&mut self) {
        let mut inner = self.inner.lock().unwrap();
        let _ = inner.tx.send(Msg::Shutdown);
        if let Some(handle) = inner.thread.take() {
            let _ = handle.join();
        }
    }
}

struct FsEventEmitter {
    tx: crate::channel::Sender<Msg>,
    path: PathBuf,
}

impl EmitterHandle for FsEventEmitter {
    fn stop(&mut self) {
        let _ = self.tx.send(Msg::Remove(self.path.clone()));
    }
}

impl Backend for FsEventBackend {
    fn watch(&self, watch: &ObservedWatch, _config: &Config) -> Result<Box<dyn EmitterHandle>> {
        let tx = self.inner.lock().unwrap().tx.clone();
        tx.send(Msg::Add(watch.clone()))
            .map_err(|_| Error::illegal_state("fsevent loop has shut down"))?;
        Ok(Box::new(FsEventEmitter {
            tx,
            path: watch.path().to_path_buf(),
        }))
    }

    fn kind(&self) -> BackendKind {
        BackendKind::FsEvent
    }
}

/// Owns the CFRunLoop thread for the life of the backend. The stream is torn down and rebuilt
/// every time the watched path set changes, which is the only way FSEvents supports adding a
/// path to a running stream.
fn run_loop(queue: Arc<EventQueue>, rx: crate::channel::Receiver<Msg>) {
    let mut roots: HashMap<PathBuf, (ObservedWatch, bool)> = HashMap::new();
    // The message that caused the current iteration to run; `None` only on the very first pass.
    let mut pending = match rx.recv() {
        Ok(msg) => Some(msg),
        Err(_) => return,
    };

    loop {
        match pending.take() {
            Some(Msg::Shutdown) | None => return,
            Some(Msg::Add(watch)) => {
                roots.insert(watch.path().to_path_buf(), (watch.clone(), watch.recursive()));
            }
            Some(Msg::Remove(path)) => {
                roots.remove(&path);
            }
        }
        if roots.is_empty() {
            pending = match rx.recv() {
                Ok(msg) => Some(msg),
                Err(_) => return,
            };
            continue;
        }
        match run_stream_once(&queue, &roots, &rx) {
            Ok(next) => pending = next,
            Err(err) => {
                log::warn!("fsevent stream failed: {err}");
                pending = match rx.recv() {
                    Ok(msg) => Some(msg),
                    Err(_) => return,
                };
            }
        }
    }
}

/// Runs one FSEvents stream until the next control message arrives, then tears it down and
/// hands that message back so the caller can act on it without a redundant `recv`.
fn run_stream_once(
    queue: &Arc<EventQueue>,
    roots: &HashMap<PathBuf, (ObservedWatch, bool)>,
    rx: &crate::channel::Receiver<Msg>,
) -> Result<Option<Msg>> {
    let paths: cf::CFRetained<cf::CFMutableArray<cf::CFString>> = cf::CFMutableArray::empty();
    for root in roots.keys() {
        let cf_path = cf::CFString::from_str(&root.to_string_lossy());
        paths.append(&cf_path);
    }

    let context = Box::into_raw(Box::new(Mutex::new(StreamContext {
        queue: queue.clone(),
        roots: roots.clone(),
        pending_rename: None,
    })));

    let stream_context = fs::FSEventStreamContext {
        version: 0,
        info: context as *mut std::ffi::c_void,
        retain: None,
        release: Some(release_context),
        copyDescription: None,
    };

    let stream = unsafe {
        fs::FSEventStreamCreate(
            cf::kCFAllocatorDefault,
            Some(fsevents_callback),
            &stream_context as *const _ as *mut _,
            paths.as_opaque(),
            fs::kFSEventStreamEventIdSinceNow,
            0.05,
            fs::kFSEventStreamCreateFlagFileEvents | fs::kFSEventStreamCreateFlagNoDefer,
        )
    };

    unsafe {
        let cur_runloop = cf::CFRunLoop::current().ok_or_else(|| Error::generic("no runloop"))?;
        #[allow(deprecated)]
        fs::FSEventStreamScheduleWithRunLoop(
            stream,
            &cur_runloop,
            cf::kCFRunLoopDefaultMode.ok_or_else(|| Error::generic("no default runloop mode"))?,
        );
        if !fs::FSEventStreamStart(stream) {
            fs::FSEventStreamInvalidate(stream);
            fs::FSEventStreamRelease(stream);
            return Err(Error::generic("unable to start FSEvent stream"));
        }
    }

    // Run until the next control message tells us the path set changed or we should shut down.
    let next = rx.recv();
    unsafe {
        fs::FSEventStreamStop(stream);
        fs::FSEventStreamInvalidate(stream);
        fs::FSEventStreamRelease(stream);
    }

    match next {
        Ok(msg) => Ok(Some(msg)),
        Err(_) => Ok(None),
    }
}
