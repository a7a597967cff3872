//! Windows backend built on `ReadDirectoryChangesW`.
//!
//! Each watched directory gets its own overlapped read, completed through an APC-based
//! completion routine rather than an I/O completion port: one event loop thread owns every
//! watch and blocks in an alertable wait (`WaitForSingleObjectEx`) so queued completions run
//! as they land. A completion routine immediately re-issues the next read before translating
//! the buffer it just received, so no notification window is missed between reads.
//!
//! `FILE_ACTION_RENAMED_OLD_NAME` and `..._NEW_NAME` are always adjacent entries in the same
//! notification buffer for a single rename, so they're paired by simple adjacency (the watch's
//! last-seen old name) rather than the cookie matching inotify gets from the kernel.

use std::collections::HashMap;
use std::ffi::OsString;
use std::os::raw::c_void;
use std::os::windows::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};
use std::ptr;
use std::slice;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use watchtower_types::{Event, Flag};
use windows_sys::Win32::Foundation::{
    CloseHandle, ERROR_ACCESS_DENIED, ERROR_OPERATION_ABORTED, ERROR_SUCCESS, HANDLE,
    INVALID_HANDLE_VALUE, WAIT_OBJECT_0,
};
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, ReadDirectoryChangesW, FILE_ACTION_ADDED, FILE_ACTION_MODIFIED,
    FILE_ACTION_REMOVED, FILE_ACTION_RENAMED_NEW_NAME, FILE_ACTION_RENAMED_OLD_NAME,
    FILE_ATTRIBUTE_DIRECTORY, FILE_FLAG_BACKUP_SEMANTICS, FILE_FLAG_OVERLAPPED,
    FILE_LIST_DIRECTORY, FILE_NOTIFY_CHANGE_ATTRIBUTES, FILE_NOTIFY_CHANGE_CREATION,
    FILE_NOTIFY_CHANGE_DIR_NAME, FILE_NOTIFY_CHANGE_FILE_NAME, FILE_NOTIFY_CHANGE_LAST_WRITE,
    FILE_NOTIFY_CHANGE_SECURITY, FILE_NOTIFY_CHANGE_SIZE, FILE_NOTIFY_INFORMATION,
    FILE_SHARE_DELETE, FILE_SHARE_READ, FILE_SHARE_WRITE, OPEN_EXISTING,
};
use windows_sys::Win32::System::IO::OVERLAPPED;
use windows_sys::Win32::System::Threading::{
    CreateSemaphoreW, ReleaseSemaphore, WaitForSingleObjectEx, INFINITE,
};

use crate::backend::{Backend, BackendKind};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::queue::EventQueue;
use crate::registry::EmitterHandle;
use crate::snapshot::{diff, Snapshot, Walker};
use crate::watch::ObservedWatch;

const BUF_SIZE: u32 = 65536;

enum Msg {
    Add(ObservedWatch),
    Remove(PathBuf),
    Shutdown,
}

struct WatchState {
    handle: HANDLE,
    complete_sem: HANDLE,
}

/// Per-watch state threaded through every successive overlapped read via `Arc`/`Mutex`, since
/// a completion routine only gets the `ReadData` clone belonging to the read it completed.
#[derive(Clone)]
struct ReadData {
    dir: PathBuf,
    file: Option<PathBuf>,
    is_recursive: bool,
    complete_sem: HANDLE,
    observed: ObservedWatch,
    queue: Arc<EventQueue>,
    tx: crate::channel::Sender<Msg>,
    /// The path named by the last unpaired `FILE_ACTION_RENAMED_OLD_NAME` entry seen on this
    /// watch, if any.
    pending_rename_from: Arc<Mutex<Option<PathBuf>>>,
}

impl ReadData {
    fn unwatch(&self) {
        let _ = self.tx.send(Msg::Remove(self.dir.clone()));
    }
}

struct ReadDirectoryRequest {
    buffer: [u8; BUF_SIZE as usize],
    handle: HANDLE,
    data: ReadData,
}

struct EventLoop {
    rx: crate::channel::Receiver<Msg>,
    wakeup_sem: HANDLE,
    watches: HashMap<PathBuf, WatchState>,
    queue: Arc<EventQueue>,
    tx: crate::channel::Sender<Msg>,
}

// SAFETY: every HANDLE and OVERLAPPED pointer this backend touches is only ever read or
// written from the single event loop thread, or handed to the Windows kernel, which is the
// usual justification notify's own windows backend relies on for sending these across threads.
unsafe impl Send for EventLoop {}

impl EventLoop {
    fn run(mut self) {
        loop {
            let mut stopped = false;
            while let Ok(msg) = self.rx.try_recv() {
                match msg {
                    Msg::Add(watch) => {
                        if let Err(err) = self.add_watch(&watch) {
                            log::warn!(
                                "failed to add ReadDirectoryChangesW watch for {}: {err}",
                                watch.path().display()
                            );
                        }
                    }
                    Msg::Remove(path) => self.remove_watch(&path),
                    Msg::Shutdown => {
                        stopped = true;
                        let paths: Vec<PathBuf> = self.watches.keys().cloned().collect();
                        for path in paths {
                            self.remove_watch(&path);
                        }
                    }
                }
            }
            if stopped {
                break;
            }

            // Alertable wait: lets any completion routine queued as an APC on this thread run.
            unsafe {
                WaitForSingleObjectEx(self.wakeup_sem, 100, 1);
            }
        }
        unsafe {
            CloseHandle(self.wakeup_sem);
        }
    }

    fn add_watch(&mut self, watch: &ObservedWatch) -> Result<()> {
        let path = watch.path();
        if self.watches.contains_key(path) {
            return Ok(());
        }
        let (watching_file, dir_target) = if path.is_dir() {
            (false, path.to_path_buf())
        } else {
            let parent = path
                .parent()
                .ok_or_else(|| Error::generic("watched file has no parent directory"))?;
            (true, parent.to_path_buf())
        };

        let encoded: Vec<u16> = dir_target
            .as_os_str()
            .encode_wide()
            .chain(Some(0))
            .collect();
        let handle = unsafe {
            CreateFileW(
                encoded.as_ptr(),
                FILE_LIST_DIRECTORY,
                FILE_SHARE_READ | FILE_SHARE_DELETE | FILE_SHARE_WRITE,
                ptr::null_mut(),
                OPEN_EXISTING,
                FILE_FLAG_BACKUP_SEMANTICS | FILE_FLAG_OVERLAPPED,
                ptr::null_mut(),
            )
        };
        if handle == INVALID_HANDLE_VALUE {
            return Err(Error::path_not_found(path.to_path_buf()));
        }

        let complete_sem = unsafe { CreateSemaphoreW(ptr::null_mut(), 0, 1, ptr::null_mut()) };
        if complete_sem.is_null() || complete_sem == INVALID_HANDLE_VALUE {
            unsafe { CloseHandle(handle) };
            return Err(Error::generic("failed to create completion semaphore").add_path(path.to_path_buf()));
        }

        let data = ReadData {
            dir: dir_target,
            file: if watching_file {
                Some(path.to_path_buf())
            } else {
                None
            },
            is_recursive: watch.recursive(),
            complete_sem,
            observed: watch.clone(),
            queue: self.queue.clone(),
            tx: self.tx.clone(),
            pending_rename_from: Arc::new(Mutex::new(None)),
        };
        self.watches.insert(
            path.to_path_buf(),
            WatchState {
                handle,
                complete_sem,
            },
        );
        start_read(data, handle);
        Ok(())
    }

    fn remove_watch(&mut self, path: &Path) {
        let Some(state) = self.watches.remove(path) else {
            return;
        };
        stop_watch(&state);
    }
}

fn stop_watch(state: &WatchState) {
    unsafe {
        let cancelled = windows_sys::Win32::System::IO::CancelIo(state.handle);
        let closed = CloseHandle(state.handle);
        if cancelled != 0 && closed != 0 {
            // Drain the APC queue until the in-flight completion routine has run; otherwise
            // its boxed request/overlapped allocation leaks.
            while WaitForSingleObjectEx(state.complete_sem, INFINITE, 1) != WAIT_OBJECT_0 {}
        }
        CloseHandle(state.complete_sem);
    }
}

fn start_read(data: ReadData, handle: HANDLE) {
    let request = Box::new(ReadDirectoryRequest {
        buffer: [0u8; BUF_SIZE as usize],
        handle,
        data,
    });

    let flags = FILE_NOTIFY_CHANGE_FILE_NAME
        | FILE_NOTIFY_CHANGE_DIR_NAME
        | FILE_NOTIFY_CHANGE_ATTRIBUTES
        | FILE_NOTIFY_CHANGE_SIZE
        | FILE_NOTIFY_CHANGE_LAST_WRITE
        | FILE_NOTIFY_CHANGE_CREATION
        | FILE_NOTIFY_CHANGE_SECURITY;
    let monitor_subdir = if request.data.file.is_none() && request.data.is_recursive {
        1
    } else {
        0
    };

    unsafe {
        let overlapped: *mut OVERLAPPED = Box::into_raw(Box::new(std::mem::zeroed()));
        let request = Box::into_raw(request);
        (*overlapped).hEvent = request as *mut _ as _;

        let ret = ReadDirectoryChangesW(
            handle,
            (*request).buffer.as_mut_ptr() as *mut c_void,
            BUF_SIZE,
            monitor_subdir,
            flags,
            &mut 0u32 as *mut u32,
            overlapped,
            Some(handle_event),
        );

        if ret == 0 {
            let _overlapped = Box::from_raw(overlapped);
            let request = Box::from_raw(request);
            ReleaseSemaphore(request.data.complete_sem, 1, ptr::null_mut());
        }
    }
}

unsafe extern "system" fn handle_event(error_code: u32, bytes_written: u32, overlapped: *mut OVERLAPPED) {
    let overlapped: Box<OVERLAPPED> = Box::from_raw(overlapped);
    let request: Box<ReadDirectoryRequest> = Box::from_raw(overlapped.hEvent as *mut _);

    match error_code {
        ERROR_OPERATION_ABORTED => {
            ReleaseSemaphore(request.data.complete_sem, 1, ptr::null_mut());
            return;
        }
        ERROR_ACCESS_DENIED => {
            if !request.data.dir.exists() {
                let event = Event::dir_deleted(request.data.dir.clone()).set_flag(Flag::EmitterStopped);
                request.data.queue.put(event, request.data.observed.clone());
                request.data.unwatch();
                ReleaseSemaphore(request.data.complete_sem, 1, ptr::null_mut());
                return;
            }
        }
        ERROR_SUCCESS => {}
        _ => {
            log::error!(
                "ReadDirectoryChangesW failed for {}: {error_code}",
                request.data.dir.display()
            );
            let event = Event::dir_deleted(request.data.dir.clone()).set_flag(Flag::EmitterStopped);
            request.data.queue.put(event, request.data.observed.clone());
            request.data.unwatch();
            ReleaseSemaphore(request.data.complete_sem, 1, ptr::null_mut());
            return;
        }
    }

    // Re-issue the read immediately so nothing lands in the gap while we translate this batch.
    start_read(request.data.clone(), request.handle);

    // A zero-length completion on success means the kernel's notification buffer overflowed
    // mid-batch; there is no data to parse, and some number of changes were dropped entirely.
    if bytes_written == 0 {
        log::warn!(
            "ReadDirectoryChangesW buffer overflowed for {}; resynchronizing watch",
            request.data.dir.display()
        );
        request.data.queue.put(
            Event::new(watchtower_types::EventKind::Other)
                .add_path(request.data.dir.clone())
                .set_flag(Flag::Rescan),
            request.data.observed.clone(),
        );
        for event in catch_up_events(&request.data.dir, request.data.is_recursive) {
            request.data.queue.put(event, request.data.observed.clone());
        }
        return;
    }

    let mut cur_offset: *const u8 = request.buffer.as_ptr();
    let mut cur_entry = ptr::read_unaligned(cur_offset as *const FILE_NOTIFY_INFORMATION);
    loop {
        let len = cur_entry.FileNameLength as usize / 2;
        let encoded_path: &[u16] = slice::from_raw_parts(
            cur_offset.offset(std::mem::offset_of!(FILE_NOTIFY_INFORMATION, FileName) as isize) as _,
            len,
        );
        let path = request.data.dir.join(PathBuf::from(OsString::from_wide(encoded_path)));

        let skip = match &request.data.file {
            None => false,
            Some(watch_path) => watch_path != &path,
        };
        if !skip {
            translate_and_emit(&request.data, cur_entry.Action, cur_entry.FileAttributes, path);
        }

        if cur_entry.NextEntryOffset == 0 {
            break;
        }
        cur_offset = cur_offset.offset(cur_entry.NextEntryOffset as isize);
        cur_entry = ptr::read_unaligned(cur_offset as *const FILE_NOTIFY_INFORMATION);
    }
}

/// Re-walks `root` and replays its current contents as creations against an empty baseline,
/// the same catch-up a fresh watch or an inotify queue-overflow resync performs.
fn catch_up_events(root: &Path, recursive: bool) -> Vec<Event> {
    let fresh = Walker::new(true).walk(root, recursive);
    diff(&Snapshot::empty(), &fresh)
}

fn translate_and_emit(data: &ReadData, action: u32, attributes: u32, path: PathBuf) {
    let is_dir = attributes & FILE_ATTRIBUTE_DIRECTORY != 0;
    let event = match action {
        FILE_ACTION_RENAMED_OLD_NAME => {
            *data.pending_rename_from.lock().unwrap() = Some(path);
            return;
        }
        FILE_ACTION_RENAMED_NEW_NAME => {
            let from = data.pending_rename_from.lock().unwrap().take();
            match (from, is_dir) {
                (Some(from), true) => Event::dir_moved(from, path),
                (Some(from), false) => Event::file_moved(from, path),
                (None, true) => Event::dir_created(path),
                (None, false) => Event::file_created(path),
            }
        }
        FILE_ACTION_ADDED => {
            if is_dir {
                Event::dir_created(path)
            } else {
                Event::file_created(path)
            }
        }
        FILE_ACTION_REMOVED => {
            if is_dir {
                Event::dir_deleted(path)
            } else {
                Event::file_deleted(path)
            }
        }
        FILE_ACTION_MODIFIED => {
            if is_dir {
                Event::dir_modified(path)
            } else {
                Event::file_modified(path)
            }
        }
        _ => return,
    };
    data.queue.put(event, data.observed.clone());
}

struct WindowsEmitter {
    tx: crate::channel::Sender<Msg>,
    wakeup_sem: HANDLE,
    path: PathBuf,
}

// SAFETY: the semaphore handle is only ever signalled, never dereferenced as data.
unsafe impl Send for WindowsEmitter {}

impl EmitterHandle for WindowsEmitter {
    fn stop(&mut self) {
        let _ = self.tx.send(Msg::Remove(self.path.clone()));
        unsafe {
            ReleaseSemaphore(self.wakeup_sem, 1, ptr::null_mut());
        }
    }
}

/// `ReadDirectoryChangesW`-backed backend.
pub(crate) struct WindowsBackend {
    tx: crate::channel::Sender<Msg>,
    wakeup_sem: HANDLE,
    thread: Option<JoinHandle<()>>,
}

impl WindowsBackend {
    pub(crate) fn new(queue: Arc<EventQueue>, _config: &Config) -> Result<Self> {
        let wakeup_sem = unsafe { CreateSemaphoreW(ptr::null_mut(), 0, 1, ptr::null_mut()) };
        if wakeup_sem.is_null() || wakeup_sem == INVALID_HANDLE_VALUE {
            return Err(Error::generic("failed to create wakeup semaphore"));
        }
        let (tx, rx) = crate::channel::unbounded();
        let event_loop = EventLoop {
            rx,
            wakeup_sem,
            watches: HashMap::new(),
            queue,
            tx: tx.clone(),
        };
        let thread = std::thread::Builder::new()
            .name("watchtower-windows".into())
            .spawn(move || event_loop.run())
            .map_err(Error::from)?;

        Ok(Self {
            tx,
            wakeup_sem,
            thread: Some(thread),
        })
    }
}

impl Drop for WindowsBackend {
    fn drop(&mut self) {
        let _ = self.tx.send(Msg::Shutdown);
        unsafe {
            ReleaseSemaphore(self.wakeup_sem, 1, ptr::null_mut());
        }
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Backend for WindowsBackend {
    fn watch(&self, watch: &ObservedWatch, _config: &Config) -> Result<Box<dyn EmitterHandle>> {
        self.tx
            .send(Msg::Add(watch.clone()))
            .map_err(|_| Error::illegal_state("windows event loop has shut down"))?;
        unsafe {
            ReleaseSemaphore(self.wakeup_sem, 1, ptr::null_mut());
        }
        Ok(Box::new(WindowsEmitter {
            tx: self.tx.clone(),
            wakeup_sem: self.wakeup_sem,
            path: watch.path().to_path_buf(),
        }))
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Windows
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rename_pair_produces_a_single_move_event() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(EventQueue::new(16));
        let watch = ObservedWatch::new(dir.path(), true, None).unwrap();
        let (tx, _rx) = crate::channel::unbounded::<Msg>();
        let data = ReadData {
            dir: dir.path().to_path_buf(),
            file: None,
            is_recursive: true,
            complete_sem: ptr::null_mut(),
            observed: watch,
            queue: queue.clone(),
            tx,
            pending_rename_from: Arc::new(Mutex::new(None)),
        };

        let from = dir.path().join("old");
        let to = dir.path().join("new");
        translate_and_emit(&data, FILE_ACTION_RENAMED_OLD_NAME, 0, from);
        assert_eq!(queue.len(), 0);
        translate_and_emit(&data, FILE_ACTION_RENAMED_NEW_NAME, 0, to);
        assert_eq!(queue.len(), 1);
        let item = queue.get(std::time::Duration::from_millis(10)).unwrap();
        assert_eq!(item.event.label(), "file_moved");
    }

    #[test]
    fn unpaired_new_name_is_reported_as_a_creation() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(EventQueue::new(16));
        let watch = ObservedWatch::new(dir.path(), true, None).unwrap();
        let (tx, _rx) = crate::channel::unbounded::<Msg>();
        let data = ReadData {
            dir: dir.path().to_path_buf(),
            file: None,
            is_recursive: true,
            complete_sem: ptr::null_mut(),
            observed: watch,
            queue: queue.clone(),
            tx,
            pending_rename_from: Arc::new(Mutex::new(None)),
        };
        translate_and_emit(&data, FILE_ACTION_RENAMED_NEW_NAME, 0, dir.path().join("new"));
        let item = queue.get(std::time::Duration::from_millis(10)).unwrap();
        assert_eq!(item.event.label(), "file_created");
    }

    #[test]
    fn catch_up_events_reports_existing_entries_as_creations() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), b"hi").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();

        let events = catch_up_events(dir.path(), true);
        assert!(events.iter().any(|e| e.label() == "file_created"));
        assert!(events.iter().any(|e| e.label() == "dir_created"));
    }

    /// Recycle-bin deletes go through a move-to-trash rather than a plain unlink; this
    /// confirms the backend tears the watch down cleanly instead of hanging on the
    /// now-vanished handle.
    #[test]
    fn recycling_the_watched_directory_does_not_hang_the_backend() {
        let dir = tempfile::tempdir().unwrap();
        let child = dir.path().join("child");
        std::fs::create_dir(&child).unwrap();

        let queue = Arc::new(EventQueue::new(16));
        let backend = WindowsBackend::new(queue, &Config::default()).unwrap();
        let watch = ObservedWatch::new(&child, false, None).unwrap();
        let mut emitter = backend.watch(&watch, &Config::default()).unwrap();

        trash::delete(&child).unwrap();
        emitter.stop();
    }
}
