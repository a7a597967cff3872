//! Per-platform emitters: the code that turns raw OS notifications into canonical events on
//! the shared [`crate::EventQueue`].
//!
//! Every backend owns exactly one background thread for the life of the backend instance,
//! multiplexing however many paths get scheduled against it — adding a second watch never
//! spawns a second thread. [`Backend::watch`] registers one more path with that thread and
//! returns an [`EmitterHandle`] whose `stop` unregisters it again.

use std::sync::Arc;

use crate::config::Config;
use crate::error::Result;
use crate::queue::EventQueue;
use crate::registry::EmitterHandle;
use crate::watch::ObservedWatch;

#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) mod inotify;
#[cfg(all(target_os = "macos", feature = "macos_fsevent"))]
pub(crate) mod fsevent;
#[cfg(any(
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly",
    target_os = "ios",
    all(target_os = "macos", feature = "macos_kqueue")
))]
pub(crate) mod kqueue;
#[cfg(windows)]
pub(crate) mod windows;
pub(crate) mod null;
pub(crate) mod poll;

/// Which kind of backend is currently driving an [`crate::Observer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum BackendKind {
    /// inotify (Linux, Android).
    Inotify,
    /// FSEvents (macOS).
    FsEvent,
    /// kqueue (BSD family, or macOS with `macos_kqueue`).
    Kqueue,
    /// `ReadDirectoryChangesW` (Windows).
    Windows,
    /// Portable snapshot-diff polling, used as a fallback everywhere.
    Poll,
    /// Delivers no events; used only when no other backend is available.
    Null,
}

/// A running emitter capable of watching additional paths.
pub(crate) trait Backend: Send {
    /// Registers `watch` with this backend, returning a handle that un-registers it on `stop`.
    fn watch(&self, watch: &ObservedWatch, config: &Config) -> Result<Box<dyn EmitterHandle>>;

    /// The kind of backend this is, for diagnostics.
    fn kind(&self) -> BackendKind;
}

/// Selects and starts the best backend for the current platform, feeding canonical events
/// into `queue` as they are produced.
pub(crate) fn recommended(queue: Arc<EventQueue>, config: &Config) -> Result<Box<dyn Backend>> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        return Ok(Box::new(inotify::InotifyBackend::new(queue, config)?));
    }
    #[cfg(all(target_os = "macos", feature = "macos_fsevent"))]
    {
        return Ok(Box::new(fsevent::FsEventBackend::new(queue, config)?));
    }
    #[cfg(any(
        target_os = "freebsd",
        target_os = "openbsd",
        target_os = "netbsd",
        target_os = "dragonfly",
        target_os = "ios",
        all(target_os = "macos", feature = "macos_kqueue")
    ))]
    {
        return Ok(Box::new(kqueue::KqueueBackend::new(queue, config)?));
    }
    #[cfg(windows)]
    {
        return Ok(Box::new(windows::WindowsBackend::new(queue, config)?));
    }
    #[allow(unreachable_code)]
    {
        Ok(Box::new(poll::PollBackend::new(queue, config)?))
    }
}
