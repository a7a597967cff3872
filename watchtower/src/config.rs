//! Configuration types for the observer and its backends.

use std::time::Duration;
use watchtower_types::EventKindMask;

/// Indicates whether only the provided directory, or its sub-directories as well, should be
/// watched.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, Hash)]
pub enum RecursiveMode {
    /// Watch all sub-directories as well, including directories created after scheduling.
    Recursive,
    /// Watch only the provided directory.
    NonRecursive,
}

impl RecursiveMode {
    pub(crate) fn is_recursive(&self) -> bool {
        matches!(self, RecursiveMode::Recursive)
    }
}

/// Engine-wide configuration.
///
/// Some options only affect a subset of backends; every backend ignores the options it has no
/// use for, so a single `Config` can be constructed without knowing in advance which backend
/// will end up selected on the host.
///
/// ```rust
/// use std::time::Duration;
/// use watchtower::Config;
///
/// let config = Config::default()
///     .with_poll_interval(Duration::from_secs(2))
///     .with_compare_contents(true);
/// ```
#[derive(Clone, PartialEq, Eq, Debug, Hash)]
pub struct Config {
    poll_interval: Option<Duration>,
    compare_contents: bool,
    follow_symlinks: bool,
    event_kinds: EventKindMask,
    move_pairing_window: Duration,
    ignore_device: bool,
    emit_initial_catch_up: bool,
}

impl Config {
    /// Interval between each re-scan attempt of the polling backend. Expensive for large
    /// trees; measure and tune accordingly. Default is 1 second. Enables automatic polling.
    pub fn with_poll_interval(mut self, dur: Duration) -> Self {
        self.poll_interval = Some(dur);
        self
    }

    /// Current poll interval setting, `None` if manual polling is in effect.
    pub fn poll_interval(&self) -> Option<Duration> {
        self.poll_interval
    }

    /// Disables automatic polling; the caller must drive the polling backend manually.
    pub fn with_manual_polling(mut self) -> Self {
        self.poll_interval = None;
        self
    }

    /// For the polling backend: evaluate file contents with a fast hash to detect changes
    /// that don't move the modification time or size. Expensive; off by default.
    pub fn with_compare_contents(mut self, compare_contents: bool) -> Self {
        self.compare_contents = compare_contents;
        self
    }

    /// Current `compare_contents` setting.
    pub fn compare_contents(&self) -> bool {
        self.compare_contents
    }

    /// Whether symbolic links are followed while walking a recursive watch. On by default.
    pub fn with_follow_symlinks(mut self, follow_symlinks: bool) -> Self {
        self.follow_symlinks = follow_symlinks;
        self
    }

    /// Current `follow_symlinks` setting.
    pub fn follow_symlinks(&self) -> bool {
        self.follow_symlinks
    }

    /// Filters which event kinds reach the event queue at all. On backends with kernel-level
    /// filtering (inotify) this is translated into the native watch mask; elsewhere it is
    /// applied in userspace right after translation.
    ///
    /// Defaults to [`EventKindMask::ALL`]. Use [`EventKindMask::CORE`] to exclude access
    /// (open/close) events, which several backends cannot produce at all.
    pub fn with_event_kinds(mut self, event_kinds: EventKindMask) -> Self {
        self.event_kinds = event_kinds;
        self
    }

    /// Current event-kind mask.
    pub fn event_kinds(&self) -> EventKindMask {
        self.event_kinds
    }

    /// How long the inotify backend holds a lone `MOVED_FROM` waiting for its `MOVED_TO`
    /// counterpart before re-emitting it as a plain deletion. Default 10 ms; very large
    /// renames across filesystems may legitimately exceed this and will degrade to
    /// delete-then-create rather than a single move event.
    pub fn with_move_pairing_window(mut self, window: Duration) -> Self {
        self.move_pairing_window = window;
        self
    }

    /// Current move-pairing window.
    pub fn move_pairing_window(&self) -> Duration {
        self.move_pairing_window
    }

    /// Whether snapshot identity ignores the device/volume component, comparing by the bare
    /// inode or file index alone. Default `true` on POSIX (makes moves across mount
    /// boundaries visible as moves rather than delete+create); always `true` on Windows.
    pub fn with_ignore_device(mut self, ignore_device: bool) -> Self {
        self.ignore_device = ignore_device;
        self
    }

    /// Current `ignore_device` setting.
    pub fn ignore_device(&self) -> bool {
        self.ignore_device
    }

    /// Whether a newly scheduled watch synthesizes catch-up events for every entry already
    /// present in the tree (as if each had just been created), rather than starting from an
    /// empty baseline and only reporting changes from here on. Default `true`.
    pub fn with_emit_initial_catch_up(mut self, emit_initial_catch_up: bool) -> Self {
        self.emit_initial_catch_up = emit_initial_catch_up;
        self
    }

    /// Current `emit_initial_catch_up` setting.
    pub fn emit_initial_catch_up(&self) -> bool {
        self.emit_initial_catch_up
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_interval: Some(Duration::from_secs(1)),
            compare_contents: false,
            follow_symlinks: true,
            event_kinds: EventKindMask::ALL,
            move_pairing_window: Duration::from_millis(10),
            ignore_device: true,
            emit_initial_catch_up: true,
        }
    }
}

/// Per-path configuration for a single scheduled watch.
#[derive(Clone, Debug)]
pub struct WatchPathConfig {
    recursive_mode: RecursiveMode,
    event_filter: Option<Vec<&'static str>>,
}

impl WatchPathConfig {
    /// Creates a new per-watch configuration with the given recursion mode and no filter.
    pub fn new(recursive_mode: RecursiveMode) -> Self {
        Self {
            recursive_mode,
            event_filter: None,
        }
    }

    /// Sets the recursion mode.
    pub fn with_recursive_mode(mut self, recursive_mode: RecursiveMode) -> Self {
        self.recursive_mode = recursive_mode;
        self
    }

    /// Current recursion mode.
    pub fn recursive_mode(&self) -> RecursiveMode {
        self.recursive_mode
    }

    /// Restricts dispatch on this watch to the named event labels (see
    /// [`watchtower_types::Event::label`]). `None` means no filtering.
    pub fn with_event_filter(mut self, filter: Vec<&'static str>) -> Self {
        self.event_filter = Some(filter);
        self
    }

    /// Current event filter, if any.
    pub fn event_filter(&self) -> Option<&[&'static str]> {
        self.event_filter.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_default_event_kinds_is_all() {
        assert_eq!(Config::default().event_kinds(), EventKindMask::ALL);
    }

    #[test]
    fn config_with_event_kinds() {
        let mask = EventKindMask::CREATE | EventKindMask::REMOVE;
        let config = Config::default().with_event_kinds(mask);
        assert_eq!(config.event_kinds(), mask);
    }

    #[test]
    fn manual_polling_clears_interval() {
        let config = Config::default().with_manual_polling();
        assert_eq!(config.poll_interval(), None);
    }

    #[test]
    fn move_pairing_window_default_is_ten_millis() {
        assert_eq!(
            Config::default().move_pairing_window(),
            Duration::from_millis(10)
        );
    }

    #[test]
    fn emit_initial_catch_up_defaults_to_true_and_is_settable() {
        assert!(Config::default().emit_initial_catch_up());
        assert!(!Config::default().with_emit_initial_catch_up(false).emit_initial_catch_up());
    }
}
