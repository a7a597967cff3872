//! The `Event` type and the hierarchical `EventKind` descriptor.
//!
//! Events are produced by backend adapters from raw kernel notifications, or synthesized by
//! the directory-snapshot differ. The kind hierarchy mirrors what a kernel notification
//! actually carries (a coarse transition plus, sometimes, detail about it); the flat
//! `file_created`/`dir_created`/… wire identifiers consumers filter on are a derived view
//! over this hierarchy, computed by [`Event::label`].

use std::{
    fmt,
    hash::{Hash, Hasher},
    path::PathBuf,
};

use bitflags::bitflags;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// An event describing open or close operations on files.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum AccessMode {
    /// The catch-all case, to be used when the specific kind of event is unknown.
    Any,
    /// An event emitted when the file is executed, or the folder opened.
    Execute,
    /// An event emitted when the file is opened for reading.
    Read,
    /// An event emitted when the file is opened for writing.
    Write,
    /// An event which specific kind is known but cannot be represented otherwise.
    Other,
}

/// An event describing non-mutating access operations on files.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "kind", content = "mode"))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum AccessKind {
    /// The catch-all case, to be used when the specific kind of event is unknown.
    Any,
    /// An event emitted when the file is read.
    Read,
    /// An event emitted when the file, or a handle to the file, is opened.
    Open(AccessMode),
    /// An event emitted when the file, or a handle to the file, is closed.
    Close(AccessMode),
    /// An event which specific kind is known but cannot be represented otherwise.
    Other,
}

/// An event describing creation operations on files.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "kind"))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum CreateKind {
    /// The catch-all case, to be used when the specific kind of event is unknown.
    Any,
    /// An event which results in the creation of a file.
    File,
    /// An event which results in the creation of a folder.
    Folder,
    /// An event which specific kind is known but cannot be represented otherwise.
    Other,
}

/// An event emitted when the data content of a file is changed.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum DataChange {
    /// The catch-all case, to be used when the specific kind of event is unknown.
    Any,
    /// An event emitted when the size of the data is changed.
    Size,
    /// An event emitted when the content of the data is changed.
    Content,
    /// An event which specific kind is known but cannot be represented otherwise.
    Other,
}

/// An event emitted when the metadata of a file or folder is changed.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum MetadataKind {
    /// The catch-all case, to be used when the specific kind of event is unknown.
    Any,
    /// An event emitted when the access time of the file or folder is changed.
    AccessTime,
    /// An event emitted when the write or modify time of the file or folder is changed.
    WriteTime,
    /// An event emitted when the permissions of the file or folder are changed.
    Permissions,
    /// An event emitted when the ownership of the file or folder is changed.
    Ownership,
    /// An event emitted when an extended attribute of the file or folder is changed.
    Extended,
    /// An event which specific kind is known but cannot be represented otherwise.
    Other,
}

/// An event emitted when the name of a file or folder is changed.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum RenameMode {
    /// The catch-all case, to be used when the specific kind of event is unknown.
    Any,
    /// An event emitted on the file or folder resulting from a rename.
    To,
    /// An event emitted on the file or folder that was renamed.
    From,
    /// A single event emitted with both the `From` and `To` paths known.
    Both,
    /// An event which specific kind is known but cannot be represented otherwise.
    Other,
}

/// An event describing mutation of content, name, or metadata.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "kind", content = "mode"))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum ModifyKind {
    /// The catch-all case, to be used when the specific kind of event is unknown.
    Any,
    /// An event emitted when the data content of a file is changed.
    Data(DataChange),
    /// An event emitted when the metadata of a file or folder is changed.
    Metadata(MetadataKind),
    /// An event emitted when the name of a file or folder is changed.
    #[cfg_attr(feature = "serde", serde(rename = "rename"))]
    Name(RenameMode),
    /// An event which specific kind is known but cannot be represented otherwise.
    Other,
}

/// An event describing removal operations on files.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "kind"))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum RemoveKind {
    /// The catch-all case, to be used when the specific kind of event is unknown.
    Any,
    /// An event emitted when a file is removed.
    File,
    /// An event emitted when a folder is removed.
    Folder,
    /// An event which specific kind is known but cannot be represented otherwise.
    Other,
}

/// Top-level event kind.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
#[cfg_attr(feature = "serde", serde(tag = "type"))]
pub enum EventKind {
    /// The catch-all event kind, for unsupported/unknown events.
    #[default]
    Any,
    /// Non-mutating access operations: open, close, execute.
    Access(AccessKind),
    /// Creation of files, folders, or other structures.
    Create(CreateKind),
    /// Mutation of content, name, or metadata.
    Modify(ModifyKind),
    /// Removal of files, folders, or other structures.
    Remove(RemoveKind),
    /// An event not fitting in any of the above four categories.
    Other,
}

impl EventKind {
    /// Indicates whether an event is an Access variant.
    pub fn is_access(&self) -> bool {
        matches!(self, EventKind::Access(_))
    }
    /// Indicates whether an event is a Create variant.
    pub fn is_create(&self) -> bool {
        matches!(self, EventKind::Create(_))
    }
    /// Indicates whether an event is a Modify variant.
    pub fn is_modify(&self) -> bool {
        matches!(self, EventKind::Modify(_))
    }
    /// Indicates whether an event is a Remove variant.
    pub fn is_remove(&self) -> bool {
        matches!(self, EventKind::Remove(_))
    }
}

bitflags! {
    /// A bitmask specifying which event kinds to monitor or forward.
    ///
    /// On backends that support kernel-level filtering (inotify), the mask is translated to
    /// native flags before the syscall is made. On other backends (kqueue, Windows, FSEvents,
    /// the polling backend), filtering is applied in userspace after translation.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
    pub struct EventKindMask: u32 {
        /// Monitor file/folder creation events.
        const CREATE = 0b0000_0001;
        /// Monitor file/folder removal events.
        const REMOVE = 0b0000_0010;
        /// Monitor data modification events (content/size changes).
        const MODIFY_DATA = 0b0000_0100;
        /// Monitor metadata modification events (permissions, timestamps, etc).
        const MODIFY_META = 0b0000_1000;
        /// Monitor name/rename events.
        const MODIFY_NAME = 0b0001_0000;
        /// Monitor file open events.
        const ACCESS_OPEN = 0b0010_0000;
        /// Monitor close-after-write events.
        const ACCESS_CLOSE = 0b0100_0000;
        /// Monitor close-after-read-only events. Can be very noisy.
        const ACCESS_CLOSE_NOWRITE = 0b1000_0000;

        /// All modify events (data, metadata, and name changes).
        const ALL_MODIFY = Self::MODIFY_DATA.bits() | Self::MODIFY_META.bits() | Self::MODIFY_NAME.bits();
        /// All access events (open, close-write, and close-nowrite).
        const ALL_ACCESS = Self::ACCESS_OPEN.bits() | Self::ACCESS_CLOSE.bits() | Self::ACCESS_CLOSE_NOWRITE.bits();
        /// Create, remove, and all modify events. Excludes access events for cross-platform parity.
        const CORE = Self::CREATE.bits() | Self::REMOVE.bits() | Self::ALL_MODIFY.bits();
        /// All events including access events.
        const ALL = Self::CORE.bits() | Self::ALL_ACCESS.bits();
    }
}

impl Default for EventKindMask {
    fn default() -> Self {
        EventKindMask::ALL
    }
}

impl EventKindMask {
    /// Returns whether the given event kind matches this mask.
    ///
    /// `EventKind::Any` and `EventKind::Other` always pass, since they represent meta-events
    /// that should not be filtered.
    pub fn matches(&self, kind: &EventKind) -> bool {
        match kind {
            EventKind::Any | EventKind::Other => true,
            EventKind::Create(_) => self.intersects(EventKindMask::CREATE),
            EventKind::Remove(_) => self.intersects(EventKindMask::REMOVE),
            EventKind::Modify(modify_kind) => match modify_kind {
                ModifyKind::Data(_) => self.intersects(EventKindMask::MODIFY_DATA),
                ModifyKind::Metadata(_) => self.intersects(EventKindMask::MODIFY_META),
                ModifyKind::Name(_) => self.intersects(EventKindMask::MODIFY_NAME),
                ModifyKind::Any | ModifyKind::Other => self.intersects(EventKindMask::ALL_MODIFY),
            },
            EventKind::Access(access_kind) => match access_kind {
                AccessKind::Open(_) => self.intersects(EventKindMask::ACCESS_OPEN),
                AccessKind::Close(AccessMode::Write) => {
                    self.intersects(EventKindMask::ACCESS_CLOSE)
                }
                AccessKind::Close(AccessMode::Read) => {
                    self.intersects(EventKindMask::ACCESS_CLOSE_NOWRITE)
                }
                AccessKind::Close(_) => self
                    .intersects(EventKindMask::ACCESS_CLOSE | EventKindMask::ACCESS_CLOSE_NOWRITE),
                AccessKind::Read | AccessKind::Any | AccessKind::Other => {
                    self.intersects(EventKindMask::ALL_ACCESS)
                }
            },
        }
    }
}

/// Special flag on the event.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub enum Flag {
    /// Some events may have been missed; an application holding in-memory state should refresh
    /// it directly from the filesystem rather than trust the stream so far.
    Rescan,
    /// The watch that produced this event has stopped itself (its root directory is gone, or
    /// the backend lost access to it). This is always the last event the watch will ever
    /// produce; the registry unschedules it on sight.
    EmitterStopped,
}

/// Additional attributes of the event.
#[derive(Clone, Default, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct EventAttributes {
    #[cfg_attr(feature = "serde", serde(flatten))]
    inner: Option<Box<EventAttributesInner>>,
}

#[derive(Clone, Default, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
struct EventAttributesInner {
    #[cfg_attr(
        feature = "serde",
        serde(default, skip_serializing_if = "Option::is_none")
    )]
    tracker: Option<usize>,
    #[cfg_attr(
        feature = "serde",
        serde(default, skip_serializing_if = "Option::is_none")
    )]
    flag: Option<Flag>,
    #[cfg_attr(
        feature = "serde",
        serde(default, skip_serializing_if = "Option::is_none")
    )]
    info: Option<String>,
    #[cfg_attr(
        feature = "serde",
        serde(default, skip_serializing_if = "Option::is_none")
    )]
    source: Option<String>,
    #[cfg_attr(
        feature = "serde",
        serde(default, skip_serializing, skip_deserializing)
    )]
    process_id: Option<u32>,
}

impl EventAttributes {
    /// Creates a new, empty `EventAttributes`.
    pub fn new() -> Self {
        Self { inner: None }
    }

    /// Retrieves the tracker ID for an event, if present.
    pub fn tracker(&self) -> Option<usize> {
        self.inner.as_ref().and_then(|inner| inner.tracker)
    }

    /// Retrieves the flag for an event, if present.
    pub fn flag(&self) -> Option<Flag> {
        self.inner.as_ref().and_then(|inner| inner.flag)
    }

    /// Retrieves additional info for an event, if present.
    pub fn info(&self) -> Option<&str> {
        self.inner.as_ref().and_then(|inner| inner.info.as_deref())
    }

    /// Retrieves the source for an event, if present.
    pub fn source(&self) -> Option<&str> {
        self.inner
            .as_ref()
            .and_then(|inner| inner.source.as_deref())
    }

    /// The process ID of the originator of the event, if known.
    pub fn process_id(&self) -> Option<u32> {
        self.inner.as_ref().and_then(|inner| inner.process_id)
    }

    /// Sets the tracker.
    pub fn set_tracker(&mut self, tracker: usize) {
        self.inner_mut().tracker = Some(tracker);
    }

    /// Sets the flag.
    pub fn set_flag(&mut self, flag: Flag) {
        self.inner_mut().flag = Some(flag);
    }

    /// Sets additional info.
    pub fn set_info(&mut self, info: &str) {
        self.inner_mut().info = Some(info.to_string());
    }

    /// Sets the process id.
    pub fn set_process_id(&mut self, process_id: u32) {
        self.inner_mut().process_id = Some(process_id);
    }

    fn inner_mut(&mut self) -> &mut EventAttributesInner {
        self.inner.get_or_insert_with(Box::default)
    }
}

/// A canonical filesystem event.
///
/// `kind` and `paths` give the hierarchical classification; [`Event::is_directory`] and
/// [`Event::is_synthetic`] carry the two attributes every event in the observation engine
/// always has, regardless of which backend produced it. [`Event::label`] renders the flat,
/// stable wire name (`file_created`, `dir_moved`, …) that consumers filter on.
#[derive(Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Event {
    /// Kind or type of the event.
    #[cfg_attr(feature = "serde", serde(flatten))]
    pub kind: EventKind,

    /// Paths the event is about. For `Modify(Name(Both))` (a move/rename), the source path is
    /// first and the destination path is last.
    pub paths: Vec<PathBuf>,

    /// Whether the path this event concerns is a directory rather than a plain file.
    pub is_directory: bool,

    /// True when this event was produced by the directory-snapshot differ or a catch-up walk
    /// rather than directly from a kernel notification.
    pub is_synthetic: bool,

    /// Additional, less commonly used attributes.
    #[cfg_attr(feature = "serde", serde(default))]
    pub attrs: EventAttributes,
}

impl Event {
    /// Returns whether some events may have been missed and in-memory state should be refreshed.
    pub fn need_rescan(&self) -> bool {
        matches!(self.flag(), Some(Flag::Rescan))
    }

    /// Retrieves the tracker ID for an event, if present.
    pub fn tracker(&self) -> Option<usize> {
        self.attrs.tracker()
    }

    /// Retrieves the flag for an event, if present.
    pub fn flag(&self) -> Option<Flag> {
        self.attrs.flag()
    }

    /// Retrieves additional info for an event, if present.
    pub fn info(&self) -> Option<&str> {
        self.attrs.info()
    }

    /// The path the event concerns. Absent only for a bare catch-all event.
    pub fn src_path(&self) -> Option<&std::path::Path> {
        self.paths.first().map(std::path::PathBuf::as_path)
    }

    /// The destination path of a move/rename event, if this event has one.
    pub fn dest_path(&self) -> Option<&std::path::Path> {
        if self.paths.len() > 1 {
            self.paths.last().map(std::path::PathBuf::as_path)
        } else {
            None
        }
    }

    /// Creates a new `Event` with the given kind and no paths.
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            paths: Vec::new(),
            is_directory: false,
            is_synthetic: false,
            attrs: EventAttributes::new(),
        }
    }

    /// Adds a path to the event.
    pub fn add_path(mut self, path: PathBuf) -> Self {
        self.paths.push(path);
        self
    }

    /// Marks whether the event concerns a directory.
    pub fn set_directory(mut self, is_directory: bool) -> Self {
        self.is_directory = is_directory;
        self
    }

    /// Marks the event as synthetic (produced by snapshot diffing or a catch-up walk).
    pub fn set_synthetic(mut self, is_synthetic: bool) -> Self {
        self.is_synthetic = is_synthetic;
        self
    }

    /// Sets the tracker (used to correlate the two halves of a pending move).
    pub fn set_tracker(mut self, tracker: usize) -> Self {
        self.attrs.set_tracker(tracker);
        self
    }

    /// Sets the rescan flag.
    pub fn set_flag(mut self, flag: Flag) -> Self {
        self.attrs.set_flag(flag);
        self
    }

    /// Sets additional info.
    pub fn set_info(mut self, info: &str) -> Self {
        self.attrs.set_info(info);
        self
    }

    /// Sets the process id of the event's originator.
    pub fn set_process_id(mut self, process_id: u32) -> Self {
        self.attrs.set_process_id(process_id);
        self
    }

    /// A file was created at `path`.
    pub fn file_created(path: PathBuf) -> Self {
        Self::new(EventKind::Create(CreateKind::File)).add_path(path)
    }

    /// A directory was created at `path`.
    pub fn dir_created(path: PathBuf) -> Self {
        Self::new(EventKind::Create(CreateKind::Folder))
            .add_path(path)
            .set_directory(true)
    }

    /// A file was deleted.
    pub fn file_deleted(path: PathBuf) -> Self {
        Self::new(EventKind::Remove(RemoveKind::File)).add_path(path)
    }

    /// A directory was deleted.
    pub fn dir_deleted(path: PathBuf) -> Self {
        Self::new(EventKind::Remove(RemoveKind::Folder))
            .add_path(path)
            .set_directory(true)
    }

    /// A file's content or size changed.
    pub fn file_modified(path: PathBuf) -> Self {
        Self::new(EventKind::Modify(ModifyKind::Data(DataChange::Any))).add_path(path)
    }

    /// A directory's metadata changed.
    pub fn dir_modified(path: PathBuf) -> Self {
        Self::new(EventKind::Modify(ModifyKind::Metadata(MetadataKind::Any)))
            .add_path(path)
            .set_directory(true)
    }

    /// A file was moved from `src` to `dest`.
    pub fn file_moved(src: PathBuf, dest: PathBuf) -> Self {
        Self::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(src)
            .add_path(dest)
    }

    /// A directory was moved from `src` to `dest`.
    pub fn dir_moved(src: PathBuf, dest: PathBuf) -> Self {
        Self::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(src)
            .add_path(dest)
            .set_directory(true)
    }

    /// A file was opened.
    pub fn file_opened(path: PathBuf) -> Self {
        Self::new(EventKind::Access(AccessKind::Open(AccessMode::Any))).add_path(path)
    }

    /// A file opened for writing was closed.
    pub fn file_closed(path: PathBuf) -> Self {
        Self::new(EventKind::Access(AccessKind::Close(AccessMode::Write))).add_path(path)
    }

    /// A file opened read-only was closed.
    pub fn file_closed_no_write(path: PathBuf) -> Self {
        Self::new(EventKind::Access(AccessKind::Close(AccessMode::Read))).add_path(path)
    }

    /// The stable, wire-independent identifier for this event's kind, as used for filtering
    /// (`file_created`, `dir_moved`, …). Falls back to `"any"` / `"other"` for meta-events.
    pub fn label(&self) -> &'static str {
        match (&self.kind, self.is_directory) {
            (EventKind::Create(_), false) => "file_created",
            (EventKind::Create(_), true) => "dir_created",
            (EventKind::Remove(_), false) => "file_deleted",
            (EventKind::Remove(_), true) => "dir_deleted",
            (EventKind::Modify(ModifyKind::Name(_)), false) => "file_moved",
            (EventKind::Modify(ModifyKind::Name(_)), true) => "dir_moved",
            (EventKind::Modify(_), false) => "file_modified",
            (EventKind::Modify(_), true) => "dir_modified",
            (EventKind::Access(AccessKind::Open(_)), _) => "file_opened",
            (EventKind::Access(AccessKind::Close(AccessMode::Read)), _) => "file_closed_no_write",
            (EventKind::Access(_), _) => "file_closed",
            (EventKind::Any, _) => "any",
            (EventKind::Other, _) => "other",
        }
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Event")
            .field("kind", &self.kind)
            .field("label", &self.label())
            .field("paths", &self.paths)
            .field("is_directory", &self.is_directory)
            .field("is_synthetic", &self.is_synthetic)
            .field("attr:tracker", &self.tracker())
            .field("attr:flag", &self.flag())
            .field("attr:info", &self.info())
            .finish()
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new(EventKind::default())
    }
}

impl Eq for Event {}
impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.kind.eq(&other.kind)
            && self.paths.eq(&other.paths)
            && self.is_directory.eq(&other.is_directory)
            && self.tracker().eq(&other.tracker())
            && self.flag().eq(&other.flag())
            && self.info().eq(&other.info())
    }
}

impl Hash for Event {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind.hash(state);
        self.paths.hash(state);
        self.is_directory.hash(state);
        self.tracker().hash(state);
        self.flag().hash(state);
        self.info().hash(state);
    }
}
