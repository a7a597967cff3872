//! The directory snapshot engine: a walker that builds an identity-keyed map, and a
//! structural differ that turns two snapshots into canonical events.
//!
//! This underpins the polling backend and is reused by several kernel backends to produce
//! synthetic catch-up events after an overflow or when a new subdirectory needs replaying.

use std::collections::HashMap;
use std::fs::Metadata;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use watchtower_fileid::{get_file_id, FileId};
use watchtower_types::Event;

/// The stable identity of one snapshot entry, honoring `ignore_device`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum Identity {
    /// Identity includes the device/volume component.
    WithDevice(FileId),
    /// Identity ignores the device/volume component (only the bare inode/index matters).
    Bare(u128),
}

fn identity_of(file_id: FileId, ignore_device: bool) -> Identity {
    if ignore_device {
        let bare = match file_id {
            FileId::Inode { inode_number, .. } => inode_number as u128,
            FileId::LowRes { file_index, .. } => file_index as u128,
            FileId::HighRes { file_id, .. } => file_id,
        };
        Identity::Bare(bare)
    } else {
        Identity::WithDevice(file_id)
    }
}

/// What kind of filesystem object a snapshot entry describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryType {
    /// A regular file.
    File,
    /// A directory.
    Directory,
}

/// One entry in a [`Snapshot`].
#[derive(Clone, Debug)]
pub struct SnapshotEntry {
    /// Absolute path of the entry at the time the snapshot was taken.
    pub path: PathBuf,
    /// Last-modified time, used to detect in-place modification.
    pub mtime: SystemTime,
    /// Size in bytes (0 for directories).
    pub size: u64,
    /// Whether this is a file or a directory.
    pub entry_type: EntryType,
    identity: Identity,
}

/// An immutable record of a directory tree's contents and metadata at one instant.
#[derive(Clone, Debug, Default)]
pub struct Snapshot {
    by_identity: HashMap<Identity, SnapshotEntry>,
}

impl Snapshot {
    pub(crate) fn empty() -> Self {
        Self {
            by_identity: HashMap::new(),
        }
    }

    /// Number of entries recorded.
    pub fn len(&self) -> usize {
        self.by_identity.len()
    }

    /// Whether the snapshot has no entries.
    pub fn is_empty(&self) -> bool {
        self.by_identity.is_empty()
    }

    /// Iterates every recorded entry, in no particular order.
    pub fn entries(&self) -> impl Iterator<Item = &SnapshotEntry> {
        self.by_identity.values()
    }
}

/// Injectable metadata lookup, so tests can mock I/O without touching a real filesystem.
pub trait StatProvider: Send + Sync {
    /// Returns metadata for `path`, or an I/O error (e.g. permission denied, vanished entry).
    fn stat(&self, path: &Path) -> io::Result<Metadata>;
    /// Returns the stable identity for `path`.
    fn identity(&self, path: &Path) -> io::Result<FileId>;
}

/// Default stat provider, backed by `std::fs` and `watchtower_fileid`.
pub struct DefaultStatProvider;

impl StatProvider for DefaultStatProvider {
    fn stat(&self, path: &Path) -> io::Result<Metadata> {
        std::fs::symlink_metadata(path)
    }
    fn identity(&self, path: &Path) -> io::Result<FileId> {
        get_file_id(path)
    }
}

/// Walks a tree once, building an identity-keyed [`Snapshot`].
///
/// Symlinks are never followed; an unreadable directory is skipped with no error, matching
/// the watcher's own tolerance for permission races during a recursive walk.
pub struct Walker {
    stat_provider: Box<dyn StatProvider>,
    ignore_device: bool,
}

impl Default for Walker {
    fn default() -> Self {
        Self {
            stat_provider: Box::new(DefaultStatProvider),
            ignore_device: true,
        }
    }
}

impl Walker {
    /// Builds a walker with the default, real-filesystem stat provider.
    pub fn new(ignore_device: bool) -> Self {
        Self {
            stat_provider: Box::new(DefaultStatProvider),
            ignore_device,
        }
    }

    /// Builds a walker with an injected stat provider, for tests.
    pub fn with_stat_provider(stat_provider: Box<dyn StatProvider>, ignore_device: bool) -> Self {
        Self {
            stat_provider,
            ignore_device,
        }
    }

    /// Walks `root`, recursing into subdirectories when `recursive` is set.
    pub fn walk(&self, root: &Path, recursive: bool) -> Snapshot {
        let mut snapshot = Snapshot::empty();
        self.walk_into(root, recursive, &mut snapshot);
        snapshot
    }

    fn walk_into(&self, root: &Path, recursive: bool, snapshot: &mut Snapshot) {
        let walker = walkdir::WalkDir::new(root)
            .follow_links(false)
            .min_depth(1)
            .max_depth(if recursive { usize::MAX } else { 1 });

        for entry in walker.into_iter().filter_map(|e| e.ok()) {
            let path = entry.path();
            let meta = match self.stat_provider.stat(path) {
                Ok(meta) => meta,
                Err(err) => {
                    log::debug!("skipping {} during walk: {err}", path.display());
                    continue;
                }
            };
            if meta.file_type().is_symlink() {
                continue;
            }
            let file_id = match self.stat_provider.identity(path) {
                Ok(id) => id,
                Err(err) => {
                    log::debug!("skipping {} (no identity): {err}", path.display());
                    continue;
                }
            };
            let entry_type = if meta.is_dir() {
                EntryType::Directory
            } else {
                EntryType::File
            };
            let snapshot_entry = SnapshotEntry {
                path: path.to_path_buf(),
                mtime: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                size: meta.len(),
                entry_type,
                identity: identity_of(file_id, self.ignore_device),
            };
            // Tie-break: prefer the entry with the newer mtime if two paths claim one identity.
            match snapshot.by_identity.get(&snapshot_entry.identity) {
                Some(existing) if existing.mtime >= snapshot_entry.mtime => {}
                _ => {
                    snapshot
                        .by_identity
                        .insert(snapshot_entry.identity, snapshot_entry);
                }
            }
        }
    }
}

/// Produces the canonical events that transform `prev` into `cur`.
///
/// Ordering within the returned vector follows §4.2: moves first, then creations
/// (directories before files), then modifications, then deletions (files before
/// directories). Every produced event has `is_synthetic` set.
pub fn diff(prev: &Snapshot, cur: &Snapshot) -> Vec<Event> {
    let mut events = Vec::new();

    let mut created: Vec<&SnapshotEntry> = Vec::new();
    let mut deleted: Vec<&SnapshotEntry> = Vec::new();
    let mut moved: Vec<(&SnapshotEntry, &SnapshotEntry)> = Vec::new();
    let mut modified: Vec<&SnapshotEntry> = Vec::new();

    for (identity, cur_entry) in &cur.by_identity {
        match prev.by_identity.get(identity) {
            None => created.push(cur_entry),
            Some(prev_entry) if prev_entry.path != cur_entry.path => {
                moved.push((prev_entry, cur_entry));
            }
            Some(prev_entry) => {
                if prev_entry.mtime != cur_entry.mtime || prev_entry.size != cur_entry.size {
                    modified.push(cur_entry);
                }
            }
        }
    }
    for (identity, prev_entry) in &prev.by_identity {
        if !cur.by_identity.contains_key(identity) {
            deleted.push(prev_entry);
        }
    }

    for (from, to) in &moved {
        let event = match to.entry_type {
            EntryType::Directory => {
                Event::dir_moved(from.path.clone(), to.path.clone())
            }
            EntryType::File => Event::file_moved(from.path.clone(), to.path.clone()),
        };
        events.push(event.set_synthetic(true));
    }

    created.sort_by_key(|e| e.entry_type != EntryType::Directory);
    for entry in created {
        let event = match entry.entry_type {
            EntryType::Directory => Event::dir_created(entry.path.clone()),
            EntryType::File => Event::file_created(entry.path.clone()),
        };
        events.push(event.set_synthetic(true));
    }

    for entry in modified {
        let event = match entry.entry_type {
            EntryType::Directory => Event::dir_modified(entry.path.clone()),
            EntryType::File => Event::file_modified(entry.path.clone()),
        };
        events.push(event.set_synthetic(true));
    }

    deleted.sort_by_key(|e| e.entry_type == EntryType::Directory);
    for entry in deleted {
        let event = match entry.entry_type {
            EntryType::Directory => Event::dir_deleted(entry.path.clone()),
            EntryType::File => Event::file_deleted(entry.path.clone()),
        };
        events.push(event.set_synthetic(true));
    }

    events
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff_of_identical_snapshots_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), b"hi").unwrap();
        let walker = Walker::new(true);
        let s1 = walker.walk(dir.path(), true);
        let s2 = walker.walk(dir.path(), true);
        assert!(diff(&s1, &s2).is_empty());
    }

    #[test]
    fn new_file_appears_as_synthetic_creation() {
        let dir = tempfile::tempdir().unwrap();
        let walker = Walker::new(true);
        let s1 = walker.walk(dir.path(), true);
        std::fs::write(dir.path().join("a"), b"hi").unwrap();
        let s2 = walker.walk(dir.path(), true);
        let events = diff(&s1, &s2);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].label(), "file_created");
        assert!(events[0].is_synthetic);
    }

    #[test]
    fn rename_is_reported_as_a_single_move() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), b"hi").unwrap();
        let walker = Walker::new(true);
        let s1 = walker.walk(dir.path(), true);
        std::fs::rename(dir.path().join("a"), dir.path().join("b")).unwrap();
        let s2 = walker.walk(dir.path(), true);
        let events = diff(&s1, &s2);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].label(), "file_moved");
    }

    #[test]
    fn directories_are_created_before_their_contents() {
        let dir = tempfile::tempdir().unwrap();
        let walker = Walker::new(true);
        let s1 = walker.walk(dir.path(), true);
        std::fs::create_dir(dir.path().join("d")).unwrap();
        std::fs::write(dir.path().join("d").join("f"), b"hi").unwrap();
        let s2 = walker.walk(dir.path(), true);
        let events = diff(&s1, &s2);
        let dir_idx = events.iter().position(|e| e.label() == "dir_created");
        let file_idx = events.iter().position(|e| e.label() == "file_created");
        assert!(dir_idx.unwrap() < file_idx.unwrap());
    }

    #[test]
    fn deleted_files_precede_deleted_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("d")).unwrap();
        std::fs::write(dir.path().join("d").join("f"), b"hi").unwrap();
        let walker = Walker::new(true);
        let s1 = walker.walk(dir.path(), true);
        std::fs::remove_dir_all(dir.path().join("d")).unwrap();
        let s2 = walker.walk(dir.path(), true);
        let events = diff(&s1, &s2);
        let dir_idx = events.iter().position(|e| e.label() == "dir_deleted");
        let file_idx = events.iter().position(|e| e.label() == "file_deleted");
        assert!(file_idx.unwrap() < dir_idx.unwrap());
    }

    #[test]
    fn non_recursive_walk_ignores_nested_entries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("d")).unwrap();
        std::fs::write(dir.path().join("d").join("f"), b"hi").unwrap();
        let walker = Walker::new(true);
        let snapshot = walker.walk(dir.path(), false);
        // only "d" itself should appear, not "d/f" nor the root
        assert_eq!(snapshot.len(), 1);
    }
}
