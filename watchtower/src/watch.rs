//! The value handed back from scheduling a watch.

use std::path::Path;
use std::sync::Arc;

use crate::config::RecursiveMode;
use crate::error::Result;

/// A registration of a path, a recursion mode, and an optional event-label filter.
///
/// Two watches are equal, and hash equally, iff their `(path, recursive)` pair matches;
/// `event_filter` does not participate, matching the registry's "schedule the same pair
/// twice returns the same watch" contract. The path is canonicalized once, at construction
/// time, and never recomputed — this is what lets Windows junctions and reparse points be
/// compared consistently for the life of the watch.
#[derive(Clone, Debug)]
pub struct ObservedWatch {
    path: Arc<Path>,
    recursive: bool,
    event_filter: Option<Arc<[&'static str]>>,
}

impl ObservedWatch {
    /// Builds a watch for `path`, canonicalizing it immediately.
    pub(crate) fn new(
        path: &Path,
        recursive: bool,
        event_filter: Option<Vec<&'static str>>,
    ) -> Result<Self> {
        let canonical = std::fs::canonicalize(path).map_err(|err| {
            crate::error::Error::from(err).add_path(path.to_path_buf())
        })?;
        Ok(Self {
            path: Arc::from(canonical.into_boxed_path()),
            recursive,
            event_filter: event_filter.map(Arc::from),
        })
    }

    /// The canonicalized, absolute path this watch covers.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether this watch covers the subtree or only the named directory.
    pub fn recursive(&self) -> bool {
        self.recursive
    }

    /// The allowlist of event labels this watch dispatches, if restricted.
    pub fn event_filter(&self) -> Option<&[&'static str]> {
        self.event_filter.as_deref()
    }

    /// Whether an event with the given label passes this watch's filter.
    pub fn accepts(&self, label: &str) -> bool {
        match &self.event_filter {
            None => true,
            Some(allowed) => allowed.iter().any(|l| *l == label),
        }
    }

    /// Whether `path` falls under this watch given its recursion mode.
    pub fn covers(&self, path: &Path) -> bool {
        if !path.starts_with(&*self.path) {
            return false;
        }
        if self.recursive {
            return true;
        }
        path.parent() == Some(&*self.path) || path == &*self.path
    }
}

impl PartialEq for ObservedWatch {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path && self.recursive == other.recursive
    }
}
impl Eq for ObservedWatch {}

impl std::hash::Hash for ObservedWatch {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.path.hash(state);
        self.recursive.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_path_and_recursion_are_equal() {
        let dir = tempfile::tempdir().unwrap();
        let a = ObservedWatch::new(dir.path(), true, None).unwrap();
        let b = ObservedWatch::new(dir.path(), true, None).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn different_recursion_is_not_equal() {
        let dir = tempfile::tempdir().unwrap();
        let a = ObservedWatch::new(dir.path(), true, None).unwrap();
        let b = ObservedWatch::new(dir.path(), false, None).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn covers_respects_recursive_flag() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let recursive = ObservedWatch::new(dir.path(), true, None).unwrap();
        let non_recursive = ObservedWatch::new(dir.path(), false, None).unwrap();
        let nested = dir.path().join("sub").join("f");
        assert!(recursive.covers(&nested));
        assert!(!non_recursive.covers(&nested));
    }
}
