//! The engine's error taxonomy.

use std::{fmt, io, path::PathBuf};

/// Convenience alias for fallible engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The kind of failure behind an [`Error`].
#[derive(Debug)]
pub enum ErrorKind {
    /// A path named in `schedule`/`unwatch` does not exist.
    PathNotFound,

    /// An operation referenced a watch the registry does not know about.
    ///
    /// `unschedule` on an already-dead watch still succeeds silently at the public API; this
    /// variant exists for internal bookkeeping and is surfaced through logs, not returned from
    /// `unschedule` itself.
    WatchNotFound,

    /// A kernel-side resource was exhausted (inotify user-watch limit, kqueue descriptor
    /// ceiling, a Windows handle limit).
    MaxFilesWatch,

    /// A provided [`crate::Config`] was structurally invalid.
    InvalidConfig(String),

    /// The observer was used out of order (`schedule` after `stop`, `stop` before `start`).
    IllegalState(String),

    /// Catch-all for conditions that do not warrant a dedicated variant.
    Generic(String),

    /// Transparent passthrough of an underlying OS error not otherwise classified.
    Io(io::Error),
}

/// An error produced by the observation engine, naming the kind of failure and any paths
/// involved.
#[derive(Debug)]
pub struct Error {
    /// The kind of failure.
    pub kind: ErrorKind,
    /// Paths associated with the failure, if any (may be empty).
    pub paths: Vec<PathBuf>,
}

impl Error {
    /// Builds an error with no associated paths.
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            paths: Vec::new(),
        }
    }

    /// Attaches a path to this error.
    pub fn add_path(mut self, path: PathBuf) -> Self {
        self.paths.push(path);
        self
    }

    /// Shorthand for [`ErrorKind::PathNotFound`].
    pub fn path_not_found(path: PathBuf) -> Self {
        Self::new(ErrorKind::PathNotFound).add_path(path)
    }

    /// Shorthand for [`ErrorKind::MaxFilesWatch`].
    pub fn max_files_watch(path: PathBuf) -> Self {
        Self::new(ErrorKind::MaxFilesWatch).add_path(path)
    }

    /// Shorthand for [`ErrorKind::Generic`].
    pub fn generic(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Generic(message.into()))
    }

    /// Shorthand for [`ErrorKind::IllegalState`].
    pub fn illegal_state(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::IllegalState(message.into()))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.kind {
            ErrorKind::PathNotFound => write!(f, "path not found")?,
            ErrorKind::WatchNotFound => write!(f, "watch not found")?,
            ErrorKind::MaxFilesWatch => write!(f, "device/resource exhausted watching files")?,
            ErrorKind::InvalidConfig(msg) => write!(f, "invalid config: {msg}")?,
            ErrorKind::IllegalState(msg) => write!(f, "illegal state: {msg}")?,
            ErrorKind::Generic(msg) => write!(f, "{msg}")?,
            ErrorKind::Io(err) => write!(f, "io error: {err}")?,
        }
        if !self.paths.is_empty() {
            write!(f, " (")?;
            for (i, path) in self.paths.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", path.display())?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            ErrorKind::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::new(ErrorKind::PathNotFound),
            _ => Self::new(ErrorKind::Io(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_not_found_maps_to_path_not_found() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "nope");
        let err: Error = io_err.into();
        assert!(matches!(err.kind, ErrorKind::PathNotFound));
    }

    #[test]
    fn display_includes_paths() {
        let err = Error::path_not_found("/tmp/x".into());
        assert!(err.to_string().contains("/tmp/x"));
    }
}
