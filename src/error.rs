//! Error types for journal operations
//!
//! Every fallible operation returns [`Result`], whose error carries a
//! [`ErrorKind`] describing what went wrong plus the OS errno when the
//! failure came out of a system call. The journal context additionally
//! remembers the most recent error so callers that drive the journal
//! through several calls can ask "what happened last" without threading
//! the error value themselves.

use thiserror::Error;

/// The category of a journal failure.
///
/// Kinds mirror the stages of the on-disk protocol: context state checks,
/// directory and metastore handling, per-file I/O on segments and indexes,
/// and subscriber checkpoint management.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ErrorKind {
    /// `init` called on a context that is not freshly created
    #[error("context already initialized or opened")]
    IllegalInit,
    /// `open_writer`/`open_reader` called on a context that is not freshly created
    #[error("context already opened")]
    IllegalOpen,
    /// The journal directory could not be opened or examined
    #[error("cannot open journal")]
    Open,
    /// The journal path exists but is not a directory
    #[error("journal path is not a directory")]
    NotDirectory,
    /// `init` found the journal path already present
    #[error("journal already exists")]
    AlreadyExists,
    /// Creating the journal directory failed
    #[error("cannot create journal directory")]
    Mkdir,
    /// Creating or writing the metastore failed
    #[error("cannot create metastore")]
    CreateMeta,
    /// An advisory file lock could not be acquired
    #[error("cannot lock file")]
    Lock,
    /// An index file could not be opened
    #[error("cannot open index")]
    IndexOpen,
    /// An index file's size could not be determined
    #[error("cannot seek in index")]
    IndexSeek,
    /// Reading an index entry failed
    #[error("cannot read index")]
    IndexRead,
    /// Writing an index entry failed
    #[error("cannot write index")]
    IndexWrite,
    /// The index contents are inconsistent with its segment
    #[error("index is corrupt")]
    IndexCorrupt,
    /// A segment file could not be opened
    #[error("cannot open segment")]
    FileOpen,
    /// A segment file's size could not be determined
    #[error("cannot seek in segment")]
    FileSeek,
    /// Reading from a segment failed
    #[error("cannot read segment")]
    FileRead,
    /// Writing to a segment failed
    #[error("cannot write segment")]
    FileWrite,
    /// A segment's record stream is damaged
    #[error("segment is corrupt")]
    FileCorrupt,
    /// The metastore could not be opened or mapped
    #[error("cannot open metastore")]
    MetaOpen,
    /// A write-side operation was attempted on a non-writer context
    #[error("context is not open for writing")]
    IllegalWrite,
    /// A checkpoint operation was attempted on a non-reader context
    #[error("context is not open for reading")]
    IllegalCheckpoint,
    /// The named subscriber does not exist
    #[error("no such subscriber")]
    InvalidSubscriber,
    /// `add_subscriber` found the subscriber already present
    #[error("subscriber already exists")]
    SubscriberExists,
    /// A record position is out of range for its segment
    #[error("illegal log position")]
    IllegalLogId,
    /// A checkpoint could not be read or written
    #[error("checkpoint update failed")]
    Checkpoint,
    /// The requested operation is not supported in this state
    #[error("operation not supported")]
    NotSupported,
    /// The position addressed the closed-index sentinel, not a record
    #[error("position is the closed-segment sentinel")]
    ClosedLogId,
}

/// An error raised by a journal operation: a [`ErrorKind`] plus the OS
/// errno when the failure originated in a system call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Error {
    kind: ErrorKind,
    errno: Option<i32>,
}

impl Error {
    /// Build an error with no associated errno.
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Self { kind, errno: None }
    }

    /// Build an error capturing the errno of an I/O failure.
    pub(crate) fn io(kind: ErrorKind, err: &std::io::Error) -> Self {
        Self {
            kind,
            errno: err.raw_os_error(),
        }
    }

    /// The category of the failure.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The OS errno captured at the failure site, if any.
    pub fn errno(&self) -> Option<i32> {
        self.errno
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.errno {
            Some(errno) => write!(f, "{} (errno {})", self.kind, errno),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl std::error::Error for Error {}

/// Result type for journal operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_errno() {
        let plain = Error::new(ErrorKind::IndexCorrupt);
        assert_eq!(plain.to_string(), "index is corrupt");

        let io = Error::io(
            ErrorKind::FileOpen,
            &std::io::Error::from_raw_os_error(2),
        );
        assert_eq!(io.errno(), Some(2));
        assert!(io.to_string().contains("errno 2"));
    }
}
