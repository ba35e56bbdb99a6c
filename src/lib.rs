//! Seglog - a journaled, append-only, multi-subscriber message log
//! stored as a directory of segment files.
//!
//! # Overview
//!
//! A journal directory holds a metastore, numbered segment files, one
//! offset index per segment, and one checkpoint file per subscriber:
//!
//! 1. A single writer appends variable-length records to the current
//!    segment, rotating to a new segment past a size threshold
//! 2. Any number of subscribers read at their own pace, each persisting
//!    a durable (segment, record) checkpoint
//! 3. Segments every subscriber has passed are garbage-collected when a
//!    checkpoint advances
//!
//! # Key Features
//!
//! - Crash-consistent appends: torn trailing records are detected and
//!   never indexed; indexes rebuild themselves from the data
//! - Multi-process safe: all coordination runs over advisory file locks,
//!   so separate processes can share one directory
//! - Lazy indexing: the per-segment offset index is built by readers or
//!   at rotation, never on the append path
//! - Self-healing readers: corrupt indexes are truncated and resynced;
//!   corrupt non-current segments are salvaged in place
//! - Repair tooling for lost metastores and checkpoints, up to an
//!   aggressive nuke of an unrecoverable directory
//!
//! # Usage
//!
//! A [`Journal`] context is opened in exactly one role: `init` to create
//! a directory, `open_writer` to append, or `open_reader` to consume on
//! behalf of a subscriber.
//!
//! ```no_run
//! use seglog::{Journal, Whence};
//!
//! # fn main() -> seglog::Result<()> {
//! let mut w = Journal::new("/var/spool/events");
//! w.init()?;
//! w.add_subscriber("billing", Whence::Begin)?;
//! drop(w);
//!
//! let mut w = Journal::new("/var/spool/events");
//! w.open_writer()?;
//! w.write(b"hello")?;
//!
//! let mut r = Journal::new("/var/spool/events");
//! r.open_reader("billing")?;
//! if let Some(interval) = r.read_interval()? {
//!     let mut cur = interval.start;
//!     let mut finish = interval.finish;
//!     loop {
//!         let msg = r.read_message(cur)?;
//!         println!("{} bytes", msg.data.len());
//!         if cur == finish {
//!             break;
//!         }
//!         cur = r.advance_id(cur, &mut finish)?;
//!     }
//!     r.read_checkpoint(finish)?;
//! }
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]

mod checkpoint;
mod error;
mod format;
mod fs;
mod index;
mod meta;
mod reader;
mod repair;
mod store;
mod writer;

pub use error::{Error, ErrorKind, Result};
pub use format::{Message, MessageHeader, Position, Safety, Whence};
pub use reader::Interval;
pub use repair::{clean, SegmentSummary};

use std::fs::File;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use tracing::debug;

use error::{Error as JError, ErrorKind as Kind};
use format::DEFAULT_FILE_MODE;
use meta::Metastore;

/// The role a context has been opened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ContextMode {
    /// Freshly created; no role chosen yet
    New,
    /// Created the journal directory
    Init,
    /// Open for appending
    Append,
    /// Open for reading on behalf of a subscriber
    Read,
    /// A role transition failed; the context is unusable
    Invalid,
}

/// A handle onto one journal directory.
///
/// The context caches the file handles and mappings for the segment it is
/// currently working in; switching segments invalidates the caches. One
/// context must not be shared between threads — open one context per
/// thread (or process), and let the advisory locks coordinate.
pub struct Journal {
    path: PathBuf,
    file_mode: u32,
    mode: ContextMode,
    subscriber: Option<String>,
    meta: Metastore,
    /// Log id the cached data/index handles belong to
    current_log: u32,
    /// Cached data segment handle (reader or writer role)
    data: Option<File>,
    /// Cached read-only mapping of the current data segment
    rmap: Option<Mmap>,
    /// Cached index handle for the current segment
    index: Option<File>,
    last_error: Option<JError>,
}

impl Journal {
    /// Create a context for the journal directory at `path`.
    ///
    /// No I/O happens until one of [`init`](Self::init),
    /// [`open_writer`](Self::open_writer) or
    /// [`open_reader`](Self::open_reader) is called.
    pub fn new(path: impl AsRef<Path>) -> Journal {
        Journal {
            path: path.as_ref().to_path_buf(),
            file_mode: DEFAULT_FILE_MODE,
            mode: ContextMode::New,
            subscriber: None,
            meta: Metastore::new(),
            current_log: 0,
            data: None,
            rmap: None,
            index: None,
            last_error: None,
        }
    }

    /// Create the journal directory and write its initial metastore.
    ///
    /// Fails with [`ErrorKind::AlreadyExists`] if the path is already
    /// present. The directory mode mirrors the file mode with execute
    /// bits added wherever a read bit is set.
    pub fn init(&mut self) -> Result<()> {
        self.begin();
        if self.mode != ContextMode::New {
            return self.fail(Kind::IllegalInit);
        }
        self.mode = ContextMode::Init;

        match std::fs::metadata(&self.path) {
            Ok(_) => return self.fail(Kind::AlreadyExists),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return self.fail_io(Kind::AlreadyExists, &e),
        }

        let dirmode = derive_dir_mode(self.file_mode);
        {
            use std::os::unix::fs::DirBuilderExt;
            let mut builder = std::fs::DirBuilder::new();
            builder.mode(dirmode);
            if let Err(e) = builder.create(&self.path) {
                return self.fail_io(Kind::Mkdir, &e);
            }
        }
        // mkdir honors the umask; force the derived mode
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(dirmode));

        if let Err(e) = self.meta.open(&self.path, self.file_mode) {
            return self.fail_io(Kind::CreateMeta, &e);
        }
        if let Err(e) = self.meta.save(false) {
            self.record(e);
            return self.fail(Kind::CreateMeta);
        }
        debug!(path = %self.path.display(), "journal initialized");
        Ok(())
    }

    /// Open the context for appending.
    ///
    /// Only one writer should operate on a directory at a time; the
    /// per-segment lock serializes appends but gives no ordering across
    /// concurrent writers.
    pub fn open_writer(&mut self) -> Result<()> {
        self.begin();
        if self.mode != ContextMode::New {
            return self.fail(Kind::IllegalOpen);
        }
        self.mode = ContextMode::Append;
        let result = self
            .check_directory()
            .and_then(|()| self.open_and_restore_meta());
        if result.is_err() {
            self.mode = ContextMode::Invalid;
        }
        result
    }

    /// Open the context for reading on behalf of `subscriber`.
    ///
    /// The subscriber must have been added with
    /// [`add_subscriber`](Self::add_subscriber) first.
    pub fn open_reader(&mut self, subscriber: &str) -> Result<()> {
        self.begin();
        if self.mode != ContextMode::New {
            return self.fail(Kind::IllegalOpen);
        }
        self.mode = ContextMode::Read;
        self.subscriber = Some(subscriber.to_string());

        let result = self.check_directory().and_then(|()| {
            if let Err(e) = self.meta.open(&self.path, self.file_mode) {
                return self.fail_io(Kind::MetaOpen, &e);
            }
            if self.get_checkpoint(subscriber).is_err() {
                return self.fail(Kind::InvalidSubscriber);
            }
            if let Err(e) = self.meta.restore(false) {
                self.record(e);
                return self.fail(Kind::MetaOpen);
            }
            Ok(())
        });
        if result.is_err() {
            self.mode = ContextMode::Invalid;
        }
        result
    }

    fn check_directory(&mut self) -> Result<()> {
        match std::fs::metadata(&self.path) {
            Err(e) => self.fail_io(Kind::Open, &e),
            Ok(md) if !md.is_dir() => self.fail(Kind::NotDirectory),
            Ok(_) => Ok(()),
        }
    }

    fn open_and_restore_meta(&mut self) -> Result<()> {
        if let Err(e) = self.meta.open(&self.path, self.file_mode) {
            return self.fail_io(Kind::MetaOpen, &e);
        }
        if let Err(e) = self.meta.restore(false) {
            self.record(e);
            return self.fail(Kind::MetaOpen);
        }
        Ok(())
    }

    /// Change the durability mode.
    ///
    /// Allowed before the context is opened (affects `init`) or on a
    /// writer, where the change is persisted immediately.
    pub fn alter_safety(&mut self, safety: Safety) -> Result<()> {
        if self.meta.safety() == safety {
            return Ok(());
        }
        match self.mode {
            ContextMode::Append | ContextMode::New => {
                self.meta.set_safety(safety);
                if self.mode == ContextMode::Append {
                    if let Err(e) = self.meta.save(false) {
                        self.record(e);
                        return self.fail(Kind::CreateMeta);
                    }
                }
                Ok(())
            }
            _ => self.fail(Kind::NotSupported),
        }
    }

    /// Change the segment rotation threshold in bytes.
    ///
    /// Allowed before the context is opened (affects `init`) or on a
    /// writer, where the change is persisted immediately.
    pub fn alter_journal_size(&mut self, size: u32) -> Result<()> {
        if self.meta.unit_limit() == size {
            return Ok(());
        }
        match self.mode {
            ContextMode::Append | ContextMode::New => {
                self.meta.set_unit_limit(size);
                if self.mode == ContextMode::Append {
                    if let Err(e) = self.meta.save(false) {
                        self.record(e);
                        return self.fail(Kind::CreateMeta);
                    }
                }
                Ok(())
            }
            _ => self.fail(Kind::NotSupported),
        }
    }

    /// Change the permission bits used for files created from now on.
    pub fn alter_mode(&mut self, mode: u32) {
        self.file_mode = mode;
    }

    /// The journal directory path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The subscriber this context reads for, if opened as a reader.
    pub fn subscriber(&self) -> Option<&str> {
        self.subscriber.as_deref()
    }

    /// The kind of the most recent error on this context.
    pub fn last_error(&self) -> Option<ErrorKind> {
        self.last_error.map(|e| e.kind())
    }

    /// The OS errno of the most recent error on this context, if one was
    /// captured.
    pub fn last_errno(&self) -> Option<i32> {
        self.last_error.and_then(|e| e.errno())
    }

    /// Total size in bytes of all regular files in the journal directory.
    pub fn raw_size(&self) -> u64 {
        let Ok(entries) = std::fs::read_dir(&self.path) else {
            return 0;
        };
        let mut total = 0;
        for entry in entries.flatten() {
            if let Ok(md) = entry.metadata() {
                if md.is_file() {
                    total += md.len();
                }
            }
        }
        total
    }

    // -- internal error plumbing -----------------------------------------

    /// Reset the per-operation error state.
    pub(crate) fn begin(&mut self) {
        self.last_error = None;
    }

    /// Record and return an error with no errno.
    pub(crate) fn fail<T>(&mut self, kind: ErrorKind) -> Result<T> {
        let err = JError::new(kind);
        self.last_error = Some(err);
        Err(err)
    }

    /// Record and return an error capturing an I/O failure's errno.
    pub(crate) fn fail_io<T>(&mut self, kind: ErrorKind, e: &std::io::Error) -> Result<T> {
        let err = JError::io(kind, e);
        self.last_error = Some(err);
        Err(err)
    }

    /// Record an already-built error and hand it back.
    pub(crate) fn record(&mut self, err: JError) -> JError {
        self.last_error = Some(err);
        err
    }

    pub(crate) fn mode_is_append(&self) -> bool {
        self.mode == ContextMode::Append
    }

    pub(crate) fn mode_is_read(&self) -> bool {
        self.mode == ContextMode::Read
    }
}

impl Drop for Journal {
    fn drop(&mut self) {
        // unmap before the underlying handles go away
        self.rmap = None;
        self.data = None;
        self.index = None;
        self.meta.close();
    }
}

/// Directory mode derived from a file mode: execute bits mirror read bits.
fn derive_dir_mode(file_mode: u32) -> u32 {
    let mut mode = file_mode;
    if mode & 0o400 != 0 {
        mode |= 0o100;
    }
    if mode & 0o040 != 0 {
        mode |= 0o010;
    }
    if mode & 0o004 != 0 {
        mode |= 0o001;
    }
    mode
}
