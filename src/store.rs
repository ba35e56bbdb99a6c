//! Segment and index store
//!
//! Segment files are named by the lowercase 8-hex-digit form of their log
//! id; the companion index appends `.idx`. The context keeps at most one
//! data handle, one index handle and one read-only mapping, all belonging
//! to `current_log`; moving to another segment drops them first.
//!
//! Rotation is a compare-and-increment on the metastore under its lock:
//! whichever context observes `storage_log` still equal to its own
//! current segment gets to create the successor; everyone else adopts
//! the new `storage_log`.

use std::path::PathBuf;

use memmap2::Mmap;
use tracing::debug;

use crate::error::{ErrorKind as Kind, Result};
use crate::format::{Position, INDEX_EXT};
use crate::fs::{self, FileLock};
use crate::Journal;

/// Parse a segment file name: exactly eight lowercase hex digits.
pub(crate) fn parse_log_name(name: &str) -> Option<u32> {
    if name.len() != 8 {
        return None;
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    {
        return None;
    }
    u32::from_str_radix(name, 16).ok()
}

impl Journal {
    pub(crate) fn datafile_path(&self, log: u32) -> PathBuf {
        self.path.join(format!("{:08x}", log))
    }

    pub(crate) fn indexfile_path(&self, log: u32) -> PathBuf {
        self.path.join(format!("{:08x}{}", log, INDEX_EXT))
    }

    /// Open the data segment for `log` in the reader role, reusing the
    /// cached handle when it already points there.
    pub(crate) fn open_reader_segment(&mut self, log: u32) -> Result<()> {
        if self.current_log != log {
            self.close_reader_segment();
            self.close_indexer();
        }
        if self.data.is_some() {
            return Ok(());
        }
        let path = self.datafile_path(log);
        debug!(segment = log, "opening segment for read");
        match fs::open_rw(&path, false, false, self.file_mode) {
            Ok(file) => {
                self.data = Some(file);
                self.current_log = log;
                Ok(())
            }
            Err(e) => self.fail_io(Kind::FileOpen, &e),
        }
    }

    pub(crate) fn close_reader_segment(&mut self) {
        self.rmap = None;
        self.data = None;
    }

    /// Map the current data segment read-only, remapping when the segment
    /// changed. The mapping must be dropped before any truncation.
    pub(crate) fn mmap_reader_segment(&mut self, log: u32) -> Result<()> {
        if self.current_log == log && self.rmap.is_some() {
            return Ok(());
        }
        self.open_reader_segment(log)?;
        let file = self.data.as_ref().unwrap();
        match unsafe { Mmap::map(file) } {
            Ok(map) => {
                self.rmap = Some(map);
                Ok(())
            }
            Err(e) => {
                self.rmap = None;
                self.fail_io(Kind::FileRead, &e)
            }
        }
    }

    pub(crate) fn munmap_reader_segment(&mut self) {
        self.rmap = None;
    }

    /// Open (creating if necessary) the index for `log`, reusing the
    /// cached handle when it already points there.
    pub(crate) fn open_indexer(&mut self, log: u32) -> Result<()> {
        if self.current_log != log {
            self.close_reader_segment();
            self.close_indexer();
        }
        if self.index.is_some() {
            return Ok(());
        }
        let path = self.indexfile_path(log);
        debug!(segment = log, "opening index");
        match fs::open_rw(&path, true, false, self.file_mode) {
            Ok(file) => {
                self.index = Some(file);
                self.current_log = log;
                Ok(())
            }
            Err(e) => self.fail_io(Kind::IndexOpen, &e),
        }
    }

    pub(crate) fn close_indexer(&mut self) {
        self.index = None;
    }

    /// Open the current writer segment, picking up any rotation performed
    /// by another context first. Reuses the cached handle when open.
    pub(crate) fn open_writer_segment(&mut self) -> Result<()> {
        if self.data.is_some() {
            return Ok(());
        }
        let guard = match self.meta.file() {
            Ok(file) => match FileLock::acquire(file) {
                Ok(g) => g,
                Err(e) => return self.fail_io(Kind::Lock, &e),
            },
            Err(e) => return Err(self.record(e)),
        };
        let result = (|| {
            if let Err(e) = self.meta.restore(true) {
                self.record(e);
                return self.fail(Kind::MetaOpen);
            }
            self.current_log = self.meta.storage_log();
            let path = self.datafile_path(self.current_log);
            debug!(segment = self.current_log, "opening segment for append");
            match fs::open_rw(&path, true, false, self.file_mode) {
                Ok(file) => {
                    self.data = Some(file);
                    Ok(())
                }
                Err(e) => self.fail_io(Kind::FileOpen, &e),
            }
        })();
        drop(guard);
        result
    }

    pub(crate) fn close_writer_segment(&mut self) {
        self.data = None;
    }

    /// Rotate to the next segment: under the metastore lock, bump
    /// `storage_log` if no other context beat us to it, creating the new
    /// segment file; either way adopt the final `storage_log`.
    ///
    /// The just-finished segment's index is not closed here; the next
    /// resync of that segment notices `log < storage_log` and closes it.
    pub(crate) fn metastore_atomic_increment(&mut self) -> Result<()> {
        if self.data.is_some() {
            return self.fail(Kind::NotSupported);
        }
        let guard = match self.meta.file() {
            Ok(file) => match FileLock::acquire(file) {
                Ok(g) => g,
                Err(e) => return self.fail_io(Kind::Lock, &e),
            },
            Err(e) => return Err(self.record(e)),
        };
        let result = (|| {
            if let Err(e) = self.meta.restore(true) {
                self.record(e);
                return self.fail(Kind::MetaOpen);
            }
            if self.meta.storage_log() == self.current_log {
                // we got here first, so we get to advance it
                self.current_log += 1;
                debug!(segment = self.current_log, "rotating to new segment");
                let path = self.datafile_path(self.current_log);
                match fs::open_rw(&path, true, false, self.file_mode) {
                    Ok(file) => self.data = Some(file),
                    Err(e) => return self.fail_io(Kind::FileOpen, &e),
                }
                self.meta.set_storage_log(self.current_log);
                if let Err(e) = self.meta.save(true) {
                    self.record(e);
                    return self.fail(Kind::MetaOpen);
                }
            }
            Ok(())
        })();
        drop(guard);
        // another context may have advanced further than we know
        self.current_log = self.meta.storage_log();
        result
    }

    /// Remove a segment file and its index, dropping any cached handles
    /// pointing at it first.
    pub(crate) fn unlink_datafile(&mut self, log: u32) {
        if self.current_log == log {
            self.close_reader_segment();
            self.close_indexer();
        }
        debug!(segment = log, "unlinking segment and index");
        let _ = std::fs::remove_file(self.datafile_path(log));
        let _ = std::fs::remove_file(self.indexfile_path(log));
    }

    /// The position of the oldest segment still present: the smallest
    /// parseable 8-hex file name, or log 0 when the directory holds no
    /// segments yet. The marker is always 0.
    pub fn first_log_id(&mut self) -> Result<Position> {
        self.begin();
        let entries = match std::fs::read_dir(&self.path) {
            Ok(e) => e,
            Err(e) => return self.fail_io(Kind::NotDirectory, &e),
        };
        let mut found: Option<u32> = None;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(log) = parse_log_name(name) {
                found = Some(match found {
                    Some(cur) if cur <= log => cur,
                    _ => log,
                });
            }
        }
        Ok(Position::new(found.unwrap_or(0), 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_name_parsing() {
        assert_eq!(parse_log_name("0000001a"), Some(0x1a));
        assert_eq!(parse_log_name("00000000"), Some(0));
        assert_eq!(parse_log_name("ffffffff"), Some(u32::MAX));
        // wrong length, uppercase, non-hex and suffixed names are rejected
        assert_eq!(parse_log_name("0000001"), None);
        assert_eq!(parse_log_name("0000001A"), None);
        assert_eq!(parse_log_name("0000001g"), None);
        assert_eq!(parse_log_name("0000001a.idx"), None);
        assert_eq!(parse_log_name("metastore"), None);
    }

    #[test]
    fn datafile_paths() {
        let journal = Journal::new("/j");
        assert_eq!(
            journal.datafile_path(0x1a),
            std::path::Path::new("/j/0000001a")
        );
        assert_eq!(
            journal.indexfile_path(0x1a),
            std::path::Path::new("/j/0000001a.idx")
        );
    }
}
