//! Writer append path
//!
//! A record is a 16-byte header followed by its payload, written with two
//! positional writes at the current end of the segment under the data
//! file's lock. No index entry is written here; readers (or the resync
//! at the next rotation) index the record lazily.
//!
//! Rotation happens when the segment has already reached the unit limit
//! before the write, or immediately after a write pushes it past. The
//! record that straddles the limit stays whole in the old segment.

use std::time::{SystemTime, UNIX_EPOCH};

use std::os::unix::fs::FileExt;

use crate::error::{Error, ErrorKind as Kind, Result};
use crate::format::MessageHeader;
use crate::fs::{self, FileLock};
use crate::Journal;

enum Append {
    /// Record written, no rotation needed
    Done,
    /// Segment was already full; rotate and try again
    RotateRetry,
    /// Record written and pushed the segment past the limit; rotate now
    RotateDone,
}

impl Journal {
    /// Append a record stamped with the current wall clock.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        self.write_message(data, None)
    }

    /// Append a record, stamping it with `when` (or the current wall
    /// clock when `None`).
    ///
    /// The payload may be empty; a zero-length record still occupies a
    /// header and a marker.
    pub fn write_message(&mut self, data: &[u8], when: Option<SystemTime>) -> Result<()> {
        self.begin();
        if !self.mode_is_append() {
            return self.fail(Kind::IllegalWrite);
        }
        loop {
            self.open_writer_segment()?;
            match self.append_once(data, when) {
                Ok(Append::Done) => return Ok(()),
                Ok(Append::RotateDone) => {
                    self.close_writer_segment();
                    self.metastore_atomic_increment()?;
                    return Ok(());
                }
                Ok(Append::RotateRetry) => {
                    self.close_writer_segment();
                    self.metastore_atomic_increment()?;
                }
                Err(e) => return Err(self.record(e)),
            }
        }
    }

    fn append_once(&self, data: &[u8], when: Option<SystemTime>) -> std::result::Result<Append, Error> {
        let file = self.data.as_ref().unwrap();
        let _guard = FileLock::acquire(file).map_err(|e| Error::io(Kind::Lock, &e))?;

        let offset = fs::size(file).map_err(|e| Error::io(Kind::FileSeek, &e))?;
        let unit_limit = self.meta.unit_limit() as u64;
        if unit_limit <= offset {
            return Ok(Append::RotateRetry);
        }

        let (tv_sec, tv_usec) = timestamp(when);
        let header = MessageHeader {
            magic: self.meta.hdr_magic(),
            tv_sec,
            tv_usec,
            mlen: data.len() as u32,
        };
        file.write_all_at(&header.encode(), offset)
            .map_err(|e| Error::io(Kind::FileWrite, &e))?;
        file.write_all_at(data, offset + MessageHeader::SIZE as u64)
            .map_err(|e| Error::io(Kind::FileWrite, &e))?;

        let end = offset + MessageHeader::SIZE as u64 + data.len() as u64;
        if unit_limit <= end {
            Ok(Append::RotateDone)
        } else {
            Ok(Append::Done)
        }
    }
}

fn timestamp(when: Option<SystemTime>) -> (u32, u32) {
    let when = when.unwrap_or_else(SystemTime::now);
    let since_epoch = when.duration_since(UNIX_EPOCH).unwrap_or_default();
    (since_epoch.as_secs() as u32, since_epoch.subsec_micros())
}
