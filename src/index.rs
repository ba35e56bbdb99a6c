//! Index construction and resync
//!
//! An index is an array of u64 offsets, one per complete record in its
//! segment, built lazily by scanning record headers forward from the last
//! indexed offset. A trailing zero entry marks the index closed: the
//! segment was rotated away from and will receive no more records.
//!
//! Resync is self-healing. A damaged index (bad length, an offset past
//! the data, a failed entry write, a header that does not carry the
//! directory magic) is truncated to its last known-good prefix and the
//! scan restarts once under the same lock; a second failure surfaces
//! `IndexCorrupt`. Above that, the outer wrapper retries the whole
//! resync up to four times, salvaging the data file between attempts
//! when the segment is no longer the writer's current one.

use std::fs::File;
use std::os::unix::fs::FileExt;

use tracing::debug;

use crate::error::{Error, ErrorKind as Kind, Result};
use crate::format::{MessageHeader, Position, INDEX_ENTRY_SIZE};
use crate::fs::{self, FileLock};
use crate::Journal;

/// Offsets buffered between index writes.
const BUFFERED_INDICES: usize = 1024;

/// How a single resync pass failed.
enum ResyncFail {
    /// Truncate the index to this length and retry under the lock
    Restart(u64),
    /// Not recoverable by restarting the pass
    Fatal(Error),
}

impl Journal {
    /// Resync with retries: up to four attempts, salvaging the data file
    /// and zeroing the index between failed attempts. Segments at or past
    /// the writer's current one are never repaired, since the writer may
    /// still append to them.
    pub(crate) fn resync_index(&mut self, log: u32) -> Result<(Position, bool)> {
        let mut last_err = Error::new(Kind::IndexCorrupt);
        for _ in 0..4 {
            match self.resync_index_once(log) {
                Ok(res) => return Ok(res),
                Err(e) => {
                    last_err = e;
                    if matches!(e.kind(), Kind::FileOpen | Kind::IndexOpen) {
                        break;
                    }
                    // we can't fix the file if someone may write to it again
                    if log >= self.meta.storage_log() {
                        break;
                    }
                    let guard = self
                        .index
                        .as_ref()
                        .and_then(|ix| FileLock::acquire(ix).ok());
                    // failure here doesn't matter; we retry regardless
                    let _ = self.repair_datafile(log);
                    if let Some(ix) = self.index.as_ref() {
                        let _ = ix.set_len(0);
                    }
                    drop(guard);
                }
            }
        }
        Err(self.record(last_err))
    }

    /// One resync pass over `log`, with the single-restart protocol.
    ///
    /// Returns the last indexed position and whether the index is (now)
    /// closed.
    pub(crate) fn resync_index_once(&mut self, log: u32) -> Result<(Position, bool)> {
        self.open_reader_segment(log)?;

        let mut second_try = false;
        loop {
            self.open_indexer(log)?;
            let data = self.data.as_ref().unwrap();
            let index = self.index.as_ref().unwrap();
            let guard = match FileLock::acquire(index) {
                Ok(g) => g,
                Err(e) => return self.fail_io(Kind::Lock, &e),
            };
            let hdr_magic = self.meta.hdr_magic();
            let storage_log = self.meta.storage_log();

            match resync_pass(data, index, log, hdr_magic, storage_log) {
                Ok(res) => return Ok(res),
                Err(ResyncFail::Restart(truncate_to)) => {
                    if second_try {
                        drop(guard);
                        return Err(self.record(Error::new(Kind::IndexCorrupt)));
                    }
                    debug!(segment = log, truncate_to, "index restart");
                    let _ = index.set_len(truncate_to);
                    drop(guard);
                    second_try = true;
                }
                Err(ResyncFail::Fatal(e)) => {
                    drop(guard);
                    return Err(self.record(e));
                }
            }
        }
    }

    /// Report a segment index's record count and closed flag without
    /// resyncing it.
    pub fn index_details(&mut self, log: u32) -> Result<(u32, bool)> {
        self.begin();
        self.open_indexer(log)?;
        let index = self.index.as_ref().unwrap();
        let index_len = match fs::size(index) {
            Ok(len) => len,
            Err(e) => return self.fail_io(Kind::IndexSeek, &e),
        };
        if index_len % INDEX_ENTRY_SIZE != 0 {
            return self.fail(Kind::IndexCorrupt);
        }
        if index_len > INDEX_ENTRY_SIZE {
            let last = match read_index_entry(index, index_len - INDEX_ENTRY_SIZE) {
                Ok(v) => v,
                Err(e) => return self.fail_io(Kind::IndexRead, &e),
            };
            if last == 0 {
                return Ok(((index_len / INDEX_ENTRY_SIZE) as u32 - 1, true));
            }
        }
        Ok(((index_len / INDEX_ENTRY_SIZE) as u32, false))
    }
}

fn read_index_entry(index: &File, off: u64) -> std::io::Result<u64> {
    let mut buf = [0u8; 8];
    index.read_exact_at(&mut buf, off)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_header(data: &File, off: u64) -> std::io::Result<MessageHeader> {
    let mut buf = [0u8; MessageHeader::SIZE];
    data.read_exact_at(&mut buf, off)?;
    Ok(MessageHeader::decode(&buf))
}

/// One forward scan extending the index to cover every complete record,
/// closing the index when the segment is no longer the writer's current
/// one.
fn resync_pass(
    data: &File,
    index: &File,
    log: u32,
    hdr_magic: u32,
    storage_log: u32,
) -> std::result::Result<(Position, bool), ResyncFail> {
    const HDR: u64 = MessageHeader::SIZE as u64;

    let data_len = fs::size(data).map_err(|e| ResyncFail::Fatal(Error::io(Kind::FileSeek, &e)))?;
    let mut index_off =
        fs::size(index).map_err(|e| ResyncFail::Fatal(Error::io(Kind::IndexSeek, &e)))?;

    if index_off % INDEX_ENTRY_SIZE != 0 {
        return Err(ResyncFail::Restart(index_off - index_off % INDEX_ENTRY_SIZE));
    }

    let mut data_off: u64 = 0;
    if index_off > INDEX_ENTRY_SIZE {
        let last_entry = read_index_entry(index, index_off - INDEX_ENTRY_SIZE)
            .map_err(|e| ResyncFail::Fatal(Error::io(Kind::IndexRead, &e)))?;
        if last_entry == 0 {
            // the segment has been closed
            let marker = (index_off / INDEX_ENTRY_SIZE) as u32 - 1;
            return Ok((Position::new(log, marker), true));
        }
        if last_entry > data_len {
            // the last entry points past the data; drop it
            return Err(ResyncFail::Restart(index_off - INDEX_ENTRY_SIZE));
        }
        data_off = last_entry;
    }

    if index_off > 0 {
        // adding onto a partial index, so advance past the last indexed record
        let hdr = read_header(data, data_off)
            .map_err(|e| ResyncFail::Fatal(Error::io(Kind::FileRead, &e)))?;
        data_off += HDR + hdr.mlen as u64;
        if data_off > data_len {
            return Err(ResyncFail::Restart(index_off - INDEX_ENTRY_SIZE));
        }
    }

    let mut buffered = Vec::with_capacity(BUFFERED_INDICES * INDEX_ENTRY_SIZE as usize);
    while data_off + HDR <= data_len {
        let hdr = read_header(data, data_off)
            .map_err(|e| ResyncFail::Fatal(Error::io(Kind::FileRead, &e)))?;
        if hdr.magic != hdr_magic {
            debug!(segment = log, offset = data_off, "bad record magic");
            return Err(ResyncFail::Restart(index_off));
        }
        let next_off = data_off + HDR + hdr.mlen as u64;
        if next_off > data_len {
            // torn trailing record; never indexed
            break;
        }
        buffered.extend_from_slice(&data_off.to_le_bytes());
        if buffered.len() >= BUFFERED_INDICES * INDEX_ENTRY_SIZE as usize {
            if index.write_all_at(&buffered, index_off).is_err() {
                return Err(ResyncFail::Restart(index_off));
            }
            index_off += buffered.len() as u64;
            buffered.clear();
        }
        data_off = next_off;
    }
    if !buffered.is_empty() {
        if index.write_all_at(&buffered, index_off).is_err() {
            return Err(ResyncFail::Restart(index_off));
        }
        index_off += buffered.len() as u64;
    }

    let last = Position::new(log, (index_off / INDEX_ENTRY_SIZE) as u32);
    let mut closed = false;
    if log < storage_log {
        if data_off != data_len {
            return Err(ResyncFail::Fatal(Error::new(Kind::FileCorrupt)));
        }
        // Closing writes a 0 entry, except when the segment has no records:
        // a lone 0 would collide with "record 1 at offset 0" for the next
        // reader. That only happens after segment repair.
        if index_off > 0 {
            if index.write_all_at(&0u64.to_le_bytes(), index_off).is_err() {
                return Err(ResyncFail::Restart(index_off));
            }
        }
        closed = true;
    }
    Ok((last, closed))
}
