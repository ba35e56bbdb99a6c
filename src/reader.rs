//! Reader path
//!
//! Readers work per subscriber. `read_interval` resyncs the index of the
//! segment at (or after) the subscriber's checkpoint and hands back the
//! inclusive range of unread records in that segment; `read_message`
//! fetches one record through the index and the segment mapping. A
//! reader never crosses into the writer's current segment while probing
//! forward, and it persists checkpoint advances it makes on the way so
//! the probing isn't repeated.
//!
//! Delivery is at-least-once up to the persisted checkpoint: a reader
//! that consumes records but dies before `read_checkpoint` will see them
//! again.

use std::os::unix::fs::FileExt;

use tracing::warn;

use crate::error::{Error, ErrorKind as Kind, Result};
use crate::format::{Message, MessageHeader, Position, INDEX_ENTRY_SIZE};
use crate::fs::{self, FileLock};
use crate::Journal;

/// An inclusive range of unread records within one segment, as returned
/// by [`Journal::read_interval`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    /// First unread record
    pub start: Position,
    /// Last record currently available in the segment
    pub finish: Position,
}

impl Interval {
    /// Number of records in the interval.
    pub fn count(&self) -> u32 {
        self.finish.marker - self.start.marker + 1
    }
}

impl Journal {
    /// Locate the next batch of unread records for this context's
    /// subscriber.
    ///
    /// Returns `None` when the subscriber is caught up. A returned
    /// interval always lies within a single segment; consume it with
    /// [`read_message`](Self::read_message) /
    /// [`advance_id`](Self::advance_id) and persist progress with
    /// [`read_checkpoint`](Self::read_checkpoint).
    pub fn read_interval(&mut self) -> Result<Option<Interval>> {
        self.begin();
        if !self.mode_is_read() {
            return self.fail(Kind::IllegalWrite);
        }
        if let Err(e) = self.meta.restore(false) {
            self.record(e);
            return self.fail(Kind::MetaOpen);
        }
        let subscriber = self.subscriber.clone().expect("reader has a subscriber");
        let chkpt = match self.get_checkpoint(&subscriber) {
            Ok(p) => p,
            Err(_) => return self.fail(Kind::InvalidSubscriber),
        };

        let (mut start, finish) = self.find_first_log_after(chkpt)?;
        if start.log != chkpt.log {
            start.marker = 0;
            // the checkpoint segment is fully consumed; persist the advance
            // so this probing isn't repeated
            if self.set_checkpoint(&subscriber, start).is_err() {
                return self.fail(Kind::Checkpoint);
            }
        } else {
            start.marker = chkpt.marker;
        }

        let count = finish.marker as i64 - start.marker as i64;
        if finish.marker > start.marker {
            // start is the checkpoint itself; the first unread record is one past it
            start.marker += 1;
        }

        if count < 0 {
            // checkpoint beyond the end of the segment, e.g. after a repair
            // shrank it; snap it back to the end
            warn!(
                subscriber = %subscriber,
                start = %start,
                finish = %finish,
                "checkpoint past end of segment, repairing"
            );
            if self.set_checkpoint(&subscriber, finish).is_err() {
                return self.fail(Kind::Checkpoint);
            }
            self.munmap_reader_segment();
            return Ok(None);
        }

        // unmap so the next read maps any data appended since
        self.munmap_reader_segment();
        if count > 0 {
            Ok(Some(Interval { start, finish }))
        } else {
            Ok(None)
        }
    }

    /// Read the record at `id`.
    ///
    /// Fails with [`ErrorKind::ClosedLogId`] when `id` addresses the
    /// closed-index sentinel of a finished segment, and with
    /// [`ErrorKind::IllegalLogId`] when the marker is 0 or out of range.
    /// Index corruption observed without the lock held triggers one
    /// truncate-resync-retry under the lock before surfacing.
    pub fn read_message(&mut self, id: Position) -> Result<Message> {
        self.begin();
        if !self.mode_is_read() {
            return self.fail(Kind::IllegalWrite);
        }
        if id.marker < 1 {
            return self.fail(Kind::IllegalLogId);
        }
        let mut with_lock = false;
        loop {
            match self.try_read_message(id, with_lock) {
                Ok(msg) => return Ok(msg),
                Err(e) => {
                    let e = self.record(e);
                    if e.kind() == Kind::ClosedLogId || with_lock {
                        return Err(e);
                    }
                    if e.kind() == Kind::IndexCorrupt {
                        if let Some(index) = self.index.as_ref() {
                            if let Ok(_guard) = FileLock::acquire(index) {
                                let _ = index.set_len(0);
                            }
                        }
                    }
                    let _ = self.resync_index_once(id.log);
                    with_lock = true;
                }
            }
        }
    }

    fn try_read_message(
        &mut self,
        id: Position,
        with_lock: bool,
    ) -> std::result::Result<Message, Error> {
        const HDR: u64 = MessageHeader::SIZE as u64;

        self.open_reader_segment(id.log)?;
        self.open_indexer(id.log)?;

        let index = self.index.as_ref().unwrap();
        let _guard = if with_lock {
            Some(FileLock::acquire(index).map_err(|e| Error::io(Kind::Lock, &e))?)
        } else {
            None
        };

        let index_len = fs::size(index).map_err(|e| Error::io(Kind::IndexSeek, &e))?;
        if index_len % INDEX_ENTRY_SIZE != 0 {
            return Err(Error::new(Kind::IndexCorrupt));
        }
        if id.marker as u64 * INDEX_ENTRY_SIZE > index_len {
            return Err(Error::new(Kind::IllegalLogId));
        }

        let mut buf = [0u8; 8];
        index
            .read_exact_at(&mut buf, (id.marker as u64 - 1) * INDEX_ENTRY_SIZE)
            .map_err(|e| Error::io(Kind::IndexRead, &e))?;
        let data_off = u64::from_le_bytes(buf);
        if data_off == 0 && id.marker != 1 {
            if id.marker as u64 * INDEX_ENTRY_SIZE == index_len {
                // the close tag, not a real offset
                return Err(Error::new(Kind::ClosedLogId));
            }
            // a zero in the middle of an index means corruption
            return Err(Error::new(Kind::IndexCorrupt));
        }

        self.mmap_reader_segment(id.log)?;
        let map = self.rmap.as_ref().unwrap();
        let map_len = map.len() as u64;
        if data_off + HDR > map_len {
            return Err(Error::new(Kind::IndexCorrupt));
        }
        let start = data_off as usize;
        let header = MessageHeader::decode(&map[start..start + MessageHeader::SIZE]);
        if data_off + HDR + header.mlen as u64 > map_len {
            return Err(Error::new(Kind::IndexCorrupt));
        }
        let payload_start = start + MessageHeader::SIZE;
        let data = map[payload_start..payload_start + header.mlen as usize].to_vec();
        Ok(Message { header, data })
    }

    /// Advance a consuming cursor: within an interval just bump the
    /// marker; when `cur` has reached `finish`, probe for the next batch
    /// (updating `finish`) and return the first position of it.
    pub fn advance_id(&mut self, cur: Position, finish: &mut Position) -> Result<Position> {
        if cur != *finish {
            return Ok(Position::new(cur.log, cur.marker + 1));
        }
        let (mut start, new_finish) = self.find_first_log_after(cur)?;
        *finish = new_finish;
        if cur.log != start.log {
            start.marker = 1;
        } else {
            start.marker = cur.marker;
        }
        Ok(start)
    }

    /// The last indexed position in the writer's current segment.
    pub fn last_log_id(&mut self) -> Result<Position> {
        self.begin();
        if !self.mode_is_read() {
            return self.fail(Kind::IllegalWrite);
        }
        if let Err(e) = self.meta.restore(false) {
            self.record(e);
            return self.fail(Kind::MetaOpen);
        }
        let (last, _closed) = self.resync_index_once(self.meta.storage_log())?;
        Ok(last)
    }

    /// Find the first segment with readable data at or after `chkpt`.
    ///
    /// Returns `(start, finish)`: `start` is the checkpoint, possibly
    /// advanced over missing or fully-consumed closed segments, and
    /// `finish` the last indexed record of the segment `start` landed in.
    /// Never advances into the writer's current segment.
    pub(crate) fn find_first_log_after(
        &mut self,
        chkpt: Position,
    ) -> Result<(Position, Position)> {
        let mut start = chkpt;
        loop {
            let (last, closed) = match self.resync_index(start.log) {
                Ok(res) => res,
                Err(e) => {
                    if e.kind() == Kind::FileOpen && !self.datafile_path(start.log).exists() {
                        // the checkpoint segment is gone; fake a recovery by
                        // advancing to the next segment that exists, but never
                        // past where people are writing
                        self.begin();
                        let next_exists = match std::fs::metadata(self.datafile_path(start.log + 1))
                        {
                            Ok(_) => true,
                            Err(ioe) if ioe.kind() == std::io::ErrorKind::NotFound => false,
                            Err(_) => return Ok((start, start)),
                        };
                        if start.log >= self.meta.storage_log() || !next_exists {
                            return Ok((start, start));
                        }
                        if self.resync_index(start.log + 1).is_err() {
                            self.begin();
                            return Ok((start, start));
                        }
                        if !index_nonempty(&self.indexfile_path(start.log + 1)) {
                            return Ok((start, start));
                        }
                        start.marker = 0;
                        start.log += 1;
                        continue;
                    }
                    return Err(e);
                }
            };

            // if someone checkpoints off the end, be nice
            if last.log == start.log && last.marker < start.marker {
                start = last;
            }

            if start == last && closed {
                // fully consumed a closed segment; look at the next one
                let next_meta = std::fs::metadata(self.datafile_path(start.log + 1));
                if next_meta.is_err() {
                    warn!(segment = start.log + 1, "closed segment has no successor");
                    if start.log < self.meta.storage_log().saturating_sub(1) {
                        // hole in the directory; skip past it
                        start.marker = 0;
                        start.log += 2;
                        return Ok((start, start));
                    }
                }
                let next_len = next_meta.as_ref().map(|m| m.len()).unwrap_or(0);
                if start.log >= self.meta.storage_log() || next_meta.is_err() || next_len == 0 {
                    return Ok((start, start));
                }
                if self.resync_index(start.log + 1).is_err() {
                    self.begin();
                    return Ok((start, start));
                }
                if !index_nonempty(&self.indexfile_path(start.log + 1)) {
                    return Ok((start, start));
                }
                start.marker = 0;
                start.log += 1;
                continue;
            }

            return Ok((start, last));
        }
    }
}

fn index_nonempty(path: &std::path::Path) -> bool {
    std::fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false)
}
