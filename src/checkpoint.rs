//! Subscriber checkpoints and retention
//!
//! Each subscriber owns one checkpoint file, `cp.<hex>`, where `<hex>` is
//! the subscriber name encoded byte-by-byte as two lowercase hex digits.
//! The file holds the (log, marker) pair of the last record the
//! subscriber consumed and is read and rewritten under its own advisory
//! lock.
//!
//! Retention rides on checkpoint updates: after a checkpoint moves from
//! segment A to segment B, every segment in `[A, B)` that no subscriber
//! still needs is unlinked together with its index.

use std::fmt::Write as _;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;

use tracing::debug;

use crate::error::{ErrorKind as Kind, Result};
use crate::format::{Position, Safety, Whence, CHECKPOINT_SIZE};
use crate::fs::{self, FileLock};
use crate::Journal;

/// File name for a subscriber's checkpoint: `cp.` plus the hex-encoded
/// name.
pub(crate) fn checkpoint_file_name(subscriber: &str) -> String {
    let mut name = String::with_capacity(3 + subscriber.len() * 2);
    name.push_str("cp.");
    for byte in subscriber.bytes() {
        let _ = write!(name, "{:02x}", byte);
    }
    name
}

/// Recover a subscriber name from its checkpoint file name, if it
/// decodes cleanly.
pub(crate) fn decode_checkpoint_name(file_name: &str) -> Option<String> {
    let hex = file_name.strip_prefix("cp.")?;
    if hex.len() % 2 != 0 {
        return None;
    }
    let mut bytes = Vec::with_capacity(hex.len() / 2);
    for chunk in hex.as_bytes().chunks(2) {
        let pair = std::str::from_utf8(chunk).ok()?;
        bytes.push(u8::from_str_radix(pair, 16).ok()?);
    }
    String::from_utf8(bytes).ok()
}

impl Journal {
    pub(crate) fn checkpoint_path(&self, subscriber: &str) -> PathBuf {
        self.path.join(checkpoint_file_name(subscriber))
    }

    /// Read a subscriber's durable checkpoint.
    pub fn get_checkpoint(&mut self, subscriber: &str) -> Result<Position> {
        let path = self.checkpoint_path(subscriber);
        let file = match fs::open_rw(&path, false, false, self.file_mode) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return self.fail(Kind::InvalidSubscriber)
            }
            Err(e) => return self.fail_io(Kind::Open, &e),
        };
        let _guard = match FileLock::acquire(&file) {
            Ok(g) => g,
            Err(e) => return self.fail_io(Kind::Lock, &e),
        };
        let mut buf = [0u8; CHECKPOINT_SIZE];
        if let Err(e) = file.read_exact_at(&mut buf, 0) {
            return self.fail_io(Kind::FileRead, &e);
        }
        Ok(Position::decode(&buf))
    }

    /// Persist `id` as `subscriber`'s checkpoint and run retention over
    /// the segments the checkpoint moved past.
    pub(crate) fn set_checkpoint(&mut self, subscriber: &str, id: Position) -> Result<()> {
        let path = self.checkpoint_path(subscriber);
        let file = match fs::open_rw(&path, false, false, self.file_mode) {
            Ok(f) => f,
            Err(e) => return self.fail_io(Kind::Checkpoint, &e),
        };
        let old_log;
        {
            let _guard = match FileLock::acquire(&file) {
                Ok(g) => g,
                Err(e) => return self.fail_io(Kind::Lock, &e),
            };
            let len = match fs::size(&file) {
                Ok(len) => len,
                Err(e) => return self.fail_io(Kind::Checkpoint, &e),
            };
            old_log = if len == 0 {
                // first write; no segments were pending on this subscriber
                id.log
            } else {
                let mut buf = [0u8; CHECKPOINT_SIZE];
                if let Err(e) = file.read_exact_at(&mut buf, 0) {
                    return self.fail_io(Kind::Checkpoint, &e);
                }
                Position::decode(&buf).log
            };
            if let Err(e) = file.write_all_at(&id.encode(), 0) {
                return self.fail_io(Kind::FileWrite, &e);
            }
            if self.meta.safety() == Safety::Safe {
                let _ = file.sync_all();
            }
        }
        debug!(subscriber, checkpoint = %id, "checkpoint updated");

        // retention: drop segments the checkpoint has moved past, unless
        // some other subscriber still needs them
        for log in old_log..id.log {
            if let Ok((0, _)) = self.pending_readers(log) {
                self.unlink_datafile(log);
            }
        }
        Ok(())
    }

    /// Persist `id` as this reader's checkpoint. Records at or before
    /// `id` will not be delivered again, and segments nobody needs are
    /// garbage-collected.
    pub fn read_checkpoint(&mut self, id: Position) -> Result<()> {
        self.begin();
        if !self.mode_is_read() {
            return self.fail(Kind::IllegalCheckpoint);
        }
        let subscriber = self.subscriber.clone().expect("reader has a subscriber");
        if self.set_checkpoint(&subscriber, id).is_err() {
            return self.fail(Kind::Checkpoint);
        }
        Ok(())
    }

    /// Count the subscribers whose checkpoint still needs segment `log`,
    /// and report the earliest segment any subscriber references.
    pub fn pending_readers(&mut self, log: u32) -> Result<(usize, u32)> {
        let entries = match std::fs::read_dir(&self.path) {
            Ok(e) => e,
            Err(e) => return self.fail_io(Kind::NotDirectory, &e),
        };
        let mut readers = 0;
        let mut earliest = 0u32;
        let mut seen = false;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with("cp.") {
                continue;
            }
            let Ok(file) = fs::open_rw(&entry.path(), false, false, self.file_mode) else {
                continue;
            };
            let Ok(_guard) = FileLock::acquire(&file) else {
                continue;
            };
            let mut buf = [0u8; CHECKPOINT_SIZE];
            // a checkpoint that can't be read yet (mid-creation) pins
            // everything, which errs on the side of keeping segments
            let pos = match file.read_exact_at(&mut buf, 0) {
                Ok(()) => Position::decode(&buf),
                Err(_) => Position::default(),
            };
            if !seen || pos.log < earliest {
                earliest = pos.log;
                seen = true;
            }
            if pos.log <= log {
                readers += 1;
            }
        }
        Ok((readers, earliest))
    }

    /// Register a new subscriber, positioned at the oldest retained
    /// record ([`Whence::Begin`]) or past the newest one
    /// ([`Whence::End`]).
    ///
    /// Fails with [`ErrorKind::SubscriberExists`] if the name is taken.
    pub fn add_subscriber(&mut self, subscriber: &str, whence: Whence) -> Result<()> {
        self.begin();
        let path = self.checkpoint_path(subscriber);
        match fs::open_rw(&path, true, true, self.file_mode) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return self.fail_io(Kind::SubscriberExists, &e)
            }
            Err(e) => return self.fail_io(Kind::Open, &e),
        }
        debug!(subscriber, ?whence, "subscriber added");

        match whence {
            Whence::Begin => {
                let first = self.first_log_id()?;
                if self.set_checkpoint(subscriber, first).is_err() {
                    return self.fail(Kind::Checkpoint);
                }
                Ok(())
            }
            Whence::End => {
                if let Err(e) = self.meta.open(&self.path, self.file_mode) {
                    return self.fail_io(Kind::MetaOpen, &e);
                }
                if let Err(e) = self.meta.restore(false) {
                    self.record(e);
                    return self.fail(Kind::MetaOpen);
                }
                let chkpt = Position::new(self.meta.storage_log(), 0);
                if self.set_checkpoint(subscriber, chkpt).is_err() {
                    return self.fail(Kind::Checkpoint);
                }
                // walk a throwaway reader to the end of the current segment
                let mut tmp = Journal::new(&self.path);
                tmp.open_reader(subscriber).map_err(|e| self.record(e))?;
                let interval = tmp.read_interval().map_err(|e| self.record(e))?;
                drop(tmp);
                if let Some(interval) = interval {
                    if self.set_checkpoint(subscriber, interval.finish).is_err() {
                        return self.fail(Kind::Checkpoint);
                    }
                }
                Ok(())
            }
        }
    }

    /// Register `new` with a copy of `old`'s checkpoint. If `new` already
    /// exists its checkpoint is overwritten.
    pub fn add_subscriber_copy_checkpoint(&mut self, new: &str, old: &str) -> Result<()> {
        self.begin();
        let chkpt = self.get_checkpoint(old)?;
        let mut tmp = Journal::new(&self.path);
        match tmp.add_subscriber(new, Whence::Begin) {
            Ok(()) => {}
            Err(e) if e.kind() == Kind::SubscriberExists => {}
            Err(e) => return Err(self.record(e)),
        }
        tmp.open_reader(new).map_err(|e| self.record(e))?;
        tmp.read_checkpoint(chkpt).map_err(|e| self.record(e))?;
        Ok(())
    }

    /// Drop a subscriber, unlinking its checkpoint.
    ///
    /// Fails with [`ErrorKind::InvalidSubscriber`] when no such
    /// subscriber exists. Does not run retention; the next checkpoint
    /// advance by a surviving subscriber (or [`clean`](crate::clean))
    /// reclaims anything only the removed subscriber was holding.
    pub fn remove_subscriber(&mut self, subscriber: &str) -> Result<()> {
        self.begin();
        match std::fs::remove_file(self.checkpoint_path(subscriber)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.fail(Kind::InvalidSubscriber)
            }
            Err(e) => self.fail_io(Kind::Open, &e),
        }
    }

    /// The names of all subscribers registered in this journal.
    pub fn list_subscribers(&mut self) -> Result<Vec<String>> {
        self.begin();
        let entries = match std::fs::read_dir(&self.path) {
            Ok(e) => e,
            Err(e) => return self.fail_io(Kind::NotDirectory, &e),
        };
        let mut subs = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(subscriber) = decode_checkpoint_name(name) {
                subs.push(subscriber);
            }
        }
        Ok(subs)
    }
}
