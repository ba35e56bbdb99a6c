//! Repair paths
//!
//! Three layers of recovery, from surgical to scorched-earth:
//!
//! - [`Journal::repair_datafile`] salvages a damaged segment in place:
//!   it locates runs of valid record headers (two consecutive valid
//!   headers anchor a resync), slides the valid runs left over the junk
//!   between them, and truncates the result
//! - [`Journal::repair`] rebuilds lost or mangled directory metadata:
//!   the metastore is recreated from the segment files present, and the
//!   first checkpoint found is reset to the earliest segment; with
//!   `aggressive` the whole directory is destroyed when that fails
//! - [`clean`] removes segment files every subscriber has moved past,
//!   for directories whose retention fell behind
//!
//! [`Journal::inspect_datafile`] is the read-only sibling of the
//! salvage: it walks a segment's records and reports what it finds.

use std::fs::File;
use std::os::unix::fs::FileExt;

use tracing::debug;

use crate::error::{Error, ErrorKind as Kind, Result};
use crate::format::{
    MessageHeader, MetaValues, Position, Safety, DEFAULT_FILE_MODE, DEFAULT_HDR_MAGIC,
    DEFAULT_UNIT_LIMIT, METASTORE_SIZE,
};
use crate::fs::{self, FileLock};
use crate::store::parse_log_name;
use crate::Journal;

const HDR: u64 = MessageHeader::SIZE as u64;

/// What [`Journal::inspect_datafile`] found in a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentSummary {
    /// Number of complete, valid records
    pub records: u32,
    /// Bytes after the last complete record (fewer than a header)
    pub trailing_junk: u64,
}

impl Journal {
    /// Salvage a damaged segment by compacting away byte ranges that do
    /// not parse as records. Returns the number of holes removed; 0 means
    /// the segment was clean.
    ///
    /// Must not be used on the writer's current segment.
    pub fn repair_datafile(&mut self, log: u32) -> Result<usize> {
        self.begin();
        self.open_reader_segment(log)?;
        let guard = {
            let data = self.data.as_ref().unwrap();
            match FileLock::acquire(data) {
                Ok(g) => g,
                Err(e) => return self.fail_io(Kind::Lock, &e),
            }
        };
        let orig_len = match fs::size(self.data.as_ref().unwrap()) {
            Ok(len) => len,
            Err(e) => return self.fail_io(Kind::FileSeek, &e),
        };
        if orig_len == 0 {
            return Ok(0);
        }
        self.mmap_reader_segment(log)?;

        let magic = self.meta.hdr_magic();
        let invalid = scan_invalid(self.rmap.as_ref().unwrap(), magic);
        let holes = invalid.len();
        debug!(segment = log, holes, "datafile scan complete");

        if !invalid.is_empty() {
            // the mapping must go before the file shrinks
            self.munmap_reader_segment();
            let data = self.data.as_ref().unwrap();
            compact(data, &invalid, orig_len).map_err(|e| self.record(e))?;
        }
        drop(guard);
        Ok(holes)
    }

    /// Walk a segment's records without modifying anything.
    ///
    /// Fails with [`ErrorKind::FileCorrupt`] on a header that does not
    /// carry the directory magic or a record running past the end of the
    /// file; up to a header's worth of trailing bytes is reported as
    /// junk, not an error.
    pub fn inspect_datafile(&mut self, log: u32) -> Result<SegmentSummary> {
        self.begin();
        self.open_reader_segment(log)?;
        let data_len = match fs::size(self.data.as_ref().unwrap()) {
            Ok(len) => len,
            Err(e) => return self.fail_io(Kind::FileSeek, &e),
        };
        if data_len == 0 {
            return Ok(SegmentSummary {
                records: 0,
                trailing_junk: 0,
            });
        }
        self.mmap_reader_segment(log)?;
        let magic = self.meta.hdr_magic();
        inspect_map(self.rmap.as_ref().unwrap(), magic).map_err(|e| self.record(e))
    }

    /// Rebuild directory metadata after loss or corruption.
    ///
    /// Non-aggressive repair recreates the metastore (current segment =
    /// the latest hex-named file, defaults for everything else) when its
    /// contents are not already exactly that, and resets the first
    /// checkpoint file found to the earliest segment. On a healthy
    /// directory both checks pass untouched, so the call is a no-op.
    ///
    /// Aggressive repair gives up on the directory entirely: every entry
    /// is unlinked and the directory itself removed.
    pub fn repair(&mut self, aggressive: bool) -> Result<()> {
        self.begin();
        let names: Vec<String> = match std::fs::read_dir(&self.path) {
            Ok(entries) => entries
                .flatten()
                .filter_map(|e| e.file_name().to_str().map(String::from))
                .collect(),
            Err(_) => {
                if aggressive && std::fs::remove_dir(&self.path).is_ok() {
                    return Ok(());
                }
                return self.fail(Kind::NotDirectory);
            }
        };

        // earliest and latest hex-named files present
        let mut earliest = 0u32;
        let mut latest = 0u32;
        let mut seen = false;
        for name in &names {
            if name.len() != 8 || !name.bytes().all(|b| b.is_ascii_hexdigit()) {
                continue;
            }
            let Ok(log) = u32::from_str_radix(name, 16) else {
                continue;
            };
            if !seen {
                earliest = log;
                latest = log;
                seen = true;
            } else {
                earliest = earliest.min(log);
                latest = latest.max(log);
            }
        }

        let meta_ok = self.rebuild_metastore(latest);
        let checkpoint_ok = self.rebuild_checkpoint(earliest, &names);
        if !aggressive {
            if meta_ok && checkpoint_ok {
                return Ok(());
            }
            return self.fail(Kind::CreateMeta);
        }

        // last resort: destroy the directory. Rescan so files the rebuild
        // steps created are caught; unlinking mid-scan is unsafe, so the
        // deletions are deferred until the scan completes.
        debug!(path = %self.path.display(), "aggressive repair: removing directory");
        let doomed: Vec<std::path::PathBuf> = match std::fs::read_dir(&self.path) {
            Ok(entries) => entries.flatten().map(|e| e.path()).collect(),
            Err(_) => Vec::new(),
        };
        for path in doomed {
            let _ = std::fs::remove_file(path);
        }
        if std::fs::remove_dir(&self.path).is_ok() {
            Ok(())
        } else {
            self.fail(Kind::NotDirectory)
        }
    }

    /// Make the metastore exactly `(latest, defaults)`; true on success.
    fn rebuild_metastore(&mut self, latest: u32) -> bool {
        let goal = MetaValues {
            storage_log: latest,
            unit_limit: DEFAULT_UNIT_LIMIT,
            safety: Safety::AlmostSafe,
            hdr_magic: DEFAULT_HDR_MAGIC,
        }
        .encode();
        let path = self.path.join("metastore");
        match std::fs::read(&path) {
            Ok(bytes) if bytes.len() == METASTORE_SIZE && bytes == goal => return true,
            _ => {}
        }
        debug!("rebuilding metastore");
        let _ = std::fs::remove_file(&path);
        match fs::open_rw(&path, true, false, DEFAULT_FILE_MODE) {
            Ok(file) => file.write_all_at(&goal, 0).is_ok(),
            Err(_) => false,
        }
    }

    /// Reset the first checkpoint file found to `(earliest, 0)`; true on
    /// success (vacuously, when there is no checkpoint to fix).
    fn rebuild_checkpoint(&mut self, earliest: u32, names: &[String]) -> bool {
        let Some(name) = names.iter().find(|n| n.starts_with("cp.")) else {
            // nothing to do without a checkpoint file name to recreate
            return true;
        };
        let path = self.path.join(name);
        let goal = Position::new(earliest, 0).encode();
        match std::fs::read(&path) {
            Ok(bytes) if bytes == goal => return true,
            _ => {}
        }
        debug!(checkpoint = %name, "rebuilding checkpoint");
        match fs::open_rw(&path, true, false, DEFAULT_FILE_MODE) {
            Ok(file) => file.set_len(0).is_ok() && file.write_all_at(&goal, 0).is_ok(),
            Err(_) => false,
        }
    }
}

/// Remove every segment file (and index) that all subscribers have moved
/// past. Returns how many segments were unlinked.
pub fn clean(path: impl AsRef<std::path::Path>) -> Result<usize> {
    let mut journal = Journal::new(path.as_ref());
    let _ = journal.open_writer();
    let (_, earliest) = journal.pending_readers(0)?;

    let entries = match std::fs::read_dir(journal.path()) {
        Ok(e) => e,
        Err(e) => return journal.fail_io(Kind::NotDirectory, &e),
    };
    let stale: Vec<u32> = entries
        .flatten()
        .filter_map(|e| e.file_name().to_str().and_then(parse_log_name))
        .filter(|&log| log < earliest)
        .collect();

    let mut removed = 0;
    for log in stale {
        journal.unlink_datafile(log);
        removed += 1;
    }
    Ok(removed)
}

/// Byte ranges of `map` that do not parse as records.
///
/// A valid run is anchored by a header carrying the magic whose record is
/// followed either by the end of the file or by another valid header. On
/// damage, the record adjacent to the junk is treated as suspect and
/// falls into the hole with it.
fn scan_invalid(map: &[u8], magic: u32) -> Vec<(u64, u64)> {
    let end = map.len() as u64;
    let mut invalid = Vec::new();
    let mut tag_from: u64 = 0;
    let mut scan_from: u64 = 0;
    loop {
        // find an anchor at or after scan_from
        let mut next = scan_from;
        let (anchor, after) = loop {
            if next + HDR > end {
                if tag_from != end {
                    invalid.push((tag_from, end));
                }
                return invalid;
            }
            if magic_at(map, next) == magic {
                let after = next + HDR + mlen_at(map, next);
                if after == end {
                    break (next, after);
                }
                if after + HDR <= end && magic_at(map, after) == magic {
                    break (next, after);
                }
            }
            next += 1;
        };
        if anchor > tag_from {
            invalid.push((tag_from, anchor));
        }

        // walk validated records starting after the anchor record
        let mut this = after;
        loop {
            if this == end {
                return invalid;
            }
            let next_rec = this + HDR + mlen_at(map, this);
            if next_rec == end {
                return invalid;
            }
            if next_rec + HDR > end || magic_at(map, next_rec) != magic {
                tag_from = this;
                scan_from = this + HDR;
                break;
            }
            this = next_rec;
        }
    }
}

fn magic_at(map: &[u8], off: u64) -> u32 {
    let off = off as usize;
    u32::from_le_bytes(map[off..off + 4].try_into().unwrap())
}

fn mlen_at(map: &[u8], off: u64) -> u64 {
    let off = off as usize;
    u32::from_le_bytes(map[off + 12..off + 16].try_into().unwrap()) as u64
}

/// Close every hole by sliding the valid run after it left, then cut the
/// file at the compacted length.
fn compact(data: &File, invalid: &[(u64, u64)], orig_len: u64) -> std::result::Result<(), Error> {
    let mut dst = invalid[0].0;
    for i in 0..invalid.len() - 1 {
        let src = invalid[i].1;
        let len = invalid[i + 1].0 - src;
        move_range(data, src, dst, len)?;
        dst += len;
    }
    let src = invalid[invalid.len() - 1].1;
    if orig_len > src {
        let len = orig_len - src;
        move_range(data, src, dst, len)?;
        dst += len;
    }
    data.set_len(dst)
        .map_err(|e| Error::io(Kind::FileWrite, &e))?;
    Ok(())
}

fn move_range(
    data: &File,
    mut src: u64,
    mut dst: u64,
    mut len: u64,
) -> std::result::Result<(), Error> {
    let mut buf = [0u8; 4096];
    while len > 0 {
        let chunk = len.min(buf.len() as u64) as usize;
        data.read_exact_at(&mut buf[..chunk], src)
            .map_err(|e| Error::io(Kind::FileRead, &e))?;
        data.write_all_at(&buf[..chunk], dst)
            .map_err(|e| Error::io(Kind::FileWrite, &e))?;
        src += chunk as u64;
        dst += chunk as u64;
        len -= chunk as u64;
    }
    Ok(())
}

fn inspect_map(map: &[u8], magic: u32) -> std::result::Result<SegmentSummary, Error> {
    let end = map.len() as u64;
    let mut pos: u64 = 0;
    let mut records = 0u32;
    while pos + HDR <= end {
        let header = MessageHeader::decode(&map[pos as usize..pos as usize + HDR as usize]);
        if header.magic != magic {
            return Err(Error::new(Kind::FileCorrupt));
        }
        let next = pos + HDR + header.mlen as u64;
        if next > end {
            return Err(Error::new(Kind::FileCorrupt));
        }
        records += 1;
        pos = next;
    }
    Ok(SegmentSummary {
        records,
        trailing_junk: end - pos,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(magic: u32, payload: &[u8]) -> Vec<u8> {
        let header = MessageHeader {
            magic,
            tv_sec: 1,
            tv_usec: 2,
            mlen: payload.len() as u32,
        };
        let mut buf = header.encode().to_vec();
        buf.extend_from_slice(payload);
        buf
    }

    #[test]
    fn scan_clean_segment_finds_nothing() {
        let magic = DEFAULT_HDR_MAGIC;
        let mut seg = Vec::new();
        seg.extend(record(magic, b"one"));
        seg.extend(record(magic, b"two"));
        seg.extend(record(magic, b""));
        assert!(scan_invalid(&seg, magic).is_empty());
    }

    #[test]
    fn scan_flags_leading_garbage() {
        let magic = DEFAULT_HDR_MAGIC;
        let mut seg = vec![0xAAu8; 7];
        seg.extend(record(magic, b"one"));
        seg.extend(record(magic, b"two"));
        let invalid = scan_invalid(&seg, magic);
        assert_eq!(invalid, vec![(0, 7)]);
    }

    #[test]
    fn scan_flags_mangled_middle_header() {
        let magic = DEFAULT_HDR_MAGIC;
        let r1 = record(magic, b"aaaa");
        let r2 = record(magic, b"bbbb");
        let r3 = record(magic, b"cccc");
        let r4 = record(magic, b"dddd");
        let mut seg = Vec::new();
        seg.extend(&r1);
        seg.extend(&r2);
        seg.extend(&r3);
        seg.extend(&r4);
        // break record 3's magic
        let r3_off = r1.len() + r2.len();
        seg[r3_off] ^= 0xFF;

        let invalid = scan_invalid(&seg, magic);
        // record 2 sits next to the damage and is dropped with it
        assert_eq!(invalid, vec![(r1.len() as u64, (r3_off + r3.len()) as u64)]);
    }

    #[test]
    fn scan_flags_torn_tail() {
        let magic = DEFAULT_HDR_MAGIC;
        let r1 = record(magic, b"aaaa");
        let mut seg = r1.clone();
        seg.extend(record(magic, b"bbbb"));
        seg.extend_from_slice(&[1, 2, 3]); // less than a header
        let invalid = scan_invalid(&seg, magic);
        // the record before the torn bytes is suspect too
        assert_eq!(invalid, vec![(r1.len() as u64, seg.len() as u64)]);
    }

    #[test]
    fn inspect_counts_records_and_junk() {
        let magic = DEFAULT_HDR_MAGIC;
        let mut seg = Vec::new();
        seg.extend(record(magic, b"one"));
        seg.extend(record(magic, b"two"));
        seg.extend_from_slice(&[0u8; 5]);
        let summary = inspect_map(&seg, magic).unwrap();
        assert_eq!(summary.records, 2);
        assert_eq!(summary.trailing_junk, 5);
    }

    #[test]
    fn inspect_rejects_bad_magic() {
        let magic = DEFAULT_HDR_MAGIC;
        let mut seg = record(magic, b"one");
        seg.extend(record(magic ^ 1, b"two"));
        let err = inspect_map(&seg, magic).unwrap_err();
        assert_eq!(err.kind(), Kind::FileCorrupt);
    }
}
