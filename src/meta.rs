//! Metastore manager
//!
//! The metastore is a single 16-byte file at the root of the journal
//! directory holding the current writer segment, the rotation threshold,
//! the safety mode, and the record magic. Once a context opens it for
//! real work the file is mapped read-write and shared with every other
//! process using the directory; updates happen in place under the
//! metastore's advisory lock and are pushed out with msync.
//!
//! Before a context opens the metastore (and during `init`, which writes
//! the file for the first time), the values live in an in-memory template
//! that `alter_safety` and friends may adjust.
//!
//! Directories written by the legacy 12-byte layout (no record magic) are
//! upgraded on first open by appending a zero magic word; records in such
//! directories were written with magic 0, so the zero is used as-is.

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;

use memmap2::MmapMut;
use tracing::debug;

use crate::error::{Error, ErrorKind, Result};
use crate::format::{MetaValues, Safety, LEGACY_METASTORE_SIZE, METASTORE_SIZE};
use crate::fs::{self, FileLock};

/// Metastore handle: the open file, its shared mapping, and the pre-open
/// template values.
pub(crate) struct Metastore {
    // map before file so the mapping is torn down first on drop
    map: Option<MmapMut>,
    file: Option<File>,
    template: MetaValues,
}

impl Metastore {
    pub(crate) fn new() -> Metastore {
        Metastore {
            map: None,
            file: None,
            template: MetaValues::default(),
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.file.is_some()
    }

    pub(crate) fn is_mapped(&self) -> bool {
        self.map.is_some()
    }

    /// The open metastore file, or `MetaOpen` if nothing is open yet.
    pub(crate) fn file(&self) -> Result<&File> {
        self.file
            .as_ref()
            .ok_or_else(|| Error::new(ErrorKind::MetaOpen))
    }

    /// Open (creating if necessary) `<dir>/metastore`.
    pub(crate) fn open(&mut self, dir: &Path, mode: u32) -> io::Result<()> {
        if self.file.is_some() {
            return Ok(());
        }
        debug!(path = %dir.display(), "opening metastore");
        self.file = Some(fs::open_rw(&dir.join("metastore"), true, false, mode)?);
        Ok(())
    }

    /// Map the metastore read-write, upgrading the legacy 12-byte layout
    /// if present. No-op when already mapped.
    pub(crate) fn restore(&mut self, already_locked: bool) -> Result<()> {
        if self.map.is_some() {
            return Ok(());
        }
        let file = self.file()?;
        let _guard = if already_locked {
            None
        } else {
            Some(FileLock::acquire(file).map_err(|e| Error::io(ErrorKind::Lock, &e))?)
        };

        let len = fs::size(file).map_err(|e| Error::io(ErrorKind::Open, &e))?;
        if len == LEGACY_METASTORE_SIZE as u64 {
            // The old layout stops before hdr_magic; records were written
            // with magic 0, so extend with a zero word.
            debug!("upgrading legacy metastore");
            file.write_all_at(&0u32.to_le_bytes(), LEGACY_METASTORE_SIZE as u64)
                .map_err(|e| Error::io(ErrorKind::Open, &e))?;
        }

        let map = unsafe { MmapMut::map_mut(file) }.map_err(|e| Error::io(ErrorKind::Open, &e))?;
        if map.len() != METASTORE_SIZE {
            return Err(Error::new(ErrorKind::Open));
        }
        self.map = Some(map);
        // keep the template's magic in sync for contexts that reopen
        self.template.hdr_magic = self.values().hdr_magic;
        Ok(())
    }

    /// Persist the metastore under its lock. Mapped stores are msync'd
    /// (synchronously only in [`Safety::Safe`]); unmapped stores are
    /// written positionally and fsync'd iff safe.
    pub(crate) fn save(&mut self, already_locked: bool) -> Result<()> {
        let file = self.file()?;
        let _guard = if already_locked {
            None
        } else {
            Some(FileLock::acquire(file).map_err(|e| Error::io(ErrorKind::Lock, &e))?)
        };

        match &self.map {
            Some(map) => {
                let res = if self.values().safety == Safety::Safe {
                    map.flush()
                } else {
                    map.flush_async()
                };
                res.map_err(|e| Error::io(ErrorKind::FileWrite, &e))?;
            }
            None => {
                file.write_all_at(&self.template.encode(), 0)
                    .map_err(|e| Error::io(ErrorKind::FileWrite, &e))?;
                if self.template.safety == Safety::Safe {
                    let _ = file.sync_all();
                }
            }
        }
        Ok(())
    }

    /// Current values: the shared mapping when mapped, the template before.
    pub(crate) fn values(&self) -> MetaValues {
        match &self.map {
            Some(map) => {
                let buf: &[u8; METASTORE_SIZE] = map[..METASTORE_SIZE].try_into().unwrap();
                MetaValues::decode(buf)
            }
            None => self.template,
        }
    }

    pub(crate) fn storage_log(&self) -> u32 {
        self.values().storage_log
    }

    pub(crate) fn unit_limit(&self) -> u32 {
        self.values().unit_limit
    }

    pub(crate) fn safety(&self) -> Safety {
        self.values().safety
    }

    pub(crate) fn hdr_magic(&self) -> u32 {
        self.values().hdr_magic
    }

    pub(crate) fn set_storage_log(&mut self, log: u32) {
        match &mut self.map {
            Some(map) => map[0..4].copy_from_slice(&log.to_le_bytes()),
            None => self.template.storage_log = log,
        }
    }

    pub(crate) fn set_unit_limit(&mut self, limit: u32) {
        match &mut self.map {
            Some(map) => map[4..8].copy_from_slice(&limit.to_le_bytes()),
            None => self.template.unit_limit = limit,
        }
    }

    pub(crate) fn set_safety(&mut self, safety: Safety) {
        match &mut self.map {
            Some(map) => map[8..12].copy_from_slice(&safety.as_u32().to_le_bytes()),
            None => self.template.safety = safety,
        }
    }

    pub(crate) fn close(&mut self) {
        self.map = None;
        self.file = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn save_restore_round_trip() {
        let dir = tempdir().unwrap();

        let mut meta = Metastore::new();
        meta.open(dir.path(), 0o640).unwrap();
        meta.save(false).unwrap(); // template write path
        meta.restore(false).unwrap();
        assert!(meta.is_mapped());
        assert_eq!(meta.values(), MetaValues::default());

        meta.set_storage_log(7);
        meta.save(false).unwrap();
        drop(meta);

        let mut reopened = Metastore::new();
        reopened.open(dir.path(), 0o640).unwrap();
        reopened.restore(false).unwrap();
        assert_eq!(reopened.storage_log(), 7);
    }

    #[test]
    fn legacy_layout_is_upgraded() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("metastore");
        let legacy = {
            let mut buf = Vec::new();
            buf.extend_from_slice(&3u32.to_le_bytes()); // storage_log
            buf.extend_from_slice(&1024u32.to_le_bytes()); // unit_limit
            buf.extend_from_slice(&2u32.to_le_bytes()); // safety
            buf
        };
        std::fs::write(&path, &legacy).unwrap();

        let mut meta = Metastore::new();
        meta.open(dir.path(), 0o640).unwrap();
        meta.restore(false).unwrap();

        assert_eq!(std::fs::metadata(&path).unwrap().len(), METASTORE_SIZE as u64);
        let vals = meta.values();
        assert_eq!(vals.storage_log, 3);
        assert_eq!(vals.unit_limit, 1024);
        assert_eq!(vals.safety, Safety::Safe);
        assert_eq!(vals.hdr_magic, 0);
    }

    #[test]
    fn unmapped_values_come_from_template() {
        let meta = Metastore::new();
        assert!(!meta.is_open());
        assert_eq!(meta.values(), MetaValues::default());
    }
}
