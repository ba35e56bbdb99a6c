//! File primitive: open modes and advisory locking
//!
//! All cross-process coordination in a journal directory goes through
//! POSIX advisory locks on individual files. The lock guard duplicates
//! the file handle so the lock's lifetime is tied to the guard, not to
//! a borrow of the caller's handle.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use fs2::FileExt;

/// Open a file read-write, optionally creating it (exclusively if `excl`)
/// with the given permission bits.
pub(crate) fn open_rw(path: &Path, create: bool, excl: bool, mode: u32) -> io::Result<File> {
    let mut opts = OpenOptions::new();
    opts.read(true).write(true).mode(mode);
    if excl {
        opts.create_new(true);
    } else if create {
        opts.create(true);
    }
    opts.open(path)
}

/// Current size of an open file in bytes.
pub(crate) fn size(file: &File) -> io::Result<u64> {
    Ok(file.metadata()?.len())
}

/// An exclusive advisory lock, released on drop.
pub(crate) struct FileLock {
    file: File,
}

impl FileLock {
    /// Block until an exclusive lock on `file` is acquired.
    pub(crate) fn acquire(file: &File) -> io::Result<FileLock> {
        let dup = file.try_clone()?;
        dup.lock_exclusive()?;
        Ok(FileLock { file: dup })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_create_and_size() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");
        let file = open_rw(&path, true, false, 0o640).unwrap();
        assert_eq!(size(&file).unwrap(), 0);

        // exclusive create on an existing file fails
        assert!(open_rw(&path, true, true, 0o640).is_err());
    }

    #[test]
    fn lock_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("lk");
        let file = open_rw(&path, true, false, 0o640).unwrap();
        {
            let _guard = FileLock::acquire(&file).unwrap();
        }
        // the lock was released on drop, so a second acquire succeeds
        let _guard = FileLock::acquire(&file).unwrap();
    }
}
