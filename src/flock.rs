use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Name of the lock file inside a database directory.
pub const LOCK_FILE: &str = "cowdb.lock";

/// Exclusive advisory lock on a database directory.
///
/// The lock is held for as long as the value lives; the file itself is left
/// behind so that a concurrent opener never races on its creation.
#[derive(Debug)]
pub struct FileLock {
    _file: File,
    path: PathBuf,
}

impl FileLock {
    /// Locks `LOCK_FILE` inside `dir`, writing the owner pid into it.
    pub fn lock_dir(dir: &Path) -> Result<Self> {
        Self::lock(dir.join(LOCK_FILE))
    }

    pub fn lock<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;

        Self::try_lock(&file).map_err(Error::Locked)?;

        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        file.flush()?;

        tracing::debug!(path = %path.display(), "Acquired database lock");
        Ok(Self { _file: file, path })
    }

    fn try_lock(file: &File) -> std::io::Result<()> {
        use libc::{flock, LOCK_EX, LOCK_NB};

        let fd = file.as_raw_fd();
        let result = unsafe { flock(fd, LOCK_EX | LOCK_NB) };
        if result != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_lock_writes_pid() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let lock = FileLock::lock_dir(dir.path()).expect("Failed to acquire lock");

        assert_eq!(lock.path(), dir.path().join(LOCK_FILE));
        let content = fs::read_to_string(lock.path()).expect("Failed to read lock file");
        assert_eq!(content.trim(), std::process::id().to_string());
    }

    #[test]
    fn test_double_lock() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let _lock1 = FileLock::lock_dir(dir.path()).expect("Failed to acquire first lock");

        let lock2 = FileLock::lock_dir(dir.path());
        assert!(matches!(lock2, Err(Error::Locked(_))));
    }

    #[test]
    fn test_auto_unlock_on_drop() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        {
            let _lock = FileLock::lock_dir(dir.path()).expect("Failed to acquire lock");
        }
        let _lock2 =
            FileLock::lock_dir(dir.path()).expect("Should be able to acquire lock after drop");
    }
}
