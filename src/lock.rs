//! File locking for mutual exclusion between the daemon and one-shot CLI runs.
//!
//! Uses flock() advisory locking on a file in the base directory. The daemon
//! acquires the lock on startup and holds it for its lifetime; standalone CLI
//! commands acquire it per operation.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

/// Lock file name placed in the base directory
const LOCK_FILE_NAME: &str = "dv.lock";

/// A held file lock that releases on drop
pub struct FileLock {
    #[allow(dead_code)]
    file: File,
}

impl FileLock {
    /// Attempt to acquire an exclusive lock on the vault.
    /// Returns `Ok(FileLock)` if acquired, or `WouldBlock` if another process holds it.
    pub fn try_acquire(base_path: &Path) -> io::Result<Self> {
        let file = Self::open_lock_file(base_path)?;
        Self::try_lock_exclusive(&file)?;
        Ok(FileLock { file })
    }

    fn open_lock_file(base_path: &Path) -> io::Result<File> {
        std::fs::create_dir_all(base_path)?;
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(base_path.join(LOCK_FILE_NAME))
    }

    #[cfg(unix)]
    fn try_lock_exclusive(file: &File) -> io::Result<()> {
        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
        if result != 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock
                || err.raw_os_error() == Some(libc::EWOULDBLOCK)
                || err.raw_os_error() == Some(libc::EAGAIN)
            {
                return Err(io::Error::new(
                    io::ErrorKind::WouldBlock,
                    "vault is locked by another process (daemon or CLI)",
                ));
            }
            return Err(err);
        }
        Ok(())
    }

    // flock is per-descriptor; dropping the File releases the lock.

    #[cfg(not(unix))]
    fn try_lock_exclusive(_file: &File) -> io::Result<()> {
        Ok(())
    }
}
