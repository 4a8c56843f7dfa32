//! Cross-process exclusive per-container lock.
//!
//! Each invocation of this runtime is a short-lived process (no daemon), so an in-process
//! mutex cannot linearize operations on a given container id across separate invocations. An
//! advisory `flock(2)` held on `<state_root>/<id>/lock` for the duration of a state-mutating
//! operation provides that guarantee instead; the lock is released automatically (by the OS)
//! when the holding process exits, even if it crashes.

use nix::fcntl::{flock, FlockArg};
use std::{
    fs::{File, OpenOptions},
    io,
    os::unix::io::AsRawFd,
    path::Path,
};

/// An acquired exclusive lock on a container's lock file. Released on drop.
pub struct ContainerLock {
    file: File,
}

impl ContainerLock {
    /// Attempts to acquire the lock without blocking. Returns an error if another process
    /// already holds it.
    pub fn acquire(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(path.as_ref())?;

        flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock)
            .map_err(|e| io::Error::new(io::ErrorKind::WouldBlock, e))?;

        Ok(Self { file })
    }
}

impl Drop for ContainerLock {
    fn drop(&mut self) {
        let _ = flock(self.file.as_raw_fd(), FlockArg::UnlockNonblock);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn second_acquire_fails_while_first_held() {
        let file = NamedTempFile::new().unwrap();
        let first = ContainerLock::acquire(file.path()).unwrap();
        assert!(ContainerLock::acquire(file.path()).is_err());
        drop(first);
        assert!(ContainerLock::acquire(file.path()).is_ok());
    }
}
