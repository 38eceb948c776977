//! Single-flight guard: one update pipeline per device.

use crate::error::{AgentError, AgentResult};
use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::Path;

/// Exclusive advisory `flock` on the update lock file.
///
/// Released when dropped (closing the descriptor drops the lock), including
/// when the process dies.
#[derive(Debug)]
pub struct UpdateLock {
    _file: File,
}

impl UpdateLock {
    /// Take the lock without waiting. Fails with [`AgentError::Busy`] if
    /// another pipeline holds it.
    pub fn acquire(path: &Path) -> AgentResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;

        // SAFETY: the descriptor is owned by `file` and open for this call.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            return Err(match err.kind() {
                std::io::ErrorKind::WouldBlock => AgentError::Busy,
                _ => AgentError::Io(err),
            });
        }

        Ok(Self { _file: file })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_holder_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("update.lock");

        let first = UpdateLock::acquire(&path).unwrap();
        assert!(matches!(UpdateLock::acquire(&path), Err(AgentError::Busy)));

        drop(first);
        assert!(UpdateLock::acquire(&path).is_ok());
    }
}
