//! PID file lifecycle.
//!
//! One per workspace; `is_running` checks both file presence and OS
//! liveness of the recorded pid, so a stale file left by a crash never
//! blocks the next start.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::errors::{FrameworkError, Result};

pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record `pid`, creating parent directories as needed.
    pub fn write(&self, pid: u32) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| FrameworkError::Config(format!("cannot create pid dir: {e}")))?;
        }
        std::fs::write(&self.path, pid.to_string())
            .map_err(|e| FrameworkError::Config(format!("cannot write pid file: {e}")))?;
        debug!(pid, path = %self.path.display(), "wrote pid file");
        Ok(())
    }

    /// The recorded pid, or `None` when the file is absent or garbled.
    pub fn read(&self) -> Option<u32> {
        std::fs::read_to_string(&self.path)
            .ok()
            .and_then(|s| s.trim().parse().ok())
    }

    /// Unlink the file. Idempotent.
    pub fn remove(&self) {
        let _ = std::fs::remove_file(&self.path);
    }

    /// Whether the recorded pid names a live process.
    pub fn is_running(&self) -> bool {
        match self.read() {
            Some(pid) => process_alive(pid),
            None => false,
        }
    }
}

/// `kill(pid, 0)` probes liveness without signalling; EPERM still means
/// the process exists.
fn process_alive(pid: u32) -> bool {
    let ret = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if ret == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_read_remove_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let pidfile = PidFile::new(&tmp.path().join("daemon.pid"));
        assert!(pidfile.read().is_none());
        assert!(!pidfile.is_running());

        pidfile.write(12345).unwrap();
        assert_eq!(pidfile.read(), Some(12345));

        pidfile.remove();
        assert!(pidfile.read().is_none());
        pidfile.remove(); // idempotent
    }

    #[test]
    fn own_pid_is_running() {
        let tmp = tempfile::tempdir().unwrap();
        let pidfile = PidFile::new(&tmp.path().join("daemon.pid"));
        pidfile.write(std::process::id()).unwrap();
        assert!(pidfile.is_running());
    }

    #[test]
    fn stale_pid_is_not_running() {
        let tmp = tempfile::tempdir().unwrap();
        let pidfile = PidFile::new(&tmp.path().join("daemon.pid"));
        // Far above any default pid_max on Linux.
        pidfile.write(u32::MAX - 1).unwrap();
        assert!(!pidfile.is_running());
    }

    #[test]
    fn garbled_file_reads_as_absent() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("daemon.pid");
        std::fs::write(&path, "not-a-pid").unwrap();
        let pidfile = PidFile::new(&path);
        assert!(pidfile.read().is_none());
        assert!(!pidfile.is_running());
    }
}
