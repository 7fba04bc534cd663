//! Filesystem helpers around the mountpoint: the advisory lock that keeps
//! a mountpoint single-owner, and the sidecar file advertising the HTTP
//! port.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use tracing::{error, warn};

/// Advisory file lock held for the daemon's lifetime. Two daemons on the
/// same mountpoint contend on `${path}.lck`; the loser refuses to start.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Creates the lock file and takes an exclusive, non-blocking lock.
    pub fn acquire(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        use std::os::unix::fs::OpenOptionsExt;

        let path = path.into();
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o666)
            .open(&path)?;

        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::WouldBlock {
                error!("lockfile '{}': lock failed: {err}", path.display());
            }
            return Err(err);
        }

        // Extra information only, errors are of no consequence.
        let mut file = file;
        let _ = file.set_len(0);
        let _ = write!(file, "{}", std::process::id());
        let _ = file.sync_all();

        Ok(Self { file, path })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
        if let Err(err) = std::fs::remove_file(&self.path) {
            warn!("cannot remove lockfile '{}': {err}", self.path.display());
        }
    }
}

/// `${root}${mount}.http`, holding the actual HTTP port so external tools
/// can find the status page. Removed on shutdown.
#[derive(Debug)]
pub struct HttpPortFile {
    path: PathBuf,
}

impl HttpPortFile {
    pub fn write(path: impl Into<PathBuf>, port: u16) -> Self {
        let path = path.into();
        if let Err(err) = std::fs::write(&path, port.to_string()) {
            warn!("cannot write HTTP port file '{}': {err}", path.display());
        }
        Self { path }
    }
}

impl Drop for HttpPortFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Joins root + mountpoint (+suffix) the way the pathnames are
/// documented: plain concatenation, the mountpoint keeps its leading `/`.
pub fn mount_path(root: &str, mountpoint: &str, suffix: &str) -> PathBuf {
    PathBuf::from(format!("{root}{mountpoint}{suffix}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_lock_on_same_path_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("servicebroker.lck");

        let first = FileLock::acquire(&path).unwrap();
        assert!(FileLock::acquire(&path).is_err());
        drop(first);
        let _third = FileLock::acquire(&path).unwrap();
    }

    #[test]
    fn lock_file_holds_the_pid_and_goes_away() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sb.lck");
        {
            let _lock = FileLock::acquire(&path).unwrap();
            let content = std::fs::read_to_string(&path).unwrap();
            assert_eq!(content, std::process::id().to_string());
        }
        assert!(!path.exists());
    }

    #[test]
    fn port_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("servicebroker.http");
        {
            let _f = HttpPortFile::write(&path, 3744);
            assert_eq!(std::fs::read_to_string(&path).unwrap(), "3744");
        }
        assert!(!path.exists());
    }

    #[test]
    fn path_concatenation() {
        assert_eq!(
            mount_path("/var/run/servicebroker/", "/servicebroker", ".lck"),
            Path::new("/var/run/servicebroker//servicebroker.lck")
        );
    }
}
