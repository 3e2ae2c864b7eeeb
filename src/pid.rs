//! Single-instance guard via a locked pid file.

use anyhow::{Context, Result, bail};
use nix::fcntl::{Flock, FlockArg};
use std::env;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const PID_FILE_NAME: &str = "flashwin.pid";

/// `$XDG_RUNTIME_DIR`, falling back to `/tmp`.
pub fn runtime_dir() -> PathBuf {
    env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
}

pub fn pid_file_path() -> PathBuf {
    runtime_dir().join(PID_FILE_NAME)
}

/// Held for the lifetime of the daemon; dropping it releases the lock.
pub struct PidLock {
    _lock: Flock<File>,
}

/// Take an exclusive non-blocking lock on the pid file, failing if another
/// instance already holds it.
pub fn lock_pid_file(path: &Path) -> Result<PidLock> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open pid file {}", path.display()))?;
    match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
        Ok(mut lock) => {
            let _ = writeln!(lock, "{}", std::process::id());
            Ok(PidLock { _lock: lock })
        }
        Err(_) => bail!("another flashwin instance is running"),
    }
}

pub fn ensure_single_instance() -> Result<PidLock> {
    lock_pid_file(&pid_file_path())
}
