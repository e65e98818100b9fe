use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use nix::sys::signal::kill;
use nix::unistd::Pid;

use crate::error::{B2sError, Result};

/// Process-wide mutual exclusion via an exclusive pid file.
///
/// Acquisition never blocks: contention with a live owner fails with
/// [`B2sError::LockHeld`]. A lock file naming a dead pid is removed and
/// acquisition retried once.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
    held: bool,
}

impl LockFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path, held: false }
    }

    pub fn acquire(&mut self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let pid = std::process::id();
        for _ in 0..2 {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.path)
            {
                Ok(mut file) => {
                    write!(file, "{pid}")?;
                    file.flush()?;
                    self.held = true;
                    return Ok(());
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let owner = read_owner(&self.path);
                    if pid_is_running(&owner) {
                        return Err(B2sError::LockHeld(owner));
                    }
                    // Re-check presence before removing: another process may
                    // have cleaned up the stale file between our read and now.
                    if self.path.exists() {
                        if let Err(remove_err) = std::fs::remove_file(&self.path) {
                            if remove_err.kind() != std::io::ErrorKind::NotFound {
                                return Err(B2sError::LockHeld(owner));
                            }
                        }
                    }
                    tracing::info!(path = %self.path.display(), stale_pid = %owner, "removed stale lock file");
                }
                Err(e) => return Err(B2sError::Io(e)),
            }
        }
        Err(B2sError::LockHeld(read_owner(&self.path)))
    }

    pub fn release(&mut self) {
        if !self.held {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to remove lock file");
            }
        }
        self.held = false;
    }

    pub fn is_held(&self) -> bool {
        self.held
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        self.release();
    }
}

fn read_owner(path: &std::path::Path) -> String {
    match std::fs::read_to_string(path) {
        Ok(s) if !s.trim().is_empty() => s.trim().to_string(),
        _ => "unknown".to_string(),
    }
}

/// Probe liveness with signal 0. EPERM means the process exists but belongs
/// to someone else, which still counts as alive.
fn pid_is_running(pid_text: &str) -> bool {
    let Ok(pid) = pid_text.parse::<i32>() else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(nix::errno::Errno::ESRCH) => false,
        Err(_) => true,
    }
}
