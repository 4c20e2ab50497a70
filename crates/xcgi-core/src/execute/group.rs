//! Tracking and killing script process groups.
//!
//! Scripts start as leaders of their own process group so that anything
//! they spawn can be killed with them. On platforms without process groups
//! the kill falls back to the system's tree-kill utility.

use std::sync::{Arc, Mutex, PoisonError};

use rustc_hash::FxHashSet;

/// Process groups of scripts that are still running.
#[derive(Debug, Clone, Default)]
pub struct ProcessGroups {
    inner: Arc<Mutex<FxHashSet<u32>>>,
}

impl ProcessGroups {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FxHashSet<u32>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a freshly spawned group leader.
    pub fn track(&self, pgid: u32) -> GroupGuard {
        self.lock().insert(pgid);
        GroupGuard {
            groups: self.clone(),
            pgid,
            running: true,
        }
    }

    /// Kill every registered group. Returns how many kills were attempted.
    ///
    /// Used on shutdown; registrations are left to their guards.
    pub fn kill_all(&self) -> usize {
        let pgids: Vec<u32> = self.lock().iter().copied().collect();
        for &pgid in &pgids {
            if let Err(e) = kill_group(pgid) {
                tracing::warn!(pgid, "failed to kill process group: {}", e);
            }
        }
        pgids.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn remove(&self, pgid: u32) {
        self.lock().remove(&pgid);
    }
}

/// Registration of one running group.
///
/// Dropped while still running (the request went away), it kills the whole
/// group. It always deregisters.
#[derive(Debug)]
pub struct GroupGuard {
    groups: ProcessGroups,
    pgid: u32,
    running: bool,
}

impl GroupGuard {
    pub fn pgid(&self) -> u32 {
        self.pgid
    }

    /// The leader has exited and been reaped; nothing to kill on drop.
    pub fn exited(&mut self) {
        self.running = false;
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        if self.running {
            tracing::debug!(pgid = self.pgid, "request gone, killing script process group");
            if let Err(e) = kill_group(self.pgid) {
                tracing::warn!(pgid = self.pgid, "failed to kill process group: {}", e);
            }
        }
        self.groups.remove(self.pgid);
    }
}

/// Send SIGKILL to every process in group `pgid`.
///
/// A group that no longer exists is not an error.
#[cfg(unix)]
pub fn kill_group(pgid: u32) -> std::io::Result<()> {
    let Ok(pgid) = libc::pid_t::try_from(pgid) else {
        return Ok(());
    };
    // SAFETY: killpg has no memory-safety preconditions.
    let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if rc == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(())
    } else {
        Err(err)
    }
}

/// Kill the process tree rooted at `pgid` with the platform utility.
#[cfg(not(unix))]
pub fn kill_group(pgid: u32) -> std::io::Result<()> {
    std::process::Command::new("taskkill")
        .args(["/T", "/F", "/PID", &pgid.to_string()])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|_| ())
}
