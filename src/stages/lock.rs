// src/stages/lock.rs

//! At most one running instance per lock file.
//!
//! The lock file holds the owner's PID as decimal text. The PID is written to
//! a temporary file in the same directory which is then hard-linked into
//! place, so the lock appears with its content in one step and two guards can
//! never both create it. A lock file that is nevertheless empty (written by
//! something else) counts as held by an unknown owner.
//!
//! A stale lock (owner gone) is reclaimed by re-reading it, removing it only
//! if it still names the same dead PID, then creating a fresh one. Between
//! that re-read and the remove a concurrent guard can still reclaim the same
//! stale lock and create its own, which the remove then deletes; both runs
//! proceed in that case. Liveness is checked with signal 0, so a reused PID
//! makes a dead owner look alive and the run is skipped. Both are accepted for
//! a single host running cron jobs minutes apart.

use crate::error::GuardError;
use crate::pipeline::{Next, RunContext, Stage, Status};
use crate::sink::write_str;
use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Whether a process with `pid` exists. EPERM means it exists but belongs to
/// someone else.
pub fn is_alive(pid: i32) -> bool {
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(_) => true,
    }
}

/// Who the lock file says holds the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Owner {
    Free,
    Pid(i32),
    /// The file exists but holds no PID yet.
    Unknown,
}

fn read_owner(path: &Path) -> Result<Owner, GuardError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Owner::Free),
        Err(e) => {
            return Err(GuardError::Lock(format!(
                "unable to read {}: {e}",
                path.display()
            )))
        }
    };
    let content = content.trim();
    if content.is_empty() {
        return Ok(Owner::Unknown);
    }
    match content.parse::<i32>() {
        Ok(pid) if pid > 0 => Ok(Owner::Pid(pid)),
        _ => Err(GuardError::Lock(format!(
            "unable to read pid from {}: {content:?}",
            path.display()
        ))),
    }
}

/// Removes the lock at `path` if it still names `pid`. `Ok(false)` means
/// someone else changed it since it was found stale.
fn remove_stale(path: &Path, pid: i32) -> Result<bool, GuardError> {
    if read_owner(path)? != Owner::Pid(pid) {
        return Ok(false);
    }
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(true),
        Err(e) => Err(GuardError::Lock(format!(
            "unable to remove stale {}: {e}",
            path.display()
        ))),
    }
}

/// Held lock; the file is removed when this is dropped, whatever the exit path.
struct LockFile {
    path: PathBuf,
}

impl LockFile {
    /// `Ok(None)` when another process created the file first.
    fn create(path: &Path) -> Result<Option<Self>, GuardError> {
        let lock_err = |what: &str, e: io::Error| {
            GuardError::Lock(format!("unable to {what} {}: {e}", path.display()))
        };
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        // NamedTempFile is created 0600 and removed when dropped.
        let mut staged = tempfile::Builder::new()
            .prefix(".cron-guard-lock")
            .tempfile_in(dir)
            .map_err(|e| lock_err("stage", e))?;
        write!(staged, "{}", std::process::id()).map_err(|e| lock_err("stage", e))?;
        staged.flush().map_err(|e| lock_err("stage", e))?;

        match fs::hard_link(staged.path(), path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(None),
            Err(e) => return Err(lock_err("create", e)),
        }
        debug!(path = %path.display(), "Lock acquired");
        Ok(Some(LockFile {
            path: path.to_path_buf(),
        }))
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Lock released"),
            Err(e) => warn!(path = %self.path.display(), error = %e, "Unable to remove lockfile"),
        }
    }
}

pub struct LockGuard;

impl LockGuard {
    /// Writes the skip note and ends the run without error.
    fn skip(status: &Status, owner: Owner) -> Result<(), GuardError> {
        let note = match owner {
            Owner::Pid(pid) => GuardError::LockHeld { pid }.to_string(),
            Owner::Free | Owner::Unknown => "cron is still running".to_string(),
        };
        info!("{note}, skipping run");
        if let Err(e) = write_str(status.combined.as_ref(), &format!("{note}\n")) {
            warn!(error = %e, "Unable to write lock note");
        }
        Ok(())
    }
}

#[async_trait]
impl Stage for LockGuard {
    fn name(&self) -> &'static str {
        "lock"
    }

    async fn call(
        &self,
        cx: &RunContext<'_>,
        status: &mut Status,
        next: Next<'_>,
    ) -> Result<(), GuardError> {
        let Some(path) = cx.request().lockfile.as_deref() else {
            return next.run(cx, status).await;
        };

        match read_owner(path)? {
            Owner::Free => {}
            Owner::Unknown => return Self::skip(status, Owner::Unknown),
            Owner::Pid(pid) if is_alive(pid) => return Self::skip(status, Owner::Pid(pid)),
            Owner::Pid(pid) => {
                let stale = GuardError::LockStale { pid };
                warn!(path = %path.display(), "{stale}");
                if let Some(reporter) = status.reporter.clone() {
                    reporter.info(&stale).await;
                }
                if !remove_stale(path, pid)? {
                    debug!(path = %path.display(), "Stale lock was replaced meanwhile");
                }
            }
        }

        let Some(_lock) = LockFile::create(path)? else {
            let owner = read_owner(path).unwrap_or(Owner::Unknown);
            return Self::skip(status, owner);
        };
        next.run(cx, status).await
    }
}
