// src/error.rs

use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Everything that can end a guarded run.
///
/// The `Display` output of each variant is written verbatim into the error log
/// after `// error: `, so the wording is part of the file format.
#[derive(Error, Debug)]
pub enum GuardError {
    #[error("unable to start command: {0}")]
    Start(#[source] io::Error),
    #[error("exit status {code}")]
    Exit { code: i32 },
    #[error("terminated by signal {signal}")]
    Signaled { signal: i32 },
    #[error("stderr is not empty")]
    StderrNotEmpty,
    #[error("bad keyword in command output: {line}")]
    Keyword { line: String },
    #[error("deadline exceeded after {}", humantime::format_duration(*.0))]
    Timeout(Duration),
    #[error("run cancelled")]
    Cancelled,
    #[error("cron is still running, pid: {pid}")]
    LockHeld { pid: i32 },
    #[error("reclaimed stale lockfile, pid {pid} is gone")]
    LockStale { pid: i32 },
    #[error("lockfile: {0}")]
    Lock(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("I/O error capturing command output")]
    Io(#[source] io::Error),
    #[error("failed to wait for command exit")]
    Wait(#[source] io::Error),
    #[error("failed to kill command: {0}")]
    Kill(String),
    #[error("unable to write error log {}", .path.display())]
    ErrorLog {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl GuardError {
    /// Stderr output or a keyword match in stdout.
    pub fn is_content(&self) -> bool {
        matches!(self, GuardError::StderrNotEmpty | GuardError::Keyword { .. })
    }

    /// Errors that must make the guard process itself exit nonzero.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            GuardError::Start(_) | GuardError::Config(_) | GuardError::ErrorLog { .. }
        )
    }

    /// Exit code for the guard process when this error reaches `main`.
    pub fn exit_code(&self) -> i32 {
        match self {
            GuardError::Config(_) => 2,
            _ => 1,
        }
    }
}
