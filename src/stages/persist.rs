// src/stages/persist.rs

use crate::error::GuardError;
use crate::pipeline::{Next, RunContext, Stage, Status};
use crate::realtime::realtime_sink;
use crate::sink::{tee, Buffer};
use async_trait::async_trait;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use tracing::{debug, warn};

/// Outermost stage. Relays the combined log in real time for every run and
/// appends it to the error log only when the run comes back failed.
///
/// Failures that reach this point are considered reported once they are on
/// disk; only fatal ones keep propagating to decide the guard's exit code.
pub struct SinkWriter;

fn open_errfile(path: &Path) -> Result<File, GuardError> {
    OpenOptions::new()
        .append(true)
        .create(true)
        .mode(0o600)
        .open(path)
        .map_err(|source| GuardError::ErrorLog {
            path: path.to_path_buf(),
            source,
        })
}

#[async_trait]
impl Stage for SinkWriter {
    fn name(&self) -> &'static str {
        "sink-writer"
    }

    async fn call(
        &self,
        cx: &RunContext<'_>,
        status: &mut Status,
        next: Next<'_>,
    ) -> Result<(), GuardError> {
        let request = cx.request();
        let mut errfile = open_errfile(&request.errfile)?;

        let record = Buffer::new();
        let realtime = realtime_sink(request);
        status.combined = tee(vec![realtime.clone(), record.shared()]);

        let result = next.run(cx, status).await;

        if let Err(e) = realtime.flush() {
            warn!(error = %e, "Unable to flush real-time log");
        }
        let Err(err) = result else {
            return Ok(());
        };

        errfile
            .write_all(&record.contents())
            .and_then(|()| errfile.flush())
            .map_err(|source| GuardError::ErrorLog {
                path: request.errfile.clone(),
                source,
            })?;
        debug!(path = %request.errfile.display(), bytes = record.len(), "Failure recorded");

        if err.is_fatal() {
            Err(err)
        } else {
            Ok(())
        }
    }
}
