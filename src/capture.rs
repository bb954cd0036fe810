// src/capture.rs

use crate::error::GuardError;
use crate::pipeline::{Next, RunContext, Stage, Status};
use crate::sink::{tee, Locked, SharedSink};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{debug, warn};

/// Tees stdout and stderr into the combined sink behind one lock.
///
/// Writes from the two capture tasks are serialized, so lines never tear, but
/// the order between a stdout line and a stderr line is whatever the tasks
/// happened to produce.
pub struct Capturer;

#[async_trait]
impl Stage for Capturer {
    fn name(&self) -> &'static str {
        "capture"
    }

    async fn call(
        &self,
        cx: &RunContext<'_>,
        status: &mut Status,
        next: Next<'_>,
    ) -> Result<(), GuardError> {
        let combined: SharedSink = Arc::new(Locked::new(status.combined.clone()));
        status.stdout = tee(vec![status.stdout.clone(), combined.clone()]);
        status.stderr = tee(vec![status.stderr.clone(), combined]);
        next.run(cx, status).await
    }
}

/// Copies `reader` into `sink` one line at a time until EOF.
///
/// Each line, including its newline, is a single write. A final line without
/// a newline is written as is.
pub(crate) async fn drain<R: AsyncRead + Unpin>(
    reader: R,
    sink: SharedSink,
    stream: &'static str,
) -> Result<u64, GuardError> {
    let mut reader = BufReader::new(reader);
    let mut line = Vec::with_capacity(1024);
    let mut total = 0u64;
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => {
                debug!(stream, bytes = total, "EOF reached");
                break;
            }
            Ok(n) => {
                total += n as u64;
                sink.write(&line).map_err(GuardError::Io)?;
            }
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::ConnectionReset
                ) =>
            {
                debug!(stream, error = %e, "Stream closed while draining");
                break;
            }
            Err(e) => {
                warn!(stream, error = %e, "Error reading command output");
                return Err(GuardError::Io(e));
            }
        }
    }
    Ok(total)
}
