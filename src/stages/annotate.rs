// src/stages/annotate.rs

use crate::error::GuardError;
use crate::pipeline::{Next, RunContext, Stage, Status};
use crate::sink::{write_str, Sink};
use async_trait::async_trait;
use chrono::{Local, SecondsFormat};
use std::time::Instant;
use tracing::warn;

/// Frames the captured output with start/end metadata and, on failure, the
/// error itself.
///
/// ```text
/// // start: 2024-05-14T03:00:00+02:00
/// // cmd: backup.sh
/// // timeout: 1h
/// ...captured output...
/// // end: 2024-05-14T03:12:09+02:00
/// // took: 12m 9s 114ms 20us
/// // exitcode: 1
/// // error: exit status 1
/// ```
///
/// `errfile_quiet` drops everything but the error line.
pub struct Annotator;

fn note(sink: &dyn Sink, text: &str) {
    if let Err(e) = write_str(sink, text) {
        warn!(error = %e, "Unable to write annotation");
    }
}

#[async_trait]
impl Stage for Annotator {
    fn name(&self) -> &'static str {
        "annotate"
    }

    async fn call(
        &self,
        cx: &RunContext<'_>,
        status: &mut Status,
        next: Next<'_>,
    ) -> Result<(), GuardError> {
        let request = cx.request();
        let sink = status.combined.clone();
        let started = Instant::now();
        if !request.errfile_quiet {
            let start = Local::now().to_rfc3339_opts(SecondsFormat::Secs, false);
            note(sink.as_ref(), &format!("// start: {start}\n"));
            note(sink.as_ref(), &format!("// cmd: {}\n", request.command));
            if let Some(timeout) = request.timeout {
                note(
                    sink.as_ref(),
                    &format!("// timeout: {}\n", humantime::format_duration(timeout)),
                );
            }
        }

        let result = next.run(cx, status).await;

        if !request.errfile_quiet {
            let end = Local::now().to_rfc3339_opts(SecondsFormat::Secs, false);
            note(sink.as_ref(), &format!("// end: {end}\n"));
            note(
                sink.as_ref(),
                &format!("// took: {}\n", humantime::format_duration(started.elapsed())),
            );
            note(sink.as_ref(), &format!("// exitcode: {}\n", status.exit_code));
        }
        if let Err(e) = &result {
            note(sink.as_ref(), &format!("// error: {e}\n"));
        }
        result
    }
}
