// src/stages/prefix.rs

use crate::error::GuardError;
use crate::pipeline::{Next, RunContext, Stage, Status};
use crate::sink::{SharedSink, Sink};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;

/// Puts `prefix` in front of every line written through it.
///
/// Whether the next byte starts a line survives across writes, so chunking
/// never loses or duplicates a prefix. Each write reaches the inner sink as a
/// single write.
pub struct Prefixer {
    inner: SharedSink,
    prefix: Vec<u8>,
    at_line_start: Mutex<bool>,
}

impl Prefixer {
    pub fn new(inner: SharedSink, prefix: impl Into<Vec<u8>>) -> Self {
        Self {
            inner,
            prefix: prefix.into(),
            at_line_start: Mutex::new(true),
        }
    }
}

impl Sink for Prefixer {
    fn write(&self, buf: &[u8]) -> io::Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let mut at_line_start = self.at_line_start.lock();
        let mut out = Vec::with_capacity(buf.len() + self.prefix.len());
        for &byte in buf {
            if *at_line_start {
                out.extend_from_slice(&self.prefix);
            }
            out.push(byte);
            *at_line_start = byte == b'\n';
        }
        self.inner.write(&out)
    }

    fn flush(&self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Tags every line of the combined log with the run's identifier, unless the
/// request hides it.
pub struct RunIdPrefixer;

#[async_trait]
impl Stage for RunIdPrefixer {
    fn name(&self) -> &'static str {
        "run-id"
    }

    async fn call(
        &self,
        cx: &RunContext<'_>,
        status: &mut Status,
        next: Next<'_>,
    ) -> Result<(), GuardError> {
        let request = cx.request();
        if !request.hide_run_id {
            let prefix = format!("{} ", request.run_id);
            status.combined = Arc::new(Prefixer::new(status.combined.clone(), prefix));
        }
        next.run(cx, status).await
    }
}
