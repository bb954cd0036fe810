// src/stages/validate.rs

use crate::error::GuardError;
use crate::pipeline::{Next, RunContext, Stage, Status};
use crate::sink::{tee, Counter, LineSplitter, SharedSink, Sink};
use async_trait::async_trait;
use parking_lot::Mutex;
use regex::Regex;
use std::io;
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::debug;

/// Fails a run that wrote anything at all to stderr.
pub struct StderrValidator;

#[async_trait]
impl Stage for StderrValidator {
    fn name(&self) -> &'static str {
        "validate-stderr"
    }

    async fn call(
        &self,
        cx: &RunContext<'_>,
        status: &mut Status,
        next: Next<'_>,
    ) -> Result<(), GuardError> {
        let counter = Arc::new(Counter::new(status.stderr.clone()));
        status.stderr = counter.clone();
        next.run(cx, status).await?;
        if counter.count() > 0 {
            debug!(bytes = counter.count(), "Command wrote to stderr");
            return Err(GuardError::StderrNotEmpty);
        }
        Ok(())
    }
}

/// Write end of the pipe feeding the keyword scanner.
struct KeywordTap {
    tx: Mutex<Option<UnboundedSender<Vec<u8>>>>,
}

impl KeywordTap {
    fn close(&self) {
        self.tx.lock().take();
    }
}

impl Sink for KeywordTap {
    fn write(&self, buf: &[u8]) -> io::Result<()> {
        if let Some(tx) = self.tx.lock().as_ref() {
            // A closed receiver only means scanning is over.
            let _ = tx.send(buf.to_vec());
        }
        Ok(())
    }
}

/// Reads the pipe until the tap is closed; returns the first matching line.
async fn scan(mut rx: UnboundedReceiver<Vec<u8>>, keywords: Regex) -> Option<String> {
    let first = Arc::new(Mutex::new(None::<String>));
    let found = first.clone();
    let lines = LineSplitter::new(move |line: &[u8]| {
        let mut found = found.lock();
        if found.is_none() {
            let text = String::from_utf8_lossy(line);
            if keywords.is_match(&text) {
                *found = Some(text.into_owned());
            }
        }
        Ok(())
    });
    while let Some(chunk) = rx.recv().await {
        let _ = lines.write(&chunk);
    }
    let _ = lines.flush();
    let first = first.lock().take();
    first
}

/// Fails a run whose stdout contains a line matching the keyword pattern.
///
/// Every line is scanned on a separate task, but the verdict is only taken
/// once the run below has returned and the scanner has drained the pipe.
pub struct KeywordValidator;

#[async_trait]
impl Stage for KeywordValidator {
    fn name(&self) -> &'static str {
        "validate-stdout"
    }

    async fn call(
        &self,
        cx: &RunContext<'_>,
        status: &mut Status,
        next: Next<'_>,
    ) -> Result<(), GuardError> {
        let (tx, rx) = unbounded_channel();
        let tap = Arc::new(KeywordTap {
            tx: Mutex::new(Some(tx)),
        });
        let scanner = tokio::spawn(scan(rx, cx.request().keywords.clone()));
        let tap_sink: SharedSink = tap.clone();
        status.stdout = tee(vec![status.stdout.clone(), tap_sink]);

        let result = next.run(cx, status).await;

        tap.close();
        let found = scanner
            .await
            .map_err(|e| GuardError::Io(io::Error::other(e)))?;
        result?;
        match found {
            Some(line) => {
                debug!(line = %line, "Keyword found in stdout");
                Err(GuardError::Keyword { line })
            }
            None => Ok(()),
        }
    }
}
