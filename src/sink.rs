// src/sink.rs

//! Output sinks shared between pipeline stages.
//!
//! A stage never mutates a sink it was handed. It builds a new one around it
//! (tee, lock, count, prefix) and installs that on [`Status`](crate::Status)
//! before delegating, so the wrapping order reads top to bottom in the stage
//! list.

use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Something that accepts bytes. Implementations must be safe to call from
/// the two capture tasks at once.
pub trait Sink: Send + Sync {
    fn write(&self, buf: &[u8]) -> io::Result<()>;

    /// Pushes out anything held back, e.g. a trailing partial line.
    fn flush(&self) -> io::Result<()> {
        Ok(())
    }
}

pub type SharedSink = Arc<dyn Sink>;

/// Writes formatted text to a sink.
pub fn write_str(sink: &dyn Sink, text: &str) -> io::Result<()> {
    sink.write(text.as_bytes())
}

/// Discards everything.
pub struct Discard;

impl Sink for Discard {
    fn write(&self, _buf: &[u8]) -> io::Result<()> {
        Ok(())
    }
}

pub fn discard() -> SharedSink {
    Arc::new(Discard)
}

/// In-memory sink; cheap to clone, all clones share the same bytes.
#[derive(Clone, Default)]
pub struct Buffer {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl Buffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes.lock()).into_owned()
    }

    pub fn len(&self) -> usize {
        self.bytes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shared(&self) -> SharedSink {
        Arc::new(self.clone())
    }
}

impl Sink for Buffer {
    fn write(&self, buf: &[u8]) -> io::Result<()> {
        self.bytes.lock().extend_from_slice(buf);
        Ok(())
    }
}

/// Duplicates each write into every inner sink, in order.
pub struct Tee {
    sinks: Vec<SharedSink>,
}

impl Sink for Tee {
    fn write(&self, buf: &[u8]) -> io::Result<()> {
        for sink in &self.sinks {
            sink.write(buf)?;
        }
        Ok(())
    }

    fn flush(&self) -> io::Result<()> {
        for sink in &self.sinks {
            sink.flush()?;
        }
        Ok(())
    }
}

pub fn tee(sinks: Vec<SharedSink>) -> SharedSink {
    Arc::new(Tee { sinks })
}

/// Serializes writers so that no two writes interleave below this point.
pub struct Locked {
    inner: Mutex<SharedSink>,
}

impl Locked {
    pub fn new(inner: SharedSink) -> Self {
        Self {
            inner: Mutex::new(inner),
        }
    }
}

impl Sink for Locked {
    fn write(&self, buf: &[u8]) -> io::Result<()> {
        self.inner.lock().write(buf)
    }

    fn flush(&self) -> io::Result<()> {
        self.inner.lock().flush()
    }
}

/// Counts the bytes that pass through.
pub struct Counter {
    inner: SharedSink,
    count: AtomicU64,
}

impl Counter {
    pub fn new(inner: SharedSink) -> Self {
        Self {
            inner,
            count: AtomicU64::new(0),
        }
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }
}

impl Sink for Counter {
    fn write(&self, buf: &[u8]) -> io::Result<()> {
        self.inner.write(buf)?;
        self.count.fetch_add(buf.len() as u64, Ordering::AcqRel);
        Ok(())
    }

    fn flush(&self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Splits a byte stream into lines and hands each complete line (without its
/// terminator) to a callback. A trailing partial line is emitted on flush.
pub struct LineSplitter<F> {
    pending: Mutex<Vec<u8>>,
    emit: F,
}

impl<F> LineSplitter<F>
where
    F: Fn(&[u8]) -> io::Result<()> + Send + Sync,
{
    pub fn new(emit: F) -> Self {
        Self {
            pending: Mutex::new(Vec::new()),
            emit,
        }
    }
}

fn trim_line(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

impl<F> Sink for LineSplitter<F>
where
    F: Fn(&[u8]) -> io::Result<()> + Send + Sync,
{
    fn write(&self, buf: &[u8]) -> io::Result<()> {
        let mut pending = self.pending.lock();
        pending.extend_from_slice(buf);
        let mut start = 0;
        while let Some(pos) = pending[start..].iter().position(|&b| b == b'\n') {
            let end = start + pos + 1;
            (self.emit)(trim_line(&pending[start..end]))?;
            start = end;
        }
        pending.drain(..start);
        Ok(())
    }

    fn flush(&self) -> io::Result<()> {
        let rest = std::mem::take(&mut *self.pending.lock());
        if rest.is_empty() {
            return Ok(());
        }
        (self.emit)(trim_line(&rest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tee_writes_to_every_sink() {
        let a = Buffer::new();
        let b = Buffer::new();
        let sink = tee(vec![a.shared(), b.shared()]);
        sink.write(b"hello\n").unwrap();
        assert_eq!(a.text(), "hello\n");
        assert_eq!(b.text(), "hello\n");
    }

    #[test]
    fn counter_counts_bytes() {
        let buffer = Buffer::new();
        let counter = Counter::new(buffer.shared());
        counter.write(b"abc").unwrap();
        counter.write(b"").unwrap();
        counter.write(b"de").unwrap();
        assert_eq!(counter.count(), 5);
        assert_eq!(buffer.text(), "abcde");
    }

    #[test]
    fn locked_sink_keeps_concurrent_writes_whole() {
        let buffer = Buffer::new();
        let locked: SharedSink = Arc::new(Locked::new(buffer.shared()));
        let handles: Vec<_> = ["a", "b"]
            .into_iter()
            .map(|tag| {
                let sink = locked.clone();
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        sink.write(format!("{tag}{tag}{tag}\n").as_bytes()).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let text = buffer.text();
        assert_eq!(text.lines().count(), 400);
        assert!(text.lines().all(|l| l == "aaa" || l == "bbb"));
    }

    #[test]
    fn line_splitter_handles_arbitrary_chunks() {
        let lines = Arc::new(Mutex::new(Vec::<String>::new()));
        let seen = lines.clone();
        let splitter = LineSplitter::new(move |line: &[u8]| {
            seen.lock().push(String::from_utf8_lossy(line).into_owned());
            Ok(())
        });
        splitter.write(b"fir").unwrap();
        splitter.write(b"st\r\nsecond\nthi").unwrap();
        assert_eq!(*lines.lock(), vec!["first", "second"]);
        splitter.write(b"rd").unwrap();
        splitter.flush().unwrap();
        assert_eq!(*lines.lock(), vec!["first", "second", "third"]);
        splitter.flush().unwrap();
        assert_eq!(lines.lock().len(), 3);
    }
}
