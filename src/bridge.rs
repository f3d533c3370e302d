//! Forwarding of a process's standard streams into a [`LogSink`].
//!
//! Rust programs cannot swap out the process-wide stdout/stderr handles, so
//! the bridge hands back [`LineForwarder`] writers that the caller writes
//! through instead. They pass every byte on to the real stream and turn each
//! completed line into a record. [`ProcessState`] makes sure only one pair of
//! forwarders is ever installed per process.

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::record::{LogRecord, Severity};
use crate::sink::LogSink;

/// Which standard stream a forwarder mirrors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdStream {
    Stdout,
    Stderr,
}

impl StdStream {
    /// Value of the `log_type` attribute.
    pub fn log_type(&self) -> &'static str {
        match self {
            StdStream::Stdout => "proc.stdout",
            StdStream::Stderr => "proc.stderr",
        }
    }

    /// Value of the `stream` attribute.
    pub fn name(&self) -> &'static str {
        match self {
            StdStream::Stdout => "stdout",
            StdStream::Stderr => "stderr",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            StdStream::Stdout => Severity::Info,
            StdStream::Stderr => Severity::Error,
        }
    }
}

/// Process-scoped initialization flags, owned by the caller (usually
/// `main`) and shared by reference.
#[derive(Debug, Default)]
pub struct ProcessState {
    stream_bridge: AtomicBool,
}

impl ProcessState {
    pub const fn new() -> Self {
        Self {
            stream_bridge: AtomicBool::new(false),
        }
    }

    /// Returns `true` exactly once, for the first caller.
    pub fn try_claim_stream_bridge(&self) -> bool {
        self.stream_bridge
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn stream_bridge_installed(&self) -> bool {
        self.stream_bridge.load(Ordering::Acquire)
    }
}

/// Stdout and stderr forwarders, if this is the first installation in the
/// process.
pub fn install_stream_bridge(
    state: &ProcessState,
    sink: Arc<LogSink>,
) -> Option<(LineForwarder<io::Stdout>, LineForwarder<io::Stderr>)> {
    if !state.try_claim_stream_bridge() {
        return None;
    }
    Some((
        LineForwarder::new(io::stdout(), sink.clone(), StdStream::Stdout),
        LineForwarder::new(io::stderr(), sink, StdStream::Stderr),
    ))
}

/// Tee writer: bytes go to `inner`, completed lines go to the sink.
pub struct LineForwarder<W: Write> {
    inner: W,
    sink: Arc<LogSink>,
    stream: StdStream,
    line: Vec<u8>,
}

impl<W: Write> LineForwarder<W> {
    pub fn new(inner: W, sink: Arc<LogSink>, stream: StdStream) -> Self {
        Self {
            inner,
            sink,
            stream,
            line: Vec::with_capacity(256),
        }
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    fn feed(&mut self, bytes: &[u8]) {
        for &b in bytes {
            match b {
                b'\n' => self.emit_line(),
                _ => self.line.push(b),
            }
        }
    }

    fn emit_line(&mut self) {
        let line = self.line.strip_suffix(b"\r").unwrap_or(&self.line[..]);
        if line.is_empty() {
            self.line.clear();
            return;
        }
        let text = String::from_utf8_lossy(line).into_owned();
        self.line.clear();

        let record = LogRecord::new(text)
            .with_severity(self.stream.severity())
            .with_attribute("log_type", self.stream.log_type())
            .with_attribute("stream", self.stream.name());
        // A full queue drops the line; the bytes still reached `inner`.
        self.sink.log(record);
    }
}

impl<W: Write> Write for LineForwarder<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.feed(&buf[..written]);
        Ok(written)
    }

    /// Flushes `inner` and forwards any unterminated line.
    fn flush(&mut self) -> io::Result<()> {
        self.emit_line();
        self.inner.flush()
    }
}

impl<W: Write> Drop for LineForwarder<W> {
    fn drop(&mut self) {
        self.emit_line();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{test_config, RecordingExporter};
    use tempfile::TempDir;

    fn sink(dir: &TempDir) -> (Arc<RecordingExporter>, Arc<LogSink>) {
        let exporter = Arc::new(RecordingExporter::new());
        let config = test_config(dir.path(), |b| b);
        let sink = Arc::new(LogSink::with_exporter(&config, exporter.clone()));
        (exporter, sink)
    }

    #[test]
    fn test_bridge_claimed_once() {
        let state = ProcessState::new();
        assert!(!state.stream_bridge_installed());
        assert!(state.try_claim_stream_bridge());
        assert!(!state.try_claim_stream_bridge());
        assert!(state.stream_bridge_installed());
    }

    #[tokio::test]
    async fn test_install_only_first_time() {
        let dir = TempDir::new().unwrap();
        let (_exporter, sink) = sink(&dir);
        let state = ProcessState::new();

        assert!(install_stream_bridge(&state, sink.clone()).is_some());
        assert!(install_stream_bridge(&state, sink.clone()).is_none());
        sink.shutdown().await;
    }

    #[tokio::test]
    async fn test_forwarder_tees_and_splits_lines() {
        let dir = TempDir::new().unwrap();
        let (exporter, sink) = sink(&dir);

        let mut out = LineForwarder::new(Vec::new(), sink.clone(), StdStream::Stderr);
        out.write_all(b"first li").unwrap();
        out.write_all(b"ne\r\n\nsecond\n").unwrap();
        out.write_all(b"tail").unwrap();
        out.flush().unwrap();
        assert_eq!(out.get_ref().as_slice(), b"first line\r\n\nsecond\ntail");
        drop(out);

        sink.shutdown().await;

        assert_eq!(
            exporter.bodies(),
            vec!["first line".to_string(), "second".to_string(), "tail".to_string()]
        );
        let record = &exporter.batches()[0].records[0];
        assert_eq!(record.severity(), Severity::Error);
        assert_eq!(record.attributes().get("log_type"), Some("proc.stderr"));
        assert_eq!(record.attributes().get("stream"), Some("stderr"));
    }

    #[tokio::test]
    async fn test_forwarder_keeps_interior_carriage_returns() {
        let dir = TempDir::new().unwrap();
        let (exporter, sink) = sink(&dir);

        let mut out = LineForwarder::new(Vec::new(), sink.clone(), StdStream::Stdout);
        out.write_all(b"progress 10%\rprogress 100%\r\n\r\nplain\n").unwrap();
        drop(out);

        sink.shutdown().await;

        assert_eq!(
            exporter.bodies(),
            vec!["progress 10%\rprogress 100%".to_string(), "plain".to_string()]
        );
    }

    #[test]
    fn test_stream_metadata() {
        assert_eq!(StdStream::Stdout.log_type(), "proc.stdout");
        assert_eq!(StdStream::Stdout.name(), "stdout");
        assert_eq!(StdStream::Stdout.severity(), Severity::Info);
    }
}
