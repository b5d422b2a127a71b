//! Output pumps: one background task per child pipe.
//!
//! A pump reads its pipe until EOF, turning bytes into lines and pushing each
//! complete line into an unbounded FIFO [`OutputBuffer`]. Both pumps of a
//! session share one [`Notify`], so whoever waits for "more output" is woken
//! by either stream without polling.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamKind::Stdout => write!(f, "stdout"),
            StreamKind::Stderr => write!(f, "stderr"),
        }
    }
}

/// One captured line, stamped when the pump received it.
#[derive(Debug, Clone)]
pub struct OutputLine {
    pub kind: StreamKind,
    pub text: String,
    pub received_at: Instant,
}

impl OutputLine {
    pub fn new(kind: StreamKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
            received_at: Instant::now(),
        }
    }
}

/// Thread-safe FIFO written by exactly one pump.
pub struct OutputBuffer {
    kind: StreamKind,
    lines: Mutex<VecDeque<OutputLine>>,
    closed: AtomicBool,
    notify: Arc<Notify>,
}

impl OutputBuffer {
    pub fn new(kind: StreamKind, notify: Arc<Notify>) -> Self {
        Self {
            kind,
            lines: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
            notify,
        }
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn push(&self, text: impl Into<String>) {
        let line = OutputLine::new(self.kind, text);
        self.lines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(line);
        self.notify.notify_one();
    }

    /// Take every buffered line, oldest first.
    pub fn drain(&self) -> Vec<OutputLine> {
        self.lines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
            .collect()
    }

    /// Discard buffered lines, returning how many were dropped.
    pub fn clear(&self) -> usize {
        let mut lines = self
            .lines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let count = lines.len();
        lines.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.lines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Marks the end of the stream. Lines pushed before `close` stay readable.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Strip the line terminator and decode lossily; interpreters do not always
/// emit valid UTF-8.
fn decode_line(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    text.trim_end_matches(['\n', '\r']).to_string()
}

/// Start draining `reader` into `buffer`. The task ends at EOF or on the
/// first read error and closes the buffer either way.
pub fn spawn_pump<R>(session_id: String, reader: R, buffer: Arc<OutputBuffer>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let kind = buffer.kind();
        let mut reader = BufReader::new(reader);
        let mut raw = Vec::with_capacity(256);

        loop {
            raw.clear();
            match reader.read_until(b'\n', &mut raw).await {
                Ok(0) => {
                    log::debug!("Session {} {} reached EOF", session_id, kind);
                    break;
                }
                Ok(_) => {
                    let line = decode_line(&raw);
                    log::debug!("Session {} {}: {}", session_id, kind, line);
                    buffer.push(line);
                }
                Err(e) => {
                    log::error!("Error reading {} for session {}: {}", kind, session_id, e);
                    break;
                }
            }
        }

        buffer.close();
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_decode_line_strips_terminators() {
        assert_eq!(decode_line(b"4\n"), "4");
        assert_eq!(decode_line(b"  indented\r\n"), "  indented");
        assert_eq!(decode_line(b"no newline"), "no newline");
        assert_eq!(decode_line(b"bad \xff byte\n"), "bad \u{fffd} byte");
    }

    #[test]
    fn test_buffer_preserves_order_and_drains() {
        let buffer = OutputBuffer::new(StreamKind::Stdout, Arc::new(Notify::new()));
        buffer.push("one");
        buffer.push("two");
        buffer.push("three");
        assert_eq!(buffer.len(), 3);

        let texts: Vec<_> = buffer.drain().into_iter().map(|l| l.text).collect();
        assert_eq!(texts, vec!["one", "two", "three"]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_clear_reports_discarded_lines() {
        let buffer = OutputBuffer::new(StreamKind::Stderr, Arc::new(Notify::new()));
        buffer.push("stale");
        buffer.push("stale again");
        assert_eq!(buffer.clear(), 2);
        assert_eq!(buffer.clear(), 0);
    }

    #[tokio::test]
    async fn test_pump_reads_lines_until_eof() {
        let notify = Arc::new(Notify::new());
        let buffer = Arc::new(OutputBuffer::new(StreamKind::Stdout, notify.clone()));
        let input: &[u8] = b"first\nsecond\npartial";

        let handle = spawn_pump("pump-test".to_string(), input, buffer.clone());
        handle.await.unwrap();

        assert!(buffer.is_closed());
        let texts: Vec<_> = buffer.drain().into_iter().map(|l| l.text).collect();
        assert_eq!(texts, vec!["first", "second", "partial"]);
    }

    #[tokio::test]
    async fn test_push_wakes_waiter() {
        let notify = Arc::new(Notify::new());
        let buffer = Arc::new(OutputBuffer::new(StreamKind::Stdout, notify.clone()));

        let writer = buffer.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.push("hello");
        });

        tokio::time::timeout(Duration::from_secs(2), notify.notified())
            .await
            .expect("waiter should be woken by push");
        assert_eq!(buffer.drain()[0].text, "hello");
    }
}
