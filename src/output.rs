//! Log multiplexing for child process output.
//!
//! Every command runner pumps its lines into one shared `LogMux`. The channel
//! is bounded and producers await when it fills up, so records are never
//! dropped; a slow consumer simply back-pressures the pumps.

use std::collections::VecDeque;
use std::time::SystemTime;

use strip_ansi_escapes::strip;
use tokio::sync::mpsc;

/// Indicates the source stream of a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Standard Output.
    Stdout,
    /// Standard Error.
    Stderr,
    /// Lines produced by the supervisor itself (spawn/exit notices).
    Supervisor,
}

/// One line of multiplexed output, tagged with its origin.
#[derive(Debug, Clone)]
pub struct LogRecord {
    /// Id of the owning project.
    pub project: String,
    /// Command text (or "supervisor") this line belongs to.
    pub tag: String,
    /// The line itself, verbatim.
    pub line: String,
    /// Which stream produced it.
    pub stream: StreamKind,
    /// Arrival timestamp.
    pub at: SystemTime,
}

/// Producer side of the multiplexer. Cheap to clone; one per pump task.
#[derive(Debug, Clone)]
pub struct LogMux {
    tx: mpsc::Sender<LogRecord>,
}

/// Creates the multiplexer and its single consumer end.
pub fn log_channel(capacity: usize) -> (LogMux, mpsc::Receiver<LogRecord>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (LogMux { tx }, rx)
}

impl LogMux {
    /// Appends a record to the sink, waiting if the consumer is behind.
    pub async fn emit(&self, project: &str, tag: &str, line: String, stream: StreamKind) {
        let record = LogRecord {
            project: project.to_string(),
            tag: tag.to_string(),
            line,
            stream,
            at: SystemTime::now(),
        };
        // A closed receiver means the display is gone; output is discarded.
        let _ = self.tx.send(record).await;
    }
}

/// A fixed-capacity ring buffer keeping the most recent lines.
///
/// The updater uses this to retain the tail of a sync command's output for
/// error reporting.
#[derive(Debug, Clone)]
pub struct TailBuffer {
    max_lines: usize,
    lines: VecDeque<String>,
}

impl TailBuffer {
    /// Creates a new `TailBuffer` keeping at most `max_lines` lines.
    pub fn new(max_lines: usize) -> Self {
        Self {
            max_lines,
            lines: VecDeque::with_capacity(max_lines.min(64)),
        }
    }

    /// Adds a line, dropping the oldest if the buffer is full.
    ///
    /// Returns `true` if an old line was dropped to make room.
    pub fn push(&mut self, line: String) -> bool {
        let mut dropped = false;
        self.lines.push_back(line);
        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
            dropped = true;
        }
        dropped
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Consumes the buffer, yielding the retained lines oldest-first.
    pub fn into_lines(self) -> Vec<String> {
        self.lines.into()
    }
}

/// Sanitizes text for display, optionally stripping ANSI escape codes.
///
/// If `strip_ansi` is true, ANSI codes are removed. Invalid UTF-8 sequences
/// are replaced.
pub fn sanitize_text(text: &str, strip_ansi: bool) -> String {
    if !strip_ansi {
        return text.to_string();
    }
    let stripped = strip(text.as_bytes());
    String::from_utf8_lossy(&stripped).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_buffer_drops_oldest() {
        let mut buffer = TailBuffer::new(2);
        assert!(!buffer.push("a".into()));
        assert!(!buffer.push("b".into()));
        assert!(buffer.push("c".into()));
        assert_eq!(buffer.len(), 2);
        assert!(!buffer.is_empty());
        assert_eq!(buffer.into_lines(), vec!["b", "c"]);
    }

    #[test]
    fn sanitize_strips_ansi_when_asked() {
        let colored = "\x1b[31mred\x1b[0m";
        assert_eq!(sanitize_text(colored, true), "red");
        assert_eq!(sanitize_text(colored, false), colored);
    }

    #[tokio::test]
    async fn mux_preserves_producer_order() {
        let (mux, mut rx) = log_channel(8);
        mux.emit("app", "npm start", "first".into(), StreamKind::Stdout)
            .await;
        mux.emit("app", "npm start", "second".into(), StreamKind::Stdout)
            .await;
        drop(mux);
        assert_eq!(rx.recv().await.unwrap().line, "first");
        assert_eq!(rx.recv().await.unwrap().line, "second");
        assert!(rx.recv().await.is_none());
    }
}
