//! Server-sent events: the frame codec and the writer capability.
//!
//! Wire format of one event frame, in field order:
//!
//! ```text
//! id: <id>\n          (if id present)
//! event: <type>\n     (if type present)
//! retry: <ms>\n       (if retry > 0)
//! data: <line>\n      (one per line of data)
//! : <comment>\n       (if comment present)
//! \n
//! ```
//!
//! Frames flush individually; the proxy path parses the backend byte
//! stream back into events so re-emission is always well-formed.

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::debug;

/// Media type SSE responses carry.
pub const EVENT_STREAM_CONTENT_TYPE: &str = "text/event-stream";

/// One server-sent event.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SseEvent {
    /// Event id (`id:` field).
    pub id: Option<String>,
    /// Event type (`event:` field).
    pub event_type: Option<String>,
    /// Event payload; may span multiple lines.
    pub data: String,
    /// Client retry interval in milliseconds (`retry:` field).
    pub retry: Option<u64>,
    /// Comment line (`:` field).
    pub comment: Option<String>,
}

impl SseEvent {
    /// Creates a data-only event.
    #[must_use]
    pub fn data(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            ..Self::default()
        }
    }

    /// Sets the event type.
    #[must_use]
    pub fn with_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    /// Sets the event id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Sets the retry interval.
    #[must_use]
    pub fn with_retry(mut self, retry_ms: u64) -> Self {
        self.retry = Some(retry_ms);
        self
    }

    /// Renders the wire frame, terminated by a blank line.
    #[must_use]
    pub fn emit(&self) -> String {
        let mut frame = String::new();
        if let Some(id) = &self.id {
            frame.push_str("id: ");
            frame.push_str(id);
            frame.push('\n');
        }
        if let Some(event_type) = &self.event_type {
            frame.push_str("event: ");
            frame.push_str(event_type);
            frame.push('\n');
        }
        if let Some(retry) = self.retry {
            if retry > 0 {
                frame.push_str(&format!("retry: {retry}\n"));
            }
        }
        if !self.data.is_empty() {
            for line in self.data.split('\n') {
                frame.push_str("data: ");
                frame.push_str(line);
                frame.push('\n');
            }
        }
        if let Some(comment) = &self.comment {
            frame.push_str(": ");
            frame.push_str(comment);
            frame.push('\n');
        }
        frame.push('\n');
        frame
    }

    /// Parses one frame block (without its terminating blank line).
    ///
    /// Multiple `data:` lines join with `\n`. Returns `None` for blocks
    /// with no recognized fields.
    #[must_use]
    pub fn parse(block: &str) -> Option<Self> {
        let mut event = Self::default();
        let mut data_lines: Vec<&str> = Vec::new();
        let mut seen_field = false;

        for line in block.lines() {
            if line.is_empty() {
                continue;
            }
            if let Some(comment) = line.strip_prefix(": ").or_else(|| line.strip_prefix(':')) {
                event.comment = Some(comment.to_string());
                seen_field = true;
            } else if let Some(value) = field_value(line, "id") {
                event.id = Some(value.to_string());
                seen_field = true;
            } else if let Some(value) = field_value(line, "event") {
                event.event_type = Some(value.to_string());
                seen_field = true;
            } else if let Some(value) = field_value(line, "retry") {
                event.retry = value.parse().ok();
                seen_field = true;
            } else if let Some(value) = field_value(line, "data") {
                data_lines.push(value);
                seen_field = true;
            }
        }

        if !seen_field {
            return None;
        }
        event.data = data_lines.join("\n");
        Some(event)
    }
}

fn field_value<'a>(line: &'a str, field: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(field)?;
    let rest = rest.strip_prefix(':')?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}

/// Incremental parser over the backend's SSE byte stream.
///
/// Feed it chunks as they arrive; complete frames (terminated by a blank
/// line) come back as events.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
}

impl SseParser {
    /// Creates an empty parser.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes a chunk, returning every completed event.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
        // Normalize CRLF so frame detection only deals with \n\n.
        if self.buffer.contains('\r') {
            self.buffer = self.buffer.replace("\r\n", "\n");
        }

        let mut events = Vec::new();
        while let Some(boundary) = self.buffer.find("\n\n") {
            let block: String = self.buffer.drain(..boundary + 2).collect();
            if let Some(event) = SseEvent::parse(block.trim_end_matches('\n')) {
                events.push(event);
            }
        }
        events
    }

    /// Bytes currently buffered without a frame terminator.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

/// Writer capability handed to whatever drives an SSE response.
///
/// Each sent frame becomes one body chunk, so the transport flushes per
/// frame.
#[derive(Debug, Clone)]
pub struct SseWriter {
    tx: mpsc::Sender<Bytes>,
}

impl SseWriter {
    /// Creates a writer and the chunk stream feeding the response body.
    #[must_use]
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }

    /// Writes one event frame.
    ///
    /// # Errors
    ///
    /// Fails when the client has gone away.
    pub async fn send(&self, event: &SseEvent) -> Result<(), SseClosed> {
        self.tx
            .send(Bytes::from(event.emit()))
            .await
            .map_err(|_| SseClosed)
    }

    /// Writes a bare comment line (used by keepalive).
    pub async fn comment(&self, text: &str) -> Result<(), SseClosed> {
        self.tx
            .send(Bytes::from(format!(": {text}\n")))
            .await
            .map_err(|_| SseClosed)
    }

    /// Best-effort error frame written before closing a broken stream.
    pub async fn error_frame(&self, message: &str) {
        let frame = SseEvent::data(message).with_type("error");
        if self.send(&frame).await.is_err() {
            debug!("Client gone before error frame could be written");
        }
    }
}

/// The client disconnected; no further frames can be written.
#[derive(Debug, thiserror::Error)]
#[error("sse client disconnected")]
pub struct SseClosed;

/// Accept-header check: absent, `text/event-stream`, and `*/*` are
/// acceptable.
#[must_use]
pub fn accept_allows_event_stream(accept: Option<&str>) -> bool {
    let Some(accept) = accept else {
        return true;
    };
    accept
        .split(',')
        .map(|part| part.split(';').next().unwrap_or("").trim())
        .any(|media| media == EVENT_STREAM_CONTENT_TYPE || media == "*/*")
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== Emit Tests ====================

    #[test]
    fn test_emit_data_only() {
        let event = SseEvent::data("begin").with_type("start");
        assert_eq!(event.emit(), "event: start\ndata: begin\n\n");
    }

    #[test]
    fn test_emit_full_frame() {
        let event = SseEvent::data("first")
            .with_id("1")
            .with_type("data")
            .with_retry(3000);
        assert_eq!(
            event.emit(),
            "id: 1\nevent: data\nretry: 3000\ndata: first\n\n"
        );
    }

    #[test]
    fn test_emit_multiline_data() {
        let event = SseEvent::data("line1\nline2");
        assert_eq!(event.emit(), "data: line1\ndata: line2\n\n");
    }

    #[test]
    fn test_emit_zero_retry_omitted() {
        let event = SseEvent {
            retry: Some(0),
            data: "x".to_string(),
            ..SseEvent::default()
        };
        assert_eq!(event.emit(), "data: x\n\n");
    }

    #[test]
    fn test_every_frame_ends_with_blank_line() {
        let events = [
            SseEvent::data("a"),
            SseEvent::data("b").with_id("7"),
            SseEvent {
                comment: Some("note".to_string()),
                ..SseEvent::default()
            },
        ];
        for event in events {
            assert!(event.emit().ends_with("\n\n"));
        }
    }

    // ==================== Parse Tests ====================

    #[test]
    fn test_parse_round_trip() {
        let event = SseEvent::data("first").with_id("1").with_type("data");
        let emitted = event.emit();
        let parsed = SseEvent::parse(emitted.trim_end_matches('\n')).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_parse_multiline_data_joins() {
        let parsed = SseEvent::parse("data: a\ndata: b").unwrap();
        assert_eq!(parsed.data, "a\nb");
    }

    #[test]
    fn test_parse_without_space_after_colon() {
        let parsed = SseEvent::parse("data:tight").unwrap();
        assert_eq!(parsed.data, "tight");
    }

    #[test]
    fn test_parse_garbage_is_none() {
        assert!(SseEvent::parse("not a field line").is_none());
    }

    // ==================== Incremental Parser Tests ====================

    #[test]
    fn test_parser_chunked_frame() {
        let mut parser = SseParser::new();
        assert!(parser.feed(b"event: start\nda").is_empty());
        assert!(parser.pending() > 0);

        let events = parser.feed(b"ta: begin\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type.as_deref(), Some("start"));
        assert_eq!(events[0].data, "begin");
        assert_eq!(parser.pending(), 0);
    }

    #[test]
    fn test_parser_multiple_frames_in_one_chunk() {
        let mut parser = SseParser::new();
        let events =
            parser.feed(b"event: start\ndata: begin\n\nid: 1\nevent: data\ndata: first\n\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].id.as_deref(), Some("1"));
    }

    #[test]
    fn test_parser_crlf_normalized() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"data: x\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "x");
    }

    // ==================== Writer Tests ====================

    #[tokio::test]
    async fn test_writer_frames_arrive_in_order() {
        let (writer, mut rx) = SseWriter::channel(8);

        writer.send(&SseEvent::data("begin").with_type("start")).await.ok();
        writer
            .send(&SseEvent::data("first").with_id("1").with_type("data"))
            .await
            .ok();
        writer.send(&SseEvent::data("done").with_type("end")).await.ok();
        drop(writer);

        let mut wire = String::new();
        while let Some(chunk) = rx.recv().await {
            wire.push_str(&String::from_utf8_lossy(&chunk));
        }

        let start = wire.find("event: start\ndata: begin\n\n").unwrap();
        let middle = wire.find("id: 1\nevent: data\ndata: first\n\n").unwrap();
        let end = wire.find("event: end\ndata: done\n\n").unwrap();
        assert!(start < middle && middle < end);
    }

    #[tokio::test]
    async fn test_writer_keepalive_comment() {
        let (writer, mut rx) = SseWriter::channel(1);
        writer.comment("keepalive").await.ok();
        drop(writer);

        let chunk = rx.recv().await.unwrap();
        assert_eq!(&chunk[..], b": keepalive\n");
    }

    #[tokio::test]
    async fn test_writer_send_after_close() {
        let (writer, rx) = SseWriter::channel(1);
        drop(rx);
        assert!(writer.send(&SseEvent::data("x")).await.is_err());
    }

    // ==================== Accept Tests ====================

    #[test]
    fn test_accept_variants() {
        assert!(accept_allows_event_stream(None));
        assert!(accept_allows_event_stream(Some("text/event-stream")));
        assert!(accept_allows_event_stream(Some("*/*")));
        assert!(accept_allows_event_stream(Some(
            "text/event-stream; charset=utf-8"
        )));
        assert!(accept_allows_event_stream(Some(
            "application/json, text/event-stream"
        )));
        assert!(!accept_allows_event_stream(Some("application/json")));
        assert!(!accept_allows_event_stream(Some("text/html")));
    }
}
