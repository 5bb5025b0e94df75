//! SSE plumbing shared by the streaming transformers: an incremental
//! event parser, a stream adapter over reqwest byte chunks, and the
//! word-boundary token estimator used when an upstream reports no usage.

use bytes::Bytes;
use futures::stream::Stream;
use pin_project::pin_project;
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

/// One parsed SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Format a Claude event as outbound SSE framing.
pub fn format_event(event: &str, data: &serde_json::Value) -> String {
    format!("event: {event}\ndata: {data}\n\n")
}

/// Incremental SSE parser. Bytes are pushed as they arrive; complete events
/// come out and a partial trailing event stays buffered until its blank-line
/// terminator shows up. Buffering is done on raw bytes so a multi-byte
/// UTF-8 sequence split across chunks reassembles correctly.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes, returning every event completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        loop {
            let Some(boundary) = find_event_boundary(&self.buffer) else {
                break;
            };
            let raw: Vec<u8> = self.buffer.drain(..boundary.end).collect();
            if let Some(event) = parse_event(&String::from_utf8_lossy(&raw[..boundary.start])) {
                events.push(event);
            }
        }
        events
    }

    /// Flush whatever is left when the stream closes without a final blank
    /// line. Some providers end this way.
    pub fn finish(&mut self) -> Option<SseEvent> {
        let rest = std::mem::take(&mut self.buffer);
        parse_event(&String::from_utf8_lossy(&rest))
    }
}

struct Boundary {
    start: usize, // end of event content
    end: usize,   // end of the blank-line separator
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn find_event_boundary(buffer: &[u8]) -> Option<Boundary> {
    let lf = find_subslice(buffer, b"\n\n").map(|i| Boundary {
        start: i,
        end: i + 2,
    });
    let crlf = find_subslice(buffer, b"\r\n\r\n").map(|i| Boundary {
        start: i,
        end: i + 4,
    });
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.start <= b.start { a } else { b }),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}

fn parse_event(raw: &str) -> Option<SseEvent> {
    let mut event = None;
    let mut data_lines: Vec<&str> = Vec::new();

    for line in raw.lines() {
        let line = line.trim_end_matches('\r');
        if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
        } else if let Some(rest) = line.strip_prefix("event:") {
            event = Some(rest.trim().to_string());
        }
        // ":" comment lines (heartbeats) and id:/retry: fields are ignored
    }

    if data_lines.is_empty() {
        return None;
    }
    Some(SseEvent {
        event,
        data: data_lines.join("\n"),
    })
}

/// Stream adapter turning a reqwest byte stream into parsed SSE events.
#[pin_project]
pub struct SseStream<S> {
    #[pin]
    inner: S,
    parser: SseParser,
    pending: VecDeque<SseEvent>,
    done: bool,
}

impl<S> SseStream<S> {
    pub fn new(stream: S) -> Self {
        Self {
            inner: stream,
            parser: SseParser::new(),
            pending: VecDeque::new(),
            done: false,
        }
    }
}

impl<S> Stream for SseStream<S>
where
    S: Stream<Item = Result<Bytes, reqwest::Error>>,
{
    type Item = Result<SseEvent, reqwest::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        loop {
            if let Some(event) = this.pending.pop_front() {
                return Poll::Ready(Some(Ok(event)));
            }
            if *this.done {
                return Poll::Ready(None);
            }

            match this.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    this.pending.extend(this.parser.push(&bytes));
                }
                Poll::Ready(Some(Err(e))) => {
                    *this.done = true;
                    return Poll::Ready(Some(Err(e)));
                }
                Poll::Ready(None) => {
                    *this.done = true;
                    if let Some(event) = this.parser.finish() {
                        this.pending.push_back(event);
                    }
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Word-boundary token estimate for streamed text, used when a provider
/// reports no usage. Telemetry only, documented as approximate.
pub fn estimate_tokens(text: &str) -> u64 {
    text.split_whitespace().count() as u64
}

/// Token bookkeeping shared between a streaming translator and the engine's
/// finalization step. The translator fills it in as the stream progresses;
/// the engine reads it once the client stream completes.
#[derive(Debug, Default)]
pub struct StreamTally {
    /// Input tokens, when the provider reported them.
    pub input_tokens: u64,
    /// Running word-boundary estimate over emitted text deltas.
    pub estimated_output: u64,
    /// Authoritative output count from a provider `usage` field, if any.
    pub reported_output: Option<u64>,
    /// The translated stream emitted a final `message_stop`.
    pub closed: bool,
    /// The upstream failed after bytes had been sent.
    pub failed: bool,
}

impl StreamTally {
    pub fn shared() -> Arc<Mutex<StreamTally>> {
        Arc::new(Mutex::new(StreamTally::default()))
    }

    /// Output tokens to record: the provider count when present, otherwise
    /// the running estimate.
    pub fn output_tokens(&self) -> u64 {
        self.reported_output.unwrap_or(self.estimated_output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_event() {
        let mut parser = SseParser::new();
        let events = parser.push(b"event: message\ndata: {\"test\":\"value\"}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("message"));
        assert_eq!(events[0].data, "{\"test\":\"value\"}");
    }

    #[test]
    fn parses_multiple_events_in_one_chunk() {
        let mut parser = SseParser::new();
        let events = parser.push(b"event: start\ndata: {\"a\":1}\n\nevent: delta\ndata: {\"b\":2}\n\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event.as_deref(), Some("start"));
        assert_eq!(events[1].event.as_deref(), Some("delta"));
    }

    #[test]
    fn buffers_partial_events_across_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.push(b"data: {\"par").is_empty());
        assert!(parser.push(b"tial\":true}").is_empty());
        let events = parser.push(b"\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "{\"partial\":true}");
    }

    #[test]
    fn tolerates_crlf_framing() {
        let mut parser = SseParser::new();
        let events = parser.push(b"event: ping\r\ndata: {}\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("ping"));
        assert_eq!(events[0].data, "{}");
    }

    #[test]
    fn ignores_comment_heartbeats() {
        let mut parser = SseParser::new();
        let events = parser.push(b":heartbeat\n\ndata: real\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "real");
    }

    #[test]
    fn done_sentinel_comes_through_as_data() {
        let mut parser = SseParser::new();
        let events = parser.push(b"data: [DONE]\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "[DONE]");
    }

    #[test]
    fn multi_line_data_is_joined() {
        let mut parser = SseParser::new();
        let events = parser.push(b"data: one\ndata: two\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "one\ntwo");
    }

    #[test]
    fn finish_flushes_unterminated_event() {
        let mut parser = SseParser::new();
        assert!(parser.push(b"data: tail").is_empty());
        let event = parser.finish().unwrap();
        assert_eq!(event.data, "tail");
        assert!(parser.finish().is_none());
    }

    #[test]
    fn estimates_tokens_on_word_boundaries() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("hello"), 1);
        assert_eq!(estimate_tokens("hello  world, again"), 3);
    }

    #[test]
    fn tally_prefers_reported_output() {
        let mut tally = StreamTally::default();
        tally.estimated_output = 12;
        assert_eq!(tally.output_tokens(), 12);
        tally.reported_output = Some(9);
        assert_eq!(tally.output_tokens(), 9);
    }
}
