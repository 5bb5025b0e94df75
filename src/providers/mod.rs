//! Protocol transformers for the three upstream wire formats.
//!
//! The set is closed: dispatch is a match over [`UpstreamKind`], and a new
//! provider is a code change, not a plugin. Each kind implements the same
//! four capabilities: request translation, buffered response translation,
//! streamed-event translation, and token extraction (folded into the other
//! two via [`streaming::StreamTally`] and [`crate::models::Usage`]).

pub mod claude;
pub mod error;
pub mod gemini;
pub mod openai;
pub mod streaming;

use crate::models::{ClaudeMessage, ClaudeRequest};
use crate::pool::{Upstream, UpstreamKind};
use bytes::Bytes;
use error::ProviderError;
use futures::stream::StreamExt;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use streaming::{SseStream, StreamTally};

/// A translated outbound request, ready for the shared HTTP client. The
/// engine supplies scheme and host; transformers only decide path, auth
/// placement, query string, and body.
#[derive(Debug)]
pub struct UpstreamRequest {
    pub path: String,
    pub headers: Vec<(&'static str, String)>,
    pub query: Vec<(&'static str, String)>,
    pub body: serde_json::Value,
}

/// Translate a Claude request into the upstream's native wire format.
pub fn build_request(
    upstream: &Upstream,
    request: &ClaudeRequest,
) -> Result<UpstreamRequest, ProviderError> {
    match upstream.kind {
        UpstreamKind::Claude => claude::build_request(upstream, request),
        UpstreamKind::Openai => openai::build_request(upstream, request),
        UpstreamKind::Gemini => gemini::build_request(upstream, request),
    }
}

/// Translate a buffered 2xx upstream body back into a Claude message.
pub fn parse_response(
    kind: UpstreamKind,
    caller_model: &str,
    body: &[u8],
) -> Result<ClaudeMessage, ProviderError> {
    match kind {
        UpstreamKind::Claude => claude::parse_response(caller_model, body),
        UpstreamKind::Openai => openai::parse_response(caller_model, body),
        UpstreamKind::Gemini => gemini::parse_response(caller_model, body),
    }
}

/// The client-facing SSE byte stream for one committed streaming attempt.
pub type ClaudeEventStream = Pin<Box<dyn futures::Stream<Item = Bytes> + Send>>;

/// Wire an upstream response body to a Claude SSE stream.
///
/// All failure handling is internal: a mid-stream upstream error marks the
/// shared tally as failed, completes the client stream with
/// `message_delta(stop_reason:"error")` + `message_stop`, and ends it. The
/// engine inspects the tally after the stream to settle statistics.
pub fn claude_event_stream(
    kind: UpstreamKind,
    caller_model: &str,
    response: reqwest::Response,
    tally: Arc<Mutex<StreamTally>>,
) -> ClaudeEventStream {
    match kind {
        UpstreamKind::Claude => passthrough_stream(response, tally),
        UpstreamKind::Openai => translated_stream(
            response,
            openai::OpenAiEventTranslator::new(caller_model.to_string(), tally.clone()),
            tally,
        ),
        UpstreamKind::Gemini => translated_stream(
            response,
            gemini::GeminiEventTranslator::new(caller_model.to_string(), tally.clone()),
            tally,
        ),
    }
}

/// Uniform surface over the two stateful translators so the stream wiring
/// is written once. Not a provider extension point.
trait EventTranslate: Send {
    fn handle_data(&mut self, data: &str) -> String;
    fn finish(&mut self) -> String;
    fn error_close(&mut self) -> String;
}

impl EventTranslate for openai::OpenAiEventTranslator {
    fn handle_data(&mut self, data: &str) -> String {
        openai::OpenAiEventTranslator::handle_data(self, data)
    }
    fn finish(&mut self) -> String {
        openai::OpenAiEventTranslator::finish(self)
    }
    fn error_close(&mut self) -> String {
        openai::OpenAiEventTranslator::error_close(self)
    }
}

impl EventTranslate for gemini::GeminiEventTranslator {
    fn handle_data(&mut self, data: &str) -> String {
        gemini::GeminiEventTranslator::handle_data(self, data)
    }
    fn finish(&mut self) -> String {
        gemini::GeminiEventTranslator::finish(self)
    }
    fn error_close(&mut self) -> String {
        gemini::GeminiEventTranslator::error_close(self)
    }
}

fn translated_stream<T: EventTranslate + 'static>(
    response: reqwest::Response,
    translator: T,
    tally: Arc<Mutex<StreamTally>>,
) -> ClaudeEventStream {
    let translator = Arc::new(Mutex::new(translator));
    let at_end = translator.clone();
    let events = SseStream::new(response.bytes_stream());

    let stream = events
        .scan(false, move |errored, result| {
            if *errored {
                return futures::future::ready(None);
            }
            let bytes = match result {
                Ok(event) => Bytes::from(translator.lock().unwrap().handle_data(&event.data)),
                Err(e) => {
                    tracing::warn!(error = %e, "upstream stream failed mid-flight");
                    *errored = true;
                    tally.lock().unwrap().failed = true;
                    Bytes::from(translator.lock().unwrap().error_close())
                }
            };
            futures::future::ready(Some(bytes))
        })
        .chain(futures::stream::once(async move {
            Bytes::from(at_end.lock().unwrap().finish())
        }))
        .filter(|bytes| futures::future::ready(!bytes.is_empty()));

    Box::pin(stream)
}

/// Claude upstream: bytes are forwarded verbatim while a side parser feeds
/// the tally. A mid-stream failure still gets a best-effort synthesized
/// completion so the client sees a terminated message.
fn passthrough_stream(
    response: reqwest::Response,
    tally: Arc<Mutex<StreamTally>>,
) -> ClaudeEventStream {
    let mut observer = claude::PassthroughObserver::new(tally.clone());

    let stream = response
        .bytes_stream()
        .scan(false, move |errored, result| {
            if *errored {
                return futures::future::ready(None);
            }
            let bytes = match result {
                Ok(bytes) => {
                    observer.observe(&bytes);
                    bytes
                }
                Err(e) => {
                    tracing::warn!(error = %e, "upstream stream failed mid-flight");
                    *errored = true;
                    let mut tally = tally.lock().unwrap();
                    tally.failed = true;
                    if tally.closed {
                        Bytes::new()
                    } else {
                        tally.closed = true;
                        let output_tokens = tally.output_tokens();
                        let mut out = streaming::format_event(
                            "message_delta",
                            &serde_json::json!({
                                "type": "message_delta",
                                "delta": {"stop_reason": "error", "stop_sequence": null},
                                "usage": {"output_tokens": output_tokens}
                            }),
                        );
                        out.push_str(&streaming::format_event(
                            "message_stop",
                            &serde_json::json!({"type": "message_stop"}),
                        ));
                        Bytes::from(out)
                    }
                }
            };
            futures::future::ready(Some(bytes))
        })
        .filter(|bytes| futures::future::ready(!bytes.is_empty()));

    Box::pin(stream)
}
