//! Claude-to-Claude transformer: a pass-through with credential rewrite.
//!
//! The body goes upstream unchanged apart from an optional model override;
//! responses come back verbatim. Streams are forwarded byte-for-byte while a
//! side parser extracts usage for telemetry.

use super::error::ProviderError;
use super::streaming::{SseParser, StreamTally};
use super::UpstreamRequest;
use crate::models::{ClaudeMessage, ClaudeRequest};
use crate::pool::Upstream;
use std::sync::{Arc, Mutex};

pub const ANTHROPIC_VERSION: &str = "2023-06-01";

pub fn build_request(
    upstream: &Upstream,
    request: &ClaudeRequest,
) -> Result<UpstreamRequest, ProviderError> {
    let mut request = request.clone();
    if let Some(model) = upstream.default_model.as_deref().filter(|m| !m.is_empty()) {
        request.model = model.to_string();
    }

    let body = serde_json::to_value(&request)
        .map_err(|e| ProviderError::Translation(e.to_string()))?;

    Ok(UpstreamRequest {
        path: "/v1/messages".to_string(),
        headers: vec![
            ("x-api-key", upstream.api_key.clone()),
            ("anthropic-version", ANTHROPIC_VERSION.to_string()),
        ],
        query: Vec::new(),
        body,
    })
}

pub fn parse_response(caller_model: &str, body: &[u8]) -> Result<ClaudeMessage, ProviderError> {
    let mut message: ClaudeMessage = serde_json::from_slice(body)
        .map_err(|e| ProviderError::MalformedResponse(e.to_string()))?;
    message.model = caller_model.to_string();
    Ok(message)
}

/// Side-channel observer for a pass-through stream. Events are forwarded
/// verbatim; this only feeds the tally so the engine can record tokens.
pub struct PassthroughObserver {
    parser: SseParser,
    tally: Arc<Mutex<StreamTally>>,
}

impl PassthroughObserver {
    pub fn new(tally: Arc<Mutex<StreamTally>>) -> Self {
        Self {
            parser: SseParser::new(),
            tally,
        }
    }

    pub fn observe(&mut self, chunk: &[u8]) {
        for event in self.parser.push(chunk) {
            let Ok(data) = serde_json::from_str::<serde_json::Value>(&event.data) else {
                continue;
            };
            let kind = event
                .event
                .as_deref()
                .or_else(|| data.get("type").and_then(|t| t.as_str()))
                .unwrap_or_default()
                .to_string();
            let mut tally = self.tally.lock().unwrap();
            match kind.as_str() {
                "message_start" => {
                    if let Some(input) = data
                        .pointer("/message/usage/input_tokens")
                        .and_then(|v| v.as_u64())
                    {
                        tally.input_tokens = input;
                    }
                }
                "message_delta" => {
                    if let Some(output) = data
                        .pointer("/usage/output_tokens")
                        .and_then(|v| v.as_u64())
                    {
                        tally.reported_output = Some(output);
                    }
                }
                "message_stop" => {
                    tally.closed = true;
                }
                _ => {}
            }
        }
    }
}
