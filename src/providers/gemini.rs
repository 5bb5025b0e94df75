//! Claude ↔ Gemini generateContent transformer.
//!
//! Gemini embeds the model in the request path, takes the API key as a
//! query parameter, and uses `user`/`model` roles. Tool declarations are
//! not carried over; they are dropped with a warning.

use super::error::ProviderError;
use super::streaming::{estimate_tokens, format_event, StreamTally};
use super::UpstreamRequest;
use crate::models::{
    ClaudeMessage, ClaudeRequest, ContentBlock, KnownContentBlock, MessageContent, Usage,
};
use crate::pool::Upstream;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiSystemInstruction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiContent {
    /// "user" or "model", never "assistant"
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiSystemInstruction {
    parts: Vec<GeminiPart>,
}

/// Untagged: Gemini 3 parts may carry a thought signature next to the text;
/// only the text matters here.
#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum GeminiPart {
    Text {
        text: String,
    },
    TextWithThought {
        text: String,
        #[serde(rename = "thoughtSignature")]
        thought_signature: String,
    },
    Other(serde_json::Value),
}

impl GeminiPart {
    fn as_text(&self) -> Option<&str> {
        match self {
            GeminiPart::Text { text } => Some(text),
            GeminiPart::TextWithThought { text, .. } => Some(text),
            GeminiPart::Other(_) => None,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<GeminiContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: Option<u64>,
    #[serde(default)]
    candidates_token_count: Option<u64>,
}

fn map_finish_reason(reason: &str) -> &'static str {
    match reason {
        "STOP" => "end_turn",
        "MAX_TOKENS" => "max_tokens",
        "SAFETY" => "end_turn",
        "RECITATION" => "end_turn",
        _ => "end_turn",
    }
}

fn map_role(role: &str) -> &'static str {
    if role == "assistant" {
        "model"
    } else {
        "user"
    }
}

pub fn build_request(
    upstream: &Upstream,
    request: &ClaudeRequest,
) -> Result<UpstreamRequest, ProviderError> {
    let model = upstream
        .default_model
        .as_deref()
        .filter(|m| !m.is_empty())
        .ok_or_else(|| {
            ProviderError::Translation(format!(
                "upstream {} has no default model for gemini",
                upstream.name
            ))
        })?;

    if request.tools.as_ref().map(|t| !t.is_empty()).unwrap_or(false) {
        tracing::warn!(upstream = %upstream.name, "gemini target does not carry tool definitions, dropping them");
    }

    let mut contents = Vec::new();
    for msg in &request.messages {
        let parts: Vec<GeminiPart> = match &msg.content {
            MessageContent::Text(text) => vec![GeminiPart::Text { text: text.clone() }],
            MessageContent::Blocks(blocks) => {
                let mut parts = Vec::new();
                for block in blocks {
                    match block {
                        ContentBlock::Known(KnownContentBlock::Text { text, .. }) => {
                            parts.push(GeminiPart::Text { text: text.clone() });
                        }
                        ContentBlock::Known(KnownContentBlock::ToolResult {
                            content, ..
                        }) => {
                            // No function-call channel; carry the result as text.
                            parts.push(GeminiPart::Text {
                                text: content.flattened_text(),
                            });
                        }
                        other => {
                            tracing::warn!(
                                block = block_label(other),
                                "dropping content block gemini cannot express"
                            );
                        }
                    }
                }
                parts
            }
        };
        if parts.is_empty() {
            continue;
        }
        contents.push(GeminiContent {
            role: Some(map_role(&msg.role).to_string()),
            parts,
        });
    }

    let system_instruction = request.system.as_ref().map(|system| GeminiSystemInstruction {
        parts: vec![GeminiPart::Text {
            text: system.flattened_text(),
        }],
    });

    let body = GeminiRequest {
        contents,
        system_instruction,
        generation_config: Some(GenerationConfig {
            max_output_tokens: Some(request.max_tokens),
            temperature: request.temperature,
            top_p: request.top_p,
            stop_sequences: request.stop_sequences.clone(),
        }),
    };

    let streaming = request.wants_stream();
    let path = if streaming {
        format!("/v1beta/models/{model}:streamGenerateContent")
    } else {
        format!("/v1beta/models/{model}:generateContent")
    };
    let mut query = vec![("key", upstream.api_key.clone())];
    if streaming {
        query.push(("alt", "sse".to_string()));
    }

    Ok(UpstreamRequest {
        path,
        headers: Vec::new(),
        query,
        body: serde_json::to_value(body).map_err(|e| ProviderError::Translation(e.to_string()))?,
    })
}

fn block_label(block: &ContentBlock) -> &'static str {
    match block {
        ContentBlock::Known(KnownContentBlock::Text { .. }) => "text",
        ContentBlock::Known(KnownContentBlock::Image { .. }) => "image",
        ContentBlock::Known(KnownContentBlock::ToolUse { .. }) => "tool_use",
        ContentBlock::Known(KnownContentBlock::ToolResult { .. }) => "tool_result",
        ContentBlock::Unknown(_) => "unknown",
    }
}

pub fn parse_response(caller_model: &str, body: &[u8]) -> Result<ClaudeMessage, ProviderError> {
    let response: GeminiResponse = serde_json::from_slice(body)
        .map_err(|e| ProviderError::MalformedResponse(e.to_string()))?;

    let candidate = response
        .candidates
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::MalformedResponse("response has no candidates".into()))?;

    // One text block per part, preserving order.
    let content: Vec<ContentBlock> = candidate
        .content
        .map(|c| {
            c.parts
                .iter()
                .filter_map(|p| p.as_text())
                .filter(|t| !t.is_empty())
                .map(ContentBlock::text)
                .collect()
        })
        .unwrap_or_default();

    let stop_reason = candidate
        .finish_reason
        .as_deref()
        .map(|r| map_finish_reason(r).to_string());

    let usage = response.usage_metadata.unwrap_or(UsageMetadata {
        prompt_token_count: None,
        candidates_token_count: None,
    });

    Ok(ClaudeMessage::assistant(
        None,
        caller_model,
        content,
        stop_reason,
        Usage {
            input_tokens: usage.prompt_token_count.unwrap_or(0),
            output_tokens: usage.candidates_token_count.unwrap_or(0),
        },
    ))
}

/// Stateful Gemini SSE chunk → Claude SSE translator.
pub struct GeminiEventTranslator {
    message_id: String,
    model: String,
    tally: Arc<Mutex<StreamTally>>,
    message_started: bool,
    block_open: bool,
}

impl GeminiEventTranslator {
    pub fn new(model: String, tally: Arc<Mutex<StreamTally>>) -> Self {
        Self {
            message_id: crate::models::generate_message_id(),
            model,
            tally,
            message_started: false,
            block_open: false,
        }
    }

    pub fn handle_data(&mut self, data: &str) -> String {
        let data = data.trim();
        if data.is_empty() {
            return String::new();
        }

        let chunk: GeminiResponse = match serde_json::from_str(data) {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::warn!(error = %e, "skipping unparseable gemini chunk");
                return String::new();
            }
        };

        // usageMetadata is authoritative whenever it appears.
        if let Some(usage) = &chunk.usage_metadata {
            let mut tally = self.tally.lock().unwrap();
            if let Some(input) = usage.prompt_token_count {
                tally.input_tokens = input;
            }
            if let Some(output) = usage.candidates_token_count {
                tally.reported_output = Some(output);
            }
        }

        let mut out = String::new();
        if let Some(candidate) = chunk.candidates.first() {
            if let Some(content) = &candidate.content {
                for part in &content.parts {
                    if let Some(text) = part.as_text().filter(|t| !t.is_empty()) {
                        out.push_str(&self.emit_text_delta(text));
                    }
                }
            }
            if let Some(reason) = &candidate.finish_reason {
                out.push_str(&self.close(map_finish_reason(reason)));
            }
        }
        out
    }

    pub fn finish(&mut self) -> String {
        if self.message_started && !self.tally.lock().unwrap().closed {
            tracing::warn!("gemini stream ended without finishReason, closing out");
            self.close("end_turn")
        } else {
            String::new()
        }
    }

    /// Complete the client stream after a mid-flight upstream failure.
    pub fn error_close(&mut self) -> String {
        let already_closed = self.tally.lock().unwrap().closed;
        if already_closed {
            String::new()
        } else {
            self.close("error")
        }
    }

    fn ensure_message_start(&mut self) -> String {
        if self.message_started {
            return String::new();
        }
        self.message_started = true;
        format_event(
            "message_start",
            &serde_json::json!({
                "type": "message_start",
                "message": {
                    "id": self.message_id,
                    "type": "message",
                    "role": "assistant",
                    "content": [],
                    "model": self.model,
                    "stop_reason": null,
                    "stop_sequence": null,
                    "usage": {"input_tokens": 0, "output_tokens": 0}
                }
            }),
        )
    }

    fn emit_text_delta(&mut self, text: &str) -> String {
        let mut out = self.ensure_message_start();

        if !self.block_open {
            self.block_open = true;
            out.push_str(&format_event(
                "content_block_start",
                &serde_json::json!({
                    "type": "content_block_start",
                    "index": 0,
                    "content_block": {"type": "text", "text": ""}
                }),
            ));
        }

        self.tally.lock().unwrap().estimated_output += estimate_tokens(text);
        out.push_str(&format_event(
            "content_block_delta",
            &serde_json::json!({
                "type": "content_block_delta",
                "index": 0,
                "delta": {"type": "text_delta", "text": text}
            }),
        ));
        out
    }

    fn close(&mut self, stop_reason: &str) -> String {
        let mut out = self.ensure_message_start();

        if self.block_open {
            self.block_open = false;
            out.push_str(&format_event(
                "content_block_stop",
                &serde_json::json!({"type": "content_block_stop", "index": 0}),
            ));
        }

        let output_tokens = {
            let mut tally = self.tally.lock().unwrap();
            tally.closed = true;
            tally.output_tokens()
        };

        out.push_str(&format_event(
            "message_delta",
            &serde_json::json!({
                "type": "message_delta",
                "delta": {"stop_reason": stop_reason, "stop_sequence": null},
                "usage": {"output_tokens": output_tokens}
            }),
        ));
        out.push_str(&format_event(
            "message_stop",
            &serde_json::json!({"type": "message_stop"}),
        ));
        out
    }
}
