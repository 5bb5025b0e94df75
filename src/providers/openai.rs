//! Claude ↔ OpenAI Chat Completions transformer.
//!
//! Handles the structural differences between the two APIs:
//! - Anthropic `content` is a string or an array of typed blocks; OpenAI
//!   content is a string or an array of parts with tools in separate fields.
//! - `tool_use` blocks become `tool_calls` on assistant messages;
//!   `tool_result` blocks become separate `tool` role messages that must
//!   come before the user's own text.
//! - `image` blocks become `image_url` parts with data URIs.

use super::error::ProviderError;
use super::streaming::{estimate_tokens, format_event, StreamTally};
use super::UpstreamRequest;
use crate::models::{
    ClaudeMessage, ClaudeRequest, ContentBlock, KnownContentBlock, MessageContent, Usage,
};
use crate::pool::Upstream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<OpenAiTool>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAiMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<OpenAiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OpenAiToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum OpenAiContent {
    String(String),
    Parts(Vec<OpenAiContentPart>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
enum OpenAiContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: OpenAiImageUrl },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OpenAiImageUrl {
    url: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAiToolCall {
    id: String,
    r#type: String,
    function: OpenAiFunctionCall,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAiFunctionCall {
    name: String,
    arguments: String, // JSON string
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAiTool {
    r#type: String,
    function: OpenAiFunctionDef,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAiFunctionDef {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parameters: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    #[serde(default)]
    id: Option<String>,
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct OpenAiUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChunk {
    #[serde(default)]
    choices: Vec<OpenAiStreamChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChoice {
    delta: OpenAiStreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct OpenAiStreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<serde_json::Value>>,
}

fn map_finish_reason(reason: &str) -> &'static str {
    match reason {
        "stop" => "end_turn",
        "length" => "max_tokens",
        "tool_calls" => "tool_use",
        "content_filter" => "end_turn",
        _ => "end_turn",
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
                "upstream {} has no default model for openai",
                upstream.name
            ))
        })?;

    let mut messages = Vec::new();

    if let Some(ref system) = request.system {
        messages.push(OpenAiMessage {
            role: "system".to_string(),
            content: Some(OpenAiContent::String(system.flattened_text())),
            tool_calls: None,
            tool_call_id: None,
        });
    }

    for msg in &request.messages {
        match &msg.content {
            MessageContent::Text(text) => {
                messages.push(OpenAiMessage {
                    role: msg.role.clone(),
                    content: Some(OpenAiContent::String(text.clone())),
                    tool_calls: None,
                    tool_call_id: None,
                });
            }
            MessageContent::Blocks(blocks) => {
                push_block_message(&mut messages, &msg.role, blocks);
            }
        }
    }

    let tools = request.tools.as_ref().map(|tools| {
        tools
            .iter()
            .filter_map(|tool| {
                Some(OpenAiTool {
                    r#type: "function".to_string(),
                    function: OpenAiFunctionDef {
                        name: tool.name.as_ref()?.clone(),
                        description: tool.description.clone(),
                        parameters: tool.input_schema.clone(),
                    },
                })
            })
            .collect::<Vec<_>>()
    });

    let body = OpenAiRequest {
        model: model.to_string(),
        messages,
        max_tokens: Some(request.max_tokens),
        temperature: request.temperature,
        top_p: request.top_p,
        stop: request.stop_sequences.clone(),
        stream: request.stream,
        tools,
    };

    Ok(UpstreamRequest {
        path: "/v1/chat/completions".to_string(),
        headers: vec![("Authorization", format!("Bearer {}", upstream.api_key))],
        query: Vec::new(),
        body: serde_json::to_value(body).map_err(|e| ProviderError::Translation(e.to_string()))?,
    })
}

/// Expand one block-content message into OpenAI messages. Tool results must
/// become separate `tool` role messages placed before the main message.
fn push_block_message(messages: &mut Vec<OpenAiMessage>, role: &str, blocks: &[ContentBlock]) {
    let mut tool_results = Vec::new();
    let mut tool_calls = Vec::new();
    let mut parts = Vec::new();

    for block in blocks {
        match block {
            ContentBlock::Known(KnownContentBlock::Text { text, .. }) => {
                parts.push(OpenAiContentPart::Text { text: text.clone() });
            }
            ContentBlock::Known(KnownContentBlock::Image { source }) => {
                let url = if source.r#type == "base64" {
                    let media_type = source.media_type.as_deref().unwrap_or("image/png");
                    let data = source.data.as_deref().unwrap_or("");
                    format!("data:{media_type};base64,{data}")
                } else if let Some(url) = &source.url {
                    url.clone()
                } else {
                    continue;
                };
                parts.push(OpenAiContentPart::ImageUrl {
                    image_url: OpenAiImageUrl { url },
                });
            }
            ContentBlock::Known(KnownContentBlock::ToolUse { id, name, input }) => {
                tool_calls.push(OpenAiToolCall {
                    id: id.clone(),
                    r#type: "function".to_string(),
                    function: OpenAiFunctionCall {
                        name: name.clone(),
                        arguments: serde_json::to_string(input).unwrap_or_default(),
                    },
                });
            }
            ContentBlock::Known(KnownContentBlock::ToolResult {
                tool_use_id,
                content,
                ..
            }) => {
                tool_results.push((tool_use_id.clone(), content.flattened_text()));
            }
            ContentBlock::Unknown(value) => {
                tracing::warn!(
                    block_type = value.get("type").and_then(|t| t.as_str()).unwrap_or("?"),
                    "dropping content block openai cannot express"
                );
            }
        }
    }

    for (tool_use_id, result) in tool_results {
        messages.push(OpenAiMessage {
            role: "tool".to_string(),
            content: Some(OpenAiContent::String(result)),
            tool_calls: None,
            tool_call_id: Some(tool_use_id),
        });
    }

    if parts.is_empty() && tool_calls.is_empty() {
        return;
    }

    let content = if parts.is_empty() {
        None
    } else if parts.len() == 1 {
        match &parts[0] {
            OpenAiContentPart::Text { text } => Some(OpenAiContent::String(text.clone())),
            _ => Some(OpenAiContent::Parts(parts)),
        }
    } else {
        Some(OpenAiContent::Parts(parts))
    };

    messages.push(OpenAiMessage {
        role: role.to_string(),
        content,
        tool_calls: if tool_calls.is_empty() {
            None
        } else {
            Some(tool_calls)
        },
        tool_call_id: None,
    });
}

pub fn parse_response(caller_model: &str, body: &[u8]) -> Result<ClaudeMessage, ProviderError> {
    let response: OpenAiResponse = serde_json::from_slice(body)
        .map_err(|e| ProviderError::MalformedResponse(e.to_string()))?;

    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::MalformedResponse("response has no choices".into()))?;

    let mut content = Vec::new();

    if let Some(message_content) = choice.message.content {
        let text = match message_content {
            OpenAiContent::String(s) => s,
            OpenAiContent::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    OpenAiContentPart::Text { text } => Some(text.clone()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        };
        if !text.is_empty() {
            content.push(ContentBlock::text(text));
        }
    }

    if let Some(tool_calls) = choice.message.tool_calls {
        for tool_call in tool_calls {
            let input = serde_json::from_str(&tool_call.function.arguments)
                .unwrap_or(serde_json::json!({}));
            content.push(ContentBlock::tool_use(
                tool_call.id,
                tool_call.function.name,
                input,
            ));
        }
    }

    let stop_reason = choice
        .finish_reason
        .as_deref()
        .map(|r| map_finish_reason(r).to_string());
    let usage = response.usage.unwrap_or_default();

    Ok(ClaudeMessage::assistant(
        response.id,
        caller_model,
        content,
        stop_reason,
        Usage {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
        },
    ))
}

/// Stateful OpenAI chunk → Claude SSE translator.
///
/// OpenAI streams tool calls incrementally: the first fragment carries id
/// and name, later fragments only argument text. Those become
/// `content_block_start` (tool_use) followed by `input_json_delta` deltas.
pub struct OpenAiEventTranslator {
    message_id: String,
    model: String,
    tally: Arc<Mutex<StreamTally>>,
    message_started: bool,
    text_block_open: bool,
    /// OpenAI tool_call index → Claude content block index.
    tool_blocks: HashMap<u64, u64>,
    next_block_index: u64,
}

impl OpenAiEventTranslator {
    pub fn new(model: String, tally: Arc<Mutex<StreamTally>>) -> Self {
        Self {
            message_id: crate::models::generate_message_id(),
            model,
            tally,
            message_started: false,
            text_block_open: false,
            tool_blocks: HashMap::new(),
            next_block_index: 0,
        }
    }

    /// Translate one SSE `data:` payload. Returns SSE-framed Claude events,
    /// possibly empty.
    pub fn handle_data(&mut self, data: &str) -> String {
        let data = data.trim();
        if data.is_empty() || data == "[DONE]" {
            return String::new();
        }

        let chunk: OpenAiStreamChunk = match serde_json::from_str(data) {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::warn!(error = %e, "skipping unparseable openai chunk");
                return String::new();
            }
        };

        if let Some(usage) = &chunk.usage {
            let mut tally = self.tally.lock().unwrap();
            if usage.prompt_tokens > 0 {
                tally.input_tokens = usage.prompt_tokens;
            }
            if usage.completion_tokens > 0 {
                tally.reported_output = Some(usage.completion_tokens);
            }
        }

        let mut out = String::new();
        for choice in &chunk.choices {
            if let Some(text) = choice.delta.content.as_deref().filter(|t| !t.is_empty()) {
                out.push_str(&self.emit_text_delta(text));
            }
            if let Some(tool_calls) = &choice.delta.tool_calls {
                out.push_str(&self.emit_tool_deltas(tool_calls));
            }
            if let Some(reason) = &choice.finish_reason {
                out.push_str(&self.close(map_finish_reason(reason)));
            }
        }
        out
    }

    /// Close out the stream when the upstream ended without a finish_reason.
    pub fn finish(&mut self) -> String {
        if self.message_started && !self.tally.lock().unwrap().closed {
            tracing::warn!("openai stream ended without finish_reason, closing out");
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

        if !self.text_block_open {
            self.text_block_open = true;
            self.next_block_index = self.next_block_index.max(1);
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

    fn emit_tool_deltas(&mut self, tool_calls: &[serde_json::Value]) -> String {
        let mut out = self.ensure_message_start();

        // Tool calls follow text; close the text block first.
        if self.text_block_open {
            self.text_block_open = false;
            out.push_str(&format_event(
                "content_block_stop",
                &serde_json::json!({"type": "content_block_stop", "index": 0}),
            ));
        }

        for tool_call in tool_calls {
            let tool_index = tool_call.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
            let id = tool_call.get("id").and_then(|v| v.as_str());
            let name = tool_call
                .pointer("/function/name")
                .and_then(|v| v.as_str());

            if let (Some(id), Some(name)) = (id, name) {
                if !self.tool_blocks.contains_key(&tool_index) {
                    let block_index = self.next_block_index;
                    self.next_block_index = block_index + 1;
                    self.tool_blocks.insert(tool_index, block_index);
                    out.push_str(&format_event(
                        "content_block_start",
                        &serde_json::json!({
                            "type": "content_block_start",
                            "index": block_index,
                            "content_block": {
                                "type": "tool_use",
                                "id": id,
                                "name": name,
                                "input": {}
                            }
                        }),
                    ));
                }
            }

            if let Some(args) = tool_call
                .pointer("/function/arguments")
                .and_then(|v| v.as_str())
                .filter(|a| !a.is_empty())
            {
                let block_index = match self.tool_blocks.get(&tool_index) {
                    Some(index) => *index,
                    None => continue,
                };
                out.push_str(&format_event(
                    "content_block_delta",
                    &serde_json::json!({
                        "type": "content_block_delta",
                        "index": block_index,
                        "delta": {"type": "input_json_delta", "partial_json": args}
                    }),
                ));
            }
        }
        out
    }

    fn close(&mut self, stop_reason: &str) -> String {
        let mut out = self.ensure_message_start();

        if self.text_block_open {
            self.text_block_open = false;
            out.push_str(&format_event(
                "content_block_stop",
                &serde_json::json!({"type": "content_block_stop", "index": 0}),
            ));
        }
        let mut tool_indices: Vec<u64> = self.tool_blocks.values().copied().collect();
        tool_indices.sort_unstable();
        for index in tool_indices {
            out.push_str(&format_event(
                "content_block_stop",
                &serde_json::json!({"type": "content_block_stop", "index": index}),
            ));
        }
        self.tool_blocks.clear();

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
