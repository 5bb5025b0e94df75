//! Streamed-event translation: the fixed Claude event sequence, token
//! accounting across chunks, and mid-stream error completion.

use claude_relay::providers::gemini::GeminiEventTranslator;
use claude_relay::providers::openai::OpenAiEventTranslator;
use claude_relay::providers::streaming::{SseParser, StreamTally};

fn event_types(sse: &str) -> Vec<String> {
    sse.lines()
        .filter_map(|l| l.strip_prefix("event: "))
        .map(String::from)
        .collect()
}

fn data_payloads(sse: &str) -> Vec<serde_json::Value> {
    sse.lines()
        .filter_map(|l| l.strip_prefix("data: "))
        .map(|d| serde_json::from_str(d).unwrap())
        .collect()
}

/// Scenario: three OpenAI chunks ("he", "llo", finish) must yield exactly
/// the Claude sequence message_start → content_block_start → deltas →
/// content_block_stop → message_delta → message_stop.
#[test]
fn openai_chunks_produce_the_claude_event_sequence() {
    let tally = StreamTally::shared();
    let mut translator = OpenAiEventTranslator::new("claude-3".to_string(), tally.clone());

    let mut out = String::new();
    out.push_str(&translator.handle_data(r#"{"choices":[{"delta":{"content":"he"},"index":0}]}"#));
    out.push_str(&translator.handle_data(r#"{"choices":[{"delta":{"content":"llo"},"index":0}]}"#));
    out.push_str(
        &translator.handle_data(r#"{"choices":[{"delta":{},"index":0,"finish_reason":"stop"}]}"#),
    );
    out.push_str(&translator.handle_data("[DONE]"));

    assert_eq!(
        event_types(&out),
        vec![
            "message_start",
            "content_block_start",
            "content_block_delta",
            "content_block_delta",
            "content_block_stop",
            "message_delta",
            "message_stop",
        ]
    );

    let payloads = data_payloads(&out);
    assert_eq!(payloads[0]["message"]["role"], "assistant");
    assert_eq!(payloads[1]["content_block"]["type"], "text");
    assert_eq!(payloads[2]["delta"]["text"], "he");
    assert_eq!(payloads[3]["delta"]["text"], "llo");
    assert_eq!(payloads[5]["delta"]["stop_reason"], "end_turn");
}

/// Token extraction is additive across chunks: at message_stop the reported
/// output equals the word-boundary estimates unless the provider supplied a
/// usage correction.
#[test]
fn output_tokens_accumulate_across_deltas() {
    let tally = StreamTally::shared();
    let mut translator = OpenAiEventTranslator::new("claude-3".to_string(), tally.clone());

    translator.handle_data(r#"{"choices":[{"delta":{"content":"alpha beta"},"index":0}]}"#);
    translator.handle_data(r#"{"choices":[{"delta":{"content":" gamma"},"index":0}]}"#);
    let out =
        translator.handle_data(r#"{"choices":[{"delta":{},"index":0,"finish_reason":"stop"}]}"#);

    // 2 + 1 words estimated, no provider usage: the estimate wins.
    assert_eq!(tally.lock().unwrap().output_tokens(), 3);
    let delta = data_payloads(&out)
        .into_iter()
        .find(|p| p["type"] == "message_delta")
        .unwrap();
    assert_eq!(delta["usage"]["output_tokens"], 3);
}

#[test]
fn provider_usage_overrides_the_running_estimate() {
    let tally = StreamTally::shared();
    let mut translator = GeminiEventTranslator::new("claude-3".to_string(), tally.clone());

    translator.handle_data(
        r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"one two three four"}]}}]}"#,
    );
    let out = translator.handle_data(
        r#"{"candidates":[{"content":{"role":"model","parts":[]},"finishReason":"STOP"}],"usageMetadata":{"promptTokenCount":6,"candidatesTokenCount":9}}"#,
    );

    let tally = tally.lock().unwrap();
    assert_eq!(tally.estimated_output, 4);
    assert_eq!(tally.reported_output, Some(9));
    assert_eq!(tally.output_tokens(), 9);
    assert_eq!(tally.input_tokens, 6);

    let delta = data_payloads(&out)
        .into_iter()
        .find(|p| p["type"] == "message_delta")
        .unwrap();
    assert_eq!(delta["usage"]["output_tokens"], 9);
}

#[test]
fn gemini_sse_chunks_produce_the_claude_event_sequence() {
    let tally = StreamTally::shared();
    let mut translator = GeminiEventTranslator::new("claude-3".to_string(), tally);

    // Chunks as they arrive on the wire, through the SSE parser first.
    let mut parser = SseParser::new();
    let wire = concat!(
        "data: {\"candidates\":[{\"content\":{\"role\":\"model\",\"parts\":[{\"text\":\"bon\"}]}}]}\n\n",
        "data: {\"candidates\":[{\"content\":{\"role\":\"model\",\"parts\":[{\"text\":\"jour\"}]},\"finishReason\":\"STOP\"}]}\n\n",
    );

    let mut out = String::new();
    for event in parser.push(wire.as_bytes()) {
        out.push_str(&translator.handle_data(&event.data));
    }

    assert_eq!(
        event_types(&out),
        vec![
            "message_start",
            "content_block_start",
            "content_block_delta",
            "content_block_delta",
            "content_block_stop",
            "message_delta",
            "message_stop",
        ]
    );
}

/// Mid-stream upstream failure: the client stream is completed with
/// message_delta(stop_reason="error") + message_stop, never retried.
#[test]
fn error_close_completes_a_partial_stream() {
    let tally = StreamTally::shared();
    let mut translator = OpenAiEventTranslator::new("claude-3".to_string(), tally.clone());

    translator.handle_data(r#"{"choices":[{"delta":{"content":"partial"},"index":0}]}"#);
    let out = translator.error_close();

    assert_eq!(
        event_types(&out),
        vec!["content_block_stop", "message_delta", "message_stop"]
    );
    let delta = data_payloads(&out)
        .into_iter()
        .find(|p| p["type"] == "message_delta")
        .unwrap();
    assert_eq!(delta["delta"]["stop_reason"], "error");
    assert!(tally.lock().unwrap().closed);
}

#[test]
fn error_close_after_clean_finish_is_silent() {
    let tally = StreamTally::shared();
    let mut translator = OpenAiEventTranslator::new("claude-3".to_string(), tally);

    translator.handle_data(r#"{"choices":[{"delta":{"content":"done"},"index":0}]}"#);
    translator.handle_data(r#"{"choices":[{"delta":{},"index":0,"finish_reason":"stop"}]}"#);

    assert!(translator.error_close().is_empty());
}

/// The parser must survive chunk boundaries that split an event, including
/// in the middle of a UTF-8-heavy JSON payload.
#[test]
fn split_chunks_reassemble_before_translation() {
    let tally = StreamTally::shared();
    let mut translator = OpenAiEventTranslator::new("claude-3".to_string(), tally);
    let mut parser = SseParser::new();

    let wire = "data: {\"choices\":[{\"delta\":{\"content\":\"hé\"},\"index\":0}]}\n\n";
    let bytes = wire.as_bytes();

    let mut out = String::new();
    for chunk in bytes.chunks(7) {
        for event in parser.push(chunk) {
            out.push_str(&translator.handle_data(&event.data));
        }
    }

    assert!(out.contains("content_block_delta"));
    assert!(out.contains("hé"));
}
