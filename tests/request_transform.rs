//! Request translation across the three upstream wire formats.

use claude_relay::models::ClaudeRequest;
use claude_relay::pool::{Upstream, UpstreamKind};
use claude_relay::providers::build_request;
use serde_json::json;

fn upstream(kind: UpstreamKind, default_model: Option<&str>) -> Upstream {
    Upstream {
        name: format!("{kind}-upstream"),
        host: "upstream.example.com".to_string(),
        api_key: "secret-key".to_string(),
        kind,
        default_model: default_model.map(String::from),
        enabled: true,
        remark: String::new(),
    }
}

fn claude_request(extra: serde_json::Value) -> ClaudeRequest {
    let mut body = json!({
        "model": "claude-3",
        "max_tokens": 64,
        "messages": [
            {"role": "user", "content": "What is the capital of France?"},
            {"role": "assistant", "content": "Paris."},
            {"role": "user", "content": "And of Italy?"}
        ]
    });
    if let (Some(base), Some(extra)) = (body.as_object_mut(), extra.as_object()) {
        for (k, v) in extra {
            base.insert(k.clone(), v.clone());
        }
    }
    serde_json::from_value(body).unwrap()
}

#[test]
fn claude_target_is_a_passthrough_with_auth_headers() {
    let raw = build_request(&upstream(UpstreamKind::Claude, None), &claude_request(json!({}))).unwrap();

    assert_eq!(raw.path, "/v1/messages");
    assert_eq!(raw.body["model"], "claude-3");
    assert_eq!(raw.body["messages"].as_array().unwrap().len(), 3);
    assert!(raw.headers.iter().any(|(k, _)| *k == "x-api-key"));
    assert!(raw.headers.iter().any(|(k, _)| *k == "anthropic-version"));
    assert!(raw.query.is_empty());
}

#[test]
fn openai_target_rewrites_messages_and_auth() {
    let raw = build_request(
        &upstream(UpstreamKind::Openai, Some("gpt-4-turbo")),
        &claude_request(json!({"system": "Answer with one word.", "temperature": 0.1})),
    )
    .unwrap();

    assert_eq!(raw.path, "/v1/chat/completions");
    assert_eq!(raw.body["model"], "gpt-4-turbo");
    assert_eq!(raw.body["temperature"], 0.1);

    let messages = raw.body["messages"].as_array().unwrap();
    assert_eq!(messages[0]["role"], "system");
    assert_eq!(messages[1]["role"], "user");
    assert_eq!(messages[2]["role"], "assistant");
    assert_eq!(messages[2]["content"], "Paris.");

    let (_, auth) = raw
        .headers
        .iter()
        .find(|(k, _)| *k == "Authorization")
        .unwrap();
    assert_eq!(auth, "Bearer secret-key");
}

#[test]
fn gemini_target_maps_roles_and_generation_config() {
    let raw = build_request(
        &upstream(UpstreamKind::Gemini, Some("gemini-pro")),
        &claude_request(json!({"system": "Answer with one word.", "top_p": 0.9})),
    )
    .unwrap();

    assert_eq!(raw.path, "/v1beta/models/gemini-pro:generateContent");
    assert!(raw.query.contains(&("key", "secret-key".to_string())));

    let contents = raw.body["contents"].as_array().unwrap();
    assert_eq!(contents[0]["role"], "user");
    assert_eq!(contents[1]["role"], "model");
    assert_eq!(contents[2]["role"], "user");
    assert_eq!(raw.body["generationConfig"]["maxOutputTokens"], 64);
    assert_eq!(raw.body["generationConfig"]["topP"], 0.9);
    assert_eq!(
        raw.body["systemInstruction"]["parts"][0]["text"],
        "Answer with one word."
    );
}

#[test]
fn text_content_survives_translation_to_every_target() {
    // Round-trip identity on message text: whatever the target format, the
    // text of each message must come through unchanged.
    let request = claude_request(json!({}));
    let expected: Vec<String> = request
        .messages
        .iter()
        .map(|m| m.content.flattened_text())
        .collect();

    let openai = build_request(&upstream(UpstreamKind::Openai, Some("gpt-4-turbo")), &request).unwrap();
    let openai_texts: Vec<String> = openai.body["messages"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|m| m["role"] != "system")
        .map(|m| m["content"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(openai_texts, expected);

    let gemini = build_request(&upstream(UpstreamKind::Gemini, Some("gemini-pro")), &request).unwrap();
    let gemini_texts: Vec<String> = gemini.body["contents"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["parts"][0]["text"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(gemini_texts, expected);

    let claude = build_request(&upstream(UpstreamKind::Claude, None), &request).unwrap();
    let claude_texts: Vec<String> = claude.body["messages"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["content"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(claude_texts, expected);
}

#[test]
fn stream_flag_selects_gemini_path_variant() {
    let buffered = build_request(
        &upstream(UpstreamKind::Gemini, Some("gemini-pro")),
        &claude_request(json!({})),
    )
    .unwrap();
    assert!(buffered.path.ends_with(":generateContent"));
    assert!(!buffered.query.iter().any(|(k, _)| *k == "alt"));

    let streaming = build_request(
        &upstream(UpstreamKind::Gemini, Some("gemini-pro")),
        &claude_request(json!({"stream": true})),
    )
    .unwrap();
    assert!(streaming.path.ends_with(":streamGenerateContent"));
    assert!(streaming.query.contains(&("alt", "sse".to_string())));
}

#[test]
fn block_system_prompts_are_flattened_for_openai() {
    let raw = build_request(
        &upstream(UpstreamKind::Openai, Some("gpt-4-turbo")),
        &claude_request(json!({
            "system": [
                {"type": "text", "text": "Be terse."},
                {"type": "text", "text": "Use English."}
            ]
        })),
    )
    .unwrap();

    assert_eq!(raw.body["messages"][0]["role"], "system");
    assert_eq!(raw.body["messages"][0]["content"], "Be terse.\nUse English.");
}
