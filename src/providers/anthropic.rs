use crate::catalog::{provider_info, ProviderBinding};
use crate::credentials::Credential;
use crate::providers::ParsedResponse;
use crate::upstream::{join_url, WireAuth, WireRequest};
use crate::wire::{
    AssistantMessage, ChatMessage, Choice, ContentPart, FinishReason, FunctionCall,
    FunctionCallChunk, MessageContent, NormalizedRequest, Role, SseFrame, ToolCall, ToolCallChunk,
    Usage,
};
use serde_json::{json, Map, Value};
use std::collections::HashMap;

pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Injected when the client omits `max_tokens`; the messages API requires it.
pub const DEFAULT_MAX_TOKENS: u64 = 1024;

pub fn build_request(
    req: &NormalizedRequest,
    binding: &ProviderBinding,
    credential: &Credential,
    stream: bool,
) -> Result<WireRequest, String> {
    let info = provider_info(binding.provider);
    let mut body = encode_body(req, binding);
    body.insert(
        "model".to_string(),
        Value::String(binding.provider_model.clone()),
    );
    if stream {
        body.insert("stream".to_string(), Value::Bool(true));
    }
    let base = credential
        .base_url_override
        .as_deref()
        .unwrap_or(info.base_url);
    Ok(WireRequest {
        url: join_url(base, "/v1/messages"),
        body: Value::Object(body),
        auth: WireAuth::Header {
            name: "x-api-key",
            value: credential.secret.clone(),
        },
        extra_headers: vec![("anthropic-version", ANTHROPIC_VERSION.to_string())],
    })
}

/// Provider body minus `model` and `stream`, shared with the Bedrock wrapper.
pub(crate) fn encode_body(req: &NormalizedRequest, binding: &ProviderBinding) -> Map<String, Value> {
    let mut system_texts: Vec<String> = Vec::new();
    let mut messages: Vec<Value> = Vec::new();

    for message in &req.messages {
        match message.role {
            Role::System => {
                let text = message.content_text();
                if !text.is_empty() {
                    system_texts.push(text);
                }
            }
            Role::Tool => {
                if let Some(item) = encode_tool_result_message(message) {
                    messages.push(item);
                }
            }
            Role::User | Role::Assistant => messages.push(encode_regular_message(message)),
        }
    }

    let max_tokens = req
        .max_tokens
        .unwrap_or(DEFAULT_MAX_TOKENS)
        .min(binding.max_output_tokens.max(1));

    let mut body = Map::new();
    body.insert("messages".to_string(), Value::Array(messages));
    body.insert("max_tokens".to_string(), Value::from(max_tokens));
    if !system_texts.is_empty() {
        body.insert(
            "system".to_string(),
            Value::String(system_texts.join("\n\n")),
        );
    }
    if let Some(temperature) = req.temperature {
        body.insert("temperature".to_string(), Value::from(temperature));
    }
    if let Some(top_p) = req.top_p {
        body.insert("top_p".to_string(), Value::from(top_p));
    }
    if let Some(stop) = &req.stop {
        let sequences = match stop {
            Value::String(s) => vec![Value::String(s.clone())],
            Value::Array(arr) => arr.clone(),
            _ => Vec::new(),
        };
        if !sequences.is_empty() {
            body.insert("stop_sequences".to_string(), Value::Array(sequences));
        }
    }
    if let Some(tools) = &req.tools {
        let encoded: Vec<Value> = tools
            .iter()
            .map(|tool| {
                json!({
                    "name": tool.function.name,
                    "description": tool.function.description,
                    "input_schema": tool.function.parameters.clone().unwrap_or(json!({
                        "type": "object",
                        "properties": {}
                    }))
                })
            })
            .collect();
        body.insert("tools".to_string(), Value::Array(encoded));
    }
    if let Some(choice) = &req.tool_choice {
        body.insert("tool_choice".to_string(), encode_tool_choice(choice));
    }
    body
}

fn encode_regular_message(message: &ChatMessage) -> Value {
    let role = match message.role {
        Role::Assistant => "assistant",
        _ => "user",
    };
    let mut content: Vec<Value> = Vec::new();
    match &message.content {
        Some(MessageContent::Text(text)) if !text.is_empty() => {
            content.push(json!({ "type": "text", "text": text }));
        }
        Some(MessageContent::Parts(parts)) => {
            for part in parts {
                match part {
                    ContentPart::Text { text } if !text.is_empty() => {
                        content.push(json!({ "type": "text", "text": text }));
                    }
                    ContentPart::ImageUrl { image_url } => {
                        content.push(encode_image(&image_url.url));
                    }
                    ContentPart::Text { .. } => {}
                }
            }
        }
        _ => {}
    }
    if let Some(tool_calls) = &message.tool_calls {
        for call in tool_calls {
            let input = serde_json::from_str::<Value>(&call.function.arguments)
                .unwrap_or_else(|_| json!({ "_raw": call.function.arguments }));
            content.push(json!({
                "type": "tool_use",
                "id": call.id,
                "name": call.function.name,
                "input": input
            }));
        }
    }
    if content.is_empty() {
        content.push(json!({ "type": "text", "text": "" }));
    }
    json!({ "role": role, "content": content })
}

fn encode_tool_result_message(message: &ChatMessage) -> Option<Value> {
    let call_id = message.tool_call_id.as_deref()?;
    Some(json!({
        "role": "user",
        "content": [{
            "type": "tool_result",
            "tool_use_id": call_id,
            "content": message.content_text()
        }]
    }))
}

fn encode_image(url: &str) -> Value {
    // data: URLs become base64 sources; everything else stays a URL source.
    if let Some(rest) = url.strip_prefix("data:") {
        if let Some((media_type, data)) = rest.split_once(";base64,") {
            return json!({
                "type": "image",
                "source": { "type": "base64", "media_type": media_type, "data": data }
            });
        }
    }
    json!({
        "type": "image",
        "source": { "type": "url", "url": url }
    })
}

fn encode_tool_choice(choice: &Value) -> Value {
    match choice {
        Value::String(mode) => match mode.as_str() {
            "required" => json!({ "type": "any" }),
            "none" => json!({ "type": "none" }),
            _ => json!({ "type": "auto" }),
        },
        Value::Object(obj) => {
            if let Some(name) = obj
                .get("function")
                .and_then(|v| v.get("name"))
                .and_then(|v| v.as_str())
            {
                json!({ "type": "tool", "name": name })
            } else {
                Value::Object(obj.clone())
            }
        }
        other => other.clone(),
    }
}

pub fn parse_response(value: &Value) -> Result<ParsedResponse, String> {
    let obj = value
        .as_object()
        .ok_or_else(|| "messages response must be an object".to_string())?;
    let blocks = obj
        .get("content")
        .and_then(|v| v.as_array())
        .ok_or_else(|| "missing content".to_string())?;

    let mut text = String::new();
    let mut reasoning = String::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();
    for block in blocks {
        match block.get("type").and_then(|v| v.as_str()) {
            Some("text") => {
                if let Some(t) = block.get("text").and_then(|v| v.as_str()) {
                    text.push_str(t);
                }
            }
            Some("thinking") => {
                if let Some(t) = block.get("thinking").and_then(|v| v.as_str()) {
                    reasoning.push_str(t);
                }
            }
            Some("tool_use") => {
                let id = block.get("id").and_then(|v| v.as_str()).unwrap_or("");
                let name = block.get("name").and_then(|v| v.as_str()).unwrap_or("");
                if !id.is_empty() && !name.is_empty() {
                    let arguments = block
                        .get("input")
                        .map(|v| serde_json::to_string(v).unwrap_or_else(|_| "{}".to_string()))
                        .unwrap_or_else(|| "{}".to_string());
                    tool_calls.push(ToolCall {
                        id: id.to_string(),
                        call_type: "function".to_string(),
                        function: FunctionCall {
                            name: name.to_string(),
                            arguments,
                        },
                    });
                }
            }
            _ => {}
        }
    }

    let mut message = AssistantMessage::new((!text.is_empty()).then_some(text));
    message.reasoning = (!reasoning.is_empty()).then_some(reasoning);
    message.tool_calls = (!tool_calls.is_empty()).then_some(tool_calls);

    let usage = obj.get("usage").and_then(|v| v.as_object());
    let usage = Usage::from_counts(
        usage
            .and_then(|u| u.get("input_tokens"))
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
        usage
            .and_then(|u| u.get("output_tokens"))
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
        None,
        None,
        usage
            .and_then(|u| u.get("cache_read_input_tokens"))
            .and_then(|v| v.as_u64()),
    );

    Ok(ParsedResponse {
        id: obj.get("id").and_then(|v| v.as_str()).map(|s| s.to_string()),
        model: obj
            .get("model")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        choices: vec![Choice {
            index: 0,
            message,
            finish_reason: obj
                .get("stop_reason")
                .and_then(|v| v.as_str())
                .map(parse_stop_reason)
                .unwrap_or(FinishReason::Stop),
        }],
        usage,
    })
}

pub(crate) fn parse_stop_reason(raw: &str) -> FinishReason {
    match raw {
        "max_tokens" => FinishReason::Length,
        "tool_use" => FinishReason::ToolCalls,
        "refusal" => FinishReason::ContentFilter,
        _ => FinishReason::Stop,
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Text,
    Thinking,
    Tool { tool_index: u32 },
}

/// Event-by-event normalization of the Anthropic messages SSE stream.
#[derive(Default)]
pub struct StreamState {
    input_tokens: u64,
    output_tokens: u64,
    cached_tokens: Option<u64>,
    stop_reason: Option<FinishReason>,
    blocks: HashMap<u64, BlockKind>,
    next_tool_index: u32,
    done_emitted: bool,
}

impl StreamState {
    pub fn on_event(&mut self, event: &str, data: &str) -> Vec<SseFrame> {
        let Ok(value) = serde_json::from_str::<Value>(data) else {
            return Vec::new();
        };
        // SSE parsers report unnamed events as "message"; Anthropic names
        // its events but the payload `type` is authoritative either way.
        let kind = if event.is_empty() || event == "message" {
            value.get("type").and_then(|v| v.as_str()).unwrap_or("")
        } else {
            event
        };
        match kind {
            "message_start" => {
                if let Some(usage) = value
                    .get("message")
                    .and_then(|m| m.get("usage"))
                    .and_then(|v| v.as_object())
                {
                    self.input_tokens = usage
                        .get("input_tokens")
                        .and_then(|v| v.as_u64())
                        .unwrap_or(0);
                    self.cached_tokens = usage
                        .get("cache_read_input_tokens")
                        .and_then(|v| v.as_u64());
                }
                Vec::new()
            }
            "content_block_start" => {
                let index = value.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
                let block = value.get("content_block");
                match block.and_then(|b| b.get("type")).and_then(|v| v.as_str()) {
                    Some("tool_use") => {
                        let tool_index = self.next_tool_index;
                        self.next_tool_index += 1;
                        self.blocks.insert(index, BlockKind::Tool { tool_index });
                        let id = block
                            .and_then(|b| b.get("id"))
                            .and_then(|v| v.as_str())
                            .unwrap_or("")
                            .to_string();
                        let name = block
                            .and_then(|b| b.get("name"))
                            .and_then(|v| v.as_str())
                            .unwrap_or("")
                            .to_string();
                        vec![SseFrame::Delta {
                            content: None,
                            reasoning: None,
                            tool_calls: Some(vec![ToolCallChunk {
                                index: tool_index,
                                id: Some(id),
                                call_type: "function".to_string(),
                                function: FunctionCallChunk {
                                    name: Some(name),
                                    arguments: String::new(),
                                },
                            }]),
                        }]
                    }
                    Some("thinking") => {
                        self.blocks.insert(index, BlockKind::Thinking);
                        Vec::new()
                    }
                    _ => {
                        self.blocks.insert(index, BlockKind::Text);
                        Vec::new()
                    }
                }
            }
            "content_block_delta" => {
                let index = value.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
                let delta = value.get("delta");
                match delta.and_then(|d| d.get("type")).and_then(|v| v.as_str()) {
                    Some("text_delta") => delta
                        .and_then(|d| d.get("text"))
                        .and_then(|v| v.as_str())
                        .filter(|s| !s.is_empty())
                        .map(|text| {
                            vec![SseFrame::Delta {
                                content: Some(text.to_string()),
                                reasoning: None,
                                tool_calls: None,
                            }]
                        })
                        .unwrap_or_default(),
                    Some("thinking_delta") => delta
                        .and_then(|d| d.get("thinking"))
                        .and_then(|v| v.as_str())
                        .filter(|s| !s.is_empty())
                        .map(|text| {
                            vec![SseFrame::Delta {
                                content: None,
                                reasoning: Some(text.to_string()),
                                tool_calls: None,
                            }]
                        })
                        .unwrap_or_default(),
                    Some("input_json_delta") => {
                        let Some(BlockKind::Tool { tool_index }) =
                            self.blocks.get(&index).copied()
                        else {
                            return Vec::new();
                        };
                        let partial = delta
                            .and_then(|d| d.get("partial_json"))
                            .and_then(|v| v.as_str())
                            .unwrap_or("");
                        vec![SseFrame::Delta {
                            content: None,
                            reasoning: None,
                            tool_calls: Some(vec![ToolCallChunk {
                                index: tool_index,
                                id: None,
                                call_type: "function".to_string(),
                                function: FunctionCallChunk {
                                    name: None,
                                    arguments: partial.to_string(),
                                },
                            }]),
                        }]
                    }
                    _ => Vec::new(),
                }
            }
            "message_delta" => {
                if let Some(reason) = value
                    .get("delta")
                    .and_then(|d| d.get("stop_reason"))
                    .and_then(|v| v.as_str())
                {
                    self.stop_reason = Some(parse_stop_reason(reason));
                }
                if let Some(output) = value
                    .get("usage")
                    .and_then(|u| u.get("output_tokens"))
                    .and_then(|v| v.as_u64())
                {
                    self.output_tokens = output;
                }
                Vec::new()
            }
            "message_stop" => self.terminal_frames(),
            "error" => {
                let message = value
                    .get("error")
                    .and_then(|e| e.get("message"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("upstream stream error")
                    .to_string();
                vec![SseFrame::Error {
                    code: "upstream_error".to_string(),
                    message,
                }]
            }
            _ => Vec::new(),
        }
    }

    pub fn finish(&mut self) -> Option<SseFrame> {
        self.terminal_frames().into_iter().next()
    }

    fn terminal_frames(&mut self) -> Vec<SseFrame> {
        if self.done_emitted {
            return Vec::new();
        }
        self.done_emitted = true;
        vec![SseFrame::Done {
            finish_reason: self.stop_reason.unwrap_or(FinishReason::Stop),
            usage: Usage::from_counts(
                self.input_tokens,
                self.output_tokens,
                None,
                None,
                self.cached_tokens,
            ),
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Catalog, ProviderId};
    use crate::credentials::CredentialSource;

    fn credential() -> Credential {
        Credential {
            secret: "ant-key".to_string(),
            source: CredentialSource::Gateway,
            base_url_override: None,
            bedrock_region: None,
            azure: None,
        }
    }

    fn binding() -> ProviderBinding {
        let catalog = Catalog::builtin();
        let (entry, _) = catalog.lookup("claude-3-5-sonnet").unwrap();
        entry.binding(ProviderId::Anthropic).unwrap().clone()
    }

    fn request() -> NormalizedRequest {
        NormalizedRequest {
            model: "claude-3-5-sonnet".to_string(),
            messages: vec![
                ChatMessage::text(Role::System, "S"),
                ChatMessage::text(Role::User, "U"),
            ],
            stream: None,
            temperature: None,
            top_p: None,
            max_tokens: None,
            stop: None,
            seed: None,
            response_format: None,
            tools: None,
            tool_choice: None,
            parallel_tool_calls: None,
            provider: None,
            extra: Map::new(),
        }
    }

    #[test]
    fn system_splits_out_and_max_tokens_defaults() {
        let wire = build_request(&request(), &binding(), &credential(), false).unwrap();
        assert_eq!(wire.url, "https://api.anthropic.com/v1/messages");
        assert_eq!(wire.body["system"], "S");
        assert_eq!(wire.body["max_tokens"], DEFAULT_MAX_TOKENS);
        let messages = wire.body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["role"], "user");
        assert_eq!(messages[0]["content"][0]["text"], "U");
        assert!(matches!(wire.auth, WireAuth::Header { name: "x-api-key", .. }));
        assert!(wire
            .extra_headers
            .iter()
            .any(|(name, value)| *name == "anthropic-version" && value == ANTHROPIC_VERSION));
    }

    #[test]
    fn max_tokens_capped_by_binding_limit() {
        let mut req = request();
        req.max_tokens = Some(1_000_000);
        let wire = build_request(&req, &binding(), &credential(), false).unwrap();
        assert_eq!(wire.body["max_tokens"], binding().max_output_tokens);
    }

    #[test]
    fn stop_reasons_translate() {
        assert_eq!(parse_stop_reason("end_turn"), FinishReason::Stop);
        assert_eq!(parse_stop_reason("tool_use"), FinishReason::ToolCalls);
        assert_eq!(parse_stop_reason("max_tokens"), FinishReason::Length);
        assert_eq!(parse_stop_reason("anything_else"), FinishReason::Stop);
    }

    #[test]
    fn response_maps_usage_and_stop_reason() {
        let parsed = parse_response(&serde_json::json!({
            "id": "msg_1",
            "model": "claude-3-5-sonnet-20241022",
            "content": [{"type": "text", "text": "hello"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 2, "output_tokens": 3}
        }))
        .unwrap();
        assert_eq!(parsed.choices[0].finish_reason, FinishReason::Stop);
        assert_eq!(parsed.choices[0].message.content.as_deref(), Some("hello"));
        assert_eq!(parsed.usage.prompt_tokens, 2);
        assert_eq!(parsed.usage.completion_tokens, 3);
        assert_eq!(parsed.usage.total_tokens, 5);
    }

    #[test]
    fn tool_use_blocks_become_tool_calls() {
        let parsed = parse_response(&serde_json::json!({
            "id": "msg_2",
            "content": [
                {"type": "thinking", "thinking": "hmm"},
                {"type": "tool_use", "id": "toolu_1", "name": "get_weather", "input": {"city": "SF"}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 8, "output_tokens": 4}
        }))
        .unwrap();
        let message = &parsed.choices[0].message;
        assert_eq!(message.reasoning.as_deref(), Some("hmm"));
        let calls = message.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].function.name, "get_weather");
        assert_eq!(calls[0].function.arguments, r#"{"city":"SF"}"#);
        assert_eq!(parsed.choices[0].finish_reason, FinishReason::ToolCalls);
    }

    #[test]
    fn assistant_tool_calls_round_trip_to_tool_use() {
        let mut req = request();
        req.messages = vec![
            ChatMessage {
                role: Role::Assistant,
                content: None,
                name: None,
                reasoning: None,
                tool_calls: Some(vec![ToolCall {
                    id: "call_1".to_string(),
                    call_type: "function".to_string(),
                    function: FunctionCall {
                        name: "lookup".to_string(),
                        arguments: r#"{"q":1}"#.to_string(),
                    },
                }]),
                tool_call_id: None,
            },
            ChatMessage {
                role: Role::Tool,
                content: Some(MessageContent::Text("42".to_string())),
                name: None,
                reasoning: None,
                tool_calls: None,
                tool_call_id: Some("call_1".to_string()),
            },
        ];
        let wire = build_request(&req, &binding(), &credential(), false).unwrap();
        let messages = wire.body["messages"].as_array().unwrap();
        assert_eq!(messages[0]["content"][0]["type"], "tool_use");
        assert_eq!(messages[1]["content"][0]["type"], "tool_result");
        assert_eq!(messages[1]["content"][0]["tool_use_id"], "call_1");
    }

    #[test]
    fn stream_accumulates_usage_across_frames() {
        let mut state = StreamState::default();
        state.on_event(
            "message_start",
            &serde_json::json!({
                "type": "message_start",
                "message": {"usage": {"input_tokens": 10}}
            })
            .to_string(),
        );
        state.on_event(
            "content_block_start",
            &serde_json::json!({
                "type": "content_block_start", "index": 0,
                "content_block": {"type": "text", "text": ""}
            })
            .to_string(),
        );
        let deltas = state.on_event(
            "content_block_delta",
            &serde_json::json!({
                "type": "content_block_delta", "index": 0,
                "delta": {"type": "text_delta", "text": "hi"}
            })
            .to_string(),
        );
        assert!(
            matches!(&deltas[0], SseFrame::Delta { content: Some(c), .. } if c == "hi")
        );
        state.on_event(
            "message_delta",
            &serde_json::json!({
                "type": "message_delta",
                "delta": {"stop_reason": "end_turn"},
                "usage": {"output_tokens": 7}
            })
            .to_string(),
        );
        let done = state.on_event(
            "message_stop",
            &serde_json::json!({"type": "message_stop"}).to_string(),
        );
        match &done[0] {
            SseFrame::Done {
                finish_reason,
                usage,
            } => {
                assert_eq!(*finish_reason, FinishReason::Stop);
                assert_eq!(usage.prompt_tokens, 10);
                assert_eq!(usage.completion_tokens, 7);
                assert_eq!(usage.total_tokens, 17);
            }
            other => panic!("expected terminal frame, got {other:?}"),
        }
        assert!(state.finish().is_none());
    }

    #[test]
    fn tool_stream_chunks_keep_block_indices() {
        let mut state = StreamState::default();
        let start = state.on_event(
            "content_block_start",
            &serde_json::json!({
                "type": "content_block_start", "index": 1,
                "content_block": {"type": "tool_use", "id": "toolu_1", "name": "lookup"}
            })
            .to_string(),
        );
        match &start[0] {
            SseFrame::Delta {
                tool_calls: Some(calls),
                ..
            } => {
                assert_eq!(calls[0].id.as_deref(), Some("toolu_1"));
                assert_eq!(calls[0].function.name.as_deref(), Some("lookup"));
            }
            other => panic!("expected tool chunk, got {other:?}"),
        }
        let args = state.on_event(
            "content_block_delta",
            &serde_json::json!({
                "type": "content_block_delta", "index": 1,
                "delta": {"type": "input_json_delta", "partial_json": "{\"q\":"}
            })
            .to_string(),
        );
        match &args[0] {
            SseFrame::Delta {
                tool_calls: Some(calls),
                ..
            } => assert_eq!(calls[0].function.arguments, "{\"q\":"),
            other => panic!("expected tool chunk, got {other:?}"),
        }
    }
}
