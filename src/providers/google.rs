use crate::catalog::{provider_info, ProviderBinding};
use crate::credentials::Credential;
use crate::providers::ParsedResponse;
use crate::upstream::{join_url, WireAuth, WireRequest};
use crate::wire::{
    AssistantMessage, ChatMessage, Choice, ContentPart, FinishReason, FunctionCall,
    MessageContent, NormalizedRequest, Role, SseFrame, ToolCall, Usage,
};
use serde_json::{json, Map, Value};

pub fn build_request(
    req: &NormalizedRequest,
    binding: &ProviderBinding,
    credential: &Credential,
    stream: bool,
) -> Result<WireRequest, String> {
    let info = provider_info(binding.provider);
    let verb = if stream {
        "streamGenerateContent?alt=sse"
    } else {
        "generateContent"
    };
    let base = credential
        .base_url_override
        .as_deref()
        .unwrap_or(info.base_url);
    let url = join_url(
        base,
        &format!("/v1beta/models/{}:{}", binding.provider_model, verb),
    );

    let mut system_texts: Vec<String> = Vec::new();
    let mut contents: Vec<Value> = Vec::new();
    for message in &req.messages {
        match message.role {
            Role::System => {
                let text = message.content_text();
                if !text.is_empty() {
                    system_texts.push(text);
                }
            }
            Role::Tool => {
                if let Some(item) = encode_tool_response(message) {
                    contents.push(item);
                }
            }
            Role::User | Role::Assistant => contents.push(encode_content(message)),
        }
    }

    let mut body = Map::new();
    body.insert("contents".to_string(), Value::Array(contents));
    if !system_texts.is_empty() {
        body.insert(
            "systemInstruction".to_string(),
            json!({ "parts": [{ "text": system_texts.join("\n\n") }] }),
        );
    }

    let mut generation = Map::new();
    if let Some(temperature) = req.temperature {
        generation.insert("temperature".to_string(), Value::from(temperature));
    }
    if let Some(top_p) = req.top_p {
        generation.insert("topP".to_string(), Value::from(top_p));
    }
    if let Some(max_tokens) = req.max_tokens {
        generation.insert("maxOutputTokens".to_string(), Value::from(max_tokens));
    }
    if let Some(seed) = req.seed {
        generation.insert("seed".to_string(), Value::from(seed));
    }
    if let Some(stop) = &req.stop {
        let sequences = match stop {
            Value::String(s) => vec![Value::String(s.clone())],
            Value::Array(arr) => arr.clone(),
            _ => Vec::new(),
        };
        if !sequences.is_empty() {
            generation.insert("stopSequences".to_string(), Value::Array(sequences));
        }
    }
    if req.response_format.as_ref().is_some_and(|f| f.wants_json()) {
        generation.insert(
            "responseMimeType".to_string(),
            Value::String("application/json".to_string()),
        );
    }
    if !generation.is_empty() {
        body.insert("generationConfig".to_string(), Value::Object(generation));
    }

    if let Some(tools) = &req.tools {
        let declarations: Vec<Value> = tools
            .iter()
            .map(|tool| {
                json!({
                    "name": tool.function.name,
                    "description": tool.function.description,
                    "parameters": tool.function.parameters,
                })
            })
            .collect();
        body.insert(
            "tools".to_string(),
            json!([{ "functionDeclarations": declarations }]),
        );
    }
    if let Some(choice) = &req.tool_choice {
        let mode = match choice.as_str() {
            Some("none") => "NONE",
            Some("required") => "ANY",
            _ => "AUTO",
        };
        body.insert(
            "toolConfig".to_string(),
            json!({ "functionCallingConfig": { "mode": mode } }),
        );
    }

    let auth = match info.auth {
        crate::catalog::AuthScheme::ApiKeyHeader { header } => WireAuth::Header {
            name: header,
            value: credential.secret.clone(),
        },
        crate::catalog::AuthScheme::QueryKey { param } => WireAuth::Query {
            param,
            value: credential.secret.clone(),
        },
        _ => WireAuth::Bearer(credential.secret.clone()),
    };

    Ok(WireRequest {
        url,
        body: Value::Object(body),
        auth,
        extra_headers: Vec::new(),
    })
}

fn encode_content(message: &ChatMessage) -> Value {
    let role = match message.role {
        Role::Assistant => "model",
        _ => "user",
    };
    let mut parts: Vec<Value> = Vec::new();
    match &message.content {
        Some(MessageContent::Text(text)) if !text.is_empty() => {
            parts.push(json!({ "text": text }));
        }
        Some(MessageContent::Parts(content_parts)) => {
            for part in content_parts {
                match part {
                    ContentPart::Text { text } if !text.is_empty() => {
                        parts.push(json!({ "text": text }));
                    }
                    ContentPart::ImageUrl { image_url } => {
                        parts.push(encode_image_part(&image_url.url));
                    }
                    ContentPart::Text { .. } => {}
                }
            }
        }
        _ => {}
    }
    if let Some(tool_calls) = &message.tool_calls {
        for call in tool_calls {
            let args = serde_json::from_str::<Value>(&call.function.arguments)
                .unwrap_or_else(|_| json!({}));
            parts.push(json!({
                "functionCall": { "name": call.function.name, "args": args }
            }));
        }
    }
    if parts.is_empty() {
        parts.push(json!({ "text": "" }));
    }
    json!({ "role": role, "parts": parts })
}

fn encode_tool_response(message: &ChatMessage) -> Option<Value> {
    // Gemini correlates tool results by function name, carried in `name`.
    let name = message.name.as_deref()?;
    let text = message.content_text();
    let response = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));
    Some(json!({
        "role": "user",
        "parts": [{
            "functionResponse": { "name": name, "response": { "result": response } }
        }]
    }))
}

fn encode_image_part(url: &str) -> Value {
    if let Some(rest) = url.strip_prefix("data:") {
        if let Some((mime_type, data)) = rest.split_once(";base64,") {
            return json!({ "inlineData": { "mimeType": mime_type, "data": data } });
        }
    }
    json!({ "fileData": { "fileUri": url } })
}

pub fn parse_response(value: &Value) -> Result<ParsedResponse, String> {
    let obj = value
        .as_object()
        .ok_or_else(|| "generateContent response must be an object".to_string())?;
    let candidate = obj
        .get("candidates")
        .and_then(|v| v.as_array())
        .and_then(|arr| arr.first())
        .ok_or_else(|| "missing candidates".to_string())?;

    let mut text = String::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();
    if let Some(parts) = candidate
        .get("content")
        .and_then(|c| c.get("parts"))
        .and_then(|v| v.as_array())
    {
        for part in parts {
            if let Some(t) = part.get("text").and_then(|v| v.as_str()) {
                text.push_str(t);
            }
            if let Some(call) = part.get("functionCall") {
                let name = call.get("name").and_then(|v| v.as_str()).unwrap_or("");
                if !name.is_empty() {
                    let arguments = call
                        .get("args")
                        .map(|v| serde_json::to_string(v).unwrap_or_else(|_| "{}".to_string()))
                        .unwrap_or_else(|| "{}".to_string());
                    tool_calls.push(ToolCall {
                        id: format!("call_{}", tool_calls.len()),
                        call_type: "function".to_string(),
                        function: FunctionCall {
                            name: name.to_string(),
                            arguments,
                        },
                    });
                }
            }
        }
    }

    let finish_reason = if !tool_calls.is_empty() {
        FinishReason::ToolCalls
    } else {
        candidate
            .get("finishReason")
            .and_then(|v| v.as_str())
            .map(parse_finish_reason)
            .unwrap_or(FinishReason::Stop)
    };

    let mut message = AssistantMessage::new((!text.is_empty()).then_some(text));
    message.tool_calls = (!tool_calls.is_empty()).then_some(tool_calls);

    Ok(ParsedResponse {
        id: None,
        model: obj
            .get("modelVersion")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        choices: vec![Choice {
            index: 0,
            message,
            finish_reason,
        }],
        usage: parse_usage_metadata(obj.get("usageMetadata")),
    })
}

pub(crate) fn parse_finish_reason(raw: &str) -> FinishReason {
    match raw {
        "MAX_TOKENS" => FinishReason::Length,
        "SAFETY" | "PROHIBITED_CONTENT" | "BLOCKLIST" => FinishReason::ContentFilter,
        _ => FinishReason::Stop,
    }
}

fn parse_usage_metadata(raw: Option<&Value>) -> Usage {
    let Some(usage) = raw.and_then(|v| v.as_object()) else {
        return Usage::from_counts(0, 0, None, None, None);
    };
    Usage::from_counts(
        usage
            .get("promptTokenCount")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
        usage
            .get("candidatesTokenCount")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
        usage.get("totalTokenCount").and_then(|v| v.as_u64()),
        usage.get("thoughtsTokenCount").and_then(|v| v.as_u64()),
        usage.get("cachedContentTokenCount").and_then(|v| v.as_u64()),
    )
}

/// Gemini streams `generateContent`-shaped chunks; the last one carries the
/// finish reason and usage metadata.
#[derive(Default)]
pub struct StreamState {
    finish: Option<FinishReason>,
    usage: Option<Usage>,
    done_emitted: bool,
}

impl StreamState {
    pub fn on_event(&mut self, _event: &str, data: &str) -> Vec<SseFrame> {
        let Ok(chunk) = serde_json::from_str::<Value>(data) else {
            return Vec::new();
        };
        if chunk.get("usageMetadata").is_some() {
            self.usage = Some(parse_usage_metadata(chunk.get("usageMetadata")));
        }
        let Some(candidate) = chunk
            .get("candidates")
            .and_then(|v| v.as_array())
            .and_then(|arr| arr.first())
        else {
            return Vec::new();
        };
        if let Some(reason) = candidate.get("finishReason").and_then(|v| v.as_str()) {
            self.finish = Some(parse_finish_reason(reason));
        }
        let mut text = String::new();
        if let Some(parts) = candidate
            .get("content")
            .and_then(|c| c.get("parts"))
            .and_then(|v| v.as_array())
        {
            for part in parts {
                if let Some(t) = part.get("text").and_then(|v| v.as_str()) {
                    text.push_str(t);
                }
            }
        }
        if text.is_empty() {
            return Vec::new();
        }
        vec![SseFrame::Delta {
            content: Some(text),
            reasoning: None,
            tool_calls: None,
        }]
    }

    pub fn finish(&mut self) -> Option<SseFrame> {
        if self.done_emitted {
            return None;
        }
        self.done_emitted = true;
        Some(SseFrame::Done {
            finish_reason: self.finish.unwrap_or(FinishReason::Stop),
            usage: self
                .usage
                .clone()
                .unwrap_or_else(|| Usage::from_counts(0, 0, None, None, None)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Catalog, ProviderId};
    use crate::credentials::CredentialSource;

    fn credential() -> Credential {
        Credential {
            secret: "goog-key".to_string(),
            source: CredentialSource::Gateway,
            base_url_override: None,
            bedrock_region: None,
            azure: None,
        }
    }

    fn binding() -> ProviderBinding {
        let catalog = Catalog::builtin();
        let (entry, _) = catalog.lookup("gemini-1.5-pro").unwrap();
        entry.binding(ProviderId::Google).unwrap().clone()
    }

    fn request() -> NormalizedRequest {
        NormalizedRequest {
            model: "gemini-1.5-pro".to_string(),
            messages: vec![
                ChatMessage::text(Role::System, "be brief"),
                ChatMessage::text(Role::User, "hi"),
                ChatMessage::text(Role::Assistant, "hello"),
                ChatMessage::text(Role::User, "again"),
            ],
            stream: None,
            temperature: Some(0.2),
            top_p: None,
            max_tokens: Some(100),
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
    fn contents_use_user_and_model_roles() {
        let wire = build_request(&request(), &binding(), &credential(), false).unwrap();
        assert!(wire.url.ends_with("/v1beta/models/gemini-1.5-pro:generateContent"));
        let contents = wire.body["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 3);
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(contents[2]["role"], "user");
        assert_eq!(
            wire.body["systemInstruction"]["parts"][0]["text"],
            "be brief"
        );
        assert_eq!(wire.body["generationConfig"]["maxOutputTokens"], 100);
        assert!(matches!(
            wire.auth,
            WireAuth::Header { name: "x-goog-api-key", .. }
        ));
    }

    #[test]
    fn stream_url_requests_sse() {
        let wire = build_request(&request(), &binding(), &credential(), true).unwrap();
        assert!(wire
            .url
            .ends_with(":streamGenerateContent?alt=sse"));
    }

    #[test]
    fn response_defaults_to_stop_and_maps_usage() {
        let parsed = parse_response(&serde_json::json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "hey"}]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 4, "candidatesTokenCount": 2, "totalTokenCount": 6}
        }))
        .unwrap();
        assert_eq!(parsed.choices[0].finish_reason, FinishReason::Stop);
        assert_eq!(parsed.choices[0].message.content.as_deref(), Some("hey"));
        assert_eq!(parsed.usage.prompt_tokens, 4);
        assert_eq!(parsed.usage.total_tokens, 6);
    }

    #[test]
    fn function_calls_become_tool_calls() {
        let parsed = parse_response(&serde_json::json!({
            "candidates": [{
                "content": {"role": "model", "parts": [
                    {"functionCall": {"name": "lookup", "args": {"q": 1}}}
                ]},
                "finishReason": "STOP"
            }]
        }))
        .unwrap();
        assert_eq!(parsed.choices[0].finish_reason, FinishReason::ToolCalls);
        let calls = parsed.choices[0].message.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].function.name, "lookup");
    }

    #[test]
    fn stream_terminal_frame_carries_usage() {
        let mut state = StreamState::default();
        let deltas = state.on_event(
            "",
            &serde_json::json!({
                "candidates": [{"content": {"parts": [{"text": "par"}]}}]
            })
            .to_string(),
        );
        assert!(
            matches!(&deltas[0], SseFrame::Delta { content: Some(c), .. } if c == "par")
        );
        state.on_event(
            "",
            &serde_json::json!({
                "candidates": [{"content": {"parts": [{"text": "tial"}]}, "finishReason": "STOP"}],
                "usageMetadata": {"promptTokenCount": 3, "candidatesTokenCount": 2}
            })
            .to_string(),
        );
        match state.finish().expect("terminal frame") {
            SseFrame::Done {
                finish_reason,
                usage,
            } => {
                assert_eq!(finish_reason, FinishReason::Stop);
                assert_eq!(usage.prompt_tokens, 3);
                assert_eq!(usage.total_tokens, 5);
            }
            other => panic!("expected terminal frame, got {other:?}"),
        }
        assert!(state.finish().is_none());
    }
}
