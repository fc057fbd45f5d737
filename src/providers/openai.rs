use crate::catalog::{provider_info, AuthScheme, ProviderBinding, ProviderId};
use crate::credentials::Credential;
use crate::providers::{parse_openai_finish_reason, ParsedResponse};
use crate::upstream::{join_url, WireAuth, WireRequest};
use crate::wire::{
    AssistantMessage, ChatMessage, Choice, FinishReason, FunctionCall, FunctionCallChunk,
    NormalizedRequest, SseFrame, ToolCall, ToolCallChunk, Usage,
};
use serde_json::{json, Map, Value};

/// OpenAI chat-completions translation, shared by every OpenAI-compatible
/// provider (OpenAI, Azure, Groq, Together, Inference.net, xAI, DeepSeek,
/// Mistral). Differences are confined to URL shape and auth placement.
pub fn build_request(
    req: &NormalizedRequest,
    binding: &ProviderBinding,
    credential: &Credential,
    stream: bool,
) -> Result<WireRequest, String> {
    let info = provider_info(binding.provider);

    let url = if binding.provider == ProviderId::Azure {
        let azure = credential
            .azure
            .as_ref()
            .ok_or_else(|| "azure credential missing resource options".to_string())?;
        let host = credential
            .base_url_override
            .clone()
            .unwrap_or_else(|| format!("https://{}.openai.azure.com", azure.resource));
        format!(
            "{}/openai/deployments/{}/chat/completions?api-version={}",
            host.trim_end_matches('/'),
            binding.provider_model,
            azure.api_version
        )
    } else {
        let base = credential
            .base_url_override
            .as_deref()
            .unwrap_or(info.base_url);
        join_url(base, "/v1/chat/completions")
    };

    let mut body = json!({
        "model": binding.provider_model,
        "messages": encode_messages(&req.messages),
    });
    let obj = body.as_object_mut().expect("chat request object");
    if let Some(temperature) = req.temperature {
        obj.insert("temperature".to_string(), Value::from(temperature));
    }
    if let Some(top_p) = req.top_p {
        obj.insert("top_p".to_string(), Value::from(top_p));
    }
    if let Some(max_tokens) = req.max_tokens {
        obj.insert("max_tokens".to_string(), Value::from(max_tokens));
    }
    if let Some(stop) = &req.stop {
        obj.insert("stop".to_string(), stop.clone());
    }
    if let Some(seed) = req.seed {
        obj.insert("seed".to_string(), Value::from(seed));
    }
    if let Some(format) = &req.response_format {
        obj.insert(
            "response_format".to_string(),
            serde_json::to_value(format).map_err(|e| e.to_string())?,
        );
    }
    if let Some(tools) = &req.tools {
        obj.insert(
            "tools".to_string(),
            serde_json::to_value(tools).map_err(|e| e.to_string())?,
        );
    }
    if let Some(choice) = &req.tool_choice {
        obj.insert("tool_choice".to_string(), choice.clone());
    }
    if let Some(parallel) = req.parallel_tool_calls {
        obj.insert("parallel_tool_calls".to_string(), Value::Bool(parallel));
    }
    if stream {
        obj.insert("stream".to_string(), Value::Bool(true));
        obj.insert("stream_options".to_string(), json!({"include_usage": true}));
    }

    let auth = match info.auth {
        AuthScheme::Bearer | AuthScheme::AwsBearer => WireAuth::Bearer(credential.secret.clone()),
        AuthScheme::ApiKeyHeader { header } => WireAuth::Header {
            name: header,
            value: credential.secret.clone(),
        },
        AuthScheme::QueryKey { param } => WireAuth::Query {
            param,
            value: credential.secret.clone(),
        },
    };

    Ok(WireRequest {
        url,
        body,
        auth,
        extra_headers: Vec::new(),
    })
}

fn encode_messages(messages: &[ChatMessage]) -> Vec<Value> {
    messages
        .iter()
        .map(|message| {
            let mut obj = Map::new();
            obj.insert(
                "role".to_string(),
                serde_json::to_value(message.role).unwrap_or(Value::Null),
            );
            obj.insert(
                "content".to_string(),
                serde_json::to_value(&message.content).unwrap_or(Value::Null),
            );
            if let Some(name) = &message.name {
                obj.insert("name".to_string(), Value::String(name.clone()));
            }
            if let Some(tool_calls) = &message.tool_calls {
                obj.insert(
                    "tool_calls".to_string(),
                    serde_json::to_value(tool_calls).unwrap_or(Value::Null),
                );
            }
            if let Some(tool_call_id) = &message.tool_call_id {
                obj.insert(
                    "tool_call_id".to_string(),
                    Value::String(tool_call_id.clone()),
                );
            }
            Value::Object(obj)
        })
        .collect()
}

pub fn parse_response(value: &Value) -> Result<ParsedResponse, String> {
    let obj = value
        .as_object()
        .ok_or_else(|| "chat response must be an object".to_string())?;
    let raw_choices = obj
        .get("choices")
        .and_then(|v| v.as_array())
        .filter(|arr| !arr.is_empty())
        .ok_or_else(|| "missing choices".to_string())?;

    let mut choices = Vec::new();
    for (index, raw) in raw_choices.iter().enumerate() {
        let msg = raw
            .get("message")
            .and_then(|v| v.as_object())
            .ok_or_else(|| format!("missing choices[{index}].message"))?;
        let mut message = AssistantMessage::new(
            msg.get("content")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
        );
        message.reasoning = msg
            .get("reasoning")
            .or_else(|| msg.get("reasoning_content"))
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string());
        message.tool_calls = parse_tool_calls(msg.get("tool_calls"));
        message.images = msg
            .get("images")
            .and_then(|v| v.as_array())
            .filter(|arr| !arr.is_empty())
            .cloned();
        choices.push(Choice {
            index: index as u32,
            message,
            finish_reason: raw
                .get("finish_reason")
                .and_then(|v| v.as_str())
                .map(parse_openai_finish_reason)
                .unwrap_or(FinishReason::Stop),
        });
    }

    Ok(ParsedResponse {
        id: obj.get("id").and_then(|v| v.as_str()).map(|s| s.to_string()),
        model: obj
            .get("model")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        choices,
        usage: parse_usage(obj.get("usage")),
    })
}

pub(crate) fn parse_tool_calls(raw: Option<&Value>) -> Option<Vec<ToolCall>> {
    let arr = raw?.as_array()?;
    let mut out = Vec::new();
    for item in arr {
        let id = item.get("id").and_then(|v| v.as_str()).unwrap_or("");
        let function = item.get("function")?;
        let name = function.get("name").and_then(|v| v.as_str()).unwrap_or("");
        if id.is_empty() || name.is_empty() {
            continue;
        }
        let arguments = match function.get("arguments") {
            Some(Value::String(s)) => s.clone(),
            Some(other) => serde_json::to_string(other).unwrap_or_else(|_| "{}".to_string()),
            None => "{}".to_string(),
        };
        out.push(ToolCall {
            id: id.to_string(),
            call_type: "function".to_string(),
            function: FunctionCall {
                name: name.to_string(),
                arguments,
            },
        });
    }
    (!out.is_empty()).then_some(out)
}

pub(crate) fn parse_usage(raw: Option<&Value>) -> Usage {
    let Some(usage) = raw.and_then(|v| v.as_object()) else {
        return Usage::from_counts(0, 0, None, None, None);
    };
    Usage::from_counts(
        usage
            .get("prompt_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
        usage
            .get("completion_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
        usage.get("total_tokens").and_then(|v| v.as_u64()),
        usage
            .get("completion_tokens_details")
            .and_then(|v| v.get("reasoning_tokens"))
            .and_then(|v| v.as_u64()),
        usage
            .get("prompt_tokens_details")
            .and_then(|v| v.get("cached_tokens"))
            .and_then(|v| v.as_u64()),
    )
}

/// Chunk-by-chunk normalization of an OpenAI-compatible SSE stream.
#[derive(Default)]
pub struct StreamState {
    finish: Option<FinishReason>,
    usage: Option<Usage>,
    completion_chars: u64,
    done_emitted: bool,
}

impl StreamState {
    pub fn on_event(&mut self, _event: &str, data: &str) -> Vec<SseFrame> {
        if data.trim() == "[DONE]" {
            return self.terminal_frames();
        }
        let Ok(chunk) = serde_json::from_str::<Value>(data) else {
            return Vec::new();
        };

        if chunk.get("usage").is_some_and(|u| u.is_object()) {
            self.usage = Some(parse_usage(chunk.get("usage")));
        }

        let Some(choice) = chunk
            .get("choices")
            .and_then(|v| v.as_array())
            .and_then(|arr| arr.first())
        else {
            return Vec::new();
        };
        if let Some(reason) = choice.get("finish_reason").and_then(|v| v.as_str()) {
            self.finish = Some(parse_openai_finish_reason(reason));
        }

        let Some(delta) = choice.get("delta").and_then(|v| v.as_object()) else {
            return Vec::new();
        };
        let content = delta
            .get("content")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string());
        let reasoning = delta
            .get("reasoning")
            .or_else(|| delta.get("reasoning_content"))
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string());
        let tool_calls = parse_tool_call_chunks(delta.get("tool_calls"));

        if let Some(content) = &content {
            self.completion_chars += content.chars().count() as u64;
        }
        if content.is_none() && reasoning.is_none() && tool_calls.is_none() {
            return Vec::new();
        }
        vec![SseFrame::Delta {
            content,
            reasoning,
            tool_calls,
        }]
    }

    pub fn finish(&mut self) -> Option<SseFrame> {
        self.terminal_frames().into_iter().next()
    }

    fn terminal_frames(&mut self) -> Vec<SseFrame> {
        if self.done_emitted {
            return Vec::new();
        }
        self.done_emitted = true;
        let usage = self.usage.clone().unwrap_or_else(|| {
            // Provider sent no usage chunk; approximate from relayed text.
            Usage::from_counts(0, self.completion_chars.div_ceil(4), None, None, None)
        });
        vec![SseFrame::Done {
            finish_reason: self.finish.unwrap_or(FinishReason::Stop),
            usage,
        }]
    }
}

fn parse_tool_call_chunks(raw: Option<&Value>) -> Option<Vec<ToolCallChunk>> {
    let arr = raw?.as_array()?;
    let mut out = Vec::new();
    for item in arr {
        let index = item.get("index").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
        let function = item.get("function");
        out.push(ToolCallChunk {
            index,
            id: item
                .get("id")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            call_type: "function".to_string(),
            function: FunctionCallChunk {
                name: function
                    .and_then(|f| f.get("name"))
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string()),
                arguments: function
                    .and_then(|f| f.get("arguments"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string(),
            },
        });
    }
    (!out.is_empty()).then_some(out)
}
