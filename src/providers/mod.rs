use crate::catalog::{ProviderBinding, ProviderFamily, ProviderId};
use crate::credentials::Credential;
use crate::upstream::WireRequest;
use crate::wire::{FinishReason, NormalizedRequest, SseFrame, Usage};
use serde_json::Value;

pub mod anthropic;
pub mod bedrock;
pub mod google;
pub mod openai;

/// Provider response reduced to the normalized core. The dispatch engine
/// supplies id fallbacks, the echoed model string, and metadata.
#[derive(Debug, Clone)]
pub struct ParsedResponse {
    pub id: Option<String>,
    pub model: Option<String>,
    pub choices: Vec<crate::wire::Choice>,
    pub usage: Usage,
}

pub fn family(provider: ProviderId) -> ProviderFamily {
    crate::catalog::provider_info(provider).family
}

/// Translate the normalized request into the provider's wire shape. Pure;
/// the single upstream call happens in `upstream`.
pub fn build_request(
    req: &NormalizedRequest,
    binding: &ProviderBinding,
    credential: &Credential,
    stream: bool,
) -> Result<WireRequest, String> {
    match family(binding.provider) {
        ProviderFamily::OpenaiCompatible => openai::build_request(req, binding, credential, stream),
        ProviderFamily::Anthropic => anthropic::build_request(req, binding, credential, stream),
        ProviderFamily::Google => google::build_request(req, binding, credential, stream),
        ProviderFamily::Bedrock => bedrock::build_request(req, binding, credential),
    }
}

pub fn parse_response(provider: ProviderId, value: &Value) -> Result<ParsedResponse, String> {
    match family(provider) {
        ProviderFamily::OpenaiCompatible => openai::parse_response(value),
        ProviderFamily::Anthropic => anthropic::parse_response(value),
        ProviderFamily::Google => google::parse_response(value),
        ProviderFamily::Bedrock => bedrock::parse_response(value),
    }
}

/// Reject requests whose required features the binding lacks, before any
/// upstream call is made.
pub fn capability_check(req: &NormalizedRequest, binding: &ProviderBinding) -> Result<(), String> {
    let caps = &binding.capabilities;
    if req.messages.iter().any(|m| m.has_image()) && !caps.vision {
        return Err(format!(
            "{} binding for {} does not support vision input",
            binding.provider.as_str(),
            binding.provider_model
        ));
    }
    if req.tools.as_ref().is_some_and(|t| !t.is_empty()) && !caps.tools {
        return Err(format!(
            "{} binding for {} does not support tools",
            binding.provider.as_str(),
            binding.provider_model
        ));
    }
    if req.parallel_tool_calls == Some(true) && !caps.parallel_tool_calls {
        return Err(format!(
            "{} binding for {} does not support parallel tool calls",
            binding.provider.as_str(),
            binding.provider_model
        ));
    }
    if req.response_format.as_ref().is_some_and(|f| f.wants_json()) && !caps.json_output {
        return Err(format!(
            "{} binding for {} does not support json output",
            binding.provider.as_str(),
            binding.provider_model
        ));
    }
    Ok(())
}

/// Stateful per-family normalization of upstream SSE into canonical frames.
/// `on_event` maps one upstream event; `finish` closes the stream with the
/// terminal frame when the provider never announced one explicitly.
pub enum StreamTranslator {
    Openai(openai::StreamState),
    Anthropic(anthropic::StreamState),
    Google(google::StreamState),
}

impl StreamTranslator {
    pub fn new(provider: ProviderId) -> Self {
        match family(provider) {
            ProviderFamily::OpenaiCompatible => Self::Openai(openai::StreamState::default()),
            // Bedrock's anthropic payloads share the Anthropic event shape.
            ProviderFamily::Anthropic | ProviderFamily::Bedrock => {
                Self::Anthropic(anthropic::StreamState::default())
            }
            ProviderFamily::Google => Self::Google(google::StreamState::default()),
        }
    }

    pub fn on_event(&mut self, event: &str, data: &str) -> Vec<SseFrame> {
        match self {
            Self::Openai(state) => state.on_event(event, data),
            Self::Anthropic(state) => state.on_event(event, data),
            Self::Google(state) => state.on_event(event, data),
        }
    }

    pub fn finish(&mut self) -> Option<SseFrame> {
        match self {
            Self::Openai(state) => state.finish(),
            Self::Anthropic(state) => state.finish(),
            Self::Google(state) => state.finish(),
        }
    }
}

pub(crate) fn parse_openai_finish_reason(raw: &str) -> FinishReason {
    match raw {
        "length" => FinishReason::Length,
        "tool_calls" | "function_call" => FinishReason::ToolCalls,
        "content_filter" => FinishReason::ContentFilter,
        _ => FinishReason::Stop,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{BindingPolicy, Catalog};
    use crate::wire::{ChatMessage, ContentPart, ImageUrl, MessageContent, Role};
    use serde_json::Map;

    fn request_with(messages: Vec<ChatMessage>) -> NormalizedRequest {
        NormalizedRequest {
            model: "m".to_string(),
            messages,
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
    fn vision_request_rejected_on_text_only_binding() {
        let catalog = Catalog::builtin();
        let (entry, _) = catalog.lookup("llama-3.1-70b-instruct").unwrap();
        let binding = catalog.list_bindings(entry, &BindingPolicy::default())[0];

        let image_message = ChatMessage {
            role: Role::User,
            content: Some(MessageContent::Parts(vec![ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: "https://example.com/cat.png".to_string(),
                    detail: None,
                },
            }])),
            name: None,
            reasoning: None,
            tool_calls: None,
            tool_call_id: None,
        };
        let req = request_with(vec![image_message]);
        assert!(capability_check(&req, binding).is_err());

        let plain = request_with(vec![ChatMessage::text(Role::User, "hi")]);
        assert!(capability_check(&plain, binding).is_ok());
    }

    #[test]
    fn unknown_finish_reasons_default_to_stop() {
        assert_eq!(parse_openai_finish_reason("weird"), FinishReason::Stop);
        assert_eq!(parse_openai_finish_reason("length"), FinishReason::Length);
        assert_eq!(
            parse_openai_finish_reason("tool_calls"),
            FinishReason::ToolCalls
        );
    }
}
