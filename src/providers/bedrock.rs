use crate::catalog::ProviderBinding;
use crate::credentials::Credential;
use crate::providers::{anthropic, ParsedResponse};
use crate::upstream::{WireAuth, WireRequest};
use crate::wire::NormalizedRequest;
use serde_json::Value;

const BEDROCK_ANTHROPIC_VERSION: &str = "bedrock-2023-05-31";

/// Bedrock invokes the model family's native payload. Anthropic models are
/// the only family bound through Bedrock in the catalog; their body is the
/// messages shape minus `model`/`stream` plus `anthropic_version`, posted to
/// the region-prefixed runtime host.
pub fn build_request(
    req: &NormalizedRequest,
    binding: &ProviderBinding,
    credential: &Credential,
) -> Result<WireRequest, String> {
    if !binding.provider_model.starts_with("anthropic.") {
        return Err(format!(
            "unsupported bedrock model family: {}",
            binding.provider_model
        ));
    }
    let region = credential
        .bedrock_region
        .as_deref()
        .ok_or_else(|| "bedrock credential missing region".to_string())?;

    let mut body = anthropic::encode_body(req, binding);
    body.insert(
        "anthropic_version".to_string(),
        Value::String(BEDROCK_ANTHROPIC_VERSION.to_string()),
    );

    let host = credential
        .base_url_override
        .clone()
        .unwrap_or_else(|| format!("https://bedrock-runtime.{region}.amazonaws.com"));
    Ok(WireRequest {
        url: format!(
            "{}/model/{}/invoke",
            host.trim_end_matches('/'),
            binding.provider_model
        ),
        body: Value::Object(body),
        auth: WireAuth::Bearer(credential.secret.clone()),
        extra_headers: Vec::new(),
    })
}

pub fn parse_response(value: &Value) -> Result<ParsedResponse, String> {
    anthropic::parse_response(value)
}
