use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Upstream providers the gateway can dispatch to. Each id maps to exactly
/// one adapter family and one gateway-owned key environment variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderId {
    Openai,
    Anthropic,
    Google,
    Bedrock,
    Groq,
    Together,
    Inference,
    Azure,
    Xai,
    Deepseek,
    Mistral,
}

impl ProviderId {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Openai => "openai",
            Self::Anthropic => "anthropic",
            Self::Google => "google",
            Self::Bedrock => "bedrock",
            Self::Groq => "groq",
            Self::Together => "together",
            Self::Inference => "inference",
            Self::Azure => "azure",
            Self::Xai => "xai",
            Self::Deepseek => "deepseek",
            Self::Mistral => "mistral",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "openai" => Some(Self::Openai),
            "anthropic" => Some(Self::Anthropic),
            "google" => Some(Self::Google),
            "bedrock" => Some(Self::Bedrock),
            "groq" => Some(Self::Groq),
            "together" => Some(Self::Together),
            "inference" => Some(Self::Inference),
            "azure" => Some(Self::Azure),
            "xai" => Some(Self::Xai),
            "deepseek" => Some(Self::Deepseek),
            "mistral" => Some(Self::Mistral),
            _ => None,
        }
    }
}

/// Adapter family a provider's wire protocol belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderFamily {
    OpenaiCompatible,
    Anthropic,
    Google,
    Bedrock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScheme {
    Bearer,
    ApiKeyHeader { header: &'static str },
    QueryKey { param: &'static str },
    /// Bedrock long-term API key sent as a bearer token.
    AwsBearer,
}

#[derive(Debug, Clone)]
pub struct ProviderInfo {
    pub id: ProviderId,
    pub display_name: &'static str,
    pub base_url: &'static str,
    pub auth: AuthScheme,
    pub env_key: &'static str,
    pub family: ProviderFamily,
    pub sse_native: bool,
}

static PROVIDERS: &[ProviderInfo] = &[
    ProviderInfo {
        id: ProviderId::Openai,
        display_name: "OpenAI",
        base_url: "https://api.openai.com",
        auth: AuthScheme::Bearer,
        env_key: "LLM_OPENAI_API_KEY",
        family: ProviderFamily::OpenaiCompatible,
        sse_native: true,
    },
    ProviderInfo {
        id: ProviderId::Anthropic,
        display_name: "Anthropic",
        base_url: "https://api.anthropic.com",
        auth: AuthScheme::ApiKeyHeader {
            header: "x-api-key",
        },
        env_key: "LLM_ANTHROPIC_API_KEY",
        family: ProviderFamily::Anthropic,
        sse_native: true,
    },
    ProviderInfo {
        id: ProviderId::Google,
        display_name: "Google AI Studio",
        base_url: "https://generativelanguage.googleapis.com",
        auth: AuthScheme::ApiKeyHeader {
            header: "x-goog-api-key",
        },
        env_key: "LLM_GOOGLE_API_KEY",
        family: ProviderFamily::Google,
        sse_native: true,
    },
    ProviderInfo {
        id: ProviderId::Bedrock,
        display_name: "AWS Bedrock",
        base_url: "https://bedrock-runtime.us-east-1.amazonaws.com",
        auth: AuthScheme::AwsBearer,
        env_key: "LLM_BEDROCK_API_KEY",
        family: ProviderFamily::Bedrock,
        sse_native: false,
    },
    ProviderInfo {
        id: ProviderId::Groq,
        display_name: "Groq",
        base_url: "https://api.groq.com/openai",
        auth: AuthScheme::Bearer,
        env_key: "LLM_GROQ_API_KEY",
        family: ProviderFamily::OpenaiCompatible,
        sse_native: true,
    },
    ProviderInfo {
        id: ProviderId::Together,
        display_name: "Together",
        base_url: "https://api.together.xyz",
        auth: AuthScheme::Bearer,
        env_key: "LLM_TOGETHER_API_KEY",
        family: ProviderFamily::OpenaiCompatible,
        sse_native: true,
    },
    ProviderInfo {
        id: ProviderId::Inference,
        display_name: "Inference.net",
        base_url: "https://api.inference.net",
        auth: AuthScheme::Bearer,
        env_key: "LLM_INFERENCE_API_KEY",
        family: ProviderFamily::OpenaiCompatible,
        sse_native: true,
    },
    ProviderInfo {
        id: ProviderId::Azure,
        display_name: "Azure OpenAI",
        base_url: "",
        auth: AuthScheme::ApiKeyHeader { header: "api-key" },
        env_key: "LLM_AZURE_API_KEY",
        family: ProviderFamily::OpenaiCompatible,
        sse_native: true,
    },
    ProviderInfo {
        id: ProviderId::Xai,
        display_name: "xAI",
        base_url: "https://api.x.ai",
        auth: AuthScheme::Bearer,
        env_key: "LLM_XAI_API_KEY",
        family: ProviderFamily::OpenaiCompatible,
        sse_native: true,
    },
    ProviderInfo {
        id: ProviderId::Deepseek,
        display_name: "DeepSeek",
        base_url: "https://api.deepseek.com",
        auth: AuthScheme::Bearer,
        env_key: "LLM_DEEPSEEK_API_KEY",
        family: ProviderFamily::OpenaiCompatible,
        sse_native: true,
    },
    ProviderInfo {
        id: ProviderId::Mistral,
        display_name: "Mistral",
        base_url: "https://api.mistral.ai",
        auth: AuthScheme::Bearer,
        env_key: "LLM_MISTRAL_API_KEY",
        family: ProviderFamily::OpenaiCompatible,
        sse_native: true,
    },
];

pub fn provider_info(id: ProviderId) -> &'static ProviderInfo {
    PROVIDERS
        .iter()
        .find(|p| p.id == id)
        .expect("every ProviderId has a table entry")
}

/// Per-token prices in nano-USD; request and image prices are flat nano-USD.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Pricing {
    pub input_nano: i128,
    pub output_nano: i128,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached_input_nano: Option<i128>,
    #[serde(default)]
    pub per_request_nano: i128,
    #[serde(default)]
    pub per_image_nano: i128,
}

impl Pricing {
    pub const fn per_token(input_nano: i128, output_nano: i128) -> Self {
        Self {
            input_nano,
            output_nano,
            cached_input_nano: None,
            per_request_nano: 0,
            per_image_nano: 0,
        }
    }

    pub const fn with_cached(mut self, cached_input_nano: i128) -> Self {
        self.cached_input_nano = Some(cached_input_nano);
        self
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Capabilities {
    pub streaming: bool,
    pub vision: bool,
    pub tools: bool,
    pub parallel_tool_calls: bool,
    pub reasoning: bool,
    pub json_output: bool,
}

impl Capabilities {
    pub const fn full() -> Self {
        Self {
            streaming: true,
            vision: true,
            tools: true,
            parallel_tool_calls: true,
            reasoning: false,
            json_output: true,
        }
    }

    pub const fn text_only() -> Self {
        Self {
            streaming: true,
            vision: false,
            tools: true,
            parallel_tool_calls: false,
            reasoning: false,
            json_output: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stability {
    Stable,
    Beta,
    Unstable,
    Experimental,
}

#[derive(Debug, Clone)]
pub struct ProviderBinding {
    pub provider: ProviderId,
    /// The provider's own name for this model.
    pub provider_model: String,
    pub pricing: Pricing,
    pub context_window: u64,
    pub max_output_tokens: u64,
    pub capabilities: Capabilities,
    /// Fraction of the price waived, e.g. 0.25 for 25% off.
    pub discount: Option<f64>,
    pub stability: Stability,
    pub deactivated_at: Option<DateTime<Utc>>,
    pub deprecated_at: Option<DateTime<Utc>>,
}

impl ProviderBinding {
    pub fn active(&self) -> bool {
        self.deactivated_at.is_none()
    }

    /// Input price after discount, used to order fallback candidates.
    pub fn effective_input_nano(&self) -> i128 {
        match self.discount {
            Some(d) if d.is_finite() && d > 0.0 && d < 1.0 => {
                let keep = 1.0 - d;
                ((self.pricing.input_nano as f64) * keep).round() as i128
            }
            _ => self.pricing.input_nano,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelEntry {
    pub id: String,
    pub display_name: String,
    pub family: String,
    pub aliases: Vec<String>,
    pub bindings: Vec<ProviderBinding>,
}

impl ModelEntry {
    pub fn binding(&self, provider: ProviderId) -> Option<&ProviderBinding> {
        self.bindings.iter().find(|b| b.provider == provider)
    }
}

#[derive(Debug, Clone, Default)]
pub struct BindingPolicy {
    pub pinned: Option<ProviderId>,
    pub exclude_deprecated: bool,
    pub exclude_unstable: bool,
}

#[derive(Debug, Clone)]
pub struct Catalog {
    models: Vec<ModelEntry>,
}

impl Catalog {
    pub fn new(models: Vec<ModelEntry>) -> Self {
        Self { models }
    }

    pub fn builtin() -> Self {
        Self::new(builtin_models())
    }

    pub fn models(&self) -> &[ModelEntry] {
        &self.models
    }

    /// Resolve a requested model string: exact id, then alias, then
    /// `provider/model` with the provider pinned.
    pub fn lookup(&self, requested: &str) -> Option<(&ModelEntry, Option<ProviderId>)> {
        let requested = requested.trim();
        if let Some(entry) = self.models.iter().find(|m| m.id == requested) {
            return Some((entry, None));
        }
        if let Some(entry) = self
            .models
            .iter()
            .find(|m| m.aliases.iter().any(|a| a == requested))
        {
            return Some((entry, None));
        }
        if let Some((prefix, rest)) = requested.split_once('/') {
            let provider = ProviderId::parse(prefix)?;
            let (entry, _) = self.lookup(rest)?;
            if entry.binding(provider).is_some() {
                return Some((entry, Some(provider)));
            }
        }
        None
    }

    /// Bindings eligible under the policy, ordered: pinned first, then
    /// ascending effective input price, then declared stability.
    pub fn list_bindings<'a>(
        &self,
        entry: &'a ModelEntry,
        policy: &BindingPolicy,
    ) -> Vec<&'a ProviderBinding> {
        let mut bindings: Vec<&ProviderBinding> = entry
            .bindings
            .iter()
            .filter(|b| b.active())
            .filter(|b| !(policy.exclude_deprecated && b.deprecated_at.is_some()))
            .filter(|b| !(policy.exclude_unstable && b.stability >= Stability::Unstable))
            .collect();
        bindings.sort_by(|a, b| {
            let a_pinned = policy.pinned == Some(a.provider);
            let b_pinned = policy.pinned == Some(b.provider);
            b_pinned
                .cmp(&a_pinned)
                .then(a.effective_input_nano().cmp(&b.effective_input_nano()))
                .then(a.stability.cmp(&b.stability))
        });
        bindings
    }

    /// `GET /v1/models` projection.
    pub fn model_views(&self, include_deactivated: bool, exclude_deprecated: bool) -> Vec<Value> {
        let mut out = Vec::new();
        for entry in &self.models {
            let bindings: Vec<&ProviderBinding> = entry
                .bindings
                .iter()
                .filter(|b| include_deactivated || b.active())
                .filter(|b| !(exclude_deprecated && b.deprecated_at.is_some()))
                .collect();
            if bindings.is_empty() {
                continue;
            }
            let vision = bindings.iter().any(|b| b.capabilities.vision);
            let best = bindings
                .iter()
                .min_by_key(|b| b.effective_input_nano())
                .expect("non-empty bindings");
            let providers: Vec<Value> = bindings
                .iter()
                .map(|b| {
                    json!({
                        "provider_id": b.provider.as_str(),
                        "model_name": b.provider_model,
                        "pricing": pricing_view(&b.pricing),
                        "context_window": b.context_window,
                        "max_output_tokens": b.max_output_tokens,
                        "stability": stability_str(b.stability),
                    })
                })
                .collect();
            let mut view = json!({
                "id": entry.id,
                "object": "model",
                "name": entry.display_name,
                "family": entry.family,
                "architecture": {
                    "input_modalities": if vision { vec!["text", "image"] } else { vec!["text"] },
                    "output_modalities": vec!["text"],
                },
                "providers": providers,
                "pricing": pricing_view(&best.pricing),
            });
            let obj = view.as_object_mut().expect("model view object");
            if let Some(ts) = bindings.iter().filter_map(|b| b.deactivated_at).max() {
                obj.insert("deactivated_at".to_string(), json!(ts.to_rfc3339()));
            }
            if let Some(ts) = bindings.iter().filter_map(|b| b.deprecated_at).max() {
                obj.insert("deprecated_at".to_string(), json!(ts.to_rfc3339()));
            }
            out.push(view);
        }
        out
    }
}

fn stability_str(s: Stability) -> &'static str {
    match s {
        Stability::Stable => "stable",
        Stability::Beta => "beta",
        Stability::Unstable => "unstable",
        Stability::Experimental => "experimental",
    }
}

fn pricing_view(p: &Pricing) -> Value {
    // Nano-USD per token rendered as dollars per token, the public unit.
    json!({
        "prompt": format_nano(p.input_nano),
        "completion": format_nano(p.output_nano),
        "cached_prompt": p.cached_input_nano.map(format_nano),
        "request": format_nano(p.per_request_nano),
        "image": format_nano(p.per_image_nano),
    })
}

fn format_nano(nano: i128) -> String {
    let whole = nano / 1_000_000_000;
    let frac = (nano % 1_000_000_000).unsigned_abs();
    format!("{whole}.{frac:09}")
}

fn binding(
    provider: ProviderId,
    provider_model: &str,
    pricing: Pricing,
    context_window: u64,
    max_output_tokens: u64,
    capabilities: Capabilities,
    stability: Stability,
) -> ProviderBinding {
    ProviderBinding {
        provider,
        provider_model: provider_model.to_string(),
        pricing,
        context_window,
        max_output_tokens,
        capabilities,
        discount: None,
        stability,
        deactivated_at: None,
        deprecated_at: None,
    }
}

fn model(id: &str, display_name: &str, family: &str, aliases: &[&str]) -> ModelEntry {
    ModelEntry {
        id: id.to_string(),
        display_name: display_name.to_string(),
        family: family.to_string(),
        aliases: aliases.iter().map(|s| s.to_string()).collect(),
        bindings: Vec::new(),
    }
}

fn builtin_models() -> Vec<ModelEntry> {
    let mut gpt4o = model("gpt-4o", "GPT-4o", "gpt-4", &["gpt-4o-2024-11-20"]);
    gpt4o.bindings = vec![
        binding(
            ProviderId::Openai,
            "gpt-4o",
            Pricing::per_token(2_500, 10_000).with_cached(1_250),
            128_000,
            16_384,
            Capabilities::full(),
            Stability::Stable,
        ),
        binding(
            ProviderId::Azure,
            "gpt-4o",
            Pricing::per_token(2_500, 10_000).with_cached(1_250),
            128_000,
            16_384,
            Capabilities::full(),
            Stability::Stable,
        ),
    ];

    let mut gpt4o_mini = model("gpt-4o-mini", "GPT-4o mini", "gpt-4", &[]);
    gpt4o_mini.bindings = vec![binding(
        ProviderId::Openai,
        "gpt-4o-mini",
        Pricing::per_token(150, 600).with_cached(75),
        128_000,
        16_384,
        Capabilities::full(),
        Stability::Stable,
    )];

    let mut sonnet = model(
        "claude-3-5-sonnet",
        "Claude 3.5 Sonnet",
        "claude-3",
        &["claude-3-5-sonnet-20241022"],
    );
    sonnet.bindings = vec![
        binding(
            ProviderId::Anthropic,
            "claude-3-5-sonnet-20241022",
            Pricing::per_token(3_000, 15_000).with_cached(300),
            200_000,
            8_192,
            Capabilities::full(),
            Stability::Stable,
        ),
        {
            let mut b = binding(
                ProviderId::Bedrock,
                "anthropic.claude-3-5-sonnet-20241022-v2:0",
                Pricing::per_token(3_000, 15_000),
                200_000,
                8_192,
                Capabilities {
                    streaming: false,
                    ..Capabilities::full()
                },
                Stability::Beta,
            );
            b.discount = Some(0.1);
            b
        },
    ];

    let mut haiku = model("claude-3-5-haiku", "Claude 3.5 Haiku", "claude-3", &[]);
    haiku.bindings = vec![binding(
        ProviderId::Anthropic,
        "claude-3-5-haiku-20241022",
        Pricing::per_token(800, 4_000).with_cached(80),
        200_000,
        8_192,
        Capabilities::text_only(),
        Stability::Stable,
    )];

    let mut gemini = model(
        "gemini-1.5-pro",
        "Gemini 1.5 Pro",
        "gemini",
        &["gemini-1.5-pro-002"],
    );
    gemini.bindings = vec![binding(
        ProviderId::Google,
        "gemini-1.5-pro",
        Pricing::per_token(1_250, 5_000),
        2_000_000,
        8_192,
        Capabilities::full(),
        Stability::Stable,
    )];

    let mut gemini_flash = model("gemini-1.5-flash", "Gemini 1.5 Flash", "gemini", &[]);
    gemini_flash.bindings = vec![binding(
        ProviderId::Google,
        "gemini-1.5-flash",
        Pricing::per_token(75, 300),
        1_000_000,
        8_192,
        Capabilities::full(),
        Stability::Stable,
    )];

    let mut llama70b = model(
        "llama-3.1-70b-instruct",
        "Llama 3.1 70B Instruct",
        "llama-3",
        &["llama-3.1-70b"],
    );
    llama70b.bindings = vec![
        binding(
            ProviderId::Groq,
            "llama-3.1-70b-versatile",
            Pricing::per_token(590, 790),
            131_072,
            8_192,
            Capabilities::text_only(),
            Stability::Stable,
        ),
        binding(
            ProviderId::Together,
            "meta-llama/Meta-Llama-3.1-70B-Instruct-Turbo",
            Pricing::per_token(880, 880),
            131_072,
            4_096,
            Capabilities::text_only(),
            Stability::Stable,
        ),
        binding(
            ProviderId::Inference,
            "meta-llama/llama-3.1-70b-instruct/fp-16",
            Pricing::per_token(400, 400),
            131_072,
            4_096,
            Capabilities::text_only(),
            Stability::Unstable,
        ),
    ];

    let mut deepseek = model("deepseek-chat", "DeepSeek V3", "deepseek", &[]);
    deepseek.bindings = vec![binding(
        ProviderId::Deepseek,
        "deepseek-chat",
        Pricing::per_token(270, 1_100).with_cached(70),
        65_536,
        8_192,
        Capabilities::text_only(),
        Stability::Stable,
    )];

    let mut grok = model("grok-2", "Grok 2", "grok", &["grok-2-1212"]);
    grok.bindings = vec![binding(
        ProviderId::Xai,
        "grok-2-1212",
        Pricing::per_token(2_000, 10_000),
        131_072,
        8_192,
        Capabilities::text_only(),
        Stability::Beta,
    )];

    let mut mistral_large = model("mistral-large", "Mistral Large", "mistral", &[]);
    mistral_large.bindings = vec![binding(
        ProviderId::Mistral,
        "mistral-large-latest",
        Pricing::per_token(2_000, 6_000),
        131_072,
        8_192,
        Capabilities::text_only(),
        Stability::Stable,
    )];

    vec![
        gpt4o,
        gpt4o_mini,
        sonnet,
        haiku,
        gemini,
        gemini_flash,
        llama70b,
        deepseek,
        grok,
        mistral_large,
    ]
}
