use crate::app::AppState;
use crate::auth::OrgContext;
use crate::cache::{self, CacheStatus};
use crate::catalog::{BindingPolicy, Pricing, ProviderBinding, ProviderId};
use crate::credentials::{Credential, CredentialSource, ResolveError};
use crate::error::{AppError, AppResult};
use crate::ledger::LedgerErrorKind;
use crate::providers::{self, StreamTranslator};
use crate::request_log::{
    LogRecord, OUTCOME_CLIENT_DISCONNECT, OUTCOME_ERROR, OUTCOME_SUCCESS, OUTCOME_SUCCESS_CACHED,
};
use crate::upstream::{self, UpstreamCallError, UpstreamErrorKind};
use crate::wire::{
    estimate_prompt_tokens, now_ts, Choice, FinishReason, NormalizedRequest, NormalizedResponse,
    ResponseMetadata, SseFrame, Usage,
};
use axum::http::StatusCode;
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries of the same candidate after its first attempt.
    pub max_retries_per_candidate: u32,
    pub backoff_ms: Vec<u64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries_per_candidate: 2,
            backoff_ms: vec![200, 500],
        }
    }
}

pub enum DispatchOutcome {
    Buffered(NormalizedResponse),
    Stream {
        meta: StreamMeta,
        frames: ReceiverStream<SseFrame>,
    },
}

#[derive(Debug, Clone)]
pub struct StreamMeta {
    pub id: String,
    pub created: i64,
    pub model: String,
}

#[derive(Debug, Clone, Default)]
pub struct CostBreakdown {
    pub input_nano: i128,
    pub output_nano: i128,
    pub cached_nano: i128,
    pub request_nano: i128,
    pub total_nano: i128,
}

/// Cost from final token counts. Cached prompt tokens bill at the cached
/// rate when the binding has one; the per-binding discount scales the total.
pub fn compute_cost(usage: &Usage, pricing: &Pricing, discount: Option<f64>) -> Option<CostBreakdown> {
    let prompt = i128::from(usage.prompt_tokens);
    let completion = i128::from(usage.completion_tokens);
    let cached = i128::from(usage.cached_tokens()).min(prompt);

    let (input_nano, cached_nano) = match pricing.cached_input_nano {
        Some(cached_rate) => {
            let uncached = prompt - cached;
            (
                uncached.checked_mul(pricing.input_nano)?,
                cached.checked_mul(cached_rate)?,
            )
        }
        None => (prompt.checked_mul(pricing.input_nano)?, 0),
    };
    let output_nano = completion.checked_mul(pricing.output_nano)?;
    let request_nano = pricing.per_request_nano;

    let base = input_nano
        .checked_add(output_nano)?
        .checked_add(cached_nano)?
        .checked_add(request_nano)?;
    let multiplier = match discount {
        Some(d) if d.is_finite() && d > 0.0 && d < 1.0 => 1.0 - d,
        _ => 1.0,
    };
    let total_nano = scale_with_multiplier(base, multiplier)?;

    Some(CostBreakdown {
        input_nano,
        output_nano,
        cached_nano,
        request_nano,
        total_nano,
    })
}

/// Multiplier quantized to nano precision so the scaled charge stays exact
/// integer arithmetic.
fn scale_with_multiplier(base_nano: i128, multiplier: f64) -> Option<i128> {
    if !multiplier.is_finite() || multiplier < 0.0 {
        return None;
    }
    const SCALE: i128 = 1_000_000_000;
    let repr = format!("{multiplier:.18}");
    let mut parts = repr.split('.');
    let whole = parts.next().unwrap_or("0").parse::<i128>().ok()?;
    let frac_raw = parts.next().unwrap_or("0");
    let mut frac_nano = String::with_capacity(9);
    for ch in frac_raw.chars().take(9) {
        frac_nano.push(ch);
    }
    while frac_nano.len() < 9 {
        frac_nano.push('0');
    }
    let frac = frac_nano.parse::<i128>().ok()?;
    let multiplier_nano = whole.checked_mul(SCALE)?.checked_add(frac)?;
    base_nano.checked_mul(multiplier_nano)?.checked_div(SCALE)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ErrorClass {
    RateLimited,
    Transient,
    UpstreamAuth,
    CapabilityRefusal,
    UpstreamBadRequest,
}

fn classify(err: &UpstreamCallError) -> ErrorClass {
    if err.kind == UpstreamErrorKind::Network {
        return ErrorClass::Transient;
    }
    match err.status {
        Some(StatusCode::TOO_MANY_REQUESTS) => ErrorClass::RateLimited,
        Some(StatusCode::UNAUTHORIZED) | Some(StatusCode::FORBIDDEN) => ErrorClass::UpstreamAuth,
        Some(StatusCode::UNPROCESSABLE_ENTITY) => ErrorClass::CapabilityRefusal,
        Some(status) if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT => {
            ErrorClass::Transient
        }
        _ => ErrorClass::UpstreamBadRequest,
    }
}

fn retryable(class: ErrorClass) -> bool {
    matches!(class, ErrorClass::RateLimited | ErrorClass::Transient)
}

fn backoff_delay(policy: &RetryPolicy, attempt_idx: u32, retry_after: Option<u64>) -> std::time::Duration {
    if let Some(secs) = retry_after {
        return std::time::Duration::from_secs(secs.min(30));
    }
    let base = policy
        .backoff_ms
        .get(attempt_idx as usize)
        .or(policy.backoff_ms.last())
        .copied()
        .unwrap_or(200);
    std::time::Duration::from_millis(base + jitter_ms(base / 2))
}

fn jitter_ms(bound: u64) -> u64 {
    if bound == 0 {
        return 0;
    }
    (uuid::Uuid::new_v4().as_u128() as u64) % bound
}

#[derive(Debug, Clone, serde::Serialize)]
struct AttemptRecord {
    provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<u16>,
    error: String,
}

fn upstream_error_to_app(err: &UpstreamCallError) -> AppError {
    let status = err.status.unwrap_or(StatusCode::BAD_GATEWAY);
    AppError::new(status, "upstream_error", err.message.clone()).with_type("api_error")
}

struct RequestPlan {
    entry_id: String,
    requested_model: String,
    requested_provider: Option<ProviderId>,
    candidates: Vec<ProviderBinding>,
}

pub async fn dispatch_chat(
    state: &AppState,
    org: &OrgContext,
    req: NormalizedRequest,
    request_id: String,
) -> AppResult<DispatchOutcome> {
    let plan = plan_request(state, org, &req)?;
    let started_at = std::time::Instant::now();

    let stream_requested = req.stream.unwrap_or(false);
    let can_stream = plan
        .candidates
        .iter()
        .any(|binding| binding.capabilities.streaming);
    if stream_requested && can_stream {
        let mut plan = plan;
        plan.candidates.retain(|b| b.capabilities.streaming);
        return execute_stream(state, org, req, plan, request_id, started_at).await;
    }

    // Streaming without a capable binding downgrades to a buffered call; the
    // ingress layer replays it as a synthetic stream when the client asked
    // for SSE.
    if cache::cacheable(&req) {
        let key = cache::fingerprint(&plan.entry_id, &req);
        let filler_req = req.clone();
        let (response, status) = state
            .cache
            .get_or_compute(&key, || {
                execute_buffered(state, org, filler_req, &plan, request_id.clone(), started_at)
            })
            .await?;
        if status == CacheStatus::Hit {
            finalize_cache_hit(state, org, &plan, &response, &request_id, started_at).await;
        }
        return Ok(DispatchOutcome::Buffered(response));
    }

    let response = execute_buffered(state, org, req, &plan, request_id, started_at).await?;
    Ok(DispatchOutcome::Buffered(response))
}

fn plan_request(state: &AppState, org: &OrgContext, req: &NormalizedRequest) -> AppResult<RequestPlan> {
    let (entry, mut pinned) = state
        .catalog
        .lookup(&req.model)
        .ok_or_else(|| AppError::unknown_model(&req.model))?;

    if pinned.is_none() {
        if let Some(hint) = req.provider.as_deref() {
            let provider = ProviderId::parse(hint).ok_or_else(|| {
                AppError::new(
                    StatusCode::BAD_REQUEST,
                    "unknown_provider",
                    format!("unknown provider: {hint}"),
                )
            })?;
            if entry.binding(provider).is_none() {
                return Err(AppError::new(
                    StatusCode::BAD_REQUEST,
                    "provider_not_available",
                    format!("{} is not served by {}", entry.id, hint),
                ));
            }
            pinned = Some(provider);
        }
    }

    if let Some(provider) = pinned {
        if !org.provider_allowed(provider) {
            return Err(AppError::new(
                StatusCode::FORBIDDEN,
                "provider_forbidden",
                format!("provider {} is not allowed for this key", provider.as_str()),
            )
            .with_type("permission_error"));
        }
    }

    let policy = BindingPolicy {
        pinned,
        exclude_deprecated: false,
        exclude_unstable: false,
    };
    let mut rejections: Vec<String> = Vec::new();
    let candidates: Vec<ProviderBinding> = state
        .catalog
        .list_bindings(entry, &policy)
        .into_iter()
        .filter(|b| org.provider_allowed(b.provider))
        .filter(|b| pinned.is_none() || pinned == Some(b.provider))
        .filter(|b| match providers::capability_check(req, b) {
            Ok(()) => true,
            Err(reason) => {
                rejections.push(reason);
                false
            }
        })
        .cloned()
        .collect();

    if candidates.is_empty() {
        if let Some(reason) = rejections.into_iter().next() {
            return Err(AppError::new(
                StatusCode::BAD_REQUEST,
                "capability_refusal",
                reason,
            ));
        }
        return Err(AppError::new(
            StatusCode::BAD_REQUEST,
            "provider_not_available",
            format!("no active provider serves {}", entry.id),
        ));
    }

    Ok(RequestPlan {
        entry_id: entry.id.clone(),
        requested_model: req.model.clone(),
        requested_provider: pinned,
        candidates,
    })
}

/// Upper-bound estimate for the credit pre-check: approximate prompt tokens
/// at the candidate's input price plus the full output budget.
fn estimate_cost_nano(req: &NormalizedRequest, binding: &ProviderBinding) -> i128 {
    let prompt = i128::from(estimate_prompt_tokens(&req.messages));
    let output = i128::from(req.max_tokens.unwrap_or(binding.max_output_tokens));
    prompt
        .saturating_mul(binding.pricing.input_nano)
        .saturating_add(output.saturating_mul(binding.pricing.output_nano))
        .saturating_add(binding.pricing.per_request_nano)
}

async fn precheck_credits(
    state: &AppState,
    org: &OrgContext,
    req: &NormalizedRequest,
    plan: &RequestPlan,
    request_id: &str,
    started_at: std::time::Instant,
    is_stream: bool,
) -> AppResult<()> {
    let estimate = estimate_cost_nano(req, &plan.candidates[0]);
    match state.ledger.precheck(&org.org_id, estimate).await {
        Ok(()) => Ok(()),
        Err(err) => {
            let app_err = match err.kind {
                LedgerErrorKind::InsufficientCredits => AppError::insufficient_credits(),
                LedgerErrorKind::NotFound => {
                    AppError::new(StatusCode::UNAUTHORIZED, "unauthorized", "org not found")
                }
                _ => AppError::internal(err.message),
            };
            enqueue_error_log(
                state,
                org,
                plan,
                req,
                request_id,
                started_at,
                is_stream,
                &app_err,
                Vec::new(),
            )
            .await;
            Err(app_err)
        }
    }
}

async fn execute_buffered(
    state: &AppState,
    org: &OrgContext,
    req: NormalizedRequest,
    plan: &RequestPlan,
    request_id: String,
    started_at: std::time::Instant,
) -> AppResult<NormalizedResponse> {
    precheck_credits(state, org, &req, plan, &request_id, started_at, false).await?;

    let policy = state.runtime.retry.clone();
    let mut attempts: Vec<AttemptRecord> = Vec::new();

    for binding in &plan.candidates {
        let credential = match state.credentials.resolve(&org.org_id, binding.provider).await {
            Ok(credential) => credential,
            Err(ResolveError::NotConfigured) => continue,
            Err(ResolveError::Store(message)) => {
                let app_err = AppError::internal(message);
                enqueue_error_log(
                    state, org, plan, &req, &request_id, started_at, false, &app_err, attempts,
                )
                .await;
                return Err(app_err);
            }
        };

        let wire = match providers::build_request(&req, binding, &credential, false) {
            Ok(wire) => wire,
            Err(reason) => {
                attempts.push(AttemptRecord {
                    provider: binding.provider.as_str().to_string(),
                    status: None,
                    error: reason,
                });
                continue;
            }
        };

        let mut attempt_idx: u32 = 0;
        loop {
            let call = upstream::send_json(&state.http, &wire, state.runtime.request_timeout_ms).await;
            match call {
                Ok(value) => {
                    let parsed = match providers::parse_response(binding.provider, &value) {
                        Ok(parsed) => parsed,
                        Err(reason) => {
                            let app_err = AppError::new(
                                StatusCode::BAD_GATEWAY,
                                "invalid_upstream_response",
                                reason,
                            )
                            .with_type("api_error");
                            enqueue_error_log(
                                state, org, plan, &req, &request_id, started_at, false, &app_err,
                                attempts,
                            )
                            .await;
                            return Err(app_err);
                        }
                    };
                    let response = assemble_response(plan, binding, parsed);
                    let cost = match settle_success(
                        state,
                        org,
                        plan,
                        binding,
                        &credential,
                        &response.usage,
                        &request_id,
                    )
                    .await
                    {
                        Ok(cost) => cost,
                        Err(app_err) => {
                            enqueue_error_log(
                                state, org, plan, &req, &request_id, started_at, false, &app_err,
                                attempts,
                            )
                            .await;
                            return Err(app_err);
                        }
                    };
                    enqueue_success_log(
                        state,
                        org,
                        plan,
                        binding,
                        &req,
                        &response,
                        &request_id,
                        started_at,
                        false,
                        None,
                        cost,
                        &credential,
                        attempts,
                        OUTCOME_SUCCESS,
                    )
                    .await;
                    return Ok(response);
                }
                Err(err) => {
                    let class = classify(&err);
                    attempts.push(AttemptRecord {
                        provider: binding.provider.as_str().to_string(),
                        status: err.status.map(|s| s.as_u16()),
                        error: err.message.clone(),
                    });
                    if retryable(class) && attempt_idx < policy.max_retries_per_candidate {
                        tokio::time::sleep(backoff_delay(&policy, attempt_idx, err.retry_after))
                            .await;
                        attempt_idx += 1;
                        continue;
                    }
                    match class {
                        ErrorClass::UpstreamBadRequest => {
                            let app_err = upstream_error_to_app(&err);
                            enqueue_error_log(
                                state, org, plan, &req, &request_id, started_at, false, &app_err,
                                attempts,
                            )
                            .await;
                            return Err(app_err);
                        }
                        ErrorClass::UpstreamAuth => {
                            tracing::warn!(
                                provider = binding.provider.as_str(),
                                "credential rejected upstream, advancing to next candidate"
                            );
                            break;
                        }
                        _ => break,
                    }
                }
            }
        }
    }

    let final_err = AppError::new(
        StatusCode::BAD_GATEWAY,
        "upstream_unavailable",
        format!("no available upstream provider for model: {}", plan.entry_id),
    )
    .with_type("api_error");
    enqueue_error_log(
        state, org, plan, &req, &request_id, started_at, false, &final_err, attempts,
    )
    .await;
    Err(final_err)
}

fn assemble_response(
    plan: &RequestPlan,
    binding: &ProviderBinding,
    parsed: providers::ParsedResponse,
) -> NormalizedResponse {
    let underlying = parsed
        .model
        .unwrap_or_else(|| binding.provider_model.clone());
    NormalizedResponse {
        id: parsed
            .id
            .unwrap_or_else(|| format!("chatcmpl_{}", uuid::Uuid::new_v4().simple())),
        object: "chat.completion".to_string(),
        created: now_ts(),
        model: format!("{}/{}", binding.provider.as_str(), plan.entry_id),
        choices: parsed.choices,
        usage: parsed.usage,
        metadata: ResponseMetadata {
            requested_model: plan.requested_model.clone(),
            requested_provider: plan.requested_provider.map(|p| p.as_str().to_string()),
            used_model: plan.entry_id.clone(),
            used_provider: binding.provider.as_str().to_string(),
            underlying_used_model: underlying,
        },
    }
}

/// Debit the ledger for a completed call. BYOK zeroes the charge but the
/// cost breakdown is still computed for the log record.
async fn settle_success(
    state: &AppState,
    org: &OrgContext,
    plan: &RequestPlan,
    binding: &ProviderBinding,
    credential: &Credential,
    usage: &Usage,
    request_id: &str,
) -> AppResult<CostBreakdown> {
    let cost = compute_cost(usage, &binding.pricing, binding.discount).ok_or_else(|| {
        AppError::internal(format!(
            "charge overflow for model {} on {}",
            plan.entry_id,
            binding.provider.as_str()
        ))
    })?;
    let charge = match credential.source {
        CredentialSource::Byok => 0,
        CredentialSource::Gateway => cost.total_nano,
    };
    let meta = json!({
        "model": plan.entry_id,
        "provider": binding.provider.as_str(),
        "prompt_tokens": usage.prompt_tokens,
        "completion_tokens": usage.completion_tokens,
        "cached_tokens": usage.cached_tokens(),
        "total_cost_nano": cost.total_nano.to_string(),
        "byok": credential.source == CredentialSource::Byok,
    });
    match state.ledger.debit(&org.org_id, request_id, charge, &meta).await {
        Ok(_) => Ok(cost),
        Err(err) => match err.kind {
            LedgerErrorKind::InsufficientCredits => Err(AppError::insufficient_credits()),
            LedgerErrorKind::NotFound => Err(AppError::new(
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "org not found",
            )),
            _ => Err(AppError::internal(err.message)),
        },
    }
}

async fn finalize_cache_hit(
    state: &AppState,
    org: &OrgContext,
    plan: &RequestPlan,
    response: &NormalizedResponse,
    request_id: &str,
    started_at: std::time::Instant,
) {
    // A cache serve costs nothing; the ledger row is kept for idempotency
    // and audit.
    let meta = json!({
        "model": plan.entry_id,
        "cache": "hit",
    });
    if let Err(err) = state.ledger.debit(&org.org_id, request_id, 0, &meta).await {
        tracing::warn!("cache-hit ledger row failed: {}", err.message);
    }
    let record = LogRecord {
        request_id: request_id.to_string(),
        org_id: org.org_id.clone(),
        project_id: org.project_id.clone(),
        model_requested: plan.requested_model.clone(),
        provider_requested: plan.requested_provider.map(|p| p.as_str().to_string()),
        model_used: Some(response.metadata.used_model.clone()),
        provider_used: Some(response.metadata.used_provider.clone()),
        underlying_model: Some(response.metadata.underlying_used_model.clone()),
        is_stream: false,
        prompt_tokens: Some(response.usage.prompt_tokens),
        completion_tokens: Some(response.usage.completion_tokens),
        reasoning_tokens: response.usage.reasoning_tokens,
        cached_tokens: Some(response.usage.cached_tokens()),
        input_cost_nano: Some(0),
        output_cost_nano: Some(0),
        cached_cost_nano: Some(0),
        request_cost_nano: Some(0),
        total_cost_nano: Some(0),
        charged_nano: Some(0),
        ttfb_ms: None,
        duration_ms: Some(started_at.elapsed().as_millis() as u64),
        outcome: OUTCOME_SUCCESS_CACHED.to_string(),
        error_code: None,
        error_message: None,
        error_http_status: None,
        attempts_json: None,
        prompt_json: None,
        response_json: None,
        created_at: chrono::Utc::now(),
    };
    state.log_queue.enqueue(record).await;
}

#[allow(clippy::too_many_arguments)]
async fn enqueue_success_log(
    state: &AppState,
    org: &OrgContext,
    plan: &RequestPlan,
    binding: &ProviderBinding,
    req: &NormalizedRequest,
    response: &NormalizedResponse,
    request_id: &str,
    started_at: std::time::Instant,
    is_stream: bool,
    ttfb_ms: Option<u64>,
    cost: CostBreakdown,
    credential: &Credential,
    attempts: Vec<AttemptRecord>,
    outcome: &str,
) {
    let charged = match credential.source {
        CredentialSource::Byok => 0,
        CredentialSource::Gateway => cost.total_nano,
    };
    let record = LogRecord {
        request_id: request_id.to_string(),
        org_id: org.org_id.clone(),
        project_id: org.project_id.clone(),
        model_requested: plan.requested_model.clone(),
        provider_requested: plan.requested_provider.map(|p| p.as_str().to_string()),
        model_used: Some(plan.entry_id.clone()),
        provider_used: Some(binding.provider.as_str().to_string()),
        underlying_model: Some(response.metadata.underlying_used_model.clone()),
        is_stream,
        prompt_tokens: Some(response.usage.prompt_tokens),
        completion_tokens: Some(response.usage.completion_tokens),
        reasoning_tokens: response.usage.reasoning_tokens,
        cached_tokens: Some(response.usage.cached_tokens()),
        input_cost_nano: Some(cost.input_nano),
        output_cost_nano: Some(cost.output_nano),
        cached_cost_nano: Some(cost.cached_nano),
        request_cost_nano: Some(cost.request_nano),
        total_cost_nano: Some(cost.total_nano),
        charged_nano: Some(charged),
        ttfb_ms,
        duration_ms: Some(started_at.elapsed().as_millis() as u64),
        outcome: outcome.to_string(),
        error_code: None,
        error_message: None,
        error_http_status: None,
        attempts_json: attempts_json(attempts),
        prompt_json: org
            .log_bodies
            .then(|| serde_json::to_value(&req.messages).ok())
            .flatten(),
        response_json: org
            .log_bodies
            .then(|| serde_json::to_value(response).ok())
            .flatten(),
        created_at: chrono::Utc::now(),
    };
    state.log_queue.enqueue(record).await;
}

#[allow(clippy::too_many_arguments)]
async fn enqueue_error_log(
    state: &AppState,
    org: &OrgContext,
    plan: &RequestPlan,
    req: &NormalizedRequest,
    request_id: &str,
    started_at: std::time::Instant,
    is_stream: bool,
    error: &AppError,
    attempts: Vec<AttemptRecord>,
) {
    let record = LogRecord {
        request_id: request_id.to_string(),
        org_id: org.org_id.clone(),
        project_id: org.project_id.clone(),
        model_requested: plan.requested_model.clone(),
        provider_requested: plan.requested_provider.map(|p| p.as_str().to_string()),
        model_used: None,
        provider_used: attempts.last().map(|a| a.provider.clone()),
        underlying_model: None,
        is_stream,
        prompt_tokens: None,
        completion_tokens: None,
        reasoning_tokens: None,
        cached_tokens: None,
        input_cost_nano: None,
        output_cost_nano: None,
        cached_cost_nano: None,
        request_cost_nano: None,
        total_cost_nano: None,
        charged_nano: None,
        ttfb_ms: None,
        duration_ms: Some(started_at.elapsed().as_millis() as u64),
        outcome: OUTCOME_ERROR.to_string(),
        error_code: Some(error.code.clone()),
        error_message: Some(error.message.clone()),
        error_http_status: Some(error.status.as_u16()),
        attempts_json: attempts_json(attempts),
        prompt_json: org
            .log_bodies
            .then(|| serde_json::to_value(&req.messages).ok())
            .flatten(),
        response_json: None,
        created_at: chrono::Utc::now(),
    };
    state.log_queue.enqueue(record).await;
}

fn attempts_json(attempts: Vec<AttemptRecord>) -> Option<Value> {
    if attempts.is_empty() {
        return None;
    }
    serde_json::to_value(&attempts).ok()
}

async fn execute_stream(
    state: &AppState,
    org: &OrgContext,
    req: NormalizedRequest,
    plan: RequestPlan,
    request_id: String,
    started_at: std::time::Instant,
) -> AppResult<DispatchOutcome> {
    precheck_credits(state, org, &req, &plan, &request_id, started_at, true).await?;

    let meta = StreamMeta {
        id: format!("chatcmpl_{}", uuid::Uuid::new_v4().simple()),
        created: now_ts(),
        model: plan.entry_id.clone(),
    };
    let (tx, rx) = mpsc::channel::<SseFrame>(64);

    let state = state.clone();
    let org = org.clone();
    tokio::spawn(async move {
        relay_stream(state, org, req, plan, request_id, started_at, tx).await;
    });

    Ok(DispatchOutcome::Stream {
        meta,
        frames: ReceiverStream::new(rx),
    })
}

enum StreamEnd {
    /// Upstream finished; carries the terminal usage and finish reason.
    Completed(FinishReason, Usage),
    /// Client went away; carries whatever usage was observed.
    ClientGone(Usage),
    /// Body failed before anything was forwarded; retry is still possible.
    FailedClean(String),
    /// Body failed after delivery began; the request is sealed.
    FailedSealed(Usage, String),
}

/// The attempt loop for streams lives inside the relay task so a candidate
/// that fails before the first forwarded frame can be retried without the
/// client noticing.
#[allow(clippy::too_many_arguments)]
async fn relay_stream(
    state: AppState,
    org: OrgContext,
    req: NormalizedRequest,
    plan: RequestPlan,
    request_id: String,
    started_at: std::time::Instant,
    tx: mpsc::Sender<SseFrame>,
) {
    let policy = state.runtime.retry.clone();
    let mut attempts: Vec<AttemptRecord> = Vec::new();

    for binding in &plan.candidates {
        let credential = match state.credentials.resolve(&org.org_id, binding.provider).await {
            Ok(credential) => credential,
            Err(ResolveError::NotConfigured) => continue,
            Err(ResolveError::Store(message)) => {
                let app_err = AppError::internal(message);
                seal_with_error(&state, &org, &plan, &req, &request_id, started_at, &tx, app_err, attempts)
                    .await;
                return;
            }
        };

        let wire = match providers::build_request(&req, binding, &credential, true) {
            Ok(wire) => wire,
            Err(reason) => {
                attempts.push(AttemptRecord {
                    provider: binding.provider.as_str().to_string(),
                    status: None,
                    error: reason,
                });
                continue;
            }
        };

        let mut attempt_idx: u32 = 0;
        loop {
            let call = upstream::send_raw(&state.http, &wire, state.runtime.request_timeout_ms).await;
            let resp = match call {
                Ok(resp) => resp,
                Err(err) => {
                    let class = classify(&err);
                    attempts.push(AttemptRecord {
                        provider: binding.provider.as_str().to_string(),
                        status: err.status.map(|s| s.as_u16()),
                        error: err.message.clone(),
                    });
                    if retryable(class) && attempt_idx < policy.max_retries_per_candidate {
                        tokio::time::sleep(backoff_delay(&policy, attempt_idx, err.retry_after))
                            .await;
                        attempt_idx += 1;
                        continue;
                    }
                    if class == ErrorClass::UpstreamBadRequest {
                        let app_err = upstream_error_to_app(&err);
                        seal_with_error(
                            &state, &org, &plan, &req, &request_id, started_at, &tx, app_err,
                            attempts,
                        )
                        .await;
                        return;
                    }
                    break;
                }
            };

            let mut ttfb_ms: Option<u64> = None;
            match pump_stream(resp, binding.provider, &tx, started_at, &mut ttfb_ms).await {
                StreamEnd::Completed(finish_reason, usage) => {
                    let cost = compute_cost(&usage, &binding.pricing, binding.discount)
                        .unwrap_or_default();
                    let charge = match credential.source {
                        CredentialSource::Byok => 0,
                        CredentialSource::Gateway => cost.total_nano,
                    };
                    let meta = json!({
                        "model": plan.entry_id,
                        "provider": binding.provider.as_str(),
                        "prompt_tokens": usage.prompt_tokens,
                        "completion_tokens": usage.completion_tokens,
                        "finish_reason": finish_reason.as_str(),
                    });
                    if let Err(err) = state
                        .ledger
                        .debit(&org.org_id, &request_id, charge, &meta)
                        .await
                    {
                        tracing::warn!("stream debit failed: {}", err.message);
                    }
                    let response = synthetic_response_for_log(&plan, binding, &usage);
                    enqueue_success_log(
                        &state,
                        &org,
                        &plan,
                        binding,
                        &req,
                        &response,
                        &request_id,
                        started_at,
                        true,
                        ttfb_ms,
                        cost,
                        &credential,
                        attempts,
                        OUTCOME_SUCCESS,
                    )
                    .await;
                    return;
                }
                StreamEnd::ClientGone(usage) => {
                    let cost = compute_cost(&usage, &binding.pricing, binding.discount)
                        .unwrap_or_default();
                    let charge = match credential.source {
                        CredentialSource::Byok => 0,
                        CredentialSource::Gateway => cost.total_nano,
                    };
                    let meta = json!({ "model": plan.entry_id, "outcome": "client_disconnect" });
                    if let Err(err) = state
                        .ledger
                        .debit(&org.org_id, &request_id, charge, &meta)
                        .await
                    {
                        tracing::warn!("disconnect debit failed: {}", err.message);
                    }
                    let response = synthetic_response_for_log(&plan, binding, &usage);
                    enqueue_success_log(
                        &state,
                        &org,
                        &plan,
                        binding,
                        &req,
                        &response,
                        &request_id,
                        started_at,
                        true,
                        ttfb_ms,
                        cost,
                        &credential,
                        attempts,
                        OUTCOME_CLIENT_DISCONNECT,
                    )
                    .await;
                    return;
                }
                StreamEnd::FailedClean(message) => {
                    attempts.push(AttemptRecord {
                        provider: binding.provider.as_str().to_string(),
                        status: None,
                        error: message,
                    });
                    if attempt_idx < policy.max_retries_per_candidate {
                        tokio::time::sleep(backoff_delay(&policy, attempt_idx, None)).await;
                        attempt_idx += 1;
                        continue;
                    }
                    break;
                }
                StreamEnd::FailedSealed(usage, message) => {
                    // Bytes already reached the client; emit one error frame
                    // and account for what was delivered.
                    let _ = tx
                        .send(SseFrame::Error {
                            code: "stream_mid_flight".to_string(),
                            message: message.clone(),
                        })
                        .await;
                    let cost = compute_cost(&usage, &binding.pricing, binding.discount)
                        .unwrap_or_default();
                    let charge = match credential.source {
                        CredentialSource::Byok => 0,
                        CredentialSource::Gateway => cost.total_nano,
                    };
                    let meta = json!({ "model": plan.entry_id, "outcome": "stream_mid_flight" });
                    if let Err(err) = state
                        .ledger
                        .debit(&org.org_id, &request_id, charge, &meta)
                        .await
                    {
                        tracing::warn!("sealed stream debit failed: {}", err.message);
                    }
                    let app_err = AppError::new(
                        StatusCode::BAD_GATEWAY,
                        "stream_mid_flight",
                        message,
                    )
                    .with_type("api_error");
                    enqueue_error_log(
                        &state, &org, &plan, &req, &request_id, started_at, true, &app_err,
                        attempts,
                    )
                    .await;
                    return;
                }
            }
        }
    }

    let final_err = AppError::new(
        StatusCode::BAD_GATEWAY,
        "upstream_unavailable",
        format!("no available upstream provider for model: {}", plan.entry_id),
    )
    .with_type("api_error");
    seal_with_error(&state, &org, &plan, &req, &request_id, started_at, &tx, final_err, attempts)
        .await;
}

/// Forward normalized frames from one upstream body to the client channel.
async fn pump_stream(
    resp: reqwest::Response,
    provider: ProviderId,
    tx: &mpsc::Sender<SseFrame>,
    started_at: std::time::Instant,
    ttfb_ms: &mut Option<u64>,
) -> StreamEnd {
    let mut translator = StreamTranslator::new(provider);
    let mut stream = resp.bytes_stream().eventsource();
    let mut delivered = false;
    let mut terminal: Option<(FinishReason, Usage)> = None;

    while let Some(event) = stream.next().await {
        let event = match event {
            Ok(event) => event,
            Err(err) => {
                let message = err.to_string();
                if delivered {
                    let usage = partial_usage(&mut translator, &terminal);
                    return StreamEnd::FailedSealed(usage, message);
                }
                return StreamEnd::FailedClean(message);
            }
        };
        for frame in translator.on_event(&event.event, &event.data) {
            if ttfb_ms.is_none() {
                *ttfb_ms = Some(started_at.elapsed().as_millis() as u64);
            }
            if let SseFrame::Done {
                finish_reason,
                usage,
            } = &frame
            {
                terminal = Some((*finish_reason, usage.clone()));
            }
            if tx.send(frame).await.is_err() {
                let usage = partial_usage(&mut translator, &terminal);
                return StreamEnd::ClientGone(usage);
            }
            delivered = true;
        }
    }

    if terminal.is_none() {
        if let Some(frame) = translator.finish() {
            if let SseFrame::Done {
                finish_reason,
                usage,
            } = &frame
            {
                terminal = Some((*finish_reason, usage.clone()));
            }
            if tx.send(frame).await.is_err() {
                let usage = partial_usage(&mut translator, &terminal);
                return StreamEnd::ClientGone(usage);
            }
        }
    }

    match terminal {
        Some((finish_reason, usage)) => StreamEnd::Completed(finish_reason, usage),
        None => {
            if delivered {
                StreamEnd::FailedSealed(
                    Usage::from_counts(0, 0, None, None, None),
                    "upstream stream ended without a terminal frame".to_string(),
                )
            } else {
                StreamEnd::FailedClean("upstream stream ended without data".to_string())
            }
        }
    }
}

fn partial_usage(
    translator: &mut StreamTranslator,
    terminal: &Option<(FinishReason, Usage)>,
) -> Usage {
    if let Some((_, usage)) = terminal {
        return usage.clone();
    }
    match translator.finish() {
        Some(SseFrame::Done { usage, .. }) => usage,
        _ => Usage::from_counts(0, 0, None, None, None),
    }
}

/// Streams have no buffered body; build the minimal response the log and
/// metadata paths need.
fn synthetic_response_for_log(
    plan: &RequestPlan,
    binding: &ProviderBinding,
    usage: &Usage,
) -> NormalizedResponse {
    NormalizedResponse {
        id: format!("chatcmpl_{}", uuid::Uuid::new_v4().simple()),
        object: "chat.completion".to_string(),
        created: now_ts(),
        model: format!("{}/{}", binding.provider.as_str(), plan.entry_id),
        choices: Vec::<Choice>::new(),
        usage: usage.clone(),
        metadata: ResponseMetadata {
            requested_model: plan.requested_model.clone(),
            requested_provider: plan.requested_provider.map(|p| p.as_str().to_string()),
            used_model: plan.entry_id.clone(),
            used_provider: binding.provider.as_str().to_string(),
            underlying_used_model: binding.provider_model.clone(),
        },
    }
}

#[allow(clippy::too_many_arguments)]
async fn seal_with_error(
    state: &AppState,
    org: &OrgContext,
    plan: &RequestPlan,
    req: &NormalizedRequest,
    request_id: &str,
    started_at: std::time::Instant,
    tx: &mpsc::Sender<SseFrame>,
    error: AppError,
    attempts: Vec<AttemptRecord>,
) {
    let _ = tx
        .send(SseFrame::Error {
            code: error.code.clone(),
            message: error.message.clone(),
        })
        .await;
    enqueue_error_log(state, org, plan, req, request_id, started_at, true, &error, attempts).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pricing() -> Pricing {
        Pricing {
            input_nano: 2_500,
            output_nano: 10_000,
            cached_input_nano: None,
            per_request_nano: 0,
            per_image_nano: 0,
        }
    }

    #[test]
    fn cost_multiplies_tokens_by_rates() {
        let usage = Usage::from_counts(15, 5, None, None, None);
        let cost = compute_cost(&usage, &pricing(), None).unwrap();
        assert_eq!(cost.input_nano, 37_500);
        assert_eq!(cost.output_nano, 50_000);
        assert_eq!(cost.total_nano, 87_500);
    }

    #[test]
    fn cached_tokens_bill_at_cached_rate() {
        let usage = Usage::from_counts(100, 10, None, None, Some(60));
        let mut p = pricing();
        p.cached_input_nano = Some(250);
        let cost = compute_cost(&usage, &p, None).unwrap();
        assert_eq!(cost.input_nano, 40 * 2_500);
        assert_eq!(cost.cached_nano, 60 * 250);
        assert_eq!(cost.output_nano, 10 * 10_000);
    }

    #[test]
    fn discount_scales_total_only() {
        let usage = Usage::from_counts(100, 0, None, None, None);
        let cost = compute_cost(&usage, &pricing(), Some(0.1)).unwrap();
        assert_eq!(cost.input_nano, 250_000);
        assert_eq!(cost.total_nano, 225_000);
    }

    #[test]
    fn cost_is_monotonic_in_token_counts() {
        let p = pricing();
        let small = compute_cost(&Usage::from_counts(10, 5, None, None, None), &p, None).unwrap();
        let more_prompt =
            compute_cost(&Usage::from_counts(20, 5, None, None, None), &p, None).unwrap();
        let more_output =
            compute_cost(&Usage::from_counts(10, 9, None, None, None), &p, None).unwrap();
        assert!(small.total_nano <= more_prompt.total_nano);
        assert!(small.total_nano <= more_output.total_nano);
    }

    #[test]
    fn multiplier_quantizes_to_nano_precision() {
        assert_eq!(
            scale_with_multiplier(1_000_000_000, 1.000_000_000_9),
            Some(1_000_000_000)
        );
        assert_eq!(scale_with_multiplier(1_000, 0.5), Some(500));
        assert_eq!(scale_with_multiplier(1_000, -1.0), None);
    }

    #[test]
    fn classification_follows_status() {
        let err = |status: StatusCode| {
            UpstreamCallError::new(
                UpstreamErrorKind::Http,
                Some(status),
                "upstream".to_string(),
            )
        };
        assert_eq!(
            classify(&err(StatusCode::TOO_MANY_REQUESTS)),
            ErrorClass::RateLimited
        );
        assert_eq!(
            classify(&err(StatusCode::SERVICE_UNAVAILABLE)),
            ErrorClass::Transient
        );
        assert_eq!(
            classify(&err(StatusCode::UNAUTHORIZED)),
            ErrorClass::UpstreamAuth
        );
        assert_eq!(
            classify(&err(StatusCode::UNPROCESSABLE_ENTITY)),
            ErrorClass::CapabilityRefusal
        );
        assert_eq!(
            classify(&err(StatusCode::BAD_REQUEST)),
            ErrorClass::UpstreamBadRequest
        );
        let network = UpstreamCallError::new(
            UpstreamErrorKind::Network,
            None,
            "connection reset".to_string(),
        );
        assert_eq!(classify(&network), ErrorClass::Transient);
    }

    #[test]
    fn retry_after_header_wins_over_backoff_table() {
        let policy = RetryPolicy::default();
        let delay = backoff_delay(&policy, 0, Some(3));
        assert_eq!(delay, std::time::Duration::from_secs(3));
        let backoff = backoff_delay(&policy, 0, None);
        assert!(backoff >= std::time::Duration::from_millis(200));
        assert!(backoff < std::time::Duration::from_millis(400));
    }

    #[test]
    fn estimate_grows_with_output_budget() {
        let catalog = crate::catalog::Catalog::builtin();
        let (entry, _) = catalog.lookup("gpt-4o").unwrap();
        let binding = entry.binding(ProviderId::Openai).unwrap();
        let mut req = crate::wire::NormalizedRequest {
            model: "gpt-4o".to_string(),
            messages: vec![crate::wire::ChatMessage::text(crate::wire::Role::User, "hi")],
            stream: None,
            temperature: None,
            top_p: None,
            max_tokens: Some(10),
            stop: None,
            seed: None,
            response_format: None,
            tools: None,
            tool_choice: None,
            parallel_tool_calls: None,
            provider: None,
            extra: serde_json::Map::new(),
        };
        let small = estimate_cost_nano(&req, binding);
        req.max_tokens = Some(1000);
        let large = estimate_cost_nano(&req, binding);
        assert!(small < large);
    }
}
