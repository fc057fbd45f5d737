use axum::body::Body;
use axum::extract::State;
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{Request, StatusCode};
use axum::response::sse::Event;
use axum::response::{IntoResponse, Sse};
use axum::routing::post;
use axum::{Json, Router};
use http_body_util::BodyExt;
use modelgate::app::{build_app, load_state_with_runtime, AppState, RuntimeConfig};
use modelgate::dispatch::RetryPolicy;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tower::ServiceExt;

struct TestContext {
    state: AppState,
    auth_header: String,
    _temp_dir: TempDir,
}

impl TestContext {
    fn app(&self) -> Router {
        build_app(self.state.clone())
    }
}

async fn build_context(balance_nano: i128, retry: RetryPolicy) -> TestContext {
    let temp_dir = TempDir::new().expect("temp dir");
    let db_path = temp_dir.path().join("modelgate.db");
    let runtime = RuntimeConfig {
        listen: "127.0.0.1:0".to_string(),
        metrics_path: "/metrics".to_string(),
        database_dsn: format!("sqlite://{}", db_path.display()),
        request_timeout_ms: 5_000,
        cache_ttl_secs: 60,
        log_queue_capacity: 64,
        retry,
    };
    let state = load_state_with_runtime(runtime).await.expect("load state");
    state
        .ledger
        .create_org("org_test", "Test Org", balance_nano, false)
        .await
        .expect("create org");
    let (_, key) = state
        .auth
        .create_api_key("org_test", Some("proj_test"), "default", &[], &[])
        .await
        .expect("create key");
    TestContext {
        state,
        auth_header: format!("Bearer {key}"),
        _temp_dir: temp_dir,
    }
}

async fn serve_router(router: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind stub");
    let addr = listener.local_addr().expect("stub addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    addr
}

fn chat_request(ctx: &TestContext, body: &Value, request_id: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header(AUTHORIZATION, &ctx.auth_header)
        .header(CONTENT_TYPE, "application/json")
        .header("x-request-id", request_id)
        .body(Body::from(body.to_string()))
        .expect("request")
}

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .expect("collect body")
        .to_bytes()
        .to_vec()
}

async fn body_json(response: axum::response::Response) -> Value {
    serde_json::from_slice(&body_bytes(response).await).expect("json body")
}

fn sse_data_payloads(raw: &str) -> Vec<String> {
    raw.lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .map(|s| s.to_string())
        .collect()
}

async fn org_balance(ctx: &TestContext) -> i128 {
    ctx.state
        .ledger
        .get_balance("org_test")
        .await
        .expect("balance query")
        .expect("org exists")
        .balance_nano_usd
}

#[tokio::test]
async fn openai_happy_path_preserves_usage_and_metadata() {
    async fn upstream(Json(body): Json<Value>) -> Json<Value> {
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["messages"][0]["content"], "hi");
        Json(json!({
            "id": "x",
            "model": "gpt-4o-2024-11-20",
            "choices": [{
                "message": {"role": "assistant", "content": "hello"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 5, "completion_tokens": 1, "total_tokens": 6}
        }))
    }
    let addr = serve_router(Router::new().route("/v1/chat/completions", post(upstream))).await;
    std::env::set_var("LLM_OPENAI_API_KEY", "sk-test-openai");
    std::env::set_var("LLM_OPENAI_BASE_URL", format!("http://{addr}"));

    let ctx = build_context(1_000_000_000, RetryPolicy::default()).await;
    let response = ctx
        .app()
        .oneshot(chat_request(
            &ctx,
            &json!({
                "model": "gpt-4o",
                "messages": [{"role": "user", "content": "hi"}],
                "stream": false
            }),
            "req_happy_1",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let value = body_json(response).await;

    assert_eq!(value["model"], "openai/gpt-4o");
    assert_eq!(value["choices"][0]["message"]["content"], "hello");
    assert_eq!(value["choices"][0]["finish_reason"], "stop");
    assert_eq!(value["usage"]["prompt_tokens"], 5);
    assert_eq!(value["usage"]["completion_tokens"], 1);
    assert_eq!(value["usage"]["total_tokens"], 6);
    assert_eq!(value["metadata"]["used_provider"], "openai");
    assert_eq!(value["metadata"]["requested_model"], "gpt-4o");
    assert_eq!(value["metadata"]["underlying_used_model"], "gpt-4o-2024-11-20");

    // 5 prompt tokens at 2500 nano + 1 completion token at 10000 nano.
    assert_eq!(org_balance(&ctx).await, 1_000_000_000 - 22_500);

    ctx.state.log_queue.flush().await;
    let logs = ctx.state.log_store.list_for_org("org_test").await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].outcome, "success");
    assert_eq!(logs[0].provider_used.as_deref(), Some("openai"));
    assert_eq!(logs[0].prompt_tokens, Some(5));
}

#[tokio::test]
async fn anthropic_translation_splits_system_and_maps_stop_reason() {
    let captured: Arc<Mutex<Option<Value>>> = Arc::new(Mutex::new(None));
    async fn upstream(
        State(captured): State<Arc<Mutex<Option<Value>>>>,
        Json(body): Json<Value>,
    ) -> Json<Value> {
        *captured.lock().unwrap() = Some(body);
        Json(json!({
            "id": "msg_1",
            "model": "claude-3-5-sonnet-20241022",
            "content": [{"type": "text", "text": "bonjour"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 2, "output_tokens": 3}
        }))
    }
    let addr = serve_router(
        Router::new()
            .route("/v1/messages", post(upstream))
            .with_state(captured.clone()),
    )
    .await;
    std::env::set_var("LLM_ANTHROPIC_API_KEY", "sk-test-anthropic");
    std::env::set_var("LLM_ANTHROPIC_BASE_URL", format!("http://{addr}"));

    let ctx = build_context(1_000_000_000, RetryPolicy::default()).await;
    let response = ctx
        .app()
        .oneshot(chat_request(
            &ctx,
            &json!({
                "model": "claude-3-5-sonnet",
                "messages": [
                    {"role": "system", "content": "S"},
                    {"role": "user", "content": "U"}
                ]
            }),
            "req_anthropic_1",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let value = body_json(response).await;

    let sent = captured.lock().unwrap().clone().expect("upstream body");
    assert_eq!(sent["system"], "S");
    assert_eq!(sent["max_tokens"], 1024);
    let messages = sent["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["role"], "user");
    assert_eq!(messages[0]["content"][0]["text"], "U");

    assert_eq!(value["choices"][0]["finish_reason"], "stop");
    assert_eq!(value["usage"]["prompt_tokens"], 2);
    assert_eq!(value["usage"]["completion_tokens"], 3);
    assert_eq!(value["usage"]["total_tokens"], 5);
}

#[tokio::test]
async fn fallback_retries_then_advances_to_next_provider() {
    let failures = Arc::new(AtomicUsize::new(0));
    async fn failing(State(count): State<Arc<AtomicUsize>>) -> impl IntoResponse {
        count.fetch_add(1, Ordering::SeqCst);
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": {"code": "overloaded", "message": "try later"}})),
        )
    }
    async fn healthy(Json(_body): Json<Value>) -> Json<Value> {
        Json(json!({
            "id": "chatcmpl_b",
            "model": "meta-llama/Meta-Llama-3.1-70B-Instruct-Turbo",
            "choices": [{
                "message": {"role": "assistant", "content": "recovered"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 4, "completion_tokens": 2, "total_tokens": 6}
        }))
    }
    let failing_addr = serve_router(
        Router::new()
            .route("/v1/chat/completions", post(failing))
            .with_state(failures.clone()),
    )
    .await;
    let healthy_addr =
        serve_router(Router::new().route("/v1/chat/completions", post(healthy))).await;

    std::env::set_var("LLM_GROQ_API_KEY", "sk-test-groq");
    std::env::set_var("LLM_GROQ_BASE_URL", format!("http://{failing_addr}"));
    std::env::set_var("LLM_TOGETHER_API_KEY", "sk-test-together");
    std::env::set_var("LLM_TOGETHER_BASE_URL", format!("http://{healthy_addr}"));

    let retry = RetryPolicy {
        max_retries_per_candidate: 1,
        backoff_ms: vec![1, 1],
    };
    let ctx = build_context(1_000_000_000, retry).await;
    let response = ctx
        .app()
        .oneshot(chat_request(
            &ctx,
            &json!({
                "model": "llama-3.1-70b-instruct",
                "messages": [{"role": "user", "content": "hello"}]
            }),
            "req_fallback_1",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let value = body_json(response).await;

    assert_eq!(value["metadata"]["used_provider"], "together");
    assert_eq!(value["choices"][0]["message"]["content"], "recovered");
    assert_eq!(failures.load(Ordering::SeqCst), 2);

    ctx.state.log_queue.flush().await;
    let logs = ctx.state.log_store.list_for_org("org_test").await.unwrap();
    assert_eq!(logs.len(), 1);
    let attempts = logs[0].attempts_json.as_ref().expect("attempt chain");
    let chain = attempts.as_array().unwrap();
    assert_eq!(chain.len(), 2);
    for attempt in chain {
        assert_eq!(attempt["provider"], "groq");
        assert_eq!(attempt["status"], 503);
    }
}

#[tokio::test]
async fn streaming_relays_deltas_and_debits_from_terminal_usage() {
    async fn upstream(Json(body): Json<Value>) -> impl IntoResponse {
        assert_eq!(body["stream"], true);
        let chunk = |delta: Value, finish: Value| {
            json!({
                "id": "chatcmpl_s",
                "object": "chat.completion.chunk",
                "created": 0,
                "model": "deepseek-chat",
                "choices": [{"index": 0, "delta": delta, "finish_reason": finish}]
            })
        };
        let events: Vec<Result<Event, Infallible>> = vec![
            Ok(Event::default().data(chunk(json!({"content": "Hel"}), Value::Null).to_string())),
            Ok(Event::default().data(chunk(json!({"content": "lo "}), Value::Null).to_string())),
            Ok(Event::default().data(chunk(json!({"content": "world"}), Value::Null).to_string())),
            Ok(Event::default()
                .data(chunk(json!({}), Value::String("stop".to_string())).to_string())),
            Ok(Event::default().data(
                json!({
                    "id": "chatcmpl_s",
                    "object": "chat.completion.chunk",
                    "created": 0,
                    "model": "deepseek-chat",
                    "choices": [],
                    "usage": {"prompt_tokens": 10, "completion_tokens": 7, "total_tokens": 17}
                })
                .to_string(),
            )),
            Ok(Event::default().data("[DONE]")),
        ];
        Sse::new(futures_util::stream::iter(events))
    }
    let addr = serve_router(Router::new().route("/v1/chat/completions", post(upstream))).await;
    std::env::set_var("LLM_DEEPSEEK_API_KEY", "sk-test-deepseek");
    std::env::set_var("LLM_DEEPSEEK_BASE_URL", format!("http://{addr}"));

    let ctx = build_context(1_000_000_000, RetryPolicy::default()).await;
    let response = ctx
        .app()
        .oneshot(chat_request(
            &ctx,
            &json!({
                "model": "deepseek-chat",
                "messages": [{"role": "user", "content": "hi"}],
                "stream": true
            }),
            "req_stream_1",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let raw = String::from_utf8(body_bytes(response).await).unwrap();
    let payloads = sse_data_payloads(&raw);

    assert_eq!(payloads.last().map(|s| s.as_str()), Some("[DONE]"));
    let frames: Vec<Value> = payloads[..payloads.len() - 1]
        .iter()
        .map(|p| serde_json::from_str(p).unwrap())
        .collect();
    assert_eq!(frames.len(), 4);

    let text: String = frames[..3]
        .iter()
        .map(|f| {
            f["choices"][0]["delta"]["content"]
                .as_str()
                .unwrap_or_default()
                .to_string()
        })
        .collect();
    assert_eq!(text, "Hello world");

    let terminal = &frames[3];
    assert_eq!(terminal["choices"][0]["finish_reason"], "stop");
    assert_eq!(terminal["usage"]["prompt_tokens"], 10);
    assert_eq!(terminal["usage"]["completion_tokens"], 7);

    // 10 tokens at 270 nano + 7 tokens at 1100 nano.
    ctx.state.log_queue.flush().await;
    assert_eq!(org_balance(&ctx).await, 1_000_000_000 - 10_400);
    let logs = ctx.state.log_store.list_for_org("org_test").await.unwrap();
    assert_eq!(logs.len(), 1);
    assert!(logs[0].is_stream);
    assert_eq!(logs[0].prompt_tokens, Some(10));
    assert_eq!(logs[0].completion_tokens, Some(7));
}

#[tokio::test]
async fn deterministic_repeat_serves_from_cache_without_second_call() {
    let calls = Arc::new(AtomicUsize::new(0));
    async fn upstream(State(calls): State<Arc<AtomicUsize>>, Json(_): Json<Value>) -> Json<Value> {
        calls.fetch_add(1, Ordering::SeqCst);
        Json(json!({
            "id": "chatcmpl_c",
            "model": "grok-2-1212",
            "choices": [{
                "message": {"role": "assistant", "content": "cached answer"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 5, "completion_tokens": 1, "total_tokens": 6}
        }))
    }
    let addr = serve_router(
        Router::new()
            .route("/v1/chat/completions", post(upstream))
            .with_state(calls.clone()),
    )
    .await;
    std::env::set_var("LLM_XAI_API_KEY", "sk-test-xai");
    std::env::set_var("LLM_XAI_BASE_URL", format!("http://{addr}"));

    let ctx = build_context(1_000_000_000, RetryPolicy::default()).await;
    let body = json!({
        "model": "grok-2",
        "messages": [{"role": "user", "content": "what is 2+2?"}],
        "temperature": 0.0
    });

    let first = ctx
        .app()
        .oneshot(chat_request(&ctx, &body, "req_cache_1"))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    let first = body_json(first).await;

    let second = ctx
        .app()
        .oneshot(chat_request(&ctx, &body, "req_cache_2"))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::OK);
    let second = body_json(second).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        first["choices"][0]["message"]["content"],
        second["choices"][0]["message"]["content"]
    );

    // Only the fill pays: 5 tokens at 2000 nano + 1 token at 10000 nano.
    assert_eq!(org_balance(&ctx).await, 1_000_000_000 - 20_000);

    ctx.state.log_queue.flush().await;
    let logs = ctx.state.log_store.list_for_org("org_test").await.unwrap();
    assert_eq!(logs.len(), 2);
    let outcomes: Vec<&str> = logs.iter().map(|l| l.outcome.as_str()).collect();
    assert!(outcomes.contains(&"success"));
    assert!(outcomes.contains(&"success_cached"));
    let cached = logs.iter().find(|l| l.outcome == "success_cached").unwrap();
    assert_eq!(cached.charged_nano, Some(0));
}

#[tokio::test]
async fn exhausted_candidates_surface_502_with_attempt_chain() {
    async fn failing() -> impl IntoResponse {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": {"code": "overloaded", "message": "busy"}})),
        )
    }
    let addr = serve_router(Router::new().route("/v1/chat/completions", post(failing))).await;
    std::env::set_var("LLM_MISTRAL_API_KEY", "sk-test-mistral");
    std::env::set_var("LLM_MISTRAL_BASE_URL", format!("http://{addr}"));

    let retry = RetryPolicy {
        max_retries_per_candidate: 1,
        backoff_ms: vec![1, 1],
    };
    let ctx = build_context(1_000_000_000, retry).await;
    let response = ctx
        .app()
        .oneshot(chat_request(
            &ctx,
            &json!({
                "model": "mistral-large",
                "messages": [{"role": "user", "content": "hi"}]
            }),
            "req_exhausted_1",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let value = body_json(response).await;
    assert_eq!(value["error"]["code"], "upstream_unavailable");

    ctx.state.log_queue.flush().await;
    let logs = ctx.state.log_store.list_for_org("org_test").await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].outcome, "error");
    let chain = logs[0]
        .attempts_json
        .as_ref()
        .expect("attempt chain")
        .as_array()
        .unwrap()
        .clone();
    assert_eq!(chain.len(), 2);
    assert!(chain.iter().all(|a| a["provider"] == "mistral"));
}

#[tokio::test]
async fn zero_balance_fails_before_any_upstream_call() {
    let ctx = build_context(0, RetryPolicy::default()).await;
    let response = ctx
        .app()
        .oneshot(chat_request(
            &ctx,
            &json!({
                "model": "mistral-large",
                "messages": [{"role": "user", "content": "hi"}]
            }),
            "req_broke_1",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
    let value = body_json(response).await;
    assert_eq!(value["error"]["code"], "insufficient_credits");

    ctx.state.log_queue.flush().await;
    let logs = ctx.state.log_store.list_for_org("org_test").await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].outcome, "error");
    assert_eq!(logs[0].error_code.as_deref(), Some("insufficient_credits"));
}

#[tokio::test]
async fn unknown_model_is_rejected_with_400() {
    let ctx = build_context(1_000_000_000, RetryPolicy::default()).await;
    let response = ctx
        .app()
        .oneshot(chat_request(
            &ctx,
            &json!({
                "model": "model-that-does-not-exist",
                "messages": [{"role": "user", "content": "hi"}]
            }),
            "req_unknown_1",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let value = body_json(response).await;
    assert_eq!(value["error"]["code"], "unknown_model");
}

#[tokio::test]
async fn missing_bearer_token_is_unauthorized() {
    let ctx = build_context(1_000_000_000, RetryPolicy::default()).await;
    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({"model": "gpt-4o", "messages": [{"role": "user", "content": "hi"}]}).to_string(),
        ))
        .unwrap();
    let response = ctx.app().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn models_listing_returns_catalog_views() {
    let ctx = build_context(1_000_000_000, RetryPolicy::default()).await;
    let request = Request::builder()
        .method("GET")
        .uri("/v1/models")
        .header(AUTHORIZATION, &ctx.auth_header)
        .body(Body::empty())
        .unwrap();
    let response = ctx.app().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let value = body_json(response).await;
    let data = value["data"].as_array().unwrap();
    assert!(data.iter().any(|m| m["id"] == "gpt-4o"));
    let gpt4o = data.iter().find(|m| m["id"] == "gpt-4o").unwrap();
    assert!(gpt4o["providers"]
        .as_array()
        .unwrap()
        .iter()
        .any(|p| p["provider_id"] == "openai"));
    assert_eq!(gpt4o["architecture"]["input_modalities"][0], "text");
}
