use crate::app::AppState;
use crate::auth::OrgContext;
use crate::dispatch::{self, DispatchOutcome, StreamMeta};
use crate::error::{AppError, AppResult};
use crate::wire::{NormalizedRequest, NormalizedResponse, SseFrame};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::Event;
use axum::response::{IntoResponse, Response, Sse};
use axum::Json;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;

pub async fn healthz() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render()
}

#[derive(Debug, Deserialize)]
pub struct ModelsQuery {
    #[serde(default)]
    pub include_deactivated: bool,
    #[serde(default)]
    pub exclude_deprecated: bool,
}

pub async fn list_models(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ModelsQuery>,
) -> AppResult<Response> {
    let _org = auth_org(&headers, &state).await?;
    let data = state
        .catalog
        .model_views(query.include_deactivated, query.exclude_deprecated);
    Ok(Json(json!({ "object": "list", "data": data })).into_response())
}

pub async fn create_chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> AppResult<Response> {
    let org = auth_org(&headers, &state).await?;
    let req = parse_request(body)?;
    let request_id = extract_request_id(&headers)
        .unwrap_or_else(|| format!("req_{}", uuid::Uuid::new_v4().simple()));
    let stream_requested = req.stream.unwrap_or(false);

    let outcome = dispatch::dispatch_chat(&state, &org, req, request_id).await?;
    match outcome {
        DispatchOutcome::Buffered(response) => {
            if stream_requested {
                // Buffered fallback for stream requests whose winning binding
                // cannot stream: replay the response as synthetic SSE.
                Ok(Sse::new(synthetic_sse(response)).into_response())
            } else {
                Ok(Json(response).into_response())
            }
        }
        DispatchOutcome::Stream { meta, frames } => {
            let chunk_meta = meta.clone();
            let events = frames
                .map(move |frame| Ok::<Event, Infallible>(frame_event(&chunk_meta, &frame)))
                .chain(futures_util::stream::iter(vec![Ok(
                    Event::default().data("[DONE]")
                )]));
            Ok(Sse::new(events).into_response())
        }
    }
}

async fn auth_org(headers: &HeaderMap, state: &AppState) -> AppResult<OrgContext> {
    let auth_header = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| AppError::new(StatusCode::UNAUTHORIZED, "unauthorized", "missing auth"))?;
    let token = auth_header
        .strip_prefix("Bearer ")
        .ok_or_else(|| AppError::new(StatusCode::UNAUTHORIZED, "unauthorized", "invalid auth"))?;
    state
        .auth
        .authenticate(token)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::new(StatusCode::UNAUTHORIZED, "unauthorized", "invalid api key"))
}

fn parse_request(body: Value) -> AppResult<NormalizedRequest> {
    let req: NormalizedRequest = serde_json::from_value(body).map_err(|err| {
        AppError::new(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            format!("invalid request body: {err}"),
        )
    })?;
    if req.model.trim().is_empty() {
        return Err(AppError::new(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "missing model",
        ));
    }
    if req.messages.is_empty() {
        return Err(AppError::new(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "messages must not be empty",
        )
        .with_param("messages"));
    }
    Ok(req)
}

fn extract_request_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.trim().is_empty())
        .map(|v| v.to_string())
}

fn frame_event(meta: &StreamMeta, frame: &SseFrame) -> Event {
    match frame {
        SseFrame::Delta {
            content,
            reasoning,
            tool_calls,
        } => {
            let mut delta = serde_json::Map::new();
            if let Some(content) = content {
                delta.insert("content".to_string(), Value::String(content.clone()));
            }
            if let Some(reasoning) = reasoning {
                delta.insert("reasoning".to_string(), Value::String(reasoning.clone()));
            }
            if let Some(tool_calls) = tool_calls {
                delta.insert(
                    "tool_calls".to_string(),
                    serde_json::to_value(tool_calls).unwrap_or(Value::Null),
                );
            }
            Event::default().data(
                chunk_envelope(meta, Value::Object(delta), Value::Null, None).to_string(),
            )
        }
        SseFrame::Done {
            finish_reason,
            usage,
        } => Event::default().data(
            chunk_envelope(
                meta,
                Value::Object(serde_json::Map::new()),
                Value::String(finish_reason.as_str().to_string()),
                Some(serde_json::to_value(usage).unwrap_or(Value::Null)),
            )
            .to_string(),
        ),
        SseFrame::Error { code, message } => Event::default().data(
            json!({
                "error": {
                    "message": message,
                    "type": "api_error",
                    "param": Value::Null,
                    "code": code,
                }
            })
            .to_string(),
        ),
    }
}

fn chunk_envelope(
    meta: &StreamMeta,
    delta: Value,
    finish_reason: Value,
    usage: Option<Value>,
) -> Value {
    let mut chunk = json!({
        "id": meta.id,
        "object": "chat.completion.chunk",
        "created": meta.created,
        "model": meta.model,
        "choices": [{
            "index": 0,
            "delta": delta,
            "finish_reason": finish_reason,
        }],
    });
    if let Some(usage) = usage {
        chunk
            .as_object_mut()
            .expect("chunk object")
            .insert("usage".to_string(), usage);
    }
    chunk
}

/// Replay a buffered response as a one-delta stream followed by the terminal
/// chunk and the done sentinel.
fn synthetic_sse(
    response: NormalizedResponse,
) -> impl futures_util::Stream<Item = Result<Event, Infallible>> + Send + 'static {
    let meta = StreamMeta {
        id: response.id.clone(),
        created: response.created,
        model: response.model.clone(),
    };
    let mut events: Vec<Event> = Vec::new();
    if let Some(choice) = response.choices.first() {
        let mut delta = serde_json::Map::new();
        delta.insert(
            "role".to_string(),
            Value::String("assistant".to_string()),
        );
        if let Some(content) = &choice.message.content {
            delta.insert("content".to_string(), Value::String(content.clone()));
        }
        if let Some(reasoning) = &choice.message.reasoning {
            delta.insert("reasoning".to_string(), Value::String(reasoning.clone()));
        }
        if let Some(tool_calls) = &choice.message.tool_calls {
            delta.insert(
                "tool_calls".to_string(),
                serde_json::to_value(tool_calls).unwrap_or(Value::Null),
            );
        }
        events.push(Event::default().data(
            chunk_envelope(&meta, Value::Object(delta), Value::Null, None).to_string(),
        ));
        events.push(Event::default().data(
            chunk_envelope(
                &meta,
                Value::Object(serde_json::Map::new()),
                Value::String(choice.finish_reason.as_str().to_string()),
                Some(serde_json::to_value(&response.usage).unwrap_or(Value::Null)),
            )
            .to_string(),
        ));
    }
    events.push(Event::default().data("[DONE]"));
    futures_util::stream::iter(events.into_iter().map(Ok))
}
