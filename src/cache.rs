use crate::error::AppResult;
use crate::wire::{NormalizedRequest, NormalizedResponse};
use serde_json::json;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Filled,
}

#[derive(Clone)]
struct StoredEntry {
    response: NormalizedResponse,
    created: Instant,
    ttl: Duration,
}

impl StoredEntry {
    fn fresh(&self) -> bool {
        self.created.elapsed() < self.ttl
    }
}

/// In-memory response cache keyed by request fingerprint, with at most one
/// concurrent filler per key.
#[derive(Clone)]
pub struct ResponseCache {
    entries: Arc<Mutex<HashMap<String, StoredEntry>>>,
    fills: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
    default_ttl: Duration,
}

impl ResponseCache {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            fills: Arc::new(Mutex::new(HashMap::new())),
            default_ttl,
        }
    }

    pub async fn get(&self, key: &str) -> Option<NormalizedResponse> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if entry.fresh() => Some(entry.response.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Last write wins on concurrent puts.
    pub async fn put(&self, key: &str, response: NormalizedResponse) {
        let mut entries = self.entries.lock().await;
        entries.retain(|_, entry| entry.fresh());
        entries.insert(
            key.to_string(),
            StoredEntry {
                response,
                created: Instant::now(),
                ttl: self.default_ttl,
            },
        );
    }

    /// Run `fill` at most once per key across concurrent callers. Waiters
    /// observe the filler's stored result; a failed fill stores nothing, and
    /// the next waiter in line becomes the filler itself.
    pub async fn get_or_compute<F, Fut>(
        &self,
        key: &str,
        fill: F,
    ) -> AppResult<(NormalizedResponse, CacheStatus)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = AppResult<NormalizedResponse>>,
    {
        if let Some(found) = self.get(key).await {
            return Ok((found, CacheStatus::Hit));
        }

        let cell = {
            let mut fills = self.fills.lock().await;
            fills
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = cell.lock().await;

        // A filler that held the cell ahead of us may have stored the value.
        if let Some(found) = self.get(key).await {
            return Ok((found, CacheStatus::Hit));
        }

        let response = fill().await?;
        self.put(key, response.clone()).await;
        {
            let mut fills = self.fills.lock().await;
            fills.remove(key);
        }
        Ok((response, CacheStatus::Filled))
    }
}

/// Streaming and non-deterministic requests bypass the cache entirely.
pub fn cacheable(req: &NormalizedRequest) -> bool {
    if req.stream.unwrap_or(false) {
        return false;
    }
    req.temperature == Some(0.0) || req.seed.is_some()
}

/// Content-addressed fingerprint of the normalized request, excluding the
/// stream flag and routing hints.
pub fn fingerprint(model_id: &str, req: &NormalizedRequest) -> String {
    let canonical = json!({
        "model": model_id,
        "messages": req.messages,
        "tools": req.tools,
        "tool_choice": req.tool_choice,
        "temperature": req.temperature,
        "top_p": req.top_p,
        "max_tokens": req.max_tokens,
        "stop": req.stop,
        "seed": req.seed,
        "response_format": req.response_format,
    });
    let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
    blake3::hash(&bytes).to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use crate::wire::{
        AssistantMessage, ChatMessage, Choice, FinishReason, NormalizedResponse, ResponseMetadata,
        Role, Usage,
    };
    use axum::http::StatusCode;
    use serde_json::Map;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn response(text: &str) -> NormalizedResponse {
        NormalizedResponse {
            id: "chatcmpl_test".to_string(),
            object: "chat.completion".to_string(),
            created: 0,
            model: "openai/gpt-4o".to_string(),
            choices: vec![Choice {
                index: 0,
                message: AssistantMessage::new(Some(text.to_string())),
                finish_reason: FinishReason::Stop,
            }],
            usage: Usage::from_counts(5, 1, None, None, None),
            metadata: ResponseMetadata {
                requested_model: "gpt-4o".to_string(),
                requested_provider: None,
                used_model: "gpt-4o".to_string(),
                used_provider: "openai".to_string(),
                underlying_used_model: "gpt-4o".to_string(),
            },
        }
    }

    fn request(model: &str, temperature: Option<f64>) -> NormalizedRequest {
        NormalizedRequest {
            model: model.to_string(),
            messages: vec![ChatMessage::text(Role::User, "hi")],
            stream: None,
            temperature,
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
    fn cacheable_requires_determinism() {
        assert!(cacheable(&request("m", Some(0.0))));
        assert!(!cacheable(&request("m", Some(0.7))));
        let mut seeded = request("m", None);
        seeded.seed = Some(42);
        assert!(cacheable(&seeded));
        let mut streaming = request("m", Some(0.0));
        streaming.stream = Some(true);
        assert!(!cacheable(&streaming));
    }

    #[test]
    fn fingerprint_ignores_stream_flag() {
        let plain = request("m", Some(0.0));
        let mut streaming = plain.clone();
        streaming.stream = Some(true);
        assert_eq!(fingerprint("m", &plain), fingerprint("m", &streaming));

        let other = request("m", Some(0.5));
        assert_ne!(fingerprint("m", &plain), fingerprint("m", &other));
    }

    #[tokio::test]
    async fn entries_expire_after_ttl() {
        let cache = ResponseCache::new(Duration::from_millis(20));
        cache.put("k", response("a")).await;
        assert!(cache.get("k").await.is_some());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(cache.get("k").await.is_none());
    }

    #[tokio::test]
    async fn single_flight_runs_filler_once() {
        let cache = ResponseCache::new(Duration::from_secs(60));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_compute("k", || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        Ok(response("slow"))
                    })
                    .await
                    .unwrap()
            }));
        }

        let mut hits = 0;
        for handle in handles {
            let (resp, status) = handle.await.unwrap();
            assert_eq!(resp.choices[0].message.content.as_deref(), Some("slow"));
            if status == CacheStatus::Hit {
                hits += 1;
            }
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(hits, 7);
    }

    #[tokio::test]
    async fn failed_fill_is_not_cached() {
        let cache = ResponseCache::new(Duration::from_secs(60));
        let err = cache
            .get_or_compute("k", || async {
                Err::<NormalizedResponse, _>(AppError::new(
                    StatusCode::BAD_GATEWAY,
                    "upstream_error",
                    "boom",
                ))
            })
            .await;
        assert!(err.is_err());

        let (resp, status) = cache
            .get_or_compute("k", || async { Ok(response("retry")) })
            .await
            .unwrap();
        assert_eq!(status, CacheStatus::Filled);
        assert_eq!(resp.choices[0].message.content.as_deref(), Some("retry"));
    }
}
