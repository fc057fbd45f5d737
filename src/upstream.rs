use axum::http::StatusCode;
use serde_json::Value;

/// Fully resolved outbound call built by a provider adapter: final URL,
/// translated body, auth, and any provider-specific headers.
#[derive(Debug, Clone)]
pub struct WireRequest {
    pub url: String,
    pub body: Value,
    pub auth: WireAuth,
    pub extra_headers: Vec<(&'static str, String)>,
}

#[derive(Debug, Clone)]
pub enum WireAuth {
    Bearer(String),
    Header { name: &'static str, value: String },
    Query { param: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamErrorKind {
    Network,
    Http,
}

#[derive(Debug, Clone)]
pub struct UpstreamCallError {
    pub kind: UpstreamErrorKind,
    pub status: Option<StatusCode>,
    pub code: Option<String>,
    pub retry_after: Option<u64>,
    pub message: String,
}

impl UpstreamCallError {
    pub fn new(kind: UpstreamErrorKind, status: Option<StatusCode>, message: String) -> Self {
        Self {
            kind,
            status,
            code: None,
            retry_after: None,
            message,
        }
    }

    pub fn with_code(mut self, code: Option<String>) -> Self {
        self.code = code;
        self
    }

    pub fn with_retry_after(mut self, retry_after: Option<u64>) -> Self {
        self.retry_after = retry_after;
        self
    }
}

/// One buffered upstream call; the response body parsed as JSON.
pub async fn send_json(
    client: &reqwest::Client,
    wire: &WireRequest,
    timeout_ms: u64,
) -> Result<Value, UpstreamCallError> {
    let resp = send_raw(client, wire, timeout_ms).await?;
    let status = resp.status();
    let text = resp.text().await.map_err(|err| {
        UpstreamCallError::new(UpstreamErrorKind::Network, Some(status), err.to_string())
    })?;
    serde_json::from_str(&text).map_err(|err| {
        UpstreamCallError::new(UpstreamErrorKind::Http, Some(status), err.to_string())
    })
}

/// One upstream call returning the raw response for SSE relay. Non-success
/// statuses are drained and surfaced as classified errors here so the caller
/// only streams bodies that began successfully.
pub async fn send_raw(
    client: &reqwest::Client,
    wire: &WireRequest,
    timeout_ms: u64,
) -> Result<reqwest::Response, UpstreamCallError> {
    let mut req = client
        .post(&wire.url)
        .timeout(std::time::Duration::from_millis(timeout_ms))
        .json(&wire.body);
    req = match &wire.auth {
        WireAuth::Bearer(token) => req.bearer_auth(token),
        WireAuth::Header { name, value } => req.header(*name, value),
        WireAuth::Query { param, value } => req.query(&[(param, value)]),
    };
    for (name, value) in &wire.extra_headers {
        req = req.header(*name, value);
    }
    let resp = req
        .send()
        .await
        .map_err(|err| UpstreamCallError::new(UpstreamErrorKind::Network, None, err.to_string()))?;
    let status = resp.status();
    if !status.is_success() {
        let retry_after = parse_retry_after(resp.headers());
        let text = resp.text().await.unwrap_or_default();
        let code = extract_error_code(&text);
        return Err(UpstreamCallError::new(
            UpstreamErrorKind::Http,
            Some(status),
            format!("upstream status {}: {}", status, text),
        )
        .with_code(code)
        .with_retry_after(retry_after));
    }
    Ok(resp)
}

pub fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    if path.is_empty() {
        base.to_string()
    } else {
        format!("{}/{}", base, path)
    }
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
}

fn extract_error_code(text: &str) -> Option<String> {
    let value: Value = serde_json::from_str(text).ok()?;
    value
        .get("error")
        .and_then(|v| v.get("code"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_url_handles_slashes() {
        assert_eq!(
            join_url("https://api.openai.com/", "/v1/chat/completions"),
            "https://api.openai.com/v1/chat/completions"
        );
        assert_eq!(join_url("https://x.test", ""), "https://x.test");
    }

    #[test]
    fn error_code_extracted_from_envelope() {
        let text = r#"{"error":{"code":"rate_limited","message":"slow down"}}"#;
        assert_eq!(extract_error_code(text).as_deref(), Some("rate_limited"));
        assert_eq!(extract_error_code("not json"), None);
    }
}
