use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{Pool, Row, Sqlite};
use tokio::sync::{mpsc, oneshot};

pub const OUTCOME_SUCCESS: &str = "success";
pub const OUTCOME_SUCCESS_CACHED: &str = "success_cached";
pub const OUTCOME_ERROR: &str = "error";
pub const OUTCOME_CLIENT_DISCONNECT: &str = "client_disconnect";

/// One immutable record per completed request, success or failure.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub request_id: String,
    pub org_id: String,
    pub project_id: Option<String>,
    pub model_requested: String,
    pub provider_requested: Option<String>,
    pub model_used: Option<String>,
    pub provider_used: Option<String>,
    pub underlying_model: Option<String>,
    pub is_stream: bool,
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub reasoning_tokens: Option<u64>,
    pub cached_tokens: Option<u64>,
    pub input_cost_nano: Option<i128>,
    pub output_cost_nano: Option<i128>,
    pub cached_cost_nano: Option<i128>,
    pub request_cost_nano: Option<i128>,
    pub total_cost_nano: Option<i128>,
    pub charged_nano: Option<i128>,
    pub ttfb_ms: Option<u64>,
    pub duration_ms: Option<u64>,
    pub outcome: String,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub error_http_status: Option<u16>,
    /// Full attempt chain: `[{provider, channel?, status?, error}]`.
    pub attempts_json: Option<Value>,
    pub prompt_json: Option<Value>,
    pub response_json: Option<Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct RequestLogStore {
    pool: Pool<Sqlite>,
}

impl RequestLogStore {
    pub async fn new(pool: Pool<Sqlite>) -> Result<Self, String> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS request_logs (
                id TEXT PRIMARY KEY,
                request_id TEXT NOT NULL,
                org_id TEXT NOT NULL,
                project_id TEXT,
                model_requested TEXT NOT NULL,
                provider_requested TEXT,
                model_used TEXT,
                provider_used TEXT,
                underlying_model TEXT,
                is_stream INTEGER NOT NULL DEFAULT 0,
                prompt_tokens INTEGER,
                completion_tokens INTEGER,
                reasoning_tokens INTEGER,
                cached_tokens INTEGER,
                input_cost_nano TEXT,
                output_cost_nano TEXT,
                cached_cost_nano TEXT,
                request_cost_nano TEXT,
                total_cost_nano TEXT,
                charged_nano TEXT,
                ttfb_ms INTEGER,
                duration_ms INTEGER,
                outcome TEXT NOT NULL,
                error_code TEXT,
                error_message TEXT,
                error_http_status INTEGER,
                attempts_json TEXT,
                prompt_json TEXT,
                response_json TEXT,
                created_at TEXT NOT NULL
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_request_logs_org_time ON request_logs(org_id, created_at)",
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        Ok(Self { pool })
    }

    pub async fn insert(&self, record: &LogRecord) -> Result<(), String> {
        let mut tx = self.pool.begin().await.map_err(|e| e.to_string())?;
        insert_one(&mut tx, record).await?;
        tx.commit().await.map_err(|e| e.to_string())
    }

    pub async fn insert_batch(&self, records: &[LogRecord]) -> Result<(), String> {
        if records.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await.map_err(|e| e.to_string())?;
        for record in records {
            insert_one(&mut tx, record).await?;
        }
        tx.commit().await.map_err(|e| e.to_string())
    }

    pub async fn count_for_org(&self, org_id: &str) -> Result<u64, String> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM request_logs WHERE org_id = ?")
            .bind(org_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        Ok(row.try_get::<i64, _>("n").unwrap_or(0) as u64)
    }

    pub async fn list_for_org(&self, org_id: &str) -> Result<Vec<StoredLogRow>, String> {
        let rows = sqlx::query(
            r#"SELECT request_id, model_requested, provider_used, outcome, is_stream,
                      prompt_tokens, completion_tokens, charged_nano, attempts_json, error_code
               FROM request_logs WHERE org_id = ? ORDER BY created_at ASC"#,
        )
        .bind(org_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        let mut out = Vec::new();
        for row in rows {
            out.push(StoredLogRow {
                request_id: row.try_get("request_id").map_err(|e| e.to_string())?,
                model_requested: row.try_get("model_requested").map_err(|e| e.to_string())?,
                provider_used: row.try_get("provider_used").ok(),
                outcome: row.try_get("outcome").map_err(|e| e.to_string())?,
                is_stream: row.try_get::<i64, _>("is_stream").unwrap_or(0) == 1,
                prompt_tokens: row.try_get::<i64, _>("prompt_tokens").ok().map(|v| v as u64),
                completion_tokens: row
                    .try_get::<i64, _>("completion_tokens")
                    .ok()
                    .map(|v| v as u64),
                charged_nano: row
                    .try_get::<String, _>("charged_nano")
                    .ok()
                    .and_then(|s| s.parse::<i128>().ok()),
                attempts_json: row
                    .try_get::<String, _>("attempts_json")
                    .ok()
                    .and_then(|s| serde_json::from_str(&s).ok()),
                error_code: row.try_get("error_code").ok(),
            });
        }
        Ok(out)
    }
}

#[derive(Debug, Clone)]
pub struct StoredLogRow {
    pub request_id: String,
    pub model_requested: String,
    pub provider_used: Option<String>,
    pub outcome: String,
    pub is_stream: bool,
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub charged_nano: Option<i128>,
    pub attempts_json: Option<Value>,
    pub error_code: Option<String>,
}

async fn insert_one(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    record: &LogRecord,
) -> Result<(), String> {
    sqlx::query(
        r#"INSERT INTO request_logs (
            id, request_id, org_id, project_id, model_requested, provider_requested,
            model_used, provider_used, underlying_model, is_stream,
            prompt_tokens, completion_tokens, reasoning_tokens, cached_tokens,
            input_cost_nano, output_cost_nano, cached_cost_nano, request_cost_nano,
            total_cost_nano, charged_nano, ttfb_ms, duration_ms, outcome,
            error_code, error_message, error_http_status, attempts_json,
            prompt_json, response_json, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(uuid::Uuid::new_v4().to_string())
    .bind(&record.request_id)
    .bind(&record.org_id)
    .bind(&record.project_id)
    .bind(&record.model_requested)
    .bind(&record.provider_requested)
    .bind(&record.model_used)
    .bind(&record.provider_used)
    .bind(&record.underlying_model)
    .bind(if record.is_stream { 1 } else { 0 })
    .bind(record.prompt_tokens.map(|v| v as i64))
    .bind(record.completion_tokens.map(|v| v as i64))
    .bind(record.reasoning_tokens.map(|v| v as i64))
    .bind(record.cached_tokens.map(|v| v as i64))
    .bind(record.input_cost_nano.map(|v| v.to_string()))
    .bind(record.output_cost_nano.map(|v| v.to_string()))
    .bind(record.cached_cost_nano.map(|v| v.to_string()))
    .bind(record.request_cost_nano.map(|v| v.to_string()))
    .bind(record.total_cost_nano.map(|v| v.to_string()))
    .bind(record.charged_nano.map(|v| v.to_string()))
    .bind(record.ttfb_ms.map(|v| v as i64))
    .bind(record.duration_ms.map(|v| v as i64))
    .bind(&record.outcome)
    .bind(&record.error_code)
    .bind(&record.error_message)
    .bind(record.error_http_status.map(|v| v as i64))
    .bind(
        record
            .attempts_json
            .as_ref()
            .and_then(|v| serde_json::to_string(v).ok()),
    )
    .bind(
        record
            .prompt_json
            .as_ref()
            .and_then(|v| serde_json::to_string(v).ok()),
    )
    .bind(
        record
            .response_json
            .as_ref()
            .and_then(|v| serde_json::to_string(v).ok()),
    )
    .bind(record.created_at.to_rfc3339())
    .execute(&mut **tx)
    .await
    .map_err(|e| e.to_string())?;
    Ok(())
}

enum QueueMsg {
    Record(Box<LogRecord>),
    Flush(oneshot::Sender<()>),
}

const DRAIN_BATCH: usize = 32;

/// Bounded in-process buffer with a single background drain task. Enqueue
/// never blocks the response path; a full buffer falls back to a direct
/// write rather than dropping the record. At-least-once overall.
#[derive(Clone)]
pub struct LogQueue {
    tx: mpsc::Sender<QueueMsg>,
    store: RequestLogStore,
}

impl LogQueue {
    pub fn start(store: RequestLogStore, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let drain_store = store.clone();
        tokio::spawn(drain_loop(drain_store, rx));
        Self { tx, store }
    }

    pub async fn enqueue(&self, record: LogRecord) {
        match self.tx.try_send(QueueMsg::Record(Box::new(record))) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(QueueMsg::Record(record)))
            | Err(mpsc::error::TrySendError::Closed(QueueMsg::Record(record))) => {
                if let Err(err) = self.store.insert(&record).await {
                    tracing::warn!("request log fallback write failed: {err}");
                }
            }
            Err(_) => {}
        }
    }

    /// Drain everything enqueued so far to the store. Called on shutdown.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(QueueMsg::Flush(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
    }
}

async fn drain_loop(store: RequestLogStore, mut rx: mpsc::Receiver<QueueMsg>) {
    while let Some(msg) = rx.recv().await {
        let mut batch: Vec<LogRecord> = Vec::new();
        let mut acks: Vec<oneshot::Sender<()>> = Vec::new();
        match msg {
            QueueMsg::Record(record) => batch.push(*record),
            QueueMsg::Flush(ack) => acks.push(ack),
        }
        while batch.len() < DRAIN_BATCH {
            match rx.try_recv() {
                Ok(QueueMsg::Record(record)) => batch.push(*record),
                Ok(QueueMsg::Flush(ack)) => acks.push(ack),
                Err(_) => break,
            }
        }
        if let Err(err) = store.insert_batch(&batch).await {
            tracing::warn!(records = batch.len(), "request log batch write failed: {err}");
        }
        for ack in acks {
            let _ = ack.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(org: &str, request_id: &str) -> LogRecord {
        LogRecord {
            request_id: request_id.to_string(),
            org_id: org.to_string(),
            project_id: None,
            model_requested: "gpt-4o".to_string(),
            provider_requested: None,
            model_used: Some("gpt-4o".to_string()),
            provider_used: Some("openai".to_string()),
            underlying_model: Some("gpt-4o".to_string()),
            is_stream: false,
            prompt_tokens: Some(5),
            completion_tokens: Some(1),
            reasoning_tokens: None,
            cached_tokens: None,
            input_cost_nano: Some(12_500),
            output_cost_nano: Some(10_000),
            cached_cost_nano: None,
            request_cost_nano: None,
            total_cost_nano: Some(22_500),
            charged_nano: Some(22_500),
            ttfb_ms: None,
            duration_ms: Some(42),
            outcome: OUTCOME_SUCCESS.to_string(),
            error_code: None,
            error_message: None,
            error_http_status: None,
            attempts_json: None,
            prompt_json: None,
            response_json: None,
            created_at: Utc::now(),
        }
    }

    async fn test_store() -> RequestLogStore {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("memory pool");
        RequestLogStore::new(pool).await.expect("store")
    }

    #[tokio::test]
    async fn enqueue_then_flush_persists_records() {
        let store = test_store().await;
        let queue = LogQueue::start(store.clone(), 16);

        for i in 0..5 {
            queue.enqueue(record("org_a", &format!("req_{i}"))).await;
        }
        queue.flush().await;

        assert_eq!(store.count_for_org("org_a").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn full_buffer_falls_back_to_direct_write() {
        let store = test_store().await;
        // Capacity 1 with a competing record already queued forces the
        // fallback path for most enqueues.
        let queue = LogQueue::start(store.clone(), 1);
        for i in 0..20 {
            queue.enqueue(record("org_b", &format!("req_{i}"))).await;
        }
        queue.flush().await;
        assert_eq!(store.count_for_org("org_b").await.unwrap(), 20);
    }

    #[tokio::test]
    async fn rows_are_readable_by_org() {
        let store = test_store().await;
        store.insert(&record("org_c", "req_1")).await.unwrap();
        let rows = store.list_for_org("org_c").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].request_id, "req_1");
        assert_eq!(rows[0].charged_nano, Some(22_500));
        assert_eq!(rows[0].outcome, OUTCOME_SUCCESS);
    }
}
