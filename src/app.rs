use crate::auth::AuthState;
use crate::cache::ResponseCache;
use crate::catalog::Catalog;
use crate::credentials::{CredentialResolver, CredentialStore};
use crate::dispatch::RetryPolicy;
use crate::error::{AppError, AppResult};
use crate::ledger::CreditLedger;
use crate::request_log::{LogQueue, RequestLogStore};
use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use std::path::PathBuf;
use std::sync::{Arc, Once, OnceLock};
use std::time::Duration;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<RuntimeConfig>,
    pub catalog: Arc<Catalog>,
    pub http: reqwest::Client,
    pub metrics: PrometheusHandle,
    pub auth: AuthState,
    pub credentials: CredentialResolver,
    pub cache: ResponseCache,
    pub ledger: CreditLedger,
    pub log_store: RequestLogStore,
    pub log_queue: LogQueue,
}

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static METRICS_ERROR: OnceLock<AppError> = OnceLock::new();
static METRICS_INIT: Once = Once::new();

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub listen: String,
    pub metrics_path: String,
    pub database_dsn: String,
    pub request_timeout_ms: u64,
    pub cache_ttl_secs: u64,
    pub log_queue_capacity: usize,
    pub retry: RetryPolicy,
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let listen = env_nonempty("MODELGATE_LISTEN").unwrap_or_else(|| "0.0.0.0:8080".to_string());
        let metrics_path =
            env_nonempty("MODELGATE_METRICS_PATH").unwrap_or_else(|| "/metrics".to_string());
        let database_dsn = resolve_database_dsn();
        let request_timeout_ms = env_nonempty("MODELGATE_REQUEST_TIMEOUT_MS")
            .and_then(|v| v.parse().ok())
            .unwrap_or(120_000);
        let cache_ttl_secs = env_nonempty("MODELGATE_CACHE_TTL_SECS")
            .and_then(|v| v.parse().ok())
            .unwrap_or(300);
        let log_queue_capacity = env_nonempty("MODELGATE_LOG_QUEUE_CAPACITY")
            .and_then(|v| v.parse().ok())
            .unwrap_or(1024);
        Self {
            listen,
            metrics_path,
            database_dsn,
            request_timeout_ms,
            cache_ttl_secs,
            log_queue_capacity,
            retry: RetryPolicy::default(),
        }
    }
}

pub async fn load_state() -> AppResult<AppState> {
    load_state_with_runtime(RuntimeConfig::from_env()).await
}

pub async fn load_state_with_runtime(runtime: RuntimeConfig) -> AppResult<AppState> {
    let http = reqwest::Client::builder()
        .user_agent("modelgate/0.1")
        .build()
        .map_err(|err| {
            AppError::internal(format!("http client init failed: {err}"))
        })?;

    ensure_sqlite_file(&runtime.database_dsn)
        .map_err(|err| AppError::internal(format!("database init failed: {err}")))?;

    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(
            runtime
                .database_dsn
                .parse::<sqlx::sqlite::SqliteConnectOptions>()
                .map_err(|err| {
                    AppError::internal(format!("database dsn parse failed: {err}"))
                })?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .busy_timeout(Duration::from_secs(5)),
        )
        .await
        .map_err(|err| AppError::internal(format!("database init failed: {err}")))?;

    let ledger = CreditLedger::new(pool.clone())
        .await
        .map_err(AppError::internal)?;
    let auth = AuthState::new(pool.clone())
        .await
        .map_err(AppError::internal)?;
    let credential_store = CredentialStore::new(pool.clone())
        .await
        .map_err(AppError::internal)?;
    let log_store = RequestLogStore::new(pool)
        .await
        .map_err(AppError::internal)?;

    let metrics = init_metrics()?;
    let log_queue = LogQueue::start(log_store.clone(), runtime.log_queue_capacity);
    let cache = ResponseCache::new(Duration::from_secs(runtime.cache_ttl_secs));

    Ok(AppState {
        runtime: Arc::new(runtime),
        catalog: Arc::new(Catalog::builtin()),
        http,
        metrics,
        auth,
        credentials: CredentialResolver::new(credential_store),
        cache,
        ledger,
        log_store,
        log_queue,
    })
}

fn init_metrics() -> AppResult<PrometheusHandle> {
    METRICS_INIT.call_once(|| {
        match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                let _ = METRICS_HANDLE.set(handle);
            }
            Err(err) => {
                let _ = METRICS_ERROR.set(AppError::internal(format!(
                    "metrics init failed: {err}"
                )));
            }
        }
    });

    if let Some(err) = METRICS_ERROR.get() {
        return Err(err.clone());
    }
    METRICS_HANDLE
        .get()
        .cloned()
        .ok_or_else(|| AppError::internal("metrics recorder not available"))
}

fn resolve_database_dsn() -> String {
    env_nonempty("MODELGATE_DATABASE_DSN")
        .or_else(|| env_nonempty("DATABASE_URL"))
        .unwrap_or_else(|| "sqlite://./data/modelgate.db".to_string())
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn ensure_sqlite_file(dsn: &str) -> Result<(), String> {
    let dsn = dsn.trim();
    if !dsn.starts_with("sqlite://") {
        return Ok(());
    }
    if dsn.contains(":memory:") || dsn.contains("mode=memory") {
        return Ok(());
    }
    let path_part = dsn.trim_start_matches("sqlite://");
    let path_part = path_part.split('?').next().unwrap_or("");
    if path_part.is_empty() {
        return Ok(());
    }
    let path = PathBuf::from(path_part);
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|err| format!("sqlite dir create failed: {err}"))?;
        }
    }
    if !path.exists() {
        std::fs::File::create(&path).map_err(|err| format!("sqlite file create failed: {err}"))?;
    }
    Ok(())
}

pub fn build_app(state: AppState) -> Router {
    let metrics_path = state.runtime.metrics_path.clone();
    Router::<AppState>::new()
        .route(
            "/v1/chat/completions",
            post(crate::handlers::create_chat_completions),
        )
        .route("/v1/models", get(crate::handlers::list_models))
        .route("/healthz", get(crate::handlers::healthz))
        .route(&metrics_path, get(crate::handlers::metrics))
        .with_state(state)
        .layer(SetRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
            MakeRequestUuid,
        ))
        .layer(PropagateRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
        ))
        .layer(TraceLayer::new_for_http())
}
