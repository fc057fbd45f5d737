use crate::catalog::ProviderId;
use chrono::Utc;
use sqlx::{Pool, Row, Sqlite};

/// Resolved tenant context for one authenticated request.
#[derive(Debug, Clone)]
pub struct OrgContext {
    pub org_id: String,
    pub project_id: Option<String>,
    pub api_key_id: String,
    /// Empty means every provider is allowed.
    pub allowed_providers: Vec<ProviderId>,
    pub blocked_providers: Vec<ProviderId>,
    /// Org opted into prompt/response body capture on log records.
    pub log_bodies: bool,
}

impl OrgContext {
    pub fn provider_allowed(&self, provider: ProviderId) -> bool {
        if self.blocked_providers.contains(&provider) {
            return false;
        }
        self.allowed_providers.is_empty() || self.allowed_providers.contains(&provider)
    }
}

#[derive(Clone)]
pub struct AuthState {
    pool: Pool<Sqlite>,
}

impl AuthState {
    pub async fn new(pool: Pool<Sqlite>) -> Result<Self, String> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS api_keys (
                id TEXT PRIMARY KEY,
                org_id TEXT NOT NULL,
                project_id TEXT,
                name TEXT NOT NULL,
                key_hash TEXT NOT NULL UNIQUE,
                enabled INTEGER NOT NULL DEFAULT 1,
                allowed_providers TEXT,
                blocked_providers TEXT,
                created_at TEXT NOT NULL,
                last_used_at TEXT
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(Self { pool })
    }

    /// Mint a key for an org. Returns (key id, plaintext); only the blake3
    /// digest is stored.
    pub async fn create_api_key(
        &self,
        org_id: &str,
        project_id: Option<&str>,
        name: &str,
        allowed_providers: &[ProviderId],
        blocked_providers: &[ProviderId],
    ) -> Result<(String, String), String> {
        let id = uuid::Uuid::new_v4().to_string();
        let plaintext = format!(
            "mg-{}{}",
            uuid::Uuid::new_v4().simple(),
            uuid::Uuid::new_v4().simple()
        );
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"INSERT INTO api_keys (id, org_id, project_id, name, key_hash, enabled,
                                     allowed_providers, blocked_providers, created_at)
               VALUES (?, ?, ?, ?, ?, 1, ?, ?, ?)"#,
        )
        .bind(&id)
        .bind(org_id)
        .bind(project_id)
        .bind(name)
        .bind(key_digest(&plaintext))
        .bind(encode_providers(allowed_providers))
        .bind(encode_providers(blocked_providers))
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok((id, plaintext))
    }

    pub async fn disable_api_key(&self, key_id: &str) -> Result<(), String> {
        sqlx::query("UPDATE api_keys SET enabled = 0 WHERE id = ?")
            .bind(key_id)
            .execute(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    /// Resolve a bearer token to its org context. Unknown or disabled keys
    /// resolve to None.
    pub async fn authenticate(&self, token: &str) -> Result<Option<OrgContext>, String> {
        let token = token.trim();
        if token.is_empty() {
            return Ok(None);
        }
        let row = sqlx::query(
            r#"SELECT k.id, k.org_id, k.project_id, k.allowed_providers, k.blocked_providers,
                      o.log_bodies
               FROM api_keys k
               JOIN orgs o ON o.id = k.org_id
               WHERE k.key_hash = ? AND k.enabled = 1"#,
        )
        .bind(key_digest(token))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        let Some(row) = row else {
            return Ok(None);
        };

        let api_key_id: String = row.try_get("id").map_err(|e| e.to_string())?;
        let context = OrgContext {
            org_id: row.try_get("org_id").map_err(|e| e.to_string())?,
            project_id: row.try_get("project_id").ok(),
            api_key_id: api_key_id.clone(),
            allowed_providers: decode_providers(row.try_get("allowed_providers").ok()),
            blocked_providers: decode_providers(row.try_get("blocked_providers").ok()),
            log_bodies: row.try_get::<i32, _>("log_bodies").unwrap_or(0) == 1,
        };

        let _ = sqlx::query("UPDATE api_keys SET last_used_at = ? WHERE id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(&api_key_id)
            .execute(&self.pool)
            .await;

        Ok(Some(context))
    }
}

fn key_digest(token: &str) -> String {
    blake3::hash(token.as_bytes()).to_hex().to_string()
}

fn encode_providers(providers: &[ProviderId]) -> Option<String> {
    if providers.is_empty() {
        return None;
    }
    let names: Vec<&str> = providers.iter().map(|p| p.as_str()).collect();
    serde_json::to_string(&names).ok()
}

fn decode_providers(raw: Option<String>) -> Vec<ProviderId> {
    let Some(raw) = raw else {
        return Vec::new();
    };
    serde_json::from_str::<Vec<String>>(&raw)
        .map(|names| names.iter().filter_map(|n| ProviderId::parse(n)).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::CreditLedger;

    async fn test_state() -> (AuthState, CreditLedger) {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("memory pool");
        let ledger = CreditLedger::new(pool.clone()).await.expect("ledger");
        let auth = AuthState::new(pool).await.expect("auth");
        (auth, ledger)
    }

    #[tokio::test]
    async fn authenticates_minted_keys_only() {
        let (auth, ledger) = test_state().await;
        ledger.create_org("org_a", "A", 1_000, false).await.unwrap();
        let (_, key) = auth
            .create_api_key("org_a", Some("proj_1"), "default", &[], &[])
            .await
            .unwrap();

        let ctx = auth.authenticate(&key).await.unwrap().expect("context");
        assert_eq!(ctx.org_id, "org_a");
        assert_eq!(ctx.project_id.as_deref(), Some("proj_1"));

        assert!(auth.authenticate("mg-bogus").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn disabled_keys_stop_resolving() {
        let (auth, ledger) = test_state().await;
        ledger.create_org("org_a", "A", 1_000, false).await.unwrap();
        let (key_id, key) = auth
            .create_api_key("org_a", None, "default", &[], &[])
            .await
            .unwrap();
        auth.disable_api_key(&key_id).await.unwrap();
        assert!(auth.authenticate(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn provider_lists_gate_candidates() {
        let (auth, ledger) = test_state().await;
        ledger.create_org("org_a", "A", 1_000, false).await.unwrap();
        let (_, key) = auth
            .create_api_key(
                "org_a",
                None,
                "restricted",
                &[ProviderId::Openai, ProviderId::Groq],
                &[ProviderId::Groq],
            )
            .await
            .unwrap();
        let ctx = auth.authenticate(&key).await.unwrap().unwrap();
        assert!(ctx.provider_allowed(ProviderId::Openai));
        assert!(!ctx.provider_allowed(ProviderId::Groq));
        assert!(!ctx.provider_allowed(ProviderId::Anthropic));
    }
}
