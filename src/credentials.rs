use crate::catalog::{provider_info, ProviderId};
use chrono::Utc;
use sqlx::{Pool, Row, Sqlite};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    /// Gateway-owned key from the provider's environment variable.
    Gateway,
    /// Org-stored key; the gateway margin is waived for these requests.
    Byok,
}

#[derive(Debug, Clone)]
pub struct AzureOptions {
    pub resource: String,
    pub api_version: String,
}

#[derive(Debug, Clone)]
pub struct Credential {
    pub secret: String,
    pub source: CredentialSource,
    /// Deployment-level base URL override (`LLM_<PROVIDER>_BASE_URL`), e.g.
    /// a regional mirror or a proxy in front of the provider.
    pub base_url_override: Option<String>,
    pub bedrock_region: Option<String>,
    pub azure: Option<AzureOptions>,
}

#[derive(Debug, Clone)]
pub enum ResolveError {
    /// No active key for this (org, provider); the candidate is skipped.
    NotConfigured,
    Store(String),
}

const DEFAULT_BEDROCK_REGION: &str = "us-east-1";
const DEFAULT_AZURE_API_VERSION: &str = "2024-10-21";

/// Org-stored provider keys (BYOK). The gateway env key is the fallback.
#[derive(Clone)]
pub struct CredentialStore {
    pool: Pool<Sqlite>,
}

impl CredentialStore {
    pub async fn new(pool: Pool<Sqlite>) -> Result<Self, String> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS org_provider_keys (
                org_id TEXT NOT NULL,
                provider_id TEXT NOT NULL,
                secret TEXT NOT NULL,
                active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (org_id, provider_id)
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(Self { pool })
    }

    pub async fn upsert_org_key(
        &self,
        org_id: &str,
        provider: ProviderId,
        secret: &str,
    ) -> Result<(), String> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"INSERT INTO org_provider_keys (org_id, provider_id, secret, active, created_at, updated_at)
               VALUES (?, ?, ?, 1, ?, ?)
               ON CONFLICT (org_id, provider_id)
               DO UPDATE SET secret = excluded.secret, active = 1, updated_at = excluded.updated_at"#,
        )
        .bind(org_id)
        .bind(provider.as_str())
        .bind(secret)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(())
    }

    pub async fn deactivate_org_key(
        &self,
        org_id: &str,
        provider: ProviderId,
    ) -> Result<(), String> {
        sqlx::query(
            "UPDATE org_provider_keys SET active = 0, updated_at = ? WHERE org_id = ? AND provider_id = ?",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(org_id)
        .bind(provider.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(())
    }

    async fn get_active(
        &self,
        org_id: &str,
        provider: ProviderId,
    ) -> Result<Option<String>, String> {
        let row = sqlx::query(
            "SELECT secret FROM org_provider_keys WHERE org_id = ? AND provider_id = ? AND active = 1",
        )
        .bind(org_id)
        .bind(provider.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(row.and_then(|r| r.try_get("secret").ok()))
    }
}

#[derive(Clone)]
pub struct CredentialResolver {
    store: CredentialStore,
}

impl CredentialResolver {
    pub fn new(store: CredentialStore) -> Self {
        Self { store }
    }

    pub async fn resolve(
        &self,
        org_id: &str,
        provider: ProviderId,
    ) -> Result<Credential, ResolveError> {
        let (secret, source) = match self
            .store
            .get_active(org_id, provider)
            .await
            .map_err(ResolveError::Store)?
        {
            Some(secret) => (secret, CredentialSource::Byok),
            None => match gateway_key(provider) {
                Some(secret) => (secret, CredentialSource::Gateway),
                None => return Err(ResolveError::NotConfigured),
            },
        };

        let bedrock_region = (provider == ProviderId::Bedrock).then(|| {
            env_nonempty("LLM_BEDROCK_REGION")
                .unwrap_or_else(|| DEFAULT_BEDROCK_REGION.to_string())
        });
        let azure = if provider == ProviderId::Azure {
            let resource = env_nonempty("LLM_AZURE_RESOURCE").ok_or(ResolveError::NotConfigured)?;
            Some(AzureOptions {
                resource,
                api_version: env_nonempty("LLM_AZURE_API_VERSION")
                    .unwrap_or_else(|| DEFAULT_AZURE_API_VERSION.to_string()),
            })
        } else {
            None
        };

        Ok(Credential {
            secret,
            source,
            base_url_override: env_nonempty(&format!(
                "LLM_{}_BASE_URL",
                provider.as_str().to_uppercase()
            )),
            bedrock_region,
            azure,
        })
    }
}

fn gateway_key(provider: ProviderId) -> Option<String> {
    env_nonempty(provider_info(provider).env_key)
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}
