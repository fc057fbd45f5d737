use chrono::Utc;
use serde_json::Value;
use sqlx::{Pool, Row, Sqlite};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerErrorKind {
    NotFound,
    InsufficientCredits,
    InvalidStoredBalance,
    Overflow,
    Internal,
}

#[derive(Debug, Clone)]
pub struct LedgerError {
    pub kind: LedgerErrorKind,
    pub message: String,
}

impl LedgerError {
    fn new(kind: LedgerErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebitOutcome {
    Applied,
    AlreadyDebited,
}

#[derive(Debug, Clone)]
pub struct OrgBalance {
    pub org_id: String,
    pub balance_nano_usd: i128,
    pub balance_unlimited: bool,
    pub log_bodies: bool,
}

/// Single source of truth for org credits. Writes for one org serialize
/// through SQLite transactions; debits and refunds are idempotent per
/// request id via unique ledger rows.
#[derive(Clone)]
pub struct CreditLedger {
    pool: Pool<Sqlite>,
}

impl CreditLedger {
    pub async fn new(pool: Pool<Sqlite>) -> Result<Self, String> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS orgs (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                balance_nano_usd TEXT NOT NULL DEFAULT '0',
                balance_unlimited INTEGER NOT NULL DEFAULT 0,
                log_bodies INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS ledger_entries (
                id TEXT PRIMARY KEY,
                request_id TEXT NOT NULL,
                org_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                amount_nano_usd TEXT NOT NULL,
                balance_after_nano_usd TEXT,
                meta_json TEXT,
                created_at TEXT NOT NULL
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_ledger_entries_org ON ledger_entries(org_id, created_at)",
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        Ok(Self { pool })
    }

    pub async fn create_org(
        &self,
        org_id: &str,
        name: &str,
        balance_nano_usd: i128,
        balance_unlimited: bool,
    ) -> Result<(), String> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"INSERT INTO orgs (id, name, balance_nano_usd, balance_unlimited, log_bodies, created_at, updated_at)
               VALUES (?, ?, ?, ?, 0, ?, ?)
               ON CONFLICT (id) DO NOTHING"#,
        )
        .bind(org_id)
        .bind(name)
        .bind(balance_nano_usd.to_string())
        .bind(if balance_unlimited { 1 } else { 0 })
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(())
    }

    pub async fn set_log_bodies(&self, org_id: &str, log_bodies: bool) -> Result<(), String> {
        sqlx::query("UPDATE orgs SET log_bodies = ?, updated_at = ? WHERE id = ?")
            .bind(if log_bodies { 1 } else { 0 })
            .bind(Utc::now().to_rfc3339())
            .bind(org_id)
            .execute(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    pub async fn get_balance(&self, org_id: &str) -> Result<Option<OrgBalance>, String> {
        let row = sqlx::query(
            "SELECT id, balance_nano_usd, balance_unlimited, log_bodies FROM orgs WHERE id = ?",
        )
        .bind(org_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        let Some(row) = row else {
            return Ok(None);
        };
        let balance_raw: String = row
            .try_get("balance_nano_usd")
            .unwrap_or_else(|_| "0".to_string());
        Ok(Some(OrgBalance {
            org_id: row.try_get("id").map_err(|e| e.to_string())?,
            balance_nano_usd: parse_nano_usd(&balance_raw)?,
            balance_unlimited: row.try_get::<i32, _>("balance_unlimited").unwrap_or(0) == 1,
            log_bodies: row.try_get::<i32, _>("log_bodies").unwrap_or(0) == 1,
        }))
    }

    /// Non-binding read: nothing is reserved, the balance may still drain
    /// before the debit lands.
    pub async fn precheck(&self, org_id: &str, estimate_nano: i128) -> Result<(), LedgerError> {
        let Some(balance) = self
            .get_balance(org_id)
            .await
            .map_err(|e| LedgerError::new(LedgerErrorKind::Internal, e))?
        else {
            return Err(LedgerError::new(LedgerErrorKind::NotFound, "org not found"));
        };
        if balance.balance_unlimited {
            return Ok(());
        }
        if balance.balance_nano_usd < estimate_nano.max(1) {
            return Err(LedgerError::new(
                LedgerErrorKind::InsufficientCredits,
                "insufficient credits",
            ));
        }
        Ok(())
    }

    /// Idempotent on request id: concurrent debits for the same request
    /// collapse to one balance effect.
    pub async fn debit(
        &self,
        org_id: &str,
        request_id: &str,
        amount_nano_usd: i128,
        meta: &Value,
    ) -> Result<DebitOutcome, LedgerError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| LedgerError::new(LedgerErrorKind::Internal, e.to_string()))?;

        let entry_id = format!("{request_id}:debit");
        let existing = sqlx::query("SELECT id FROM ledger_entries WHERE id = ?")
            .bind(&entry_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| LedgerError::new(LedgerErrorKind::Internal, e.to_string()))?;
        if existing.is_some() {
            return Ok(DebitOutcome::AlreadyDebited);
        }

        let row = sqlx::query("SELECT balance_nano_usd, balance_unlimited FROM orgs WHERE id = ?")
            .bind(org_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| LedgerError::new(LedgerErrorKind::Internal, e.to_string()))?;
        let Some(row) = row else {
            return Err(LedgerError::new(LedgerErrorKind::NotFound, "org not found"));
        };
        let unlimited = row.try_get::<i32, _>("balance_unlimited").unwrap_or(0) == 1;

        let now = Utc::now().to_rfc3339();
        let balance_after = if unlimited || amount_nano_usd <= 0 {
            None
        } else {
            let balance_raw: String = row
                .try_get("balance_nano_usd")
                .unwrap_or_else(|_| "0".to_string());
            let balance = parse_nano_usd(&balance_raw)
                .map_err(|e| LedgerError::new(LedgerErrorKind::InvalidStoredBalance, e))?;
            let next = balance.checked_sub(amount_nano_usd).ok_or_else(|| {
                LedgerError::new(LedgerErrorKind::Overflow, "balance subtraction overflow")
            })?;
            if next < 0 {
                return Err(LedgerError::new(
                    LedgerErrorKind::InsufficientCredits,
                    "insufficient credits",
                ));
            }
            sqlx::query("UPDATE orgs SET balance_nano_usd = ?, updated_at = ? WHERE id = ?")
                .bind(next.to_string())
                .bind(&now)
                .bind(org_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| LedgerError::new(LedgerErrorKind::Internal, e.to_string()))?;
            Some(next)
        };

        sqlx::query(
            r#"INSERT INTO ledger_entries (id, request_id, org_id, kind, amount_nano_usd, balance_after_nano_usd, meta_json, created_at)
               VALUES (?, ?, ?, 'debit', ?, ?, ?, ?)"#,
        )
        .bind(&entry_id)
        .bind(request_id)
        .bind(org_id)
        .bind(amount_nano_usd.to_string())
        .bind(balance_after.map(|b| b.to_string()))
        .bind(serde_json::to_string(meta).ok())
        .bind(&now)
        .execute(&mut *tx)
        .await
        .map_err(|e| LedgerError::new(LedgerErrorKind::Internal, e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| LedgerError::new(LedgerErrorKind::Internal, e.to_string()))?;
        Ok(DebitOutcome::Applied)
    }

    /// At-most-once compensation for a debit whose delivery failed. A refund
    /// without a recorded debit is a no-op.
    pub async fn refund(&self, org_id: &str, request_id: &str) -> Result<(), LedgerError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| LedgerError::new(LedgerErrorKind::Internal, e.to_string()))?;

        let refund_id = format!("{request_id}:refund");
        let existing = sqlx::query("SELECT id FROM ledger_entries WHERE id = ?")
            .bind(&refund_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| LedgerError::new(LedgerErrorKind::Internal, e.to_string()))?;
        if existing.is_some() {
            return Ok(());
        }

        let debit = sqlx::query("SELECT amount_nano_usd FROM ledger_entries WHERE id = ?")
            .bind(format!("{request_id}:debit"))
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| LedgerError::new(LedgerErrorKind::Internal, e.to_string()))?;
        let Some(debit) = debit else {
            return Ok(());
        };
        let amount_raw: String = debit
            .try_get("amount_nano_usd")
            .unwrap_or_else(|_| "0".to_string());
        let amount = parse_nano_usd(&amount_raw)
            .map_err(|e| LedgerError::new(LedgerErrorKind::InvalidStoredBalance, e))?;

        let now = Utc::now().to_rfc3339();
        if amount > 0 {
            let row =
                sqlx::query("SELECT balance_nano_usd, balance_unlimited FROM orgs WHERE id = ?")
                    .bind(org_id)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(|e| LedgerError::new(LedgerErrorKind::Internal, e.to_string()))?;
            let Some(row) = row else {
                return Err(LedgerError::new(LedgerErrorKind::NotFound, "org not found"));
            };
            let unlimited = row.try_get::<i32, _>("balance_unlimited").unwrap_or(0) == 1;
            if !unlimited {
                let balance_raw: String = row
                    .try_get("balance_nano_usd")
                    .unwrap_or_else(|_| "0".to_string());
                let balance = parse_nano_usd(&balance_raw)
                    .map_err(|e| LedgerError::new(LedgerErrorKind::InvalidStoredBalance, e))?;
                let next = balance.checked_add(amount).ok_or_else(|| {
                    LedgerError::new(LedgerErrorKind::Overflow, "balance addition overflow")
                })?;
                sqlx::query("UPDATE orgs SET balance_nano_usd = ?, updated_at = ? WHERE id = ?")
                    .bind(next.to_string())
                    .bind(&now)
                    .bind(org_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| LedgerError::new(LedgerErrorKind::Internal, e.to_string()))?;
            }
        }

        sqlx::query(
            r#"INSERT INTO ledger_entries (id, request_id, org_id, kind, amount_nano_usd, balance_after_nano_usd, meta_json, created_at)
               VALUES (?, ?, ?, 'refund', ?, NULL, NULL, ?)"#,
        )
        .bind(&refund_id)
        .bind(request_id)
        .bind(org_id)
        .bind(amount.to_string())
        .bind(&now)
        .execute(&mut *tx)
        .await
        .map_err(|e| LedgerError::new(LedgerErrorKind::Internal, e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| LedgerError::new(LedgerErrorKind::Internal, e.to_string()))?;
        Ok(())
    }
}

fn parse_nano_usd(raw: &str) -> Result<i128, String> {
    raw.trim()
        .parse::<i128>()
        .map_err(|e| format!("invalid nano-usd amount {raw:?}: {e}"))
}
