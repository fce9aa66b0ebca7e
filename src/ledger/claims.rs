//! Claim codes and the claim-request audit trail.
//!
//! Both tables live next to the ledger so code consumption can join the
//! claim transaction.

use serde::Serialize;
use sqlx::SqliteConnection;
use uuid::Uuid;

use crate::ledger::store::LedgerStore;
use crate::ledger::types::{now_secs, LedgerResult};

/// A single-use QR claim code.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ClaimCode {
    pub id: Uuid,
    pub code: String,
    pub voucher_type_id: Uuid,
    pub event_label: Option<String>,
    pub expires_at: Option<i64>,
    pub status: String,
    pub used_by_user: Option<Uuid>,
    pub used_at: Option<i64>,
    pub created_at: i64,
}

impl ClaimCode {
    pub fn is_used(&self) -> bool {
        self.status != "new"
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at < now)
    }
}

/// One audited claim attempt.
#[derive(Debug, Clone, Default)]
pub struct ClaimRequestRecord {
    pub claim_code_id: Option<Uuid>,
    pub voucher_type_id: Option<Uuid>,
    pub ip_hash: Option<String>,
    pub user_agent: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub result: String,
}

/// Stored claim-request row.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ClaimRequest {
    pub id: Uuid,
    pub claim_code_id: Option<Uuid>,
    pub voucher_type_id: Option<Uuid>,
    pub ip_hash: Option<String>,
    pub user_agent: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub result: String,
    pub created_at: i64,
}

impl LedgerStore {
    pub async fn insert_claim_code(
        &self,
        conn: &mut SqliteConnection,
        code: &str,
        voucher_type_id: Uuid,
        event_label: Option<&str>,
        expires_at: Option<i64>,
    ) -> LedgerResult<ClaimCode> {
        let query = r#"
            INSERT INTO claim_code (id, code, voucher_type_id, event_label, expires_at, status, created_at)
            VALUES ($1, $2, $3, $4, $5, 'new', $6)
            RETURNING *
        "#;
        Ok(sqlx::query_as(query)
            .bind(Uuid::new_v4())
            .bind(code)
            .bind(voucher_type_id)
            .bind(event_label)
            .bind(expires_at)
            .bind(now_secs())
            .fetch_one(&mut *conn)
            .await?)
    }

    pub async fn claim_code(
        &self,
        conn: &mut SqliteConnection,
        code: &str,
    ) -> LedgerResult<Option<ClaimCode>> {
        Ok(sqlx::query_as("SELECT * FROM claim_code WHERE code = $1")
            .bind(code)
            .fetch_optional(&mut *conn)
            .await?)
    }

    /// Mark a code used by `user_id`. Returns `false` when the code was no
    /// longer `new`, i.e. a concurrent claim got there first.
    pub async fn consume_claim_code(
        &self,
        conn: &mut SqliteConnection,
        id: Uuid,
        user_id: Uuid,
    ) -> LedgerResult<bool> {
        let query = r#"
            UPDATE claim_code
            SET status = 'used', used_by_user = $1, used_at = $2
            WHERE id = $3 AND status = 'new'
        "#;
        let result = sqlx::query(query)
            .bind(user_id)
            .bind(now_secs())
            .bind(id)
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Append one claim attempt to the audit trail.
    pub async fn log_claim_request(
        &self,
        conn: &mut SqliteConnection,
        record: &ClaimRequestRecord,
    ) -> LedgerResult<Uuid> {
        let id = Uuid::new_v4();
        let query = r#"
            INSERT INTO claim_request
                (id, claim_code_id, voucher_type_id, ip_hash, user_agent, email, phone, result, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#;
        sqlx::query(query)
            .bind(id)
            .bind(record.claim_code_id)
            .bind(record.voucher_type_id)
            .bind(&record.ip_hash)
            .bind(&record.user_agent)
            .bind(&record.email)
            .bind(&record.phone)
            .bind(&record.result)
            .bind(now_secs())
            .execute(&mut *conn)
            .await?;
        Ok(id)
    }

    /// Attempts since `since` (unix seconds) matching the email or the IP hash.
    pub async fn recent_claim_requests(
        &self,
        conn: &mut SqliteConnection,
        email: Option<&str>,
        ip_hash: Option<&str>,
        since: i64,
    ) -> LedgerResult<i64> {
        let query = r#"
            SELECT COUNT(*) FROM claim_request
            WHERE created_at > $1
              AND ((email IS NOT NULL AND email = $2) OR (ip_hash IS NOT NULL AND ip_hash = $3))
        "#;
        Ok(sqlx::query_scalar::<_, i64>(query)
            .bind(since)
            .bind(email)
            .bind(ip_hash)
            .fetch_one(&mut *conn)
            .await?)
    }

    /// Audit rows for a claim code, newest first.
    pub async fn claim_requests_for_code(
        &self,
        conn: &mut SqliteConnection,
        claim_code_id: Uuid,
    ) -> LedgerResult<Vec<ClaimRequest>> {
        let query = r#"
            SELECT * FROM claim_request
            WHERE claim_code_id = $1
            ORDER BY created_at DESC, rowid DESC
        "#;
        Ok(sqlx::query_as(query)
            .bind(claim_code_id)
            .fetch_all(&mut *conn)
            .await?)
    }
}
