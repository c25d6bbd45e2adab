//! QR code issuance and single-use tracking.
//!
//! Each issued scan token gets a row here. `used` goes 0 -> 1 exactly once,
//! through a conditional UPDATE, so a replayed token loses the race no
//! matter how many scans arrive in parallel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct QrCode {
    pub id: String,
    pub user_id: String,
    pub token: String,
    pub scan_url: String,
    pub email_recipient: Option<String>,
    pub used: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
}

/// Result of attempting to consume a scan token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// This call performed the 0 -> 1 transition.
    Consumed,
    /// The token was consumed by an earlier scan.
    AlreadyUsed,
    /// The record exists but its validity window has passed.
    Expired,
    /// No record for this token.
    NotFound,
}

impl QrCode {
    pub async fn create(
        pool: &SqlitePool,
        user_id: &str,
        token: &str,
        scan_url: &str,
        email_recipient: Option<&str>,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<QrCode, sqlx::Error> {
        let id = uuid::Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO qr_codes (id, user_id, token, scan_url, email_recipient, used, created_at, expires_at)
             VALUES (?, ?, ?, ?, ?, 0, ?, ?)",
        )
        .bind(&id)
        .bind(user_id)
        .bind(token)
        .bind(scan_url)
        .bind(email_recipient)
        .bind(created_at)
        .bind(expires_at)
        .execute(pool)
        .await?;

        let record = Self::find_by_token(pool, token)
            .await?
            .ok_or(sqlx::Error::RowNotFound)?;
        Ok(record)
    }

    pub async fn find_by_token(
        pool: &SqlitePool,
        token: &str,
    ) -> Result<Option<QrCode>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM qr_codes WHERE token = ?")
            .bind(token)
            .fetch_optional(pool)
            .await
    }

    /// Consume the token: flip `used` to 1 if, and only if, the record is
    /// still unused and unexpired. The guard lives in the UPDATE's WHERE
    /// clause, so exactly one of any number of concurrent scans wins; the
    /// follow-up read only runs on the losing path to name the reason.
    pub async fn mark_used(
        pool: &SqlitePool,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<ConsumeOutcome, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE qr_codes
             SET used = 1, used_at = ?2
             WHERE token = ?1 AND used = 0 AND expires_at > ?2",
        )
        .bind(token)
        .bind(now)
        .execute(pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(ConsumeOutcome::Consumed);
        }

        match Self::find_by_token(pool, token).await? {
            None => Ok(ConsumeOutcome::NotFound),
            Some(record) if record.used => Ok(ConsumeOutcome::AlreadyUsed),
            Some(_) => Ok(ConsumeOutcome::Expired),
        }
    }

    /// The most recently issued code that is still usable.
    pub async fn find_active(
        pool: &SqlitePool,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<QrCode>, sqlx::Error> {
        sqlx::query_as(
            "SELECT * FROM qr_codes
             WHERE user_id = ? AND used = 0 AND expires_at > ?
             ORDER BY created_at DESC
             LIMIT 1",
        )
        .bind(user_id)
        .bind(now)
        .fetch_optional(pool)
        .await
    }

    pub async fn history_for_user(
        pool: &SqlitePool,
        user_id: &str,
    ) -> Result<Vec<QrCode>, sqlx::Error> {
        sqlx::query_as(
            "SELECT * FROM qr_codes WHERE user_id = ? ORDER BY created_at DESC",
        )
        .bind(user_id)
        .fetch_all(pool)
        .await
    }
}
