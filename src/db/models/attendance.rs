//! Attendance records: at most one per user per UTC calendar day.
//!
//! The UNIQUE(user_id, date) index makes the check-then-insert a single
//! atomic operation; two concurrent scans for the same user on the same
//! day cannot both insert.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Attendance {
    pub id: String,
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
    pub date: NaiveDate,
}

/// Calendar date of a timestamp in the service's fixed reference timezone
/// (UTC). Used at record and lookup time alike.
pub fn attendance_date(timestamp: DateTime<Utc>) -> NaiveDate {
    timestamp.naive_utc().date()
}

impl Attendance {
    /// Insert today's record for the user. Returns `None` when a record for
    /// this (user, date) already exists; the unique index carries the
    /// atomicity, so the rejection is cheap and side-effect-free.
    pub async fn record(
        pool: &SqlitePool,
        user_id: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<Option<Attendance>, sqlx::Error> {
        let id = uuid::Uuid::new_v4().to_string();
        let date = attendance_date(timestamp);

        let inserted = sqlx::query(
            "INSERT INTO attendance (id, user_id, timestamp, date) VALUES (?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(user_id)
        .bind(timestamp)
        .bind(date)
        .execute(pool)
        .await;

        match inserted {
            Ok(_) => {}
            Err(sqlx::Error::Database(db_err))
                if db_err.message().contains("UNIQUE constraint failed") =>
            {
                return Ok(None);
            }
            Err(e) => return Err(e),
        }

        Ok(Some(Attendance {
            id,
            user_id: user_id.to_string(),
            timestamp,
            date,
        }))
    }

    pub async fn find_by_user_and_date(
        pool: &SqlitePool,
        user_id: &str,
        date: NaiveDate,
    ) -> Result<Option<Attendance>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM attendance WHERE user_id = ? AND date = ?")
            .bind(user_id)
            .bind(date)
            .fetch_optional(pool)
            .await
    }

    pub async fn history_for_user(
        pool: &SqlitePool,
        user_id: &str,
    ) -> Result<Vec<Attendance>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM attendance WHERE user_id = ? ORDER BY timestamp DESC")
            .bind(user_id)
            .fetch_all(pool)
            .await
    }

    pub async fn list_all(pool: &SqlitePool) -> Result<Vec<Attendance>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM attendance ORDER BY timestamp DESC")
            .fetch_all(pool)
            .await
    }
}
