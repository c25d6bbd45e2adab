//! User model, lockout counters, and reset-token state.
//!
//! The failed-login counter and `lock_until` live on the user row so a
//! lockout survives process restarts. Counter updates and reset-token
//! consumption are single conditional statements; concurrent logins or
//! reset attempts against the same account cannot lose updates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

pub const ROLE_STAFF: &str = "staff";
pub const ROLE_ADMIN: &str = "admin";

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: String,
    pub name: String,
    pub email: String,
    pub password_hash: String,
    pub phone: Option<String>,
    pub backup_email: Option<String>,
    pub role: String,
    pub failed_login_attempts: i64,
    pub lock_until: Option<DateTime<Utc>>,
    pub reset_token_hash: Option<String>,
    pub reset_token_expires: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.role == ROLE_ADMIN
    }

    /// Locked means the lock window has not elapsed yet.
    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        matches!(self.lock_until, Some(until) if until > now)
    }
}

/// User fields safe to return to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserResponse {
    pub id: String,
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    pub backup_email: Option<String>,
    pub role: String,
}

impl From<User> for UserResponse {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            name: user.name,
            email: user.email,
            phone: user.phone,
            backup_email: user.backup_email,
            role: user.role,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub name: String,
    pub email: String,
    pub password: String,
    pub phone: Option<String>,
    pub backup_email: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub user: UserResponse,
}

/// Outcome of an atomic failed-login bump.
#[derive(Debug, Clone, Copy, FromRow)]
pub struct FailedLoginState {
    pub failed_login_attempts: i64,
    pub lock_until: Option<DateTime<Utc>>,
}

pub struct NewUser<'a> {
    pub name: &'a str,
    pub email: &'a str,
    pub password_hash: &'a str,
    pub phone: Option<&'a str>,
    pub backup_email: Option<&'a str>,
    pub role: &'a str,
}

impl User {
    pub async fn create(
        pool: &SqlitePool,
        new: NewUser<'_>,
        now: DateTime<Utc>,
    ) -> Result<User, sqlx::Error> {
        let id = uuid::Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO users (id, name, email, password_hash, phone, backup_email, role, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(new.name)
        .bind(new.email)
        .bind(new.password_hash)
        .bind(new.phone)
        .bind(new.backup_email)
        .bind(new.role)
        .bind(now)
        .bind(now)
        .execute(pool)
        .await?;

        let user = Self::find_by_id(pool, &id)
            .await?
            .ok_or(sqlx::Error::RowNotFound)?;
        Ok(user)
    }

    pub async fn find_by_id(pool: &SqlitePool, id: &str) -> Result<Option<User>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// Email lookup is case-insensitive (the column is COLLATE NOCASE).
    pub async fn find_by_email(
        pool: &SqlitePool,
        email: &str,
    ) -> Result<Option<User>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM users WHERE email = ?")
            .bind(email)
            .fetch_optional(pool)
            .await
    }

    pub async fn list_all(pool: &SqlitePool) -> Result<Vec<User>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM users ORDER BY created_at")
            .fetch_all(pool)
            .await
    }

    pub async fn count(pool: &SqlitePool) -> Result<i64, sqlx::Error> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM users")
            .fetch_one(pool)
            .await?;
        Ok(row.0)
    }

    /// Record a failed login attempt in one read-modify-write statement.
    ///
    /// The counter increment and the threshold check happen inside the
    /// UPDATE itself, so parallel failures on the same account each count
    /// and the lock engages on whichever attempt reaches the threshold.
    /// Returns the post-update counter and lock state.
    pub async fn register_failed_login(
        pool: &SqlitePool,
        id: &str,
        max_attempts: i64,
        lock_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<FailedLoginState, sqlx::Error> {
        sqlx::query_as(
            "UPDATE users
             SET failed_login_attempts = failed_login_attempts + 1,
                 lock_until = CASE
                     WHEN failed_login_attempts + 1 >= ?1 THEN ?2
                     ELSE lock_until
                 END,
                 updated_at = ?3
             WHERE id = ?4
             RETURNING failed_login_attempts, lock_until",
        )
        .bind(max_attempts)
        .bind(lock_until)
        .bind(now)
        .bind(id)
        .fetch_one(pool)
        .await
    }

    /// Reset the failed-login counter and clear any lock. Used on
    /// successful authentication and by the admin unlock action.
    pub async fn clear_lockout(
        pool: &SqlitePool,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE users
             SET failed_login_attempts = 0, lock_until = NULL, updated_at = ?
             WHERE id = ?",
        )
        .bind(now)
        .bind(id)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Store a new reset-token hash, replacing any outstanding one.
    pub async fn set_reset_token(
        pool: &SqlitePool,
        id: &str,
        token_hash: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE users
             SET reset_token_hash = ?, reset_token_expires = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(token_hash)
        .bind(expires_at)
        .bind(now)
        .bind(id)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Replace the password hash and clear the reset-token state in a
    /// single conditional update keyed on the stored hash and an unexpired
    /// expiry. Returns false when the token no longer matches (consumed,
    /// replaced, or expired) and nothing was changed.
    pub async fn consume_reset_token(
        pool: &SqlitePool,
        id: &str,
        token_hash: &str,
        new_password_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE users
             SET password_hash = ?1,
                 reset_token_hash = NULL,
                 reset_token_expires = NULL,
                 updated_at = ?2
             WHERE id = ?3
               AND reset_token_hash = ?4
               AND reset_token_expires > ?2",
        )
        .bind(new_password_hash)
        .bind(now)
        .bind(id)
        .bind(token_hash)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn update_password(
        pool: &SqlitePool,
        id: &str,
        password_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE users SET password_hash = ?, updated_at = ? WHERE id = ?")
            .bind(password_hash)
            .bind(now)
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn update_profile(
        pool: &SqlitePool,
        id: &str,
        name: Option<&str>,
        phone: Option<&str>,
        backup_email: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE users
             SET name = COALESCE(?, name),
                 phone = COALESCE(?, phone),
                 backup_email = COALESCE(?, backup_email),
                 updated_at = ?
             WHERE id = ?",
        )
        .bind(name)
        .bind(phone)
        .bind(backup_email)
        .bind(now)
        .bind(id)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn delete(pool: &SqlitePool, id: &str) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM users WHERE id = ?")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }
}
