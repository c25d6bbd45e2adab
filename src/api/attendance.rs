//! QR issuance and the attendance scan pipeline.
//!
//! The scan sequence is: verify token -> mark the QR record used ->
//! insert the day's attendance row -> notify. The two middle steps are the
//! authoritative state changes and each is a single atomic conditional
//! write; everything after them is best-effort and never rolls them back.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::db::{Attendance, ConsumeOutcome, Notification, QrCode, User};
use crate::qr;
use crate::tokens::{self, TokenPurpose};
use crate::AppState;

use super::auth::{AdminUser, CurrentUser};
use super::error::ApiError;

/// A freshly issued scan code.
#[derive(Debug, Serialize)]
pub struct IssuedQr {
    pub token: String,
    pub scan_url: String,
    /// Inline `data:image/png;base64,...` rendering of the scan URL.
    pub qr_image: String,
    pub expires_at: DateTime<Utc>,
}

/// Issue a scan token for the user, persist its QR record, and email the
/// code. The email is fire-and-forget; issuance succeeds even if SMTP is
/// down.
pub async fn issue_scan_code(state: &AppState, user: &User) -> Result<IssuedQr, ApiError> {
    let now = state.clock.now();
    let ttl_minutes = state.config.auth.scan_token_minutes;

    let token = tokens::issue(
        &state.config.auth.jwt_secret,
        &user.id,
        TokenPurpose::AttendanceScan,
        Duration::minutes(ttl_minutes),
        now,
    )
    .map_err(|_| ApiError::internal("Failed to issue scan token"))?;

    let scan_url = format!(
        "{}/api/attendance/scan?token={}",
        state.config.server.base_url.trim_end_matches('/'),
        token
    );

    let png = qr::render_png(&scan_url)
        .map_err(|e| ApiError::internal(format!("Failed to render QR code: {e}")))?;
    let qr_image = qr::png_data_url(&png);

    // Record expiry is taken from the same `now` as the token's exp claim.
    let expires_at = now + Duration::minutes(ttl_minutes);
    QrCode::create(
        &state.db,
        &user.id,
        &token,
        &scan_url,
        Some(&user.email),
        now,
        expires_at,
    )
    .await?;

    tracing::info!(user_id = %user.id, "Issued attendance QR code");

    let mailer = state.mailer.clone();
    let to_email = user.email.clone();
    let user_name = user.name.clone();
    let url = scan_url.clone();
    tokio::spawn(async move {
        if let Err(e) = mailer
            .send_qr_code_email(&to_email, &user_name, &url, png, ttl_minutes)
            .await
        {
            tracing::error!(error = %e, "Failed to send QR code email");
        }
    });

    Ok(IssuedQr {
        token,
        scan_url,
        qr_image,
        expires_at,
    })
}

/// Run the scan pipeline for a presented token.
pub async fn perform_scan(state: &AppState, token: &str) -> Result<Attendance, ApiError> {
    let now = state.clock.now();

    let claims = tokens::verify(
        &state.config.auth.jwt_secret,
        token,
        TokenPurpose::AttendanceScan,
        now,
    )?;

    let user = User::find_by_id(&state.db, &claims.sub)
        .await?
        .ok_or_else(|| ApiError::not_found("User not found"))?;

    // Single-use gate comes before the attendance write: a replayed token
    // is rejected here even when today's record doesn't exist yet.
    match QrCode::mark_used(&state.db, token, now).await? {
        ConsumeOutcome::Consumed => {}
        ConsumeOutcome::AlreadyUsed => {
            return Err(ApiError::conflict("QR code already used"));
        }
        ConsumeOutcome::Expired | ConsumeOutcome::NotFound => {
            return Err(ApiError::unauthorized("Invalid or expired token"));
        }
    }

    let attendance = Attendance::record(&state.db, &user.id, now)
        .await?
        .ok_or_else(|| ApiError::conflict("Attendance already recorded for today"))?;

    tracing::info!(user_id = %user.id, date = %attendance.date, "Attendance recorded");

    // The day's record is committed; everything below is best-effort.
    let clocked_in = now.format("%Y-%m-%d %H:%M:%S UTC").to_string();
    if let Err(e) = Notification::create(
        &state.db,
        &user.id,
        "Attendance Recorded",
        &format!("You clocked in at {clocked_in}."),
        now,
    )
    .await
    {
        tracing::warn!(error = %e, "Failed to write attendance notification");
    }

    let mailer = state.mailer.clone();
    let to_email = user.email.clone();
    let user_name = user.name.clone();
    tokio::spawn(async move {
        if let Err(e) = mailer
            .send_attendance_confirmation(&to_email, &user_name, now)
            .await
        {
            tracing::error!(error = %e, "Failed to send attendance confirmation email");
        }
    });

    Ok(attendance)
}

/// Issue a QR code for the current user.
///
/// POST /api/attendance/qr
pub async fn issue_qr(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
) -> Result<Json<IssuedQr>, ApiError> {
    issue_scan_code(&state, &user).await.map(Json)
}

/// Issue a QR code on behalf of another user (admin only).
///
/// POST /api/attendance/qr/:user_id
pub async fn issue_qr_for_user(
    State(state): State<Arc<AppState>>,
    AdminUser(_admin): AdminUser,
    Path(user_id): Path<String>,
) -> Result<Json<IssuedQr>, ApiError> {
    let user = User::find_by_id(&state.db, &user_id)
        .await?
        .ok_or_else(|| ApiError::not_found("User not found"))?;
    issue_scan_code(&state, &user).await.map(Json)
}

#[derive(Debug, Deserialize)]
pub struct ScanQuery {
    pub token: String,
}

#[derive(Debug, Serialize)]
pub struct ScanResponse {
    pub timestamp: DateTime<Utc>,
    pub date: NaiveDate,
}

/// Record attendance for a scanned QR token.
///
/// GET /api/attendance/scan?token=...
///
/// Public: the signed token is the credential.
pub async fn scan(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ScanQuery>,
) -> Result<Json<ScanResponse>, ApiError> {
    let attendance = perform_scan(&state, &query.token).await?;
    Ok(Json(ScanResponse {
        timestamp: attendance.timestamp,
        date: attendance.date,
    }))
}

/// The current user's most recent still-usable QR code.
///
/// GET /api/attendance/qr/active
pub async fn active_qr(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
) -> Result<Json<QrCode>, ApiError> {
    let record = QrCode::find_active(&state.db, &user.id, state.clock.now())
        .await?
        .ok_or_else(|| ApiError::not_found("No active QR code"))?;
    Ok(Json(record))
}

#[derive(Debug, Serialize)]
pub struct QrHistoryResponse {
    pub items: Vec<QrCode>,
    pub total: usize,
}

/// The current user's QR issuance history, newest first.
///
/// GET /api/attendance/qr/history
pub async fn qr_history(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
) -> Result<Json<QrHistoryResponse>, ApiError> {
    let items = QrCode::history_for_user(&state.db, &user.id).await?;
    let total = items.len();
    Ok(Json(QrHistoryResponse { items, total }))
}

#[derive(Debug, Serialize)]
pub struct AttendanceListResponse {
    pub attendance: Vec<Attendance>,
    pub total_records: usize,
}

/// The current user's attendance history.
///
/// GET /api/attendance/my-attendance
pub async fn my_attendance(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
) -> Result<Json<AttendanceListResponse>, ApiError> {
    let attendance = Attendance::history_for_user(&state.db, &user.id).await?;
    let total_records = attendance.len();
    Ok(Json(AttendanceListResponse {
        attendance,
        total_records,
    }))
}

/// All attendance records (admin only).
///
/// GET /api/attendance
pub async fn list_all_attendance(
    State(state): State<Arc<AppState>>,
    AdminUser(_admin): AdminUser,
) -> Result<Json<AttendanceListResponse>, ApiError> {
    let attendance = Attendance::list_all(&state.db).await?;
    let total_records = attendance.len();
    Ok(Json(AttendanceListResponse {
        attendance,
        total_records,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::auth::{authenticate, hash_password};
    use crate::api::error::ErrorCode;
    use crate::clock::test::ManualClock;
    use crate::config::Config;
    use crate::db::{init_test, NewUser, ROLE_STAFF};
    use chrono::TimeZone;

    const STRONG_PASSWORD: &str = "Sup3r-Secret!";

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()
    }

    async fn test_state() -> (Arc<AppState>, Arc<ManualClock>) {
        let pool = init_test().await;
        let clock = Arc::new(ManualClock::new(t0()));
        let state = AppState::new(Config::default(), pool).with_clock(clock.clone());
        (Arc::new(state), clock)
    }

    async fn seed_user(state: &AppState, email: &str) -> User {
        let password_hash = hash_password(STRONG_PASSWORD).unwrap();
        User::create(
            &state.db,
            NewUser {
                name: "Alice Mensah",
                email,
                password_hash: &password_hash,
                phone: None,
                backup_email: None,
                role: ROLE_STAFF,
            },
            state.clock.now(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_issue_creates_aligned_qr_record() {
        let (state, _clock) = test_state().await;
        let user = seed_user(&state, "alice@x.com").await;

        let issued = issue_scan_code(&state, &user).await.unwrap();
        assert!(issued.scan_url.contains(&issued.token));
        assert!(issued.qr_image.starts_with("data:image/png;base64,"));
        assert_eq!(issued.expires_at, t0() + Duration::hours(1));

        let record = QrCode::find_by_token(&state.db, &issued.token)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.user_id, user.id);
        assert!(!record.used);
        assert_eq!(record.expires_at, issued.expires_at);
        assert_eq!(record.email_recipient.as_deref(), Some("alice@x.com"));
    }

    #[tokio::test]
    async fn test_scan_scenario_single_use_then_single_day() {
        let (state, _clock) = test_state().await;
        let user = seed_user(&state, "alice@x.com").await;

        // Login works, then a scan with a fresh token records today
        authenticate(&state, "alice@x.com", STRONG_PASSWORD).await.unwrap();
        let first = issue_scan_code(&state, &user).await.unwrap();

        let attendance = perform_scan(&state, &first.token).await.unwrap();
        assert_eq!(attendance.date, NaiveDate::from_ymd_opt(2024, 5, 1).unwrap());

        // Replaying the consumed token fails even before its expiry
        let replay = perform_scan(&state, &first.token).await.unwrap_err();
        assert_eq!(replay.code(), ErrorCode::Conflict);
        assert!(replay.message().contains("already used"));

        // A second, fresh token on the same day trips the attendance gate
        let second = issue_scan_code(&state, &user).await.unwrap();
        let same_day = perform_scan(&state, &second.token).await.unwrap_err();
        assert_eq!(same_day.code(), ErrorCode::Conflict);
        assert!(same_day.message().contains("already recorded"));

        let rows = Attendance::history_for_user(&state.db, &user.id).await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_scan_next_day_with_new_token_succeeds() {
        let (state, clock) = test_state().await;
        let user = seed_user(&state, "alice@x.com").await;

        let first = issue_scan_code(&state, &user).await.unwrap();
        perform_scan(&state, &first.token).await.unwrap();

        clock.advance(Duration::days(1));

        let second = issue_scan_code(&state, &user).await.unwrap();
        let attendance = perform_scan(&state, &second.token).await.unwrap();
        assert_eq!(attendance.date, NaiveDate::from_ymd_opt(2024, 5, 2).unwrap());
    }

    #[tokio::test]
    async fn test_scan_rejects_expired_token() {
        let (state, clock) = test_state().await;
        let user = seed_user(&state, "alice@x.com").await;

        let issued = issue_scan_code(&state, &user).await.unwrap();
        clock.advance(Duration::minutes(61));

        let err = perform_scan(&state, &issued.token).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Unauthorized);

        // Nothing was recorded
        let rows = Attendance::history_for_user(&state.db, &user.id).await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_scan_rejects_access_token() {
        let (state, _clock) = test_state().await;
        let user = seed_user(&state, "alice@x.com").await;

        let access = tokens::issue(
            &state.config.auth.jwt_secret,
            &user.id,
            TokenPurpose::Access,
            Duration::days(15),
            t0(),
        )
        .unwrap();

        let err = perform_scan(&state, &access).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Unauthorized);
    }

    #[tokio::test]
    async fn test_scan_rejects_signed_token_without_qr_record() {
        let (state, _clock) = test_state().await;
        let user = seed_user(&state, "alice@x.com").await;

        // Signed and unexpired, but never issued through the QR tracker
        let orphan = tokens::issue(
            &state.config.auth.jwt_secret,
            &user.id,
            TokenPurpose::AttendanceScan,
            Duration::hours(1),
            t0(),
        )
        .unwrap();

        let err = perform_scan(&state, &orphan).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Unauthorized);
    }

    #[tokio::test]
    async fn test_concurrent_scans_of_one_token_record_once() {
        let (state, _clock) = test_state().await;
        let user = seed_user(&state, "alice@x.com").await;
        let issued = issue_scan_code(&state, &user).await.unwrap();

        let a = perform_scan(&state, &issued.token);
        let b = perform_scan(&state, &issued.token);
        let (a, b) = tokio::join!(a, b);

        assert_eq!(
            [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count(),
            1
        );

        let rows = Attendance::history_for_user(&state.db, &user.id).await.unwrap();
        assert_eq!(rows.len(), 1);
    }
}
