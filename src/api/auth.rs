use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use axum::{
    async_trait,
    extract::{FromRequestParts, State},
    http::{request::Parts, HeaderMap, StatusCode},
    Json,
};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use subtle::ConstantTimeEq;

use crate::db::{
    LoginRequest, LoginResponse, NewUser, Notification, RegisterRequest, User, UserResponse,
    ROLE_ADMIN, ROLE_STAFF,
};
use crate::tokens::{self, TokenPurpose};
use crate::AppState;

use super::error::{ApiError, ValidationErrorBuilder};
use super::validation::{validate_email, validate_name};

/// Generic response for the password-reset request endpoint. Identical for
/// existing and unknown accounts.
const RESET_ACK: &str = "If that email exists, a reset link was sent.";

/// Hash a password using Argon2
pub fn hash_password(password: &str) -> Result<String, argon2::password_hash::Error> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    let hash = argon2.hash_password(password.as_bytes(), &salt)?;
    Ok(hash.to_string())
}

/// Verify a password against a hash
pub fn verify_password(password: &str, hash: &str) -> bool {
    let parsed_hash = match PasswordHash::new(hash) {
        Ok(h) => h,
        Err(_) => return false,
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok()
}

/// Validate password strength: at least 8 characters with uppercase,
/// lowercase, digit, and a special character.
/// Returns None if valid, or Some(error_message) if invalid
pub fn validate_password_strength(password: &str) -> Option<String> {
    if password.len() < 8 {
        return Some("Password must be at least 8 characters".to_string());
    }

    let has_uppercase = password.chars().any(|c| c.is_uppercase());
    let has_lowercase = password.chars().any(|c| c.is_lowercase());
    let has_digit = password.chars().any(|c| c.is_ascii_digit());
    let has_special = password.chars().any(|c| !c.is_alphanumeric());

    if !has_uppercase {
        return Some("Password must contain at least one uppercase letter".to_string());
    }
    if !has_lowercase {
        return Some("Password must contain at least one lowercase letter".to_string());
    }
    if !has_digit {
        return Some("Password must contain at least one digit".to_string());
    }
    if !has_special {
        return Some("Password must contain at least one special character".to_string());
    }

    None
}

/// Extract a Bearer token from request headers
fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(|s| s.to_string())
}

/// The authenticated user behind a valid access token.
pub struct CurrentUser(pub User);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers)
            .ok_or_else(|| ApiError::unauthorized("Missing authorization token"))?;

        // A scan token presented here fails with the same generic message.
        let claims = tokens::verify(
            &state.config.auth.jwt_secret,
            &token,
            TokenPurpose::Access,
            state.clock.now(),
        )?;

        let user = User::find_by_id(&state.db, &claims.sub)
            .await?
            .ok_or_else(|| ApiError::unauthorized("Invalid or expired token"))?;

        Ok(CurrentUser(user))
    }
}

/// An authenticated user with the admin role.
pub struct AdminUser(pub User);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AdminUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let CurrentUser(user) = CurrentUser::from_request_parts(parts, state).await?;
        if !user.is_admin() {
            return Err(ApiError::forbidden("Admin privileges required"));
        }
        Ok(AdminUser(user))
    }
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub user: UserResponse,
}

/// Register a new staff account.
///
/// POST /api/auth/register
pub async fn register(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<RegisterResponse>), ApiError> {
    let mut errors = ValidationErrorBuilder::new();
    if let Err(e) = validate_name(&req.name) {
        errors.add("name", e);
    }
    if let Err(e) = validate_email(&req.email) {
        errors.add("email", e);
    }
    if let Some(msg) = validate_password_strength(&req.password) {
        errors.add("password", msg);
    }
    if let Some(backup) = req.backup_email.as_deref() {
        if let Err(e) = validate_email(backup) {
            errors.add("backup_email", e);
        }
    }
    errors.finish()?;

    if User::find_by_email(&state.db, &req.email).await?.is_some() {
        return Err(ApiError::conflict("Email already registered"));
    }

    let password_hash = hash_password(&req.password)
        .map_err(|e| ApiError::internal(format!("Failed to hash password: {e}")))?;

    let now = state.clock.now();
    // Open registration always creates staff; admins come from the
    // bootstrap account.
    let created = User::create(
        &state.db,
        NewUser {
            name: req.name.trim(),
            email: &req.email,
            password_hash: &password_hash,
            phone: req.phone.as_deref(),
            backup_email: req.backup_email.as_deref(),
            role: ROLE_STAFF,
        },
        now,
    )
    .await;

    let user = match created {
        Ok(user) => user,
        // Lost a registration race for the same address
        Err(sqlx::Error::Database(db_err))
            if db_err.message().contains("UNIQUE constraint failed") =>
        {
            return Err(ApiError::conflict("Email already registered"));
        }
        Err(e) => return Err(e.into()),
    };

    tracing::info!(user_id = %user.id, "User registered");

    if let Err(e) = Notification::create(
        &state.db,
        &user.id,
        "Welcome!",
        "Your account has been created successfully.",
        now,
    )
    .await
    {
        tracing::warn!(error = %e, "Failed to write welcome notification");
    }

    Ok((StatusCode::CREATED, Json(RegisterResponse { user: user.into() })))
}

/// Authenticate credentials, driving the lockout state machine.
///
/// Failed attempts increment the persisted counter atomically; the attempt
/// that reaches the threshold engages the lock. Attempts during an open
/// lock window are rejected without touching the counter, so hammering a
/// locked account neither extends the lock nor hides its end.
pub async fn authenticate(state: &AppState, email: &str, password: &str) -> Result<User, ApiError> {
    let now = state.clock.now();

    let user = User::find_by_email(&state.db, email)
        .await?
        .ok_or_else(|| ApiError::unauthorized("Invalid credentials"))?;

    if let Some(until) = user.lock_until {
        if until > now {
            let minutes_remaining = ((until - now).num_seconds() + 59) / 60;
            return Err(ApiError::locked(minutes_remaining));
        }
    }

    if !verify_password(password, &user.password_hash) {
        let auth = &state.config.auth;
        let lock_until = now + Duration::minutes(auth.lockout_minutes);
        let outcome = User::register_failed_login(
            &state.db,
            &user.id,
            auth.max_failed_logins,
            lock_until,
            now,
        )
        .await?;

        if outcome.failed_login_attempts >= auth.max_failed_logins {
            tracing::warn!(
                user_id = %user.id,
                attempts = outcome.failed_login_attempts,
                "Account locked after repeated failed logins"
            );
            return Err(ApiError::locked(auth.lockout_minutes));
        }
        return Err(ApiError::unauthorized("Invalid credentials"));
    }

    // Successful authentication resets the counter and clears any elapsed lock.
    User::clear_lockout(&state.db, &user.id, now).await?;

    Ok(user)
}

/// Login endpoint
///
/// POST /api/auth/login
pub async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    let user = authenticate(&state, &req.email, &req.password).await?;

    let token = tokens::issue(
        &state.config.auth.jwt_secret,
        &user.id,
        TokenPurpose::Access,
        Duration::days(state.config.auth.access_token_days),
        state.clock.now(),
    )
    .map_err(|_| ApiError::internal("Failed to issue access token"))?;

    if let Err(e) = Notification::create(
        &state.db,
        &user.id,
        "Login Successful",
        "You logged in successfully.",
        state.clock.now(),
    )
    .await
    {
        tracing::warn!(error = %e, "Failed to write login notification");
    }

    Ok(Json(LoginResponse {
        token,
        user: user.into(),
    }))
}

#[derive(Debug, Serialize)]
pub struct ProfileResponse {
    pub user: UserResponse,
    pub initials: String,
}

/// Display initials derived from the user's name, falling back to the
/// first letter of the email.
fn initials_for(user: &User) -> String {
    let from_name: String = user
        .name
        .split_whitespace()
        .filter_map(|word| word.chars().next())
        .flat_map(|c| c.to_uppercase())
        .collect();

    if from_name.is_empty() {
        user.email
            .chars()
            .next()
            .map(|c| c.to_uppercase().collect::<String>())
            .unwrap_or_default()
    } else {
        from_name
    }
}

/// Current user's profile.
///
/// GET /api/auth/profile
pub async fn profile(CurrentUser(user): CurrentUser) -> Json<ProfileResponse> {
    let initials = initials_for(&user);
    Json(ProfileResponse {
        user: user.into(),
        initials,
    })
}

#[derive(Debug, Deserialize)]
pub struct ChangePasswordRequest {
    pub current_password: String,
    pub new_password: String,
}

#[derive(Debug, Serialize)]
pub struct Ack {
    pub message: String,
}

impl Ack {
    fn new(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            message: message.into(),
        })
    }
}

/// Change the current user's password.
///
/// PUT /api/auth/change-password
pub async fn change_password(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Json(req): Json<ChangePasswordRequest>,
) -> Result<Json<Ack>, ApiError> {
    if let Some(msg) = validate_password_strength(&req.new_password) {
        return Err(ApiError::validation_field("new_password", msg));
    }

    if !verify_password(&req.current_password, &user.password_hash) {
        return Err(ApiError::unauthorized("Current password is incorrect"));
    }

    let password_hash = hash_password(&req.new_password)
        .map_err(|e| ApiError::internal(format!("Failed to hash password: {e}")))?;
    let now = state.clock.now();
    User::update_password(&state.db, &user.id, &password_hash, now).await?;

    if let Err(e) = Notification::create(
        &state.db,
        &user.id,
        "Password Changed",
        "Your password was changed successfully.",
        now,
    )
    .await
    {
        tracing::warn!(error = %e, "Failed to write password-change notification");
    }

    Ok(Ack::new("Password updated successfully"))
}

#[derive(Debug, Deserialize)]
pub struct ForgotPasswordRequest {
    pub email: String,
    pub backup_email: Option<String>,
}

/// Request a password reset link.
///
/// POST /api/auth/forgot-password
///
/// Always answers with the same generic ack, whether or not the account
/// exists, so the endpoint cannot be used to enumerate addresses.
pub async fn forgot_password(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ForgotPasswordRequest>,
) -> Result<Json<Ack>, ApiError> {
    let user = match User::find_by_email(&state.db, &req.email).await? {
        Some(user) => user,
        None => return Ok(Ack::new(RESET_ACK)),
    };

    // A supplied backup address must exactly match the registered one;
    // anything else is treated like an unknown account and audit-logged.
    let target_email = match req.backup_email.as_deref() {
        None => user.email.clone(),
        Some(requested) => match user.backup_email.as_deref() {
            Some(stored) if stored.eq_ignore_ascii_case(requested) => stored.to_string(),
            _ => {
                tracing::warn!(
                    user_id = %user.id,
                    "Password reset requested with mismatched backup email"
                );
                return Ok(Ack::new(RESET_ACK));
            }
        },
    };

    let raw_token = tokens::generate_reset_token();
    let now = state.clock.now();
    let expires_minutes = state.config.auth.reset_token_minutes;
    let expires_at = now + Duration::minutes(expires_minutes);

    // Only the hash is stored; issuing a new token replaces any prior one.
    User::set_reset_token(
        &state.db,
        &user.id,
        &tokens::hash_token(&raw_token),
        expires_at,
        now,
    )
    .await?;

    let reset_link = format!(
        "{}/reset-password?token={}",
        state.config.server.base_url.trim_end_matches('/'),
        raw_token
    );

    if let Err(e) = Notification::create(
        &state.db,
        &user.id,
        "Password Reset Requested",
        &format!("Reset link sent to {target_email}"),
        now,
    )
    .await
    {
        tracing::warn!(error = %e, "Failed to write reset notification");
    }

    let mailer = state.mailer.clone();
    tokio::spawn(async move {
        if let Err(e) = mailer
            .send_password_reset_email(&target_email, &reset_link, expires_minutes)
            .await
        {
            tracing::error!(error = %e, "Failed to send password reset email");
        }
    });

    Ok(Ack::new(RESET_ACK))
}

#[derive(Debug, Deserialize)]
pub struct ResetPasswordRequest {
    pub email: String,
    pub token: String,
    pub new_password: String,
}

/// Complete a password reset with a previously emailed token.
///
/// POST /api/auth/reset-password
pub async fn reset_password(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ResetPasswordRequest>,
) -> Result<Json<Ack>, ApiError> {
    if let Some(msg) = validate_password_strength(&req.new_password) {
        return Err(ApiError::validation_field("new_password", msg));
    }

    let invalid = || ApiError::unauthorized("Invalid or expired reset token");
    let now = state.clock.now();

    let user = User::find_by_email(&state.db, &req.email)
        .await?
        .ok_or_else(invalid)?;

    let presented_hash = tokens::hash_token(&req.token);
    let stored_hash = user.reset_token_hash.as_deref().ok_or_else(invalid)?;

    let hash_matches: bool = stored_hash.len() == presented_hash.len()
        && stored_hash
            .as_bytes()
            .ct_eq(presented_hash.as_bytes())
            .into();
    let unexpired = matches!(user.reset_token_expires, Some(exp) if exp > now);
    if !hash_matches || !unexpired {
        return Err(invalid());
    }

    let password_hash = hash_password(&req.new_password)
        .map_err(|e| ApiError::internal(format!("Failed to hash password: {e}")))?;

    // Authoritative step: the update is keyed on the stored hash and an
    // unexpired expiry, so a concurrent consume or overwrite loses cleanly.
    let updated =
        User::consume_reset_token(&state.db, &user.id, &presented_hash, &password_hash, now)
            .await?;
    if !updated {
        return Err(invalid());
    }

    tracing::info!(user_id = %user.id, "Password reset completed");

    if let Err(e) = Notification::create(
        &state.db,
        &user.id,
        "Password Reset",
        "Password reset successfully via email.",
        now,
    )
    .await
    {
        tracing::warn!(error = %e, "Failed to write reset notification");
    }

    Ok(Ack::new("Password reset successful"))
}

#[derive(Debug, Deserialize)]
pub struct UnlockAccountRequest {
    pub email: String,
}

/// Clear a lockout regardless of its state (admin action).
///
/// POST /api/auth/unlock-account
pub async fn unlock_account(
    State(state): State<Arc<AppState>>,
    AdminUser(admin): AdminUser,
    Json(req): Json<UnlockAccountRequest>,
) -> Result<Json<Ack>, ApiError> {
    let user = User::find_by_email(&state.db, &req.email)
        .await?
        .ok_or_else(|| ApiError::not_found("User not found"))?;

    let now = state.clock.now();
    User::clear_lockout(&state.db, &user.id, now).await?;

    tracing::info!(user_id = %user.id, admin_id = %admin.id, "Account unlocked by admin");

    if let Err(e) = Notification::create(
        &state.db,
        &user.id,
        "Account Unlocked",
        "Your account was manually unlocked.",
        now,
    )
    .await
    {
        tracing::warn!(error = %e, "Failed to write unlock notification");
    }

    Ok(Ack::new("Account unlocked successfully"))
}

/// Create the bootstrap admin account when the users table is empty.
pub async fn ensure_admin_user(state: &AppState) -> anyhow::Result<()> {
    if User::count(&state.db).await? > 0 {
        return Ok(());
    }

    let auth = &state.config.auth;
    let password_hash = hash_password(&auth.admin_password)
        .map_err(|e| anyhow::anyhow!("Failed to hash admin password: {e}"))?;

    let user = User::create(
        &state.db,
        NewUser {
            name: "Administrator",
            email: &auth.admin_email,
            password_hash: &password_hash,
            phone: None,
            backup_email: None,
            role: ROLE_ADMIN,
        },
        state.clock.now(),
    )
    .await?;

    tracing::info!(email = %auth.admin_email, user_id = %user.id, "Created bootstrap admin user");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::error::ErrorCode;
    use crate::clock::test::ManualClock;
    use crate::config::Config;
    use crate::db::init_test;
    use chrono::{TimeZone, Utc};

    const STRONG_PASSWORD: &str = "Sup3r-Secret!";

    fn t0() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()
    }

    async fn test_state() -> (Arc<AppState>, Arc<ManualClock>) {
        let pool = init_test().await;
        let clock = Arc::new(ManualClock::new(t0()));
        let state = AppState::new(Config::default(), pool).with_clock(clock.clone());
        (Arc::new(state), clock)
    }

    async fn seed_user(state: &AppState, email: &str, backup: Option<&str>) -> User {
        let password_hash = hash_password(STRONG_PASSWORD).unwrap();
        User::create(
            &state.db,
            NewUser {
                name: "Alice Mensah",
                email,
                password_hash: &password_hash,
                phone: None,
                backup_email: backup,
                role: ROLE_STAFF,
            },
            state.clock.now(),
        )
        .await
        .unwrap()
    }

    #[test]
    fn test_password_strength_policy() {
        assert!(validate_password_strength("Sup3r-Secret!").is_none());

        // Too short
        assert!(validate_password_strength("Ab1!xyz").is_some());
        // Missing classes
        assert!(validate_password_strength("alllower1!").is_some());
        assert!(validate_password_strength("ALLUPPER1!").is_some());
        assert!(validate_password_strength("NoDigits!!").is_some());
        assert!(validate_password_strength("NoSpecial1A").is_some());
    }

    #[test]
    fn test_initials() {
        let mut user = User {
            id: "u1".into(),
            name: "Alice Boateng Mensah".into(),
            email: "alice@x.com".into(),
            password_hash: String::new(),
            phone: None,
            backup_email: None,
            role: ROLE_STAFF.into(),
            failed_login_attempts: 0,
            lock_until: None,
            reset_token_hash: None,
            reset_token_expires: None,
            created_at: t0(),
            updated_at: t0(),
        };
        assert_eq!(initials_for(&user), "ABM");

        user.name = String::new();
        assert_eq!(initials_for(&user), "A");
    }

    #[tokio::test]
    async fn test_lockout_engages_on_third_failure() {
        let (state, _clock) = test_state().await;
        let user = seed_user(&state, "alice@x.com", None).await;

        for _ in 0..2 {
            let err = authenticate(&state, "alice@x.com", "wrong-password")
                .await
                .unwrap_err();
            assert_eq!(err.code(), ErrorCode::Unauthorized);
        }

        let third = authenticate(&state, "alice@x.com", "wrong-password")
            .await
            .unwrap_err();
        assert_eq!(third.code(), ErrorCode::Locked);

        let stored = User::find_by_id(&state.db, &user.id).await.unwrap().unwrap();
        assert_eq!(stored.failed_login_attempts, 3);
        assert!(stored.lock_until.is_some());
    }

    #[tokio::test]
    async fn test_locked_attempt_does_not_extend_or_count() {
        let (state, clock) = test_state().await;
        let user = seed_user(&state, "alice@x.com", None).await;

        for _ in 0..3 {
            let _ = authenticate(&state, "alice@x.com", "wrong-password").await;
        }
        let locked_at = User::find_by_id(&state.db, &user.id).await.unwrap().unwrap();

        clock.advance(Duration::minutes(10));

        // Even the correct password is rejected while locked
        let err = authenticate(&state, "alice@x.com", STRONG_PASSWORD)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Locked);
        assert!(err.message().contains("20 minutes"));

        let after = User::find_by_id(&state.db, &user.id).await.unwrap().unwrap();
        assert_eq!(after.failed_login_attempts, 3);
        assert_eq!(after.lock_until, locked_at.lock_until);
    }

    #[tokio::test]
    async fn test_login_succeeds_after_lock_elapses_and_resets_counter() {
        let (state, clock) = test_state().await;
        let user = seed_user(&state, "alice@x.com", None).await;

        for _ in 0..3 {
            let _ = authenticate(&state, "alice@x.com", "wrong-password").await;
        }

        clock.advance(Duration::minutes(31));

        let authenticated = authenticate(&state, "alice@x.com", STRONG_PASSWORD)
            .await
            .unwrap();
        assert_eq!(authenticated.id, user.id);

        let stored = User::find_by_id(&state.db, &user.id).await.unwrap().unwrap();
        assert_eq!(stored.failed_login_attempts, 0);
        assert!(stored.lock_until.is_none());
    }

    #[tokio::test]
    async fn test_unknown_account_and_wrong_password_look_identical() {
        let (state, _clock) = test_state().await;
        seed_user(&state, "alice@x.com", None).await;

        let unknown = authenticate(&state, "nobody@x.com", STRONG_PASSWORD)
            .await
            .unwrap_err();
        let wrong = authenticate(&state, "alice@x.com", "wrong-password")
            .await
            .unwrap_err();

        assert_eq!(unknown.code(), ErrorCode::Unauthorized);
        assert_eq!(unknown.message(), wrong.message());
    }

    #[tokio::test]
    async fn test_register_rejects_weak_password_and_duplicates() {
        let (state, _clock) = test_state().await;

        let weak = register(
            State(state.clone()),
            Json(RegisterRequest {
                name: "Alice".into(),
                email: "alice@x.com".into(),
                password: "weak".into(),
                phone: None,
                backup_email: None,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(weak.code(), ErrorCode::ValidationError);

        let (status, _) = register(
            State(state.clone()),
            Json(RegisterRequest {
                name: "Alice".into(),
                email: "alice@x.com".into(),
                password: STRONG_PASSWORD.into(),
                phone: None,
                backup_email: None,
            }),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::CREATED);

        // Same address with different case is still taken
        let dup = register(
            State(state.clone()),
            Json(RegisterRequest {
                name: "Impostor".into(),
                email: "ALICE@X.COM".into(),
                password: STRONG_PASSWORD.into(),
                phone: None,
                backup_email: None,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(dup.code(), ErrorCode::Conflict);
    }

    #[tokio::test]
    async fn test_registration_always_creates_staff() {
        let (state, _clock) = test_state().await;

        register(
            State(state.clone()),
            Json(RegisterRequest {
                name: "Alice".into(),
                email: "alice@x.com".into(),
                password: STRONG_PASSWORD.into(),
                phone: None,
                backup_email: None,
            }),
        )
        .await
        .unwrap();

        let user = User::find_by_email(&state.db, "alice@x.com")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(user.role, ROLE_STAFF);
    }

    #[tokio::test]
    async fn test_forgot_password_generic_ack_for_unknown_account() {
        let (state, _clock) = test_state().await;
        seed_user(&state, "alice@x.com", None).await;

        let known = forgot_password(
            State(state.clone()),
            Json(ForgotPasswordRequest {
                email: "alice@x.com".into(),
                backup_email: None,
            }),
        )
        .await
        .unwrap();
        let unknown = forgot_password(
            State(state.clone()),
            Json(ForgotPasswordRequest {
                email: "nobody@x.com".into(),
                backup_email: None,
            }),
        )
        .await
        .unwrap();
        assert_eq!(known.0.message, unknown.0.message);

        // Token issued only for the real account
        let user = User::find_by_email(&state.db, "alice@x.com")
            .await
            .unwrap()
            .unwrap();
        assert!(user.reset_token_hash.is_some());
        assert_eq!(
            user.reset_token_expires,
            Some(t0() + Duration::minutes(30))
        );
    }

    #[tokio::test]
    async fn test_forgot_password_backup_email_mismatch_issues_no_token() {
        let (state, _clock) = test_state().await;
        seed_user(&state, "alice@x.com", Some("real@y.com")).await;

        let ack = forgot_password(
            State(state.clone()),
            Json(ForgotPasswordRequest {
                email: "alice@x.com".into(),
                backup_email: Some("wrong@y.com".into()),
            }),
        )
        .await
        .unwrap();
        assert_eq!(ack.0.message, RESET_ACK);

        let user = User::find_by_email(&state.db, "alice@x.com")
            .await
            .unwrap()
            .unwrap();
        assert!(user.reset_token_hash.is_none());
    }

    #[tokio::test]
    async fn test_forgot_password_matching_backup_email_issues_token() {
        let (state, _clock) = test_state().await;
        seed_user(&state, "alice@x.com", Some("real@y.com")).await;

        forgot_password(
            State(state.clone()),
            Json(ForgotPasswordRequest {
                email: "alice@x.com".into(),
                backup_email: Some("REAL@Y.COM".into()),
            }),
        )
        .await
        .unwrap();

        let user = User::find_by_email(&state.db, "alice@x.com")
            .await
            .unwrap()
            .unwrap();
        assert!(user.reset_token_hash.is_some());
    }

    #[tokio::test]
    async fn test_reset_password_full_flow() {
        let (state, clock) = test_state().await;
        let user = seed_user(&state, "alice@x.com", None).await;

        let raw_token = tokens::generate_reset_token();
        User::set_reset_token(
            &state.db,
            &user.id,
            &tokens::hash_token(&raw_token),
            t0() + Duration::minutes(30),
            t0(),
        )
        .await
        .unwrap();

        // Wrong token rejected
        let bad = reset_password(
            State(state.clone()),
            Json(ResetPasswordRequest {
                email: "alice@x.com".into(),
                token: tokens::generate_reset_token(),
                new_password: "N3w-Secret!".into(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(bad.code(), ErrorCode::Unauthorized);

        // Weak replacement rejected before touching the store
        let weak = reset_password(
            State(state.clone()),
            Json(ResetPasswordRequest {
                email: "alice@x.com".into(),
                token: raw_token.clone(),
                new_password: "weak".into(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(weak.code(), ErrorCode::ValidationError);

        // Correct token succeeds and the new password logs in
        clock.advance(Duration::minutes(29));
        reset_password(
            State(state.clone()),
            Json(ResetPasswordRequest {
                email: "alice@x.com".into(),
                token: raw_token.clone(),
                new_password: "N3w-Secret!".into(),
            }),
        )
        .await
        .unwrap();

        authenticate(&state, "alice@x.com", "N3w-Secret!").await.unwrap();

        // Replay of the consumed token fails
        let replay = reset_password(
            State(state.clone()),
            Json(ResetPasswordRequest {
                email: "alice@x.com".into(),
                token: raw_token,
                new_password: "An0ther-Secret!".into(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(replay.code(), ErrorCode::Unauthorized);
    }

    #[tokio::test]
    async fn test_reset_password_rejects_expired_token_even_with_matching_hash() {
        let (state, clock) = test_state().await;
        let user = seed_user(&state, "alice@x.com", None).await;

        let raw_token = tokens::generate_reset_token();
        User::set_reset_token(
            &state.db,
            &user.id,
            &tokens::hash_token(&raw_token),
            t0() + Duration::minutes(30),
            t0(),
        )
        .await
        .unwrap();

        clock.advance(Duration::minutes(31));

        let err = reset_password(
            State(state.clone()),
            Json(ResetPasswordRequest {
                email: "alice@x.com".into(),
                token: raw_token,
                new_password: "N3w-Secret!".into(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Unauthorized);

        // Old password still works
        authenticate(&state, "alice@x.com", STRONG_PASSWORD).await.unwrap();
    }

    #[tokio::test]
    async fn test_ensure_admin_user_bootstraps_once() {
        let (state, _clock) = test_state().await;

        ensure_admin_user(&state).await.unwrap();
        ensure_admin_user(&state).await.unwrap();

        assert_eq!(User::count(&state.db).await.unwrap(), 1);
        let admin = User::find_by_email(&state.db, &state.config.auth.admin_email)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(admin.role, ROLE_ADMIN);
    }
}
