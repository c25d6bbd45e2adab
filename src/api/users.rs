//! User management endpoints.

use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::db::{User, UserResponse};
use crate::AppState;

use super::auth::{AdminUser, CurrentUser};
use super::error::ApiError;
use super::validation::{validate_email, validate_name};

#[derive(Debug, Serialize)]
pub struct UserListResponse {
    pub users: Vec<UserResponse>,
    pub total: usize,
}

/// List all users (admin only)
///
/// GET /api/users
pub async fn list_users(
    State(state): State<Arc<AppState>>,
    AdminUser(_admin): AdminUser,
) -> Result<Json<UserListResponse>, ApiError> {
    let users: Vec<UserResponse> = User::list_all(&state.db)
        .await?
        .into_iter()
        .map(UserResponse::from)
        .collect();
    let total = users.len();
    Ok(Json(UserListResponse { users, total }))
}

/// Get a user by id (admin only)
///
/// GET /api/users/:id
pub async fn get_user(
    State(state): State<Arc<AppState>>,
    AdminUser(_admin): AdminUser,
    Path(id): Path<String>,
) -> Result<Json<UserResponse>, ApiError> {
    let user = User::find_by_id(&state.db, &id)
        .await?
        .ok_or_else(|| ApiError::not_found("User not found"))?;
    Ok(Json(user.into()))
}

#[derive(Debug, Deserialize)]
pub struct UpdateProfileRequest {
    pub name: Option<String>,
    pub phone: Option<String>,
    pub backup_email: Option<String>,
}

/// Update the current user's profile
///
/// PUT /api/users/profile
pub async fn update_profile(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Json(req): Json<UpdateProfileRequest>,
) -> Result<Json<UserResponse>, ApiError> {
    if let Some(name) = req.name.as_deref() {
        if let Err(e) = validate_name(name) {
            return Err(ApiError::validation_field("name", e));
        }
    }
    if let Some(backup) = req.backup_email.as_deref() {
        if let Err(e) = validate_email(backup) {
            return Err(ApiError::validation_field("backup_email", e));
        }
    }

    User::update_profile(
        &state.db,
        &user.id,
        req.name.as_deref().map(str::trim),
        req.phone.as_deref(),
        req.backup_email.as_deref(),
        state.clock.now(),
    )
    .await?;

    let updated = User::find_by_id(&state.db, &user.id)
        .await?
        .ok_or_else(|| ApiError::not_found("User not found"))?;
    Ok(Json(updated.into()))
}

/// Delete a user (admin only). Admins cannot delete themselves.
///
/// DELETE /api/users/:id
pub async fn delete_user(
    State(state): State<Arc<AppState>>,
    AdminUser(admin): AdminUser,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if id == admin.id {
        return Err(ApiError::bad_request("Cannot delete your own account"));
    }

    let user = User::find_by_id(&state.db, &id)
        .await?
        .ok_or_else(|| ApiError::not_found("User not found"))?;

    User::delete(&state.db, &user.id).await?;
    tracing::info!(user_id = %user.id, admin_id = %admin.id, "User deleted");

    Ok(Json(serde_json::json!({ "message": "User deleted successfully" })))
}
