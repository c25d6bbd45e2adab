pub mod attendance;
pub mod auth;
mod error;
mod notifications;
mod users;
mod validation;

pub use error::{ApiError, ErrorCode};

use axum::{
    routing::{delete, get, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    // Auth routes. Handlers that need a user pull it from the Bearer token
    // themselves; everything else here is public by design (the generic
    // forgot-password ack included).
    let auth_routes = Router::new()
        .route("/register", post(auth::register))
        .route("/login", post(auth::login))
        .route("/forgot-password", post(auth::forgot_password))
        .route("/reset-password", post(auth::reset_password))
        .route("/unlock-account", post(auth::unlock_account))
        .route("/profile", get(auth::profile))
        .route("/change-password", put(auth::change_password));

    // The scan endpoint is public: the signed token is the credential.
    let attendance_routes = Router::new()
        .route("/scan", get(attendance::scan))
        .route("/qr", post(attendance::issue_qr))
        .route("/qr/active", get(attendance::active_qr))
        .route("/qr/history", get(attendance::qr_history))
        .route("/qr/:user_id", post(attendance::issue_qr_for_user))
        .route("/my-attendance", get(attendance::my_attendance))
        .route("/", get(attendance::list_all_attendance));

    let user_routes = Router::new()
        .route("/", get(users::list_users))
        .route("/profile", put(users::update_profile))
        .route("/:id", get(users::get_user))
        .route("/:id", delete(users::delete_user));

    let notification_routes = Router::new().route("/", get(notifications::list_notifications));

    Router::new()
        .route("/health", get(health_check))
        .nest("/api/auth", auth_routes)
        .nest("/api/attendance", attendance_routes)
        .nest("/api/users", user_routes)
        .nest("/api/notifications", notification_routes)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "ok"
}
