use std::sync::Arc;

use axum::{
    extract::Request,
    http::StatusCode,
    middleware::{self, Next},
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::jobs::QueueManager;
use crate::middleware::auth::{optional_auth, require_auth, Authenticator};
use crate::middleware::rbac::require_roles;
use crate::models::user::Role;

pub mod handlers;

pub struct AppState {
    pub auth: Authenticator,
    pub queues: QueueManager,
}

/// Build the HTTP router. Everything lives under `/api/v1` except the
/// liveness probe.
pub fn router(state: Arc<AppState>) -> Router {
    let auth = state.auth.clone();

    let public = Router::new().route("/auth/refresh", post(handlers::refresh));

    let session = Router::new()
        .route("/session", get(handlers::session))
        .route_layer(middleware::from_fn_with_state(auth.clone(), optional_auth));

    let authenticated = Router::new()
        .route("/auth/me", get(handlers::me))
        .route("/auth/logout", post(handlers::logout))
        .route_layer(middleware::from_fn_with_state(auth.clone(), require_auth));

    // layers run outside-in: authenticate first, then check the role
    let admin = Router::new()
        .route("/queues", get(handlers::list_queues))
        .route("/queues/:name/stats", get(handlers::queue_stats))
        .route("/queues/:name/pause", post(handlers::pause_queue))
        .route("/queues/:name/resume", post(handlers::resume_queue))
        .route("/health", get(handlers::queue_health))
        .route_layer(middleware::from_fn(admin_only))
        .route_layer(middleware::from_fn_with_state(auth, require_auth));

    let v1 = Router::new()
        .merge(public)
        .merge(session)
        .merge(authenticated)
        .nest("/admin", admin);

    Router::new()
        .route("/health", get(handlers::liveness))
        .nest("/api/v1", v1)
        .fallback(fallback_404)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn admin_only(req: Request, next: Next) -> Result<axum::response::Response, crate::errors::AppError> {
    require_roles(&[Role::Admin], req, next).await
}

async fn fallback_404() -> StatusCode {
    StatusCode::NOT_FOUND
}
