//! End-to-end tests for the HTTP surface: authentication modes, role gating
//! and the admin queue dashboard.
//!
//! Runs against the in-memory user store and broker, so no PostgreSQL or
//! Redis is needed: `cargo test --test auth_flow`.

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use backend::api::{self, AppState};
use backend::auth::{TokenClaims, TokenService};
use backend::config::{QueueConfig, TokenConfig};
use backend::jobs::{MemoryBroker, QueueManager};
use backend::middleware::auth::Authenticator;
use backend::models::job::JobOptions;
use backend::models::user::{Principal, Role, UserRecord};
use backend::store::MemoryUserStore;

struct Harness {
    app: Router,
    tokens: Arc<TokenService>,
    users: MemoryUserStore,
    queues: QueueManager,
}

fn harness() -> Harness {
    let tokens = Arc::new(TokenService::new(&TokenConfig {
        secret: "integration-secret".into(),
        access_ttl_secs: 3600,
        refresh_ttl_secs: 86400,
    }));
    let users = MemoryUserStore::new();
    for (id, role) in [("alice", Role::User), ("root", Role::Admin)] {
        users.insert(UserRecord {
            id: id.into(),
            email: format!("{}@example.com", id),
            role,
            is_active: true,
        });
    }

    let queues = QueueManager::new(Arc::new(MemoryBroker::new()), QueueConfig::default());
    queues.create_queue("email", JobOptions::default());

    let state = Arc::new(AppState {
        auth: Authenticator::new(Arc::clone(&tokens), Arc::new(users.clone())),
        queues: queues.clone(),
    });
    Harness {
        app: api::router(state),
        tokens,
        users,
        queues,
    }
}

fn bearer(tokens: &TokenService, id: &str, role: Role) -> String {
    let token = tokens
        .issue_access_token(&TokenClaims {
            id: id.into(),
            email: format!("{}@example.com", id),
            role,
        })
        .unwrap();
    format!("Bearer {}", token)
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = to_bytes(resp.into_body(), 1024 * 1024).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn get(uri: &str, auth: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(uri);
    if let Some(auth) = auth {
        builder = builder.header(header::AUTHORIZATION, auth);
    }
    builder.body(Body::empty()).unwrap()
}

fn post(uri: &str, auth: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(auth) = auth {
        builder = builder.header(header::AUTHORIZATION, auth);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

// ── Required authentication ──────────────────────────────────

#[tokio::test]
async fn test_me_without_token_is_401() {
    let h = harness();
    let (status, body) = send(&h.app, get("/api/v1/auth/me", None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "token_missing");
}

#[tokio::test]
async fn test_me_with_malformed_scheme_is_401() {
    let h = harness();
    let (status, body) = send(&h.app, get("/api/v1/auth/me", Some("Basic abc"))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "token_missing");
}

#[tokio::test]
async fn test_me_with_foreign_signature_is_401() {
    let h = harness();
    let other = TokenService::new(&TokenConfig {
        secret: "someone-else".into(),
        access_ttl_secs: 3600,
        refresh_ttl_secs: 3600,
    });
    let auth = bearer(&other, "alice", Role::User);
    let (status, body) = send(&h.app, get("/api/v1/auth/me", Some(&auth))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "token_invalid");
}

#[tokio::test]
async fn test_me_returns_current_record() {
    let h = harness();
    let auth = bearer(&h.tokens, "alice", Role::User);
    let (status, body) = send(&h.app, get("/api/v1/auth/me", Some(&auth))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["user"]["id"], "alice");
    assert_eq!(body["user"]["role"], "user");
}

#[tokio::test]
async fn test_deleted_user_is_401() {
    let h = harness();
    let auth = bearer(&h.tokens, "alice", Role::User);
    h.users.remove("alice");
    let (status, body) = send(&h.app, get("/api/v1/auth/me", Some(&auth))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "user_missing");
}

#[tokio::test]
async fn test_disabled_user_is_401() {
    let h = harness();
    let auth = bearer(&h.tokens, "alice", Role::User);
    h.users.set_active("alice", false);
    let (status, body) = send(&h.app, get("/api/v1/auth/me", Some(&auth))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "user_disabled");
}

// ── Optional authentication ──────────────────────────────────

#[tokio::test]
async fn test_session_is_anonymous_without_or_with_bad_token() {
    let h = harness();
    let (status, body) = send(&h.app, get("/api/v1/session", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["authenticated"], false);

    let (status, body) = send(&h.app, get("/api/v1/session", Some("Bearer garbage"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["authenticated"], false);
}

#[tokio::test]
async fn test_session_attaches_principal() {
    let h = harness();
    let auth = bearer(&h.tokens, "alice", Role::User);
    let (_, body) = send(&h.app, get("/api/v1/session", Some(&auth))).await;
    assert_eq!(body["authenticated"], true);
    assert_eq!(body["user"]["email"], "alice@example.com");
}

// ── Refresh / logout ─────────────────────────────────────────

#[tokio::test]
async fn test_refresh_flow() {
    let h = harness();
    let pair = h
        .tokens
        .issue_token_pair(&Principal {
            id: "alice".into(),
            email: "alice@example.com".into(),
            role: Role::User,
        })
        .unwrap();

    let (status, body) = send(
        &h.app,
        post("/api/v1/auth/refresh", None, json!({"refreshToken": pair.refresh_token})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["expiresIn"], 3600);
    let access = body["accessToken"].as_str().unwrap();
    assert_eq!(h.tokens.verify(access).unwrap().id, "alice");

    let (status, _) = send(&h.app, post("/api/v1/auth/refresh", None, json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &h.app,
        post("/api/v1/auth/refresh", None, json!({"refreshToken": "nope"})),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_logout_requires_auth() {
    let h = harness();
    let (status, _) = send(&h.app, post("/api/v1/auth/logout", None, json!({}))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let auth = bearer(&h.tokens, "alice", Role::User);
    let (status, _) = send(&h.app, post("/api/v1/auth/logout", Some(&auth), json!({}))).await;
    assert_eq!(status, StatusCode::OK);
}

// ── Admin dashboard ──────────────────────────────────────────

#[tokio::test]
async fn test_admin_routes_reject_non_admin() {
    let h = harness();
    let auth = bearer(&h.tokens, "alice", Role::User);
    let (status, body) = send(&h.app, get("/api/v1/admin/queues", Some(&auth))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "insufficient_role");

    let (status, _) = send(&h.app, get("/api/v1/admin/queues", None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_role_is_taken_from_record_not_token() {
    let h = harness();
    // token claims admin, record says user
    let auth = bearer(&h.tokens, "alice", Role::Admin);
    let (status, _) = send(&h.app, get("/api/v1/admin/health", Some(&auth))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_admin_queue_dashboard() {
    let h = harness();
    h.queues
        .add_job("email", json!({"to": "x@example.com"}), JobOptions::default())
        .await
        .unwrap();
    let auth = bearer(&h.tokens, "root", Role::Admin);

    let (status, body) = send(&h.app, get("/api/v1/admin/queues", Some(&auth))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["queues"][0]["name"], "email");
    assert_eq!(body["queues"][0]["waiting"], 1);

    let (status, body) = send(
        &h.app,
        post("/api/v1/admin/queues/email/pause", Some(&auth), json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["paused"], true);

    let (status, body) = send(
        &h.app,
        post("/api/v1/admin/queues/email/resume", Some(&auth), json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["paused"], false);

    let (status, body) = send(&h.app, get("/api/v1/admin/queues/missing/stats", Some(&auth))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "queue_not_found");

    let (status, body) = send(&h.app, get("/api/v1/admin/health", Some(&auth))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn test_unknown_route_is_404() {
    let h = harness();
    let (status, _) = send(&h.app, get("/nowhere", None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
