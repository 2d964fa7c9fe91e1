use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::auth::jwt::TokenError;
use crate::jobs::QueueError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("token missing")]
    TokenMissing,

    #[error("token expired")]
    TokenExpired,

    #[error("token invalid")]
    TokenInvalid,

    #[error("user missing")]
    UserNotFound,

    #[error("user disabled")]
    UserDisabled,

    #[error("insufficient role")]
    InsufficientRole,

    #[error("not the resource owner")]
    NotOwner,

    #[error("resource ownership could not be determined")]
    OwnershipUndetermined,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("queue not found: {0}")]
    QueueNotFound(String),

    #[error("job {id} not found in queue {queue}")]
    JobNotFound { queue: String, id: u64 },

    #[error("job {id} in queue {queue} is active")]
    JobActive { queue: String, id: u64 },

    #[error("broker error: {0}")]
    Broker(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<TokenError> for AppError {
    fn from(e: TokenError) -> Self {
        match e {
            TokenError::Expired => AppError::TokenExpired,
            TokenError::Invalid(_) => AppError::TokenInvalid,
            TokenError::Signing(msg) => AppError::Internal(anyhow::anyhow!(msg)),
        }
    }
}

impl From<QueueError> for AppError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::QueueNotFound(name) => AppError::QueueNotFound(name),
            QueueError::JobActive { queue, id } => AppError::JobActive { queue, id },
            QueueError::InvalidCron { pattern, reason } => {
                AppError::BadRequest(format!("invalid cron pattern '{}': {}", pattern, reason))
            }
            QueueError::ProcessorExists(name) => {
                AppError::Internal(anyhow::anyhow!("queue '{}' already has a processor", name))
            }
            QueueError::Broker(msg) => AppError::Broker(msg),
            QueueError::Serialization(e) => AppError::Internal(e.into()),
        }
    }
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::TokenMissing
            | AppError::TokenExpired
            | AppError::TokenInvalid
            | AppError::UserNotFound
            | AppError::UserDisabled => StatusCode::UNAUTHORIZED,
            AppError::InsufficientRole | AppError::NotOwner => StatusCode::FORBIDDEN,
            AppError::OwnershipUndetermined | AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::QueueNotFound(_) | AppError::JobNotFound { .. } => StatusCode::NOT_FOUND,
            AppError::JobActive { .. } => StatusCode::CONFLICT,
            AppError::Broker(_) | AppError::Database(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (error_type, code, msg) = match &self {
            AppError::TokenMissing => (
                "authentication_error",
                "token_missing",
                "access token missing, please log in".to_string(),
            ),
            AppError::TokenExpired => (
                "authentication_error",
                "token_expired",
                "access token expired, please log in again".to_string(),
            ),
            AppError::TokenInvalid => (
                "authentication_error",
                "token_invalid",
                "invalid access token".to_string(),
            ),
            AppError::UserNotFound => (
                "authentication_error",
                "user_missing",
                "user does not exist or has been deleted".to_string(),
            ),
            AppError::UserDisabled => (
                "authentication_error",
                "user_disabled",
                "user account has been disabled".to_string(),
            ),
            AppError::InsufficientRole => (
                "permission_error",
                "insufficient_role",
                "insufficient permissions to access this resource".to_string(),
            ),
            AppError::NotOwner => (
                "permission_error",
                "not_owner",
                "you can only modify your own resources".to_string(),
            ),
            AppError::OwnershipUndetermined => (
                "invalid_request_error",
                "ownership_undetermined",
                "unable to determine resource ownership".to_string(),
            ),
            AppError::BadRequest(m) => ("invalid_request_error", "bad_request", m.clone()),
            AppError::QueueNotFound(name) => (
                "not_found_error",
                "queue_not_found",
                format!("queue '{}' does not exist", name),
            ),
            AppError::JobNotFound { queue, id } => (
                "not_found_error",
                "job_not_found",
                format!("job {} not found in queue '{}'", id, queue),
            ),
            AppError::JobActive { queue, id } => (
                "conflict_error",
                "job_active",
                format!("job {} in queue '{}' is being processed", id, queue),
            ),
            AppError::Broker(e) => {
                tracing::error!("Broker error: {}", e);
                internal()
            }
            AppError::Database(e) => {
                tracing::error!("Database error: {}", e);
                internal()
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {}", e);
                internal()
            }
        };

        let body = Json(json!({
            "error": {
                "message": msg,
                "type": error_type,
                "code": code,
            }
        }));

        let mut response = (status, body).into_response();

        if status == StatusCode::UNAUTHORIZED {
            response.headers_mut().insert(
                axum::http::header::WWW_AUTHENTICATE,
                axum::http::HeaderValue::from_static("Bearer"),
            );
        }

        response
    }
}

fn internal() -> (&'static str, &'static str, String) {
    (
        "internal_error",
        "internal_server_error",
        "internal server error".to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(AppError::TokenMissing.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(AppError::UserDisabled.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(AppError::InsufficientRole.status(), StatusCode::FORBIDDEN);
        assert_eq!(AppError::NotOwner.status(), StatusCode::FORBIDDEN);
        assert_eq!(AppError::OwnershipUndetermined.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            AppError::QueueNotFound("x".into()).status(),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn test_token_error_mapping() {
        assert!(matches!(AppError::from(TokenError::Expired), AppError::TokenExpired));
        assert!(matches!(
            AppError::from(TokenError::Invalid("bad sig".into())),
            AppError::TokenInvalid
        ));
        assert!(matches!(
            AppError::from(TokenError::Signing("boom".into())),
            AppError::Internal(_)
        ));
    }

    #[test]
    fn test_unauthorized_sets_challenge_header() {
        let resp = AppError::TokenExpired.into_response();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(resp.headers()["www-authenticate"], "Bearer");

        let resp = AppError::NotOwner.into_response();
        assert!(resp.headers().get("www-authenticate").is_none());
    }
}
