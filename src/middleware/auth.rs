//! Authentication middleware.
//!
//! Per request: extract the bearer token → verify it → look up the subject →
//! check the account is active. Required mode turns any failure into a 401;
//! optional mode downgrades every failure to an anonymous request.

use std::sync::Arc;

use axum::async_trait;
use axum::extract::{FromRequestParts, Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::middleware::Next;
use axum::response::Response;

use crate::auth::jwt::{extract_from_header, TokenPair, TokenService};
use crate::errors::AppError;
use crate::models::user::Principal;
use crate::store::UserLookup;

#[derive(Clone)]
pub struct Authenticator {
    tokens: Arc<TokenService>,
    users: Arc<dyn UserLookup>,
}

impl Authenticator {
    pub fn new(tokens: Arc<TokenService>, users: Arc<dyn UserLookup>) -> Self {
        Self { tokens, users }
    }

    pub fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    /// Required-auth decision for an `Authorization` header value.
    pub async fn authenticate(&self, header: Option<&str>) -> Result<Principal, AppError> {
        let result = self.try_authenticate(header).await;
        if let Err(ref e) = result {
            match e {
                AppError::Internal(_) | AppError::Database(_) => {
                    tracing::error!(error = %e, "authentication failed unexpectedly")
                }
                _ => tracing::warn!(reason = %e, "authentication rejected"),
            }
        }
        result
    }

    /// Optional-auth decision: `None` means the request proceeds anonymously.
    pub async fn authenticate_optional(&self, header: Option<&str>) -> Option<Principal> {
        // no token at all is the normal anonymous case, not a failure
        extract_from_header(header)?;
        match self.try_authenticate(header).await {
            Ok(principal) => Some(principal),
            Err(e) => {
                tracing::debug!(reason = %e, "optional authentication failed, continuing anonymously");
                None
            }
        }
    }

    /// Exchange a refresh token for a new pair built from the current user record.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, AppError> {
        if refresh_token.trim().is_empty() {
            return Err(AppError::BadRequest("refresh token must not be empty".into()));
        }
        let claims = self.tokens.verify(refresh_token).map_err(|e| {
            tracing::warn!(reason = %e, "refresh rejected");
            AppError::from(e)
        })?;
        let principal = self.resolve(&claims.id).await?;
        tracing::info!(user_id = %principal.id, "session refreshed");
        Ok(self.tokens.issue_token_pair(&principal)?)
    }

    /// Tokens are stateless; logging out only records the event.
    pub fn logout(&self, principal: &Principal) {
        tracing::info!(user_id = %principal.id, email = %principal.email, "user logged out");
    }

    async fn try_authenticate(&self, header: Option<&str>) -> Result<Principal, AppError> {
        let token = extract_from_header(header).ok_or(AppError::TokenMissing)?;
        let claims = self.tokens.verify(token)?;
        self.resolve(&claims.id).await
    }

    async fn resolve(&self, user_id: &str) -> Result<Principal, AppError> {
        let user = self
            .users
            .find_by_id(user_id)
            .await
            .map_err(AppError::Internal)?
            .ok_or(AppError::UserNotFound)?;

        if !user.is_active {
            return Err(AppError::UserDisabled);
        }
        Ok(Principal::from(user))
    }
}

// Owned copy so the borrow of the (non-Sync) request does not span an await.
fn authorization_header(req: &Request) -> Option<String> {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

/// Middleware: reject the request unless it carries a valid token for an
/// active user. The resolved [`Principal`] is stored in request extensions.
pub async fn require_auth(
    State(auth): State<Authenticator>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let header = authorization_header(&req);
    let principal = auth.authenticate(header.as_deref()).await?;
    tracing::debug!(user_id = %principal.id, role = %principal.role, "authenticated");
    req.extensions_mut().insert(principal);
    Ok(next.run(req).await)
}

/// Middleware: attach a [`Principal`] when one can be resolved, otherwise
/// let the request through untouched.
pub async fn optional_auth(
    State(auth): State<Authenticator>,
    mut req: Request,
    next: Next,
) -> Response {
    let header = authorization_header(&req);
    if let Some(principal) = auth.authenticate_optional(header.as_deref()).await {
        req.extensions_mut().insert(principal);
    }
    next.run(req).await
}

/// Extractor for handlers behind [`require_auth`].
#[derive(Debug, Clone)]
pub struct CurrentUser(pub Principal);

#[async_trait]
impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Principal>()
            .cloned()
            .map(CurrentUser)
            .ok_or(AppError::TokenMissing)
    }
}

/// Extractor for handlers behind [`optional_auth`].
#[derive(Debug, Clone)]
pub struct MaybeUser(pub Option<Principal>);

#[async_trait]
impl<S> FromRequestParts<S> for MaybeUser
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(MaybeUser(parts.extensions.get::<Principal>().cloned()))
    }
}
