use axum::extract::Request;
use axum::middleware::Next;
use axum::response::Response;

use crate::errors::AppError;
use crate::models::user::{Principal, Role};

/// Role check applied after authentication.
pub fn authorize(principal: &Principal, allowed: &[Role]) -> Result<(), AppError> {
    if allowed.contains(&principal.role) {
        return Ok(());
    }
    tracing::warn!(
        user_id = %principal.id,
        role = %principal.role,
        allowed = ?allowed,
        "RBAC access denied: insufficient role"
    );
    Err(AppError::InsufficientRole)
}

/// Ownership check against a resource's owner field. Admins always pass;
/// a resource with a missing or empty owner cannot be attributed and is
/// rejected.
pub fn ensure_owner(principal: &Principal, owner_id: Option<&str>) -> Result<(), AppError> {
    if principal.is_admin() {
        return Ok(());
    }
    let owner = owner_id.filter(|o| !o.is_empty()).ok_or_else(|| {
        tracing::warn!(user_id = %principal.id, "ownership check on resource without owner");
        AppError::OwnershipUndetermined
    })?;
    if owner != principal.id {
        tracing::warn!(user_id = %principal.id, owner_id = owner, "ownership check failed");
        return Err(AppError::NotOwner);
    }
    Ok(())
}

/// Ownership check for JSON documents keyed by an owner field (e.g. `author`).
pub fn ensure_owner_of(
    principal: &Principal,
    resource: &serde_json::Value,
    owner_field: &str,
) -> Result<(), AppError> {
    let owner = resource.get(owner_field).and_then(|v| match v {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    });
    ensure_owner(principal, owner.as_deref())
}

/// Middleware body for role-gated routes. Must run after `require_auth`:
///
/// ```ignore
/// .route_layer(middleware::from_fn(|req, next| require_roles(&[Role::Admin], req, next)))
/// ```
pub async fn require_roles(
    allowed: &'static [Role],
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let principal = req
        .extensions()
        .get::<Principal>()
        .ok_or(AppError::TokenMissing)?;
    authorize(principal, allowed)?;
    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn principal(id: &str, role: Role) -> Principal {
        Principal {
            id: id.into(),
            email: format!("{}@example.com", id),
            role,
        }
    }

    #[test]
    fn test_authorize_allows_listed_roles() {
        let p = principal("u1", Role::Moderator);
        assert!(authorize(&p, &[Role::Moderator, Role::Admin]).is_ok());
    }

    #[test]
    fn test_authorize_rejects_unlisted_role() {
        let p = principal("u1", Role::User);
        assert!(matches!(
            authorize(&p, &[Role::Admin]),
            Err(AppError::InsufficientRole)
        ));
        assert!(matches!(authorize(&p, &[]), Err(AppError::InsufficientRole)));
    }

    #[test]
    fn test_admin_bypasses_ownership() {
        let admin = principal("root", Role::Admin);
        assert!(ensure_owner(&admin, Some("someone-else")).is_ok());
        assert!(ensure_owner(&admin, None).is_ok());
    }

    #[test]
    fn test_ownership_missing_owner_is_bad_request() {
        let p = principal("u1", Role::User);
        assert!(matches!(
            ensure_owner(&p, None),
            Err(AppError::OwnershipUndetermined)
        ));
        assert!(matches!(
            ensure_owner(&p, Some("")),
            Err(AppError::OwnershipUndetermined)
        ));
    }

    #[test]
    fn test_ownership_mismatch_is_forbidden() {
        let p = principal("u1", Role::Moderator);
        assert!(matches!(ensure_owner(&p, Some("u2")), Err(AppError::NotOwner)));
        assert!(ensure_owner(&p, Some("u1")).is_ok());
    }

    #[test]
    fn test_ownership_of_json_resource() {
        let p = principal("u1", Role::User);
        let post = json!({"title": "hello", "author": "u1"});
        assert!(ensure_owner_of(&p, &post, "author").is_ok());

        let other = json!({"title": "hello", "author": "u9"});
        assert!(matches!(
            ensure_owner_of(&p, &other, "author"),
            Err(AppError::NotOwner)
        ));

        let orphan = json!({"title": "hello"});
        assert!(matches!(
            ensure_owner_of(&p, &orphan, "author"),
            Err(AppError::OwnershipUndetermined)
        ));
    }
}
