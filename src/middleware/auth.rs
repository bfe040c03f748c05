use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;

use crate::errors::ApiError;
use crate::models::token::TokenScope;
use crate::models::user::User;
use crate::AppState;

/// The resolved principal: the token's user plus the token scopes that
/// bound what this request may do.
#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub user: User,
    pub scopes: Vec<TokenScope>,
}

impl CurrentUser {
    /// Admin mode is a gate on top of the admin flag: the token itself
    /// must carry the `admin_mode` scope.
    pub fn admin_mode(&self) -> bool {
        self.user.admin && self.scopes.contains(&TokenScope::AdminMode)
    }

    pub fn can_write(&self) -> bool {
        self.scopes.contains(&TokenScope::Api)
    }
}

/// Request extension present on every request; `None` when anonymous.
#[derive(Debug, Clone, Default)]
pub struct MaybeUser(pub Option<CurrentUser>);

/// Resolves `Authorization: Bearer` / `PRIVATE-TOKEN` into a principal.
/// A missing header is anonymous; a bad, revoked, or expired token is
/// 401. Read-scoped tokens are rejected up front for mutating methods.
pub async fn authenticate(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let current = match raw_token(&req) {
        None => None,
        Some(raw) => {
            let (token, user) = state
                .store
                .resolve_token(&raw)
                .ok_or(ApiError::Unauthorized)?;
            if !user.active() {
                tracing::warn!(user = user.id, "blocked user presented a valid token");
                return Err(ApiError::Unauthorized);
            }
            Some(CurrentUser {
                user,
                scopes: token.scopes,
            })
        }
    };

    if let Some(cu) = &current {
        let mutating = !matches!(
            req.method().as_str(),
            "GET" | "HEAD" | "OPTIONS"
        );
        if mutating && !cu.can_write() {
            tracing::warn!(user = cu.user.id, "read-scoped token attempted a write");
            return Err(ApiError::Forbidden);
        }
    }

    req.extensions_mut().insert(MaybeUser(current));
    Ok(next.run(req).await)
}

fn raw_token(req: &Request) -> Option<String> {
    let headers = req.headers();
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string())
        .or_else(|| {
            headers
                .get("private-token")
                .and_then(|v| v.to_str().ok())
                .map(|t| t.trim().to_string())
        })
}

/// Test-friendly constructor used by fixtures.
pub fn current_user(user: User, scopes: Vec<TokenScope>) -> CurrentUser {
    CurrentUser { user, scopes }
}
