//! Bearer-credential authentication. User credentials resolve against the
//! store; the admin credential is a separate capability checked per route.

use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::error::ProxyError;
use crate::http::AppState;

/// Paths served without any credential.
pub const PUBLIC_PATHS: &[&str] = &["/", "/health"];

/// Authenticated caller, resolved by the middleware and read back by the
/// handlers via request extensions.
#[derive(Clone, Debug)]
pub struct AuthedUser {
    pub id: String,
}

/// Middleware for the user surface. Admin routes carry their own guard and
/// static assets plus the public health paths are exempt.
pub async fn authenticate(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path();
    if PUBLIC_PATHS.contains(&path) || path.starts_with("/static") || path.starts_with("/admin") {
        return next.run(request).await;
    }

    let token = match bearer_token(request.headers()) {
        Ok(token) => token,
        Err(err) => return err.into_response(),
    };

    // The user id embedded in the credential is advisory only; the lookup is
    // an exact match on the full token.
    let user = match state.store.user_by_api_key(token).await {
        Ok(Some(user)) => user,
        Ok(None) => {
            return ProxyError::Unauthenticated("invalid API key".to_string()).into_response();
        }
        Err(err) => return ProxyError::from(err).into_response(),
    };

    request.extensions_mut().insert(AuthedUser { id: user.id });
    next.run(request).await
}

/// Admin guard: same bearer header, compared against the configured secret in
/// constant time.
pub fn require_admin(headers: &HeaderMap, admin_api_key: &str) -> Result<(), ProxyError> {
    let token = bearer_token(headers)?;
    if !constant_time_eq(token.as_bytes(), admin_api_key.as_bytes()) {
        return Err(ProxyError::Forbidden);
    }
    Ok(())
}

pub fn bearer_token(headers: &HeaderMap) -> Result<&str, ProxyError> {
    let Some(value) = headers.get("authorization") else {
        return Err(ProxyError::Unauthenticated(
            "missing Authorization header".to_string(),
        ));
    };
    let value = value.to_str().map_err(|_| {
        ProxyError::Unauthenticated("invalid Authorization header".to_string())
    })?;
    let Some(token) = value.strip_prefix("Bearer ") else {
        return Err(ProxyError::Unauthenticated(
            "invalid Authorization header format, use 'Bearer <api_key>'".to_string(),
        ));
    };
    let token = token.trim();
    if token.is_empty() {
        return Err(ProxyError::Unauthenticated(
            "invalid Authorization header format, use 'Bearer <api_key>'".to_string(),
        ));
    }
    Ok(token)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
