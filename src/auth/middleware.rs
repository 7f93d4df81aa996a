//! Authentication extractor
//!
//! Protects the admin routes with the configured bearer token.

use axum::{
    async_trait,
    extract::{FromRef, FromRequestParts},
    http::{HeaderMap, request::Parts},
};

use crate::AppState;
use crate::error::AppError;

fn extract_token_from_headers(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
}

/// Compare without returning early on the first differing byte
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Extractor for an authenticated administrator
///
/// # Usage
/// ```ignore
/// async fn handler(_admin: Admin) -> impl IntoResponse {
///     "only admins get here"
/// }
/// ```
#[derive(Debug, Clone, Copy)]
pub struct Admin;

#[async_trait]
impl<S> FromRequestParts<S> for Admin
where
    AppState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let state = AppState::from_ref(state);
        let token = extract_token_from_headers(&parts.headers).ok_or(AppError::Unauthorized)?;

        if constant_time_eq(token.as_bytes(), state.config.admin.token.as_bytes()) {
            Ok(Admin)
        } else {
            tracing::warn!("Rejected admin request with a wrong token");
            Err(AppError::Unauthorized)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_token_is_read_from_authorization_header() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_token_from_headers(&headers), None);

        headers.insert("Authorization", "Bearer secret-token".parse().unwrap());
        assert_eq!(extract_token_from_headers(&headers), Some("secret-token"));

        headers.insert("Authorization", "Basic abc".parse().unwrap());
        assert_eq!(extract_token_from_headers(&headers), None);
    }

    #[test]
    fn constant_time_eq_compares_whole_input() {
        assert!(constant_time_eq(b"same-token", b"same-token"));
        assert!(!constant_time_eq(b"same-token", b"same-tokeN"));
        assert!(!constant_time_eq(b"short", b"longer-token"));
    }
}
