use axum::{extract::Request, middleware::Next, response::Response};
use subtle::ConstantTimeEq;

use super::error::ApiError;

/// Extract a Bearer token from the Authorization header.
fn extract_bearer(req: &Request) -> Option<String> {
    if let Some(auth_header) = req.headers().get("authorization") {
        if let Ok(auth_str) = auth_header.to_str() {
            if let Some(token) = auth_str.strip_prefix("Bearer ") {
                return Some(token.to_string());
            }
        }
    }
    None
}

/// Auth middleware function.
///
/// Requests must carry `Authorization: Bearer <token>`. A missing header is
/// 401; a header that does not match the configured token is 403. The
/// comparison is constant-time.
pub async fn require_auth(
    expected_token: String,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if let Some(ref token) = extract_bearer(&req) {
        if token.as_bytes().ct_eq(expected_token.as_bytes()).into() {
            return Ok(next.run(req).await);
        }
        return Err(ApiError::AuthInvalid);
    }

    Err(ApiError::AuthRequired)
}
