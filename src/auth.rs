use axum::http::HeaderMap;

use crate::error::ApiError;

/// Validate the `Authorization: Bearer <authKey>` header against the
/// configured key.
///
/// Per §6, all management endpoints require bearer auth *when* `authKey` is
/// configured — a `None` key means auth is disabled entirely, and every
/// request passes.
pub fn require_auth(headers: &HeaderMap, auth_key: Option<&str>) -> Result<(), ApiError> {
    let Some(expected) = auth_key else {
        return Ok(());
    };

    let provided = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| ApiError::auth("Authorization header is missing or malformed."))?;

    if constant_time_eq(provided.as_bytes(), expected.as_bytes()) {
        Ok(())
    } else {
        Err(ApiError::auth("The provided API key is not valid."))
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    use subtle::ConstantTimeEq;
    a.len() == b.len() && a.ct_eq(b).into()
}
