use axum::http::{HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::Json;
use serde::Serialize;

// ─── JSON envelope ──────────────────────────────────────────────────────────

#[derive(Serialize)]
struct ErrorEnvelope {
    status: u16,
    #[serde(rename = "requestId", skip_serializing_if = "Option::is_none")]
    request_id: Option<String>,
    error: &'static str,
    message: String,
}

/// The error-kind enumeration, independent of how it is rendered.
///
/// Each kind carries its own HTTP status and a stable title used as the
/// `error` field of the JSON envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Auth,
    RateLimited,
    Forbidden,
    UpstreamTransient,
    UpstreamPermanent,
    Internal,
}

impl ErrorKind {
    fn status(self) -> StatusCode {
        match self {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Auth => StatusCode::UNAUTHORIZED,
            ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::Forbidden => StatusCode::FORBIDDEN,
            ErrorKind::UpstreamTransient => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::UpstreamPermanent => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn title(self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation_error",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Auth => "unauthorized",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::UpstreamTransient => "upstream_transient",
            ErrorKind::UpstreamPermanent => "upstream_permanent",
            ErrorKind::Internal => "internal_error",
        }
    }
}

// ─── ApiError ───────────────────────────────────────────────────────────────

/// Structured API error that serializes to JSON (or, for `Auth`, to an HTML
/// page when the client's `Accept` header prefers HTML).
///
/// ```json
/// {
///   "status": 404,
///   "requestId": "req_abc123",
///   "error": "not_found",
///   "message": "Webhook 'abc123' does not exist or has expired."
/// }
/// ```
pub struct ApiError {
    pub kind: ErrorKind,
    pub message: String,
    pub request_id: Option<String>,
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            request_id: None,
        }
    }

    /// Attach the request id so it is echoed in the error body.
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, msg)
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Auth, msg)
    }

    pub fn rate_limited(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimited, msg)
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Forbidden, msg)
    }

    pub fn upstream_transient(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::UpstreamTransient, msg)
    }

    pub fn upstream_permanent(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::UpstreamPermanent, msg)
    }

    /// Internal errors are logged with full detail but the client only ever
    /// sees the constant label — the real message never crosses the wire.
    pub fn internal(logged: impl std::fmt::Display) -> Self {
        tracing::error!("internal error: {}", logged);
        Self::new(ErrorKind::Internal, "internal server error")
    }
}

fn wants_html(headers: &HeaderMap) -> bool {
    headers
        .get(axum::http::header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("text/html"))
        .unwrap_or(false)
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.kind.status();
        if status.is_server_error() {
            tracing::error!(error = self.kind.title(), %status, "{}", self.message);
        } else if status.is_client_error() {
            tracing::warn!(error = self.kind.title(), %status, "{}", self.message);
        }

        let envelope = ErrorEnvelope {
            status: status.as_u16(),
            request_id: self.request_id.clone(),
            error: self.kind.title(),
            message: self.message,
        };

        (status, Json(envelope)).into_response()
    }
}

/// Render an [`ApiError`], choosing an HTML page over JSON for `Auth`
/// failures when the request's `Accept` header prefers it (§7: "401 (HTML
/// when browser accepts it, JSON otherwise)").
pub fn render(err: ApiError, headers: &HeaderMap) -> Response {
    if err.kind == ErrorKind::Auth && wants_html(headers) {
        let status = err.kind.status();
        tracing::warn!(error = err.kind.title(), %status, "{}", err.message);
        return (
            status,
            Html(format!(
                "<!doctype html><title>{status}</title><h1>{status}</h1><p>{}</p>",
                err.message
            )),
        )
            .into_response();
    }
    err.into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn body_string(err: ApiError) -> String {
        let response = err.into_response();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn json_structure() {
        let json = body_string(ApiError::not_found("Webhook 'abc' does not exist.")).await;
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["error"], "not_found");
        assert_eq!(value["status"], 404);
        assert_eq!(value["message"], "Webhook 'abc' does not exist.");
    }

    #[tokio::test]
    async fn status_codes_match_kind() {
        assert_eq!(
            ApiError::rate_limited("too many").into_response().status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ApiError::forbidden("cidr").into_response().status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ApiError::upstream_transient("timeout").into_response().status(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[tokio::test]
    async fn internal_error_message_is_sanitized() {
        let err = ApiError::internal("leaked db connection string: postgres://...");
        let json = body_string(err).await;
        assert!(!json.contains("postgres://"));
        assert!(json.contains("internal server error"));
    }

    #[test]
    fn auth_prefers_html_when_accepted() {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::ACCEPT, "text/html".parse().unwrap());
        let response = render(ApiError::auth("missing key"), &headers);
        let content_type = response.headers().get(axum::http::header::CONTENT_TYPE);
        assert!(content_type
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .contains("html"));
    }

    #[test]
    fn auth_falls_back_to_json() {
        let headers = HeaderMap::new();
        let response = render(ApiError::auth("missing key"), &headers);
        let content_type = response.headers().get(axum::http::header::CONTENT_TYPE);
        assert!(content_type
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .contains("json"));
    }
}
