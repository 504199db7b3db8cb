use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::{error, warn};

use crate::config::SignatureProvider;
use crate::error::ApiError;
use crate::repository::{BodyValue, CaptureEvent, Tristate, OFFLOAD_MARKER_SYNC};
use crate::signature;
use crate::ssrf;
use crate::AppState;

/// Headers whose value is replaced with `[MASKED]` before the capture is
/// stored or forwarded (§4.9 step 4).
pub const SENSITIVE_HEADERS: &[&str] = &[
    "authorization",
    "cookie",
    "set-cookie",
    "x-api-key",
    "x-auth-token",
    "proxy-authorization",
];

const MASKED_VALUE: &str = "[MASKED]";

/// Bodies larger than this are offloaded to the payload store (C6) rather
/// than stored inline in the log repository.
const OFFLOAD_THRESHOLD_BYTES: usize = 64 * 1024;

/// Test-mode value from §4.9; production deployments would raise this via
/// configuration, but the spec pins the test-mode figure explicitly.
const BACKGROUND_TASK_TIMEOUT: Duration = Duration::from_millis(100);

pub fn mask_headers(headers: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    headers
        .iter()
        .map(|(k, v)| {
            if SENSITIVE_HEADERS.contains(&k.to_ascii_lowercase().as_str()) {
                (k.clone(), MASKED_VALUE.to_string())
            } else {
                (k.clone(), v.clone())
            }
        })
        .collect()
}

/// `__status` query override: only a recognized 2xx/4xx/5xx integer
/// replaces the default `200` (§4.9 step 5).
pub fn parse_status_override(query: &BTreeMap<String, String>) -> Option<StatusCode> {
    let raw = query.get("__status")?;
    let code: u16 = raw.parse().ok()?;
    if (200..300).contains(&code) || (400..500).contains(&code) || (500..600).contains(&code) {
        StatusCode::from_u16(code).ok()
    } else {
        None
    }
}

pub(crate) fn client_ip_from_headers(headers: &HeaderMap, peer: SocketAddr) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .or_else(|| Some(peer.ip().to_string()))
}

fn header_map_to_btree(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .map(|(k, v)| (k.as_str().to_string(), v.to_str().unwrap_or("").to_string()))
        .collect()
}

/// Minimal JSON-schema check: `type`, `required`, `properties`, `enum`.
/// The spec treats full schema compliance as an admission rule, not a
/// general-purpose validator (§9); this is the pragmatic subset that rule
/// needs.
fn validate_json_schema(schema: &serde_json::Value, value: &serde_json::Value) -> Result<(), String> {
    if let Some(expected_type) = schema.get("type").and_then(|t| t.as_str()) {
        let actual_ok = match expected_type {
            "object" => value.is_object(),
            "array" => value.is_array(),
            "string" => value.is_string(),
            "number" => value.is_number(),
            "boolean" => value.is_boolean(),
            "null" => value.is_null(),
            _ => true,
        };
        if !actual_ok {
            return Err(format!("expected type '{expected_type}'"));
        }
    }

    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        for field in required {
            if let Some(name) = field.as_str() {
                if value.get(name).is_none() {
                    return Err(format!("missing required field '{name}'"));
                }
            }
        }
    }

    if let (Some(properties), Some(object)) = (schema.get("properties").and_then(|p| p.as_object()), value.as_object()) {
        for (name, sub_schema) in properties {
            if let Some(sub_value) = object.get(name) {
                validate_json_schema(sub_schema, sub_value)?;
            }
        }
    }

    if let Some(allowed) = schema.get("enum").and_then(|e| e.as_array()) {
        if !allowed.contains(value) {
            return Err("value not in enum".to_string());
        }
    }

    Ok(())
}

/// `POST /webhook/:id` — the ingestion endpoint (§4.9).
pub async fn ingest(
    State(state): State<Arc<AppState>>,
    Path(webhook_id): Path<String>,
    Query(query): Query<BTreeMap<String, String>>,
    method: Method,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    let start = std::time::Instant::now();
    let request_id = headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| crate::webhook_manager::generate_id("req"));

    let client_ip = match client_ip_from_headers(&headers, peer) {
        Some(ip) => ip,
        None => return ApiError::validation("Bad Request").into_response(),
    };

    // admission step a: webhook must exist and be unexpired
    if !state.webhooks.is_valid(&webhook_id).await {
        return ApiError::not_found(format!("Webhook '{webhook_id}' does not exist or has expired."))
            .with_request_id(request_id)
            .into_response();
    }

    let snapshot = state.config_snapshot.read().await.clone();

    // admission step b: CIDR allow-list (empty list = allow all)
    if !snapshot.allowed_ips.is_empty() {
        let refs: Vec<&str> = snapshot.allowed_ips.iter().map(String::as_str).collect();
        if !ssrf::check_ip_in_ranges(Some(&client_ip), &refs) {
            return ApiError::forbidden("Client IP is not in the allowed range.")
                .with_request_id(request_id)
                .into_response();
        }
    }

    // admission step c: payload size gate
    if body.len() > snapshot.max_payload_size {
        return ApiError::validation("Payload exceeds the configured maximum size.")
            .with_request_id(request_id)
            .into_response();
    }

    let raw_headers = header_map_to_btree(&headers);
    let content_type = headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    // admission step d: signature verification (tag-only per §9's Open Question)
    let (signature_valid, signature_provider, signature_error) = match &snapshot.signature_verification {
        Some(sig_config) => {
            let outcome = signature::verify(sig_config, &body, &headers, chrono::Utc::now().timestamp());
            (
                if outcome.valid { Tristate::True } else { Tristate::False },
                Some(provider_name(sig_config.provider).to_string()),
                outcome.error.map(|e| e.to_string()),
            )
        }
        None => (Tristate::Absent, None, None),
    };

    // admission step e: custom script — sandboxing is an external
    // collaborator per spec's own design notes; we log and continue rather
    // than executing untrusted code in-process.
    if snapshot.custom_script.is_some() {
        warn!(webhook_id = %webhook_id, "SCRIPT-EXEC-ERROR: custom script execution is not available in this deployment");
    }

    // admission step f: JSON schema validation
    let parsed_body: Option<serde_json::Value> = if snapshot.enable_json_parsing
        && content_type.as_deref().map(|c| c.contains("application/json")).unwrap_or(false)
    {
        match serde_json::from_slice::<serde_json::Value>(&body) {
            Ok(value) => {
                if let Some(schema) = &snapshot.json_schema {
                    if let Err(msg) = validate_json_schema(schema, &value) {
                        return ApiError::validation(msg).with_request_id(request_id).into_response();
                    }
                }
                Some(value)
            }
            Err(_) if snapshot.json_schema.is_some() => {
                return ApiError::validation("invalid JSON body").with_request_id(request_id).into_response();
            }
            Err(_) => None,
        }
    } else {
        None
    };

    let masked_headers = mask_headers(&raw_headers);
    let body_value = match &parsed_body {
        Some(value) => BodyValue::Inline(value.clone()),
        None => BodyValue::Inline(serde_json::Value::String(String::from_utf8_lossy(&body).to_string())),
    };

    let status = parse_status_override(&query).unwrap_or(StatusCode::OK);

    let event = CaptureEvent {
        id: crate::webhook_manager::generate_id("evt"),
        webhook_id: webhook_id.clone(),
        timestamp: chrono::Utc::now(),
        event_type: "capture".to_string(),
        method: method.to_string(),
        request_url: format!("/webhook/{webhook_id}"),
        headers: masked_headers.clone(),
        query: query.clone(),
        body: body_value,
        content_type: content_type.clone(),
        size: body.len(),
        processing_time_ms: start.elapsed().as_millis() as u64,
        status_code: status.as_u16(),
        remote_ip: Some(client_ip.clone()),
        user_agent: headers.get(axum::http::header::USER_AGENT).and_then(|v| v.to_str().ok()).map(str::to_string),
        request_id: request_id.clone(),
        signature_valid,
        signature_provider,
        signature_error,
        forward_attempts: None,
        forward_last_error: None,
        forward_target_host: None,
    };

    let response_delay = Duration::from_millis(snapshot.response_delay_ms);
    if !response_delay.is_zero() {
        tokio::time::sleep(response_delay).await;
    }

    let forward_url = snapshot.forward_url.clone();
    let forward_headers_enabled = snapshot.forward_headers;
    let raw_body = body.to_vec();

    // Background dispatch must never block the response (§4.9 step 6).
    let state_for_bg = state.clone();
    let mut event_for_bg = event.clone();
    event_for_bg.processing_time_ms = start.elapsed().as_millis() as u64;
    tokio::spawn(async move {
        dispatch_background(state_for_bg, event_for_bg, raw_body, raw_headers, forward_url, forward_headers_enabled).await;
    });

    let mut response = (status, "OK").into_response();
    if let Ok(value) = request_id.parse() {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

fn provider_name(provider: SignatureProvider) -> &'static str {
    match provider {
        SignatureProvider::Github => "github",
        SignatureProvider::Shopify => "shopify",
        SignatureProvider::Stripe => "stripe",
        SignatureProvider::Slack => "slack",
        SignatureProvider::Custom => "custom",
    }
}

/// The independent background tasks launched per capture (§4.9 "Background
/// tasks"): persist, broadcast, and optionally forward. Each has its own
/// bounded deadline so one slow collaborator cannot stall the others.
async fn dispatch_background(
    state: Arc<AppState>,
    mut event: CaptureEvent,
    raw_body: Vec<u8>,
    source_headers: BTreeMap<String, String>,
    forward_url: Option<String>,
    forward_headers_enabled: bool,
) {
    if raw_body.len() > OFFLOAD_THRESHOLD_BYTES {
        let key = crate::webhook_manager::generate_id("blob");
        state.payloads.put(&key, raw_body.clone()).await;
        event.body = BodyValue::Offload { marker: OFFLOAD_MARKER_SYNC.to_string(), key };
    }

    let persist = state.repository.insert_log(event.clone());
    if tokio::time::timeout(BACKGROUND_TASK_TIMEOUT, persist).await.is_err() {
        error!(event_id = %event.id, "persist background task exceeded its deadline");
    }

    state.event_bus.broadcast(event.clone());

    if let Some(target_url) = forward_url {
        let client = state.http_client.clone();
        let breaker = state.circuit_breaker.clone();
        let repository = state.repository.clone();
        let policy = state.retry_policy.clone();
        let forward = crate::forwarding::forward_webhook(
            &client,
            &breaker,
            repository.as_ref(),
            &event,
            raw_body,
            &source_headers,
            &target_url,
            forward_headers_enabled,
            &policy,
        );
        if tokio::time::timeout(BACKGROUND_TASK_TIMEOUT * 50, forward).await.is_err() {
            error!(event_id = %event.id, "forwarding background task exceeded its deadline");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_sensitive_headers_only() {
        let mut headers = BTreeMap::new();
        headers.insert("Authorization".to_string(), "Bearer secret".to_string());
        headers.insert("X-Custom".to_string(), "value".to_string());

        let masked = mask_headers(&headers);
        assert_eq!(masked.get("Authorization"), Some(&MASKED_VALUE.to_string()));
        assert_eq!(masked.get("X-Custom"), Some(&"value".to_string()));
    }

    #[test]
    fn status_override_accepts_recognized_codes() {
        let mut query = BTreeMap::new();
        query.insert("__status".to_string(), "201".to_string());
        assert_eq!(parse_status_override(&query), Some(StatusCode::CREATED));
    }

    #[test]
    fn status_override_rejects_invalid_value() {
        let mut query = BTreeMap::new();
        query.insert("__status".to_string(), "invalid".to_string());
        assert_eq!(parse_status_override(&query), None);
    }

    #[test]
    fn status_override_rejects_out_of_range_codes() {
        let mut query = BTreeMap::new();
        query.insert("__status".to_string(), "999".to_string());
        assert_eq!(parse_status_override(&query), None);
    }

    #[test]
    fn json_schema_detects_missing_required_field() {
        let schema = serde_json::json!({"type": "object", "required": ["name"]});
        let value = serde_json::json!({"other": 1});
        assert!(validate_json_schema(&schema, &value).is_err());
    }

    #[test]
    fn json_schema_accepts_matching_value() {
        let schema = serde_json::json!({"type": "object", "required": ["name"], "properties": {"name": {"type": "string"}}});
        let value = serde_json::json!({"name": "hook"});
        assert!(validate_json_schema(&schema, &value).is_ok());
    }
}
