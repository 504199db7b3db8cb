use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::error::ApiError;
use crate::repository::{BodyValue, CompareOp, JsonProbe, LogFilter, SortField};

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 500;

/// Translate the raw query string into a [`LogFilter`]. Every recognized key
/// is an explicit field name, so an attacker-controlled key can at worst be
/// ignored — never interpreted as a path into the filter or repository
/// (§9 "ambient prototype-pollution vulnerability").
pub fn parse_filter(query: &BTreeMap<String, String>) -> LogFilter {
    let mut filter = LogFilter {
        webhook_id: query.get("webhookId").cloned(),
        method: query.get("method").cloned(),
        search: query.get("search").cloned(),
        remote_ip: query.get("remoteIp").cloned(),
        content_type_like: query.get("contentType").cloned(),
        user_agent_like: query.get("userAgent").cloned(),
        request_url_like: query.get("requestUrl").cloned(),
        signature_error_like: query.get("signatureError").cloned(),
        ..Default::default()
    };

    for (field, op_name) in [("status_code", "status_code"), ("timestamp", "timestamp")] {
        for op in [CompareOp::Eq, CompareOp::Ne, CompareOp::Gt, CompareOp::Gte, CompareOp::Lt, CompareOp::Lte] {
            let key = format!("{op_name}.{}", op_name_of(op));
            let Some(raw) = query.get(&key) else { continue };
            if field == "status_code" {
                if let Ok(value) = raw.parse::<i64>() {
                    filter.status_code.push((op, value));
                }
            } else if let Ok(ts) = chrono::DateTime::parse_from_rfc3339(raw) {
                filter.timestamp.push((op, ts.with_timezone(&chrono::Utc)));
            }
        }
    }

    let body_paths: BTreeMap<String, String> = query
        .iter()
        .filter_map(|(k, v)| k.strip_prefix("body.").map(|path| (path.to_string(), v.clone())))
        .collect();
    filter.body_probe = if !body_paths.is_empty() {
        Some(JsonProbe::Paths(body_paths))
    } else {
        query.get("bodyContains").cloned().map(JsonProbe::FullText)
    };

    let header_paths: BTreeMap<String, String> = query
        .iter()
        .filter_map(|(k, v)| k.strip_prefix("header.").map(|path| (path.to_string(), v.clone())))
        .collect();
    filter.headers_probe = if !header_paths.is_empty() { Some(JsonProbe::Paths(header_paths)) } else { None };

    let sort: Vec<SortField> = query
        .get("sort")
        .map(|raw| {
            raw.split(',')
                .filter_map(|entry| {
                    let (field, dir) = entry.split_once(':').unwrap_or((entry, "desc"));
                    if field.is_empty() {
                        None
                    } else {
                        Some(SortField { field: field.to_string(), descending: dir != "asc" })
                    }
                })
                .collect()
        })
        .unwrap_or_default();

    filter.with_sort(sort)
}

fn op_name_of(op: CompareOp) -> &'static str {
    match op {
        CompareOp::Eq => "eq",
        CompareOp::Ne => "ne",
        CompareOp::Gt => "gt",
        CompareOp::Gte => "gte",
        CompareOp::Lt => "lt",
        CompareOp::Lte => "lte",
    }
}

fn clamp_limit(raw: Option<&String>) -> usize {
    raw.and_then(|v| v.parse::<usize>().ok()).unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
}

/// `GET /logs` (§4.11): offset pagination by default, cursor pagination when
/// a `cursor` query parameter is present.
pub async fn list_logs(
    State(state): State<Arc<crate::AppState>>,
    Query(query): Query<BTreeMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let snapshot = state.config_snapshot.read().await.clone();
    if let Err(err) = crate::auth::require_auth(&headers, snapshot.auth_key.as_deref()) {
        return crate::error::render(err, &headers);
    }

    let filter = parse_filter(&query);
    let limit = clamp_limit(query.get("limit"));

    if let Some(cursor) = query.get("cursor") {
        let page = state.repository.find_logs_cursor(&filter, limit, Some(cursor)).await;
        return Json(serde_json::json!({
            "items": page.items,
            "nextCursor": page.next_cursor,
        }))
        .into_response();
    }

    if query.contains_key("cursorStart") {
        let page = state.repository.find_logs_cursor(&filter, limit, None).await;
        return Json(serde_json::json!({
            "items": page.items,
            "nextCursor": page.next_cursor,
        }))
        .into_response();
    }

    let offset = query.get("offset").and_then(|v| v.parse::<usize>().ok()).unwrap_or(0);
    let page = state.repository.find_logs(&filter, limit, offset).await;
    Json(serde_json::json!({
        "items": page.items,
        "total": page.total,
    }))
    .into_response()
}

/// `GET /logs/:id` (§4.11). Optional `fields` query param projects the
/// response down to a chosen set of top-level keys.
pub async fn get_log(
    State(state): State<Arc<crate::AppState>>,
    Path(id): Path<String>,
    Query(query): Query<BTreeMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let snapshot = state.config_snapshot.read().await.clone();
    if let Err(err) = crate::auth::require_auth(&headers, snapshot.auth_key.as_deref()) {
        return crate::error::render(err, &headers);
    }

    let Some(event) = state.repository.get_log_by_id(&id).await else {
        return ApiError::not_found(format!("Log '{id}' does not exist.")).into_response();
    };

    if !state.webhooks.is_valid(&event.webhook_id).await {
        return ApiError::not_found(format!("Log '{id}' does not exist.")).into_response();
    }

    let full = serde_json::to_value(&event).unwrap_or(serde_json::Value::Null);
    match query.get("fields") {
        Some(fields) => {
            let wanted: Vec<&str> = fields.split(',').map(str::trim).filter(|f| !f.is_empty()).collect();
            let mut projected = serde_json::Map::new();
            if let Some(object) = full.as_object() {
                for field in wanted {
                    if let Some(value) = object.get(field) {
                        projected.insert(field.to_string(), value.clone());
                    }
                }
            }
            Json(serde_json::Value::Object(projected)).into_response()
        }
        None => Json(full).into_response(),
    }
}

/// `GET /logs/:id/payload` (§4.11): the raw captured body, rehydrated from
/// the payload store if it was offloaded.
pub async fn get_log_payload(State(state): State<Arc<crate::AppState>>, Path(id): Path<String>, headers: HeaderMap) -> Response {
    let snapshot = state.config_snapshot.read().await.clone();
    if let Err(err) = crate::auth::require_auth(&headers, snapshot.auth_key.as_deref()) {
        return crate::error::render(err, &headers);
    }

    let Some(event) = state.repository.get_log_by_id(&id).await else {
        return ApiError::not_found(format!("Log '{id}' does not exist.")).into_response();
    };

    let bytes: Vec<u8> = match &event.body {
        BodyValue::Offload { key, .. } => match state.payloads.get(key).await {
            Some(bytes) => bytes,
            None => return ApiError::not_found("The offloaded payload is no longer available.").into_response(),
        },
        BodyValue::Inline(serde_json::Value::String(s)) => s.clone().into_bytes(),
        BodyValue::Inline(value) => serde_json::to_vec(value).unwrap_or_default(),
    };

    let mut resp_headers = HeaderMap::new();
    let content_type = event.content_type.clone().unwrap_or_else(|| "application/octet-stream".to_string());
    if let Ok(value) = content_type.parse() {
        resp_headers.insert(axum::http::header::CONTENT_TYPE, value);
    }
    (resp_headers, bytes).into_response()
}
