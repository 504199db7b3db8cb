use std::sync::Arc;

use axum::extract::{Path, RawQuery, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::error::ApiError;
use crate::forwarding::{self, ForwardFailureKind, RetryPolicy};
use crate::repository::{BodyValue, CaptureEvent, LogFilter};

const SCAN_PAGE_SIZE: usize = 1000;

/// Locate the event to replay: an exact id match first, scanned page by
/// page in descending timestamp order so a single webhook's history never
/// has to be loaded all at once (§4.10, §8 scenario 5). If no capture
/// carries that literal id across any page, fall back to the first capture
/// whose timestamp is an exact RFC3339 match for `event_id`; an exact id
/// match always wins over a timestamp match.
async fn find_event_for_replay(
    repository: &dyn crate::repository::LogRepository,
    webhook_id: &str,
    event_id: &str,
) -> Option<CaptureEvent> {
    let filter = LogFilter { webhook_id: Some(webhook_id.to_string()), ..Default::default() }
        .with_sort(vec![crate::repository::SortField { field: "timestamp".into(), descending: true }]);

    let target_ts = chrono::DateTime::parse_from_rfc3339(event_id).ok().map(|t| t.with_timezone(&chrono::Utc));
    let mut timestamp_match: Option<CaptureEvent> = None;

    let mut offset = 0;
    loop {
        let page = repository.find_logs(&filter, SCAN_PAGE_SIZE, offset).await;
        if let Some(found) = page.items.iter().find(|e| e.id == event_id) {
            return Some(found.clone());
        }
        if timestamp_match.is_none() {
            if let Some(ts) = target_ts {
                timestamp_match = page.items.iter().find(|e| e.timestamp == ts).cloned();
            }
        }
        if page.items.len() < SCAN_PAGE_SIZE {
            break;
        }
        offset += SCAN_PAGE_SIZE;
    }

    timestamp_match
}

/// Extract `targetUrl` from the raw query string. Accepts the array form
/// (`?url=a&url=b`) by taking the first occurrence (§4.10 step 3).
fn first_url_param(raw_query: Option<&str>) -> Option<String> {
    let raw = raw_query?;
    url::form_urlencoded::parse(raw.as_bytes())
        .find(|(k, _)| k == "url")
        .map(|(_, v)| v.into_owned())
        .filter(|v| !v.is_empty())
}

/// `GET,POST /replay/:webhookId/:eventId?url=…` (§4.10).
pub async fn replay(
    State(state): State<Arc<crate::AppState>>,
    Path((webhook_id, event_id)): Path<(String, String)>,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
) -> Response {
    let snapshot = state.config_snapshot.read().await.clone();
    if let Err(err) = crate::auth::require_auth(&headers, snapshot.auth_key.as_deref()) {
        return crate::error::render(err, &headers);
    }

    if !state.webhooks.is_valid(&webhook_id).await {
        return ApiError::not_found(format!("Webhook '{webhook_id}' does not exist or has expired.")).into_response();
    }

    let Some(event) = find_event_for_replay(state.repository.as_ref(), &webhook_id, &event_id).await else {
        return ApiError::not_found("Event not found").into_response();
    };

    let Some(target_url) = first_url_param(raw_query.as_deref()) else {
        return ApiError::validation("targetUrl is required").into_response();
    };

    let body: Vec<u8> = match &event.body {
        BodyValue::Offload { key, .. } => state.payloads.get(key).await.unwrap_or_default(),
        BodyValue::Inline(serde_json::Value::String(s)) => s.clone().into_bytes(),
        BodyValue::Inline(value) => serde_json::to_vec(value).unwrap_or_default(),
    };

    let policy = RetryPolicy { max_attempts: snapshot.replay_max_retries.max(1), ..RetryPolicy::default() };

    let outcome = forwarding::forward_webhook(
        &state.http_client,
        &state.circuit_breaker,
        state.repository.as_ref(),
        &event,
        body,
        &event.headers,
        &target_url,
        snapshot.forward_headers,
        &policy,
    )
    .await;

    let mut response = match &outcome.failure {
        None => Json(serde_json::json!({
            "status": "Replayed",
            "targetUrl": target_url,
            "targetResponseBody": outcome.response_body,
            "strippedHeaders": outcome.stripped_headers,
        }))
        .into_response(),
        Some((ForwardFailureKind::Ssrf, msg)) => ApiError::validation(msg.clone()).into_response(),
        Some((ForwardFailureKind::Exhausted, _)) | Some((ForwardFailureKind::CircuitOpen, _)) => {
            ApiError::upstream_transient("Replay failed").into_response()
        }
        Some((ForwardFailureKind::NonTransient, msg)) => ApiError::upstream_permanent(msg.clone()).into_response(),
    };

    if !outcome.stripped_headers.is_empty() {
        if let Ok(value) = outcome.stripped_headers.join(", ").parse() {
            response.headers_mut().insert("x-apify-replay-warning", value);
        }
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{InMemoryLogRepository, LogRepository, Tristate};
    use std::collections::BTreeMap;

    fn sample(id: &str, webhook_id: &str, ts_ms: i64) -> CaptureEvent {
        CaptureEvent {
            id: id.to_string(),
            webhook_id: webhook_id.to_string(),
            timestamp: chrono::DateTime::from_timestamp_millis(ts_ms).unwrap(),
            event_type: "capture".to_string(),
            method: "POST".to_string(),
            request_url: format!("/webhook/{webhook_id}"),
            headers: BTreeMap::new(),
            query: BTreeMap::new(),
            body: BodyValue::Inline(serde_json::json!({"ok": true})),
            content_type: Some("application/json".to_string()),
            size: 2,
            processing_time_ms: 1,
            status_code: 200,
            remote_ip: None,
            user_agent: None,
            request_id: "req_1".to_string(),
            signature_valid: Tristate::Absent,
            signature_provider: None,
            signature_error: None,
            forward_attempts: None,
            forward_last_error: None,
            forward_target_host: None,
        }
    }

    #[tokio::test]
    async fn finds_event_by_exact_id() {
        let repo = InMemoryLogRepository::new();
        repo.insert_log(sample("evt_1", "wh_a", 1000)).await;
        repo.insert_log(sample("evt_2", "wh_a", 2000)).await;

        let found = find_event_for_replay(&repo, "wh_a", "evt_2").await.unwrap();
        assert_eq!(found.id, "evt_2");
    }

    #[tokio::test]
    async fn returns_none_for_unknown_id_and_non_timestamp() {
        let repo = InMemoryLogRepository::new();
        repo.insert_log(sample("evt_1", "wh_a", 1000)).await;

        assert!(find_event_for_replay(&repo, "wh_a", "not-an-id-or-timestamp").await.is_none());
    }

    #[tokio::test]
    async fn falls_back_to_timestamp_lookup() {
        let repo = InMemoryLogRepository::new();
        repo.insert_log(sample("evt_1", "wh_a", 1_700_000_000_000)).await;

        let ts = chrono::DateTime::from_timestamp_millis(1_700_000_000_000).unwrap();
        let found = find_event_for_replay(&repo, "wh_a", &ts.to_rfc3339()).await.unwrap();
        assert_eq!(found.id, "evt_1");
    }

    #[tokio::test]
    async fn exact_id_wins_over_timestamp_match() {
        let repo = InMemoryLogRepository::new();
        repo.insert_log(sample("evt_1", "wh_a", 1_700_000_000_000)).await;
        // Its own id is a timestamp literal too, ensuring the exact-id branch
        // is the one that actually wins rather than coincidentally agreeing.
        let ts = chrono::DateTime::from_timestamp_millis(1_700_000_000_000).unwrap();
        repo.insert_log(sample(&ts.to_rfc3339(), "wh_a", 1_700_000_001_000)).await;

        let found = find_event_for_replay(&repo, "wh_a", &ts.to_rfc3339()).await.unwrap();
        assert_eq!(found.id, ts.to_rfc3339());
    }

    #[test]
    fn first_url_param_takes_first_of_array_form() {
        assert_eq!(
            first_url_param(Some("url=http://a.example&url=http://b.example")),
            Some("http://a.example".to_string())
        );
    }

    #[test]
    fn first_url_param_missing_is_none() {
        assert_eq!(first_url_param(Some("other=1")), None);
        assert_eq!(first_url_param(None), None);
    }
}
