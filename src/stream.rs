use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::repository::CaptureEvent;

/// Fan-out bus for live capture events (§4.12). A bounded broadcast channel;
/// slow subscribers lag and are told so rather than stalling ingestion.
pub struct EventBus {
    sender: broadcast::Sender<CaptureEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CaptureEvent> {
        self.sender.subscribe()
    }

    /// Best-effort: a send with no subscribers is not an error.
    pub fn broadcast(&self, event: CaptureEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    #[serde(rename = "webhookId")]
    pub webhook_id: Option<String>,
}

impl StreamQuery {
    fn matches(&self, event: &CaptureEvent) -> bool {
        match &self.webhook_id {
            Some(id) => &event.webhook_id == id,
            None => true,
        }
    }
}

/// `GET /log-stream` (§4.12): every capture and forward-error event, as it
/// happens, optionally scoped to one webhook.
pub async fn log_stream(
    State(state): State<Arc<crate::AppState>>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> Response {
    let snapshot = state.config_snapshot.read().await.clone();
    if let Err(err) = crate::auth::require_auth(&headers, snapshot.auth_key.as_deref()) {
        return crate::error::render(err, &headers);
    }

    let mut rx = state.event_bus.subscribe();

    info!(webhook_id = query.webhook_id.as_deref().unwrap_or("*"), "log stream client connected");

    let stream = async_stream::stream! {
        yield Ok::<_, Infallible>(SseEvent::default().comment("connected"));

        loop {
            match rx.recv().await {
                Ok(event) => {
                    if !query.matches(&event) {
                        continue;
                    }

                    let json = match serde_json::to_string(&event) {
                        Ok(j) => j,
                        Err(e) => {
                            warn!("log stream: failed to serialize event: {e}");
                            continue;
                        }
                    };

                    let sse_event = SseEvent::default()
                        .event(event.event_type.as_str())
                        .id(event.id.clone())
                        .data(json);

                    yield Ok(sse_event);
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("log stream client lagged, skipped {n} events");
                    let warning = SseEvent::default()
                        .event("_warning")
                        .data(format!("{{\"message\":\"lagged, skipped {n} events\"}}"));
                    yield Ok(warning);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("log stream: event bus closed, ending stream");
                    break;
                }
            }
        }
    };

    let sse = Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)).text("heartbeat"));
    let mut response = sse.into_response();

    // Required so intermediary proxies don't buffer or otherwise interfere
    // with the stream (§4.12).
    let resp_headers = response.headers_mut();
    resp_headers.insert("Cache-Control", "no-cache".parse().unwrap());
    resp_headers.insert("Connection", "keep-alive".parse().unwrap());
    resp_headers.insert("X-Accel-Buffering", "no".parse().unwrap());
    resp_headers.insert("Content-Encoding", "identity".parse().unwrap());
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{BodyValue, Tristate};
    use std::collections::BTreeMap;

    fn sample(webhook_id: &str) -> CaptureEvent {
        CaptureEvent {
            id: "evt_1".to_string(),
            webhook_id: webhook_id.to_string(),
            timestamp: chrono::Utc::now(),
            event_type: "capture".to_string(),
            method: "POST".to_string(),
            request_url: "/webhook/wh_1".to_string(),
            headers: BTreeMap::new(),
            query: BTreeMap::new(),
            body: BodyValue::Inline(serde_json::Value::Null),
            content_type: None,
            size: 0,
            processing_time_ms: 0,
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

    #[test]
    fn query_with_no_filter_matches_everything() {
        let query = StreamQuery { webhook_id: None };
        assert!(query.matches(&sample("wh_a")));
        assert!(query.matches(&sample("wh_b")));
    }

    #[test]
    fn query_filters_by_webhook_id() {
        let query = StreamQuery { webhook_id: Some("wh_a".to_string()) };
        assert!(query.matches(&sample("wh_a")));
        assert!(!query.matches(&sample("wh_b")));
    }

    #[tokio::test]
    async fn broadcast_without_subscribers_does_not_panic() {
        let bus = EventBus::new(8);
        bus.broadcast(sample("wh_a"));
    }

    #[tokio::test]
    async fn subscriber_receives_broadcast_event() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.broadcast(sample("wh_a"));
        let received = rx.recv().await.unwrap();
        assert_eq!(received.webhook_id, "wh_a");
    }
}
