use std::collections::BTreeMap;
use std::time::Duration;

use rand::Rng;
use tracing::{info, warn};

use crate::circuit_breaker::CircuitBreaker;
use crate::repository::{CaptureEvent, LogRepository};
use crate::ssrf;

/// Headers never copied onto an outbound forwarded/replayed request — either
/// because they are transport-specific or because the source capture already
/// masked them (§4.8 step 4).
pub const HEADER_STRIP_LIST: &[&str] = &[
    "host",
    "content-length",
    "content-encoding",
    "connection",
    "keep-alive",
    "upgrade",
    "transfer-encoding",
];

const MASKED_VALUE: &str = "[MASKED]";

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3, base_delay: Duration::from_millis(500), max_delay: Duration::from_secs(10) }
    }
}

impl RetryPolicy {
    /// Exponential backoff, capped, with full jitter so retrying clients
    /// don't synchronize (§4.8 step 5).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.as_millis().saturating_mul(1u128 << attempt.min(16));
        let capped = exp.min(self.max_delay.as_millis());
        let jittered = rand::thread_rng().gen_range(0..=capped.max(1));
        Duration::from_millis(jittered as u64)
    }
}

/// Build the set of headers sent on an outbound forward/replay request,
/// stripping the documented transport headers and any already-masked
/// header, then layering on `host` and the `X-Forwarded-By` sentinel.
pub fn sanitize_headers(
    source: &BTreeMap<String, String>,
    resolved_host: &str,
    forward_headers_enabled: bool,
) -> (BTreeMap<String, String>, Vec<String>) {
    let mut stripped = Vec::new();
    let mut out = BTreeMap::new();

    for (name, value) in source {
        let lower = name.to_ascii_lowercase();
        if HEADER_STRIP_LIST.contains(&lower.as_str()) || value == MASKED_VALUE {
            stripped.push(name.clone());
            continue;
        }
        if !forward_headers_enabled && lower != "content-type" {
            stripped.push(name.clone());
            continue;
        }
        out.insert(name.clone(), value.clone());
    }

    out.insert("host".to_string(), resolved_host.to_string());
    out.insert("x-forwarded-by".to_string(), "hookline".to_string());
    (out, stripped)
}

/// Classify a transport error as transient (retryable) vs. non-transient.
/// Mirrors the canonical transient-code set from §4.8/§9: connection
/// resets, timeouts, and DNS failures are retried; anything else is not.
fn is_transient(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || (err.is_request() && !err.is_status())
}

/// Why a forward/replay attempt ended without delivering, for callers (e.g.
/// the replay controller, §4.10 step 6) that need to pick an HTTP status:
/// SSRF blocks are a client fault, exhausted transient retries time out,
/// anything else is an upstream/permanent failure.
#[derive(Debug, Clone)]
pub enum ForwardFailureKind {
    Ssrf,
    CircuitOpen,
    Exhausted,
    NonTransient,
}

pub struct ForwardOutcome {
    pub delivered: bool,
    pub attempts: u32,
    pub stripped_headers: Vec<String>,
    pub response_body: Option<String>,
    pub failure: Option<(ForwardFailureKind, String)>,
}

/// `forwardWebhook(event, request, options, targetUrl)` (§4.8).
#[allow(clippy::too_many_arguments)]
pub async fn forward_webhook(
    client: &reqwest::Client,
    breaker: &CircuitBreaker,
    repository: &dyn LogRepository,
    event: &CaptureEvent,
    body: Vec<u8>,
    source_headers: &BTreeMap<String, String>,
    target_url: &str,
    forward_headers_enabled: bool,
    policy: &RetryPolicy,
) -> ForwardOutcome {
    let target_url = if target_url.contains("://") {
        target_url.to_string()
    } else {
        format!("http://{target_url}")
    };

    let safe = match ssrf::validate(&target_url).await {
        Ok(safe) => safe,
        Err(err) => {
            warn!(webhook_id = %event.webhook_id, %err, "forwarding target failed SSRF validation");
            repository
                .insert_log(CaptureEvent::forward_error(&event.webhook_id, target_url.clone(), 0, err.to_string()))
                .await;
            return ForwardOutcome {
                delivered: false,
                attempts: 0,
                stripped_headers: Vec::new(),
                response_body: None,
                failure: Some((ForwardFailureKind::Ssrf, err.to_string())),
            };
        }
    };

    let now_ms = chrono::Utc::now().timestamp_millis();
    if breaker.is_open(&safe.href, now_ms).await {
        info!(host = %safe.host, "forwarding short-circuited: circuit open");
        repository
            .insert_log(CaptureEvent::forward_error(&event.webhook_id, safe.host.clone(), 0, "circuit open"))
            .await;
        return ForwardOutcome {
            delivered: false,
            attempts: 0,
            stripped_headers: Vec::new(),
            response_body: None,
            failure: Some((ForwardFailureKind::CircuitOpen, "circuit open".to_string())),
        };
    }

    let (headers, stripped) = sanitize_headers(source_headers, &safe.host, forward_headers_enabled);

    let mut last_error = String::new();
    let mut last_transient = true;
    for attempt in 0..policy.max_attempts {
        let mut request = client.post(&safe.href).body(body.clone());
        for (name, value) in &headers {
            request = request.header(name.as_str(), value.as_str());
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => {
                breaker.record_success(&safe.href).await;
                let response_body = response.text().await.ok();
                return ForwardOutcome {
                    delivered: true,
                    attempts: attempt + 1,
                    stripped_headers: stripped,
                    response_body,
                    failure: None,
                };
            }
            Ok(response) => {
                last_error = format!("unexpected status {}", response.status());
                last_transient = false;
                break;
            }
            Err(err) => {
                last_error = err.to_string();
                last_transient = is_transient(&err);
                if last_transient && attempt + 1 < policy.max_attempts {
                    tokio::time::sleep(policy.delay_for(attempt)).await;
                    continue;
                }
                break;
            }
        }
    }

    breaker.record_failure(&safe.href, now_ms).await;
    repository
        .insert_log(CaptureEvent::forward_error(&event.webhook_id, safe.host.clone(), policy.max_attempts, last_error.clone()))
        .await;
    let kind = if last_transient { ForwardFailureKind::Exhausted } else { ForwardFailureKind::NonTransient };
    ForwardOutcome {
        delivered: false,
        attempts: policy.max_attempts,
        stripped_headers: stripped,
        response_body: None,
        failure: Some((kind, last_error)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryLogRepository;

    #[test]
    fn strip_list_removes_transport_headers() {
        let mut source = BTreeMap::new();
        source.insert("Content-Length".to_string(), "10".to_string());
        source.insert("Authorization".to_string(), MASKED_VALUE.to_string());
        source.insert("X-Custom".to_string(), "value".to_string());

        let (out, stripped) = sanitize_headers(&source, "example.com", true);
        assert!(!out.contains_key("Content-Length"));
        assert!(!out.contains_key("Authorization"));
        assert_eq!(out.get("X-Custom"), Some(&"value".to_string()));
        assert_eq!(out.get("host"), Some(&"example.com".to_string()));
        assert!(stripped.contains(&"Content-Length".to_string()));
        assert!(stripped.contains(&"Authorization".to_string()));
    }

    #[test]
    fn forward_headers_disabled_keeps_only_content_type() {
        let mut source = BTreeMap::new();
        source.insert("Content-Type".to_string(), "application/json".to_string());
        source.insert("X-Custom".to_string(), "value".to_string());

        let (out, _) = sanitize_headers(&source, "example.com", false);
        assert!(out.contains_key("Content-Type"));
        assert!(!out.contains_key("X-Custom"));
    }

    #[test]
    fn retry_policy_backoff_is_capped() {
        let policy = RetryPolicy { max_attempts: 5, base_delay: Duration::from_millis(100), max_delay: Duration::from_millis(500) };
        for attempt in 0..10 {
            assert!(policy.delay_for(attempt) <= Duration::from_millis(500));
        }
    }

    #[tokio::test]
    async fn ssrf_block_emits_forward_error_capture() {
        let client = reqwest::Client::new();
        let breaker = CircuitBreaker::new(3, 30_000, 1000);
        let repo = InMemoryLogRepository::new();
        let event = CaptureEvent::forward_error("wh_1", "n/a", 0, "n/a");

        let outcome = forward_webhook(
            &client,
            &breaker,
            &repo,
            &event,
            b"{}".to_vec(),
            &BTreeMap::new(),
            "http://127.0.0.1/hook",
            true,
            &RetryPolicy::default(),
        )
        .await;

        assert!(!outcome.delivered);
        let page = repo.find_logs(&crate::repository::LogFilter::default(), 10, 0).await;
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].event_type, "forward_error");
    }

    #[tokio::test]
    async fn open_circuit_short_circuits_without_network_call() {
        let client = reqwest::Client::new();
        let breaker = CircuitBreaker::new(1, 60_000, 1000);
        breaker.record_failure("http://example.com", chrono::Utc::now().timestamp_millis()).await;

        let repo = InMemoryLogRepository::new();
        let event = CaptureEvent::forward_error("wh_1", "n/a", 0, "n/a");

        let outcome = forward_webhook(
            &client,
            &breaker,
            &repo,
            &event,
            b"{}".to_vec(),
            &BTreeMap::new(),
            "http://example.com/hook",
            true,
            &RetryPolicy::default(),
        )
        .await;

        assert!(!outcome.delivered);
        assert_eq!(outcome.attempts, 0);
    }
}
