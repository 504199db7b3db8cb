use std::collections::BTreeMap;

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Sentinel markers a stored body is replaced with when the real bytes have
/// been offloaded to the payload store (§4.5, GLOSSARY "Offload marker").
pub const OFFLOAD_MARKER_SYNC: &str = "OFFLOAD_MARKER_SYNC";
pub const OFFLOAD_MARKER_STREAM: &str = "OFFLOAD_MARKER_STREAM";

/// Body is either stored inline, or replaced by a descriptor pointing into
/// the payload store (C6) when it exceeds the offload threshold.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum BodyValue {
    Inline(serde_json::Value),
    Offload { marker: String, key: String },
}

impl BodyValue {
    pub fn offload_key(&self) -> Option<&str> {
        match self {
            BodyValue::Offload { key, .. } => Some(key),
            BodyValue::Inline(_) => None,
        }
    }
}

/// Whether `signatureValid` is true, false, or simply absent because no
/// signature policy was configured for the webhook (§3).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Tristate {
    True,
    False,
    Absent,
}

/// A capture event (§3) or its `forward_error` variant (§3 "Forwarding
/// Error Record"). The two are modeled as one struct — a forward error is
/// a capture-event shaped diagnostic record, not a distinct entity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CaptureEvent {
    pub id: String,
    pub webhook_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type", default = "default_event_type")]
    pub event_type: String,
    pub method: String,
    pub request_url: String,
    pub headers: BTreeMap<String, String>,
    pub query: BTreeMap<String, String>,
    pub body: BodyValue,
    pub content_type: Option<String>,
    pub size: usize,
    pub processing_time_ms: u64,
    pub status_code: u16,
    pub remote_ip: Option<String>,
    pub user_agent: Option<String>,
    pub request_id: String,
    pub signature_valid: Tristate,
    pub signature_provider: Option<String>,
    pub signature_error: Option<String>,
    // forward_error-only fields
    pub forward_attempts: Option<u32>,
    pub forward_last_error: Option<String>,
    pub forward_target_host: Option<String>,
}

fn default_event_type() -> String {
    "capture".to_string()
}

impl CaptureEvent {
    pub fn forward_error(
        webhook_id: impl Into<String>,
        target_host: impl Into<String>,
        attempts: u32,
        last_error: impl Into<String>,
    ) -> Self {
        Self {
            id: crate::webhook_manager::generate_id("evt"),
            webhook_id: webhook_id.into(),
            timestamp: Utc::now(),
            event_type: "forward_error".to_string(),
            method: String::new(),
            request_url: String::new(),
            headers: BTreeMap::new(),
            query: BTreeMap::new(),
            body: BodyValue::Inline(serde_json::Value::Null),
            content_type: None,
            size: 0,
            processing_time_ms: 0,
            status_code: 0,
            remote_ip: None,
            user_agent: None,
            request_id: String::new(),
            signature_valid: Tristate::Absent,
            signature_provider: None,
            signature_error: None,
            forward_attempts: Some(attempts),
            forward_last_error: Some(last_error.into()),
            forward_target_host: Some(target_host.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Filter DSL (§4.5)
// ---------------------------------------------------------------------------

/// The closed set of comparison operators the filter parser accepts. Any
/// other key seen by the HTTP layer must be dropped before it reaches here
/// (§9 "ambient prototype-pollution vulnerability").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl CompareOp {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "eq" => Some(CompareOp::Eq),
            "ne" => Some(CompareOp::Ne),
            "gt" => Some(CompareOp::Gt),
            "gte" => Some(CompareOp::Gte),
            "lt" => Some(CompareOp::Lt),
            "lte" => Some(CompareOp::Lte),
            _ => None,
        }
    }
}

/// A JSON sub-field probe for `body`/`headers`: either a full-JSON substring
/// search, or a set of path -> expected-substring probes.
#[derive(Debug, Clone)]
pub enum JsonProbe {
    FullText(String),
    Paths(BTreeMap<String, String>),
}

#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub webhook_id: Option<String>,
    pub method: Option<String>,
    pub status_code: Vec<(CompareOp, i64)>,
    pub timestamp: Vec<(CompareOp, DateTime<Utc>)>,
    pub search: Option<String>,
    pub remote_ip: Option<String>,
    pub content_type_like: Option<String>,
    pub user_agent_like: Option<String>,
    pub request_url_like: Option<String>,
    pub signature_error_like: Option<String>,
    pub body_probe: Option<JsonProbe>,
    pub headers_probe: Option<JsonProbe>,
    pub sort: Vec<SortField>,
}

#[derive(Debug, Clone)]
pub struct SortField {
    pub field: String,
    pub descending: bool,
}

/// Fixed allow-list of sortable columns (§4.5). Anything else is discarded.
const SORTABLE_FIELDS: &[&str] = &["timestamp", "status_code", "method", "webhook_id", "size"];

impl LogFilter {
    /// Normalize a raw `sort` list, dropping unknown fields and falling back
    /// to the default `timestamp DESC` when nothing valid remains.
    pub fn with_sort(mut self, raw: Vec<SortField>) -> Self {
        let valid: Vec<SortField> = raw
            .into_iter()
            .filter(|s| SORTABLE_FIELDS.contains(&s.field.as_str()))
            .collect();
        self.sort = if valid.is_empty() {
            vec![SortField { field: "timestamp".into(), descending: true }]
        } else {
            valid
        };
        self
    }

    fn matches(&self, entry: &CaptureEvent) -> bool {
        if let Some(id) = &self.webhook_id {
            if &entry.webhook_id != id {
                return false;
            }
        }
        if let Some(method) = &self.method {
            if !entry.method.eq_ignore_ascii_case(method) {
                return false;
            }
        }
        for (op, value) in &self.status_code {
            if !compare(entry.status_code as i64, *op, *value) {
                return false;
            }
        }
        for (op, value) in &self.timestamp {
            if !compare_ts(entry.timestamp, *op, *value) {
                return false;
            }
        }
        if let Some(search) = &self.search {
            let needle = search.to_ascii_lowercase();
            let haystack = format!("{} {}", entry.id, entry.request_url).to_ascii_lowercase();
            if !haystack.contains(&needle) {
                return false;
            }
        }
        if let Some(ip) = &self.remote_ip {
            match &entry.remote_ip {
                Some(actual) => {
                    if actual != ip && !crate::ssrf::check_ip_in_ranges(Some(actual), &[ip.as_str()]) {
                        return false;
                    }
                }
                None => return false,
            }
        }
        if let Some(needle) = &self.content_type_like {
            if !ilike(entry.content_type.as_deref(), needle) {
                return false;
            }
        }
        if let Some(needle) = &self.user_agent_like {
            if !ilike(entry.user_agent.as_deref(), needle) {
                return false;
            }
        }
        if let Some(needle) = &self.request_url_like {
            if !ilike(Some(&entry.request_url), needle) {
                return false;
            }
        }
        if let Some(needle) = &self.signature_error_like {
            if !ilike(entry.signature_error.as_deref(), needle) {
                return false;
            }
        }
        if let Some(probe) = &self.body_probe {
            if let BodyValue::Inline(value) = &entry.body {
                if !probe_json(value, probe) {
                    return false;
                }
            } else {
                return false;
            }
        }
        if let Some(probe) = &self.headers_probe {
            let value = serde_json::to_value(&entry.headers).unwrap_or(serde_json::Value::Null);
            if !probe_json(&value, probe) {
                return false;
            }
        }
        true
    }
}

fn compare(actual: i64, op: CompareOp, expected: i64) -> bool {
    match op {
        CompareOp::Eq => actual == expected,
        CompareOp::Ne => actual != expected,
        CompareOp::Gt => actual > expected,
        CompareOp::Gte => actual >= expected,
        CompareOp::Lt => actual < expected,
        CompareOp::Lte => actual <= expected,
    }
}

fn compare_ts(actual: DateTime<Utc>, op: CompareOp, expected: DateTime<Utc>) -> bool {
    match op {
        CompareOp::Eq => actual == expected,
        CompareOp::Ne => actual != expected,
        CompareOp::Gt => actual > expected,
        CompareOp::Gte => actual >= expected,
        CompareOp::Lt => actual < expected,
        CompareOp::Lte => actual <= expected,
    }
}

fn ilike(haystack: Option<&str>, needle: &str) -> bool {
    match haystack {
        Some(h) => h.to_ascii_lowercase().contains(&needle.to_ascii_lowercase()),
        None => false,
    }
}

fn probe_json(value: &serde_json::Value, probe: &JsonProbe) -> bool {
    match probe {
        JsonProbe::FullText(needle) => value.to_string().to_ascii_lowercase().contains(&needle.to_ascii_lowercase()),
        JsonProbe::Paths(paths) => paths.iter().all(|(path, expected)| {
            path.split('.')
                .try_fold(value, |cur, segment| cur.get(segment))
                .map(|found| found.to_string().to_ascii_lowercase().contains(&expected.to_ascii_lowercase()))
                .unwrap_or(false)
        }),
    }
}

// ---------------------------------------------------------------------------
// Pagination results
// ---------------------------------------------------------------------------

pub struct OffsetPage {
    pub items: Vec<CaptureEvent>,
    pub total: usize,
}

pub struct CursorPage {
    pub items: Vec<CaptureEvent>,
    pub next_cursor: Option<String>,
}

/// `base64(timestamp + ':' + id)`, the cursor format in §4.5.
pub fn encode_cursor(timestamp: DateTime<Utc>, id: &str) -> String {
    let raw = format!("{}:{id}", timestamp.timestamp_millis());
    base64::engine::general_purpose::STANDARD.encode(raw)
}

pub fn decode_cursor(cursor: &str) -> Option<(DateTime<Utc>, String)> {
    let raw = base64::engine::general_purpose::STANDARD.decode(cursor).ok()?;
    let raw = String::from_utf8(raw).ok()?;
    let (ts_str, id) = raw.split_once(':')?;
    let ts_ms: i64 = ts_str.parse().ok()?;
    let ts = DateTime::from_timestamp_millis(ts_ms)?;
    Some((ts, id.to_string()))
}

// ---------------------------------------------------------------------------
// LogRepository trait (§4.5, §10.11: external-collaborator seam)
// ---------------------------------------------------------------------------

#[async_trait]
pub trait LogRepository: Send + Sync {
    async fn find_logs(&self, filter: &LogFilter, limit: usize, offset: usize) -> OffsetPage;
    async fn find_logs_cursor(&self, filter: &LogFilter, limit: usize, cursor: Option<&str>) -> CursorPage;
    async fn get_log_by_id(&self, id: &str) -> Option<CaptureEvent>;
    async fn insert_log(&self, entry: CaptureEvent);
    async fn batch_insert_logs(&self, entries: Vec<CaptureEvent>);
    async fn delete_logs_by_webhook_id(&self, webhook_id: &str);
    /// Scans stored bodies shaped as `{marker, key}` and returns the keys to
    /// reclaim from the payload store (C6) on webhook expiry.
    async fn find_offloaded_payloads(&self, webhook_id: &str) -> Vec<String>;
}

/// In-process implementation: sufficient to run the crate standalone; a
/// real analytic store is the documented substitution point (§10.11).
pub struct InMemoryLogRepository {
    rows: RwLock<BTreeMap<String, CaptureEvent>>,
}

impl InMemoryLogRepository {
    pub fn new() -> Self {
        Self { rows: RwLock::new(BTreeMap::new()) }
    }

    fn sorted(mut items: Vec<CaptureEvent>, sort: &[SortField]) -> Vec<CaptureEvent> {
        let sort = if sort.is_empty() {
            &[SortField { field: String::new(), descending: true }][..]
        } else {
            sort
        };
        items.sort_by(|a, b| {
            for field in sort {
                let ordering = match field.field.as_str() {
                    "status_code" => a.status_code.cmp(&b.status_code),
                    "method" => a.method.cmp(&b.method),
                    "webhook_id" => a.webhook_id.cmp(&b.webhook_id),
                    "size" => a.size.cmp(&b.size),
                    _ => a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)),
                };
                let ordering = if field.descending { ordering.reverse() } else { ordering };
                if ordering != std::cmp::Ordering::Equal {
                    return ordering;
                }
            }
            std::cmp::Ordering::Equal
        });
        items
    }
}

impl Default for InMemoryLogRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LogRepository for InMemoryLogRepository {
    async fn find_logs(&self, filter: &LogFilter, limit: usize, offset: usize) -> OffsetPage {
        let rows = self.rows.read().await;
        let matched: Vec<CaptureEvent> = rows.values().filter(|e| filter.matches(e)).cloned().collect();
        let total = matched.len();
        let sorted = Self::sorted(matched, &filter.sort);
        let items = sorted.into_iter().skip(offset).take(limit).collect();
        OffsetPage { items, total }
    }

    async fn find_logs_cursor(&self, filter: &LogFilter, limit: usize, cursor: Option<&str>) -> CursorPage {
        let rows = self.rows.read().await;
        let matched: Vec<CaptureEvent> = rows.values().filter(|e| filter.matches(e)).cloned().collect();
        let sorted = Self::sorted(matched, &filter.sort);

        let cursor_pos = cursor.and_then(decode_cursor);
        let filtered: Vec<CaptureEvent> = match cursor_pos {
            Some((ts, id)) => sorted
                .into_iter()
                .filter(|e| (e.timestamp, e.id.as_str()) < (ts, id.as_str()))
                .collect(),
            None => sorted,
        };

        let mut items: Vec<CaptureEvent> = filtered.into_iter().take(limit).collect();
        let next_cursor = if items.len() == limit {
            items.last().map(|last| encode_cursor(last.timestamp, &last.id))
        } else {
            None
        };
        items.truncate(limit);
        CursorPage { items, next_cursor }
    }

    async fn get_log_by_id(&self, id: &str) -> Option<CaptureEvent> {
        self.rows.read().await.get(id).cloned()
    }

    async fn insert_log(&self, entry: CaptureEvent) {
        self.rows.write().await.insert(entry.id.clone(), entry);
    }

    async fn batch_insert_logs(&self, entries: Vec<CaptureEvent>) {
        if entries.is_empty() {
            return;
        }
        let mut rows = self.rows.write().await;
        for entry in entries {
            rows.insert(entry.id.clone(), entry);
        }
    }

    async fn delete_logs_by_webhook_id(&self, webhook_id: &str) {
        self.rows.write().await.retain(|_, v| v.webhook_id != webhook_id);
    }

    async fn find_offloaded_payloads(&self, webhook_id: &str) -> Vec<String> {
        self.rows
            .read()
            .await
            .values()
            .filter(|e| e.webhook_id == webhook_id)
            .filter_map(|e| e.body.offload_key().map(str::to_string))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: &str, webhook_id: &str, ts_ms: i64) -> CaptureEvent {
        CaptureEvent {
            id: id.to_string(),
            webhook_id: webhook_id.to_string(),
            timestamp: DateTime::from_timestamp_millis(ts_ms).unwrap(),
            event_type: "capture".to_string(),
            method: "POST".to_string(),
            request_url: format!("/webhook/{webhook_id}"),
            headers: BTreeMap::new(),
            query: BTreeMap::new(),
            body: BodyValue::Inline(serde_json::json!({"ok": true})),
            content_type: Some("application/json".to_string()),
            size: 12,
            processing_time_ms: 1,
            status_code: 200,
            remote_ip: Some("1.2.3.4".to_string()),
            user_agent: Some("curl/8.0".to_string()),
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
    async fn insert_and_get_roundtrip() {
        let repo = InMemoryLogRepository::new();
        let entry = sample("evt_1", "wh_1", 1000);
        repo.insert_log(entry.clone()).await;
        let fetched = repo.get_log_by_id("evt_1").await.unwrap();
        assert_eq!(fetched.id, entry.id);
        assert_eq!(fetched.body, entry.body);
    }

    #[tokio::test]
    async fn find_logs_filters_by_webhook_id() {
        let repo = InMemoryLogRepository::new();
        repo.insert_log(sample("evt_1", "wh_a", 1000)).await;
        repo.insert_log(sample("evt_2", "wh_b", 2000)).await;

        let filter = LogFilter { webhook_id: Some("wh_a".into()), ..Default::default() };
        let page = repo.find_logs(&filter, 10, 0).await;
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].id, "evt_1");
    }

    #[tokio::test]
    async fn default_sort_is_timestamp_desc() {
        let repo = InMemoryLogRepository::new();
        repo.insert_log(sample("evt_1", "wh_a", 1000)).await;
        repo.insert_log(sample("evt_2", "wh_a", 2000)).await;

        let filter = LogFilter::default();
        let page = repo.find_logs(&filter, 10, 0).await;
        assert_eq!(page.items[0].id, "evt_2");
        assert_eq!(page.items[1].id, "evt_1");
    }

    #[tokio::test]
    async fn cursor_pagination_is_idempotent_across_pages() {
        let repo = InMemoryLogRepository::new();
        for i in 0..5 {
            repo.insert_log(sample(&format!("evt_{i}"), "wh_a", 1000 + i as i64)).await;
        }

        let filter = LogFilter::default();
        let page1 = repo.find_logs_cursor(&filter, 2, None).await;
        assert_eq!(page1.items.len(), 2);
        let cursor = page1.next_cursor.unwrap();

        let page2 = repo.find_logs_cursor(&filter, 2, Some(&cursor)).await;
        assert_eq!(page2.items.len(), 2);

        let ids1: Vec<&str> = page1.items.iter().map(|e| e.id.as_str()).collect();
        let ids2: Vec<&str> = page2.items.iter().map(|e| e.id.as_str()).collect();
        assert!(ids1.iter().all(|id| !ids2.contains(id)));
    }

    #[tokio::test]
    async fn batch_insert_empty_is_noop() {
        let repo = InMemoryLogRepository::new();
        repo.batch_insert_logs(vec![]).await;
        let page = repo.find_logs(&LogFilter::default(), 10, 0).await;
        assert_eq!(page.total, 0);
    }

    #[tokio::test]
    async fn delete_logs_by_webhook_id_removes_only_matching() {
        let repo = InMemoryLogRepository::new();
        repo.insert_log(sample("evt_1", "wh_a", 1000)).await;
        repo.insert_log(sample("evt_2", "wh_b", 1000)).await;
        repo.delete_logs_by_webhook_id("wh_a").await;

        let page = repo.find_logs(&LogFilter::default(), 10, 0).await;
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].webhook_id, "wh_b");
    }

    #[test]
    fn cursor_roundtrip() {
        let ts = DateTime::from_timestamp_millis(123_456).unwrap();
        let cursor = encode_cursor(ts, "evt_9");
        let (decoded_ts, decoded_id) = decode_cursor(&cursor).unwrap();
        assert_eq!(decoded_ts, ts);
        assert_eq!(decoded_id, "evt_9");
    }

    #[test]
    fn compare_op_parse_rejects_unknown_operators() {
        assert!(CompareOp::parse("drop table").is_none());
        assert_eq!(CompareOp::parse("gte"), Some(CompareOp::Gte));
    }
}
