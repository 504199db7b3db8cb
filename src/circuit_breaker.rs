use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::info;
use url::Url;

#[derive(Debug, Clone)]
struct HostState {
    failures: u32,
    next_attempt: i64,
    inserted_at: u64,
}

/// Per-host failure accounting shared between live forwarding (C8) and
/// operator-initiated replay (C10) (§4.4). Hostnames are extracted via URL
/// parse and case-folded; scheme and port are ignored.
pub struct CircuitBreaker {
    threshold: u32,
    reset_timeout_ms: i64,
    max_size: usize,
    state: RwLock<HashMap<String, HostState>>,
    insertion_seq: std::sync::atomic::AtomicU64,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, reset_timeout_ms: i64, max_size: usize) -> Self {
        Self {
            threshold,
            reset_timeout_ms,
            max_size,
            state: RwLock::new(HashMap::new()),
            insertion_seq: std::sync::atomic::AtomicU64::new(0),
        }
    }

    fn host_of(url: &str) -> Option<String> {
        Url::parse(url).ok().and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
    }

    /// `isOpen(url)`: state present AND `failures >= threshold` AND `now <
    /// nextAttempt`. At or after `nextAttempt` the breaker reports
    /// half-open (not blocked) but retains its state for re-opening.
    pub async fn is_open(&self, url: &str, now_ms: i64) -> bool {
        let Some(host) = Self::host_of(url) else { return false };
        let state = self.state.read().await;
        match state.get(&host) {
            Some(s) => s.failures >= self.threshold && now_ms < s.next_attempt,
            None => false,
        }
    }

    pub async fn record_failure(&self, url: &str, now_ms: i64) {
        let Some(host) = Self::host_of(url) else { return };
        let mut state = self.state.write().await;

        if !state.contains_key(&host) && state.len() >= self.max_size {
            self.evict_oldest(&mut state);
        }

        let seq = self.insertion_seq.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let entry = state.entry(host).or_insert_with(|| HostState {
            failures: 0,
            next_attempt: 0,
            inserted_at: seq,
        });
        entry.failures += 1;
        entry.next_attempt = now_ms + self.reset_timeout_ms;
    }

    pub async fn record_success(&self, url: &str) {
        let Some(host) = Self::host_of(url) else { return };
        self.state.write().await.remove(&host);
    }

    /// Number of hosts currently tripped open, for `/system/metrics` (§6).
    pub async fn open_count(&self, now_ms: i64) -> usize {
        self.state.read().await.values().filter(|s| s.failures >= self.threshold && now_ms < s.next_attempt).count()
    }

    fn evict_oldest(&self, state: &mut HashMap<String, HostState>) {
        if let Some(oldest) = state.iter().min_by_key(|(_, s)| s.inserted_at).map(|(k, _)| k.clone()) {
            state.remove(&oldest);
        }
    }

    /// Periodic prune: drop zero-failure entries whose `nextAttempt` has
    /// already passed, then shrink to `maxSize` in insertion order (§4.4).
    async fn prune(&self, now_ms: i64) -> usize {
        let mut state = self.state.write().await;
        let before = state.len();
        state.retain(|_, s| !(s.failures == 0 && now_ms >= s.next_attempt));
        while state.len() > self.max_size {
            self.evict_oldest(&mut state);
        }
        before.saturating_sub(state.len())
    }
}

pub fn spawn_pruner(breaker: std::sync::Arc<CircuitBreaker>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let now_ms = chrono::Utc::now().timestamp_millis();
            let pruned = breaker.prune(now_ms).await;
            if pruned > 0 {
                info!(pruned, "circuit breaker prune removed stale entries");
            }
        }
    })
}
