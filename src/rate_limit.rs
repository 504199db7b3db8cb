use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::info;

/// Composite key: an ingestion-rate-limiter entry belongs to one webhook and
/// (optionally) one client IP. `None` is a distinct bucket from any specific
/// IP — per §3, "undefined IP is distinct from any specific IP".
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct RateLimitKey {
    pub webhook_id: String,
    pub client_ip: Option<String>,
}

#[derive(Debug, Clone)]
struct Entry {
    hits: Vec<i64>,
    inserted_at: u64,
}

pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_ms: i64,
}

/// Fixed rolling-window rate limiter, keyed by `(webhookId, clientIp)` (§4.3).
pub struct RateLimiter {
    limit: u32,
    window_ms: i64,
    max_entries: usize,
    entries: RwLock<HashMap<RateLimitKey, Entry>>,
    insertion_seq: std::sync::atomic::AtomicU64,
}

impl RateLimiter {
    pub fn new(limit: u32, window_ms: i64, max_entries: usize) -> Result<Self, String> {
        if limit < 1 {
            return Err("limit must be >= 1".into());
        }
        if window_ms <= 0 {
            return Err("windowMs must be > 0".into());
        }
        if max_entries == 0 {
            return Err("maxEntries must be > 0".into());
        }
        Ok(Self {
            limit,
            window_ms,
            max_entries,
            entries: RwLock::new(HashMap::new()),
            insertion_seq: std::sync::atomic::AtomicU64::new(0),
        })
    }

    /// `check(webhookId, clientIp?) -> {allowed, remaining, resetMs}` (§4.3).
    pub async fn check(&self, key: RateLimitKey, now_ms: i64) -> RateLimitDecision {
        let mut entries = self.entries.write().await;

        if !entries.contains_key(&key) && entries.len() >= self.max_entries {
            self.evict_oldest(&mut entries);
        }

        let seq = self.insertion_seq.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let entry = entries.entry(key).or_insert_with(|| Entry { hits: Vec::new(), inserted_at: seq });

        // Clock-skew tolerance: a backwards jump must not wedge every future
        // request open as blocked — treat it as if the window was empty.
        entry.hits.retain(|&t| t > now_ms - self.window_ms && t <= now_ms);

        if (entry.hits.len() as u32) < self.limit {
            entry.hits.push(now_ms);
            RateLimitDecision {
                allowed: true,
                remaining: self.limit - entry.hits.len() as u32,
                reset_ms: self.window_ms,
            }
        } else {
            let reset_ms = entry
                .hits
                .first()
                .map(|oldest| self.window_ms - (now_ms - oldest))
                .unwrap_or(self.window_ms);
            RateLimitDecision { allowed: false, remaining: 0, reset_ms }
        }
    }

    fn evict_oldest(&self, entries: &mut HashMap<RateLimitKey, Entry>) {
        if let Some(oldest_key) = entries
            .iter()
            .min_by_key(|(_, e)| e.inserted_at)
            .map(|(k, _)| k.clone())
        {
            entries.remove(&oldest_key);
        }
    }

    /// Current number of tracked (webhookId, clientIp) buckets, for
    /// `/system/metrics` (§6).
    pub async fn entry_count(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Periodic sweep: drop entries whose hit window has fully expired.
    async fn sweep(&self, now_ms: i64) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| e.hits.iter().any(|&t| t > now_ms - self.window_ms));
        before - entries.len()
    }
}

/// Spawn the periodic sweep task (§4.3: "A periodic sweep ... drops
/// fully-empty entries and logs pruned counts in production").
pub fn spawn_sweeper(limiter: std::sync::Arc<RateLimiter>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let now_ms = chrono::Utc::now().timestamp_millis();
            let pruned = limiter.sweep(now_ms).await;
            if pruned > 0 {
                info!(pruned, "rate limiter sweep pruned expired entries");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: &str, ip: Option<&str>) -> RateLimitKey {
        RateLimitKey { webhook_id: id.to_string(), client_ip: ip.map(str::to_string) }
    }

    #[tokio::test]
    async fn allows_up_to_limit() {
        let limiter = RateLimiter::new(3, 1000, 100).unwrap();
        let k = key("wh1", Some("1.2.3.4"));
        for _ in 0..3 {
            assert!(limiter.check(k.clone(), 0).await.allowed);
        }
        assert!(!limiter.check(k.clone(), 1).await.allowed);
    }

    #[tokio::test]
    async fn distinct_ips_have_independent_buckets() {
        let limiter = RateLimiter::new(1, 1000, 100).unwrap();
        assert!(limiter.check(key("wh1", Some("1.1.1.1")), 0).await.allowed);
        assert!(limiter.check(key("wh1", Some("2.2.2.2")), 0).await.allowed);
        assert!(limiter.check(key("wh1", None), 0).await.allowed);
    }

    #[tokio::test]
    async fn window_expiry_allows_again() {
        let limiter = RateLimiter::new(1, 100, 100).unwrap();
        let k = key("wh1", None);
        assert!(limiter.check(k.clone(), 0).await.allowed);
        assert!(!limiter.check(k.clone(), 50).await.allowed);
        assert!(limiter.check(k.clone(), 200).await.allowed);
    }

    #[tokio::test]
    async fn clock_skew_backwards_jump_still_allows() {
        let limiter = RateLimiter::new(1, 1000, 100).unwrap();
        let k = key("wh1", None);
        assert!(limiter.check(k.clone(), 10_000).await.allowed);
        // time jumps backwards; window check must not wedge this shut forever
        let decision = limiter.check(k.clone(), 0).await;
        assert!(decision.allowed);
    }

    #[tokio::test]
    async fn lru_evicts_oldest_insertion_on_overflow() {
        let limiter = RateLimiter::new(1, 1000, 2).unwrap();
        limiter.check(key("a", None), 0).await;
        limiter.check(key("b", None), 0).await;
        limiter.check(key("c", None), 0).await; // should evict "a"

        let entries = limiter.entries.read().await;
        assert!(!entries.contains_key(&key("a", None)));
        assert!(entries.contains_key(&key("b", None)));
        assert!(entries.contains_key(&key("c", None)));
    }

    #[tokio::test]
    async fn sweep_removes_expired_entries() {
        let limiter = RateLimiter::new(1, 100, 100).unwrap();
        limiter.check(key("wh1", None), 0).await;
        let pruned = limiter.sweep(1000).await;
        assert_eq!(pruned, 1);
    }

    #[test]
    fn constructor_rejects_zero_limit() {
        assert!(RateLimiter::new(0, 1000, 10).is_err());
    }
}
