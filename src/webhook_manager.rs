use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::KeyedStorage;
use crate::payload_store::PayloadStore;
use crate::repository::LogRepository;

const STORAGE_KEY: &str = "WEBHOOKS";

/// Generate an opaque id with a documented prefix and sufficient entropy
/// (§3, §4.7). Shared by webhook ids (`wh_`) and capture/event ids (`evt_`).
pub fn generate_id(prefix: &str) -> String {
    format!("{prefix}_{}", Uuid::new_v4().simple())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WebhookIdentity {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub retention_hours: u32,
}

impl WebhookIdentity {
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// Webhook identity lifecycle (§4.7): allocation, expiry, persistence across
/// restarts, and expiry-driven cleanup of both metadata and offloaded
/// payloads.
pub struct WebhookManager {
    identities: RwLock<HashMap<String, WebhookIdentity>>,
    storage: KeyedStorage,
}

impl WebhookManager {
    pub fn new(storage: KeyedStorage) -> Self {
        Self { identities: RwLock::new(HashMap::new()), storage }
    }

    /// Load persisted identities; corrupt or missing state is treated as an
    /// empty set, logged but never fatal.
    pub async fn init(&self) {
        let loaded: Vec<WebhookIdentity> = self.storage.get(STORAGE_KEY).unwrap_or_default();
        let mut identities = self.identities.write().await;
        for identity in loaded {
            identities.insert(identity.id.clone(), identity);
        }
        info!(count = identities.len(), "webhook manager initialized");
    }

    /// `generateWebhooks(count, retentionHours) -> [id]` (§4.7).
    pub async fn generate_webhooks(&self, count: u32, retention_hours: f64) -> Result<Vec<String>, String> {
        if !retention_hours.is_finite() || retention_hours <= 0.0 {
            return Err("retentionHours must be a positive finite number".into());
        }

        let now = Utc::now();
        let mut ids = Vec::with_capacity(count as usize);
        let mut identities = self.identities.write().await;
        for _ in 0..count {
            let id = generate_id("wh");
            let expires_at = now + chrono::Duration::seconds((retention_hours * 3600.0) as i64);
            identities.insert(
                id.clone(),
                WebhookIdentity { id: id.clone(), created_at: now, expires_at, retention_hours: retention_hours as u32 },
            );
            ids.push(id);
        }
        drop(identities);
        self.persist().await;
        Ok(ids)
    }

    pub async fn is_valid(&self, id: &str) -> bool {
        let identities = self.identities.read().await;
        identities.get(id).map(|i| i.is_valid(Utc::now())).unwrap_or(false)
    }

    pub async fn get_webhook_data(&self, id: &str) -> Option<WebhookIdentity> {
        self.identities.read().await.get(id).cloned()
    }

    pub async fn has_webhook(&self, id: &str) -> bool {
        self.identities.read().await.contains_key(id)
    }

    pub async fn get_all_active(&self) -> Vec<WebhookIdentity> {
        let now = Utc::now();
        self.identities.read().await.values().filter(|i| i.is_valid(now)).cloned().collect()
    }

    /// Total tracked identities, active or expired-but-not-yet-swept, for
    /// `GET /info`'s `webhookCount` (§6).
    pub async fn count(&self) -> usize {
        self.identities.read().await.len()
    }

    /// Extend every active identity's expiry to `max(current, now + hours)`.
    pub async fn update_retention(&self, hours: f64) {
        let now = Utc::now();
        let extended_to = now + chrono::Duration::seconds((hours * 3600.0) as i64);
        {
            let mut identities = self.identities.write().await;
            for identity in identities.values_mut() {
                if identity.is_valid(now) && extended_to > identity.expires_at {
                    identity.expires_at = extended_to;
                }
            }
        }
        self.persist().await;
    }

    pub async fn persist(&self) {
        self.try_persist().await;
    }

    /// Like [`Self::persist`] but reports success, for callers (e.g. shutdown)
    /// that need to retry a failed write rather than just log it.
    pub async fn try_persist(&self) -> bool {
        let identities: Vec<WebhookIdentity> = self.identities.read().await.values().cloned().collect();
        match self.storage.set(STORAGE_KEY, &identities) {
            Ok(()) => true,
            Err(err) => {
                warn!(%err, "failed to persist webhook identities");
                false
            }
        }
    }

    /// For each expired identity: delete its offloaded payloads and logs,
    /// drop it from the in-memory map, then persist (§4.7).
    pub async fn cleanup(&self, repository: &dyn LogRepository, payloads: &dyn PayloadStore) {
        let now = Utc::now();
        let expired: Vec<String> = {
            let identities = self.identities.read().await;
            identities.values().filter(|i| !i.is_valid(now)).map(|i| i.id.clone()).collect()
        };

        for id in &expired {
            let keys = repository.find_offloaded_payloads(id).await;
            for key in keys {
                payloads.delete(&key).await;
            }
            repository.delete_logs_by_webhook_id(id).await;
        }

        if !expired.is_empty() {
            let mut identities = self.identities.write().await;
            for id in &expired {
                identities.remove(id);
            }
            drop(identities);
            self.persist().await;
            info!(count = expired.len(), "expired webhooks cleaned up");
        }
    }
}

pub fn spawn_cleanup_task(
    manager: Arc<WebhookManager>,
    repository: Arc<dyn LogRepository>,
    payloads: Arc<dyn PayloadStore>,
    interval: std::time::Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            manager.cleanup(repository.as_ref(), payloads.as_ref()).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload_store::InMemoryPayloadStore;
    use crate::repository::InMemoryLogRepository;

    fn test_manager() -> WebhookManager {
        let dir = std::env::temp_dir().join(format!("hookline-wh-test-{}", Uuid::new_v4()));
        WebhookManager::new(KeyedStorage::new(dir))
    }

    #[tokio::test]
    async fn generate_webhooks_creates_valid_identities() {
        let manager = test_manager();
        let ids = manager.generate_webhooks(2, 1.0).await.unwrap();
        assert_eq!(ids.len(), 2);
        for id in &ids {
            assert!(manager.is_valid(id).await);
            assert!(id.starts_with("wh_"));
        }
    }

    #[tokio::test]
    async fn count_reflects_all_tracked_identities() {
        let manager = test_manager();
        assert_eq!(manager.count().await, 0);
        manager.generate_webhooks(3, 1.0).await.unwrap();
        assert_eq!(manager.count().await, 3);
    }

    #[tokio::test]
    async fn generate_webhooks_rejects_non_positive_retention() {
        let manager = test_manager();
        assert!(manager.generate_webhooks(1, 0.0).await.is_err());
        assert!(manager.generate_webhooks(1, -1.0).await.is_err());
        assert!(manager.generate_webhooks(1, f64::NAN).await.is_err());
    }

    #[tokio::test]
    async fn unknown_id_is_invalid() {
        let manager = test_manager();
        assert!(!manager.is_valid("wh_does_not_exist").await);
    }

    #[tokio::test]
    async fn get_all_active_excludes_expired() {
        let manager = test_manager();
        let ids = manager.generate_webhooks(1, 1.0).await.unwrap();
        {
            let mut identities = manager.identities.write().await;
            identities.get_mut(&ids[0]).unwrap().expires_at = Utc::now() - chrono::Duration::seconds(1);
        }
        let active = manager.get_all_active().await;
        assert!(active.is_empty());
    }

    #[tokio::test]
    async fn update_retention_only_extends_forward() {
        let manager = test_manager();
        let ids = manager.generate_webhooks(1, 10.0).await.unwrap();
        let before = manager.get_webhook_data(&ids[0]).await.unwrap().expires_at;

        manager.update_retention(1.0).await; // shorter than current; must not shrink
        let after = manager.get_webhook_data(&ids[0]).await.unwrap().expires_at;
        assert_eq!(before, after);

        manager.update_retention(100.0).await;
        let extended = manager.get_webhook_data(&ids[0]).await.unwrap().expires_at;
        assert!(extended > after);
    }

    #[tokio::test]
    async fn cleanup_removes_expired_identity_and_its_logs() {
        let manager = test_manager();
        let ids = manager.generate_webhooks(1, 1.0).await.unwrap();
        {
            let mut identities = manager.identities.write().await;
            identities.get_mut(&ids[0]).unwrap().expires_at = Utc::now() - chrono::Duration::seconds(1);
        }

        let repo = InMemoryLogRepository::new();
        let payloads = InMemoryPayloadStore::new();
        manager.cleanup(&repo, &payloads).await;

        assert!(!manager.has_webhook(&ids[0]).await);
    }

    #[tokio::test]
    async fn persist_then_init_restores_identities() {
        let dir = std::env::temp_dir().join(format!("hookline-wh-persist-{}", Uuid::new_v4()));
        let manager = WebhookManager::new(KeyedStorage::new(dir.clone()));
        let ids = manager.generate_webhooks(1, 1.0).await.unwrap();

        let reloaded = WebhookManager::new(KeyedStorage::new(dir));
        reloaded.init().await;
        assert!(reloaded.has_webhook(&ids[0]).await);
    }
}
