//! Distributed lock, timestamp, and stats keyspace for the pull engine.
//!
//! The lock service is a cluster-wide key-value store with set-if-absent and
//! TTL semantics. Keys: `lock:<slug>` (mutual exclusion across replicas),
//! `ts:<slug>` (incremental-sync bookkeeping, 7-day TTL), `stats:<slug>`
//! (run statistics, 24-hour TTL).
//!
//! Availability beats strict mutual exclusion here: when no store is
//! configured or a call fails, acquires succeed vacuously and releases are
//! no-ops. The engine degrades to per-instance scheduling, and duplicate
//! pulls across replicas stay safe because raw-payload storage deduplicates
//! on `msg_id`.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

const TIMESTAMP_TTL: Duration = Duration::from_secs(7 * 24 * 3600);
const STATS_TTL: Duration = Duration::from_secs(24 * 3600);

/// Minimal key-value contract the lock manager needs from a cluster store.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Set `key` to `value` with a TTL only if the key is absent.
    /// Returns whether the key was set.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<bool>;

    /// Set `key` unconditionally with a TTL.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()>;

    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;

    async fn delete(&self, key: &str) -> anyhow::Result<()>;

    /// Remaining TTL in seconds, 0 when absent or expired.
    async fn ttl(&self, key: &str) -> anyhow::Result<u64>;
}

/// In-process TTL-aware store. Suitable for single-instance deployments and
/// tests; multi-replica clusters plug a shared store behind the same trait.
#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn live(entry: &(String, Instant)) -> bool {
        entry.1 > Instant::now()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<bool> {
        let mut entries = self.entries.lock().await;
        if entries.get(key).map(Self::live).unwrap_or(false) {
            return Ok(false);
        }
        entries.insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(true)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()> {
        let mut entries = self.entries.lock().await;
        entries.insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let entries = self.entries.lock().await;
        Ok(entries
            .get(key)
            .filter(|entry| Self::live(entry))
            .map(|entry| entry.0.clone()))
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn ttl(&self, key: &str) -> anyhow::Result<u64> {
        let entries = self.entries.lock().await;
        Ok(entries
            .get(key)
            .and_then(|entry| entry.1.checked_duration_since(Instant::now()))
            .map(|d| d.as_secs())
            .unwrap_or(0))
    }
}

/// Lock status snapshot for monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct LockStatus {
    pub locked: bool,
    pub lock_value: Option<String>,
    pub holder_instance: Option<String>,
    pub execution_id: Option<String>,
    pub ttl_seconds: u64,
    pub is_current_instance: bool,
}

impl LockStatus {
    fn unlocked() -> Self {
        Self {
            locked: false,
            lock_value: None,
            holder_instance: None,
            execution_id: None,
            ttl_seconds: 0,
            is_current_instance: false,
        }
    }
}

/// Pull-task lock manager.
///
/// Lock values are `instance:timestamp:execution_id` so releases can verify
/// ownership and monitoring can name the holder.
pub struct PullLockManager {
    store: Option<Arc<dyn KvStore>>,
    instance_id: String,
}

impl PullLockManager {
    pub fn new(store: Option<Arc<dyn KvStore>>) -> Self {
        let instance_id = Uuid::new_v4().to_string()[..8].to_string();
        info!(instance_id, "Pull lock manager initialized");
        Self { store, instance_id }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    fn lock_key(slug: &str) -> String {
        format!("lock:{}", slug)
    }

    fn timestamp_key(slug: &str) -> String {
        format!("ts:{}", slug)
    }

    fn stats_key(slug: &str) -> String {
        format!("stats:{}", slug)
    }

    fn lock_value(&self, execution_id: &str) -> String {
        format!("{}:{}:{}", self.instance_id, chrono::Utc::now().to_rfc3339(), execution_id)
    }

    /// Try to acquire the execution lock for a provider.
    ///
    /// Returns an execution id on success, `None` when another holder owns the
    /// lock. `force` deletes any existing lock first. With no store configured
    /// the acquire succeeds vacuously.
    pub async fn try_acquire(&self, slug: &str, duration: Duration, force: bool) -> Option<String> {
        let execution_id = Uuid::new_v4().to_string();

        let Some(store) = &self.store else {
            warn!(slug, "No lock store configured, acquiring vacuously");
            return Some(execution_id);
        };

        let key = Self::lock_key(slug);

        if force {
            warn!(slug, "Force mode enabled, dropping any existing lock");
            if let Err(e) = store.delete(&key).await {
                error!(slug, error = %e, "Failed to delete lock in force mode");
            }
        }

        let value = self.lock_value(&execution_id);
        match store.set_nx(&key, &value, duration).await {
            Ok(true) => {
                info!(
                    slug,
                    instance = %self.instance_id,
                    execution = %execution_id,
                    duration_secs = duration.as_secs(),
                    "Execution lock acquired"
                );
                Some(execution_id)
            }
            Ok(false) => {
                match store.get(&key).await {
                    Ok(Some(existing)) => info!(slug, existing, "Execution lock already held"),
                    _ => warn!(slug, "Failed to acquire lock, holder unknown"),
                }
                None
            }
            Err(e) => {
                // Store outage: degrade to per-instance scheduling.
                error!(slug, error = %e, "Lock store unavailable, acquiring vacuously");
                Some(execution_id)
            }
        }
    }

    /// Release the lock if this instance and execution still own it.
    pub async fn release(&self, slug: &str, execution_id: &str) -> bool {
        let Some(store) = &self.store else {
            return true;
        };

        let key = Self::lock_key(slug);
        match store.get(&key).await {
            Ok(None) => {
                warn!(slug, "Lock already expired before release");
                true
            }
            Ok(Some(current)) => {
                if current.contains(execution_id) && current.contains(&self.instance_id) {
                    if let Err(e) = store.delete(&key).await {
                        error!(slug, error = %e, "Failed to delete lock");
                        return false;
                    }
                    info!(slug, execution = execution_id, "Released execution lock");
                    true
                } else {
                    warn!(
                        slug,
                        expected = execution_id,
                        current,
                        "Lock ownership mismatch, leaving lock in place"
                    );
                    false
                }
            }
            Err(e) => {
                error!(slug, error = %e, "Lock store unavailable during release");
                true
            }
        }
    }

    /// Current lock state for a provider.
    pub async fn status(&self, slug: &str) -> LockStatus {
        let Some(store) = &self.store else {
            return LockStatus::unlocked();
        };

        let key = Self::lock_key(slug);
        let value = match store.get(&key).await {
            Ok(v) => v,
            Err(e) => {
                error!(slug, error = %e, "Failed to read lock status");
                return LockStatus::unlocked();
            }
        };

        match value {
            Some(lock_value) => {
                // Value format is instance:rfc3339:execution_id; the timestamp
                // itself contains colons, so take the ends.
                let holder = lock_value.split(':').next().map(|s| s.to_string());
                let execution_id = lock_value.rsplit(':').next().map(|s| s.to_string());
                let is_current = holder.as_deref() == Some(self.instance_id.as_str());
                LockStatus {
                    locked: true,
                    holder_instance: holder,
                    execution_id,
                    ttl_seconds: store.ttl(&key).await.unwrap_or(0),
                    is_current_instance: is_current,
                    lock_value: Some(lock_value),
                }
            }
            None => LockStatus::unlocked(),
        }
    }

    // ===== Incremental-sync timestamps =====

    pub async fn get_last_timestamp(&self, slug: &str) -> Option<i64> {
        let store = self.store.as_ref()?;
        match store.get(&Self::timestamp_key(slug)).await {
            Ok(Some(raw)) => raw.parse().ok(),
            Ok(None) => None,
            Err(e) => {
                error!(slug, error = %e, "Failed to read last execution timestamp");
                None
            }
        }
    }

    pub async fn set_last_timestamp(&self, slug: &str, timestamp: i64) -> bool {
        let Some(store) = &self.store else {
            return false;
        };
        match store
            .set(&Self::timestamp_key(slug), &timestamp.to_string(), TIMESTAMP_TTL)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                error!(slug, error = %e, "Failed to update last execution timestamp");
                false
            }
        }
    }

    /// Clear the timestamp so the next pull falls back to its default lookback
    /// window.
    pub async fn clear_last_timestamp(&self, slug: &str) -> bool {
        let Some(store) = &self.store else {
            return false;
        };
        match store.delete(&Self::timestamp_key(slug)).await {
            Ok(()) => {
                info!(slug, "Cleared last execution timestamp");
                true
            }
            Err(e) => {
                error!(slug, error = %e, "Failed to clear last execution timestamp");
                false
            }
        }
    }

    // ===== Run statistics =====

    pub async fn save_stats(&self, slug: &str, stats: &serde_json::Value) -> bool {
        let Some(store) = &self.store else {
            return false;
        };
        match store.set(&Self::stats_key(slug), &stats.to_string(), STATS_TTL).await {
            Ok(()) => true,
            Err(e) => {
                error!(slug, error = %e, "Failed to save task stats");
                false
            }
        }
    }

    pub async fn get_stats(&self, slug: &str) -> Option<serde_json::Value> {
        let store = self.store.as_ref()?;
        match store.get(&Self::stats_key(slug)).await {
            Ok(Some(raw)) => serde_json::from_str(&raw).ok(),
            Ok(None) => None,
            Err(e) => {
                error!(slug, error = %e, "Failed to read task stats");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> PullLockManager {
        PullLockManager::new(Some(Arc::new(MemoryKv::new())))
    }

    #[tokio::test]
    async fn test_acquire_is_exclusive_within_duration() {
        let manager = manager();

        let first = manager.try_acquire("theta_whoop", Duration::from_secs(3600), false).await;
        assert!(first.is_some());

        // A concurrent acquire within the lock duration must fail.
        let second = manager.try_acquire("theta_whoop", Duration::from_secs(3600), false).await;
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_release_removes_key_for_owner() {
        let manager = manager();
        let execution_id = manager
            .try_acquire("theta_whoop", Duration::from_secs(3600), false)
            .await
            .unwrap();

        assert!(manager.status("theta_whoop").await.locked);
        assert!(manager.release("theta_whoop", &execution_id).await);
        assert!(!manager.status("theta_whoop").await.locked);

        // Lock can be re-acquired after release.
        assert!(manager
            .try_acquire("theta_whoop", Duration::from_secs(3600), false)
            .await
            .is_some());
    }

    #[tokio::test]
    async fn test_release_refuses_foreign_execution() {
        let manager = manager();
        manager
            .try_acquire("theta_whoop", Duration::from_secs(3600), false)
            .await
            .unwrap();

        assert!(!manager.release("theta_whoop", "not-my-execution").await);
        assert!(manager.status("theta_whoop").await.locked);
    }

    #[tokio::test]
    async fn test_expired_lock_allows_new_acquire() {
        let manager = manager();
        manager
            .try_acquire("theta_whoop", Duration::from_millis(20), false)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(manager
            .try_acquire("theta_whoop", Duration::from_secs(3600), false)
            .await
            .is_some());
    }

    #[tokio::test]
    async fn test_force_acquire_overrides_existing_lock() {
        let manager = manager();
        manager
            .try_acquire("theta_whoop", Duration::from_secs(3600), false)
            .await
            .unwrap();

        let forced = manager.try_acquire("theta_whoop", Duration::from_secs(3600), true).await;
        assert!(forced.is_some());
    }

    #[tokio::test]
    async fn test_no_store_acquires_vacuously() {
        let manager = PullLockManager::new(None);
        assert!(manager
            .try_acquire("theta_whoop", Duration::from_secs(3600), false)
            .await
            .is_some());
        assert!(manager.release("theta_whoop", "whatever").await);
        assert!(!manager.status("theta_whoop").await.locked);
    }

    #[tokio::test]
    async fn test_timestamp_roundtrip_and_clear() {
        let manager = manager();
        assert!(manager.get_last_timestamp("theta_whoop").await.is_none());

        assert!(manager.set_last_timestamp("theta_whoop", 1_700_000_000).await);
        assert_eq!(manager.get_last_timestamp("theta_whoop").await, Some(1_700_000_000));

        assert!(manager.clear_last_timestamp("theta_whoop").await);
        assert!(manager.get_last_timestamp("theta_whoop").await.is_none());
    }

    #[tokio::test]
    async fn test_stats_roundtrip() {
        let manager = manager();
        let stats = serde_json::json!({"users": 3, "errors": 1});
        assert!(manager.save_stats("theta_whoop", &stats).await);
        assert_eq!(manager.get_stats("theta_whoop").await, Some(stats));
    }

    #[tokio::test]
    async fn test_status_reports_holder() {
        let manager = manager();
        let execution_id = manager
            .try_acquire("theta_whoop", Duration::from_secs(3600), false)
            .await
            .unwrap();

        let status = manager.status("theta_whoop").await;
        assert!(status.locked);
        assert!(status.is_current_instance);
        assert_eq!(status.holder_instance.as_deref(), Some(manager.instance_id()));
        // Value format is instance:timestamp:execution_id; rfc3339 timestamps
        // contain colons, so the execution id is the tail of the raw value.
        assert!(status.lock_value.unwrap().ends_with(&execution_id));
        assert!(status.ttl_seconds > 0);
    }
}
