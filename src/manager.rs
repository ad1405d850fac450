//! Platform manager.
//!
//! Process-wide registry of platforms and the single entry point the
//! transport layer talks to. The manager is a pure dispatcher: it validates
//! link requests, routes them to the named platform, and holds no per-user
//! state beyond a short-lived provider-stats cache.

use anyhow::{bail, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::platform::Platform;
use crate::providers::{format_source_name, LinkRequest, ProviderInfo, UserProvider};
use crate::store::{Database, SourceStats};
use crate::vault::AuthKind;

const STATS_CACHE_TTL: Duration = Duration::from_secs(300);

pub struct PlatformManager {
    platforms: StdRwLock<HashMap<String, Arc<dyn Platform>>>,
    db: Database,
    stats_cache: RwLock<HashMap<String, (Instant, HashMap<String, SourceStats>)>>,
}

impl PlatformManager {
    pub fn new(db: Database) -> Self {
        Self {
            platforms: StdRwLock::new(HashMap::new()),
            db,
            stats_cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn register_platform(&self, platform: Arc<dyn Platform>) {
        let name = platform.name().to_string();
        self.platforms
            .write()
            .expect("platform map poisoned")
            .insert(name.clone(), platform);
        info!(platform = name, "Registered platform");
    }

    pub fn get_platform(&self, name: &str) -> Option<Arc<dyn Platform>> {
        self.platforms
            .read()
            .expect("platform map poisoned")
            .get(name)
            .cloned()
    }

    fn all_platforms(&self) -> Vec<Arc<dyn Platform>> {
        self.platforms
            .read()
            .expect("platform map poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Union of every platform's provider catalog.
    pub async fn get_all_providers(&self) -> Vec<ProviderInfo> {
        let mut all = Vec::new();
        for platform in self.all_platforms() {
            let providers = platform.get_providers().await;
            info!(platform = platform.name(), count = providers.len(), "Got providers");
            all.extend(providers);
        }
        all
    }

    /// Union of every platform's per-user link list, enriched with stats.
    pub async fn get_user_providers(&self, user_id: &str) -> Vec<UserProvider> {
        let mut all = Vec::new();
        for platform in self.all_platforms() {
            all.extend(platform.get_user_providers(user_id).await);
        }
        self.populate_provider_stats(user_id, &mut all).await;
        all
    }

    /// Build and dispatch a link request after validating the auth kind and
    /// credential completeness.
    pub async fn link_provider(
        &self,
        user_id: &str,
        provider_slug: &str,
        platform: &str,
        auth_kind_str: &str,
        credentials: Value,
        options: Value,
    ) -> Result<Value> {
        let Some(auth_kind) = AuthKind::parse(auth_kind_str) else {
            bail!("Unsupported auth type: {}", auth_kind_str);
        };

        match auth_kind {
            AuthKind::Password => {
                let has_username = credentials.get("username").and_then(Value::as_str).map(|s| !s.is_empty());
                let has_password = credentials.get("password").and_then(Value::as_str).map(|s| !s.is_empty());
                if has_username != Some(true) || has_password != Some(true) {
                    bail!("Username and password are required for password auth");
                }
            }
            AuthKind::Customized => {
                if credentials.get("connect_info").map(|v| v.is_null()).unwrap_or(true) {
                    bail!("connect_info is required for customized auth");
                }
            }
            // OAuth link requests carry no credentials in stage 1.
            AuthKind::OAuth1 | AuthKind::OAuth2 | AuthKind::None => {}
        }

        let request = LinkRequest {
            user_id: user_id.to_string(),
            provider_slug: provider_slug.to_string(),
            auth_kind,
            credentials,
            options,
            platform: platform.to_string(),
        };

        let Some(target) = self.get_platform(platform) else {
            warn!(platform, "Platform not found");
            bail!("Platform {} not found", platform);
        };

        let result = target.link(&request).await?;
        info!(provider_slug, "Link successful");
        Ok(result)
    }

    pub async fn unlink_provider(&self, user_id: &str, provider_slug: &str, platform: &str) -> Result<Value> {
        let Some(target) = self.get_platform(platform) else {
            bail!("Platform {} not found", platform);
        };
        let result = target.unlink(user_id, provider_slug).await?;
        info!(provider_slug, "Unlink successful");
        Ok(result)
    }

    /// Route an inbound payload to `platform/provider`.
    pub async fn post_data(
        &self,
        platform: &str,
        provider_slug: &str,
        data: Value,
        msg_id: &str,
    ) -> bool {
        let Some(target) = self.get_platform(platform) else {
            warn!(platform, "Platform not found");
            return false;
        };
        let result = target.post_data(provider_slug, data, msg_id).await;
        info!(provider_slug, result, "Post data result");
        result
    }

    pub async fn update_llm_access(
        &self,
        user_id: &str,
        provider_slug: &str,
        platform: &str,
        llm_access: i64,
    ) -> Result<Value> {
        if !(0..=2).contains(&llm_access) {
            bail!("Invalid llm_access value: {}. Must be 0, 1, or 2", llm_access);
        }
        let Some(target) = self.get_platform(platform) else {
            bail!("Platform {} not found", platform);
        };
        target.update_llm_access(user_id, provider_slug, llm_access).await
    }

    async fn cached_source_stats(&self, user_id: &str) -> HashMap<String, SourceStats> {
        {
            let cache = self.stats_cache.read().await;
            if let Some((cached_at, stats)) = cache.get(user_id) {
                if cached_at.elapsed() < STATS_CACHE_TTL {
                    return stats.clone();
                }
            }
        }

        let stats = match self.db.user_source_stats(user_id).await {
            Ok(stats) => stats,
            Err(e) => {
                error!(user_id, error = %e, "Failed to load provider stats");
                return HashMap::new();
            }
        };

        let mut cache = self.stats_cache.write().await;
        cache.insert(user_id.to_string(), (Instant::now(), stats.clone()));
        stats
    }

    /// Enrich user providers with record counts and last-sync times from one
    /// cached aggregate query.
    pub async fn populate_provider_stats(&self, user_id: &str, providers: &mut [UserProvider]) {
        let stats = self.cached_source_stats(user_id).await;
        if stats.is_empty() {
            return;
        }

        for provider in providers.iter_mut() {
            // Sources are recorded as the slug itself, its dotted form, or
            // platform-qualified; try each.
            let candidates = [
                provider.slug.clone(),
                format_source_name(&provider.slug),
                format!("{}.{}", provider.platform, provider.slug),
            ];
            if let Some(entry) = candidates.iter().find_map(|key| stats.get(key)) {
                provider.record_count = entry.record_count;
                provider.last_sync_at = entry
                    .last_sync_time
                    .map(|t| t.format("%Y-%m-%dT%H:%M:%S").to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ProviderStatus;
    use crate::store::SeriesRecord;
    use chrono::NaiveDateTime;

    #[tokio::test]
    async fn test_link_validation_rejects_incomplete_password() {
        let manager = PlatformManager::new(Database::open_in_memory().unwrap());

        let result = manager
            .link_provider(
                "u1",
                "theta_renpho",
                "theta",
                "password",
                serde_json::json!({"username": "alice"}),
                serde_json::json!({}),
            )
            .await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("password"));
    }

    #[tokio::test]
    async fn test_link_validation_rejects_unknown_auth_kind() {
        let manager = PlatformManager::new(Database::open_in_memory().unwrap());
        let result = manager
            .link_provider("u1", "x", "theta", "carrier-pigeon", serde_json::json!({}), serde_json::json!({}))
            .await;
        assert!(result.unwrap_err().to_string().contains("Unsupported auth type"));
    }

    #[tokio::test]
    async fn test_link_unknown_platform_fails() {
        let manager = PlatformManager::new(Database::open_in_memory().unwrap());
        let result = manager
            .link_provider("u1", "x", "nowhere", "oauth2", serde_json::json!({}), serde_json::json!({}))
            .await;
        assert!(result.unwrap_err().to_string().contains("not found"));
    }

    #[tokio::test]
    async fn test_post_data_unknown_platform_is_false() {
        let manager = PlatformManager::new(Database::open_in_memory().unwrap());
        assert!(!manager.post_data("nowhere", "p", serde_json::json!({}), "m1").await);
    }

    #[tokio::test]
    async fn test_populate_stats_matches_dotted_source() {
        let db = Database::open_in_memory().unwrap();
        db.save_series_records(&[SeriesRecord {
            user_id: "u1".to_string(),
            indicator: "heartRate".to_string(),
            source: "theta.whoop".to_string(),
            time: NaiveDateTime::parse_from_str("2024-01-01 10:00:00", "%Y-%m-%d %H:%M:%S").unwrap(),
            value: "70".to_string(),
            timezone: "UTC".to_string(),
            task_id: None,
            source_id: None,
        }])
        .await
        .unwrap();

        let manager = PlatformManager::new(db);
        let mut providers = vec![UserProvider {
            slug: "theta_whoop".to_string(),
            status: ProviderStatus::Connected,
            platform: "theta".to_string(),
            connected_at: None,
            last_sync_at: None,
            record_count: 0,
            llm_access: 1,
        }];

        manager.populate_provider_stats("u1", &mut providers).await;
        assert_eq!(providers[0].record_count, 1);
        assert!(providers[0].last_sync_at.as_deref().unwrap().starts_with("2024-01-01"));
    }
}
