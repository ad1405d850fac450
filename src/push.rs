//! Push service.
//!
//! The indirection the pull engine uses to re-enter the ingestion path. In
//! function-call mode (the default) it resolves the platform in the manager
//! and calls `post_data` directly, avoiding HTTP overhead; HTTP mode posts to
//! the local webhook endpoint instead and can be switched at runtime. Both
//! modes are idempotent downstream because raw storage dedupes on `msg_id`.

use once_cell::sync::OnceCell;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use uuid::Uuid;

use crate::manager::PlatformManager;

pub struct PushService {
    use_function_call: AtomicBool,
    // Set once during composition; breaks the manager <-> provider cycle.
    manager: OnceCell<Arc<PlatformManager>>,
    http: reqwest::Client,
    webhook_base_url: String,
}

impl PushService {
    pub fn new(webhook_base_url: String) -> Self {
        Self {
            use_function_call: AtomicBool::new(true),
            manager: OnceCell::new(),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            webhook_base_url,
        }
    }

    /// Wire up the platform manager. Called once from the composition root.
    pub fn set_manager(&self, manager: Arc<PlatformManager>) {
        if self.manager.set(manager).is_err() {
            error!("Push service manager already set");
        }
    }

    pub fn use_http_push(&self) {
        self.use_function_call.store(false, Ordering::SeqCst);
        info!("Switched to HTTP push mode");
    }

    pub fn use_function_call_push(&self) {
        self.use_function_call.store(true, Ordering::SeqCst);
        info!("Switched to function call push mode");
    }

    /// Push one raw payload into a platform's ingestion path.
    pub async fn push_data(
        &self,
        platform: &str,
        provider_slug: &str,
        data: Value,
        msg_id: Option<String>,
    ) -> bool {
        let msg_id = msg_id.unwrap_or_else(|| Uuid::new_v4().to_string());

        if self.use_function_call.load(Ordering::SeqCst) {
            self.push_via_function_call(platform, provider_slug, data, &msg_id).await
        } else {
            self.push_via_http(platform, provider_slug, data, &msg_id).await
        }
    }

    async fn push_via_function_call(
        &self,
        platform: &str,
        provider_slug: &str,
        data: Value,
        msg_id: &str,
    ) -> bool {
        let Some(manager) = self.manager.get() else {
            error!("Push service not wired to a platform manager");
            return false;
        };

        let Some(platform_instance) = manager.get_platform(platform) else {
            error!(platform, "Platform not found in manager");
            return false;
        };

        let success = platform_instance.post_data(provider_slug, data, msg_id).await;
        if success {
            info!(platform, provider_slug, msg_id, "Function call push successful");
        } else {
            error!(platform, provider_slug, msg_id, "Function call push failed");
        }
        success
    }

    async fn push_via_http(&self, platform: &str, provider_slug: &str, data: Value, msg_id: &str) -> bool {
        let webhook_url = format!(
            "{}/api/v1/pulse/{}/{}/webhook",
            self.webhook_base_url, platform, provider_slug
        );

        match self
            .http
            .post(&webhook_url)
            .header("X-Message-ID", msg_id)
            .json(&data)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => {
                info!(platform, provider_slug, msg_id, "HTTP push successful");
                true
            }
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                error!(platform, provider_slug, %status, body, "HTTP push failed");
                false
            }
            Err(e) => {
                error!(platform, provider_slug, error = %e, "HTTP push error");
                false
            }
        }
    }
}
