//! Apple Health platform.
//!
//! Handles user-pushed Apple Health exports through the built-in
//! `apple_health` provider. Registration of external providers is not
//! supported, and the built-in provider is deliberately absent from the
//! public catalog listing (it needs no linking).

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{error, info};

use super::{IngestCore, Platform, ProviderMap};
use crate::pipeline::NormalizationPipeline;
use crate::providers::apple::AppleHealthProvider;
use crate::providers::{LinkRequest, Provider, ProviderInfo, UserProvider};
use crate::store::Database;
use crate::vault::CredentialVault;

pub struct ApplePlatform {
    providers: ProviderMap,
    vault: CredentialVault,
    ingest: IngestCore,
}

impl ApplePlatform {
    pub fn new(db: Database, vault: CredentialVault, pipeline: NormalizationPipeline) -> Self {
        let platform = Self {
            providers: ProviderMap::new(),
            vault,
            ingest: IngestCore::new(pipeline),
        };
        platform
            .providers
            .insert(Arc::new(AppleHealthProvider::new(db)));
        info!("Registered built-in providers for apple platform");
        platform
    }
}

#[async_trait]
impl Platform for ApplePlatform {
    fn name(&self) -> &str {
        "apple"
    }

    fn register_provider(&self, provider: Arc<dyn Provider>) -> Result<()> {
        bail!(
            "Apple platform does not accept registered providers (got {})",
            provider.info().slug
        )
    }

    fn get_provider(&self, slug: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(slug)
    }

    async fn get_providers(&self) -> Vec<ProviderInfo> {
        // Built-ins are implicit; they never show in the link catalog.
        Vec::new()
    }

    async fn get_user_providers(&self, _user_id: &str) -> Vec<UserProvider> {
        Vec::new()
    }

    async fn link(&self, request: &LinkRequest) -> Result<Value> {
        let Some(provider) = self.get_provider(&request.provider_slug) else {
            bail!("Provider {} not found in apple platform", request.provider_slug);
        };
        provider.link(request).await
    }

    async fn unlink(&self, user_id: &str, slug: &str) -> Result<Value> {
        let Some(provider) = self.get_provider(slug) else {
            bail!("Provider {} not found in apple platform", slug);
        };
        provider.unlink(user_id).await
    }

    async fn post_data(&self, slug: &str, data: Value, msg_id: &str) -> bool {
        let Some(provider) = self.get_provider(slug) else {
            error!(slug, "Provider not found in apple platform");
            return false;
        };

        if data.get("user_id").and_then(Value::as_str).unwrap_or("").is_empty() {
            error!(slug, "Missing user_id in apple payload");
            return false;
        }

        self.ingest.ingest(&provider, data, msg_id).await
    }

    async fn update_llm_access(&self, user_id: &str, slug: &str, level: i64) -> Result<Value> {
        if !self.vault.set_llm_access(user_id, slug, level).await? {
            bail!("Failed to update LLM access for provider {}", slug);
        }
        Ok(serde_json::json!({
            "provider_slug": slug,
            "platform": self.name(),
            "llm_access": level,
            "updated": true,
        }))
    }

    fn extract_provider_slug(&self, _payload: &Value) -> Option<String> {
        // All bare-platform webhooks belong to the health export provider.
        Some("apple_health".to_string())
    }
}
