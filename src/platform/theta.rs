//! Theta platform: vendor integrations linked per user.
//!
//! Accepts dynamically-registered providers and schedules a pull task for
//! each one that wants scheduled pulls. Link state lives in the credential
//! vault; ingestion goes through the shared core.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{error, info};

use super::{IngestCore, Platform, ProviderMap, WebhookFilters};
use crate::lock::PullLockManager;
use crate::pipeline::NormalizationPipeline;
use crate::providers::{LinkRequest, Provider, ProviderInfo, ProviderStatus, UserProvider};
use crate::scheduler::{PullTask, Scheduler};
use crate::store::Database;
use crate::vault::CredentialVault;

pub struct ThetaPlatform {
    providers: ProviderMap,
    vault: CredentialVault,
    ingest: IngestCore,
    db: Database,
    scheduler: Arc<Scheduler>,
    lock: Arc<PullLockManager>,
}

impl ThetaPlatform {
    pub fn new(
        db: Database,
        vault: CredentialVault,
        pipeline: NormalizationPipeline,
        scheduler: Arc<Scheduler>,
        lock: Arc<PullLockManager>,
    ) -> Self {
        Self {
            providers: ProviderMap::new(),
            vault,
            ingest: IngestCore::new(pipeline),
            db,
            scheduler,
            lock,
        }
    }
}

#[async_trait]
impl Platform for ThetaPlatform {
    fn name(&self) -> &str {
        "theta"
    }

    fn supports_registration(&self) -> bool {
        true
    }

    fn register_provider(&self, provider: Arc<dyn Provider>) -> Result<()> {
        let info = provider.info();
        self.providers.insert(Arc::clone(&provider));

        if !provider.register_pull_task() {
            info!(slug = info.slug, "Provider opted out of scheduled pulls");
            return Ok(());
        }

        self.scheduler
            .register_task(PullTask::new(provider, Arc::clone(&self.lock)));
        Ok(())
    }

    fn get_provider(&self, slug: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(slug)
    }

    async fn get_providers(&self) -> Vec<ProviderInfo> {
        let providers: Vec<ProviderInfo> = self
            .providers
            .all()
            .iter()
            .map(|p| {
                let mut info = p.info();
                info.platform = Some(self.name().to_string());
                info
            })
            .collect();
        info!(count = providers.len(), "Got providers from theta platform");
        providers
    }

    async fn get_user_providers(&self, user_id: &str) -> Vec<UserProvider> {
        let links = match self.vault.list_user_links(user_id).await {
            Ok(links) => links,
            Err(e) => {
                error!(user_id, error = %e, "Failed to list user links");
                return Vec::new();
            }
        };

        links
            .into_iter()
            .map(|(slug, link)| UserProvider {
                slug,
                status: if link.reconnect {
                    ProviderStatus::Reconnect
                } else {
                    ProviderStatus::Connected
                },
                platform: self.name().to_string(),
                connected_at: None,
                // Filled by the manager's stats pass.
                last_sync_at: None,
                record_count: 0,
                llm_access: link.llm_access,
            })
            .collect()
    }

    async fn link(&self, request: &LinkRequest) -> Result<Value> {
        let Some(provider) = self.get_provider(&request.provider_slug) else {
            bail!("Provider {} not found in theta platform", request.provider_slug);
        };
        provider.link(request).await
    }

    async fn unlink(&self, user_id: &str, slug: &str) -> Result<Value> {
        let Some(provider) = self.get_provider(slug) else {
            bail!("Provider {} not found in theta platform", slug);
        };
        let result = provider.unlink(user_id).await?;
        info!(slug, "Unlink successful for theta provider");
        Ok(result)
    }

    async fn post_data(&self, slug: &str, data: Value, msg_id: &str) -> bool {
        let Some(provider) = self.get_provider(slug) else {
            error!(slug, "Provider not found in theta platform");
            return false;
        };
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

    async fn get_webhooks(&self, filters: &WebhookFilters) -> Result<Value> {
        let Some(provider) = filters.provider.as_deref() else {
            bail!("Provider parameter is required for theta platform");
        };
        if self.get_provider(provider).is_none() {
            bail!("Provider {} not found in theta platform", provider);
        }

        let page_size = if filters.page_size == 0 { 20 } else { filters.page_size };
        let (rows, total) = self
            .db
            .list_raw_payloads(provider, filters.page, page_size, filters.user_id.as_deref())
            .await?;

        let total_pages = if total > 0 {
            (total + page_size as i64 - 1) / page_size as i64
        } else {
            0
        };

        let webhooks: Vec<Value> = rows
            .iter()
            .map(|row| {
                serde_json::json!({
                    "id": row.id,
                    "create_at": row.create_at,
                    "event_type": provider,
                    "user_id": row.user_id,
                    "client_user_id": row.external_user_id,
                    "msg_id": row.msg_id,
                })
            })
            .collect();

        Ok(serde_json::json!({
            "webhooks": webhooks,
            "total": total,
            "page": filters.page.max(1),
            "page_size": page_size,
            "total_pages": total_pages,
        }))
    }

    async fn check_format(&self, webhook_id: i64, provider_slug: Option<&str>) -> Result<Value> {
        let Some(slug) = provider_slug else {
            bail!("Provider parameter is required for theta platform");
        };
        let Some(provider) = self.get_provider(slug) else {
            bail!("Provider {} not found in theta platform", slug);
        };

        let Some(row) = self.db.get_raw_payload(slug, webhook_id).await? else {
            bail!("Record with id {} not found for provider {}", webhook_id, slug);
        };

        match provider.format_data(&row.raw_data).await {
            Ok(formatted) => Ok(serde_json::json!({
                "success": true,
                "original_data": row.raw_data,
                "formatted_data": formatted,
                "event_type": slug,
                "msg_id": row.msg_id,
                "user_id": row.user_id,
            })),
            Err(e) => Ok(serde_json::json!({
                "success": false,
                "original_data": row.raw_data,
                "formatted_data": Value::Null,
                "event_type": slug,
                "msg_id": row.msg_id,
                "user_id": row.user_id,
                "error": e.to_string(),
            })),
        }
    }
}
