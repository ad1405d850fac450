//! Platform abstraction.
//!
//! A platform groups providers that share a namespace and lifecycle, and owns
//! the main ingestion entry point: `post_data` stores the raw payload,
//! invokes the provider's formatter, and hands every produced batch to the
//! normalization pipeline. The provider map is written during startup
//! registration and read-only afterwards.

pub mod apple;
pub mod theta;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{error, info, warn};

use crate::pipeline::NormalizationPipeline;
use crate::providers::{CallbackParams, LinkRequest, Provider, ProviderInfo, UserProvider};

/// Filters for the management-console webhook listing.
#[derive(Debug, Clone, Default)]
pub struct WebhookFilters {
    pub provider: Option<String>,
    pub user_id: Option<String>,
    pub page: u32,
    pub page_size: u32,
}

#[async_trait]
pub trait Platform: Send + Sync {
    fn name(&self) -> &str;

    /// Whether dynamically-registered providers are accepted.
    fn supports_registration(&self) -> bool {
        false
    }

    /// Whether the platform presents itself as a single virtual provider.
    fn solo(&self) -> bool {
        false
    }

    fn register_provider(&self, provider: Arc<dyn Provider>) -> Result<()>;

    fn get_provider(&self, slug: &str) -> Option<Arc<dyn Provider>>;

    async fn get_providers(&self) -> Vec<ProviderInfo>;

    async fn get_user_providers(&self, user_id: &str) -> Vec<UserProvider>;

    async fn link(&self, request: &LinkRequest) -> Result<Value>;

    async fn unlink(&self, user_id: &str, slug: &str) -> Result<Value>;

    /// OAuth redirect dispatch to the named provider.
    async fn callback(&self, slug: &str, params: &CallbackParams) -> Result<Value> {
        match self.get_provider(slug) {
            Some(provider) => provider.callback(params).await,
            None => bail!("Provider {} not found in {} platform", slug, self.name()),
        }
    }

    /// Main ingestion entry. Returns success iff every produced batch
    /// succeeded; an already-processed `msg_id` is a successful no-op.
    async fn post_data(&self, slug: &str, data: Value, msg_id: &str) -> bool;

    async fn update_llm_access(&self, user_id: &str, slug: &str, level: i64) -> Result<Value>;

    /// Resolve the provider slug for payloads arriving on the bare
    /// platform-level webhook.
    fn extract_provider_slug(&self, payload: &Value) -> Option<String> {
        payload
            .get("provider_slug")
            .or_else(|| payload.get("provider"))
            .and_then(Value::as_str)
            .map(String::from)
    }

    /// Management-console listing of stored raw payloads.
    async fn get_webhooks(&self, _filters: &WebhookFilters) -> Result<Value> {
        bail!("Platform {} does not expose stored webhooks", self.name())
    }

    /// Replay one stored payload through `format_data` for diagnosis.
    async fn check_format(&self, _webhook_id: i64, _provider: Option<&str>) -> Result<Value> {
        bail!("Platform {} does not support format checks", self.name())
    }
}

/// Startup-registered provider map. Writes happen only during composition.
#[derive(Default)]
pub struct ProviderMap {
    providers: RwLock<HashMap<String, Arc<dyn Provider>>>,
}

impl ProviderMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, provider: Arc<dyn Provider>) {
        let slug = provider.info().slug;
        self.providers
            .write()
            .expect("provider map poisoned")
            .insert(slug, provider);
    }

    pub fn get(&self, slug: &str) -> Option<Arc<dyn Provider>> {
        self.providers
            .read()
            .expect("provider map poisoned")
            .get(slug)
            .cloned()
    }

    pub fn all(&self) -> Vec<Arc<dyn Provider>> {
        self.providers
            .read()
            .expect("provider map poisoned")
            .values()
            .cloned()
            .collect()
    }
}

/// Shared ingestion flow used by every platform's `post_data`:
/// msg_id injection → raw persistence → formatting → normalization.
pub struct IngestCore {
    pipeline: NormalizationPipeline,
}

impl IngestCore {
    pub fn new(pipeline: NormalizationPipeline) -> Self {
        Self { pipeline }
    }

    pub fn pipeline(&self) -> &NormalizationPipeline {
        &self.pipeline
    }

    pub async fn ingest(&self, provider: &Arc<dyn Provider>, mut data: Value, msg_id: &str) -> bool {
        let slug = provider.info().slug;

        if let Some(object) = data.as_object_mut() {
            object.insert("msg_id".to_string(), Value::String(msg_id.to_string()));
        }

        if provider.is_already_processed(&data).await {
            info!(slug, msg_id, "Payload already processed, skipping");
            return true;
        }

        let saved = match provider.save_raw_data(&data).await {
            Ok(saved) => saved,
            Err(e) => {
                error!(slug, msg_id, error = %e, "Raw data save failed");
                return false;
            }
        };
        if saved.is_empty() {
            // Duplicate msg_id or a payload with nothing to process.
            info!(slug, msg_id, "No new raw data stored, nothing to do");
            return true;
        }

        let mut total_records = 0usize;
        let mut success_count = 0usize;
        let mut error_count = 0usize;

        for payload in &saved {
            let batch = match provider.format_data(payload).await {
                Ok(batch) => batch,
                Err(e) => {
                    error_count += 1;
                    error!(slug, error = %e, "Formatter failed for saved payload");
                    continue;
                }
            };

            if batch.health_data.is_empty() {
                info!(slug, "No records formatted from payload");
                continue;
            }

            if batch.meta_info.user_id.is_empty() {
                error_count += 1;
                error!(slug, "No user id in formatted data");
                continue;
            }

            let record_count = batch.health_data.len();
            let outcome = self.pipeline.process(&batch).await;
            if outcome.success {
                success_count += 1;
                total_records += record_count;
            } else {
                error_count += 1;
                warn!(slug, user_id = %batch.meta_info.user_id, "Batch processing failed");
            }
        }

        info!(
            slug,
            total_records, success_count, error_count, "Ingestion completed"
        );
        error_count == 0
    }
}
