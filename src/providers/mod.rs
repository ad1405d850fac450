//! Provider framework.
//!
//! A provider adapts one external data source (a vendor API, a mobile export,
//! a database) to the uniform lifecycle: link, callback, unlink, raw-payload
//! persistence, formatting into canonical records, and scheduled pulls.
//! Providers are declared in a compile-time registry; each factory returns
//! `None` when its required configuration is missing and is silently skipped.

pub mod apple;
pub mod extdb;
pub mod registry;
pub mod whoop;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::pipeline::records::PulseData;
use crate::vault::AuthKind;

/// Connection status of a provider, as shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderStatus {
    Available,
    Connected,
    Disconnected,
    /// Link exists but requires re-authorization
    Reconnect,
    Error,
    Maintenance,
}

/// A dynamic connection field declared by customized-auth providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectInfoField {
    pub field_name: String,
    /// One of `string`, `number`, `select`, `password`
    pub field_type: String,
    pub required: bool,
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
}

/// Static provider descriptor.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderInfo {
    pub slug: String,
    pub name: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logo: Option<String>,
    pub supported: bool,
    pub auth_kind: AuthKind,
    pub status: ProviderStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_info_fields: Option<Vec<ConnectInfoField>>,
}

/// A user's connection to a provider, enriched with sync stats.
#[derive(Debug, Clone, Serialize)]
pub struct UserProvider {
    pub slug: String,
    pub status: ProviderStatus,
    pub platform: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync_at: Option<String>,
    pub record_count: i64,
    pub llm_access: i64,
}

/// Provider connection request built by the platform manager.
#[derive(Debug, Clone)]
pub struct LinkRequest {
    pub user_id: String,
    pub provider_slug: String,
    pub auth_kind: AuthKind,
    pub credentials: Value,
    pub options: Value,
    pub platform: String,
}

impl LinkRequest {
    /// Credential field accessor, empty string when absent.
    pub fn credential_str(&self, key: &str) -> String {
        self.credentials
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }

    pub fn option_str(&self, key: &str) -> Option<String> {
        self.options.get(key).and_then(Value::as_str).map(String::from)
    }
}

/// OAuth redirect parameters: `code`/`state` for OAuth2,
/// `oauth_token`/`oauth_verifier` for OAuth1.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub oauth_token: Option<String>,
    pub oauth_verifier: Option<String>,
}

/// The provider capability set.
///
/// Only `info`, `link`, `unlink`, and `format_data` are mandatory; the rest
/// default to sensible no-ops so pull-less or auth-less providers stay small.
#[async_trait]
pub trait Provider: Send + Sync {
    fn info(&self) -> ProviderInfo;

    /// Establish a link. For OAuth kinds this is stage 1 (returns an
    /// authorization URL); other kinds validate and store credentials.
    async fn link(&self, request: &LinkRequest) -> Result<Value>;

    /// OAuth redirect handler (stage 2).
    async fn callback(&self, _params: &CallbackParams) -> Result<Value> {
        bail!("Provider {} does not support OAuth callbacks", self.info().slug)
    }

    async fn unlink(&self, user_id: &str) -> Result<Value>;

    /// Parse a raw payload into canonical records. Best-effort: invalid
    /// records are skipped and counted, never fatal for the batch.
    async fn format_data(&self, raw: &Value) -> Result<PulseData>;

    /// Persist a raw payload for audit/replay. The payload already carries
    /// `msg_id`; an empty result means there is nothing (new) to process.
    async fn save_raw_data(&self, raw: &Value) -> Result<Vec<Value>> {
        Ok(vec![raw.clone()])
    }

    /// Duplicate detection beyond msg_id dedup; default none.
    async fn is_already_processed(&self, _raw: &Value) -> bool {
        false
    }

    /// Whether the scheduler should create a pull task for this provider.
    fn register_pull_task(&self) -> bool {
        true
    }

    /// One scheduled pull run: list credentials, fetch vendor data, push every
    /// payload back through the ingestion path. Returns overall success.
    async fn pull_and_push(&self) -> bool {
        true
    }
}

/// `platform.provider`-style source tag used in canonical records.
pub fn format_source_name(slug: &str) -> String {
    match slug.split_once('_') {
        Some((platform, provider)) => format!("{}.{}", platform, provider),
        None => slug.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_source_name() {
        assert_eq!(format_source_name("theta_whoop"), "theta.whoop");
        assert_eq!(format_source_name("apple_health"), "apple.health");
        assert_eq!(format_source_name("standalone"), "standalone");
    }

    #[test]
    fn test_link_request_accessors() {
        let request = LinkRequest {
            user_id: "u1".to_string(),
            provider_slug: "theta_whoop".to_string(),
            auth_kind: AuthKind::OAuth2,
            credentials: serde_json::json!({"username": "alice"}),
            options: serde_json::json!({"return_url": "https://app.example/done"}),
            platform: "theta".to_string(),
        };

        assert_eq!(request.credential_str("username"), "alice");
        assert_eq!(request.credential_str("missing"), "");
        assert_eq!(
            request.option_str("return_url").as_deref(),
            Some("https://app.example/done")
        );
    }
}
