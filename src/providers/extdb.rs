//! External-database provider.
//!
//! Customized-auth provider that stores connection settings for a
//! user-managed external database. Linking probes the declared host/port
//! before persisting; nothing is pulled. Downstream services read the stored
//! connection info on demand.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::info;

use super::{ConnectInfoField, LinkRequest, Provider, ProviderInfo, ProviderStatus};
use crate::pipeline::records::PulseData;
use crate::vault::{AuthKind, CredentialBundle, CredentialVault};

const SLUG: &str = "theta_extdb";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

pub struct ExtDbProvider {
    vault: CredentialVault,
}

impl ExtDbProvider {
    pub fn new(vault: CredentialVault) -> Self {
        Self { vault }
    }

    fn field(name: &str, field_type: &str, label: &str, placeholder: &str, default: &str) -> ConnectInfoField {
        ConnectInfoField {
            field_name: name.to_string(),
            field_type: field_type.to_string(),
            required: true,
            label: label.to_string(),
            placeholder: Some(placeholder.to_string()),
            default_value: Some(default.to_string()),
            options: None,
        }
    }

    /// Probe the declared endpoint. Credentials themselves are validated by
    /// the consuming service; the link only checks reachability.
    async fn validate_connect_info(&self, connect_info: &Value) -> Result<()> {
        let host = connect_info.get("host").and_then(Value::as_str).unwrap_or_default();
        let port = connect_info
            .get("port")
            .and_then(|p| p.as_u64().or_else(|| p.as_str().and_then(|s| s.parse().ok())))
            .unwrap_or(0);
        let username = connect_info.get("username").and_then(Value::as_str).unwrap_or_default();
        let password = connect_info.get("password").and_then(Value::as_str).unwrap_or_default();
        let database = connect_info.get("database").and_then(Value::as_str).unwrap_or_default();

        if username.is_empty() || password.is_empty() {
            bail!("Username and password are required");
        }
        if host.is_empty() || port == 0 || database.is_empty() {
            bail!("host, port and database are required");
        }

        info!(host, port, database, "Validating external database connection");
        match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port as u16))).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => bail!("Cannot connect to {}:{} - {}", host, port, e),
            Err(_) => bail!("Connection timeout after {} seconds", CONNECT_TIMEOUT.as_secs()),
        }
    }
}

#[async_trait]
impl Provider for ExtDbProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            slug: SLUG.to_string(),
            name: "External Database".to_string(),
            description: "External database connection configuration".to_string(),
            logo: Some("https://static.thetahealth.ai/res/elephant.png".to_string()),
            supported: true,
            auth_kind: AuthKind::Customized,
            status: ProviderStatus::Available,
            platform: Some("theta".to_string()),
            connect_info_fields: Some(vec![
                Self::field("username", "string", "Username", "Enter your database username", ""),
                Self::field("password", "password", "Password", "Enter your database password", ""),
                Self::field("host", "string", "Host", "e.g. db.example.com", ""),
                Self::field("port", "number", "Port", "Database port", "5432"),
                Self::field("database", "string", "Database", "Enter your database name", ""),
            ]),
        }
    }

    async fn link(&self, request: &LinkRequest) -> Result<Value> {
        if request.auth_kind != AuthKind::Customized {
            bail!("Unsupported auth type for {}: {}", SLUG, request.auth_kind);
        }
        let Some(connect_info) = request.credentials.get("connect_info").cloned() else {
            bail!("connect_info is required for customized auth type");
        };

        self.validate_connect_info(&connect_info).await?;

        self.vault
            .save_link(
                &request.user_id,
                SLUG,
                &CredentialBundle::Customized { connect_info },
            )
            .await?;

        info!(user_id = request.user_id, "Successfully linked external database");
        Ok(serde_json::json!({
            "provider_slug": SLUG,
            "msg": "ok",
            "connected": true,
        }))
    }

    async fn unlink(&self, user_id: &str) -> Result<Value> {
        self.vault.delete_link(user_id, SLUG).await?;
        Ok(serde_json::json!({ "provider_slug": SLUG }))
    }

    fn register_pull_task(&self) -> bool {
        // Connection configuration only; nothing to pull.
        false
    }

    async fn format_data(&self, raw: &Value) -> Result<PulseData> {
        let user_id = raw.get("user_id").and_then(Value::as_str).unwrap_or_default();
        Ok(PulseData::empty(&uuid::Uuid::new_v4().to_string(), user_id, "theta"))
    }

    async fn save_raw_data(&self, _raw: &Value) -> Result<Vec<Value>> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Database;
    use crate::vault::crypto::CredentialCipher;

    fn provider() -> ExtDbProvider {
        let db = Database::open_in_memory().unwrap();
        ExtDbProvider::new(CredentialVault::new(db.connection(), CredentialCipher::new([1u8; 32])))
    }

    fn request(connect_info: Value) -> LinkRequest {
        LinkRequest {
            user_id: "u1".to_string(),
            provider_slug: SLUG.to_string(),
            auth_kind: AuthKind::Customized,
            credentials: serde_json::json!({ "connect_info": connect_info }),
            options: serde_json::json!({}),
            platform: "theta".to_string(),
        }
    }

    #[test]
    fn test_descriptor_declares_connect_schema() {
        let info = provider().info();
        assert_eq!(info.auth_kind, AuthKind::Customized);
        let fields = info.connect_info_fields.unwrap();
        let names: Vec<&str> = fields.iter().map(|f| f.field_name.as_str()).collect();
        assert_eq!(names, vec!["username", "password", "host", "port", "database"]);
        assert!(fields.iter().all(|f| f.required));
    }

    #[tokio::test]
    async fn test_link_rejects_missing_fields() {
        let result = provider()
            .link(&request(serde_json::json!({"username": "u", "password": "p"})))
            .await;
        assert!(result.unwrap_err().to_string().contains("host"));
    }

    #[tokio::test]
    async fn test_link_rejects_missing_credentials() {
        let result = provider()
            .link(&request(serde_json::json!({"host": "db", "port": 5432, "database": "x"})))
            .await;
        assert!(result.unwrap_err().to_string().contains("Username and password"));
    }

    #[tokio::test]
    async fn test_link_probes_endpoint() {
        // Bind a listener so the probe has something to reach.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let provider = provider();
        let result = provider
            .link(&request(serde_json::json!({
                "username": "u",
                "password": "p",
                "host": "127.0.0.1",
                "port": port,
                "database": "metrics",
            })))
            .await
            .unwrap();
        assert_eq!(result["connected"], true);

        // The stored bundle round-trips through the vault.
        let bundle = provider
            .vault
            .get_credentials("u1", SLUG, AuthKind::Customized)
            .await
            .unwrap()
            .unwrap();
        match bundle {
            CredentialBundle::Customized { connect_info } => {
                assert_eq!(connect_info["database"], "metrics");
            }
            other => panic!("Unexpected bundle: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_no_pull_task() {
        assert!(!provider().register_pull_task());
    }
}
