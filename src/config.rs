//! Configuration management for pulsehub.
//!
//! Configuration is read from environment variables:
//! - `PULSEHUB_SECRET_KEY` - Required. 32-byte AES key (hex or base64) for credential columns.
//! - `PULSEHUB_DB_PATH` - Optional. SQLite database path. Defaults to `pulsehub.db`.
//! - `PULSEHUB_JWT_SECRET` - Required. HS256 secret for bearer-token verification.
//! - `HOST` / `PORT` - Optional. Bind address. Defaults to `127.0.0.1:18060`.
//! - `PUSH_WEBHOOK_BASE_URL` - Optional. Base URL for HTTP-mode pushes. Defaults to the bind address.
//! - `WHOOP_CLIENT_ID` / `WHOOP_CLIENT_SECRET` / `WHOOP_REDIRECT_URL` - Optional. Whoop OAuth2 app.
//! - `WHOOP_AUTH_URL` / `WHOOP_TOKEN_URL` / `WHOOP_API_BASE_URL` / `WHOOP_SCOPES` - Optional overrides.
//! - `ENABLE_EXTDB_PROVIDER` - Optional. Non-empty enables the external-database provider.
//! - `OAUTH_STATE_TTL_SECONDS` - Optional. OAuth2 state lifetime. Defaults to `900`.
//! - `VENDOR_REQUEST_TIMEOUT_SECONDS` - Optional. Outbound HTTP timeout. Defaults to `30`.

use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// OAuth2 application settings for the Whoop provider.
///
/// The provider factory returns `None` when `client_id`/`client_secret` are
/// missing, so an unconfigured deployment simply skips the provider.
#[derive(Debug, Clone, Default)]
pub struct WhoopConfig {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub redirect_url: Option<String>,
    pub auth_url: String,
    pub token_url: String,
    pub api_base_url: String,
    pub scopes: String,
}

impl WhoopConfig {
    fn from_env() -> Self {
        Self {
            client_id: std::env::var("WHOOP_CLIENT_ID").ok().filter(|v| !v.is_empty()),
            client_secret: std::env::var("WHOOP_CLIENT_SECRET").ok().filter(|v| !v.is_empty()),
            redirect_url: std::env::var("WHOOP_REDIRECT_URL").ok().filter(|v| !v.is_empty()),
            auth_url: std::env::var("WHOOP_AUTH_URL")
                .unwrap_or_else(|_| "https://api.prod.whoop.com/oauth/oauth2/auth".to_string()),
            token_url: std::env::var("WHOOP_TOKEN_URL")
                .unwrap_or_else(|_| "https://api.prod.whoop.com/oauth/oauth2/token".to_string()),
            api_base_url: std::env::var("WHOOP_API_BASE_URL")
                .unwrap_or_else(|_| "https://api.prod.whoop.com/developer/v2".to_string()),
            scopes: std::env::var("WHOOP_SCOPES").unwrap_or_else(|_| {
                "offline read:recovery read:sleep read:cycles read:profile read:workout read:body_measurement"
                    .to_string()
            }),
        }
    }
}

/// Service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// AES-256 key material for credential columns (hex or base64 encoded)
    pub secret_key: String,

    /// HS256 secret for bearer tokens
    pub jwt_secret: String,

    /// SQLite database path
    pub db_path: String,

    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,

    /// Base URL used by the push service in HTTP mode
    pub push_webhook_base_url: String,

    /// OAuth2 state lifetime in seconds
    pub oauth_state_ttl_seconds: u64,

    /// Total timeout for outbound vendor HTTP calls in seconds
    pub vendor_request_timeout_seconds: u64,

    /// Whoop OAuth2 app settings
    pub whoop: WhoopConfig,

    /// Whether the external-database provider is enabled
    pub enable_extdb_provider: bool,

    /// Free-form extras consulted by provider factories
    pub extra: HashMap<String, String>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingEnvVar` if `PULSEHUB_SECRET_KEY` or
    /// `PULSEHUB_JWT_SECRET` is not set.
    pub fn from_env() -> Result<Self, ConfigError> {
        let secret_key = std::env::var("PULSEHUB_SECRET_KEY")
            .map_err(|_| ConfigError::MissingEnvVar("PULSEHUB_SECRET_KEY".to_string()))?;

        let jwt_secret = std::env::var("PULSEHUB_JWT_SECRET")
            .map_err(|_| ConfigError::MissingEnvVar("PULSEHUB_JWT_SECRET".to_string()))?;

        let db_path = std::env::var("PULSEHUB_DB_PATH").unwrap_or_else(|_| "pulsehub.db".to_string());

        let host = std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "18060".to_string())
            .parse()
            .map_err(|e| ConfigError::InvalidValue("PORT".to_string(), format!("{}", e)))?;

        let push_webhook_base_url = std::env::var("PUSH_WEBHOOK_BASE_URL")
            .unwrap_or_else(|_| format!("http://{}:{}", host, port));

        let oauth_state_ttl_seconds = std::env::var("OAUTH_STATE_TTL_SECONDS")
            .unwrap_or_else(|_| "900".to_string())
            .parse()
            .map_err(|e| ConfigError::InvalidValue("OAUTH_STATE_TTL_SECONDS".to_string(), format!("{}", e)))?;

        let vendor_request_timeout_seconds = std::env::var("VENDOR_REQUEST_TIMEOUT_SECONDS")
            .unwrap_or_else(|_| "30".to_string())
            .parse()
            .map_err(|e| {
                ConfigError::InvalidValue("VENDOR_REQUEST_TIMEOUT_SECONDS".to_string(), format!("{}", e))
            })?;

        let enable_extdb_provider = std::env::var("ENABLE_EXTDB_PROVIDER")
            .map(|v| !v.is_empty())
            .unwrap_or(false);

        Ok(Self {
            secret_key,
            jwt_secret,
            db_path,
            host,
            port,
            push_webhook_base_url,
            oauth_state_ttl_seconds,
            vendor_request_timeout_seconds,
            whoop: WhoopConfig::from_env(),
            enable_extdb_provider,
            extra: HashMap::new(),
        })
    }

    /// Create a config with custom values (useful for testing).
    pub fn for_tests(secret_key: String, db_path: String) -> Self {
        Self {
            secret_key,
            jwt_secret: "test-jwt-secret".to_string(),
            db_path,
            host: "127.0.0.1".to_string(),
            port: 18060,
            push_webhook_base_url: "http://127.0.0.1:18060".to_string(),
            oauth_state_ttl_seconds: 900,
            vendor_request_timeout_seconds: 30,
            whoop: WhoopConfig {
                auth_url: "https://api.prod.whoop.com/oauth/oauth2/auth".to_string(),
                token_url: "https://api.prod.whoop.com/oauth/oauth2/token".to_string(),
                api_base_url: "https://api.prod.whoop.com/developer/v2".to_string(),
                scopes: "offline read:recovery".to_string(),
                ..WhoopConfig::default()
            },
            enable_extdb_provider: false,
            extra: HashMap::new(),
        }
    }
}
