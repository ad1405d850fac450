//! Provider registry.
//!
//! Providers are declared here at compile time; each entry is a factory that
//! builds the provider from shared service handles, or returns `None` when
//! its required configuration is missing (the entry is then skipped with a
//! log, never an error).

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::extdb::ExtDbProvider;
use super::whoop::WhoopProvider;
use super::Provider;
use crate::config::Config;
use crate::lock::{KvStore, PullLockManager};
use crate::push::PushService;
use crate::store::Database;
use crate::vault::CredentialVault;

/// Shared handles provider factories build from.
#[derive(Clone)]
pub struct ProviderContext {
    pub config: Config,
    pub db: Database,
    pub vault: CredentialVault,
    pub states: Arc<dyn KvStore>,
    pub push: Arc<PushService>,
    pub lock: Arc<PullLockManager>,
}

type Factory = fn(&ProviderContext) -> Option<Arc<dyn Provider>>;

fn create_whoop(ctx: &ProviderContext) -> Option<Arc<dyn Provider>> {
    WhoopProvider::create(
        &ctx.config.whoop,
        Duration::from_secs(ctx.config.oauth_state_ttl_seconds),
        Duration::from_secs(ctx.config.vendor_request_timeout_seconds),
        ctx.vault.clone(),
        ctx.db.clone(),
        Arc::clone(&ctx.states),
        Arc::clone(&ctx.push),
        Arc::clone(&ctx.lock),
    )
    .map(|provider| Arc::new(provider) as Arc<dyn Provider>)
}

fn create_extdb(ctx: &ProviderContext) -> Option<Arc<dyn Provider>> {
    if !ctx.config.enable_extdb_provider {
        return None;
    }
    Some(Arc::new(ExtDbProvider::new(ctx.vault.clone())) as Arc<dyn Provider>)
}

/// The theta provider table. Adding a provider means adding a line here.
const THETA_PROVIDERS: &[(&str, Factory)] = &[
    ("theta_whoop", create_whoop),
    ("theta_extdb", create_extdb),
];

/// Instantiate every configured theta provider.
pub fn create_theta_providers(ctx: &ProviderContext) -> Vec<Arc<dyn Provider>> {
    let mut providers = Vec::new();
    for (slug, factory) in THETA_PROVIDERS {
        match factory(ctx) {
            Some(provider) => {
                info!(slug, "Loaded provider");
                providers.push(provider);
            }
            None => {
                warn!(slug, "Provider skipped (missing configuration)");
            }
        }
    }
    providers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::MemoryKv;
    use crate::vault::crypto::CredentialCipher;

    fn context(config: Config) -> ProviderContext {
        let db = Database::open_in_memory().unwrap();
        let vault = CredentialVault::new(db.connection(), CredentialCipher::new([1u8; 32]));
        ProviderContext {
            config,
            db,
            vault,
            states: Arc::new(MemoryKv::new()),
            push: Arc::new(PushService::new(String::new())),
            lock: Arc::new(PullLockManager::new(None)),
        }
    }

    #[test]
    fn test_unconfigured_providers_are_skipped() {
        let config = Config::for_tests("00".repeat(32), ":memory:".to_string());
        let providers = create_theta_providers(&context(config));
        assert!(providers.is_empty());
    }

    #[test]
    fn test_configured_providers_are_created() {
        let mut config = Config::for_tests("00".repeat(32), ":memory:".to_string());
        config.whoop.client_id = Some("id".to_string());
        config.whoop.client_secret = Some("secret".to_string());
        config.whoop.redirect_url = Some("https://hub.example/callback".to_string());
        config.enable_extdb_provider = true;

        let providers = create_theta_providers(&context(config));
        let slugs: Vec<String> = providers.iter().map(|p| p.info().slug).collect();
        assert_eq!(slugs, vec!["theta_whoop", "theta_extdb"]);
    }
}
