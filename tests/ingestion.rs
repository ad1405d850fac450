//! End-to-end ingestion tests: payloads enter through the platform manager
//! exactly as the webhook transport delivers them, and land as normalized
//! rows in the series/summary stores.

use std::sync::Arc;
use std::time::Duration;

use pulsehub::config::Config;
use pulsehub::lock::{KvStore, MemoryKv, PullLockManager};
use pulsehub::manager::PlatformManager;
use pulsehub::pipeline::NormalizationPipeline;
use pulsehub::platform::apple::ApplePlatform;
use pulsehub::platform::theta::ThetaPlatform;
use pulsehub::platform::Platform;
use pulsehub::providers::whoop::WhoopProvider;
use pulsehub::providers::Provider;
use pulsehub::push::PushService;
use pulsehub::scheduler::Scheduler;
use pulsehub::store::Database;
use pulsehub::vault::crypto::CredentialCipher;
use pulsehub::vault::{AuthKind, CredentialBundle, CredentialVault};

struct Stack {
    manager: Arc<PlatformManager>,
    db: Database,
    vault: CredentialVault,
}

fn whoop_config() -> Config {
    let mut config = Config::for_tests("11".repeat(32), ":memory:".to_string());
    config.whoop.client_id = Some("client-123".to_string());
    config.whoop.client_secret = Some("secret-456".to_string());
    config.whoop.redirect_url = Some("https://hub.example/callback".to_string());
    config
}

fn build_stack() -> Stack {
    let config = whoop_config();
    let db = Database::open_in_memory().unwrap();
    let vault = CredentialVault::new(db.connection(), CredentialCipher::new([3u8; 32]));
    let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
    let lock = Arc::new(PullLockManager::new(Some(Arc::clone(&kv))));
    let push = Arc::new(PushService::new("http://127.0.0.1:0".to_string()));
    let pipeline = NormalizationPipeline::new(db.clone());
    let scheduler = Arc::new(Scheduler::new());

    let theta = Arc::new(ThetaPlatform::new(
        db.clone(),
        vault.clone(),
        pipeline.clone(),
        Arc::clone(&scheduler),
        Arc::clone(&lock),
    ));
    let whoop = WhoopProvider::create(
        &config.whoop,
        Duration::from_secs(900),
        Duration::from_secs(5),
        vault.clone(),
        db.clone(),
        Arc::clone(&kv),
        Arc::clone(&push),
        Arc::clone(&lock),
    )
    .unwrap();
    theta
        .register_provider(Arc::new(whoop) as Arc<dyn Provider>)
        .unwrap();

    let apple = Arc::new(ApplePlatform::new(db.clone(), vault.clone(), pipeline));

    let manager = Arc::new(PlatformManager::new(db.clone()));
    manager.register_platform(theta);
    manager.register_platform(apple);
    push.set_manager(Arc::clone(&manager));

    Stack { manager, db, vault }
}

fn apple_payload(health_type: &str) -> serde_json::Value {
    serde_json::json!({
        "user_id": "u1",
        "request_id": "req-1",
        "metaInfo": {"timezone": "UTC"},
        "healthData": [{
            "uuid": "r1",
            "type": health_type,
            "dateFrom": 1_700_000_000_000i64,
            "dateTo": 1_700_000_000_000i64,
            "value": {"numericValue": 72},
            "unitSymbol": "bpm"
        }]
    })
}

#[tokio::test]
async fn apple_heart_rate_lands_as_series_row() {
    let stack = build_stack();

    let ok = stack
        .manager
        .post_data("apple", "apple_health", apple_payload("HEART_RATE"), "msg-hr-1")
        .await;
    assert!(ok);

    let rows = stack.db.query_series("u1", "heartRate", None, None).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].value, "72");
    assert_eq!(rows[0].source, "apple_health");
    assert_eq!(rows[0].time.to_string(), "2023-11-14 22:13:20");
}

#[tokio::test]
async fn unknown_health_type_stores_nothing() {
    let stack = build_stack();

    let ok = stack
        .manager
        .post_data("apple", "apple_health", apple_payload("UNKNOWN_METRIC"), "msg-unk-1")
        .await;
    assert!(ok);

    let rows = stack.db.query_series("u1", "heartRate", None, None).await.unwrap();
    assert!(rows.is_empty());
}

#[tokio::test]
async fn repeated_msg_id_is_an_idempotent_noop() {
    let stack = build_stack();

    assert!(
        stack
            .manager
            .post_data("apple", "apple_health", apple_payload("HEART_RATE"), "msg-dup")
            .await
    );
    let first = stack
        .db
        .query_series("u1", "heartRate", None, None)
        .await
        .unwrap();

    // Same msg_id again: accepted, but the stored state is unchanged.
    assert!(
        stack
            .manager
            .post_data("apple", "apple_health", apple_payload("HEART_RATE"), "msg-dup")
            .await
    );
    let second = stack
        .db
        .query_series("u1", "heartRate", None, None)
        .await
        .unwrap();

    assert_eq!(first.len(), second.len());
    assert_eq!(first[0].value, second[0].value);
    let update_first = stack
        .db
        .series_update_time("u1", "heartRate", "apple_health", first[0].time)
        .await
        .unwrap();
    let update_second = stack
        .db
        .series_update_time("u1", "heartRate", "apple_health", second[0].time)
        .await
        .unwrap();
    assert_eq!(update_first, update_second);
}

#[tokio::test]
async fn whoop_sleep_webhook_normalizes_stage_durations() {
    let stack = build_stack();

    let payload = serde_json::json!({
        "user_id": "U",
        "data_type": "sleeps",
        "data": [{
            "start": "2023-11-14T22:13:20Z",
            "score_state": "SCORED",
            "score": {
                "stage_summary": {"total_in_bed_time_milli": 28_800_000},
                "sleep_efficiency_percentage": 92.5
            }
        }]
    });

    let ok = stack
        .manager
        .post_data("theta", "theta_whoop", payload, "msg-whoop-1")
        .await;
    assert!(ok);

    let in_bed = stack.db.query_series("U", "sleepInBed", None, None).await.unwrap();
    assert_eq!(in_bed.len(), 1);
    assert_eq!(in_bed[0].value, "480");
    assert_eq!(in_bed[0].source, "theta.whoop");

    let efficiency = stack
        .db
        .query_series("U", "sleepEfficiency", None, None)
        .await
        .unwrap();
    assert_eq!(efficiency.len(), 1);
}

#[tokio::test]
async fn oauth2_link_returns_vendor_authorization_url() {
    let stack = build_stack();

    let result = stack
        .manager
        .link_provider(
            "U",
            "theta_whoop",
            "theta",
            "oauth2",
            serde_json::json!({}),
            serde_json::json!({"return_url": "https://app.example/done"}),
        )
        .await
        .unwrap();

    let url = result["link_web_url"].as_str().unwrap();
    assert!(url.contains("client_id=client-123"));
    assert!(url.contains("state="));
}

#[tokio::test]
async fn unlink_soft_deletes_the_link() {
    let stack = build_stack();

    stack
        .vault
        .save_link(
            "U",
            "theta_whoop",
            &CredentialBundle::OAuth2 {
                access_token: "tok".to_string(),
                refresh_token: "ref".to_string(),
                expires_at: None,
                username: None,
            },
        )
        .await
        .unwrap();

    stack
        .manager
        .unlink_provider("U", "theta_whoop", "theta")
        .await
        .unwrap();

    assert!(stack
        .vault
        .get_credentials("U", "theta_whoop", AuthKind::OAuth2)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn user_providers_reflect_link_and_reconnect_state() {
    let stack = build_stack();

    stack
        .vault
        .save_link(
            "U",
            "theta_whoop",
            &CredentialBundle::OAuth2 {
                access_token: "tok".to_string(),
                refresh_token: "ref".to_string(),
                expires_at: None,
                username: None,
            },
        )
        .await
        .unwrap();

    let providers = stack.manager.get_user_providers("U").await;
    assert_eq!(providers.len(), 1);
    assert_eq!(providers[0].slug, "theta_whoop");

    stack.vault.invalidate_credentials("U", "theta_whoop").await.unwrap();
    let providers = stack.manager.get_user_providers("U").await;
    assert!(matches!(
        providers[0].status,
        pulsehub::providers::ProviderStatus::Reconnect
    ));
}
