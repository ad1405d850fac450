//! HTTP route handlers and the composition root.
//!
//! The transport is a thin adapter: handlers authenticate, shape the request,
//! and call into the platform manager or scheduler. All domain behavior lives
//! below this layer.

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::{Html, IntoResponse, Json, Redirect, Response};
use axum::routing::{delete, get, post};
use axum::Router;
use serde_json::Value;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::manage;
use super::types::{
    ApiError, ApiResponse, LinkProviderRequest, LlmAccessRequest, UnlinkProviderRequest,
};
use crate::auth;
use crate::config::Config;
use crate::lock::{KvStore, MemoryKv, PullLockManager};
use crate::manager::PlatformManager;
use crate::pipeline::NormalizationPipeline;
use crate::platform::apple::ApplePlatform;
use crate::platform::theta::ThetaPlatform;
use crate::platform::Platform;
use crate::providers::registry::{create_theta_providers, ProviderContext};
use crate::providers::CallbackParams;
use crate::push::PushService;
use crate::scheduler::Scheduler;
use crate::store::Database;
use crate::vault::crypto::CredentialCipher;
use crate::vault::CredentialVault;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub manager: Arc<PlatformManager>,
    pub scheduler: Arc<Scheduler>,
    pub lock: Arc<PullLockManager>,
    pub db: Database,
    pub pipeline: NormalizationPipeline,
}

/// Wire up every service and start the HTTP server. Runs until shutdown.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let db = Database::open(std::path::Path::new(&config.db_path))?;

    // A bad signing key is a fatal configuration error; refuse to start.
    let cipher = CredentialCipher::from_key_material(&config.secret_key)?;
    let vault = CredentialVault::new(db.connection(), cipher);

    let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
    let lock = Arc::new(PullLockManager::new(Some(Arc::clone(&kv))));
    let push = Arc::new(PushService::new(config.push_webhook_base_url.clone()));
    let pipeline = NormalizationPipeline::new(db.clone());
    let scheduler = Arc::new(Scheduler::new());

    // Platforms
    let theta = Arc::new(ThetaPlatform::new(
        db.clone(),
        vault.clone(),
        pipeline.clone(),
        Arc::clone(&scheduler),
        Arc::clone(&lock),
    ));
    let apple = Arc::new(ApplePlatform::new(db.clone(), vault.clone(), pipeline.clone()));

    // Providers from the compile-time registry
    let context = ProviderContext {
        config: config.clone(),
        db: db.clone(),
        vault: vault.clone(),
        states: Arc::clone(&kv),
        push: Arc::clone(&push),
        lock: Arc::clone(&lock),
    };
    for provider in create_theta_providers(&context) {
        if let Err(e) = theta.register_provider(provider) {
            error!(error = %e, "Failed to register provider");
        }
    }

    // Manager last; the push service re-enters through it.
    let manager = Arc::new(PlatformManager::new(db.clone()));
    manager.register_platform(theta);
    manager.register_platform(apple);
    push.set_manager(Arc::clone(&manager));

    scheduler.start().await;

    let state = Arc::new(AppState {
        config: config.clone(),
        manager,
        scheduler: Arc::clone(&scheduler),
        lock,
        db,
        pipeline,
    });

    let app = router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(scheduler))
        .await?;

    Ok(())
}

async fn shutdown_signal(scheduler: Arc<Scheduler>) {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutdown signal received");
    scheduler.stop().await;
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/v1/pulse/providers", get(list_providers))
        .route("/api/v1/pulse/user/providers", get(user_providers))
        .route("/api/v1/pulse/link", post(link_provider))
        .route("/api/v1/pulse/unlink", post(unlink_provider))
        .route("/api/v1/pulse/llm-access", post(update_llm_access))
        .route("/api/v1/pulse/:platform/webhook", post(platform_webhook))
        .route("/api/v1/pulse/:platform/:provider/webhook", post(provider_webhook))
        .route("/api/v1/pulse/:platform/:provider/callback", get(oauth_callback))
        .route("/apple/health", post(apple_health_ingest))
        .route("/api/v1/pulse/manage/tasks", get(manage::tasks_status))
        .route("/api/v1/pulse/manage/tasks/:slug", get(manage::task_status))
        .route("/api/v1/pulse/manage/tasks/:slug/trigger", post(manage::trigger_task))
        .route("/api/v1/pulse/manage/pull-config", get(manage::pull_config))
        .route("/api/v1/pulse/manage/locks/:slug", get(manage::lock_status))
        .route("/api/v1/pulse/manage/:platform/webhooks", get(manage::list_webhooks))
        .route(
            "/api/v1/pulse/manage/:platform/webhooks/:id/check-format",
            get(manage::check_format),
        )
        .route(
            "/api/v1/pulse/manage/:platform/webhooks/:id",
            delete(manage::delete_webhook),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Resolve the authenticated user from the bearer token.
fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<String, ApiError> {
    let header = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::unauthorized("Missing authorization header"))?;
    let token = auth::extract_bearer(header)
        .ok_or_else(|| ApiError::unauthorized("Malformed authorization header"))?;
    auth::verify_token(&state.config.jwt_secret, token)
        .map_err(|e| ApiError::unauthorized(e.to_string()))
}

/// Message id from the webhook transport headers, generated when absent.
fn message_id(headers: &HeaderMap) -> String {
    headers
        .get("Svix-Id")
        .or_else(|| headers.get("X-Message-ID"))
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

async fn health() -> Json<ApiResponse> {
    Json(ApiResponse::ok(serde_json::json!({ "status": "healthy" })))
}

async fn list_providers(State(state): State<Arc<AppState>>) -> Json<ApiResponse> {
    let providers = state.manager.get_all_providers().await;
    Json(ApiResponse::ok(serde_json::json!({ "providers": providers })))
}

async fn user_providers(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<ApiResponse>, ApiError> {
    let user_id = authenticate(&state, &headers)?;
    let providers = state.manager.get_user_providers(&user_id).await;
    Ok(Json(ApiResponse::ok(serde_json::json!({ "providers": providers }))))
}

async fn link_provider(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<LinkProviderRequest>,
) -> Result<Json<ApiResponse>, ApiError> {
    let user_id = authenticate(&state, &headers)?;

    let result = state
        .manager
        .link_provider(
            &user_id,
            &request.provider_slug,
            &request.platform,
            &request.auth_type,
            request.credentials,
            request.options,
        )
        .await
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    Ok(Json(ApiResponse::ok(result)))
}

async fn unlink_provider(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<UnlinkProviderRequest>,
) -> Result<Json<ApiResponse>, ApiError> {
    let user_id = authenticate(&state, &headers)?;
    let result = state
        .manager
        .unlink_provider(&user_id, &request.provider_slug, &request.platform)
        .await
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    Ok(Json(ApiResponse::ok(result)))
}

async fn update_llm_access(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<LlmAccessRequest>,
) -> Result<Json<ApiResponse>, ApiError> {
    let user_id = authenticate(&state, &headers)?;
    let result = state
        .manager
        .update_llm_access(&user_id, &request.provider_slug, &request.platform, request.llm_access)
        .await
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    Ok(Json(ApiResponse::ok(result)))
}

/// Webhook with the provider resolved from the payload by the platform.
async fn platform_webhook(
    State(state): State<Arc<AppState>>,
    Path(platform): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Result<Json<ApiResponse>, ApiError> {
    let Some(platform_instance) = state.manager.get_platform(&platform) else {
        return Err(ApiError::not_found(format!("Platform {} not found", platform)));
    };
    let Some(slug) = platform_instance.extract_provider_slug(&payload) else {
        return Err(ApiError::bad_request("Unable to resolve provider from payload"));
    };

    dispatch_webhook(&state, &platform, &slug, payload, &headers).await
}

/// Webhook with the provider explicit in the URL.
async fn provider_webhook(
    State(state): State<Arc<AppState>>,
    Path((platform, provider)): Path<(String, String)>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Result<Json<ApiResponse>, ApiError> {
    dispatch_webhook(&state, &platform, &provider, payload, &headers).await
}

async fn dispatch_webhook(
    state: &AppState,
    platform: &str,
    slug: &str,
    mut payload: Value,
    headers: &HeaderMap,
) -> Result<Json<ApiResponse>, ApiError> {
    let msg_id = message_id(headers);

    // A bearer token, when present, pins the payload to the caller.
    if let Ok(user_id) = authenticate(state, headers) {
        if let Some(object) = payload.as_object_mut() {
            object.entry("user_id").or_insert(Value::String(user_id));
        }
    }

    let success = state.manager.post_data(platform, slug, payload, &msg_id).await;
    if success {
        Ok(Json(ApiResponse::ok(serde_json::json!({ "msg_id": msg_id }))))
    } else {
        // Ingestion failure is retryable by the caller.
        Err(ApiError::internal("Data processing failed"))
    }
}

/// Authenticated Apple Health export ingest.
async fn apple_health_ingest(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Result<Json<ApiResponse>, ApiError> {
    let user_id = authenticate(&state, &headers)?;

    if payload.get("healthData").and_then(Value::as_array).is_none() {
        return Err(ApiError::bad_request("Invalid request data: healthData is required"));
    }
    let request_id = payload
        .get("request_id")
        .and_then(Value::as_str)
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let platform_data = serde_json::json!({
        "user_id": user_id,
        "request_id": request_id,
        "metaInfo": payload.get("metaInfo").cloned().unwrap_or_default(),
        "healthData": payload.get("healthData").cloned().unwrap_or_default(),
    });

    let msg_id = format!(
        "apple_health_{}_{}",
        user_id,
        chrono::Utc::now().timestamp_millis()
    );
    let success = state
        .manager
        .post_data("apple", "apple_health", platform_data, &msg_id)
        .await;

    if success {
        Ok(Json(ApiResponse::ok(serde_json::json!({ "request_id": request_id }))))
    } else {
        Err(ApiError::internal("Apple Health data processing failed"))
    }
}

/// OAuth redirect target. On success, 302 to the caller's return URL when one
/// was parked in the state, otherwise a completion page that notifies the
/// opening window.
async fn oauth_callback(
    State(state): State<Arc<AppState>>,
    Path((platform, provider)): Path<(String, String)>,
    Query(params): Query<CallbackParams>,
) -> Response {
    let Some(platform_instance) = state.manager.get_platform(&platform) else {
        return ApiError::not_found(format!("Platform {} not found", platform)).into_response();
    };

    match platform_instance.callback(&provider, &params).await {
        Ok(result) => {
            info!(platform, provider, "OAuth callback completed");
            match result.get("return_url").and_then(Value::as_str) {
                Some(return_url) if !return_url.is_empty() => {
                    Redirect::temporary(return_url).into_response()
                }
                _ => Html(completion_page(&provider)).into_response(),
            }
        }
        Err(e) => {
            warn!(platform, provider, error = %e, "OAuth callback failed");
            ApiError::bad_request(e.to_string()).into_response()
        }
    }
}

fn completion_page(provider: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head><title>Connection complete</title></head>
<body>
<p>Your {provider} account is connected. You can close this window.</p>
<script>
  if (window.opener) {{
    window.opener.postMessage({{ type: "provider-linked", provider: "{provider}" }}, "*");
    window.close();
  }}
</script>
</body>
</html>"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_id_prefers_svix_header() {
        let mut headers = HeaderMap::new();
        headers.insert("Svix-Id", "svix-123".parse().unwrap());
        headers.insert("X-Message-ID", "xmsg-456".parse().unwrap());
        assert_eq!(message_id(&headers), "svix-123");

        headers.remove("Svix-Id");
        assert_eq!(message_id(&headers), "xmsg-456");

        headers.remove("X-Message-ID");
        // Generated ids are unique.
        assert_ne!(message_id(&headers), message_id(&headers));
    }

    #[test]
    fn test_completion_page_posts_to_opener() {
        let page = completion_page("theta_whoop");
        assert!(page.contains("provider-linked"));
        assert!(page.contains("theta_whoop"));
    }
}
