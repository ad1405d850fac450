//! Management-console handlers: pull task status and triggers, stored
//! webhook inspection, lock monitoring.

use axum::extract::{Path, Query, State};
use axum::response::Json;
use std::sync::Arc;
use tracing::info;

use super::routes::AppState;
use super::types::{ApiError, ApiResponse, ProviderQuery, TriggerTaskRequest, WebhookListQuery};
use crate::platform::WebhookFilters;

/// GET /manage/tasks
pub async fn tasks_status(State(state): State<Arc<AppState>>) -> Json<ApiResponse> {
    let status = state.scheduler.tasks_status().await;
    Json(ApiResponse::ok(status))
}

/// GET /manage/tasks/{slug}
pub async fn task_status(
    State(state): State<Arc<AppState>>,
    Path(slug): Path<String>,
) -> Result<Json<ApiResponse>, ApiError> {
    match state.scheduler.task_status(&slug).await {
        Some(status) => Ok(Json(ApiResponse::ok(status))),
        None => Err(ApiError::not_found(format!("Task not found: {}", slug))),
    }
}

/// POST /manage/tasks/{slug}/trigger
pub async fn trigger_task(
    State(state): State<Arc<AppState>>,
    Path(slug): Path<String>,
    Json(request): Json<TriggerTaskRequest>,
) -> Result<Json<ApiResponse>, ApiError> {
    info!(slug, force = request.force, "Manual task trigger requested");
    let executed = state
        .scheduler
        .trigger_task(&slug, request.force)
        .await
        .map_err(|e| ApiError::not_found(e.to_string()))?;
    Ok(Json(ApiResponse::ok(serde_json::json!({ "executed": executed }))))
}

/// GET /manage/pull-config
pub async fn pull_config() -> Json<ApiResponse> {
    Json(ApiResponse::ok(crate::scheduler::provider_execution_config()))
}

/// GET /manage/locks/{slug}
pub async fn lock_status(
    State(state): State<Arc<AppState>>,
    Path(slug): Path<String>,
) -> Json<ApiResponse> {
    let status = state.lock.status(&slug).await;
    Json(ApiResponse::ok(serde_json::to_value(status).unwrap_or_default()))
}

/// GET /manage/{platform}/webhooks
pub async fn list_webhooks(
    State(state): State<Arc<AppState>>,
    Path(platform): Path<String>,
    Query(query): Query<WebhookListQuery>,
) -> Result<Json<ApiResponse>, ApiError> {
    let Some(platform_instance) = state.manager.get_platform(&platform) else {
        return Err(ApiError::not_found(format!("Platform {} not found", platform)));
    };

    let filters = WebhookFilters {
        provider: query.provider,
        user_id: query.user_id,
        page: query.page.max(1),
        page_size: if query.page_size == 0 { 20 } else { query.page_size },
    };

    let result = platform_instance
        .get_webhooks(&filters)
        .await
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    Ok(Json(ApiResponse::ok(result)))
}

/// GET /manage/{platform}/webhooks/{id}/check-format
pub async fn check_format(
    State(state): State<Arc<AppState>>,
    Path((platform, webhook_id)): Path<(String, i64)>,
    Query(query): Query<ProviderQuery>,
) -> Result<Json<ApiResponse>, ApiError> {
    let Some(platform_instance) = state.manager.get_platform(&platform) else {
        return Err(ApiError::not_found(format!("Platform {} not found", platform)));
    };

    let result = platform_instance
        .check_format(webhook_id, query.provider.as_deref())
        .await
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    Ok(Json(ApiResponse::ok(result)))
}

/// DELETE /manage/{platform}/webhooks/{id}
///
/// Soft-deletes the stored payload and kicks off the best-effort cascade
/// delete of the rows derived from it in the background.
pub async fn delete_webhook(
    State(state): State<Arc<AppState>>,
    Path((platform, webhook_id)): Path<(String, i64)>,
    Query(query): Query<ProviderQuery>,
) -> Result<Json<ApiResponse>, ApiError> {
    if state.manager.get_platform(&platform).is_none() {
        return Err(ApiError::not_found(format!("Platform {} not found", platform)));
    }
    let Some(provider) = query.provider else {
        return Err(ApiError::bad_request("Provider parameter is required"));
    };

    // Read the row first; the cascade needs the owning user.
    let row = state
        .db
        .get_raw_payload(&provider, webhook_id)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;
    let Some(row) = row else {
        return Err(ApiError::not_found(format!("Record {} not found", webhook_id)));
    };

    let msg_id = state
        .db
        .soft_delete_raw_payload(&provider, webhook_id)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;

    let Some(msg_id) = msg_id else {
        return Err(ApiError::not_found(format!("Record {} not found", webhook_id)));
    };

    let pipeline = state.pipeline.clone();
    let cascade_id = msg_id.clone();
    tokio::spawn(async move {
        pipeline.cascade_delete(row.user_id.as_deref(), &cascade_id).await;
    });

    Ok(Json(ApiResponse::ok(serde_json::json!({ "deleted": true, "msg_id": msg_id }))))
}
