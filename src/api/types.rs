//! API request/response types.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Uniform response envelope: `code = 0` on success, non-zero on failure with
/// a human-readable `msg`.
#[derive(Debug, Serialize)]
pub struct ApiResponse {
    pub code: i32,
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ApiResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            code: 0,
            msg: "ok".to_string(),
            data: Some(data),
        }
    }

    pub fn error(code: i32, msg: impl Into<String>) -> Self {
        Self {
            code,
            msg: msg.into(),
            data: None,
        }
    }
}

/// Envelope plus matching HTTP status.
pub struct ApiError {
    pub status: StatusCode,
    pub response: ApiResponse,
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            response: ApiResponse::error(400, msg),
        }
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            response: ApiResponse::error(401, msg),
        }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            response: ApiResponse::error(404, msg),
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            response: ApiResponse::error(500, msg),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.response)).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct LinkProviderRequest {
    pub provider_slug: String,
    pub platform: String,
    pub auth_type: String,
    #[serde(default)]
    pub credentials: Value,
    #[serde(default)]
    pub options: Value,
}

#[derive(Debug, Deserialize)]
pub struct UnlinkProviderRequest {
    pub provider_slug: String,
    pub platform: String,
}

#[derive(Debug, Deserialize)]
pub struct LlmAccessRequest {
    pub provider_slug: String,
    pub platform: String,
    pub llm_access: i64,
}

#[derive(Debug, Default, Deserialize)]
pub struct TriggerTaskRequest {
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct WebhookListQuery {
    pub provider: Option<String>,
    pub user_id: Option<String>,
    #[serde(default)]
    pub page: u32,
    #[serde(default)]
    pub page_size: u32,
}

#[derive(Debug, Default, Deserialize)]
pub struct ProviderQuery {
    pub provider: Option<String>,
}
