//! HTTP API.
//!
//! ## Endpoints
//!
//! - `GET /api/health` - Health check
//! - `GET /api/v1/pulse/providers` - List available providers
//! - `GET /api/v1/pulse/user/providers` - List the caller's linked providers
//! - `POST /api/v1/pulse/link` - Link a provider
//! - `POST /api/v1/pulse/unlink` - Unlink a provider
//! - `POST /api/v1/pulse/llm-access` - Update a link's LLM access level
//! - `POST /api/v1/pulse/{platform}/webhook` - Vendor webhook (provider resolved from payload)
//! - `POST /api/v1/pulse/{platform}/{provider}/webhook` - Vendor webhook (explicit provider)
//! - `GET /api/v1/pulse/{platform}/{provider}/callback` - OAuth redirect target
//! - `POST /apple/health` - Authenticated Apple Health export ingest
//! - `GET /api/v1/pulse/manage/...` - Management console (tasks, locks, webhooks)

mod manage;
mod routes;
pub mod types;

pub use routes::{router, serve, AppState};
pub use types::*;
