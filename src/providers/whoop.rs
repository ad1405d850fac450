//! Whoop provider.
//!
//! OAuth2 vendor integration. Linking is the two-stage OAuth2 flow: `link`
//! returns the vendor authorization URL with a short-lived `state` record,
//! `callback` exchanges the code for tokens and stores them in the vault.
//! Scheduled pulls walk three layers of the vendor API (collections,
//! per-record details, static profile data), package each data type as one
//! raw payload, and push every payload back through the ingestion path.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::{format_source_name, CallbackParams, LinkRequest, Provider, ProviderInfo, ProviderStatus};
use crate::catalog::units::{KJ_PER_KCAL, MS_PER_MINUTE};
use crate::config::WhoopConfig;
use crate::lock::{KvStore, PullLockManager};
use crate::pipeline::records::{PulseData, PulseMetaInfo, PulseRecord, RecordValue};
use crate::push::PushService;
use crate::store::Database;
use crate::vault::{AuthKind, CredentialBundle, CredentialVault};

const SLUG: &str = "theta_whoop";

/// Default lookback window (days) when no incremental timestamp exists.
const DEFAULT_LOOKBACK_DAYS: i64 = 2;

/// Upper bound on per-id detail fetches per collection.
const MAX_DETAIL_RECORDS: usize = 50;

/// Concurrent detail requests.
const CONCURRENT_REQUESTS: usize = 5;

const MAX_RETRIES: u32 = 3;

type Converter = fn(f64) -> f64;

fn identity(x: f64) -> f64 {
    x
}

fn kj_to_kcal(x: f64) -> f64 {
    x / KJ_PER_KCAL
}

fn ms_to_min(x: f64) -> f64 {
    x / MS_PER_MINUTE
}

/// Vendor field path → (indicator, converter, standard unit).
type FieldMapping = &'static [(&'static str, &'static str, Converter, &'static str)];

static SLEEP_MAPPING: FieldMapping = &[
    ("score.stage_summary.total_in_bed_time_milli", "sleepInBed", ms_to_min, "min"),
    ("score.stage_summary.total_awake_time_milli", "sleepAwake", ms_to_min, "min"),
    ("score.stage_summary.total_light_sleep_time_milli", "sleepAsleepCore", ms_to_min, "min"),
    ("score.stage_summary.total_slow_wave_sleep_time_milli", "sleepAsleepDeep", ms_to_min, "min"),
    ("score.stage_summary.total_rem_sleep_time_milli", "sleepAsleepRem", ms_to_min, "min"),
    ("score.sleep_efficiency_percentage", "sleepEfficiency", identity, "%"),
    ("score.respiratory_rate", "respiratoryRate", identity, "count/min"),
    ("score.sleep_performance_percentage", "sleepPerformance", identity, "%"),
    ("score.sleep_consistency_percentage", "sleepConsistency", identity, "%"),
    ("score.stage_summary.disturbance_count", "sleepDisturbances", identity, "count"),
];

static CYCLE_MAPPING: FieldMapping = &[
    ("score.average_heart_rate", "heartRate", identity, "bpm"),
    ("score.max_heart_rate", "heartRateMax", identity, "bpm"),
    ("score.kilojoule", "caloriesActive", kj_to_kcal, "kcal"),
    ("score.strain", "strain", identity, "count"),
];

static RECOVERY_MAPPING: FieldMapping = &[
    ("score.resting_heart_rate", "restingHeartRate", identity, "bpm"),
    ("score.hrv_rmssd_milli", "hrvRmssd", identity, "ms"),
    ("score.spo2_percentage", "bloodOxygen", identity, "%"),
    ("score.recovery_score", "recoveryScore", identity, "%"),
    ("score.skin_temp_celsius", "skinTemperature", identity, "C"),
];

static WORKOUT_MAPPING: FieldMapping = &[
    ("score.average_heart_rate", "heartRate", identity, "bpm"),
    ("score.max_heart_rate", "heartRateMax", identity, "bpm"),
    ("score.distance_meter", "distance", identity, "m"),
    ("score.kilojoule", "caloriesActive", kj_to_kcal, "kcal"),
    ("score.altitude_gain_meter", "altitudeGain", identity, "m"),
    ("score.altitude_change_meter", "altitudeChange", identity, "m"),
];

static BODY_MAPPING: FieldMapping = &[
    ("height_meter", "height", identity, "m"),
    ("weight_kilogram", "weight", identity, "kg"),
    ("max_heart_rate", "maxHeartRateProfile", identity, "bpm"),
];

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct PendingState {
    user_id: String,
    redirect_uri: String,
    #[serde(default)]
    return_url: Option<String>,
}

/// Shared innards so background pulls can outlive a borrow of the provider.
pub(crate) struct WhoopCore {
    client_id: String,
    client_secret: String,
    redirect_url: String,
    auth_url: String,
    token_url: String,
    api_base_url: String,
    scopes: String,
    state_ttl: Duration,
    http: reqwest::Client,
    vault: CredentialVault,
    db: Database,
    states: Arc<dyn KvStore>,
    push: Arc<PushService>,
    lock: Arc<PullLockManager>,
}

pub struct WhoopProvider {
    core: Arc<WhoopCore>,
}

impl WhoopProvider {
    /// Factory for the provider registry. Returns `None` when the OAuth2 app
    /// is not configured, so the provider is skipped.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        config: &WhoopConfig,
        state_ttl: Duration,
        request_timeout: Duration,
        vault: CredentialVault,
        db: Database,
        states: Arc<dyn KvStore>,
        push: Arc<PushService>,
        lock: Arc<PullLockManager>,
    ) -> Option<Self> {
        let (Some(client_id), Some(client_secret), Some(redirect_url)) = (
            config.client_id.clone(),
            config.client_secret.clone(),
            config.redirect_url.clone(),
        ) else {
            warn!("Whoop OAuth credentials not configured, provider skipped");
            return None;
        };

        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .ok()?;

        info!(client = %&client_id[..client_id.len().min(3)], "Whoop OAuth configuration validated");

        Some(Self {
            core: Arc::new(WhoopCore {
                client_id,
                client_secret,
                redirect_url,
                auth_url: config.auth_url.clone(),
                token_url: config.token_url.clone(),
                api_base_url: config.api_base_url.clone(),
                scopes: config.scopes.clone(),
                state_ttl,
                http,
                vault,
                db,
                states,
                push,
                lock,
            }),
        })
    }
}

impl WhoopCore {
    fn state_key(state: &str) -> String {
        format!("oauth2:state:{}", state)
    }

    /// Stage 1: build the vendor authorization URL and park the caller's
    /// context under the state key.
    async fn generate_authorization_url(&self, user_id: &str, return_url: Option<String>) -> Result<Value> {
        let state = Uuid::new_v4().to_string();
        let pending = serde_json::json!({
            "user_id": user_id,
            "redirect_uri": self.redirect_url,
            "return_url": return_url,
        });

        self.states
            .set(&Self::state_key(&state), &pending.to_string(), self.state_ttl)
            .await
            .context("Failed to store OAuth2 state")?;

        let authorization_url = format!(
            "{}?client_id={}&response_type=code&redirect_uri={}&scope={}&state={}",
            self.auth_url,
            urlencoding::encode(&self.client_id),
            urlencoding::encode(&self.redirect_url),
            urlencoding::encode(&self.scopes),
            urlencoding::encode(&state),
        );

        info!(user_id, "Generated Whoop OAuth2 authorization URL");
        Ok(serde_json::json!({ "link_web_url": authorization_url }))
    }

    /// Stage 2: redeem the state, exchange the code for tokens, persist them,
    /// and kick off an immediate first pull in the background.
    async fn handle_callback(self: &Arc<Self>, code: &str, state: &str) -> Result<Value> {
        let key = Self::state_key(state);
        let pending_raw = self.states.get(&key).await?;
        self.states.delete(&key).await.ok();

        let Some(pending_raw) = pending_raw else {
            bail!("Unknown or expired OAuth2 state");
        };
        let pending: PendingState =
            serde_json::from_str(&pending_raw).context("Malformed pending OAuth2 state")?;

        let response = self
            .http
            .post(&self.token_url)
            .header("Accept", "application/json")
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", &pending.redirect_uri),
                ("client_id", &self.client_id),
                ("client_secret", &self.client_secret),
            ])
            .send()
            .await
            .context("Token exchange request failed")?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            bail!("Failed to get access token: {} - {}", status, body);
        }

        let token: TokenResponse =
            serde_json::from_str(&body).context("Token endpoint returned non-JSON body")?;
        let refresh_token = token.refresh_token.unwrap_or_else(|| {
            warn!("Token response missing refresh_token, proceeding without refresh capability");
            String::new()
        });
        let expires_at = token.expires_in.map(|seconds| Utc::now().timestamp() + seconds);

        self.vault
            .save_link(
                &pending.user_id,
                SLUG,
                &CredentialBundle::OAuth2 {
                    access_token: token.access_token.clone(),
                    refresh_token,
                    expires_at,
                    username: None,
                },
            )
            .await?;

        info!(user_id = pending.user_id, "Successfully linked Whoop provider");

        // Initial pull runs in the background; the callback must return fast.
        let core = Arc::clone(self);
        let user_id = pending.user_id.clone();
        tokio::spawn(async move {
            core.pull_and_push_for_user(&user_id).await;
        });

        Ok(serde_json::json!({
            "provider_slug": SLUG,
            "stage": "completed",
            "return_url": pending.return_url,
        }))
    }

    /// Return a currently-valid access token, refreshing when expired. A 4xx
    /// from the token endpoint is terminal: the credential is invalidated and
    /// the user must relink.
    async fn get_valid_access_token(&self, user_id: &str) -> Option<String> {
        let bundle = match self.vault.get_credentials(user_id, SLUG, AuthKind::OAuth2).await {
            Ok(Some(bundle)) => bundle,
            Ok(None) => {
                error!(user_id, "No credentials found");
                return None;
            }
            Err(e) => {
                error!(user_id, error = %e, "Credential lookup failed");
                return None;
            }
        };

        let CredentialBundle::OAuth2 {
            access_token,
            refresh_token,
            expires_at,
            ..
        } = bundle
        else {
            error!(user_id, "Unexpected credential kind for Whoop link");
            return None;
        };

        let now = Utc::now().timestamp();
        if let Some(expires_at) = expires_at {
            if now < expires_at {
                return Some(access_token);
            }
        }

        if refresh_token.is_empty() {
            error!(user_id, "No refresh token available");
            return None;
        }

        info!(user_id, "Access token expired, attempting refresh");
        let response = match self
            .http
            .post(&self.token_url)
            .header("Accept", "application/json")
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", &refresh_token),
                ("client_id", &self.client_id),
                ("client_secret", &self.client_secret),
                ("scope", &self.scopes),
            ])
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                // Network trouble is transient; the next run retries.
                error!(user_id, error = %e, "Network error during token refresh");
                return None;
            }
        };

        let status = response.status();
        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            error!(user_id, %status, body, "Refresh rejected, invalidating credentials");
            if let Err(e) = self.vault.invalidate_credentials(user_id, SLUG).await {
                error!(user_id, error = %e, "Failed to invalidate credentials");
            }
            return None;
        }
        if !status.is_success() {
            error!(user_id, %status, "Refresh failed with server error");
            return None;
        }

        let token: TokenResponse = match response.json().await {
            Ok(token) => token,
            Err(e) => {
                error!(user_id, error = %e, "Failed to parse refresh response");
                return None;
            }
        };

        let new_refresh = token.refresh_token.unwrap_or(refresh_token);
        let new_expires_at = token.expires_in.map(|seconds| Utc::now().timestamp() + seconds);

        if let Err(e) = self
            .vault
            .update_oauth2_tokens(user_id, SLUG, &token.access_token, &new_refresh, new_expires_at)
            .await
        {
            // Still usable this run even if persisting failed.
            error!(user_id, error = %e, "Failed to save refreshed credentials");
        }

        info!(user_id, "Successfully refreshed token");
        Some(token.access_token)
    }

    /// Fetch every page of a collection endpoint, retrying rate limits and
    /// timeouts with bounded backoff.
    async fn fetch_paginated(
        &self,
        endpoint: &str,
        access_token: &str,
        base_params: &[(String, String)],
    ) -> Vec<Value> {
        let mut all_records = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let mut params = base_params.to_vec();
            if let Some(token) = &next_token {
                params.push(("nextToken".to_string(), token.clone()));
            }

            let mut data = None;
            let mut retries = 0u32;
            while retries <= MAX_RETRIES {
                let request = self
                    .http
                    .get(endpoint)
                    .bearer_auth(access_token)
                    .header("Accept", "application/json")
                    .query(&params);

                match request.send().await {
                    Ok(response) if response.status().as_u16() == 429 => {
                        let retry_after: u64 = response
                            .headers()
                            .get("Retry-After")
                            .and_then(|v| v.to_str().ok())
                            .and_then(|v| v.parse().ok())
                            .unwrap_or(60);
                        if retries < MAX_RETRIES {
                            warn!(endpoint, retry_after, "Rate limited, backing off");
                            tokio::time::sleep(Duration::from_secs(retry_after.min(60))).await;
                            retries += 1;
                            continue;
                        }
                        error!(endpoint, "Max retries exceeded due to rate limiting");
                        break;
                    }
                    Ok(response) if !response.status().is_success() => {
                        let status = response.status();
                        let body = response.text().await.unwrap_or_default();
                        error!(endpoint, %status, body, "Vendor request failed");
                        break;
                    }
                    Ok(response) => match response.json::<Value>().await {
                        Ok(parsed) => {
                            data = Some(parsed);
                            break;
                        }
                        Err(e) => {
                            error!(endpoint, error = %e, "Failed to parse vendor response");
                            break;
                        }
                    },
                    Err(e) => {
                        if retries < MAX_RETRIES {
                            let backoff = Duration::from_secs(2u64.pow(retries + 1));
                            warn!(endpoint, error = %e, "Request error, retrying");
                            tokio::time::sleep(backoff).await;
                            retries += 1;
                            continue;
                        }
                        error!(endpoint, error = %e, "Request failed after retries");
                        break;
                    }
                }
            }

            let Some(data) = data else { break };

            match data.get("records").and_then(Value::as_array) {
                Some(records) => {
                    all_records.extend(records.iter().cloned());
                    next_token = data
                        .get("next_token")
                        .and_then(Value::as_str)
                        .filter(|t| !t.is_empty())
                        .map(String::from);
                    if next_token.is_none() {
                        break;
                    }
                }
                None => {
                    // Non-paginated response (profile, body measurements).
                    all_records.push(data);
                    break;
                }
            }
        }

        all_records
    }

    /// Fetch per-id details for a batch of collection items concurrently.
    async fn fetch_detail_batch(
        &self,
        items: &[Value],
        url_template: &str,
        access_token: &str,
    ) -> Vec<Value> {
        let urls: Vec<String> = items
            .iter()
            .take(MAX_DETAIL_RECORDS)
            .filter_map(|item| item.get("id"))
            .filter_map(|id| match id {
                Value::String(s) => Some(url_template.replace("{id}", s)),
                Value::Number(n) => Some(url_template.replace("{id}", &n.to_string())),
                _ => None,
            })
            .collect();

        stream::iter(urls)
            .map(|url| async move { self.fetch_paginated(&url, access_token, &[]).await.into_iter().next() })
            .buffer_unordered(CONCURRENT_REQUESTS)
            .filter_map(|detail| async move { detail })
            .collect()
            .await
    }

    /// Pull vendor data for the last `days` days: collections, details, and
    /// static profile/body data, packaged per data type.
    async fn pull_from_vendor(&self, access_token: &str, days: i64) -> Vec<Value> {
        info!(days, "Starting Whoop data pull");

        let mut collection_params = Vec::new();
        if days > 0 {
            let end = Utc::now();
            let start = end - TimeDelta::days(days);
            collection_params.push(("start".to_string(), start.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()));
            collection_params.push(("end".to_string(), end.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()));
            collection_params.push(("limit".to_string(), "25".to_string()));
        }

        let base = &self.api_base_url;
        let cycles = self
            .fetch_paginated(&format!("{}/cycle", base), access_token, &collection_params)
            .await;
        let sleeps = self
            .fetch_paginated(&format!("{}/activity/sleep", base), access_token, &collection_params)
            .await;
        let workouts = self
            .fetch_paginated(&format!("{}/activity/workout", base), access_token, &collection_params)
            .await;
        let recoveries = self
            .fetch_paginated(&format!("{}/recovery", base), access_token, &collection_params)
            .await;
        info!(
            cycles = cycles.len(),
            sleeps = sleeps.len(),
            workouts = workouts.len(),
            recoveries = recoveries.len(),
            "Fetched collection data"
        );

        let detailed_cycles = self
            .fetch_detail_batch(&cycles, &format!("{}/cycle/{{id}}", base), access_token)
            .await;
        let detailed_sleeps = self
            .fetch_detail_batch(&sleeps, &format!("{}/activity/sleep/{{id}}", base), access_token)
            .await;
        let detailed_workouts = self
            .fetch_detail_batch(&workouts, &format!("{}/activity/workout/{{id}}", base), access_token)
            .await;
        let cycle_recoveries = self
            .fetch_detail_batch(&cycles, &format!("{}/cycle/{{id}}/recovery", base), access_token)
            .await;

        let profile = self
            .fetch_paginated(&format!("{}/user/profile/basic", base), access_token, &[])
            .await;
        let body_measurements = self
            .fetch_paginated(&format!("{}/user/measurement/body", base), access_token, &[])
            .await;

        let timestamp = Utc::now().timestamp_millis();
        let mut packages = Vec::new();
        let mut push_package = |data_type: &str, data: Vec<Value>| {
            if !data.is_empty() {
                packages.push(serde_json::json!({
                    "data_type": data_type,
                    "data": data,
                    "timestamp": timestamp,
                }));
            }
        };

        push_package(
            "cycles",
            if detailed_cycles.is_empty() { cycles } else { detailed_cycles },
        );
        push_package(
            "sleeps",
            if detailed_sleeps.is_empty() { sleeps } else { detailed_sleeps },
        );
        push_package(
            "workouts",
            if detailed_workouts.is_empty() { workouts } else { detailed_workouts },
        );
        push_package(
            "recoveries",
            if cycle_recoveries.is_empty() { recoveries } else { cycle_recoveries },
        );
        push_package("user_profile", profile);
        push_package("body_measurements", body_measurements);

        info!(packages = packages.len(), "Completed Whoop data pull");
        packages
    }

    /// Pull and push for a single linked user. Returns whether every payload
    /// pushed cleanly.
    async fn pull_and_push_for_user(self: &Arc<Self>, user_id: &str) -> bool {
        let Some(access_token) = self.get_valid_access_token(user_id).await else {
            error!(user_id, "Unable to get valid access token");
            return false;
        };

        // Size the window from the last successful run, default lookback
        // otherwise (a cleared timestamp means "look back from scratch").
        let days = match self.lock.get_last_timestamp(SLUG).await {
            Some(last) => {
                let elapsed = Utc::now().timestamp() - last;
                ((elapsed + 86_399) / 86_400).clamp(1, 30)
            }
            None => DEFAULT_LOOKBACK_DAYS,
        };

        let packages = self.pull_from_vendor(&access_token, days).await;
        if packages.is_empty() {
            info!(user_id, "No recent Whoop data");
            return true;
        }

        let mut success_count = 0usize;
        let mut error_count = 0usize;
        for mut package in packages {
            if let Some(object) = package.as_object_mut() {
                object.insert("user_id".to_string(), Value::String(user_id.to_string()));
            }
            let pushed = self
                .push
                .push_data("theta", SLUG, package, Some(Uuid::new_v4().to_string()))
                .await;
            if pushed {
                success_count += 1;
            } else {
                error_count += 1;
            }
        }

        info!(user_id, success_count, error_count, "Processed Whoop data");
        error_count == 0
    }

    fn map_fields(
        record: &Value,
        mapping: FieldMapping,
        timestamp_ms: i64,
        source: &str,
        timezone: &str,
        source_id: &str,
        records: &mut Vec<PulseRecord>,
    ) {
        for (path, indicator, converter, unit) in mapping {
            let Some(value) = json_path(record, path).and_then(Value::as_f64) else {
                continue;
            };
            records.push(PulseRecord {
                source: source.to_string(),
                indicator: indicator.to_string(),
                timestamp: timestamp_ms,
                unit: unit.to_string(),
                value: RecordValue::Number(converter(value)),
                timezone: timezone.to_string(),
                start_time: None,
                end_time: None,
                source_id: Some(source_id.to_string()),
                task_id: None,
                comment: None,
            });
        }
    }

    /// Aggregate the heart-rate zone durations of a workout into
    /// low/medium/high duration indicators (minutes).
    fn map_workout_zones(
        record: &Value,
        timestamp_ms: i64,
        source: &str,
        timezone: &str,
        source_id: &str,
        records: &mut Vec<PulseRecord>,
    ) {
        let zone = |name: &str| -> f64 {
            json_path(record, &format!("score.zone_durations.{}", name))
                .and_then(Value::as_f64)
                .unwrap_or(0.0)
        };

        let buckets = [
            ("workoutDurationLow", zone("zone_zero_milli") + zone("zone_one_milli")),
            ("workoutDurationMedium", zone("zone_two_milli") + zone("zone_three_milli")),
            ("workoutDurationHigh", zone("zone_four_milli") + zone("zone_five_milli")),
        ];

        for (indicator, total_ms) in buckets {
            if total_ms > 0.0 {
                records.push(PulseRecord {
                    source: source.to_string(),
                    indicator: indicator.to_string(),
                    timestamp: timestamp_ms,
                    unit: "min".to_string(),
                    value: RecordValue::Number(ms_to_min(total_ms)),
                    timezone: timezone.to_string(),
                    start_time: None,
                    end_time: None,
                    source_id: Some(source_id.to_string()),
                    task_id: None,
                    comment: None,
                });
            }
        }
    }
}

/// Walk a dotted field path through nested JSON objects.
fn json_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

/// Parse a vendor RFC 3339 timestamp into epoch milliseconds.
fn parse_time_ms(value: Option<&Value>) -> Option<i64> {
    let raw = value?.as_str()?;
    chrono::DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.timestamp_millis())
}

#[async_trait]
impl Provider for WhoopProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            slug: SLUG.to_string(),
            name: "Whoop".to_string(),
            description: "Whoop fitness and health data integration via OAuth2".to_string(),
            logo: Some("https://static.thetahealth.ai/res/whoop.png".to_string()),
            supported: true,
            auth_kind: AuthKind::OAuth2,
            status: ProviderStatus::Available,
            platform: Some("theta".to_string()),
            connect_info_fields: None,
        }
    }

    /// OAuth2 stage 1.
    async fn link(&self, request: &LinkRequest) -> Result<Value> {
        self.core
            .generate_authorization_url(&request.user_id, request.option_str("return_url"))
            .await
    }

    /// OAuth2 stage 2.
    async fn callback(&self, params: &CallbackParams) -> Result<Value> {
        let code = params.code.as_deref().ok_or_else(|| anyhow!("Missing code"))?;
        let state = params.state.as_deref().ok_or_else(|| anyhow!("Missing state"))?;
        self.core.handle_callback(code, state).await
    }

    async fn unlink(&self, user_id: &str) -> Result<Value> {
        self.core.vault.delete_link(user_id, SLUG).await?;
        info!(user_id, "Successfully unlinked Whoop provider");
        Ok(serde_json::json!({ "provider_slug": SLUG }))
    }

    async fn save_raw_data(&self, raw: &Value) -> Result<Vec<Value>> {
        let Some(msg_id) = raw.get("msg_id").and_then(Value::as_str) else {
            bail!("Missing msg_id in Whoop payload");
        };
        let user_id = raw.get("user_id").and_then(Value::as_str);

        match self
            .core
            .db
            .insert_raw_payload(SLUG, msg_id, user_id, user_id, raw)
            .await?
        {
            Some(_) => Ok(vec![raw.clone()]),
            None => Ok(Vec::new()),
        }
    }

    async fn format_data(&self, raw: &Value) -> Result<PulseData> {
        let request_id = Uuid::new_v4().to_string();
        let user_id = raw
            .get("user_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if user_id.is_empty() {
            error!("No user_id found in Whoop data");
            return Ok(PulseData::empty(&request_id, "", "theta"));
        }

        let data_type = raw.get("data_type").and_then(Value::as_str).unwrap_or("unknown");
        let msg_id = raw.get("msg_id").and_then(Value::as_str).unwrap_or("");
        let source = format_source_name(SLUG);
        let timezone = "UTC";

        let data: Vec<Value> = match raw.get("data") {
            Some(Value::Array(items)) => items.clone(),
            Some(item) if item.is_object() => vec![item.clone()],
            _ => Vec::new(),
        };
        if data.is_empty() {
            info!(user_id, "No data content found in Whoop payload");
            return Ok(PulseData::empty(&request_id, &user_id, "theta"));
        }

        let mut records = Vec::new();
        let mut skipped = 0usize;

        for item in &data {
            let timestamp_ms = parse_time_ms(item.get("start"))
                .or_else(|| parse_time_ms(item.get("created_at")))
                .unwrap_or_else(|| Utc::now().timestamp_millis());

            match data_type {
                "sleeps" | "cycles" | "workouts" | "recoveries" => {
                    if item.get("score_state").and_then(Value::as_str) != Some("SCORED") {
                        skipped += 1;
                        continue;
                    }
                    let mapping = match data_type {
                        "sleeps" => SLEEP_MAPPING,
                        "cycles" => CYCLE_MAPPING,
                        "workouts" => WORKOUT_MAPPING,
                        _ => RECOVERY_MAPPING,
                    };
                    if data_type == "workouts" {
                        WhoopCore::map_workout_zones(item, timestamp_ms, &source, timezone, msg_id, &mut records);
                    }
                    WhoopCore::map_fields(item, mapping, timestamp_ms, &source, timezone, msg_id, &mut records);
                }
                "body_measurements" => {
                    WhoopCore::map_fields(item, BODY_MAPPING, timestamp_ms, &source, timezone, msg_id, &mut records);
                }
                "user_profile" => {
                    // Informational only, no health records.
                }
                other => {
                    warn!(data_type = other, "Unknown Whoop data type");
                    skipped += 1;
                }
            }
        }

        info!(
            user_id,
            data_type,
            formatted = records.len(),
            skipped,
            "Formatted Whoop data"
        );

        Ok(PulseData {
            meta_info: PulseMetaInfo {
                user_id,
                request_id,
                source: "theta".to_string(),
                timezone: timezone.to_string(),
                task_id: None,
            },
            health_data: records,
        })
    }

    async fn pull_and_push(&self) -> bool {
        let credentials = match self
            .core
            .vault
            .list_credentials_for_provider(SLUG, AuthKind::OAuth2)
            .await
        {
            Ok(credentials) => credentials,
            Err(e) => {
                error!(error = %e, "Failed to list Whoop credentials");
                return false;
            }
        };

        if credentials.is_empty() {
            info!("No users found for Whoop provider");
            return true;
        }

        let mut success_count = 0usize;
        let mut error_count = 0usize;
        for credential in &credentials {
            if self.core.pull_and_push_for_user(&credential.user_id).await {
                success_count += 1;
            } else {
                error_count += 1;
            }
        }

        info!(success_count, error_count, "Whoop pull and push completed");

        self.core.lock.set_last_timestamp(SLUG, Utc::now().timestamp()).await;
        self.core
            .lock
            .save_stats(
                SLUG,
                &serde_json::json!({
                    "users": credentials.len(),
                    "success": success_count,
                    "errors": error_count,
                }),
            )
            .await;

        error_count == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::MemoryKv;
    use crate::vault::crypto::CredentialCipher;

    fn test_provider() -> (WhoopProvider, Arc<MemoryKv>) {
        let db = Database::open_in_memory().unwrap();
        let vault = CredentialVault::new(db.connection(), CredentialCipher::new([1u8; 32]));
        let states = Arc::new(MemoryKv::new());
        let lock = Arc::new(PullLockManager::new(None));
        let push = Arc::new(PushService::new("http://127.0.0.1:0".to_string()));

        let config = WhoopConfig {
            client_id: Some("client-123".to_string()),
            client_secret: Some("secret-456".to_string()),
            redirect_url: Some("https://hub.example/api/v1/pulse/theta/theta_whoop/callback".to_string()),
            auth_url: "https://api.prod.whoop.com/oauth/oauth2/auth".to_string(),
            token_url: "https://api.prod.whoop.com/oauth/oauth2/token".to_string(),
            api_base_url: "https://api.prod.whoop.com/developer/v2".to_string(),
            scopes: "offline read:recovery".to_string(),
        };

        let provider = WhoopProvider::create(
            &config,
            Duration::from_secs(900),
            Duration::from_secs(30),
            vault,
            db,
            states.clone() as Arc<dyn KvStore>,
            push,
            lock,
        )
        .unwrap();
        (provider, states)
    }

    #[test]
    fn test_factory_skips_without_config() {
        let db = Database::open_in_memory().unwrap();
        let vault = CredentialVault::new(db.connection(), CredentialCipher::new([1u8; 32]));
        let provider = WhoopProvider::create(
            &WhoopConfig::default(),
            Duration::from_secs(900),
            Duration::from_secs(30),
            vault,
            db,
            Arc::new(MemoryKv::new()),
            Arc::new(PushService::new(String::new())),
            Arc::new(PullLockManager::new(None)),
        );
        assert!(provider.is_none());
    }

    #[tokio::test]
    async fn test_link_returns_authorization_url_and_stores_state() {
        let (provider, states) = test_provider();
        let request = LinkRequest {
            user_id: "U".to_string(),
            provider_slug: SLUG.to_string(),
            auth_kind: AuthKind::OAuth2,
            credentials: serde_json::json!({}),
            options: serde_json::json!({"return_url": "https://app.example/done"}),
            platform: "theta".to_string(),
        };

        let result = provider.link(&request).await.unwrap();
        let url = result["link_web_url"].as_str().unwrap();
        assert!(url.starts_with("https://api.prod.whoop.com/oauth/oauth2/auth?"));
        assert!(url.contains("client_id=client-123"));
        assert!(url.contains("state="));

        // The state record must be parked for the callback.
        let state = url.split("state=").nth(1).unwrap();
        let pending = states
            .get(&format!("oauth2:state:{}", state))
            .await
            .unwrap()
            .unwrap();
        let pending: Value = serde_json::from_str(&pending).unwrap();
        assert_eq!(pending["user_id"], "U");
        assert_eq!(pending["return_url"], "https://app.example/done");
    }

    #[tokio::test]
    async fn test_callback_rejects_unknown_state() {
        let (provider, _) = test_provider();
        let result = provider
            .callback(&CallbackParams {
                code: Some("C".to_string()),
                state: Some("bogus".to_string()),
                ..Default::default()
            })
            .await;
        assert!(result.unwrap_err().to_string().contains("state"));
    }

    fn sleep_payload() -> Value {
        serde_json::json!({
            "user_id": "U",
            "msg_id": "m1",
            "data_type": "sleeps",
            "data": [{
                "start": "2023-11-14T22:13:20Z",
                "score_state": "SCORED",
                "score": {
                    "stage_summary": {
                        "total_in_bed_time_milli": 28_800_000,
                        "total_rem_sleep_time_milli": 5_400_000,
                        "disturbance_count": 3
                    },
                    "sleep_efficiency_percentage": 92.5,
                    "respiratory_rate": 14.2
                }
            }]
        })
    }

    #[tokio::test]
    async fn test_format_sleep_data_walks_mapping_table() {
        let (provider, _) = test_provider();
        let data = provider.format_data(&sleep_payload()).await.unwrap();

        let in_bed = data
            .health_data
            .iter()
            .find(|r| r.indicator == "sleepInBed")
            .unwrap();
        assert_eq!(in_bed.value, RecordValue::Number(480.0));
        assert_eq!(in_bed.unit, "min");
        assert_eq!(in_bed.timestamp, 1_700_000_000_000);
        assert_eq!(in_bed.source, "theta.whoop");
        assert_eq!(in_bed.source_id.as_deref(), Some("m1"));

        let efficiency = data
            .health_data
            .iter()
            .find(|r| r.indicator == "sleepEfficiency")
            .unwrap();
        assert_eq!(efficiency.value, RecordValue::Number(92.5));
    }

    #[tokio::test]
    async fn test_unscored_records_are_skipped() {
        let (provider, _) = test_provider();
        let mut payload = sleep_payload();
        payload["data"][0]["score_state"] = Value::String("PENDING".to_string());

        let data = provider.format_data(&payload).await.unwrap();
        assert!(data.health_data.is_empty());
    }

    #[tokio::test]
    async fn test_cycle_kilojoule_conversion() {
        let (provider, _) = test_provider();
        let payload = serde_json::json!({
            "user_id": "U",
            "msg_id": "m2",
            "data_type": "cycles",
            "data": [{
                "start": "2023-11-14T08:00:00Z",
                "score_state": "SCORED",
                "score": {"kilojoule": 418.4, "strain": 12.3}
            }]
        });

        let data = provider.format_data(&payload).await.unwrap();
        let calories = data
            .health_data
            .iter()
            .find(|r| r.indicator == "caloriesActive")
            .unwrap();
        assert!((calories.value.as_f64().unwrap() - 100.0).abs() < 1e-9);
        assert_eq!(calories.unit, "kcal");
    }

    #[tokio::test]
    async fn test_workout_zone_aggregation() {
        let (provider, _) = test_provider();
        let payload = serde_json::json!({
            "user_id": "U",
            "msg_id": "m3",
            "data_type": "workouts",
            "data": [{
                "start": "2023-11-14T18:00:00Z",
                "score_state": "SCORED",
                "score": {
                    "zone_durations": {
                        "zone_zero_milli": 60_000,
                        "zone_one_milli": 120_000,
                        "zone_four_milli": 300_000
                    }
                }
            }]
        });

        let data = provider.format_data(&payload).await.unwrap();
        let low = data
            .health_data
            .iter()
            .find(|r| r.indicator == "workoutDurationLow")
            .unwrap();
        assert_eq!(low.value, RecordValue::Number(3.0));

        let high = data
            .health_data
            .iter()
            .find(|r| r.indicator == "workoutDurationHigh")
            .unwrap();
        assert_eq!(high.value, RecordValue::Number(5.0));

        // No medium-zone time recorded.
        assert!(!data.health_data.iter().any(|r| r.indicator == "workoutDurationMedium"));
    }

    #[tokio::test]
    async fn test_body_measurements_direct_fields() {
        let (provider, _) = test_provider();
        let payload = serde_json::json!({
            "user_id": "U",
            "msg_id": "m4",
            "data_type": "body_measurements",
            "data": [{"height_meter": 1.8, "weight_kilogram": 75.5, "max_heart_rate": 195}]
        });

        let data = provider.format_data(&payload).await.unwrap();
        assert_eq!(data.health_data.len(), 3);
        let weight = data.health_data.iter().find(|r| r.indicator == "weight").unwrap();
        assert_eq!(weight.value, RecordValue::Number(75.5));
    }

    #[tokio::test]
    async fn test_save_raw_data_dedupes_on_msg_id() {
        let (provider, _) = test_provider();
        let payload = sleep_payload();

        assert_eq!(provider.save_raw_data(&payload).await.unwrap().len(), 1);
        assert!(provider.save_raw_data(&payload).await.unwrap().is_empty());
    }

    #[test]
    fn test_json_path_walks_nested_objects() {
        let value = serde_json::json!({"score": {"stage_summary": {"disturbance_count": 3}}});
        assert_eq!(
            json_path(&value, "score.stage_summary.disturbance_count").and_then(Value::as_i64),
            Some(3)
        );
        assert!(json_path(&value, "score.missing.leaf").is_none());
    }

    #[test]
    fn test_parse_time_ms() {
        let value = Value::String("2023-11-14T22:13:20Z".to_string());
        assert_eq!(parse_time_ms(Some(&value)), Some(1_700_000_000_000));
        assert_eq!(parse_time_ms(Some(&Value::Null)), None);
        assert_eq!(parse_time_ms(None), None);
    }
}
