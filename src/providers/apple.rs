//! Apple Health provider.
//!
//! Ingests user-pushed Apple Health exports. Each record carries a mobile
//! health type (`HEART_RATE`, `SLEEP_DEEP`, ...) that is mapped onto a
//! catalog indicator; unknown types are logged and dropped. Sleep-stage
//! records synthesize an additional `totalSleep` record, and cumulative
//! statistics (steps, distance) are remapped to their sampling-duration
//! indicators.

use anyhow::{bail, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use tracing::{info, warn};
use uuid::Uuid;

use super::{LinkRequest, Provider, ProviderInfo, ProviderStatus};
use crate::pipeline::records::{PulseData, PulseMetaInfo, PulseRecord, RecordValue};
use crate::store::Database;
use crate::vault::AuthKind;

/// Mobile export type → catalog indicator.
static TYPE_MAPPING: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        // Vital signs
        ("HEART_RATE", "heartRate"),
        ("RESPIRATORY_RATE", "respiratoryRate"),
        ("BODY_TEMPERATURE", "bodyTemperature"),
        ("BLOOD_GLUCOSE", "bloodGlucose"),
        ("BLOOD_OXYGEN", "bloodOxygen"),
        ("BLOOD_PRESSURE_SYSTOLIC", "bloodPressureSystolic"),
        ("BLOOD_PRESSURE_DIASTOLIC", "bloodPressureDiastolic"),
        ("WALKING_HEART_RATE", "walkingHeartRate"),
        ("RESTING_HEART_RATE", "restingHeartRate"),
        ("HEART_RATE_VARIABILITY_SDNN", "hrv"),
        // Activity and fitness
        ("STEPS", "steps"),
        ("CYCLING_SPEED", "cyclingSpeed"),
        ("WALKING_SPEED", "walkingSpeed"),
        ("FLIGHTS_CLIMBED", "floorsClimbed"),
        ("DISTANCE_WALKING_RUNNING", "distance"),
        ("EXERCISE_TIME", "activeTime"),
        ("DISTANCE_CYCLING", "cyclingDistance"),
        ("VO2_MAX", "vo2Max"),
        ("HEART_RATE_RECOVERY_ONE_MINUTE", "recoveryTime"),
        // Body measurements
        ("HEIGHT", "height"),
        ("WEIGHT", "weight"),
        ("BODY_FAT_PERCENTAGE", "bodyFatPercentage"),
        ("BODY_MASS_INDEX", "bmi"),
        ("WAIST_CIRCUMFERENCE", "waistCircumference"),
        ("SLEEPING_WRIST_TEMPERATURE", "wristTemperature"),
        // Nutrition
        ("DIETARY_PROTEIN_CONSUMED", "dietaryProtein"),
        ("DIETARY_CARBS_CONSUMED", "dietaryCarbs"),
        ("DIETARY_FATS_CONSUMED", "dietaryFats"),
        ("DIETARY_ENERGY_CONSUMED", "dietaryEnergy"),
        ("DIETARY_WATER", "dietaryWater"),
        // Sleep
        ("SLEEP_IN_BED", "sleepInBed"),
        ("SLEEP_ASLEEP", "sleepAsleepUnspecified"),
        ("SLEEP_AWAKE", "sleepAwake"),
        ("SLEEP_DEEP", "sleepAsleepDeep"),
        ("SLEEP_LIGHT", "sleepAsleepCore"),
        ("SLEEP_REM", "sleepAsleepRem"),
        // Other
        ("UV_EXPOSURE", "uvExposure"),
        // Body scale
        ("BASAL_METABOLIC_RATE", "bmr"),
        ("BASAL_ENERGY_BURNED", "caloriesBasal"),
        ("BODY_WATER", "bodyWaterPercentage"),
        ("BODY_AGE", "bodyAge"),
        ("BODY_MUSCLE", "musclePercentage"),
        ("BODY_BONE", "boneMass"),
        ("BODY_SUB_FAT", "subcutaneousFat"),
        ("BODY_VIS_FAT", "visceralFat"),
        ("BODY_FAT_FREE_WEIGHT", "fatFreeWeight"),
        ("BODY_SINEW", "bodySinew"),
        ("BODY_PROTEIN", "proteinPercentage"),
        // Reproductive health
        ("BASAL_BODY_TEMPERATURE", "reproductiveBasalBodyTemperature"),
        ("CERVICAL_MUCUS_QUALITY", "reproductiveCervicalMucusQuality"),
        ("CONTRACEPTIVE", "reproductiveContraceptive"),
        ("INTERMENTSTRUAL_BLEEDING", "reproductiveIntermenstrualBleeding"),
        ("LACTATION", "reproductiveLactation"),
        ("MENSTRUATION_FLOW", "reproductiveMenstruationFlow"),
        ("OVULATION_TEST_RESULT", "reproductiveOvulationTestResult"),
        ("PREGNANCY", "reproductivePregnancy"),
        ("PREGNANCY_TEST_RESULT", "reproductivePregnancyTestResult"),
        ("PROGESTERONE_TEST_RESULT", "reproductiveProgesteroneTestResult"),
        ("SEXUAL_ACTIVITY", "reproductiveSexualActivity"),
    ])
});

/// Cumulative statistics that are reported as sampling durations:
/// the record value becomes the sample's time span.
static DURATION_MAPPING: Lazy<HashMap<&'static str, (&'static str, &'static str)>> = Lazy::new(|| {
    HashMap::from([
        ("steps", ("stepDuration", "ms")),
        ("floorsClimbed", ("floorsClimbedDuration", "ms")),
        ("distance", ("walkingRunningDuration", "ms")),
        ("cyclingDistance", ("cyclingDuration", "ms")),
    ])
});

const SLEEP_STAGE_INDICATORS: &[&str] = &[
    "sleepAsleepDeep",
    "sleepAsleepCore",
    "sleepAsleepRem",
    "sleepAsleepUnspecified",
];

#[derive(Debug, Deserialize)]
struct AppleHealthRecord {
    uuid: Option<String>,
    #[serde(rename = "type")]
    record_type: String,
    #[serde(rename = "dateFrom")]
    date_from: Option<i64>,
    #[serde(rename = "dateTo")]
    date_to: Option<i64>,
    #[serde(default = "default_timezone")]
    timezone: String,
    #[serde(default)]
    value: Value,
    #[serde(rename = "unitSymbol")]
    unit_symbol: Option<String>,
    #[serde(rename = "sourceId")]
    source_id: Option<String>,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

#[derive(Debug, Deserialize)]
struct AppleMetaInfo {
    #[serde(default = "default_timezone")]
    timezone: String,
    #[serde(rename = "taskId")]
    task_id: Option<String>,
    #[serde(default)]
    directly_from_watch: bool,
}

impl Default for AppleMetaInfo {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            task_id: None,
            directly_from_watch: false,
        }
    }
}

pub struct AppleHealthProvider {
    db: Database,
}

impl AppleHealthProvider {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    fn prepare_record(
        record: &AppleHealthRecord,
        source: &str,
        task_id: Option<&str>,
    ) -> Option<PulseRecord> {
        let Some(&indicator) = TYPE_MAPPING.get(record.record_type.as_str()) else {
            warn!(
                health_type = record.record_type,
                uuid = record.uuid.as_deref().unwrap_or(""),
                "Unmapped health type, record discarded"
            );
            return None;
        };

        let mut timezone = record.timezone.clone();
        if timezone.len() > 20 {
            timezone = "UTC".to_string();
        }

        let start_ms = record.date_from.or(record.date_to);
        let end_ms = record.date_to.or(record.date_from);
        let (start_ms, end_ms) = (start_ms?, end_ms?);

        let mut indicator = indicator.to_string();
        let mut unit = record.unit_symbol.clone().unwrap_or_default();
        let mut value = extract_value(&record.value, &indicator);

        // Cumulative statistics report their sampling duration instead.
        if record.uuid.is_some() {
            if let Some(&(duration_indicator, duration_unit)) = DURATION_MAPPING.get(indicator.as_str()) {
                indicator = duration_indicator.to_string();
                unit = duration_unit.to_string();
                value = RecordValue::Number((end_ms - start_ms) as f64);
            }
        }

        Some(PulseRecord {
            source: source.to_string(),
            indicator,
            timestamp: start_ms,
            unit,
            value,
            timezone,
            start_time: Some(start_ms),
            end_time: Some(end_ms),
            source_id: Some(record.source_id.clone().unwrap_or_else(|| "unknown".to_string())),
            task_id: task_id.map(String::from),
            comment: None,
        })
    }
}

/// Pull the numeric value out of the export's value object, decoding the
/// categorical reproductive observations into their string labels.
fn extract_value(value: &Value, indicator: &str) -> RecordValue {
    let numeric = value.get("numericValue").and_then(Value::as_f64);

    let label = |options: &[(i64, &str)], fallback: &str| -> RecordValue {
        let key = value.get("numericValue").and_then(Value::as_i64).unwrap_or(0);
        let text = options
            .iter()
            .find(|(code, _)| *code == key)
            .map(|(_, label)| *label)
            .unwrap_or(fallback);
        RecordValue::Text(text.to_string())
    };

    match indicator {
        "reproductiveCervicalMucusQuality" => label(
            &[(1, "dry"), (2, "sticky"), (3, "creamy"), (4, "water"), (5, "eggWhite")],
            "unspecified",
        ),
        "reproductiveContraceptive" => label(
            &[
                (1, "unspecified"),
                (2, "implant"),
                (3, "injection"),
                (4, "intrauterineDevice"),
                (5, "intravaginalRing"),
                (6, "oral"),
                (7, "patch"),
            ],
            "unspecified",
        ),
        "reproductiveMenstruationFlow" => RecordValue::Text(
            value
                .get("flow")
                .and_then(Value::as_str)
                .unwrap_or("unspecified")
                .to_string(),
        ),
        "reproductiveOvulationTestResult" => label(
            &[(1, "negative"), (2, "positive"), (3, "indeterminate"), (4, "estrogenSurge")],
            "indeterminate",
        ),
        "reproductivePregnancyTestResult" | "reproductiveProgesteroneTestResult" => {
            label(&[(1, "negative"), (2, "positive"), (3, "indeterminate")], "indeterminate")
        }
        "reproductiveSexualActivity" => {
            let protected = value.get("isProtectionUsed").and_then(Value::as_bool).unwrap_or(false);
            RecordValue::Text(
                if protected {
                    "True, With Protection"
                } else {
                    "True, Without Protection"
                }
                .to_string(),
            )
        }
        "reproductiveIntermenstrualBleeding" | "reproductiveLactation" | "reproductivePregnancy" => {
            RecordValue::Text("True".to_string())
        }
        _ => RecordValue::Number(numeric.unwrap_or(1.0)),
    }
}

#[async_trait]
impl Provider for AppleHealthProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            slug: "apple_health".to_string(),
            name: "Apple Health".to_string(),
            description: "Import health data from Apple Health export files".to_string(),
            logo: Some("https://static.thetahealth.ai/res/applehealth.png".to_string()),
            supported: true,
            auth_kind: AuthKind::None,
            status: ProviderStatus::Connected,
            platform: Some("apple".to_string()),
            connect_info_fields: None,
        }
    }

    async fn link(&self, request: &LinkRequest) -> Result<Value> {
        info!(user_id = request.user_id, "Apple Health requires no linking");
        Ok(serde_json::json!({ "provider_slug": self.info().slug }))
    }

    async fn unlink(&self, user_id: &str) -> Result<Value> {
        info!(user_id, "Apple Health requires no unlinking");
        Ok(serde_json::json!({}))
    }

    fn register_pull_task(&self) -> bool {
        // Data arrives by user push; there is nothing to pull.
        false
    }

    async fn save_raw_data(&self, raw: &Value) -> Result<Vec<Value>> {
        let Some(msg_id) = raw.get("msg_id").and_then(Value::as_str) else {
            bail!("Missing msg_id in apple payload");
        };
        let user_id = raw.get("user_id").and_then(Value::as_str);

        match self
            .db
            .insert_raw_payload("apple_health", msg_id, user_id, user_id, raw)
            .await?
        {
            Some(_) => Ok(vec![raw.clone()]),
            None => Ok(Vec::new()),
        }
    }

    async fn format_data(&self, raw: &Value) -> Result<PulseData> {
        let user_id = raw
            .get("user_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if user_id.is_empty() {
            bail!("Missing user_id in raw data");
        }

        let meta: AppleMetaInfo = raw
            .get("metaInfo")
            .filter(|v| !v.is_null())
            .cloned()
            .map(serde_json::from_value)
            .transpose()?
            .unwrap_or_default();

        let source = if meta.directly_from_watch {
            "apple_health_watch"
        } else {
            "apple_health"
        };

        let health_data = raw
            .get("healthData")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let total = health_data.len();

        let mut records = Vec::with_capacity(total);
        for entry in &health_data {
            let record: AppleHealthRecord = match serde_json::from_value(entry.clone()) {
                Ok(record) => record,
                Err(e) => {
                    warn!(error = %e, "Invalid record format, skipping");
                    continue;
                }
            };

            let Some(prepared) = Self::prepare_record(&record, source, meta.task_id.as_deref()) else {
                continue;
            };

            // Sleep stages also contribute to the user's total sleep.
            if SLEEP_STAGE_INDICATORS.contains(&prepared.indicator.as_str()) {
                let mut total_sleep = prepared.clone();
                total_sleep.indicator = "totalSleep".to_string();
                records.push(prepared);
                records.push(total_sleep);
            } else {
                records.push(prepared);
            }
        }

        info!(user_id, total, valid = records.len(), "Formatted Apple Health records");

        Ok(PulseData {
            meta_info: PulseMetaInfo {
                user_id,
                request_id: raw
                    .get("request_id")
                    .and_then(Value::as_str)
                    .map(String::from)
                    .unwrap_or_else(|| Uuid::new_v4().to_string()),
                source: source.to_string(),
                timezone: meta.timezone,
                task_id: meta.task_id,
            },
            health_data: records,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> AppleHealthProvider {
        AppleHealthProvider::new(Database::open_in_memory().unwrap())
    }

    fn heart_rate_payload() -> Value {
        serde_json::json!({
            "user_id": "u1",
            "msg_id": "m1",
            "metaInfo": {"timezone": "UTC"},
            "healthData": [{
                "uuid": "u1",
                "type": "HEART_RATE",
                "dateFrom": 1_700_000_000_000i64,
                "dateTo": 1_700_000_000_000i64,
                "value": {"numericValue": 72},
                "unitSymbol": "bpm"
            }]
        })
    }

    #[tokio::test]
    async fn test_heart_rate_maps_to_catalog_indicator() {
        let data = provider().format_data(&heart_rate_payload()).await.unwrap();

        assert_eq!(data.meta_info.user_id, "u1");
        assert_eq!(data.health_data.len(), 1);
        let record = &data.health_data[0];
        assert_eq!(record.indicator, "heartRate");
        assert_eq!(record.timestamp, 1_700_000_000_000);
        assert_eq!(record.unit, "bpm");
        assert_eq!(record.value, RecordValue::Number(72.0));
        assert_eq!(record.source, "apple_health");
    }

    #[tokio::test]
    async fn test_unknown_type_is_dropped() {
        let mut payload = heart_rate_payload();
        payload["healthData"][0]["type"] = Value::String("UNKNOWN_METRIC".to_string());

        let data = provider().format_data(&payload).await.unwrap();
        assert!(data.health_data.is_empty());
    }

    #[tokio::test]
    async fn test_sleep_stage_synthesizes_total_sleep() {
        let mut payload = heart_rate_payload();
        payload["healthData"][0]["type"] = Value::String("SLEEP_DEEP".to_string());
        payload["healthData"][0]["value"] = serde_json::json!({"numericValue": 95});

        let data = provider().format_data(&payload).await.unwrap();
        let indicators: Vec<&str> = data.health_data.iter().map(|r| r.indicator.as_str()).collect();
        assert_eq!(indicators, vec!["sleepAsleepDeep", "totalSleep"]);
        assert_eq!(data.health_data[0].value, data.health_data[1].value);
    }

    #[tokio::test]
    async fn test_steps_remapped_to_sampling_duration() {
        let mut payload = heart_rate_payload();
        payload["healthData"][0]["type"] = Value::String("STEPS".to_string());
        payload["healthData"][0]["dateTo"] = Value::from(1_700_000_060_000i64);
        payload["healthData"][0]["value"] = serde_json::json!({"numericValue": 100});

        let data = provider().format_data(&payload).await.unwrap();
        let record = &data.health_data[0];
        assert_eq!(record.indicator, "stepDuration");
        assert_eq!(record.unit, "ms");
        assert_eq!(record.value, RecordValue::Number(60_000.0));
    }

    #[tokio::test]
    async fn test_reproductive_label_decoding() {
        let mut payload = heart_rate_payload();
        payload["healthData"][0]["type"] = Value::String("OVULATION_TEST_RESULT".to_string());
        payload["healthData"][0]["value"] = serde_json::json!({"numericValue": 2});

        let data = provider().format_data(&payload).await.unwrap();
        assert_eq!(data.health_data[0].value, RecordValue::Text("positive".to_string()));
    }

    #[tokio::test]
    async fn test_watch_source_switch() {
        let mut payload = heart_rate_payload();
        payload["metaInfo"]["directly_from_watch"] = Value::Bool(true);

        let data = provider().format_data(&payload).await.unwrap();
        assert_eq!(data.meta_info.source, "apple_health_watch");
        assert_eq!(data.health_data[0].source, "apple_health_watch");
    }

    #[tokio::test]
    async fn test_save_raw_data_dedupes_on_msg_id() {
        let provider = provider();
        let payload = heart_rate_payload();

        let first = provider.save_raw_data(&payload).await.unwrap();
        assert_eq!(first.len(), 1);

        let second = provider.save_raw_data(&payload).await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn test_missing_user_id_fails() {
        let mut payload = heart_rate_payload();
        payload.as_object_mut().unwrap().remove("user_id");
        assert!(provider().format_data(&payload).await.is_err());
    }

    #[tokio::test]
    async fn test_overlong_timezone_falls_back_to_utc() {
        let mut payload = heart_rate_payload();
        payload["healthData"][0]["timezone"] =
            Value::String("Definitely/Not_A_Real_Timezone_Name".to_string());

        let data = provider().format_data(&payload).await.unwrap();
        assert_eq!(data.health_data[0].timezone, "UTC");
    }
}
