//! Canonical in-flight record types.
//!
//! This is the JSON contract every provider's `format_data` emits and the
//! normalization pipeline consumes (field names match the wire format
//! exactly). Records are not persisted in this shape; the pipeline splits
//! them into series and summary rows.

use serde::{Deserialize, Serialize};

/// A record value: numeric for measurements, a string label for categorical
/// data (e.g. reproductive health observations).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordValue {
    Number(f64),
    Text(String),
}

impl RecordValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            RecordValue::Number(n) => Some(*n),
            RecordValue::Text(s) => s.parse().ok(),
        }
    }
}

impl std::fmt::Display for RecordValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordValue::Number(n) => write!(f, "{}", n),
            RecordValue::Text(s) => f.write_str(s),
        }
    }
}

/// Batch metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PulseMetaInfo {
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(rename = "requestId")]
    pub request_id: String,
    pub source: String,
    pub timezone: String,
    #[serde(rename = "taskId", skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

/// One canonical health record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PulseRecord {
    /// Originating source, `platform.provider` style
    pub source: String,
    /// Indicator identifier from the catalog
    #[serde(rename = "type")]
    pub indicator: String,
    /// Epoch milliseconds
    pub timestamp: i64,
    pub unit: String,
    pub value: RecordValue,
    pub timezone: String,
    #[serde(rename = "startTime", skip_serializing_if = "Option::is_none")]
    pub start_time: Option<i64>,
    #[serde(rename = "endTime", skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// Normalized output of a provider's `format_data`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PulseData {
    #[serde(rename = "metaInfo")]
    pub meta_info: PulseMetaInfo,
    #[serde(rename = "healthData")]
    pub health_data: Vec<PulseRecord>,
}

impl PulseData {
    /// Empty batch for a user, used when a payload yields nothing.
    pub fn empty(request_id: &str, user_id: &str, source: &str) -> Self {
        Self {
            meta_info: PulseMetaInfo {
                user_id: user_id.to_string(),
                request_id: request_id.to_string(),
                source: source.to_string(),
                timezone: "UTC".to_string(),
                task_id: None,
            },
            health_data: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_field_names() {
        let data = PulseData {
            meta_info: PulseMetaInfo {
                user_id: "u1".to_string(),
                request_id: "r1".to_string(),
                source: "theta_whoop".to_string(),
                timezone: "UTC".to_string(),
                task_id: None,
            },
            health_data: vec![PulseRecord {
                source: "theta.whoop".to_string(),
                indicator: "heartRate".to_string(),
                timestamp: 1_700_000_000_000,
                unit: "bpm".to_string(),
                value: RecordValue::Number(72.0),
                timezone: "UTC".to_string(),
                start_time: None,
                end_time: None,
                source_id: None,
                task_id: None,
                comment: None,
            }],
        };

        let json = serde_json::to_value(&data).unwrap();
        assert_eq!(json["metaInfo"]["userId"], "u1");
        assert_eq!(json["healthData"][0]["type"], "heartRate");
        assert_eq!(json["healthData"][0]["value"], 72.0);
        assert!(json["healthData"][0].get("startTime").is_none());
    }

    #[test]
    fn test_value_accepts_labels() {
        let record: RecordValue = serde_json::from_str("\"positive\"").unwrap();
        assert_eq!(record, RecordValue::Text("positive".to_string()));
        assert_eq!(record.as_f64(), None);

        let number: RecordValue = serde_json::from_str("72").unwrap();
        assert_eq!(number.as_f64(), Some(72.0));
    }
}
