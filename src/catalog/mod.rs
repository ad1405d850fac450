//! Canonical indicator catalog.
//!
//! The catalog is the single authority for indicator identity, categories,
//! standard units, series/summary classification, unit conversion, and the
//! summary-interval inference used by the normalization pipeline. It is built
//! once at first use and is read-only afterwards, so concurrent reads need no
//! synchronization.

pub mod units;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

/// Indicator category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Vital,
    Activity,
    Body,
    Sleep,
    Metabolic,
    Performance,
    Nutrition,
    Reproductive,
    Other,
}

/// Whether an indicator is stored as point samples, interval aggregates, or both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndicatorKind {
    Series,
    Summary,
    Both,
}

/// A catalog entry. Identifiers are immutable once emitted into storage;
/// renames happen only via explicit migration.
#[derive(Debug, Clone, Serialize)]
pub struct IndicatorDef {
    pub identifier: &'static str,
    pub category: Category,
    pub standard_unit: &'static str,
    pub kind: IndicatorKind,
}

/// Interval shape inferred from an indicator identifier when a record carries
/// only a point timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummaryWindow {
    Daily,
    Weekly,
    Hourly,
    Point,
}

use Category::*;
use IndicatorKind::*;

const INDICATORS: &[IndicatorDef] = &[
    // Vitals
    IndicatorDef { identifier: "heartRate", category: Vital, standard_unit: "bpm", kind: Series },
    IndicatorDef { identifier: "restingHeartRate", category: Vital, standard_unit: "bpm", kind: Series },
    IndicatorDef { identifier: "walkingHeartRate", category: Vital, standard_unit: "bpm", kind: Series },
    IndicatorDef { identifier: "heartRateMax", category: Vital, standard_unit: "bpm", kind: Series },
    IndicatorDef { identifier: "maxHeartRateProfile", category: Vital, standard_unit: "bpm", kind: Series },
    IndicatorDef { identifier: "hrv", category: Vital, standard_unit: "ms", kind: Series },
    IndicatorDef { identifier: "hrvRmssd", category: Vital, standard_unit: "ms", kind: Series },
    IndicatorDef { identifier: "respiratoryRate", category: Vital, standard_unit: "count/min", kind: Series },
    IndicatorDef { identifier: "bodyTemperature", category: Vital, standard_unit: "C", kind: Series },
    IndicatorDef { identifier: "skinTemperature", category: Vital, standard_unit: "C", kind: Series },
    IndicatorDef { identifier: "wristTemperature", category: Vital, standard_unit: "C", kind: Series },
    IndicatorDef { identifier: "bloodOxygen", category: Vital, standard_unit: "%", kind: Series },
    IndicatorDef { identifier: "bloodPressureSystolic", category: Vital, standard_unit: "mmHg", kind: Series },
    IndicatorDef { identifier: "bloodPressureDiastolic", category: Vital, standard_unit: "mmHg", kind: Series },
    // Activity
    IndicatorDef { identifier: "steps", category: Activity, standard_unit: "count", kind: Series },
    IndicatorDef { identifier: "stepDuration", category: Activity, standard_unit: "ms", kind: Series },
    IndicatorDef { identifier: "floorsClimbed", category: Activity, standard_unit: "count", kind: Series },
    IndicatorDef { identifier: "floorsClimbedDuration", category: Activity, standard_unit: "ms", kind: Series },
    IndicatorDef { identifier: "distance", category: Activity, standard_unit: "m", kind: Series },
    IndicatorDef { identifier: "walkingRunningDuration", category: Activity, standard_unit: "ms", kind: Series },
    IndicatorDef { identifier: "cyclingDistance", category: Activity, standard_unit: "m", kind: Series },
    IndicatorDef { identifier: "cyclingDuration", category: Activity, standard_unit: "ms", kind: Series },
    IndicatorDef { identifier: "cyclingSpeed", category: Activity, standard_unit: "km/h", kind: Series },
    IndicatorDef { identifier: "walkingSpeed", category: Activity, standard_unit: "km/h", kind: Series },
    IndicatorDef { identifier: "activeTime", category: Activity, standard_unit: "min", kind: Series },
    IndicatorDef { identifier: "altitudeGain", category: Activity, standard_unit: "m", kind: Series },
    IndicatorDef { identifier: "altitudeChange", category: Activity, standard_unit: "m", kind: Series },
    IndicatorDef { identifier: "workoutDurationLow", category: Activity, standard_unit: "min", kind: Both },
    IndicatorDef { identifier: "workoutDurationMedium", category: Activity, standard_unit: "min", kind: Both },
    IndicatorDef { identifier: "workoutDurationHigh", category: Activity, standard_unit: "min", kind: Both },
    IndicatorDef { identifier: "dailySteps", category: Activity, standard_unit: "count", kind: Summary },
    IndicatorDef { identifier: "dailyActiveTime", category: Activity, standard_unit: "min", kind: Summary },
    IndicatorDef { identifier: "dailyDistance", category: Activity, standard_unit: "m", kind: Summary },
    IndicatorDef { identifier: "weeklyWorkoutTime", category: Activity, standard_unit: "min", kind: Summary },
    IndicatorDef { identifier: "hourlyHeartRateAvg", category: Vital, standard_unit: "bpm", kind: Summary },
    // Body
    IndicatorDef { identifier: "height", category: Body, standard_unit: "m", kind: Series },
    IndicatorDef { identifier: "weight", category: Body, standard_unit: "kg", kind: Series },
    IndicatorDef { identifier: "bmi", category: Body, standard_unit: "count", kind: Series },
    IndicatorDef { identifier: "bodyFatPercentage", category: Body, standard_unit: "%", kind: Series },
    IndicatorDef { identifier: "waistCircumference", category: Body, standard_unit: "cm", kind: Series },
    IndicatorDef { identifier: "bodyWaterPercentage", category: Body, standard_unit: "%", kind: Series },
    IndicatorDef { identifier: "bodyAge", category: Body, standard_unit: "count", kind: Series },
    IndicatorDef { identifier: "musclePercentage", category: Body, standard_unit: "%", kind: Series },
    IndicatorDef { identifier: "boneMass", category: Body, standard_unit: "kg", kind: Series },
    IndicatorDef { identifier: "subcutaneousFat", category: Body, standard_unit: "%", kind: Series },
    IndicatorDef { identifier: "visceralFat", category: Body, standard_unit: "count", kind: Series },
    IndicatorDef { identifier: "fatFreeWeight", category: Body, standard_unit: "kg", kind: Series },
    IndicatorDef { identifier: "bodySinew", category: Body, standard_unit: "kg", kind: Series },
    IndicatorDef { identifier: "proteinPercentage", category: Body, standard_unit: "%", kind: Series },
    // Sleep (interval records; stored to both tables)
    IndicatorDef { identifier: "sleepInBed", category: Sleep, standard_unit: "min", kind: Both },
    IndicatorDef { identifier: "sleepAwake", category: Sleep, standard_unit: "min", kind: Both },
    IndicatorDef { identifier: "sleepAsleepDeep", category: Sleep, standard_unit: "min", kind: Both },
    IndicatorDef { identifier: "sleepAsleepCore", category: Sleep, standard_unit: "min", kind: Both },
    IndicatorDef { identifier: "sleepAsleepRem", category: Sleep, standard_unit: "min", kind: Both },
    IndicatorDef { identifier: "sleepAsleepUnspecified", category: Sleep, standard_unit: "min", kind: Both },
    IndicatorDef { identifier: "totalSleep", category: Sleep, standard_unit: "min", kind: Both },
    IndicatorDef { identifier: "sleepEfficiency", category: Sleep, standard_unit: "%", kind: Series },
    IndicatorDef { identifier: "sleepPerformance", category: Sleep, standard_unit: "%", kind: Series },
    IndicatorDef { identifier: "sleepConsistency", category: Sleep, standard_unit: "%", kind: Series },
    IndicatorDef { identifier: "sleepDisturbances", category: Sleep, standard_unit: "count", kind: Series },
    // Metabolic
    IndicatorDef { identifier: "bloodGlucose", category: Metabolic, standard_unit: "mg/dL", kind: Series },
    IndicatorDef { identifier: "caloriesActive", category: Metabolic, standard_unit: "kcal", kind: Series },
    IndicatorDef { identifier: "caloriesBasal", category: Metabolic, standard_unit: "kcal", kind: Series },
    IndicatorDef { identifier: "bmr", category: Metabolic, standard_unit: "kcal", kind: Series },
    // Performance
    IndicatorDef { identifier: "vo2Max", category: Performance, standard_unit: "mL/kg/min", kind: Series },
    IndicatorDef { identifier: "strain", category: Performance, standard_unit: "count", kind: Series },
    IndicatorDef { identifier: "recoveryScore", category: Performance, standard_unit: "%", kind: Series },
    IndicatorDef { identifier: "recoveryTime", category: Performance, standard_unit: "bpm", kind: Series },
    // Nutrition
    IndicatorDef { identifier: "dietaryProtein", category: Nutrition, standard_unit: "g", kind: Series },
    IndicatorDef { identifier: "dietaryCarbs", category: Nutrition, standard_unit: "g", kind: Series },
    IndicatorDef { identifier: "dietaryFats", category: Nutrition, standard_unit: "g", kind: Series },
    IndicatorDef { identifier: "dietaryEnergy", category: Nutrition, standard_unit: "kcal", kind: Series },
    IndicatorDef { identifier: "dietaryWater", category: Nutrition, standard_unit: "mL", kind: Series },
    // Reproductive (label-valued records allowed)
    IndicatorDef { identifier: "reproductiveBasalBodyTemperature", category: Reproductive, standard_unit: "C", kind: Series },
    IndicatorDef { identifier: "reproductiveCervicalMucusQuality", category: Reproductive, standard_unit: "", kind: Series },
    IndicatorDef { identifier: "reproductiveContraceptive", category: Reproductive, standard_unit: "", kind: Series },
    IndicatorDef { identifier: "reproductiveIntermenstrualBleeding", category: Reproductive, standard_unit: "", kind: Series },
    IndicatorDef { identifier: "reproductiveLactation", category: Reproductive, standard_unit: "", kind: Series },
    IndicatorDef { identifier: "reproductiveMenstruationFlow", category: Reproductive, standard_unit: "", kind: Series },
    IndicatorDef { identifier: "reproductiveOvulationTestResult", category: Reproductive, standard_unit: "", kind: Series },
    IndicatorDef { identifier: "reproductivePregnancy", category: Reproductive, standard_unit: "", kind: Series },
    IndicatorDef { identifier: "reproductivePregnancyTestResult", category: Reproductive, standard_unit: "", kind: Series },
    IndicatorDef { identifier: "reproductiveProgesteroneTestResult", category: Reproductive, standard_unit: "", kind: Series },
    IndicatorDef { identifier: "reproductiveSexualActivity", category: Reproductive, standard_unit: "", kind: Series },
    // Other
    IndicatorDef { identifier: "uvExposure", category: Other, standard_unit: "count", kind: Series },
];

static CATALOG: Lazy<HashMap<&'static str, &'static IndicatorDef>> =
    Lazy::new(|| INDICATORS.iter().map(|def| (def.identifier, def)).collect());

/// Look up an indicator definition.
pub fn get(identifier: &str) -> Option<&'static IndicatorDef> {
    CATALOG.get(identifier).copied()
}

pub fn is_valid(identifier: &str) -> bool {
    CATALOG.contains_key(identifier)
}

pub fn standard_unit(identifier: &str) -> Option<&'static str> {
    get(identifier).map(|def| def.standard_unit)
}

pub fn kind(identifier: &str) -> Option<IndicatorKind> {
    get(identifier).map(|def| def.kind)
}

pub fn categorize(identifier: &str) -> Category {
    get(identifier).map(|def| def.category).unwrap_or(Category::Other)
}

/// Whether records of this indicator belong in the summary store.
pub fn is_summary(identifier: &str) -> bool {
    matches!(kind(identifier), Some(IndicatorKind::Summary) | Some(IndicatorKind::Both))
}

/// Whether records of this indicator belong in the series store.
pub fn is_series(identifier: &str) -> bool {
    matches!(kind(identifier), Some(IndicatorKind::Series) | Some(IndicatorKind::Both))
}

pub fn all_indicators() -> &'static [IndicatorDef] {
    INDICATORS
}

/// Convert a value to the indicator's standard unit.
///
/// Pure and non-fatal: an unknown indicator or an unmapped unit pair keeps the
/// original value (and unit), logging a warning. On success the returned unit
/// is always the catalog's standard unit.
pub fn convert(identifier: &str, value: f64, source_unit: &str) -> (f64, String) {
    let Some(def) = get(identifier) else {
        warn!(indicator = identifier, "Unknown indicator, keeping original value");
        return (value, source_unit.to_string());
    };

    if source_unit.is_empty() || source_unit == def.standard_unit {
        return (value, def.standard_unit.to_string());
    }

    match units::convert_value(value, source_unit, def.standard_unit) {
        Some(converted) => (converted, def.standard_unit.to_string()),
        None => {
            warn!(
                indicator = identifier,
                from = source_unit,
                to = def.standard_unit,
                "No conversion rule, keeping original value"
            );
            (value, source_unit.to_string())
        }
    }
}

/// Infer the summary interval shape from the indicator identifier.
///
/// Kept here centrally so pipelines never duplicate the prefix rules.
pub fn summary_window(identifier: &str) -> SummaryWindow {
    let lower = identifier.to_lowercase();
    if lower.contains("daily") {
        SummaryWindow::Daily
    } else if lower.contains("weekly") {
        SummaryWindow::Weekly
    } else if lower.contains("hourly") {
        SummaryWindow::Hourly
    } else {
        SummaryWindow::Point
    }
}
