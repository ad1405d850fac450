//! Unit conversion table.
//!
//! Conversions are linear factors `target = source * factor`, keyed by
//! `(source_unit, target_unit)`. Temperature is the one affine exception and
//! is handled explicitly in [`convert_value`].

use once_cell::sync::Lazy;
use std::collections::HashMap;

/// Milliseconds per minute. Exposed for provider mapping tables that
/// aggregate millisecond durations before emitting records.
pub const MS_PER_MINUTE: f64 = 60_000.0;

/// Kilojoules per kilocalorie.
pub const KJ_PER_KCAL: f64 = 4.184;

static CONVERSION_FACTORS: Lazy<HashMap<(&'static str, &'static str), f64>> = Lazy::new(|| {
    let mut m = HashMap::new();
    // Durations
    m.insert(("ms", "min"), 1.0 / MS_PER_MINUTE);
    m.insert(("ms", "s"), 1.0 / 1000.0);
    m.insert(("s", "min"), 1.0 / 60.0);
    m.insert(("min", "h"), 1.0 / 60.0);
    m.insert(("h", "min"), 60.0);
    m.insert(("s", "ms"), 1000.0);
    m.insert(("min", "ms"), MS_PER_MINUTE);
    // Energy
    m.insert(("kJ", "kcal"), 1.0 / KJ_PER_KCAL);
    m.insert(("kcal", "kJ"), KJ_PER_KCAL);
    m.insert(("cal", "kcal"), 0.001);
    // Mass
    m.insert(("g", "kg"), 0.001);
    m.insert(("kg", "g"), 1000.0);
    m.insert(("lb", "kg"), 0.453_592_37);
    m.insert(("oz", "g"), 28.349_523_125);
    // Length / distance
    m.insert(("m", "km"), 0.001);
    m.insert(("km", "m"), 1000.0);
    m.insert(("mi", "km"), 1.609_344);
    m.insert(("mi", "m"), 1609.344);
    m.insert(("ft", "m"), 0.3048);
    m.insert(("in", "cm"), 2.54);
    m.insert(("cm", "m"), 0.01);
    m.insert(("m", "cm"), 100.0);
    // Volume
    m.insert(("L", "mL"), 1000.0);
    m.insert(("mL", "L"), 0.001);
    m.insert(("fl_oz", "mL"), 29.573_529_562_5);
    // Glucose
    m.insert(("mmol/L", "mg/dL"), 18.018);
    m
});

/// Convert `value` from `source_unit` into `target_unit`.
///
/// Returns `None` when no rule exists for the pair; callers decide how to
/// degrade (the catalog falls back to identity with a warning).
pub fn convert_value(value: f64, source_unit: &str, target_unit: &str) -> Option<f64> {
    if source_unit == target_unit {
        return Some(value);
    }
    // Affine temperature rules
    match (source_unit, target_unit) {
        ("F", "C") | ("°F", "°C") => return Some((value - 32.0) * 5.0 / 9.0),
        ("C", "F") | ("°C", "°F") => return Some(value * 9.0 / 5.0 + 32.0),
        _ => {}
    }
    CONVERSION_FACTORS
        .get(&(source_unit, target_unit))
        .map(|factor| value * factor)
}

/// All known conversion pairs, for diagnostics endpoints.
pub fn all_conversion_pairs() -> Vec<(&'static str, &'static str, f64)> {
    CONVERSION_FACTORS
        .iter()
        .map(|(&(from, to), &factor)| (from, to, factor))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_conversion() {
        assert_eq!(convert_value(72.0, "bpm", "bpm"), Some(72.0));
    }

    #[test]
    fn test_ms_to_min() {
        assert_eq!(convert_value(120_000.0, "ms", "min"), Some(2.0));
    }

    #[test]
    fn test_kj_to_kcal() {
        let kcal = convert_value(418.4, "kJ", "kcal").unwrap();
        assert!((kcal - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_fahrenheit_to_celsius() {
        let c = convert_value(98.6, "F", "C").unwrap();
        assert!((c - 37.0).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_pair() {
        assert_eq!(convert_value(1.0, "furlong", "km"), None);
    }
}
