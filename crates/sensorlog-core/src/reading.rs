//! Readings, series keys, and raw value decoding.
//!
//! A series key names one signal: a physical sensor or the output of a
//! calculated field. Keys are matched case-insensitively; the spelling used on
//! the first accepted write is the one reported back by [`crate::TimeSeriesStore::keys`].

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Keys beginning with this prefix are internal tables and cannot be written
/// through the public insert path.
pub const RESERVED_PREFIX: char = '_';

/// Suffix of the companion series that holds untransformed cumulative counts.
pub const RAW_SUFFIX: &str = "_raw";

/// One stored point of a series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Unix seconds.
    pub ts: i64,
    pub val: f64,
}

impl Reading {
    pub fn new(ts: i64, val: f64) -> Self {
        Self { ts, val }
    }
}

/// A reading addressed to a series, as accepted by
/// [`crate::TimeSeriesStore::insert_batch`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyedReading {
    pub key: String,
    pub ts: i64,
    pub val: f64,
}

impl KeyedReading {
    pub fn new(key: impl Into<String>, ts: i64, val: f64) -> Self {
        Self {
            key: key.into(),
            ts,
            val,
        }
    }
}

/// Accepted/rejected/vetoed counts for one or more insert calls.
///
/// A vetoed reading was dropped on purpose by its transform; it is neither an
/// acceptance nor an error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsertOutcome {
    pub accepted: usize,
    pub rejected: usize,
    #[serde(default)]
    pub vetoed: usize,
}

impl InsertOutcome {
    pub fn accepted() -> Self {
        Self {
            accepted: 1,
            ..Self::default()
        }
    }

    pub fn rejected() -> Self {
        Self {
            rejected: 1,
            ..Self::default()
        }
    }

    pub fn vetoed() -> Self {
        Self {
            vetoed: 1,
            ..Self::default()
        }
    }

    pub fn merge(&mut self, other: InsertOutcome) {
        self.accepted += other.accepted;
        self.rejected += other.rejected;
        self.vetoed += other.vetoed;
    }
}

/// A value as it arrives from a device, gateway, or HTTP request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawValue {
    Number(f64),
    Text(String),
    Missing,
}

impl From<f64> for RawValue {
    fn from(v: f64) -> Self {
        RawValue::Number(v)
    }
}

impl From<Option<f64>> for RawValue {
    fn from(v: Option<f64>) -> Self {
        v.map_or(RawValue::Missing, RawValue::Number)
    }
}

impl From<&str> for RawValue {
    fn from(v: &str) -> Self {
        RawValue::Text(v.to_string())
    }
}

impl RawValue {
    /// Decode into a finite number, or `None` if the value cannot be stored.
    ///
    /// State words map to 1.0 (`True`, `Closed`, `On`, `Motion…`, `Light…`,
    /// `Voltage…`) or 0.0 (`False`, `Open`, `No…`). Plain numeric text parses
    /// as is; any other text yields the first decimal number it contains.
    pub fn decode(&self) -> Option<f64> {
        match self {
            RawValue::Number(v) if v.is_finite() => Some(*v),
            RawValue::Number(_) | RawValue::Missing => None,
            RawValue::Text(s) => decode_text(s.trim()),
        }
    }
}

fn decode_text(s: &str) -> Option<f64> {
    if let Ok(v) = s.parse::<f64>() {
        return v.is_finite().then_some(v);
    }
    if s.contains("True")
        || s.contains("Closed")
        || s.contains("On")
        || s.starts_with("Motion")
        || s.starts_with("Light")
        || s.starts_with("Voltage")
    {
        return Some(1.0);
    }
    if s.contains("False") || s.contains("Open") || s.starts_with("No") {
        return Some(0.0);
    }
    first_number(s).filter(|v| v.is_finite())
}

/// Extract the first decimal number embedded in `s`: an optional sign, digits
/// with an optional fraction (a bare leading `.` counts as `0.`), and an
/// optional exponent.
fn first_number(s: &str) -> Option<f64> {
    let bytes = s.as_bytes();
    let skip_digits = |mut i: usize| {
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        i
    };

    let first_digit = bytes.iter().position(u8::is_ascii_digit)?;
    let mut start = first_digit;
    let leading_dot = start > 0 && bytes[start - 1] == b'.';
    if leading_dot {
        start -= 1;
    }
    if start > 0 && bytes[start - 1] == b'-' {
        start -= 1;
    }

    let mut end = skip_digits(first_digit);
    if !leading_dot && end + 1 < bytes.len() && bytes[end] == b'.' && bytes[end + 1].is_ascii_digit() {
        end = skip_digits(end + 1);
    }
    if end < bytes.len() && matches!(bytes[end], b'e' | b'E') {
        let mut exp = end + 1;
        if exp < bytes.len() && matches!(bytes[exp], b'+' | b'-') {
            exp += 1;
        }
        if exp < bytes.len() && bytes[exp].is_ascii_digit() {
            end = skip_digits(exp);
        }
    }
    s[start..end].parse().ok()
}

/// Case-folded form used for key lookups.
pub fn normalize_key(key: &str) -> String {
    key.trim().to_lowercase()
}

/// True if `key` names an internal table.
pub fn is_reserved(key: &str) -> bool {
    key.trim().starts_with(RESERVED_PREFIX)
}

/// Check that `key` may be written through the public insert path.
pub fn validate_key(key: &str) -> Result<()> {
    let trimmed = key.trim();
    if trimmed.is_empty() || is_reserved(trimmed) || trimmed.chars().any(char::is_control) {
        return Err(Error::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// Key of the raw cumulative-count companion for `key`.
pub fn raw_companion_key(key: &str) -> String {
    format!("{}{RAW_SUFFIX}", key.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    // -----------------------------------------------------------------------
    // RawValue decoding
    // -----------------------------------------------------------------------

    #[test]
    fn test_decode_finite_number() {
        assert_eq!(RawValue::Number(21.5).decode(), Some(21.5));
    }

    #[test]
    fn test_decode_rejects_non_finite() {
        assert_eq!(RawValue::Number(f64::NAN).decode(), None);
        assert_eq!(RawValue::Number(f64::INFINITY).decode(), None);
        assert_eq!(RawValue::Missing.decode(), None);
    }

    #[test]
    fn test_decode_state_words() {
        assert_eq!(RawValue::from("Closed").decode(), Some(1.0));
        assert_eq!(RawValue::from("Motion Detected").decode(), Some(1.0));
        assert_eq!(RawValue::from("Open").decode(), Some(0.0));
        assert_eq!(RawValue::from("No Motion").decode(), Some(0.0));
    }

    #[test]
    fn test_decode_embedded_number() {
        assert_eq!(RawValue::from("72.4 F").decode(), Some(72.4));
        assert_eq!(RawValue::from("temp=-3.25").decode(), Some(-3.25));
        assert_eq!(RawValue::from("12 psi").decode(), Some(12.0));
        assert_eq!(RawValue::from("n/a").decode(), None);
    }

    #[test]
    fn test_decode_numeric_text_exactly() {
        assert_eq!(RawValue::from(".5").decode(), Some(0.5));
        assert_eq!(RawValue::from("-.5").decode(), Some(-0.5));
        assert_eq!(RawValue::from("1e-3").decode(), Some(0.001));
        assert_eq!(RawValue::from("1.5e3").decode(), Some(1500.0));
        assert_eq!(RawValue::from(" 21.5 ").decode(), Some(21.5));
        assert_eq!(RawValue::from("-27.418451678623846").decode(), Some(-27.418451678623846));
        assert_eq!(RawValue::from("NaN").decode(), None);
        assert_eq!(RawValue::from("inf").decode(), None);
    }

    #[test]
    fn test_decode_embedded_fraction_and_exponent() {
        assert_eq!(RawValue::from("level .75 full").decode(), Some(0.75));
        assert_eq!(RawValue::from("x=-.25").decode(), Some(-0.25));
        assert_eq!(RawValue::from("1.5e3 kW").decode(), Some(1500.0));
        assert_eq!(RawValue::from("5 each").decode(), Some(5.0));
    }

    #[test]
    fn test_decode_state_words_are_case_sensitive() {
        assert_eq!(RawValue::from("Done").decode(), None);
        assert_eq!(RawValue::from("Done 3").decode(), Some(3.0));
        assert_eq!(RawValue::from("Online").decode(), Some(1.0));
        assert_eq!(RawValue::from("None").decode(), Some(0.0));
    }

    #[test]
    fn test_raw_value_untagged_json() {
        let vals: Vec<RawValue> = serde_json::from_str(r#"[1.5, "Open", null]"#).unwrap();
        assert_eq!(vals[0], RawValue::Number(1.5));
        assert_eq!(vals[1], RawValue::Text("Open".into()));
        assert_eq!(vals[2], RawValue::Missing);
    }

    // -----------------------------------------------------------------------
    // Keys
    // -----------------------------------------------------------------------

    #[test]
    fn test_validate_key() {
        assert!(validate_key("meter_A").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("   ").is_err());
        assert!(validate_key("_last_raw").is_err());
        assert!(validate_key("bad\nkey").is_err());
    }

    #[test]
    fn test_normalize_and_companion() {
        assert_eq!(normalize_key(" Meter_A "), "meter_a");
        assert_eq!(raw_companion_key("meter_A"), "meter_A_raw");
    }

    #[test]
    fn test_insert_outcome_merge() {
        let mut total = InsertOutcome::default();
        total.merge(InsertOutcome::accepted());
        total.merge(InsertOutcome::rejected());
        total.merge(InsertOutcome::accepted());
        total.merge(InsertOutcome::vetoed());
        assert_eq!(total.accepted, 2);
        assert_eq!(total.rejected, 1);
        assert_eq!(total.vetoed, 1);
    }
}
