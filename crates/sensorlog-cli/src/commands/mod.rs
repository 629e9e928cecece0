pub mod backup;
pub mod calc;
pub mod insert;
pub mod query;
pub mod serve;

use std::sync::Arc;
use std::time::Duration;

use sensorlog_core::clock::parse_iso8601_compact;
use sensorlog_core::{Config, Ingestor, Result};

/// Open the stores under the configured data directory and wire up an
/// [`Ingestor`] with every configured transform.
pub fn make_ingestor(config: &Config) -> Result<Ingestor> {
    let (store, raw_state) = config.open_stores()?;
    let transforms = config.transform_engine(Arc::clone(&store), raw_state);
    Ok(Ingestor::new(store, transforms))
}

/// Parse a time given as Unix seconds or as a compact UTC timestamp
/// (`2026-02-15T013000Z`).
pub fn parse_time(s: &str) -> Option<i64> {
    let s = s.trim();
    s.parse::<i64>().ok().or_else(|| parse_iso8601_compact(s))
}

/// Parse a duration like `500ms`, `30s`, `5m`, `1h`; bare numbers are seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();

    let (numeric, multiplier) = if let Some(rest) = s.strip_suffix("ms") {
        (rest, 1u64)
    } else if let Some(rest) = s.strip_suffix('s') {
        (rest, 1000)
    } else if let Some(rest) = s.strip_suffix('m') {
        (rest, 60_000)
    } else if let Some(rest) = s.strip_suffix('h') {
        (rest, 3_600_000)
    } else {
        (s, 1000)
    };

    let value: u64 = numeric.trim().parse().ok()?;
    Some(Duration::from_millis(value.checked_mul(multiplier)?))
}

/// `parse_time` for an optional argument; an unparseable value is an error.
pub fn parse_time_arg(name: &str, s: Option<&str>) -> Result<Option<i64>> {
    match s {
        None => Ok(None),
        Some(s) => parse_time(s).map(Some).ok_or_else(|| {
            sensorlog_core::Error::Params(format!(
                "--{name}: expected Unix seconds or YYYY-MM-DDTHHMMSSZ, got '{s}'"
            ))
        }),
    }
}
