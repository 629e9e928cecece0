//! Ingestion-time transforms.
//!
//! A [`TransformSpec`] bound to a raw series key turns each incoming reading
//! into the reading that gets stored, or vetoes it. Three functions exist:
//!
//! - `linear`: `val * slope + offset`
//! - `counter_rate`: a per-interval pulse count becomes a per-second rate,
//!   with duplicate-transmission, missed-interval, and link-mode handling
//! - `expression`: a cumulative counter becomes a rate (with rollover
//!   correction) that is fed through an arithmetic expression
//!
//! Stateful transforms read the store (`counter_rate`) or swap the
//! [`RawStateStore`] (`expression`). They never write readings themselves;
//! the caller stores whatever [`Transformed`] says to.

use std::collections::HashMap;
use std::sync::Arc;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::expr::Expression;
use crate::params::Params;
use crate::raw_state::RawStateStore;
use crate::reading::{KeyedReading, Reading, normalize_key, raw_companion_key};
use crate::store::TimeSeriesStore;

/// Default counter width for `expression` rollover correction.
pub const DEFAULT_ROLLOVER: f64 = 4_294_967_296.0;

/// Default reporting interval for `counter_rate` (minutes).
const DEFAULT_TYPICAL_MINUTES: f64 = 30.0;

/// Link-mode threshold, in typical intervals.
const LINK_MODE_INTERVALS: f64 = 4.0;

/// A transform function name with its keyword parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformSpec {
    pub function: String,
    #[serde(default)]
    pub params: Params,
}

impl TransformSpec {
    pub fn new(function: impl Into<String>, params: Params) -> Self {
        Self {
            function: function.into(),
            params,
        }
    }

    /// Build from a function name and a keyword string.
    pub fn parse(function: &str, params: &str) -> Result<Self> {
        Ok(Self::new(function.trim(), Params::parse(params)?))
    }
}

/// What to do with one incoming reading.
#[derive(Debug, Clone, PartialEq)]
pub enum TransformOutcome {
    /// Store this reading.
    Store(KeyedReading),
    /// Do not store anything; the reason is for the log.
    Veto(String),
}

/// Result of transforming one reading.
#[derive(Debug, Clone, PartialEq)]
pub struct Transformed {
    /// Untransformed cumulative count to store alongside (`expression` only).
    pub companion: Option<KeyedReading>,
    pub outcome: TransformOutcome,
}

impl Transformed {
    fn store(key: &str, ts: i64, val: f64) -> Self {
        Self {
            companion: None,
            outcome: TransformOutcome::Store(KeyedReading::new(key, ts, val)),
        }
    }

    fn veto(reason: impl Into<String>) -> Self {
        Self {
            companion: None,
            outcome: TransformOutcome::Veto(reason.into()),
        }
    }
}

/// Applies the transform registered for a key to incoming readings.
pub struct TransformEngine {
    store: Arc<TimeSeriesStore>,
    raw_state: Arc<RawStateStore>,
    specs: HashMap<String, TransformSpec>,
}

impl TransformEngine {
    pub fn new(store: Arc<TimeSeriesStore>, raw_state: Arc<RawStateStore>) -> Self {
        Self {
            store,
            raw_state,
            specs: HashMap::new(),
        }
    }

    /// Bind `spec` to `key` (case-insensitive), replacing any earlier binding.
    pub fn register(&mut self, key: &str, spec: TransformSpec) {
        self.specs.insert(normalize_key(key), spec);
    }

    pub fn spec_for(&self, key: &str) -> Option<&TransformSpec> {
        self.specs.get(&normalize_key(key))
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Transform one reading. Keys without a registered transform pass through.
    ///
    /// # Errors
    ///
    /// - `Error::UnknownFunction`: the registered function name is not known
    /// - `Error::Params`: a parameter has the wrong type or an invalid value
    pub fn apply(&self, key: &str, ts: i64, val: f64) -> Result<Transformed> {
        match self.spec_for(key) {
            None => Ok(Transformed::store(key, ts, val)),
            Some(spec) => self.apply_spec(spec, key, ts, val, true),
        }
    }

    fn apply_spec(
        &self,
        spec: &TransformSpec,
        key: &str,
        ts: i64,
        val: f64,
        with_companion: bool,
    ) -> Result<Transformed> {
        match spec.function.trim() {
            "linear" => linear(&spec.params, key, ts, val),
            "counter_rate" | "count_rate" => {
                let prior = self.store.last_read(key);
                counter_rate(&spec.params, key, ts, val, prior)
            }
            "expression" => self.expression(&spec.params, key, ts, val, with_companion),
            other => Err(Error::UnknownFunction(other.to_string())),
        }
    }

    fn expression(
        &self,
        params: &Params,
        key: &str,
        ts: i64,
        val: f64,
        with_companion: bool,
    ) -> Result<Transformed> {
        let p = ExpressionParams::from_params(params)?;

        if p.ignore_zero && val == 0.0 {
            return Ok(Transformed::veto("zero count ignored"));
        }

        let companion = if with_companion {
            self.companion(key, ts, val)?
        } else {
            None
        };

        let mut out = rate_from_counter(&p, key, ts, val, self.raw_state.swap(key, ts, val));
        out.companion = companion;
        Ok(out)
    }

    /// The `<key>_raw` reading, passed once through that key's own transform.
    /// An `expression` transform on the raw key is not applied (single level).
    fn companion(&self, key: &str, ts: i64, val: f64) -> Result<Option<KeyedReading>> {
        let raw_key = raw_companion_key(key);
        let transformed = match self.spec_for(&raw_key) {
            None => Transformed::store(&raw_key, ts, val),
            Some(spec) if spec.function.trim() == "expression" => {
                debug!("not chaining expression transform onto '{raw_key}'");
                Transformed::store(&raw_key, ts, val)
            }
            Some(spec) => self.apply_spec(spec, &raw_key, ts, val, false)?,
        };
        Ok(match transformed.outcome {
            TransformOutcome::Store(r) => Some(r),
            TransformOutcome::Veto(reason) => {
                debug!("raw companion '{raw_key}' vetoed: {reason}");
                None
            }
        })
    }
}

// ---------------------------------------------------------------------------
// linear
// ---------------------------------------------------------------------------

fn linear(params: &Params, key: &str, ts: i64, val: f64) -> Result<Transformed> {
    let slope = params.f64_or("slope", 1.0)?;
    let offset = params.f64_or("offset", 0.0)?;
    Ok(Transformed::store(key, ts, val * slope + offset))
}

// ---------------------------------------------------------------------------
// counter_rate
// ---------------------------------------------------------------------------

/// Convert a count accumulated since the previous report into a rate per
/// second. `prior` is the last stored (already transformed) reading for `key`.
fn counter_rate(
    params: &Params,
    key: &str,
    ts: i64,
    val: f64,
    prior: Option<Reading>,
) -> Result<Transformed> {
    let typical = match params.get("typical_interval") {
        Some(_) => params.f64_or("typical_interval", 0.0)?,
        None => params.f64_or("typical_minutes", DEFAULT_TYPICAL_MINUTES)? * 60.0,
    };
    if !(typical.is_finite() && typical > 0.0) {
        return Err(Error::Params(format!(
            "typical_interval must be positive, got {typical}"
        )));
    }
    let slope = params.f64_or("slope", 1.0)?;
    let offset = params.f64_or("offset", 0.0)?;
    let gap_guard = match params.get("no_zero_after_long_gap") {
        Some(_) => params.bool_or("no_zero_after_long_gap", true)?,
        None => params.bool_or("no_zero_after_link", true)?,
    };

    // The count accrued over the whole interval; stamp it at the middle.
    let new_ts = (ts as f64 - typical * 0.5).round() as i64;

    let Some(prior) = prior else {
        return Ok(Transformed::store(key, new_ts, slope * val / typical + offset));
    };

    let elapsed = (new_ts - prior.ts) as f64;
    let rate = if gap_guard && val == 0.0 && elapsed >= LINK_MODE_INTERVALS * typical {
        // First report after link mode is a spurious zero.
        prior.val
    } else if elapsed < 0.9 * typical {
        // Doubled-up transmission.
        prior.val
    } else if elapsed > 1.1 * typical {
        // Missed reports: the true interval is some multiple of the typical one.
        let mut best = slope * val / typical + offset;
        let mut best_dev = f64::MAX;
        for mult in 1..=4 {
            let candidate = slope * val / (f64::from(mult) * typical) + offset;
            let dev = (candidate - prior.val).abs();
            if dev < best_dev {
                best_dev = dev;
                best = candidate;
            }
        }
        best
    } else {
        slope * val / elapsed + offset
    };
    Ok(Transformed::store(key, new_ts, rate))
}

// ---------------------------------------------------------------------------
// expression
// ---------------------------------------------------------------------------

struct ExpressionParams {
    expression: String,
    rollover: f64,
    max_rate: f64,
    min_interval: f64,
    ignore_zero: bool,
    ignore_negative: bool,
}

impl ExpressionParams {
    fn from_params(params: &Params) -> Result<Self> {
        Ok(Self {
            expression: params.text("expression").unwrap_or_else(|| "rate".to_string()),
            rollover: params.f64_or("rollover", DEFAULT_ROLLOVER)?,
            max_rate: params.f64_or("max_rate", f64::INFINITY)?,
            min_interval: params.f64_or("min_interval", 0.0)?,
            ignore_zero: params.bool_or("ignore_zero", false)?,
            ignore_negative: params.bool_or("ignore_negative", true)?,
        })
    }
}

fn rate_from_counter(
    p: &ExpressionParams,
    key: &str,
    ts: i64,
    val: f64,
    prior: Option<Reading>,
) -> Transformed {
    let Some(prior) = prior else {
        return Transformed::veto("no prior raw reading");
    };
    let elapsed = (ts - prior.ts) as f64;
    if elapsed <= 0.0 || elapsed < p.min_interval {
        return Transformed::veto(format!("interval of {elapsed} s too short"));
    }

    let mut change = val - prior.val;
    let mut rate = change / elapsed;
    let genuine_negative = !p.ignore_negative && rate.abs() <= p.max_rate;
    if change < 0.0 && !genuine_negative {
        change += p.rollover;
        rate = change / elapsed;
    }
    if rate.abs() > p.max_rate {
        return Transformed::veto(format!("rate {rate} exceeds max_rate {}", p.max_rate));
    }

    let mid_ts = prior.ts + (ts - prior.ts) / 2;
    let value = match Expression::parse(&p.expression).and_then(|e| e.eval(&[("val", val), ("rate", rate)])) {
        Ok(v) if v.is_finite() => v,
        Ok(v) => return Transformed::veto(format!("expression '{}' produced {v}", p.expression)),
        Err(e) => return Transformed::veto(e.to_string()),
    };
    Transformed::store(key, mid_ts, value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> (tempfile::TempDir, Arc<TimeSeriesStore>, TransformEngine) {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(TimeSeriesStore::open(tmp.path()).unwrap());
        let raw = Arc::new(RawStateStore::in_memory());
        let engine = TransformEngine::new(Arc::clone(&store), raw);
        (tmp, store, engine)
    }

    fn stored(t: &Transformed) -> Option<(i64, f64)> {
        match &t.outcome {
            TransformOutcome::Store(r) => Some((r.ts, r.val)),
            TransformOutcome::Veto(_) => None,
        }
    }

    fn counter(params: &str, ts: i64, val: f64, prior: Option<Reading>) -> (i64, f64) {
        let t = counter_rate(&Params::parse(params).unwrap(), "pulse", ts, val, prior).unwrap();
        stored(&t).unwrap()
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    #[test]
    fn test_unregistered_key_passes_through() {
        let (_tmp, _store, engine) = engine();
        let t = engine.apply("temp", 100, 21.5).unwrap();
        assert_eq!(stored(&t), Some((100, 21.5)));
        assert!(t.companion.is_none());
    }

    #[test]
    fn test_linear() {
        let (_tmp, _store, mut engine) = engine();
        engine.register("Temp", TransformSpec::parse("linear", "slope=1.8, offset=32").unwrap());
        let t = engine.apply("temp", 100, 100.0).unwrap();
        assert_eq!(stored(&t), Some((100, 212.0)));
    }

    #[test]
    fn test_unknown_function_is_error() {
        let (_tmp, _store, mut engine) = engine();
        engine.register("temp", TransformSpec::parse("cubic", "").unwrap());
        assert!(matches!(
            engine.apply("temp", 1, 1.0),
            Err(Error::UnknownFunction(name)) if name == "cubic"
        ));
    }

    // -----------------------------------------------------------------------
    // counter_rate
    // -----------------------------------------------------------------------

    #[test]
    fn test_counter_rate_no_prior_uses_typical() {
        let (ts, v) = counter("typical_interval=1800", 3600, 180.0, None);
        assert_eq!(ts, 2700);
        assert!((v - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_counter_rate_typical_minutes_alias() {
        let (ts, v) = counter("typical_minutes=30", 3600, 180.0, None);
        assert_eq!(ts, 2700);
        assert!((v - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_counter_rate_zero_on_normal_interval_is_computed() {
        // Prior report at 10_000 was stored at 10_000 - 900.
        let prior = Some(Reading::new(9_100, 0.25));
        let (ts, v) = counter("typical_interval=1800", 11_800, 0.0, prior);
        assert_eq!(ts, 10_900);
        assert_eq!(v, 0.0);
    }

    #[test]
    fn test_counter_rate_zero_after_long_gap_reemits_prior() {
        let prior = Some(Reading::new(9_100, 0.25));
        let (ts, v) = counter("typical_interval=1800", 10_000 + 4 * 1800, 0.0, prior);
        assert_eq!(ts, 10_000 + 4 * 1800 - 900);
        assert_eq!(v, 0.25);
    }

    #[test]
    fn test_counter_rate_gap_guard_disabled() {
        let prior = Some(Reading::new(9_100, 0.25));
        let (_, v) = counter(
            "typical_interval=1800, no_zero_after_long_gap=false",
            10_000 + 4 * 1800,
            0.0,
            prior,
        );
        assert_eq!(v, 0.0);
    }

    #[test]
    fn test_counter_rate_duplicate_transmission() {
        let prior = Some(Reading::new(9_100, 0.25));
        let (_, v) = counter("typical_interval=1800", 10_600, 999.0, prior);
        assert_eq!(v, 0.25);
    }

    #[test]
    fn test_counter_rate_missed_interval_picks_closest_multiple() {
        // 900 pulses over what was really two intervals: 900/3600 = 0.25.
        let prior = Some(Reading::new(9_100, 0.25));
        let (_, v) = counter("typical_interval=1800", 13_600, 900.0, prior);
        assert!((v - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_counter_rate_slope_offset() {
        let prior = Some(Reading::new(9_100, 0.0));
        let (_, v) = counter("typical_interval=1800, slope=2, offset=1", 11_800, 180.0, prior);
        assert!((v - 1.2).abs() < 1e-12);
    }

    #[test]
    fn test_counter_rate_reads_prior_from_store() {
        let (_tmp, store, mut engine) = engine();
        engine.register(
            "pulse",
            TransformSpec::parse("counter_rate", "typical_interval=1800").unwrap(),
        );
        store.insert("pulse", 9_100, 0.25);
        let t = engine.apply("pulse", 10_000 + 4 * 1800, 0.0).unwrap();
        assert_eq!(stored(&t), Some((10_000 + 4 * 1800 - 900, 0.25)));
    }

    #[test]
    fn test_counter_rate_rejects_bad_interval() {
        let r = counter_rate(&Params::parse("typical_interval=0").unwrap(), "k", 1, 1.0, None);
        assert!(matches!(r, Err(Error::Params(_))));
    }

    // -----------------------------------------------------------------------
    // expression
    // -----------------------------------------------------------------------

    #[test]
    fn test_expression_first_reading_vetoed() {
        let (_tmp, _store, mut engine) = engine();
        engine.register("meter", TransformSpec::parse("expression", "").unwrap());
        let t = engine.apply("meter", 0, 100.0).unwrap();
        assert!(matches!(t.outcome, TransformOutcome::Veto(_)));
        assert_eq!(t.companion, Some(KeyedReading::new("meter_raw", 0, 100.0)));
    }

    #[test]
    fn test_expression_rollover_correction() {
        let (_tmp, _store, mut engine) = engine();
        engine.register(
            "meter",
            TransformSpec::parse("expression", "expression=rate, rollover=65536").unwrap(),
        );
        engine.apply("meter", 0, 65_000.0).unwrap();
        let t = engine.apply("meter", 1036, 500.0).unwrap();
        assert_eq!(stored(&t), Some((518, 1.0)));
    }

    #[test]
    fn test_expression_genuine_negative_kept() {
        let (_tmp, _store, mut engine) = engine();
        engine.register(
            "level",
            TransformSpec::parse("expression", "ignore_negative=false, max_rate=10").unwrap(),
        );
        engine.apply("level", 0, 100.0).unwrap();
        let t = engine.apply("level", 10, 90.0).unwrap();
        assert_eq!(stored(&t), Some((5, -1.0)));
    }

    #[test]
    fn test_expression_max_rate_veto() {
        let (_tmp, _store, mut engine) = engine();
        engine.register(
            "meter",
            TransformSpec::parse("expression", "max_rate=1").unwrap(),
        );
        engine.apply("meter", 0, 0.0).unwrap();
        let t = engine.apply("meter", 10, 100.0).unwrap();
        assert!(matches!(t.outcome, TransformOutcome::Veto(_)));
        // Raw state still advanced past the vetoed reading.
        let t = engine.apply("meter", 20, 105.0).unwrap();
        assert_eq!(stored(&t), Some((15, 0.5)));
    }

    #[test]
    fn test_expression_ignore_zero_and_min_interval() {
        let (_tmp, _store, mut engine) = engine();
        engine.register(
            "meter",
            TransformSpec::parse("expression", "ignore_zero=yes, min_interval=60").unwrap(),
        );
        let t = engine.apply("meter", 0, 0.0).unwrap();
        assert!(matches!(t.outcome, TransformOutcome::Veto(_)));
        assert!(t.companion.is_none());

        engine.apply("meter", 100, 10.0).unwrap();
        let t = engine.apply("meter", 130, 20.0).unwrap();
        assert!(matches!(t.outcome, TransformOutcome::Veto(_)));
    }

    #[test]
    fn test_expression_non_finite_result_vetoed() {
        let (_tmp, _store, mut engine) = engine();
        engine.register(
            "meter",
            TransformSpec::parse("expression", "expression=1 / (rate - 1)").unwrap(),
        );
        engine.apply("meter", 0, 0.0).unwrap();
        let t = engine.apply("meter", 10, 10.0).unwrap();
        assert!(matches!(t.outcome, TransformOutcome::Veto(_)));
    }

    #[test]
    fn test_expression_uses_val_and_rate() {
        let (_tmp, _store, mut engine) = engine();
        engine.register(
            "meter",
            TransformSpec::parse("expression", "expression=val + rate * 60").unwrap(),
        );
        engine.apply("meter", 0, 0.0).unwrap();
        let t = engine.apply("meter", 60, 30.0).unwrap();
        assert_eq!(stored(&t), Some((30, 60.0)));
    }

    #[test]
    fn test_companion_uses_raw_key_transform_once() {
        let (_tmp, _store, mut engine) = engine();
        engine.register("meter", TransformSpec::parse("expression", "").unwrap());
        engine.register("meter_raw", TransformSpec::parse("linear", "slope=0.5").unwrap());
        let t = engine.apply("meter", 0, 5000.0).unwrap();
        assert_eq!(t.companion, Some(KeyedReading::new("meter_raw", 0, 2500.0)));
    }

    #[test]
    fn test_companion_expression_not_chained() {
        let (_tmp, _store, mut engine) = engine();
        engine.register("meter", TransformSpec::parse("expression", "").unwrap());
        engine.register("meter_raw", TransformSpec::parse("expression", "").unwrap());
        let t = engine.apply("meter", 0, 5000.0).unwrap();
        assert_eq!(t.companion, Some(KeyedReading::new("meter_raw", 0, 5000.0)));
    }
}
