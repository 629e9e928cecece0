//! Built-in calculation functions.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use log::warn;

use crate::cache::ObservationCache;
use crate::calc::{
    CalcFunction, FunctionInfo, FunctionProvider, SeriesFunction, SeriesInput, SourceContext,
    SourceFunction,
};
use crate::error::{Error, Result};
use crate::expr::Expression;
use crate::reading::Reading;

/// How far before the output's last reading on/off history is read, so the
/// state in force at the start of the first new bin is known.
const STATE_LOOKBACK_SECS: i64 = 7200;

// ---------------------------------------------------------------------------
// External observations
// ---------------------------------------------------------------------------

/// One observation from an external station: named numeric fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Observation {
    pub fields: HashMap<String, f64>,
}

impl Observation {
    pub fn get(&self, field: &str) -> Option<f64> {
        self.fields.get(field).copied().filter(|v| v.is_finite())
    }
}

/// Where `observation` gets its data (a weather service client, a gateway
/// cache file, a test double).
pub trait ObservationSource: Send + Sync {
    fn fetch(&self, station: &str) -> Result<Observation>;
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

/// The standard function set.
#[derive(Default)]
pub struct BuiltinFunctions {
    observations: Option<(Arc<dyn ObservationSource>, Arc<ObservationCache<Observation>>)>,
}

impl BuiltinFunctions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also provide `observation`, backed by `source` and shared `cache`.
    pub fn with_observations(
        mut self,
        source: Arc<dyn ObservationSource>,
        cache: Arc<ObservationCache<Observation>>,
    ) -> Self {
        self.observations = Some((source, cache));
        self
    }
}

impl FunctionProvider for BuiltinFunctions {
    fn name(&self) -> &'static str {
        "builtin"
    }

    fn functions(&self) -> Vec<CalcFunction> {
        let mut fns = vec![
            CalcFunction::Series(Arc::new(FluidHeatFlow)),
            CalcFunction::Series(Arc::new(Linear)),
            CalcFunction::Series(Arc::new(AMinusB)),
            CalcFunction::Series(Arc::new(APlusBPlusCPlusD)),
            CalcFunction::Series(Arc::new(GenericCalc)),
            CalcFunction::Source(Arc::new(RuntimeFromOnOff)),
            CalcFunction::Source(Arc::new(OkoValueFromStatus)),
            CalcFunction::Source(Arc::new(TrueTimeAverage)),
            CalcFunction::Source(Arc::new(LastCount)),
        ];
        if let Some((source, cache)) = &self.observations {
            fns.push(CalcFunction::Source(Arc::new(ObservationFn {
                source: Arc::clone(source),
                cache: Arc::clone(cache),
            })));
        }
        fns
    }
}

// ---------------------------------------------------------------------------
// Series functions
// ---------------------------------------------------------------------------

struct FluidHeatFlow;

static FLUID_HEAT_FLOW: FunctionInfo = FunctionInfo {
    name: "fluid_heat_flow",
    description: "flow * (t_hot - t_cold) * multiplier * (1 - heat_recovery)",
};

impl SeriesFunction for FluidHeatFlow {
    fn info(&self) -> &FunctionInfo {
        &FLUID_HEAT_FLOW
    }

    fn compute(&self, input: &SeriesInput<'_>) -> Result<Vec<f64>> {
        let flow = input.arg("flow")?;
        let t_hot = input.arg("t_hot")?;
        let t_cold = input.arg("t_cold")?;
        let multiplier = input.arg("multiplier")?;
        let recovery = input.arg_or("heat_recovery", 0.0)?;
        Ok(input.map_rows(|i| {
            flow.at(i) * (t_hot.at(i) - t_cold.at(i)) * multiplier.at(i) * (1.0 - recovery.at(i))
        }))
    }
}

struct Linear;

static LINEAR: FunctionInfo = FunctionInfo {
    name: "linear",
    description: "val * slope + offset",
};

impl SeriesFunction for Linear {
    fn info(&self) -> &FunctionInfo {
        &LINEAR
    }

    fn compute(&self, input: &SeriesInput<'_>) -> Result<Vec<f64>> {
        let val = input.arg("val")?;
        let slope = input.arg_or("slope", 1.0)?;
        let offset = input.arg_or("offset", 0.0)?;
        Ok(input.map_rows(|i| val.at(i) * slope.at(i) + offset.at(i)))
    }
}

struct AMinusB;

static A_MINUS_B: FunctionInfo = FunctionInfo {
    name: "a_minus_b",
    description: "a - b",
};

impl SeriesFunction for AMinusB {
    fn info(&self) -> &FunctionInfo {
        &A_MINUS_B
    }

    fn compute(&self, input: &SeriesInput<'_>) -> Result<Vec<f64>> {
        let a = input.arg("a")?;
        let b = input.arg("b")?;
        Ok(input.map_rows(|i| a.at(i) - b.at(i)))
    }
}

struct APlusBPlusCPlusD;

static A_PLUS_B_PLUS_C_PLUS_D: FunctionInfo = FunctionInfo {
    name: "a_plus_b_plus_c_plus_d",
    description: "a + b + c + d, with c and d optional",
};

impl SeriesFunction for APlusBPlusCPlusD {
    fn info(&self) -> &FunctionInfo {
        &A_PLUS_B_PLUS_C_PLUS_D
    }

    fn compute(&self, input: &SeriesInput<'_>) -> Result<Vec<f64>> {
        let a = input.arg("a")?;
        let b = input.arg("b")?;
        let c = input.arg_or("c", 0.0)?;
        let d = input.arg_or("d", 0.0)?;
        Ok(input.map_rows(|i| a.at(i) + b.at(i) + c.at(i) + d.at(i)))
    }
}

struct GenericCalc;

static GENERIC_CALC: FunctionInfo = FunctionInfo {
    name: "generic_calc",
    description: "evaluate 'expression' over variables A through E",
};

const GENERIC_VARS: [&str; 5] = ["A", "B", "C", "D", "E"];

impl SeriesFunction for GenericCalc {
    fn info(&self) -> &FunctionInfo {
        &GENERIC_CALC
    }

    fn compute(&self, input: &SeriesInput<'_>) -> Result<Vec<f64>> {
        let source = input
            .scalars()
            .text("expression")
            .ok_or_else(|| Error::Params("generic_calc needs an 'expression'".into()))?;
        let expression = Expression::parse(&source)?;

        let mut args = Vec::new();
        for name in GENERIC_VARS {
            if let Some(arg) = input.optional(name)? {
                args.push((name, arg));
            }
        }
        if args.iter().all(|(n, _)| *n != "A") {
            return Err(Error::Params("generic_calc needs input 'A'".into()));
        }

        let mut failures = 0usize;
        let values = input.map_rows(|i| {
            let vars: Vec<(&str, f64)> = args.iter().map(|(n, a)| (*n, a.at(i))).collect();
            expression.eval(&vars).unwrap_or_else(|_| {
                failures += 1;
                f64::NAN
            })
        });
        if failures > 0 {
            warn!("generic_calc: '{source}' failed on {failures} row(s)");
        }
        Ok(values)
    }
}

// ---------------------------------------------------------------------------
// Source functions
// ---------------------------------------------------------------------------

/// Time-weighted bin means of a step series.
///
/// Each reading holds until the next one; the final reading counts for one
/// second. Bins are `interval` seconds wide, aligned to multiples of
/// `interval`, and reported at their midpoint. The last bin is dropped
/// because it almost always covers only part of the interval.
pub fn time_weighted_bins(readings: &[Reading], interval: i64) -> Vec<Reading> {
    if readings.len() < 2 || interval <= 0 {
        return Vec::new();
    }
    let mut bins: BTreeMap<i64, (f64, f64)> = BTreeMap::new();
    for (i, r) in readings.iter().enumerate() {
        let end = readings.get(i + 1).map_or(r.ts + 1, |next| next.ts);
        let mut start = r.ts;
        while start < end {
            let bin = start.div_euclid(interval) * interval;
            let seg_end = end.min(bin + interval);
            let secs = (seg_end - start) as f64;
            let acc = bins.entry(bin).or_insert((0.0, 0.0));
            acc.0 += r.val * secs;
            acc.1 += secs;
            start = seg_end;
        }
    }
    bins.pop_last();
    bins.into_iter()
        .filter(|(_, (_, secs))| *secs > 0.0)
        .map(|(bin, (sum, secs))| Reading::new(bin + interval / 2, sum / secs))
        .collect()
}

/// Bin means of `sensor` past the output's last reading. `state` (over
/// `val`) maps each reading before binning.
fn binned_since_last_output(
    ctx: &SourceContext<'_>,
    sensor: &str,
    interval_mins: f64,
    state: Option<&Expression>,
) -> Result<Vec<Reading>> {
    let interval = (interval_mins * 60.0).round() as i64;
    if interval <= 0 {
        return Err(Error::Params(format!(
            "averaging interval must be positive, got {interval_mins} minutes"
        )));
    }
    let last_ts = ctx.last_output_ts();
    let mut history = ctx
        .store
        .range(sensor, Some(last_ts - STATE_LOOKBACK_SECS), None);
    if let Some(state) = state {
        for r in history.iter_mut() {
            r.val = state.eval(&[("val", r.val)])?;
        }
    }
    Ok(time_weighted_bins(&history, interval)
        .into_iter()
        .filter(|r| r.ts > last_ts)
        .collect())
}

struct RuntimeFromOnOff;

static RUNTIME_FROM_ON_OFF: FunctionInfo = FunctionInfo {
    name: "runtime_from_on_off",
    description: "fraction of each interval an on/off sensor was on",
};

impl SourceFunction for RuntimeFromOnOff {
    fn info(&self) -> &FunctionInfo {
        &RUNTIME_FROM_ON_OFF
    }

    fn produce(&self, ctx: &SourceContext<'_>) -> Result<Vec<Reading>> {
        let sensor = ctx.required_text("on_off_id")?;
        let interval = ctx.params.f64_or("runtime_interval", 30.0)?;
        let state = ctx
            .params
            .text("state_expression")
            .map(|src| Expression::parse(&src))
            .transpose()?;
        binned_since_last_output(ctx, &sensor, interval, state.as_ref())
    }
}

/// Boiler status codes during which the burner consumes fuel.
const FIRING_STATE: &str = "in(val, 5, 6)";
const FIRING_INTERVAL_MINS: f64 = 5.0;

struct OkoValueFromStatus;

static OKO_VALUE_FROM_STATUS: FunctionInfo = FunctionInfo {
    name: "oko_value_from_status",
    description: "5-minute average of 'value' while a pellet boiler status is 5 or 6",
};

impl SourceFunction for OkoValueFromStatus {
    fn info(&self) -> &FunctionInfo {
        &OKO_VALUE_FROM_STATUS
    }

    fn produce(&self, ctx: &SourceContext<'_>) -> Result<Vec<Reading>> {
        let sensor = ctx.required_text("status_id")?;
        let value = ctx.params.f64_or("value", 1.0)?;
        let firing = Expression::parse(FIRING_STATE)?;
        Ok(
            binned_since_last_output(ctx, &sensor, FIRING_INTERVAL_MINS, Some(&firing))?
                .into_iter()
                .map(|r| Reading::new(r.ts, r.val * value))
                .collect(),
        )
    }
}

struct TrueTimeAverage;

static TRUE_TIME_AVERAGE: FunctionInfo = FunctionInfo {
    name: "true_time_average",
    description: "time-weighted average of an unevenly sampled sensor",
};

impl SourceFunction for TrueTimeAverage {
    fn info(&self) -> &FunctionInfo {
        &TRUE_TIME_AVERAGE
    }

    fn produce(&self, ctx: &SourceContext<'_>) -> Result<Vec<Reading>> {
        let sensor = ctx.required_text("sensor_id")?;
        let interval = ctx.params.f64_or("average_interval", 30.0)?;
        binned_since_last_output(ctx, &sensor, interval, None)
    }
}

struct LastCount;

static LAST_COUNT: FunctionInfo = FunctionInfo {
    name: "last_count",
    description: "latest raw cumulative count of a counter sensor",
};

impl SourceFunction for LastCount {
    fn info(&self) -> &FunctionInfo {
        &LAST_COUNT
    }

    fn produce(&self, ctx: &SourceContext<'_>) -> Result<Vec<Reading>> {
        let sensor = ctx.required_text("sensor_id")?;
        Ok(ctx.raw_state.get(&sensor).into_iter().collect())
    }
}

struct ObservationFn {
    source: Arc<dyn ObservationSource>,
    cache: Arc<ObservationCache<Observation>>,
}

static OBSERVATION: FunctionInfo = FunctionInfo {
    name: "observation",
    description: "one field of an external station observation, stamped now",
};

impl SourceFunction for ObservationFn {
    fn info(&self) -> &FunctionInfo {
        &OBSERVATION
    }

    fn produce(&self, ctx: &SourceContext<'_>) -> Result<Vec<Reading>> {
        let station = ctx.required_text("station")?;
        let field = ctx.required_text("field")?;
        let slope = ctx.params.f64_or("slope", 1.0)?;
        let offset = ctx.params.f64_or("offset", 0.0)?;

        let obs = self
            .cache
            .get_or_try_insert(&station, || self.source.fetch(&station))?;
        Ok(obs
            .get(&field)
            .map(|v| Reading::new(ctx.now, v * slope + offset))
            .into_iter()
            .collect())
    }
}
