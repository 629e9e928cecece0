//! Calculated fields: derived series computed from stored readings.
//!
//! A [`CalculatedFieldSpec`] names an output key, a function, an evaluation
//! order, and keyword parameters. Parameters named `id_<name>` are input
//! series; `id_<name>_sync` marks the anchor whose timestamps the output
//! follows (default: the first input). Everything else is a scalar.
//!
//! Functions come in two kinds:
//!
//! - **Series** functions receive the synchronized input columns and return
//!   one value per row. `averaging_hours` (with optional `rolling_average`
//!   and `time_label`) averages the inputs first; see [`Averaging`].
//! - **Source** functions take no synchronized inputs and produce their own
//!   `(ts, value)` pairs (time averages, external observations).
//!
//! Functions are looked up in a [`FunctionRegistry`] built once from an
//! ordered list of [`FunctionProvider`]s; the first provider to define a name
//! wins.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Instant;

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use crate::clock::unix_now;
use crate::error::{Error, Result};
use crate::params::{ID_PREFIX, ParamValue, Params, SYNC_SUFFIX};
use crate::raw_state::RawStateStore;
use crate::reading::{KeyedReading, Reading, normalize_key, validate_key};
use crate::store::TimeSeriesStore;
use crate::sync::{Averaging, SyncEngine};

/// Default reach-back window (minutes).
pub const DEFAULT_REACH_BACK_MINS: i64 = 480;

// ---------------------------------------------------------------------------
// Specs
// ---------------------------------------------------------------------------

/// One calculated field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalculatedFieldSpec {
    /// Series key the results are stored under.
    pub output: String,
    pub function: String,
    /// Lower orders run first.
    #[serde(default)]
    pub order: i32,
    #[serde(default)]
    pub params: Params,
}

impl CalculatedFieldSpec {
    pub fn new(output: impl Into<String>, function: impl Into<String>, order: i32, params: Params) -> Self {
        Self {
            output: output.into(),
            function: function.into(),
            order,
            params,
        }
    }

    /// Every series key this spec might read: `id_` inputs plus any other
    /// text parameter, since source functions take keys as plain parameters.
    fn referenced_keys(&self) -> HashSet<String> {
        self.params
            .iter()
            .filter_map(|(_, v)| match v {
                ParamValue::Text(s) => Some(normalize_key(s)),
                _ => None,
            })
            .collect()
    }
}

/// Input series split out of a spec's parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct SplitParams {
    /// `(parameter name, series key)`, anchor first.
    pub inputs: Vec<(String, String)>,
    pub scalars: Params,
}

/// Separate `id_` parameters from scalars and put the anchor first.
pub fn split_params(params: &Params) -> Result<SplitParams> {
    let mut inputs = Vec::new();
    let mut anchor: Option<(String, String)> = None;
    let mut scalars = Params::new();

    for (name, value) in params.iter() {
        let Some(stripped) = name.strip_prefix(ID_PREFIX) else {
            scalars.insert(name, value.clone());
            continue;
        };
        let key = value.as_text();
        match stripped.strip_suffix(SYNC_SUFFIX) {
            Some(base) => {
                if anchor.is_some() {
                    return Err(Error::Params(format!(
                        "more than one synchronization anchor (second is '{name}')"
                    )));
                }
                anchor = Some((base.to_string(), key));
            }
            None => inputs.push((stripped.to_string(), key)),
        }
    }
    if let Some(a) = anchor {
        inputs.insert(0, a);
    }
    Ok(SplitParams { inputs, scalars })
}

// ---------------------------------------------------------------------------
// Function traits
// ---------------------------------------------------------------------------

/// Static description of a calculation function.
#[derive(Debug, Clone)]
pub struct FunctionInfo {
    pub name: &'static str,
    pub description: &'static str,
}

/// A scalar or a synchronized column, as seen by a series function.
#[derive(Debug, Clone, Copy)]
pub enum Arg<'a> {
    Series(&'a [f64]),
    Scalar(f64),
}

impl Arg<'_> {
    /// Value for row `i`.
    pub fn at(&self, i: usize) -> f64 {
        match self {
            Arg::Series(v) => v.get(i).copied().unwrap_or(f64::NAN),
            Arg::Scalar(x) => *x,
        }
    }
}

/// Synchronized inputs handed to a [`SeriesFunction`].
pub struct SeriesInput<'a> {
    rows: usize,
    columns: HashMap<&'a str, &'a [f64]>,
    scalars: &'a Params,
}

impl<'a> SeriesInput<'a> {
    pub fn new(rows: usize, columns: HashMap<&'a str, &'a [f64]>, scalars: &'a Params) -> Self {
        Self {
            rows,
            columns,
            scalars,
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn scalars(&self) -> &Params {
        self.scalars
    }

    /// `name` as a series if one was synchronized, else as a scalar parameter.
    pub fn arg(&self, name: &str) -> Result<Arg<'a>> {
        match self.columns.get(name) {
            Some(col) => Ok(Arg::Series(*col)),
            None => Ok(Arg::Scalar(self.scalars.f64_required(name)?)),
        }
    }

    /// Like [`SeriesInput::arg`] with a scalar fallback.
    pub fn arg_or(&self, name: &str, default: f64) -> Result<Arg<'a>> {
        match self.columns.get(name) {
            Some(col) => Ok(Arg::Series(*col)),
            None => Ok(Arg::Scalar(self.scalars.f64_or(name, default)?)),
        }
    }

    /// `name` only if it is present at all (series or scalar).
    pub fn optional(&self, name: &str) -> Result<Option<Arg<'a>>> {
        if self.columns.contains_key(name) || self.scalars.contains(name) {
            self.arg(name).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Apply `f` to each row.
    pub fn map_rows(&self, mut f: impl FnMut(usize) -> f64) -> Vec<f64> {
        (0..self.rows).map(&mut f).collect()
    }
}

/// Everything a [`SourceFunction`] may consult.
pub struct SourceContext<'a> {
    pub store: &'a TimeSeriesStore,
    pub raw_state: &'a RawStateStore,
    pub output_key: &'a str,
    pub params: &'a Params,
    /// Reach-back window in seconds.
    pub reach_back: i64,
    pub now: i64,
}

impl SourceContext<'_> {
    /// Timestamp new results must be strictly after: the output's last
    /// reading, bounded below by the reach-back window.
    pub fn last_output_ts(&self) -> i64 {
        let last = self.store.last_read(self.output_key).map_or(0, |r| r.ts);
        last.max(self.now - self.reach_back)
    }

    /// Text parameter that must be present.
    pub fn required_text(&self, name: &str) -> Result<String> {
        self.params
            .text(name)
            .ok_or_else(|| Error::Params(format!("missing required parameter '{name}'")))
    }
}

/// A function computing one value per synchronized row.
pub trait SeriesFunction: Send + Sync {
    fn info(&self) -> &FunctionInfo;
    fn compute(&self, input: &SeriesInput<'_>) -> Result<Vec<f64>>;
}

/// A function producing its own timestamps.
pub trait SourceFunction: Send + Sync {
    fn info(&self) -> &FunctionInfo;
    fn produce(&self, ctx: &SourceContext<'_>) -> Result<Vec<Reading>>;
}

/// A registered function of either kind.
#[derive(Clone)]
pub enum CalcFunction {
    Series(Arc<dyn SeriesFunction>),
    Source(Arc<dyn SourceFunction>),
}

impl CalcFunction {
    pub fn info(&self) -> &FunctionInfo {
        match self {
            CalcFunction::Series(f) => f.info(),
            CalcFunction::Source(f) => f.info(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.info().name
    }
}

/// A named group of calculation functions.
pub trait FunctionProvider: Send + Sync {
    fn name(&self) -> &'static str;
    fn functions(&self) -> Vec<CalcFunction>;
}

/// Name → function map, fixed at construction.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, CalcFunction>,
}

impl FunctionRegistry {
    /// Register every function of every provider; earlier providers win.
    pub fn from_providers(providers: &[Box<dyn FunctionProvider>]) -> Self {
        let mut functions: HashMap<String, CalcFunction> = HashMap::new();
        for provider in providers {
            for f in provider.functions() {
                let name = f.name().to_string();
                if functions.contains_key(&name) {
                    debug!(
                        "function '{name}' from provider '{}' shadowed by an earlier provider",
                        provider.name()
                    );
                    continue;
                }
                functions.insert(name, f);
            }
        }
        Self { functions }
    }

    pub fn get(&self, name: &str) -> Option<&CalcFunction> {
        self.functions.get(name.trim())
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Outcome of one spec within a [`RunSummary`].
#[derive(Debug, Clone, Serialize)]
pub struct SpecResult {
    pub output: String,
    pub function: String,
    pub order: i32,
    /// Readings inserted, or the error message.
    pub result: std::result::Result<usize, String>,
    pub elapsed_ms: f64,
}

/// Per-spec results of [`CalculatedFieldEngine::run`], in evaluation order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub results: Vec<SpecResult>,
}

impl RunSummary {
    pub fn inserted(&self) -> usize {
        self.results.iter().filter_map(|r| r.result.as_ref().ok()).sum()
    }

    pub fn failed(&self) -> usize {
        self.results.iter().filter(|r| r.result.is_err()).count()
    }

    pub fn get(&self, output: &str) -> Option<&SpecResult> {
        self.results.iter().find(|r| r.output == output)
    }
}

/// Evaluates calculated fields against a store.
pub struct CalculatedFieldEngine {
    store: Arc<TimeSeriesStore>,
    raw_state: Arc<RawStateStore>,
    registry: FunctionRegistry,
    reach_back_secs: i64,
}

impl CalculatedFieldEngine {
    pub fn new(
        store: Arc<TimeSeriesStore>,
        raw_state: Arc<RawStateStore>,
        registry: FunctionRegistry,
        reach_back_mins: i64,
    ) -> Self {
        Self {
            store,
            raw_state,
            registry,
            reach_back_secs: reach_back_mins * 60,
        }
    }

    pub fn registry(&self) -> &FunctionRegistry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<TimeSeriesStore> {
        &self.store
    }

    /// Compute and store new readings for `spec`. Returns how many were stored.
    pub fn evaluate(&self, spec: &CalculatedFieldSpec) -> Result<usize> {
        self.evaluate_at(spec, unix_now())
    }

    /// [`CalculatedFieldEngine::evaluate`] with an explicit current time.
    pub fn evaluate_at(&self, spec: &CalculatedFieldSpec, now: i64) -> Result<usize> {
        validate_key(&spec.output)?;
        let split = split_params(&spec.params)?;
        let function = self
            .registry
            .get(&spec.function)
            .ok_or_else(|| Error::UnknownFunction(spec.function.trim().to_string()))?;

        let readings: Vec<KeyedReading> = match function {
            CalcFunction::Series(f) => {
                let Some((_, anchor_key)) = split.inputs.first() else {
                    return Err(Error::function(
                        f.info().name,
                        "needs at least one id_ input series",
                    ));
                };
                let companions: Vec<&str> =
                    split.inputs[1..].iter().map(|(_, k)| k.as_str()).collect();
                let sync = SyncEngine::new(&self.store);
                let earliest = now - self.reach_back_secs;
                let frame = match Averaging::from_params(&split.scalars)? {
                    Some(avg) => sync.build_averaged(
                        anchor_key,
                        &companions,
                        earliest,
                        Some(&spec.output),
                        &avg,
                    ),
                    None => sync.build(anchor_key, &companions, earliest, Some(&spec.output)),
                };
                if frame.is_empty() {
                    debug!("'{}': no new synchronized rows", spec.output);
                    return Ok(0);
                }

                let mut columns = HashMap::new();
                for (name, key) in &split.inputs {
                    if let Some(col) = frame.column(key) {
                        columns.insert(name.as_str(), col);
                    }
                }
                let input = SeriesInput::new(frame.len(), columns, &split.scalars);
                let values = f.compute(&input)?;
                if values.len() != frame.len() {
                    return Err(Error::function(
                        f.info().name,
                        format!("returned {} values for {} rows", values.len(), frame.len()),
                    ));
                }
                frame
                    .timestamps
                    .iter()
                    .zip(values)
                    .map(|(&ts, v)| KeyedReading::new(&spec.output, ts, v))
                    .collect()
            }
            CalcFunction::Source(f) => {
                if !split.inputs.is_empty() {
                    return Err(Error::function(
                        f.info().name,
                        "does not take id_ input series",
                    ));
                }
                let ctx = SourceContext {
                    store: &self.store,
                    raw_state: &self.raw_state,
                    output_key: &spec.output,
                    params: &split.scalars,
                    reach_back: self.reach_back_secs,
                    now,
                };
                f.produce(&ctx)?
                    .into_iter()
                    .map(|r| KeyedReading::new(&spec.output, r.ts, r.val))
                    .collect()
            }
        };

        let outcome = self.store.insert_batch(&readings);
        debug!(
            "'{}': stored {} readings ({} rejected)",
            spec.output, outcome.accepted, outcome.rejected
        );
        Ok(outcome.accepted)
    }

    /// Evaluate every spec, lowest `order` first.
    ///
    /// Within one order level, specs that neither read nor write each other's
    /// outputs run in parallel; the rest follow one at a time, each after the
    /// same-level specs it reads from. A failing spec is logged and recorded; it never stops the run.
    pub fn run(&self, specs: &[CalculatedFieldSpec]) -> RunSummary {
        self.run_at(specs, unix_now())
    }

    /// [`CalculatedFieldEngine::run`] with an explicit current time.
    pub fn run_at(&self, specs: &[CalculatedFieldSpec], now: i64) -> RunSummary {
        let mut levels: BTreeMap<i32, Vec<&CalculatedFieldSpec>> = BTreeMap::new();
        for spec in specs {
            levels.entry(spec.order).or_default().push(spec);
        }

        let t0 = Instant::now();
        let mut summary = RunSummary::default();
        for (order, level) in levels {
            let (parallel, serial) = partition_level(&level);
            debug!(
                "order {order}: {} parallel, {} serial",
                parallel.len(),
                serial.len()
            );

            let results: Vec<SpecResult> = std::thread::scope(|s| {
                let handles: Vec<_> = parallel
                    .iter()
                    .map(|spec| s.spawn(move || self.evaluate_logged(spec, now)))
                    .collect();
                handles
                    .into_iter()
                    .zip(&parallel)
                    .map(|(h, spec)| {
                        h.join()
                            .unwrap_or_else(|_| failed_result(spec, "evaluation thread panicked", 0.0))
                    })
                    .collect()
            });
            summary.results.extend(results);

            for spec in serial {
                summary.results.push(self.evaluate_logged(spec, now));
            }
        }

        info!(
            "calculated fields: {} specs, {} readings stored, {} failed in {:.0} ms",
            summary.results.len(),
            summary.inserted(),
            summary.failed(),
            t0.elapsed().as_secs_f64() * 1000.0
        );
        summary
    }

    fn evaluate_logged(&self, spec: &CalculatedFieldSpec, now: i64) -> SpecResult {
        let t0 = Instant::now();
        let result = match catch_unwind(AssertUnwindSafe(|| self.evaluate_at(spec, now))) {
            Ok(Ok(n)) => Ok(n),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err("function panicked".to_string()),
        };
        let elapsed_ms = t0.elapsed().as_secs_f64() * 1000.0;
        match result {
            Ok(n) => SpecResult {
                output: spec.output.clone(),
                function: spec.function.clone(),
                order: spec.order,
                result: Ok(n),
                elapsed_ms,
            },
            Err(e) => {
                error!(
                    "calculated field '{}' ({}; {}) failed: {e}",
                    spec.output, spec.function, spec.params
                );
                failed_result(spec, &e, elapsed_ms)
            }
        }
    }
}

fn failed_result(spec: &CalculatedFieldSpec, reason: &str, elapsed_ms: f64) -> SpecResult {
    SpecResult {
        output: spec.output.clone(),
        function: spec.function.clone(),
        order: spec.order,
        result: Err(reason.to_string()),
        elapsed_ms,
    }
}

/// Split one order level into specs that can run concurrently and specs that
/// must run serially because they share keys with another spec in the level.
fn partition_level<'a>(
    level: &[&'a CalculatedFieldSpec],
) -> (Vec<&'a CalculatedFieldSpec>, Vec<&'a CalculatedFieldSpec>) {
    let outputs: Vec<String> = level.iter().map(|s| normalize_key(&s.output)).collect();
    let mut parallel = Vec::new();
    let mut serial = Vec::new();
    for (i, spec) in level.iter().enumerate() {
        let reads = spec.referenced_keys();
        let conflicts = outputs.iter().enumerate().any(|(j, out)| {
            j != i && (reads.contains(out) || *out == outputs[i])
        });
        if conflicts {
            serial.push(*spec);
        } else {
            parallel.push(*spec);
        }
    }
    (parallel, order_serial(serial))
}

/// Order serial specs so each runs after every same-level spec whose output it
/// reads. Ties keep declared order; specs caught in a cycle run last in
/// declared order.
fn order_serial(serial: Vec<&CalculatedFieldSpec>) -> Vec<&CalculatedFieldSpec> {
    let outputs: Vec<String> = serial.iter().map(|s| normalize_key(&s.output)).collect();
    let deps: Vec<Vec<usize>> = serial
        .iter()
        .enumerate()
        .map(|(i, spec)| {
            let reads = spec.referenced_keys();
            (0..serial.len())
                .filter(|&j| j != i && reads.contains(&outputs[j]) && outputs[j] != outputs[i])
                .collect()
        })
        .collect();

    let mut done = vec![false; serial.len()];
    let mut ordered = Vec::with_capacity(serial.len());
    while ordered.len() < serial.len() {
        let ready = (0..serial.len()).find(|&i| !done[i] && deps[i].iter().all(|&d| done[d]));
        match ready {
            Some(i) => {
                done[i] = true;
                ordered.push(serial[i]);
            }
            None => {
                let cycle: Vec<&str> = (0..serial.len())
                    .filter(|&i| !done[i])
                    .map(|i| serial[i].output.as_str())
                    .collect();
                warn!("calculated fields depend on each other in a cycle: {cycle:?}");
                for i in 0..serial.len() {
                    if !done[i] {
                        done[i] = true;
                        ordered.push(serial[i]);
                    }
                }
            }
        }
    }
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Doubler;

    static DOUBLER_INFO: FunctionInfo = FunctionInfo {
        name: "double",
        description: "2 * a",
    };

    impl SeriesFunction for Doubler {
        fn info(&self) -> &FunctionInfo {
            &DOUBLER_INFO
        }
        fn compute(&self, input: &SeriesInput<'_>) -> Result<Vec<f64>> {
            let a = input.arg("a")?;
            Ok(input.map_rows(|i| 2.0 * a.at(i)))
        }
    }

    struct Broken;

    static BROKEN_INFO: FunctionInfo = FunctionInfo {
        name: "broken",
        description: "always fails",
    };

    impl SeriesFunction for Broken {
        fn info(&self) -> &FunctionInfo {
            &BROKEN_INFO
        }
        fn compute(&self, _input: &SeriesInput<'_>) -> Result<Vec<f64>> {
            Err(Error::function("broken", "boom"))
        }
    }

    struct Constant;

    static CONSTANT_INFO: FunctionInfo = FunctionInfo {
        name: "constant",
        description: "one reading at now",
    };

    impl SourceFunction for Constant {
        fn info(&self) -> &FunctionInfo {
            &CONSTANT_INFO
        }
        fn produce(&self, ctx: &SourceContext<'_>) -> Result<Vec<Reading>> {
            Ok(vec![Reading::new(ctx.now, ctx.params.f64_or("value", 1.0)?)])
        }
    }

    struct TestProvider;

    impl FunctionProvider for TestProvider {
        fn name(&self) -> &'static str {
            "test"
        }
        fn functions(&self) -> Vec<CalcFunction> {
            vec![
                CalcFunction::Series(Arc::new(Doubler)),
                CalcFunction::Series(Arc::new(Broken)),
                CalcFunction::Source(Arc::new(Constant)),
            ]
        }
    }

    struct ShadowProvider;

    impl FunctionProvider for ShadowProvider {
        fn name(&self) -> &'static str {
            "shadow"
        }
        fn functions(&self) -> Vec<CalcFunction> {
            vec![CalcFunction::Series(Arc::new(Broken))]
        }
    }

    const NOW: i64 = 100_000;

    fn engine() -> (tempfile::TempDir, Arc<TimeSeriesStore>, CalculatedFieldEngine) {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(TimeSeriesStore::open(tmp.path()).unwrap());
        let providers: Vec<Box<dyn FunctionProvider>> = vec![Box::new(TestProvider)];
        let engine = CalculatedFieldEngine::new(
            Arc::clone(&store),
            Arc::new(RawStateStore::in_memory()),
            FunctionRegistry::from_providers(&providers),
            DEFAULT_REACH_BACK_MINS,
        );
        (tmp, store, engine)
    }

    fn spec(output: &str, function: &str, order: i32, params: &str) -> CalculatedFieldSpec {
        CalculatedFieldSpec::new(output, function, order, Params::parse(params).unwrap())
    }

    // -----------------------------------------------------------------------
    // Parameter splitting
    // -----------------------------------------------------------------------

    #[test]
    fn test_split_params_anchor_defaults_to_first() {
        let s = split_params(&Params::parse("id_b=kb, scale=2, id_a=ka").unwrap()).unwrap();
        assert_eq!(
            s.inputs,
            vec![("b".into(), "kb".into()), ("a".into(), "ka".into())]
        );
        assert_eq!(s.scalars.f64_or("scale", 0.0).unwrap(), 2.0);
    }

    #[test]
    fn test_split_params_sync_moves_to_front() {
        let s = split_params(&Params::parse("id_b=kb, id_a_sync=ka").unwrap()).unwrap();
        assert_eq!(s.inputs[0], ("a".into(), "ka".into()));
        assert_eq!(s.inputs[1], ("b".into(), "kb".into()));
    }

    #[test]
    fn test_split_params_two_anchors_is_error() {
        let r = split_params(&Params::parse("id_a_sync=ka, id_b_sync=kb").unwrap());
        assert!(matches!(r, Err(Error::Params(_))));
    }

    // -----------------------------------------------------------------------
    // Registry
    // -----------------------------------------------------------------------

    #[test]
    fn test_registry_first_provider_wins() {
        let providers: Vec<Box<dyn FunctionProvider>> =
            vec![Box::new(ShadowProvider), Box::new(TestProvider)];
        let registry = FunctionRegistry::from_providers(&providers);
        assert_eq!(registry.names(), vec!["broken", "constant", "double"]);
        assert!(matches!(registry.get("double"), Some(CalcFunction::Series(_))));
        assert!(matches!(registry.get("constant"), Some(CalcFunction::Source(_))));
        assert!(registry.get("nope").is_none());
    }

    // -----------------------------------------------------------------------
    // evaluate
    // -----------------------------------------------------------------------

    #[test]
    fn test_evaluate_series_function() {
        let (_tmp, store, engine) = engine();
        store.insert("x", NOW - 100, 1.0);
        store.insert("x", NOW - 50, 2.0);
        let n = engine.evaluate_at(&spec("x2", "double", 0, "id_a=x"), NOW).unwrap();
        assert_eq!(n, 2);
        assert_eq!(
            store.range("x2", None, None),
            vec![Reading::new(NOW - 100, 2.0), Reading::new(NOW - 50, 4.0)]
        );
        // Idempotent: nothing new past the output's last reading.
        assert_eq!(engine.evaluate_at(&spec("x2", "double", 0, "id_a=x"), NOW).unwrap(), 0);
    }

    #[test]
    fn test_evaluate_scalar_stands_in_for_series() {
        let (_tmp, store, engine) = engine();
        store.insert("x", NOW - 10, 1.0);
        // 'a' is a scalar; 'x' only supplies timestamps.
        let n = engine
            .evaluate_at(&spec("out", "double", 0, "id_t=x, a=21"), NOW)
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(store.last_read("out"), Some(Reading::new(NOW - 10, 42.0)));
    }

    #[test]
    fn test_evaluate_empty_frame_is_zero() {
        let (_tmp, store, engine) = engine();
        store.insert("x", NOW - 10, 1.0);
        let n = engine
            .evaluate_at(&spec("out", "double", 0, "id_a=x, id_b=missing"), NOW)
            .unwrap();
        assert_eq!(n, 0);
        assert!(!store.key_exists("out"));
    }

    #[test]
    fn test_evaluate_respects_reach_back() {
        let (_tmp, store, engine) = engine();
        store.insert("x", NOW - DEFAULT_REACH_BACK_MINS * 60 - 1, 1.0);
        store.insert("x", NOW - 10, 1.0);
        assert_eq!(engine.evaluate_at(&spec("out", "double", 0, "id_a=x"), NOW).unwrap(), 1);
    }

    #[test]
    fn test_evaluate_source_function() {
        let (_tmp, store, engine) = engine();
        let n = engine
            .evaluate_at(&spec("c", "constant", 0, "value=7"), NOW)
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(store.last_read("c"), Some(Reading::new(NOW, 7.0)));
    }

    #[test]
    fn test_evaluate_errors() {
        let (_tmp, _store, engine) = engine();
        assert!(matches!(
            engine.evaluate_at(&spec("o", "nope", 0, ""), NOW),
            Err(Error::UnknownFunction(_))
        ));
        assert!(matches!(
            engine.evaluate_at(&spec("o", "double", 0, "a=1"), NOW),
            Err(Error::Function { .. })
        ));
        assert!(matches!(
            engine.evaluate_at(&spec("o", "constant", 0, "id_a=x"), NOW),
            Err(Error::Function { .. })
        ));
        assert!(matches!(
            engine.evaluate_at(&spec("_o", "constant", 0, ""), NOW),
            Err(Error::InvalidKey(_))
        ));
    }

    // -----------------------------------------------------------------------
    // run
    // -----------------------------------------------------------------------

    #[test]
    fn test_run_orders_and_isolates_failures() {
        let (_tmp, store, engine) = engine();
        store.insert("x", NOW - 10, 1.0);
        let specs = vec![
            spec("x8", "double", 3, "id_a=x4"),
            spec("bad", "broken", 1, "id_a=x"),
            spec("x2", "double", 1, "id_a=x"),
            spec("x4", "double", 2, "id_a=x2"),
        ];
        let summary = engine.run_at(&specs, NOW);
        assert_eq!(summary.results.len(), 4);
        assert_eq!(summary.failed(), 1);
        assert_eq!(summary.inserted(), 3);
        assert!(summary.get("bad").unwrap().result.is_err());
        assert_eq!(store.last_read("x8"), Some(Reading::new(NOW - 10, 8.0)));
    }

    #[test]
    fn test_run_same_level_dependency_runs_serially() {
        let (_tmp, store, engine) = engine();
        store.insert("x", NOW - 10, 1.0);
        let specs = vec![
            spec("x4", "double", 1, "id_a=x2"),
            spec("x2", "double", 1, "id_a=x"),
        ];
        let summary = engine.run_at(&specs, NOW);
        assert_eq!(summary.failed(), 0);
        // x2 is independent and runs first; x4 waits for it.
        assert_eq!(store.last_read("x4"), Some(Reading::new(NOW - 10, 4.0)));
    }

    #[test]
    fn test_run_same_level_chain_declared_in_reverse() {
        let (_tmp, store, engine) = engine();
        store.insert("x", NOW - 10, 1.0);
        let specs = vec![
            spec("x8", "double", 1, "id_a=x4"),
            spec("x4", "double", 1, "id_a=x2"),
            spec("x2", "double", 1, "id_a=x"),
        ];
        let summary = engine.run_at(&specs, NOW);
        assert_eq!(summary.failed(), 0);
        assert_eq!(
            summary.results.iter().map(|r| r.output.as_str()).collect::<Vec<_>>(),
            vec!["x2", "x4", "x8"]
        );
        assert_eq!(store.last_read("x8"), Some(Reading::new(NOW - 10, 8.0)));
    }

    #[test]
    fn test_order_serial_cycle_falls_back_to_declared_order() {
        let a = spec("a", "double", 0, "id_a=b");
        let b = spec("b", "double", 0, "id_a=a");
        let c = spec("c", "double", 0, "id_a=a");
        let ordered = order_serial(vec![&c, &a, &b]);
        assert_eq!(
            ordered.iter().map(|s| s.output.as_str()).collect::<Vec<_>>(),
            vec!["c", "a", "b"]
        );
    }

    #[test]
    fn test_partition_level() {
        let a = spec("a", "double", 0, "id_a=x");
        let b = spec("b", "double", 0, "id_a=y");
        let c = spec("c", "double", 0, "id_a=a");
        let level = vec![&a, &b, &c];
        let (parallel, serial) = partition_level(&level);
        // 'a' feeds 'c', so only 'c' has to wait.
        assert_eq!(
            parallel.iter().map(|s| s.output.as_str()).collect::<Vec<_>>(),
            vec!["a", "b"]
        );
        assert_eq!(
            serial.iter().map(|s| s.output.as_str()).collect::<Vec<_>>(),
            vec!["c"]
        );
    }
}
