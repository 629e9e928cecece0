//! `sensorlog.toml` configuration.
//!
//! ```toml
//! data_dir = "data"
//! reach_back_mins = 480
//!
//! [backup]
//! dir = "data/bak"
//! retention_days = 21
//!
//! [cache]
//! timeout_secs = 600
//!
//! [schedule]
//! calc_interval_secs = 600
//! backup_interval_secs = 86400
//!
//! [[transform]]
//! key = "meter_A"
//! function = "expression"
//! params = "expression=rate/60, rollover=65536"
//!
//! [[calculated]]
//! output = "heat_flow"
//! function = "fluid_heat_flow"
//! order = 1
//! params = { id_flow_sync = "flow_1", id_t_hot = "t_hot", id_t_cold = "t_cold", multiplier = 500.0 }
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::info;
use serde::{Deserialize, Serialize};

use crate::backup::BackupConfig;
use crate::cache::{DEFAULT_TIMEOUT, ObservationCache};
use crate::calc::{
    CalculatedFieldEngine, CalculatedFieldSpec, DEFAULT_REACH_BACK_MINS, FunctionProvider,
    FunctionRegistry,
};
use crate::error::Result;
use crate::functions::{BuiltinFunctions, ObservationSource};
use crate::params::Params;
use crate::raw_state::RawStateStore;
use crate::store::TimeSeriesStore;
use crate::transform::{TransformEngine, TransformSpec};

/// Default configuration file name.
pub const CONFIG_FILE: &str = "sensorlog.toml";

/// Observation cache settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub timeout_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_TIMEOUT.as_secs(),
        }
    }
}

impl CacheConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Background jobs run alongside the HTTP server. An interval of 0 disables
/// the job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub calc_interval_secs: u64,
    pub backup_interval_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            calc_interval_secs: 600,
            backup_interval_secs: 86_400,
        }
    }
}

impl ScheduleConfig {
    pub fn calc_interval(&self) -> Option<Duration> {
        (self.calc_interval_secs > 0).then(|| Duration::from_secs(self.calc_interval_secs))
    }

    pub fn backup_interval(&self) -> Option<Duration> {
        (self.backup_interval_secs > 0).then(|| Duration::from_secs(self.backup_interval_secs))
    }
}

/// A transform binding as written in the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformEntry {
    pub key: String,
    pub function: String,
    #[serde(default)]
    pub params: Params,
}

/// Whole-file configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub data_dir: PathBuf,
    pub reach_back_mins: i64,
    pub backup: BackupConfig,
    pub cache: CacheConfig,
    pub schedule: ScheduleConfig,
    #[serde(rename = "transform")]
    pub transforms: Vec<TransformEntry>,
    #[serde(rename = "calculated")]
    pub calculated: Vec<CalculatedFieldSpec>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            reach_back_mins: DEFAULT_REACH_BACK_MINS,
            backup: BackupConfig::default(),
            cache: CacheConfig::default(),
            schedule: ScheduleConfig::default(),
            transforms: Vec::new(),
            calculated: Vec::new(),
        }
    }
}

impl Config {
    /// Parse configuration text.
    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Load `path`; a missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!("no config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&text)?;
        info!(
            "loaded {} ({} transforms, {} calculated fields)",
            path.display(),
            config.transforms.len(),
            config.calculated.len()
        );
        Ok(config)
    }

    /// Open the reading store and raw state under `data_dir`.
    pub fn open_stores(&self) -> Result<(Arc<TimeSeriesStore>, Arc<RawStateStore>)> {
        let store = Arc::new(TimeSeriesStore::open(&self.data_dir)?);
        let raw_state = Arc::new(RawStateStore::open(&self.data_dir)?);
        Ok((store, raw_state))
    }

    /// A transform engine with every configured transform registered.
    pub fn transform_engine(
        &self,
        store: Arc<TimeSeriesStore>,
        raw_state: Arc<RawStateStore>,
    ) -> TransformEngine {
        let mut engine = TransformEngine::new(store, raw_state);
        for t in &self.transforms {
            engine.register(&t.key, TransformSpec::new(t.function.trim(), t.params.clone()));
        }
        engine
    }

    /// A calculated-field engine over the built-in functions. `observation`
    /// is only available when an observation source is supplied.
    pub fn calc_engine(
        &self,
        store: Arc<TimeSeriesStore>,
        raw_state: Arc<RawStateStore>,
        observations: Option<Arc<dyn ObservationSource>>,
    ) -> CalculatedFieldEngine {
        let mut builtins = BuiltinFunctions::new();
        if let Some(source) = observations {
            let cache = Arc::new(ObservationCache::with_timeout(self.cache.timeout()));
            builtins = builtins.with_observations(source, cache);
        }
        let providers: Vec<Box<dyn FunctionProvider>> = vec![Box::new(builtins)];
        CalculatedFieldEngine::new(
            store,
            raw_state,
            FunctionRegistry::from_providers(&providers),
            self.reach_back_mins,
        )
    }
}
