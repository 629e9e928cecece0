//! # sensorlog-core
//!
//! Storage and processing for building sensor telemetry.
//!
//! Readings arrive as `(timestamp, key, value)` triples from devices,
//! gateways, and the HTTP API. Each one is decoded, optionally transformed
//! (linear scaling, pulse-count rates, free-form expressions over a
//! cumulative counter), and stored in a per-key [`TimeSeriesStore`].
//! Calculated fields then derive new series from stored ones on a schedule.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use sensorlog_core::{Ingestor, RawStateStore, TimeSeriesStore, TransformEngine, TransformSpec};
//!
//! let store = Arc::new(TimeSeriesStore::open("data").unwrap());
//! let raw_state = Arc::new(RawStateStore::open("data").unwrap());
//! let mut transforms = TransformEngine::new(Arc::clone(&store), raw_state);
//! transforms.register("meter_A", TransformSpec::parse("expression", "expression=rate*60").unwrap());
//!
//! let ingestor = Ingestor::new(Arc::clone(&store), transforms);
//! ingestor.insert_reading(Some(1_700_000_000), "temp_1", 21.5);
//! println!("{:?}", store.last_read("temp_1"));
//! ```
//!
//! ## Architecture
//!
//! Ingest → Transform → Store → Sync → Calculated fields → Store
//!
//! Transforms that need the previous raw counter value keep it in the
//! [`RawStateStore`]. Calculated fields that combine several series align
//! them onto one anchor series with the [`SyncEngine`] first.

pub mod backup;
pub mod cache;
pub mod calc;
pub mod clock;
pub mod config;
pub mod error;
pub mod expr;
pub mod functions;
pub mod ingest;
pub mod lock;
pub mod params;
pub mod raw_state;
pub mod reading;
pub mod store;
pub mod sync;
pub mod transform;

pub use backup::{BackupConfig, BackupReport, RestoreReport};
pub use cache::ObservationCache;
pub use calc::{
    CalcFunction, CalculatedFieldEngine, CalculatedFieldSpec, FunctionInfo, FunctionProvider,
    FunctionRegistry, RunSummary, SeriesFunction, SourceFunction, SpecResult,
};
pub use config::{Config, ScheduleConfig};
pub use error::{Error, Result};
pub use expr::Expression;
pub use functions::{BuiltinFunctions, Observation, ObservationSource};
pub use ingest::{IngestRecord, Ingestor};
pub use lock::DirLock;
pub use params::{ParamValue, Params};
pub use raw_state::RawStateStore;
pub use reading::{InsertOutcome, KeyedReading, RawValue, Reading};
pub use store::{StoreOptions, TimeSeriesStore};
pub use sync::{Averaging, SyncEngine, SyncedFrame, TimeLabel};
pub use transform::{TransformEngine, TransformOutcome, TransformSpec, Transformed};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
