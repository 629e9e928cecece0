//! Ingestion: decode, transform, and store incoming readings.

use std::sync::Arc;

use log::{debug, error, warn};
use serde::{Deserialize, Serialize};

use crate::clock::unix_now;
use crate::reading::{InsertOutcome, KeyedReading, RawValue, validate_key};
use crate::store::TimeSeriesStore;
use crate::transform::{TransformEngine, TransformOutcome};

/// One incoming record: `[ts | null, key, value]` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestRecord(pub Option<i64>, pub String, pub RawValue);

impl IngestRecord {
    pub fn new(ts: Option<i64>, key: impl Into<String>, value: impl Into<RawValue>) -> Self {
        Self(ts, key.into(), value.into())
    }
}

/// Front door for readings from devices, gateways, and the HTTP API.
pub struct Ingestor {
    store: Arc<TimeSeriesStore>,
    transforms: TransformEngine,
}

impl Ingestor {
    pub fn new(store: Arc<TimeSeriesStore>, transforms: TransformEngine) -> Self {
        Self { store, transforms }
    }

    pub fn store(&self) -> &Arc<TimeSeriesStore> {
        &self.store
    }

    pub fn transforms(&self) -> &TransformEngine {
        &self.transforms
    }

    /// Decode, transform, and store one reading. A missing timestamp means now.
    ///
    /// Missing or undecodable values are dropped and counted as rejected.
    /// Transform failures are logged and counted as rejected; vetoes are
    /// logged at warning level and counted as vetoed.
    pub fn insert_reading(&self, ts: Option<i64>, key: &str, value: impl Into<RawValue>) -> InsertOutcome {
        if let Err(e) = validate_key(key) {
            warn!("rejected reading: {e}");
            return InsertOutcome::rejected();
        }
        let value = value.into();
        let Some(val) = value.decode() else {
            debug!("dropped undecodable value {value:?} for '{key}'");
            return InsertOutcome::rejected();
        };
        let ts = ts.unwrap_or_else(unix_now);

        let transformed = match self.transforms.apply(key, ts, val) {
            Ok(t) => t,
            Err(e) => {
                error!("transform for '{key}' failed at {ts} (value {val}): {e}");
                return InsertOutcome::rejected();
            }
        };

        if let Some(companion) = transformed.companion {
            let stored = self.store.insert(&companion.key, companion.ts, companion.val);
            if stored.accepted == 0 {
                warn!("raw companion '{}' at {} not stored", companion.key, companion.ts);
            }
        }

        match transformed.outcome {
            TransformOutcome::Store(r) => self.store.insert(&r.key, r.ts, r.val),
            TransformOutcome::Veto(reason) => {
                warn!("reading for '{key}' at {ts} (value {val}) not stored: {reason}");
                InsertOutcome::vetoed()
            }
        }
    }

    /// Ingest many records with per-record isolation.
    ///
    /// Records for keys without a transform are committed together at the
    /// end; transformed keys are stored as they go because later records may
    /// depend on earlier ones.
    pub fn insert_many(&self, records: &[IngestRecord]) -> InsertOutcome {
        let mut outcome = InsertOutcome::default();
        let mut plain: Vec<KeyedReading> = Vec::new();
        let now = unix_now();

        for IngestRecord(ts, key, value) in records {
            if self.transforms.spec_for(key).is_some() {
                outcome.merge(self.insert_reading(Some(ts.unwrap_or(now)), key, value.clone()));
                continue;
            }
            match value.decode() {
                Some(val) => plain.push(KeyedReading::new(key.as_str(), ts.unwrap_or(now), val)),
                None => {
                    debug!("dropped undecodable value {value:?} for '{key}'");
                    outcome.rejected += 1;
                }
            }
        }

        outcome.merge(self.store.insert_batch(&plain));
        debug!(
            "ingested {} records: {} accepted, {} rejected, {} vetoed",
            records.len(),
            outcome.accepted,
            outcome.rejected,
            outcome.vetoed
        );
        outcome
    }
}
