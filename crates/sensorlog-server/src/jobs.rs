//! Periodic work that runs inside the server process.
//!
//! Both jobs share the server's store handles, so calculated outputs and
//! backups see exactly what the HTTP handlers wrote. The store work itself is
//! synchronous and fsyncs, so each pass runs on the blocking pool.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use sensorlog_core::backup::{self, BackupConfig, BackupReport};
use sensorlog_core::{
    CalculatedFieldEngine, CalculatedFieldSpec, Error, RawStateStore, Result, RunSummary,
    TimeSeriesStore,
};

/// Calculated-field evaluation on a fixed interval.
#[derive(Clone)]
pub struct CalcJob {
    engine: Arc<CalculatedFieldEngine>,
    specs: Arc<Vec<CalculatedFieldSpec>>,
    every: Duration,
}

impl CalcJob {
    pub fn new(
        engine: Arc<CalculatedFieldEngine>,
        specs: Vec<CalculatedFieldSpec>,
        every: Duration,
    ) -> Self {
        Self {
            engine,
            specs: Arc::new(specs),
            every,
        }
    }

    pub fn every(&self) -> Duration {
        self.every
    }

    pub fn spec_count(&self) -> usize {
        self.specs.len()
    }

    /// Evaluate every spec once and flush the store.
    pub async fn run_once(&self) -> Result<RunSummary> {
        let engine = Arc::clone(&self.engine);
        let specs = Arc::clone(&self.specs);
        blocking(move || {
            let summary = engine.run(&specs);
            engine.store().flush()?;
            Ok(summary)
        })
        .await
    }

    /// Run a pass immediately and then every `every` until aborted.
    /// A pass that overruns delays the next tick rather than bunching them.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match self.run_once().await {
                    Ok(summary) if summary.failed() > 0 => warn!(
                        "calculation pass: {} readings stored, {} of {} specs failed",
                        summary.inserted(),
                        summary.failed(),
                        summary.results.len()
                    ),
                    Ok(summary) => debug!(
                        "calculation pass: {} readings stored",
                        summary.inserted()
                    ),
                    Err(e) => error!("calculation pass failed: {e}"),
                }
            }
        })
    }
}

/// Backup of both stores on a fixed interval.
#[derive(Clone)]
pub struct BackupJob {
    store: Arc<TimeSeriesStore>,
    raw_state: Arc<RawStateStore>,
    config: BackupConfig,
    every: Duration,
}

impl BackupJob {
    pub fn new(
        store: Arc<TimeSeriesStore>,
        raw_state: Arc<RawStateStore>,
        config: BackupConfig,
        every: Duration,
    ) -> Self {
        Self {
            store,
            raw_state,
            config,
            every,
        }
    }

    pub fn every(&self) -> Duration {
        self.every
    }

    pub async fn run_once(&self) -> Result<BackupReport> {
        let store = Arc::clone(&self.store);
        let raw_state = Arc::clone(&self.raw_state);
        let config = self.config.clone();
        blocking(move || backup::backup(&store, Some(&raw_state), &config)).await
    }

    /// First backup one interval after start, then every `every`.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + self.every, self.every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match self.run_once().await {
                    Ok(report) => info!(
                        "backup written to {} ({} series, {} readings)",
                        report.path.display(),
                        report.series,
                        report.readings
                    ),
                    Err(e) => error!("backup failed: {e}"),
                }
            }
        })
    }
}

/// The jobs `run_server` starts next to the listener.
#[derive(Clone, Default)]
pub struct Jobs {
    pub calc: Option<CalcJob>,
    pub backup: Option<BackupJob>,
}

impl Jobs {
    pub fn none() -> Self {
        Self::default()
    }

    /// Start every configured job. Jobs with a zero interval are skipped.
    pub fn spawn(self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        if let Some(job) = self.calc.filter(|j| !j.every.is_zero()) {
            info!(
                "calculating {} fields every {}s",
                job.spec_count(),
                job.every.as_secs()
            );
            handles.push(job.spawn());
        }
        if let Some(job) = self.backup.filter(|j| !j.every.is_zero()) {
            info!(
                "backing up to {} every {}s",
                job.config.dir.display(),
                job.every.as_secs()
            );
            handles.push(job.spawn());
        }
        handles
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use sensorlog_core::clock::unix_now;
    use sensorlog_core::{Config, Params, Reading};

    fn stores(dir: &std::path::Path) -> (Arc<TimeSeriesStore>, Arc<RawStateStore>) {
        let config = Config {
            data_dir: dir.to_path_buf(),
            ..Config::default()
        };
        config.open_stores().unwrap()
    }

    fn doubling_job(
        store: &Arc<TimeSeriesStore>,
        raw_state: &Arc<RawStateStore>,
        every: Duration,
    ) -> CalcJob {
        let config = Config::default();
        let engine = config.calc_engine(Arc::clone(store), Arc::clone(raw_state), None);
        let spec = CalculatedFieldSpec::new(
            "double",
            "linear",
            0,
            Params::parse("id_val=temp, slope=2, offset=0").unwrap(),
        );
        CalcJob::new(Arc::new(engine), vec![spec], every)
    }

    #[tokio::test]
    async fn test_calc_pass_writes_to_shared_store() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, raw_state) = stores(tmp.path());
        let now = unix_now();
        store.insert("temp", now - 120, 10.0);
        store.insert("temp", now - 60, 11.0);

        let job = doubling_job(&store, &raw_state, Duration::from_secs(60));
        let summary = job.run_once().await.unwrap();
        assert_eq!(summary.failed(), 0);
        assert_eq!(
            store.range("double", None, None),
            vec![Reading::new(now - 120, 20.0), Reading::new(now - 60, 22.0)]
        );

        // Outputs survive a restart of the owning process.
        drop(job);
        drop(store);
        drop(raw_state);
        let (store, _raw_state) = stores(tmp.path());
        assert_eq!(store.range("double", None, None).len(), 2);
    }

    #[tokio::test]
    async fn test_spawned_calc_job_picks_up_new_readings() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, raw_state) = stores(tmp.path());
        let handle = doubling_job(&store, &raw_state, Duration::from_millis(20)).spawn();

        let ts = unix_now() - 30;
        store.insert("temp", ts, 1.5);
        let mut seen = None;
        for _ in 0..200 {
            seen = store.last_read("double");
            if seen.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.abort();
        assert_eq!(seen, Some(Reading::new(ts, 3.0)));
    }

    #[tokio::test]
    async fn test_backup_pass_while_stores_are_open() {
        let tmp = tempfile::tempdir().unwrap();
        let data = tmp.path().join("data");
        let (store, raw_state) = stores(&data);
        store.insert("temp", 100, 0.1);
        raw_state.swap("meter", 100, 7.0);

        let config = BackupConfig {
            dir: tmp.path().join("backups"),
            ..BackupConfig::default()
        };
        let job = BackupJob::new(
            Arc::clone(&store),
            Arc::clone(&raw_state),
            config,
            Duration::from_secs(3600),
        );
        let report = job.run_once().await.unwrap();
        assert!(report.path.exists());
        assert_eq!(report.series, 1);
        assert_eq!(report.readings, 1);
        assert_eq!(report.raw_state_keys, 1);

        // The server keeps writing after the backup.
        store.insert("temp", 200, 0.2);
        assert_eq!(store.range("temp", None, None).len(), 2);
    }

    #[tokio::test]
    async fn test_zero_interval_jobs_are_not_started() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, raw_state) = stores(tmp.path());
        let jobs = Jobs {
            calc: Some(doubling_job(&store, &raw_state, Duration::ZERO)),
            backup: None,
        };
        assert!(jobs.spawn().is_empty());
        assert!(Jobs::none().spawn().is_empty());
    }
}
