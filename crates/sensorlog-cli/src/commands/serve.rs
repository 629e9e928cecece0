//! `sensorlog serve`: run the HTTP ingestion and query server together with
//! the calculated-field and backup schedules.

use std::sync::Arc;
use std::time::Duration;

use log::info;
use sensorlog_core::{Config, Error, Ingestor, Result};
use sensorlog_server::{BackupJob, CalcJob, Jobs};

/// Resolve a `--*-every` override against the configured interval.
/// `0` disables the job.
fn job_interval(
    flag: &str,
    arg: Option<&str>,
    configured: Option<Duration>,
) -> Result<Option<Duration>> {
    match arg {
        None => Ok(configured),
        Some(s) => super::parse_duration(s)
            .map(|d| (!d.is_zero()).then_some(d))
            .ok_or_else(|| Error::Params(format!("--{flag}: invalid interval '{s}'"))),
    }
}

fn describe(every: Option<Duration>) -> String {
    match every {
        Some(d) => format!("every {}s", d.as_secs()),
        None => "off".to_string(),
    }
}

pub fn run(
    config: &Config,
    host: &str,
    port: u16,
    calc_every: Option<&str>,
    backup_every: Option<&str>,
) -> Result<()> {
    let calc_every = job_interval("calc-every", calc_every, config.schedule.calc_interval())?;
    let backup_every =
        job_interval("backup-every", backup_every, config.schedule.backup_interval())?;

    // One set of store handles for the handlers and both jobs.
    let (store, raw_state) = config.open_stores()?;
    let transforms = config.transform_engine(Arc::clone(&store), Arc::clone(&raw_state));
    let ingestor = Ingestor::new(Arc::clone(&store), transforms);

    let mut jobs = Jobs::none();
    match calc_every {
        Some(every) if !config.calculated.is_empty() => {
            let engine = config.calc_engine(Arc::clone(&store), Arc::clone(&raw_state), None);
            jobs.calc = Some(CalcJob::new(Arc::new(engine), config.calculated.clone(), every));
        }
        Some(_) => info!("no calculated fields configured, calc schedule not started"),
        None => {}
    }
    if let Some(every) = backup_every {
        jobs.backup = Some(BackupJob::new(store, raw_state, config.backup.clone(), every));
    }

    let base = format!("http://{host}:{port}");
    println!("sensorlog server v{}", sensorlog_core::VERSION);
    println!("   {base}");
    println!("   data dir:   {}", config.data_dir.display());
    println!("   transforms: {}", ingestor.transforms().len());
    println!("   series:     {}", ingestor.store().keys().len());
    println!(
        "   calc:       {} ({} fields)",
        describe(jobs.calc.as_ref().map(CalcJob::every)),
        config.calculated.len()
    );
    println!(
        "   backup:     {} -> {}",
        describe(jobs.backup.as_ref().map(BackupJob::every)),
        config.backup.dir.display()
    );
    println!();
    println!("   Endpoints:");
    println!("     GET|POST /api/v1/readings/store/{{key}}?val=&ts=   Store one reading");
    println!("     POST     /api/v1/readings/store                   Store [[ts, key, val], ...]");
    println!("     GET      /api/v1/readings/{{key}}?start=&end=      Readings in a range");
    println!("     GET      /api/v1/readings/{{key}}/last?n=          Latest readings");
    println!("     GET      /api/v1/sensors                          Stored series");
    println!("     GET      /health                                  Health check");
    println!();
    println!("   Examples:");
    println!("     curl '{base}/api/v1/readings/store/temp_1?val=21.5'");
    println!("     curl {base}/api/v1/readings/temp_1/last");
    println!();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(sensorlog_server::run_server(ingestor, jobs, host, port))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_interval_uses_config_without_flag() {
        let configured = Some(Duration::from_secs(600));
        assert_eq!(job_interval("calc-every", None, configured).unwrap(), configured);
        assert_eq!(job_interval("calc-every", None, None).unwrap(), None);
    }

    #[test]
    fn test_job_interval_flag_overrides_and_zero_disables() {
        let configured = Some(Duration::from_secs(600));
        assert_eq!(
            job_interval("calc-every", Some("30s"), configured).unwrap(),
            Some(Duration::from_secs(30))
        );
        assert_eq!(job_interval("calc-every", Some("0"), configured).unwrap(), None);
        assert_eq!(
            job_interval("backup-every", Some("24h"), None).unwrap(),
            Some(Duration::from_secs(86_400))
        );
    }

    #[test]
    fn test_job_interval_rejects_garbage() {
        assert!(matches!(
            job_interval("calc-every", Some("soon"), None),
            Err(Error::Params(_))
        ));
    }
}
