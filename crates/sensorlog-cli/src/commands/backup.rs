//! `sensorlog backup` and `sensorlog restore`.

use std::path::{Path, PathBuf};

use sensorlog_core::backup;
use sensorlog_core::clock::format_iso8601;
use sensorlog_core::{BackupConfig, Config, Error, Result};

pub fn run(config: &Config, dir: Option<PathBuf>, retention_days: Option<u32>) -> Result<()> {
    let backup_config = BackupConfig {
        dir: dir.unwrap_or_else(|| config.backup.dir.clone()),
        retention_days: retention_days.unwrap_or(config.backup.retention_days),
    };
    let (store, raw_state) = config.open_stores()?;
    let report = backup::backup(&store, Some(raw_state.as_ref()), &backup_config)?;

    println!("Backup written");
    println!("  File:       {}", report.path.display());
    println!("  Series:     {}", report.series);
    println!("  Readings:   {}", report.readings);
    println!("  Raw state:  {} keys", report.raw_state_keys);
    println!(
        "  Retention:  {} days ({} expired backup(s) removed)",
        backup_config.retention_days,
        report.purged.len()
    );
    for p in &report.purged {
        println!("    - {}", p.display());
    }
    Ok(())
}

pub fn restore(config: &Config, path: &Path) -> Result<()> {
    if !path.exists() {
        return Err(Error::StorageUnavailable {
            path: path.display().to_string(),
            reason: "backup file not found".to_string(),
        });
    }
    let report = backup::restore(path, &config.data_dir)?;
    println!("Restored into {}", config.data_dir.display());
    println!("  Backup taken: {}", format_iso8601(report.created_at));
    println!("  Series:       {}", report.series);
    println!("  Readings:     {}", report.readings);
    println!("  Raw state:    {} keys", report.raw_state_keys);
    Ok(())
}
