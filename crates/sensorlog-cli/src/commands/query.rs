//! `sensorlog last`, `sensorlog range`, `sensorlog keys`.

use sensorlog_core::clock::format_iso8601;
use sensorlog_core::{Config, Reading, Result, TimeSeriesStore};

fn open_store(config: &Config) -> Result<TimeSeriesStore> {
    TimeSeriesStore::open(&config.data_dir)
}

fn print_readings(key: &str, readings: &[Reading], json: bool) -> Result<()> {
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "key": key,
                "count": readings.len(),
                "readings": readings,
            }))?
        );
        return Ok(());
    }
    if readings.is_empty() {
        println!("{key}: no readings");
        return Ok(());
    }
    println!("{:<22} {:>12} {:>16}", "time (UTC)", "ts", "value");
    println!("{}", "-".repeat(52));
    for r in readings {
        println!("{:<22} {:>12} {:>16}", format_iso8601(r.ts), r.ts, r.val);
    }
    println!("{} reading(s)", readings.len());
    Ok(())
}

pub fn last(config: &Config, key: &str, n: usize, json: bool) -> Result<()> {
    let store = open_store(config)?;
    print_readings(key, &store.last(key, n.max(1)), json)
}

pub fn range(
    config: &Config,
    key: &str,
    start: Option<&str>,
    end: Option<&str>,
    json: bool,
) -> Result<()> {
    let start = super::parse_time_arg("start", start)?;
    let end = super::parse_time_arg("end", end)?;
    let store = open_store(config)?;
    print_readings(key, &store.range(key, start, end), json)
}

pub fn keys(config: &Config) -> Result<()> {
    let store = open_store(config)?;
    let keys = store.keys();
    if keys.is_empty() {
        println!("no series in {}", config.data_dir.display());
        return Ok(());
    }
    println!("{:<32} {:<22} {:>16}", "series", "latest (UTC)", "value");
    println!("{}", "-".repeat(72));
    for key in &keys {
        match store.last_read(key) {
            Some(r) => println!("{key:<32} {:<22} {:>16}", format_iso8601(r.ts), r.val),
            None => println!("{key:<32} {:<22} {:>16}", "-", "-"),
        }
    }
    println!("{} series", keys.len());
    Ok(())
}
