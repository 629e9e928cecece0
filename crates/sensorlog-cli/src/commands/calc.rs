//! `sensorlog calc`: evaluate calculated fields once or on an interval.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use log::{info, warn};
use sensorlog_core::{CalculatedFieldSpec, Config, Error, Result, RunSummary};

/// Keep only the specs whose output is listed in `only` (comma-separated).
fn select_specs(specs: &[CalculatedFieldSpec], only: Option<&str>) -> Vec<CalculatedFieldSpec> {
    let Some(only) = only else {
        return specs.to_vec();
    };
    let wanted: Vec<String> = only
        .split(',')
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect();
    specs
        .iter()
        .filter(|s| wanted.contains(&s.output.trim().to_lowercase()))
        .cloned()
        .collect()
}

fn print_summary(summary: &RunSummary) {
    println!(
        "{:<28} {:<24} {:>5} {:>9} {:>9}",
        "output", "function", "order", "stored", "ms"
    );
    println!("{}", "-".repeat(79));
    for r in &summary.results {
        let stored = match &r.result {
            Ok(n) => n.to_string(),
            Err(_) => "FAILED".to_string(),
        };
        println!(
            "{:<28} {:<24} {:>5} {:>9} {:>9.1}",
            r.output, r.function, r.order, stored, r.elapsed_ms
        );
        if let Err(e) = &r.result {
            println!("    {e}");
        }
    }
    println!(
        "{} readings stored, {} of {} specs failed",
        summary.inserted(),
        summary.failed(),
        summary.results.len()
    );
}

pub fn run(config: &Config, every: Option<&str>, only: Option<&str>, list_functions: bool) -> Result<()> {
    let (store, raw_state) = config.open_stores()?;
    let engine = config.calc_engine(Arc::clone(&store), raw_state, None);

    if list_functions {
        for name in engine.registry().names() {
            if let Some(f) = engine.registry().get(name) {
                println!("{name:<24} {}", f.info().description);
            }
        }
        return Ok(());
    }

    let specs = select_specs(&config.calculated, only);
    if specs.is_empty() {
        println!("no calculated fields to evaluate");
        return Ok(());
    }

    let Some(every) = every else {
        let summary = engine.run(&specs);
        store.flush()?;
        print_summary(&summary);
        return Ok(());
    };

    let interval = super::parse_duration(every)
        .filter(|d| !d.is_zero())
        .ok_or_else(|| Error::Params(format!("--every: invalid interval '{every}'")))?;

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    }) {
        warn!("could not install Ctrl+C handler: {e}");
    }

    info!(
        "evaluating {} calculated fields every {:.0}s until Ctrl+C",
        specs.len(),
        interval.as_secs_f64()
    );
    while running.load(Ordering::SeqCst) {
        let started = Instant::now();
        let summary = engine.run(&specs);
        if let Err(e) = store.flush() {
            warn!("flush after calculation pass failed: {e}");
        }
        print_summary(&summary);
        println!();

        while running.load(Ordering::SeqCst) && started.elapsed() < interval {
            std::thread::sleep(Duration::from_millis(200).min(interval));
        }
    }
    println!("stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sensorlog_core::Params;

    fn spec(output: &str) -> CalculatedFieldSpec {
        CalculatedFieldSpec::new(output, "linear", 0, Params::new())
    }

    #[test]
    fn test_select_all_without_filter() {
        let specs = vec![spec("a"), spec("b")];
        assert_eq!(select_specs(&specs, None).len(), 2);
    }

    #[test]
    fn test_select_by_output_case_insensitive() {
        let specs = vec![spec("Heat_Flow"), spec("runtime"), spec("cop")];
        let picked = select_specs(&specs, Some("heat_flow, COP"));
        let names: Vec<&str> = picked.iter().map(|s| s.output.as_str()).collect();
        assert_eq!(names, vec!["Heat_Flow", "cop"]);
    }

    #[test]
    fn test_select_unknown_output_is_empty() {
        let specs = vec![spec("a")];
        assert!(select_specs(&specs, Some("zzz")).is_empty());
    }
}
