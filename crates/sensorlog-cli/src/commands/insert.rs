//! `sensorlog insert`: store one reading from the command line.

use sensorlog_core::{Config, Error, RawValue, Result};

pub fn run(config: &Config, key: &str, value: &str, ts: Option<&str>) -> Result<()> {
    let ts = super::parse_time_arg("ts", ts)?;
    let ingestor = super::make_ingestor(config)?;
    let outcome = ingestor.insert_reading(ts, key, RawValue::Text(value.to_string()));
    ingestor.store().flush()?;

    if outcome.accepted > 0 {
        let stored = ingestor.store().last_read(key);
        match stored {
            Some(r) => println!("stored {key} = {} at {}", r.val, r.ts),
            None => println!("stored {key}"),
        }
        Ok(())
    } else if outcome.vetoed > 0 {
        println!("{key}: reading vetoed by its transform (nothing stored)");
        Ok(())
    } else {
        Err(Error::Params(format!(
            "reading for '{key}' rejected (value '{value}')"
        )))
    }
}
