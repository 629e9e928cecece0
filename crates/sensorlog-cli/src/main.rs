//! CLI for sensorlog: ingest readings, run calculated fields, back up the store.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use sensorlog_core::Config;

#[derive(Parser)]
#[command(name = "sensorlog")]
#[command(about = "sensorlog: sensor telemetry ingestion and calculated readings")]
#[command(version = sensorlog_core::VERSION)]
struct Cli {
    /// Configuration file (missing file means defaults)
    #[arg(long, short, global = true, default_value = sensorlog_core::config::CONFIG_FILE)]
    config: PathBuf,

    /// Override the data directory from the configuration file
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server with the calculated-field and backup schedules
    Serve {
        #[arg(long, default_value = "8077")]
        port: u16,

        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Calculated-field interval (30s, 10m, 1h); 0 disables. Default: [schedule] in config
        #[arg(long)]
        calc_every: Option<String>,

        /// Backup interval (1h, 24h); 0 disables. Default: [schedule] in config
        #[arg(long)]
        backup_every: Option<String>,
    },

    /// Store one reading, applying any configured transform
    Insert {
        /// Series key
        key: String,

        /// Value: a number or a state word (On, Off, Open, Closed, ...)
        value: String,

        /// Unix seconds or compact UTC (2026-02-15T013000Z); default: now
        #[arg(long)]
        ts: Option<String>,
    },

    /// Show the most recent readings of a series
    Last {
        key: String,

        /// Number of readings
        #[arg(short, default_value = "1")]
        n: usize,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Show readings of a series between two times (inclusive)
    Range {
        key: String,

        /// Unix seconds or compact UTC; default: open
        #[arg(long)]
        start: Option<String>,

        /// Unix seconds or compact UTC; default: open
        #[arg(long)]
        end: Option<String>,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// List stored series with their latest reading
    Keys,

    /// Evaluate the configured calculated fields
    Calc {
        /// Repeat at this interval (e.g. "30s", "5m") until Ctrl+C
        #[arg(long)]
        every: Option<String>,

        /// Evaluate only these outputs (comma-separated)
        #[arg(long)]
        only: Option<String>,

        /// List the available calculation functions and exit
        #[arg(long)]
        list_functions: bool,
    },

    /// Write a compressed snapshot and purge expired ones
    Backup {
        /// Backup directory (overrides the configuration file)
        #[arg(long)]
        dir: Option<PathBuf>,

        /// Days to keep backups (overrides the configuration file)
        #[arg(long)]
        retention_days: Option<u32>,
    },

    /// Rebuild the data directory from a backup file
    Restore {
        /// Backup file (*.json.gz)
        path: PathBuf,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let mut config = match Config::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {}: {e}", cli.config.display());
            std::process::exit(1);
        }
    };
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }

    let result = match cli.command {
        Commands::Serve {
            port,
            host,
            calc_every,
            backup_every,
        } => commands::serve::run(
            &config,
            &host,
            port,
            calc_every.as_deref(),
            backup_every.as_deref(),
        ),
        Commands::Insert { key, value, ts } => {
            commands::insert::run(&config, &key, &value, ts.as_deref())
        }
        Commands::Last { key, n, json } => commands::query::last(&config, &key, n, json),
        Commands::Range {
            key,
            start,
            end,
            json,
        } => commands::query::range(&config, &key, start.as_deref(), end.as_deref(), json),
        Commands::Keys => commands::query::keys(&config),
        Commands::Calc {
            every,
            only,
            list_functions,
        } => commands::calc::run(&config, every.as_deref(), only.as_deref(), list_functions),
        Commands::Backup {
            dir,
            retention_days,
        } => commands::backup::run(&config, dir, retention_days),
        Commands::Restore { path } => commands::backup::restore(&config, &path),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
