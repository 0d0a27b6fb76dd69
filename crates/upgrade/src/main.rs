//! tunerdb upgrade tool.
//!
//! Rewrites a channel or guide database under the schema compiled into this build. Records
//! whose stored layout differs are read field by field and written back in the current layout.
//!
//! # Usage
//!
//! ```bash
//! # Upgrade in place, keeping chdb.redb.bak
//! tunerdb-upgrade --input /var/lib/tuner/chdb.redb
//!
//! # Write the upgraded guide database elsewhere, no backup
//! tunerdb-upgrade --db-type epgdb --input epg.redb --output epg.new.redb --no-backup
//! ```
//!
//! Exits with status 0 on success and 1 on failure. On failure the output path is left as it
//! was before the run.

use std::{ffi::OsString, io::IsTerminal, path::PathBuf, process::ExitCode};

use clap::{Parser, ValueEnum};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};
use tunerdb_records::{chdb_schema, epgdb_schema};
use tunerdb_store::{DatabaseSchema, UpgradeOptions, UpgradeReport, config::DatabaseConfig, upgrade_database};

/// Rewrites a tunerdb database file under the compiled-in schema.
#[derive(Parser, Debug)]
#[command(name = "tunerdb-upgrade", version)]
struct Cli {
    /// Database file to upgrade
    #[arg(long, value_name = "PATH")]
    input: PathBuf,

    /// Where to write the upgraded database (default: replace the input)
    #[arg(long, value_name = "PATH")]
    output: Option<PathBuf>,

    /// Where to copy the input before upgrading (default: <input>.bak)
    #[arg(long, value_name = "PATH", conflicts_with = "no_backup")]
    backup: Option<PathBuf>,

    /// Do not back up the input
    #[arg(long)]
    no_backup: bool,

    /// Replace an existing output file
    #[arg(long)]
    force_overwrite: bool,

    /// Which database the file holds
    #[arg(long, value_enum, default_value = "chdb")]
    db_type: DbType,

    /// Log output format
    #[arg(long, value_enum, default_value = "auto")]
    log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum DbType {
    /// Services and muxes
    Chdb,
    /// Programme guide
    Epgdb,
}

impl DbType {
    fn schema(self) -> DatabaseSchema {
        match self {
            DbType::Chdb => chdb_schema(),
            DbType::Epgdb => epgdb_schema(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    /// JSON when stdout is not a terminal, text otherwise
    Auto,
    /// Human-readable
    Text,
    /// One JSON object per line
    Json,
}

impl Cli {
    fn upgrade_options(&self) -> UpgradeOptions {
        let backup = if self.no_backup {
            None
        } else {
            Some(self.backup.clone().unwrap_or_else(|| default_backup(&self.input)))
        };
        UpgradeOptions {
            input: self.input.clone(),
            output: self.output.clone(),
            backup,
            force_overwrite: self.force_overwrite,
        }
    }
}

fn default_backup(input: &std::path::Path) -> PathBuf {
    let mut name = OsString::from(input.as_os_str());
    name.push(".bak");
    PathBuf::from(name)
}

fn init_logging(format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let use_json = match format {
        LogFormat::Json => true,
        LogFormat::Text => false,
        LogFormat::Auto => !std::io::stdout().is_terminal(),
    };

    if use_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().flatten_event(true).with_current_span(false))
            .init();
    } else {
        tracing_subscriber::registry().with(env_filter).with(fmt::layer()).init();
    }
}

fn run(cli: &Cli) -> tunerdb_store::Result<UpgradeReport> {
    let schema = cli.db_type.schema();
    let report = upgrade_database(&schema, &cli.upgrade_options(), &DatabaseConfig::default())?;
    for difference in &report.differences {
        warn!(difference = %difference, "Stored schema differed");
    }
    for (record, count) in &report.copied {
        info!(record = %record, count, "Copied records");
    }
    Ok(report)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.log_format);

    match run(&cli) {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            error!(input = %cli.input.display(), error = %e, "Upgrade failed");
            ExitCode::FAILURE
        },
    }
}
