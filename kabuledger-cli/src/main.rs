//! kabuledger CLI: sync, status, and config scaffolding.
//!
//! Commands:
//! - `sync`: bring every configured universe's CSV up to today
//! - `status`: report rows, tickers and date range per universe file
//! - `init-config`: write the default TOML config

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use kabuledger_core::{
    store, CircuitBreaker, RunReport, RunStatus, SyncConfig, Syncer, UniverseResolver,
    YahooProvider,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG: &str = "kabuledger.toml";

#[derive(Parser)]
#[command(
    name = "kabuledger",
    about = "kabuledger: incremental daily price sync for Tokyo equity universes"
)]
struct Cli {
    /// Log level when RUST_LOG is not set (error, warn, info, debug, trace).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch missing days for each universe and merge them into its CSV.
    Sync {
        /// Path to a TOML config file. Defaults to ./kabuledger.toml if present.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Only sync these universes (repeatable). Defaults to all.
        #[arg(long = "universe")]
        universes: Vec<String>,

        /// Treat this date (YYYY-MM-DD) as today instead of the local date.
        #[arg(long)]
        today: Option<String>,
    },
    /// Report what is on disk for each configured universe.
    Status {
        /// Path to a TOML config file. Defaults to ./kabuledger.toml if present.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Print JSON instead of a table.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Write the default config as TOML.
    InitConfig {
        #[arg(long, default_value = DEFAULT_CONFIG)]
        output: PathBuf,

        /// Overwrite an existing file.
        #[arg(long, default_value_t = false)]
        force: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let code = match run(cli.command) {
        Ok(status) => status.exit_code(),
        Err(e) => {
            tracing::error!("{e:#}");
            eprintln!("error: {e:#}");
            RunStatus::Fatal.exit_code()
        }
    };
    std::process::exit(code);
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn run(command: Commands) -> Result<RunStatus> {
    match command {
        Commands::Sync {
            config,
            universes,
            today,
        } => run_sync(config.as_deref(), &universes, today.as_deref()),
        Commands::Status { config, json } => {
            run_status(config.as_deref(), json)?;
            Ok(RunStatus::Success)
        }
        Commands::InitConfig { output, force } => {
            run_init_config(&output, force)?;
            Ok(RunStatus::Success)
        }
    }
}

/// Explicit path, else ./kabuledger.toml, else built-in defaults.
fn load_config(path: Option<&Path>) -> Result<SyncConfig> {
    let path = match path {
        Some(p) => Some(p.to_path_buf()),
        None => Some(PathBuf::from(DEFAULT_CONFIG)).filter(|p| p.exists()),
    };

    match path {
        Some(p) => {
            let config = SyncConfig::from_file(&p)
                .with_context(|| format!("loading config {}", p.display()))?;
            tracing::info!(config = %p.display(), "config loaded");
            Ok(config)
        }
        None => {
            let mut config = SyncConfig::default();
            config.apply_env_overrides()?;
            config.validate()?;
            tracing::info!("no config file, using built-in defaults");
            Ok(config)
        }
    }
}

fn run_sync(
    config_path: Option<&Path>,
    only: &[String],
    today: Option<&str>,
) -> Result<RunStatus> {
    let config = load_config(config_path)?;

    for name in only {
        if config.universe(name).is_none() {
            bail!("unknown universe '{name}'");
        }
    }

    let today = today
        .map(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d"))
        .transpose()
        .context("--today must be YYYY-MM-DD")?;

    let resolver = UniverseResolver::new(&config)?;
    let universes = resolver.resolve(&config, only);

    let circuit_breaker = Arc::new(CircuitBreaker::new(
        config.provider.breaker_cooldown(),
        config.provider.breaker_failure_threshold,
    ));
    let provider = YahooProvider::new(&config.provider, circuit_breaker)?;

    let mut syncer = Syncer::new(&config, &provider);
    if let Some(day) = today {
        syncer = syncer.with_today(day);
    }

    let report = syncer.sync_all(&universes);
    print_report(&report);
    Ok(report.status())
}

fn print_report(report: &RunReport) {
    println!();
    println!(
        "{:<16} {:<8} {:>8} {:>8} {:>9}  State",
        "Universe", "Updated", "Fetched", "Rows", "Time"
    );
    println!("{}", "-".repeat(72));
    for o in &report.outcomes {
        println!(
            "{:<16} {:<8} {:>8} {:>8} {:>8.1}s  {}",
            o.universe,
            if o.updated { "yes" } else { "no" },
            o.rows_fetched,
            o.rows_written,
            o.elapsed.as_secs_f64(),
            o.state
        );
        for w in &o.warnings {
            println!("    warning: {w}");
        }
    }
    for name in &report.missing_required {
        println!("required universe '{name}' has no identifiers");
    }
    println!();
    println!(
        "{} universes, {} updated, {} failed: {:?}",
        report.outcomes.len(),
        report.updated(),
        report.failed(),
        report.status()
    );
}

fn run_status(config_path: Option<&Path>, json: bool) -> Result<()> {
    let config = load_config(config_path)?;

    let mut summaries = Vec::new();
    for uc in &config.universes {
        let path = config.resolve_path(&uc.path);
        let summary = store::describe(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        summaries.push((uc.name.clone(), summary));
    }

    if json {
        let mut value = serde_json::Map::new();
        for (name, s) in summaries {
            value.insert(name, serde_json::to_value(s)?);
        }
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("Data dir: {}", config.data_dir.display());
    println!("Epoch: {}", config.epoch);
    println!();
    println!(
        "{:<16} {:>8} {:>8} {:<25} {:<12}",
        "Universe", "Rows", "Tickers", "Date Range", "Hash"
    );
    println!("{}", "-".repeat(72));
    for (name, s) in &summaries {
        let range = match (s.first_date, s.last_date) {
            (Some(first), Some(last)) => format!("{first} to {last}"),
            _ if !s.exists => "(missing)".to_string(),
            _ if s.unreadable.is_some() => "(unreadable)".to_string(),
            _ => "(empty)".to_string(),
        };
        let hash = s
            .content_hash
            .as_deref()
            .map(|h| h.chars().take(12).collect::<String>())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<16} {:>8} {:>8} {:<25} {:<12}",
            name, s.rows, s.tickers, range, hash
        );
        if let Some(reason) = &s.unreadable {
            println!("    unreadable: {reason}");
        }
    }
    Ok(())
}

fn run_init_config(output: &Path, force: bool) -> Result<()> {
    if output.exists() && !force {
        bail!(
            "{} already exists (use --force to overwrite)",
            output.display()
        );
    }
    let toml = SyncConfig::default().to_toml()?;
    std::fs::write(output, toml).with_context(|| format!("writing {}", output.display()))?;
    println!("Wrote default config to {}", output.display());
    Ok(())
}
