use std::fs::File;
use std::io::{self, BufReader};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use tollgate::config::TollgateConfig;
use tollgate::ratelimit::RateLimiter;
use tollgate::replay;

/// Per-key HTTP request rate admission.
#[derive(Debug, Parser)]
#[command(name = "tollgate", version, about)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, global = true, default_value = "tollgate.yaml")]
    config: PathBuf,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate the configuration and print the effective rules
    Check,
    /// Run recorded requests through the limiter, one JSON decision per line
    Replay {
        /// JSON-lines request records; reads stdin when omitted
        #[arg(short, long)]
        input: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config_path = cli.config.to_string_lossy().into_owned();
    let config = TollgateConfig::from_file(&config_path)
        .with_context(|| format!("failed to load configuration from {}", config_path))?;
    let rules = config.to_rule_set().context("invalid rate limit rules")?;
    info!(
        rate = rules.rate_per_second(),
        burst = rules.burst(),
        "Rules loaded"
    );

    match cli.command {
        Command::Check => {
            let effective = TollgateConfig::from_rule_set(&rules).to_yaml()?;
            print!("{}", effective);
        }
        Command::Replay { input } => {
            let limiter = Arc::new(RateLimiter::new(rules));
            let sweeper = limiter.start_sweeper()?;

            let worker = {
                let limiter = limiter.clone();
                tokio::task::spawn_blocking(move || run_replay(&limiter, input))
            };

            let summary = worker.await.context("replay task panicked")??;
            info!(
                allowed = summary.allowed,
                limited = summary.limited,
                skipped = summary.skipped,
                "Replay complete"
            );

            sweeper.stop();
        }
    }

    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        // stdout carries the command output
        .with_writer(io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn run_replay(
    limiter: &RateLimiter,
    input: Option<PathBuf>,
) -> anyhow::Result<replay::ReplaySummary> {
    let stdout = io::stdout();
    let output = io::BufWriter::new(stdout.lock());

    let summary = match input {
        Some(path) => {
            let file = File::open(&path)
                .with_context(|| format!("failed to open {}", path.display()))?;
            replay::replay(limiter, BufReader::new(file), output)?
        }
        None => replay::replay(limiter, io::stdin().lock(), output)?,
    };

    Ok(summary)
}
