use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use proxy_sieve::{
    config::{Settings, SinkFormat},
    database::SqliteSink,
    logging::init_logging,
    orchestrator::{CyclePaths, Orchestrator},
    proxy::{BatchCoordinator, Governor, ProxyChecker, ProxyCrawler, ProxyParser, Transport},
    sink::{JsonlSink, LineFileSink, ResultSink},
};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

/// Collects free proxies from public lists and keeps the working ones
#[derive(Parser)]
#[command(name = "proxy-sieve", version)]
#[command(about = "Collects free proxies from public lists and keeps the working ones")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Settings file (TOML); defaults to ./proxy-sieve.toml when present
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(flatten)]
    overrides: Overrides,
}

#[derive(Args)]
struct Overrides {
    /// Maximum probes in flight
    #[arg(long, global = true)]
    max_connections: Option<usize>,
    /// Per-probe timeout in seconds
    #[arg(long, global = true)]
    timeout: Option<f64>,
    /// URL fetched through each proxy; must answer {"query": "<ip>"}
    #[arg(long, global = true)]
    verification_url: Option<String>,
    /// Output format for verified proxies
    #[arg(long, value_enum, global = true)]
    format: Option<SinkFormat>,
}

#[derive(Subcommand)]
enum Commands {
    /// Crawl the sources directory and write the unchecked list
    Collect,
    /// Validate a candidate list and write the working proxies
    Check {
        /// Candidate file; defaults to the unchecked list
        #[arg(short, long)]
        input: Option<PathBuf>,
        /// Transport for bare host:port lines
        #[arg(short = 't', long, value_enum, default_value_t = Transport::Http)]
        transport: Transport,
        /// Re-validate the verified subset a second time
        #[arg(long)]
        double_check: bool,
        /// Abandon the batch after this many seconds
        #[arg(long)]
        deadline: Option<f64>,
    },
    /// Collect then check, once
    Cycle,
    /// Collect then check, repeatedly
    Watch {
        /// Seconds between cycles
        #[arg(long)]
        interval: Option<u64>,
    },
    /// Probe a single endpoint and print the result
    Probe {
        /// transport://host:port or host:port
        endpoint: String,
        /// Transport for a bare host:port
        #[arg(short = 't', long, value_enum, default_value_t = Transport::Http)]
        transport: Transport,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::load(cli.config.as_deref())?;
    init_logging(&settings.logging, cli.verbose)?;
    apply_overrides(&mut settings, &cli.overrides, &cli.command)?;

    match cli.command {
        Commands::Probe { endpoint, transport } => {
            let endpoint = ProxyParser::parse_endpoint(&endpoint, transport)?;
            let checker = ProxyChecker::with_config(settings.checker_config()?);
            let result = checker.check_proxy(&endpoint).await;
            println!("{}", result);
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Collect => {
            let orchestrator = build_orchestrator(&settings)?;
            let batch = orchestrator.collect().await?;
            println!("Collected {} unique candidates", batch.len());
        }
        Commands::Check { input, transport, .. } => {
            let orchestrator = build_orchestrator(&settings)?;
            let input = input.unwrap_or_else(|| settings.paths.unchecked_file());
            let report = orchestrator
                .check_file(&input, transport, || open_sink(&settings))
                .await?;
            println!(
                "Results: {} working of {} candidates in {:.2}s",
                report.verified,
                report.candidates,
                report.elapsed.as_secs_f64()
            );
        }
        Commands::Cycle => {
            let orchestrator = build_orchestrator(&settings)?;
            let report = orchestrator.run_cycle(|| open_sink(&settings)).await?;
            println!(
                "Results: {} working of {} candidates in {:.2}s",
                report.verified,
                report.candidates,
                report.elapsed.as_secs_f64()
            );
        }
        Commands::Watch { .. } => {
            let orchestrator = build_orchestrator(&settings)?;
            let interval = Duration::from_secs(settings.schedule.interval_secs);
            info!("running every {}s, Ctrl-C to stop", interval.as_secs());
            orchestrator
                .run_forever(interval, CancellationToken::new(), || open_sink(&settings))
                .await?;
        }
    }

    Ok(())
}

fn apply_overrides(
    settings: &mut Settings,
    overrides: &Overrides,
    command: &Commands,
) -> Result<()> {
    if let Some(max) = overrides.max_connections {
        settings.checker.max_connections = max;
    }
    if let Some(timeout) = overrides.timeout {
        settings.checker.timeout_secs = timeout;
    }
    if let Some(url) = &overrides.verification_url {
        settings.checker.verification_url = url.clone();
    }
    if let Some(format) = overrides.format {
        settings.sink.format = format;
    }
    match command {
        Commands::Check {
            double_check,
            deadline,
            ..
        } => {
            if *double_check {
                settings.checker.double_check = true;
            }
            if deadline.is_some() {
                settings.checker.batch_deadline_secs = *deadline;
            }
        }
        Commands::Watch {
            interval: Some(interval),
        } => settings.schedule.interval_secs = *interval,
        _ => {}
    }
    settings.validate().context("invalid settings")
}

fn build_orchestrator(settings: &Settings) -> Result<Orchestrator<ProxyChecker>> {
    let checker = ProxyChecker::with_config(settings.checker_config()?);
    let governor = Governor::new(settings.checker.max_connections);
    let coordinator =
        BatchCoordinator::new(checker, governor).with_options(settings.coordinator_options()?);
    let crawler = ProxyCrawler::with_config(settings.crawler_config())?;
    let paths = CyclePaths {
        sources_dir: settings.paths.sources_dir.clone(),
        unchecked_file: settings.paths.unchecked_file(),
    };
    Ok(Orchestrator::new(coordinator, crawler, paths)
        .with_double_check(settings.checker.double_check))
}

/// A fresh sink for one run, emptied of the previous run's results.
/// Only opened once a run has candidates to validate.
async fn open_sink(settings: &Settings) -> Result<Box<dyn ResultSink>> {
    let run_id = Uuid::new_v4();
    let format = settings.sink.format;
    let sink: Box<dyn ResultSink> = match format {
        SinkFormat::Lines => {
            Box::new(LineFileSink::create(settings.paths.verified_file(format))?)
        }
        SinkFormat::Jsonl => {
            Box::new(JsonlSink::create(settings.paths.verified_file(format), run_id)?)
        }
        SinkFormat::Sqlite => {
            Box::new(SqliteSink::connect(&settings.sink.database_url, run_id).await?)
        }
    };
    info!("run {} writing {:?} output", run_id, format);
    Ok(sink)
}
