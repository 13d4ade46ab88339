use clap::{ArgAction, Parser, Subcommand};
use durable_charge::application::clock::HostClock;
use durable_charge::application::host::{ExecutionHost, HostConfig, StartRequest};
use durable_charge::application::operation::ChargeOperation;
use durable_charge::config::HostSettings;
use durable_charge::domain::orchestration::OrchestrationOutcome;
use durable_charge::domain::ports::{ChargeStoreHandle, HistoryStoreHandle};
use durable_charge::domain::retry::RetryPolicy;
use durable_charge::infrastructure::gateway::SimulatedGateway;
use durable_charge::infrastructure::in_memory::{InMemoryChargeStore, InMemoryHistoryStore};
use durable_charge::interfaces::csv::charge_writer::ChargeWriter;
use durable_charge::interfaces::csv::request_reader::StartRequestReader;
use miette::{IntoDiagnostic, Result};
use rust_decimal::Decimal;
use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to persistent database (optional). If provided, uses RocksDB.
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    /// JSON settings file (retry policy, gateway, concurrency)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Total charge attempts, the first one included
    #[arg(long, global = true)]
    max_attempts: Option<u32>,

    /// Delay before the second attempt (e.g. "5s", "250ms")
    #[arg(long, global = true, value_parser = parse_duration)]
    initial_interval: Option<Duration>,

    /// Multiplier applied to the delay after every failed attempt
    #[arg(long, global = true)]
    backoff_coefficient: Option<f64>,

    /// Upper bound for any single retry delay
    #[arg(long, global = true, value_parser = parse_duration)]
    maximum_interval: Option<Duration>,

    /// Simulated payment processor latency
    #[arg(long, global = true, value_parser = parse_duration)]
    gateway_latency: Option<Duration>,

    /// Make the first N processor calls fail transiently
    #[arg(long, global = true)]
    gateway_fail_first: Option<u32>,

    /// Upper bound on concurrent charge operations
    #[arg(long, global = true)]
    max_concurrent_operations: Option<usize>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start one charge orchestration and wait for its outcome
    Submit {
        #[arg(long)]
        customer_id: String,
        #[arg(long)]
        amount: Decimal,
        #[arg(long, default_value_t = 10)]
        wait_seconds: u64,
        /// Reuse an orchestration id (starts a new run if the previous one finished)
        #[arg(long)]
        orchestration_id: Option<String>,
    },
    /// Start one orchestration per CSV row and wait for all of them
    Batch {
        /// CSV with customer_id, amount, wait_seconds[, orchestration_id]
        input: PathBuf,
    },
    /// Resume orchestrations left in flight by a previous process
    Resume,
    /// List recorded charges
    Charges,
    /// Show the state of an orchestration
    Status { orchestration_id: String },
}

fn parse_duration(value: &str) -> std::result::Result<Duration, String> {
    humantime_serde::re::humantime::parse_duration(value).map_err(|e| e.to_string())
}

fn init_logging(verbose: u8) {
    let log_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(verbose >= 2)
        .init();
}

/// Layers explicit CLI flags over the settings file (or the defaults).
fn load_settings(cli: &Cli) -> Result<HostSettings> {
    let mut settings = match &cli.config {
        Some(path) => HostSettings::load(path).into_diagnostic()?,
        None => HostSettings::default(),
    };

    let current = settings.retry_policy;
    let mut policy = RetryPolicy::new(
        cli.max_attempts.unwrap_or(current.maximum_attempts()),
        cli.initial_interval.unwrap_or(current.initial_interval()),
        cli.backoff_coefficient
            .unwrap_or(current.backoff_coefficient()),
    )
    .into_diagnostic()?;
    if let Some(cap) = cli.maximum_interval.or(current.maximum_interval()) {
        policy = policy.with_maximum_interval(cap).into_diagnostic()?;
    }
    settings.retry_policy = policy;

    if let Some(latency) = cli.gateway_latency {
        settings.gateway.latency = latency;
    }
    if let Some(fail_first) = cli.gateway_fail_first {
        settings.gateway.fail_first = fail_first;
    }
    if let Some(max) = cli.max_concurrent_operations {
        settings.max_concurrent_operations = max;
    }

    debug!(?settings, "host settings");
    Ok(settings)
}

#[cfg(feature = "storage-rocksdb")]
fn open_stores(db_path: Option<PathBuf>) -> Result<(ChargeStoreHandle, HistoryStoreHandle)> {
    use durable_charge::infrastructure::rocksdb::RocksDBStore;

    if let Some(db_path) = db_path {
        // Use persistent storage (RocksDB)
        let store = RocksDBStore::open(db_path).into_diagnostic()?;
        return Ok((Arc::new(store.clone()), Arc::new(store)));
    }
    Ok(in_memory_stores())
}

#[cfg(not(feature = "storage-rocksdb"))]
fn open_stores(db_path: Option<PathBuf>) -> Result<(ChargeStoreHandle, HistoryStoreHandle)> {
    if db_path.is_some() {
        tracing::warn!(
            "WARNING: Persistent storage requested via --db-path, but 'storage-rocksdb' feature is not enabled. Falling back to In-Memory storage."
        );
    }
    Ok(in_memory_stores())
}

fn in_memory_stores() -> (ChargeStoreHandle, HistoryStoreHandle) {
    (
        Arc::new(InMemoryChargeStore::new()),
        Arc::new(InMemoryHistoryStore::new()),
    )
}

async fn collect_outcomes(
    host: &ExecutionHost,
    orchestration_ids: Vec<String>,
) -> Vec<(String, OrchestrationOutcome)> {
    let mut outcomes = Vec::with_capacity(orchestration_ids.len());
    for orchestration_id in orchestration_ids {
        match host.wait_for_outcome(&orchestration_id).await {
            Ok(outcome) => outcomes.push((orchestration_id, outcome)),
            Err(e) => error!(%orchestration_id, error = %e, "no outcome"),
        }
    }
    outcomes
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let settings = load_settings(&cli)?;
    let (charges, history) = open_stores(cli.db_path.clone())?;

    let gateway = SimulatedGateway::new(settings.gateway.latency)
        .failing_first(settings.gateway.fail_first);
    let operation = ChargeOperation::new(charges.clone(), Arc::new(gateway));
    let host = ExecutionHost::new(
        history,
        operation,
        HostClock::new(),
        HostConfig::from(&settings),
    );

    let mut writer = ChargeWriter::new(io::stdout());

    match cli.command {
        Commands::Submit {
            customer_id,
            amount,
            wait_seconds,
            orchestration_id,
        } => {
            let orchestration_id = host
                .submit(StartRequest {
                    customer_id,
                    amount,
                    wait_seconds,
                    orchestration_id,
                })
                .await
                .into_diagnostic()?;
            let outcomes = collect_outcomes(&host, vec![orchestration_id]).await;
            writer.write_outcomes(&outcomes).into_diagnostic()?;
        }
        Commands::Batch { input } => {
            let file = File::open(input).into_diagnostic()?;
            let reader = StartRequestReader::new(file);

            let mut submitted = Vec::new();
            for request in reader.requests() {
                match request {
                    Ok(request) => match host.submit(request).await {
                        Ok(orchestration_id) => submitted.push(orchestration_id),
                        Err(e) => eprintln!("Error submitting request: {}", e),
                    },
                    Err(e) => {
                        eprintln!("Error reading request: {}", e);
                    }
                }
            }

            let outcomes = collect_outcomes(&host, submitted).await;
            writer.write_outcomes(&outcomes).into_diagnostic()?;
        }
        Commands::Resume => {
            let resumed = host.resume().await.into_diagnostic()?;
            let ids = resumed.into_iter().map(|run| run.orchestration_id).collect();
            let outcomes = collect_outcomes(&host, ids).await;
            writer.write_outcomes(&outcomes).into_diagnostic()?;
        }
        Commands::Charges => {
            let all = charges.list_charges().await.into_diagnostic()?;
            writer.write_charges(&all).into_diagnostic()?;
        }
        Commands::Status { orchestration_id } => {
            let orchestration = host.status(&orchestration_id).await.into_diagnostic()?;
            let view = serde_json::json!({
                "orchestration_id": orchestration.run().orchestration_id,
                "run": orchestration.run().run,
                "status": orchestration.status().to_string(),
                "customer_id": orchestration.input().customer_id,
                "amount": orchestration.input().amount,
                "wait_seconds": orchestration.input().wait_seconds,
                "started_at": orchestration.started_at(),
                "fire_at": orchestration.fire_at(),
                "attempts": orchestration.attempts(),
                "cancel_requested": orchestration.cancel_requested(),
                "last_error": orchestration.last_error().map(|e| e.to_string()),
                "outcome": orchestration.outcome(),
            });
            println!("{}", serde_json::to_string_pretty(&view).into_diagnostic()?);
        }
    }

    Ok(())
}
