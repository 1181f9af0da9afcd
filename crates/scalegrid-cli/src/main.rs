//! scalegrid: run scaling advice requests from the command line.
//!
//! Reads a [`ScalingAdviceRequest`] as JSON, simulates it against the
//! configured pricing table and prints every plan result as one JSON line
//! on stdout. Logs go to stderr.
//!
//! # Usage
//!
//! ```text
//! scalegrid advise --request request.json --pricing prices.json --config scalegrid.toml
//! scalegrid check-config --config scalegrid.toml
//! ```

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{info, warn};

use scalegrid_placement::StaticPricing;
use scalegrid_scheduler::CancelToken;
use scalegrid_sim::{AdvisorConfig, Planner, parse_simulation_strategy};
use scalegrid_state::{AdviceGenerationMode, ScalingAdviceRequest};

#[derive(Parser)]
#[command(name = "scalegrid", about = "Scale-out advice by scheduling simulation", version)]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Simulate one scaling advice request and print its plan results.
    Advise {
        /// Request JSON file, or `-` for stdin.
        #[arg(short, long)]
        request: PathBuf,

        /// Pricing table: JSON array of {region, instance_type, hourly_price}.
        #[arg(short, long)]
        pricing: PathBuf,

        /// Advisor configuration (TOML). Defaults apply when omitted.
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Override the request's simulation strategy.
        #[arg(long)]
        strategy: Option<String>,

        /// Emit one partial plan per simulation group.
        #[arg(long)]
        incremental: bool,
    },
    /// Validate an advisor configuration file.
    CheckConfig {
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Advise {
            request,
            pricing,
            config,
            strategy,
            incremental,
        } => {
            let config = match config {
                Some(path) => AdvisorConfig::from_file(&path)?,
                None => AdvisorConfig::default(),
            };
            let mut request = read_request(&request)?;
            if let Some(name) = strategy {
                request.simulation_strategy = parse_simulation_strategy(&name)?;
            }
            if incremental {
                request.advice_generation_mode = AdviceGenerationMode::Incremental;
            }
            let pricing = StaticPricing::from_json(
                &std::fs::read_to_string(&pricing)
                    .with_context(|| format!("reading pricing {}", pricing.display()))?,
            )?;
            run_advise(config, Arc::new(pricing), request).await
        }
        Command::CheckConfig { config } => {
            let parsed = AdvisorConfig::from_file(&config)?;
            let settings = parsed.settings()?;
            info!(
                path = %config.display(),
                max_parallel = settings.max_parallel,
                simulation_timeout = ?settings.simulation_timeout,
                "configuration is valid"
            );
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,scalegrid=debug"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn read_request(path: &Path) -> anyhow::Result<ScalingAdviceRequest> {
    let content = if path.as_os_str() == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("reading request from stdin")?;
        buf
    } else {
        std::fs::read_to_string(path)
            .with_context(|| format!("reading request {}", path.display()))?
    };
    let mut request: ScalingAdviceRequest =
        serde_json::from_str(&content).context("parsing request")?;
    if request.id.is_empty() {
        request.id = uuid::Uuid::new_v4().to_string();
    }
    if request.correlation_id.is_empty() {
        request.correlation_id = request.id.clone();
    }
    Ok(request)
}

async fn run_advise(
    config: AdvisorConfig,
    pricing: Arc<StaticPricing>,
    request: ScalingAdviceRequest,
) -> anyhow::Result<()> {
    let planner = Arc::new(Planner::from_config(&config, pricing)?);
    let (tx, mut rx) = mpsc::channel(config.result_channel_capacity);
    let cancel = CancelToken::new();

    info!(
        request_id = %request.id,
        correlation_id = %request.correlation_id,
        strategy = %request.simulation_strategy,
        "advice requested"
    );
    let plan_task = tokio::spawn({
        let planner = Arc::clone(&planner);
        let cancel = cancel.clone();
        async move { planner.plan(request, &cancel, &tx).await }
    });

    // Ctrl-C cancels the running request; the planner still reports a terminal result.
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling request");
            interrupt.cancel("interrupted");
        }
    });

    let mut failed = None;
    while let Some(result) = rx.recv().await {
        println!("{}", result.to_json());
        if result.terminal {
            failed = result.outcome.err();
            break;
        }
    }
    plan_task.await.context("planner task")?;

    match failed {
        Some(e) => bail!("scaling advice failed: {e}"),
        None => Ok(()),
    }
}
