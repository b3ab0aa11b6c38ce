use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use tokio::signal;
use tracing::{error, info, warn};

use slow_peps::catalog::Catalog;
use slow_peps::config::{collection_advisories, template_toml, Credentials, RunConfig};
use slow_peps::destination::Destination;
use slow_peps::error::exit_code;
use slow_peps::logging::{self, RunLog};
use slow_peps::orchestrator::DownloadOrchestrator;
use slow_peps::peps::Peps;

/// Download Sentinel products from PEPS, staging archived ones before fetching them.
///
/// Exit codes: 0 done, 1 I/O or network error, 2 invalid configuration, 3 catalog error,
/// 4 no matching product, 5 credentials refused, 6 malformed tile, 7 destination locked,
/// 130 interrupted.
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Query the catalog and download every matching product
    Run(RunArgs),
    /// Write a sample run configuration
    Template {
        #[arg(default_value = "slow-peps.toml")]
        path: PathBuf,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Run configuration (TOML)
    #[arg(short, long, default_value = "slow-peps.toml")]
    config: PathBuf,

    /// Where products are written
    #[arg(short, long)]
    write_dir: Option<PathBuf>,

    /// Only write the download plan
    #[arg(short, long)]
    no_download: bool,

    /// Unpack archives after download
    #[arg(short, long)]
    extract: bool,

    /// Download again products whose extraction failed in an earlier run
    #[arg(long)]
    retry_failed: bool,

    /// Directory of the run log
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

impl RunArgs {
    fn apply(self: &Self, config: &mut RunConfig) {
        if let Some(write_dir) = &self.write_dir {
            config.download.write_dir = write_dir.clone();
        }
        if let Some(log_dir) = &self.log_dir {
            config.download.log_dir = Some(log_dir.clone());
        }
        config.download.no_download |= self.no_download;
        config.download.extract |= self.extract;
        config.download.retry_failed |= self.retry_failed;
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    let console = logging::console();
    let _console = tracing::dispatcher::set_default(&console);

    let code = match cli.command {
        Command::Run(args) => run(args).await,
        Command::Template { path } => report(write_template(&path)),
    };
    std::process::exit(code);
}

fn report(result: Result<()>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => {
            error!("{e:#}");
            exit_code(&e)
        }
    }
}

fn write_template(path: &Path) -> Result<()> {
    let config = RunConfig::from_template(&template_toml())?;
    config.write(path)?;
    info!(path = %path.display(), "Template written");
    Ok(())
}

async fn run(args: RunArgs) -> i32 {
    let mut config = match RunConfig::read(&args.config) {
        Ok(config) => config,
        Err(e) => return report(Err(e)),
    };
    args.apply(&mut config);

    let run_log = match RunLog::create(config.log_dir()) {
        Ok(run_log) => run_log,
        Err(e) => return report(Err(e)),
    };
    let _log = tracing::dispatcher::set_default(run_log.dispatch());
    info!(log = %run_log.path().display(), config = %args.config.display(), "Run started");

    // Dropping the run future on a signal releases the destination lock before exiting.
    tokio::select! {
        result = execute(&config) => report(result),
        _ = shutdown_signal() => {
            warn!("Interrupted, stopping the run");
            INTERRUPTED
        }
    }
}

const INTERRUPTED: i32 = 130;

/// Resolves on Ctrl+C or SIGTERM. Never resolves if no handler could be installed.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Could not listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Could not listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

async fn execute(config: &RunConfig) -> Result<()> {
    let query = config.catalog_query()?;
    for advice in collection_advisories(&query) {
        warn!("{advice}");
    }
    let filter = config.product_filter()?;
    let credentials = Credentials::read(&config.auth)?;
    let provider = Peps::new(&config.query.base_url, credentials)?;

    let destination = Destination::create(&config.download.write_dir)?;
    let _lock = destination.lock()?;

    let catalog = Catalog::new(query)
        .with_settle_delay(config.settle_delay())
        .with_dump(config.query.catalog_json.clone());
    let mut orchestrator =
        DownloadOrchestrator::new(catalog, filter, destination.clone(), config.download.extract)
            .with_cycle_backoff(config.cycle_backoff())
            .with_max_cycles(config.download.max_cycles)
            .with_retry_failed(config.download.retry_failed);

    if config.download.no_download {
        let plan = orchestrator.plan(&provider).await?;
        let path = destination.dir().join("download_plan.json");
        plan.write(&path)?;
        info!(
            products = plan.len(),
            on_tape = plan.on_tape(),
            path = %path.display(),
            "Download plan written"
        );
        return Ok(());
    }

    let summary = orchestrator.run(&provider).await?;
    for (identifier, reason) in summary.failed.iter() {
        error!(%identifier, %reason, "Product failed, rerun with --retry-failed once resolved");
    }
    if !summary.unfinished.is_empty() {
        warn!(products = ?summary.unfinished, "Products left pending");
    }
    info!(
        downloaded = summary.completed.len(),
        already_present = summary.already_present.len(),
        failed = summary.failed.len(),
        transfers = summary.transfers,
        cycles = summary.cycles,
        "Run finished"
    );
    Ok(())
}
