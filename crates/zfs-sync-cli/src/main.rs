//! zfs-sync - ZFS snapshot replication between hosts
//!
//! Replicates datasets between local and remote hosts over ssh, choosing
//! full, incremental or resumed transfers and keeping a verified baseline
//! snapshot on both sides.

mod display;
mod json_output;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use console::style;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use zfs_sync_config::{Config, ConfigLoader, LoggingConfig};
use zfs_sync_engine::{EngineBuilder, Inventory, RunSummary};
use zfs_sync_remote::{DryRun, ProcessExecutor, SshOptions};
use zfs_sync_types::{Endpoint, Host, HostExecutor, ReplicationJob};

/// zfs-sync - ZFS snapshot replication between hosts
#[derive(Parser)]
#[command(
    name = "zfs-sync",
    version = env!("CARGO_PKG_VERSION"),
    about = "Replicate ZFS datasets between hosts",
    long_about = "zfs-sync replicates ZFS datasets between local and remote hosts.\n\
                  It picks full, incremental or resumed transfers from verified snapshot\n\
                  history and keeps a shared baseline snapshot on both sides."
)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Quiet mode - minimal output
    #[arg(short, long)]
    quiet: bool,

    /// Verbose mode - detailed output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory for the daily log file
    #[arg(long)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run replication jobs
    Run {
        /// Job to run; may be repeated
        #[arg(short, long = "job", value_name = "NAME", conflicts_with = "all_jobs")]
        jobs: Vec<String>,
        /// Run every configured job
        #[arg(long)]
        all_jobs: bool,
        /// Show what would be done without changing anything
        #[arg(long)]
        dry_run: bool,
        /// Print the run summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// List configured jobs
    Jobs,
    /// List snapshots of a dataset
    Snapshots {
        /// Host, `local` for this machine
        host: String,
        /// Dataset path
        dataset: String,
        /// Login user for a remote host
        #[arg(short, long)]
        user: Option<String>,
        /// Show at most this many snapshots, newest first
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Include child datasets
        #[arg(short, long)]
        recursive: bool,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show or generate configuration
    Config {
        /// Show default configuration
        #[arg(long)]
        default: bool,
        /// Write the configuration to this file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let config = ConfigLoader::load(cli.config.as_deref()).context("failed to load configuration")?;
    let _guard = init_logging(&cli, &config.logging)?;

    info!("zfs-sync v{} starting", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Run {
            jobs,
            all_jobs,
            dry_run,
            json,
        } => run_command(&config, jobs, all_jobs, dry_run, json, cli.quiet).await,
        Commands::Jobs => {
            jobs_command(&config);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Snapshots {
            host,
            dataset,
            user,
            limit,
            recursive,
            json,
        } => {
            snapshots_command(&config, &host, dataset, user, limit, recursive, json).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Config { default, output } => {
            config_command(&config, default, output.as_deref())?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn init_logging(cli: &Cli, logging: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

    type Filtered = tracing_subscriber::layer::Layered<EnvFilter, Registry>;

    let level = if cli.debug {
        "debug"
    } else if cli.verbose {
        "info"
    } else if cli.quiet {
        "error"
    } else {
        logging.level.as_str()
    };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .context("invalid log level")?;

    let mut layers: Vec<Box<dyn Layer<Filtered> + Send + Sync>> = Vec::new();
    if logging.json_format {
        layers.push(fmt::layer().json().with_writer(std::io::stderr).boxed());
    } else {
        layers.push(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_thread_ids(false)
                .with_thread_names(false)
                .boxed(),
        );
    }

    let log_dir = cli
        .log_dir
        .clone()
        .or_else(|| logging.file_logging.then(|| logging.log_dir.clone()).flatten());
    let guard = log_dir.map(|dir| {
        let appender = tracing_appender::rolling::daily(dir, "zfs-sync.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        layers.push(
            fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false)
                .boxed(),
        );
        guard
    });

    tracing_subscriber::registry().with(filter).with(layers).init();
    Ok(guard)
}

fn ssh_options(config: &Config) -> SshOptions {
    SshOptions {
        batch_mode: config.ssh.batch_mode,
        strict_host_key_checking: config.ssh.strict_host_key_checking,
        extra_options: config.ssh.extra_options.clone(),
        ..SshOptions::default()
    }
}

/// Resolve the selected job names; unknown names are skipped with a warning
fn select_jobs(
    config: &Config,
    names: Vec<String>,
    all_jobs: bool,
) -> Result<Vec<(String, zfs_sync_types::Result<ReplicationJob>)>> {
    if names.is_empty() && !all_jobs {
        bail!("select jobs with --job NAME or --all-jobs");
    }
    let names = if all_jobs { config.job_names() } else { names };

    let mut selected = Vec::with_capacity(names.len());
    for name in names {
        if !config.jobs.contains_key(&name) {
            warn!(job = %name, "Unknown job, skipping");
            display::display_warning(&format!("Unknown job '{}', skipping", name));
            continue;
        }
        let job = config.resolve_job(&name).map_err(zfs_sync_types::Error::from);
        selected.push((name, job));
    }

    if selected.is_empty() {
        bail!("no jobs to run");
    }
    Ok(selected)
}

async fn run_command(
    config: &Config,
    names: Vec<String>,
    all_jobs: bool,
    dry_run: bool,
    json: bool,
    quiet: bool,
) -> Result<ExitCode> {
    let jobs = select_jobs(config, names, all_jobs)?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, aborting connectivity checks");
            on_signal.cancel();
        }
    });

    let process = ProcessExecutor::new(ssh_options(config));
    let executor: Arc<dyn HostExecutor> = if dry_run {
        Arc::new(DryRun::new(process))
    } else {
        Arc::new(process)
    };
    let engine = EngineBuilder::new(executor)
        .with_tools(config.tool_set())
        .with_cancellation(cancel)
        .build();

    if dry_run && !json && !quiet {
        display::display_info("Dry run mode - no changes will be made");
    }

    let summary: RunSummary = engine.run_all(jobs).await;

    if json {
        println!("{}", json_output::run_summary_json(&summary)?);
    } else if !quiet {
        display::print_run_summary(&summary);
    }

    Ok(if summary.all_succeeded() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn jobs_command(config: &Config) {
    let names = config.job_names();
    if names.is_empty() {
        display::display_warning("No jobs configured");
        return;
    }

    println!("{}", style("Configured jobs:").bold().underlined());
    for name in names {
        match config.resolve_job(&name) {
            Ok(job) => display::print_job(&job),
            Err(error) => println!(
                "  {} {} {}",
                style("✗").red().bold(),
                style(&name).bold(),
                style(error).red()
            ),
        }
    }
}

async fn snapshots_command(
    config: &Config,
    host: &str,
    dataset: String,
    user: Option<String>,
    limit: usize,
    recursive: bool,
    json: bool,
) -> Result<()> {
    let user = user.unwrap_or_else(|| config.defaults.ssh_user.clone());
    let host = Host::new(host, user, config.connect_timeout()?);
    let endpoint = Endpoint::new(host, dataset);

    let executor = ProcessExecutor::new(ssh_options(config));
    let inventory = Inventory::new(&executor);

    let spinner =
        (!json).then(|| display::create_spinner(&format!("Listing snapshots on {}", endpoint)));
    let listing = inventory
        .list_snapshot_paths(&endpoint, recursive, Some(limit))
        .await;
    if let Some(spinner) = spinner {
        spinner.finish_and_clear();
    }
    let snapshots = listing.with_context(|| format!("failed to list snapshots of {}", endpoint))?;

    if json {
        println!("{}", json_output::snapshots_json(&snapshots)?);
    } else {
        display::print_snapshots(&endpoint, &snapshots);
    }
    Ok(())
}

fn config_command(config: &Config, default: bool, output: Option<&Path>) -> Result<()> {
    let shown = if default { Config::default() } else { config.clone() };

    if let Some(path) = output {
        ConfigLoader::save_to_file(&shown, path)
            .with_context(|| format!("failed to write {}", path.display()))?;
        display::display_success(&format!("Configuration written to {}", path.display()));
        return Ok(());
    }

    let heading = if default {
        "Default configuration:"
    } else {
        "Current configuration:"
    };
    println!("{} {}", style("⚙").blue().bold(), heading);
    print!("{}", ConfigLoader::render(&shown, Path::new("config.yaml"))?);
    Ok(())
}
