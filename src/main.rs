//! instancekeeper - Supervise long-running server instances
//!
//! Launches configured instances as independent processes, captures their
//! output into a queryable per-run log store and relays console commands.

mod cli;
mod console;
mod core;
mod persistence;
mod platform;

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use single_instance::SingleInstance;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::cli::{print_entries, print_runs, print_status, Cli, Command, LogsArgs};
use crate::core::settings::SETTINGS_FILE;
use crate::core::{ConfigFile, InstanceRegistry, ProcessSupervisor, Settings};
use crate::persistence::{InstanceStateStore, LogStore, RetryPolicy};

/// Application name constant
pub const APP_NAME: &str = "instancekeeper";

/// Application version
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> Result<()> {
    let cli = Cli::parse();

    let runtime = tokio::runtime::Runtime::new().context("Failed to start the async runtime")?;
    let result = runtime.block_on(run(cli));
    // Terminal reads stay blocked on a worker thread; don't wait for them
    runtime.shutdown_background();
    result
}

async fn run(cli: Cli) -> Result<()> {
    let data_dir = cli
        .data_dir
        .clone()
        .unwrap_or_else(Settings::default_data_directory);
    let mut settings = Settings::load(&data_dir)
        .with_context(|| format!("Failed to load settings from {:?}", data_dir))?;

    init_logging(cli.verbose || settings.debug_logging);
    info!("{} v{} using {:?}", APP_NAME, APP_VERSION, data_dir);

    // First run: leave an editable settings file behind
    if !data_dir.join(SETTINGS_FILE).exists() {
        match settings.save() {
            Ok(()) => info!("Wrote default settings to {:?}", data_dir.join(SETTINGS_FILE)),
            Err(e) => warn!("Could not write default settings: {}", e),
        }
    }
    if let Some(dir) = cli.instances_dir.clone() {
        settings.instances_directory = Some(dir);
    }

    match cli.command {
        Command::List => cmd_list(&settings),
        Command::Init {
            name,
            executable,
            work_dir,
            args,
        } => {
            let registry = InstanceRegistry::new(settings.get_instances_directory());
            let config = ConfigFile::Command {
                executable,
                args,
                work_dir,
            };
            let path = registry
                .save_config(&name, &config)
                .with_context(|| format!("Failed to write configuration of '{}'", name))?;
            println!("Wrote {}", path.display());
            Ok(())
        }
        Command::Start { name } => cmd_start(&settings, &name).await,
        Command::Status { name, json } => {
            let supervisor = open_supervisor(&settings)?;
            print_status(&supervisor.status(&name).await?, json)
        }
        Command::Runs { name, json } => {
            let supervisor = open_supervisor(&settings)?;
            print_runs(&supervisor.runs(&name).await?, json)
        }
        Command::Logs(args) => cmd_logs(&settings, &args).await,
        Command::ForceStop { name } => {
            let supervisor = open_supervisor(&settings)?;
            supervisor
                .force_stop(&name)
                .await
                .with_context(|| format!("Failed to force-stop '{}'", name))?;
            println!("Killed '{}'", name);
            Ok(())
        }
        Command::Cleanup { days } => {
            let days = days.unwrap_or(settings.log_retention_days);
            if days == 0 {
                println!("Retention is unlimited; nothing to clean up");
                return Ok(());
            }
            let supervisor = open_supervisor(&settings)?;
            let removed = supervisor.cleanup_logs(days).await?;
            println!("Removed {} run(s) older than {} day(s)", removed, days);
            Ok(())
        }
        Command::Serve => cmd_serve(&settings).await,
    }
}

/// Initialize the logging system
fn init_logging(verbose: bool) {
    let default = if verbose {
        "instancekeeper=debug"
    } else {
        "instancekeeper=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Open the stores and wire them into a supervisor
fn open_supervisor(settings: &Settings) -> Result<ProcessSupervisor> {
    let data_dir = settings.get_data_directory();
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("Failed to create data directory {:?}", data_dir))?;

    let retry = RetryPolicy::new(settings.busy_retry_attempts, settings.busy_retry_backoff());
    let logs = LogStore::open(&settings.get_log_database_path(), retry)
        .context("Failed to open the log database")?;
    let states = InstanceStateStore::open(settings.get_state_path())
        .context("Failed to open the instance state file")?;
    debug!("Instance state kept in {:?}", states.path());
    let registry = InstanceRegistry::new(settings.get_instances_directory());

    Ok(ProcessSupervisor::new(
        Arc::new(registry),
        Arc::new(logs),
        Arc::new(states),
        settings.stop_command.clone(),
    ))
}

/// Hold the manager lock for a data directory
fn acquire_manager_lock(data_dir: &Path) -> Result<SingleInstance> {
    let mut hasher = DefaultHasher::new();
    data_dir.hash(&mut hasher);
    let key = format!("{}-{:016x}", APP_NAME, hasher.finish());

    let lock = SingleInstance::new(&key)
        .map_err(|e| anyhow!("Failed to create manager lock: {}", e))?;
    if !lock.is_single() {
        return Err(anyhow!(
            "Another {} is already managing {:?}",
            APP_NAME,
            data_dir
        ));
    }
    Ok(lock)
}

/// Open a supervisor that owns the data directory and pick up earlier instances
async fn open_owning_supervisor(settings: &Settings) -> Result<(SingleInstance, ProcessSupervisor)> {
    let lock = acquire_manager_lock(&settings.get_data_directory())?;
    let supervisor = open_supervisor(settings)?;

    let report = supervisor
        .reconcile()
        .await
        .context("Failed to reconcile instance state")?;
    for name in &report.adopted {
        println!("'{}' is still running (no console input until restarted)", name);
    }
    for name in &report.cleared {
        warn!("'{}' stopped while no manager was running", name);
    }

    if settings.log_retention_days > 0 {
        match supervisor.cleanup_logs(settings.log_retention_days).await {
            Ok(0) => {}
            Ok(removed) => info!("Removed {} expired run(s)", removed),
            Err(e) => warn!("Log retention cleanup failed: {}", e),
        }
    }

    Ok((lock, supervisor))
}

fn cmd_list(settings: &Settings) -> Result<()> {
    let registry = InstanceRegistry::new(settings.get_instances_directory());
    let names = registry.list_instances()?;
    if names.is_empty() {
        println!(
            "No instances configured in {}",
            registry.instances_dir().display()
        );
    }
    for name in names {
        println!("{}", name);
    }
    Ok(())
}

async fn cmd_logs(settings: &Settings, args: &LogsArgs) -> Result<()> {
    let supervisor = open_supervisor(settings)?;
    let entries = supervisor
        .query_logs(&args.name, args.to_query())
        .await
        .with_context(|| format!("Failed to query logs of '{}'", args.name))?;
    print_entries(&entries, args.json)
}

async fn cmd_start(settings: &Settings, name: &str) -> Result<()> {
    let (_lock, supervisor) = open_owning_supervisor(settings).await?;

    let started = supervisor
        .start(name)
        .await
        .with_context(|| format!("Failed to start '{}'", name))?;
    eprintln!(
        "Started '{}' as pid {} (run #{}); input is forwarded, Ctrl-C stops it",
        started.instance_name, started.pid, started.start_id
    );

    match console::attach(&supervisor, name).await? {
        Some(status) => eprintln!("'{}' exited: {}", name, status),
        None => eprintln!("'{}' is no longer attached", name),
    }
    Ok(())
}

async fn cmd_serve(settings: &Settings) -> Result<()> {
    let (_lock, supervisor) = open_owning_supervisor(settings).await?;
    console::serve(supervisor).await?;
    info!("{} console closed", APP_NAME);
    Ok(())
}
