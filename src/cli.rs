//! CLI command definitions and output rendering

use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Local, NaiveDateTime, NaiveTime, TimeZone, Utc};
use clap::{Args, Parser, Subcommand};

use crate::core::{InstanceReport, LogEntry, LogQuery, RunRecord};

/// Supervise long-running server instances and keep their output as queryable logs
#[derive(Parser)]
#[command(
    name = "instancekeeper",
    version,
    after_help = "Instances live in <data-dir>/instances/<name>/instance.json"
)]
pub struct Cli {
    /// Data directory (log database, state file, settings)
    #[arg(long, global = true, value_name = "DIR")]
    pub data_dir: Option<PathBuf>,

    /// Directory holding one subdirectory per instance
    #[arg(long, global = true, value_name = "DIR")]
    pub instances_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// List configured instances
    List,

    /// Create or overwrite an instance's configuration
    Init {
        name: String,

        /// Executable to launch, relative to the instance directory unless absolute
        #[arg(long)]
        executable: PathBuf,

        /// Working directory (defaults to the instance directory)
        #[arg(long)]
        work_dir: Option<PathBuf>,

        /// Arguments passed to the executable
        #[arg(last = true)]
        args: Vec<String>,
    },

    /// Start an instance and relay this terminal's input to it until it exits
    Start { name: String },

    /// Show the current state and latest run of an instance
    Status {
        name: String,

        #[arg(long)]
        json: bool,
    },

    /// List the runs of an instance, newest first
    Runs {
        name: String,

        #[arg(long)]
        json: bool,
    },

    /// Query captured output
    Logs(LogsArgs),

    /// Kill an instance's process immediately
    ForceStop { name: String },

    /// Delete finished runs older than the retention window
    Cleanup {
        /// Override `log_retention_days` from the settings
        #[arg(long)]
        days: Option<u32>,
    },

    /// Run an interactive console that owns started instances
    Serve,
}

#[derive(Args, Debug, Clone, PartialEq)]
pub struct LogsArgs {
    pub name: String,

    /// Only this run
    #[arg(long, conflicts_with = "runs")]
    pub run: Option<i64>,

    /// Inclusive run range, e.g. `3..7`
    #[arg(long, value_name = "MIN..MAX")]
    pub runs: Option<RunRange>,

    /// Captured at or after (RFC 3339 or `YYYY-MM-DD HH:MM:SS` local)
    #[arg(long, value_parser = parse_timestamp)]
    pub since: Option<DateTime<Utc>>,

    /// Captured at or before
    #[arg(long, value_parser = parse_timestamp)]
    pub until: Option<DateTime<Utc>>,

    /// Source time of day at or after (`HH:MM:SS`)
    #[arg(long, value_parser = parse_time_of_day)]
    pub source_since: Option<NaiveTime>,

    /// Source time of day at or before
    #[arg(long, value_parser = parse_time_of_day)]
    pub source_until: Option<NaiveTime>,

    /// Message pattern; `*` matches anything, `\*` is a literal asterisk
    #[arg(long)]
    pub grep: Option<String>,

    #[arg(long)]
    pub limit: Option<usize>,

    #[arg(long)]
    pub json: bool,
}

impl LogsArgs {
    pub fn to_query(&self) -> LogQuery {
        let mut query = match (self.run, self.runs) {
            (Some(run), _) => LogQuery::for_run(run),
            (None, Some(range)) => LogQuery::for_runs(range.min, range.max),
            (None, None) => LogQuery::latest(),
        };
        query = query
            .ingested_between(self.since, self.until)
            .source_between(self.source_since, self.source_until);
        if let Some(pattern) = &self.grep {
            query = query.with_pattern(pattern.clone());
        }
        if let Some(limit) = self.limit {
            query = query.with_limit(limit);
        }
        query
    }
}

/// Inclusive `MIN..MAX` run range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunRange {
    pub min: i64,
    pub max: i64,
}

impl FromStr for RunRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (min, max) = s
            .split_once("..")
            .ok_or_else(|| format!("Expected MIN..MAX, got '{}'", s))?;
        let min: i64 = min
            .trim()
            .parse()
            .map_err(|_| format!("Invalid run number: '{}'", min))?;
        let max: i64 = max
            .trim()
            .parse()
            .map_err(|_| format!("Invalid run number: '{}'", max))?;
        if min > max {
            return Err(format!("Empty run range: {}..{}", min, max));
        }
        Ok(Self { min, max })
    }
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(time) = DateTime::parse_from_rfc3339(s) {
        return Ok(time.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .map_err(|_| format!("Invalid timestamp: '{}'", s))?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|local| local.with_timezone(&Utc))
        .ok_or_else(|| format!("Timestamp does not exist locally: '{}'", s))
}

fn parse_time_of_day(s: &str) -> Result<NaiveTime, String> {
    NaiveTime::parse_from_str(s, "%H:%M:%S").map_err(|_| format!("Expected HH:MM:SS, got '{}'", s))
}

// === Rendering ===

pub fn print_entries(entries: &[LogEntry], json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(entries)?);
        return Ok(());
    }

    let mut current_run = None;
    for entry in entries {
        if current_run != Some(entry.start_id) {
            println!("--- run #{} ---", entry.start_id);
            current_run = Some(entry.start_id);
        }
        println!("{}", entry.display_line());
    }
    if entries.is_empty() {
        println!("No log entries found");
    }
    Ok(())
}

pub fn print_runs(runs: &[RunRecord], json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(runs)?);
        return Ok(());
    }

    if runs.is_empty() {
        println!("No runs recorded");
        return Ok(());
    }
    println!(
        "{:>6}  {:<9}  {:>7}  {:<19}  {:>9}  EXIT",
        "RUN", "STATUS", "PID", "STARTED", "DURATION"
    );
    for run in runs {
        println!(
            "{:>6}  {:<9}  {:>7}  {:<19}  {:>9}  {}",
            run.start_id,
            run.status.label(),
            run.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()),
            run.start_time
                .with_timezone(&Local)
                .format("%Y-%m-%d %H:%M:%S"),
            run.duration_string(),
            run.exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "-".to_string()),
        );
    }
    Ok(())
}

pub fn print_status(report: &InstanceReport, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!("Instance: {}", report.instance_name);
    match &report.state {
        Some(state) => {
            let liveness = match (report.alive, report.attached) {
                (true, true) => "running",
                (true, false) => "running (detached)",
                (false, _) => "not responding",
            };
            println!("  State:  {} as pid {} (run #{})", liveness, state.pid, state.start_id);
        }
        None => println!("  State:  not running"),
    }
    match &report.latest_run {
        Some(run) => {
            let span = if run.status.is_active() { "up for" } else { "lasted" };
            println!(
                "  Latest: run #{} {} ({} {})",
                run.start_id,
                run.status,
                span,
                run.duration_string()
            );
        }
        None => println!("  Latest: never started"),
    }
    Ok(())
}
