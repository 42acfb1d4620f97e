//! Interactive console for `serve` and attached `start`

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

use crate::cli::{print_entries, print_status, LogsArgs};
use crate::core::{ManagerError, ProcessSupervisor, RunStatus};

/// One console line
#[derive(Parser, Debug)]
#[command(
    no_binary_name = true,
    disable_version_flag = true
)]
struct ConsoleLine {
    #[command(subcommand)]
    command: ConsoleCommand,
}

#[derive(Subcommand, Debug, PartialEq)]
enum ConsoleCommand {
    /// Start an instance in the background
    Start { name: String },
    /// Ask an instance to shut down through its console
    Stop { name: String },
    /// Kill an instance immediately
    ForceStop { name: String },
    /// Send a line to an instance's console
    Cmd {
        name: String,
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        text: Vec<String>,
    },
    /// Query captured output
    Logs(LogsArgs),
    /// Show an instance's state
    Status { name: String },
    /// List configured instances
    List,
    /// Leave the console; running instances keep running
    #[command(alias = "exit")]
    Quit,
}

enum Flow {
    Continue,
    Quit,
}

/// Console loop owning the supervisor until `quit`, end of input or Ctrl-C
pub async fn serve(supervisor: ProcessSupervisor) -> Result<()> {
    println!("instancekeeper console; type `help` for commands");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    debug!("Console input closed");
                    break;
                };
                if let Flow::Quit = handle_line(&supervisor, &line).await {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
        }
    }

    let running = supervisor.running().await?;
    if !running.is_empty() {
        info!(
            "Leaving {} instance(s) running; their stdin closes with this console",
            running.len()
        );
    }
    Ok(())
}

async fn handle_line(supervisor: &ProcessSupervisor, line: &str) -> Flow {
    let words: Vec<&str> = line.split_whitespace().collect();
    if words.is_empty() {
        return Flow::Continue;
    }

    let command = match ConsoleLine::try_parse_from(words) {
        Ok(parsed) => parsed.command,
        Err(e) => {
            // Also covers `help`
            let _ = e.print();
            return Flow::Continue;
        }
    };

    match execute(supervisor, command).await {
        Ok(flow) => flow,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            Flow::Continue
        }
    }
}

async fn execute(supervisor: &ProcessSupervisor, command: ConsoleCommand) -> Result<Flow> {
    match command {
        ConsoleCommand::Start { name } => {
            let started = supervisor.start(&name).await?;
            println!(
                "Started '{}' as pid {} (run #{})",
                started.instance_name, started.pid, started.start_id
            );
            let watcher = supervisor.clone();
            tokio::spawn(async move {
                if let Some(status) = watcher.wait_for_exit(&name).await {
                    println!("'{}' exited: {}", name, status);
                }
            });
        }
        ConsoleCommand::Stop { name } => {
            supervisor.stop(&name).await?;
            println!("Stop requested for '{}'", name);
        }
        ConsoleCommand::ForceStop { name } => {
            supervisor.force_stop(&name).await?;
            println!("Killed '{}'", name);
        }
        ConsoleCommand::Cmd { name, text } => {
            supervisor.send_command(&name, &text.join(" ")).await?;
        }
        ConsoleCommand::Logs(args) => {
            let entries = supervisor.query_logs(&args.name, args.to_query()).await?;
            print_entries(&entries, args.json)?;
        }
        ConsoleCommand::Status { name } => {
            print_status(&supervisor.status(&name).await?, false)?;
        }
        ConsoleCommand::List => {
            for name in supervisor.list_instances().await? {
                println!("{}", name);
            }
        }
        ConsoleCommand::Quit => return Ok(Flow::Quit),
    }
    Ok(Flow::Continue)
}

/// Relay terminal input to a freshly started instance until it exits.
///
/// Ctrl-C asks the instance to stop; a second Ctrl-C kills it.
pub async fn attach(supervisor: &ProcessSupervisor, name: &str) -> Result<Option<RunStatus>> {
    let Some(exit) = supervisor.exit_signal(name) else {
        return Ok(None);
    };
    let exit = exit.wait();
    tokio::pin!(exit);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut input_open = true;
    let mut interrupted = false;

    loop {
        tokio::select! {
            status = &mut exit => return Ok(status),
            line = lines.next_line(), if input_open => match line {
                Ok(Some(line)) => match supervisor.send_command(name, &line).await {
                    Ok(()) => {}
                    // Raced with the exit; the exit branch reports it
                    Err(ManagerError::InstanceNotRunning(_)) => {}
                    Err(e) => warn!("Could not forward input to '{}': {}", name, e),
                },
                Ok(None) => {
                    debug!("Terminal input closed, still waiting for '{}'", name);
                    input_open = false;
                }
                Err(e) => {
                    warn!("Reading terminal input failed: {}", e);
                    input_open = false;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                if interrupted {
                    info!("Killing '{}'", name);
                    supervisor.force_stop(name).await?;
                } else {
                    info!("Stopping '{}' (Ctrl-C again to kill)", name);
                    interrupted = true;
                    if let Err(e) = supervisor.stop(name).await {
                        warn!("Graceful stop of '{}' failed: {}", name, e);
                    }
                }
            }
        }
    }
}
