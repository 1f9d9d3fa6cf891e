#![deny(warnings)]
#![deny(clippy::unwrap_used)]

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use dotenv::dotenv;
use serde::Serialize;
use tracing::error;

use testbed_remote::remote::inventory::{INVENTORY_ENV_VAR, resolve_inventory_path};
use testbed_remote::remote::{
    ConnectionOptions, ExecutionMode, HostExecutor, HostRegistry, RemoteError,
};

/// Run commands on testbed hosts over pooled SSH sessions.
#[derive(Parser)]
#[command(name = "testbed-remote", version, about)]
struct Cli {
    /// Host inventory (YAML)
    #[arg(long, global = true, env = INVENTORY_ENV_VAR)]
    inventory: Option<PathBuf>,

    /// TCP connect timeout in seconds
    #[arg(long, global = true)]
    connect_timeout: Option<u64>,

    /// Synchronous command timeout in seconds
    #[arg(long, global = true)]
    command_timeout: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List inventory hosts with their descriptions
    Hosts,
    /// Run a command and wait for it to finish
    Exec {
        /// Inventory host name (omit with --all)
        #[arg(required_unless_present = "all")]
        host: Option<String>,
        #[arg(last = true, required = true)]
        command: Vec<String>,
        /// Run on every host in the inventory
        #[arg(long, conflicts_with = "host")]
        all: bool,
        /// Hosts to skip with --all
        #[arg(long, requires = "all")]
        exclude: Vec<String>,
    },
    /// Start a command inside a detached tmux session
    Spawn {
        host: String,
        #[arg(last = true, required = true)]
        command: Vec<String>,
        /// tmux session name (default: bg_<random>)
        #[arg(long)]
        name: Option<String>,
    },
    /// Kill a tmux session, optionally pkill-ing a process pattern too
    Stop {
        host: String,
        name: String,
        #[arg(long)]
        kill_pattern: Option<String>,
        #[arg(long)]
        sudo: bool,
    },
    /// Check whether a tmux session or process is running
    Status {
        host: String,
        /// tmux session name
        #[arg(required_unless_present = "process")]
        name: Option<String>,
        /// Process command-line pattern (pgrep -f)
        #[arg(long)]
        process: Option<String>,
    },
    /// Probe every host with an echo
    Probe,
}

fn print_json<T: Serialize>(value: &T) -> Result<(), RemoteError> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| RemoteError::Config(format!("failed to encode output: {}", e)))?;
    println!("{}", json);
    Ok(())
}

async fn dispatch(executor: &HostExecutor, command: Command) -> Result<bool, RemoteError> {
    match command {
        Command::Hosts => {
            print_json(&executor.registry().list_hosts())?;
            Ok(true)
        }
        Command::Exec {
            host,
            command,
            all,
            exclude,
        } => {
            let command = command.join(" ");
            if all {
                let exclude: Vec<&str> = exclude.iter().map(String::as_str).collect();
                let results = executor
                    .execute_on_all_hosts(&command, ExecutionMode::Sync, &exclude)
                    .await;
                print_json(&results)?;
                Ok(results.values().all(|r| r.success))
            } else {
                let host = host.unwrap_or_default();
                let result = executor
                    .execute(&host, &command, ExecutionMode::Sync, None)
                    .await?;
                print_json(&result)?;
                Ok(result.success)
            }
        }
        Command::Spawn {
            host,
            command,
            name,
        } => {
            let result = executor
                .execute(&host, &command.join(" "), ExecutionMode::Detached, name)
                .await?;
            print_json(&result)?;
            Ok(result.success)
        }
        Command::Stop {
            host,
            name,
            kill_pattern,
            sudo,
        } => {
            let result = executor
                .stop_session(&host, &name, kill_pattern.as_deref(), sudo)
                .await?;
            print_json(&result)?;
            Ok(result.success)
        }
        Command::Status {
            host,
            name,
            process,
        } => {
            let mut status = serde_json::Map::new();
            if let Some(name) = &name {
                let running = executor.session_running(&host, name).await?;
                status.insert(
                    "session".into(),
                    serde_json::json!({ "name": name, "running": running }),
                );
            }
            if let Some(pattern) = &process {
                let running = executor.process_running(&host, pattern).await?;
                status.insert(
                    "process".into(),
                    serde_json::json!({ "pattern": pattern, "running": running }),
                );
            }
            print_json(&status)?;
            Ok(true)
        }
        Command::Probe => {
            let status = executor.test_connections().await;
            print_json(&status)?;
            Ok(status.values().all(|ok| *ok))
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv().ok();

    // Logs go to stderr so stdout stays valid JSON
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().expect("valid directive")),
        )
        .init();

    let cli = Cli::parse();

    let options = match ConnectionOptions::resolve(cli.connect_timeout, cli.command_timeout) {
        Ok(options) => options,
        Err(e) => {
            error!("{}", e);
            return ExitCode::from(2);
        }
    };

    let inventory = resolve_inventory_path(cli.inventory);
    let registry = match HostRegistry::load(&inventory) {
        Ok(registry) => registry,
        Err(e) => {
            error!("{}", e);
            return ExitCode::from(2);
        }
    };

    let executor = HostExecutor::connect(registry, options);
    let outcome = dispatch(&executor, cli.command).await;
    executor.shutdown().await;

    match outcome {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{}", e);
            ExitCode::from(if e.is_fatal() { 2 } else { 1 })
        }
    }
}
