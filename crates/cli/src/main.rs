//! Tilt CLI — the main entry point.
//!
//! Commands:
//! - `serve`     — Start the HTTP gateway
//! - `worker`    — Work through the task queue
//! - `exec-tool` — Run one tool directly and print its result
//! - `task`      — Add, list and reset queued tasks

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

#[derive(Parser)]
#[command(
    name = "tilt",
    about = "Tilt — computer-use agent and task runner",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON log lines
    #[arg(long, global = true)]
    log_json: bool,

    /// Config file to use instead of ~/.tilt/config.toml
    #[arg(long, global = true, env = "TILT_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP gateway server
    Serve {
        /// Override the port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Process pending tasks with the sampling loop
    Worker {
        /// Process at most one task, then exit
        #[arg(long)]
        once: bool,

        /// Keep processing after a task finishes
        #[arg(long)]
        no_pause: bool,
    },

    /// Execute a single tool and print `{output, error}` as JSON
    ExecTool {
        /// Tool name, e.g. `bash` or `computer`
        name: String,

        /// Tool input as a JSON object
        #[arg(short, long, default_value = "{}")]
        input: String,

        /// Tool group the tool is taken from
        #[arg(long, default_value = "computer_use_20241022")]
        tool_version: String,
    },

    /// Manage the task queue
    Task {
        #[command(subcommand)]
        command: commands::task::TaskCommand,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = commands::load_config(cli.config.as_deref())?;

    // Initialize tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));
    if cli.log_json || config.logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .init();
    }

    match cli.command {
        Commands::Serve { port } => commands::serve::run(config, port).await?,
        Commands::Worker { once, no_pause } => commands::worker::run(config, once, no_pause).await?,
        Commands::ExecTool {
            name,
            input,
            tool_version,
        } => commands::exec_tool::run(config, &name, &input, &tool_version).await?,
        Commands::Task { command } => commands::task::run(config, command).await?,
    }

    Ok(())
}
