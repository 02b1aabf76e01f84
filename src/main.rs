//! toolrelay - run autonomous tool-calling tasks against a local LLM backend
//!
//! Subcommands:
//! - `toolrelay servers` - List the enabled tool servers
//! - `toolrelay models` - List the backend's models and their load state
//! - `toolrelay run --task <text>` - Run one task to completion

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

use toolrelay::{ConversationMode, ExecutionEngine, ExecutionRequest, TerminalReason};

#[derive(Parser)]
#[command(name = "toolrelay")]
#[command(about = "Autonomous tool-calling engine for local LLM backends")]
#[command(version)]
struct Cli {
    /// Engine config file (toolrelay.yaml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Write logs to this file (rotated) instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the enabled tool servers
    Servers {
        /// Tool-server config file, searched ahead of the defaults
        #[arg(long)]
        servers_config: Option<PathBuf>,
    },

    /// List the backend's models
    Models {
        /// Bypass the model cache
        #[arg(long)]
        refresh: bool,
    },

    /// Run one task
    Run {
        /// What the model should accomplish
        #[arg(short, long)]
        task: String,

        /// Comma-separated server names (default: every enabled server)
        #[arg(long, value_delimiter = ',')]
        servers: Vec<String>,

        #[arg(short, long)]
        model: Option<String>,

        #[arg(long)]
        max_rounds: Option<u32>,

        #[arg(long)]
        max_tokens: Option<u32>,

        /// stateless or stateful
        #[arg(long)]
        mode: Option<ConversationMode>,

        /// Tool-server config file, searched ahead of the defaults
        #[arg(long)]
        servers_config: Option<PathBuf>,

        /// Wall-clock limit for the whole run, in seconds
        #[arg(long)]
        deadline: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    toolrelay::init_tracing(cli.log_file.as_deref()).context("failed to initialize logging")?;

    let config = toolrelay::load_config(cli.config.as_deref())?;
    let engine = ExecutionEngine::from_config(config)?;

    match cli.command {
        Commands::Servers { servers_config } => {
            print_json(&engine.list_available_servers(servers_config.as_deref()))?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Models { refresh } => {
            let models = engine.models().list_models(refresh).await?;
            print_json(models.as_slice())?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Run {
            task,
            servers,
            model,
            max_rounds,
            max_tokens,
            mode,
            servers_config,
            deadline,
        } => {
            let request = ExecutionRequest {
                server_names: servers,
                task,
                model,
                max_rounds,
                max_tokens,
                mode,
                servers_config,
            };
            let outcome = match deadline {
                Some(secs) => {
                    engine
                        .execute_with_deadline(request, Duration::from_secs(secs))
                        .await
                }
                None => engine.execute(request).await,
            };

            match outcome {
                Ok(result) => {
                    print_json(&result)?;
                    Ok(if result.terminal_reason == TerminalReason::Error {
                        ExitCode::FAILURE
                    } else {
                        ExitCode::SUCCESS
                    })
                }
                Err(e) => {
                    print_json(&e.to_structured())?;
                    Ok(ExitCode::FAILURE)
                }
            }
        }
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
