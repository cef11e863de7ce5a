mod tools;
mod transport;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use env_logger::Env;
use log::info;
use psg_lib::{config::PsgConfig, error::ErrorReport};
use serde_json::json;
use std::{fs, path::PathBuf, process::ExitCode};

use crate::tools::ToolRegistry;

#[derive(Parser)]
#[command(author, version, about = "psg-serve JSON-lines tool server", long_about = None)]
struct Cli {
    /// Logging verbosity (e.g., debug, info, warn)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Transport to expose (stdio)
    #[arg(long, default_value = "stdio")]
    transport: String,

    /// TOML file overriding access and analysis defaults
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Clone)]
enum Command {
    /// Serve tool requests over the configured transport (default)
    Serve,
    /// List registered tools
    ListTools,
    /// Invoke any registered tool by name (JSON params)
    RunTool {
        /// Tool identifier (e.g., get_info)
        #[arg(long)]
        name: String,
        /// Optional JSON file for parameters
        #[arg(long)]
        params: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    let mut args = Cli::parse();
    let command = args.command.take().unwrap_or(Command::Serve);

    env_logger::Builder::from_env(Env::default().default_filter_or(&args.log_level)).init();

    match run(&args, command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            println!("{}", json!({ "error": ErrorReport::from_anyhow(&err) }));
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Cli, command: Command) -> Result<()> {
    let config = PsgConfig::load_or_default(args.config.as_deref())?;
    let registry = ToolRegistry::new(config);

    match command {
        Command::Serve => {
            info!(
                "Starting psg-serve with transport={} and log_level={}",
                args.transport, args.log_level
            );
            registry.log_summary();
            transport::run(&registry, &args.transport)?;
        }
        Command::ListTools => {
            let response = registry.execute("list_tools", None)?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Command::RunTool { name, params } => {
            let json_params = if let Some(path) = params {
                let content = fs::read_to_string(&path)
                    .with_context(|| format!("reading {}", path.display()))?;
                serde_json::from_str(&content)
                    .with_context(|| format!("parsing {}", path.display()))?
            } else {
                json!({})
            };
            let response = registry.execute(&name, Some(json_params))?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
    }

    Ok(())
}
