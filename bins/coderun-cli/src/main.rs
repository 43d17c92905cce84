mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "coderun-cli")]
#[command(about = "coderun CLI - Run scripts through the execution engine and manage its configuration", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a script file and stream its output
    Run {
        /// Script to execute
        file: PathBuf,

        /// Timeout in seconds (0 or omitted uses the configured default)
        #[arg(short, long)]
        timeout: Option<u64>,

        /// Engine config file (defaults to config/engine.json)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Print the effective engine configuration
    Config {
        /// Engine config file (defaults to config/engine.json)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Write a default config/engine.json
    Init {
        /// Project path
        #[arg(short, long, default_value = ".")]
        path: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so they never mix with the script's stdout
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"))
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { file, timeout, config } => {
            let code = commands::run_script(&file, timeout, config.as_deref()).await?;
            if code != 0 {
                std::process::exit(code);
            }
        }
        Commands::Config { config } => {
            commands::show_config(config.as_deref())?;
        }
        Commands::Init { path } => {
            commands::init_project(&path).await?;
        }
    }

    Ok(())
}
