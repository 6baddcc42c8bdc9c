mod cli;

use anyhow::Result;
use clap::{Parser, Subcommand};
use cli::handlers;
use contentflow_core::services::logging::init_logging;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "contentflow")]
#[command(version)]
#[command(about = "Content pipeline workflow orchestration engine")]
#[command(
    help_template = "{name} - {version}\n{about}\n\n{usage-heading}\n  {usage}\n\n{all-args}{options}\n"
)]
struct Cli {
    /// Path to configuration file (default: ~/.config/contentflow/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API server
    ///
    /// Sessions left unfinished by a previous run are resumed on startup.
    Serve {
        /// Server bind address (overrides configuration)
        #[arg(long)]
        host: Option<String>,

        /// Server port number (overrides configuration)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Run a prompt through the pipeline and wait for the result
    ///
    /// Examples:
    ///   contentflow run "Announce our spring collection" --user alice
    ///   contentflow run "Weekly digest" --user bob --json
    Run {
        /// Prompt for content generation
        prompt: String,

        /// User the session belongs to
        #[arg(short, long, default_value = "local")]
        user: String,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Show the status of a session
    Status {
        /// Session ID
        session_id: String,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// List the sessions of a user
    List {
        /// User ID
        #[arg(short, long, default_value = "local")]
        user: String,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Manage configuration
    Config {
        /// Write a configuration file with defaults
        #[arg(long)]
        init: bool,

        /// Overwrite an existing configuration file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Config { init, force } = cli.command {
        if init {
            handlers::handle_config_init(cli.config, force).await?;
        } else {
            println!("Use 'contentflow config --init' to write a configuration file");
        }
        return Ok(());
    }

    let config = handlers::load_config(cli.config.as_deref())?;
    if let Err(e) = init_logging(config.log_level) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    match cli.command {
        Commands::Serve { host, port } => {
            handlers::handle_serve(config, host, port).await?;
        }
        Commands::Run { prompt, user, json } => {
            handlers::handle_run(config, prompt, user, json).await?;
        }
        Commands::Status { session_id, json } => {
            handlers::handle_status(config, session_id, json).await?;
        }
        Commands::List { user, json } => {
            handlers::handle_list(config, user, json).await?;
        }
        Commands::Config { .. } => {}
    }

    Ok(())
}
