//! Medic Control - diagnose and repair this computer with a reasoning service

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use medic_common::{MedicConfig, ProblemType};
use medicctl::commands::{self, App};
use medicctl::{log_directive, LOG_ENV};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "medicctl")]
#[command(about = "Medic - evidence-driven computer troubleshooting", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (default: <config dir>/medic/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Machine-readable JSON output
    #[arg(long, global = true)]
    json: bool,

    /// More logging (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Talk to Medic; starts an interactive session when no message is given
    Chat {
        /// Problem description
        message: Vec<String>,
    },

    /// Run a canned investigation
    Diagnose {
        /// crash, slow, network, disk, boot or general
        problem: ProblemType,

        /// Apply fix number N from the results (asks for approval)
        #[arg(long, value_name = "N")]
        apply: Option<usize>,
    },

    /// Synthesize issues and fixes from raw model output (file or stdin)
    Analyze {
        file: Option<PathBuf>,
    },

    /// Execute a fix from a JSON file
    Apply {
        fix: PathBuf,

        /// Skip the approval prompt
        #[arg(long)]
        yes: bool,
    },

    /// Open the system restore tool
    Rollback,

    /// List the diagnostic tools offered to the model
    Tools,
}

fn init_tracing(verbose: u8) {
    let env = std::env::var(LOG_ENV).ok();
    let directive = log_directive(verbose, env.as_deref());
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = MedicConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    let app = App::new(config, cli.json);

    match cli.command {
        Commands::Chat { message } => {
            let message = (!message.is_empty()).then(|| message.join(" "));
            commands::chat(&app, message).await
        }
        Commands::Diagnose { problem, apply } => commands::diagnose(&app, problem, apply).await,
        Commands::Analyze { file } => commands::analyze(&app, file.as_deref()),
        Commands::Apply { fix, yes } => commands::apply(&app, &fix, yes).await,
        Commands::Rollback => commands::rollback(&app).await,
        Commands::Tools => commands::tools(&app),
    }
}
