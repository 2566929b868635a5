//! Folio CLI - inspect the filter sync workspace
//!
//! Usage: folio <command> [options]

mod commands;

use anyhow::Context;
use clap::{Parser, Subcommand};
use folio_common::EXIT_ERROR;
use folio_config::{FolioConfig, FOLIO_DIR};
use std::fs;
use std::path::Path;

#[derive(Parser)]
#[command(name = "folio", version, about = "Dialog filter sync workspace tools")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose/debug logging
    #[arg(long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Create .folio/ with a default configuration
    Init,

    /// Print the effective configuration
    Config {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Inspect the persisted filter state
    State {
        #[command(subcommand)]
        action: StateAction,
    },
}

#[derive(Subcommand)]
enum StateAction {
    /// Print local filters, the main list position and pending operations
    Show {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Verify the structure of the persisted record
    Check,
}

fn main() {
    let cli = Cli::parse();

    let json_logs = std::env::var("FOLIO_LOG_JSON").is_ok_and(|v| v == "1");
    folio_common::telemetry::init_tracing(cli.verbose, json_logs);
    tracing::debug!("Folio CLI started");

    let result = match cli.command {
        Commands::Init => cmd_init(),
        Commands::Config { json } => cmd_config(json),
        Commands::State { action } => match action {
            StateAction::Show { json } => commands::state::show(json),
            StateAction::Check => commands::state::check(),
        },
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(EXIT_ERROR);
    }
}

/// Configuration of the workspace in the current directory
pub(crate) fn load_config() -> anyhow::Result<FolioConfig> {
    let cwd = std::env::current_dir().context("Failed to read current directory")?;
    FolioConfig::load(&cwd).context("Failed to load .folio/config.toml")
}

fn cmd_init() -> anyhow::Result<()> {
    let folio_dir = Path::new(FOLIO_DIR);

    if folio_dir.exists() {
        eprintln!("✓ {}/ already exists", FOLIO_DIR);
    } else {
        fs::create_dir(folio_dir).with_context(|| format!("Failed to create {}/", FOLIO_DIR))?;
        eprintln!("✓ Created {}/", FOLIO_DIR);
    }

    let state_dir = folio_dir.join("state");
    if !state_dir.exists() {
        fs::create_dir(&state_dir).context("Failed to create state directory")?;
        eprintln!("✓ Created {}/state/", FOLIO_DIR);
    }

    let config_path = FolioConfig::config_path(Path::new("."));
    if config_path.exists() {
        eprintln!("✓ {}/config.toml already exists", FOLIO_DIR);
        return Ok(());
    }
    let body = FolioConfig::default().to_toml_string()?;
    fs::write(&config_path, format!("# Folio configuration\n\n{}", body))
        .with_context(|| format!("Failed to write {}", config_path.display()))?;
    eprintln!("✓ Created {}/config.toml", FOLIO_DIR);
    Ok(())
}

fn cmd_config(json: bool) -> anyhow::Result<()> {
    let config = load_config()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&config)?);
    } else {
        print!("{}", config.to_toml_string()?);
    }
    Ok(())
}
