mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use switchboard_gateway::{LogRing, LogRingLayer};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Exit status for configuration errors that prevent startup.
const EXIT_CONFIG_ERROR: i32 = 2;

#[derive(Parser)]
#[command(name = "switchboard")]
#[command(about = "Multi-channel chat gateway for an LLM agent", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to ~/.switchboard/config.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway: channel adapters, agent workers and the admin API
    Gateway,

    /// Write a default configuration and workspace skeleton
    Onboard {
        /// Overwrite an existing configuration
        #[arg(long)]
        force: bool,
    },

    /// Show configuration and channel status
    Status,

    /// Manage workspace skills
    #[command(alias = "skill")]
    Skills {
        #[command(subcommand)]
        command: SkillsCommands,
    },
}

#[derive(Subcommand)]
enum SkillsCommands {
    /// List skills from every root
    List,
    /// Install a skill from a GitHub repository (owner/repo)
    Install { repository: String },
    /// Remove a workspace skill
    Remove { name: String },
}

fn init_tracing(verbose: bool, ring: LogRing) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .with(LogRingLayer::new(ring))
        .init();
}

async fn run(cli: Cli, ring: LogRing) -> anyhow::Result<()> {
    let config_path = cli.config;
    match cli.command {
        Commands::Gateway => commands::gateway::run(config_path, ring).await,
        Commands::Onboard { force } => commands::onboard::run(config_path, force).await,
        Commands::Status => commands::status::run(config_path).await,
        Commands::Skills { command } => match command {
            SkillsCommands::List => commands::skills::list(config_path).await,
            SkillsCommands::Install { repository } => {
                commands::skills::install(config_path, &repository).await
            }
            SkillsCommands::Remove { name } => commands::skills::remove(config_path, &name).await,
        },
    }
}

fn is_config_error(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<switchboard_core::Error>(),
        Some(switchboard_core::Error::Config(_))
    )
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Sized from config later; the layer needs a ring before anything logs.
    let ring = LogRing::new(commands::log_buffer_size(cli.config.as_deref()));
    init_tracing(cli.verbose, ring.clone());

    if let Err(e) = run(cli, ring).await {
        eprintln!("Error: {:#}", e);
        let code = if is_config_error(&e) { EXIT_CONFIG_ERROR } else { 1 };
        std::process::exit(code);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_gateway_with_config() {
        let cli = Cli::try_parse_from(["switchboard", "gateway", "--config", "/tmp/c.json", "-v"]).unwrap();
        assert!(matches!(cli.command, Commands::Gateway));
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/c.json")));
        assert!(cli.verbose);
    }

    #[test]
    fn test_parse_skills_install() {
        let cli = Cli::try_parse_from(["switchboard", "skills", "install", "acme/weather"]).unwrap();
        match cli.command {
            Commands::Skills { command: SkillsCommands::Install { repository } } => {
                assert_eq!(repository, "acme/weather")
            }
            _ => panic!("expected skills install"),
        }
    }

    #[test]
    fn test_config_errors_map_to_exit_code() {
        let err: anyhow::Error = switchboard_core::Error::Config("bad".into()).into();
        assert!(is_config_error(&err));
        let err: anyhow::Error = switchboard_core::Error::Transport("down".into()).into();
        assert!(!is_config_error(&err));
        let wrapped = anyhow::Error::from(switchboard_core::Error::Config("bad".into())).context("loading");
        assert!(is_config_error(&wrapped));
    }
}
