use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

use gearctl::config::{CliOverrides, NodeConfig};
use gearctl::lifecycle::GearControlOptions;
use gearctl::observability::{self, LogFormat};

mod cmd;

#[derive(Parser)]
#[command(name = "gearctl")]
#[command(version, about = "Build, deploy and control the gears hosted on this node")]
pub struct Cli {
    /// Node config file (default: /etc/gearctl/node.toml if present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory holding gear homes. Overrides config and GEAR_BASE_DIR.
    #[arg(long, global = true)]
    pub gear_base_dir: Option<PathBuf>,

    /// Log filter directive, e.g. "debug" or "gearctl=trace"
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[arg(long, global = true, value_enum)]
    pub log_format: Option<LogFormat>,

    /// Gear to operate on. Hooks inherit it from GEAR_UUID.
    #[arg(long, global = true, env = "GEAR_UUID")]
    pub gear: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            gear_base_dir: self.gear_base_dir.clone(),
            log_level: self.log_level.clone(),
            log_format: self.log_format,
        }
    }

    fn gear_uuid(&self) -> Result<&str> {
        self.gear
            .as_deref()
            .filter(|g| !g.is_empty())
            .context("No gear selected: pass --gear <uuid> or set GEAR_UUID")
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// git pre-receive: stop the gear (or delegate to the builder cartridge)
    PreReceive,
    /// git post-receive: materialize, build and roll out the pushed code
    PostReceive,
    /// Run pre-build and build on the primary cartridge
    Build,
    /// Run deploy on the web proxy and the primary cartridge
    Deploy,
    /// Run post-deploy on the primary cartridge
    PostDeploy,
    /// Roll out an already built artifact without materializing or building
    RemoteDeploy,
    /// Start the gear's cartridges
    Start(ControlArgs),
    /// Stop the gear's cartridges
    Stop(ControlArgs),
    /// Show lifecycle state, cartridges and stop lock
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Inspect or clear cartridge state markers
    Marker {
        #[command(subcommand)]
        command: MarkerCommands,
    },
    /// View or validate node configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Args, Clone, Copy)]
pub struct ControlArgs {
    /// Only the primary cartridge
    #[arg(long, conflicts_with = "secondary_only")]
    pub primary_only: bool,

    /// Every cartridge except the primary
    #[arg(long)]
    pub secondary_only: bool,

    /// Operator-driven; sets or clears the stop lock
    #[arg(long)]
    pub user_initiated: bool,
}

impl From<ControlArgs> for GearControlOptions {
    fn from(args: ControlArgs) -> Self {
        GearControlOptions {
            secondary_only: args.secondary_only,
            primary_only: args.primary_only,
            user_initiated: args.user_initiated,
        }
    }
}

#[derive(Subcommand, Clone)]
pub enum MarkerCommands {
    /// Exit 0 if the marker exists, 1 otherwise
    Exists { cartridge: String, marker: String },
    /// Print the marker content
    Read { cartridge: String, marker: String },
    /// Remove the marker (no error if absent)
    Remove { cartridge: String, marker: String },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let config = NodeConfig::resolve(cli.config.as_deref(), &cli.overrides())?;
    observability::init_logging(&config.logging.level, config.logging.format);
    for warning in config.validate() {
        tracing::warn!("{}", warning);
    }

    let stage = match &cli.command {
        Commands::PreReceive => cmd::Stage::PreReceive,
        Commands::PostReceive => cmd::Stage::PostReceive,
        Commands::Build => cmd::Stage::Build,
        Commands::Deploy => cmd::Stage::Deploy,
        Commands::PostDeploy => cmd::Stage::PostDeploy,
        Commands::RemoteDeploy => cmd::Stage::RemoteDeploy,
        Commands::Start(args) => cmd::Stage::Start((*args).into()),
        Commands::Stop(args) => cmd::Stage::Stop((*args).into()),
        Commands::Status { json } => {
            cmd::cmd_status(&config, cli.gear_uuid()?, *json)?;
            return Ok(ExitCode::SUCCESS);
        }
        Commands::Marker { command } => {
            return cmd::cmd_marker(&config, cli.gear_uuid()?, command);
        }
        Commands::Config { command } => {
            cmd::cmd_config(&config, cli.config.as_deref(), command.clone())?;
            return Ok(ExitCode::SUCCESS);
        }
    };

    cmd::run_stage(&config, cli.gear_uuid()?, stage).await?;
    Ok(ExitCode::SUCCESS)
}
