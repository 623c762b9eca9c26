//! Configuration view and validation: `gearctl config`.

use anyhow::{Context, Result};
use std::path::Path;

use gearctl::config::{DEFAULT_CONFIG_PATH, NodeConfig};

use super::super::ConfigCommands;

pub fn cmd_config(
    config: &NodeConfig,
    explicit: Option<&Path>,
    command: Option<ConfigCommands>,
) -> Result<()> {
    let source = match explicit {
        Some(path) => path.display().to_string(),
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => DEFAULT_CONFIG_PATH.to_string(),
        None => "(built-in defaults)".to_string(),
    };

    match command {
        None | Some(ConfigCommands::Show) => {
            println!("# Config file: {}", source);
            println!("# Effective values (with env/CLI overrides)");
            println!();
            let rendered =
                toml::to_string_pretty(config).context("Failed to serialize configuration")?;
            print!("{}", rendered);
        }
        Some(ConfigCommands::Validate) => {
            let warnings = config.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
        }
    }
    Ok(())
}
