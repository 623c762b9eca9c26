//! Cartridge state markers: `gearctl marker`.

use anyhow::Result;
use std::process::ExitCode;

use gearctl::config::NodeConfig;
use gearctl::gear::Gear;
use gearctl::marker::MarkerStore;

use super::super::MarkerCommands;

pub fn cmd_marker(config: &NodeConfig, uuid: &str, command: &MarkerCommands) -> Result<ExitCode> {
    let gear = Gear::load(&config.node.gear_base_dir, uuid)?;
    let markers = MarkerStore::for_gear(gear.paths());

    match command {
        MarkerCommands::Exists { cartridge, marker } => {
            if markers.exists(cartridge, marker) {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::FAILURE)
            }
        }
        MarkerCommands::Read { cartridge, marker } => {
            println!("{}", markers.read(cartridge, marker)?);
            Ok(ExitCode::SUCCESS)
        }
        MarkerCommands::Remove { cartridge, marker } => {
            markers.remove(cartridge, marker)?;
            tracing::info!(cartridge, marker, "Marker removed");
            Ok(ExitCode::SUCCESS)
        }
    }
}
