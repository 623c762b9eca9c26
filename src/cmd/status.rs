//! Gear status: `gearctl status`.

use anyhow::Result;
use serde::Serialize;

use gearctl::cartridge::{CartridgeRole, CartridgeSet};
use gearctl::config::NodeConfig;
use gearctl::gear::Gear;
use gearctl::repository::GitRepository;
use gearctl::state::{FileStateStore, LifecycleState, StateEntry, StateStore};

#[derive(Serialize)]
struct CartridgeStatus<'a> {
    name: &'a str,
    version: Option<&'a str>,
    roles: Vec<&'static str>,
}

#[derive(Serialize)]
struct GearStatus<'a> {
    gear: &'a Gear,
    state: LifecycleState,
    last_transition: Option<StateEntry>,
    stop_locked: bool,
    branch: &'a str,
    branch_head: Option<String>,
    cartridges: Vec<CartridgeStatus<'a>>,
}

pub fn cmd_status(config: &NodeConfig, uuid: &str, json: bool) -> Result<()> {
    let gear = Gear::load(&config.node.gear_base_dir, uuid)?;
    let store = FileStateStore::for_gear(gear.paths());
    let cartridges = CartridgeSet::discover(&gear.paths().home)?;
    let branch = config.node.deployment_branch.as_str();

    let status = GearStatus {
        gear: &gear,
        state: store.get()?,
        last_transition: store.history()?.pop(),
        stop_locked: gear.paths().stop_lock().exists(),
        branch,
        branch_head: GitRepository::for_gear(&gear, branch).head_sha(),
        cartridges: cartridges
            .all()
            .iter()
            .map(|c| CartridgeStatus {
                name: &c.name,
                version: c.version.as_deref(),
                roles: CartridgeRole::all()
                    .iter()
                    .filter(|r| c.has_role(**r))
                    .map(|r| r.as_str())
                    .collect(),
            })
            .collect(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!();
    println!(
        "{} {}",
        console::style("Gear").bold().cyan(),
        console::style(&gear.uuid).bold()
    );
    println!();
    println!("Name:      {}", gear.name);
    println!("Home:      {}", gear.paths().home.display());
    let state = match status.state {
        LifecycleState::Started => console::style(status.state.as_str()).green(),
        LifecycleState::Stopped | LifecycleState::Unknown => {
            console::style(status.state.as_str()).red()
        }
        _ => console::style(status.state.as_str()).yellow(),
    };
    match &status.last_transition {
        Some(entry) => println!(
            "State:     {} {}",
            state,
            console::style(format!("(since {})", entry.timestamp.to_rfc3339())).dim()
        ),
        None => println!("State:     {}", state),
    }
    if status.stop_locked {
        println!(
            "Stop lock: {}",
            console::style("present (automatic starts suppressed)").yellow()
        );
    }
    println!(
        "Branch:    {} @ {}",
        branch,
        status.branch_head.as_deref().unwrap_or("(no commits)")
    );
    println!();

    if status.cartridges.is_empty() {
        println!("No cartridges installed.");
    } else {
        println!("{:<24} {:<12} Roles", "Cartridge", "Version");
        println!("{:<24} {:<12} -----", "---------", "-------");
        for cart in &status.cartridges {
            println!(
                "{:<24} {:<12} {}",
                cart.name,
                cart.version.unwrap_or("-"),
                console::style(cart.roles.join(", ")).dim()
            );
        }
    }
    println!();
    Ok(())
}
