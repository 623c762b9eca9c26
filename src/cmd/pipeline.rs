//! Pipeline and start/stop commands.

use anyhow::{Context, Result};
use std::io::{IsTerminal, Read};
use tracing::Instrument;

use gearctl::cartridge::CartridgeDispatcher;
use gearctl::config::NodeConfig;
use gearctl::gear::{Gear, PipelineLock};
use gearctl::git_hooks::{RefUpdate, parse_ref_updates};
use gearctl::lifecycle::{CartridgeSupervisor, GearControlOptions, GearOrchestrator};
use gearctl::observability;
use gearctl::output::OutputSinks;
use gearctl::repository::GitRepository;
use gearctl::state::FileStateStore;

#[derive(Debug, Clone, Copy)]
pub enum Stage {
    PreReceive,
    PostReceive,
    Build,
    Deploy,
    PostDeploy,
    RemoteDeploy,
    Start(GearControlOptions),
    Stop(GearControlOptions),
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::PreReceive => "pre-receive",
            Stage::PostReceive => "post-receive",
            Stage::Build => "build",
            Stage::Deploy => "deploy",
            Stage::PostDeploy => "post-deploy",
            Stage::RemoteDeploy => "remote-deploy",
            Stage::Start(_) => "start",
            Stage::Stop(_) => "stop",
        }
    }

    /// Invoked as a git hook, with ref updates on stdin.
    fn is_git_hook(&self) -> bool {
        matches!(self, Stage::PreReceive | Stage::PostReceive)
    }
}

/// Run one stage against a gear while holding its pipeline lock.
pub async fn run_stage(config: &NodeConfig, uuid: &str, stage: Stage) -> Result<()> {
    let span = observability::gear_span(stage.name(), uuid);
    execute(config, uuid, stage).instrument(span).await
}

async fn execute(config: &NodeConfig, uuid: &str, stage: Stage) -> Result<()> {
    let gear = Gear::load(&config.node.gear_base_dir, uuid)?;
    let lock = PipelineLock::acquire(gear.paths())
        .with_context(|| format!("Cannot run {} on gear {}", stage.name(), gear.uuid))?;
    tracing::debug!(lock = %lock.path().display(), "Pipeline lock acquired");

    if stage.is_git_hook() {
        let updates = read_ref_updates()?;
        log_ref_updates(&updates, &config.node.deployment_branch);
    }

    let dispatcher = CartridgeDispatcher::load(&gear)?;
    let state = FileStateStore::for_gear(gear.paths());
    let repository = GitRepository::for_gear(&gear, config.node.deployment_branch.clone());
    let supervisor = CartridgeSupervisor::new(&dispatcher, &state, gear.paths().stop_lock());
    let orchestrator =
        GearOrchestrator::new(&gear, &dispatcher, &state, &repository, &supervisor);

    // Hook output is streamed to the terminal as it is produced.
    let mut sinks = OutputSinks::stdio();
    let result = match stage {
        Stage::PreReceive => orchestrator.pre_receive(&mut sinks).await,
        Stage::PostReceive => orchestrator.post_receive(&mut sinks).await,
        Stage::Build => orchestrator.build(&mut sinks).await,
        Stage::Deploy => orchestrator.deploy(&mut sinks).await,
        Stage::PostDeploy => orchestrator.post_deploy(&mut sinks).await,
        Stage::RemoteDeploy => orchestrator.remote_deploy(&mut sinks).await,
        Stage::Start(options) => orchestrator.start_gear(options, &mut sinks).await,
        Stage::Stop(options) => orchestrator.stop_gear(options, &mut sinks).await,
    };

    match result {
        Ok(_) => {
            tracing::info!(stage = stage.name(), "Stage complete");
            Ok(())
        }
        Err(e) => {
            tracing::error!(stage = stage.name(), error = %e, "Stage failed");
            Err(e).with_context(|| format!("{} failed for gear {}", stage.name(), gear.uuid))
        }
    }
}

fn read_ref_updates() -> Result<Vec<RefUpdate>> {
    let mut stdin = std::io::stdin();
    if stdin.is_terminal() {
        return Ok(Vec::new());
    }
    let mut input = String::new();
    stdin
        .read_to_string(&mut input)
        .context("Failed to read ref updates from stdin")?;
    Ok(parse_ref_updates(&input)?)
}

fn log_ref_updates(updates: &[RefUpdate], deployment_branch: &str) {
    for update in updates {
        let kind = if update.is_create() {
            "create"
        } else if update.is_delete() {
            "delete"
        } else {
            "update"
        };
        tracing::info!(
            reference = %update.name,
            kind,
            old = %update.old,
            new = %update.new,
            "Ref updated"
        );
    }
    if !updates.is_empty() && !updates.iter().any(|u| u.updates_branch(deployment_branch)) {
        tracing::info!(
            branch = deployment_branch,
            "Push does not update the deployment branch"
        );
    }
}
