//! Gear start/stop.
//!
//! Starting or stopping a gear means dispatching `start`/`stop` to a subset of
//! its cartridges. Which cartridges, and in which order, is decided here:
//!
//! | Options          | Targets                     |
//! |------------------|-----------------------------|
//! | `primary_only`   | the primary cartridge       |
//! | `secondary_only` | every non-primary cartridge |
//! | neither          | all cartridges              |
//!
//! Start runs secondaries in discovery order and then the primary. Stop runs
//! the primary first and then the secondaries in reverse discovery order.
//!
//! A user-initiated stop leaves a stop lock behind; until a user-initiated
//! start clears it, automatic (non-user) starts are skipped.

use async_trait::async_trait;
use serde::Serialize;
use std::fs;
use std::path::PathBuf;

use crate::cartridge::{Cartridge, CartridgeControl, ControlOptions};
use crate::errors::{LifecycleError, Result};
use crate::output::OutputSinks;
use crate::state::{LifecycleState, StateStore};

/// Options for `start_gear`/`stop_gear`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GearControlOptions {
    pub secondary_only: bool,
    pub primary_only: bool,
    /// Operator-driven rather than automatic (e.g. a node restart)
    pub user_initiated: bool,
}

impl GearControlOptions {
    pub fn user() -> Self {
        Self {
            user_initiated: true,
            ..Default::default()
        }
    }

    pub fn secondaries() -> Self {
        Self {
            secondary_only: true,
            user_initiated: true,
            ..Default::default()
        }
    }

    pub fn primary() -> Self {
        Self {
            primary_only: true,
            user_initiated: true,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOrder {
    Start,
    Stop,
}

/// Cartridges targeted by a start or stop, in dispatch order.
pub fn control_targets<'c>(
    cartridges: &'c [Cartridge],
    primary: Option<&Cartridge>,
    options: GearControlOptions,
    order: ControlOrder,
) -> Vec<&'c Cartridge> {
    let is_primary = |c: &Cartridge| primary.is_some_and(|p| p.name == c.name);

    let mut secondaries: Vec<&Cartridge> = if options.primary_only {
        Vec::new()
    } else {
        cartridges.iter().filter(|c| !is_primary(*c)).collect()
    };
    let primary: Option<&Cartridge> = if options.secondary_only {
        None
    } else {
        cartridges.iter().find(|c| is_primary(*c))
    };

    match order {
        ControlOrder::Start => secondaries.into_iter().chain(primary).collect(),
        ControlOrder::Stop => {
            secondaries.reverse();
            primary.into_iter().chain(secondaries).collect()
        }
    }
}

/// Process supervision for a whole gear.
///
/// Real implementation: `CartridgeSupervisor`. Test double:
/// `testing::RecordingSupervisor`.
#[async_trait]
pub trait GearSupervisor: Send + Sync {
    async fn start_gear(
        &self,
        options: GearControlOptions,
        sinks: &mut OutputSinks,
    ) -> Result<String>;

    async fn stop_gear(
        &self,
        options: GearControlOptions,
        sinks: &mut OutputSinks,
    ) -> Result<String>;
}

/// Starts and stops a gear through its cartridges' control scripts.
pub struct CartridgeSupervisor<'a> {
    cartridges: &'a dyn CartridgeControl,
    state: &'a dyn StateStore,
    stop_lock: PathBuf,
}

impl<'a> CartridgeSupervisor<'a> {
    pub fn new(
        cartridges: &'a dyn CartridgeControl,
        state: &'a dyn StateStore,
        stop_lock: PathBuf,
    ) -> Self {
        Self {
            cartridges,
            state,
            stop_lock,
        }
    }

    pub fn stop_locked(&self) -> bool {
        self.stop_lock.exists()
    }

    async fn dispatch_all(
        &self,
        action: &str,
        options: GearControlOptions,
        order: ControlOrder,
        sinks: &mut OutputSinks,
    ) -> Result<String> {
        let primary = self.cartridges.primary_cartridge().ok();
        let targets = control_targets(self.cartridges.cartridges(), primary, options, order);

        let mut buffer = String::new();
        for cartridge in targets {
            tracing::info!(action, cartridge = %cartridge.name, "Controlling cartridge");
            buffer.push_str(
                &self
                    .cartridges
                    .do_control(action, cartridge, ControlOptions::default(), sinks)
                    .await?,
            );
        }
        Ok(buffer)
    }
}

#[async_trait]
impl GearSupervisor for CartridgeSupervisor<'_> {
    async fn start_gear(
        &self,
        options: GearControlOptions,
        sinks: &mut OutputSinks,
    ) -> Result<String> {
        if options.user_initiated {
            match fs::remove_file(&self.stop_lock) {
                Ok(()) => tracing::debug!("Stop lock cleared"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(LifecycleError::io(&self.stop_lock, e)),
            }
            self.state.set(LifecycleState::Started)?;
        } else if self.stop_locked() {
            tracing::info!("Gear is stop-locked; skipping automatic start");
            return Ok(String::new());
        }

        self.dispatch_all("start", options, ControlOrder::Start, sinks)
            .await
    }

    async fn stop_gear(
        &self,
        options: GearControlOptions,
        sinks: &mut OutputSinks,
    ) -> Result<String> {
        if options.user_initiated {
            if let Some(dir) = self.stop_lock.parent() {
                fs::create_dir_all(dir).map_err(|e| LifecycleError::io(dir, e))?;
            }
            fs::write(&self.stop_lock, b"").map_err(|e| LifecycleError::io(&self.stop_lock, e))?;
            self.state.set(LifecycleState::Stopped)?;
        }

        self.dispatch_all("stop", options, ControlOrder::Stop, sinks)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cartridge::CartridgeRole;
    use crate::testing::{Event, FakeCartridges, Journal, MemoryStateStore};
    use tempfile::tempdir;

    fn carts() -> Vec<Cartridge> {
        vec![
            Cartridge::new("haproxy", "/g/haproxy").with_role(CartridgeRole::WebProxy),
            Cartridge::new("mysql", "/g/mysql"),
            Cartridge::new("php", "/g/php").with_role(CartridgeRole::Primary),
        ]
    }

    fn names(targets: &[&Cartridge]) -> Vec<String> {
        targets.iter().map(|c| c.name.clone()).collect()
    }

    #[test]
    fn test_targets_start_secondaries_then_primary() {
        let carts = carts();
        let primary = carts.iter().find(|c| c.name == "php");
        let all = control_targets(&carts, primary, GearControlOptions::user(), ControlOrder::Start);
        assert_eq!(names(&all), vec!["haproxy", "mysql", "php"]);

        let secondary =
            control_targets(&carts, primary, GearControlOptions::secondaries(), ControlOrder::Start);
        assert_eq!(names(&secondary), vec!["haproxy", "mysql"]);

        let primary_only =
            control_targets(&carts, primary, GearControlOptions::primary(), ControlOrder::Start);
        assert_eq!(names(&primary_only), vec!["php"]);
    }

    #[test]
    fn test_targets_stop_primary_first_then_reverse() {
        let carts = carts();
        let primary = carts.iter().find(|c| c.name == "php");
        let all = control_targets(&carts, primary, GearControlOptions::user(), ControlOrder::Stop);
        assert_eq!(names(&all), vec!["php", "mysql", "haproxy"]);
    }

    #[test]
    fn test_targets_without_primary() {
        let carts = vec![Cartridge::new("mysql", "/g/mysql")];
        let primary_only =
            control_targets(&carts, None, GearControlOptions::primary(), ControlOrder::Start);
        assert!(primary_only.is_empty());
        let secondary =
            control_targets(&carts, None, GearControlOptions::secondaries(), ControlOrder::Start);
        assert_eq!(names(&secondary), vec!["mysql"]);
    }

    #[tokio::test]
    async fn test_user_stop_sets_lock_and_state() {
        let dir = tempdir().unwrap();
        let journal = Journal::default();
        let fake = FakeCartridges::new(carts(), journal.clone());
        let state = MemoryStateStore::new(journal.clone());
        let lock = dir.path().join(".stop_lock");
        let supervisor = CartridgeSupervisor::new(&fake, &state, lock.clone());

        supervisor
            .stop_gear(GearControlOptions::user(), &mut OutputSinks::null())
            .await
            .unwrap();
        assert!(lock.exists());
        assert_eq!(state.get().unwrap(), LifecycleState::Stopped);
        assert_eq!(
            journal.controls(),
            vec!["stop:php", "stop:mysql", "stop:haproxy"]
        );
    }

    #[tokio::test]
    async fn test_automatic_start_skipped_while_stop_locked() {
        let dir = tempdir().unwrap();
        let journal = Journal::default();
        let fake = FakeCartridges::new(carts(), journal.clone());
        let state = MemoryStateStore::new(journal.clone());
        let lock = dir.path().join(".stop_lock");
        fs::write(&lock, b"").unwrap();
        let supervisor = CartridgeSupervisor::new(&fake, &state, lock.clone());

        let out = supervisor
            .start_gear(GearControlOptions::default(), &mut OutputSinks::null())
            .await
            .unwrap();
        assert!(out.is_empty());
        assert!(journal.events().is_empty());

        supervisor
            .start_gear(GearControlOptions::user(), &mut OutputSinks::null())
            .await
            .unwrap();
        assert!(!lock.exists());
        assert_eq!(state.get().unwrap(), LifecycleState::Started);
        assert_eq!(
            journal.events().first(),
            Some(&Event::SetState(LifecycleState::Started))
        );
        assert_eq!(
            journal.controls(),
            vec!["start:haproxy", "start:mysql", "start:php"]
        );
    }

    #[tokio::test]
    async fn test_start_failure_stops_dispatch() {
        let dir = tempdir().unwrap();
        let journal = Journal::default();
        let fake = FakeCartridges::new(carts(), journal.clone()).failing("start", "mysql");
        let state = MemoryStateStore::new(journal.clone());
        let supervisor = CartridgeSupervisor::new(&fake, &state, dir.path().join(".stop_lock"));

        let err = supervisor
            .start_gear(GearControlOptions::user(), &mut OutputSinks::null())
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::HookExecution { .. }));
        assert_eq!(journal.controls(), vec!["start:haproxy", "start:mysql"]);
    }
}
