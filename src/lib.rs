//! Node-side lifecycle core for gears: build, deploy and start/stop of the
//! cartridges hosted in a gear, driven from git push hooks or the `gearctl`
//! CLI.

pub mod cartridge;
pub mod config;
pub mod errors;
pub mod gear;
pub mod git_hooks;
pub mod lifecycle;
pub mod marker;
pub mod observability;
pub mod output;
pub mod repository;
pub mod state;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use errors::{LifecycleError, Result};
pub use lifecycle::{GearControlOptions, GearOrchestrator};
