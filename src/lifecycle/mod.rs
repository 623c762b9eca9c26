//! Build/deploy pipeline and start/stop supervision for a single gear.

pub mod control;
pub mod orchestrator;

pub use control::{
    CartridgeSupervisor, ControlOrder, GearControlOptions, GearSupervisor, control_targets,
};
pub use orchestrator::GearOrchestrator;
