//! Typed error hierarchy for the gear lifecycle core.
//!
//! Four variants form the pipeline taxonomy and are what callers match on:
//! - `HookExecution`: a cartridge control script or action hook failed
//! - `MissingCartridge`: a required cartridge role is absent
//! - `RepositoryDeploy`: the source tree could not be materialized
//! - `StatePersistence`: the lifecycle state could not be written durably
//!
//! The remaining variants cover loading a gear from disk and the CLI plumbing
//! around the pipeline.

use std::path::PathBuf;
use thiserror::Error;

use crate::cartridge::CartridgeRole;

/// Errors from the gear lifecycle core.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("Hook '{action}' failed for cartridge {cartridge} (exit {exit_code}): {stderr}")]
    HookExecution {
        action: String,
        cartridge: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("Gear has no {role} cartridge")]
    MissingCartridge { role: CartridgeRole },

    #[error("Cartridges {first} and {second} both claim the {role} role")]
    DuplicateRole {
        role: CartridgeRole,
        first: String,
        second: String,
    },

    #[error("Failed to deploy repository: {message}")]
    RepositoryDeploy {
        message: String,
        #[source]
        source: Option<RepositoryCause>,
    },

    #[error("Failed to persist lifecycle state at {path}: {source}")]
    StatePersistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid cartridge manifest at {path}: {message}")]
    ManifestInvalid { path: PathBuf, message: String },

    #[error("Failed to spawn hook {path}: {source}")]
    SpawnFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Gear {uuid} not found under {base_dir}")]
    GearNotFound { uuid: String, base_dir: PathBuf },

    #[error("Failed to access marker {path}: {source}")]
    MarkerIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Another pipeline invocation holds the lock at {path}")]
    PipelineLocked { path: PathBuf },

    #[error("Invalid marker name {name:?}")]
    InvalidMarkerName { name: String },

    #[error("Malformed ref update on line {line}: {content:?}")]
    InvalidRefUpdate { line: usize, content: String },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Underlying failure behind a `RepositoryDeploy` error.
#[derive(Debug, Error)]
pub enum RepositoryCause {
    #[error(transparent)]
    Git(#[from] git2::Error),

    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl LifecycleError {
    pub(crate) fn repository(message: impl Into<String>) -> Self {
        LifecycleError::RepositoryDeploy {
            message: message.into(),
            source: None,
        }
    }

    pub(crate) fn git(message: impl Into<String>, source: git2::Error) -> Self {
        LifecycleError::RepositoryDeploy {
            message: message.into(),
            source: Some(RepositoryCause::Git(source)),
        }
    }

    /// Filesystem failure while materializing or swapping the live tree.
    pub(crate) fn repository_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        LifecycleError::RepositoryDeploy {
            message: format!("I/O error at {}", path.display()),
            source: Some(RepositoryCause::Io { path, source }),
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        LifecycleError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T, E = LifecycleError> = std::result::Result<T, E>;
