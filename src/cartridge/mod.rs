//! Cartridges attached to a gear and the roles they play.
//!
//! Each cartridge lives in its own directory under the gear home and
//! describes itself with `metadata/manifest.toml`:
//!
//! ```toml
//! name = "mock-plugin"
//! version = "0.1"
//! categories = ["web_framework"]
//! ```
//!
//! Roles are derived from categories:
//!
//! | Category        | Role        |
//! |-----------------|-------------|
//! | `web_framework` | `Primary`   |
//! | `ci_builder`    | `Builder`   |
//! | `web_proxy`     | `WebProxy`  |
//!
//! At most one cartridge may claim each role.

pub mod dispatcher;

pub use dispatcher::{CartridgeControl, CartridgeDispatcher, ControlOptions};

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::errors::{LifecycleError, Result};

/// Role a cartridge plays in the deploy pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CartridgeRole {
    /// Owns the gear's main listening process
    Primary,
    /// Takes over the whole build/deploy pipeline
    Builder,
    /// Fronts inbound traffic; deployed before the primary
    WebProxy,
}

impl CartridgeRole {
    pub fn all() -> &'static [CartridgeRole] {
        &[
            CartridgeRole::Primary,
            CartridgeRole::Builder,
            CartridgeRole::WebProxy,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CartridgeRole::Primary => "primary",
            CartridgeRole::Builder => "builder",
            CartridgeRole::WebProxy => "web-proxy",
        }
    }

    /// Manifest category that grants this role.
    pub fn category(&self) -> &'static str {
        match self {
            CartridgeRole::Primary => "web_framework",
            CartridgeRole::Builder => "ci_builder",
            CartridgeRole::WebProxy => "web_proxy",
        }
    }
}

impl std::fmt::Display for CartridgeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Contents of `metadata/manifest.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CartridgeManifest {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub categories: Vec<String>,
}

/// A cartridge instance attached to a gear.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Cartridge {
    pub name: String,
    pub version: Option<String>,
    pub directory: PathBuf,
    pub categories: Vec<String>,
}

impl Cartridge {
    pub fn new(name: impl Into<String>, directory: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            version: None,
            directory: directory.into(),
            categories: Vec::new(),
        }
    }

    pub fn with_role(mut self, role: CartridgeRole) -> Self {
        self.categories.push(role.category().to_string());
        self
    }

    pub fn has_role(&self, role: CartridgeRole) -> bool {
        self.categories.iter().any(|c| c == role.category())
    }

    /// Path of the control script hooks are dispatched through.
    pub fn control_script(&self) -> PathBuf {
        self.directory.join("bin").join("control")
    }

    fn from_manifest(directory: &Path) -> Result<Option<Self>> {
        let manifest_path = directory.join("metadata").join("manifest.toml");
        if !manifest_path.is_file() {
            return Ok(None);
        }
        let content = fs::read_to_string(&manifest_path)
            .map_err(|e| LifecycleError::io(&manifest_path, e))?;
        let manifest: CartridgeManifest =
            toml::from_str(&content).map_err(|e| LifecycleError::ManifestInvalid {
                path: manifest_path.clone(),
                message: e.to_string(),
            })?;
        if manifest.name.trim().is_empty() {
            return Err(LifecycleError::ManifestInvalid {
                path: manifest_path,
                message: "cartridge name is empty".to_string(),
            });
        }
        Ok(Some(Self {
            name: manifest.name,
            version: manifest.version,
            directory: directory.to_path_buf(),
            categories: manifest.categories,
        }))
    }
}

/// The cartridges of one gear with their roles resolved.
///
/// Built once and then read-only, so role lookups stay stable for the
/// lifetime of a pipeline invocation.
#[derive(Debug, Clone, Default)]
pub struct CartridgeSet {
    cartridges: Vec<Cartridge>,
    primary: Option<usize>,
    builder: Option<usize>,
    web_proxy: Option<usize>,
}

impl CartridgeSet {
    /// Resolve roles for an ordered list of cartridges.
    pub fn new(cartridges: Vec<Cartridge>) -> Result<Self> {
        let mut set = Self {
            cartridges,
            ..Default::default()
        };
        for role in CartridgeRole::all() {
            let mut found: Option<usize> = None;
            for (idx, cart) in set.cartridges.iter().enumerate() {
                if !cart.has_role(*role) {
                    continue;
                }
                if let Some(first) = found {
                    return Err(LifecycleError::DuplicateRole {
                        role: *role,
                        first: set.cartridges[first].name.clone(),
                        second: cart.name.clone(),
                    });
                }
                found = Some(idx);
            }
            *set.slot_mut(*role) = found;
        }
        Ok(set)
    }

    /// Discover cartridges under a gear home, ordered by directory name.
    ///
    /// Directories without `metadata/manifest.toml` are not cartridges and are
    /// skipped.
    pub fn discover(gear_home: &Path) -> Result<Self> {
        let entries = fs::read_dir(gear_home).map_err(|e| LifecycleError::io(gear_home, e))?;
        let mut dirs: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .collect();
        dirs.sort();

        let mut cartridges = Vec::new();
        for dir in dirs {
            if let Some(cart) = Cartridge::from_manifest(&dir)? {
                tracing::debug!(cartridge = %cart.name, dir = %dir.display(), "Discovered cartridge");
                cartridges.push(cart);
            }
        }
        Self::new(cartridges)
    }

    pub fn all(&self) -> &[Cartridge] {
        &self.cartridges
    }

    pub fn role(&self, role: CartridgeRole) -> Option<&Cartridge> {
        let idx = match role {
            CartridgeRole::Primary => self.primary,
            CartridgeRole::Builder => self.builder,
            CartridgeRole::WebProxy => self.web_proxy,
        };
        idx.map(|i| &self.cartridges[i])
    }

    fn slot_mut(&mut self, role: CartridgeRole) -> &mut Option<usize> {
        match role {
            CartridgeRole::Primary => &mut self.primary,
            CartridgeRole::Builder => &mut self.builder,
            CartridgeRole::WebProxy => &mut self.web_proxy,
        }
    }
}
