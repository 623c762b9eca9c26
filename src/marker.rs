//! Cartridge markers.
//!
//! Hook scripts signal state across stages by dropping small files under the
//! gear's data area:
//!
//! ```text
//! <gear home>/app-root/data/.<cartridge>_cartridge_state/<marker>
//! ```
//!
//! The lifecycle core never writes markers. This store exposes the naming
//! convention and read/remove access for operators and test harnesses.

use std::fs;
use std::path::PathBuf;

use crate::errors::{LifecycleError, Result};
use crate::gear::GearPaths;

/// Directory name holding a cartridge's markers.
///
/// Every character that is not ASCII alphanumeric becomes `_`, so
/// `mock-plugin` maps to `.mock_plugin_cartridge_state`.
pub fn cartridge_state_dir_name(cartridge: &str) -> String {
    let normalized: String = cartridge
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!(".{}_cartridge_state", normalized)
}

fn validate_marker_name(name: &str) -> Result<()> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0']);
    if invalid {
        return Err(LifecycleError::InvalidMarkerName {
            name: name.to_string(),
        });
    }
    Ok(())
}

pub struct MarkerStore {
    data_dir: PathBuf,
}

impl MarkerStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn for_gear(paths: &GearPaths) -> Self {
        Self::new(paths.data_dir())
    }

    pub fn state_dir(&self, cartridge: &str) -> PathBuf {
        self.data_dir.join(cartridge_state_dir_name(cartridge))
    }

    /// Path of a marker file. The name must be a single path component.
    pub fn marker_path(&self, cartridge: &str, marker: &str) -> Result<PathBuf> {
        validate_marker_name(marker)?;
        Ok(self.state_dir(cartridge).join(marker))
    }

    /// False for invalid names as well as absent markers.
    pub fn exists(&self, cartridge: &str, marker: &str) -> bool {
        self.marker_path(cartridge, marker)
            .is_ok_and(|path| path.is_file())
    }

    /// Marker content with one trailing line ending removed.
    pub fn read(&self, cartridge: &str, marker: &str) -> Result<String> {
        let path = self.marker_path(cartridge, marker)?;
        let mut content =
            fs::read_to_string(&path).map_err(|source| LifecycleError::MarkerIo { path, source })?;
        if content.ends_with('\n') {
            content.pop();
            if content.ends_with('\r') {
                content.pop();
            }
        }
        Ok(content)
    }

    /// Remove a marker. Removing a marker that does not exist succeeds.
    pub fn remove(&self, cartridge: &str, marker: &str) -> Result<()> {
        let path = self.marker_path(cartridge, marker)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(LifecycleError::MarkerIo { path, source }),
        }
    }
}
