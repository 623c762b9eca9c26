//! Node configuration for gearctl.
//!
//! Read from `/etc/gearctl/node.toml` (or `--config`), then layered:
//! file → environment → CLI.
//!
//! # Configuration File Format
//!
//! ```toml
//! [node]
//! gear_base_dir = "/var/lib/gears"
//! deployment_branch = "master"
//!
//! [logging]
//! level = "info"
//! format = "pretty"   # or "json"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::observability::LogFormat;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/gearctl/node.toml";

pub const ENV_GEAR_BASE_DIR: &str = "GEAR_BASE_DIR";
pub const ENV_DEPLOYMENT_BRANCH: &str = "GEAR_DEPLOYMENT_BRANCH";
pub const ENV_LOG: &str = "GEARCTL_LOG";

/// Where gears live on this node and which branch is deployed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSection {
    #[serde(default = "default_gear_base_dir")]
    pub gear_base_dir: PathBuf,
    #[serde(default = "default_deployment_branch")]
    pub deployment_branch: String,
}

fn default_gear_base_dir() -> PathBuf {
    PathBuf::from("/var/lib/gears")
}

fn default_deployment_branch() -> String {
    "master".to_string()
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            gear_base_dir: default_gear_base_dir(),
            deployment_branch: default_deployment_branch(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingSection {
    /// `EnvFilter` directive, e.g. `info` or `gearctl=debug`
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Overrides taken from command-line flags.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub gear_base_dir: Option<PathBuf>,
    pub log_level: Option<String>,
    pub log_format: Option<LogFormat>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub node: NodeSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl NodeConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse node.toml")
    }

    /// Load an explicit config file, or the default one if present.
    ///
    /// An explicit path that does not exist is an error; a missing default
    /// file just means built-in defaults.
    pub fn discover(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::load(path),
            None => {
                let default = Path::new(DEFAULT_CONFIG_PATH);
                if default.exists() {
                    Self::load(default)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Full resolution: file, then process environment, then CLI flags.
    pub fn resolve(explicit: Option<&Path>, cli: &CliOverrides) -> Result<Self> {
        let mut config = Self::discover(explicit)?;
        config.apply_env_with(|key| std::env::var(key).ok());
        config.apply_cli(cli);
        Ok(config)
    }

    /// Apply environment overrides through `lookup`.
    pub fn apply_env_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup(ENV_GEAR_BASE_DIR).filter(|v| !v.is_empty()) {
            self.node.gear_base_dir = PathBuf::from(dir);
        }
        if let Some(branch) = lookup(ENV_DEPLOYMENT_BRANCH).filter(|v| !v.is_empty()) {
            self.node.deployment_branch = branch;
        }
        if let Some(level) = lookup(ENV_LOG).filter(|v| !v.is_empty()) {
            self.logging.level = level;
        }
    }

    pub fn apply_cli(&mut self, cli: &CliOverrides) {
        if let Some(ref dir) = cli.gear_base_dir {
            self.node.gear_base_dir = dir.clone();
        }
        if let Some(ref level) = cli.log_level {
            self.logging.level = level.clone();
        }
        if let Some(format) = cli.log_format {
            self.logging.format = format;
        }
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        let branch_ref = format!("refs/heads/{}", self.node.deployment_branch);
        if !git2::Reference::is_valid_name(&branch_ref) {
            warnings.push(format!(
                "Invalid deployment_branch '{}': not a valid git branch name",
                self.node.deployment_branch
            ));
        }
        if !self.node.gear_base_dir.is_absolute() {
            warnings.push(format!(
                "gear_base_dir '{}' is relative; gear homes will resolve against the working directory",
                self.node.gear_base_dir.display()
            ));
        }

        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_empty_uses_defaults() {
        let config = NodeConfig::parse("").unwrap();
        assert_eq!(config.node.gear_base_dir, PathBuf::from("/var/lib/gears"));
        assert_eq!(config.node.deployment_branch, "master");
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, LogFormat::Pretty);
    }

    #[test]
    fn test_parse_full() {
        let content = r#"
[node]
gear_base_dir = "/srv/gears"
deployment_branch = "production"

[logging]
level = "gearctl=debug"
format = "json"
"#;
        let config = NodeConfig::parse(content).unwrap();
        assert_eq!(config.node.gear_base_dir, PathBuf::from("/srv/gears"));
        assert_eq!(config.node.deployment_branch, "production");
        assert_eq!(config.logging.level, "gearctl=debug");
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_parse_partial_section() {
        let config = NodeConfig::parse("[node]\ndeployment_branch = \"main\"\n").unwrap();
        assert_eq!(config.node.deployment_branch, "main");
        assert_eq!(config.node.gear_base_dir, PathBuf::from("/var/lib/gears"));
    }

    #[test]
    fn test_parse_invalid_format_fails() {
        assert!(NodeConfig::parse("[logging]\nformat = \"xml\"\n").is_err());
    }

    #[test]
    fn test_explicit_missing_file_is_error() {
        let dir = tempdir().unwrap();
        let err = NodeConfig::discover(Some(&dir.path().join("nope.toml"))).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn test_load_explicit_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("node.toml");
        std::fs::write(&path, "[node]\ngear_base_dir = \"/tmp/gears\"\n").unwrap();
        let config = NodeConfig::discover(Some(&path)).unwrap();
        assert_eq!(config.node.gear_base_dir, PathBuf::from("/tmp/gears"));
    }

    #[test]
    fn test_env_overrides_file() {
        let mut config = NodeConfig::parse("[node]\ngear_base_dir = \"/srv/gears\"\n").unwrap();
        let vars = env(&[
            (ENV_GEAR_BASE_DIR, "/env/gears"),
            (ENV_DEPLOYMENT_BRANCH, "release"),
            (ENV_LOG, "debug"),
        ]);
        config.apply_env_with(|k| vars.get(k).cloned());
        assert_eq!(config.node.gear_base_dir, PathBuf::from("/env/gears"));
        assert_eq!(config.node.deployment_branch, "release");
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_empty_env_values_are_ignored() {
        let mut config = NodeConfig::default();
        let vars = env(&[(ENV_DEPLOYMENT_BRANCH, "")]);
        config.apply_env_with(|k| vars.get(k).cloned());
        assert_eq!(config.node.deployment_branch, "master");
    }

    #[test]
    fn test_cli_overrides_env() {
        let mut config = NodeConfig::default();
        let vars = env(&[(ENV_GEAR_BASE_DIR, "/env/gears"), (ENV_LOG, "debug")]);
        config.apply_env_with(|k| vars.get(k).cloned());
        config.apply_cli(&CliOverrides {
            gear_base_dir: Some(PathBuf::from("/cli/gears")),
            log_level: None,
            log_format: Some(LogFormat::Json),
        });
        assert_eq!(config.node.gear_base_dir, PathBuf::from("/cli/gears"));
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_validate_default_is_clean() {
        assert!(NodeConfig::default().validate().is_empty());
    }

    #[test]
    fn test_validate_flags_bad_branch_and_relative_dir() {
        let mut config = NodeConfig::default();
        config.node.deployment_branch = "bad..branch".to_string();
        config.node.gear_base_dir = PathBuf::from("gears");
        let warnings = config.validate();
        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].contains("deployment_branch"));
    }
}
