//! Gear identity and on-disk layout.
//!
//! A gear lives at `<gear_base_dir>/<uuid>/`. Everything the lifecycle core
//! touches is derived from that home directory through [`GearPaths`], so the
//! base directory is the only value that has to come from configuration.

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::errors::{LifecycleError, Result};

/// Identity of a single gear.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Gear {
    pub uuid: String,
    pub app_uuid: String,
    pub name: String,
    pub namespace: String,
    pub ip: String,
    #[serde(skip)]
    paths: GearPaths,
}

/// Optional identity overrides read from `<gear home>/gear.toml`.
#[derive(Debug, Default, Deserialize)]
struct GearFile {
    app_uuid: Option<String>,
    name: Option<String>,
    namespace: Option<String>,
    ip: Option<String>,
}

impl Gear {
    pub fn new(
        base_dir: impl AsRef<Path>,
        uuid: impl Into<String>,
        app_uuid: impl Into<String>,
        name: impl Into<String>,
        namespace: impl Into<String>,
        ip: impl Into<String>,
    ) -> Self {
        let uuid = uuid.into();
        let paths = GearPaths::new(base_dir.as_ref().join(&uuid));
        Self {
            uuid,
            app_uuid: app_uuid.into(),
            name: name.into(),
            namespace: namespace.into(),
            ip: ip.into(),
            paths,
        }
    }

    /// Load a gear from its home directory.
    ///
    /// The home directory must exist. `gear.toml` is optional; absent keys
    /// fall back to the gear uuid (for `app_uuid` and `name`), an empty
    /// namespace and the loopback address.
    pub fn load(base_dir: &Path, uuid: &str) -> Result<Self> {
        let home = base_dir.join(uuid);
        if !home.is_dir() {
            return Err(LifecycleError::GearNotFound {
                uuid: uuid.to_string(),
                base_dir: base_dir.to_path_buf(),
            });
        }

        let gear_file = home.join("gear.toml");
        let file: GearFile = if gear_file.exists() {
            let content =
                fs::read_to_string(&gear_file).map_err(|e| LifecycleError::io(&gear_file, e))?;
            toml::from_str(&content).map_err(|e| LifecycleError::ManifestInvalid {
                path: gear_file.clone(),
                message: e.to_string(),
            })?
        } else {
            GearFile::default()
        };

        Ok(Gear::new(
            base_dir,
            uuid,
            file.app_uuid.unwrap_or_else(|| uuid.to_string()),
            file.name.unwrap_or_else(|| uuid.to_string()),
            file.namespace.unwrap_or_default(),
            file.ip.unwrap_or_else(|| "127.0.0.1".to_string()),
        ))
    }

    pub fn paths(&self) -> &GearPaths {
        &self.paths
    }

    /// Bare repository receiving pushes for this gear's application.
    pub fn git_dir(&self) -> PathBuf {
        self.paths.home.join("git").join(format!("{}.git", self.name))
    }
}

/// Filesystem layout under a gear's home directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GearPaths {
    pub home: PathBuf,
}

impl GearPaths {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into() }
    }

    pub fn app_root(&self) -> PathBuf {
        self.home.join("app-root")
    }

    /// Data area; cartridge markers live under here.
    pub fn data_dir(&self) -> PathBuf {
        self.app_root().join("data")
    }

    /// Live code tree.
    pub fn repo_dir(&self) -> PathBuf {
        self.app_root().join("repo")
    }

    pub fn runtime_dir(&self) -> PathBuf {
        self.app_root().join("runtime")
    }

    pub fn state_file(&self) -> PathBuf {
        self.runtime_dir().join(".state")
    }

    pub fn state_history_file(&self) -> PathBuf {
        self.runtime_dir().join(".state_history")
    }

    pub fn stop_lock(&self) -> PathBuf {
        self.runtime_dir().join(".stop_lock")
    }

    pub fn pipeline_lock(&self) -> PathBuf {
        self.runtime_dir().join(".pipeline.lock")
    }

    /// User-supplied action hooks shipped inside the application repository.
    pub fn action_hooks_dir(&self) -> PathBuf {
        self.repo_dir().join(".gear").join("action_hooks")
    }

    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [self.data_dir(), self.runtime_dir()] {
            fs::create_dir_all(&dir).map_err(|e| LifecycleError::io(&dir, e))?;
        }
        Ok(())
    }
}

/// Exclusive lock serializing pipeline invocations on one gear.
///
/// Released when dropped.
pub struct PipelineLock {
    file: File,
    path: PathBuf,
}

impl PipelineLock {
    /// Try to take the lock without waiting.
    pub fn acquire(paths: &GearPaths) -> Result<Self> {
        paths.ensure_directories()?;
        let path = paths.pipeline_lock();
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| LifecycleError::io(&path, e))?;
        file.try_lock_exclusive()
            .map_err(|_| LifecycleError::PipelineLocked { path: path.clone() })?;
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PipelineLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to release pipeline lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_load_missing_gear_errors() {
        let dir = tempdir().unwrap();
        let err = Gear::load(dir.path(), "nope").unwrap_err();
        assert!(matches!(err, LifecycleError::GearNotFound { .. }));
    }

    #[test]
    fn test_load_defaults_without_gear_file() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("501")).unwrap();
        let gear = Gear::load(dir.path(), "501").unwrap();
        assert_eq!(gear.uuid, "501");
        assert_eq!(gear.app_uuid, "501");
        assert_eq!(gear.name, "501");
        assert_eq!(gear.namespace, "");
        assert_eq!(gear.ip, "127.0.0.1");
        assert_eq!(gear.paths().home, dir.path().join("501"));
    }

    #[test]
    fn test_load_reads_gear_file() {
        let dir = tempdir().unwrap();
        let home = dir.path().join("501");
        fs::create_dir_all(&home).unwrap();
        fs::write(
            home.join("gear.toml"),
            "app_uuid = \"app-1\"\nname = \"myapp\"\nnamespace = \"jwh201204301647\"\nip = \"10.0.0.5\"\n",
        )
        .unwrap();
        let gear = Gear::load(dir.path(), "501").unwrap();
        assert_eq!(gear.app_uuid, "app-1");
        assert_eq!(gear.name, "myapp");
        assert_eq!(gear.namespace, "jwh201204301647");
        assert_eq!(gear.ip, "10.0.0.5");
        assert_eq!(gear.git_dir(), home.join("git/myapp.git"));
    }

    #[test]
    fn test_load_rejects_malformed_gear_file() {
        let dir = tempdir().unwrap();
        let home = dir.path().join("501");
        fs::create_dir_all(&home).unwrap();
        fs::write(home.join("gear.toml"), "name = [").unwrap();
        let err = Gear::load(dir.path(), "501").unwrap_err();
        assert!(matches!(err, LifecycleError::ManifestInvalid { .. }));
    }

    #[test]
    fn test_paths_layout() {
        let paths = GearPaths::new("/gears/501");
        assert_eq!(paths.repo_dir(), PathBuf::from("/gears/501/app-root/repo"));
        assert_eq!(paths.data_dir(), PathBuf::from("/gears/501/app-root/data"));
        assert_eq!(
            paths.state_file(),
            PathBuf::from("/gears/501/app-root/runtime/.state")
        );
        assert_eq!(
            paths.action_hooks_dir(),
            PathBuf::from("/gears/501/app-root/repo/.gear/action_hooks")
        );
    }

    #[test]
    fn test_pipeline_lock_is_exclusive() {
        let dir = tempdir().unwrap();
        let paths = GearPaths::new(dir.path().join("501"));
        let first = PipelineLock::acquire(&paths).unwrap();
        let second = PipelineLock::acquire(&paths);
        assert!(matches!(second, Err(LifecycleError::PipelineLocked { .. })));
        drop(first);
        assert!(PipelineLock::acquire(&paths).is_ok());
    }
}
