//! Source repository materialization.
//!
//! Pushed code lands in the gear's bare repository. `deploy` writes the tree
//! of the deployment branch into a fresh directory under `app-root/runtime/`
//! and then atomically repoints the `app-root/repo` symlink at it, so a
//! concurrent reader sees either the old tree or the new one, never a mix.

use git2::{ObjectType, Repository, Tree};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::errors::{LifecycleError, Result};
use crate::gear::{Gear, GearPaths};

const MODE_EXECUTABLE: i32 = 0o100755;
const MODE_SYMLINK: i32 = 0o120000;

/// Materializes pushed source into the live code directory.
pub trait RepositoryGateway: Send + Sync {
    /// Replace the live tree with the latest pushed commit; returns its id.
    fn deploy(&self) -> Result<String>;
}

pub struct GitRepository {
    git_dir: PathBuf,
    paths: GearPaths,
    branch: String,
}

impl GitRepository {
    pub fn new(git_dir: PathBuf, paths: GearPaths, branch: impl Into<String>) -> Self {
        Self {
            git_dir,
            paths,
            branch: branch.into(),
        }
    }

    pub fn for_gear(gear: &Gear, branch: impl Into<String>) -> Self {
        Self::new(gear.git_dir(), gear.paths().clone(), branch)
    }

    /// Commit id at the tip of the deployment branch, if any.
    pub fn head_sha(&self) -> Option<String> {
        let repo = Repository::open(&self.git_dir).ok()?;
        let reference = repo.find_reference(&self.branch_ref()).ok()?;
        reference.peel_to_commit().ok().map(|c| c.id().to_string())
    }

    fn branch_ref(&self) -> String {
        format!("refs/heads/{}", self.branch)
    }

    /// Point `app-root/repo` at `target` and drop the previous materialization.
    fn swap_live(&self, target: &Path) -> Result<()> {
        let live = self.paths.repo_dir();
        let runtime = self.paths.runtime_dir();

        let next_link = self
            .paths
            .app_root()
            .join(format!(".repo.next-{}", Uuid::new_v4()));
        std::os::unix::fs::symlink(target, &next_link)
            .map_err(|e| LifecycleError::repository_io(&next_link, e))?;
        let install = || fs::rename(&next_link, &live);

        let mut previous = fs::read_link(&live).ok();
        let installed = if previous.is_none() && live.symlink_metadata().is_ok() {
            // A plain directory from an older layout; move it out of the way.
            let aside = runtime.join(format!("repo-legacy-{}", Uuid::new_v4()));
            let installed = move_aside_and_install(&live, &aside, install);
            previous = Some(aside);
            installed
        } else {
            install().map_err(|e| LifecycleError::repository_io(&live, e))
        };
        if let Err(e) = installed {
            let _ = fs::remove_file(&next_link);
            return Err(e);
        }

        if let Some(previous) = previous
            && previous.starts_with(&runtime)
            && previous != target
            && let Err(e) = fs::remove_dir_all(&previous)
        {
            tracing::warn!(path = %previous.display(), error = %e, "Failed to remove previous repository tree");
        }
        Ok(())
    }
}

/// Move the directory at `live` to `aside`, then run `install` to put the
/// replacement in place.
///
/// A directory cannot be replaced by a single rename, so `live` is absent
/// between the two steps. If `install` fails the directory is moved back.
fn move_aside_and_install(
    live: &Path,
    aside: &Path,
    install: impl FnOnce() -> std::io::Result<()>,
) -> Result<()> {
    fs::rename(live, aside).map_err(|e| LifecycleError::repository_io(live, e))?;
    if let Err(e) = install() {
        if let Err(restore) = fs::rename(aside, live) {
            tracing::error!(
                path = %aside.display(),
                error = %restore,
                "Failed to restore previous repository tree"
            );
        }
        return Err(LifecycleError::repository_io(live, e));
    }
    Ok(())
}

impl RepositoryGateway for GitRepository {
    fn deploy(&self) -> Result<String> {
        if !self.git_dir.exists() {
            return Err(LifecycleError::repository(format!(
                "no repository at {}",
                self.git_dir.display()
            )));
        }
        let repo = Repository::open(&self.git_dir)
            .map_err(|e| LifecycleError::git("failed to open repository", e))?;
        let commit = repo
            .find_reference(&self.branch_ref())
            .and_then(|r| r.peel_to_commit())
            .map_err(|e| LifecycleError::git(format!("branch '{}' not found", self.branch), e))?;
        let tree = commit
            .tree()
            .map_err(|e| LifecycleError::git("failed to read commit tree", e))?;

        let runtime = self.paths.runtime_dir();
        fs::create_dir_all(&runtime).map_err(|e| LifecycleError::repository_io(&runtime, e))?;
        let target = runtime.join(format!("repo-{}", Uuid::new_v4()));

        let materialized = write_tree(&repo, &tree, &target).and_then(|_| self.swap_live(&target));
        if let Err(e) = materialized {
            let _ = fs::remove_dir_all(&target);
            return Err(e);
        }

        let sha = commit.id().to_string();
        tracing::info!(branch = %self.branch, commit = %sha, "Repository deployed");
        Ok(sha)
    }
}

fn write_tree(repo: &Repository, tree: &Tree<'_>, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest).map_err(|e| LifecycleError::repository_io(dest, e))?;

    for entry in tree.iter() {
        let name = entry
            .name()
            .ok_or_else(|| LifecycleError::repository("tree entry name is not UTF-8"))?;
        if name.is_empty() || name == "." || name == ".." || name.contains('/') {
            return Err(LifecycleError::repository(format!(
                "refusing unsafe tree entry {:?}",
                name
            )));
        }
        let path = dest.join(name);

        match entry.kind() {
            Some(ObjectType::Tree) => {
                let subtree = repo
                    .find_tree(entry.id())
                    .map_err(|e| LifecycleError::git("failed to read subtree", e))?;
                write_tree(repo, &subtree, &path)?;
            }
            Some(ObjectType::Blob) => {
                let blob = repo
                    .find_blob(entry.id())
                    .map_err(|e| LifecycleError::git("failed to read blob", e))?;
                write_blob(&path, blob.content(), entry.filemode())?;
            }
            // Submodule
            Some(ObjectType::Commit) => {
                tracing::debug!(path = %path.display(), "Skipping submodule entry");
            }
            _ => {}
        }
    }
    Ok(())
}

fn write_blob(path: &Path, content: &[u8], mode: i32) -> Result<()> {
    use std::os::unix::ffi::OsStrExt;
    use std::os::unix::fs::PermissionsExt;

    if mode == MODE_SYMLINK {
        let link_target = std::ffi::OsStr::from_bytes(content);
        return std::os::unix::fs::symlink(link_target, path)
            .map_err(|e| LifecycleError::repository_io(path, e));
    }

    fs::write(path, content).map_err(|e| LifecycleError::repository_io(path, e))?;
    if mode == MODE_EXECUTABLE {
        fs::set_permissions(path, fs::Permissions::from_mode(0o755))
            .map_err(|e| LifecycleError::repository_io(path, e))?;
    }
    Ok(())
}
