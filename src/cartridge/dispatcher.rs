//! Cartridge control dispatch.
//!
//! `do_control` runs a named lifecycle action against one cartridge:
//! - optional user action hook before the action (`pre_<action>`)
//! - the cartridge's `bin/control <action>` script
//! - optional user action hook after the action (`post_<action>`)
//!
//! User action hooks live in the application repository under
//! `.gear/action_hooks/` and only run for the primary cartridge. Missing or
//! non-executable hooks are skipped. Stdout of every script is captured and
//! returned; stdout/stderr are also forwarded to the caller's sinks line by
//! line while the script runs.

use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};

use super::{Cartridge, CartridgeRole, CartridgeSet};
use crate::errors::{LifecycleError, Result};
use crate::gear::Gear;
use crate::marker::cartridge_state_dir_name;
use crate::output::OutputSinks;

/// Per-dispatch switches for user action hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ControlOptions {
    /// Run the user hook before the cartridge action
    pub pre_action_hooks_enabled: bool,
    /// Run the user hook after the cartridge action
    pub post_action_hooks_enabled: bool,
    /// Name hooks `pre_<action>`/`post_<action>`; when false both use the bare action name
    pub prefix_action_hooks: bool,
}

impl Default for ControlOptions {
    fn default() -> Self {
        Self {
            pre_action_hooks_enabled: true,
            post_action_hooks_enabled: true,
            prefix_action_hooks: true,
        }
    }
}

impl ControlOptions {
    /// Options for the build/deploy/post-deploy stages: no pre-hook chaining
    /// and no prefixing, so the user hook named after the stage runs once,
    /// after the cartridge action.
    pub fn stage() -> Self {
        Self {
            pre_action_hooks_enabled: false,
            post_action_hooks_enabled: true,
            prefix_action_hooks: false,
        }
    }

    pub fn pre_hook_name(&self, action: &str) -> String {
        hook_name(action, self.prefix_action_hooks.then_some("pre_"))
    }

    pub fn post_hook_name(&self, action: &str) -> String {
        hook_name(action, self.prefix_action_hooks.then_some("post_"))
    }
}

fn hook_name(action: &str, prefix: Option<&str>) -> String {
    let action = action.replace('-', "_");
    match prefix {
        Some(prefix) => format!("{}{}", prefix, action),
        None => action,
    }
}

/// Role resolution and hook dispatch for one gear's cartridges.
///
/// Real implementation: `CartridgeDispatcher`. Test double:
/// `testing::FakeCartridges`.
#[async_trait]
pub trait CartridgeControl: Send + Sync {
    /// All cartridges in discovery order.
    fn cartridges(&self) -> &[Cartridge];

    /// The primary cartridge; its absence is `MissingCartridge`.
    fn primary_cartridge(&self) -> Result<&Cartridge>;

    fn builder_cartridge(&self) -> Option<&Cartridge>;

    fn web_proxy(&self) -> Option<&Cartridge>;

    /// Run `action` against `cartridge` and return its captured stdout.
    async fn do_control(
        &self,
        action: &str,
        cartridge: &Cartridge,
        options: ControlOptions,
        sinks: &mut OutputSinks,
    ) -> Result<String>;
}

/// Dispatches hooks by spawning cartridge control scripts.
pub struct CartridgeDispatcher {
    gear: Gear,
    cartridges: CartridgeSet,
}

impl CartridgeDispatcher {
    pub fn new(gear: Gear, cartridges: CartridgeSet) -> Self {
        Self { gear, cartridges }
    }

    /// Discover the gear's cartridges and resolve their roles once.
    pub fn load(gear: &Gear) -> Result<Self> {
        let cartridges = CartridgeSet::discover(&gear.paths().home)?;
        Ok(Self::new(gear.clone(), cartridges))
    }

    fn is_primary(&self, cartridge: &Cartridge) -> bool {
        self.cartridges
            .role(CartridgeRole::Primary)
            .is_some_and(|p| p.name == cartridge.name)
    }

    async fn run_action_hook(
        &self,
        hook: &str,
        cartridge: &Cartridge,
        sinks: &mut OutputSinks,
    ) -> Result<String> {
        let path = self.gear.paths().action_hooks_dir().join(hook);
        if !is_executable(&path) {
            tracing::trace!(hook, "No action hook");
            return Ok(String::new());
        }
        tracing::debug!(hook, path = %path.display(), "Running action hook");
        self.run_script(&path, &[], hook, cartridge, sinks).await
    }

    async fn run_script(
        &self,
        path: &Path,
        args: &[&str],
        action: &str,
        cartridge: &Cartridge,
        sinks: &mut OutputSinks,
    ) -> Result<String> {
        let paths = self.gear.paths();
        let state_dir: PathBuf = paths.data_dir().join(cartridge_state_dir_name(&cartridge.name));

        let mut child = Command::new(path)
            .args(args)
            .current_dir(&paths.home)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("GEAR_UUID", &self.gear.uuid)
            .env("GEAR_APP_UUID", &self.gear.app_uuid)
            .env("GEAR_NAME", &self.gear.name)
            .env("GEAR_NAMESPACE", &self.gear.namespace)
            .env("GEAR_IP", &self.gear.ip)
            .env("GEAR_HOME", &paths.home)
            .env("GEAR_DATA_DIR", paths.data_dir())
            .env("GEAR_REPO_DIR", paths.repo_dir())
            .env("CARTRIDGE_NAME", &cartridge.name)
            .env("CARTRIDGE_DIR", &cartridge.directory)
            .env("CARTRIDGE_STATE_DIR", &state_dir)
            .spawn()
            .map_err(|source| LifecycleError::SpawnFailed {
                path: path.to_path_buf(),
                source,
            })?;

        let (stdout, stderr) = forward_output(&mut child, sinks)
            .await
            .map_err(|e| LifecycleError::io(path, e))?;
        let status = child.wait().await.map_err(|e| LifecycleError::io(path, e))?;

        if !status.success() {
            return Err(LifecycleError::HookExecution {
                action: action.to_string(),
                cartridge: cartridge.name.clone(),
                exit_code: status.code().unwrap_or(-1),
                stderr: stderr.trim().to_string(),
            });
        }
        Ok(stdout)
    }
}

/// Copy the child's stdout and stderr to the sinks as lines arrive, until
/// both pipes close. Returns everything read, as `(stdout, stderr)`.
async fn forward_output(
    child: &mut Child,
    sinks: &mut OutputSinks,
) -> std::io::Result<(String, String)> {
    let (Some(out), Some(err)) = (child.stdout.take(), child.stderr.take()) else {
        return Err(std::io::Error::other("hook output is not piped"));
    };
    let mut out = BufReader::new(out);
    let mut err = BufReader::new(err);
    let (mut out_line, mut err_line) = (Vec::new(), Vec::new());
    let (mut all_out, mut all_err) = (Vec::new(), Vec::new());
    let (mut out_open, mut err_open) = (true, true);

    while out_open || err_open {
        tokio::select! {
            read = out.read_until(b'\n', &mut out_line), if out_open => {
                if read? == 0 {
                    out_open = false;
                } else {
                    sinks.write_out(&String::from_utf8_lossy(&out_line));
                    all_out.append(&mut out_line);
                }
            }
            read = err.read_until(b'\n', &mut err_line), if err_open => {
                if read? == 0 {
                    err_open = false;
                } else {
                    sinks.write_err(&String::from_utf8_lossy(&err_line));
                    all_err.append(&mut err_line);
                }
            }
        }
    }

    Ok((
        String::from_utf8_lossy(&all_out).into_owned(),
        String::from_utf8_lossy(&all_err).into_owned(),
    ))
}

#[async_trait]
impl CartridgeControl for CartridgeDispatcher {
    fn cartridges(&self) -> &[Cartridge] {
        self.cartridges.all()
    }

    fn primary_cartridge(&self) -> Result<&Cartridge> {
        self.cartridges
            .role(CartridgeRole::Primary)
            .ok_or(LifecycleError::MissingCartridge {
                role: CartridgeRole::Primary,
            })
    }

    fn builder_cartridge(&self) -> Option<&Cartridge> {
        self.cartridges.role(CartridgeRole::Builder)
    }

    fn web_proxy(&self) -> Option<&Cartridge> {
        self.cartridges.role(CartridgeRole::WebProxy)
    }

    async fn do_control(
        &self,
        action: &str,
        cartridge: &Cartridge,
        options: ControlOptions,
        sinks: &mut OutputSinks,
    ) -> Result<String> {
        tracing::debug!(action, cartridge = %cartridge.name, ?options, "Dispatching control action");
        let user_hooks = self.is_primary(cartridge);
        let mut buffer = String::new();

        if user_hooks && options.pre_action_hooks_enabled {
            let hook = options.pre_hook_name(action);
            buffer.push_str(&self.run_action_hook(&hook, cartridge, sinks).await?);
        }

        let control = cartridge.control_script();
        buffer.push_str(
            &self
                .run_script(&control, &[action], action, cartridge, sinks)
                .await?,
        );

        if user_hooks && options.post_action_hooks_enabled {
            let hook = options.post_hook_name(action);
            buffer.push_str(&self.run_action_hook(&hook, cartridge, sinks).await?);
        }

        Ok(buffer)
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::{TempDir, tempdir};

    fn write_script(path: &Path, body: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
        }
    }

    fn setup_gear() -> (TempDir, Gear) {
        let dir = tempdir().unwrap();
        let gear = Gear::new(dir.path(), "501", "app-501", "myapp", "ns", "127.0.0.1");
        fs::create_dir_all(gear.paths().repo_dir()).unwrap();
        (dir, gear)
    }

    fn add_cartridge(gear: &Gear, name: &str, role: Option<CartridgeRole>, control: &str) -> Cartridge {
        let dir = gear.paths().home.join(name);
        write_script(&dir.join("bin/control"), control);
        let cart = Cartridge::new(name, &dir);
        match role {
            Some(role) => cart.with_role(role),
            None => cart,
        }
    }

    #[test]
    fn test_hook_names_follow_prefix_option() {
        let defaults = ControlOptions::default();
        assert_eq!(defaults.pre_hook_name("pre-build"), "pre_pre_build");
        assert_eq!(defaults.post_hook_name("start"), "post_start");

        let stage = ControlOptions::stage();
        assert!(!stage.pre_action_hooks_enabled);
        assert_eq!(stage.pre_hook_name("post-deploy"), "post_deploy");
        assert_eq!(stage.post_hook_name("build"), "build");
    }

    #[tokio::test]
    async fn test_do_control_captures_stdout_and_env() {
        let (_dir, gear) = setup_gear();
        let cart = add_cartridge(
            &gear,
            "mock",
            Some(CartridgeRole::Primary),
            "echo \"$1|$CARTRIDGE_NAME|$GEAR_UUID\"\necho warned >&2",
        );
        let dispatcher = CartridgeDispatcher::new(gear, CartridgeSet::new(vec![cart.clone()]).unwrap());

        let (mut sinks, captured) = OutputSinks::capture();
        let out = dispatcher
            .do_control("build", &cart, ControlOptions::stage(), &mut sinks)
            .await
            .unwrap();
        assert_eq!(out, "build|mock|501\n");
        assert_eq!(captured.out(), "build|mock|501\n");
        assert_eq!(captured.err(), "warned\n");
    }

    #[tokio::test]
    async fn test_do_control_forwards_output_while_script_runs() {
        let (_dir, gear) = setup_gear();
        let go = gear.paths().home.join("go");
        let cart = add_cartridge(
            &gear,
            "mock",
            Some(CartridgeRole::Primary),
            "echo first\nwhile [ ! -f \"$GEAR_HOME/go\" ]; do sleep 0.05; done\necho second",
        );
        let dispatcher = CartridgeDispatcher::new(gear, CartridgeSet::new(vec![cart.clone()]).unwrap());

        let (mut sinks, captured) = OutputSinks::capture();
        let run = dispatcher.do_control("start", &cart, ControlOptions::stage(), &mut sinks);
        // The script blocks until `go` exists, so "first" can only be seen
        // here if it was forwarded before the script exited.
        let watch = async {
            for _ in 0..200 {
                if captured.out() == "first\n" {
                    fs::write(&go, "").unwrap();
                    return true;
                }
                tokio::time::sleep(std::time::Duration::from_millis(25)).await;
            }
            fs::write(&go, "").unwrap();
            false
        };

        let (out, forwarded_early) = tokio::join!(run, watch);
        assert!(forwarded_early, "output was held back until the script exited");
        assert_eq!(out.unwrap(), "first\nsecond\n");
        assert_eq!(captured.out(), "first\nsecond\n");
    }

    #[tokio::test]
    async fn test_do_control_non_zero_exit_is_hook_execution_error() {
        let (_dir, gear) = setup_gear();
        let cart = add_cartridge(&gear, "mock", Some(CartridgeRole::Primary), "echo boom >&2\nexit 7");
        let dispatcher = CartridgeDispatcher::new(gear, CartridgeSet::new(vec![cart.clone()]).unwrap());

        let err = dispatcher
            .do_control("deploy", &cart, ControlOptions::stage(), &mut OutputSinks::null())
            .await
            .unwrap_err();
        match err {
            LifecycleError::HookExecution {
                action,
                cartridge,
                exit_code,
                stderr,
            } => {
                assert_eq!(action, "deploy");
                assert_eq!(cartridge, "mock");
                assert_eq!(exit_code, 7);
                assert_eq!(stderr, "boom");
            }
            other => panic!("Expected HookExecution, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_do_control_missing_script_is_spawn_failure() {
        let (_dir, gear) = setup_gear();
        let cart = Cartridge::new("ghost", gear.paths().home.join("ghost"));
        let dispatcher = CartridgeDispatcher::new(gear, CartridgeSet::new(vec![cart.clone()]).unwrap());

        let err = dispatcher
            .do_control("start", &cart, ControlOptions::default(), &mut OutputSinks::null())
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::SpawnFailed { .. }));
    }

    #[tokio::test]
    async fn test_action_hooks_wrap_primary_control() {
        let (_dir, gear) = setup_gear();
        let hooks = gear.paths().action_hooks_dir();
        write_script(&hooks.join("pre_start"), "echo pre");
        write_script(&hooks.join("post_start"), "echo post");
        write_script(&hooks.join("build"), "echo user-build");
        let cart = add_cartridge(&gear, "mock", Some(CartridgeRole::Primary), "echo \"$1\"");
        let dispatcher = CartridgeDispatcher::new(gear, CartridgeSet::new(vec![cart.clone()]).unwrap());

        let out = dispatcher
            .do_control("start", &cart, ControlOptions::default(), &mut OutputSinks::null())
            .await
            .unwrap();
        assert_eq!(out, "pre\nstart\npost\n");

        let out = dispatcher
            .do_control("build", &cart, ControlOptions::stage(), &mut OutputSinks::null())
            .await
            .unwrap();
        assert_eq!(out, "build\nuser-build\n");
    }

    #[tokio::test]
    async fn test_action_hooks_skipped_for_secondary_cartridges() {
        let (_dir, gear) = setup_gear();
        write_script(&gear.paths().action_hooks_dir().join("deploy"), "echo user-deploy");
        let primary = add_cartridge(&gear, "mock", Some(CartridgeRole::Primary), "echo \"$1\"");
        let proxy = add_cartridge(&gear, "haproxy", Some(CartridgeRole::WebProxy), "echo proxy-$1");
        let dispatcher = CartridgeDispatcher::new(
            gear,
            CartridgeSet::new(vec![proxy.clone(), primary]).unwrap(),
        );

        let out = dispatcher
            .do_control("deploy", &proxy, ControlOptions::stage(), &mut OutputSinks::null())
            .await
            .unwrap();
        assert_eq!(out, "proxy-deploy\n");
    }

    #[test]
    fn test_missing_primary_is_error() {
        let (_dir, gear) = setup_gear();
        let dispatcher = CartridgeDispatcher::new(gear, CartridgeSet::default());
        assert!(matches!(
            dispatcher.primary_cartridge(),
            Err(LifecycleError::MissingCartridge {
                role: CartridgeRole::Primary
            })
        ));
        assert!(dispatcher.builder_cartridge().is_none());
        assert!(dispatcher.web_proxy().is_none());
    }
}
