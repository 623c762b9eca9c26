//! In-memory collaborators for exercising the orchestrator without real
//! cartridges, plus a tiny git "remote" for pushing fixture trees.
//!
//! All doubles share a [`Journal`] so a test can assert on the exact
//! interleaving of state writes, materializations, dispatches and
//! start/stop calls across collaborators.

use async_trait::async_trait;
use git2::{Oid, Repository, Signature};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::cartridge::{Cartridge, CartridgeControl, CartridgeRole, CartridgeSet, ControlOptions};
use crate::errors::{LifecycleError, Result};
use crate::lifecycle::{GearControlOptions, GearSupervisor};
use crate::output::OutputSinks;
use crate::repository::RepositoryGateway;
use crate::state::{LifecycleState, StateStore};

/// One observable side effect of a pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Control {
        action: String,
        cartridge: String,
        options: ControlOptions,
    },
    Start(GearControlOptions),
    Stop(GearControlOptions),
    SetState(LifecycleState),
    Materialize,
}

impl Event {
    pub fn control(action: &str, cartridge: &str, options: ControlOptions) -> Self {
        Event::Control {
            action: action.to_string(),
            cartridge: cartridge.to_string(),
            options,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Shared, ordered record of events.
#[derive(Debug, Clone, Default)]
pub struct Journal {
    events: Arc<Mutex<Vec<Event>>>,
}

impl Journal {
    pub fn record(&self, event: Event) {
        lock(&self.events).push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        lock(&self.events).clone()
    }

    /// Dispatches only, formatted `action:cartridge`.
    pub fn controls(&self) -> Vec<String> {
        lock(&self.events)
            .iter()
            .filter_map(|e| match e {
                Event::Control {
                    action, cartridge, ..
                } => Some(format!("{}:{}", action, cartridge)),
                _ => None,
            })
            .collect()
    }
}

/// Scripted cartridge dispatcher.
///
/// Unless told otherwise, `do_control` returns the action name as output.
pub struct FakeCartridges {
    set: CartridgeSet,
    journal: Journal,
    responses: Mutex<HashMap<(String, Option<String>), String>>,
    failures: Mutex<HashSet<(String, String)>>,
}

impl FakeCartridges {
    /// # Panics
    ///
    /// Panics if two cartridges claim the same role.
    pub fn new(cartridges: Vec<Cartridge>, journal: Journal) -> Self {
        let set = match CartridgeSet::new(cartridges) {
            Ok(set) => set,
            Err(e) => panic!("invalid fake cartridge set: {e}"),
        };
        Self {
            set,
            journal,
            responses: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashSet::new()),
        }
    }

    /// Output for `action` on any cartridge.
    pub fn respond(&self, action: &str, output: &str) {
        lock(&self.responses).insert((action.to_string(), None), output.to_string());
    }

    /// Output for `action` on one cartridge; wins over [`Self::respond`].
    pub fn respond_for(&self, action: &str, cartridge: &str, output: &str) {
        lock(&self.responses).insert(
            (action.to_string(), Some(cartridge.to_string())),
            output.to_string(),
        );
    }

    /// Make `action` on `cartridge` exit non-zero.
    pub fn fail(&self, action: &str, cartridge: &str) {
        lock(&self.failures).insert((action.to_string(), cartridge.to_string()));
    }

    pub fn failing(self, action: &str, cartridge: &str) -> Self {
        self.fail(action, cartridge);
        self
    }
}

#[async_trait]
impl CartridgeControl for FakeCartridges {
    fn cartridges(&self) -> &[Cartridge] {
        self.set.all()
    }

    fn primary_cartridge(&self) -> Result<&Cartridge> {
        self.set
            .role(CartridgeRole::Primary)
            .ok_or(LifecycleError::MissingCartridge {
                role: CartridgeRole::Primary,
            })
    }

    fn builder_cartridge(&self) -> Option<&Cartridge> {
        self.set.role(CartridgeRole::Builder)
    }

    fn web_proxy(&self) -> Option<&Cartridge> {
        self.set.role(CartridgeRole::WebProxy)
    }

    async fn do_control(
        &self,
        action: &str,
        cartridge: &Cartridge,
        options: ControlOptions,
        sinks: &mut OutputSinks,
    ) -> Result<String> {
        self.journal
            .record(Event::control(action, &cartridge.name, options));

        if lock(&self.failures).contains(&(action.to_string(), cartridge.name.clone())) {
            sinks.write_err(&format!("{} failed\n", action));
            return Err(LifecycleError::HookExecution {
                action: action.to_string(),
                cartridge: cartridge.name.clone(),
                exit_code: 1,
                stderr: format!("{} failed", action),
            });
        }

        let responses = lock(&self.responses);
        let output = responses
            .get(&(action.to_string(), Some(cartridge.name.clone())))
            .or_else(|| responses.get(&(action.to_string(), None)))
            .cloned()
            .unwrap_or_else(|| action.to_string());
        drop(responses);

        sinks.write_out(&output);
        Ok(output)
    }
}

/// Lifecycle state held in memory.
pub struct MemoryStateStore {
    state: Mutex<LifecycleState>,
    journal: Journal,
    fail_writes: AtomicBool,
}

impl MemoryStateStore {
    pub fn new(journal: Journal) -> Self {
        Self {
            state: Mutex::new(LifecycleState::New),
            journal,
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Make every subsequent `set` fail with `StatePersistence`.
    pub fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }
}

impl StateStore for MemoryStateStore {
    fn get(&self) -> Result<LifecycleState> {
        Ok(*lock(&self.state))
    }

    fn set(&self, state: LifecycleState) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(LifecycleError::StatePersistence {
                path: PathBuf::from("<memory>"),
                source: std::io::Error::other("simulated write failure"),
            });
        }
        *lock(&self.state) = state;
        self.journal.record(Event::SetState(state));
        Ok(())
    }
}

/// Repository gateway that only records materializations.
pub struct FakeRepository {
    journal: Journal,
    failure: Mutex<Option<String>>,
}

impl FakeRepository {
    pub const COMMIT: &'static str = "0123456789abcdef0123456789abcdef01234567";

    pub fn new(journal: Journal) -> Self {
        Self {
            journal,
            failure: Mutex::new(None),
        }
    }

    pub fn fail_with(&self, message: &str) {
        *lock(&self.failure) = Some(message.to_string());
    }
}

impl RepositoryGateway for FakeRepository {
    fn deploy(&self) -> Result<String> {
        self.journal.record(Event::Materialize);
        match lock(&self.failure).clone() {
            Some(message) => Err(LifecycleError::repository(message)),
            None => Ok(Self::COMMIT.to_string()),
        }
    }
}

/// Supervisor that records start/stop requests without dispatching.
pub struct RecordingSupervisor {
    journal: Journal,
    failures: Mutex<Vec<GearControlOptions>>,
}

impl RecordingSupervisor {
    pub fn new(journal: Journal) -> Self {
        Self {
            journal,
            failures: Mutex::new(Vec::new()),
        }
    }

    /// Fail start/stop requests made with exactly these options.
    pub fn fail_on(&self, options: GearControlOptions) {
        lock(&self.failures).push(options);
    }

    fn check(&self, action: &str, options: GearControlOptions) -> Result<String> {
        if lock(&self.failures).contains(&options) {
            return Err(LifecycleError::HookExecution {
                action: action.to_string(),
                cartridge: "<gear>".to_string(),
                exit_code: 1,
                stderr: format!("{} failed", action),
            });
        }
        Ok(String::new())
    }
}

#[async_trait]
impl GearSupervisor for RecordingSupervisor {
    async fn start_gear(
        &self,
        options: GearControlOptions,
        _sinks: &mut OutputSinks,
    ) -> Result<String> {
        self.journal.record(Event::Start(options));
        self.check("start", options)
    }

    async fn stop_gear(
        &self,
        options: GearControlOptions,
        _sinks: &mut OutputSinks,
    ) -> Result<String> {
        self.journal.record(Event::Stop(options));
        self.check("stop", options)
    }
}

const MODE_FILE: i32 = 0o100644;
const MODE_TREE: i32 = 0o040000;

/// Bare repository standing in for the gear's push target.
///
/// Each push commits a snapshot containing exactly the given files on top of
/// the branch tip.
pub struct GitRemote {
    repo: Repository,
    branch: String,
}

impl GitRemote {
    pub fn init(git_dir: &Path, branch: &str) -> std::result::Result<Self, git2::Error> {
        let repo = Repository::init_bare(git_dir)?;
        Ok(Self {
            repo,
            branch: branch.to_string(),
        })
    }

    pub fn push(&self, files: &[(&str, &str)]) -> std::result::Result<String, git2::Error> {
        let files: Vec<(&str, &str, i32)> = files.iter().map(|(p, c)| (*p, *c, MODE_FILE)).collect();
        self.push_with_modes(&files)
    }

    pub fn push_with_modes(
        &self,
        files: &[(&str, &str, i32)],
    ) -> std::result::Result<String, git2::Error> {
        let entries: Vec<(String, Vec<u8>, i32)> = files
            .iter()
            .map(|(path, content, mode)| (path.to_string(), content.as_bytes().to_vec(), *mode))
            .collect();
        let tree_id = self.write_tree(&entries)?;
        let tree = self.repo.find_tree(tree_id)?;
        let sig = Signature::now("gearctl", "gearctl@localhost")?;

        let reference = format!("refs/heads/{}", self.branch);
        let parent = self
            .repo
            .find_reference(&reference)
            .ok()
            .and_then(|r| r.peel_to_commit().ok());
        let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();
        let oid = self
            .repo
            .commit(Some(&reference), &sig, &sig, "Test Change", &tree, &parents)?;
        Ok(oid.to_string())
    }

    fn write_tree(&self, entries: &[(String, Vec<u8>, i32)]) -> std::result::Result<Oid, git2::Error> {
        let mut builder = self.repo.treebuilder(None)?;
        let mut subdirs: BTreeMap<String, Vec<(String, Vec<u8>, i32)>> = BTreeMap::new();
        for (path, content, mode) in entries {
            match path.split_once('/') {
                Some((dir, rest)) => subdirs
                    .entry(dir.to_string())
                    .or_default()
                    .push((rest.to_string(), content.clone(), *mode)),
                None => {
                    let blob = self.repo.blob(content)?;
                    builder.insert(path, blob, *mode)?;
                }
            }
        }
        for (dir, children) in subdirs {
            let subtree = self.write_tree(&children)?;
            builder.insert(&dir, subtree, MODE_TREE)?;
        }
        builder.write()
    }
}
