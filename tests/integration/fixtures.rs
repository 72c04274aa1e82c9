//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Temporary git repositories
//! - Scripted workers, validation gates, and council members
//! - Predefined plans

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use git2::{Repository, Signature};
use tempfile::TempDir;

use cadence::config::Config;
use cadence::core::{Gap, Plan, TaskKind, Tier};
use cadence::orchestration::council::{ConsensusCouncil, Councillor, DiagnosisBrief, Draft, Proposal, Ranking};
use cadence::orchestration::registry::{
    CapabilityRegistry, CapabilityWorker, WorkOutput, WorkRequest, WorkerFailure,
};
use cadence::orchestration::validation::{ValidationGate, ValidationRequest, Verdict};
use cadence::workspace::{Artifact, MemoryWorkspace, WorkspaceBackend};
use cadence::{Collaborators, Result, Session, SessionId, StateStore};

pub const ALL_KINDS: [TaskKind; 6] = [
    TaskKind::Design,
    TaskKind::Implementation,
    TaskKind::Testing,
    TaskKind::Documentation,
    TaskKind::Review,
    TaskKind::Diagnosis,
];

pub const ALL_TIERS: [Tier; 3] = [Tier::Fast, Tier::Standard, Tier::Advanced];

/// A test repository with a temporary directory and an initial commit.
pub struct TestRepo {
    /// Holds the repo and the worktrees directory.
    pub temp_dir: TempDir,
    pub path: PathBuf,
}

impl TestRepo {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().join("repo");
        fs::create_dir_all(&path).expect("Failed to create repo dir");

        let repo = Repository::init(&path).expect("Failed to init git");
        fs::write(path.join("README.md"), "# Test Repository\n").expect("Failed to write README");
        let mut index = repo.index().expect("Failed to open index");
        index
            .add_path(Path::new("README.md"))
            .expect("Failed to stage README");
        index.write().expect("Failed to write index");
        let tree_id = index.write_tree().expect("Failed to write tree");
        let tree = repo.find_tree(tree_id).expect("Failed to find tree");
        let sig = Signature::now("Test User", "test@test.com").expect("Failed to build signature");
        repo.commit(Some("HEAD"), &sig, &sig, "Initial commit", &tree, &[])
            .expect("Failed to commit");

        Self { temp_dir, path }
    }

    pub fn worktrees_dir(&self) -> PathBuf {
        self.temp_dir.path().join("worktrees")
    }

    /// Content of a file at the tip of `branch`.
    pub fn read_on_branch(&self, branch: &str, file: &str) -> Option<String> {
        let repo = Repository::open(&self.path).ok()?;
        let tree = repo
            .find_branch(branch, git2::BranchType::Local)
            .ok()?
            .get()
            .peel_to_tree()
            .ok()?;
        let entry = tree.get_path(Path::new(file)).ok()?;
        let blob = repo.find_blob(entry.id()).ok()?;
        Some(String::from_utf8_lossy(blob.content()).into_owned())
    }
}

impl Default for TestRepo {
    fn default() -> Self {
        Self::new()
    }
}

// ========== Workers ==========

/// A request as a worker saw it.
#[derive(Debug, Clone, PartialEq)]
pub struct SeenRequest {
    pub task: String,
    pub output: String,
    pub iteration: u32,
    pub tier: Tier,
    pub guidance: Option<String>,
}

/// Writes `<task>/<output>.txt` unless a path is overridden for the task.
pub struct ScriptedWorker {
    seen: Mutex<Vec<SeenRequest>>,
    paths: HashMap<String, String>,
    delay: Option<Duration>,
    confidence: f64,
    in_flight: Mutex<(usize, usize)>,
}

impl ScriptedWorker {
    pub fn new() -> Arc<Self> {
        Self::build(HashMap::new(), None)
    }

    /// Every output of `task` goes to `path`.
    pub fn with_paths(paths: &[(&str, &str)]) -> Arc<Self> {
        Self::build(
            paths
                .iter()
                .map(|(t, p)| (t.to_string(), p.to_string()))
                .collect(),
            None,
        )
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Self::build(HashMap::new(), Some(delay))
    }

    /// Reports `confidence` for every artifact instead of 0.8.
    pub fn unsure(confidence: f64) -> Arc<Self> {
        let mut worker = Self::unwrapped(HashMap::new(), None);
        worker.confidence = confidence;
        Arc::new(worker)
    }

    fn build(paths: HashMap<String, String>, delay: Option<Duration>) -> Arc<Self> {
        Arc::new(Self::unwrapped(paths, delay))
    }

    fn unwrapped(paths: HashMap<String, String>, delay: Option<Duration>) -> Self {
        Self {
            seen: Mutex::new(Vec::new()),
            paths,
            delay,
            confidence: 0.8,
            in_flight: Mutex::new((0, 0)),
        }
    }

    pub fn seen(&self) -> Vec<SeenRequest> {
        self.seen.lock().unwrap().clone()
    }

    pub fn seen_for(&self, task: &str) -> Vec<SeenRequest> {
        self.seen().into_iter().filter(|r| r.task == task).collect()
    }

    /// Highest number of requests executing at once.
    pub fn max_in_flight(&self) -> usize {
        self.in_flight.lock().unwrap().1
    }
}

#[async_trait]
impl CapabilityWorker for ScriptedWorker {
    async fn execute(&self, request: &WorkRequest) -> std::result::Result<WorkOutput, WorkerFailure> {
        self.seen.lock().unwrap().push(SeenRequest {
            task: request.task_name.clone(),
            output: request.output.clone(),
            iteration: request.iteration,
            tier: request.tier,
            guidance: request.guidance.clone(),
        });
        {
            let mut flight = self.in_flight.lock().unwrap();
            flight.0 += 1;
            flight.1 = flight.1.max(flight.0);
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.lock().unwrap().0 -= 1;

        let path = self
            .paths
            .get(&request.task_name)
            .cloned()
            .unwrap_or_else(|| format!("{}/{}.txt", request.task_name, request.output));
        let mut content = format!(
            "{} {} v{} at {}\n",
            request.task_name, request.output, request.iteration, request.tier
        );
        if let Some(guidance) = &request.guidance {
            content.push_str(&format!("guided by: {}\n", guidance));
        }
        Ok(WorkOutput {
            artifact: Artifact::new(&path, &content),
            confidence: self.confidence,
        })
    }
}

pub fn registry_for(worker: Arc<dyn CapabilityWorker>) -> CapabilityRegistry {
    let mut registry = CapabilityRegistry::new();
    for kind in ALL_KINDS {
        for tier in ALL_TIERS {
            registry.register(kind, tier, Arc::clone(&worker));
        }
    }
    registry
}

// ========== Validation ==========

#[derive(Debug, Clone, PartialEq)]
pub struct SeenValidation {
    pub task: String,
    pub iteration: u32,
    pub artifacts: Vec<String>,
}

/// Fails a task's first N validations with fixed gaps, then passes.
pub struct ScriptedGate {
    failures: Mutex<HashMap<String, (u32, Vec<Gap>)>>,
    seen: Mutex<Vec<SeenValidation>>,
}

impl ScriptedGate {
    pub fn passing() -> Arc<Self> {
        Arc::new(Self {
            failures: Mutex::new(HashMap::new()),
            seen: Mutex::new(Vec::new()),
        })
    }

    /// `u32::MAX` times means the task never passes.
    pub fn failing(script: &[(&str, u32, Vec<Gap>)]) -> Arc<Self> {
        let gate = Self::passing();
        {
            let mut failures = gate.failures.lock().unwrap();
            for (task, times, gaps) in script {
                failures.insert(task.to_string(), (*times, gaps.clone()));
            }
        }
        gate
    }

    pub fn seen(&self) -> Vec<SeenValidation> {
        self.seen.lock().unwrap().clone()
    }

    pub fn validated_tasks(&self) -> Vec<String> {
        self.seen().into_iter().map(|v| v.task).collect()
    }
}

#[async_trait]
impl ValidationGate for ScriptedGate {
    async fn validate(&self, request: &ValidationRequest) -> Result<Verdict> {
        self.seen.lock().unwrap().push(SeenValidation {
            task: request.task_name.clone(),
            iteration: request.iteration,
            artifacts: request.artifacts.iter().map(|a| a.path.clone()).collect(),
        });
        let mut failures = self.failures.lock().unwrap();
        match failures.get_mut(&request.task_name) {
            Some((remaining, gaps)) if *remaining > 0 => {
                if *remaining != u32::MAX {
                    *remaining -= 1;
                }
                Ok(Verdict::Fail { gaps: gaps.clone() })
            }
            _ => Ok(Verdict::Pass),
        }
    }
}

pub fn gap(criterion: &str) -> Gap {
    Gap::new(criterion, &format!("{} not met", criterion))
}

// ========== Council ==========

/// Proposes `<id> diagnosis` at a fixed confidence and ranks from a script.
pub struct ScriptedCouncillor {
    id: String,
    confidence: f64,
    ranking: Vec<String>,
    briefs: Mutex<Vec<DiagnosisBrief>>,
}

impl ScriptedCouncillor {
    pub fn new(id: &str, confidence: f64, ranking: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            confidence,
            ranking: ranking.iter().map(|s| s.to_string()).collect(),
            briefs: Mutex::new(Vec::new()),
        })
    }

    pub fn briefs(&self) -> Vec<DiagnosisBrief> {
        self.briefs.lock().unwrap().clone()
    }
}

#[async_trait]
impl Councillor for ScriptedCouncillor {
    fn id(&self) -> &str {
        &self.id
    }

    async fn propose(&self, brief: &DiagnosisBrief) -> Result<Draft> {
        self.briefs.lock().unwrap().push(brief.clone());
        Ok(Draft {
            diagnosis: format!("{} diagnosis", self.id),
            confidence: self.confidence,
        })
    }

    async fn rank(&self, _brief: &DiagnosisBrief, _proposals: &[Proposal]) -> Result<Ranking> {
        Ok(self.ranking.clone().into())
    }
}

pub fn council_of(members: &[Arc<ScriptedCouncillor>]) -> Arc<ConsensusCouncil> {
    let members: Vec<Arc<dyn Councillor>> = members
        .iter()
        .map(|m| Arc::clone(m) as Arc<dyn Councillor>)
        .collect();
    Arc::new(ConsensusCouncil::new(members, Duration::from_secs(5)).unwrap())
}

/// Five members with no first-round majority; `b` wins after three runoffs.
pub fn runoff_council() -> Vec<Arc<ScriptedCouncillor>> {
    vec![
        ScriptedCouncillor::new("a", 0.8, &["a", "c", "b", "d", "e"]),
        ScriptedCouncillor::new("b", 0.7, &["b", "c", "a", "d", "e"]),
        ScriptedCouncillor::new("c", 0.9, &["c", "b", "a", "d", "e"]),
        ScriptedCouncillor::new("d", 0.6, &["d", "a", "b", "c", "e"]),
        ScriptedCouncillor::new("e", 0.5, &["e", "b", "c", "a", "d"]),
    ]
}

/// Seven members whose runoff ends with `w` on 2 of 7 first places.
pub fn split_council() -> Vec<Arc<ScriptedCouncillor>> {
    vec![
        ScriptedCouncillor::new("w", 0.9, &["w", "a", "b", "c", "d", "e", "f"]),
        ScriptedCouncillor::new("f", 0.05, &["w", "f", "a", "b", "c", "d", "e"]),
        ScriptedCouncillor::new("a", 0.1, &["a", "b", "w", "c", "d", "e", "f"]),
        ScriptedCouncillor::new("b", 0.2, &["b", "a", "w", "c", "d", "e", "f"]),
        ScriptedCouncillor::new("c", 0.3, &["c", "d", "w", "a", "b", "e", "f"]),
        ScriptedCouncillor::new("d", 0.4, &["d", "c", "w", "a", "b", "e", "f"]),
        ScriptedCouncillor::new("e", 0.5, &["e", "a", "w", "b", "c", "d", "f"]),
    ]
}

// ========== Sessions ==========

pub struct Harness {
    pub worker: Arc<ScriptedWorker>,
    pub gate: Arc<ScriptedGate>,
    pub workspace: Arc<dyn WorkspaceBackend>,
    pub council: Option<Arc<ConsensusCouncil>>,
}

impl Harness {
    pub fn new(worker: Arc<ScriptedWorker>, gate: Arc<ScriptedGate>) -> Self {
        Self {
            worker,
            gate,
            workspace: Arc::new(MemoryWorkspace::new()),
            council: None,
        }
    }

    pub fn with_workspace(mut self, workspace: Arc<dyn WorkspaceBackend>) -> Self {
        self.workspace = workspace;
        self
    }

    pub fn with_council(mut self, council: Arc<ConsensusCouncil>) -> Self {
        self.council = Some(council);
        self
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            registry: Arc::new(registry_for(self.worker.clone())),
            gate: self.gate.clone(),
            council: self.council.clone(),
            workspace: Arc::clone(&self.workspace),
        }
    }

    pub async fn start(&self, plan: &str, config: &Config) -> Session {
        self.start_in(plan, config, StateStore::in_memory().unwrap()).await
    }

    pub async fn start_in(&self, plan: &str, config: &Config, store: StateStore) -> Session {
        let plan = Plan::from_toml(plan).expect("plan should parse");
        Session::start(SessionId::new(), &plan, self.collaborators(), config, store)
            .await
            .expect("session should start")
    }
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.orchestrator.worker_timeout_secs = 5;
    config.orchestrator.validator_timeout_secs = 5;
    config
}

/// `a` and `b` feed `c`.
pub const DIAMOND_PLAN: &str = r#"
[[task]]
name = "a"
kind = "implementation"

[[task]]
name = "b"
kind = "implementation"

[[task]]
name = "c"
kind = "testing"
dependencies = ["a", "b"]
"#;

/// One task with three outputs and criteria mapped to two of them.
pub const LAYERED_PLAN: &str = r#"
[[task]]
name = "api"
kind = "implementation"

[[task.outputs]]
name = "handlers"

[[task.outputs]]
name = "error_handling"

[[task.outputs]]
name = "tests"
capability = "testing"

[[task.criteria]]
id = "errors"
statement = "errors map to status codes"
output = "error_handling"

[[task.criteria]]
id = "coverage"
statement = "tests cover the handlers"
output = "tests"
"#;

/// A lone diagnosis task.
pub const DIAGNOSIS_PLAN: &str = r#"
[[task]]
name = "flaky-login"
kind = "diagnosis"
description = "login test fails one run in ten"
"#;
