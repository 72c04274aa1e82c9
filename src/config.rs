use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::task::{TaskKind, Tier};
use crate::{clog_debug, Error, Result};

/// Default council perspectives, one member each.
pub const DEFAULT_PERSPECTIVES: [&str; 5] = [
    "adversarial-tester",
    "code-archaeologist",
    "pattern-matcher",
    "root-cause-analyst",
    "systems-thinker",
];

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub council: CouncilConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub workers: Vec<WorkerCommand>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validator: Option<CommandConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub max_iterations: u32,
    pub worker_timeout_secs: u64,
    pub validator_timeout_secs: u64,
    /// Re-dispatch only the outputs a failure implicates.
    pub smart_reexecution: bool,
    /// Judgement results below this confidence go to the council first.
    pub council_confidence_threshold: f64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            worker_timeout_secs: 600,
            validator_timeout_secs: 300,
            smart_reexecution: true,
            council_confidence_threshold: 0.5,
        }
    }
}

impl OrchestratorConfig {
    pub fn worker_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_timeout_secs)
    }

    pub fn validator_timeout(&self) -> Duration {
        Duration::from_secs(self.validator_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BreakerConfig {
    pub threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self { threshold: 3 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CouncilConfig {
    pub size: usize,
    pub members: Vec<String>,
    pub timeout_secs: u64,
    pub commands: Vec<CouncilCommand>,
}

impl Default for CouncilConfig {
    fn default() -> Self {
        Self {
            size: DEFAULT_PERSPECTIVES.len(),
            members: DEFAULT_PERSPECTIVES.iter().map(|s| s.to_string()).collect(),
            timeout_secs: 300,
            commands: Vec::new(),
        }
    }
}

impl CouncilConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    pub sprint_budget_hours: f64,
    pub max_parallel_tracks: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sprint_budget_hours: 80.0,
            max_parallel_tracks: 4,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Memory,
    Git,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkspaceConfig {
    pub backend: BackendKind,
    pub repo: Option<String>,
    pub worktree_dir: Option<String>,
    pub integration_branch: String,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Memory,
            repo: None,
            worktree_dir: None,
            integration_branch: "cadence/integration".to_string(),
        }
    }
}

/// An external command speaking JSON on stdin/stdout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandConfig {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

/// A worker command registered for one capability.
///
/// `fixed = true` pins the worker outside the escalation chain, serving
/// every requested tier at `tier`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerCommand {
    pub kind: TaskKind,
    pub tier: Tier,
    #[serde(default)]
    pub fixed: bool,
    pub command: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CouncilCommand {
    pub id: String,
    pub command: String,
}

impl Config {
    pub fn cadence_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".cadence"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::cadence_dir()?.join("cadence.toml"))
    }

    pub fn sessions_dir() -> Result<PathBuf> {
        Ok(Self::cadence_dir()?.join("sessions"))
    }

    pub fn archive_dir() -> Result<PathBuf> {
        Ok(Self::cadence_dir()?.join("archive"))
    }

    pub fn worktrees_dir(&self) -> Result<PathBuf> {
        match &self.workspace.worktree_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::cadence_dir()?.join("worktrees")),
        }
    }

    pub fn repo_path(&self) -> Option<PathBuf> {
        self.workspace.repo.as_deref().map(expand_tilde)
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        clog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            clog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        clog_debug!(
            "Config loaded: max_iterations={}, breaker={}, backend={:?}, workers={}",
            config.orchestrator.max_iterations,
            config.breaker.threshold,
            config.workspace.backend,
            config.workers.len()
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let cadence_dir = Self::cadence_dir()?;
        if !cadence_dir.exists() {
            clog_debug!("Creating cadence directory");
            fs::create_dir_all(&cadence_dir)?;
        }
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        clog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.orchestrator.max_iterations == 0 {
            return Err(Error::Config("orchestrator.max_iterations must be at least 1".into()));
        }
        if self.breaker.threshold == 0 {
            return Err(Error::Config("breaker.threshold must be at least 1".into()));
        }
        if self.scheduler.max_parallel_tracks == 0 {
            return Err(Error::Config("scheduler.max_parallel_tracks must be at least 1".into()));
        }
        if self.scheduler.sprint_budget_hours <= 0.0 {
            return Err(Error::Config("scheduler.sprint_budget_hours must be positive".into()));
        }
        if self.council.size == 0 {
            return Err(Error::Config("council.size must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.orchestrator.council_confidence_threshold) {
            return Err(Error::Config(
                "orchestrator.council_confidence_threshold must be within 0..=1".into(),
            ));
        }
        Ok(())
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
