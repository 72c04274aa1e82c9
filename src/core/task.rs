//! Task data model for the orchestration graph.
//!
//! Tasks are the atomic units of work. Each task tracks its lifecycle
//! status, the capability tier it runs at, its iteration counters, and the
//! full history of unmet acceptance criteria. Every field that changes
//! after creation is changed only by [`Task::apply`], which folds a logged
//! [`Event`] into the task. Live execution and log replay share that path.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::orchestration::council::CouncilVerdict;
use crate::state::event::{Event, EventPayload};

/// Unique identifier for a task within a session.
///
/// Uses UUID v4 for generation and provides a short form display
/// for human-readable output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Create a new unique task identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Capability category of a task or of one of its outputs.
///
/// The capability registry is keyed by kind and tier, so adding a new
/// category means registering workers for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Design,
    Implementation,
    Testing,
    Documentation,
    Review,
    Diagnosis,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Design => "design",
            TaskKind::Implementation => "implementation",
            TaskKind::Testing => "testing",
            TaskKind::Documentation => "documentation",
            TaskKind::Review => "review",
            TaskKind::Diagnosis => "diagnosis",
        }
    }

    /// Kinds whose result is a judgement the council can second-guess.
    pub fn is_judgement(&self) -> bool {
        matches!(self, TaskKind::Diagnosis | TaskKind::Design)
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "design" => Ok(TaskKind::Design),
            "implementation" => Ok(TaskKind::Implementation),
            "testing" => Ok(TaskKind::Testing),
            "documentation" => Ok(TaskKind::Documentation),
            "review" => Ok(TaskKind::Review),
            "diagnosis" => Ok(TaskKind::Diagnosis),
            other => Err(crate::Error::Validation(format!("unknown task kind: {}", other))),
        }
    }
}

/// Capability tier, ordered from cheapest to most capable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Fast,
    Standard,
    Advanced,
}

impl Tier {
    pub const LOWEST: Tier = Tier::Fast;
    pub const HIGHEST: Tier = Tier::Advanced;

    /// The next tier up, saturating at the highest tier.
    pub fn next(self) -> Tier {
        match self {
            Tier::Fast => Tier::Standard,
            Tier::Standard => Tier::Advanced,
            Tier::Advanced => Tier::Advanced,
        }
    }

    /// Numeric level, starting at 1 for the lowest tier.
    pub fn level(self) -> u8 {
        match self {
            Tier::Fast => 1,
            Tier::Standard => 2,
            Tier::Advanced => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Fast => "fast",
            Tier::Standard => "standard",
            Tier::Advanced => "advanced",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Tier {
    type Err = crate::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "fast" | "1" => Ok(Tier::Fast),
            "standard" | "2" => Ok(Tier::Standard),
            "advanced" | "3" => Ok(Tier::Advanced),
            other => Err(crate::Error::Validation(format!("unknown tier: {}", other))),
        }
    }
}

/// Complexity class, which sets the tier a task starts at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Low,
    #[default]
    Medium,
    High,
}

impl Complexity {
    /// The lowest tier a task of this complexity may run at.
    pub fn floor_tier(self) -> Tier {
        match self {
            Complexity::Low | Complexity::Medium => Tier::Fast,
            Complexity::High => Tier::Standard,
        }
    }
}

/// Task status in its lifecycle.
///
/// Pending -> Dispatched -> Validating -> Passed, with Failed and Escalated
/// as the retry states and Aborted as the terminal failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, waiting for dependencies or for its first dispatch.
    #[default]
    Pending,
    /// Workers are producing outputs for the current iteration.
    Dispatched,
    /// Outputs are with the validation gate.
    Validating,
    /// Validation passed. Terminal.
    Passed,
    /// The last iteration failed; the next one runs at the same tier.
    Failed,
    /// The last iteration failed and the task moved up a tier or to the council.
    Escalated,
    /// The iteration ceiling was exhausted. Terminal.
    Aborted,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Passed | TaskStatus::Aborted)
    }

    /// Whether the state machine allows moving from `self` to `to`.
    ///
    /// Dispatched and Validating may drop straight to Failed: a worker
    /// failure skips validation, and an interrupted iteration found on
    /// resume is recorded as a failure.
    pub fn can_transition(self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, to),
            (Pending, Dispatched)
                | (Failed, Dispatched)
                | (Escalated, Dispatched)
                | (Dispatched, Validating)
                | (Dispatched, Failed)
                | (Dispatched, Escalated)
                | (Validating, Passed)
                | (Validating, Failed)
                | (Failed, Escalated)
                | (Failed, Aborted)
        )
    }

    /// Whether losing the task's track sends it back to Pending.
    pub fn can_requeue(self) -> bool {
        !matches!(self, TaskStatus::Pending | TaskStatus::Aborted)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Dispatched => "dispatched",
            TaskStatus::Validating => "validating",
            TaskStatus::Passed => "passed",
            TaskStatus::Failed => "failed",
            TaskStatus::Escalated => "escalated",
            TaskStatus::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// A named output a task produces.
///
/// Outputs default to the task's own kind but may name another
/// capability, e.g. a `tests` output produced by a testing worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<TaskKind>,
}

impl OutputSpec {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            capability: None,
        }
    }

    pub fn with_capability(name: &str, capability: TaskKind) -> Self {
        Self {
            name: name.to_string(),
            capability: Some(capability),
        }
    }
}

/// A checkable acceptance statement, optionally tied to one output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Criterion {
    pub id: String,
    pub statement: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

impl Criterion {
    pub fn new(id: &str, statement: &str) -> Self {
        Self {
            id: id.to_string(),
            statement: statement.to_string(),
            output: None,
        }
    }

    pub fn for_output(id: &str, statement: &str, output: &str) -> Self {
        Self {
            id: id.to_string(),
            statement: statement.to_string(),
            output: Some(output.to_string()),
        }
    }
}

/// One unmet criterion reported by the validation gate.
///
/// Worker failures are reported as gaps whose criterion is the output name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gap {
    pub criterion: String,
    pub reason: String,
}

impl Gap {
    pub fn new(criterion: &str, reason: &str) -> Self {
        Self {
            criterion: criterion.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// The gaps recorded for one failed iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GapRecord {
    pub iteration: u32,
    pub tier: Option<Tier>,
    pub gaps: Vec<Gap>,
}

/// Reference to an artifact staged in a track workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// Output this artifact fulfils.
    pub output: String,
    /// Path of the artifact inside the workspace.
    pub path: String,
    /// Iteration that produced it.
    pub iteration: u32,
    /// Tier the worker ran at.
    pub tier: Tier,
    /// Worker-reported confidence in [0, 1].
    pub confidence: f64,
}

/// A single task in the orchestration graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub description: String,
    pub kind: TaskKind,
    pub complexity: Complexity,
    /// Nominal effort, used only for sprint sizing.
    pub effort_hours: f64,
    /// Shared resources the task writes; tasks sharing one never run concurrently.
    pub resources: Vec<String>,
    pub outputs: Vec<OutputSpec>,
    pub dependencies: BTreeSet<TaskId>,
    pub acceptance_criteria: Vec<Criterion>,
    pub status: TaskStatus,
    /// Current tier. `None` until the first dispatch; never decreases.
    pub tier: Option<Tier>,
    /// Number of dispatches so far.
    pub iteration: u32,
    pub consecutive_failures: u32,
    /// Failures since the tier last changed or the council last ruled.
    pub failures_at_tier: u32,
    pub gap_history: Vec<GapRecord>,
    /// Latest artifact per output name.
    pub artifacts: BTreeMap<String, ArtifactRef>,
    /// Diagnosis from the consensus council, passed to every later dispatch.
    pub guidance: Option<String>,
    /// Set while a council consultation has been requested but not decided.
    pub council_pending: bool,
    /// Latest council verdict, kept for audit.
    pub council: Option<CouncilVerdict>,
    /// A weak council verdict is waiting on operator confirmation.
    pub awaiting_confirmation: bool,
    pub abort_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a new task with a single `main` output and no criteria.
    pub fn new(name: &str, kind: TaskKind) -> Self {
        Self {
            id: TaskId::new(),
            name: name.to_string(),
            description: String::new(),
            kind,
            complexity: Complexity::default(),
            effort_hours: DEFAULT_EFFORT_HOURS,
            resources: Vec::new(),
            outputs: vec![OutputSpec::new(DEFAULT_OUTPUT)],
            dependencies: BTreeSet::new(),
            acceptance_criteria: Vec::new(),
            status: TaskStatus::Pending,
            tier: None,
            iteration: 0,
            consecutive_failures: 0,
            failures_at_tier: 0,
            gap_history: Vec::new(),
            artifacts: BTreeMap::new(),
            guidance: None,
            council_pending: false,
            council: None,
            awaiting_confirmation: false,
            abort_reason: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_complexity(mut self, complexity: Complexity) -> Self {
        self.complexity = complexity;
        self
    }

    pub fn with_effort(mut self, hours: f64) -> Self {
        self.effort_hours = hours;
        self
    }

    pub fn with_resource(mut self, resource: &str) -> Self {
        self.resources.push(resource.to_string());
        self
    }

    /// Replace the default output list.
    pub fn with_outputs(mut self, outputs: Vec<OutputSpec>) -> Self {
        self.outputs = outputs;
        self
    }

    pub fn with_criterion(mut self, criterion: Criterion) -> Self {
        self.acceptance_criteria.push(criterion);
        self
    }

    /// Capability that produces the named output.
    pub fn capability_for(&self, output: &str) -> TaskKind {
        self.outputs
            .iter()
            .find(|o| o.name == output)
            .and_then(|o| o.capability)
            .unwrap_or(self.kind)
    }

    pub fn output_names(&self) -> Vec<String> {
        self.outputs.iter().map(|o| o.name.clone()).collect()
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// Outputs that the latest failed iteration implicates.
    ///
    /// A gap maps to an output through its criterion's `output`, or by
    /// naming the output directly. Returns every output when the gaps are
    /// broad: empty, unmappable, or covering all outputs.
    pub fn implicated_outputs(&self, gaps: &[Gap]) -> Vec<String> {
        let all = self.output_names();
        if gaps.is_empty() {
            return all;
        }

        let mut implicated = BTreeSet::new();
        for gap in gaps {
            let mapped = self
                .acceptance_criteria
                .iter()
                .find(|c| c.id == gap.criterion)
                .and_then(|c| c.output.clone())
                .or_else(|| all.iter().find(|o| **o == gap.criterion).cloned());
            match mapped {
                Some(output) if all.contains(&output) => {
                    implicated.insert(output);
                }
                _ => return all,
            }
        }

        if implicated.len() == all.len() {
            return all;
        }
        // Keep declaration order.
        all.into_iter().filter(|o| implicated.contains(o)).collect()
    }

    /// Fold a logged event into this task.
    ///
    /// Events for other tasks are ignored. Status changes come from the
    /// event's `to` field; counters and history from its payload.
    pub fn apply(&mut self, event: &Event) {
        if event.task_id != Some(self.id) {
            return;
        }
        if let Some(to) = event.to {
            self.status = to;
        }

        match &event.payload {
            EventPayload::Dispatched {
                iteration,
                tier,
                outputs,
            } => {
                self.iteration = *iteration;
                self.tier = Some(self.tier.map_or(*tier, |current| current.max(*tier)));
                for output in outputs {
                    self.artifacts.remove(output);
                }
                if self.started_at.is_none() {
                    self.started_at = Some(event.timestamp);
                }
            }
            EventPayload::ArtifactStaged { artifact } => {
                self.artifacts
                    .insert(artifact.output.clone(), artifact.clone());
            }
            EventPayload::ValidationFailed { iteration, gaps } => {
                self.gap_history.push(GapRecord {
                    iteration: *iteration,
                    tier: self.tier,
                    gaps: gaps.clone(),
                });
                self.consecutive_failures += 1;
                self.failures_at_tier += 1;
            }
            EventPayload::Escalated {
                to_tier,
                to_council,
                ..
            } => {
                if self.tier.map_or(true, |current| *to_tier > current) {
                    self.tier = Some(*to_tier);
                    self.failures_at_tier = 0;
                }
                self.council_pending = *to_council;
            }
            EventPayload::CouncilDecided { verdict } => {
                self.council_pending = false;
                if verdict.requires_confirmation() {
                    self.awaiting_confirmation = true;
                } else {
                    self.guidance = Some(verdict.winner.diagnosis.clone());
                    self.failures_at_tier = 0;
                }
                self.council = Some((**verdict).clone());
            }
            EventPayload::GuidanceResolved { accepted } => {
                self.awaiting_confirmation = false;
                self.council_pending = false;
                if *accepted {
                    self.guidance = self.council.as_ref().map(|v| v.winner.diagnosis.clone());
                }
                self.failures_at_tier = 0;
            }
            EventPayload::Passed { .. } => {
                self.consecutive_failures = 0;
                self.completed_at = Some(event.timestamp);
            }
            EventPayload::Aborted { reason, .. } => {
                self.abort_reason = Some(reason.clone());
                self.completed_at = Some(event.timestamp);
            }
            EventPayload::Requeued { .. } => {
                self.artifacts.clear();
                self.council_pending = false;
                self.completed_at = None;
            }
            _ => {}
        }
    }
}

/// Output name used when a task declares none.
pub const DEFAULT_OUTPUT: &str = "main";

/// Nominal effort assumed when a plan omits it.
pub const DEFAULT_EFFORT_HOURS: f64 = 8.0;
