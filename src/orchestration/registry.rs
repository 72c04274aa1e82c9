//! Capability registry: which worker handles a task kind at a given tier.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::task::{GapRecord, TaskId, TaskKind, Tier};
use crate::workspace::Artifact;
use crate::{clog_debug, Error, Result};

/// Everything a worker gets for one output of one iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkRequest {
    pub task_id: TaskId,
    pub task_name: String,
    pub description: String,
    pub kind: TaskKind,
    /// Output to produce.
    pub output: String,
    pub tier: Tier,
    pub iteration: u32,
    pub prior_gaps: Vec<GapRecord>,
    /// Council diagnosis, when one has been accepted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guidance: Option<String>,
    /// Track workspace root, when the backend has one on disk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkOutput {
    pub artifact: Artifact,
    /// Self-reported confidence in [0, 1].
    pub confidence: f64,
}

/// A worker that could not produce its output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerFailure {
    pub reason: String,
}

impl WorkerFailure {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for WorkerFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.reason)
    }
}

#[async_trait]
pub trait CapabilityWorker: Send + Sync {
    async fn execute(&self, request: &WorkRequest) -> std::result::Result<WorkOutput, WorkerFailure>;
}

/// A resolved worker and the tier it will actually run at.
#[derive(Clone)]
pub struct ResolvedWorker {
    pub worker: Arc<dyn CapabilityWorker>,
    pub tier: Tier,
    /// Fixed workers ignore the requested tier.
    pub fixed: bool,
}

impl std::fmt::Debug for ResolvedWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedWorker")
            .field("tier", &self.tier)
            .field("fixed", &self.fixed)
            .finish()
    }
}

#[derive(Default)]
pub struct CapabilityRegistry {
    workers: HashMap<(TaskKind, Tier), Arc<dyn CapabilityWorker>>,
    fixed: HashMap<TaskKind, (Tier, Arc<dyn CapabilityWorker>)>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a worker for one kind at one tier, replacing any previous one.
    pub fn register(&mut self, kind: TaskKind, tier: Tier, worker: Arc<dyn CapabilityWorker>) {
        clog_debug!("Registered worker for {} at {}", kind, tier);
        self.workers.insert((kind, tier), worker);
    }

    /// Register a worker that serves every tier of `kind` at its own tier.
    pub fn register_fixed(&mut self, kind: TaskKind, tier: Tier, worker: Arc<dyn CapabilityWorker>) {
        clog_debug!("Registered fixed worker for {} at {}", kind, tier);
        self.fixed.insert(kind, (tier, worker));
    }

    pub fn resolve(&self, kind: TaskKind, tier: Tier) -> Result<ResolvedWorker> {
        if let Some(worker) = self.workers.get(&(kind, tier)) {
            return Ok(ResolvedWorker {
                worker: Arc::clone(worker),
                tier,
                fixed: false,
            });
        }
        if let Some((fixed_tier, worker)) = self.fixed.get(&kind) {
            return Ok(ResolvedWorker {
                worker: Arc::clone(worker),
                tier: *fixed_tier,
                fixed: true,
            });
        }
        Err(Error::WorkerNotRegistered {
            kind: kind.to_string(),
            tier: tier.to_string(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty() && self.fixed.is_empty()
    }
}
