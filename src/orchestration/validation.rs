//! Validation gate: judges staged artifacts against acceptance criteria.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::task::{ArtifactRef, Criterion, Gap};
use crate::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Fail { gaps: Vec<Gap> },
}

impl Verdict {
    pub fn is_pass(&self) -> bool {
        matches!(self, Verdict::Pass)
    }

    pub fn gaps(&self) -> &[Gap] {
        match self {
            Verdict::Pass => &[],
            Verdict::Fail { gaps } => gaps,
        }
    }
}

/// Context passed with every validation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRequest {
    pub task_name: String,
    pub iteration: u32,
    pub artifacts: Vec<ArtifactRef>,
    /// Artifact content keyed by path, as the track workspace sees it.
    pub contents: BTreeMap<String, String>,
    pub criteria: Vec<Criterion>,
}

#[async_trait]
pub trait ValidationGate: Send + Sync {
    async fn validate(&self, request: &ValidationRequest) -> Result<Verdict>;
}

/// Passes whenever every criterion has a non-empty artifact to judge.
///
/// Used when no validator command is configured.
#[derive(Debug, Default)]
pub struct PresenceGate {
    calls: Mutex<u64>,
}

impl PresenceGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> u64 {
        self.calls.lock().map(|c| *c).unwrap_or(0)
    }
}

#[async_trait]
impl ValidationGate for PresenceGate {
    async fn validate(&self, request: &ValidationRequest) -> Result<Verdict> {
        if let Ok(mut calls) = self.calls.lock() {
            *calls += 1;
        }

        let mut gaps = Vec::new();
        for artifact in &request.artifacts {
            let empty = request
                .contents
                .get(&artifact.path)
                .map_or(true, |c| c.trim().is_empty());
            if empty {
                gaps.push(Gap::new(&artifact.output, "artifact is empty"));
            }
        }
        for criterion in &request.criteria {
            if let Some(output) = &criterion.output {
                if !request.artifacts.iter().any(|a| &a.output == output) {
                    gaps.push(Gap::new(&criterion.id, "no artifact for output"));
                }
            }
        }

        if gaps.is_empty() {
            Ok(Verdict::Pass)
        } else {
            Ok(Verdict::Fail { gaps })
        }
    }
}
