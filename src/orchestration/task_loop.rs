//! Per-task orchestration: dispatch, validate, retry, escalate.
//!
//! [`TaskOrchestrator::drive`] moves one task through its state machine
//! until it passes, aborts, or has to wait. Every transition is appended to
//! the state store first and then folded into the shared task graph, so
//! the graph never holds state the log does not.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time::timeout;

use crate::config::OrchestratorConfig;
use crate::core::dag::TaskGraph;
use crate::core::task::{ArtifactRef, Gap, GapRecord, Task, TaskId, TaskStatus, Tier};
use crate::orchestration::council::{ConsensusCouncil, CouncilVerdict, DiagnosisBrief};
use crate::orchestration::escalation::{EscalationPolicy, TierDecision, TierInput};
use crate::orchestration::registry::{CapabilityRegistry, ResolvedWorker, WorkRequest};
use crate::orchestration::track::TrackId;
use crate::orchestration::validation::{ValidationGate, ValidationRequest, Verdict};
use crate::state::event::{Event, EventPayload, NewEvent};
use crate::state::store::StateStore;
use crate::util::blocking;
use crate::workspace::WorkspaceBackend;
use crate::{clog, clog_debug, clog_trace, clog_warn, Error, Result};

/// Gap criterion recorded for an iteration cut off by a crash.
pub const INTERRUPTED: &str = "interrupted";

/// Gap criterion recorded when the validator itself fails.
pub const VALIDATOR: &str = "validator";

/// How a call to [`TaskOrchestrator::drive`] ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Passed {
        iteration: u32,
    },
    Aborted {
        reason: String,
        gap_history: Vec<GapRecord>,
    },
    /// Dependencies have not passed; the task stays Pending.
    DependencyUnmet {
        missing: Vec<TaskId>,
    },
    /// A weak council verdict is waiting for an operator.
    AwaitingConfirmation {
        verdict: Box<CouncilVerdict>,
    },
}

impl TaskOutcome {
    pub fn is_passed(&self) -> bool {
        matches!(self, TaskOutcome::Passed { .. })
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, TaskOutcome::Aborted { .. })
    }
}

/// Point-in-time task state kept in the key/value table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub name: String,
    pub status: TaskStatus,
    pub tier: Option<Tier>,
    pub iteration: u32,
    pub consecutive_failures: u32,
    pub seq: u64,
}

impl TaskSnapshot {
    pub fn key(task: &TaskId) -> String {
        format!("task.{}.status", task)
    }

    fn of(task: &Task, seq: u64) -> Self {
        Self {
            name: task.name.clone(),
            status: task.status,
            tier: task.tier,
            iteration: task.iteration,
            consecutive_failures: task.consecutive_failures,
            seq,
        }
    }
}

pub struct TaskOrchestrator {
    registry: Arc<CapabilityRegistry>,
    gate: Arc<dyn ValidationGate>,
    council: Option<Arc<ConsensusCouncil>>,
    workspace: Arc<dyn WorkspaceBackend>,
    store: Arc<StateStore>,
    config: OrchestratorConfig,
}

impl TaskOrchestrator {
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        gate: Arc<dyn ValidationGate>,
        council: Option<Arc<ConsensusCouncil>>,
        workspace: Arc<dyn WorkspaceBackend>,
        store: Arc<StateStore>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            registry,
            gate,
            council,
            workspace,
            store,
            config,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Drive a task inside `track` until it passes, aborts, or must wait.
    pub async fn drive(
        &self,
        task_id: TaskId,
        track: TrackId,
        graph: &RwLock<TaskGraph>,
    ) -> Result<TaskOutcome> {
        loop {
            let task = graph.read().await.task(&task_id)?.clone();

            match task.status {
                TaskStatus::Passed => {
                    return Ok(TaskOutcome::Passed {
                        iteration: task.iteration,
                    })
                }
                TaskStatus::Aborted => {
                    return Ok(TaskOutcome::Aborted {
                        reason: task.abort_reason.clone().unwrap_or_default(),
                        gap_history: task.gap_history,
                    })
                }
                TaskStatus::Dispatched | TaskStatus::Validating => {
                    clog_warn!(
                        "Task {} was interrupted during iteration {}",
                        task.name,
                        task.iteration
                    );
                    self.record(
                        graph,
                        &task_id,
                        track,
                        Some(TaskStatus::Failed),
                        EventPayload::ValidationFailed {
                            iteration: task.iteration,
                            gaps: vec![Gap::new(
                                INTERRUPTED,
                                "iteration did not finish before the session stopped",
                            )],
                        },
                    )
                    .await?;
                }
                TaskStatus::Pending => {
                    let missing = {
                        let graph = graph.read().await;
                        graph
                            .get_dependencies(&task_id)
                            .into_iter()
                            .filter(|dep| dep.status != TaskStatus::Passed)
                            .map(|dep| dep.id)
                            .collect::<Vec<_>>()
                    };
                    if !missing.is_empty() {
                        clog_debug!(
                            "Task {} waits on {} unmet dependencies",
                            task.name,
                            missing.len()
                        );
                        return Ok(TaskOutcome::DependencyUnmet { missing });
                    }
                    let tier = match self.policy(&task).decide(TierInput::for_task(&task)) {
                        TierDecision::Dispatch(tier) => tier,
                        TierDecision::Council => task.complexity.floor_tier(),
                    };
                    self.dispatch(graph, &task, track, tier).await?;
                }
                TaskStatus::Escalated if task.awaiting_confirmation => {
                    let verdict = task.council.clone().ok_or_else(|| {
                        Error::Validation(format!("task {} awaits a missing verdict", task.name))
                    })?;
                    return Ok(TaskOutcome::AwaitingConfirmation {
                        verdict: Box::new(verdict),
                    });
                }
                TaskStatus::Escalated if task.council_pending => {
                    if let Some(outcome) = self.consult(graph, &task, track).await? {
                        return Ok(outcome);
                    }
                }
                TaskStatus::Escalated => {
                    let floor = task.complexity.floor_tier();
                    let tier = task.tier.map_or(floor, |t| t.max(floor));
                    self.dispatch(graph, &task, track, tier).await?;
                }
                TaskStatus::Failed => {
                    if task.iteration >= self.config.max_iterations {
                        let reason = Error::MaxIterationsExceeded {
                            task: task_id,
                            iterations: task.iteration,
                        }
                        .to_string();
                        clog_warn!("Aborting task {}: {}", task.name, reason);
                        self.record(
                            graph,
                            &task_id,
                            track,
                            Some(TaskStatus::Aborted),
                            EventPayload::Aborted {
                                iteration: task.iteration,
                                reason,
                            },
                        )
                        .await?;
                        continue;
                    }
                    self.retry(graph, &task, track).await?;
                }
            }
        }
    }

    fn policy(&self, task: &Task) -> EscalationPolicy {
        EscalationPolicy::for_kind(task.kind)
    }

    /// Pick the next step for a failed task and take it.
    async fn retry(&self, graph: &RwLock<TaskGraph>, task: &Task, track: TrackId) -> Result<()> {
        let floor = task.complexity.floor_tier();
        let current = task.tier.map_or(floor, |t| t.max(floor));

        match self.policy(task).decide(TierInput::for_task(task)) {
            TierDecision::Dispatch(tier) if tier > current => {
                clog!("Escalating task {} from {} to {}", task.name, current, tier);
                self.record(
                    graph,
                    &task.id,
                    track,
                    Some(TaskStatus::Escalated),
                    EventPayload::Escalated {
                        from_tier: task.tier,
                        to_tier: tier,
                        to_council: false,
                    },
                )
                .await?;
                Ok(())
            }
            TierDecision::Dispatch(tier) => self.dispatch(graph, task, track, tier).await,
            TierDecision::Council if self.council.is_some() => {
                clog!("Escalating task {} to the consensus council", task.name);
                self.record(
                    graph,
                    &task.id,
                    track,
                    Some(TaskStatus::Escalated),
                    EventPayload::Escalated {
                        from_tier: task.tier,
                        to_tier: current,
                        to_council: true,
                    },
                )
                .await?;
                Ok(())
            }
            TierDecision::Council => {
                clog_warn!(
                    "Task {} qualifies for council review but no council is configured",
                    task.name
                );
                self.dispatch(graph, task, track, current).await
            }
        }
    }

    /// Convene the council for an escalated task.
    ///
    /// Returns an outcome when the verdict needs confirmation.
    async fn consult(
        &self,
        graph: &RwLock<TaskGraph>,
        task: &Task,
        track: TrackId,
    ) -> Result<Option<TaskOutcome>> {
        let Some(council) = &self.council else {
            clog_warn!("Council requested for {} without a council", task.name);
            self.record(
                graph,
                &task.id,
                track,
                None,
                EventPayload::GuidanceResolved { accepted: false },
            )
            .await?;
            return Ok(None);
        };

        let verdict = council.convene(&DiagnosisBrief::for_task(task)).await?;
        let weak = verdict.requires_confirmation();
        let score = verdict.strength.score;
        self.record(
            graph,
            &task.id,
            track,
            None,
            EventPayload::CouncilDecided {
                verdict: Box::new(verdict.clone()),
            },
        )
        .await?;

        if weak {
            clog_warn!(
                "{}",
                Error::WeakConsensus {
                    task: task.id,
                    score
                }
            );
            return Ok(Some(TaskOutcome::AwaitingConfirmation {
                verdict: Box::new(verdict),
            }));
        }
        Ok(None)
    }

    /// A judgement below the confidence threshold goes to the council
    /// once, before it is validated.
    fn needs_second_opinion(&self, task: &Task, confidence: f64) -> bool {
        self.council.is_some()
            && task.kind.is_judgement()
            && task.council.is_none()
            && confidence < self.config.council_confidence_threshold
    }

    /// Outputs to regenerate on the next dispatch, in declaration order.
    fn outputs_for(&self, task: &Task) -> Vec<String> {
        let all = task.output_names();
        if task.iteration == 0 || !self.config.smart_reexecution {
            return all;
        }
        let implicated = match task.gap_history.last() {
            Some(record) => task.implicated_outputs(&record.gaps),
            None => return all,
        };
        all.into_iter()
            .filter(|o| implicated.contains(o) || !task.artifacts.contains_key(o))
            .collect()
    }

    /// One iteration: dispatch workers, stage artifacts, validate.
    async fn dispatch(
        &self,
        graph: &RwLock<TaskGraph>,
        task: &Task,
        track: TrackId,
        tier: Tier,
    ) -> Result<()> {
        let iteration = task.iteration + 1;
        let outputs = self.outputs_for(task);

        let mut workers: Vec<(String, ResolvedWorker)> = Vec::with_capacity(outputs.len());
        for output in &outputs {
            let resolved = self.registry.resolve(task.capability_for(output), tier)?;
            workers.push((output.clone(), resolved));
        }

        clog!(
            "Dispatching task {} iteration {} at {} ({})",
            task.name,
            iteration,
            tier,
            outputs.join(", ")
        );
        self.record(
            graph,
            &task.id,
            track,
            Some(TaskStatus::Dispatched),
            EventPayload::Dispatched {
                iteration,
                tier,
                outputs: outputs.clone(),
            },
        )
        .await?;

        let workspace = self.workspace.path(&track);
        let worker_timeout = self.config.worker_timeout();
        let runs = workers.into_iter().map(|(output, resolved)| {
            let request = WorkRequest {
                task_id: task.id,
                task_name: task.name.clone(),
                description: task.description.clone(),
                kind: task.capability_for(&output),
                output: output.clone(),
                tier: resolved.tier,
                iteration,
                prior_gaps: task.gap_history.clone(),
                guidance: task.guidance.clone(),
                workspace: workspace.clone(),
            };
            async move {
                let result = timeout(worker_timeout, resolved.worker.execute(&request)).await;
                (output, resolved.tier, result)
            }
        });
        let results = join_all(runs).await;

        let mut gaps = Vec::new();
        let mut lowest = f64::INFINITY;
        for (output, worker_tier, result) in results {
            match result {
                Ok(Ok(work)) => {
                    let artifact = work.artifact;
                    let backend = Arc::clone(&self.workspace);
                    let staged = artifact.clone();
                    blocking(move || backend.stage(&track, &staged)).await?;
                    clog_trace!(
                        "Staged {} for {} ({} bytes)",
                        artifact.path,
                        output,
                        artifact.content.len()
                    );
                    let confidence = if work.confidence.is_nan() {
                        0.0
                    } else {
                        work.confidence.clamp(0.0, 1.0)
                    };
                    lowest = lowest.min(confidence);
                    self.record(
                        graph,
                        &task.id,
                        track,
                        None,
                        EventPayload::ArtifactStaged {
                            artifact: ArtifactRef {
                                output,
                                path: artifact.path,
                                iteration,
                                tier: worker_tier,
                                confidence,
                            },
                        },
                    )
                    .await?;
                }
                Ok(Err(failure)) => {
                    clog_warn!("Worker for {}/{} failed: {}", task.name, output, failure);
                    gaps.push(Gap::new(&output, &failure.reason));
                }
                Err(_) => {
                    clog_warn!("Worker for {}/{} timed out", task.name, output);
                    gaps.push(Gap::new(
                        &output,
                        &format!("worker timed out after {:?}", worker_timeout),
                    ));
                }
            }
        }

        if !gaps.is_empty() {
            self.record(
                graph,
                &task.id,
                track,
                Some(TaskStatus::Failed),
                EventPayload::ValidationFailed { iteration, gaps },
            )
            .await?;
            return Ok(());
        }

        if self.needs_second_opinion(task, lowest) {
            clog!(
                "Task {} came back at confidence {:.2}; consulting the council",
                task.name,
                lowest
            );
            self.record(
                graph,
                &task.id,
                track,
                Some(TaskStatus::Escalated),
                EventPayload::Escalated {
                    from_tier: task.tier,
                    to_tier: tier,
                    to_council: true,
                },
            )
            .await?;
            return Ok(());
        }

        self.record(
            graph,
            &task.id,
            track,
            Some(TaskStatus::Validating),
            EventPayload::ValidationStarted { iteration },
        )
        .await?;
        self.validate(graph, &task.id, track, iteration).await
    }

    async fn validate(
        &self,
        graph: &RwLock<TaskGraph>,
        task_id: &TaskId,
        track: TrackId,
        iteration: u32,
    ) -> Result<()> {
        let task = graph.read().await.task(task_id)?.clone();
        let artifacts: Vec<ArtifactRef> = task.artifacts.values().cloned().collect();

        let backend = Arc::clone(&self.workspace);
        let paths: Vec<String> = artifacts.iter().map(|a| a.path.clone()).collect();
        let contents = blocking(move || {
            let mut contents = BTreeMap::new();
            for path in paths {
                if let Some(content) = backend.read(&track, &path)? {
                    contents.insert(path, content);
                }
            }
            Ok(contents)
        })
        .await?;

        let request = ValidationRequest {
            task_name: task.name.clone(),
            iteration,
            artifacts,
            contents,
            criteria: task.acceptance_criteria.clone(),
        };
        let validator_timeout = self.config.validator_timeout();
        let verdict = match timeout(validator_timeout, self.gate.validate(&request)).await {
            Ok(Ok(verdict)) => verdict,
            Ok(Err(e)) => {
                clog_warn!("Validator failed for {}: {}", task.name, e);
                Verdict::Fail {
                    gaps: vec![Gap::new(VALIDATOR, &e.to_string())],
                }
            }
            Err(_) => {
                clog_warn!("Validator timed out for {}", task.name);
                Verdict::Fail {
                    gaps: vec![Gap::new(
                        VALIDATOR,
                        &format!("validator timed out after {:?}", validator_timeout),
                    )],
                }
            }
        };

        match verdict {
            Verdict::Pass => {
                let backend = Arc::clone(&self.workspace);
                let message = format!("{}: iteration {}", task.name, iteration);
                blocking(move || backend.commit(&track, &message)).await?;
                clog!("Task {} passed on iteration {}", task.name, iteration);
                self.record(
                    graph,
                    task_id,
                    track,
                    Some(TaskStatus::Passed),
                    EventPayload::Passed { iteration },
                )
                .await?;
            }
            Verdict::Fail { gaps } => {
                clog!(
                    "Task {} failed validation on iteration {} ({} gap(s))",
                    task.name,
                    iteration,
                    gaps.len()
                );
                self.record(
                    graph,
                    task_id,
                    track,
                    Some(TaskStatus::Failed),
                    EventPayload::ValidationFailed { iteration, gaps },
                )
                .await?;
            }
        }
        Ok(())
    }

    /// Log an event for a task, then apply it to the graph.
    ///
    /// The append and the snapshot write run on the blocking pool with the
    /// graph unlocked. Only the track driving a task records events for it,
    /// so the status checked here is still current when the event lands.
    async fn record(
        &self,
        graph: &RwLock<TaskGraph>,
        task_id: &TaskId,
        track: TrackId,
        to: Option<TaskStatus>,
        payload: EventPayload,
    ) -> Result<Event> {
        let current = graph.read().await.task(task_id)?.status;
        if let Some(to) = to {
            if !current.can_transition(to) {
                return Err(Error::InvalidTransition {
                    task: *task_id,
                    from: current.to_string(),
                    to: to.to_string(),
                });
            }
        }

        let store = Arc::clone(&self.store);
        let entry = NewEvent::task(*task_id, to.map(|_| current), to, payload).in_track(Some(track));
        let event = blocking(move || store.append(entry)).await?;
        let snapshot = {
            let mut graph = graph.write().await;
            graph.apply(&event);
            TaskSnapshot::of(graph.task(task_id)?, event.seq)
        };
        clog_debug!("{}", event);

        // Snapshots only move on status changes.
        if event.is_transition() {
            let store = Arc::clone(&self.store);
            let key = TaskSnapshot::key(task_id);
            blocking(move || store.put(&key, &snapshot)).await?;
        }
        Ok(event)
    }
}
