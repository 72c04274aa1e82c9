//! A cadence session: one plan driven to completion.
//!
//! The session owns the task graph, the tracks, and the event log. It walks
//! the plan sprint by sprint and batch by batch, runs each batch's tracks
//! in parallel, merges what passed, and pauses when the circuit breaker
//! trips or an operator asks it to. Everything it does is logged, so a
//! session can be resumed from its store after a crash.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{BackendKind, Config};
use crate::core::dag::TaskGraph;
use crate::core::plan::Plan;
use crate::core::task::{GapRecord, TaskId, TaskStatus};
use crate::orchestration::breaker::CircuitBreaker;
use crate::orchestration::command::{council_from_config, registry_from_config, validator_from_config};
use crate::orchestration::council::{ConsensusCouncil, CouncilVerdict};
use crate::orchestration::registry::CapabilityRegistry;
use crate::orchestration::scheduler::{assign_tracks, SprintScheduler};
use crate::orchestration::task_loop::{TaskOrchestrator, TaskOutcome};
use crate::orchestration::track::{Track, TrackId, TrackManager, TrackState};
use crate::orchestration::validation::ValidationGate;
use crate::state::event::{Event, EventPayload, NewEvent};
use crate::state::replay::{PauseReason, SessionProjection, SessionState, SessionStatus};
use crate::state::store::StateStore;
use crate::util::slugify;
use crate::workspace::{GitWorkspace, MemoryWorkspace, WorkspaceBackend};
use crate::{clog, clog_debug, clog_error, clog_warn, Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for SessionId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(SessionId)
            .map_err(|e| Error::Validation(format!("invalid session id '{}': {}", s, e)))
    }
}

/// The pluggable parts a session drives work through.
#[derive(Clone)]
pub struct Collaborators {
    pub registry: Arc<CapabilityRegistry>,
    pub gate: Arc<dyn ValidationGate>,
    pub council: Option<Arc<ConsensusCouncil>>,
    pub workspace: Arc<dyn WorkspaceBackend>,
}

impl Collaborators {
    /// Command-backed collaborators and the configured workspace backend.
    pub fn from_config(config: &Config) -> Result<Self> {
        let workspace: Arc<dyn WorkspaceBackend> = match config.workspace.backend {
            BackendKind::Memory => Arc::new(MemoryWorkspace::new()),
            BackendKind::Git => {
                let repo = config.repo_path().ok_or_else(|| {
                    Error::Config("workspace.repo is required for the git backend".to_string())
                })?;
                Arc::new(GitWorkspace::new(
                    &repo,
                    &config.worktrees_dir()?,
                    &config.workspace.integration_branch,
                )?)
            }
        };
        Ok(Self {
            registry: Arc::new(registry_from_config(config)?),
            gate: validator_from_config(config)?,
            council: council_from_config(config)?.map(Arc::new),
            workspace,
        })
    }
}

/// Pauses a running session from another task.
///
/// A handle is bound to one dispatch run; after `resume_dispatch` take a
/// new one.
#[derive(Clone)]
pub struct PauseHandle {
    token: CancellationToken,
    note: Arc<StdMutex<Option<String>>>,
}

impl PauseHandle {
    pub fn pause(&self, note: &str) {
        if let Ok(mut slot) = self.note.lock() {
            slot.get_or_insert_with(|| note.to_string());
        }
        self.token.cancel();
    }

    pub fn is_paused(&self) -> bool {
        self.token.is_cancelled()
    }
}

// ========== Session Report ==========

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAudit {
    pub task: TaskId,
    pub name: String,
    pub iterations: u32,
    pub reason: String,
    pub gap_history: Vec<GapRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockedTask {
    pub task: TaskId,
    pub name: String,
    /// Names of dependencies not yet integrated.
    pub waiting_on: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CouncilAudit {
    pub task: TaskId,
    pub name: String,
    pub verdict: CouncilVerdict,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackConflict {
    pub track: TrackId,
    pub name: String,
    pub paths: Vec<String>,
}

/// Where a session stands after a dispatch run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionReport {
    pub session_id: SessionId,
    pub status: SessionStatus,
    pub passed: Vec<String>,
    pub aborted: Vec<TaskAudit>,
    pub blocked: Vec<BlockedTask>,
    pub awaiting_confirmation: Vec<CouncilAudit>,
    pub conflicts: Vec<TrackConflict>,
    pub pause: Option<PauseReason>,
    /// Errors that stopped a task or merge without changing its state.
    pub errors: Vec<String>,
}

impl SessionReport {
    pub fn is_complete(&self) -> bool {
        self.status == SessionStatus::Completed
    }

    /// What stands between the session and completion.
    pub fn blockers(&self) -> Vec<Error> {
        let mut blockers = Vec::new();
        if let Some(PauseReason::CircuitBreaker { failures }) = &self.pause {
            blockers.push(Error::CircuitBreakerTripped { failures: *failures });
        }
        for audit in &self.aborted {
            blockers.push(Error::MaxIterationsExceeded {
                task: audit.task,
                iterations: audit.iterations,
            });
        }
        for audit in &self.awaiting_confirmation {
            blockers.push(Error::WeakConsensus {
                task: audit.task,
                score: audit.verdict.strength.score,
            });
        }
        for conflict in &self.conflicts {
            blockers.push(Error::MergeConflict {
                track: conflict.track,
                paths: conflict.paths.clone(),
            });
        }
        blockers
    }
}

impl std::fmt::Display for SessionReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Session {} is {}", self.session_id.short(), self.status)?;
        if let Some(reason) = &self.pause {
            writeln!(f, "  {}", reason)?;
        }
        writeln!(f, "  passed: {}", self.passed.len())?;
        for audit in &self.aborted {
            writeln!(
                f,
                "  aborted: {} after {} iteration(s): {}",
                audit.name, audit.iterations, audit.reason
            )?;
        }
        for blocked in &self.blocked {
            writeln!(
                f,
                "  blocked: {} waiting on {}",
                blocked.name,
                blocked.waiting_on.join(", ")
            )?;
        }
        for audit in &self.awaiting_confirmation {
            writeln!(
                f,
                "  awaiting confirmation: {} ({} consensus {:.2}): {}",
                audit.name,
                audit.verdict.strength.level,
                audit.verdict.strength.score,
                audit.verdict.winner.diagnosis
            )?;
        }
        for conflict in &self.conflicts {
            writeln!(
                f,
                "  conflict: track {} ({}) on {}",
                conflict.name,
                conflict.track.short(),
                conflict.paths.join(", ")
            )?;
        }
        for error in &self.errors {
            writeln!(f, "  error: {}", error)?;
        }
        Ok(())
    }
}

/// What one track runner did.
struct TrackRun {
    track: TrackId,
    outcomes: Vec<(TaskId, Result<TaskOutcome>)>,
}

// ========== Session ==========

pub struct Session {
    id: SessionId,
    store: Arc<StateStore>,
    graph: Arc<RwLock<TaskGraph>>,
    tracks: Arc<Mutex<TrackManager>>,
    orchestrator: Arc<TaskOrchestrator>,
    scheduler: SprintScheduler,
    breaker: Arc<CircuitBreaker>,
    halt: CancellationToken,
    pause_note: Arc<StdMutex<Option<String>>>,
    state: SessionState,
    max_parallel_tracks: usize,
    archive_dir: Option<PathBuf>,
}

impl Session {
    /// Start a new session over a plan.
    ///
    /// The plan is validated and checked for cycles before anything is
    /// logged.
    pub async fn start(
        id: SessionId,
        plan: &Plan,
        collaborators: Collaborators,
        config: &Config,
        store: StateStore,
    ) -> Result<Self> {
        config.validate()?;
        let graph = TaskGraph::from_plan(plan)?;
        let order: Vec<_> = graph.topological_order()?.into_iter().cloned().collect();
        let store = Arc::new(store);
        if store.last_seq()? > 0 {
            return Err(Error::Validation(format!(
                "store already holds a session with {} events",
                store.last_seq()?
            )));
        }

        let mut state = SessionState::default();
        let started = store.append(NewEvent::session(EventPayload::SessionStarted { session_id: id }))?;
        state.apply(&started);
        for task in order {
            store.append(NewEvent::task(
                task.id,
                None,
                None,
                EventPayload::TaskAdded {
                    task: Box::new(task),
                },
            ))?;
        }
        for (from, to) in graph.dependencies() {
            store.append(NewEvent::task(
                to,
                None,
                None,
                EventPayload::DependencyAdded { from, to },
            ))?;
        }
        clog!(
            "Started session {} with {} task(s) and {} dependency edge(s)",
            id.short(),
            graph.task_count(),
            graph.dependency_count()
        );

        let tracks = TrackManager::new(Arc::clone(&collaborators.workspace), Arc::clone(&store));
        let session = Self::assemble(id, store, graph, tracks, state, collaborators, config);
        session.checkpoint().await?;
        Ok(session)
    }

    /// Rebuild a session from its store.
    ///
    /// A closed session is refused. A paused one stays paused until
    /// [`Session::resume_dispatch`]. Tasks cut off mid-iteration are
    /// recovered by their next drive.
    pub async fn resume(store: StateStore, collaborators: Collaborators, config: &Config) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(store);
        let events = store.events()?;
        let projection = SessionProjection::resume(store.load_checkpoint()?, &events);
        let id = projection
            .session
            .session_id
            .ok_or_else(|| Error::Validation("store holds no session".to_string()))?;
        if projection.session.status.is_closed() {
            return Err(Error::SessionClosed(format!(
                "session {} is {}",
                id.short(),
                projection.session.status
            )));
        }

        let interrupted = projection.interrupted();
        if !interrupted.is_empty() {
            clog_warn!(
                "Session {} has {} interrupted task(s); they will be retried",
                id.short(),
                interrupted.len()
            );
        }

        let graph = TaskGraph::from_parts(projection.tasks.values(), projection.dependencies.iter())?;
        let tracks = TrackManager::restore(
            Arc::clone(&collaborators.workspace),
            Arc::clone(&store),
            projection.tracks.clone(),
        )
        .await?;
        clog!(
            "Resumed session {} at seq {} ({} task(s), {} track(s))",
            id.short(),
            projection.last_seq,
            graph.task_count(),
            tracks.tracks().len()
        );

        let session = Self::assemble(
            id,
            store,
            graph,
            tracks,
            projection.session,
            collaborators,
            config,
        );
        if session.breaker.is_tripped() && session.state.status != SessionStatus::Paused {
            clog_warn!(
                "Session {} stopped with the circuit breaker tripped; dispatch stays halted",
                id.short()
            );
            session.halt.cancel();
        }
        Ok(session)
    }

    fn assemble(
        id: SessionId,
        store: Arc<StateStore>,
        graph: TaskGraph,
        tracks: TrackManager,
        state: SessionState,
        collaborators: Collaborators,
        config: &Config,
    ) -> Self {
        let orchestrator = TaskOrchestrator::new(
            collaborators.registry,
            collaborators.gate,
            collaborators.council,
            collaborators.workspace,
            Arc::clone(&store),
            config.orchestrator.clone(),
        );
        Self {
            id,
            store,
            graph: Arc::new(RwLock::new(graph)),
            tracks: Arc::new(Mutex::new(tracks)),
            orchestrator: Arc::new(orchestrator),
            scheduler: SprintScheduler::new(config.scheduler.sprint_budget_hours),
            breaker: Arc::new(CircuitBreaker::restore(
                config.breaker.threshold,
                state.consecutive_aborts,
            )),
            halt: CancellationToken::new(),
            pause_note: Arc::new(StdMutex::new(None)),
            state,
            max_parallel_tracks: config.scheduler.max_parallel_tracks.max(1),
            archive_dir: None,
        }
    }

    /// Archive the store under `dir/<session id>` when the session closes.
    pub fn with_archive_dir(mut self, dir: &Path) -> Self {
        self.archive_dir = Some(dir.to_path_buf());
        self
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn status(&self) -> SessionStatus {
        self.state.status
    }

    pub fn store(&self) -> Arc<StateStore> {
        Arc::clone(&self.store)
    }

    pub fn graph(&self) -> Arc<RwLock<TaskGraph>> {
        Arc::clone(&self.graph)
    }

    pub async fn tracks(&self) -> Vec<Track> {
        self.tracks.lock().await.tracks().to_vec()
    }

    pub fn pause_handle(&self) -> PauseHandle {
        PauseHandle {
            token: self.halt.clone(),
            note: Arc::clone(&self.pause_note),
        }
    }

    fn record(&mut self, payload: EventPayload) -> Result<Event> {
        let event = self.store.append(NewEvent::session(payload))?;
        self.state.apply(&event);
        Ok(event)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state.status.is_closed() {
            return Err(Error::SessionClosed(format!(
                "session {} is {}",
                self.id.short(),
                self.state.status
            )));
        }
        Ok(())
    }

    // ========== Dispatch ==========

    /// Dispatch every runnable task until the plan is done or dispatch halts.
    pub async fn run(&mut self) -> Result<SessionReport> {
        self.ensure_open()?;
        if let Some(reason) = &self.state.pause_reason {
            return Err(Error::SessionPaused(reason.to_string()));
        }

        let sprints = {
            let graph = self.graph.read().await;
            self.scheduler.plan(&graph)?
        };
        let mut errors = Vec::new();

        'sprints: for sprint in &sprints {
            clog_debug!(
                "Sprint {}: {} task(s) in {} batch(es), {}h",
                sprint.number,
                sprint.task_count(),
                sprint.batches.len(),
                sprint.effort_hours
            );
            for batch in &sprint.batches {
                if self.halt.is_cancelled() {
                    break 'sprints;
                }
                self.run_batch(sprint.number, batch, &mut errors).await?;
            }
        }

        if self.halt.is_cancelled() && self.state.status != SessionStatus::Paused {
            let reason = self.halt_reason();
            clog_warn!("Session {} paused: {}", self.id.short(), reason);
            self.record(EventPayload::SessionPaused { reason })?;
        } else if self.is_done().await {
            self.record(EventPayload::SessionCompleted)?;
            clog!("Session {} completed", self.id.short());
        }

        self.checkpoint().await?;
        if self.state.status.is_closed() {
            self.archive()?;
        }
        self.report(errors).await
    }

    async fn run_batch(&mut self, sprint: usize, batch: &[TaskId], errors: &mut Vec<String>) -> Result<()> {
        let plans = self.plan_tracks(sprint, batch).await?;
        if plans.is_empty() {
            return Ok(());
        }

        let semaphore = Arc::new(Semaphore::new(self.max_parallel_tracks));
        let handles: Vec<_> = plans
            .into_iter()
            .map(|(track, tasks)| {
                let orchestrator = Arc::clone(&self.orchestrator);
                let graph = Arc::clone(&self.graph);
                let breaker = Arc::clone(&self.breaker);
                let halt = self.halt.clone();
                let semaphore = Arc::clone(&semaphore);
                tokio::spawn(async move {
                    let _permit = semaphore
                        .acquire_owned()
                        .await
                        .map_err(|e| Error::TaskJoin(e.to_string()))?;
                    Ok::<_, Error>(run_track(orchestrator, graph, breaker, halt, track, tasks).await)
                })
            })
            .collect();

        for joined in join_all(handles).await {
            let run = match joined {
                Ok(Ok(run)) => run,
                Ok(Err(e)) => {
                    errors.push(e.to_string());
                    continue;
                }
                Err(e) => {
                    clog_error!("Track runner panicked: {}", e);
                    errors.push(Error::TaskJoin(e.to_string()).to_string());
                    continue;
                }
            };
            for (task, outcome) in run.outcomes {
                if let Err(e) = outcome {
                    clog_error!("Task {} in track {} failed: {}", task.short(), run.track.short(), e);
                    errors.push(format!("task {}: {}", task.short(), e));
                }
            }
        }

        let graph = self.graph.read().await;
        let mut tracks = self.tracks.lock().await;
        for (track, result) in tracks.merge_ready(&graph).await {
            match result {
                Ok(_) | Err(Error::MergeConflict { .. }) => {}
                Err(e) => {
                    clog_error!("Merging track {} failed: {}", track.short(), e);
                    errors.push(format!("track {}: {}", track.short(), e));
                }
            }
        }
        Ok(())
    }

    /// Group a batch's runnable tasks into tracks.
    ///
    /// Tasks still in a live track from an earlier run keep it; the rest are
    /// grouped by shared resources into new tracks.
    async fn plan_tracks(&self, sprint: usize, batch: &[TaskId]) -> Result<Vec<(TrackId, Vec<TaskId>)>> {
        let graph = self.graph.read().await;
        let mut tracks = self.tracks.lock().await;
        let integrated = tracks.integrated(&graph);

        let mut reused: BTreeMap<TrackId, Vec<TaskId>> = BTreeMap::new();
        let mut fresh = Vec::new();
        for id in batch {
            let task = graph.task(id)?;
            if task.is_finished() || task.awaiting_confirmation {
                continue;
            }
            if !graph.unmet_dependencies(id, &integrated).is_empty() {
                clog_debug!("Task {} is waiting on dependencies", task.name);
                continue;
            }
            match tracks.track_for_task(id) {
                Some(track) if track.is_open() => reused.entry(track.id).or_default().push(*id),
                Some(track) => {
                    clog_debug!("Task {} sits in {} track {}", task.name, track.state, track.name);
                }
                None => fresh.push(*id),
            }
        }

        let mut plans: Vec<(TrackId, Vec<TaskId>)> = reused.into_iter().collect();
        for group in assign_tracks(&graph, &fresh)? {
            let names: Vec<&str> = group
                .iter()
                .filter_map(|id| graph.get_task(id))
                .map(|t| t.name.as_str())
                .collect();
            let name = format!("s{}-{}", sprint, slugify(&names.join(" "), "track"));
            let track = tracks.create_track(&name, group.clone()).await?;
            plans.push((track, group));
        }
        Ok(plans)
    }

    fn halt_reason(&self) -> PauseReason {
        if self.breaker.is_tripped() {
            return PauseReason::CircuitBreaker {
                failures: self.breaker.consecutive_failures(),
            };
        }
        let note = self
            .pause_note
            .lock()
            .ok()
            .and_then(|n| n.clone())
            .unwrap_or_default();
        PauseReason::Operator { note }
    }

    /// Every task passed and sits in a merged track.
    async fn is_done(&self) -> bool {
        let graph = self.graph.read().await;
        let tracks = self.tracks.lock().await;
        graph.all_passed() && tracks.integrated(&graph).len() == graph.task_count()
    }

    // ========== Operator Controls ==========

    /// Stop dispatching new tasks. In-flight iterations finish first.
    pub fn pause(&mut self, note: &str) -> Result<()> {
        self.ensure_open()?;
        if self.state.status == SessionStatus::Paused {
            return Ok(());
        }
        self.halt.cancel();
        self.record(EventPayload::SessionPaused {
            reason: PauseReason::Operator {
                note: note.to_string(),
            },
        })?;
        clog!("Session {} paused by operator", self.id.short());
        Ok(())
    }

    /// Allow dispatch again after a pause, closing the circuit breaker.
    ///
    /// A running session keeps its abort count.
    pub fn resume_dispatch(&mut self) -> Result<()> {
        self.ensure_open()?;
        if self.state.status == SessionStatus::Paused || self.breaker.is_tripped() {
            self.record(EventPayload::SessionResumed)?;
            self.breaker.reset();
            clog!("Session {} resumed", self.id.short());
        }
        self.halt = CancellationToken::new();
        self.pause_note = Arc::new(StdMutex::new(None));
        Ok(())
    }

    /// Accept or reject a weak council verdict.
    ///
    /// Accepting adopts the diagnosis as guidance; rejecting retries the
    /// task without it.
    pub async fn confirm_consensus(&mut self, task: &TaskId, accept: bool) -> Result<()> {
        self.ensure_open()?;
        let track = self.tracks.lock().await.track_for_task(task).map(|t| t.id);
        let mut graph = self.graph.write().await;
        let current = graph.task(task)?;
        if !current.awaiting_confirmation {
            return Err(Error::Validation(format!(
                "task {} has no verdict awaiting confirmation",
                current.name
            )));
        }
        let name = current.name.clone();
        let event = self.store.append(
            NewEvent::task(*task, None, None, EventPayload::GuidanceResolved { accepted: accept })
                .in_track(track),
        )?;
        graph.apply(&event);
        clog!(
            "Council verdict for {} {}",
            name,
            if accept { "accepted" } else { "rejected" }
        );
        Ok(())
    }

    /// Merge a conflicted track once the operator has settled it.
    ///
    /// See [`TrackManager::resolve_track`]. Tasks waiting on the track are
    /// dispatched by the next [`Session::run`].
    pub async fn merge_track(&self, track: &TrackId) -> Result<String> {
        self.ensure_open()?;
        let graph = self.graph.read().await;
        let mut tracks = self.tracks.lock().await;
        tracks.resolve_track(track, &graph).await
    }

    /// Discard a track's workspace. See [`TrackManager::cleanup_track`].
    ///
    /// The track's work is lost with it, so every member task that has not
    /// aborted goes back to Pending and runs again in a new track.
    pub async fn cleanup_track(&self, track: &TrackId, force: bool) -> Result<Vec<String>> {
        self.ensure_open()?;
        let (items, members) = {
            let mut tracks = self.tracks.lock().await;
            let items = tracks.cleanup_track(track, force).await?;
            (items, tracks.get(track)?.tasks.clone())
        };

        let mut graph = self.graph.write().await;
        for id in members {
            let Some(task) = graph.get_task(&id) else {
                continue;
            };
            if !task.status.can_requeue() {
                continue;
            }
            let (from, name) = (task.status, task.name.clone());
            let event = self.store.append(
                NewEvent::task(
                    id,
                    Some(from),
                    Some(TaskStatus::Pending),
                    EventPayload::Requeued { track: *track },
                )
                .in_track(Some(*track)),
            )?;
            graph.apply(&event);
            clog!("Requeued task {} from discarded track {}", name, track.short());
        }
        Ok(items)
    }

    /// Close the session without completing it.
    ///
    /// Every live track is discarded, uncommitted work included.
    pub async fn abandon(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.halt.cancel();
        {
            let mut tracks = self.tracks.lock().await;
            let live: Vec<TrackId> = tracks
                .tracks()
                .iter()
                .filter(|t| t.is_live())
                .map(|t| t.id)
                .collect();
            for id in live {
                tracks.cleanup_track(&id, true).await?;
            }
        }
        self.record(EventPayload::SessionAbandoned)?;
        clog!("Session {} abandoned", self.id.short());
        self.checkpoint().await?;
        self.archive()
    }

    // ========== State ==========

    /// Current in-memory state, shaped like a replay of the log.
    pub async fn projection(&self) -> Result<SessionProjection> {
        let graph = self.graph.read().await;
        let tracks = self.tracks.lock().await;
        let mut session = self.state.clone();
        session.consecutive_aborts = self.breaker.consecutive_failures();
        Ok(SessionProjection {
            session,
            tasks: graph
                .all_tasks()
                .into_iter()
                .map(|t| (t.id, t.clone()))
                .collect(),
            dependencies: graph.dependencies(),
            tracks: tracks.tracks().to_vec(),
            last_seq: self.store.last_seq()?,
        })
    }

    pub async fn checkpoint(&self) -> Result<()> {
        let projection = self.projection().await?;
        self.store.checkpoint(&projection)
    }

    fn archive(&self) -> Result<()> {
        if let Some(dir) = &self.archive_dir {
            let dest = dir.join(self.id.to_string());
            self.store.archive(&dest)?;
            clog!("Archived session {} to {}", self.id.short(), dest.display());
        }
        Ok(())
    }

    /// Summarize the session's current state.
    pub async fn report(&self, errors: Vec<String>) -> Result<SessionReport> {
        let graph = self.graph.read().await;
        let tracks = self.tracks.lock().await;
        let integrated: HashSet<TaskId> = tracks.integrated(&graph);

        let mut report = SessionReport {
            session_id: self.id,
            status: self.state.status,
            passed: Vec::new(),
            aborted: Vec::new(),
            blocked: Vec::new(),
            awaiting_confirmation: Vec::new(),
            conflicts: Vec::new(),
            pause: self.state.pause_reason.clone(),
            errors,
        };

        for task in graph.all_tasks() {
            match task.status {
                TaskStatus::Passed => report.passed.push(task.name.clone()),
                TaskStatus::Aborted => report.aborted.push(TaskAudit {
                    task: task.id,
                    name: task.name.clone(),
                    iterations: task.iteration,
                    reason: task.abort_reason.clone().unwrap_or_default(),
                    gap_history: task.gap_history.clone(),
                }),
                TaskStatus::Pending => {
                    let unmet = graph.unmet_dependencies(&task.id, &integrated);
                    if !unmet.is_empty() {
                        report.blocked.push(BlockedTask {
                            task: task.id,
                            name: task.name.clone(),
                            waiting_on: unmet
                                .iter()
                                .filter_map(|id| graph.get_task(id))
                                .map(|t| t.name.clone())
                                .collect(),
                        });
                    }
                }
                _ => {}
            }
            if task.awaiting_confirmation {
                if let Some(verdict) = &task.council {
                    report.awaiting_confirmation.push(CouncilAudit {
                        task: task.id,
                        name: task.name.clone(),
                        verdict: verdict.clone(),
                    });
                }
            }
        }

        for track in tracks.tracks() {
            if let TrackState::Conflicted { paths } = &track.state {
                report.conflicts.push(TrackConflict {
                    track: track.id,
                    name: track.name.clone(),
                    paths: paths.clone(),
                });
            }
        }
        Ok(report)
    }
}

/// Drive a track's tasks one after another.
///
/// Stops before the next task once dispatch halts. An abort that trips the
/// breaker halts the whole session.
async fn run_track(
    orchestrator: Arc<TaskOrchestrator>,
    graph: Arc<RwLock<TaskGraph>>,
    breaker: Arc<CircuitBreaker>,
    halt: CancellationToken,
    track: TrackId,
    tasks: Vec<TaskId>,
) -> TrackRun {
    let mut outcomes = Vec::with_capacity(tasks.len());
    for task in tasks {
        if halt.is_cancelled() {
            clog_debug!("Track {} stopping before task {}", track.short(), task.short());
            break;
        }
        let outcome = orchestrator.drive(task, track, &graph).await;
        match &outcome {
            Ok(TaskOutcome::Passed { .. }) => breaker.record_success(),
            Ok(TaskOutcome::Aborted { .. }) => {
                if breaker.record_failure() {
                    halt.cancel();
                }
            }
            _ => {}
        }
        outcomes.push((task, outcome));
    }
    TrackRun { track, outcomes }
}
