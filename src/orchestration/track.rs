//! Tracks: groups of tasks that share one isolated workspace.
//!
//! A track is opened over a set of tasks, collects their artifacts in its
//! own workspace, and is merged into the shared tree once every task in it
//! has passed. Merges are applied one track at a time.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::dag::TaskGraph;
use crate::core::task::{TaskId, TaskStatus};
use crate::state::event::{Event, EventPayload, NewEvent};
use crate::state::store::StateStore;
use crate::util::blocking;
use crate::workspace::{MergeOutcome, WorkspaceBackend};
use crate::{clog, clog_debug, clog_warn, Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackId(pub Uuid);

impl TrackId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TrackId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TrackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TrackId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(TrackId)
            .map_err(|e| Error::Validation(format!("invalid track id '{}': {}", s, e)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TrackState {
    Open,
    Merged { revision: String },
    Conflicted { paths: Vec<String> },
    Discarded,
}

impl TrackState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackState::Open => "open",
            TrackState::Merged { .. } => "merged",
            TrackState::Conflicted { .. } => "conflicted",
            TrackState::Discarded => "discarded",
        }
    }
}

impl std::fmt::Display for TrackState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub id: TrackId,
    pub name: String,
    /// Member tasks in execution order.
    pub tasks: Vec<TaskId>,
    pub state: TrackState,
    pub opened_at: DateTime<Utc>,
}

impl Track {
    /// Build a track from its `TrackOpened` event.
    pub fn opened(event: &Event) -> Option<Track> {
        match (&event.payload, event.track_id) {
            (EventPayload::TrackOpened { name, tasks }, Some(id)) => Some(Track {
                id,
                name: name.clone(),
                tasks: tasks.clone(),
                state: TrackState::Open,
                opened_at: event.timestamp,
            }),
            _ => None,
        }
    }

    pub fn apply(&mut self, event: &Event) {
        if event.track_id != Some(self.id) {
            return;
        }
        match &event.payload {
            EventPayload::TrackMerged { revision } => {
                self.state = TrackState::Merged {
                    revision: revision.clone(),
                }
            }
            EventPayload::TrackConflicted { paths } => {
                self.state = TrackState::Conflicted {
                    paths: paths.clone(),
                }
            }
            EventPayload::TrackDiscarded { .. } => self.state = TrackState::Discarded,
            _ => {}
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == TrackState::Open
    }

    pub fn is_merged(&self) -> bool {
        matches!(self.state, TrackState::Merged { .. })
    }

    /// Open or conflicted: the workspace still exists.
    pub fn is_live(&self) -> bool {
        matches!(self.state, TrackState::Open | TrackState::Conflicted { .. })
    }

    pub fn contains(&self, task: &TaskId) -> bool {
        self.tasks.contains(task)
    }
}

/// Creates, merges, and cleans up tracks against a workspace backend.
///
/// Every lifecycle change is logged to the state store before the
/// in-memory track list is updated.
pub struct TrackManager {
    backend: Arc<dyn WorkspaceBackend>,
    store: Arc<StateStore>,
    tracks: Vec<Track>,
}

impl TrackManager {
    pub fn new(backend: Arc<dyn WorkspaceBackend>, store: Arc<StateStore>) -> Self {
        Self {
            backend,
            store,
            tracks: Vec::new(),
        }
    }

    /// Rebuild from replayed tracks, reattaching every live workspace.
    pub async fn restore(
        backend: Arc<dyn WorkspaceBackend>,
        store: Arc<StateStore>,
        tracks: Vec<Track>,
    ) -> Result<Self> {
        for track in tracks.iter().filter(|t| t.is_live()) {
            let backend = Arc::clone(&backend);
            let (id, name) = (track.id, track.name.clone());
            blocking(move || backend.open(&id, &name)).await?;
            clog_debug!("Reattached track {} ({})", track.name, track.id.short());
        }
        Ok(Self {
            backend,
            store,
            tracks,
        })
    }

    pub fn backend(&self) -> Arc<dyn WorkspaceBackend> {
        Arc::clone(&self.backend)
    }

    /// All tracks in creation order.
    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn get(&self, id: &TrackId) -> Result<&Track> {
        self.tracks
            .iter()
            .find(|t| t.id == *id)
            .ok_or(Error::TrackNotFound(*id))
    }

    pub fn open_tracks(&self) -> Vec<&Track> {
        self.tracks.iter().filter(|t| t.is_open()).collect()
    }

    /// The live track a task currently belongs to.
    pub fn track_for_task(&self, task: &TaskId) -> Option<&Track> {
        self.tracks
            .iter()
            .filter(|t| t.is_live())
            .find(|t| t.contains(task))
    }

    /// Passed tasks whose track has been merged.
    pub fn integrated(&self, graph: &TaskGraph) -> HashSet<TaskId> {
        self.tracks
            .iter()
            .filter(|t| t.is_merged())
            .flat_map(|t| t.tasks.iter())
            .filter(|id| {
                graph
                    .get_task(id)
                    .is_some_and(|task| task.status == TaskStatus::Passed)
            })
            .copied()
            .collect()
    }

    fn record(&mut self, id: TrackId, payload: EventPayload) -> Result<Event> {
        let event = self.store.append(NewEvent::track(id, payload))?;
        if let Some(track) = self.tracks.iter_mut().find(|t| t.id == id) {
            track.apply(&event);
        }
        Ok(event)
    }

    /// Open a new track over `tasks` with a fresh workspace.
    pub async fn create_track(&mut self, name: &str, tasks: Vec<TaskId>) -> Result<TrackId> {
        for task in &tasks {
            if let Some(existing) = self.track_for_task(task) {
                return Err(Error::TaskAlreadyTracked {
                    task: *task,
                    track: existing.id,
                });
            }
        }

        let id = TrackId::new();
        let backend = Arc::clone(&self.backend);
        let track_name = name.to_string();
        blocking(move || backend.open(&id, &track_name)).await?;

        let event = self.store.append(NewEvent::track(
            id,
            EventPayload::TrackOpened {
                name: name.to_string(),
                tasks,
            },
        ))?;
        if let Some(track) = Track::opened(&event) {
            clog!(
                "Opened track {} ({}) with {} task(s) on {} workspace",
                track.name,
                id.short(),
                track.tasks.len(),
                self.backend.name()
            );
            self.tracks.push(track);
        }
        Ok(id)
    }

    /// Merge a track whose tasks have all passed.
    ///
    /// A conflict leaves the shared tree untouched, marks the track
    /// conflicted, and returns `MergeConflict`.
    pub async fn merge_track(&mut self, id: &TrackId, graph: &TaskGraph) -> Result<String> {
        let track = self.get(id)?;
        if !track.is_live() {
            return Err(Error::Validation(format!(
                "track {} is {} and cannot be merged",
                track.name, track.state
            )));
        }
        let pending: Vec<String> = track
            .tasks
            .iter()
            .filter_map(|t| graph.get_task(t))
            .filter(|t| t.status != TaskStatus::Passed)
            .map(|t| t.name.clone())
            .collect();
        if !pending.is_empty() {
            return Err(Error::TrackNotReady {
                track: *id,
                pending,
            });
        }

        let backend = Arc::clone(&self.backend);
        let track_id = *id;
        let outcome = blocking(move || backend.merge(&track_id)).await?;
        match outcome {
            MergeOutcome::Merged { revision } => {
                self.record(
                    *id,
                    EventPayload::TrackMerged {
                        revision: revision.clone(),
                    },
                )?;
                clog!("Merged track {} at {}", id.short(), revision);
                Ok(revision)
            }
            MergeOutcome::Conflict { paths } => {
                self.record(
                    *id,
                    EventPayload::TrackConflicted {
                        paths: paths.clone(),
                    },
                )?;
                clog_warn!("Track {} conflicts on {}", id.short(), paths.join(", "));
                Err(Error::MergeConflict { track: *id, paths })
            }
        }
    }

    /// Settle a conflicted track in its own favor and merge it again.
    ///
    /// With the git backend the operator fixes the conflicting files in the
    /// track's worktree first; whatever the worktree holds is what merges.
    pub async fn resolve_track(&mut self, id: &TrackId, graph: &TaskGraph) -> Result<String> {
        let track = self.get(id)?;
        if !matches!(track.state, TrackState::Conflicted { .. }) {
            return Err(Error::Validation(format!(
                "track {} is {} and has no conflict to resolve",
                track.name, track.state
            )));
        }

        let backend = Arc::clone(&self.backend);
        let track_id = *id;
        blocking(move || backend.resolve(&track_id)).await?;
        clog!("Resolved conflicts on track {}", id.short());
        self.merge_track(id, graph).await
    }

    /// Merge, in creation order, every open track whose tasks have all passed.
    pub async fn merge_ready(&mut self, graph: &TaskGraph) -> Vec<(TrackId, Result<String>)> {
        let ready: Vec<TrackId> = self
            .tracks
            .iter()
            .filter(|t| t.is_open())
            .filter(|t| {
                t.tasks.iter().all(|id| {
                    graph
                        .get_task(id)
                        .is_some_and(|task| task.status == TaskStatus::Passed)
                })
            })
            .map(|t| t.id)
            .collect();

        let mut results = Vec::new();
        for id in ready {
            let result = self.merge_track(&id, graph).await;
            results.push((id, result));
        }
        results
    }

    /// Discard a track's workspace.
    ///
    /// Uncommitted work is reported as `UncommittedWork` unless `force` is
    /// set. Returns the items that were discarded.
    pub async fn cleanup_track(&mut self, id: &TrackId, force: bool) -> Result<Vec<String>> {
        let track = self.get(id)?;
        if !track.is_live() {
            return Err(Error::Validation(format!(
                "track {} is already {}",
                track.name, track.state
            )));
        }

        let backend = Arc::clone(&self.backend);
        let track_id = *id;
        let items = blocking(move || backend.uncommitted(&track_id)).await?;
        if !items.is_empty() && !force {
            return Err(Error::UncommittedWork { track: *id, items });
        }

        let backend = Arc::clone(&self.backend);
        blocking(move || backend.discard(&track_id)).await?;
        self.record(
            *id,
            EventPayload::TrackDiscarded {
                forced: force,
                items: items.clone(),
            },
        )?;
        let track = self.get(id)?;
        clog!(
            "Discarded track {} ({} uncommitted item(s))",
            track.name,
            items.len()
        );
        Ok(items)
    }
}
