//! Rebuilding session state from the event log.
//!
//! A [`SessionProjection`] is the fold of every event in the log. Applying
//! an event it has already seen (by sequence number) is a no-op, so
//! replaying the log from a checkpoint, or twice, yields the same state.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::core::task::{Task, TaskId, TaskStatus};
use crate::orchestration::track::Track;
use crate::session::SessionId;
use crate::state::event::{Event, EventPayload};
use crate::clog_debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Created,
    Running,
    Paused,
    Completed,
    Abandoned,
}

impl SessionStatus {
    pub fn is_closed(self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Abandoned)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionStatus::Created => "created",
            SessionStatus::Running => "running",
            SessionStatus::Paused => "paused",
            SessionStatus::Completed => "completed",
            SessionStatus::Abandoned => "abandoned",
        };
        f.write_str(s)
    }
}

/// Why dispatch was paused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PauseReason {
    CircuitBreaker { failures: u32 },
    Operator { note: String },
}

impl std::fmt::Display for PauseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PauseReason::CircuitBreaker { failures } => {
                write!(f, "circuit breaker tripped after {} consecutive failures", failures)
            }
            PauseReason::Operator { note } if note.is_empty() => write!(f, "paused by operator"),
            PauseReason::Operator { note } => write!(f, "paused by operator: {}", note),
        }
    }
}

/// Session-level lifecycle state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: Option<SessionId>,
    pub status: SessionStatus,
    pub pause_reason: Option<PauseReason>,
    /// Tasks aborted since the last pass or operator resume.
    #[serde(default)]
    pub consecutive_aborts: u32,
}

impl SessionState {
    pub fn apply(&mut self, event: &Event) {
        match &event.payload {
            EventPayload::SessionStarted { session_id } => {
                self.session_id = Some(*session_id);
                self.status = SessionStatus::Running;
            }
            EventPayload::SessionPaused { reason } => {
                self.status = SessionStatus::Paused;
                self.pause_reason = Some(reason.clone());
            }
            EventPayload::SessionResumed => {
                self.status = SessionStatus::Running;
                self.pause_reason = None;
                self.consecutive_aborts = 0;
            }
            EventPayload::SessionCompleted => self.status = SessionStatus::Completed,
            EventPayload::SessionAbandoned => self.status = SessionStatus::Abandoned,
            _ => {}
        }
        match event.to {
            Some(TaskStatus::Aborted) => self.consecutive_aborts += 1,
            Some(TaskStatus::Passed) => self.consecutive_aborts = 0,
            _ => {}
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionProjection {
    pub session: SessionState,
    pub tasks: BTreeMap<TaskId, Task>,
    pub dependencies: BTreeSet<(TaskId, TaskId)>,
    /// Tracks in creation order.
    pub tracks: Vec<Track>,
    pub last_seq: u64,
}

impl SessionProjection {
    /// Fold every event of a log into a fresh projection.
    pub fn replay<'a>(events: impl IntoIterator<Item = &'a Event>) -> Self {
        let mut projection = Self::default();
        projection.apply_all(events);
        projection
    }

    /// Continue from a checkpoint, applying only events it has not seen.
    pub fn resume<'a>(checkpoint: Option<Self>, events: impl IntoIterator<Item = &'a Event>) -> Self {
        let mut projection = checkpoint.unwrap_or_default();
        let from = projection.last_seq;
        let applied = projection.apply_all(events);
        clog_debug!(
            "Replayed {} events after seq {} (now at {})",
            applied,
            from,
            projection.last_seq
        );
        projection
    }

    /// Apply events in order; returns how many were new.
    pub fn apply_all<'a>(&mut self, events: impl IntoIterator<Item = &'a Event>) -> usize {
        events.into_iter().filter(|e| self.apply(e)).count()
    }

    /// Apply one event. Returns false if it was already applied.
    pub fn apply(&mut self, event: &Event) -> bool {
        if event.seq <= self.last_seq {
            return false;
        }

        match &event.payload {
            EventPayload::TaskAdded { task } => {
                self.tasks.insert(task.id, (**task).clone());
            }
            EventPayload::DependencyAdded { from, to } => {
                self.dependencies.insert((*from, *to));
                if let Some(task) = self.tasks.get_mut(to) {
                    task.dependencies.insert(*from);
                }
            }
            EventPayload::TrackOpened { .. } => {
                if let Some(track) = Track::opened(event) {
                    self.tracks.push(track);
                }
            }
            _ => {
                if let Some(id) = event.task_id {
                    if let Some(task) = self.tasks.get_mut(&id) {
                        task.apply(event);
                    }
                }
                if let Some(id) = event.track_id {
                    if let Some(track) = self.tracks.iter_mut().find(|t| t.id == id) {
                        track.apply(event);
                    }
                }
            }
        }

        self.session.apply(event);
        self.last_seq = event.seq;
        true
    }

    /// Tasks whose last iteration was cut off mid-flight.
    pub fn interrupted(&self) -> Vec<TaskId> {
        self.tasks
            .values()
            .filter(|t| matches!(t.status, TaskStatus::Dispatched | TaskStatus::Validating))
            .map(|t| t.id)
            .collect()
    }
}
