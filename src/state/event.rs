//! Event types for the append-only session log.
//!
//! Every state change of a session is one [`Event`]. Task transitions carry
//! the `from` and `to` status; other events leave them empty.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::task::{ArtifactRef, Gap, Task, TaskId, TaskStatus, Tier};
use crate::orchestration::council::CouncilVerdict;
use crate::orchestration::track::TrackId;
use crate::session::SessionId;
use crate::state::replay::PauseReason;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Position in the log, starting at 1 and strictly increasing.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track_id: Option<TrackId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<TaskStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<TaskStatus>,
    pub payload: EventPayload,
}

impl Event {
    pub fn kind(&self) -> &'static str {
        self.payload.kind()
    }

    pub fn is_transition(&self) -> bool {
        self.to.is_some()
    }
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "#{} {} {}",
            self.seq,
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.kind()
        )?;
        if let Some(task) = self.task_id {
            write!(f, " task={}", task.short())?;
        }
        if let Some(track) = self.track_id {
            write!(f, " track={}", track.short())?;
        }
        match (self.from, self.to) {
            (Some(from), Some(to)) => write!(f, " {} -> {}", from, to),
            (None, Some(to)) => write!(f, " -> {}", to),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    SessionStarted {
        session_id: SessionId,
    },
    TaskAdded {
        task: Box<Task>,
    },
    DependencyAdded {
        from: TaskId,
        to: TaskId,
    },
    Dispatched {
        iteration: u32,
        tier: Tier,
        /// Outputs regenerated this iteration.
        outputs: Vec<String>,
    },
    ArtifactStaged {
        artifact: ArtifactRef,
    },
    ValidationStarted {
        iteration: u32,
    },
    Passed {
        iteration: u32,
    },
    ValidationFailed {
        iteration: u32,
        gaps: Vec<Gap>,
    },
    Escalated {
        from_tier: Option<Tier>,
        to_tier: Tier,
        to_council: bool,
    },
    CouncilDecided {
        verdict: Box<CouncilVerdict>,
    },
    GuidanceResolved {
        accepted: bool,
    },
    Aborted {
        iteration: u32,
        reason: String,
    },
    /// The task's track was discarded before it merged; its work starts
    /// over in a new track.
    Requeued {
        track: TrackId,
    },
    TrackOpened {
        name: String,
        tasks: Vec<TaskId>,
    },
    TrackMerged {
        revision: String,
    },
    TrackConflicted {
        paths: Vec<String>,
    },
    TrackDiscarded {
        forced: bool,
        items: Vec<String>,
    },
    SessionPaused {
        reason: PauseReason,
    },
    SessionResumed,
    SessionCompleted,
    SessionAbandoned,
}

impl EventPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            EventPayload::SessionStarted { .. } => "session_started",
            EventPayload::TaskAdded { .. } => "task_added",
            EventPayload::DependencyAdded { .. } => "dependency_added",
            EventPayload::Dispatched { .. } => "dispatched",
            EventPayload::ArtifactStaged { .. } => "artifact_staged",
            EventPayload::ValidationStarted { .. } => "validation_started",
            EventPayload::Passed { .. } => "passed",
            EventPayload::ValidationFailed { .. } => "validation_failed",
            EventPayload::Escalated { .. } => "escalated",
            EventPayload::CouncilDecided { .. } => "council_decided",
            EventPayload::GuidanceResolved { .. } => "guidance_resolved",
            EventPayload::Aborted { .. } => "aborted",
            EventPayload::Requeued { .. } => "requeued",
            EventPayload::TrackOpened { .. } => "track_opened",
            EventPayload::TrackMerged { .. } => "track_merged",
            EventPayload::TrackConflicted { .. } => "track_conflicted",
            EventPayload::TrackDiscarded { .. } => "track_discarded",
            EventPayload::SessionPaused { .. } => "session_paused",
            EventPayload::SessionResumed => "session_resumed",
            EventPayload::SessionCompleted => "session_completed",
            EventPayload::SessionAbandoned => "session_abandoned",
        }
    }
}

/// An event before the store assigns its sequence number and timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub task_id: Option<TaskId>,
    pub track_id: Option<TrackId>,
    pub from: Option<TaskStatus>,
    pub to: Option<TaskStatus>,
    pub payload: EventPayload,
}

impl NewEvent {
    pub fn session(payload: EventPayload) -> Self {
        Self {
            task_id: None,
            track_id: None,
            from: None,
            to: None,
            payload,
        }
    }

    pub fn task(
        task: TaskId,
        from: Option<TaskStatus>,
        to: Option<TaskStatus>,
        payload: EventPayload,
    ) -> Self {
        Self {
            task_id: Some(task),
            track_id: None,
            from,
            to,
            payload,
        }
    }

    pub fn track(track: TrackId, payload: EventPayload) -> Self {
        Self {
            track_id: Some(track),
            ..Self::session(payload)
        }
    }

    pub fn in_track(mut self, track: Option<TrackId>) -> Self {
        self.track_id = track;
        self
    }

    pub fn into_event(self, seq: u64, timestamp: DateTime<Utc>) -> Event {
        Event {
            seq,
            timestamp,
            task_id: self.task_id,
            track_id: self.track_id,
            from: self.from,
            to: self.to,
            payload: self.payload,
        }
    }
}
