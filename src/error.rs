use thiserror::Error;

use crate::core::task::TaskId;
use crate::orchestration::track::TrackId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Cycle detected at task: {task}")]
    CycleDetected { task: String },

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Task {task} exceeded {iterations} iterations without passing validation")]
    MaxIterationsExceeded { task: TaskId, iterations: u32 },

    #[error("Circuit breaker tripped after {failures} consecutive task failures")]
    CircuitBreakerTripped { failures: u32 },

    #[error("Merge conflict in track {track}: {}", paths.join(", "))]
    MergeConflict { track: TrackId, paths: Vec<String> },

    #[error("Weak consensus ({score:.2}) for task {task} requires confirmation")]
    WeakConsensus { task: TaskId, score: f64 },

    #[error("No worker registered for {kind} at tier {tier}")]
    WorkerNotRegistered { kind: String, tier: String },

    #[error("Track not found: {0}")]
    TrackNotFound(TrackId),

    #[error("Track {track} has uncommitted work: {}", items.join(", "))]
    UncommittedWork { track: TrackId, items: Vec<String> },

    #[error("Track {track} is not ready to merge, unpassed tasks: {}", pending.join(", "))]
    TrackNotReady { track: TrackId, pending: Vec<String> },

    #[error("Task {task} already belongs to open track {track}")]
    TaskAlreadyTracked { task: TaskId, track: TrackId },

    #[error("Invalid ballot from {source_id}: {reason}")]
    InvalidBallot { source_id: String, reason: String },

    #[error("Invalid state key: {0}")]
    InvalidKey(String),

    #[error("Invalid transition for task {task} from {from} to {to}")]
    InvalidTransition {
        task: TaskId,
        from: String,
        to: String,
    },

    #[error("Session is paused: {0}")]
    SessionPaused(String),

    #[error("Session is closed: {0}")]
    SessionClosed(String),

    #[error("Worker failed: {0}")]
    Worker(String),
}

pub type Result<T> = std::result::Result<T, Error>;
