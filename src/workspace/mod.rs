//! Isolated workspaces for tracks.
//!
//! Each track stages its artifacts in its own workspace, forked from the
//! shared integration tree. Nothing a track writes is visible to other
//! tracks until the track is merged.

mod git;
mod memory;

pub use git::GitWorkspace;
pub use memory::MemoryWorkspace;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::orchestration::track::TrackId;
use crate::Result;

/// Content produced by a worker for one output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Path relative to the workspace root.
    pub path: String,
    pub content: String,
}

impl Artifact {
    pub fn new(path: &str, content: &str) -> Self {
        Self {
            path: path.to_string(),
            content: content.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MergeOutcome {
    Merged { revision: String },
    Conflict { paths: Vec<String> },
}

/// Storage for track workspaces and the shared integration tree.
///
/// Methods are synchronous; async callers run them through
/// [`crate::util::blocking`].
pub trait WorkspaceBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Create the workspace for a track, or reattach to an existing one.
    ///
    /// Returns the on-disk root when the backend has one.
    fn open(&self, track: &TrackId, name: &str) -> Result<Option<PathBuf>>;

    /// On-disk root of an open track workspace.
    fn path(&self, track: &TrackId) -> Option<PathBuf>;

    /// Write an artifact into the track workspace without committing it.
    fn stage(&self, track: &TrackId, artifact: &Artifact) -> Result<()>;

    /// Record all staged artifacts of the track.
    fn commit(&self, track: &TrackId, message: &str) -> Result<()>;

    /// Paths staged but not yet committed.
    fn uncommitted(&self, track: &TrackId) -> Result<Vec<String>>;

    /// Integrate committed work into the shared tree.
    fn merge(&self, track: &TrackId) -> Result<MergeOutcome>;

    /// Settle a conflicted merge in the track's favor.
    ///
    /// Pending edits in the workspace are committed, then the current
    /// shared tree is folded in underneath so the next merge applies
    /// cleanly. Paths the operator fixed by hand keep their fixed content.
    fn resolve(&self, track: &TrackId) -> Result<()>;

    /// Drop the workspace and everything staged in it.
    fn discard(&self, track: &TrackId) -> Result<()>;

    /// Read a file as the track currently sees it.
    fn read(&self, track: &TrackId, path: &str) -> Result<Option<String>>;

    /// Read a file from the shared integration tree.
    fn read_shared(&self, path: &str) -> Result<Option<String>>;
}
