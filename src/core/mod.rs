//! Core domain models for orchestration.
//!
//! This module contains the task model, the dependency graph, and the
//! TOML plan format that seeds a session.

pub mod dag;
pub mod plan;
pub mod task;

pub use dag::TaskGraph;
pub use plan::{Plan, TaskSpec};
pub use task::{
    ArtifactRef, Complexity, Criterion, Gap, GapRecord, OutputSpec, Task, TaskId, TaskKind,
    TaskStatus, Tier,
};
