//! Integration test suite for cadence.
//!
//! These tests drive whole sessions from plan to report with scripted
//! workers, validation gates, and council members. They verify that the
//! scheduler, task loop, tracks, council, and event log work together.
//!
//! # Test Categories
//!
//! - `workflow_e2e`: Plans running to completion, re-execution, escalation
//! - `parallel_tracks`: Track grouping and the parallelism bound
//! - `consensus`: Council convening, runoffs, weak verdicts
//! - `conflict_resolution`: Merge conflicts and track cleanup
//! - `recovery`: Circuit breaker, pause, resume, and replay
//!
//! # CI Compatibility
//!
//! No test launches an external worker; git tests use temporary
//! repositories.

mod fixtures;

mod conflict_resolution;
mod consensus;
mod parallel_tracks;
mod recovery;
mod workflow_e2e;
