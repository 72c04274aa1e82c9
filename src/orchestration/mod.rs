//! Orchestration layer for cadence sessions.
//!
//! This module drives tasks through dispatch and validation, escalates
//! them across capability tiers, convenes the consensus council for
//! stubborn diagnostic work, and runs independent task groups in parallel
//! tracks with isolated workspaces.

pub mod breaker;
pub mod command;
pub mod council;
pub mod escalation;
pub mod registry;
pub mod scheduler;
pub mod task_loop;
pub mod track;
pub mod validation;

pub use breaker::CircuitBreaker;
pub use council::{ConsensusCouncil, ConsensusLevel, Councillor, CouncilVerdict, DiagnosisBrief, Draft, Proposal, Ranking};
pub use escalation::{EscalationPolicy, TierDecision, TierInput};
pub use registry::{CapabilityRegistry, CapabilityWorker, WorkOutput, WorkRequest, WorkerFailure};
pub use scheduler::{assign_tracks, Sprint, SprintScheduler};
pub use task_loop::{TaskOrchestrator, TaskOutcome};
pub use track::{Track, TrackId, TrackManager, TrackState};
pub use validation::{PresenceGate, ValidationGate, ValidationRequest, Verdict};
