//! Tier escalation policies.
//!
//! A task starts at the floor tier for its complexity and only ever moves
//! up. Diagnostic tasks escalate faster and end at the consensus council
//! once the highest tier keeps failing.

use crate::core::task::{Complexity, Task, TaskKind, Tier};

/// Failures at one tier before a standard task moves up.
pub const STANDARD_FAILURES_PER_TIER: u32 = 2;

/// Failures at the highest tier before a diagnostic task goes to council.
pub const COUNCIL_AFTER_FAILURES: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierInput {
    pub current: Option<Tier>,
    pub failures_at_tier: u32,
    pub complexity: Complexity,
}

impl TierInput {
    pub fn for_task(task: &Task) -> Self {
        Self {
            current: task.tier,
            failures_at_tier: task.failures_at_tier,
            complexity: task.complexity,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierDecision {
    Dispatch(Tier),
    Council,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationPolicy {
    Standard,
    Diagnostic,
}

impl EscalationPolicy {
    pub fn for_kind(kind: TaskKind) -> Self {
        match kind {
            TaskKind::Diagnosis => EscalationPolicy::Diagnostic,
            _ => EscalationPolicy::Standard,
        }
    }

    /// Tier (or council) for the next dispatch.
    pub fn decide(self, input: TierInput) -> TierDecision {
        let floor = input.complexity.floor_tier();
        let current = input.current.map_or(floor, |t| t.max(floor));

        match self {
            EscalationPolicy::Standard => {
                if input.failures_at_tier >= STANDARD_FAILURES_PER_TIER && current < Tier::HIGHEST {
                    TierDecision::Dispatch(current.next())
                } else {
                    TierDecision::Dispatch(current)
                }
            }
            EscalationPolicy::Diagnostic => {
                if current < Tier::HIGHEST {
                    if input.failures_at_tier >= 1 {
                        TierDecision::Dispatch(current.next())
                    } else {
                        TierDecision::Dispatch(current)
                    }
                } else if input.failures_at_tier >= COUNCIL_AFTER_FAILURES {
                    TierDecision::Council
                } else {
                    TierDecision::Dispatch(current)
                }
            }
        }
    }
}
