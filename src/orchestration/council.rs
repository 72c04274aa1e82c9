//! Consensus council for tasks that keep failing at the highest tier.
//!
//! Each member proposes a diagnosis with a confidence, then ranks every
//! proposal. The rankings are tallied by instant runoff:
//!
//! 1. Count each ballot for its highest-ranked surviving proposal.
//! 2. A proposal holding a strict majority of counted ballots wins.
//! 3. Otherwise the proposal with the fewest votes is eliminated (ties go
//!    to the lower confidence, then the lowest proposer id) and its
//!    ballots transfer.
//!
//! Consensus strength is the share of ballots ranking the winner in their
//! top two.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::time::timeout;

use crate::core::task::{GapRecord, Task, TaskId, TaskKind};
use crate::{clog, clog_debug, clog_warn, Error, Result};

pub const STRONG_THRESHOLD: f64 = 0.6;
pub const MODERATE_THRESHOLD: f64 = 0.4;

/// What the council is asked to diagnose.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosisBrief {
    pub task_id: TaskId,
    pub task_name: String,
    pub kind: TaskKind,
    pub description: String,
    pub gap_history: Vec<GapRecord>,
    pub guidance: Option<String>,
}

impl DiagnosisBrief {
    pub fn for_task(task: &Task) -> Self {
        Self {
            task_id: task.id,
            task_name: task.name.clone(),
            kind: task.kind,
            description: task.description.clone(),
            gap_history: task.gap_history.clone(),
            guidance: task.guidance.clone(),
        }
    }
}

/// A member's proposal before it is attributed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Draft {
    pub diagnosis: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub source: String,
    pub diagnosis: String,
    pub confidence: f64,
}

/// What a member returns when asked to rank.
///
/// `confidence` holds the member's own score for any proposals it chose to
/// rate; unrated proposals are left out.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ranking {
    pub order: Vec<String>,
    #[serde(default)]
    pub confidence: BTreeMap<String, f64>,
}

impl From<Vec<String>> for Ranking {
    fn from(order: Vec<String>) -> Self {
        Self {
            order,
            confidence: BTreeMap::new(),
        }
    }
}

/// One member's full ranking over all proposals, best first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ballot {
    pub voter: String,
    pub ranking: Vec<String>,
    #[serde(default)]
    pub confidence: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TallyRound {
    pub round: usize,
    pub counts: BTreeMap<String, usize>,
    pub eliminated: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusLevel {
    Strong,
    Moderate,
    Weak,
}

impl ConsensusLevel {
    pub fn from_score(score: f64) -> Self {
        if score >= STRONG_THRESHOLD {
            ConsensusLevel::Strong
        } else if score >= MODERATE_THRESHOLD {
            ConsensusLevel::Moderate
        } else {
            ConsensusLevel::Weak
        }
    }
}

impl std::fmt::Display for ConsensusLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConsensusLevel::Strong => write!(f, "strong"),
            ConsensusLevel::Moderate => write!(f, "moderate"),
            ConsensusLevel::Weak => write!(f, "weak"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConsensusStrength {
    pub score: f64,
    pub level: ConsensusLevel,
}

/// The winning proposal with the full ballot record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CouncilVerdict {
    pub winner: Proposal,
    pub strength: ConsensusStrength,
    pub proposals: Vec<Proposal>,
    pub ballots: Vec<Ballot>,
    pub rounds: Vec<TallyRound>,
}

impl CouncilVerdict {
    /// Weak results are recommendations an operator must confirm.
    pub fn requires_confirmation(&self) -> bool {
        self.strength.level == ConsensusLevel::Weak
    }
}

/// A council member.
#[async_trait]
pub trait Councillor: Send + Sync {
    fn id(&self) -> &str;

    async fn propose(&self, brief: &DiagnosisBrief) -> Result<Draft>;

    /// Rank every proposal by source id, best first.
    async fn rank(&self, brief: &DiagnosisBrief, proposals: &[Proposal]) -> Result<Ranking>;
}

fn validate_ballot(ballot: &Ballot, candidates: &BTreeSet<&str>) -> Result<()> {
    let ranked: BTreeSet<&str> = ballot.ranking.iter().map(String::as_str).collect();
    if ranked.len() != ballot.ranking.len() {
        return Err(Error::InvalidBallot {
            source_id: ballot.voter.clone(),
            reason: "ranking lists a proposal twice".into(),
        });
    }
    if &ranked != candidates {
        return Err(Error::InvalidBallot {
            source_id: ballot.voter.clone(),
            reason: "ranking must cover every proposal exactly once".into(),
        });
    }
    Ok(())
}

/// Each proposal's confidence averaged over every proposer that scored it.
///
/// A proposal's author always scores it with the confidence it was
/// submitted with; other voters count only when their ballot rates it.
fn mean_confidence<'a>(proposals: &'a [Proposal], ballots: &[Ballot]) -> BTreeMap<&'a str, f64> {
    proposals
        .iter()
        .map(|p| {
            let mut sum = p.confidence.clamp(0.0, 1.0);
            let mut n = 1usize;
            for ballot in ballots.iter().filter(|b| b.voter != p.source) {
                if let Some(score) = ballot.confidence.get(&p.source) {
                    sum += score.clamp(0.0, 1.0);
                    n += 1;
                }
            }
            (p.source.as_str(), sum / n as f64)
        })
        .collect()
}

/// Instant-runoff tally over full rankings.
///
/// Pure and deterministic: the same proposals and ballots always produce
/// the same verdict.
pub fn tally(proposals: &[Proposal], ballots: &[Ballot]) -> Result<CouncilVerdict> {
    let mut proposals = proposals.to_vec();
    proposals.sort_by(|a, b| a.source.cmp(&b.source));

    let candidates: BTreeSet<&str> = proposals.iter().map(|p| p.source.as_str()).collect();
    if candidates.is_empty() {
        return Err(Error::Validation("council tally needs at least one proposal".into()));
    }
    if candidates.len() != proposals.len() {
        return Err(Error::Validation("council proposals must have unique sources".into()));
    }
    if ballots.is_empty() {
        return Err(Error::Validation("council tally needs at least one ballot".into()));
    }
    for ballot in ballots {
        validate_ballot(ballot, &candidates)?;
    }

    let confidence = mean_confidence(&proposals, ballots);

    let mut remaining = candidates.clone();
    let mut rounds = Vec::new();
    let winner = loop {
        let mut counts: BTreeMap<&str, usize> = remaining.iter().map(|c| (*c, 0)).collect();
        let mut counted = 0;
        for ballot in ballots {
            if let Some(top) = ballot
                .ranking
                .iter()
                .find(|c| remaining.contains(c.as_str()))
            {
                if let Some(n) = counts.get_mut(top.as_str()) {
                    *n += 1;
                }
                counted += 1;
            }
        }

        let leader = counts
            .iter()
            .find(|(_, &n)| 2 * n > counted)
            .map(|(c, _)| *c);
        let round_counts = counts.iter().map(|(c, n)| (c.to_string(), *n)).collect();

        if let Some(leader) = leader.or_else(|| {
            if remaining.len() == 1 {
                remaining.iter().next().copied()
            } else {
                None
            }
        }) {
            rounds.push(TallyRound {
                round: rounds.len() + 1,
                counts: round_counts,
                eliminated: None,
            });
            break leader.to_string();
        }

        let loser = counts
            .iter()
            .min_by(|(a, na), (b, nb)| {
                na.cmp(nb)
                    .then_with(|| {
                        let ca = confidence.get(*a).copied().unwrap_or(0.0);
                        let cb = confidence.get(*b).copied().unwrap_or(0.0);
                        ca.total_cmp(&cb)
                    })
                    .then_with(|| a.cmp(b))
            })
            .map(|(c, _)| *c)
            .ok_or_else(|| Error::Validation("council tally ran out of candidates".into()))?;

        clog_debug!("Council round {}: eliminating {}", rounds.len() + 1, loser);
        rounds.push(TallyRound {
            round: rounds.len() + 1,
            counts: round_counts,
            eliminated: Some(loser.to_string()),
        });
        remaining.remove(loser);
    };

    let top_two = ballots
        .iter()
        .filter(|b| b.ranking.iter().take(2).any(|c| *c == winner))
        .count();
    let score = top_two as f64 / ballots.len() as f64;
    let strength = ConsensusStrength {
        score,
        level: ConsensusLevel::from_score(score),
    };

    let winner = proposals
        .iter()
        .find(|p| p.source == winner)
        .cloned()
        .ok_or_else(|| Error::Validation("council winner is not a proposal".into()))?;

    Ok(CouncilVerdict {
        winner,
        strength,
        proposals,
        ballots: ballots.to_vec(),
        rounds,
    })
}

/// Convenes the council members concurrently and tallies their ballots.
pub struct ConsensusCouncil {
    members: Vec<Arc<dyn Councillor>>,
    timeout: Duration,
}

impl ConsensusCouncil {
    pub fn new(members: Vec<Arc<dyn Councillor>>, timeout: Duration) -> Result<Self> {
        if members.is_empty() {
            return Err(Error::Config("council needs at least one member".into()));
        }
        let mut seen = HashSet::new();
        for member in &members {
            if !seen.insert(member.id().to_string()) {
                return Err(Error::Config(format!("duplicate council member: {}", member.id())));
            }
        }
        Ok(Self { members, timeout })
    }

    pub fn size(&self) -> usize {
        self.members.len()
    }

    pub fn member_ids(&self) -> Vec<String> {
        self.members.iter().map(|m| m.id().to_string()).collect()
    }

    /// Solicit proposals, then rankings, then tally.
    ///
    /// Members that fail or time out are left out of the phase they failed
    /// in. Invalid rankings are dropped with a warning.
    pub async fn convene(&self, brief: &DiagnosisBrief) -> Result<CouncilVerdict> {
        clog!(
            "Convening council of {} for task {}",
            self.members.len(),
            brief.task_name
        );

        let drafts = join_all(
            self.members
                .iter()
                .map(|m| async move { (m, timeout(self.timeout, m.propose(brief)).await) }),
        )
        .await;

        let mut proposals = Vec::new();
        let mut voters = Vec::new();
        for (member, result) in drafts {
            match result {
                Ok(Ok(draft)) => {
                    let confidence = if draft.confidence.is_nan() {
                        0.0
                    } else {
                        draft.confidence.clamp(0.0, 1.0)
                    };
                    proposals.push(Proposal {
                        source: member.id().to_string(),
                        diagnosis: draft.diagnosis,
                        confidence,
                    });
                    voters.push(member);
                }
                Ok(Err(e)) => clog_warn!("Council member {} failed to propose: {}", member.id(), e),
                Err(_) => clog_warn!("Council member {} timed out proposing", member.id()),
            }
        }
        if proposals.is_empty() {
            return Err(Error::Worker("council produced no proposals".into()));
        }
        proposals.sort_by(|a, b| a.source.cmp(&b.source));

        let candidates: BTreeSet<&str> = proposals.iter().map(|p| p.source.as_str()).collect();
        let rankings = join_all(voters.iter().map(|m| {
            let proposals = &proposals;
            async move { (*m, timeout(self.timeout, m.rank(brief, proposals)).await) }
        }))
        .await;

        let mut ballots = Vec::new();
        for (member, result) in rankings {
            let ranking: Ranking = match result {
                Ok(Ok(ranking)) => ranking,
                Ok(Err(e)) => {
                    clog_warn!("Council member {} failed to rank: {}", member.id(), e);
                    continue;
                }
                Err(_) => {
                    clog_warn!("Council member {} timed out ranking", member.id());
                    continue;
                }
            };
            let ballot = Ballot {
                voter: member.id().to_string(),
                ranking: ranking.order,
                confidence: ranking.confidence,
            };
            match validate_ballot(&ballot, &candidates) {
                Ok(()) => ballots.push(ballot),
                Err(e) => clog_warn!("Dropping ballot: {}", e),
            }
        }
        if ballots.is_empty() {
            return Err(Error::Worker("council produced no valid ballots".into()));
        }

        let verdict = tally(&proposals, &ballots)?;
        clog!(
            "Council verdict for {}: {} ({} consensus, {:.2})",
            brief.task_name,
            verdict.winner.source,
            verdict.strength.level,
            verdict.strength.score
        );
        Ok(verdict)
    }
}
