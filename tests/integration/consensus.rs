//! Consensus council tests.
//!
//! A diagnosis task that keeps failing at the highest tier, or whose
//! worker is unsure of its answer, is handed to the council. The
//! ranked-choice verdict becomes guidance for the next dispatch.

use cadence::core::Tier;
use cadence::orchestration::ConsensusLevel;
use cadence::state::EventPayload;
use cadence::{Error, SessionStatus};

use crate::fixtures::*;

const TASK: &str = "flaky-login";

fn four_failures() -> std::sync::Arc<ScriptedGate> {
    ScriptedGate::failing(&[(TASK, 4, vec![gap("reproduction")])])
}

#[tokio::test]
async fn test_runoff_verdict_guides_next_dispatch() {
    let members = runoff_council();
    let harness = Harness::new(ScriptedWorker::new(), four_failures()).with_council(council_of(&members));
    let mut session = harness.start(DIAGNOSIS_PLAN, &test_config()).await;

    let report = session.run().await.unwrap();
    assert!(report.is_complete(), "{}", report);

    let seen = harness.worker.seen_for(TASK);
    let tiers: Vec<Tier> = seen.iter().map(|r| r.tier).collect();
    assert_eq!(
        tiers,
        vec![Tier::Fast, Tier::Standard, Tier::Advanced, Tier::Advanced, Tier::Advanced]
    );
    assert!(seen[..4].iter().all(|r| r.guidance.is_none()));
    assert_eq!(seen[4].guidance.as_deref(), Some("b diagnosis"));

    let graph = session.graph();
    let graph = graph.read().await;
    let task = graph.find_by_name(TASK).unwrap();
    let verdict = task.council.as_ref().unwrap();
    assert_eq!(verdict.winner.source, "b");
    assert_eq!(verdict.strength.level, ConsensusLevel::Strong);
    let eliminated: Vec<&str> = verdict
        .rounds
        .iter()
        .filter_map(|r| r.eliminated.as_deref())
        .collect();
    assert_eq!(eliminated, vec!["e", "d", "c"]);

    // Every member saw the full failure history.
    for member in &members {
        let briefs = member.briefs();
        assert_eq!(briefs.len(), 1);
        assert_eq!(briefs[0].gap_history.len(), 4);
    }

    let council_escalations = session
        .store()
        .task_log(&task.id)
        .unwrap()
        .iter()
        .filter(|e| matches!(e.payload, EventPayload::Escalated { to_council: true, .. }))
        .count();
    assert_eq!(council_escalations, 1);
}

#[tokio::test]
async fn test_weak_verdict_waits_for_confirmation() {
    let harness =
        Harness::new(ScriptedWorker::new(), four_failures()).with_council(council_of(&split_council()));
    let mut session = harness.start(DIAGNOSIS_PLAN, &test_config()).await;

    let report = session.run().await.unwrap();

    assert_eq!(report.status, SessionStatus::Running);
    assert!(report.passed.is_empty());
    assert_eq!(report.awaiting_confirmation.len(), 1);
    let audit = &report.awaiting_confirmation[0];
    assert_eq!(audit.name, TASK);
    assert_eq!(audit.verdict.winner.source, "w");
    assert_eq!(audit.verdict.strength.level, ConsensusLevel::Weak);
    assert!(matches!(
        report.blockers().as_slice(),
        [Error::WeakConsensus { .. }]
    ));
    assert_eq!(harness.worker.seen_for(TASK).len(), 4);

    // Running again without a decision dispatches nothing.
    let again = session.run().await.unwrap();
    assert_eq!(again.awaiting_confirmation.len(), 1);
    assert_eq!(harness.worker.seen_for(TASK).len(), 4);

    let id = session.graph().read().await.find_by_name(TASK).unwrap().id;
    session.confirm_consensus(&id, true).await.unwrap();
    let report = session.run().await.unwrap();

    assert!(report.is_complete(), "{}", report);
    let seen = harness.worker.seen_for(TASK);
    assert_eq!(seen.len(), 5);
    assert_eq!(seen[4].guidance.as_deref(), Some("w diagnosis"));
}

#[tokio::test]
async fn test_rejected_verdict_retries_without_guidance() {
    let harness =
        Harness::new(ScriptedWorker::new(), four_failures()).with_council(council_of(&split_council()));
    let mut session = harness.start(DIAGNOSIS_PLAN, &test_config()).await;
    session.run().await.unwrap();

    let id = session.graph().read().await.find_by_name(TASK).unwrap().id;
    session.confirm_consensus(&id, false).await.unwrap();
    let report = session.run().await.unwrap();

    assert!(report.is_complete(), "{}", report);
    let seen = harness.worker.seen_for(TASK);
    assert_eq!(seen[4].guidance, None);
    assert_eq!(seen[4].tier, Tier::Advanced);
}

#[tokio::test]
async fn test_without_council_diagnosis_keeps_retrying() {
    let harness = Harness::new(
        ScriptedWorker::new(),
        ScriptedGate::failing(&[(TASK, 5, vec![gap("reproduction")])]),
    );
    let mut session = harness.start(DIAGNOSIS_PLAN, &test_config()).await;

    let report = session.run().await.unwrap();

    assert!(report.is_complete(), "{}", report);
    assert_eq!(harness.worker.seen_for(TASK).len(), 6);
    let decided = session
        .store()
        .events()
        .unwrap()
        .iter()
        .filter(|e| e.kind() == "council_decided")
        .count();
    assert_eq!(decided, 0);
}

// ========== Low Confidence Tests ==========

#[tokio::test]
async fn test_low_confidence_consults_council_before_validation() {
    let members = runoff_council();
    let harness = Harness::new(ScriptedWorker::unsure(0.0), ScriptedGate::passing())
        .with_council(council_of(&members));
    let mut session = harness.start(DIAGNOSIS_PLAN, &test_config()).await;

    let report = session.run().await.unwrap();

    assert!(report.is_complete(), "{}", report);
    for member in &members {
        assert_eq!(member.briefs().len(), 1);
    }
    // The unsure first answer never reached the gate.
    assert_eq!(harness.gate.seen().len(), 1);
    assert_eq!(harness.gate.seen()[0].iteration, 2);

    let seen = harness.worker.seen_for(TASK);
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].guidance, None);
    assert_eq!(seen[1].guidance.as_deref(), Some("b diagnosis"));
    assert_eq!(seen[1].tier, Tier::Fast);

    let id = session.graph().read().await.find_by_name(TASK).unwrap().id;
    let kinds: Vec<&str> = session
        .store()
        .task_log(&id)
        .unwrap()
        .iter()
        .map(|e| e.kind())
        .collect();
    assert_eq!(
        kinds,
        vec![
            "dispatched",
            "artifact_staged",
            "escalated",
            "council_decided",
            "dispatched",
            "artifact_staged",
            "validation_started",
            "passed",
        ]
    );
}

#[tokio::test]
async fn test_confident_diagnosis_skips_council() {
    let members = runoff_council();
    let harness = Harness::new(ScriptedWorker::unsure(0.9), ScriptedGate::passing())
        .with_council(council_of(&members));
    let mut session = harness.start(DIAGNOSIS_PLAN, &test_config()).await;

    let report = session.run().await.unwrap();

    assert!(report.is_complete(), "{}", report);
    assert!(members.iter().all(|m| m.briefs().is_empty()));
    assert_eq!(harness.worker.seen_for(TASK).len(), 1);
}

#[tokio::test]
async fn test_low_confidence_implementation_is_validated_directly() {
    let members = runoff_council();
    let harness = Harness::new(ScriptedWorker::unsure(0.0), ScriptedGate::passing())
        .with_council(council_of(&members));
    let mut session = harness.start(DIAMOND_PLAN, &test_config()).await;

    let report = session.run().await.unwrap();

    assert!(report.is_complete(), "{}", report);
    assert!(members.iter().all(|m| m.briefs().is_empty()));
    assert_eq!(harness.worker.seen().len(), 3);
}
