//! End-to-end workflow tests.
//!
//! Plans run from start to a completed session through the real
//! scheduler, task loop, and track merges.

use cadence::core::{Plan, TaskStatus, Tier};
use cadence::state::EventPayload;
use cadence::{Error, Session, SessionId, SessionStatus, StateStore};

use crate::fixtures::*;

// ========== Pass-through Tests ==========

#[tokio::test]
async fn test_diamond_plan_runs_to_completion() {
    let harness = Harness::new(ScriptedWorker::new(), ScriptedGate::passing());
    let mut session = harness.start(DIAMOND_PLAN, &test_config()).await;

    let batches: Vec<Vec<String>> = {
        let graph = session.graph();
        let graph = graph.read().await;
        graph
            .topological_batches()
            .unwrap()
            .iter()
            .map(|batch| {
                batch
                    .iter()
                    .map(|id| graph.get_task(id).unwrap().name.clone())
                    .collect()
            })
            .collect()
    };
    assert_eq!(batches, vec![vec!["a", "b"], vec!["c"]]);

    let report = session.run().await.unwrap();

    assert!(report.is_complete(), "{}", report);
    assert_eq!(report.passed, vec!["a", "b", "c"]);
    assert!(report.aborted.is_empty());
    assert!(report.errors.is_empty());

    // c is validated only after both of its dependencies merged.
    let validated = harness.gate.validated_tasks();
    assert_eq!(validated.len(), 3);
    assert_eq!(validated[2], "c");

    for name in ["a", "b", "c"] {
        let id = session.graph().read().await.find_by_name(name).unwrap().id;
        let kinds: Vec<_> = session
            .store()
            .task_log(&id)
            .unwrap()
            .iter()
            .filter(|e| e.is_transition() || e.kind() == "artifact_staged")
            .map(|e| e.kind())
            .collect();
        assert_eq!(
            kinds,
            vec!["dispatched", "artifact_staged", "validation_started", "passed"],
            "task {}",
            name
        );
        assert!(harness
            .workspace
            .read_shared(&format!("{}/main.txt", name))
            .unwrap()
            .is_some());
    }

    let events = session.store().events().unwrap();
    assert!(matches!(
        events.last().map(|e| &e.payload),
        Some(EventPayload::SessionCompleted)
    ));
    assert_eq!(session.status(), SessionStatus::Completed);
}

#[tokio::test]
async fn test_completed_session_refuses_more_work() {
    let harness = Harness::new(ScriptedWorker::new(), ScriptedGate::passing());
    let mut session = harness.start(DIAMOND_PLAN, &test_config()).await;
    session.run().await.unwrap();

    assert!(matches!(session.run().await, Err(Error::SessionClosed(_))));
    assert!(matches!(session.pause("late"), Err(Error::SessionClosed(_))));
}

#[tokio::test]
async fn test_cyclic_plan_logs_nothing() {
    let plan = Plan::from_toml(
        r#"
        [[task]]
        name = "x"
        kind = "design"
        dependencies = ["z"]

        [[task]]
        name = "y"
        kind = "design"
        dependencies = ["x"]

        [[task]]
        name = "z"
        kind = "design"
        dependencies = ["y"]
    "#,
    )
    .unwrap();
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new(ScriptedWorker::new(), ScriptedGate::passing());

    let result = Session::start(
        SessionId::new(),
        &plan,
        harness.collaborators(),
        &test_config(),
        StateStore::open(dir.path()).unwrap(),
    )
    .await;

    assert!(matches!(result, Err(Error::CycleDetected { .. })));
    assert!(StateStore::open(dir.path()).unwrap().events().unwrap().is_empty());
}

// ========== Re-execution Tests ==========

#[tokio::test]
async fn test_only_implicated_output_is_redispatched() {
    let harness = Harness::new(
        ScriptedWorker::new(),
        ScriptedGate::failing(&[("api", 2, vec![gap("errors")])]),
    );
    let mut session = harness.start(LAYERED_PLAN, &test_config()).await;

    let report = session.run().await.unwrap();
    assert!(report.is_complete(), "{}", report);

    let calls: Vec<(u32, String, Tier)> = harness
        .worker
        .seen_for("api")
        .into_iter()
        .map(|r| (r.iteration, r.output, r.tier))
        .collect();
    assert_eq!(
        calls,
        vec![
            (1, "handlers".to_string(), Tier::Fast),
            (1, "error_handling".to_string(), Tier::Fast),
            (1, "tests".to_string(), Tier::Fast),
            (2, "error_handling".to_string(), Tier::Fast),
            (3, "error_handling".to_string(), Tier::Standard),
        ]
    );

    let graph = session.graph();
    let graph = graph.read().await;
    let api = graph.find_by_name("api").unwrap();
    assert_eq!(api.status, TaskStatus::Passed);
    assert_eq!(api.iteration, 3);
    assert_eq!(api.tier, Some(Tier::Standard));
    assert_eq!(api.artifacts["handlers"].iteration, 1);
    assert_eq!(api.artifacts["tests"].iteration, 1);
    assert_eq!(api.artifacts["error_handling"].iteration, 3);
    assert_eq!(api.gap_history.len(), 2);

    let escalations: Vec<_> = session
        .store()
        .task_log(&api.id)
        .unwrap()
        .into_iter()
        .filter_map(|e| match e.payload {
            EventPayload::Escalated {
                from_tier, to_tier, ..
            } => Some((from_tier, to_tier)),
            _ => None,
        })
        .collect();
    assert_eq!(escalations, vec![(Some(Tier::Fast), Tier::Standard)]);

    // The last validation still sees every output.
    let last = harness.gate.seen().pop().unwrap();
    assert_eq!(last.iteration, 3);
    assert_eq!(last.artifacts.len(), 3);
}

#[tokio::test]
async fn test_full_redispatch_without_smart_reexecution() {
    let mut config = test_config();
    config.orchestrator.smart_reexecution = false;
    let harness = Harness::new(
        ScriptedWorker::new(),
        ScriptedGate::failing(&[("api", 2, vec![gap("errors")])]),
    );
    let mut session = harness.start(LAYERED_PLAN, &config).await;

    assert!(session.run().await.unwrap().is_complete());

    assert_eq!(harness.worker.seen_for("api").len(), 9);
}

#[tokio::test]
async fn test_unmappable_gap_redispatches_everything() {
    let harness = Harness::new(
        ScriptedWorker::new(),
        ScriptedGate::failing(&[("api", 1, vec![gap("house-style")])]),
    );
    let mut session = harness.start(LAYERED_PLAN, &test_config()).await;

    assert!(session.run().await.unwrap().is_complete());

    let second: Vec<String> = harness
        .worker
        .seen_for("api")
        .into_iter()
        .filter(|r| r.iteration == 2)
        .map(|r| r.output)
        .collect();
    assert_eq!(second, vec!["handlers", "error_handling", "tests"]);
}

#[tokio::test]
async fn test_high_complexity_starts_at_standard() {
    let plan = r#"
        [[task]]
        name = "core"
        kind = "implementation"
        complexity = "high"
    "#;
    let harness = Harness::new(ScriptedWorker::new(), ScriptedGate::passing());
    let mut session = harness.start(plan, &test_config()).await;

    assert!(session.run().await.unwrap().is_complete());

    assert_eq!(harness.worker.seen()[0].tier, Tier::Standard);
}

// ========== Timeout Tests ==========

#[tokio::test(start_paused = true)]
async fn test_worker_timeout_fails_the_iteration() {
    let plan = r#"
        [[task]]
        name = "solo"
        kind = "implementation"
    "#;
    let mut config = test_config();
    config.orchestrator.worker_timeout_secs = 1;
    config.orchestrator.max_iterations = 3;
    let harness = Harness::new(
        ScriptedWorker::slow(std::time::Duration::from_secs(3)),
        ScriptedGate::passing(),
    );
    let mut session = harness.start(plan, &config).await;

    let report = session.run().await.unwrap();

    assert!(report.passed.is_empty());
    assert_eq!(report.aborted.len(), 1);
    let audit = &report.aborted[0];
    assert_eq!(audit.iterations, 3);
    let tiers: Vec<Option<Tier>> = audit.gap_history.iter().map(|r| r.tier).collect();
    assert_eq!(
        tiers,
        vec![Some(Tier::Fast), Some(Tier::Fast), Some(Tier::Standard)]
    );
    for record in &audit.gap_history {
        assert_eq!(record.gaps.len(), 1);
        assert_eq!(record.gaps[0].criterion, "main");
        assert_eq!(record.gaps[0].reason, "worker timed out after 1s");
    }
    // A timed-out worker never reaches the gate.
    assert!(harness.gate.seen().is_empty());
}
