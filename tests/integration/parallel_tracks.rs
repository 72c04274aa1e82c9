//! Parallel track execution tests.

use std::time::Duration;

use crate::fixtures::*;

const SHARED_RESOURCE_PLAN: &str = r#"
[[task]]
name = "schema-a"
kind = "implementation"
resources = ["db"]

[[task]]
name = "schema-b"
kind = "implementation"
resources = ["db"]

[[task]]
name = "ui"
kind = "implementation"
"#;

const INDEPENDENT_PLAN: &str = r#"
[[task]]
name = "one"
kind = "documentation"

[[task]]
name = "two"
kind = "documentation"

[[task]]
name = "three"
kind = "documentation"
"#;

#[tokio::test]
async fn test_shared_resource_tasks_share_a_track() {
    let harness = Harness::new(ScriptedWorker::slow(Duration::from_millis(20)), ScriptedGate::passing());
    let mut session = harness.start(SHARED_RESOURCE_PLAN, &test_config()).await;

    let report = session.run().await.unwrap();
    assert!(report.is_complete(), "{}", report);

    let tracks = session.tracks().await;
    assert_eq!(tracks.len(), 2);
    let mut sizes: Vec<usize> = tracks.iter().map(|t| t.tasks.len()).collect();
    sizes.sort();
    assert_eq!(sizes, vec![1, 2]);

    // Tasks in one track run one after another, in name order.
    let order: Vec<String> = harness
        .worker
        .seen()
        .into_iter()
        .map(|r| r.task)
        .filter(|t| t.starts_with("schema"))
        .collect();
    assert_eq!(order, vec!["schema-a", "schema-b"]);
}

#[tokio::test]
async fn test_parallelism_bound_is_respected() {
    let mut config = test_config();
    config.scheduler.max_parallel_tracks = 1;
    let harness = Harness::new(ScriptedWorker::slow(Duration::from_millis(20)), ScriptedGate::passing());
    let mut session = harness.start(INDEPENDENT_PLAN, &config).await;

    assert!(session.run().await.unwrap().is_complete());

    assert_eq!(session.tracks().await.len(), 3);
    assert_eq!(harness.worker.max_in_flight(), 1);
}

#[tokio::test]
async fn test_independent_tracks_run_concurrently() {
    let harness = Harness::new(ScriptedWorker::slow(Duration::from_millis(50)), ScriptedGate::passing());
    let mut session = harness.start(INDEPENDENT_PLAN, &test_config()).await;

    assert!(session.run().await.unwrap().is_complete());

    assert!(harness.worker.max_in_flight() >= 2);
}

#[tokio::test]
async fn test_sprints_run_in_order() {
    let plan = r#"
        [[task]]
        name = "first"
        kind = "design"
        effort_hours = 50.0

        [[task]]
        name = "second"
        kind = "design"
        effort_hours = 50.0
    "#;
    let harness = Harness::new(ScriptedWorker::new(), ScriptedGate::passing());
    let mut session = harness.start(plan, &test_config()).await;

    assert!(session.run().await.unwrap().is_complete());

    assert_eq!(harness.gate.validated_tasks(), vec!["first", "second"]);
    let names: Vec<String> = session.tracks().await.into_iter().map(|t| t.name).collect();
    assert_eq!(names, vec!["s1-first", "s2-second"]);
}
