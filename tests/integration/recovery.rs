//! Circuit breaker, pause, resume, and replay tests.

use cadence::core::{TaskStatus, Tier};
use cadence::orchestration::TrackId;
use cadence::state::{EventPayload, NewEvent, PauseReason};
use cadence::{Error, Session, SessionProjection, SessionStatus, StateStore};

use crate::fixtures::*;

const BREAKER_PLAN: &str = r#"
[[task]]
name = "a1"
kind = "implementation"

[[task]]
name = "a2"
kind = "implementation"

[[task]]
name = "b1"
kind = "implementation"
"#;

// ========== Circuit Breaker Tests ==========

#[tokio::test]
async fn test_breaker_pauses_and_resume_continues() {
    let mut config = test_config();
    config.orchestrator.max_iterations = 1;
    config.breaker.threshold = 2;
    config.scheduler.max_parallel_tracks = 1;
    let harness = Harness::new(
        ScriptedWorker::new(),
        ScriptedGate::failing(&[
            ("a1", u32::MAX, vec![gap("main")]),
            ("a2", u32::MAX, vec![gap("main")]),
        ]),
    );
    let mut session = harness.start(BREAKER_PLAN, &config).await;

    let report = session.run().await.unwrap();

    assert_eq!(report.status, SessionStatus::Paused);
    assert_eq!(report.pause, Some(PauseReason::CircuitBreaker { failures: 2 }));
    assert_eq!(report.aborted.len(), 2);
    assert!(harness.worker.seen_for("b1").is_empty());
    assert!(matches!(
        report.blockers().first(),
        Some(Error::CircuitBreakerTripped { failures: 2 })
    ));
    assert!(matches!(session.run().await, Err(Error::SessionPaused(_))));

    session.resume_dispatch().unwrap();
    let report = session.run().await.unwrap();

    assert_eq!(report.status, SessionStatus::Running);
    assert_eq!(report.passed, vec!["b1"]);
    assert_eq!(report.aborted.len(), 2);
    let kinds: Vec<_> = session
        .store()
        .events()
        .unwrap()
        .iter()
        .filter(|e| e.task_id.is_none() && e.track_id.is_none())
        .map(|e| e.kind())
        .collect();
    assert_eq!(kinds, vec!["session_started", "session_paused", "session_resumed"]);
}

#[tokio::test]
async fn test_passing_task_resets_breaker_count() {
    let mut config = test_config();
    config.orchestrator.max_iterations = 1;
    config.breaker.threshold = 2;
    config.scheduler.max_parallel_tracks = 1;
    let plan = r#"
        [[task]]
        name = "a"
        kind = "review"

        [[task]]
        name = "b"
        kind = "review"

        [[task]]
        name = "c"
        kind = "review"
    "#;
    let harness = Harness::new(
        ScriptedWorker::new(),
        ScriptedGate::failing(&[("a", u32::MAX, vec![gap("main")]), ("c", u32::MAX, vec![gap("main")])]),
    );
    let mut session = harness.start(plan, &config).await;

    let report = session.run().await.unwrap();

    assert_eq!(report.pause, None);
    assert_eq!(report.aborted.len(), 2);
    assert_eq!(report.passed, vec!["b"]);
}

/// Log aborts for `names` as a crashed process would have left them.
fn log_aborts(session: &Session, graph: &cadence::core::TaskGraph, names: &[&str]) {
    for name in names {
        let task = graph.find_by_name(name).unwrap();
        session
            .store()
            .append(NewEvent::task(
                task.id,
                Some(TaskStatus::Failed),
                Some(TaskStatus::Aborted),
                EventPayload::Aborted {
                    iteration: 1,
                    reason: "reached max iterations".to_string(),
                },
            ))
            .unwrap();
    }
}

#[tokio::test]
async fn test_resume_keeps_consecutive_abort_count() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config();
    config.orchestrator.max_iterations = 1;
    config.breaker.threshold = 3;
    let harness = Harness::new(
        ScriptedWorker::new(),
        ScriptedGate::failing(&[("b1", u32::MAX, vec![gap("main")])]),
    );
    let session = harness
        .start_in(BREAKER_PLAN, &config, StateStore::open(dir.path()).unwrap())
        .await;
    {
        let graph = session.graph();
        let graph = graph.read().await;
        log_aborts(&session, &graph, &["a1", "a2"]);
    }
    drop(session);

    let mut session = Session::resume(StateStore::open(dir.path()).unwrap(), harness.collaborators(), &config)
        .await
        .unwrap();
    assert_eq!(session.projection().await.unwrap().session.consecutive_aborts, 2);
    session.resume_dispatch().unwrap();

    let report = session.run().await.unwrap();

    // b1 is the third abort in a row across the restart.
    assert_eq!(report.status, SessionStatus::Paused);
    assert_eq!(report.pause, Some(PauseReason::CircuitBreaker { failures: 3 }));
    assert_eq!(report.aborted.len(), 3);
}

#[tokio::test]
async fn test_resume_with_tripped_count_halts_until_operator_resumes() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config();
    config.breaker.threshold = 2;
    let harness = Harness::new(ScriptedWorker::new(), ScriptedGate::passing());
    let session = harness
        .start_in(BREAKER_PLAN, &config, StateStore::open(dir.path()).unwrap())
        .await;
    {
        let graph = session.graph();
        let graph = graph.read().await;
        log_aborts(&session, &graph, &["a1", "a2"]);
    }
    drop(session);

    let mut session = Session::resume(StateStore::open(dir.path()).unwrap(), harness.collaborators(), &config)
        .await
        .unwrap();
    let report = session.run().await.unwrap();

    assert_eq!(report.pause, Some(PauseReason::CircuitBreaker { failures: 2 }));
    assert!(harness.worker.seen().is_empty());

    session.resume_dispatch().unwrap();
    let report = session.run().await.unwrap();

    assert_eq!(report.passed, vec!["b1"]);
    assert_eq!(session.projection().await.unwrap().session.consecutive_aborts, 0);
}

// ========== Resume Tests ==========

#[tokio::test]
async fn test_interrupted_iteration_is_retried_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new(ScriptedWorker::new(), ScriptedGate::passing());
    let session = harness
        .start_in(DIAMOND_PLAN, &test_config(), StateStore::open(dir.path()).unwrap())
        .await;
    let a = session.graph().read().await.find_by_name("a").unwrap().id;

    // Simulate a crash after dispatching a into its track.
    let track = TrackId::new();
    let store = session.store();
    store
        .append(NewEvent::track(
            track,
            EventPayload::TrackOpened {
                name: "s1-a".to_string(),
                tasks: vec![a],
            },
        ))
        .unwrap();
    store
        .append(
            NewEvent::task(
                a,
                Some(TaskStatus::Pending),
                Some(TaskStatus::Dispatched),
                EventPayload::Dispatched {
                    iteration: 1,
                    tier: Tier::Fast,
                    outputs: vec!["main".to_string()],
                },
            )
            .in_track(Some(track)),
        )
        .unwrap();
    drop(store);
    drop(session);

    let store = StateStore::open(dir.path()).unwrap();
    let events = store.events().unwrap();
    let projection = SessionProjection::resume(store.load_checkpoint().unwrap(), &events);
    assert_eq!(projection.interrupted(), vec![a]);

    let mut session = Session::resume(store, harness.collaborators(), &test_config())
        .await
        .unwrap();
    let report = session.run().await.unwrap();

    assert!(report.is_complete(), "{}", report);
    let graph = session.graph();
    let graph = graph.read().await;
    let task = graph.task(&a).unwrap();
    assert_eq!(task.iteration, 2);
    assert_eq!(task.gap_history[0].gaps[0].criterion, "interrupted");
    assert_eq!(
        harness
            .worker
            .seen_for("a")
            .iter()
            .map(|r| r.iteration)
            .collect::<Vec<_>>(),
        vec![2]
    );
    // The interrupted task finished in the track it was dispatched into.
    let tracks = session.tracks().await;
    assert!(tracks.iter().any(|t| t.id == track && t.is_merged()));
}

#[tokio::test]
async fn test_pause_logged_by_another_process_survives_resume() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new(ScriptedWorker::new(), ScriptedGate::passing());
    let session = harness
        .start_in(DIAMOND_PLAN, &test_config(), StateStore::open(dir.path()).unwrap())
        .await;
    drop(session);

    // What `cadence pause` does.
    StateStore::open(dir.path())
        .unwrap()
        .append(NewEvent::session(EventPayload::SessionPaused {
            reason: PauseReason::Operator {
                note: "review first".to_string(),
            },
        }))
        .unwrap();

    let mut session = Session::resume(StateStore::open(dir.path()).unwrap(), harness.collaborators(), &test_config())
        .await
        .unwrap();
    assert_eq!(session.status(), SessionStatus::Paused);
    assert!(matches!(session.run().await, Err(Error::SessionPaused(_))));
    assert!(harness.worker.seen().is_empty());

    session.resume_dispatch().unwrap();
    assert!(session.run().await.unwrap().is_complete());
}

// ========== Replay Tests ==========

#[tokio::test]
async fn test_replay_reproduces_live_state() {
    let harness = Harness::new(
        ScriptedWorker::new(),
        ScriptedGate::failing(&[("api", 2, vec![gap("errors")])]),
    );
    let mut session = harness.start(LAYERED_PLAN, &test_config()).await;
    session.run().await.unwrap();

    let store = session.store();
    let events = store.events().unwrap();
    let live = session.projection().await.unwrap();

    let replayed = SessionProjection::replay(&events);
    assert_eq!(replayed, live);

    // Replaying again, or from the checkpoint, changes nothing.
    let mut twice = replayed.clone();
    assert_eq!(twice.apply_all(&events), 0);
    assert_eq!(twice, live);
    let resumed = SessionProjection::resume(store.load_checkpoint().unwrap(), &events);
    assert_eq!(resumed, live);

    // A partial replay continued from the middle lands in the same place.
    let (head, _) = events.split_at(events.len() / 2);
    let mut partial = SessionProjection::replay(head);
    partial.apply_all(&events);
    assert_eq!(partial, live);
}

#[tokio::test]
async fn test_task_log_is_ordered_and_complete() {
    let harness = Harness::new(
        ScriptedWorker::new(),
        ScriptedGate::failing(&[("api", 1, vec![gap("coverage")])]),
    );
    let mut session = harness.start(LAYERED_PLAN, &test_config()).await;
    session.run().await.unwrap();

    let api = session.graph().read().await.find_by_name("api").unwrap().id;
    let log = session.store().task_log(&api).unwrap();

    assert!(log.windows(2).all(|w| w[0].seq < w[1].seq));
    let transitions: Vec<(Option<TaskStatus>, Option<TaskStatus>)> = log
        .iter()
        .filter(|e| e.is_transition())
        .map(|e| (e.from, e.to))
        .collect();
    assert_eq!(
        transitions,
        vec![
            (Some(TaskStatus::Pending), Some(TaskStatus::Dispatched)),
            (Some(TaskStatus::Dispatched), Some(TaskStatus::Validating)),
            (Some(TaskStatus::Validating), Some(TaskStatus::Failed)),
            (Some(TaskStatus::Failed), Some(TaskStatus::Dispatched)),
            (Some(TaskStatus::Dispatched), Some(TaskStatus::Validating)),
            (Some(TaskStatus::Validating), Some(TaskStatus::Passed)),
        ]
    );
}
