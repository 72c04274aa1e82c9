//! Merge conflict and track cleanup tests.

use std::sync::Arc;

use cadence::orchestration::TrackState;
use cadence::state::EventPayload;
use cadence::workspace::GitWorkspace;
use cadence::Error;

use crate::fixtures::*;

const INTEGRATION: &str = "cadence/integration";

const SIBLINGS_PLAN: &str = r#"
[[task]]
name = "left"
kind = "implementation"

[[task]]
name = "right"
kind = "implementation"
"#;

fn git_workspace(repo: &TestRepo) -> Arc<GitWorkspace> {
    Arc::new(GitWorkspace::new(&repo.path, &repo.worktrees_dir(), INTEGRATION).unwrap())
}

// ========== Cleanup Tests ==========

#[tokio::test]
async fn test_cleanup_with_uncommitted_work_needs_force() {
    let mut config = test_config();
    config.orchestrator.max_iterations = 1;
    let harness = Harness::new(
        ScriptedWorker::new(),
        ScriptedGate::failing(&[("left", u32::MAX, vec![gap("main")])]),
    );
    let mut session = harness.start(SIBLINGS_PLAN, &config).await;

    let report = session.run().await.unwrap();
    assert_eq!(report.aborted.len(), 1);

    let track = session
        .tracks()
        .await
        .into_iter()
        .find(|t| t.name.ends_with("left"))
        .unwrap();
    assert!(track.is_open());

    let result = session.cleanup_track(&track.id, false).await;
    match result {
        Err(Error::UncommittedWork { items, .. }) => assert_eq!(items, vec!["left/main.txt"]),
        other => panic!("expected UncommittedWork, got {:?}", other),
    }
    let still_open = session.tracks().await;
    assert!(still_open.iter().any(|t| t.id == track.id && t.is_open()));

    let discarded = session.cleanup_track(&track.id, true).await.unwrap();
    assert_eq!(discarded, vec!["left/main.txt"]);

    let tracks = session.tracks().await;
    let after = tracks.iter().find(|t| t.id == track.id).unwrap();
    assert_eq!(after.state, TrackState::Discarded);
    let last = session.store().track_log(&track.id).unwrap().pop().unwrap();
    assert!(matches!(
        last.payload,
        EventPayload::TrackDiscarded { forced: true, .. }
    ));
}

#[tokio::test]
async fn test_cleanup_of_unknown_track() {
    let harness = Harness::new(ScriptedWorker::new(), ScriptedGate::passing());
    let session = harness.start(SIBLINGS_PLAN, &test_config()).await;

    let result = session.cleanup_track(&cadence::orchestration::TrackId::new(), true).await;

    assert!(matches!(result, Err(Error::TrackNotFound(_))));
}

// ========== Git Merge Tests ==========

#[tokio::test]
async fn test_git_session_merges_into_integration_branch() {
    let repo = TestRepo::new();
    let harness = Harness::new(ScriptedWorker::new(), ScriptedGate::passing())
        .with_workspace(git_workspace(&repo));
    let mut session = harness.start(DIAMOND_PLAN, &test_config()).await;

    let report = session.run().await.unwrap();

    assert!(report.is_complete(), "{}", report);
    for name in ["a", "b", "c"] {
        let content = repo
            .read_on_branch(INTEGRATION, &format!("{}/main.txt", name))
            .unwrap();
        assert!(content.starts_with(name));
    }
    assert_eq!(
        repo.read_on_branch(INTEGRATION, "README.md").as_deref(),
        Some("# Test Repository\n")
    );
}

#[tokio::test]
async fn test_conflicting_tracks_leave_integration_untouched() {
    let repo = TestRepo::new();
    let worker = ScriptedWorker::with_paths(&[("left", "shared/config.txt"), ("right", "shared/config.txt")]);
    let harness = Harness::new(worker, ScriptedGate::passing()).with_workspace(git_workspace(&repo));
    let mut session = harness.start(SIBLINGS_PLAN, &test_config()).await;

    let report = session.run().await.unwrap();

    assert!(!report.is_complete());
    assert_eq!(report.passed, vec!["left", "right"]);
    assert_eq!(report.conflicts.len(), 1);
    let conflict = &report.conflicts[0];
    assert_eq!(conflict.name, "s1-right");
    assert_eq!(conflict.paths, vec!["shared/config.txt"]);
    assert!(matches!(
        report.blockers().as_slice(),
        [Error::MergeConflict { .. }]
    ));

    // The first track merged; the conflicting one changed nothing.
    let shared = repo.read_on_branch(INTEGRATION, "shared/config.txt").unwrap();
    assert!(shared.starts_with("left"));

    let tracks = session.tracks().await;
    let right = tracks.iter().find(|t| t.name == "s1-right").unwrap();
    assert!(matches!(right.state, TrackState::Conflicted { .. }));
    assert!(right.is_live());
}

#[tokio::test]
async fn test_memory_conflict_is_reported() {
    let worker = ScriptedWorker::with_paths(&[("left", "shared.txt"), ("right", "shared.txt")]);
    let harness = Harness::new(worker, ScriptedGate::passing());
    let mut session = harness.start(SIBLINGS_PLAN, &test_config()).await;

    let report = session.run().await.unwrap();

    assert_eq!(report.conflicts.len(), 1);
    assert_eq!(report.conflicts[0].paths, vec!["shared.txt"]);
    assert!(harness
        .workspace
        .read_shared("shared.txt")
        .unwrap()
        .unwrap()
        .starts_with("left"));
}

// ========== Conflict Recovery Tests ==========

/// `left` and `right` write the same file; `after` builds on `right`.
const SIBLINGS_WITH_FOLLOWER: &str = r#"
[[task]]
name = "left"
kind = "implementation"

[[task]]
name = "right"
kind = "implementation"

[[task]]
name = "after"
kind = "testing"
dependencies = ["right"]
"#;

fn shared_file_worker() -> Arc<ScriptedWorker> {
    ScriptedWorker::with_paths(&[("left", "shared.txt"), ("right", "shared.txt")])
}

#[tokio::test]
async fn test_merge_after_resolution_completes_session() {
    let harness = Harness::new(shared_file_worker(), ScriptedGate::passing());
    let mut session = harness.start(SIBLINGS_WITH_FOLLOWER, &test_config()).await;

    let report = session.run().await.unwrap();
    assert_eq!(report.conflicts.len(), 1);
    assert_eq!(report.blocked.len(), 1);
    assert_eq!(report.blocked[0].name, "after");

    // Running again does not retry the conflicted merge.
    let again = session.run().await.unwrap();
    assert_eq!(again.conflicts.len(), 1);
    assert!(harness.worker.seen_for("after").is_empty());

    let track = again.conflicts[0].track;
    let revision = session.merge_track(&track).await.unwrap();
    let tracks = session.tracks().await;
    let right = tracks.iter().find(|t| t.id == track).unwrap();
    assert_eq!(right.state, TrackState::Merged { revision });

    let report = session.run().await.unwrap();

    assert!(report.is_complete(), "{}", report);
    assert!(report.conflicts.is_empty());
    assert_eq!(harness.worker.seen_for("after").len(), 1);
    assert_eq!(harness.worker.seen_for("right").len(), 1);
    assert!(harness
        .workspace
        .read_shared("shared.txt")
        .unwrap()
        .unwrap()
        .starts_with("right"));
}

#[tokio::test]
async fn test_merge_of_unconflicted_track_is_refused() {
    let harness = Harness::new(ScriptedWorker::new(), ScriptedGate::passing());
    let mut session = harness.start(SIBLINGS_PLAN, &test_config()).await;
    session.run().await.unwrap();
    let track = session.tracks().await[0].id;

    let result = session.merge_track(&track).await;

    assert!(matches!(result, Err(Error::Validation(_))));
}

#[tokio::test]
async fn test_forced_cleanup_requeues_track_tasks() {
    let harness = Harness::new(shared_file_worker(), ScriptedGate::passing());
    let mut session = harness.start(SIBLINGS_WITH_FOLLOWER, &test_config()).await;
    let report = session.run().await.unwrap();
    let track = report.conflicts[0].track;

    session.cleanup_track(&track, true).await.unwrap();

    let right_id = {
        let graph = session.graph();
        let graph = graph.read().await;
        let right = graph.find_by_name("right").unwrap();
        assert_eq!(right.status, cadence::core::TaskStatus::Pending);
        assert!(right.artifacts.is_empty());
        right.id
    };
    let last = session.store().task_log(&right_id).unwrap().pop().unwrap();
    assert!(matches!(last.payload, EventPayload::Requeued { track: t } if t == track));

    let report = session.run().await.unwrap();

    assert!(report.is_complete(), "{}", report);
    let seen = harness.worker.seen_for("right");
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[1].iteration, 2);
    assert_eq!(harness.worker.seen_for("after").len(), 1);
    let tracks = session.tracks().await;
    assert_eq!(
        tracks
            .iter()
            .filter(|t| t.tasks.contains(&right_id) && t.is_merged())
            .count(),
        1
    );
}

#[tokio::test]
async fn test_git_conflict_fixed_in_worktree_then_merged() {
    let repo = TestRepo::new();
    let worker = ScriptedWorker::with_paths(&[("left", "shared/config.txt"), ("right", "shared/config.txt")]);
    let workspace = git_workspace(&repo);
    let harness = Harness::new(worker, ScriptedGate::passing()).with_workspace(workspace.clone());
    let mut session = harness.start(SIBLINGS_PLAN, &test_config()).await;

    let report = session.run().await.unwrap();
    let track = report.conflicts[0].track;
    let worktree = cadence::workspace::WorkspaceBackend::path(workspace.as_ref(), &track).unwrap();
    std::fs::write(worktree.join("shared/config.txt"), "left and right\n").unwrap();

    session.merge_track(&track).await.unwrap();
    let report = session.run().await.unwrap();

    assert!(report.is_complete(), "{}", report);
    assert_eq!(
        repo.read_on_branch(INTEGRATION, "shared/config.txt").as_deref(),
        Some("left and right\n")
    );
}
