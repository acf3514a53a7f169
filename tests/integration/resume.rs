//! Integration tests for crash-safe persistence and resume.

mod support;

use std::fs;
use std::sync::Arc;
use std::time::{Duration, Instant};

use support::{flaky_runner, runner, state_manager, FlakyStore, ScriptedExecutor};
use tapps_epic::state::StateKey;
use tapps_epic::{
    ConflictPolicy, EngineConfig, EngineError, Epic, EpicStatus, FailurePolicy, FailureReason,
    FsStateStore, ResumeOptions, RetryPolicy, StateStore, Story, StoryStatus,
};
use tempfile::TempDir;
use tokio_test::{assert_err, assert_ok};

fn config() -> EngineConfig {
    EngineConfig::new(ConflictPolicy::Proceed, FailurePolicy::SkipDependents)
}

/// Two independent roots, each with one dependent.
fn four_story_epic(run_id: &str) -> Epic {
    let mut epic = Epic::new(
        "EPIC-CRASH",
        "Crash",
        vec![
            Story::new("A", "root a").with_files(["a.rs"]),
            Story::new("B", "root b").with_files(["b.rs"]),
            Story::new("C", "after a").with_dependencies(["A"]),
            Story::new("D", "after b").with_dependencies(["B"]),
        ],
    );
    epic.run_id = run_id.to_string();
    epic
}

/// Kill a run after 2 of 4 stories complete; resume runs only the other 2.
#[tokio::test]
async fn test_resume_after_crash_runs_only_remaining_stories() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");

    let hanging = Arc::new(
        ScriptedExecutor::new()
            .delay("C", Duration::from_secs(3600))
            .delay("D", Duration::from_secs(3600)),
    );
    let first = runner(&temp_dir, config(), hanging);
    let task = tokio::spawn(async move { first.run(four_story_epic("run-crash")).await });

    let state = state_manager(&temp_dir);
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Ok(epic) = state.load("EPIC-CRASH", "run-crash") {
            if epic.count(StoryStatus::Running) == 2 && epic.count(StoryStatus::Completed) == 2 {
                break;
            }
        }
        assert!(Instant::now() < deadline, "first run never reached wave 1");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    // Simulated process death: nothing gets to clean up.
    task.abort();
    let _ = task.await;

    let crashed = state.load("EPIC-CRASH", "run-crash").expect("load");
    let a_completed_at = crashed.story("A").and_then(|s| s.completed_at);

    let executor = Arc::new(ScriptedExecutor::new());
    let second = runner(&temp_dir, config(), executor.clone());
    let report = second
        .resume("EPIC-CRASH", "run-crash", ResumeOptions::default())
        .await
        .expect("resume");

    assert!(report.is_success());
    let mut calls = executor.calls();
    calls.sort();
    assert_eq!(calls, vec!["C", "D"]);
    assert_eq!(
        report.epic.story("A").and_then(|s| s.completed_at),
        a_completed_at
    );
}

/// Resuming a finished run twice changes nothing and executes nothing.
#[tokio::test]
async fn test_resume_is_idempotent_on_completed_epic() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let runner_a = runner(&temp_dir, config(), Arc::new(ScriptedExecutor::new()));
    let finished = runner_a
        .run(four_story_epic("run-done"))
        .await
        .expect("run");
    assert!(finished.is_success());

    let executor = Arc::new(ScriptedExecutor::new());
    let runner_b = runner(&temp_dir, config(), executor.clone());
    let once = runner_b
        .resume("EPIC-CRASH", "run-done", ResumeOptions::default())
        .await
        .expect("first resume");
    let twice = runner_b
        .resume("EPIC-CRASH", "run-done", ResumeOptions::default())
        .await
        .expect("second resume");

    assert_eq!(executor.call_count(), 0);
    assert_eq!(once.epic, twice.epic);
    assert_eq!(once.epic, finished.epic);
    assert_eq!(twice.waves_executed, 0);
    assert_eq!(twice.status(), EpicStatus::Completed);
}

/// `save` followed by `load` yields an equal epic.
#[tokio::test]
async fn test_save_load_round_trip() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let state = state_manager(&temp_dir);
    let mut epic = four_story_epic("run-rt");
    epic.status = EpicStatus::InProgress;
    if let Some(story) = epic.story_mut("A") {
        story.status = StoryStatus::Completed;
        story.quality_score = Some(0.875);
        story.files_changed = vec!["a.rs".to_string()];
    }

    state.save(&mut epic).await.expect("save");
    let loaded = state.load("EPIC-CRASH", "run-rt").expect("load");

    assert_eq!(loaded, epic);
}

/// A tampered state file is reported with its location; the backup still
/// loads.
#[tokio::test]
async fn test_corrupt_state_is_reported() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let state = state_manager(&temp_dir);
    let mut epic = four_story_epic("run-corrupt");
    state.save(&mut epic).await.expect("first save");
    epic.status = EpicStatus::InProgress;
    state.save(&mut epic).await.expect("second save");

    let store = FsStateStore::new(temp_dir.path()).expect("store");
    let path = store.location(&StateKey::new("EPIC-CRASH", "run-corrupt").expect("key"));
    let content = fs::read_to_string(&path).expect("read state");
    fs::write(&path, content.replace("root a", "root z")).expect("tamper");

    let resumer = runner(&temp_dir, config(), Arc::new(ScriptedExecutor::new()));
    match resumer
        .resume("EPIC-CRASH", "run-corrupt", ResumeOptions::default())
        .await
        .unwrap_err()
    {
        EngineError::CorruptState { location, .. } => assert_eq!(location, path),
        other => panic!("unexpected error: {other}"),
    }

    let backup = state
        .load_backup("EPIC-CRASH", "run-corrupt")
        .expect("backup");
    assert_eq!(backup.revision, 1);
}

/// Failed stories stay failed on a plain resume and are retried on request.
#[tokio::test]
async fn test_resume_retry_failed() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let failing = runner(
        &temp_dir,
        config(),
        Arc::new(ScriptedExecutor::new().fail("A")),
    );
    let report = failing
        .run(four_story_epic("run-retry"))
        .await
        .expect("run");
    assert_eq!(report.status(), EpicStatus::Failed);
    assert_eq!(report.epic.status_of("C"), Some(StoryStatus::Skipped));

    let executor = Arc::new(ScriptedExecutor::new());
    let resumer = runner(&temp_dir, config(), executor.clone());
    let unchanged = resumer
        .resume("EPIC-CRASH", "run-retry", ResumeOptions::default())
        .await
        .expect("plain resume");
    assert_eq!(unchanged.status(), EpicStatus::Failed);
    assert_eq!(executor.call_count(), 0);

    let retried = resumer
        .resume("EPIC-CRASH", "run-retry", ResumeOptions { retry_failed: true })
        .await
        .expect("retry resume");
    assert!(retried.is_success());
    let mut calls = executor.calls();
    calls.sort();
    assert_eq!(calls, vec!["A", "C"]);
}

/// A paused run picks up where it stopped.
#[tokio::test]
async fn test_resume_paused_run() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let first = runner(
        &temp_dir,
        config(),
        Arc::new(ScriptedExecutor::with_delay(Duration::from_secs(30))),
    );
    first.cancel_handle().cancel();
    let paused = first
        .run(four_story_epic("run-pause"))
        .await
        .expect("run");
    assert_eq!(paused.status(), EpicStatus::Paused);

    let executor = Arc::new(ScriptedExecutor::new());
    let second = runner(&temp_dir, config(), executor.clone());
    let report = second
        .resume("EPIC-CRASH", "run-pause", ResumeOptions::default())
        .await
        .expect("resume");

    assert!(report.is_success());
    assert_eq!(executor.call_count(), 4);
    assert_eq!(
        second
            .state_manager()
            .list_runs("EPIC-CRASH")
            .expect("runs"),
        vec!["run-pause"]
    );
}

/// Scores that are not finite are recorded as missing, so the run stays
/// loadable and resumable.
#[tokio::test]
async fn test_non_finite_score_keeps_state_loadable() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let first = runner(
        &temp_dir,
        config(),
        Arc::new(ScriptedExecutor::new().score("A", f64::NAN)),
    );
    let report = assert_ok!(first.run(four_story_epic("run-nan")).await);
    assert!(report.is_success());

    let state = state_manager(&temp_dir);
    let loaded = assert_ok!(state.load("EPIC-CRASH", "run-nan"));
    assert_eq!(loaded.story("A").and_then(|s| s.quality_score), None);
    assert_eq!(loaded, report.epic);

    let again = runner(&temp_dir, config(), Arc::new(ScriptedExecutor::new()));
    let resumed = assert_ok!(
        again
            .resume("EPIC-CRASH", "run-nan", ResumeOptions::default())
            .await
    );
    assert_eq!(resumed.epic, report.epic);
}

/// An infinite score fails the gate as a missing score and still persists.
#[tokio::test]
async fn test_infinite_score_fails_gate_and_persists() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let gated = runner(
        &temp_dir,
        config().with_quality_threshold(0.5),
        Arc::new(ScriptedExecutor::new().score("A", f64::INFINITY)),
    );
    let report = assert_ok!(gated.run(four_story_epic("run-inf")).await);
    assert_eq!(report.epic.status_of("A"), Some(StoryStatus::Failed));
    assert_eq!(report.epic.status_of("C"), Some(StoryStatus::Skipped));

    let loaded = assert_ok!(state_manager(&temp_dir).load("EPIC-CRASH", "run-inf"));
    assert_eq!(
        loaded.story("A").and_then(|s| s.failure.clone()),
        Some(FailureReason::QualityGate {
            score: None,
            threshold: 0.5
        })
    );
    assert_eq!(loaded, report.epic);
}

/// The runner's storage retry policy governs state writes, not the one the
/// state manager was built with.
#[tokio::test]
async fn test_runner_uses_configured_storage_retry() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let store = Arc::new(FlakyStore::new(&temp_dir, 0..2));
    let config = config().with_storage_retry(RetryPolicy::new(2, Duration::from_millis(1)));
    let runner = flaky_runner(
        store.clone(),
        RetryPolicy::none(),
        config.clone(),
        Arc::new(ScriptedExecutor::new()),
    );
    assert_eq!(runner.state_manager().retry_policy(), config.storage_retry);

    let report = assert_ok!(runner.run(four_story_epic("run-flaky")).await);

    assert!(report.is_success());
    assert!(store.writes() > 2);
    assert_eq!(
        assert_ok!(state_manager(&temp_dir).load("EPIC-CRASH", "run-flaky")),
        report.epic
    );
}

/// A state write that keeps failing mid-run halts the run: nothing after the
/// failed transition is dispatched.
#[tokio::test]
async fn test_storage_failure_mid_run_halts() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    // Writes: run start, wave 0 ready, A running, then A completed fails.
    let store = Arc::new(FlakyStore::new(&temp_dir, 3..usize::MAX));
    let executor = Arc::new(ScriptedExecutor::new());
    let runner = flaky_runner(
        store.clone(),
        RetryPolicy::none(),
        EngineConfig::new(ConflictPolicy::Proceed, FailurePolicy::SkipDependents)
            .with_max_concurrency(1)
            .with_storage_retry(RetryPolicy::new(1, Duration::from_millis(1))),
        executor.clone(),
    );
    let mut epic = Epic::new(
        "EPIC-DISK",
        "Disk",
        vec![
            Story::new("A", "first"),
            Story::new("B", "second").with_dependencies(["A"]),
            Story::new("C", "third").with_dependencies(["B"]),
        ],
    );
    epic.run_id = "run-disk".to_string();

    match assert_err!(runner.run(epic).await) {
        EngineError::StorageWriteFailure {
            attempts, reason, ..
        } => {
            assert_eq!(attempts, 2);
            assert!(reason.contains("disk hiccup"));
        }
        other => panic!("unexpected error: {other}"),
    }

    assert_eq!(executor.calls(), vec!["A"]);
    assert_eq!(store.writes(), 5);
    let persisted = assert_ok!(state_manager(&temp_dir).load("EPIC-DISK", "run-disk"));
    assert_eq!(persisted.status_of("A"), Some(StoryStatus::Running));
    assert_eq!(persisted.status_of("B"), Some(StoryStatus::Pending));
    assert_eq!(persisted.status_of("C"), Some(StoryStatus::Pending));
}
