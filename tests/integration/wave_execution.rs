//! Integration tests for wave execution.
//!
//! These drive `EpicRunner` end to end with scripted executors and check the
//! scheduling guarantees: bounded concurrency, wave ordering, conflict
//! handling, failure policies and cancellation.

mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use support::{runner, state_manager, ScriptedExecutor};
use tapps_epic::{
    AgentRole, Conflict, ConflictPolicy, EngineConfig, EngineError, Epic, EpicDocument,
    EpicRunner, EpicStatus, ExecutionStatus, ExecutorError, ExecutorRegistry, FailurePolicy,
    FailureReason, GateVerdict, StateManager, Story, StoryExecutor, StoryOutcome, StoryRequest,
    StoryStatus,
};
use tempfile::TempDir;

/// The three-story scenario: A and B both touch `a.py`, C needs both.
const ABC_EPIC: &str = r#"{
    "epicId": "EPIC-ABC",
    "title": "Conflict scenario",
    "stories": [
        { "id": "A", "title": "First writer", "dependsOn": [], "files": ["a.py"] },
        { "id": "B", "title": "Second writer", "dependsOn": [], "files": ["a.py"] },
        { "id": "C", "title": "Consumer", "dependsOn": ["A", "B"], "files": ["c.py"] }
    ]
}"#;

fn abc_epic() -> Epic {
    let mut epic = EpicDocument::from_json(ABC_EPIC)
        .expect("parse epic")
        .into_epic()
        .expect("epic");
    epic.run_id = "run-abc".to_string();
    epic
}

fn config(conflict: ConflictPolicy, failure: FailurePolicy) -> EngineConfig {
    EngineConfig::new(conflict, failure).with_storage_retry(tapps_epic::RetryPolicy::none())
}

fn independent_stories(count: usize) -> Vec<Story> {
    (1..=count)
        .map(|i| Story::new(format!("S-{i}"), format!("Story {i}")).with_files([format!("src/s{i}.rs")]))
        .collect()
}

/// Reads the persisted state on every call and records how many stories it
/// finds `running`.
struct ObservingExecutor {
    state: StateManager,
    epic_id: &'static str,
    run_id: &'static str,
    max_running: AtomicUsize,
}

#[async_trait]
impl StoryExecutor for ObservingExecutor {
    async fn execute(&self, _request: StoryRequest) -> Result<StoryOutcome, ExecutorError> {
        let epic = self
            .state
            .load(self.epic_id, self.run_id)
            .map_err(|e| ExecutorError::Failed(e.to_string()))?;
        self.max_running
            .fetch_max(epic.count(StoryStatus::Running), Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(40)).await;
        Ok(StoryOutcome::success(Some(1.0)))
    }
}

/// With N=2 and five independent stories, never more than two run at once.
#[tokio::test]
async fn test_concurrency_bound_of_two() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let executor = Arc::new(ScriptedExecutor::with_delay(Duration::from_millis(40)));
    let runner = runner(
        &temp_dir,
        config(ConflictPolicy::Proceed, FailurePolicy::SkipDependents).with_max_concurrency(2),
        executor.clone(),
    );

    let report = runner
        .run(Epic::new("EPIC-N", "Bound", independent_stories(5)))
        .await
        .expect("run");

    assert!(report.is_success());
    assert_eq!(executor.call_count(), 5);
    assert_eq!(executor.peak(), 2);
    assert!(report.metrics.peak_concurrency <= 2);
    assert_eq!(report.waves_executed, 1);
}

/// The persisted state never shows more than N stories `running`.
#[tokio::test]
async fn test_persisted_running_count_respects_bound() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let state = state_manager(&temp_dir);
    let executor = Arc::new(ObservingExecutor {
        state: state.clone(),
        epic_id: "EPIC-OBS",
        run_id: "run-obs",
        max_running: AtomicUsize::new(0),
    });
    let runner = EpicRunner::new(
        config(ConflictPolicy::Proceed, FailurePolicy::SkipDependents).with_max_concurrency(2),
        ExecutorRegistry::new().with_default(executor.clone()),
        state,
    );
    let mut epic = Epic::new("EPIC-OBS", "Observed", independent_stories(5));
    epic.run_id = "run-obs".to_string();

    let report = runner.run(epic).await.expect("run");

    assert!(report.is_success());
    let observed = executor.max_running.load(Ordering::SeqCst);
    assert!(observed >= 1 && observed <= 2, "observed {observed} running");
}

/// A and B form wave 0 with one conflict on `a.py`; C runs only after both.
#[tokio::test]
async fn test_abc_scenario_conflict_and_wave_order() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let executor = Arc::new(ScriptedExecutor::with_delay(Duration::from_millis(10)));
    let runner = runner(
        &temp_dir,
        config(ConflictPolicy::Proceed, FailurePolicy::HaltEpic),
        executor.clone(),
    );

    let report = runner.run(abc_epic()).await.expect("run");

    assert!(report.is_success());
    assert_eq!(report.waves_executed, 2);
    assert_eq!(
        report.conflicts,
        vec![Conflict {
            story_a: "A".to_string(),
            story_b: "B".to_string(),
            files: vec!["a.py".to_string()],
        }]
    );
    assert_eq!(executor.calls().last().map(String::as_str), Some("C"));

    let epic = &report.epic;
    let c_started = epic.story("C").and_then(|s| s.started_at).expect("C started");
    for id in ["A", "B"] {
        let story = epic.story(id).expect("story");
        assert_eq!(story.status, StoryStatus::Completed);
        assert!(story.completed_at.expect("completed_at") <= c_started);
    }
}

/// Under `serialize` the conflicting pair never overlaps.
#[tokio::test]
async fn test_serialize_policy_runs_conflicting_stories_one_at_a_time() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let executor = Arc::new(ScriptedExecutor::with_delay(Duration::from_millis(30)));
    let runner = runner(
        &temp_dir,
        config(ConflictPolicy::Serialize, FailurePolicy::HaltEpic),
        executor.clone(),
    );

    let report = runner.run(abc_epic()).await.expect("run");

    assert!(report.is_success());
    assert_eq!(executor.peak(), 1);
    assert_eq!(report.conflicts.len(), 1);
}

/// Under `abort` a conflicting wave fails the run before any story executes.
#[tokio::test]
async fn test_abort_policy_stops_before_dispatch() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let executor = Arc::new(ScriptedExecutor::new());
    let runner = runner(
        &temp_dir,
        config(ConflictPolicy::Abort, FailurePolicy::HaltEpic),
        executor.clone(),
    );

    let err = runner.run(abc_epic()).await.unwrap_err();

    match err {
        EngineError::ConflictDetected { wave, conflicts } => {
            assert_eq!(wave, 0);
            assert_eq!(conflicts.len(), 1);
            assert_eq!(conflicts[0].files, vec!["a.py"]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(executor.call_count(), 0);
    let persisted = runner
        .state_manager()
        .load("EPIC-ABC", "run-abc")
        .expect("load");
    assert_eq!(persisted.status, EpicStatus::Failed);
}

/// Cycles, including a self-dependency, abort with zero executions.
#[tokio::test]
async fn test_cycle_executes_nothing() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let executor = Arc::new(ScriptedExecutor::new());
    let runner = runner(
        &temp_dir,
        config(ConflictPolicy::Proceed, FailurePolicy::HaltEpic),
        executor.clone(),
    );

    let cyclic = Epic::new(
        "EPIC-CYC",
        "Cycle",
        vec![
            Story::new("A", "a"),
            Story::new("B", "b").with_dependencies(["A", "C"]),
            Story::new("C", "c").with_dependencies(["B"]),
        ],
    );
    match runner.run(cyclic).await.unwrap_err() {
        EngineError::CycleDetected { stories, path } => {
            assert_eq!(stories, vec!["B", "C"]);
            assert!(path.is_some());
        }
        other => panic!("unexpected error: {other}"),
    }

    let self_loop = Epic::new(
        "EPIC-SELF",
        "Self",
        vec![Story::new("A", "a").with_dependencies(["A"])],
    );
    assert!(matches!(
        runner.run(self_loop).await,
        Err(EngineError::CycleDetected { .. })
    ));

    assert_eq!(executor.call_count(), 0);
    assert!(runner.state_manager().list_runs("EPIC-CYC").expect("runs").is_empty());
}

/// A dangling dependency is reported with both story IDs before execution.
#[tokio::test]
async fn test_dangling_dependency_executes_nothing() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let executor = Arc::new(ScriptedExecutor::new());
    let runner = runner(
        &temp_dir,
        config(ConflictPolicy::Proceed, FailurePolicy::HaltEpic),
        executor.clone(),
    );
    let epic = Epic::new(
        "EPIC-DANGLE",
        "Dangling",
        vec![
            Story::new("A", "a"),
            Story::new("B", "b").with_dependencies(["Z"]),
        ],
    );

    match runner.run(epic).await.unwrap_err() {
        EngineError::DanglingDependency { story, missing } => {
            assert_eq!(story, "B");
            assert_eq!(missing, "Z");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(executor.call_count(), 0);
}

/// A failed story's dependents are skipped with a reason naming it and are
/// never started.
#[tokio::test]
async fn test_skip_propagation_references_failed_story() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let executor = Arc::new(ScriptedExecutor::new().fail("A"));
    let runner = runner(
        &temp_dir,
        config(ConflictPolicy::Proceed, FailurePolicy::SkipDependents),
        executor.clone(),
    );
    let epic = Epic::new(
        "EPIC-SKIP",
        "Skip",
        vec![
            Story::new("A", "a"),
            Story::new("B", "b").with_dependencies(["A"]),
            Story::new("C", "c").with_dependencies(["B"]),
            Story::new("D", "d"),
        ],
    );

    let report = runner.run(epic).await.expect("run");

    assert_eq!(report.status(), EpicStatus::Failed);
    assert_eq!(report.count(StoryStatus::Skipped), 2);
    assert_eq!(report.epic.status_of("D"), Some(StoryStatus::Completed));
    for id in ["B", "C"] {
        let story = report.epic.story(id).expect("story");
        assert_eq!(story.status, StoryStatus::Skipped);
        assert!(story.started_at.is_none());
        assert_eq!(
            story.failure,
            Some(FailureReason::UpstreamFailed {
                dependency: "A".to_string()
            })
        );
    }
    assert!(!executor.calls().iter().any(|id| id == "B" || id == "C"));
}

/// A story below the quality threshold ran, but counts as failed for its
/// dependents.
#[tokio::test]
async fn test_quality_gate_failure_skips_dependents() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let executor = Arc::new(ScriptedExecutor::new().score("A", 0.42));
    let runner = runner(
        &temp_dir,
        config(ConflictPolicy::Proceed, FailurePolicy::SkipDependents).with_quality_threshold(0.7),
        executor,
    );
    let epic = Epic::new(
        "EPIC-GATE",
        "Gate",
        vec![
            Story::new("A", "a"),
            Story::new("B", "b").with_dependencies(["A"]),
        ],
    );

    let report = runner.run(epic).await.expect("run");

    let a = report.epic.story("A").expect("A");
    assert_eq!(a.status, StoryStatus::Failed);
    assert_eq!(a.execution, Some(ExecutionStatus::Succeeded));
    assert_eq!(a.gate, Some(GateVerdict::Failed));
    assert_eq!(a.quality_score, Some(0.42));
    assert!(matches!(a.failure, Some(FailureReason::QualityGate { .. })));
    assert_eq!(report.epic.status_of("B"), Some(StoryStatus::Skipped));
}

/// Stories that exceed their budget fail with reason `timeout`.
#[tokio::test]
async fn test_timeout_recorded_as_failure() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let executor =
        Arc::new(ScriptedExecutor::new().delay("SLOW", Duration::from_secs(30)));
    let runner = runner(
        &temp_dir,
        config(ConflictPolicy::Proceed, FailurePolicy::SkipDependents)
            .with_story_timeout(Duration::from_millis(50)),
        executor,
    );
    let epic = Epic::new(
        "EPIC-TIME",
        "Timeout",
        vec![Story::new("SLOW", "slow"), Story::new("FAST", "fast")],
    );

    let report = runner.run(epic).await.expect("run");

    let slow = report.epic.story("SLOW").expect("SLOW");
    assert_eq!(slow.status, StoryStatus::Failed);
    assert_eq!(slow.failure, Some(FailureReason::Timeout { after_ms: 50 }));
    assert_eq!(report.epic.status_of("FAST"), Some(StoryStatus::Completed));
}

fn halt_scenario() -> Epic {
    Epic::new(
        "EPIC-HALT",
        "Halt",
        vec![
            Story::new("A", "fails fast"),
            Story::new("B", "slow sibling"),
            Story::new("C", "after B").with_dependencies(["B"]),
        ],
    )
}

/// `halt_epic`: the in-flight sibling finishes, nothing later starts.
#[tokio::test]
async fn test_halt_epic_lets_siblings_finish() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let executor = Arc::new(
        ScriptedExecutor::new()
            .fail("A")
            .delay("B", Duration::from_millis(50)),
    );
    let runner = runner(
        &temp_dir,
        config(ConflictPolicy::Proceed, FailurePolicy::HaltEpic),
        executor.clone(),
    );

    let report = runner.run(halt_scenario()).await.expect("run");

    assert_eq!(report.status(), EpicStatus::Failed);
    assert_eq!(report.epic.status_of("B"), Some(StoryStatus::Completed));
    assert_eq!(report.epic.status_of("C"), Some(StoryStatus::Pending));
    assert!(report
        .epic
        .halt_reason
        .as_deref()
        .unwrap_or_default()
        .contains("'A'"));
    assert_eq!(executor.call_count(), 2);
}

/// `skip_dependents`: the unaffected branch keeps going.
#[tokio::test]
async fn test_skip_dependents_continues_unrelated_branch() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let executor = Arc::new(
        ScriptedExecutor::new()
            .fail("A")
            .delay("B", Duration::from_millis(50)),
    );
    let runner = runner(
        &temp_dir,
        config(ConflictPolicy::Proceed, FailurePolicy::SkipDependents),
        executor.clone(),
    );

    let report = runner.run(halt_scenario()).await.expect("run");

    assert_eq!(report.status(), EpicStatus::Failed);
    assert_eq!(report.epic.status_of("C"), Some(StoryStatus::Completed));
    assert_eq!(executor.call_count(), 3);
}

/// Cancelling pauses the epic, persists it and leaves interrupted stories
/// pending for a later resume.
#[tokio::test]
async fn test_cancellation_pauses_and_persists() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let executor = Arc::new(ScriptedExecutor::with_delay(Duration::from_secs(30)));
    let runner = runner(
        &temp_dir,
        config(ConflictPolicy::Proceed, FailurePolicy::HaltEpic),
        executor,
    );
    let mut epic = Epic::new("EPIC-CANCEL", "Cancel", independent_stories(3));
    epic.run_id = "run-cancel".to_string();

    let handle = runner.cancel_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.cancel();
    });
    let report = tokio::time::timeout(Duration::from_secs(5), runner.run(epic))
        .await
        .expect("run returns promptly after cancel")
        .expect("run");

    assert_eq!(report.status(), EpicStatus::Paused);
    assert_eq!(report.count(StoryStatus::Pending), 3);
    let persisted = runner
        .state_manager()
        .load("EPIC-CANCEL", "run-cancel")
        .expect("load");
    assert_eq!(persisted.status, EpicStatus::Paused);
    assert_eq!(persisted.count(StoryStatus::Running), 0);
}

/// A role without an executor fails the run up front.
#[tokio::test]
async fn test_missing_executor_for_role() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let executor = Arc::new(ScriptedExecutor::new());
    let runner = EpicRunner::new(
        config(ConflictPolicy::Proceed, FailurePolicy::HaltEpic),
        ExecutorRegistry::new().register(AgentRole::Implementer, executor.clone()),
        state_manager(&temp_dir),
    );
    let epic = Epic::new(
        "EPIC-ROLE",
        "Roles",
        vec![
            Story::new("A", "build"),
            Story::new("R", "review")
                .with_role(AgentRole::Reviewer)
                .with_dependencies(["A"]),
        ],
    );

    match runner.run(epic).await.unwrap_err() {
        EngineError::MissingExecutor { role, stories } => {
            assert_eq!(role, AgentRole::Reviewer);
            assert_eq!(stories, vec!["R"]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(executor.call_count(), 0);
}

/// Executors see the outcomes of earlier waves through the epic context.
#[tokio::test]
async fn test_context_carries_completed_stories() {
    struct ContextRecorder {
        seen: std::sync::Mutex<Vec<(String, Vec<String>)>>,
    }

    #[async_trait]
    impl StoryExecutor for ContextRecorder {
        async fn execute(&self, request: StoryRequest) -> Result<StoryOutcome, ExecutorError> {
            let completed = request
                .context
                .completed
                .iter()
                .map(|c| c.id.clone())
                .collect();
            self.seen
                .lock()
                .expect("seen lock")
                .push((request.story.id.clone(), completed));
            Ok(StoryOutcome::success(None))
        }
    }

    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let recorder = Arc::new(ContextRecorder {
        seen: std::sync::Mutex::new(Vec::new()),
    });
    let runner = EpicRunner::new(
        config(ConflictPolicy::Serialize, FailurePolicy::HaltEpic),
        ExecutorRegistry::new().with_default(recorder.clone()),
        state_manager(&temp_dir),
    );

    let report = runner.run(abc_epic()).await.expect("run");

    assert!(report.is_success());
    let seen = recorder.seen.lock().expect("seen lock");
    let (_, for_c) = seen.iter().find(|(id, _)| id == "C").expect("C executed");
    assert_eq!(for_c, &vec!["A".to_string(), "B".to_string()]);
}
