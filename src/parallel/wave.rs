//! Wave execution.
//!
//! Each story of a wave runs as its own task, at most `max_concurrency` at a
//! time. Task results flow back to a single coordinator, which applies the
//! transition to the epic and persists it before looking at the next result.
//! Story execution is parallel; state mutation never is.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::{self, JoinSet};
use tracing::{debug, error, info, warn};

use crate::config::{ConflictPolicy, EngineConfig, FailurePolicy};
use crate::epic::{Epic, ExecutionStatus, FailureReason, StoryStatus};
use crate::error::{EngineError, EngineResult};
use crate::executor::{
    EpicContext, ExecutorError, ExecutorRegistry, OutcomeStatus, StoryExecutor, StoryOutcome,
    StoryRequest,
};
use crate::journal::EventJournal;
use crate::metrics::RunMetricsCollector;
use crate::parallel::conflict::FileLockTable;
use crate::parallel::dependency::DependencyGraph;
use crate::quality::QualityGate;
use crate::state::StateManager;

/// Why a wave stopped dispatching before its queue drained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaveHalt {
    /// A story failed under the `halt_epic` policy.
    StoryFailed(String),
    /// Cumulative failures reached the circuit breaker threshold.
    CircuitBreaker { failures: usize, threshold: u32 },
    /// The run was cancelled.
    Cancelled,
}

impl fmt::Display for WaveHalt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaveHalt::StoryFailed(story_id) => {
                write!(f, "story '{story_id}' failed under halt_epic policy")
            }
            WaveHalt::CircuitBreaker {
                failures,
                threshold,
            } => write!(
                f,
                "circuit breaker tripped after {failures} failed stories (threshold {threshold})"
            ),
            WaveHalt::Cancelled => f.write_str("run cancelled"),
        }
    }
}

/// What happened to the stories of one wave.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WaveReport {
    pub wave: usize,
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    /// Downstream stories skipped because of failures in this wave.
    pub skipped: Vec<String>,
    /// Stories returned to `pending` by cancellation.
    pub interrupted: Vec<String>,
    pub retries: u32,
    pub halt: Option<WaveHalt>,
}

impl WaveReport {
    fn new(wave: usize) -> Self {
        Self {
            wave,
            ..Self::default()
        }
    }
}

enum AttemptOutcome {
    Finished(Result<StoryOutcome, ExecutorError>),
    TimedOut,
    Panicked(String),
    /// The task itself died outside the executor call.
    Lost(String),
    Cancelled,
}

struct Attempt {
    story_id: String,
    outcome: AttemptOutcome,
    duration: Duration,
}

/// Spawned attempts, keyed by task so a task that dies still maps back to
/// its story.
#[derive(Default)]
struct InFlight {
    tasks: JoinSet<Attempt>,
    stories: HashMap<task::Id, String>,
}

impl InFlight {
    fn spawn<F>(&mut self, story_id: String, attempt: F)
    where
        F: Future<Output = Attempt> + Send + 'static,
    {
        let handle = self.tasks.spawn(attempt);
        self.stories.insert(handle.id(), story_id);
    }

    /// The next settled attempt, or `None` once nothing is in flight.
    async fn next(&mut self) -> Option<Attempt> {
        loop {
            match self.tasks.join_next_with_id().await? {
                Ok((id, attempt)) => {
                    self.stories.remove(&id);
                    return Some(attempt);
                }
                Err(err) => {
                    let Some(story_id) = self.stories.remove(&err.id()) else {
                        error!(error = %err, "untracked story task did not complete");
                        continue;
                    };
                    error!(story_id = %story_id, error = %err, "story task did not complete");
                    return Some(Attempt {
                        story_id,
                        outcome: AttemptOutcome::Lost(err.to_string()),
                        duration: Duration::ZERO,
                    });
                }
            }
        }
    }
}

/// Runs the stories of a wave against their executors.
#[derive(Clone)]
pub struct WaveExecutor {
    config: EngineConfig,
    registry: ExecutorRegistry,
    state: StateManager,
    gate: QualityGate,
    semaphore: Arc<Semaphore>,
    metrics: RunMetricsCollector,
    journal: Option<EventJournal>,
    cancel_rx: watch::Receiver<bool>,
}

impl WaveExecutor {
    pub fn new(
        config: EngineConfig,
        registry: ExecutorRegistry,
        state: StateManager,
        cancel_rx: watch::Receiver<bool>,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
        let gate = QualityGate::new(config.quality_threshold);
        Self {
            config,
            registry,
            state,
            gate,
            semaphore,
            metrics: RunMetricsCollector::new(String::new()),
            journal: None,
            cancel_rx,
        }
    }

    pub fn with_metrics(mut self, metrics: RunMetricsCollector) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_journal(mut self, journal: Option<EventJournal>) -> Self {
        self.journal = journal;
        self
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    /// Execute `story_ids` (one wave) to completion.
    ///
    /// Returns once every dispatched story has settled. Stories that were
    /// never dispatched because the wave halted go back to `pending`. The
    /// only errors are fatal ones, such as a state write that kept failing.
    pub async fn execute(
        &self,
        epic: &mut Epic,
        graph: &DependencyGraph,
        wave: usize,
        story_ids: &[String],
    ) -> EngineResult<WaveReport> {
        self.metrics.record_wave();
        let mut report = WaveReport::new(wave);
        let mut queue: VecDeque<String> = story_ids.iter().cloned().collect();
        let mut locks = FileLockTable::default();
        let mut tasks = InFlight::default();
        let context = Arc::new(EpicContext::from_epic(epic, wave));

        loop {
            if report.halt.is_none() {
                if self.is_cancelled() {
                    report.halt = Some(WaveHalt::Cancelled);
                } else {
                    self.dispatch(epic, wave, &context, &mut queue, &mut locks, &mut tasks)
                        .await?;
                }
            }

            let Some(attempt) = tasks.next().await else {
                break;
            };
            locks.release(&attempt.story_id);
            self.metrics
                .finish_step(&attempt.story_id, attempt.duration);
            self.settle(epic, graph, wave, attempt, &mut queue, &mut report)
                .await?;
        }

        if report.halt.is_none() && self.is_cancelled() && !queue.is_empty() {
            report.halt = Some(WaveHalt::Cancelled);
        }

        let mut reverted = Vec::new();
        for story_id in queue {
            if let Some(story) = epic.story_mut(&story_id) {
                if story.status == StoryStatus::Ready {
                    story.reset_to_pending();
                    reverted.push(story_id);
                }
            }
        }
        if !reverted.is_empty() {
            debug!(wave, stories = ?reverted, "undispatched stories returned to pending");
            self.state.save(epic).await?;
        }

        Ok(report)
    }

    /// Start as many queued stories as permits (and, under `serialize`, file
    /// locks) allow.
    async fn dispatch(
        &self,
        epic: &mut Epic,
        wave: usize,
        context: &Arc<EpicContext>,
        queue: &mut VecDeque<String>,
        locks: &mut FileLockTable,
        tasks: &mut InFlight,
    ) -> EngineResult<()> {
        let serialize = self.config.conflict_policy == ConflictPolicy::Serialize;
        let mut waiting = Vec::new();

        while let Some(story_id) = queue.pop_front() {
            let Some(story) = epic.story(&story_id) else {
                continue;
            };
            if story.is_terminal() {
                continue;
            }
            let role = story.role;
            let files = story.files.clone();

            let Ok(permit) = self.semaphore.clone().try_acquire_owned() else {
                queue.push_front(story_id);
                break;
            };
            if serialize && !locks.acquire(&story_id, &files) {
                debug!(story_id = %story_id, wave, "story waiting on file locks");
                drop(permit);
                waiting.push(story_id);
                continue;
            }
            let Some(executor) = self.registry.get(role) else {
                return Err(EngineError::MissingExecutor {
                    role,
                    stories: vec![story_id],
                });
            };

            let Some(story) = epic.story_mut(&story_id) else {
                continue;
            };
            story.mark_running();
            let retry_count = story.retry_count;
            let request = StoryRequest {
                story: story.clone(),
                attempt: retry_count + 1,
                context: context.clone(),
            };
            self.state.save(epic).await?;

            self.metrics.start_step(&story_id);
            info!(
                epic_id = %epic.epic_id,
                run_id = %epic.run_id,
                story_id = %story_id,
                wave,
                attempt = retry_count + 1,
                "story dispatched"
            );
            tasks.spawn(
                story_id,
                run_attempt(
                    executor,
                    request,
                    permit,
                    self.config.story_retry.delay_for(retry_count),
                    self.config.story_timeout,
                    self.cancel_rx.clone(),
                ),
            );
        }

        for story_id in waiting.into_iter().rev() {
            queue.push_front(story_id);
        }
        Ok(())
    }

    /// Apply one finished attempt to the epic and persist it.
    async fn settle(
        &self,
        epic: &mut Epic,
        graph: &DependencyGraph,
        wave: usize,
        attempt: Attempt,
        queue: &mut VecDeque<String>,
        report: &mut WaveReport,
    ) -> EngineResult<()> {
        let Attempt {
            story_id, outcome, ..
        } = attempt;
        let max_retries = self.config.story_retry.max_retries;
        let Some(story) = epic.story_mut(&story_id) else {
            return Ok(());
        };

        let (failure, retryable) = match outcome {
            AttemptOutcome::Cancelled => {
                story.reset_to_pending();
                info!(story_id = %story_id, wave, "story interrupted by cancellation");
                report.interrupted.push(story_id);
                return self.state.save(epic).await;
            }
            AttemptOutcome::Finished(Ok(result)) if result.status == OutcomeStatus::Success => {
                story.files_changed = result.files_changed;
                let gate = self.gate.evaluate(result.quality_score);
                match gate.failure_reason() {
                    None => {
                        story.mark_completed(gate.score, gate.verdict);
                        (None, false)
                    }
                    Some(reason) => (Some((ExecutionStatus::Succeeded, reason)), false),
                }
            }
            AttemptOutcome::Finished(Ok(result)) => {
                story.files_changed = result.files_changed;
                let message = result
                    .error
                    .unwrap_or_else(|| "executor reported failure".to_string());
                (
                    Some((ExecutionStatus::Failed, FailureReason::ExecutionError { message })),
                    false,
                )
            }
            AttemptOutcome::Finished(Err(err)) => (
                Some((
                    ExecutionStatus::Failed,
                    FailureReason::ExecutionError {
                        message: err.to_string(),
                    },
                )),
                err.is_transient(),
            ),
            AttemptOutcome::TimedOut => (
                Some((
                    ExecutionStatus::Failed,
                    FailureReason::Timeout {
                        after_ms: self.config.story_timeout.as_millis() as u64,
                    },
                )),
                true,
            ),
            AttemptOutcome::Panicked(message) => (
                Some((
                    ExecutionStatus::Failed,
                    FailureReason::ExecutionError {
                        message: format!("executor panicked: {message}"),
                    },
                )),
                false,
            ),
            AttemptOutcome::Lost(message) => (
                Some((
                    ExecutionStatus::Failed,
                    FailureReason::ExecutionError {
                        message: format!("story task did not complete: {message}"),
                    },
                )),
                false,
            ),
        };

        let Some((execution, reason)) = failure else {
            info!(
                story_id = %story_id,
                wave,
                quality_score = ?story.quality_score,
                "story completed"
            );
            self.metrics.complete_step(&story_id, true, None);
            report.completed.push(story_id.clone());
            self.state.save(epic).await?;
            self.journal_story(epic, wave, &story_id);
            return Ok(());
        };

        if retryable && story.retry_count < max_retries {
            story.retry_count += 1;
            story.reset_to_pending();
            story.mark_ready();
            warn!(
                story_id = %story_id,
                wave,
                retry = story.retry_count,
                max_retries,
                reason = %reason,
                "retrying story"
            );
            report.retries += 1;
            queue.push_back(story_id);
            return self.state.save(epic).await;
        }

        warn!(story_id = %story_id, wave, reason = %reason, "story failed");
        self.metrics
            .complete_step(&story_id, false, Some(reason.to_string()));
        story.mark_failed(execution, reason);
        report.failed.push(story_id.clone());
        let skipped = propagate_skips(epic, graph, &story_id);
        self.state.save(epic).await?;

        self.journal_story(epic, wave, &story_id);
        for skipped_id in &skipped {
            self.journal_story(epic, wave, skipped_id);
        }
        report.skipped.extend(skipped);

        if report.halt.is_none() {
            report.halt = self.halt_after_failure(epic, &story_id);
            if let Some(halt) = &report.halt {
                warn!(wave, reason = %halt, "halting dispatch; in-flight stories will finish");
            }
        }
        Ok(())
    }

    fn halt_after_failure(&self, epic: &Epic, story_id: &str) -> Option<WaveHalt> {
        match self.config.failure_policy {
            FailurePolicy::HaltEpic => Some(WaveHalt::StoryFailed(story_id.to_string())),
            FailurePolicy::SkipDependents => {
                let threshold = self.config.circuit_breaker_threshold?;
                let failures = epic.count(StoryStatus::Failed);
                (failures >= threshold as usize).then_some(WaveHalt::CircuitBreaker {
                    failures,
                    threshold,
                })
            }
        }
    }

    fn journal_story(&self, epic: &Epic, wave: usize, story_id: &str) {
        if let (Some(journal), Some(story)) = (&self.journal, epic.story(story_id)) {
            journal.emit_story(wave, story);
        }
    }
}

/// Mark every not-yet-started story downstream of `failed_id` as skipped.
/// Returns the stories that changed, nearest first.
pub(crate) fn propagate_skips(
    epic: &mut Epic,
    graph: &DependencyGraph,
    failed_id: &str,
) -> Vec<String> {
    let mut skipped = Vec::new();
    for dependent in graph.transitive_dependents(failed_id) {
        if let Some(story) = epic.story_mut(&dependent) {
            if matches!(story.status, StoryStatus::Pending | StoryStatus::Ready) {
                story.mark_skipped(failed_id);
                skipped.push(dependent);
            }
        }
    }
    if !skipped.is_empty() {
        warn!(story_id = failed_id, skipped = ?skipped, "skipping dependents of failed story");
    }
    skipped
}

async fn run_attempt(
    executor: Arc<dyn StoryExecutor>,
    request: StoryRequest,
    permit: OwnedSemaphorePermit,
    delay: Duration,
    timeout: Duration,
    mut cancel_rx: watch::Receiver<bool>,
) -> Attempt {
    // Held for the lifetime of the task.
    let _permit = permit;
    let story_id = request.story.id.clone();

    if !delay.is_zero() {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancelled(&mut cancel_rx) => {
                return Attempt {
                    story_id,
                    outcome: AttemptOutcome::Cancelled,
                    duration: Duration::ZERO,
                };
            }
        }
    }

    let start = Instant::now();
    let execution = AssertUnwindSafe(executor.execute(request)).catch_unwind();
    let outcome = tokio::select! {
        result = tokio::time::timeout(timeout, execution) => match result {
            Ok(Ok(result)) => AttemptOutcome::Finished(result),
            Ok(Err(payload)) => AttemptOutcome::Panicked(panic_message(payload)),
            Err(_) => AttemptOutcome::TimedOut,
        },
        _ = cancelled(&mut cancel_rx) => AttemptOutcome::Cancelled,
    };

    Attempt {
        story_id,
        outcome,
        duration: start.elapsed(),
    }
}

/// Resolves once the cancel flag is set. Never resolves if the sender is gone.
async fn cancelled(cancel_rx: &mut watch::Receiver<bool>) {
    loop {
        if *cancel_rx.borrow_and_update() {
            return;
        }
        if cancel_rx.changed().await.is_err() {
            futures::future::pending::<()>().await;
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
