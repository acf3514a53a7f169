//! Epic run loop.
//!
//! [`EpicRunner`] drives an epic wave by wave: compute the ready wave from
//! the dependency graph, check it for file conflicts, execute it, persist,
//! repeat. Waves are strictly ordered; wave K+1 is computed only after every
//! story of wave K is terminal.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::{ConflictPolicy, EngineConfig};
use crate::epic::{generate_run_id, Epic, EpicStatus, Story, StoryStatus};
use crate::error::{EngineError, EngineResult};
use crate::executor::ExecutorRegistry;
use crate::journal::EventJournal;
use crate::metrics::{RunMetrics, RunMetricsCollector};
use crate::parallel::conflict::{Conflict, ConflictDetector};
use crate::parallel::dependency::DependencyGraph;
use crate::parallel::wave::{propagate_skips, WaveExecutor, WaveHalt};
use crate::state::{validate_identifier, ResumeOptions, StateManager};

/// Final result of a run or resume.
#[derive(Debug, Clone)]
pub struct EpicReport {
    /// The epic as last persisted.
    pub epic: Epic,
    /// Story count per status label.
    pub counts: BTreeMap<String, usize>,
    pub waves_executed: usize,
    pub metrics: RunMetrics,
    /// Conflicts detected across all waves of this invocation.
    pub conflicts: Vec<Conflict>,
}

impl EpicReport {
    fn new(
        epic: Epic,
        waves_executed: usize,
        metrics: RunMetrics,
        conflicts: Vec<Conflict>,
    ) -> Self {
        Self {
            counts: epic.status_counts(),
            epic,
            waves_executed,
            metrics,
            conflicts,
        }
    }

    pub fn status(&self) -> EpicStatus {
        self.epic.status
    }

    pub fn is_success(&self) -> bool {
        self.epic.status == EpicStatus::Completed
    }

    pub fn count(&self, status: StoryStatus) -> usize {
        self.counts.get(status.as_label()).copied().unwrap_or(0)
    }
}

/// Cancels a running epic from another task.
///
/// In-flight stories stop waiting on their executors and return to
/// `pending`; the epic is persisted as `paused`. Cancellation is sticky for
/// the runner it came from.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    sender: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }
}

/// Runs epics against a registry of story executors.
pub struct EpicRunner {
    config: EngineConfig,
    registry: ExecutorRegistry,
    state: StateManager,
    cancel_tx: Arc<watch::Sender<bool>>,
}

impl EpicRunner {
    /// State writes made by this runner follow `config.storage_retry`,
    /// whatever policy `state` was built with.
    pub fn new(config: EngineConfig, registry: ExecutorRegistry, state: StateManager) -> Self {
        let (cancel_tx, _cancel_rx) = watch::channel(false);
        let state = state.with_retry(config.storage_retry);
        Self {
            config,
            registry,
            state,
            cancel_tx: Arc::new(cancel_tx),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn state_manager(&self) -> &StateManager {
        &self.state
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            sender: self.cancel_tx.clone(),
        }
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel_tx.borrow()
    }

    /// Start a new run of `epic`.
    ///
    /// The graph is validated before anything executes or is persisted: a
    /// cycle or dangling dependency fails the call with zero stories run. A
    /// missing run ID is generated.
    pub async fn run(&self, mut epic: Epic) -> EngineResult<EpicReport> {
        self.config.validate()?;
        validate_identifier("epic", &epic.epic_id)?;
        if epic.stories.is_empty() {
            return Err(EngineError::EmptyEpic(epic.epic_id));
        }
        let graph = match DependencyGraph::build(&epic.stories) {
            Ok(graph) => graph,
            Err(err) => {
                error!(epic_id = %epic.epic_id, error = %err, "invalid story graph");
                return Err(err);
            }
        };
        self.registry.ensure_covers(&epic.stories)?;

        if epic.run_id.is_empty() {
            epic.run_id = generate_run_id();
        }
        validate_identifier("run", &epic.run_id)?;
        epic.status = EpicStatus::InProgress;
        info!(
            epic_id = %epic.epic_id,
            run_id = %epic.run_id,
            stories = epic.stories.len(),
            planned_waves = graph.waves().len(),
            conflict_policy = self.config.conflict_policy.as_label(),
            failure_policy = self.config.failure_policy.as_label(),
            "starting epic run"
        );
        self.state.save(&mut epic).await?;

        self.drive(epic, graph, false).await
    }

    /// Continue a persisted run.
    ///
    /// Completed stories are never re-executed. Stories caught mid-flight
    /// are redone. An already finished run is returned as-is, without
    /// executing or persisting anything.
    pub async fn resume(
        &self,
        epic_id: &str,
        run_id: &str,
        options: ResumeOptions,
    ) -> EngineResult<EpicReport> {
        self.config.validate()?;
        let plan = self.state.resume(epic_id, run_id, options)?;
        if plan.is_finished() {
            info!(epic_id, run_id, status = %plan.epic.status, "run already finished");
            let metrics = RunMetricsCollector::new(run_id).finish();
            return Ok(EpicReport::new(plan.epic, 0, metrics, Vec::new()));
        }
        self.registry.ensure_covers(&plan.epic.stories)?;

        let mut epic = plan.epic;
        epic.status = EpicStatus::InProgress;
        epic.halt_reason = None;
        epic.completed_at = None;
        self.state.save(&mut epic).await?;

        self.drive(epic, plan.graph, true).await
    }

    async fn drive(
        &self,
        mut epic: Epic,
        graph: DependencyGraph,
        resumed: bool,
    ) -> EngineResult<EpicReport> {
        let metrics = RunMetricsCollector::new(epic.run_id.clone());
        let journal = self.open_journal(&epic);
        if let Some(journal) = &journal {
            journal.emit_run_start(resumed, epic.stories.len());
        }
        let executor = WaveExecutor::new(
            self.config.clone(),
            self.registry.clone(),
            self.state.clone(),
            self.cancel_tx.subscribe(),
        )
        .with_metrics(metrics.clone())
        .with_journal(journal.clone());

        // Failures carried over from an earlier attempt still block their
        // dependents.
        let carried: Vec<String> = epic
            .stories
            .iter()
            .filter(|s| s.status == StoryStatus::Failed)
            .map(|s| s.id.clone())
            .collect();
        let mut skipped = Vec::new();
        for failed_id in &carried {
            skipped.extend(propagate_skips(&mut epic, &graph, failed_id));
        }
        if !skipped.is_empty() {
            self.state.save(&mut epic).await?;
        }

        let mut conflicts_seen = Vec::new();
        let mut waves_executed = 0;
        let mut halt = None;
        loop {
            if self.is_cancelled() {
                halt = Some(WaveHalt::Cancelled);
                break;
            }
            let wave_ids = graph.ready_wave(&epic);
            if wave_ids.is_empty() {
                break;
            }
            let wave = waves_executed;

            let members: Vec<&Story> = wave_ids.iter().filter_map(|id| epic.story(id)).collect();
            let conflicts = ConflictDetector::detect(&members);
            if !conflicts.is_empty() {
                self.handle_conflicts(&mut epic, wave, &conflicts, journal.as_ref(), &metrics)
                    .await?;
                conflicts_seen.extend(conflicts);
            }

            for story_id in &wave_ids {
                if let Some(story) = epic.story_mut(story_id) {
                    story.mark_ready();
                }
            }
            self.state.save(&mut epic).await?;
            if let Some(journal) = &journal {
                journal.emit_wave_start(wave, &wave_ids);
            }
            info!(
                epic_id = %epic.epic_id,
                run_id = %epic.run_id,
                wave,
                stories = ?wave_ids,
                "starting wave"
            );

            let report = executor.execute(&mut epic, &graph, wave, &wave_ids).await?;
            waves_executed += 1;
            info!(
                wave,
                completed = report.completed.len(),
                failed = report.failed.len(),
                skipped = report.skipped.len(),
                "wave settled"
            );
            if report.halt.is_some() {
                halt = report.halt;
                break;
            }
        }

        let (status, halt_reason) = match halt {
            _ if epic.all_completed() => (EpicStatus::Completed, None),
            Some(WaveHalt::Cancelled) if !epic.all_terminal() => {
                (EpicStatus::Paused, Some(WaveHalt::Cancelled.to_string()))
            }
            Some(halt) => (EpicStatus::Failed, Some(halt.to_string())),
            None => (
                EpicStatus::Failed,
                Some(format!(
                    "{} stories failed, {} skipped",
                    epic.count(StoryStatus::Failed),
                    epic.count(StoryStatus::Skipped)
                )),
            ),
        };
        epic.finish(status, halt_reason);
        self.state.save(&mut epic).await?;

        let run_metrics = metrics.finish();
        if let Some(journal) = &journal {
            journal.emit_run_complete(&epic, serde_json::to_value(&run_metrics).ok());
        }
        info!(
            epic_id = %epic.epic_id,
            run_id = %epic.run_id,
            status = %epic.status,
            waves = waves_executed,
            revision = epic.revision,
            "epic run finished"
        );
        Ok(EpicReport::new(epic, waves_executed, run_metrics, conflicts_seen))
    }

    async fn handle_conflicts(
        &self,
        epic: &mut Epic,
        wave: usize,
        conflicts: &[Conflict],
        journal: Option<&EventJournal>,
        metrics: &RunMetricsCollector,
    ) -> EngineResult<()> {
        let policy = self.config.conflict_policy;
        if let Some(journal) = journal {
            for conflict in conflicts {
                journal.emit_conflict(wave, conflict, policy.as_label());
            }
        }

        match policy {
            ConflictPolicy::Abort => {
                let err = EngineError::ConflictDetected {
                    wave,
                    conflicts: conflicts.to_vec(),
                };
                error!(epic_id = %epic.epic_id, run_id = %epic.run_id, error = %err, "aborting run");
                epic.finish(EpicStatus::Failed, Some(err.to_string()));
                self.state.save(epic).await?;
                if let Some(journal) = journal {
                    journal.emit_run_complete(epic, serde_json::to_value(metrics.finish()).ok());
                }
                Err(err)
            }
            ConflictPolicy::Proceed => {
                for conflict in conflicts {
                    warn!(
                        wave,
                        story_a = %conflict.story_a,
                        story_b = %conflict.story_b,
                        files = ?conflict.files,
                        "file conflict; running in parallel anyway"
                    );
                }
                Ok(())
            }
            ConflictPolicy::Serialize => {
                info!(
                    wave,
                    conflicts = conflicts.len(),
                    "serializing conflicting stories"
                );
                Ok(())
            }
        }
    }

    fn open_journal(&self, epic: &Epic) -> Option<EventJournal> {
        if !self.config.journal {
            return None;
        }
        let run_dir = self.state.run_dir(epic)?;
        match EventJournal::try_new(&run_dir, &epic.epic_id, &epic.run_id) {
            Ok(journal) => Some(journal),
            Err(err) => {
                warn!(
                    path = %run_dir.display(),
                    error = %err,
                    "event journal unavailable"
                );
                None
            }
        }
    }
}
