//! Run metrics collection.
//!
//! Tracks per-story attempts and durations plus the peak number of stories
//! running at once.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use serde::{Deserialize, Serialize};

/// Metrics for a single story within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepMetrics {
    pub story_id: String,
    /// Executor invocations, retries included.
    pub attempts: u32,
    /// Time spent executing, summed over attempts.
    pub duration: Duration,
    pub success: bool,
    pub error: Option<String>,
}

impl StepMetrics {
    fn new(story_id: impl Into<String>) -> Self {
        Self {
            story_id: story_id.into(),
            attempts: 0,
            duration: Duration::ZERO,
            success: false,
            error: None,
        }
    }
}

/// Aggregated metrics for a single run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetrics {
    pub run_id: String,
    pub started_at: SystemTime,
    pub run_duration: Duration,
    pub waves_executed: u32,
    pub steps_attempted: u32,
    pub steps_completed: u32,
    pub failures: u32,
    pub retries: u32,
    pub peak_concurrency: usize,
    pub steps: Vec<StepMetrics>,
}

#[derive(Debug)]
struct RunMetricsState {
    run_id: String,
    started_at: SystemTime,
    started_instant: Instant,
    waves_executed: u32,
    running: usize,
    peak_concurrency: usize,
    steps: BTreeMap<String, StepMetrics>,
}

/// Thread-safe run metrics collector.
#[derive(Debug, Clone)]
pub struct RunMetricsCollector {
    inner: Arc<Mutex<RunMetricsState>>,
}

impl RunMetricsCollector {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RunMetricsState {
                run_id: run_id.into(),
                started_at: SystemTime::now(),
                started_instant: Instant::now(),
                waves_executed: 0,
                running: 0,
                peak_concurrency: 0,
                steps: BTreeMap::new(),
            })),
        }
    }

    pub fn record_wave(&self) {
        if let Ok(mut state) = self.inner.lock() {
            state.waves_executed += 1;
        }
    }

    /// Record that an attempt of a story started running.
    pub fn start_step(&self, story_id: &str) {
        if let Ok(mut state) = self.inner.lock() {
            state.running += 1;
            state.peak_concurrency = state.peak_concurrency.max(state.running);
            state
                .steps
                .entry(story_id.to_string())
                .or_insert_with(|| StepMetrics::new(story_id))
                .attempts += 1;
        }
    }

    /// Record the end of an attempt.
    pub fn finish_step(&self, story_id: &str, duration: Duration) {
        if let Ok(mut state) = self.inner.lock() {
            state.running = state.running.saturating_sub(1);
            if let Some(step) = state.steps.get_mut(story_id) {
                step.duration += duration;
            }
        }
    }

    /// Record the final outcome of a story.
    pub fn complete_step(&self, story_id: &str, success: bool, error: Option<String>) {
        if let Ok(mut state) = self.inner.lock() {
            let step = state
                .steps
                .entry(story_id.to_string())
                .or_insert_with(|| StepMetrics::new(story_id));
            step.success = success;
            step.error = error;
        }
    }

    pub fn peak_concurrency(&self) -> usize {
        self.inner.lock().map(|s| s.peak_concurrency).unwrap_or(0)
    }

    /// Snapshot the collected metrics.
    pub fn finish(&self) -> RunMetrics {
        let Ok(state) = self.inner.lock() else {
            return RunMetrics {
                run_id: String::new(),
                started_at: SystemTime::now(),
                run_duration: Duration::ZERO,
                waves_executed: 0,
                steps_attempted: 0,
                steps_completed: 0,
                failures: 0,
                retries: 0,
                peak_concurrency: 0,
                steps: Vec::new(),
            };
        };

        let steps: Vec<StepMetrics> = state.steps.values().cloned().collect();
        let steps_completed = steps.iter().filter(|s| s.success).count() as u32;
        let failures = steps
            .iter()
            .filter(|s| !s.success && s.error.is_some())
            .count() as u32;
        let retries = steps.iter().map(|s| s.attempts.saturating_sub(1)).sum();

        RunMetrics {
            run_id: state.run_id.clone(),
            started_at: state.started_at,
            run_duration: state.started_instant.elapsed(),
            waves_executed: state.waves_executed,
            steps_attempted: steps.len() as u32,
            steps_completed,
            failures,
            retries,
            peak_concurrency: state.peak_concurrency,
            steps,
        }
    }
}
