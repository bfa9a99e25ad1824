//! Analysis orchestration.
//!
//! The [`Orchestrator`] owns the analyzer registry and the run state. A run:
//! 1. Builds dependency layers from the registered analyzers
//! 2. Executes the layers in order, each one in parallel
//! 3. Aggregates the results into an overall score
//!
//! Only one run may be active per instance; a second `run_all` fails with
//! `AlreadyInProgress` and leaves the active run untouched.

mod executor;
mod reporter;
mod scheduler;

pub use reporter::{ProgressReporter, ProgressSink, ReporterTask};
pub use scheduler::{build_layers, DependencyGraph, Schedule, ScheduleWarning};

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::domain::{overall_score, AnalyzerType, ResultsMap, RunSummary, WebsiteData};
use crate::error::{AnalysisError, Result, RunError};
use crate::service::analyzers::{create_analyzer, create_analyzer_named, Analyzer, AnalyzerDeps};
use crate::service::context::RunContext;
use executor::{LayerExecutor, SharedAnalyzer};

/// Outcome of a successful run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub results: ResultsMap,
    pub overall_score: Option<f64>,
    pub layers: Vec<Vec<AnalyzerType>>,
    pub warnings: Vec<ScheduleWarning>,
    pub elapsed_ms: u64,
}

#[derive(Default)]
struct RunState {
    is_executing: bool,
    started_at: Option<Instant>,
    run_id: Option<Uuid>,
    token: Option<CancellationToken>,
}

/// Resets the run state when a run ends, however it ends.
struct RunGuard<'a> {
    state: &'a Mutex<RunState>,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        *state = RunState::default();
    }
}

struct Registered {
    priority: i32,
    analyzer: SharedAnalyzer,
}

/// Dependency-aware analyzer runner.
pub struct Orchestrator {
    registry: BTreeMap<AnalyzerType, Registered>,
    graph: DependencyGraph,
    sink: Option<Arc<dyn ProgressSink>>,
    // Separate from the results lock held inside a run
    state: Mutex<RunState>,
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new(DependencyGraph::standard())
    }
}

impl Orchestrator {
    pub fn new(graph: DependencyGraph) -> Self {
        Self {
            registry: BTreeMap::new(),
            graph,
            sink: None,
            state: Mutex::new(RunState::default()),
        }
    }

    pub fn with_progress_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn set_progress_sink(&mut self, sink: Option<Arc<dyn ProgressSink>>) {
        self.sink = sink;
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Add an analyzer. Each type may be registered once.
    pub fn register(&mut self, analyzer: Box<dyn Analyzer>) -> Result<()> {
        let kind = analyzer.analyzer_type();
        if self.registry.contains_key(&kind) {
            return Err(AnalysisError::DuplicateAnalyzer(kind));
        }
        let priority = analyzer.priority();
        tracing::debug!("[ORCHESTRATOR] Registered {} (priority {})", kind, priority);
        self.registry.insert(
            kind,
            Registered {
                priority,
                analyzer: Arc::new(tokio::sync::Mutex::new(analyzer)),
            },
        );
        Ok(())
    }

    /// Build the analyzer called `name` through the factory and register it.
    pub fn register_named(&mut self, name: &str, deps: &AnalyzerDeps) -> Result<AnalyzerType> {
        let analyzer = create_analyzer_named(name, deps)?;
        let kind = analyzer.analyzer_type();
        self.register(analyzer)?;
        Ok(kind)
    }

    /// Register several analyzer types with their default priorities.
    pub fn register_all(&mut self, kinds: &[AnalyzerType], deps: &AnalyzerDeps) -> Result<()> {
        for kind in kinds {
            self.register(create_analyzer(*kind, deps)?)?;
        }
        Ok(())
    }

    pub fn unregister(&mut self, kind: AnalyzerType) -> Result<()> {
        self.registry
            .remove(&kind)
            .map(|_| ())
            .ok_or(AnalysisError::NotRegistered(kind))
    }

    pub fn registered(&self) -> Vec<AnalyzerType> {
        self.registry.keys().copied().collect()
    }

    /// The layers the next run would use.
    pub fn schedule(&self) -> Schedule {
        let registered: Vec<(AnalyzerType, i32)> = self
            .registry
            .iter()
            .map(|(kind, entry)| (*kind, entry.priority))
            .collect();
        build_layers(&registered, &self.graph)
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self) -> bool {
        self.lock_state().is_executing
    }

    /// Time since the active run started.
    pub fn running_for(&self) -> Option<Duration> {
        self.lock_state().started_at.map(|t| t.elapsed())
    }

    pub fn current_run_id(&self) -> Option<Uuid> {
        self.lock_state().run_id
    }

    /// Cancel the active run. Returns false when nothing is running.
    pub fn cancel(&self) -> bool {
        let state = self.lock_state();
        match &state.token {
            Some(token) if state.is_executing => {
                tracing::info!("[ORCHESTRATOR] Cancelling run {:?}", state.run_id);
                token.cancel();
                true
            }
            _ => false,
        }
    }

    fn begin_run(&self, token: CancellationToken) -> std::result::Result<(RunGuard<'_>, Uuid), AnalysisError> {
        let mut state = self.lock_state();
        if state.is_executing {
            return Err(AnalysisError::AlreadyInProgress);
        }
        let run_id = Uuid::new_v4();
        *state = RunState {
            is_executing: true,
            started_at: Some(Instant::now()),
            run_id: Some(run_id),
            token: Some(token),
        };
        Ok((RunGuard { state: &self.state }, run_id))
    }

    /// Run every registered analyzer against `data`.
    ///
    /// A failure stops the run at the next layer boundary; the returned
    /// [`RunError`] still carries every result completed before it.
    pub async fn run_all(
        &self,
        ctx: &RunContext,
        data: Arc<WebsiteData>,
    ) -> std::result::Result<RunReport, RunError> {
        let run_ctx = ctx.child();
        let (_guard, run_id) = self
            .begin_run(run_ctx.token().clone())
            .map_err(RunError::before_start)?;

        let started = Instant::now();
        let schedule = self.schedule();
        let analyzer_count = schedule.analyzer_count();
        tracing::info!(
            "[ORCHESTRATOR] Run {} for {}: {} analyzers in {} layers",
            run_id,
            data.url,
            analyzer_count,
            schedule.layers.len()
        );

        let (reporter, reporter_task) = ProgressReporter::start(run_id, self.sink.clone());
        for warning in &schedule.warnings {
            reporter.schedule_warning(warning);
        }

        let registry: BTreeMap<AnalyzerType, SharedAnalyzer> = self
            .registry
            .iter()
            .map(|(kind, entry)| (*kind, entry.analyzer.clone()))
            .collect();

        let outcome = LayerExecutor::new(&run_ctx, data, &registry, &reporter)
            .run(&schedule.layers)
            .await;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let (results, success) = match &outcome {
            Ok(results) => (results, true),
            Err(e) => (&e.partial, false),
        };
        let overall = overall_score(results);
        reporter.run_completed(RunSummary {
            analyzer_count,
            completed_count: results.len(),
            elapsed_ms,
            overall_score: overall,
            layer_count: schedule.layers.len(),
            success,
        });
        reporter_task.finish(reporter).await;

        match outcome {
            Ok(results) => {
                tracing::info!(
                    "[ORCHESTRATOR] Run {} complete in {}ms, overall score {:?}",
                    run_id,
                    elapsed_ms,
                    overall
                );
                Ok(RunReport {
                    run_id,
                    results,
                    overall_score: overall,
                    layers: schedule.layers,
                    warnings: schedule.warnings,
                    elapsed_ms,
                })
            }
            Err(e) => {
                tracing::warn!(
                    "[ORCHESTRATOR] Run {} failed after {}ms with {} partial results: {}",
                    run_id,
                    elapsed_ms,
                    e.partial.len(),
                    e.error
                );
                Err(e)
            }
        }
    }
}
