//! Parallel layer execution.
//!
//! Every analyzer of a layer runs as its own task against a snapshot of the
//! results accumulated before the layer started. The layer is a barrier:
//! the next one starts only after every task has joined. Failures are
//! collected on a channel and the first one stops the run.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio::time::Instant;

use super::reporter::ProgressReporter;
use crate::domain::{AnalyzerResult, AnalyzerType, ResultsMap, WebsiteData};
use crate::error::{AnalysisError, RunError};
use crate::service::analyzers::{scoring, Analyzer};
use crate::service::context::RunContext;

pub(crate) type SharedAnalyzer = Arc<Mutex<Box<dyn Analyzer>>>;

/// Everything one worker needs, moved into its task.
struct Job {
    kind: AnalyzerType,
    layer: usize,
    analyzer: SharedAnalyzer,
    ctx: RunContext,
    data: Arc<WebsiteData>,
    snapshot: Arc<ResultsMap>,
    results: Arc<Mutex<ResultsMap>>,
    reporter: ProgressReporter,
    errors: mpsc::Sender<AnalysisError>,
}

impl Job {
    async fn run(self) {
        let kind = self.kind;
        let layer = self.layer;
        let reporter = self.reporter.clone();
        let errors = self.errors.clone();
        let started = Instant::now();

        let outcome = AssertUnwindSafe(self.analyze()).catch_unwind().await;
        let error = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e,
            Err(_) => {
                tracing::error!("[EXECUTOR] {} panicked", kind);
                AnalysisError::AnalyzerPanicked(kind)
            }
        };

        reporter.analyzer_failed(kind, layer, &error, started.elapsed());
        if errors.try_send(error).is_err() {
            tracing::warn!("[EXECUTOR] Error channel full, dropping {} failure", kind);
        }
    }

    async fn analyze(self) -> Result<(), AnalysisError> {
        self.ctx.check()?;
        self.reporter.analyzer_started(self.kind, self.layer);

        let started = Instant::now();
        let mut analyzer = self.analyzer.lock().await;
        let metrics = analyzer.analyze(&self.ctx, &self.data, &self.snapshot).await?;
        let duration = started.elapsed();

        let result = Arc::new(AnalyzerResult {
            analyzer_type: self.kind,
            score: metrics.score.map(scoring::clamp_score),
            metrics,
            issues: analyzer.issues().to_vec(),
            recommendations: analyzer.recommendations().to_vec(),
            duration_ms: duration.as_millis() as u64,
        });
        drop(analyzer);

        self.results.lock().await.insert(self.kind, result.clone());
        tracing::debug!(
            "[EXECUTOR] {} completed in {:?} (score {:?})",
            self.kind,
            duration,
            result.score
        );
        self.reporter.analyzer_completed(result, self.layer, duration);
        Ok(())
    }
}

/// Runs layers one after another against a shared results map.
pub(crate) struct LayerExecutor<'a> {
    ctx: &'a RunContext,
    data: Arc<WebsiteData>,
    registry: &'a BTreeMap<AnalyzerType, SharedAnalyzer>,
    reporter: &'a ProgressReporter,
    results: Arc<Mutex<ResultsMap>>,
}

impl<'a> LayerExecutor<'a> {
    pub(crate) fn new(
        ctx: &'a RunContext,
        data: Arc<WebsiteData>,
        registry: &'a BTreeMap<AnalyzerType, SharedAnalyzer>,
        reporter: &'a ProgressReporter,
    ) -> Self {
        Self {
            ctx,
            data,
            registry,
            reporter,
            results: Arc::new(Mutex::new(ResultsMap::new())),
        }
    }

    async fn partial(&self) -> ResultsMap {
        self.results.lock().await.clone()
    }

    /// Execute `layers` in order. On failure the error comes back together
    /// with every result completed so far.
    pub(crate) async fn run(&self, layers: &[Vec<AnalyzerType>]) -> Result<ResultsMap, RunError> {
        let total_layers = layers.len();
        let capacity = self.registry.len().max(1);

        for (index, layer) in layers.iter().enumerate() {
            if let Err(e) = self.ctx.check() {
                tracing::warn!("[EXECUTOR] Run stopped before layer {}: {}", index, e);
                return Err(RunError::new(e, self.partial().await));
            }

            tracing::info!("[EXECUTOR] Layer {}/{}: {:?}", index + 1, total_layers, layer);
            self.reporter.layer_started(index, total_layers, layer);

            let snapshot = Arc::new(self.partial().await);
            let (error_tx, mut error_rx) = mpsc::channel(capacity);
            let mut tasks = JoinSet::new();

            for kind in layer {
                let Some(analyzer) = self.registry.get(kind) else {
                    tracing::warn!("[EXECUTOR] {} scheduled but not registered, skipping", kind);
                    continue;
                };
                let job = Job {
                    kind: *kind,
                    layer: index,
                    analyzer: analyzer.clone(),
                    ctx: self.ctx.clone(),
                    data: self.data.clone(),
                    snapshot: snapshot.clone(),
                    results: self.results.clone(),
                    reporter: self.reporter.clone(),
                    errors: error_tx.clone(),
                };
                tasks.spawn(job.run());
            }
            drop(error_tx);

            // Barrier
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    tracing::error!("[EXECUTOR] Worker task failed to join: {}", e);
                }
            }

            let mut first_error = None;
            while let Ok(error) = error_rx.try_recv() {
                if first_error.is_none() {
                    first_error = Some(error);
                } else {
                    tracing::debug!("[EXECUTOR] Additional failure in layer {}: {}", index, error);
                }
            }
            if let Some(error) = first_error {
                tracing::warn!("[EXECUTOR] Layer {} failed, skipping remaining layers: {}", index, error);
                return Err(RunError::new(error, self.partial().await));
            }

            if let Err(e) = self.ctx.check() {
                tracing::warn!("[EXECUTOR] Run cancelled after layer {}: {}", index, e);
                return Err(RunError::new(e, self.partial().await));
            }
        }

        Ok(self.partial().await)
    }
}
