//! Progress delivery.
//!
//! Workers never call the sink directly: they push onto an unbounded channel
//! drained on a dedicated `progress-sink` thread. The sink may block without
//! holding a runtime worker, so a slow consumer cannot stall analysis even on
//! a current-thread runtime.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use super::scheduler::ScheduleWarning;
use crate::domain::{AnalyzerResult, AnalyzerType, ProgressDetails, ProgressKind, ProgressUpdate, RunSummary};
use crate::error::AnalysisError;

/// Receives progress updates, e.g. a WebSocket broadcaster. Called from a
/// plain thread, never from the async runtime.
pub trait ProgressSink: Send + Sync + 'static {
    fn on_progress(&self, update: ProgressUpdate);
}

impl<F> ProgressSink for F
where
    F: Fn(ProgressUpdate) + Send + Sync + 'static,
{
    fn on_progress(&self, update: ProgressUpdate) {
        self(update)
    }
}

/// Cheap handle used by the executor and its workers to emit events.
#[derive(Clone)]
pub struct ProgressReporter {
    run_id: Uuid,
    tx: Option<mpsc::UnboundedSender<ProgressUpdate>>,
}

/// Owns the delivery thread; `finish` waits until every event was delivered.
pub struct ReporterTask {
    done: Option<oneshot::Receiver<()>>,
}

impl ProgressReporter {
    /// Start delivering to `sink`. Without a sink events are dropped.
    pub fn start(run_id: Uuid, sink: Option<Arc<dyn ProgressSink>>) -> (Self, ReporterTask) {
        let Some(sink) = sink else {
            return (Self { run_id, tx: None }, ReporterTask { done: None });
        };

        let (tx, mut rx) = mpsc::unbounded_channel::<ProgressUpdate>();
        let (done_tx, done_rx) = oneshot::channel();
        let spawned = std::thread::Builder::new()
            .name("progress-sink".into())
            .spawn(move || {
                while let Some(update) = rx.blocking_recv() {
                    sink.on_progress(update);
                }
                let _ = done_tx.send(());
            });

        match spawned {
            Ok(_) => (
                Self { run_id, tx: Some(tx) },
                ReporterTask { done: Some(done_rx) },
            ),
            Err(e) => {
                tracing::warn!("[REPORTER] Could not start progress thread, events are dropped: {}", e);
                (Self { run_id, tx: None }, ReporterTask { done: None })
            }
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    fn update(
        &self,
        kind: ProgressKind,
        analyzer_type: Option<AnalyzerType>,
        layer: Option<usize>,
        progress_percent: f64,
        message: String,
    ) -> ProgressUpdate {
        ProgressUpdate {
            run_id: self.run_id,
            kind,
            analyzer_type,
            layer,
            progress_percent,
            message,
            duration_ms: None,
            partial_results: None,
            timestamp: Utc::now(),
        }
    }

    fn send(&self, update: ProgressUpdate) {
        if let Some(tx) = &self.tx {
            if tx.send(update).is_err() {
                tracing::warn!("[REPORTER] Progress consumer stopped, dropping event");
            }
        }
    }

    pub fn layer_started(&self, layer: usize, total_layers: usize, analyzers: &[AnalyzerType]) {
        let percent = if total_layers == 0 {
            100.0
        } else {
            layer as f64 / total_layers as f64 * 100.0
        };
        let names: Vec<&str> = analyzers.iter().map(|a| a.as_str()).collect();
        let update = self.update(
            ProgressKind::LayerStarted,
            None,
            Some(layer),
            percent,
            format!("Starting layer {}/{}: {}", layer + 1, total_layers, names.join(", ")),
        );
        self.send(update);
    }

    pub fn analyzer_started(&self, kind: AnalyzerType, layer: usize) {
        let update = self.update(
            ProgressKind::AnalyzerStarted,
            Some(kind),
            Some(layer),
            0.0,
            format!("{} analysis started", kind),
        );
        self.send(update);
    }

    pub fn analyzer_completed(&self, result: Arc<AnalyzerResult>, layer: usize, duration: Duration) {
        let kind = result.analyzer_type;
        let mut update = self.update(
            ProgressKind::AnalyzerCompleted,
            Some(kind),
            Some(layer),
            100.0,
            format!("{} analysis completed", kind),
        );
        update.duration_ms = Some(duration.as_millis() as u64);
        update.partial_results = Some(ProgressDetails::Result(result));
        self.send(update);
    }

    pub fn analyzer_failed(&self, kind: AnalyzerType, layer: usize, error: &AnalysisError, duration: Duration) {
        let mut update = self.update(
            ProgressKind::AnalyzerFailed,
            Some(kind),
            Some(layer),
            100.0,
            format!("{} analysis failed: {}", kind, error),
        );
        update.duration_ms = Some(duration.as_millis() as u64);
        self.send(update);
    }

    pub fn schedule_warning(&self, warning: &ScheduleWarning) {
        let ScheduleWarning::DependencyCycleBroken { promoted, .. } = warning;
        let update = self.update(ProgressKind::ScheduleWarning, Some(*promoted), None, 0.0, warning.to_string());
        self.send(update);
    }

    pub fn run_completed(&self, summary: RunSummary) {
        let message = if summary.success {
            format!(
                "Analysis complete: {}/{} analyzers in {}ms",
                summary.completed_count, summary.analyzer_count, summary.elapsed_ms
            )
        } else {
            format!(
                "Analysis stopped: {}/{} analyzers completed",
                summary.completed_count, summary.analyzer_count
            )
        };
        let mut update = self.update(ProgressKind::RunCompleted, None, None, 100.0, message);
        update.duration_ms = Some(summary.elapsed_ms);
        update.partial_results = Some(ProgressDetails::Summary(summary));
        self.send(update);
    }
}

impl ReporterTask {
    /// Close the channel and wait for queued events to reach the sink.
    /// Every `ProgressReporter` clone must be dropped first.
    pub async fn finish(mut self, reporter: ProgressReporter) {
        drop(reporter);
        if let Some(done) = self.done.take() {
            if done.await.is_err() {
                tracing::warn!("[REPORTER] Progress sink panicked, remaining events were lost");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn events_reach_sink_in_order() {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let received = received.clone();
            move |update: ProgressUpdate| received.lock().unwrap().push((update.kind, update.progress_percent))
        };
        let (reporter, task) = ProgressReporter::start(Uuid::new_v4(), Some(Arc::new(sink)));

        reporter.layer_started(1, 4, &[AnalyzerType::Seo]);
        reporter.analyzer_started(AnalyzerType::Seo, 1);
        task.finish(reporter).await;

        let received = received.lock().unwrap();
        assert_eq!(
            *received,
            vec![(ProgressKind::LayerStarted, 25.0), (ProgressKind::AnalyzerStarted, 0.0)]
        );
    }

    #[tokio::test]
    async fn slow_sink_does_not_block_emitters() {
        let sink = |_update: ProgressUpdate| std::thread::sleep(Duration::from_millis(50));
        let (reporter, task) = ProgressReporter::start(Uuid::new_v4(), Some(Arc::new(sink)));

        let start = std::time::Instant::now();
        for _ in 0..10 {
            reporter.analyzer_started(AnalyzerType::Content, 0);
        }
        assert!(start.elapsed() < Duration::from_millis(50));
        task.finish(reporter).await;
    }

    #[tokio::test]
    async fn blocked_sink_leaves_the_runtime_free() {
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let release_rx = Mutex::new(release_rx);
        let sink = move |_update: ProgressUpdate| {
            let _ = release_rx.lock().unwrap().recv();
        };
        let (reporter, task) = ProgressReporter::start(Uuid::new_v4(), Some(Arc::new(sink)));

        reporter.analyzer_started(AnalyzerType::Seo, 0);
        let worker = tokio::spawn(async {
            tokio::task::yield_now().await;
            7
        });
        assert_eq!(worker.await.unwrap(), 7);

        release_tx.send(()).unwrap();
        task.finish(reporter).await;
    }

    #[tokio::test]
    async fn panicking_sink_does_not_hang_finish() {
        let sink = |_update: ProgressUpdate| panic!("sink failure");
        let (reporter, task) = ProgressReporter::start(Uuid::new_v4(), Some(Arc::new(sink)));

        reporter.analyzer_started(AnalyzerType::Seo, 0);
        task.finish(reporter).await;
    }

    #[tokio::test]
    async fn missing_sink_is_a_no_op() {
        let (reporter, task) = ProgressReporter::start(Uuid::new_v4(), None);
        reporter.analyzer_started(AnalyzerType::Seo, 0);
        task.finish(reporter).await;
    }
}
