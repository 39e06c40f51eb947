//! Background actor that reads closed marker logs and reclaims the chunk
//! objects they name (spec §4.5).

use std::{
    sync::{atomic::{AtomicU64, Ordering}, Arc},
    time::Duration,
};

use futures::stream::{self, StreamExt};
use metric::{DurationHistogram, Metric, U64Counter};
use observability_deps::tracing::{error, info, warn};
use tokio::{
    sync::Mutex,
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{Error, Result},
    interfaces::{ChunkClient, DeleteOutcome},
    marker::{self, MarkerLogHandle},
    types::{ChunkId, UserId},
};

/// Tuning knobs for the sweeper (spec §4.5, §9: worker count and grace
/// period are the two operator-facing dials).
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Directory holding marker logs produced by every [`crate::table_marker::TableMarker`].
    pub markers_dir: std::path::PathBuf,
    /// Minimum age a closed marker log must reach before it is swept.
    pub min_age_delete: Duration,
    /// Number of concurrent delete workers.
    pub delete_worker_count: usize,
    /// How often to re-scan the markers directory for newly-ready logs.
    pub poll_interval: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeleteStatus {
    Success,
    NotFound,
    Failure,
}

impl DeleteStatus {
    fn as_str(self) -> &'static str {
        match self {
            DeleteStatus::Success => "success",
            DeleteStatus::NotFound => "not_found",
            DeleteStatus::Failure => "failure",
        }
    }
}

#[derive(Debug)]
struct SweeperMetrics {
    delete_duration: Metric<DurationHistogram>,
    logs_removed: U64Counter,
    /// Mirrors `logs_removed` for synchronous reads from [`Sweeper::stats`];
    /// `metric::U64Counter` itself is write-only from this side of the API.
    logs_removed_snapshot: AtomicU64,
}

impl SweeperMetrics {
    fn new(registry: &metric::Registry) -> Self {
        let delete_duration: Metric<DurationHistogram> = registry.register_metric(
            "garbage_collector_chunk_delete_duration",
            "duration of a single chunk delete call, by outcome",
        );
        let logs_removed_metric: Metric<U64Counter> = registry.register_metric(
            "garbage_collector_marker_logs_removed",
            "number of marker logs fully processed and removed",
        );
        let logs_removed = logs_removed_metric.recorder(&[]);

        Self {
            delete_duration,
            logs_removed,
            logs_removed_snapshot: AtomicU64::new(0),
        }
    }

    fn record_delete(&self, status: DeleteStatus, duration: Duration) {
        self.delete_duration
            .recorder(&[("status", status.as_str())])
            .record(duration);
    }

    fn record_log_removed(&self) {
        self.logs_removed.inc(1);
        self.logs_removed_snapshot.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time snapshot of sweeper progress, supplementing the marker/delete
/// metrics with a synchronous accessor (mirrors `LifecycleManager::stats()`
/// in `ingester::lifecycle`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SweeperStats {
    pub logs_removed: u64,
}

/// Long-lived background actor wrapping the Marker Reader with a
/// chunk-delete callback and metrics (spec §4.5, §2).
#[derive(Debug)]
pub struct Sweeper {
    config: SweeperConfig,
    chunk_client: Arc<dyn ChunkClient>,
    metrics: Arc<SweeperMetrics>,
    task: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl Sweeper {
    /// Build a sweeper. Call [`Sweeper::start`] to begin background work.
    pub fn new(config: SweeperConfig, chunk_client: Arc<dyn ChunkClient>, metric_registry: &metric::Registry) -> Self {
        Self {
            config,
            chunk_client,
            metrics: Arc::new(SweeperMetrics::new(metric_registry)),
            task: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    /// Spawn the background sweep loop. Idempotent: calling `start` twice
    /// without an intervening `stop` is a no-op.
    pub async fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return;
        }

        let this = Arc::clone(self);
        *task = Some(tokio::spawn(async move {
            this.run_loop().await;
        }));
    }

    /// Request shutdown and block until the in-flight sweep drains.
    pub async fn stop(&self) {
        self.cancel.cancel();
        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                error!(error = %e, "sweeper task panicked");
            }
        }
    }

    async fn run_loop(&self) {
        loop {
            if self.cancel.is_cancelled() {
                return;
            }

            if let Err(e) = self.sweep_once().await {
                if matches!(e, Error::Cancelled) {
                    return;
                }
                error!(error = %e, "sweep pass failed");
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }

    /// Run one full pass: enumerate ready logs and drain each of them.
    /// Exposed directly so tests and a manual "sweep now" admin path don't
    /// need the background loop.
    pub async fn sweep_once(&self) -> Result<()> {
        let logs = marker::ready_logs(&self.config.markers_dir, self.config.min_age_delete).await?;
        info!(count = logs.len(), "sweeping ready marker logs");

        for log in logs {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            self.sweep_log(&log).await?;
        }
        Ok(())
    }

    async fn sweep_log(&self, log: &MarkerLogHandle) -> Result<()> {
        let chunk_ids = marker::read_chunk_ids(&log.path).await?;
        let worker_count = self.config.delete_worker_count.max(1);

        let results: Vec<Result<()>> = stream::iter(chunk_ids)
            .map(|chunk_id| self.delete_one(chunk_id))
            .buffer_unordered(worker_count)
            .collect()
            .await;

        if let Some(err) = results.into_iter().find_map(|r| r.err()) {
            return Err(err);
        }

        marker::remove_log(&log.path).await?;
        self.metrics.record_log_removed();
        info!(path = %log.path.display(), age_secs = log.age.as_secs(), "marker log fully processed");
        Ok(())
    }

    /// List marker logs that are currently eligible to be swept, without
    /// processing them. Used by operator tooling and tests that want to
    /// observe backlog without racing a background `sweep_once`.
    pub async fn pending_logs(&self) -> Result<Vec<MarkerLogHandle>> {
        marker::ready_logs(&self.config.markers_dir, self.config.min_age_delete).await
    }

    /// A point-in-time snapshot of sweeper progress.
    pub fn stats(&self) -> SweeperStats {
        SweeperStats {
            logs_removed: self.metrics.logs_removed_snapshot.load(Ordering::Relaxed),
        }
    }

    async fn delete_one(&self, chunk_id: ChunkId) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let prefix = chunk_id.tenant_prefix()?;
        let user_id = UserId::from(prefix);

        let start = Instant::now();
        let outcome = self.chunk_client.delete_chunk(&user_id, &chunk_id).await;
        let elapsed = start.elapsed();

        match outcome {
            Ok(DeleteOutcome::Deleted) => {
                self.metrics.record_delete(DeleteStatus::Success, elapsed);
                Ok(())
            }
            Ok(DeleteOutcome::NotFound) => {
                self.metrics.record_delete(DeleteStatus::NotFound, elapsed);
                warn!(chunk_id = %chunk_id, "chunk already absent from object store, treating as deleted");
                Ok(())
            }
            Err(e) => {
                self.metrics.record_delete(DeleteStatus::Failure, elapsed);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::FakeChunkClient;

    fn registry() -> metric::Registry {
        metric::Registry::new()
    }

    #[tokio::test]
    async fn sweep_once_removes_fully_processed_log() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = crate::marker::MarkerWriter::create(dir.path(), "index_1")
            .await
            .unwrap();
        writer.put(&ChunkId::new("t1/c1")).await.unwrap();
        writer.put(&ChunkId::new("t1/c2")).await.unwrap();
        writer.close().await.unwrap();

        let client = Arc::new(FakeChunkClient::default());
        let reg = registry();
        let sweeper = Sweeper::new(
            SweeperConfig {
                markers_dir: dir.path().to_path_buf(),
                min_age_delete: Duration::from_secs(0),
                delete_worker_count: 4,
                poll_interval: Duration::from_secs(3600),
            },
            client.clone(),
            &reg,
        );

        sweeper.sweep_once().await.unwrap();

        assert_eq!(client.deleted.lock().unwrap().len(), 2);
        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
        assert_eq!(sweeper.stats().logs_removed, 1);
    }

    #[tokio::test]
    async fn pending_logs_reports_backlog_before_sweeping() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = crate::marker::MarkerWriter::create(dir.path(), "index_1")
            .await
            .unwrap();
        writer.put(&ChunkId::new("t1/c1")).await.unwrap();
        writer.close().await.unwrap();

        let client = Arc::new(FakeChunkClient::default());
        let reg = registry();
        let sweeper = Sweeper::new(
            SweeperConfig {
                markers_dir: dir.path().to_path_buf(),
                min_age_delete: Duration::from_secs(0),
                delete_worker_count: 2,
                poll_interval: Duration::from_secs(3600),
            },
            client,
            &reg,
        );

        assert_eq!(sweeper.pending_logs().await.unwrap().len(), 1);
        assert_eq!(sweeper.stats().logs_removed, 0);
    }

    #[tokio::test]
    async fn not_found_is_tolerated_as_success() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = crate::marker::MarkerWriter::create(dir.path(), "index_1")
            .await
            .unwrap();
        writer.put(&ChunkId::new("t1/gone")).await.unwrap();
        writer.close().await.unwrap();

        let client = Arc::new(FakeChunkClient::default());
        client.mark_missing("t1/gone");
        let reg = registry();
        let sweeper = Sweeper::new(
            SweeperConfig {
                markers_dir: dir.path().to_path_buf(),
                min_age_delete: Duration::from_secs(0),
                delete_worker_count: 2,
                poll_interval: Duration::from_secs(3600),
            },
            client,
            &reg,
        );

        sweeper.sweep_once().await.unwrap();

        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        assert!(
            entries.next_entry().await.unwrap().is_none(),
            "log should be removed even though the chunk was already gone"
        );
    }

    #[tokio::test]
    async fn failed_delete_leaves_log_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = crate::marker::MarkerWriter::create(dir.path(), "index_1")
            .await
            .unwrap();
        writer.put(&ChunkId::new("t1/bad")).await.unwrap();
        writer.close().await.unwrap();

        let client = Arc::new(FakeChunkClient::default());
        client.mark_failing("t1/bad");
        let reg = registry();
        let sweeper = Sweeper::new(
            SweeperConfig {
                markers_dir: dir.path().to_path_buf(),
                min_age_delete: Duration::from_secs(0),
                delete_worker_count: 2,
                poll_interval: Duration::from_secs(3600),
            },
            client,
            &reg,
        );

        assert!(sweeper.sweep_once().await.is_err());

        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn min_age_gate_defers_recent_logs() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = crate::marker::MarkerWriter::create(dir.path(), "index_1")
            .await
            .unwrap();
        writer.put(&ChunkId::new("t1/c1")).await.unwrap();
        writer.close().await.unwrap();

        let client = Arc::new(FakeChunkClient::default());
        let reg = registry();
        let sweeper = Sweeper::new(
            SweeperConfig {
                markers_dir: dir.path().to_path_buf(),
                min_age_delete: Duration::from_secs(3600),
                delete_worker_count: 2,
                poll_interval: Duration::from_secs(3600),
            },
            client.clone(),
            &reg,
        );

        sweeper.sweep_once().await.unwrap();

        assert!(client.deleted.lock().unwrap().is_empty());
        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn start_stop_drains_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(FakeChunkClient::default());
        let reg = registry();
        let sweeper = Arc::new(Sweeper::new(
            SweeperConfig {
                markers_dir: dir.path().to_path_buf(),
                min_age_delete: Duration::from_secs(0),
                delete_worker_count: 2,
                poll_interval: Duration::from_millis(10),
            },
            client,
            &reg,
        ));

        sweeper.start().await;
        sweeper.start().await; // idempotent
        sweeper.stop().await;
    }
}
