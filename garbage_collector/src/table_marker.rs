//! Orchestrates one table scan (spec §4.1, §4.2): the critical path of the
//! retention core.

use std::{path::Path, sync::Arc, time::Instant};

use metric::{DurationHistogram, Metric, U64Counter};
use observability_deps::tracing::{debug, info, warn};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{Error, Result},
    interfaces::{ChunkVisitor, ExpirationChecker, IndexProcessor},
    marker::MarkerWriter,
    rewriter::ChunkRewriter,
    types::{ChunkEntry, MarkOutcome, Table, UserId},
    user_series::UserSeriesMap,
};

/// Per-table outcome label used on the `table_marker_scans_total` counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanOutcome {
    Deleted,
    Modified,
    None,
    Failure,
}

impl ScanOutcome {
    fn as_str(self) -> &'static str {
        match self {
            ScanOutcome::Deleted => "deleted",
            ScanOutcome::Modified => "modified",
            ScanOutcome::None => "none",
            ScanOutcome::Failure => "failure",
        }
    }
}

/// Metrics published by the Table Marker (spec §4.1 step 5, §10).
#[derive(Debug)]
struct TableMarkerMetrics {
    scans: Metric<U64Counter>,
    marks_created: U64Counter,
    scan_duration: Metric<DurationHistogram>,
}

impl TableMarkerMetrics {
    fn new(registry: &metric::Registry) -> Self {
        let scans: Metric<U64Counter> = registry.register_metric(
            "garbage_collector_table_scans",
            "number of table scans performed by outcome",
        );
        let marks_created_metric: Metric<U64Counter> = registry.register_metric(
            "garbage_collector_marks_created",
            "number of chunk identifiers appended to marker logs",
        );
        let marks_created = marks_created_metric.recorder(&[]);
        let scan_duration: Metric<DurationHistogram> = registry.register_metric(
            "garbage_collector_table_scan_duration",
            "duration of a table scan",
        );

        Self {
            scans,
            marks_created,
            scan_duration,
        }
    }

    fn record_outcome(&self, outcome: ScanOutcome, duration: std::time::Duration) {
        self.scans
            .recorder(&[("outcome", outcome.as_str())])
            .inc(1);
        self.scan_duration
            .recorder(&[("outcome", outcome.as_str())])
            .record(duration);
    }
}

/// Scans one index table, marking expired chunks for later deletion and
/// rewriting partially-expired ones.
#[derive(Debug)]
pub struct TableMarker {
    markers_dir: std::path::PathBuf,
    rewriter: ChunkRewriter,
    time_provider: Arc<dyn iox_time::TimeProvider>,
    metrics: TableMarkerMetrics,
}

impl TableMarker {
    /// Build a new `TableMarker` writing marker logs under `markers_dir`.
    pub fn new(
        markers_dir: impl AsRef<Path>,
        rewriter: ChunkRewriter,
        time_provider: Arc<dyn iox_time::TimeProvider>,
        metric_registry: &metric::Registry,
    ) -> Self {
        Self {
            markers_dir: markers_dir.as_ref().to_path_buf(),
            rewriter,
            time_provider,
            metrics: TableMarkerMetrics::new(metric_registry),
        }
    }

    /// Scan `table` for `tenant`, consulting `expiration` for each chunk and
    /// `index` for iteration, replacement indexing and series cleanup.
    pub async fn mark_for_delete(
        &self,
        cancel: &CancellationToken,
        table: &Table,
        tenant: &UserId,
        index: &dyn IndexProcessor,
        expiration: &dyn ExpirationChecker,
    ) -> Result<MarkOutcome> {
        let start = Instant::now();
        let result = self
            .mark_for_delete_inner(cancel, table, tenant, index, expiration)
            .await;

        let outcome = match &result {
            Ok(o) if o.empty => ScanOutcome::Deleted,
            Ok(o) if o.modified => ScanOutcome::Modified,
            Ok(_) => ScanOutcome::None,
            Err(_) => ScanOutcome::Failure,
        };
        self.metrics.record_outcome(outcome, start.elapsed());

        result
    }

    async fn mark_for_delete_inner(
        &self,
        cancel: &CancellationToken,
        table: &Table,
        tenant: &UserId,
        index: &dyn IndexProcessor,
        expiration: &dyn ExpirationChecker,
    ) -> Result<MarkOutcome> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let marker = MarkerWriter::create(&self.markers_dir, table.name()).await?;
        let now = crate::types::TimestampMillis::new(self.time_provider.now().timestamp_millis());

        let mut scan = ScanState {
            table,
            now,
            expiration,
            rewriter: &self.rewriter,
            index,
            marker,
            series_map: UserSeriesMap::new(),
            chunks_seen: 0,
            empty: true,
            modified: false,
            cancel,
        };

        if let Err(e) = index.for_each_chunk(&mut scan).await {
            finalize_aborted_marker(scan.marker, table.name()).await;
            return Err(e);
        }

        if cancel.is_cancelled() {
            finalize_aborted_marker(scan.marker, table.name()).await;
            return Err(Error::Cancelled);
        }

        if scan.chunks_seen == 0 {
            scan.marker.abandon().await?;
            return Err(Error::NoChunksFound);
        }

        let outcome = if scan.empty {
            MarkOutcome {
                empty: true,
                modified: true,
            }
        } else {
            let mut cleanup_err = None;
            let to_clean: Vec<_> = {
                let mut v = Vec::new();
                scan.series_map.for_each(|info| {
                    if info.is_deleted {
                        v.push((info.user_id.clone(), info.labels.clone()));
                    }
                    Ok(())
                })?;
                v
            };
            for (user_id, labels) in to_clean {
                if let Err(e) = index.cleanup_series(&user_id, &labels).await {
                    cleanup_err = Some(e);
                    break;
                }
            }
            if let Some(e) = cleanup_err {
                finalize_aborted_marker(scan.marker, table.name()).await;
                return Err(e);
            }

            MarkOutcome {
                empty: false,
                modified: scan.modified,
            }
        };

        let marks = scan.marker.count();
        scan.marker.close().await?;
        self.metrics.marks_created.inc(marks);

        info!(
            table = table.name(),
            tenant = %tenant,
            empty = outcome.empty,
            modified = outcome.modified,
            marks,
            "table scan complete"
        );

        Ok(outcome)
    }
}

/// Closes or abandons `marker` depending on whether anything was appended to
/// it, so that partial progress from an aborted scan (error or cancellation)
/// is never silently dropped (spec §5). The original abort cause is what the
/// caller should propagate; a failure here is logged rather than returned so
/// it never masks that cause.
async fn finalize_aborted_marker(marker: MarkerWriter, table_name: &str) {
    let result = if marker.count() == 0 {
        marker.abandon().await
    } else {
        marker.close().await
    };
    if let Err(e) = result {
        warn!(error = %e, table = table_name, "failed to finalize marker log after scan abort");
    }
}

/// Holds all per-scan mutable state and implements the per-chunk decision
/// procedure (spec §4.2) as a [`ChunkVisitor`].
struct ScanState<'a> {
    table: &'a Table,
    now: crate::types::TimestampMillis,
    expiration: &'a dyn ExpirationChecker,
    rewriter: &'a ChunkRewriter,
    index: &'a dyn IndexProcessor,
    marker: MarkerWriter,
    series_map: UserSeriesMap,
    chunks_seen: u64,
    /// True iff every chunk observed so far was fully handled by a pure
    /// deletion (no surviving replacement stayed indexed in this table).
    empty: bool,
    modified: bool,
    cancel: &'a CancellationToken,
}

#[async_trait::async_trait]
impl<'a> ChunkVisitor for ScanState<'a> {
    async fn visit(&mut self, entry: &ChunkEntry) -> Result<bool> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        self.chunks_seen += 1;
        let chunk_ref = &entry.chunk_ref;
        self.series_map
            .add(&chunk_ref.user_id, &chunk_ref.series_id, &entry.labels);

        let (expired, surviving) = self.expiration.expired(entry, self.now);

        if !expired {
            // Case A.
            self.empty = false;
            if chunk_ref.through > self.table.interval().end {
                let drop = self
                    .expiration
                    .drop_from_index(entry, self.table.interval().end, self.now);
                if drop {
                    self.modified = true;
                    debug!(chunk_id = %chunk_ref.chunk_id, "aging out of this table's index");
                    return Ok(true);
                }
                return Ok(false);
            }
            self.series_map
                .mark_series_not_deleted(&chunk_ref.user_id, &chunk_ref.series_id);
            return Ok(false);
        }

        // Case B: expired.
        self.modified = true;
        if !surviving.is_empty() {
            let wrote_any = self
                .rewriter
                .rewrite_chunk(self.cancel, entry, self.table, self.index, &surviving)
                .await?;
            if wrote_any {
                self.empty = false;
                self.series_map
                    .mark_series_not_deleted(&chunk_ref.user_id, &chunk_ref.series_id);
            }
        }

        let fully_expired = surviving.is_empty();
        let last_table = chunk_ref.through <= self.table.interval().end;
        if fully_expired || last_table {
            self.marker.put(&chunk_ref.chunk_id).await?;
        } else {
            debug!(
                chunk_id = %chunk_ref.chunk_id,
                "delaying deletion: chunk is still indexed by a later table"
            );
        }

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        marker,
        test_util::{FakeChunkDataClient, FakeExpirationChecker, FakeIndexProcessor},
        types::{ChunkRef, Interval, Labels, SeriesId},
    };
    use iox_time::{MockProvider, Time};

    fn labels() -> Labels {
        Labels::new(vec![("job".to_string(), "t".to_string())])
    }

    fn entry(chunk_id: &str, from: i64, through: i64) -> ChunkEntry {
        ChunkEntry {
            chunk_ref: ChunkRef {
                user_id: UserId::from("t1"),
                series_id: SeriesId::from("A"),
                chunk_id: crate::types::ChunkId::new(chunk_id),
                from: crate::types::TimestampMillis::new(from),
                through: crate::types::TimestampMillis::new(through),
            },
            labels: labels(),
        }
    }

    async fn marker_for_test(tmp: &Path) -> TableMarker {
        let rewriter = ChunkRewriter::new(Arc::new(FakeChunkDataClient::new(1)));
        let time_provider = Arc::new(MockProvider::new(Time::from_timestamp_millis(0)));
        TableMarker::new(tmp, rewriter, time_provider, &metric::Registry::new())
    }

    #[tokio::test]
    async fn scenario_s1_full_expiration() {
        let dir = tempfile::tempdir().unwrap();
        let marker = marker_for_test(dir.path()).await;
        let table = Table::new("index_0").unwrap(); // [0, 200)-ish day bucket, covers [0,100]
        let index = FakeIndexProcessor::new(vec![entry("t1/c1", 0, 100)]);
        let expiration = FakeExpirationChecker::new().set_expired("t1/c1", true, vec![]);

        let outcome = marker
            .mark_for_delete(&CancellationToken::new(), &table, &UserId::from("t1"), &index, &expiration)
            .await
            .unwrap();

        assert!(outcome.empty);
        assert!(outcome.modified);
        assert_eq!(index.cleaned_up.lock().unwrap().len(), 1);

        let logs = marker::ready_logs(dir.path(), std::time::Duration::from_secs(0))
            .await
            .unwrap();
        assert_eq!(logs.len(), 1);
        let ids = marker::read_chunk_ids(&logs[0].path).await.unwrap();
        assert_eq!(ids, vec![crate::types::ChunkId::new("t1/c1")]);
    }

    #[tokio::test]
    async fn scenario_s2_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let marker = marker_for_test(dir.path()).await;
        let table = Table::new("index_0").unwrap();
        let index = FakeIndexProcessor::new(vec![entry("t1/c1", 0, 100)]);
        let expiration = FakeExpirationChecker::new().set_expired("t1/c1", false, vec![]);

        let outcome = marker
            .mark_for_delete(&CancellationToken::new(), &table, &UserId::from("t1"), &index, &expiration)
            .await
            .unwrap();

        assert!(!outcome.empty);
        assert!(!outcome.modified);
        assert!(index.cleaned_up.lock().unwrap().is_empty());

        let logs = marker::ready_logs(dir.path(), std::time::Duration::from_secs(0))
            .await
            .unwrap();
        let ids = marker::read_chunk_ids(&logs[0].path).await.unwrap();
        assert!(ids.is_empty());
    }

    #[tokio::test]
    async fn scenario_s3_partial_expiration_single_table() {
        let dir = tempfile::tempdir().unwrap();
        let marker = marker_for_test(dir.path()).await;
        let table = Table::new("index_0").unwrap();
        let index = FakeIndexProcessor::new(vec![entry("t1/c1", 0, 100)]);
        let surviving = vec![IntervalFilter::unfiltered(Interval::new(
            crate::types::TimestampMillis::new(50),
            crate::types::TimestampMillis::new(100),
        ))];
        let expiration = FakeExpirationChecker::new().set_expired("t1/c1", true, surviving);

        let outcome = marker
            .mark_for_delete(&CancellationToken::new(), &table, &UserId::from("t1"), &index, &expiration)
            .await
            .unwrap();

        assert!(!outcome.empty);
        assert!(outcome.modified);
        assert!(index.cleaned_up.lock().unwrap().is_empty());
        assert_eq!(index.indexed.lock().unwrap().len(), 1);

        let logs = marker::ready_logs(dir.path(), std::time::Duration::from_secs(0))
            .await
            .unwrap();
        let ids = marker::read_chunk_ids(&logs[0].path).await.unwrap();
        assert_eq!(ids, vec![crate::types::ChunkId::new("t1/c1")]);
    }

    #[tokio::test]
    async fn scenario_s4_partial_expiration_spans_later_table() {
        let dir = tempfile::tempdir().unwrap();
        let marker = marker_for_test(dir.path()).await;
        let table = Table::new("index_0").unwrap(); // end ~= 86399999
        let index = FakeIndexProcessor::new(vec![entry("t1/c1", 0, 300_000_000)]);
        let surviving = vec![IntervalFilter::unfiltered(Interval::new(
            crate::types::TimestampMillis::new(50),
            crate::types::TimestampMillis::new(100),
        ))];
        let expiration = FakeExpirationChecker::new().set_expired("t1/c1", true, surviving);

        marker
            .mark_for_delete(&CancellationToken::new(), &table, &UserId::from("t1"), &index, &expiration)
            .await
            .unwrap();

        assert_eq!(index.indexed.lock().unwrap().len(), 1, "replacement should still be produced");

        let logs = marker::ready_logs(dir.path(), std::time::Duration::from_secs(0))
            .await
            .unwrap();
        let ids = marker::read_chunk_ids(&logs[0].path).await.unwrap();
        assert!(
            ids.is_empty(),
            "source chunk must not be marked for delete while a later table still indexes it"
        );
    }

    #[tokio::test]
    async fn scenario_s5_aging_out_of_this_table() {
        let dir = tempfile::tempdir().unwrap();
        let marker = marker_for_test(dir.path()).await;
        let table = Table::new("index_0").unwrap(); // end ~= 86399999
        let index = FakeIndexProcessor::new(vec![entry("t1/c1", 150, 300_000_000)]);
        let expiration = FakeExpirationChecker::new()
            .set_expired("t1/c1", false, vec![])
            .set_drop_from_index("t1/c1", true);

        let outcome = marker
            .mark_for_delete(&CancellationToken::new(), &table, &UserId::from("t1"), &index, &expiration)
            .await
            .unwrap();

        assert!(!outcome.empty);
        assert!(outcome.modified);

        let logs = marker::ready_logs(dir.path(), std::time::Duration::from_secs(0))
            .await
            .unwrap();
        let ids = marker::read_chunk_ids(&logs[0].path).await.unwrap();
        assert!(ids.is_empty(), "aging out must not schedule a chunk delete");
    }

    #[tokio::test]
    async fn property_zero_chunks_fails_without_side_effects() {
        let dir = tempfile::tempdir().unwrap();
        let marker = marker_for_test(dir.path()).await;
        let table = Table::new("index_0").unwrap();
        let index = FakeIndexProcessor::new(vec![]);
        let expiration = FakeExpirationChecker::new();

        let result = marker
            .mark_for_delete(&CancellationToken::new(), &table, &UserId::from("t1"), &index, &expiration)
            .await;

        assert!(matches!(result, Err(Error::NoChunksFound)));
        assert!(index.indexed.lock().unwrap().is_empty());
        assert!(index.cleaned_up.lock().unwrap().is_empty());

        let logs = marker::ready_logs(dir.path(), std::time::Duration::from_secs(0))
            .await
            .unwrap();
        assert!(logs.is_empty(), "a failed scan must not publish a marker log");
    }

    #[tokio::test]
    async fn property_fully_expired_table_marks_every_chunk_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let marker = marker_for_test(dir.path()).await;
        let table = Table::new("index_0").unwrap();
        let index = FakeIndexProcessor::new(vec![
            entry("t1/c1", 0, 10),
            entry("t1/c2", 10, 20),
            entry("t1/c3", 20, 30),
        ]);
        let expiration = FakeExpirationChecker::new()
            .set_expired("t1/c1", true, vec![])
            .set_expired("t1/c2", true, vec![])
            .set_expired("t1/c3", true, vec![]);

        let outcome = marker
            .mark_for_delete(&CancellationToken::new(), &table, &UserId::from("t1"), &index, &expiration)
            .await
            .unwrap();

        assert!(outcome.empty);

        let logs = marker::ready_logs(dir.path(), std::time::Duration::from_secs(0))
            .await
            .unwrap();
        let mut ids = marker::read_chunk_ids(&logs[0].path).await.unwrap();
        ids.sort();
        assert_eq!(
            ids,
            vec![
                crate::types::ChunkId::new("t1/c1"),
                crate::types::ChunkId::new("t1/c2"),
                crate::types::ChunkId::new("t1/c3"),
            ]
        );
    }

    /// Runs the async body of a fully-expired scan over `count` distinct
    /// chunks and returns `(empty, marker_log_ids)` for the proptest below
    /// to assert on synchronously.
    fn run_fully_expired_scan(count: usize) -> (bool, Vec<crate::types::ChunkId>) {
        tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap()
            .block_on(async move {
            let dir = tempfile::tempdir().unwrap();
            let marker = marker_for_test(dir.path()).await;
            let table = Table::new("index_0").unwrap();

            let mut expiration = FakeExpirationChecker::new();
            let mut entries = Vec::new();
            for i in 0..count {
                let chunk_id = format!("t1/c{i}");
                expiration = expiration.set_expired(&chunk_id, true, vec![]);
                entries.push(entry(&chunk_id, 0, 10));
            }
            let index = FakeIndexProcessor::new(entries);

            let outcome = marker
                .mark_for_delete(&CancellationToken::new(), &table, &UserId::from("t1"), &index, &expiration)
                .await
                .unwrap();

            let logs = marker::ready_logs(dir.path(), std::time::Duration::from_secs(0))
                .await
                .unwrap();
            let ids = marker::read_chunk_ids(&logs[0].path).await.unwrap();
            (outcome.empty, ids)
        })
    }

    proptest::proptest! {
        /// Property 2 (spec §8): if every chunk observed is reported fully
        /// expired with no surviving intervals, the scan is `empty` and
        /// every chunk appears in the marker log exactly once.
        #[test]
        fn fully_expired_scan_marks_every_chunk_exactly_once(count in 1usize..20) {
            let (empty, ids) = run_fully_expired_scan(count);
            proptest::prop_assert!(empty);
            proptest::prop_assert_eq!(ids.len(), count);
            proptest::prop_assert_eq!(ids.iter().collect::<std::collections::HashSet<_>>().len(), count);
        }
    }
}
