//! Manages the persistence and eviction lifecycle of data in the buffer across all sequencers.
//! Note that the byte counts logged by the lifecycle manager and when exactly persistence gets
//! triggered aren't required to be absolutely accurate. The byte count is just an estimate
//! anyway, this just needs to keep things moving along to keep memory use roughly under
//! some absolute number and individual Parquet files that get persisted below some number. It
//! is expected that they may be above or below the absolute thresholds.

use crate::{
    data::Persister,
    job::{Job, JobRegistry},
    poison::{PoisonCabinet, PoisonPill},
};
use data_types::{PartitionId, SequenceNumber, SequencerId};
use iox_time::{Time, TimeProvider};
use metric::{Metric, U64Counter};
use observability_deps::tracing::{error, info};
use parking_lot::Mutex;
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracker::TrackedFutureExt;

/// API suitable for ingester tasks to query and update the [`LifecycleManager`] state.
pub trait LifecycleHandle: Send + Sync + 'static {
    /// Logs bytes written into a partition so that it can be tracked for the manager to
    /// trigger persistence. Returns true if the ingester should pause consuming from the
    /// write buffer so that persistence can catch up and free up memory.
    fn log_write(
        &self,
        partition_id: PartitionId,
        sequencer_id: SequencerId,
        sequence_number: SequenceNumber,
        bytes_written: usize,
    ) -> bool;

    /// Returns true if the `total_bytes` tracked by the manager is less than the pause amount.
    /// As persistence runs, the `total_bytes` go down.
    fn can_resume_ingest(&self) -> bool;
}

/// A handle for sequencer consumers to interact with the global
/// [`LifecycleManager`] instance.
///
/// This handle presents an API suitable for ingester tasks to query and update
/// the [`LifecycleManager`] state.
#[derive(Debug, Clone)]
pub struct LifecycleHandleImpl {
    time_provider: Arc<dyn TimeProvider>,

    config: Arc<LifecycleConfig>,

    /// The state shared with the [`LifecycleManager`].
    state: Arc<Mutex<LifecycleState>>,
}

impl LifecycleHandle for LifecycleHandleImpl {
    fn log_write(
        &self,
        partition_id: PartitionId,
        sequencer_id: SequencerId,
        sequence_number: SequenceNumber,
        bytes_written: usize,
    ) -> bool {
        let mut s = self.state.lock();
        let now = self.time_provider.now();

        let mut stats =
            s.partition_stats
                .entry(partition_id)
                .or_insert_with(|| PartitionLifecycleStats {
                    sequencer_id,
                    partition_id,
                    first_write: now,
                    last_write: now,
                    bytes_written: 0,
                    first_sequence_number: sequence_number,
                });

        stats.bytes_written += bytes_written;
        stats.last_write = now;

        s.total_bytes += bytes_written;
        s.total_bytes > self.config.pause_ingest_size
    }

    fn can_resume_ingest(&self) -> bool {
        let s = self.state.lock();
        s.total_bytes < self.config.pause_ingest_size
    }
}

/// The lifecycle manager keeps track of the size and age of partitions across
/// all sequencers. It triggers persistence based on keeping total memory usage
/// around a set amount while ensuring that partitions don't get too old or
/// large before being persisted.
///
/// The [`LifecycleManager`] instance is responsible for evaluating the state of
/// the partitions and periodically persisting and evicting partitions to
/// maintain the memory usage and acceptable data loss windows within the
/// defined configuration limits. It is expected to act as a singleton within an
/// ingester process.
///
/// The current system state is tracked by ingester tasks pushing updates to the
/// [`LifecycleManager`] through their respective [`LifecycleHandle`] instances.
///
/// A [`LifecycleManager`] MUST be driven by an external actor periodically
/// calling [`LifecycleManager::maybe_persist()`].
#[derive(Debug)]
pub struct LifecycleManager {
    config: Arc<LifecycleConfig>,
    time_provider: Arc<dyn TimeProvider>,
    job_registry: Arc<JobRegistry>,

    /// State shared with the [`LifecycleHandle`].
    ///
    /// [`LifecycleHandle`] instances update statistics directly by calling
    /// [`LifecycleHandle::log_write()`].
    state: Arc<Mutex<LifecycleState>>,

    /// Counter for memory pressure triggering a persist.
    persist_memory_counter: U64Counter,
    /// Counter for the size of a partition triggering a persist.
    persist_size_counter: U64Counter,
    /// Counter for the age of a partition triggering a persist.
    persist_age_counter: U64Counter,
    /// Counter for a partition going cold for writes triggering a persist.
    persist_cold_counter: U64Counter,
}

/// The configuration options for the lifecycle on the ingester.
#[derive(Debug, Clone, Copy)]
pub struct LifecycleConfig {
    /// The ingester will pause pulling data from Kafka if it hits this amount of memory used, waiting
    /// until persistence evicts partitions from memory.
    pause_ingest_size: usize,
    /// When the ingester hits this threshold, the lifecycle manager will persist the largest
    /// partitions currently buffered until it falls below this threshold. An ingester running
    /// in a steady state should operate around this amount of memory usage.
    persist_memory_threshold: usize,
    /// If the total bytes written to an individual partition crosses
    /// this threshold, it will be persisted.
    ///
    /// NOTE: This number is related, but *NOT* the same as the size
    /// of the memory used to keep the partition buffered.
    ///
    /// The purpose of this setting to to ensure the ingester doesn't
    /// create Parquet files that are too large.
    partition_size_threshold: usize,
    /// If an individual partitiion has had data buffered for longer than this period of time, the
    /// manager will persist it. This setting is to ensure we have an upper bound on how far back
    /// we will need to read in Kafka on restart or recovery.
    partition_age_threshold: Duration,
    /// If an individual partition hasn't received a write for longer than this period of time, the
    /// manager will persist it. This is to ensure that cold partitions get cleared out to make
    /// room for partitions that are actively receiving writes.
    partition_cold_threshold: Duration,
}

impl LifecycleConfig {
    /// Initialize a new LifecycleConfig. panics if the passed `pause_ingest_size` is less than the
    /// `persist_memory_threshold`.
    pub fn new(
        pause_ingest_size: usize,
        persist_memory_threshold: usize,
        partition_size_threshold: usize,
        partition_age_threshold: Duration,
        partition_cold_threshold: Duration,
    ) -> Self {
        // this must be true to ensure that persistence will get triggered, freeing up memory
        assert!(pause_ingest_size > persist_memory_threshold);

        Self {
            pause_ingest_size,
            persist_memory_threshold,
            partition_size_threshold,
            partition_age_threshold,
            partition_cold_threshold,
        }
    }
}

#[derive(Default, Debug)]
struct LifecycleState {
    total_bytes: usize,
    partition_stats: BTreeMap<PartitionId, PartitionLifecycleStats>,
}

impl LifecycleState {
    fn remove(&mut self, partition_id: &PartitionId) -> Option<PartitionLifecycleStats> {
        self.partition_stats.remove(partition_id)
    }
}

/// A snapshot of the stats for the lifecycle manager
#[derive(Debug)]
struct LifecycleStats {
    /// total number of bytes the lifecycle manager is aware of across all sequencers and
    /// partitions. Based on the mutable batch sizes received into all partitions.
    pub total_bytes: usize,
    /// the stats for every partition the lifecycle manager is tracking.
    pub partition_stats: Vec<PartitionLifecycleStats>,
}

/// The stats for a partition
#[derive(Debug, Clone, Copy)]
struct PartitionLifecycleStats {
    /// The sequencer this partition is under
    sequencer_id: SequencerId,
    /// The partition identifier
    partition_id: PartitionId,
    /// Time that the partition received its first write. This is reset anytime
    /// the partition is persisted.
    first_write: Time,
    /// Time that the partition received its last write. This is reset anytime
    /// the partition is persisted.
    last_write: Time,
    /// The number of bytes in the partition as estimated by the mutable batch sizes.
    bytes_written: usize,
    /// The sequence number the partition received on its first write. This is reset anytime
    /// the partition is persisted.
    first_sequence_number: SequenceNumber,
}

impl LifecycleManager {
    /// Initialize a new lifecycle manager that will persist when `maybe_persist` is called
    /// if anything is over the size or age threshold.
    pub(crate) fn new(
        config: LifecycleConfig,
        metric_registry: Arc<metric::Registry>,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        let persist_counter: Metric<U64Counter> = metric_registry.register_metric(
            "ingester_lifecycle_persist_count",
            "counter for different triggers that cause partition persistence",
        );

        let persist_memory_counter = persist_counter.recorder(&[("trigger", "memory")]);
        let persist_size_counter = persist_counter.recorder(&[("trigger", "size")]);
        let persist_age_counter = persist_counter.recorder(&[("trigger", "age")]);
        let persist_cold_counter = persist_counter.recorder(&[("trigger", "cold")]);

        let job_registry = Arc::new(JobRegistry::new(
            metric_registry,
            Arc::clone(&time_provider),
        ));
        Self {
            config: Arc::new(config),
            time_provider,
            job_registry,
            state: Default::default(),
            persist_memory_counter,
            persist_size_counter,
            persist_age_counter,
            persist_cold_counter,
        }
    }

    /// Acquire a shareable [`LifecycleHandle`] for this manager instance.
    pub fn handle(&self) -> LifecycleHandleImpl {
        LifecycleHandleImpl {
            time_provider: Arc::clone(&self.time_provider),
            config: Arc::clone(&self.config),
            state: Arc::clone(&self.state),
        }
    }

    /// This will persist any partitions that are over their size or age thresholds and
    /// persist as many partitions as necessary (largest first) to get below the memory threshold.
    /// The persist operations are spawned in new tasks and run at the same time, but the
    /// function waits for all to return before completing.
    pub async fn maybe_persist<P: Persister>(&mut self, persister: &Arc<P>) {
        let LifecycleStats {
            mut total_bytes,
            partition_stats,
        } = self.stats();

        // get anything over the threshold size or age to persist
        let now = self.time_provider.now();

        let (mut to_persist, mut rest): (
            Vec<PartitionLifecycleStats>,
            Vec<PartitionLifecycleStats>,
        ) = partition_stats.into_iter().partition(|s| {
            let aged_out = now
                .checked_duration_since(s.first_write)
                .map(|age| age > self.config.partition_age_threshold)
                .unwrap_or(false);
            if aged_out {
                self.persist_age_counter.inc(1);
            }

            let is_cold = now
                .checked_duration_since(s.last_write)
                .map(|age| age > self.config.partition_cold_threshold)
                .unwrap_or(false);
            if is_cold {
                self.persist_cold_counter.inc(1);
            }

            let sized_out = s.bytes_written > self.config.partition_size_threshold;
            if sized_out {
                self.persist_size_counter.inc(1);
                info!(sequencer_id=%s.sequencer_id,
                      partition_id=%s.partition_id,
                      bytes_written=s.bytes_written,
                      partition_size_threshold=self.config.partition_size_threshold,
                      "Partition is over size threshold, persisting");
            }

            aged_out || sized_out || is_cold
        });

        // keep track of what we'll be evicting to see what else to drop
        for s in &to_persist {
            total_bytes -= s.bytes_written;
        }

        // if we're still over the memory threshold, persist as many of the largest partitions
        // until we're under. It's ok if this is stale, it'll just get handled on the next pass
        // through.
        if total_bytes > self.config.persist_memory_threshold {
            rest.sort_by(|a, b| b.bytes_written.cmp(&a.bytes_written));

            let mut remaining = vec![];

            let mut memory_persist_counter = 0;
            for s in rest {
                if total_bytes >= self.config.persist_memory_threshold {
                    total_bytes -= s.bytes_written;
                    to_persist.push(s);
                    memory_persist_counter += 1;
                } else {
                    remaining.push(s);
                }
            }

            self.persist_memory_counter.inc(memory_persist_counter);

            rest = remaining;
        }

        // for the sequencers that are getting data persisted, keep track of what
        // the highest seqeunce number was for each.
        let mut sequencer_maxes = BTreeMap::new();
        for s in &to_persist {
            sequencer_maxes
                .entry(s.sequencer_id)
                .and_modify(|sn| {
                    if *sn < s.first_sequence_number {
                        *sn = s.first_sequence_number;
                    }
                })
                .or_insert(s.first_sequence_number);
        }

        let persist_tasks: Vec<_> = to_persist
            .into_iter()
            .map(|s| {
                // Mark this partition as being persisted, and remember the
                // memory allocation it had accumulated.
                let partition_memory_usage = self
                    .remove(s.partition_id)
                    .map(|s| s.bytes_written)
                    .unwrap_or_default();
                let persister = Arc::clone(persister);

                let (_tracker, registration) = self.job_registry.register(Job::Persist {
                    partition_id: s.partition_id,
                });

                let state = Arc::clone(&self.state);
                tokio::task::spawn(async move {
                    persister.persist(s.partition_id).await;
                    // Now the data has been uploaded and the memory it was
                    // using has been freed, released the memory capacity back
                    // the ingester.
                    state.lock().total_bytes -= partition_memory_usage;
                })
                .track(registration)
            })
            .collect();

        if !persist_tasks.is_empty() {
            let persists = futures::future::join_all(persist_tasks.into_iter());
            let results = persists.await;
            for res in results {
                res.expect("not aborted").expect("task finished");
            }

            // for the sequencers that had data persisted, update their min_unpersisted_sequence_number to
            // either the minimum remaining in everything that didn't get persisted, or the highest
            // number that was persisted. Marking the highest number as the state is ok because it
            // just needs to represent the farthest we'd have to seek back in the write buffer. Any
            // data replayed during recovery that has already been persisted will just be ignored.
            //
            // The calculation of the min unpersisted sequence number is:
            // - If there is any unpersisted data (i.e. `rest` contains entries for that sequencer) then we take the
            //   minimum sequence number from there. Note that there might be a gap between the data that we have just
            //   persisted and the unpersisted section.
            // - If there is NO unpersisted data, we take the max sequence number of the part that we have just
            //   persisted. Note that can cannot use "max + 1" because the lifecycle handler receives writes on a
            //   partition level and therefore might run while data for a single sequence number is added. So the max
            //   sequence number that we have just persisted might have more data.
            for (sequencer_id, sequence_number) in sequencer_maxes {
                let min = rest
                    .iter()
                    .filter(|s| s.sequencer_id == sequencer_id)
                    .map(|s| s.first_sequence_number)
                    .min()
                    .unwrap_or(sequence_number);
                persister
                    .update_min_unpersisted_sequence_number(sequencer_id, min)
                    .await;
            }
        }
    }

    /// Returns a point in time snapshot of the lifecycle state.
    fn stats(&self) -> LifecycleStats {
        let s = self.state.lock();
        let partition_stats: Vec<_> = s.partition_stats.values().cloned().collect();

        LifecycleStats {
            total_bytes: s.total_bytes,
            partition_stats,
        }
    }

    /// Removes the partition from the state
    fn remove(&self, partition_id: PartitionId) -> Option<PartitionLifecycleStats> {
        let mut s = self.state.lock();
        s.remove(&partition_id)
    }
}

const CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Runs the lifecycle manager to trigger persistence every second.
pub(crate) async fn run_lifecycle_manager<P: Persister>(
    mut manager: LifecycleManager,
    persister: Arc<P>,
    shutdown: CancellationToken,
    poison_cabinet: Arc<PoisonCabinet>,
) {
    loop {
        if poison_cabinet.contains(&PoisonPill::LifecyclePanic) {
            panic!("Lifecycle manager poisoned, panic");
        }
        if poison_cabinet.contains(&PoisonPill::LifecycleExit) {
            error!("Lifecycle manager poisoned, exit early");
            return;
        }

        if shutdown.is_cancelled() {
            info!("Lifecycle manager shutdown");
            return;
        }

        manager.maybe_persist(&persister).await;

        manager.job_registry.reclaim();

        tokio::select!(
            _ = tokio::time::sleep(CHECK_INTERVAL) => {},
            _ = shutdown.cancelled() => {},
        );
    }
}
