//! Implementation of command line option for running the garbage collector

use std::{path::PathBuf, time::Duration};

use futures::FutureExt;
use garbage_collector::SweeperConfig;
use iox_time::{SystemProvider, TimeProvider};
use object_store::DynObjectStore;
use object_store_metrics::ObjectStoreMetrics;
use observability_deps::tracing::*;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use clap_blocks::object_store::make_object_store;
use clap_blocks::run_config::RunConfig;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Cannot parse object store config: {0}")]
    ObjectStoreParsing(#[from] clap_blocks::object_store::ParseError),

    #[error("error running garbage collector: {0}")]
    GarbageCollector(#[from] garbage_collector::Error),
}

#[derive(Debug, clap::Parser)]
#[clap(
    name = "run",
    about = "Runs in garbage collector mode",
    long_about = "Run the IOx garbage collector.\n\nThe configuration options below can be \
    set either with the command line flags or with the specified environment \
    variable. If there is a file named '.env' in the current working directory, \
    it is sourced before loading the configuration.

Configuration is loaded from the following sources (highest precedence first):
        - command line arguments
        - user set environment variables
        - .env file contents
        - pre-configured default values"
)]
pub struct Config {
    #[clap(flatten)]
    pub(crate) run_config: RunConfig,

    /// Directory holding durable marker log files produced by table scans.
    #[clap(
        long = "--gc-markers-dir",
        env = "INFLUXDB_IOX_GC_MARKERS_DIR",
        action
    )]
    pub markers_dir: PathBuf,

    /// Minimum age, in seconds, a marker log must reach before the chunks it
    /// names become eligible for physical deletion.
    #[clap(
        long = "--gc-min-age-delete-seconds",
        env = "INFLUXDB_IOX_GC_MIN_AGE_DELETE_SECONDS",
        default_value = "3600",
        action
    )]
    pub min_age_delete_seconds: u64,

    /// Number of concurrent object-store delete requests the sweeper issues.
    #[clap(
        long = "--gc-delete-worker-count",
        env = "INFLUXDB_IOX_GC_DELETE_WORKER_COUNT",
        default_value = "8",
        action
    )]
    pub delete_worker_count: usize,

    /// Seconds to sleep between sweep passes.
    #[clap(
        long = "--gc-poll-interval-seconds",
        env = "INFLUXDB_IOX_GC_POLL_INTERVAL_SECONDS",
        default_value = "300",
        action
    )]
    pub poll_interval_seconds: u64,
}

pub async fn command(config: Config) -> Result<(), Error> {
    let time_provider = Arc::new(SystemProvider::new()) as Arc<dyn TimeProvider>;
    let metric_registry: Arc<metric::Registry> = Default::default();

    let object_store = make_object_store(config.run_config.object_store_config())
        .map_err(Error::ObjectStoreParsing)?;

    // Decorate the object store with a metric recorder.
    let object_store: Arc<DynObjectStore> = Arc::new(ObjectStoreMetrics::new(
        object_store,
        Arc::clone(&time_provider),
        &*metric_registry,
    ));

    let sweeper_config = SweeperConfig {
        markers_dir: config.markers_dir,
        min_age_delete: Duration::from_secs(config.min_age_delete_seconds),
        delete_worker_count: config.delete_worker_count,
        poll_interval: Duration::from_secs(config.poll_interval_seconds),
    };

    let shutdown = CancellationToken::new();
    let ctrl_c = {
        let shutdown = shutdown.clone();
        tokio::signal::ctrl_c().map(move |_| shutdown.cancel())
    };

    info!("starting garbage collector");

    tokio::select! {
        result = ioxd_garbage_collector::run_garbage_collector(
            object_store,
            &metric_registry,
            sweeper_config,
            shutdown.clone(),
        ) => Ok(result?),
        _ = ctrl_c => {
            shutdown.cancel();
            Ok(())
        },
    }
}
