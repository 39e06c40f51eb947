//! Ambient wiring for the garbage collector, analogous to
//! `ioxd_compactor::create_compactor_server_type` for the compactor: the
//! `influxdb_iox` binary owns the CLI flag surface and object store
//! construction, this crate owns turning an already-built object store and
//! metric registry into a running [`Sweeper`].
//!
//! Unlike the compactor, the garbage collector exposes no gRPC or HTTP API,
//! so there is no [`ioxd_common::server_type::ServerType`] here — just
//! [`run_garbage_collector`], a future that runs until cancelled.

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_copy_implementations,
    clippy::explicit_iter_loop,
    clippy::future_not_send,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use std::sync::Arc;

use garbage_collector::{ObjectStoreChunkStore, Sweeper, SweeperConfig};
use object_store::DynObjectStore;
use observability_deps::tracing::*;
use tokio_util::sync::CancellationToken;

/// Start a [`Sweeper`] over `object_store` and block until `shutdown` fires,
/// then drain it cleanly.
pub async fn run_garbage_collector(
    object_store: Arc<DynObjectStore>,
    metric_registry: &metric::Registry,
    sweeper_config: SweeperConfig,
    shutdown: CancellationToken,
) -> Result<(), garbage_collector::Error> {
    let chunk_client = Arc::new(ObjectStoreChunkStore::new(object_store));
    let sweeper = Arc::new(Sweeper::new(sweeper_config, chunk_client, metric_registry));

    info!("starting garbage collector sweeper");
    sweeper.start().await;

    shutdown.cancelled().await;
    info!("garbage collector shutting down");
    sweeper.stop().await;

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use object_store::memory::InMemory;

    use super::*;

    #[tokio::test]
    async fn run_garbage_collector_drains_on_cancellation() {
        let markers_dir = tempfile::tempdir().unwrap();
        let registry = metric::Registry::new();
        let shutdown = CancellationToken::new();

        let canceller = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                shutdown.cancel();
            })
        };

        run_garbage_collector(
            Arc::new(InMemory::new()),
            &registry,
            SweeperConfig {
                markers_dir: markers_dir.path().to_path_buf(),
                min_age_delete: Duration::from_secs(0),
                delete_worker_count: 2,
                poll_interval: Duration::from_millis(10),
            },
            shutdown,
        )
        .await
        .unwrap();

        canceller.await.unwrap();
    }
}
