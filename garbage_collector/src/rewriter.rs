//! Reads a source chunk, rebounds it to a set of surviving intervals, and
//! indexes + uploads each replacement (spec §4.3).

use std::sync::Arc;

use observability_deps::tracing::{debug, info};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{Error, Result},
    interfaces::{ChunkDataClient, IndexProcessor},
    types::{ChunkEntry, ChunkId, IntervalFilter, RewrittenChunk, Table},
};

/// Rewrites a source chunk into the surviving sub-intervals the expiration
/// checker reported.
#[derive(Debug, Clone)]
pub struct ChunkRewriter {
    client: Arc<dyn ChunkDataClient>,
}

impl ChunkRewriter {
    /// Build a rewriter backed by `client`.
    pub fn new(client: Arc<dyn ChunkDataClient>) -> Self {
        Self { client }
    }

    /// Rewrite `entry` to each `(interval, filter)` in `interval_filters`
    /// that overlaps `table`'s interval, indexing and uploading every
    /// non-empty result. Returns true iff at least one replacement was
    /// indexed (and therefore uploaded).
    pub async fn rewrite_chunk(
        &self,
        cancel: &CancellationToken,
        entry: &ChunkEntry,
        table: &Table,
        index: &dyn IndexProcessor,
        interval_filters: &[IntervalFilter],
    ) -> Result<bool> {
        let chunk_ref = &entry.chunk_ref;
        let data = self.client.get_chunk(&chunk_ref.chunk_id).await?;

        let mut wrote_any = false;

        for interval_filter in interval_filters {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            if interval_filter.interval.entirely_outside(&table.interval()) {
                debug!(
                    chunk_id = %chunk_ref.chunk_id,
                    interval = %interval_filter.interval,
                    "skipping interval outside this table; a sibling table will produce it"
                );
                continue;
            }

            let rebound = self.client.rebound(
                &data,
                interval_filter.interval,
                interval_filter.filter.clone(),
            )?;

            let Some(new_data) = rebound else {
                info!(
                    chunk_id = %chunk_ref.chunk_id,
                    interval = %interval_filter.interval,
                    "rebound produced no data in range, skipping"
                );
                continue;
            };

            let new_chunk_id = ChunkId::derive(
                &chunk_ref.user_id,
                new_data.fingerprint,
                interval_filter.interval,
            );
            let rewritten = RewrittenChunk {
                chunk_id: new_chunk_id,
                table_name: table.name().to_string(),
                interval: interval_filter.interval,
                data: new_data,
            };

            // Index first, then upload: a crash in between leaves an index
            // entry pointing at a missing object, which the next retention
            // cycle's re-run will repair by rewriting and overwriting again.
            let indexed = index.index_chunk(&rewritten).await?;
            if !indexed {
                debug!(
                    chunk_id = %rewritten.chunk_id,
                    "index refused replacement chunk; not this table's responsibility"
                );
                continue;
            }

            self.client.put_chunk(&rewritten.chunk_id, &rewritten.data).await?;
            wrote_any = true;
        }

        Ok(wrote_any)
    }
}
