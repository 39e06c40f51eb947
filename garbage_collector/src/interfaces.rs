//! Traits the retention core consumes but does not implement (spec §6):
//! the index, the expiration policy, and the two chunk-store facades. A
//! production binary wires concrete implementations of these against the
//! real index engine and `object_store::DynObjectStore`; tests wire fakes.

use async_trait::async_trait;

use crate::{
    error::Result,
    types::{
        ChunkData, ChunkEntry, ChunkId, Interval, IntervalFilter, Labels, RewrittenChunk, RowFilter,
        TimestampMillis, UserId,
    },
};
use std::sync::Arc;

/// Callback driven by [`IndexProcessor::for_each_chunk`] for every chunk
/// observed during a table scan. Returning `Ok(true)` tells the index to
/// drop that chunk's entry.
#[async_trait]
pub trait ChunkVisitor: Send {
    /// Visit one indexed chunk, returning whether its index entry should be
    /// dropped.
    async fn visit(&mut self, entry: &ChunkEntry) -> Result<bool>;
}

/// The index table being scanned, combining the three capabilities the
/// decision procedure needs (spec §6, §9: "An implementer may present it as
/// a single capability set").
#[async_trait]
pub trait IndexProcessor: Send + Sync {
    /// Stream every chunk indexed for the scan's `(table, tenant)`,
    /// dispatching each to `visitor` and dropping the index entry whenever
    /// the visitor asks for it.
    async fn for_each_chunk(&self, visitor: &mut dyn ChunkVisitor) -> Result<()>;

    /// Idempotently index a replacement chunk produced by the rewriter.
    /// Returns `false` (not an error) if the indexer determines the chunk
    /// does not belong to the table currently being scanned.
    async fn index_chunk(&self, chunk: &RewrittenChunk) -> Result<bool>;

    /// Drop per-series metadata once every chunk referencing it is gone.
    async fn cleanup_series(&self, user_id: &UserId, labels: &Labels) -> Result<()>;
}

/// The retention policy boundary (spec §9: "must not conflate" the two
/// queries below).
pub trait ExpirationChecker: Send + Sync {
    /// Whether `entry` has (partially or fully) expired as of `now`, and if
    /// so, which sub-intervals still have surviving, non-deleted data.
    fn expired(&self, entry: &ChunkEntry, now: TimestampMillis) -> (bool, Vec<IntervalFilter>);

    /// Whether a chunk whose `through` exceeds `table_end` should have its
    /// entry dropped from *this* table's index because a later table will
    /// index it instead.
    fn drop_from_index(&self, entry: &ChunkEntry, table_end: TimestampMillis, now: TimestampMillis) -> bool;
}

/// Fetch, rebound and persist chunk payloads. Backed by
/// `object_store::DynObjectStore` in the provided implementation
/// (`object_store_chunk_client::ObjectStoreChunkStore`).
#[async_trait]
pub trait ChunkDataClient: Send + Sync {
    /// Fetch the full payload for a chunk. Fails with
    /// [`crate::error::Error::ChunkCountMismatch`] if the backing store does
    /// not resolve to exactly one object.
    async fn get_chunk(&self, chunk_id: &ChunkId) -> Result<ChunkData>;

    /// Produce a new payload containing only samples within `interval`,
    /// optionally filtered. `Ok(None)` means "no data survives in that
    /// range" — an expected, swallowed outcome, not an error.
    fn rebound(
        &self,
        data: &ChunkData,
        interval: Interval,
        filter: Option<Arc<dyn RowFilter>>,
    ) -> Result<Option<ChunkData>>;

    /// Upload a chunk payload under `chunk_id`.
    async fn put_chunk(&self, chunk_id: &ChunkId, data: &ChunkData) -> Result<()>;
}

/// The outcome of attempting to delete a chunk object. `NotFound` is a
/// first-class success value (spec §4.5, idempotency), not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
}

/// The sweeper's view of the chunk object store.
#[async_trait]
pub trait ChunkClient: Send + Sync {
    /// Delete the chunk object addressed by `chunk_id` under `user_id`.
    async fn delete_chunk(&self, user_id: &UserId, chunk_id: &ChunkId) -> Result<DeleteOutcome>;
}
