//! Error kinds for the retention core (spec §7).
//!
//! Two conditions the spec calls out as "swallowed" — an empty rebound and an
//! indexer refusing a chunk — are deliberately *not* variants here. They are
//! modeled as ordinary `Option`/`bool` return values (see
//! [`crate::interfaces::ChunkDataClient::rebound`] and
//! [`crate::interfaces::IndexProcessor::index_chunk`]), since they are not
//! exceptional: every other variant below aborts whatever operation raised
//! it.

use snafu::Snafu;

/// Errors raised by the retention core.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    /// A table scan completed without observing a single chunk. Distinct
    /// from `empty` so callers never mistake "nothing indexed" (likely a
    /// bug upstream) for "everything expired".
    #[snafu(display("table scan observed zero chunks, refusing to report empty"))]
    NoChunksFound,

    /// A chunk identifier did not contain a valid tenant prefix.
    #[snafu(display("chunk id {chunk_id:?} has no valid tenant prefix"))]
    InvalidChunkId { chunk_id: String },

    /// A table name could not be parsed into a `[start, end]` interval.
    #[snafu(display("table name {name:?} is not a valid day-bucketed table name"))]
    InvalidTableName { name: String },

    /// The object store reported a chunk as absent when one was expected.
    #[snafu(display("chunk {chunk_id} not found in object store"))]
    ChunkNotFound { chunk_id: String },

    /// Fetching a chunk returned a count other than exactly one.
    #[snafu(display("expected exactly one chunk for {chunk_id}, got {count}"))]
    ChunkCountMismatch { chunk_id: String, count: usize },

    /// The rebound operation produced a payload the codec could not wrap
    /// into a chunk of the expected type.
    #[snafu(display("rebound of chunk {chunk_id} produced an unexpected chunk type"))]
    InvalidChunkType { chunk_id: String },

    /// The caller's context was cancelled mid-scan or mid-sweep.
    #[snafu(display("operation cancelled"))]
    Cancelled,

    /// A collaborator (index, object store, marker log) reported a
    /// transport/storage-level failure.
    #[snafu(display("object store error: {source}"))]
    ObjectStore { source: object_store::Error },

    /// A marker log file could not be read or written.
    #[snafu(display("marker log io error: {source}"))]
    Io { source: std::io::Error },
}

impl Error {
    /// True for the one variant that must never be confused with `empty`.
    pub fn is_no_chunks_found(&self) -> bool {
        matches!(self, Error::NoChunksFound)
    }
}

/// Convenience alias matching the rest of this codebase's `Result<T, E = Error>` idiom.
pub type Result<T, E = Error> = std::result::Result<T, E>;
