//! Mark-and-sweep retention core for a time-series chunk store.
//!
//! This crate implements the two durable phases of retention: the
//! [`table_marker`] scans one index table at a time, consulting an
//! [`interfaces::ExpirationChecker`] and an [`interfaces::IndexProcessor`] to
//! decide, per chunk, whether to keep it, rewrite it to a surviving
//! sub-interval via [`rewriter`], or append it to a durable [`marker`] log.
//! The [`sweeper`] independently drains those logs once they clear a grace
//! period, deleting the referenced objects through an
//! [`interfaces::ChunkClient`].
//!
//! Everything this crate consumes but does not itself implement — the index
//! engine, the expiration policy, the chunk codec, the object store facade —
//! is expressed as a trait in [`interfaces`]; a production binary wires
//! concrete implementations, tests wire fakes.

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_copy_implementations,
    clippy::explicit_iter_loop,
    clippy::future_not_send,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

pub mod error;
pub mod interfaces;
pub mod marker;
pub mod object_store_chunk_client;
pub mod rewriter;
pub mod sweeper;
pub mod table_marker;
pub mod types;
pub mod user_series;

#[cfg(test)]
pub(crate) mod test_util;

pub use error::{Error, Result};
pub use interfaces::{ChunkClient, ChunkDataClient, ChunkVisitor, DeleteOutcome, ExpirationChecker, IndexProcessor};
pub use object_store_chunk_client::ObjectStoreChunkStore;
pub use rewriter::ChunkRewriter;
pub use sweeper::{Sweeper, SweeperConfig, SweeperStats};
pub use table_marker::TableMarker;
pub use user_series::UserSeriesMap;
