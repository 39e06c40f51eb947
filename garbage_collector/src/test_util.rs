//! In-memory fakes for the traits in [`crate::interfaces`], following the
//! `TestPersister`/`PausablePersister` pattern in `ingester::lifecycle::tests`.
//! Shared by the scenario tests in [`crate::table_marker`] and by proptests,
//! and by the sweeper tests in [`crate::sweeper::tests`].

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::{
    error::{Error, Result},
    interfaces::{ChunkClient, ChunkDataClient, ChunkVisitor, DeleteOutcome, ExpirationChecker, IndexProcessor},
    types::{ChunkData, ChunkEntry, ChunkId, Interval, IntervalFilter, Labels, RewrittenChunk, RowFilter, TimestampMillis, UserId},
};

/// A canned index: a fixed list of entries to stream, recording every call
/// made back into it during a scan.
#[derive(Debug, Default)]
pub struct FakeIndexProcessor {
    entries: Vec<ChunkEntry>,
    pub indexed: Mutex<Vec<RewrittenChunk>>,
    pub cleaned_up: Mutex<Vec<(UserId, Labels)>>,
    /// If set, `index_chunk` always returns this instead of `Ok(true)`.
    pub index_chunk_result: Option<bool>,
}

impl FakeIndexProcessor {
    pub fn new(entries: Vec<ChunkEntry>) -> Self {
        Self {
            entries,
            ..Default::default()
        }
    }
}

#[async_trait]
impl IndexProcessor for FakeIndexProcessor {
    async fn for_each_chunk(&self, visitor: &mut dyn ChunkVisitor) -> Result<()> {
        for entry in &self.entries {
            visitor.visit(entry).await?;
        }
        Ok(())
    }

    async fn index_chunk(&self, chunk: &RewrittenChunk) -> Result<bool> {
        if let Some(result) = self.index_chunk_result {
            return Ok(result);
        }
        self.indexed.lock().unwrap().push(chunk.clone());
        Ok(true)
    }

    async fn cleanup_series(&self, user_id: &UserId, labels: &Labels) -> Result<()> {
        self.cleaned_up
            .lock()
            .unwrap()
            .push((user_id.clone(), labels.clone()));
        Ok(())
    }
}

/// An expiration policy driven entirely by a canned per-chunk answer table,
/// keyed by `ChunkId`.
#[derive(Debug, Default)]
pub struct FakeExpirationChecker {
    answers: Mutex<std::collections::HashMap<String, (bool, Vec<IntervalFilter>)>>,
    drop_from_index_answers: Mutex<std::collections::HashMap<String, bool>>,
}

impl FakeExpirationChecker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arrange for `expired()` to return `(expired, surviving)` for `chunk_id`.
    pub fn set_expired(mut self, chunk_id: &str, expired: bool, surviving: Vec<IntervalFilter>) -> Self {
        self.answers
            .get_mut()
            .unwrap()
            .insert(chunk_id.to_string(), (expired, surviving));
        self
    }

    /// Arrange for `drop_from_index()` to return `drop` for `chunk_id`.
    pub fn set_drop_from_index(mut self, chunk_id: &str, drop: bool) -> Self {
        self.drop_from_index_answers
            .get_mut()
            .unwrap()
            .insert(chunk_id.to_string(), drop);
        self
    }
}

impl ExpirationChecker for FakeExpirationChecker {
    fn expired(&self, entry: &ChunkEntry, _now: TimestampMillis) -> (bool, Vec<IntervalFilter>) {
        self.answers
            .lock()
            .unwrap()
            .get(entry.chunk_ref.chunk_id.as_str())
            .cloned()
            .unwrap_or((false, Vec::new()))
    }

    fn drop_from_index(&self, entry: &ChunkEntry, _table_end: TimestampMillis, _now: TimestampMillis) -> bool {
        self.drop_from_index_answers
            .lock()
            .unwrap()
            .get(entry.chunk_ref.chunk_id.as_str())
            .copied()
            .unwrap_or(false)
    }
}

/// A chunk store that always serves the same fixed payload and records
/// every upload, so rewrite tests can assert on identity and count.
#[derive(Debug)]
pub struct FakeChunkDataClient {
    fingerprint: u64,
    pub puts: Mutex<Vec<(ChunkId, ChunkData)>>,
}

impl FakeChunkDataClient {
    pub fn new(fingerprint: u64) -> Self {
        Self {
            fingerprint,
            puts: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl ChunkDataClient for FakeChunkDataClient {
    async fn get_chunk(&self, _chunk_id: &ChunkId) -> Result<ChunkData> {
        Ok(ChunkData {
            fingerprint: self.fingerprint,
            labels: Labels::new(vec![("job".to_string(), "test".to_string())]),
            bytes: bytes::Bytes::from_static(b"payload"),
        })
    }

    fn rebound(
        &self,
        data: &ChunkData,
        _interval: Interval,
        _filter: Option<Arc<dyn RowFilter>>,
    ) -> Result<Option<ChunkData>> {
        Ok(Some(data.clone()))
    }

    async fn put_chunk(&self, chunk_id: &ChunkId, data: &ChunkData) -> Result<()> {
        self.puts.lock().unwrap().push((chunk_id.clone(), data.clone()));
        Ok(())
    }
}

/// A chunk object store that deletes successfully by default, recording
/// every delete call, with fault injection for the cases a sweep over a
/// marker log needs to exercise: a chunk already gone from the store, or a
/// delete that fails outright.
#[derive(Debug, Default)]
pub struct FakeChunkClient {
    missing: Mutex<std::collections::HashSet<String>>,
    fail: Mutex<std::collections::HashSet<String>>,
    pub deleted: Mutex<Vec<ChunkId>>,
}

impl FakeChunkClient {
    /// Arrange for a delete of `chunk_id` to report [`DeleteOutcome::NotFound`].
    pub fn mark_missing(&self, chunk_id: &str) {
        self.missing.lock().unwrap().insert(chunk_id.to_string());
    }

    /// Arrange for a delete of `chunk_id` to fail outright.
    pub fn mark_failing(&self, chunk_id: &str) {
        self.fail.lock().unwrap().insert(chunk_id.to_string());
    }
}

#[async_trait]
impl ChunkClient for FakeChunkClient {
    async fn delete_chunk(&self, _user_id: &UserId, chunk_id: &ChunkId) -> Result<DeleteOutcome> {
        let key = chunk_id.as_str().to_string();
        if self.fail.lock().unwrap().contains(&key) {
            return Err(Error::ChunkNotFound { chunk_id: key });
        }
        if self.missing.lock().unwrap().contains(&key) {
            return Ok(DeleteOutcome::NotFound);
        }
        self.deleted.lock().unwrap().push(chunk_id.clone());
        Ok(DeleteOutcome::Deleted)
    }
}
