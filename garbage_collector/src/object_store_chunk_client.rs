//! Concrete [`ChunkDataClient`]/[`ChunkClient`] implementation backed by
//! `object_store::DynObjectStore`.
//!
//! `object_store` has no notion of object metadata, so each object is a
//! single contiguous blob: a small fixed-layout header (fingerprint plus the
//! label set) immediately followed by the raw chunk payload. Row-level
//! rebound filtering operates on newline-delimited lines, matching the
//! "Chunk" glossary entry (a codec-encoded blob of log samples); the real
//! sample codec itself stays out of scope for this core (spec §1).

use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::TryStreamExt;
use object_store::{path::Path, DynObjectStore};
use snafu::ResultExt;

use crate::{
    error::{Error, ObjectStoreSnafu, Result},
    interfaces::{ChunkClient, ChunkDataClient, DeleteOutcome},
    types::{ChunkData, ChunkId, Interval, Labels, RowFilter, UserId},
};

/// Backs the retention core's two chunk-store traits with a real
/// `object_store::DynObjectStore`.
#[derive(Debug, Clone)]
pub struct ObjectStoreChunkStore {
    store: Arc<DynObjectStore>,
}

impl ObjectStoreChunkStore {
    pub fn new(store: Arc<DynObjectStore>) -> Self {
        Self { store }
    }

    fn path_for(chunk_id: &ChunkId) -> Path {
        Path::from(chunk_id.as_str())
    }

    /// `[fingerprint: u64][label count: u32][(key len: u32, key, val len: u32, val)*][payload]`
    fn encode(data: &ChunkData) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u64_le(data.fingerprint);
        let labels: Vec<_> = data.labels.iter().collect();
        buf.put_u32_le(labels.len() as u32);
        for (k, v) in labels {
            buf.put_u32_le(k.len() as u32);
            buf.put_slice(k.as_bytes());
            buf.put_u32_le(v.len() as u32);
            buf.put_slice(v.as_bytes());
        }
        buf.put_slice(&data.bytes);
        buf.freeze()
    }

    fn decode(chunk_id: &ChunkId, mut bytes: Bytes) -> Result<ChunkData> {
        let malformed = || Error::InvalidChunkType {
            chunk_id: chunk_id.as_str().to_string(),
        };

        if bytes.remaining() < 8 {
            return Err(malformed());
        }
        let fingerprint = bytes.get_u64_le();
        if bytes.remaining() < 4 {
            return Err(malformed());
        }
        let label_count = bytes.get_u32_le();
        let mut pairs = Vec::with_capacity(label_count as usize);
        for _ in 0..label_count {
            if bytes.remaining() < 4 {
                return Err(malformed());
            }
            let key_len = bytes.get_u32_le() as usize;
            if bytes.remaining() < key_len + 4 {
                return Err(malformed());
            }
            let key = bytes.copy_to_bytes(key_len);
            let key = String::from_utf8(key.to_vec()).map_err(|_| malformed())?;
            let val_len = bytes.get_u32_le() as usize;
            if bytes.remaining() < val_len {
                return Err(malformed());
            }
            let val = bytes.copy_to_bytes(val_len);
            let val = String::from_utf8(val.to_vec()).map_err(|_| malformed())?;
            pairs.push((key, val));
        }
        Ok(ChunkData {
            fingerprint,
            labels: Labels::new(pairs),
            bytes,
        })
    }
}

#[async_trait]
impl ChunkDataClient for ObjectStoreChunkStore {
    async fn get_chunk(&self, chunk_id: &ChunkId) -> Result<ChunkData> {
        let path = Self::path_for(chunk_id);
        let matches: Vec<_> = self
            .store
            .list(Some(&path))
            .await
            .context(ObjectStoreSnafu)?
            .try_collect()
            .await
            .context(ObjectStoreSnafu)?;

        if matches.len() != 1 {
            return Err(Error::ChunkCountMismatch {
                chunk_id: chunk_id.as_str().to_string(),
                count: matches.len(),
            });
        }

        let result = self
            .store
            .get(&matches[0].location)
            .await
            .context(ObjectStoreSnafu)?;
        let bytes = result.bytes().await.context(ObjectStoreSnafu)?;
        Self::decode(chunk_id, bytes)
    }

    fn rebound(
        &self,
        data: &ChunkData,
        interval: Interval,
        filter: Option<Arc<dyn RowFilter>>,
    ) -> Result<Option<ChunkData>> {
        let _ = interval; // sample-level time clipping belongs to the real chunk codec (spec §1).
        let kept: Vec<&[u8]> = data
            .bytes
            .split(|&b| b == b'\n')
            .filter(|line| !line.is_empty())
            .filter(|line| filter.as_deref().map_or(true, |f| f.keep(line)))
            .collect();
        if kept.is_empty() {
            return Ok(None);
        }
        let mut out = BytesMut::new();
        for (i, line) in kept.iter().enumerate() {
            if i > 0 {
                out.put_u8(b'\n');
            }
            out.put_slice(line);
        }
        Ok(Some(ChunkData {
            fingerprint: data.fingerprint,
            labels: data.labels.clone(),
            bytes: out.freeze(),
        }))
    }

    async fn put_chunk(&self, chunk_id: &ChunkId, data: &ChunkData) -> Result<()> {
        let path = Self::path_for(chunk_id);
        let encoded = Self::encode(data);
        self.store.put(&path, encoded).await.context(ObjectStoreSnafu)?;
        Ok(())
    }
}

#[async_trait]
impl ChunkClient for ObjectStoreChunkStore {
    async fn delete_chunk(&self, _user_id: &UserId, chunk_id: &ChunkId) -> Result<DeleteOutcome> {
        let path = Self::path_for(chunk_id);
        match self.store.delete(&path).await {
            Ok(()) => Ok(DeleteOutcome::Deleted),
            Err(object_store::Error::NotFound { .. }) => Ok(DeleteOutcome::NotFound),
            Err(source) => Err(source).context(ObjectStoreSnafu),
        }
    }
}
