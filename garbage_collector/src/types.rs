//! Data model for the retention core: chunk references, table intervals and
//! the bits of per-series state a table scan accumulates.

use std::{fmt, sync::Arc};

use bytes::Bytes;

use crate::error::{Error, Result};

/// One day, in milliseconds. Tables are bucketed on this period.
const TABLE_PERIOD_MILLIS: i64 = 24 * 60 * 60 * 1000;

/// Opaque tenant identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UserId(Bytes);

impl UserId {
    /// Build a `UserId` from any byte-like source.
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// The raw bytes of this tenant identifier.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self::new(Bytes::copy_from_slice(s.as_bytes()))
    }
}

/// Opaque series identifier, stable across chunks of the same label set
/// within a tenant.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SeriesId(Bytes);

impl SeriesId {
    /// Build a `SeriesId` from any byte-like source.
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// The raw bytes of this series identifier.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for SeriesId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl From<&str> for SeriesId {
    fn from(s: &str) -> Self {
        Self::new(Bytes::copy_from_slice(s.as_bytes()))
    }
}

/// External key addressing an object-store object. Its textual form is
/// `"<UserID>/<rest>"`: exactly one `/` separates the tenant prefix used by
/// the sweeper from the remainder of the key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkId(String);

impl ChunkId {
    /// Wrap an already-formatted chunk identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Deterministically derive the identifier of a rewrite produced for
    /// `user_id`/`fingerprint` bounded to `interval`. Re-running the rewriter
    /// with the same inputs always reproduces this same identifier, which is
    /// what makes the rewrite idempotent (spec §8, property 5).
    pub fn derive(user_id: &UserId, fingerprint: u64, interval: Interval) -> Self {
        Self(format!(
            "{user_id}/{fingerprint:016x}:{}:{}",
            interval.start.0, interval.end.0
        ))
    }

    /// The textual form of this identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split into `(tenant prefix, rest)`. Fails if `/` is missing or is the
    /// first byte (an empty tenant prefix).
    pub fn tenant_prefix(&self) -> Result<&str> {
        match self.0.split_once('/') {
            Some((prefix, _)) if !prefix.is_empty() => Ok(prefix),
            _ => Err(Error::InvalidChunkId {
                chunk_id: self.0.clone(),
            }),
        }
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Millisecond-resolution timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimestampMillis(pub i64);

impl TimestampMillis {
    /// Build a timestamp from a raw millisecond value.
    pub const fn new(millis: i64) -> Self {
        Self(millis)
    }
}

impl fmt::Display for TimestampMillis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An inclusive `[start, end]` span of milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    pub start: TimestampMillis,
    pub end: TimestampMillis,
}

impl Interval {
    /// Construct an interval, panicking if `start > end` — callers are
    /// expected to validate this at the boundary (parsing, checker results),
    /// not smuggle an inverted interval into the core.
    pub fn new(start: TimestampMillis, end: TimestampMillis) -> Self {
        assert!(start <= end, "interval start {start} > end {end}");
        Self { start, end }
    }

    /// True if `self` and `other` share at least one millisecond.
    pub fn overlaps(&self, other: &Interval) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// True if `self` is entirely outside `other` (no overlap at all).
    pub fn entirely_outside(&self, other: &Interval) -> bool {
        !self.overlaps(other)
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

/// A sorted, deduplicated label set.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Labels(Vec<(String, String)>);

impl Labels {
    /// Build a label set from an iterator of `(name, value)` pairs, sorting
    /// and deduplicating by name (last write wins).
    pub fn new(pairs: impl IntoIterator<Item = (String, String)>) -> Self {
        let mut pairs: Vec<_> = pairs.into_iter().collect();
        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        pairs.dedup_by(|a, b| a.0 == b.0);
        Self(pairs)
    }

    /// Iterate over the `(name, value)` pairs in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// The value for `name`, if present.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (k, v)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{k}={v:?}")?;
        }
        write!(f, "}}")
    }
}

/// A row-level predicate applied while rewriting a chunk. Opaque to the
/// core: ownership of what a "row" means belongs to the chunk codec.
pub trait RowFilter: fmt::Debug + Send + Sync {
    /// Returns true if the raw log line should survive the rewrite.
    fn keep(&self, line: &[u8]) -> bool;
}

/// The index-level reference to a stored chunk (spec §3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRef {
    pub user_id: UserId,
    pub series_id: SeriesId,
    pub chunk_id: ChunkId,
    pub from: TimestampMillis,
    pub through: TimestampMillis,
}

impl ChunkRef {
    /// The `[from, through]` interval this chunk covers.
    pub fn interval(&self) -> Interval {
        Interval::new(self.from, self.through)
    }
}

/// A [`ChunkRef`] enriched with the decoded label set of its series.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkEntry {
    pub chunk_ref: ChunkRef,
    pub labels: Labels,
}

/// A time-partitioned index shard. The `[start, end]` interval is derived
/// solely from the table's name using a day-bucketed convention (see
/// DESIGN.md for why this particular convention was chosen).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    name: String,
    interval: Interval,
}

impl Table {
    /// Parse a table name of the form `"{prefix}_{day_index}"` into its
    /// `[start, end]` interval (`day_index * 1 day` through
    /// `(day_index + 1) * 1 day - 1ms`).
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let day_index: i64 = name
            .rsplit_once('_')
            .and_then(|(_, idx)| idx.parse().ok())
            .ok_or_else(|| Error::InvalidTableName { name: name.clone() })?;
        let start = TimestampMillis::new(day_index * TABLE_PERIOD_MILLIS);
        let end = TimestampMillis::new((day_index + 1) * TABLE_PERIOD_MILLIS - 1);
        Ok(Self {
            name,
            interval: Interval::new(start, end),
        })
    }

    /// The table's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The table's `[start, end]` interval.
    pub fn interval(&self) -> Interval {
        self.interval
    }
}

/// A sub-range of a source chunk that must survive rewrite, plus an optional
/// row predicate applied during the rewrite.
#[derive(Debug, Clone)]
pub struct IntervalFilter {
    pub interval: Interval,
    pub filter: Option<Arc<dyn RowFilter>>,
}

impl IntervalFilter {
    /// Build an interval filter with no row predicate.
    pub fn unfiltered(interval: Interval) -> Self {
        Self {
            interval,
            filter: None,
        }
    }

    /// Build an interval filter with a row predicate.
    pub fn filtered(interval: Interval, filter: Arc<dyn RowFilter>) -> Self {
        Self {
            interval,
            filter: Some(filter),
        }
    }
}

/// Per-series bookkeeping tracked across a single table scan (spec §3).
#[derive(Debug, Clone)]
pub struct UserSeriesInfo {
    pub user_id: UserId,
    pub series_id: SeriesId,
    pub labels: Labels,
    pub is_deleted: bool,
}

/// The table-level outcome of [`crate::table_marker::TableMarker::mark_for_delete`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MarkOutcome {
    /// True iff every chunk in the table's index was marked for deletion —
    /// the caller may drop the whole table.
    pub empty: bool,
    /// True iff the index or chunk store was changed.
    pub modified: bool,
}

/// The payload of a chunk as seen by the rewriter: raw encoded bytes plus
/// enough metadata to rebuild a replacement chunk's identity.
#[derive(Debug, Clone)]
pub struct ChunkData {
    pub fingerprint: u64,
    pub labels: Labels,
    pub bytes: Bytes,
}

/// A replacement chunk produced by the rewriter, ready to be offered to the
/// index and then uploaded.
#[derive(Debug, Clone)]
pub struct RewrittenChunk {
    pub chunk_id: ChunkId,
    pub table_name: String,
    pub interval: Interval,
    pub data: ChunkData,
}
