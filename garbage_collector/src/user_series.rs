//! Scan-scoped `(UserId, SeriesId) -> UserSeriesInfo` bookkeeping (spec
//! §4.6). Single-threaded, owned by one [`crate::table_marker::TableMarker`]
//! scan at a time — mirrors `LifecycleState` in `ingester::lifecycle`, which
//! is likewise a plain map guarded only by being owned by one driver.

use std::collections::BTreeMap;

use crate::{
    error::Result,
    types::{Labels, SeriesId, UserId, UserSeriesInfo},
};

/// Tracks, per `(UserId, SeriesId)`, whether any surviving chunk was
/// observed during the current table scan.
#[derive(Debug, Default)]
pub struct UserSeriesMap {
    series: BTreeMap<(UserId, SeriesId), UserSeriesInfo>,
}

impl UserSeriesMap {
    /// An empty map, ready for a new scan.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `series_id` was observed, retaining the first label set
    /// seen. Idempotent: subsequent calls for the same series are no-ops
    /// beyond the first.
    pub fn add(&mut self, user_id: &UserId, series_id: &SeriesId, labels: &Labels) {
        self.series
            .entry((user_id.clone(), series_id.clone()))
            .or_insert_with(|| UserSeriesInfo {
                user_id: user_id.clone(),
                series_id: series_id.clone(),
                labels: labels.clone(),
                is_deleted: true,
            });
    }

    /// Clear the `is_deleted` flag for a series: a surviving chunk for it
    /// was observed.
    pub fn mark_series_not_deleted(&mut self, user_id: &UserId, series_id: &SeriesId) {
        if let Some(info) = self.series.get_mut(&(user_id.clone(), series_id.clone())) {
            info.is_deleted = false;
        }
    }

    /// Number of distinct series observed this scan.
    pub fn len(&self) -> usize {
        self.series.len()
    }

    /// True if no series has been observed yet.
    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    /// Invoke `f` for every tracked series, in unspecified order. The first
    /// error aborts iteration and is returned.
    pub fn for_each(&self, mut f: impl FnMut(&UserSeriesInfo) -> Result<()>) -> Result<()> {
        for info in self.series.values() {
            f(info)?;
        }
        Ok(())
    }
}
