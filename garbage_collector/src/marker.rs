//! Durable marker log format (spec §3 "MarkerLog", §4.4).
//!
//! Each table scan owns one append-only, newline-delimited log of
//! [`ChunkId`]s. The log is written under a `.pending` extension so that the
//! sweeper never observes a half-written file; `close()` fsyncs the content
//! and renames it to `.log`, which is the point at which the Reader may see
//! it. Age, for the `min_age_delete` gate, is the file's mtime.

use std::{
    path::{Path, PathBuf},
    time::SystemTime,
};

use tokio::{
    fs::{self, File},
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
};
use uuid::Uuid;

use crate::{
    error::{IoSnafu, Result},
    types::ChunkId,
};
use snafu::ResultExt;

const PENDING_SUFFIX: &str = "pending";
const CLOSED_SUFFIX: &str = "log";

/// An open, append-only marker log for one table scan.
#[derive(Debug)]
pub struct MarkerWriter {
    pending_path: PathBuf,
    closed_path: PathBuf,
    file: File,
    count: u64,
}

impl MarkerWriter {
    /// Create a fresh marker log under `markers_dir` for `table_name`.
    /// `markers_dir` is created if it does not already exist.
    pub async fn create(markers_dir: &Path, table_name: &str) -> Result<Self> {
        fs::create_dir_all(markers_dir).await.context(IoSnafu)?;

        let stem = format!("{table_name}-{}", Uuid::new_v4());
        let pending_path = markers_dir.join(format!("{stem}.{PENDING_SUFFIX}"));
        let closed_path = markers_dir.join(format!("{stem}.{CLOSED_SUFFIX}"));

        let file = File::create(&pending_path).await.context(IoSnafu)?;

        Ok(Self {
            pending_path,
            closed_path,
            file,
            count: 0,
        })
    }

    /// Append a chunk identifier scheduled for later deletion.
    pub async fn put(&mut self, chunk_id: &ChunkId) -> Result<()> {
        let mut line = chunk_id.as_str().to_string();
        line.push('\n');
        self.file.write_all(line.as_bytes()).await.context(IoSnafu)?;
        self.count += 1;
        Ok(())
    }

    /// The number of chunk identifiers appended so far.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Fsync and rename the log so the Reader can discover it. Consumes
    /// `self`: once closed, a marker log is immutable.
    pub async fn close(mut self) -> Result<()> {
        self.file.flush().await.context(IoSnafu)?;
        self.file.sync_all().await.context(IoSnafu)?;
        drop(self.file);
        fs::rename(&self.pending_path, &self.closed_path)
            .await
            .context(IoSnafu)?;
        Ok(())
    }

    /// Discard the log without advertising it to the Reader — used when a
    /// scan aborts (e.g. `NoChunksFound`) and the partial log must never be
    /// swept.
    pub async fn abandon(self) -> Result<()> {
        drop(self.file);
        match fs::remove_file(&self.pending_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context(IoSnafu),
        }
    }
}

/// A closed marker log discovered on disk, with its age.
#[derive(Debug, Clone)]
pub struct MarkerLogHandle {
    pub path: PathBuf,
    pub age: std::time::Duration,
}

/// List every closed (`.log`) marker log under `markers_dir` whose age is at
/// least `min_age`.
pub async fn ready_logs(markers_dir: &Path, min_age: std::time::Duration) -> Result<Vec<MarkerLogHandle>> {
    let mut out = Vec::new();
    let mut entries = match fs::read_dir(markers_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(e).context(IoSnafu),
    };

    let now = SystemTime::now();
    while let Some(entry) = entries.next_entry().await.context(IoSnafu)? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(CLOSED_SUFFIX) {
            continue;
        }
        let metadata = entry.metadata().await.context(IoSnafu)?;
        let modified = metadata.modified().context(IoSnafu)?;
        let age = now.duration_since(modified).unwrap_or_default();
        if age >= min_age {
            out.push(MarkerLogHandle { path, age });
        }
    }
    Ok(out)
}

/// Read every chunk identifier recorded in a closed marker log.
pub async fn read_chunk_ids(path: &Path) -> Result<Vec<ChunkId>> {
    let file = File::open(path).await.context(IoSnafu)?;
    let mut lines = BufReader::new(file).lines();
    let mut out = Vec::new();
    while let Some(line) = lines.next_line().await.context(IoSnafu)? {
        if !line.is_empty() {
            out.push(ChunkId::new(line));
        }
    }
    Ok(out)
}

/// Remove a fully-processed marker log file.
pub async fn remove_log(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).context(IoSnafu),
    }
}
