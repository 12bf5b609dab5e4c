//! Segment storage
//!
//! Files land under `<root>/YYYY-MM-DD/HH/segment_<start>_<number>.vseg`.
//! Each write goes to a `.tmp` sibling first and is renamed into place, so
//! a crash never leaves a half-written segment under its final name.
//!
//! After a successful write the segment is reported to a
//! [`SegmentCatalog`]; the bundled [`JsonIndexCatalog`] appends one JSON
//! line per segment to `<root>/index.jsonl`.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::container::ContainerError;
use crate::error::FaultClass;
use crate::utils::Retryable;

/// Extension of finished segment files
pub const SEGMENT_EXT: &str = "vseg";
/// Extension of in-progress writes
pub const TEMP_EXT: &str = "tmp";
/// Catalog file name under the recordings root
pub const INDEX_FILE: &str = "index.jsonl";

/// Temp files younger than this are assumed to belong to a live write
const STALE_TEMP_AGE: Duration = Duration::from_secs(3600);

/// Storage failures
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("catalog rejected segment: {0}")]
    Catalog(String),

    #[error("container error: {0}")]
    Container(#[from] ContainerError),
}

impl StorageError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Fault class
    pub fn class(&self) -> FaultClass {
        match self {
            Self::Io { .. } | Self::Catalog(_) => FaultClass::Resource,
            Self::Container(_) => FaultClass::Data,
        }
    }
}

impl Retryable for StorageError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Io { source, .. } => source.is_retryable(),
            Self::Catalog(_) => true,
            Self::Container(_) => false,
        }
    }
}

/// Catalog entry for one written segment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentMetadata {
    /// Segment number
    pub number: u64,
    /// First frame
    pub started_at: DateTime<Utc>,
    /// Last frame
    pub ended_at: DateTime<Utc>,
    /// Frames written
    pub frame_count: u32,
    /// File size
    pub byte_size: u64,
    /// Frames replaced by the previous good one
    pub substituted_frames: u32,
    /// Segments whose frames were folded in
    pub merged_from: Vec<u64>,
    /// Written before reaching readiness
    pub forced: bool,
}

/// Receives written segments (gallery, retention bookkeeping)
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SegmentCatalog: Send + Sync {
    /// Record a durable segment file
    async fn persist_segment(&self, path: &Path, metadata: &SegmentMetadata) -> Result<(), StorageError>;
}

/// Catalog appending JSON lines to `index.jsonl`
pub struct JsonIndexCatalog {
    index_path: PathBuf,
}

#[derive(Serialize)]
struct IndexLine<'a> {
    path: &'a Path,
    #[serde(flatten)]
    metadata: &'a SegmentMetadata,
}

impl JsonIndexCatalog {
    /// Catalog writing `<root>/index.jsonl`
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            index_path: root.as_ref().join(INDEX_FILE),
        }
    }

    /// Path of the index file
    pub fn index_path(&self) -> &Path {
        &self.index_path
    }
}

#[async_trait]
impl SegmentCatalog for JsonIndexCatalog {
    async fn persist_segment(&self, path: &Path, metadata: &SegmentMetadata) -> Result<(), StorageError> {
        let mut line = serde_json::to_string(&IndexLine { path, metadata })
            .map_err(|e| StorageError::Catalog(e.to_string()))?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.index_path)
            .await
            .map_err(|e| StorageError::io(&self.index_path, e))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| StorageError::io(&self.index_path, e))?;
        file.flush().await.map_err(|e| StorageError::io(&self.index_path, e))?;
        Ok(())
    }
}

/// Writes segment files under a recordings root
#[derive(Debug, Clone)]
pub struct SegmentWriter {
    root: PathBuf,
}

impl SegmentWriter {
    /// Writer rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Recordings root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the root directory; failure here is fatal at startup
    pub async fn ensure_root(&self) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| StorageError::io(&self.root, e))
    }

    /// Final path for a segment
    pub fn path_for(&self, number: u64, started_at: DateTime<Utc>) -> PathBuf {
        self.root
            .join(started_at.format("%Y-%m-%d").to_string())
            .join(started_at.format("%H").to_string())
            .join(format!(
                "segment_{}_{:06}.{}",
                started_at.format("%Y%m%d_%H%M%S"),
                number,
                SEGMENT_EXT
            ))
    }

    /// Write `bytes` atomically, returning the final path
    pub async fn write(&self, number: u64, started_at: DateTime<Utc>, bytes: &Bytes) -> Result<PathBuf, StorageError> {
        let path = self.path_for(number, started_at);
        let temp = path.with_extension(format!("{}.{}", SEGMENT_EXT, TEMP_EXT));

        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await.map_err(|e| StorageError::io(dir, e))?;
        }

        let result = async {
            let mut file = tokio::fs::File::create(&temp).await?;
            file.write_all(bytes).await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&temp, &path).await
        }
        .await;

        if let Err(e) = result {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(StorageError::io(&path, e));
        }

        debug!("Wrote segment {} ({} bytes) to {}", number, bytes.len(), path.display());
        Ok(path)
    }
}

/// What a retention sweep removed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Expired segment files
    pub removed_segments: usize,
    /// Abandoned temp files
    pub removed_temp: usize,
    /// Emptied directories
    pub removed_dirs: usize,
    /// Bytes freed
    pub freed_bytes: u64,
}

/// Delete segments modified before `cutoff`, stale temp files and empty
/// directories under `root`. Blocking; run on the blocking pool.
pub fn sweep_retention(root: &Path, cutoff: SystemTime) -> io::Result<SweepReport> {
    let mut report = SweepReport::default();
    let temp_cutoff = SystemTime::now()
        .checked_sub(STALE_TEMP_AGE)
        .unwrap_or(SystemTime::UNIX_EPOCH);
    if root.is_dir() {
        sweep_dir(root, root, cutoff, temp_cutoff, &mut report)?;
    }
    if report.removed_segments + report.removed_temp > 0 {
        info!(
            "Retention sweep removed {} segments, {} temp files, {} directories ({} bytes)",
            report.removed_segments, report.removed_temp, report.removed_dirs, report.freed_bytes
        );
    }
    Ok(report)
}

fn sweep_dir(
    root: &Path,
    dir: &Path,
    cutoff: SystemTime,
    temp_cutoff: SystemTime,
    report: &mut SweepReport,
) -> io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let meta = entry.metadata()?;

        if meta.is_dir() {
            sweep_dir(root, &path, cutoff, temp_cutoff, report)?;
            continue;
        }

        let modified = meta.modified().unwrap_or(SystemTime::now());
        let ext = path.extension().and_then(|e| e.to_str());
        let expired = match ext {
            Some(SEGMENT_EXT) => modified < cutoff,
            Some(TEMP_EXT) => modified < temp_cutoff,
            _ => false,
        };
        if !expired {
            continue;
        }
        match std::fs::remove_file(&path) {
            Ok(()) => {
                report.freed_bytes += meta.len();
                if ext == Some(TEMP_EXT) {
                    report.removed_temp += 1;
                } else {
                    report.removed_segments += 1;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Could not remove {}: {}", path.display(), e),
        }
    }

    if dir != root && std::fs::read_dir(dir)?.next().is_none() {
        std::fs::remove_dir(dir)?;
        report.removed_dirs += 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn started() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 17, 14, 3, 9).unwrap()
    }

    #[test]
    fn test_path_layout() {
        let writer = SegmentWriter::new("/data/recordings");
        assert_eq!(
            writer.path_for(42, started()),
            PathBuf::from("/data/recordings/2024-05-17/14/segment_20240517_140309_000042.vseg")
        );
    }

    #[tokio::test]
    async fn test_write_is_atomic_and_leaves_no_temp() {
        let dir = tempfile::tempdir().unwrap();
        let writer = SegmentWriter::new(dir.path());
        let path = writer.write(1, started(), &Bytes::from_static(b"VSEGdata")).await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"VSEGdata");
        let siblings: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(siblings.len(), 1);
    }

    #[tokio::test]
    async fn test_json_catalog_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = JsonIndexCatalog::new(dir.path());
        let meta = SegmentMetadata {
            number: 3,
            started_at: started(),
            ended_at: started(),
            frame_count: 10,
            byte_size: 1234,
            substituted_frames: 1,
            merged_from: vec![1, 2],
            forced: false,
        };
        catalog.persist_segment(Path::new("/x/a.vseg"), &meta).await.unwrap();
        catalog.persist_segment(Path::new("/x/b.vseg"), &meta).await.unwrap();

        let text = std::fs::read_to_string(catalog.index_path()).unwrap();
        let lines: Vec<serde_json::Value> = text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["path"], "/x/b.vseg");
        assert_eq!(lines[0]["number"], 3);
        assert_eq!(lines[0]["merged_from"], serde_json::json!([1, 2]));
    }

    #[test]
    fn test_sweep_removes_expired_and_empty_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let hour = dir.path().join("2024-01-01").join("00");
        std::fs::create_dir_all(&hour).unwrap();
        std::fs::write(hour.join("segment_a.vseg"), b"old").unwrap();
        std::fs::write(dir.path().join(INDEX_FILE), b"{}\n").unwrap();

        // Cutoff in the future: every segment is expired.
        let cutoff = SystemTime::now() + Duration::from_secs(60);
        let report = sweep_retention(dir.path(), cutoff).unwrap();

        assert_eq!(report.removed_segments, 1);
        assert_eq!(report.removed_dirs, 2);
        assert_eq!(report.freed_bytes, 3);
        assert!(dir.path().join(INDEX_FILE).exists());
        assert!(!dir.path().join("2024-01-01").exists());
    }

    #[test]
    fn test_sweep_keeps_recent() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("fresh.vseg"), b"new").unwrap();
        std::fs::write(dir.path().join("live.vseg.tmp"), b"partial").unwrap();
        let cutoff = SystemTime::now() - Duration::from_secs(3600);
        let report = sweep_retention(dir.path(), cutoff).unwrap();
        assert_eq!(report, SweepReport::default());
    }

    #[test]
    fn test_storage_error_retryability() {
        let transient = StorageError::io(Path::new("/x"), io::Error::from(io::ErrorKind::TimedOut));
        let denied = StorageError::io(Path::new("/x"), io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(transient.is_retryable());
        assert!(!denied.is_retryable());
        assert!(!StorageError::Container(ContainerError::NoReadableFrames).is_retryable());
        assert_eq!(transient.class(), FaultClass::Resource);
    }
}
