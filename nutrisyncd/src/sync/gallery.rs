use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::pending::PendingQueue;
use crate::storage::{StateStore, StoreError};

const WATERMARK_KEY: &str = "gallery.watermark_ms";
const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageCandidate {
    pub path: PathBuf,
    pub last_modified: i64,
}

/// Last-observed image modification time, in ms since the epoch.
#[derive(Clone)]
pub struct WatermarkStore {
    store: StateStore,
}

impl WatermarkStore {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// An unparseable stored value reads as 0 so the next scan re-bases it.
    pub async fn load(&self) -> Result<i64, StoreError> {
        let Some(raw) = self.store.get(WATERMARK_KEY).await? else {
            return Ok(0);
        };
        match raw.trim().parse::<i64>() {
            Ok(value) => Ok(value),
            Err(err) => {
                warn!(value = %raw, %err, "watermark is corrupt, resetting");
                Ok(0)
            }
        }
    }

    /// Never moves the watermark backwards; returns the stored value.
    pub async fn advance(&self, candidate_ms: i64) -> Result<i64, StoreError> {
        let current = self.load().await?;
        if candidate_ms <= current {
            return Ok(current);
        }
        self.store
            .set(WATERMARK_KEY, &candidate_ms.to_string())
            .await?;
        Ok(candidate_ms)
    }
}

/// Finds the newest image under a fixed set of roots and queues it.
pub struct GalleryScanner {
    roots: Vec<PathBuf>,
    watermark: WatermarkStore,
}

impl GalleryScanner {
    pub fn new(store: StateStore, roots: Vec<PathBuf>) -> Self {
        Self {
            roots,
            watermark: WatermarkStore::new(store),
        }
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    pub fn watermark(&self) -> &WatermarkStore {
        &self.watermark
    }

    /// One scan pass. At most one candidate (the newest one past the
    /// watermark) is reported and queued per pass.
    pub async fn scan(&self, pending: &PendingQueue) -> Result<Option<ImageCandidate>, StoreError> {
        let watermark = self.watermark.load().await?;
        let roots = self.roots.clone();
        let candidate =
            match tokio::task::spawn_blocking(move || find_newest_image(&roots, watermark)).await {
                Ok(candidate) => candidate,
                Err(err) => {
                    warn!(%err, "gallery scan task failed");
                    None
                }
            };
        let Some(candidate) = candidate else {
            debug!(watermark, "no new images");
            return Ok(None);
        };

        self.watermark.advance(candidate.last_modified).await?;
        let path = candidate.path.to_string_lossy().into_owned();
        let inserted = pending.add(&path).await?;
        info!(
            path = %path,
            last_modified = candidate.last_modified,
            already_queued = !inserted,
            "new image detected"
        );
        Ok(Some(candidate))
    }
}

pub fn is_image_path(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
}

/// Walks every root and returns the image with the greatest modification
/// time strictly newer than `watermark`. Unreadable entries are logged and
/// skipped.
pub fn find_newest_image(roots: &[PathBuf], watermark: i64) -> Option<ImageCandidate> {
    let mut newest: Option<ImageCandidate> = None;
    for root in roots {
        if !root.is_dir() {
            debug!(root = %root.display(), "gallery root is missing, skipping");
            continue;
        }
        for entry in WalkDir::new(root).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(
                        path = ?err.path(),
                        %err,
                        "skipping unreadable gallery entry"
                    );
                    continue;
                }
            };
            if !entry.file_type().is_file() || !is_image_path(entry.path()) {
                continue;
            }
            let Some(modified) = modified_millis(&entry) else {
                continue;
            };
            let best = newest
                .as_ref()
                .map(|candidate| candidate.last_modified)
                .unwrap_or(watermark);
            if modified > best {
                newest = Some(ImageCandidate {
                    path: entry.into_path(),
                    last_modified: modified,
                });
            }
        }
    }
    newest
}

fn modified_millis(entry: &walkdir::DirEntry) -> Option<i64> {
    let modified = match entry.metadata() {
        Ok(metadata) => metadata.modified().ok()?,
        Err(err) => {
            debug!(path = %entry.path().display(), %err, "cannot stat image");
            return None;
        }
    };
    let since_epoch = modified.duration_since(UNIX_EPOCH).ok()?;
    i64::try_from(since_epoch.as_millis()).ok()
}
