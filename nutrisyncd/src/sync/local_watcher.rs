use std::path::PathBuf;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::gallery::is_image_path;

/// An image appeared or changed under one of the gallery roots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GalleryChange {
    pub path: PathBuf,
}

/// Watches every existing root recursively. Roots that cannot be watched are
/// skipped; the call fails only when none of them could be.
pub fn start_gallery_watcher(
    roots: &[PathBuf],
) -> notify::Result<(RecommendedWatcher, mpsc::UnboundedReceiver<GalleryChange>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            for change in map_event(event) {
                let _ = tx.send(change);
            }
        }
        Err(err) => debug!(%err, "watcher error"),
    })?;

    let mut watched = 0usize;
    for root in roots {
        if !root.is_dir() {
            continue;
        }
        match watcher.watch(root.as_path(), RecursiveMode::Recursive) {
            Ok(()) => watched += 1,
            Err(err) => warn!(root = %root.display(), %err, "cannot watch gallery root"),
        }
    }
    if watched == 0 {
        return Err(notify::Error::generic("no gallery root could be watched"));
    }
    Ok((watcher, rx))
}

fn map_event(event: Event) -> Vec<GalleryChange> {
    match event.kind {
        EventKind::Create(_) | EventKind::Modify(_) => event
            .paths
            .into_iter()
            .filter(|path| is_image_path(path))
            .map(|path| GalleryChange { path })
            .collect(),
        _ => Vec::new(),
    }
}
