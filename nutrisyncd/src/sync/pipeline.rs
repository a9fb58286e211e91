use std::path::Path;
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use nutrisync_core::{BackendClient, VisionClient};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::delivery::deliver;
use super::events::{EventSink, PipelineEvent};
use super::gallery::GalleryScanner;
use super::now_millis;
use super::pending::PendingQueue;
use super::retry::{RetryItem, RetryQueue, RetryReport};
use crate::identity::IdentityResolver;
use crate::storage::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineCommand {
    /// Look for a new gallery image and drain if the backend is reachable.
    Scan,
    /// Analyze and deliver everything pending.
    Drain,
    /// Run one retry pass if the backend is reachable.
    ProcessRetries,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub analyzed: usize,
    pub analysis_failed: usize,
    pub synced: usize,
    pub queued_for_retry: usize,
    pub kept_pending: usize,
}

pub struct Pipeline {
    pending: PendingQueue,
    retry: RetryQueue,
    vision: VisionClient,
    backend: BackendClient,
    identity: IdentityResolver,
    scanner: GalleryScanner,
    reachable: watch::Receiver<bool>,
    events: EventSink,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pending: PendingQueue,
        retry: RetryQueue,
        vision: VisionClient,
        backend: BackendClient,
        identity: IdentityResolver,
        scanner: GalleryScanner,
        reachable: watch::Receiver<bool>,
        events: EventSink,
    ) -> Self {
        Self {
            pending,
            retry,
            vision,
            backend,
            identity,
            scanner,
            reachable,
            events,
        }
    }

    pub fn pending(&self) -> &PendingQueue {
        &self.pending
    }

    pub fn retry_queue(&self) -> &RetryQueue {
        &self.retry
    }

    fn is_reachable(&self) -> bool {
        *self.reachable.borrow()
    }

    pub async fn handle(&self, command: PipelineCommand) -> Result<(), PipelineError> {
        match command {
            PipelineCommand::Scan => self.scan().await,
            PipelineCommand::Drain => {
                if self.is_reachable() {
                    self.drain_pending().await?;
                } else {
                    debug!("backend unreachable, drain postponed");
                }
                Ok(())
            }
            PipelineCommand::ProcessRetries => {
                if self.is_reachable() {
                    self.process_retries().await?;
                } else {
                    debug!("backend unreachable, retry pass skipped");
                }
                Ok(())
            }
        }
    }

    pub async fn scan(&self) -> Result<(), PipelineError> {
        let Some(candidate) = self.scanner.scan(&self.pending).await? else {
            return Ok(());
        };
        self.events.emit(PipelineEvent::ImageQueued {
            path: candidate.path.to_string_lossy().into_owned(),
        });
        if self.is_reachable() {
            self.drain_pending().await?;
        }
        Ok(())
    }

    /// Processes a snapshot of the pending queue in insertion order. Each
    /// path leaves the queue after its analysis attempt, whatever the
    /// outcome; only failed deliveries move on to the retry queue. A path
    /// stays pending when no user id can be resolved for it, and store
    /// errors for one path are logged without stopping the rest.
    pub async fn drain_pending(&self) -> Result<DrainReport, PipelineError> {
        let paths = self.pending.snapshot().await?;
        let mut report = DrainReport::default();
        if paths.is_empty() {
            return Ok(report);
        }
        info!(count = paths.len(), "processing pending images");

        for path in paths {
            let analysis = self.vision.analyze_file(Path::new(&path)).await;
            let nutrition = match analysis {
                Ok(nutrition) => {
                    report.analyzed += 1;
                    self.events.emit(PipelineEvent::Analyzed {
                        path: path.clone(),
                        outcome: Ok(nutrition.clone()),
                    });
                    nutrition
                }
                Err(err) => {
                    report.analysis_failed += 1;
                    warn!(path = %path, %err, "image analysis failed");
                    self.events.emit(PipelineEvent::Analyzed {
                        path: path.clone(),
                        outcome: Err(err.to_string()),
                    });
                    self.forget_pending(&path).await;
                    continue;
                }
            };

            let user = match self.identity.resolve().await {
                Ok(user) => user,
                Err(err) => {
                    report.kept_pending += 1;
                    error!(path = %path, %err, "no user id available, image stays pending");
                    continue;
                }
            };
            self.forget_pending(&path).await;

            let timestamp = image_timestamp(Path::new(&path)).await;
            let delivered = deliver(&self.backend, &user.id, &path, &nutrition, timestamp, None)
                .await
                .is_ok();
            if delivered {
                report.synced += 1;
            } else {
                report.queued_for_retry += 1;
                let item = RetryItem::new(&user.id, &path, nutrition, timestamp);
                if let Err(err) = self.retry.enqueue(item).await {
                    error!(path = %path, %err, "failed to queue delivery for retry");
                }
            }
            self.events.emit(PipelineEvent::Synced {
                user_id: user.id,
                path,
                success: delivered,
            });
        }

        info!(
            analyzed = report.analyzed,
            analysis_failed = report.analysis_failed,
            synced = report.synced,
            queued_for_retry = report.queued_for_retry,
            kept_pending = report.kept_pending,
            "pending images processed"
        );
        Ok(report)
    }

    async fn forget_pending(&self, path: &str) {
        if let Err(err) = self.pending.remove(path).await {
            warn!(path = %path, %err, "failed to remove image from pending queue");
        }
    }

    pub async fn process_retries(&self) -> Result<RetryReport, PipelineError> {
        Ok(self.retry.process_retries(&self.backend).await?)
    }
}

/// Image modification time in ms, or now if the file is gone.
async fn image_timestamp(path: &Path) -> i64 {
    let modified = match tokio::fs::metadata(path).await {
        Ok(metadata) => metadata.modified().ok(),
        Err(_) => None,
    };
    modified
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .and_then(|since| i64::try_from(since.as_millis()).ok())
        .unwrap_or_else(now_millis)
}

/// Single worker: commands run one at a time, and a command in progress is
/// allowed to finish after cancellation.
pub async fn run_worker(
    pipeline: Arc<Pipeline>,
    mut commands: mpsc::UnboundedReceiver<PipelineCommand>,
    cancel: CancellationToken,
) {
    loop {
        let command = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            command = commands.recv() => match command {
                Some(command) => command,
                None => break,
            },
        };
        debug!(?command, "pipeline command");
        if let Err(err) = pipeline.handle(command).await {
            error!(?command, %err, "pipeline command failed");
        }
    }
    debug!("pipeline worker stopped");
}

#[cfg(test)]
#[path = "pipeline_tests.rs"]
mod tests;
