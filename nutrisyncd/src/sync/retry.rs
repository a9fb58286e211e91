use std::sync::atomic::{AtomicU64, Ordering};

use nutrisync_core::{BackendClient, NutritionReport};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::delivery::deliver;
use super::events::{EventSink, PipelineEvent};
use super::now_millis;
use crate::storage::{StateStore, StoreError};

pub const MAX_RETRIES: u32 = 3;
const RETRY_QUEUE_KEY: &str = "retry.queue";

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryItem {
    pub user_id: String,
    pub image_path: String,
    pub analysis_result: NutritionReport,
    #[serde(rename = "timestamp")]
    pub original_timestamp: i64,
    pub retry_count: u32,
    pub added_at: i64,
    #[serde(default)]
    pub last_retry_at: Option<i64>,
}

impl RetryItem {
    pub fn new(
        user_id: impl Into<String>,
        image_path: impl Into<String>,
        analysis_result: NutritionReport,
        original_timestamp: i64,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            image_path: image_path.into(),
            analysis_result,
            original_timestamp,
            retry_count: 0,
            added_at: now_millis(),
            last_retry_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryReport {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub discarded: usize,
    pub remaining: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryStats {
    pub size: usize,
    pub high_retry: usize,
    pub oldest_age_minutes: Option<i64>,
}

/// Durable, bounded-attempt log of failed deliveries.
///
/// The whole queue is one serialized blob. A pass loads it, tries every item,
/// and writes the survivors back in a single replace, so a crash mid-pass
/// leaves the previous content intact. `lock` keeps `enqueue` from landing
/// between a pass's load and its replace.
pub struct RetryQueue {
    store: StateStore,
    lock: Mutex<()>,
    discarded_total: AtomicU64,
    events: EventSink,
}

impl RetryQueue {
    pub fn new(store: StateStore, events: EventSink) -> Self {
        Self {
            store,
            lock: Mutex::new(()),
            discarded_total: AtomicU64::new(0),
            events,
        }
    }

    pub async fn enqueue(&self, item: RetryItem) -> Result<usize, StoreError> {
        let _guard = self.lock.lock().await;
        let mut items = self.load().await?;
        items.push(item);
        self.save(&items).await?;
        info!(queue_size = items.len(), "added item to retry queue");
        Ok(items.len())
    }

    pub async fn process_retries(
        &self,
        backend: &BackendClient,
    ) -> Result<RetryReport, StoreError> {
        let _guard = self.lock.lock().await;
        let items = self.load().await?;
        let mut report = RetryReport::default();
        let mut survivors = Vec::with_capacity(items.len());
        if !items.is_empty() {
            info!(items = items.len(), "processing retry queue");
        }

        for mut item in items {
            report.processed += 1;
            let attempt = item.retry_count.saturating_add(1);
            let outcome = deliver(
                backend,
                &item.user_id,
                &item.image_path,
                &item.analysis_result,
                item.original_timestamp,
                Some(attempt),
            )
            .await;
            match outcome {
                Ok(_) => {
                    report.succeeded += 1;
                    self.events.emit(PipelineEvent::Synced {
                        user_id: item.user_id.clone(),
                        path: item.image_path.clone(),
                        success: true,
                    });
                }
                Err(_) if attempt >= MAX_RETRIES => {
                    report.discarded += 1;
                    self.discarded_total.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        image_path = %item.image_path,
                        attempts = attempt,
                        "max retries reached, discarding"
                    );
                    self.events.emit(PipelineEvent::RetryDiscarded {
                        user_id: item.user_id,
                        path: item.image_path,
                        attempts: attempt,
                    });
                }
                Err(_) => {
                    report.failed += 1;
                    item.retry_count = attempt;
                    item.last_retry_at = Some(now_millis());
                    survivors.push(item);
                }
            }
        }

        self.save(&survivors).await?;
        report.remaining = survivors.len();
        if report.processed > 0 {
            info!(
                processed = report.processed,
                succeeded = report.succeeded,
                failed = report.failed,
                discarded = report.discarded,
                remaining = report.remaining,
                "retry processing complete"
            );
        }
        Ok(report)
    }

    pub async fn items(&self) -> Result<Vec<RetryItem>, StoreError> {
        self.load().await
    }

    pub async fn len(&self) -> Result<usize, StoreError> {
        Ok(self.load().await?.len())
    }

    pub async fn clear(&self) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        self.store.remove(RETRY_QUEUE_KEY).await?;
        info!("retry queue cleared");
        Ok(())
    }

    pub async fn stats(&self) -> Result<RetryStats, StoreError> {
        let items = self.load().await?;
        let now = now_millis();
        Ok(RetryStats {
            size: items.len(),
            high_retry: items.iter().filter(|item| item.retry_count >= 2).count(),
            oldest_age_minutes: items
                .iter()
                .map(|item| item.added_at)
                .min()
                .map(|oldest| (now - oldest).max(0) / 60_000),
        })
    }

    /// Items dropped after exhausting their attempts since this process started.
    pub fn discarded_total(&self) -> u64 {
        self.discarded_total.load(Ordering::Relaxed)
    }

    async fn load(&self) -> Result<Vec<RetryItem>, StoreError> {
        let Some(raw) = self.store.get(RETRY_QUEUE_KEY).await? else {
            return Ok(Vec::new());
        };
        match serde_json::from_str(&raw) {
            Ok(items) => Ok(items),
            Err(err) => {
                warn!(%err, "retry queue is unreadable, starting empty");
                Ok(Vec::new())
            }
        }
    }

    async fn save(&self, items: &[RetryItem]) -> Result<(), StoreError> {
        if items.is_empty() {
            return self.store.remove(RETRY_QUEUE_KEY).await;
        }
        let raw = serde_json::to_string(items)?;
        self.store.set(RETRY_QUEUE_KEY, &raw).await
    }
}

#[cfg(test)]
#[path = "retry_tests.rs"]
mod tests;
