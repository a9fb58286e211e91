use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use nutrisync_core::{BackendClient, VisionClient};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::identity::{CurrentUser, IdentityResolver};
use crate::storage::{StateStore, default_db_path};
use crate::sync::connectivity::ConnectivityMonitor;
use crate::sync::events::{EventSink, PipelineEvent};
use crate::sync::gallery::GalleryScanner;
use crate::sync::local_watcher::start_gallery_watcher;
use crate::sync::pending::PendingQueue;
use crate::sync::pipeline::{Pipeline, PipelineCommand, run_worker};
use crate::sync::retry::{RetryQueue, RetryStats};

const DEFAULT_SCAN_INTERVAL_SECS: u64 = 15 * 60;
const DEFAULT_RETRY_INTERVAL_SECS: u64 = 30 * 60;
const DEFAULT_HEALTH_INTERVAL_SECS: u64 = 60;
const WATCH_DEBOUNCE: Duration = Duration::from_secs(2);

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub api_base_url: String,
    pub vision_api_key: String,
    pub vision_base_url: Option<String>,
    pub vision_model: Option<String>,
    pub watch_dirs: Vec<PathBuf>,
    pub scan_interval: Duration,
    pub retry_interval: Duration,
    pub health_interval: Duration,
    pub enable_watcher: bool,
    pub db_path: PathBuf,
    pub device_id: Option<String>,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        Self::from_lookup(|name| std::env::var(name).ok(), &home)
    }

    pub fn from_lookup<F>(lookup: F, home: &Path) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_base_url = read_string_var(&lookup, "NUTRISYNCD_API_BASE_URL")
            .context("NUTRISYNCD_API_BASE_URL must be set")?;
        let vision_api_key = read_string_var(&lookup, "NUTRISYNCD_VISION_API_KEY")
            .context("NUTRISYNCD_VISION_API_KEY must be set")?;
        let watch_dirs = match read_string_var(&lookup, "NUTRISYNCD_WATCH_DIRS") {
            Some(value) => parse_watch_dirs(&value, home),
            None => default_watch_dirs(home),
        };
        let db_path = match read_string_var(&lookup, "NUTRISYNCD_DB_PATH") {
            Some(value) => expand_with_home(&value, home),
            None => default_db_path().context("cannot locate a data directory for the state db")?,
        };

        Ok(Self {
            api_base_url,
            vision_api_key,
            vision_base_url: read_string_var(&lookup, "NUTRISYNCD_VISION_BASE_URL"),
            vision_model: read_string_var(&lookup, "NUTRISYNCD_VISION_MODEL"),
            watch_dirs,
            scan_interval: Duration::from_secs(read_u64_var(
                &lookup,
                "NUTRISYNCD_SCAN_INTERVAL_SECS",
                DEFAULT_SCAN_INTERVAL_SECS,
            )),
            retry_interval: Duration::from_secs(read_u64_var(
                &lookup,
                "NUTRISYNCD_RETRY_INTERVAL_SECS",
                DEFAULT_RETRY_INTERVAL_SECS,
            )),
            health_interval: Duration::from_secs(read_u64_var(
                &lookup,
                "NUTRISYNCD_HEALTH_INTERVAL_SECS",
                DEFAULT_HEALTH_INTERVAL_SECS,
            )),
            enable_watcher: read_bool_var(&lookup, "NUTRISYNCD_ENABLE_WATCHER", true),
            db_path,
            device_id: read_string_var(&lookup, "NUTRISYNCD_DEVICE_ID"),
        })
    }
}

/// Snapshot printed by `nutrisyncd --status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub user: CurrentUser,
    pub backend_id: Option<String>,
    pub pending: usize,
    pub retry: RetryStats,
    pub watermark_ms: i64,
    pub db_path: PathBuf,
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "state db:        {}", self.db_path.display())?;
        writeln!(
            f,
            "user:            {}",
            self.user.user_id.as_deref().unwrap_or("(not signed in)")
        )?;
        writeln!(
            f,
            "email:           {}",
            self.user.user_email.as_deref().unwrap_or("-")
        )?;
        writeln!(
            f,
            "backend id:      {}",
            self.backend_id.as_deref().unwrap_or("(unresolved)")
        )?;
        writeln!(f, "pending images:  {}", self.pending)?;
        write!(f, "retry queue:     {}", self.retry.size)?;
        if self.retry.size > 0 {
            write!(f, " ({} near the attempt limit", self.retry.high_retry)?;
            if let Some(age) = self.retry.oldest_age_minutes {
                write!(f, ", oldest {age} min")?;
            }
            write!(f, ")")?;
        }
        writeln!(f)?;
        write!(f, "last image seen: {}", format_millis(self.watermark_ms))
    }
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    store: StateStore,
    identity: IdentityResolver,
    pipeline: Arc<Pipeline>,
    monitor: ConnectivityMonitor,
    events_rx: mpsc::UnboundedReceiver<PipelineEvent>,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        let store = StateStore::open(&config.db_path)
            .await
            .with_context(|| format!("failed to open state db at {:?}", config.db_path))?;
        let backend =
            BackendClient::new(&config.api_base_url).context("invalid NUTRISYNCD_API_BASE_URL")?;
        let vision = match &config.vision_base_url {
            Some(base_url) => VisionClient::with_base_url(base_url, config.vision_api_key.clone()),
            None => VisionClient::new(config.vision_api_key.clone()),
        }
        .context("failed to build vision client")?;
        let vision = match &config.vision_model {
            Some(model) => vision.with_model(model.clone()),
            None => vision,
        };

        let identity = IdentityResolver::new(store.clone(), backend.clone())
            .with_device_id(config.device_id.clone());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let events = EventSink::new(events_tx);
        let (monitor, reachable) = ConnectivityMonitor::new(backend.clone(), config.health_interval);
        let pipeline = Arc::new(Pipeline::new(
            PendingQueue::new(store.clone()),
            RetryQueue::new(store.clone(), events.clone()),
            vision,
            backend,
            identity.clone(),
            GalleryScanner::new(store.clone(), config.watch_dirs.clone()),
            reachable,
            events,
        ));

        Ok(Self {
            config,
            store,
            identity,
            pipeline,
            monitor,
            events_rx,
        })
    }

    pub fn identity(&self) -> &IdentityResolver {
        &self.identity
    }

    pub async fn status(&self) -> anyhow::Result<StatusReport> {
        let scanner = GalleryScanner::new(self.store.clone(), Vec::new());
        Ok(StatusReport {
            user: self.identity.current_user().await?,
            backend_id: self.identity.cached_backend_id().await?,
            pending: self.pipeline.pending().len().await?,
            retry: self.pipeline.retry_queue().stats().await?,
            watermark_ms: scanner.watermark().load().await?,
            db_path: self.config.db_path.clone(),
        })
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let Self {
            config,
            pipeline,
            monitor,
            mut events_rx,
            ..
        } = self;
        info!(
            roots = ?config.watch_dirs,
            scan_interval_secs = config.scan_interval.as_secs(),
            retry_interval_secs = config.retry_interval.as_secs(),
            watcher = config.enable_watcher,
            "nutrisyncd started"
        );

        let cancel = CancellationToken::new();
        let (commands, commands_rx) = mpsc::unbounded_channel::<PipelineCommand>();
        let mut handles: Vec<JoinHandle<()>> = Vec::new();

        handles.push(tokio::spawn(run_worker(
            Arc::clone(&pipeline),
            commands_rx,
            cancel.clone(),
        )));

        let mut reachable = monitor.subscribe();
        handles.push(tokio::spawn(monitor.run(cancel.clone())));

        let commands_conn = commands.clone();
        let cancel_conn = cancel.clone();
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel_conn.cancelled() => break,
                    changed = reachable.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        if *reachable.borrow_and_update() {
                            let _ = commands_conn.send(PipelineCommand::Drain);
                            let _ = commands_conn.send(PipelineCommand::ProcessRetries);
                        }
                    }
                }
            }
        }));

        let commands_scan = commands.clone();
        let cancel_scan = cancel.clone();
        let scan_interval = config.scan_interval;
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(scan_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel_scan.cancelled() => break,
                    _ = ticker.tick() => {
                        let _ = commands_scan.send(PipelineCommand::Scan);
                    }
                }
            }
        }));

        let commands_retry = commands.clone();
        let cancel_retry = cancel.clone();
        let retry_interval = config.retry_interval;
        handles.push(tokio::spawn(async move {
            let start = tokio::time::Instant::now() + retry_interval;
            let mut ticker = tokio::time::interval_at(start, retry_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel_retry.cancelled() => break,
                    _ = ticker.tick() => {
                        let _ = commands_retry.send(PipelineCommand::ProcessRetries);
                    }
                }
            }
        }));

        let watcher = if config.enable_watcher {
            match start_gallery_watcher(&config.watch_dirs) {
                Ok((watcher, mut changes)) => {
                    let commands_watch = commands.clone();
                    let cancel_watch = cancel.clone();
                    handles.push(tokio::spawn(async move {
                        loop {
                            let change = tokio::select! {
                                _ = cancel_watch.cancelled() => break,
                                change = changes.recv() => change,
                            };
                            let Some(change) = change else { break };
                            debug!(path = %change.path.display(), "gallery change");
                            // A burst of changes becomes one scan.
                            tokio::select! {
                                _ = cancel_watch.cancelled() => break,
                                _ = tokio::time::sleep(WATCH_DEBOUNCE) => {}
                            }
                            while changes.try_recv().is_ok() {}
                            let _ = commands_watch.send(PipelineCommand::Scan);
                        }
                    }));
                    Some(watcher)
                }
                Err(err) => {
                    warn!(%err, "failed to start gallery watcher, relying on periodic scans");
                    None
                }
            }
        } else {
            None
        };

        let cancel_events = cancel.clone();
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel_events.cancelled() => break,
                    event = events_rx.recv() => match event {
                        Some(event) => log_event(&event),
                        None => break,
                    },
                }
            }
        }));

        tokio::signal::ctrl_c()
            .await
            .context("failed waiting for shutdown signal")?;
        info!("shutting down");

        cancel.cancel();
        drop(watcher);
        drop(commands);
        for handle in handles {
            if let Err(err) = handle.await {
                error!(%err, "background task panicked");
            }
        }
        info!("nutrisyncd stopped");
        Ok(())
    }
}

include!("daemon_helpers.rs");

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
