use std::time::Duration;

use nutrisync_core::BackendClient;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Polls the backend health endpoint and publishes reachability. Subscribers
/// only see transitions; the initial value is "unreachable" until the first
/// health check succeeds.
pub struct ConnectivityMonitor {
    backend: BackendClient,
    interval: Duration,
    tx: watch::Sender<bool>,
}

impl ConnectivityMonitor {
    pub fn new(backend: BackendClient, interval: Duration) -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (
            Self {
                backend,
                interval,
                tx,
            },
            rx,
        )
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Checks health once and returns the new state.
    pub async fn check_once(&self) -> bool {
        let reachable = match self.backend.health_check().await {
            Ok(()) => true,
            Err(err) => {
                debug!(%err, "health check failed");
                false
            }
        };
        let changed = self.tx.send_if_modified(|current| {
            if *current == reachable {
                return false;
            }
            *current = reachable;
            true
        });
        if changed {
            if reachable {
                info!("backend reachable");
            } else {
                info!("backend unreachable");
            }
        }
        reachable
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.check_once().await;
                }
            }
        }
    }
}
