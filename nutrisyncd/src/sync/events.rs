use nutrisync_core::NutritionReport;
use tokio::sync::mpsc;

/// Outcomes published for whatever presents them to the user.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    ImageQueued {
        path: String,
    },
    Analyzed {
        path: String,
        outcome: Result<NutritionReport, String>,
    },
    Synced {
        user_id: String,
        path: String,
        success: bool,
    },
    RetryDiscarded {
        user_id: String,
        path: String,
        attempts: u32,
    },
}

#[derive(Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<PipelineEvent>>,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<PipelineEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn emit(&self, event: PipelineEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}
