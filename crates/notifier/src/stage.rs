//! Notification pipeline stage

use alert_model::AlertEvent;
use async_trait::async_trait;
use chrono::Utc;
use pipeline::{Forwarder, PipelineError, Stage};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::{Notifier, NotifyOutcome};

/// Pipeline priority of the notification stage
pub const NOTIFY_PRIORITY: u8 = 3;

/// Runs every event through the [`Notifier`] and forwards it unchanged
pub struct NotifyStage {
    notifier: Arc<Notifier>,
}

impl NotifyStage {
    pub fn new(notifier: Arc<Notifier>) -> Self {
        Self { notifier }
    }
}

#[async_trait]
impl Stage for NotifyStage {
    fn name(&self) -> &str {
        "notifier"
    }

    fn priority(&self) -> u8 {
        NOTIFY_PRIORITY
    }

    async fn process(&self, event: AlertEvent, out: &Forwarder) -> Result<(), PipelineError> {
        match self.notifier.notify(&event, Utc::now()).await {
            Ok(NotifyOutcome::Sent(outputs)) => {
                debug!("Alert {} {} sent to {:?}", event.alert.id, event.event_type, outputs)
            }
            Ok(outcome) => debug!("Alert {} {}: {:?}", event.alert.id, event.event_type, outcome),
            Err(e) => {
                warn!("Notification for alert {} failed: {}", event.alert.id, e);
                metrics::counter!("alertmgr_notification_errors_total", "output" => "all")
                    .increment(1);
            }
        }
        out.forward(event).await
    }
}
