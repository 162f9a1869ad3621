//! Named notification outputs

use alert_model::{AlertEvent, EventType};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::{NotifyError, OutputError};

/// An external notification channel
#[async_trait]
pub trait Output: Send + Sync {
    fn name(&self) -> &str;

    /// Deliver one event. Retries and batching are the output's own concern.
    async fn send(&self, event: &AlertEvent) -> Result<(), OutputError>;
}

/// Writes notifications to the log
pub struct LogOutput;

#[async_trait]
impl Output for LogOutput {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, event: &AlertEvent) -> Result<(), OutputError> {
        let alert = &event.alert;
        match event.event_type {
            EventType::Cleared | EventType::Expired => info!(
                alert_id = alert.id,
                severity = %alert.severity,
                "[{}] {} {}",
                event.event_type,
                alert.identity(),
                alert.description
            ),
            _ => warn!(
                alert_id = alert.id,
                severity = %alert.severity,
                "[{}] {} {}",
                event.event_type,
                alert.identity(),
                alert.description
            ),
        }
        Ok(())
    }
}

/// Exports notifications as counters
pub struct MetricsOutput;

#[async_trait]
impl Output for MetricsOutput {
    fn name(&self) -> &str {
        "metrics"
    }

    async fn send(&self, event: &AlertEvent) -> Result<(), OutputError> {
        metrics::counter!(
            "alertmgr_alert_notifications_total",
            "alert" => event.alert.name.clone(),
            "severity" => event.alert.severity.as_str(),
            "type" => event.event_type.as_str()
        )
        .increment(1);
        Ok(())
    }
}

/// Forwards notifications onto a queue, for bridges to other transports
pub struct ChannelOutput {
    name: String,
    tx: mpsc::Sender<AlertEvent>,
}

impl ChannelOutput {
    pub fn new(name: impl Into<String>, tx: mpsc::Sender<AlertEvent>) -> Self {
        Self {
            name: name.into(),
            tx,
        }
    }

    /// Create an output with its receiving end
    pub fn channel(name: impl Into<String>, capacity: usize) -> (Self, mpsc::Receiver<AlertEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(name, tx), rx)
    }
}

#[async_trait]
impl Output for ChannelOutput {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, event: &AlertEvent) -> Result<(), OutputError> {
        self.tx
            .send(event.clone())
            .await
            .map_err(|_| OutputError::Closed(self.name.clone()))
    }
}

/// Outputs addressable by name
#[derive(Clone, Default)]
pub struct OutputRegistry {
    outputs: BTreeMap<String, Arc<dyn Output>>,
}

impl OutputRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the bundled `log` and `metrics` outputs
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(LogOutput));
        registry.register(Arc::new(MetricsOutput));
        registry
    }

    /// Register an output under its own name, replacing any previous one
    pub fn register(&mut self, output: Arc<dyn Output>) {
        let name = output.name().to_string();
        if self.outputs.insert(name.clone(), output).is_some() {
            warn!("Output {} registered twice; keeping the latest", name);
        }
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Output>, NotifyError> {
        self.outputs
            .get(name)
            .cloned()
            .ok_or_else(|| NotifyError::UnknownOutput(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        self.outputs.keys().cloned().collect()
    }
}
