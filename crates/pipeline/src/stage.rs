//! Stage contract

use alert_model::AlertEvent;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::PipelineError;

/// Handle a stage uses to push events to the next stage.
///
/// Cheap to clone; a stage that batches work (e.g. behind a timer) may keep a
/// clone and forward later.
#[derive(Debug, Clone)]
pub struct Forwarder {
    tx: mpsc::Sender<AlertEvent>,
}

impl Forwarder {
    pub fn new(tx: mpsc::Sender<AlertEvent>) -> Self {
        Self { tx }
    }

    /// Create a forwarder with its receiving end
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<AlertEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }

    /// Send an event downstream, waiting for queue space
    pub async fn forward(&self, event: AlertEvent) -> Result<(), PipelineError> {
        self.tx.send(event).await.map_err(|_| PipelineError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// One processing step of the pipeline
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &str;

    /// Lower runs earlier
    fn priority(&self) -> u8;

    /// Handle one event. A stage may forward it (possibly mutated), forward
    /// other events instead, or drop it.
    async fn process(&self, event: AlertEvent, out: &Forwarder) -> Result<(), PipelineError>;

    /// Called once when the stage's input closes, before its output is
    /// dropped. Stages holding buffered events flush them here and release
    /// any [`Forwarder`] clones they kept.
    async fn finish(&self, _out: &Forwarder) {}
}
