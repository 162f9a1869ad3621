//! Processor Pipeline
//!
//! Every accepted alert lifecycle event flows through an ordered chain of
//! stages (aggregation, inhibition, notification, ...). Each stage runs as its
//! own task connected to its neighbours by bounded queues.

mod chain;
mod shutdown;
mod stage;

pub use chain::{Pipeline, PipelineBuilder, DEFAULT_QUEUE_CAPACITY};
pub use shutdown::{Shutdown, ShutdownListener};
pub use stage::{Forwarder, Stage};

use thiserror::Error;

/// Pipeline errors
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The downstream queue has been closed
    #[error("Downstream queue closed")]
    Closed,

    /// A stage failed to process an event
    #[error("Stage {stage} failed: {message}")]
    Stage { stage: String, message: String },
}

impl PipelineError {
    pub fn stage(stage: &str, err: impl std::fmt::Display) -> Self {
        PipelineError::Stage {
            stage: stage.to_string(),
            message: err.to_string(),
        }
    }
}
