//! Alert Handler
//!
//! Owns the alert lifecycle state machine. Incoming records are drained from
//! a single ingestion queue, deduplicated against stored alerts, checked
//! against suppression rules and persisted; every accepted transition is
//! emitted onto the pipeline queue after its transaction commits.

mod handler;
mod sweep;
mod transform;

pub use handler::AlertHandler;
pub use transform::{StaticLabels, TeamFromLabel, Transform};

use alert_model::Status;
use pipeline::PipelineError;
use storage::StorageError;
use suppression::SuppressionError;
use thiserror::Error;

/// Handler errors
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Suppression(#[from] SuppressionError),

    #[error("Unknown team: {0}")]
    UnknownTeam(String),

    #[error("Cannot {action} alert {id} in status {status}")]
    InvalidTransition {
        id: i64,
        status: Status,
        action: &'static str,
    },

    #[error("Event queue closed")]
    QueueClosed,
}

impl HandlerError {
    /// Label used when counting the error
    pub fn kind(&self) -> &'static str {
        match self {
            HandlerError::Storage(_) => "storage",
            HandlerError::Suppression(SuppressionError::Storage(_)) => "storage",
            HandlerError::Suppression(_) => "policy",
            HandlerError::UnknownTeam(_) => "policy",
            HandlerError::InvalidTransition { .. } => "policy",
            HandlerError::QueueClosed => "queue",
        }
    }

    /// Rejected operations leave state untouched and go back to the caller
    pub fn is_policy(&self) -> bool {
        self.kind() == "policy"
    }
}

impl From<PipelineError> for HandlerError {
    fn from(_: PipelineError) -> Self {
        HandlerError::QueueClosed
    }
}

/// Transform errors
#[derive(Error, Debug)]
pub enum TransformError {
    #[error("Label {label} is unusable: {reason}")]
    InvalidLabel { label: String, reason: String },

    #[error("Transform {name} failed: {message}")]
    Failed { name: String, message: String },
}
