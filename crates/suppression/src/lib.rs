//! Suppression Engine
//!
//! Keeps the active suppression rules in memory and answers "is this alert
//! suppressed" queries. Also hosts the inhibition pipeline stage, which
//! suppresses targets while a related source alert is active.

mod engine;
mod inhibit;

pub use engine::SuppressionEngine;
pub use inhibit::{Inhibitor, INHIBIT_PRIORITY};

use alert_model::Status;
use storage::StorageError;
use thiserror::Error;

/// Suppression errors
#[derive(Debug, Error)]
pub enum SuppressionError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Unsuppress on an alert that is no longer suppressed
    #[error("Alert {id} is {status}, not suppressed")]
    NotSuppressed { id: i64, status: Status },

    /// Suppress on an alert that already cleared or expired
    #[error("Alert {id} is {status} and cannot be suppressed")]
    NotOpen { id: i64, status: Status },

    /// Rules sourced from configuration cannot be deleted at runtime
    #[error("Suppression rule {0} comes from configuration")]
    StaticRule(i64),
}
