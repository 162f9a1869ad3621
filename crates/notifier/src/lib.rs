//! Notification Engine
//!
//! Decides which alert events reach external outputs:
//! - dedup of repeated ACTIVE events for tracked alerts
//! - per-type notify delay and reminder interval
//! - severity-based output routing with a global fallback
//!
//! Outputs register under a name in an [`OutputRegistry`]; the engine only
//! addresses them by name.

mod engine;
mod output;
mod stage;

pub use engine::{Notifier, NotifyOutcome};
pub use output::{ChannelOutput, LogOutput, MetricsOutput, Output, OutputRegistry};
pub use stage::{NotifyStage, NOTIFY_PRIORITY};

use storage::StorageError;
use thiserror::Error;

/// Output delivery errors
#[derive(Error, Debug)]
pub enum OutputError {
    #[error("Output {0} is closed")]
    Closed(String),
}

/// Notification errors
#[derive(Error, Debug)]
pub enum NotifyError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("No output registered as {0}")]
    UnknownOutput(String),
}
