//! Aggregation Engine
//!
//! Correlates structurally related alerts into a single aggregate incident:
//! - both ends of a BGP session
//! - both ends of a circuit
//! - alerts sharing a set of label values
//!
//! Alerts tagged for an aggregation rule are buffered for the rule's window,
//! then partitioned into groups, each materialized as one aggregate alert.

mod engine;
mod grouper;

pub use engine::{AggregationEngine, AGGREGATION_PRIORITY};
pub use grouper::{
    BgpSessionGrouper, CircuitGrouper, Grouper, GrouperRegistry, Incident, LabelGrouper,
};

use alert_model::{Alert, Status};
use storage::StorageError;
use thiserror::Error;

/// Grouping errors
#[derive(Error, Debug)]
pub enum GroupingError {
    #[error("Alert {alert_id} is missing label {label}")]
    MissingLabel { alert_id: i64, label: String },

    #[error("Unknown grouper: {0}")]
    UnknownGrouper(String),

    #[error("Grouper {0} needs at least one group_by label")]
    NoGroupLabels(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Status an aggregate takes from its members: CLEARED when every member is
/// CLEARED, EXPIRED when every member is EXPIRED, otherwise unchanged (`None`).
pub fn derived_status(members: &[Alert]) -> Option<Status> {
    if members.is_empty() {
        return None;
    }
    [Status::Cleared, Status::Expired]
        .into_iter()
        .find(|status| members.iter().all(|m| m.status == *status))
}
