//! Alert Data Model
//!
//! Shared types for every stage of the alert lifecycle:
//! - Alerts, lifecycle events and audit history
//! - Label values and label-predicate matching
//! - Suppression rules
//! - The configuration catalog read by the engines

mod alert;
mod catalog;
mod labels;
mod rule;

pub use alert::{
    Alert, AlertEvent, AlertHistory, AlertIdentity, EventType, IncomingAlert, IncomingStatus,
    Severity, Status, Team,
};
pub use catalog::{
    AggregationRule, AlertConfig, Catalog, EscalationRule, InhibitRule, NotifyConfig,
    SharedCatalog, StaticSuppressionRule, TeamConfig,
};
pub use labels::{LabelValue, Labels};
pub use rule::{MatchCondition, SuppressionRule};

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Label key carrying an alert's name in suppression and inhibit matching
pub const LABEL_ALERT_NAME: &str = "alert_name";
/// Label key carrying an alert's entity
pub const LABEL_ENTITY: &str = "entity";
/// Label key carrying an alert's device
pub const LABEL_DEVICE: &str = "device";
/// Label key stamped on aggregate alerts with the rule that formed them
pub const LABEL_AGGREGATION_RULE: &str = "aggregation_rule";

/// Time elapsed from `since` to `now`, clamped at zero when `since` is in the future
pub fn elapsed(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or(Duration::ZERO)
}
