//! Alert, lifecycle event and ingestion types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::labels::Labels;
use crate::{LABEL_ALERT_NAME, LABEL_DEVICE, LABEL_ENTITY};

/// Alert severity. Ordering follows urgency: `Critical < Warn < Info`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    Warn,
    Info,
}

impl Severity {
    /// Whether `self` is strictly more severe than `other`
    pub fn is_more_severe_than(self, other: Severity) -> bool {
        self < other
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::Warn => "warn",
            Severity::Info => "info",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Alert status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Active,
    Suppressed,
    Expired,
    Cleared,
}

impl Status {
    /// ACTIVE or SUPPRESSED: the alert still represents an open fault
    pub fn is_open(self) -> bool {
        matches!(self, Status::Active | Status::Suppressed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Active => "active",
            Status::Suppressed => "suppressed",
            Status::Expired => "expired",
            Status::Cleared => "cleared",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of lifecycle transition carried by an [`AlertEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Active,
    Cleared,
    Suppressed,
    Expired,
    Ackd,
    Escalated,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Active => "active",
            EventType::Cleared => "cleared",
            EventType::Suppressed => "suppressed",
            EventType::Expired => "expired",
            EventType::Ackd => "acknowledged",
            EventType::Escalated => "escalated",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of an alert before it has a row id
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AlertIdentity {
    pub name: String,
    pub entity: String,
    pub device: Option<String>,
}

impl fmt::Display for AlertIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.device {
            Some(device) => write!(f, "{}@{}/{}", self.name, device, self.entity),
            None => write!(f, "{}@{}", self.name, self.entity),
        }
    }
}

/// A fault record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    /// Row id, 0 until persisted
    pub id: i64,
    pub name: String,
    pub entity: String,
    pub device: Option<String>,
    pub description: String,
    pub source: String,
    pub team: String,
    pub scope: Option<String>,
    pub severity: Severity,
    pub status: Status,
    pub start_time: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    /// Acknowledging operator
    pub owner: Option<String>,
    pub auto_expire: bool,
    pub auto_clear: bool,
    pub expire_after: Duration,
    pub labels: Labels,
    /// Aggregate alert this one was merged into
    pub aggregator_id: Option<i64>,
    pub is_aggregate: bool,
}

impl Alert {
    /// Create an unpersisted ACTIVE alert with default policy flags
    pub fn new(name: impl Into<String>, entity: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: 0,
            name: name.into(),
            entity: entity.into(),
            device: None,
            description: String::new(),
            source: String::new(),
            team: String::new(),
            scope: None,
            severity: Severity::Warn,
            status: Status::Active,
            start_time: now,
            last_active: now,
            owner: None,
            auto_expire: false,
            auto_clear: true,
            expire_after: Duration::from_secs(3600),
            labels: Labels::new(),
            aggregator_id: None,
            is_aggregate: false,
        }
    }

    /// Build an alert from a normalized incoming record
    pub fn from_incoming(incoming: &IncomingAlert, now: DateTime<Utc>) -> Self {
        let mut alert = Self::new(incoming.name.clone(), incoming.entity.clone(), now);
        alert.device = incoming.device.clone();
        alert.description = incoming.description.clone();
        alert.source = incoming.source.clone();
        alert.severity = incoming.severity;
        alert.labels = incoming.labels.clone();
        alert
    }

    pub fn identity(&self) -> AlertIdentity {
        AlertIdentity {
            name: self.name.clone(),
            entity: self.entity.clone(),
            device: self.device.clone(),
        }
    }

    /// Labels plus the identity labels used for rule matching
    pub fn match_labels(&self) -> Labels {
        let mut labels = self.labels.clone();
        labels.insert(LABEL_ALERT_NAME, self.name.clone());
        labels.insert(LABEL_ENTITY, self.entity.clone());
        if let Some(device) = &self.device {
            labels.insert(LABEL_DEVICE, device.clone());
        }
        labels
    }
}

/// One lifecycle transition of an alert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub alert: Alert,
    pub event_type: EventType,
}

impl AlertEvent {
    pub fn new(alert: Alert, event_type: EventType) -> Self {
        Self { alert, event_type }
    }
}

/// Status reported by an ingestion source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncomingStatus {
    Alerting,
    Cleared,
}

/// Normalized record pushed onto the ingestion queue by listeners
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncomingAlert {
    pub name: String,
    pub entity: String,
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default)]
    pub description: String,
    pub severity: Severity,
    pub status: IncomingStatus,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub labels: Labels,
}

impl IncomingAlert {
    pub fn identity(&self) -> AlertIdentity {
        AlertIdentity {
            name: self.name.clone(),
            entity: self.entity.clone(),
            device: self.device.clone(),
        }
    }
}

/// Team an alert is routed to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Team {
    pub id: i64,
    pub name: String,
    pub organization: String,
}

/// Audit line recorded against an alert
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertHistory {
    pub alert_id: i64,
    pub timestamp: DateTime<Utc>,
    pub line: String,
}
