//! Configuration catalog
//!
//! Alert-type definitions and policy read by the engines. The catalog is
//! loaded and reloaded by the process; engines only read snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::alert::{Severity, Team};
use crate::labels::Labels;
use crate::rule::{MatchCondition, SuppressionRule};

/// Notification policy for an alert type
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    /// Never send notifications for this type
    pub disable: bool,
    /// Minimum active time before the first notification (seconds)
    pub delay_secs: u64,
    /// Reminder interval (seconds, 0 = global default)
    pub remind_secs: u64,
    /// Send a notification when the alert clears
    pub notify_on_clear: bool,
    /// Severity → output names
    pub outputs: BTreeMap<Severity, Vec<String>>,
}

impl NotifyConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_secs)
    }
}

/// One escalation step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationRule {
    pub escalate_to: Severity,
    /// Active time after which the step applies (seconds)
    pub after_secs: u64,
}

impl EscalationRule {
    pub fn after(&self) -> Duration {
        Duration::from_secs(self.after_secs)
    }
}

/// Alert type definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    pub name: String,
    /// Overrides the severity reported by the source
    pub severity: Option<Severity>,
    pub team: Option<String>,
    pub tags: Vec<String>,
    pub auto_expire: bool,
    pub expire_after_secs: u64,
    pub auto_clear: bool,
    /// Every ACTIVE event is matched only against ACTIVE rows
    pub disable_dedup: bool,
    pub notify: NotifyConfig,
    /// Evaluated in declared order
    pub escalation: Vec<EscalationRule>,
    pub static_labels: Labels,
    /// Aggregation rules this type participates in
    pub aggregation_rules: Vec<String>,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            severity: None,
            team: None,
            tags: Vec::new(),
            auto_expire: false,
            expire_after_secs: 3600,
            auto_clear: true,
            disable_dedup: false,
            notify: NotifyConfig::default(),
            escalation: Vec::new(),
            static_labels: Labels::new(),
            aggregation_rules: Vec::new(),
        }
    }
}

impl AlertConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn expire_after(&self) -> Duration {
        Duration::from_secs(self.expire_after_secs)
    }
}

/// Suppression rule sourced from configuration; never expires
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticSuppressionRule {
    pub name: String,
    pub matches: Labels,
    #[serde(default)]
    pub condition: MatchCondition,
    #[serde(default)]
    pub reason: String,
}

impl StaticSuppressionRule {
    /// Materialize as a cache entry; `index` yields a stable negative id
    pub fn to_rule(&self, index: usize, now: DateTime<Utc>) -> SuppressionRule {
        let mut rule = SuppressionRule::new(
            self.name.clone(),
            self.matches.clone(),
            self.condition,
            Duration::ZERO,
            now,
        );
        rule.id = -(index as i64 + 1);
        rule.dont_expire = true;
        rule.creator = "config".to_string();
        rule.reason = self.reason.clone();
        rule
    }
}

/// Inhibit rule: a matching source alert silences matching targets
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InhibitRule {
    pub name: String,
    pub source_matches: Labels,
    pub target_matches: Labels,
    /// Labels that must be equal on source and target
    pub equal: Vec<String>,
}

/// Aggregation rule: which grouper merges which alerts, over what window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationRule {
    pub name: String,
    /// Grouper registry key
    pub grouper: String,
    pub window_secs: u64,
    /// Label keys for the `label` grouper
    pub group_by: Vec<String>,
}

impl Default for AggregationRule {
    fn default() -> Self {
        Self {
            name: String::new(),
            grouper: "label".to_string(),
            window_secs: 60,
            group_by: Vec::new(),
        }
    }
}

impl AggregationRule {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamConfig {
    pub name: String,
    #[serde(default)]
    pub organization: Option<String>,
}

/// Everything the engines read from configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Catalog {
    pub organization: String,
    /// Acknowledged alerts ignore CLEARED events from sources
    pub dont_clear_acknowledged: bool,
    /// Reminder interval applied when an alert type sets none (seconds, 0 = off)
    pub remind_secs: u64,
    pub default_outputs: BTreeMap<Severity, Vec<String>>,
    pub alerts: Vec<AlertConfig>,
    pub suppression_rules: Vec<StaticSuppressionRule>,
    pub inhibit_rules: Vec<InhibitRule>,
    pub aggregation_rules: Vec<AggregationRule>,
    pub teams: Vec<TeamConfig>,
}

impl Default for Catalog {
    fn default() -> Self {
        let log = vec!["log".to_string()];
        Self {
            organization: "default".to_string(),
            dont_clear_acknowledged: false,
            remind_secs: 0,
            default_outputs: [
                (Severity::Critical, log.clone()),
                (Severity::Warn, log.clone()),
                (Severity::Info, log),
            ]
            .into_iter()
            .collect(),
            alerts: Vec::new(),
            suppression_rules: Vec::new(),
            inhibit_rules: Vec::new(),
            aggregation_rules: Vec::new(),
            teams: Vec::new(),
        }
    }
}

impl Catalog {
    pub fn alert_config(&self, name: &str) -> Option<&AlertConfig> {
        self.alerts.iter().find(|a| a.name == name)
    }

    pub fn aggregation_rule(&self, name: &str) -> Option<&AggregationRule> {
        self.aggregation_rules.iter().find(|r| r.name == name)
    }

    /// Output names for an alert type and severity, falling back to the
    /// global mapping when the type is unconfigured or names none
    pub fn outputs_for(&self, alert_name: &str, severity: Severity) -> Vec<String> {
        self.alert_config(alert_name)
            .and_then(|c| c.notify.outputs.get(&severity))
            .filter(|outputs| !outputs.is_empty())
            .or_else(|| self.default_outputs.get(&severity))
            .cloned()
            .unwrap_or_default()
    }

    /// Reminder interval for an alert type; `None` when reminders are off
    pub fn remind_interval(&self, alert_name: &str) -> Option<Duration> {
        let secs = self
            .alert_config(alert_name)
            .map(|c| c.notify.remind_secs)
            .filter(|s| *s > 0)
            .unwrap_or(self.remind_secs);
        (secs > 0).then(|| Duration::from_secs(secs))
    }

    /// Static suppression rules as cache entries
    pub fn static_rules(&self, now: DateTime<Utc>) -> Vec<SuppressionRule> {
        self.suppression_rules
            .iter()
            .enumerate()
            .map(|(i, r)| r.to_rule(i, now))
            .collect()
    }

    /// Team directory entries declared in configuration
    pub fn team_directory(&self) -> Vec<Team> {
        self.teams
            .iter()
            .map(|t| Team {
                id: 0,
                name: t.name.clone(),
                organization: t
                    .organization
                    .clone()
                    .unwrap_or_else(|| self.organization.clone()),
            })
            .collect()
    }
}

/// Catalog handle shared by every engine; reload swaps the whole snapshot
#[derive(Debug, Clone, Default)]
pub struct SharedCatalog {
    inner: Arc<RwLock<Arc<Catalog>>>,
}

impl SharedCatalog {
    pub fn new(catalog: Catalog) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(catalog))),
        }
    }

    /// Current snapshot
    pub fn snapshot(&self) -> Arc<Catalog> {
        match self.inner.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Replace the catalog; readers holding old snapshots are unaffected
    pub fn replace(&self, catalog: Catalog) {
        let mut guard = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Arc::new(catalog);
    }
}
