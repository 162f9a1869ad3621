//! In-memory Store Implementation

use alert_model::{Alert, AlertHistory, AlertIdentity, Status, SuppressionRule, Team};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::{StorageError, Store, StoreTx};

/// Committed tables
#[derive(Debug, Default)]
struct Tables {
    alerts: BTreeMap<i64, Alert>,
    history: Vec<AlertHistory>,
    rules: BTreeMap<i64, SuppressionRule>,
    teams: BTreeMap<String, Team>,
    next_alert_id: i64,
    next_rule_id: i64,
    next_team_id: i64,
}

/// In-memory store. Transactions are serialized by one table lock and stage
/// their writes until commit.
pub struct MemoryStore {
    tables: Mutex<Tables>,
    /// Max history lines kept
    max_history: usize,
    /// Fault injection: make every commit fail
    fail_commits: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        info!("Creating in-memory alert store");
        Self {
            tables: Mutex::new(Tables {
                next_alert_id: 1,
                next_rule_id: 1,
                next_team_id: 1,
                ..Default::default()
            }),
            max_history: 100_000,
            fail_commits: AtomicBool::new(false),
        }
    }

    /// Make subsequent commits fail (for exercising rollback paths)
    pub fn set_fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    /// Total committed alert rows
    pub fn alert_count(&self) -> usize {
        self.tables.lock().map(|t| t.alerts.len()).unwrap_or(0)
    }

    /// Total committed suppression rules
    pub fn rule_count(&self) -> usize {
        self.tables.lock().map(|t| t.rules.len()).unwrap_or(0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>, StorageError> {
        self.tables
            .lock()
            .map_err(|e| StorageError::DatabaseError(format!("Lock error: {}", e)))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for MemoryStore {
    fn begin(&self) -> Result<Box<dyn StoreTx + '_>, StorageError> {
        let tables = self.lock()?;
        Ok(Box::new(MemoryTx {
            next_alert_id: tables.next_alert_id,
            next_rule_id: tables.next_rule_id,
            next_team_id: tables.next_team_id,
            tables,
            alerts: BTreeMap::new(),
            history: Vec::new(),
            rules: BTreeMap::new(),
            teams: BTreeMap::new(),
            max_history: self.max_history,
            fail_commit: self.fail_commits.load(Ordering::SeqCst),
        }))
    }
}

/// Open transaction: holds the table lock, staged writes overlay committed rows
struct MemoryTx<'a> {
    tables: MutexGuard<'a, Tables>,
    alerts: BTreeMap<i64, Alert>,
    history: Vec<AlertHistory>,
    /// `None` marks a deleted rule
    rules: BTreeMap<i64, Option<SuppressionRule>>,
    teams: BTreeMap<String, Team>,
    next_alert_id: i64,
    next_rule_id: i64,
    next_team_id: i64,
    max_history: usize,
    fail_commit: bool,
}

impl MemoryTx<'_> {
    /// Committed rows with staged updates applied, then staged inserts (id order)
    fn alerts(&self) -> impl Iterator<Item = &Alert> + '_ {
        let committed = self
            .tables
            .alerts
            .iter()
            .map(move |(id, alert)| self.alerts.get(id).unwrap_or(alert));
        let fresh = self
            .alerts
            .iter()
            .filter(move |(id, _)| !self.tables.alerts.contains_key(id))
            .map(|(_, alert)| alert);
        committed.chain(fresh)
    }

    fn rule_view(&self) -> Vec<SuppressionRule> {
        let mut view: BTreeMap<i64, SuppressionRule> = self.tables.rules.clone();
        for (id, staged) in &self.rules {
            match staged {
                Some(rule) => {
                    view.insert(*id, rule.clone());
                }
                None => {
                    view.remove(id);
                }
            }
        }
        view.into_values().collect()
    }

    fn rule_exists(&self, id: i64) -> bool {
        match self.rules.get(&id) {
            Some(staged) => staged.is_some(),
            None => self.tables.rules.contains_key(&id),
        }
    }
}

impl StoreTx for MemoryTx<'_> {
    fn insert_alert(&mut self, alert: &Alert) -> Result<i64, StorageError> {
        let id = self.next_alert_id;
        self.next_alert_id += 1;
        let mut row = alert.clone();
        row.id = id;
        self.alerts.insert(id, row);
        debug!("Staged alert {} ({})", id, alert.identity());
        Ok(id)
    }

    fn update_alert(&mut self, alert: &Alert) -> Result<(), StorageError> {
        if !self.alerts.contains_key(&alert.id) && !self.tables.alerts.contains_key(&alert.id) {
            return Err(StorageError::NotFound(format!("alert {}", alert.id)));
        }
        self.alerts.insert(alert.id, alert.clone());
        Ok(())
    }

    fn get_alert(&self, id: i64) -> Result<Alert, StorageError> {
        self.alerts
            .get(&id)
            .or_else(|| self.tables.alerts.get(&id))
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("alert {}", id)))
    }

    fn find_alert(
        &self,
        identity: &AlertIdentity,
        statuses: &[Status],
    ) -> Result<Option<Alert>, StorageError> {
        Ok(self
            .alerts()
            .filter(|a| {
                a.name == identity.name && a.entity == identity.entity && a.device == identity.device
            })
            .filter(|a| statuses.is_empty() || statuses.contains(&a.status))
            .last()
            .cloned())
    }

    fn alerts_by_status(&self, statuses: &[Status]) -> Result<Vec<Alert>, StorageError> {
        Ok(self
            .alerts()
            .filter(|a| statuses.contains(&a.status))
            .cloned()
            .collect())
    }

    fn expired_alerts(&self, now: DateTime<Utc>) -> Result<Vec<Alert>, StorageError> {
        Ok(self
            .alerts()
            .filter(|a| a.status == Status::Active && !a.is_aggregate && a.auto_expire)
            .filter(|a| alert_model::elapsed(a.last_active, now) > a.expire_after)
            .cloned()
            .collect())
    }

    fn unacknowledged_alerts(&self) -> Result<Vec<Alert>, StorageError> {
        Ok(self
            .alerts()
            .filter(|a| a.status == Status::Active && a.owner.is_none())
            .cloned()
            .collect())
    }

    fn aggregate_members(&self, aggregate_id: i64) -> Result<Vec<Alert>, StorageError> {
        Ok(self
            .alerts()
            .filter(|a| a.aggregator_id == Some(aggregate_id))
            .cloned()
            .collect())
    }

    fn append_history(
        &mut self,
        alert_id: i64,
        timestamp: DateTime<Utc>,
        line: &str,
    ) -> Result<(), StorageError> {
        self.history.push(AlertHistory {
            alert_id,
            timestamp,
            line: line.to_string(),
        });
        Ok(())
    }

    fn history(&self, alert_id: i64) -> Result<Vec<AlertHistory>, StorageError> {
        Ok(self
            .tables
            .history
            .iter()
            .chain(self.history.iter())
            .filter(|h| h.alert_id == alert_id)
            .cloned()
            .collect())
    }

    fn insert_rule(&mut self, rule: &SuppressionRule) -> Result<i64, StorageError> {
        let id = self.next_rule_id;
        self.next_rule_id += 1;
        let mut row = rule.clone();
        row.id = id;
        self.rules.insert(id, Some(row));
        Ok(id)
    }

    fn delete_rule(&mut self, id: i64) -> Result<(), StorageError> {
        if !self.rule_exists(id) {
            return Err(StorageError::NotFound(format!("suppression rule {}", id)));
        }
        self.rules.insert(id, None);
        Ok(())
    }

    fn rules(&self) -> Result<Vec<SuppressionRule>, StorageError> {
        Ok(self.rule_view())
    }

    fn get_team(&self, name: &str) -> Result<Option<Team>, StorageError> {
        Ok(self
            .teams
            .get(name)
            .or_else(|| self.tables.teams.get(name))
            .cloned())
    }

    fn insert_team(&mut self, team: &Team) -> Result<i64, StorageError> {
        if self.get_team(&team.name)?.is_some() {
            return Err(StorageError::DatabaseError(format!(
                "team {} already exists",
                team.name
            )));
        }
        let id = self.next_team_id;
        self.next_team_id += 1;
        let mut row = team.clone();
        row.id = id;
        self.teams.insert(row.name.clone(), row);
        Ok(id)
    }

    fn teams(&self) -> Result<Vec<Team>, StorageError> {
        let mut teams: BTreeMap<&str, &Team> = self
            .tables
            .teams
            .iter()
            .map(|(name, team)| (name.as_str(), team))
            .collect();
        for (name, team) in &self.teams {
            teams.insert(name.as_str(), team);
        }
        Ok(teams.into_values().cloned().collect())
    }

    fn commit(self: Box<Self>) -> Result<(), StorageError> {
        let mut tx = *self;
        if tx.fail_commit {
            warn!("Injected commit failure, rolling back");
            return Err(StorageError::CommitFailed("injected failure".to_string()));
        }

        let tables = &mut *tx.tables;
        tables.alerts.append(&mut tx.alerts);
        for (id, staged) in std::mem::take(&mut tx.rules) {
            match staged {
                Some(rule) => {
                    tables.rules.insert(id, rule);
                }
                None => {
                    tables.rules.remove(&id);
                }
            }
        }
        tables.teams.append(&mut tx.teams);
        tables.history.append(&mut tx.history);

        // Enforce retention
        if tables.history.len() > tx.max_history {
            let excess = tables.history.len() - tx.max_history;
            tables.history.drain(..excess);
        }

        tables.next_alert_id = tx.next_alert_id;
        tables.next_rule_id = tx.next_rule_id;
        tables.next_team_id = tx.next_team_id;
        Ok(())
    }
}
