//! Storage Layer
//!
//! Transactional persistence contract required by the alert engines, plus an
//! in-memory implementation.

mod memory;

pub use memory::MemoryStore;

use alert_model::{Alert, AlertHistory, AlertIdentity, Status, SuppressionRule, Team};
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Record not found: {0}")]
    NotFound(String),
    #[error("Commit failed: {0}")]
    CommitFailed(String),
}

/// A transactional store
pub trait Store: Send + Sync {
    /// Open a transaction. Dropping it without [`StoreTx::commit`] rolls back.
    fn begin(&self) -> Result<Box<dyn StoreTx + '_>, StorageError>;
}

/// Operations available inside a transaction
pub trait StoreTx {
    /// Insert a new alert, returning its assigned id
    fn insert_alert(&mut self, alert: &Alert) -> Result<i64, StorageError>;

    fn update_alert(&mut self, alert: &Alert) -> Result<(), StorageError>;

    fn get_alert(&self, id: i64) -> Result<Alert, StorageError>;

    /// Most recent alert with this identity whose status is one of
    /// `statuses`; any status when `statuses` is empty
    fn find_alert(
        &self,
        identity: &AlertIdentity,
        statuses: &[Status],
    ) -> Result<Option<Alert>, StorageError>;

    fn alerts_by_status(&self, statuses: &[Status]) -> Result<Vec<Alert>, StorageError>;

    /// ACTIVE non-aggregate auto-expiring alerts idle longer than their expiry
    fn expired_alerts(&self, now: DateTime<Utc>) -> Result<Vec<Alert>, StorageError>;

    /// ACTIVE alerts without an owner
    fn unacknowledged_alerts(&self) -> Result<Vec<Alert>, StorageError>;

    fn aggregate_members(&self, aggregate_id: i64) -> Result<Vec<Alert>, StorageError>;

    fn append_history(
        &mut self,
        alert_id: i64,
        timestamp: DateTime<Utc>,
        line: &str,
    ) -> Result<(), StorageError>;

    fn history(&self, alert_id: i64) -> Result<Vec<AlertHistory>, StorageError>;

    fn insert_rule(&mut self, rule: &SuppressionRule) -> Result<i64, StorageError>;

    fn delete_rule(&mut self, id: i64) -> Result<(), StorageError>;

    fn rules(&self) -> Result<Vec<SuppressionRule>, StorageError>;

    fn get_team(&self, name: &str) -> Result<Option<Team>, StorageError>;

    fn insert_team(&mut self, team: &Team) -> Result<i64, StorageError>;

    fn teams(&self) -> Result<Vec<Team>, StorageError>;

    fn commit(self: Box<Self>) -> Result<(), StorageError>;
}

/// Run `f` inside one transaction: commit on `Ok`, roll back on `Err`
pub fn with_tx<T, E, F>(store: &dyn Store, f: F) -> Result<T, E>
where
    E: From<StorageError>,
    F: FnOnce(&mut dyn StoreTx) -> Result<T, E>,
{
    let mut tx = store.begin()?;
    let value = f(&mut *tx)?;
    tx.commit()?;
    Ok(value)
}
