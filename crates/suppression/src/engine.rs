//! Suppression Engine Implementation

use alert_model::{Alert, Labels, SharedCatalog, Status, SuppressionRule};
use chrono::{DateTime, Utc};
use pipeline::ShutdownListener;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use storage::{with_tx, StorageError, Store, StoreTx};
use tracing::{debug, info, warn};

use crate::SuppressionError;

/// Rule cache backed by the store and merged with configured rules
pub struct SuppressionEngine {
    store: Arc<dyn Store>,
    catalog: SharedCatalog,
    /// Active rules; only touched under this lock
    rules: Mutex<Vec<SuppressionRule>>,
}

impl SuppressionEngine {
    pub fn new(store: Arc<dyn Store>, catalog: SharedCatalog) -> Self {
        Self {
            store,
            catalog,
            rules: Mutex::new(Vec::new()),
        }
    }

    fn cache(&self) -> MutexGuard<'_, Vec<SuppressionRule>> {
        self.rules.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Reload the cache from the store and the configuration catalog.
    ///
    /// The cache lock is held across the store read so saves and deletes
    /// cannot interleave with the swap.
    pub fn refresh(&self, now: DateTime<Utc>) -> Result<usize, SuppressionError> {
        let mut cache = self.cache();
        let stored = with_tx(self.store.as_ref(), |tx| tx.rules())?;
        let mut rules: Vec<SuppressionRule> = stored
            .into_iter()
            .filter(|r| !r.is_expired(now))
            .collect();
        rules.extend(self.catalog.snapshot().static_rules(now));

        let count = rules.len();
        *cache = rules;
        debug!("Suppression cache refreshed with {} rules", count);
        Ok(count)
    }

    /// Find the rule suppressing `labels`, if any.
    ///
    /// Each rule is evaluated under its own match condition. Rules whose time
    /// to live has run out are evicted from the cache and the store during the
    /// scan. When several rules match the most recently created one wins.
    pub fn match_labels(&self, labels: &Labels, now: DateTime<Utc>) -> Option<SuppressionRule> {
        let mut evicted = Vec::new();
        let matched = {
            let mut rules = self.cache();
            rules.retain(|rule| {
                if rule.is_expired(now) {
                    evicted.push(rule.id);
                    false
                } else {
                    true
                }
            });
            rules
                .iter()
                .filter(|rule| rule.matches(labels))
                .max_by_key(|rule| rule.created_at)
                .cloned()
        };

        if !evicted.is_empty() {
            debug!("Evicted {} expired suppression rules", evicted.len());
            self.purge(&evicted);
        }
        matched
    }

    fn purge(&self, ids: &[i64]) {
        let result = with_tx(self.store.as_ref(), |tx| {
            for id in ids.iter().filter(|id| **id > 0) {
                match tx.delete_rule(*id) {
                    Ok(()) | Err(StorageError::NotFound(_)) => {}
                    Err(e) => return Err(e),
                }
            }
            Ok(())
        });
        if let Err(e) = result {
            warn!("Failed to purge expired suppression rules: {}", e);
        }
    }

    /// Persist a rule and add it to the cache
    pub fn save_rule(&self, mut rule: SuppressionRule) -> Result<SuppressionRule, SuppressionError> {
        let mut rules = self.cache();
        rule.id = with_tx(self.store.as_ref(), |tx| tx.insert_rule(&rule))?;
        info!("Saved suppression rule {} ({})", rule.id, rule.name);
        rules.push(rule.clone());
        Ok(rule)
    }

    /// Stage a rule inside a caller's transaction. The rule only becomes
    /// active once [`SuppressionEngine::admit`] is called after commit.
    pub fn persist_rule(
        &self,
        tx: &mut dyn StoreTx,
        rule: &mut SuppressionRule,
    ) -> Result<(), SuppressionError> {
        rule.id = tx.insert_rule(rule)?;
        Ok(())
    }

    /// Add an already persisted rule to the cache. A refresh that ran after
    /// the rule's commit may have loaded it already.
    pub fn admit(&self, rule: SuppressionRule) {
        let mut rules = self.cache();
        if rules.iter().any(|r| r.id == rule.id) {
            return;
        }
        debug!("Admitting suppression rule {} ({})", rule.id, rule.name);
        rules.push(rule);
    }

    /// Delete a rule from the store and the cache
    pub fn delete_rule(&self, id: i64) -> Result<(), SuppressionError> {
        if id < 0 {
            return Err(SuppressionError::StaticRule(id));
        }
        let mut rules = self.cache();
        with_tx(self.store.as_ref(), |tx| tx.delete_rule(id))?;
        rules.retain(|r| r.id != id);
        info!("Deleted suppression rule {}", id);
        Ok(())
    }

    /// Snapshot of the cached rules
    pub fn rules(&self) -> Vec<SuppressionRule> {
        self.cache().clone()
    }

    /// Flip an open alert to SUPPRESSED and record why
    pub fn suppress_alert(
        &self,
        tx: &mut dyn StoreTx,
        alert: &mut Alert,
        now: DateTime<Utc>,
        creator: &str,
        reason: &str,
    ) -> Result<(), SuppressionError> {
        if !alert.status.is_open() {
            return Err(SuppressionError::NotOpen {
                id: alert.id,
                status: alert.status,
            });
        }
        alert.status = Status::Suppressed;
        tx.update_alert(alert)?;
        tx.append_history(alert.id, now, &format!("Suppressed by {}: {}", creator, reason))?;
        Ok(())
    }

    /// Flip a SUPPRESSED alert back to ACTIVE. Fails if the alert already left
    /// SUPPRESSED, e.g. because it cleared or expired in the meantime.
    pub fn unsuppress_alert(
        &self,
        tx: &mut dyn StoreTx,
        alert: &mut Alert,
        now: DateTime<Utc>,
    ) -> Result<(), SuppressionError> {
        if alert.status != Status::Suppressed {
            return Err(SuppressionError::NotSuppressed {
                id: alert.id,
                status: alert.status,
            });
        }
        alert.status = Status::Active;
        tx.update_alert(alert)?;
        tx.append_history(alert.id, now, "Unsuppressed")?;
        Ok(())
    }

    /// Periodically reload the cache until shutdown
    pub async fn run_refresh(self: Arc<Self>, interval: Duration, mut shutdown: ShutdownListener) {
        info!("Starting suppression rule refresh every {:?}", interval);
        let mut ticker = tokio::time::interval(interval);
        // the first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.refresh(Utc::now()) {
                        warn!("Suppression rule refresh failed: {}", e);
                        metrics::counter!("alertmgr_suppression_refresh_errors_total").increment(1);
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
        info!("Suppression rule refresh stopped");
    }
}
