//! Inhibition stage
//!
//! An ACTIVE target alert is suppressed while an ACTIVE source alert matching
//! the same inhibit rule exists and agrees on the rule's `equal` labels.

use alert_model::{Alert, AlertEvent, EventType, InhibitRule, SharedCatalog, Status};
use async_trait::async_trait;
use chrono::Utc;
use pipeline::{Forwarder, PipelineError, Stage};
use std::sync::Arc;
use storage::{with_tx, Store};
use tracing::{debug, info, warn};

use crate::{SuppressionEngine, SuppressionError};

/// Pipeline priority of the inhibition stage
pub const INHIBIT_PRIORITY: u8 = 2;

/// Inhibition pipeline stage
pub struct Inhibitor {
    store: Arc<dyn Store>,
    catalog: SharedCatalog,
    suppressor: Arc<SuppressionEngine>,
}

impl Inhibitor {
    pub fn new(store: Arc<dyn Store>, catalog: SharedCatalog, suppressor: Arc<SuppressionEngine>) -> Self {
        Self {
            store,
            catalog,
            suppressor,
        }
    }

    /// First ACTIVE alert that inhibits `target` under `rule`
    fn find_source(rule: &InhibitRule, target: &Alert, candidates: &[Alert]) -> Option<i64> {
        let target_labels = target.match_labels();
        if !rule.target_matches.matches_all(&target_labels) {
            return None;
        }
        candidates
            .iter()
            .filter(|src| src.id != target.id)
            .find(|src| {
                let src_labels = src.match_labels();
                rule.source_matches.matches_all(&src_labels)
                    && rule.equal.iter().all(|key| {
                        match (src_labels.get(key), target_labels.get(key)) {
                            (Some(a), Some(b)) => a == b,
                            _ => false,
                        }
                    })
            })
            .map(|src| src.id)
    }

    /// Suppress `target` if some rule inhibits it; returns the suppressed alert
    fn inhibit(&self, target: &Alert) -> Result<Option<Alert>, SuppressionError> {
        let catalog = self.catalog.snapshot();
        if catalog.inhibit_rules.is_empty() {
            return Ok(None);
        }
        let now = Utc::now();

        with_tx(self.store.as_ref(), |tx| {
            let candidates = tx.alerts_by_status(&[Status::Active])?;
            for rule in &catalog.inhibit_rules {
                let Some(source_id) = Self::find_source(rule, target, &candidates) else {
                    continue;
                };
                let mut alert = tx.get_alert(target.id)?;
                if alert.status != Status::Active {
                    return Ok(None);
                }
                let reason = format!("inhibited by alert {} (rule {})", source_id, rule.name);
                self.suppressor
                    .suppress_alert(tx, &mut alert, now, "inhibitor", &reason)?;
                info!("Alert {} {}", alert.id, reason);
                return Ok(Some(alert));
            }
            Ok(None)
        })
    }
}

#[async_trait]
impl Stage for Inhibitor {
    fn name(&self) -> &str {
        "inhibitor"
    }

    fn priority(&self) -> u8 {
        INHIBIT_PRIORITY
    }

    async fn process(&self, event: AlertEvent, out: &Forwarder) -> Result<(), PipelineError> {
        if event.event_type != EventType::Active || event.alert.id == 0 {
            return out.forward(event).await;
        }

        match self.inhibit(&event.alert) {
            Ok(Some(suppressed)) => {
                out.forward(AlertEvent::new(suppressed, EventType::Suppressed))
                    .await
            }
            Ok(None) => out.forward(event).await,
            Err(e) => {
                // forward unmodified; inhibition is best effort
                warn!("Inhibition check failed for alert {}: {}", event.alert.id, e);
                metrics::counter!("alertmgr_inhibit_errors_total").increment(1);
                debug!("Forwarding alert {} uninhibited", event.alert.id);
                out.forward(event).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alert_model::{Catalog, Labels};
    use storage::MemoryStore;

    fn setup(rule: InhibitRule) -> (Arc<MemoryStore>, Inhibitor) {
        let store = Arc::new(MemoryStore::new());
        let catalog = SharedCatalog::new(Catalog {
            inhibit_rules: vec![rule],
            ..Default::default()
        });
        let suppressor = Arc::new(SuppressionEngine::new(store.clone(), catalog.clone()));
        let inhibitor = Inhibitor::new(store.clone(), catalog, suppressor);
        (store, inhibitor)
    }

    fn device_down_inhibits_links() -> InhibitRule {
        InhibitRule {
            name: "device_down".to_string(),
            source_matches: [("alert_name", "device_down")].into_iter().collect(),
            target_matches: [("alert_name", "link_down")].into_iter().collect(),
            equal: vec!["device".to_string()],
        }
    }

    fn insert(store: &MemoryStore, name: &str, entity: &str, device: &str) -> Alert {
        let mut alert = Alert::new(name, entity, Utc::now());
        alert.device = Some(device.to_string());
        alert.id = with_tx(store, |tx| tx.insert_alert(&alert)).unwrap();
        alert
    }

    #[tokio::test]
    async fn test_target_with_active_source_is_suppressed() {
        let (store, inhibitor) = setup(device_down_inhibits_links());
        insert(&store, "device_down", "chassis", "dev1");
        let link = insert(&store, "link_down", "et-0/0/1", "dev1");

        let (out, mut rx) = Forwarder::channel(4);
        inhibitor
            .process(AlertEvent::new(link.clone(), EventType::Active), &out)
            .await
            .unwrap();

        let forwarded = rx.recv().await.unwrap();
        assert_eq!(forwarded.event_type, EventType::Suppressed);
        let stored = with_tx(store.as_ref(), |tx| tx.get_alert(link.id)).unwrap();
        assert_eq!(stored.status, Status::Suppressed);
    }

    #[tokio::test]
    async fn test_equal_labels_must_agree() {
        let (store, inhibitor) = setup(device_down_inhibits_links());
        insert(&store, "device_down", "chassis", "dev2");
        let link = insert(&store, "link_down", "et-0/0/1", "dev1");

        let (out, mut rx) = Forwarder::channel(4);
        inhibitor
            .process(AlertEvent::new(link, EventType::Active), &out)
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().event_type, EventType::Active);
    }

    #[tokio::test]
    async fn test_non_active_events_pass_through() {
        let (store, inhibitor) = setup(device_down_inhibits_links());
        insert(&store, "device_down", "chassis", "dev1");
        let link = insert(&store, "link_down", "et-0/0/1", "dev1");

        let (out, mut rx) = Forwarder::channel(4);
        inhibitor
            .process(AlertEvent::new(link, EventType::Cleared), &out)
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().event_type, EventType::Cleared);
    }

    #[test]
    fn test_rule_without_equal_labels() {
        let rule = InhibitRule {
            equal: Vec::new(),
            target_matches: Labels::from_iter([("alert_name", "link_.*")]),
            ..device_down_inhibits_links()
        };
        let now = Utc::now();
        let mut source = Alert::new("device_down", "chassis", now);
        source.id = 1;
        let mut target = Alert::new("link_flap", "et-0/0/1", now);
        target.id = 2;

        assert_eq!(
            Inhibitor::find_source(&rule, &target, &[source.clone(), target.clone()]),
            Some(1)
        );
        // an alert never inhibits itself
        assert_eq!(Inhibitor::find_source(&rule, &target, &[target.clone()]), None);
    }
}
