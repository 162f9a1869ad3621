//! Periodic expiry and escalation sweeps

use alert_model::{elapsed, AlertEvent, EventType, Status};
use chrono::{DateTime, Utc};
use pipeline::ShutdownListener;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use storage::with_tx;
use tracing::{debug, info, warn};

use crate::handler::rederive_aggregate;
use crate::{AlertHandler, HandlerError};

impl AlertHandler {
    /// Expire ACTIVE auto-expiring alerts idle past their expiry, then
    /// re-derive the aggregates they belong to. Each alert commits on its own.
    pub async fn expire_sweep(&self, now: DateTime<Utc>) -> Result<usize, HandlerError> {
        let candidates = with_tx(self.store.as_ref(), |tx| tx.expired_alerts(now))?;
        let mut aggregates = BTreeSet::new();
        let mut expired = 0;

        for candidate in candidates {
            let result = with_tx(self.store.as_ref(), |tx| {
                let mut alert = tx.get_alert(candidate.id)?;
                if alert.status != Status::Active || elapsed(alert.last_active, now) <= alert.expire_after {
                    return Ok(None);
                }
                alert.status = Status::Expired;
                tx.update_alert(&alert)?;
                tx.append_history(
                    alert.id,
                    now,
                    &format!("Expired after {}s without activity", alert.expire_after.as_secs()),
                )?;
                Ok::<_, HandlerError>(Some(alert))
            });

            match result {
                Ok(Some(alert)) => {
                    debug!("Alert {} ({}) expired", alert.id, alert.identity());
                    if let Some(aggregate_id) = alert.aggregator_id {
                        aggregates.insert(aggregate_id);
                    }
                    expired += 1;
                    self.emit(&[AlertEvent::new(alert, EventType::Expired)]).await?;
                }
                Ok(None) => {}
                Err(e) => {
                    self.record_error(&e);
                    warn!("Failed to expire alert {}: {}", candidate.id, e);
                }
            }
        }

        for aggregate_id in aggregates {
            match with_tx(self.store.as_ref(), |tx| rederive_aggregate(tx, aggregate_id, now)) {
                Ok(Some(event)) => self.emit(&[event]).await?,
                Ok(None) => {}
                Err(e) => {
                    self.record_error(&e);
                    warn!("Failed to update aggregate {}: {}", aggregate_id, e);
                }
            }
        }

        if expired > 0 {
            info!("Expiry sweep expired {} alerts", expired);
        }
        Ok(expired)
    }

    /// Raise the severity of unacknowledged ACTIVE alerts by at most one
    /// escalation step each. Rules are tried in declared order and the first
    /// one that is both due and strictly more severe than the current
    /// severity wins, so once a step has applied an earlier, milder step can
    /// never apply again.
    pub async fn escalation_sweep(&self, now: DateTime<Utc>) -> Result<usize, HandlerError> {
        let catalog = self.catalog.snapshot();
        let candidates = with_tx(self.store.as_ref(), |tx| tx.unacknowledged_alerts())?;
        let mut escalated = 0;

        for candidate in candidates {
            let Some(config) = catalog.alert_config(&candidate.name) else {
                continue;
            };
            let active_for = elapsed(candidate.start_time, now);
            let Some(step) = config.escalation.iter().find(|rule| {
                rule.escalate_to.is_more_severe_than(candidate.severity) && active_for >= rule.after()
            }) else {
                continue;
            };

            let result = with_tx(self.store.as_ref(), |tx| {
                let mut alert = tx.get_alert(candidate.id)?;
                if alert.status != Status::Active
                    || alert.owner.is_some()
                    || !step.escalate_to.is_more_severe_than(alert.severity)
                {
                    return Ok(None);
                }
                let previous = alert.severity;
                alert.severity = step.escalate_to;
                tx.update_alert(&alert)?;
                tx.append_history(
                    alert.id,
                    now,
                    &format!(
                        "Escalated from {} to {} after {}s unacknowledged",
                        previous,
                        step.escalate_to,
                        active_for.as_secs()
                    ),
                )?;
                Ok::<_, HandlerError>(Some(alert))
            });

            match result {
                Ok(Some(alert)) => {
                    info!("Alert {} escalated to {}", alert.id, alert.severity);
                    escalated += 1;
                    self.emit(&[AlertEvent::new(alert, EventType::Escalated)]).await?;
                }
                Ok(None) => {}
                Err(e) => {
                    self.record_error(&e);
                    warn!("Failed to escalate alert {}: {}", candidate.id, e);
                }
            }
        }
        Ok(escalated)
    }

    /// Expiry loop
    pub async fn run_expiry(self: Arc<Self>, interval: Duration, mut shutdown: ShutdownListener) {
        info!("Starting expiry sweep every {:?}", interval);
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.expire_sweep(Utc::now()).await {
                        self.record_error(&e);
                        warn!("Expiry sweep failed: {}", e);
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
        info!("Expiry sweep stopped");
    }

    /// Escalation loop
    pub async fn run_escalation(self: Arc<Self>, interval: Duration, mut shutdown: ShutdownListener) {
        info!("Starting escalation sweep every {:?}", interval);
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.escalation_sweep(Utc::now()).await {
                        self.record_error(&e);
                        warn!("Escalation sweep failed: {}", e);
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
        info!("Escalation sweep stopped");
    }
}

#[cfg(test)]
mod tests {
    use crate::handler::tests::{fixture, incoming};
    use alert_model::{
        Alert, AlertConfig, Catalog, EscalationRule, EventType, IncomingStatus, Severity, Status,
    };
    use chrono::{Duration as ChronoDuration, Utc};
    use storage::{with_tx, MemoryStore};

    fn get(store: &MemoryStore, id: i64) -> Alert {
        with_tx(store, |tx| tx.get_alert(id)).unwrap()
    }

    fn escalating(rules: Vec<EscalationRule>) -> Catalog {
        Catalog {
            alerts: vec![AlertConfig {
                escalation: rules,
                ..AlertConfig::named("link_down")
            }],
            ..Default::default()
        }
    }

    fn step(escalate_to: Severity, after_secs: u64) -> EscalationRule {
        EscalationRule {
            escalate_to,
            after_secs,
        }
    }

    #[tokio::test]
    async fn test_expire_sweep() {
        let mut f = fixture(Catalog {
            alerts: vec![AlertConfig {
                auto_expire: true,
                expire_after_secs: 600,
                ..AlertConfig::named("link_down")
            }],
            ..Default::default()
        });
        let t0 = Utc::now();
        let idle = f
            .handler
            .on_active(&incoming("link_down", "et-0/0/1", IncomingStatus::Alerting), t0)
            .unwrap()
            .unwrap()
            .alert;
        let busy = f
            .handler
            .on_active(&incoming("link_down", "et-0/0/2", IncomingStatus::Alerting), t0)
            .unwrap()
            .unwrap()
            .alert;
        let t1 = t0 + ChronoDuration::minutes(8);
        f.handler
            .on_active(&incoming("link_down", "et-0/0/2", IncomingStatus::Alerting), t1)
            .unwrap();

        let t2 = t0 + ChronoDuration::minutes(11);
        assert_eq!(f.handler.expire_sweep(t2).await.unwrap(), 1);
        assert_eq!(get(&f.store, idle.id).status, Status::Expired);
        assert_eq!(get(&f.store, busy.id).status, Status::Active);
        assert_eq!(f.events.recv().await.unwrap().event_type, EventType::Expired);
    }

    #[tokio::test]
    async fn test_expiry_rederives_aggregate() {
        let mut f = fixture(Catalog::default());
        let now = Utc::now();
        let aggregate_id = with_tx(f.store.as_ref(), |tx| {
            let mut aggregate = Alert::new("bgp_session", "dev1/if1 <-> dev2/if2", now);
            aggregate.is_aggregate = true;
            aggregate.auto_expire = true;
            aggregate.expire_after = std::time::Duration::from_secs(60);
            let aggregate_id = tx.insert_alert(&aggregate)?;
            for entity in ["dev1/if1", "dev2/if2"] {
                let mut member = Alert::new("bgp_down", entity, now);
                member.auto_expire = true;
                member.expire_after = std::time::Duration::from_secs(60);
                member.aggregator_id = Some(aggregate_id);
                tx.insert_alert(&member)?;
            }
            Ok::<_, storage::StorageError>(aggregate_id)
        })
        .unwrap();

        let later = now + ChronoDuration::minutes(5);
        assert_eq!(f.handler.expire_sweep(later).await.unwrap(), 2);
        assert_eq!(get(&f.store, aggregate_id).status, Status::Expired);

        let mut types = Vec::new();
        while let Ok(event) = f.events.try_recv() {
            types.push((event.alert.id, event.event_type));
        }
        assert_eq!(types.len(), 3);
        assert_eq!(types[2], (aggregate_id, EventType::Expired));
    }

    #[tokio::test]
    async fn test_escalation_one_step_per_sweep() {
        let mut f = fixture(escalating(vec![
            step(Severity::Warn, 60),
            step(Severity::Critical, 120),
        ]));
        let t0 = Utc::now();
        let mut record = incoming("link_down", "et-0/0/1", IncomingStatus::Alerting);
        record.severity = Severity::Info;
        let alert = f.handler.on_active(&record, t0).unwrap().unwrap().alert;

        // not due yet
        assert_eq!(f.handler.escalation_sweep(t0 + ChronoDuration::seconds(30)).await.unwrap(), 0);

        // both rules are due, only the first applies
        let late = t0 + ChronoDuration::minutes(5);
        assert_eq!(f.handler.escalation_sweep(late).await.unwrap(), 1);
        assert_eq!(get(&f.store, alert.id).severity, Severity::Warn);
        assert_eq!(f.events.recv().await.unwrap().event_type, EventType::Escalated);

        assert_eq!(f.handler.escalation_sweep(late).await.unwrap(), 1);
        assert_eq!(get(&f.store, alert.id).severity, Severity::Critical);

        assert_eq!(f.handler.escalation_sweep(late).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_escalation_ratchet() {
        // once the severe step has applied, the milder one never fires again
        let f = fixture(escalating(vec![
            step(Severity::Critical, 60),
            step(Severity::Warn, 10),
        ]));
        let t0 = Utc::now();
        let mut record = incoming("link_down", "et-0/0/1", IncomingStatus::Alerting);
        record.severity = Severity::Info;
        let alert = f.handler.on_active(&record, t0).unwrap().unwrap().alert;

        // only the milder step is due
        assert_eq!(f.handler.escalation_sweep(t0 + ChronoDuration::seconds(30)).await.unwrap(), 1);
        assert_eq!(get(&f.store, alert.id).severity, Severity::Warn);

        assert_eq!(f.handler.escalation_sweep(t0 + ChronoDuration::seconds(90)).await.unwrap(), 1);
        assert_eq!(get(&f.store, alert.id).severity, Severity::Critical);

        assert_eq!(f.handler.escalation_sweep(t0 + ChronoDuration::hours(1)).await.unwrap(), 0);
        assert_eq!(get(&f.store, alert.id).severity, Severity::Critical);
    }

    #[tokio::test]
    async fn test_owned_alerts_never_escalate() {
        let f = fixture(escalating(vec![step(Severity::Critical, 60)]));
        let t0 = Utc::now();
        let mut alert = f
            .handler
            .on_active(&incoming("link_down", "et-0/0/1", IncomingStatus::Alerting), t0)
            .unwrap()
            .unwrap()
            .alert;
        alert.owner = Some("alice".to_string());
        with_tx(f.store.as_ref(), |tx| tx.update_alert(&alert)).unwrap();

        assert_eq!(f.handler.escalation_sweep(t0 + ChronoDuration::hours(1)).await.unwrap(), 0);
        assert_eq!(get(&f.store, alert.id).severity, Severity::Warn);
    }
}
