//! Windowed aggregation stage

use alert_model::{
    AggregationRule, Alert, AlertEvent, EventType, SharedCatalog, Status,
    LABEL_AGGREGATION_RULE,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pipeline::{Forwarder, PipelineError, Shutdown, Stage};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use storage::{with_tx, Store, StoreTx};
use tracing::{debug, info, warn};

use crate::grouper::{Grouper, GrouperRegistry, Incident};
use crate::GroupingError;

/// Pipeline priority of the aggregation stage
pub const AGGREGATION_PRIORITY: u8 = 1;

/// Alerts collected for one rule during the current window
#[derive(Default)]
struct Window {
    alerts: Vec<Alert>,
    /// A timer task is pending for this window
    armed: bool,
}

/// Per-rule grouper and its buffer
struct RuleState {
    rule: AggregationRule,
    grouper: Box<dyn Grouper>,
    window: Mutex<Window>,
}

impl RuleState {
    fn window(&self) -> MutexGuard<'_, Window> {
        self.window.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct Inner {
    store: Arc<dyn Store>,
    catalog: SharedCatalog,
    rules: Mutex<HashMap<String, Arc<RuleState>>>,
    shutdown: Shutdown,
    /// Fired when the stage input closes; pending timers exit early
    closing: Shutdown,
}

/// Aggregation Engine, run as a pipeline stage
#[derive(Clone)]
pub struct AggregationEngine {
    inner: Arc<Inner>,
}

impl AggregationEngine {
    pub fn new(store: Arc<dyn Store>, catalog: SharedCatalog, shutdown: Shutdown) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                catalog,
                rules: Mutex::new(HashMap::new()),
                shutdown,
                closing: Shutdown::new(),
            }),
        }
    }

    /// Rule state for the first aggregation rule this alert type belongs to
    fn rule_for(&self, alert: &Alert) -> Option<Arc<RuleState>> {
        let catalog = self.inner.catalog.snapshot();
        let rule = catalog
            .alert_config(&alert.name)?
            .aggregation_rules
            .iter()
            .find_map(|name| catalog.aggregation_rule(name))?;

        let mut rules = self.inner.rules.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(state) = rules.get(&rule.name) {
            return Some(Arc::clone(state));
        }
        match GrouperRegistry::build(rule) {
            Ok(grouper) => {
                info!("Aggregation rule {} uses grouper {}", rule.name, grouper.name());
                let state = Arc::new(RuleState {
                    rule: rule.clone(),
                    grouper,
                    window: Mutex::new(Window::default()),
                });
                rules.insert(rule.name.clone(), Arc::clone(&state));
                Some(state)
            }
            Err(e) => {
                warn!("Aggregation rule {} is unusable: {}", rule.name, e);
                None
            }
        }
    }

    /// Buffer an alert; the first alert of a window arms its timer
    fn buffer(&self, state: &Arc<RuleState>, alert: Alert, out: &Forwarder) {
        let arm = {
            let mut window = state.window();
            window.alerts.push(alert);
            !std::mem::replace(&mut window.armed, true)
        };
        if !arm {
            return;
        }

        let engine = self.clone();
        let state = Arc::clone(state);
        let out = out.clone();
        let mut shutdown = self.inner.shutdown.subscribe();
        let mut closing = self.inner.closing.subscribe();
        let period = state.rule.window();
        debug!("Aggregation window for {} opened ({:?})", state.rule.name, period);

        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(period) => {}
                _ = shutdown.recv() => {
                    debug!("Aggregation window for {} abandoned on shutdown", state.rule.name);
                    return;
                }
                // the stage flushes pending windows itself
                _ = closing.recv() => return,
            }
            engine.flush(&state, &out).await;
        });
    }

    /// Close every pending window now, forwarding its aggregates to `out`
    async fn flush_all(&self, out: &Forwarder) {
        self.inner.closing.trigger();
        let states: Vec<Arc<RuleState>> = {
            let rules = self.inner.rules.lock().unwrap_or_else(|e| e.into_inner());
            rules.values().cloned().collect()
        };
        for state in states {
            self.flush(&state, out).await;
        }
    }

    /// Close the current window of a rule: group the buffered alerts and
    /// materialize each group, forwarding new aggregates downstream
    async fn flush(&self, state: &RuleState, out: &Forwarder) {
        let alerts = {
            let mut window = state.window();
            window.armed = false;
            std::mem::take(&mut window.alerts)
        };
        if alerts.is_empty() {
            return;
        }

        let groups = state.grouper.do_grouping(alerts);
        info!(
            "Aggregation window for {} closed with {} groups",
            state.rule.name,
            groups.len()
        );

        let now = Utc::now();
        for group in groups {
            match self.materialize(state, group, now) {
                Ok(Some(event)) => {
                    if let Err(e) = out.forward(event).await {
                        warn!("Cannot forward aggregate for {}: {}", state.rule.name, e);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("Aggregation for {} failed: {}", state.rule.name, e);
                    metrics::counter!("alertmgr_aggregation_errors_total").increment(1);
                }
            }
        }
    }

    /// Turn one group into a new aggregate, or extend an open aggregate of the
    /// same rule that already covers the incident. Returns the event to
    /// forward for a newly created aggregate.
    fn materialize(
        &self,
        state: &RuleState,
        group: Vec<Alert>,
        now: DateTime<Utc>,
    ) -> Result<Option<AlertEvent>, GroupingError> {
        with_tx(self.inner.store.as_ref(), |tx| {
            // members may have changed while buffered
            let mut members = Vec::with_capacity(group.len());
            for alert in &group {
                let current = tx.get_alert(alert.id)?;
                if current.status.is_open() && current.aggregator_id.is_none() {
                    members.push(current);
                }
            }
            if members.is_empty() {
                return Ok(None);
            }

            let incidents: Vec<Incident> = members
                .iter()
                .filter_map(|m| state.grouper.extract(m).ok())
                .collect();

            if let Some(mut aggregate) = Self::find_open_aggregate(tx, state, &incidents)? {
                Self::attach(tx, &mut aggregate, &mut members, now)?;
                tx.update_alert(&aggregate)?;
                return Ok(None);
            }

            let mut aggregate = Self::build_aggregate(state, &members, incidents.first(), now);
            aggregate.id = tx.insert_alert(&aggregate)?;
            tx.append_history(
                aggregate.id,
                now,
                &format!("Aggregate created by rule {}", state.rule.name),
            )?;
            Self::attach(tx, &mut aggregate, &mut members, now)?;
            tx.update_alert(&aggregate)?;
            info!(
                "Aggregate {} ({}) created with {} members",
                aggregate.id,
                aggregate.entity,
                members.len()
            );
            Ok(Some(AlertEvent::new(aggregate, EventType::Active)))
        })
    }

    /// Open aggregate of this rule with a member equivalent to any of `incidents`
    fn find_open_aggregate(
        tx: &mut dyn StoreTx,
        state: &RuleState,
        incidents: &[Incident],
    ) -> Result<Option<Alert>, GroupingError> {
        let candidates = tx.alerts_by_status(&[Status::Active, Status::Suppressed])?;
        for candidate in candidates.into_iter().filter(|a| {
            a.is_aggregate && a.labels.get_str(LABEL_AGGREGATION_RULE) == Some(state.rule.name.as_str())
        }) {
            let existing = tx.aggregate_members(candidate.id)?;
            let covered = existing
                .iter()
                .filter_map(|m| state.grouper.extract(m).ok())
                .any(|known| incidents.iter().any(|i| state.grouper.equivalent(&known, i)));
            if covered {
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }

    fn build_aggregate(
        state: &RuleState,
        members: &[Alert],
        incident: Option<&Incident>,
        now: DateTime<Utc>,
    ) -> Alert {
        let entity = incident
            .map(|i| i.to_string())
            .unwrap_or_else(|| members[0].entity.clone());
        let mut aggregate = Alert::new(state.rule.name.clone(), entity, now);
        aggregate.source = "aggregator".to_string();
        aggregate.team = members[0].team.clone();
        aggregate.scope = members[0].scope.clone();
        aggregate.is_aggregate = true;
        aggregate.auto_expire = false;
        aggregate.auto_clear = true;
        aggregate.severity = members[0].severity;
        aggregate
            .labels
            .insert(LABEL_AGGREGATION_RULE, state.rule.name.clone());
        aggregate.labels.insert("grouper", state.grouper.name().to_string());
        aggregate
    }

    /// Point members at the aggregate and refresh its severity and description
    fn attach(
        tx: &mut dyn StoreTx,
        aggregate: &mut Alert,
        members: &mut [Alert],
        now: DateTime<Utc>,
    ) -> Result<(), GroupingError> {
        for member in members.iter_mut() {
            member.aggregator_id = Some(aggregate.id);
            tx.update_alert(member)?;
            tx.append_history(member.id, now, &format!("Aggregated into alert {}", aggregate.id))?;
            tx.append_history(
                aggregate.id,
                now,
                &format!("Member {} ({}) attached", member.id, member.identity()),
            )?;
            if member.severity.is_more_severe_than(aggregate.severity) {
                aggregate.severity = member.severity;
            }
        }

        let all = tx.aggregate_members(aggregate.id)?;
        let names: Vec<String> = all.iter().map(|m| m.identity().to_string()).collect();
        aggregate.description = format!("{} related alerts: {}", all.len(), names.join(", "));
        Ok(())
    }
}

#[async_trait]
impl Stage for AggregationEngine {
    fn name(&self) -> &str {
        "aggregator"
    }

    fn priority(&self) -> u8 {
        AGGREGATION_PRIORITY
    }

    async fn process(&self, event: AlertEvent, out: &Forwarder) -> Result<(), PipelineError> {
        // members are represented downstream by their aggregate
        if event.alert.aggregator_id.is_some() && !event.alert.is_aggregate {
            debug!(
                "Dropping {} event of alert {} (member of {:?})",
                event.event_type, event.alert.id, event.alert.aggregator_id
            );
            return Ok(());
        }

        if event.event_type != EventType::Active || event.alert.is_aggregate {
            return out.forward(event).await;
        }

        let Some(state) = self.rule_for(&event.alert) else {
            return out.forward(event).await;
        };

        if let Err(e) = state.grouper.extract(&event.alert) {
            warn!(
                "Alert {} cannot be aggregated by {}: {}",
                event.alert.id, state.rule.name, e
            );
            return out.forward(event).await;
        }

        debug!("Buffering alert {} for {}", event.alert.id, state.rule.name);
        self.buffer(&state, event.alert, out);
        Ok(())
    }

    async fn finish(&self, out: &Forwarder) {
        if self.inner.shutdown.is_triggered() {
            return;
        }
        info!("Aggregator input closed, flushing pending windows");
        self.flush_all(out).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alert_model::{AlertConfig, Catalog, Severity};
    use std::time::Duration;
    use storage::MemoryStore;

    fn catalog() -> SharedCatalog {
        let mut bgp = AlertConfig::named("bgp_down");
        bgp.aggregation_rules = vec!["bgp_session".to_string()];
        SharedCatalog::new(Catalog {
            alerts: vec![bgp],
            aggregation_rules: vec![AggregationRule {
                name: "bgp_session".to_string(),
                grouper: "bgp_session".to_string(),
                window_secs: 30,
                group_by: Vec::new(),
            }],
            ..Default::default()
        })
    }

    fn insert(store: &MemoryStore, local: &str, remote: &str, severity: Severity) -> Alert {
        let mut alert = Alert::new("bgp_down", local, Utc::now());
        alert.severity = severity;
        alert.labels.insert("local", local);
        alert.labels.insert("remote", remote);
        alert.id = with_tx(store, |tx| tx.insert_alert(&alert)).unwrap();
        alert
    }

    fn setup() -> (Arc<MemoryStore>, AggregationEngine) {
        let store = Arc::new(MemoryStore::new());
        let engine = AggregationEngine::new(store.clone(), catalog(), Shutdown::new());
        (store, engine)
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_groups_bgp_peers() {
        let (store, engine) = setup();
        let (out, mut rx) = Forwarder::channel(16);

        let a = insert(&store, "dev1/if1", "dev2/if2", Severity::Warn);
        let b = insert(&store, "dev2/if2", "dev1/if1", Severity::Critical);
        let c = insert(&store, "dev3/if3", "dev4/if4", Severity::Info);
        for alert in [&a, &b, &c] {
            engine
                .process(AlertEvent::new(alert.clone(), EventType::Active), &out)
                .await
                .unwrap();
        }
        // nothing leaves the stage before the window closes
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(31)).await;
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();

        assert_eq!(first.event_type, EventType::Active);
        assert!(first.alert.is_aggregate);
        assert_eq!(first.alert.severity, Severity::Critical);
        assert_eq!(first.alert.entity, "dev1/if1 <-> dev2/if2");
        assert!(second.alert.is_aggregate);
        assert_eq!(second.alert.severity, Severity::Info);

        let members = with_tx(store.as_ref(), |tx| tx.aggregate_members(first.alert.id)).unwrap();
        let mut ids: Vec<i64> = members.iter().map(|m| m.id).collect();
        ids.sort();
        assert_eq!(ids, vec![a.id, b.id]);
        let lone = with_tx(store.as_ref(), |tx| tx.get_alert(c.id)).unwrap();
        assert_eq!(lone.aggregator_id, Some(second.alert.id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_peer_extends_open_aggregate() {
        let (store, engine) = setup();
        let (out, mut rx) = Forwarder::channel(16);

        let a = insert(&store, "dev1/if1", "dev2/if2", Severity::Warn);
        engine
            .process(AlertEvent::new(a, EventType::Active), &out)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(31)).await;
        let aggregate = rx.recv().await.unwrap().alert;

        let b = insert(&store, "dev2/if2", "dev1/if1", Severity::Critical);
        engine
            .process(AlertEvent::new(b.clone(), EventType::Active), &out)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(rx.try_recv().is_err());

        let stored = with_tx(store.as_ref(), |tx| tx.get_alert(aggregate.id)).unwrap();
        assert_eq!(stored.severity, Severity::Critical);
        let b = with_tx(store.as_ref(), |tx| tx.get_alert(b.id)).unwrap();
        assert_eq!(b.aggregator_id, Some(aggregate.id));
    }

    #[tokio::test]
    async fn test_member_events_are_dropped() {
        let (_store, engine) = setup();
        let (out, mut rx) = Forwarder::channel(4);
        let mut member = Alert::new("bgp_down", "dev1/if1", Utc::now());
        member.id = 7;
        member.aggregator_id = Some(3);

        engine
            .process(AlertEvent::new(member, EventType::Cleared), &out)
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unconfigured_and_malformed_alerts_pass_through() {
        let (store, engine) = setup();
        let (out, mut rx) = Forwarder::channel(4);

        let mut other = Alert::new("disk_full", "sda", Utc::now());
        other.id = with_tx(store.as_ref(), |tx| tx.insert_alert(&other)).unwrap();
        engine
            .process(AlertEvent::new(other.clone(), EventType::Active), &out)
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().alert.id, other.id);

        // bgp alert missing its remote end
        let mut malformed = Alert::new("bgp_down", "dev9/if9", Utc::now());
        malformed.labels.insert("local", "dev9/if9");
        malformed.id = with_tx(store.as_ref(), |tx| tx.insert_alert(&malformed)).unwrap();
        engine
            .process(AlertEvent::new(malformed.clone(), EventType::Active), &out)
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().alert.id, malformed.id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_alert_cleared_during_window_is_left_out() {
        let (store, engine) = setup();
        let (out, mut rx) = Forwarder::channel(4);

        let a = insert(&store, "dev1/if1", "dev2/if2", Severity::Warn);
        engine
            .process(AlertEvent::new(a.clone(), EventType::Active), &out)
            .await
            .unwrap();
        with_tx(store.as_ref(), |tx| {
            let mut row = tx.get_alert(a.id)?;
            row.status = Status::Cleared;
            tx.update_alert(&row)
        })
        .unwrap();

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_abandons_window() {
        let store = Arc::new(MemoryStore::new());
        let shutdown = Shutdown::new();
        let engine = AggregationEngine::new(store.clone(), catalog(), shutdown.clone());
        let (out, mut rx) = Forwarder::channel(4);

        let a = insert(&store, "dev1/if1", "dev2/if2", Severity::Warn);
        engine
            .process(AlertEvent::new(a, EventType::Active), &out)
            .await
            .unwrap();
        shutdown.trigger();
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(store.alert_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closing_input_flushes_and_releases_output() {
        let (store, engine) = setup();
        let (out, mut rx) = Forwarder::channel(4);
        let started = tokio::time::Instant::now();

        let a = insert(&store, "dev1/if1", "dev2/if2", Severity::Warn);
        engine
            .process(AlertEvent::new(a.clone(), EventType::Active), &out)
            .await
            .unwrap();
        engine.finish(&out).await;
        drop(out);

        let aggregate = rx.recv().await.unwrap();
        assert!(aggregate.alert.is_aggregate);
        // the pending timer no longer holds the output open
        assert!(rx.recv().await.is_none());
        assert!(started.elapsed() < Duration::from_secs(30));

        let member = with_tx(store.as_ref(), |tx| tx.get_alert(a.id)).unwrap();
        assert_eq!(member.aggregator_id, Some(aggregate.alert.id));
    }
}
