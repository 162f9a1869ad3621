//! Alert lifecycle transitions

use aggregation::derived_status;
use alert_model::{
    Alert, AlertConfig, AlertEvent, Catalog, EventType, IncomingAlert, IncomingStatus, Labels,
    MatchCondition, Severity, SharedCatalog, Status, SuppressionRule, Team, LABEL_ALERT_NAME,
    LABEL_DEVICE, LABEL_ENTITY,
};
use chrono::{DateTime, Utc};
use pipeline::{Forwarder, ShutdownListener};
use std::sync::Arc;
use std::time::Duration;
use storage::{with_tx, Store, StoreTx};
use suppression::SuppressionEngine;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::transform::{apply_with_retry, StaticLabels, TeamFromLabel, Transform};
use crate::HandlerError;

/// Alert Handler
pub struct AlertHandler {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) catalog: SharedCatalog,
    suppressor: Arc<SuppressionEngine>,
    transforms: Vec<Arc<dyn Transform>>,
    events: Forwarder,
}

impl AlertHandler {
    pub fn new(
        store: Arc<dyn Store>,
        catalog: SharedCatalog,
        suppressor: Arc<SuppressionEngine>,
        events: Forwarder,
    ) -> Self {
        Self {
            store,
            catalog,
            suppressor,
            transforms: vec![Arc::new(StaticLabels), Arc::new(TeamFromLabel)],
            events,
        }
    }

    /// Replace the enrichment transforms, applied in the given order
    pub fn with_transforms(mut self, transforms: Vec<Arc<dyn Transform>>) -> Self {
        self.transforms = transforms;
        self
    }

    /// Make sure every team of the configured directory exists in the store
    pub fn load_teams(&self) -> Result<usize, HandlerError> {
        let directory = self.catalog.snapshot().team_directory();
        let created = with_tx(self.store.as_ref(), |tx| {
            let mut created = 0;
            for team in &directory {
                if tx.get_team(&team.name)?.is_none() {
                    tx.insert_team(team)?;
                    created += 1;
                }
            }
            Ok::<_, HandlerError>(created)
        })?;
        info!(
            "Team directory loaded: {} teams, {} new",
            directory.len(),
            created
        );
        Ok(created)
    }

    /// Drain the ingestion queue until it closes or shutdown is signalled
    pub async fn run(
        self: Arc<Self>,
        mut incoming: mpsc::Receiver<IncomingAlert>,
        mut shutdown: ShutdownListener,
    ) {
        info!("Alert handler started");
        loop {
            tokio::select! {
                next = incoming.recv() => match next {
                    Some(record) => {
                        if let Err(e) = self.ingest(&record).await {
                            self.record_error(&e);
                            error!("Dropping {} from {}: {}", record.identity(), record.source, e);
                        }
                    }
                    None => {
                        debug!("Ingestion queue closed");
                        break;
                    }
                },
                _ = shutdown.recv() => break,
            }
        }
        info!("Alert handler stopped");
    }

    /// Process one incoming record and emit the resulting events
    pub async fn ingest(&self, incoming: &IncomingAlert) -> Result<Vec<AlertEvent>, HandlerError> {
        let now = Utc::now();
        let events = match incoming.status {
            IncomingStatus::Alerting => self.on_active(incoming, now)?.into_iter().collect(),
            IncomingStatus::Cleared => self.on_clear(incoming, now)?,
        };
        self.emit(&events).await?;
        Ok(events)
    }

    pub(crate) async fn emit(&self, events: &[AlertEvent]) -> Result<(), HandlerError> {
        for event in events {
            metrics::counter!("alertmgr_events_total", "type" => event.event_type.as_str())
                .increment(1);
            self.events.forward(event.clone()).await?;
        }
        Ok(())
    }

    pub(crate) fn record_error(&self, e: &HandlerError) {
        metrics::counter!("alertmgr_handler_errors_total", "kind" => e.kind()).increment(1);
    }

    /// ACTIVE record: dedup against stored rows, reactivate terminal ones,
    /// otherwise enrich, check suppression and create a new row
    pub(crate) fn on_active(
        &self,
        incoming: &IncomingAlert,
        now: DateTime<Utc>,
    ) -> Result<Option<AlertEvent>, HandlerError> {
        let catalog = self.catalog.snapshot();
        let config = catalog.alert_config(&incoming.name);
        let dedup = !config.map_or(false, |c| c.disable_dedup);
        let identity = incoming.identity();

        let existing = with_tx(self.store.as_ref(), |tx| {
            let statuses: &[Status] = if dedup { &[] } else { &[Status::Active] };
            Ok::<_, HandlerError>(tx.find_alert(&identity, statuses)?)
        })?;

        match existing {
            Some(alert) => self.refresh_existing(alert.id, incoming, now),
            None => self.create(incoming, &catalog, config, now),
        }
    }

    fn refresh_existing(
        &self,
        id: i64,
        incoming: &IncomingAlert,
        now: DateTime<Utc>,
    ) -> Result<Option<AlertEvent>, HandlerError> {
        with_tx(self.store.as_ref(), |tx| {
            let mut alert = tx.get_alert(id)?;

            if alert.status.is_open() {
                alert.last_active = now;
                tx.update_alert(&alert)?;
                if let Some(aggregate_id) = alert.aggregator_id {
                    let mut aggregate = tx.get_alert(aggregate_id)?;
                    aggregate.last_active = now;
                    tx.update_alert(&aggregate)?;
                }
                debug!("Alert {} still active", alert.id);
                return Ok(None);
            }

            let previous = alert.status;
            alert.status = Status::Active;
            alert.start_time = now;
            alert.last_active = now;
            if !incoming.description.is_empty() {
                alert.description = incoming.description.clone();
            }
            tx.update_alert(&alert)?;
            tx.append_history(
                alert.id,
                now,
                &format!("Reactivated from {} by {}", previous, incoming.source),
            )?;
            info!("Alert {} ({}) reactivated", alert.id, alert.identity());

            let Some(aggregate_id) = alert.aggregator_id else {
                return Ok(Some(AlertEvent::new(alert, EventType::Active)));
            };
            let mut aggregate = tx.get_alert(aggregate_id)?;
            aggregate.last_active = now;
            if aggregate.status.is_open() {
                tx.update_alert(&aggregate)?;
                tx.append_history(
                    aggregate.id,
                    now,
                    &format!("Member {} reactivated", alert.id),
                )?;
                return Ok(None);
            }
            aggregate.status = Status::Active;
            aggregate.start_time = now;
            tx.update_alert(&aggregate)?;
            tx.append_history(
                aggregate.id,
                now,
                &format!("Reactivated by member {}", alert.id),
            )?;
            Ok(Some(AlertEvent::new(aggregate, EventType::Active)))
        })
    }

    fn create(
        &self,
        incoming: &IncomingAlert,
        catalog: &Catalog,
        config: Option<&AlertConfig>,
        now: DateTime<Utc>,
    ) -> Result<Option<AlertEvent>, HandlerError> {
        let mut alert = Alert::from_incoming(incoming, now);
        if let Some(config) = config {
            apply_config(&mut alert, config);
        }
        for transform in &self.transforms {
            apply_with_retry(transform.as_ref(), &mut alert, config);
        }

        if let Some(rule) = self.suppressor.match_labels(&alert.match_labels(), now) {
            debug!(
                "Dropping {}: suppressed by rule {} ({})",
                alert.identity(),
                rule.id,
                rule.name
            );
            metrics::counter!("alertmgr_alerts_suppressed_total").increment(1);
            return Ok(None);
        }

        with_tx(self.store.as_ref(), |tx| {
            ensure_team(tx, &alert.team, catalog)?;
            alert.id = tx.insert_alert(&alert)?;
            tx.append_history(
                alert.id,
                now,
                &format!("Created from {} ({})", incoming.source, alert.severity),
            )?;
            info!("Alert {} ({}) created", alert.id, alert.identity());
            Ok(Some(AlertEvent::new(alert, EventType::Active)))
        })
    }

    /// CLEARED record from a source
    pub(crate) fn on_clear(
        &self,
        incoming: &IncomingAlert,
        now: DateTime<Utc>,
    ) -> Result<Vec<AlertEvent>, HandlerError> {
        let dont_clear_acknowledged = self.catalog.snapshot().dont_clear_acknowledged;
        let identity = incoming.identity();

        with_tx(self.store.as_ref(), |tx| {
            let Some(mut alert) = tx.find_alert(&identity, &[])? else {
                debug!("Clear for unknown alert {}", identity);
                return Ok(Vec::new());
            };
            if alert.status == Status::Cleared
                || !alert.auto_clear
                || (alert.owner.is_some() && dont_clear_acknowledged)
            {
                debug!("Ignoring clear for alert {} ({})", alert.id, alert.status);
                return Ok(Vec::new());
            }

            alert.status = Status::Cleared;
            alert.last_active = now;
            tx.update_alert(&alert)?;
            tx.append_history(alert.id, now, &format!("Cleared by {}", incoming.source))?;
            info!("Alert {} ({}) cleared", alert.id, alert.identity());

            let aggregate_id = alert.aggregator_id;
            let mut events = vec![AlertEvent::new(alert, EventType::Cleared)];
            if let Some(aggregate_id) = aggregate_id {
                events.extend(rederive_aggregate(tx, aggregate_id, now)?);
            }
            Ok(events)
        })
    }

    /// Suppress an alert and persist a rule on its identity so recurrences
    /// are dropped for `duration`. Aggregates suppress their open members
    /// first; only the top-level alert produces an event.
    pub async fn suppress(
        &self,
        id: i64,
        creator: &str,
        reason: &str,
        duration: Duration,
    ) -> Result<AlertEvent, HandlerError> {
        let now = Utc::now();
        let (alert, rules) = with_tx(self.store.as_ref(), |tx| {
            let mut rules = Vec::new();
            let alert = self.suppress_in(tx, id, creator, reason, duration, now, &mut rules)?;
            Ok::<_, HandlerError>((alert, rules))
        })?;
        for rule in rules {
            self.suppressor.admit(rule);
        }

        let event = AlertEvent::new(alert, EventType::Suppressed);
        self.emit(std::slice::from_ref(&event)).await?;
        Ok(event)
    }

    #[allow(clippy::too_many_arguments)]
    fn suppress_in(
        &self,
        tx: &mut dyn StoreTx,
        id: i64,
        creator: &str,
        reason: &str,
        duration: Duration,
        now: DateTime<Utc>,
        rules: &mut Vec<SuppressionRule>,
    ) -> Result<Alert, HandlerError> {
        let mut alert = tx.get_alert(id)?;

        if alert.is_aggregate {
            for member in tx.aggregate_members(id)? {
                if member.status.is_open() {
                    self.suppress_in(tx, member.id, creator, reason, duration, now, rules)?;
                }
            }
            self.suppressor
                .suppress_alert(tx, &mut alert, now, creator, reason)?;
            return Ok(alert);
        }

        self.suppressor
            .suppress_alert(tx, &mut alert, now, creator, reason)?;
        let mut rule = SuppressionRule::new(
            format!("suppress {}", alert.identity()),
            identity_predicate(&alert),
            MatchCondition::All,
            duration,
            now,
        );
        rule.creator = creator.to_string();
        rule.reason = reason.to_string();
        self.suppressor.persist_rule(tx, &mut rule)?;
        tx.append_history(
            alert.id,
            now,
            &format!("Suppression rule {} created for {:?}", rule.id, duration),
        )?;
        rules.push(rule);
        Ok(alert)
    }

    /// Return a SUPPRESSED alert (and its suppressed members) to ACTIVE
    pub async fn unsuppress(&self, id: i64) -> Result<AlertEvent, HandlerError> {
        let now = Utc::now();
        let alert = with_tx(self.store.as_ref(), |tx| {
            let mut alert = tx.get_alert(id)?;
            self.suppressor.unsuppress_alert(tx, &mut alert, now)?;
            if alert.is_aggregate {
                for mut member in tx.aggregate_members(id)? {
                    if member.status == Status::Suppressed {
                        self.suppressor.unsuppress_alert(tx, &mut member, now)?;
                    }
                }
            }
            Ok::<_, HandlerError>(alert)
        })?;
        info!("Alert {} unsuppressed", alert.id);

        let event = AlertEvent::new(alert, EventType::Active);
        self.emit(std::slice::from_ref(&event)).await?;
        Ok(event)
    }

    /// Acknowledge an alert, optionally handing it to another team
    pub async fn set_owner(
        &self,
        id: i64,
        owner: &str,
        team: Option<&str>,
    ) -> Result<AlertEvent, HandlerError> {
        let now = Utc::now();
        let alert = with_tx(self.store.as_ref(), |tx| {
            if let Some(team) = team {
                if tx.get_team(team)?.is_none() {
                    return Err(HandlerError::UnknownTeam(team.to_string()));
                }
            }
            let mut alert = tx.get_alert(id)?;
            if !alert.status.is_open() {
                return Err(HandlerError::InvalidTransition {
                    id,
                    status: alert.status,
                    action: "acknowledge",
                });
            }

            let mut targets = vec![alert.clone()];
            if alert.is_aggregate {
                targets.extend(tx.aggregate_members(id)?);
            }
            for target in &mut targets {
                target.owner = Some(owner.to_string());
                if let Some(team) = team {
                    target.team = team.to_string();
                }
                tx.update_alert(target)?;
                tx.append_history(target.id, now, &format!("Acknowledged by {}", owner))?;
            }
            alert.owner = Some(owner.to_string());
            if let Some(team) = team {
                alert.team = team.to_string();
            }
            Ok(alert)
        })?;
        info!("Alert {} acknowledged by {}", alert.id, owner);

        let event = AlertEvent::new(alert, EventType::Ackd);
        self.emit(std::slice::from_ref(&event)).await?;
        Ok(event)
    }

    /// Clear an alert by hand. Clearing an aggregate clears its open members.
    pub async fn clear(&self, id: i64) -> Result<Vec<AlertEvent>, HandlerError> {
        let now = Utc::now();
        let events = with_tx(self.store.as_ref(), |tx| {
            let mut alert = tx.get_alert(id)?;
            if alert.status == Status::Cleared {
                return Err(HandlerError::InvalidTransition {
                    id,
                    status: alert.status,
                    action: "clear",
                });
            }

            if alert.is_aggregate {
                for mut member in tx.aggregate_members(id)? {
                    if member.status != Status::Cleared {
                        member.status = Status::Cleared;
                        tx.update_alert(&member)?;
                        tx.append_history(member.id, now, "Cleared with its aggregate")?;
                    }
                }
            }
            alert.status = Status::Cleared;
            tx.update_alert(&alert)?;
            tx.append_history(alert.id, now, "Cleared manually")?;

            let aggregate_id = alert.aggregator_id;
            let mut events = vec![AlertEvent::new(alert, EventType::Cleared)];
            if let Some(aggregate_id) = aggregate_id {
                events.extend(rederive_aggregate(tx, aggregate_id, now)?);
            }
            Ok(events)
        })?;
        info!("Alert {} cleared manually", id);

        self.emit(&events).await?;
        Ok(events)
    }

    /// Set an open alert's severity by hand
    pub async fn escalate(&self, id: i64, severity: Severity) -> Result<AlertEvent, HandlerError> {
        let now = Utc::now();
        let alert = with_tx(self.store.as_ref(), |tx| {
            let mut alert = tx.get_alert(id)?;
            if !alert.status.is_open() || alert.severity == severity {
                return Err(HandlerError::InvalidTransition {
                    id,
                    status: alert.status,
                    action: "escalate",
                });
            }
            let previous = alert.severity;
            alert.severity = severity;
            tx.update_alert(&alert)?;
            tx.append_history(
                alert.id,
                now,
                &format!("Severity changed from {} to {}", previous, severity),
            )?;
            Ok(alert)
        })?;

        let event = AlertEvent::new(alert, EventType::Escalated);
        self.emit(std::slice::from_ref(&event)).await?;
        Ok(event)
    }
}

/// Apply type-level policy to a new alert
fn apply_config(alert: &mut Alert, config: &AlertConfig) {
    if let Some(severity) = config.severity {
        alert.severity = severity;
    }
    if let Some(team) = &config.team {
        alert.team = team.clone();
    }
    alert.auto_expire = config.auto_expire;
    alert.expire_after = config.expire_after();
    alert.auto_clear = config.auto_clear;
}

/// Create the alert's team on first use
fn ensure_team(tx: &mut dyn StoreTx, name: &str, catalog: &Catalog) -> Result<(), HandlerError> {
    if name.is_empty() || tx.get_team(name)?.is_some() {
        return Ok(());
    }
    let organization = catalog
        .team_directory()
        .into_iter()
        .find(|t| t.name == name)
        .map(|t| t.organization)
        .unwrap_or_else(|| catalog.organization.clone());
    let id = tx.insert_team(&Team {
        id: 0,
        name: name.to_string(),
        organization,
    })?;
    info!("Created team {} ({})", name, id);
    Ok(())
}

/// Predicate matching exactly this alert's identity labels
fn identity_predicate(alert: &Alert) -> Labels {
    let mut labels = Labels::new();
    labels.insert(LABEL_ALERT_NAME, regex::escape(&alert.name));
    labels.insert(LABEL_ENTITY, regex::escape(&alert.entity));
    if let Some(device) = &alert.device {
        labels.insert(LABEL_DEVICE, regex::escape(device));
    }
    labels
}

/// Move an open aggregate to the status its members imply
pub(crate) fn rederive_aggregate(
    tx: &mut dyn StoreTx,
    aggregate_id: i64,
    now: DateTime<Utc>,
) -> Result<Option<AlertEvent>, HandlerError> {
    let mut aggregate = tx.get_alert(aggregate_id)?;
    if !aggregate.status.is_open() {
        return Ok(None);
    }
    let members = tx.aggregate_members(aggregate_id)?;
    let Some(status) = derived_status(&members) else {
        return Ok(None);
    };

    aggregate.status = status;
    aggregate.last_active = now;
    tx.update_alert(&aggregate)?;
    tx.append_history(
        aggregate.id,
        now,
        &format!("All {} members {}", members.len(), status),
    )?;
    info!("Aggregate {} is now {}", aggregate.id, status);

    let event_type = match status {
        Status::Expired => EventType::Expired,
        _ => EventType::Cleared,
    };
    Ok(Some(AlertEvent::new(aggregate, event_type)))
}
