//! Notification decisions and tracking

use alert_model::{elapsed, Alert, AlertEvent, Catalog, EventType, SharedCatalog, Status};
use chrono::{DateTime, Utc};
use pipeline::ShutdownListener;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use storage::{with_tx, StorageError, Store};
use tracing::{debug, info, warn};

use crate::{NotifyError, OutputRegistry};

/// What the engine did with an event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyOutcome {
    /// Delivered to these outputs
    Sent(Vec<String>),
    /// Noted, nothing sent
    Recorded,
    /// ACTIVE too recently for the type's notify delay
    Deferred,
    /// Nothing to do
    Ignored,
}

#[derive(Debug, Clone)]
struct Tracked {
    last_event: EventType,
    last_notified_at: DateTime<Utc>,
}

#[derive(Default)]
struct State {
    tracked: HashMap<i64, Tracked>,
    /// ACTIVE alerts waiting out their notify delay
    deferred: HashSet<i64>,
}

/// Notification Engine
pub struct Notifier {
    store: Arc<dyn Store>,
    catalog: SharedCatalog,
    outputs: OutputRegistry,
    state: Mutex<State>,
}

impl Notifier {
    pub fn new(store: Arc<dyn Store>, catalog: SharedCatalog, outputs: OutputRegistry) -> Self {
        info!("Creating notifier with outputs: {:?}", outputs.names());
        Self {
            store,
            catalog,
            outputs,
            state: Mutex::new(State::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Track every ACTIVE alert so a restart does not re-announce them
    pub fn seed(&self, now: DateTime<Utc>) -> Result<usize, NotifyError> {
        let active = with_tx(self.store.as_ref(), |tx| tx.alerts_by_status(&[Status::Active]))?;
        let mut state = self.state();
        for alert in &active {
            state.tracked.insert(
                alert.id,
                Tracked {
                    last_event: EventType::Active,
                    last_notified_at: now,
                },
            );
        }
        info!("Notifier seeded with {} active alerts", active.len());
        Ok(active.len())
    }

    pub fn is_tracked(&self, alert_id: i64) -> bool {
        self.state().tracked.contains_key(&alert_id)
    }

    pub fn tracked_count(&self) -> usize {
        self.state().tracked.len()
    }

    /// Apply the notification decision table to one event
    pub async fn notify(
        &self,
        event: &AlertEvent,
        now: DateTime<Utc>,
    ) -> Result<NotifyOutcome, NotifyError> {
        let alert = &event.alert;
        let catalog = self.catalog.snapshot();
        let config = catalog.alert_config(&alert.name);

        match event.event_type {
            EventType::Active => {
                if config.map_or(false, |c| c.notify.disable) {
                    debug!("Notifications disabled for {}", alert.name);
                    return Ok(NotifyOutcome::Recorded);
                }
                let delay = config.map(|c| c.notify.delay()).unwrap_or_default();
                {
                    let mut state = self.state();
                    if state.tracked.contains_key(&alert.id) {
                        return Ok(NotifyOutcome::Ignored);
                    }
                    if elapsed(alert.start_time, now) < delay {
                        debug!("Deferring notification for alert {}", alert.id);
                        state.deferred.insert(alert.id);
                        return Ok(NotifyOutcome::Deferred);
                    }
                    state.deferred.remove(&alert.id);
                    state.tracked.insert(
                        alert.id,
                        Tracked {
                            last_event: EventType::Active,
                            last_notified_at: now,
                        },
                    );
                }
                self.send(&catalog, event, now, "Notification").await
            }
            EventType::Cleared | EventType::Expired => {
                {
                    let mut state = self.state();
                    state.tracked.remove(&alert.id);
                    state.deferred.remove(&alert.id);
                }
                let on_clear = config.map_or(false, |c| c.notify.notify_on_clear);
                if event.event_type == EventType::Cleared && on_clear {
                    self.send(&catalog, event, now, "Notification").await
                } else {
                    Ok(NotifyOutcome::Recorded)
                }
            }
            EventType::Suppressed | EventType::Ackd => {
                let mut state = self.state();
                state.deferred.remove(&alert.id);
                match state.tracked.get_mut(&alert.id) {
                    Some(tracked) => {
                        tracked.last_event = event.event_type;
                        Ok(NotifyOutcome::Recorded)
                    }
                    None => Ok(NotifyOutcome::Ignored),
                }
            }
            EventType::Escalated => {
                {
                    let mut state = self.state();
                    let Some(tracked) = state.tracked.get_mut(&alert.id) else {
                        return Ok(NotifyOutcome::Ignored);
                    };
                    tracked.last_event = EventType::Escalated;
                    tracked.last_notified_at = now;
                }
                self.send(&catalog, event, now, "Escalation notice").await
            }
        }
    }

    /// Deliver an event to the outputs configured for its severity and record
    /// each delivery in the alert history
    async fn send(
        &self,
        catalog: &Catalog,
        event: &AlertEvent,
        now: DateTime<Utc>,
        what: &str,
    ) -> Result<NotifyOutcome, NotifyError> {
        let alert = &event.alert;
        let mut delivered = Vec::new();

        for name in catalog.outputs_for(&alert.name, alert.severity) {
            let output = match self.outputs.get(&name) {
                Ok(output) => output,
                Err(e) => {
                    warn!("Alert {}: {}", alert.id, e);
                    continue;
                }
            };
            match output.send(event).await {
                Ok(()) => {
                    metrics::counter!("alertmgr_notifications_sent_total", "output" => name.clone())
                        .increment(1);
                    delivered.push(name);
                }
                Err(e) => {
                    warn!("Notification for alert {} failed: {}", alert.id, e);
                    metrics::counter!("alertmgr_notification_errors_total", "output" => name)
                        .increment(1);
                }
            }
        }

        if !delivered.is_empty() {
            with_tx(self.store.as_ref(), |tx| {
                for name in &delivered {
                    tx.append_history(
                        alert.id,
                        now,
                        &format!("{} ({}) sent to {}", what, event.event_type, name),
                    )?;
                }
                Ok::<_, StorageError>(())
            })?;
        }
        Ok(NotifyOutcome::Sent(delivered))
    }

    /// Send reminders for tracked alerts whose interval has elapsed, and the
    /// first notification for deferred alerts whose delay has passed.
    /// Returns the number of sends.
    pub async fn remind(&self, now: DateTime<Utc>) -> Result<usize, NotifyError> {
        let (tracked, deferred): (Vec<(i64, DateTime<Utc>)>, Vec<i64>) = {
            let state = self.state();
            (
                state
                    .tracked
                    .iter()
                    .map(|(id, t)| (*id, t.last_notified_at))
                    .collect(),
                state.deferred.iter().copied().collect(),
            )
        };
        if tracked.is_empty() && deferred.is_empty() {
            return Ok(0);
        }

        let ids: Vec<i64> = tracked.iter().map(|(id, _)| *id).chain(deferred.iter().copied()).collect();
        let alerts = self.load(&ids)?;
        let catalog = self.catalog.snapshot();
        let mut sent = 0;

        for (id, last_notified_at) in tracked {
            let Some(alert) = alerts.get(&id) else {
                self.state().tracked.remove(&id);
                continue;
            };
            if alert.status != Status::Active || alert.owner.is_some() {
                continue;
            }
            let Some(interval) = catalog.remind_interval(&alert.name) else {
                continue;
            };
            if elapsed(last_notified_at, now) < interval {
                continue;
            }

            if let Some(entry) = self.state().tracked.get_mut(&id) {
                entry.last_notified_at = now;
            }
            let event = AlertEvent::new(alert.clone(), EventType::Active);
            match self.send(&catalog, &event, now, "Reminder").await {
                Ok(NotifyOutcome::Sent(outputs)) => {
                    debug!("Reminder for alert {} sent to {:?}", id, outputs);
                    sent += 1;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("Reminder for alert {} failed: {}", id, e);
                    metrics::counter!("alertmgr_reminder_errors_total").increment(1);
                }
            }
        }

        for id in deferred {
            match alerts.get(&id) {
                Some(alert) if alert.status == Status::Active => {
                    let event = AlertEvent::new(alert.clone(), EventType::Active);
                    match self.notify(&event, now).await {
                        Ok(NotifyOutcome::Sent(_)) => sent += 1,
                        Ok(_) => {}
                        Err(e) => {
                            warn!("Deferred notification for alert {} failed: {}", id, e);
                            metrics::counter!("alertmgr_reminder_errors_total").increment(1);
                        }
                    }
                }
                _ => {
                    self.state().deferred.remove(&id);
                }
            }
        }
        Ok(sent)
    }

    /// Read-only; the transaction is dropped without commit
    fn load(&self, ids: &[i64]) -> Result<HashMap<i64, Alert>, NotifyError> {
        let tx = self.store.begin()?;
        let mut alerts = HashMap::with_capacity(ids.len());
        for id in ids {
            match tx.get_alert(*id) {
                Ok(alert) => {
                    alerts.insert(*id, alert);
                }
                Err(StorageError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(alerts)
    }

    /// Reminder loop
    pub async fn run_reminders(self: Arc<Self>, interval: Duration, mut shutdown: ShutdownListener) {
        info!("Starting reminder sweep every {:?}", interval);
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.remind(Utc::now()).await {
                        Ok(0) => {}
                        Ok(sent) => debug!("Reminder sweep sent {} notifications", sent),
                        Err(e) => {
                            warn!("Reminder sweep failed: {}", e);
                            metrics::counter!("alertmgr_reminder_errors_total").increment(1);
                        }
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
        info!("Reminder sweep stopped");
    }
}
