//! Enrichment transforms applied to new alerts before suppression matching

use alert_model::{Alert, AlertConfig, LabelValue};
use tracing::{debug, warn};

use crate::TransformError;

/// Label holding the team an alert should be routed to
pub const TEAM_LABEL: &str = "team";

/// Rewrites a new alert using its labels and type configuration
pub trait Transform: Send + Sync {
    fn name(&self) -> &str;

    fn apply(&self, alert: &mut Alert, config: Option<&AlertConfig>) -> Result<(), TransformError>;
}

/// Adds the static labels configured for the alert type. Labels reported by
/// the source win over static ones.
pub struct StaticLabels;

impl Transform for StaticLabels {
    fn name(&self) -> &str {
        "static_labels"
    }

    fn apply(&self, alert: &mut Alert, config: Option<&AlertConfig>) -> Result<(), TransformError> {
        let Some(config) = config else {
            return Ok(());
        };
        for (key, value) in &config.static_labels {
            if !alert.labels.contains_key(key) {
                alert.labels.insert(key.clone(), value.clone());
            }
        }
        Ok(())
    }
}

/// Routes the alert to the team named by its `team` label
pub struct TeamFromLabel;

impl Transform for TeamFromLabel {
    fn name(&self) -> &str {
        "team_from_label"
    }

    fn apply(&self, alert: &mut Alert, _config: Option<&AlertConfig>) -> Result<(), TransformError> {
        match alert.labels.get(TEAM_LABEL) {
            None => Ok(()),
            Some(LabelValue::Str(team)) if !team.trim().is_empty() => {
                alert.team = team.trim().to_string();
                Ok(())
            }
            Some(other) => Err(TransformError::InvalidLabel {
                label: TEAM_LABEL.to_string(),
                reason: format!("expected a team name, got {:?}", other),
            }),
        }
    }
}

/// Apply `transform`, retrying once on failure. On a second failure the
/// alert is left as it was and `false` is returned.
pub(crate) fn apply_with_retry(
    transform: &dyn Transform,
    alert: &mut Alert,
    config: Option<&AlertConfig>,
) -> bool {
    for attempt in 1..=2 {
        let mut candidate = alert.clone();
        match transform.apply(&mut candidate, config) {
            Ok(()) => {
                *alert = candidate;
                return true;
            }
            Err(e) => warn!(
                "Transform {} failed on {} (attempt {}): {}",
                transform.name(),
                alert.identity(),
                attempt,
                e
            ),
        }
    }
    debug!("Proceeding with {} unenriched", alert.identity());
    metrics::counter!("alertmgr_transform_errors_total", "transform" => transform.name().to_string())
        .increment(1);
    false
}
