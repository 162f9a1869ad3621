//! Grouping strategies

use alert_model::{AggregationRule, Alert};
use std::fmt;
use tracing::warn;

use crate::GroupingError;

/// Structured incident metadata extracted from an alert's labels
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incident {
    /// One end of a peering session
    Peering { local: String, remote: String },
    /// One end of a circuit, seen from `a_end`
    Circuit {
        id: Option<String>,
        a_end: String,
        z_end: String,
    },
    /// Values of the grouping labels, in configured key order
    Labels(Vec<String>),
}

impl fmt::Display for Incident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Incident::Peering { local, remote } => write!(f, "{} <-> {}", local, remote),
            Incident::Circuit { id: Some(id), .. } => write!(f, "circuit {}", id),
            Incident::Circuit { a_end, z_end, .. } => write!(f, "{} <-> {}", a_end, z_end),
            Incident::Labels(values) => f.write_str(&values.join("/")),
        }
    }
}

/// A named equivalence relation over alerts
pub trait Grouper: Send + Sync {
    fn name(&self) -> &str;

    /// Pull the metadata this grouper compares. Fails on malformed alerts.
    fn extract(&self, alert: &Alert) -> Result<Incident, GroupingError>;

    /// Whether two incidents describe the same underlying fault
    fn equivalent(&self, a: &Incident, b: &Incident) -> bool;

    /// Partition alerts into groups by scanning: each alert joins the first
    /// group holding a member it is equivalent to, otherwise it seeds a new
    /// group. Malformed alerts are skipped.
    fn do_grouping(&self, alerts: Vec<Alert>) -> Vec<Vec<Alert>> {
        let mut groups: Vec<Vec<(Incident, Alert)>> = Vec::new();

        for alert in alerts {
            let incident = match self.extract(&alert) {
                Ok(incident) => incident,
                Err(e) => {
                    warn!("{}: skipping alert {}: {}", self.name(), alert.id, e);
                    continue;
                }
            };
            let home = groups
                .iter_mut()
                .find(|group| group.iter().any(|(other, _)| self.equivalent(other, &incident)));
            match home {
                Some(group) => group.push((incident, alert)),
                None => groups.push(vec![(incident, alert)]),
            }
        }

        groups
            .into_iter()
            .map(|group| group.into_iter().map(|(_, alert)| alert).collect())
            .collect()
    }
}

fn required(alert: &Alert, label: &str) -> Result<String, GroupingError> {
    alert
        .match_labels()
        .get(label)
        .map(|v| v.to_string())
        .ok_or_else(|| GroupingError::MissingLabel {
            alert_id: alert.id,
            label: label.to_string(),
        })
}

/// Both peers of a BGP session: `local`/`remote` labels swap between ends
pub struct BgpSessionGrouper;

impl Grouper for BgpSessionGrouper {
    fn name(&self) -> &str {
        "bgp_session"
    }

    fn extract(&self, alert: &Alert) -> Result<Incident, GroupingError> {
        Ok(Incident::Peering {
            local: required(alert, "local")?,
            remote: required(alert, "remote")?,
        })
    }

    fn equivalent(&self, a: &Incident, b: &Incident) -> bool {
        match (a, b) {
            (
                Incident::Peering { local: l1, remote: r1 },
                Incident::Peering { local: l2, remote: r2 },
            ) => (l1 == r2 && r1 == l2) || (l1 == l2 && r1 == r2),
            _ => false,
        }
    }
}

/// Both ends of a circuit: shared `circuit_id`, or A/Z endpoints that cross-match
pub struct CircuitGrouper;

impl Grouper for CircuitGrouper {
    fn name(&self) -> &str {
        "circuit"
    }

    fn extract(&self, alert: &Alert) -> Result<Incident, GroupingError> {
        Ok(Incident::Circuit {
            id: alert.labels.get("circuit_id").map(|v| v.to_string()),
            a_end: required(alert, "a_end")?,
            z_end: required(alert, "z_end")?,
        })
    }

    fn equivalent(&self, a: &Incident, b: &Incident) -> bool {
        match (a, b) {
            (
                Incident::Circuit { id: id1, a_end: a1, z_end: z1 },
                Incident::Circuit { id: id2, a_end: a2, z_end: z2 },
            ) => {
                if let (Some(id1), Some(id2)) = (id1, id2) {
                    if id1 == id2 {
                        return true;
                    }
                }
                (a1 == z2 && z1 == a2) || (a1 == a2 && z1 == z2)
            }
            _ => false,
        }
    }
}

/// Alerts sharing the values of a configured set of labels
pub struct LabelGrouper {
    keys: Vec<String>,
}

impl LabelGrouper {
    pub fn new(keys: Vec<String>) -> Self {
        Self { keys }
    }
}

impl Grouper for LabelGrouper {
    fn name(&self) -> &str {
        "label"
    }

    fn extract(&self, alert: &Alert) -> Result<Incident, GroupingError> {
        self.keys
            .iter()
            .map(|key| required(alert, key))
            .collect::<Result<Vec<_>, _>>()
            .map(Incident::Labels)
    }

    fn equivalent(&self, a: &Incident, b: &Incident) -> bool {
        matches!((a, b), (Incident::Labels(x), Incident::Labels(y)) if x == y)
    }
}

/// Builds groupers by name
pub struct GrouperRegistry;

impl GrouperRegistry {
    /// Names of every available grouper
    pub const NAMES: [&'static str; 3] = ["bgp_session", "circuit", "label"];

    /// Build the grouper an aggregation rule asks for
    pub fn build(rule: &AggregationRule) -> Result<Box<dyn Grouper>, GroupingError> {
        match rule.grouper.as_str() {
            "bgp_session" => Ok(Box::new(BgpSessionGrouper)),
            "circuit" => Ok(Box::new(CircuitGrouper)),
            "label" if rule.group_by.is_empty() => {
                Err(GroupingError::NoGroupLabels(rule.name.clone()))
            }
            "label" => Ok(Box::new(LabelGrouper::new(rule.group_by.clone()))),
            other => Err(GroupingError::UnknownGrouper(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn alert(id: i64, pairs: &[(&str, &str)]) -> Alert {
        let mut alert = Alert::new("test", format!("e{}", id), Utc::now());
        alert.id = id;
        alert.labels = pairs.iter().map(|(k, v)| (*k, *v)).collect();
        alert
    }

    fn ids(groups: &[Vec<Alert>]) -> Vec<Vec<i64>> {
        groups
            .iter()
            .map(|g| g.iter().map(|a| a.id).collect())
            .collect()
    }

    #[test]
    fn test_bgp_session_pairs_both_ends() {
        let alerts = vec![
            alert(1, &[("local", "dev1/if1"), ("remote", "dev2/if2")]),
            alert(2, &[("local", "dev2/if2"), ("remote", "dev1/if1")]),
            alert(3, &[("local", "dev3/if3"), ("remote", "dev4/if4")]),
        ];
        let groups = BgpSessionGrouper.do_grouping(alerts);
        assert_eq!(ids(&groups), vec![vec![1, 2], vec![3]]);
    }

    #[test]
    fn test_malformed_alerts_are_skipped() {
        let alerts = vec![
            alert(1, &[("local", "dev1/if1"), ("remote", "dev2/if2")]),
            alert(2, &[("local", "dev2/if2")]),
            alert(3, &[("local", "dev2/if2"), ("remote", "dev1/if1")]),
        ];
        let groups = BgpSessionGrouper.do_grouping(alerts);
        assert_eq!(ids(&groups), vec![vec![1, 3]]);
    }

    #[test]
    fn test_circuit_cross_match_and_id() {
        let alerts = vec![
            alert(1, &[("a_end", "r1:et-0/0/1"), ("z_end", "r2:et-0/0/9")]),
            alert(2, &[("a_end", "r2:et-0/0/9"), ("z_end", "r1:et-0/0/1")]),
            alert(3, &[("a_end", "r5:xe-1"), ("z_end", "r6:xe-2"), ("circuit_id", "C-100")]),
            alert(4, &[("a_end", "r7:xe-1"), ("z_end", "r8:xe-2"), ("circuit_id", "C-100")]),
            alert(5, &[("a_end", "r1:et-0/0/1"), ("z_end", "r3:et-0/0/2")]),
        ];
        let groups = CircuitGrouper.do_grouping(alerts);
        assert_eq!(ids(&groups), vec![vec![1, 2], vec![3, 4], vec![5]]);
    }

    #[test]
    fn test_label_grouper_uses_identity_labels() {
        let grouper = LabelGrouper::new(vec!["entity".to_string(), "site".to_string()]);
        let mut a = alert(1, &[("site", "ams")]);
        a.entity = "chassis".to_string();
        let mut b = alert(2, &[("site", "ams")]);
        b.entity = "chassis".to_string();
        let c = alert(3, &[("site", "ams")]);

        let groups = grouper.do_grouping(vec![a, b, c]);
        assert_eq!(ids(&groups), vec![vec![1, 2], vec![3]]);
    }

    #[test]
    fn test_incident_display() {
        let bgp = BgpSessionGrouper
            .extract(&alert(1, &[("local", "dev1/if1"), ("remote", "dev2/if2")]))
            .unwrap();
        assert_eq!(bgp.to_string(), "dev1/if1 <-> dev2/if2");
        assert_eq!(
            Incident::Circuit {
                id: Some("C-1".to_string()),
                a_end: "a".to_string(),
                z_end: "z".to_string()
            }
            .to_string(),
            "circuit C-1"
        );
    }

    #[test]
    fn test_registry() {
        let mut rule = AggregationRule {
            name: "bgp".to_string(),
            grouper: "bgp_session".to_string(),
            ..Default::default()
        };
        assert_eq!(GrouperRegistry::build(&rule).unwrap().name(), "bgp_session");

        rule.grouper = "label".to_string();
        assert!(matches!(
            GrouperRegistry::build(&rule),
            Err(GroupingError::NoGroupLabels(_))
        ));
        rule.group_by = vec!["device".to_string()];
        assert_eq!(GrouperRegistry::build(&rule).unwrap().name(), "label");

        rule.grouper = "ospf".to_string();
        assert!(matches!(
            GrouperRegistry::build(&rule),
            Err(GroupingError::UnknownGrouper(_))
        ));
    }
}
