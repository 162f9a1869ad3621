//! Suppression rules

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::labels::Labels;

/// How a rule's label predicates combine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchCondition {
    #[default]
    All,
    Any,
}

/// Label-match predicate that silences matching alerts for a bounded window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuppressionRule {
    /// Row id; rules sourced from static configuration carry negative ids
    pub id: i64,
    pub name: String,
    pub matches: Labels,
    pub condition: MatchCondition,
    pub created_at: DateTime<Utc>,
    pub duration: Duration,
    /// Static rules never expire
    pub dont_expire: bool,
    pub creator: String,
    pub reason: String,
}

impl SuppressionRule {
    pub fn new(
        name: impl Into<String>,
        matches: Labels,
        condition: MatchCondition,
        duration: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: 0,
            name: name.into(),
            matches,
            condition,
            created_at: now,
            duration,
            dont_expire: false,
            creator: String::new(),
            reason: String::new(),
        }
    }

    /// Remaining time to live; zero once elapsed. `None` for rules that never expire.
    pub fn time_left(&self, now: DateTime<Utc>) -> Option<Duration> {
        if self.dont_expire {
            return None;
        }
        let age = crate::elapsed(self.created_at, now);
        Some(self.duration.saturating_sub(age))
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.time_left(now).map_or(false, |left| left.is_zero())
    }

    /// Evaluate the predicate against `labels` under this rule's condition
    pub fn matches(&self, labels: &Labels) -> bool {
        match self.condition {
            MatchCondition::All => self.matches.matches_all(labels),
            MatchCondition::Any => self.matches.matches_any(labels),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn rule(condition: MatchCondition) -> SuppressionRule {
        let matches = [("device", "dev1"), ("entity", "et-0/0/[0-9]")]
            .into_iter()
            .collect();
        SuppressionRule::new("maint", matches, condition, Duration::from_secs(120), Utc::now())
    }

    #[test]
    fn test_time_left_and_expiry() {
        let r = rule(MatchCondition::All);
        let later = r.created_at + ChronoDuration::seconds(60);
        assert_eq!(r.time_left(later), Some(Duration::from_secs(60)));
        assert!(!r.is_expired(later));
        assert!(r.is_expired(r.created_at + ChronoDuration::seconds(120)));
    }

    #[test]
    fn test_dont_expire() {
        let mut r = rule(MatchCondition::All);
        r.dont_expire = true;
        assert_eq!(r.time_left(r.created_at + ChronoDuration::days(365)), None);
        assert!(!r.is_expired(r.created_at + ChronoDuration::days(365)));
    }

    #[test]
    fn test_condition_selects_match_mode() {
        let input: Labels = [("device", "dev1"), ("entity", "xe-1/0/0")].into_iter().collect();
        assert!(!rule(MatchCondition::All).matches(&input));
        assert!(rule(MatchCondition::Any).matches(&input));
    }
}
