//! Label values and predicate matching

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::btree_map;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Mutex, OnceLock};
use tracing::{debug, warn};

/// Compiled patterns kept before the cache is reset
const PATTERN_CACHE_LIMIT: usize = 4096;

/// Compiled anchored patterns keyed by source; `None` marks a pattern that
/// failed to compile
type PatternCache = HashMap<String, Option<Regex>>;

fn pattern_cache() -> &'static Mutex<PatternCache> {
    static PATTERNS: OnceLock<Mutex<PatternCache>> = OnceLock::new();
    PATTERNS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Compile `pattern` anchored at both ends, reusing an earlier compilation
fn compiled(pattern: &str) -> Option<Regex> {
    let mut cache = pattern_cache().lock().unwrap_or_else(|e| e.into_inner());
    if let Some(entry) = cache.get(pattern) {
        return entry.clone();
    }
    if cache.len() >= PATTERN_CACHE_LIMIT {
        debug!("Label pattern cache full, resetting");
        cache.clear();
    }
    let entry = match Regex::new(&format!("^(?:{})$", pattern)) {
        Ok(re) => Some(re),
        Err(e) => {
            warn!("Invalid label pattern {:?}, comparing literally: {}", pattern, e);
            None
        }
    };
    cache.insert(pattern.to_string(), entry.clone());
    entry
}

/// A single label value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LabelValue {
    Str(String),
    Num(f64),
    Bool(bool),
}

impl LabelValue {
    /// Borrow the value as a string, if it is one
    pub fn as_str(&self) -> Option<&str> {
        match self {
            LabelValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Check whether `candidate` satisfies this value used as a predicate.
    ///
    /// String predicates are anchored regular expressions matched against the
    /// candidate's textual form, compiled once per distinct pattern. A predicate
    /// that fails to compile falls back to literal comparison. Numbers and
    /// booleans compare by value.
    pub fn matches(&self, candidate: &LabelValue) -> bool {
        match self {
            LabelValue::Str(pattern) => {
                let text = candidate.to_string();
                match compiled(pattern) {
                    Some(re) => re.is_match(&text),
                    None => *pattern == text,
                }
            }
            LabelValue::Num(n) => match candidate {
                LabelValue::Num(m) => n == m,
                other => other.to_string() == self.to_string(),
            },
            LabelValue::Bool(b) => match candidate {
                LabelValue::Bool(c) => b == c,
                other => other.to_string() == self.to_string(),
            },
        }
    }
}

impl fmt::Display for LabelValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LabelValue::Str(s) => f.write_str(s),
            LabelValue::Num(n) if n.fract() == 0.0 && n.is_finite() => write!(f, "{}", *n as i64),
            LabelValue::Num(n) => write!(f, "{}", n),
            LabelValue::Bool(b) => write!(f, "{}", b),
        }
    }
}

impl From<&str> for LabelValue {
    fn from(s: &str) -> Self {
        LabelValue::Str(s.to_string())
    }
}

impl From<String> for LabelValue {
    fn from(s: String) -> Self {
        LabelValue::Str(s)
    }
}

impl From<f64> for LabelValue {
    fn from(n: f64) -> Self {
        LabelValue::Num(n)
    }
}

impl From<i64> for LabelValue {
    fn from(n: i64) -> Self {
        LabelValue::Num(n as f64)
    }
}

impl From<bool> for LabelValue {
    fn from(b: bool) -> Self {
        LabelValue::Bool(b)
    }
}

/// String-keyed label map used for matching and grouping
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Labels(BTreeMap<String, LabelValue>);

impl Labels {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<LabelValue>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&LabelValue> {
        self.0.get(key)
    }

    /// Get a label only if it holds a string
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(LabelValue::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<LabelValue> {
        self.0.remove(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, LabelValue> {
        self.0.iter()
    }

    /// Copy every label of `other` into self, overwriting existing keys
    pub fn merge(&mut self, other: &Labels) {
        for (k, v) in other.iter() {
            self.0.insert(k.clone(), v.clone());
        }
    }

    /// True when every predicate in `self` is present in `input` and matches.
    /// An empty predicate set matches nothing.
    pub fn matches_all(&self, input: &Labels) -> bool {
        !self.is_empty()
            && self
                .iter()
                .all(|(k, v)| input.get(k).map_or(false, |candidate| v.matches(candidate)))
    }

    /// True when at least one predicate in `self` is present in `input` and matches
    pub fn matches_any(&self, input: &Labels) -> bool {
        self.iter()
            .any(|(k, v)| input.get(k).map_or(false, |candidate| v.matches(candidate)))
    }
}

impl<K: Into<String>, V: Into<LabelValue>> FromIterator<(K, V)> for Labels {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl<'a> IntoIterator for &'a Labels {
    type Item = (&'a String, &'a LabelValue);
    type IntoIter = btree_map::Iter<'a, String, LabelValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs.iter().map(|(k, v)| (*k, *v)).collect()
    }

    #[test]
    fn test_string_values_match_as_anchored_regex() {
        let pattern = LabelValue::from("dev[0-9]+");
        assert!(pattern.matches(&LabelValue::from("dev12")));
        assert!(!pattern.matches(&LabelValue::from("xdev12")));
        assert!(!pattern.matches(&LabelValue::from("dev12x")));
    }

    #[test]
    fn test_invalid_pattern_compares_literally() {
        let pattern = LabelValue::from("dev[");
        assert!(pattern.matches(&LabelValue::from("dev[")));
        assert!(!pattern.matches(&LabelValue::from("dev1")));
    }

    #[test]
    fn test_patterns_are_compiled_once() {
        let pattern = LabelValue::from("cache-test-[a-z]+");
        assert!(pattern.matches(&LabelValue::from("cache-test-abc")));
        assert!(!pattern.matches(&LabelValue::from("cache-test-1")));

        let cache = pattern_cache().lock().unwrap();
        assert!(matches!(cache.get("cache-test-[a-z]+"), Some(Some(_))));
        drop(cache);

        assert!(compiled("cache-test-[").is_none());
        assert!(matches!(
            pattern_cache().lock().unwrap().get("cache-test-["),
            Some(None)
        ));
    }

    #[test]
    fn test_number_and_bool_values() {
        assert!(LabelValue::from(3i64).matches(&LabelValue::Num(3.0)));
        assert!(LabelValue::from(3i64).matches(&LabelValue::from("3")));
        assert!(LabelValue::from(true).matches(&LabelValue::Bool(true)));
        assert!(!LabelValue::from(true).matches(&LabelValue::Bool(false)));
        // string predicates see numbers through their textual form
        assert!(LabelValue::from("4[0-9]").matches(&LabelValue::Num(42.0)));
    }

    #[test]
    fn test_match_all_and_any() {
        let rule = labels(&[("device", "dev1"), ("entity", "if.*")]);
        assert!(rule.matches_all(&labels(&[("device", "dev1"), ("entity", "if1"), ("x", "y")])));
        assert!(!rule.matches_all(&labels(&[("device", "dev1")])));
        assert!(rule.matches_any(&labels(&[("device", "dev1")])));
        assert!(!rule.matches_any(&labels(&[("device", "dev2")])));
        assert!(!Labels::new().matches_all(&labels(&[("device", "dev1")])));
    }

    #[test]
    fn test_untagged_serde() {
        let parsed: Labels =
            serde_json::from_str(r#"{"a": "x", "b": 2, "c": true}"#).unwrap();
        assert_eq!(parsed.get("a"), Some(&LabelValue::from("x")));
        assert_eq!(parsed.get("b"), Some(&LabelValue::Num(2.0)));
        assert_eq!(parsed.get("c"), Some(&LabelValue::Bool(true)));
        assert_eq!(parsed.get("b").unwrap().to_string(), "2");
    }

    proptest! {
        #[test]
        fn prop_all_implies_any(
            keys in proptest::collection::btree_map("[a-c]", "[a-z]{1,4}", 1..4),
            extra in proptest::collection::btree_map("[a-e]", "[a-z]{1,4}", 0..5),
        ) {
            let rule: Labels = keys.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            let input: Labels = extra.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            if rule.matches_all(&input) {
                prop_assert!(rule.matches_any(&input));
            }
        }

        #[test]
        fn prop_literal_labels_match_themselves(
            keys in proptest::collection::btree_map("[a-z]{1,6}", "[a-z0-9]{1,8}", 1..5),
        ) {
            let rule: Labels = keys.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            prop_assert!(rule.matches_all(&rule));
        }
    }
}
