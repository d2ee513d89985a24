//! Persisted per-endpoint counter state.
//!
//! Two scopes of the same record coexist: a global record keyed by
//! (method, path) shared across all identities, and a local record keyed by
//! (method, path, unique_id). Only local records accrue hits; both carry the
//! ignore suppressions.

use crate::clock::secs;
use crate::rule::Rule;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Mutable counter state for one endpoint scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointRecord {
    pub path: String,
    pub method: String,

    /// Timestamps of counted requests, oldest first.
    #[serde(default)]
    pub hits: Vec<DateTime<Utc>>,

    /// Remaining number of requests to suppress, decremented per suppression.
    #[serde(default)]
    pub ignore_times: Option<u32>,
    /// Suppress requests while this instant is still in the future.
    #[serde(default)]
    pub ignore_until: Option<DateTime<Utc>>,

    #[serde(default)]
    pub blocked_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub blocked_by_rule: Option<Rule>,
}

impl EndpointRecord {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            method: method.into(),
            hits: Vec::new(),
            ignore_times: None,
            ignore_until: None,
            blocked_at: None,
            blocked_by_rule: None,
        }
    }

    /// Whether a persisted block is still in force at `now`.
    pub fn is_blocked(&self, now: DateTime<Utc>) -> bool {
        match (&self.blocked_by_rule, self.blocked_at) {
            (Some(rule), Some(at)) => at + secs(rule.block_time()) > now,
            _ => false,
        }
    }

    /// Keep only the `max` most recent hits. A bound of zero keeps everything;
    /// it means no rule in the bundle constrains retention.
    pub(crate) fn trim_hits(&mut self, max: usize) {
        if max > 0 && self.hits.len() > max {
            let excess = self.hits.len() - max;
            self.hits.drain(..excess);
        }
    }

    /// Remove the hit recorded at exactly `at`, if still present.
    pub(crate) fn remove_hit(&mut self, at: DateTime<Utc>) -> bool {
        match self.hits.iter().position(|hit| *hit == at) {
            Some(index) => {
                self.hits.remove(index);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn at(seconds: i64) -> DateTime<Utc> {
        DateTime::<Utc>::UNIX_EPOCH + TimeDelta::seconds(seconds)
    }

    fn block_rule(block_time: f64) -> Rule {
        Rule::builder()
            .hits(3)
            .batch_time(10.0)
            .block_time(block_time)
            .build()
            .unwrap()
    }

    #[test]
    fn fresh_record_is_not_blocked() {
        let record = EndpointRecord::new("GET", "/hello");
        assert!(!record.is_blocked(at(0)));
    }

    #[test]
    fn block_expires_after_block_time() {
        let mut record = EndpointRecord::new("GET", "/hello");
        record.blocked_by_rule = Some(block_rule(60.0));
        record.blocked_at = Some(at(100));

        assert!(record.is_blocked(at(100)));
        assert!(record.is_blocked(at(159)));
        // Boundary: blocked_at + block_time must be strictly in the future.
        assert!(!record.is_blocked(at(160)));
        assert!(!record.is_blocked(at(300)));
    }

    #[test]
    fn lone_block_field_does_not_block() {
        let mut record = EndpointRecord::new("GET", "/hello");
        record.blocked_at = Some(at(100));
        assert!(!record.is_blocked(at(100)));

        let mut record = EndpointRecord::new("GET", "/hello");
        record.blocked_by_rule = Some(block_rule(60.0));
        assert!(!record.is_blocked(at(100)));
    }

    #[test]
    fn trim_keeps_most_recent() {
        let mut record = EndpointRecord::new("GET", "/hello");
        record.hits = vec![at(1), at(2), at(3), at(4)];
        record.trim_hits(2);
        assert_eq!(record.hits, vec![at(3), at(4)]);
    }

    #[test]
    fn trim_with_zero_bound_keeps_everything() {
        let mut record = EndpointRecord::new("GET", "/hello");
        record.hits = vec![at(1), at(2), at(3)];
        record.trim_hits(0);
        assert_eq!(record.hits.len(), 3);
    }

    #[test]
    fn remove_hit_targets_exact_timestamp() {
        let mut record = EndpointRecord::new("GET", "/hello");
        record.hits = vec![at(1), at(2), at(3)];
        assert!(record.remove_hit(at(2)));
        assert_eq!(record.hits, vec![at(1), at(3)]);
        assert!(!record.remove_hit(at(2)));
    }

    #[test]
    fn record_round_trips() {
        let mut record = EndpointRecord::new("POST", "/items");
        record.hits = vec![at(5), at(9), at(12)];
        record.ignore_times = Some(2);
        record.ignore_until = Some(at(50));
        record.blocked_at = Some(at(12));
        record.blocked_by_rule = Some(block_rule(60.0));

        let json = serde_json::to_string(&record).unwrap();
        let back: EndpointRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
        assert_eq!(back.hits, vec![at(5), at(9), at(12)]);
    }

    #[test]
    fn record_deserializes_from_bare_keys() {
        let back: EndpointRecord =
            serde_json::from_str(r#"{"path":"/hello","method":"GET"}"#).unwrap();
        assert_eq!(back, EndpointRecord::new("GET", "/hello"));
    }
}
