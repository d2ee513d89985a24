//! Limiting rules and the rank ladder they are organized into.
//!
//! A [`Rule`] is either a sliding-window rule (`hits` within `batch_time`) or
//! a delay rule (minimum gap between consecutive requests). The two forms are
//! mutually exclusive; [`RuleBuilder::build`] rejects every other combination
//! up front so misconfigured policies fail at startup, not under load.

use crate::config::DEFAULT_BLOCK_TIME;
use serde::{Deserialize, Serialize};

/// Validation failure raised while building a [`Rule`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuleError {
    #[error("either `delay` or both `hits` and `batch_time` must be set")]
    MissingWindow,
    #[error("`hits` and `batch_time` must be set together")]
    IncompleteWindow,
    #[error("`delay` cannot be combined with `hits` or `batch_time`")]
    WindowConflict,
    #[error("`{0}` must be greater than zero")]
    NonPositive(&'static str),
    #[error("`affected_group` cannot be an empty list")]
    EmptyGroupList,
}

/// Which identity groups a rule applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GroupSelector {
    One(String),
    Many(Vec<String>),
}

impl GroupSelector {
    fn matches(&self, group: &str) -> bool {
        match self {
            GroupSelector::One(name) => name == group,
            GroupSelector::Many(names) => names.iter().any(|name| name == group),
        }
    }
}

impl From<&str> for GroupSelector {
    fn from(name: &str) -> Self {
        GroupSelector::One(name.to_owned())
    }
}

impl From<String> for GroupSelector {
    fn from(name: String) -> Self {
        GroupSelector::One(name)
    }
}

impl From<Vec<String>> for GroupSelector {
    fn from(names: Vec<String>) -> Self {
        GroupSelector::Many(names)
    }
}

impl From<Vec<&str>> for GroupSelector {
    fn from(names: Vec<&str>) -> Self {
        GroupSelector::Many(names.into_iter().map(str::to_owned).collect())
    }
}

fn default_true() -> bool {
    true
}

fn default_block_time() -> f64 {
    DEFAULT_BLOCK_TIME
}

/// An immutable limiting policy.
///
/// Durations are fractional seconds. Rules survive serialization because a
/// triggered rule is embedded in the endpoint record that it blocked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    hits: Option<u32>,
    batch_time: Option<f64>,
    delay: Option<f64>,
    #[serde(default = "default_block_time")]
    block_time: f64,
    #[serde(default = "default_true")]
    increase_rank: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    affected_group: Option<GroupSelector>,
}

impl Rule {
    pub fn builder() -> RuleBuilder {
        RuleBuilder::default()
    }

    /// Max requests allowed within `batch_time`, for sliding-window rules.
    pub fn hits(&self) -> Option<u32> {
        self.hits
    }

    /// Sliding window width in seconds.
    pub fn batch_time(&self) -> Option<f64> {
        self.batch_time
    }

    /// Minimum gap between consecutive requests in seconds, for delay rules.
    pub fn delay(&self) -> Option<f64> {
        self.delay
    }

    /// How long a triggered block persists, in seconds.
    pub fn block_time(&self) -> f64 {
        self.block_time
    }

    /// Whether triggering this rule escalates the identity's rank.
    pub fn increase_rank(&self) -> bool {
        self.increase_rank
    }

    /// Client-facing message attached to rejections.
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Client-facing reason overriding the reason builder on block rejections.
    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    pub fn affected_group(&self) -> Option<&GroupSelector> {
        self.affected_group.as_ref()
    }

    /// Whether this rule applies to an identity in `group`.
    pub fn applies_to(&self, group: &str) -> bool {
        match &self.affected_group {
            None => true,
            Some(selector) => selector.matches(group),
        }
    }

    /// The one-shot rule written by a post-handler limit intent.
    pub(crate) fn synthetic(
        block_time: f64,
        message: Option<String>,
        reason: Option<String>,
    ) -> Self {
        Self {
            hits: Some(1),
            batch_time: Some(1.0),
            delay: None,
            block_time,
            increase_rank: true,
            message,
            reason,
            affected_group: None,
        }
    }
}

/// Builder for [`Rule`]; `build` performs the full validation pass.
#[derive(Debug, Clone, Default)]
pub struct RuleBuilder {
    hits: Option<u32>,
    batch_time: Option<f64>,
    delay: Option<f64>,
    block_time: Option<f64>,
    increase_rank: Option<bool>,
    message: Option<String>,
    reason: Option<String>,
    affected_group: Option<GroupSelector>,
}

impl RuleBuilder {
    pub fn hits(mut self, hits: u32) -> Self {
        self.hits = Some(hits);
        self
    }

    pub fn batch_time(mut self, seconds: f64) -> Self {
        self.batch_time = Some(seconds);
        self
    }

    pub fn delay(mut self, seconds: f64) -> Self {
        self.delay = Some(seconds);
        self
    }

    pub fn block_time(mut self, seconds: f64) -> Self {
        self.block_time = Some(seconds);
        self
    }

    pub fn increase_rank(mut self, increase: bool) -> Self {
        self.increase_rank = Some(increase);
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn affected_group(mut self, selector: impl Into<GroupSelector>) -> Self {
        self.affected_group = Some(selector.into());
        self
    }

    pub fn build(self) -> Result<Rule, RuleError> {
        if self.hits.is_none() && self.batch_time.is_none() && self.delay.is_none() {
            return Err(RuleError::MissingWindow);
        }

        if self.hits.is_some() != self.batch_time.is_some() {
            return Err(RuleError::IncompleteWindow);
        }

        if self.delay.is_some() && (self.hits.is_some() || self.batch_time.is_some()) {
            return Err(RuleError::WindowConflict);
        }

        if let Some(delay) = self.delay
            && delay <= 0.0
        {
            return Err(RuleError::NonPositive("delay"));
        }

        if self.hits == Some(0) {
            return Err(RuleError::NonPositive("hits"));
        }

        if let Some(batch_time) = self.batch_time
            && batch_time <= 0.0
        {
            return Err(RuleError::NonPositive("batch_time"));
        }

        let block_time = self.block_time.unwrap_or(DEFAULT_BLOCK_TIME);
        if block_time <= 0.0 {
            return Err(RuleError::NonPositive("block_time"));
        }

        if let Some(GroupSelector::Many(names)) = &self.affected_group
            && names.is_empty()
        {
            return Err(RuleError::EmptyGroupList);
        }

        Ok(Rule {
            hits: self.hits,
            batch_time: self.batch_time,
            delay: self.delay,
            block_time,
            increase_rank: self.increase_rank.unwrap_or(true),
            message: self.message,
            reason: self.reason,
            affected_group: self.affected_group,
        })
    }
}

/// Ordered rule bundles; element `i` applies to identities at rank `i`.
///
/// Ranks past the end saturate onto the last bundle, so a ladder never runs
/// out of rules for heavily escalated identities.
#[derive(Debug, Clone, Default)]
pub struct RankSet {
    bundles: Vec<Vec<Rule>>,
}

impl RankSet {
    pub fn new(bundles: Vec<Vec<Rule>>) -> Self {
        Self { bundles }
    }

    /// A single-rank ladder.
    pub fn single(rules: Vec<Rule>) -> Self {
        Self {
            bundles: vec![rules],
        }
    }

    pub fn len(&self) -> usize {
        self.bundles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bundles.is_empty()
    }

    /// The bundle applying at `rank`, saturating at the last one.
    pub fn bundle_for(&self, rank: u32) -> &[Rule] {
        if self.bundles.is_empty() {
            return &[];
        }
        let index = (rank as usize).min(self.bundles.len() - 1);
        &self.bundles[index]
    }
}

impl From<Rule> for RankSet {
    fn from(rule: Rule) -> Self {
        RankSet::single(vec![rule])
    }
}

impl From<Vec<Rule>> for RankSet {
    fn from(rules: Vec<Rule>) -> Self {
        RankSet::single(rules)
    }
}

impl From<Vec<Vec<Rule>>> for RankSet {
    fn from(bundles: Vec<Vec<Rule>>) -> Self {
        RankSet::new(bundles)
    }
}

/// Upper bound on retained hit timestamps for a bundle: the largest `hits`
/// across window rules, or 2 where a delay rule needs the last pair.
pub(crate) fn max_hits(rules: &[Rule]) -> usize {
    rules
        .iter()
        .map(|rule| {
            if rule.delay.is_some() {
                2
            } else {
                rule.hits.unwrap_or(0) as usize
            }
        })
        .max()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window_rule(hits: u32, batch_time: f64) -> Rule {
        Rule::builder()
            .hits(hits)
            .batch_time(batch_time)
            .build()
            .unwrap()
    }

    #[test]
    fn window_rule_builds() {
        let rule = Rule::builder()
            .hits(3)
            .batch_time(10.0)
            .block_time(60.0)
            .build()
            .unwrap();
        assert_eq!(rule.hits(), Some(3));
        assert_eq!(rule.batch_time(), Some(10.0));
        assert_eq!(rule.delay(), None);
        assert_eq!(rule.block_time(), 60.0);
        assert!(rule.increase_rank());
    }

    #[test]
    fn delay_rule_builds() {
        let rule = Rule::builder().delay(1.5).build().unwrap();
        assert_eq!(rule.delay(), Some(1.5));
        assert_eq!(rule.hits(), None);
        assert_eq!(rule.block_time(), DEFAULT_BLOCK_TIME);
    }

    #[test]
    fn empty_rule_rejected() {
        assert_eq!(Rule::builder().build(), Err(RuleError::MissingWindow));
    }

    #[test]
    fn half_window_rejected() {
        assert_eq!(
            Rule::builder().hits(3).build(),
            Err(RuleError::IncompleteWindow)
        );
        assert_eq!(
            Rule::builder().batch_time(10.0).build(),
            Err(RuleError::IncompleteWindow)
        );
    }

    #[test]
    fn delay_and_window_rejected() {
        assert_eq!(
            Rule::builder().delay(1.0).hits(3).batch_time(10.0).build(),
            Err(RuleError::WindowConflict)
        );
    }

    #[test]
    fn non_positive_numerics_rejected() {
        assert_eq!(
            Rule::builder().delay(0.0).build(),
            Err(RuleError::NonPositive("delay"))
        );
        assert_eq!(
            Rule::builder().hits(0).batch_time(10.0).build(),
            Err(RuleError::NonPositive("hits"))
        );
        assert_eq!(
            Rule::builder().hits(3).batch_time(-1.0).build(),
            Err(RuleError::NonPositive("batch_time"))
        );
        assert_eq!(
            Rule::builder().delay(1.0).block_time(0.0).build(),
            Err(RuleError::NonPositive("block_time"))
        );
    }

    #[test]
    fn empty_group_list_rejected() {
        assert_eq!(
            Rule::builder()
                .delay(1.0)
                .affected_group(Vec::<String>::new())
                .build(),
            Err(RuleError::EmptyGroupList)
        );
    }

    #[test]
    fn group_matching() {
        let all = window_rule(3, 10.0);
        assert!(all.applies_to("default"));

        let one = Rule::builder()
            .hits(3)
            .batch_time(10.0)
            .affected_group("admin")
            .build()
            .unwrap();
        assert!(one.applies_to("admin"));
        assert!(!one.applies_to("default"));

        let many = Rule::builder()
            .delay(1.0)
            .affected_group(vec!["admin", "staff"])
            .build()
            .unwrap();
        assert!(many.applies_to("staff"));
        assert!(!many.applies_to("default"));
    }

    #[test]
    fn rule_round_trips() {
        let rule = Rule::builder()
            .hits(5)
            .batch_time(30.0)
            .block_time(120.0)
            .increase_rank(false)
            .message("slow down")
            .reason("burst")
            .affected_group(vec!["a", "b"])
            .build()
            .unwrap();
        let json = serde_json::to_string(&rule).unwrap();
        let back: Rule = serde_json::from_str(&json).unwrap();
        assert_eq!(back, rule);
    }

    #[test]
    fn rule_deserializes_with_defaults() {
        let rule: Rule =
            serde_json::from_str(r#"{"hits":1,"batch_time":1.0,"delay":null,"block_time":20.0}"#)
                .unwrap();
        assert!(rule.increase_rank());
        assert_eq!(rule.message(), None);
        assert_eq!(rule.affected_group(), None);
    }

    #[test]
    fn bundle_saturates_past_last_rank() {
        let ranks = RankSet::new(vec![vec![window_rule(3, 10.0)], vec![window_rule(1, 10.0)]]);
        assert_eq!(ranks.bundle_for(0)[0].hits(), Some(3));
        assert_eq!(ranks.bundle_for(1)[0].hits(), Some(1));
        assert_eq!(ranks.bundle_for(7)[0].hits(), Some(1));
        assert!(RankSet::default().bundle_for(3).is_empty());
    }

    #[test]
    fn max_hits_bounds_retention() {
        assert_eq!(max_hits(&[]), 0);
        assert_eq!(max_hits(&[window_rule(5, 10.0)]), 5);
        assert_eq!(
            max_hits(&[Rule::builder().delay(1.0).build().unwrap()]),
            2
        );
        assert_eq!(
            max_hits(&[
                window_rule(3, 10.0),
                Rule::builder().delay(1.0).build().unwrap(),
                window_rule(8, 60.0),
            ]),
            8
        );
    }
}
