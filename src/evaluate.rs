//! Pure rule evaluation over a pair of endpoint records.
//!
//! The evaluator never touches the store or the clock; the engine appends the
//! current hit before calling in, so a window rule with `hits = N` fires on
//! the N-th counted request inside its window.

use crate::clock::secs;
use crate::endpoint::EndpointRecord;
use crate::rule::Rule;
use chrono::{DateTime, Utc};

/// Which record a suppression was found on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Scope {
    Global,
    Identity,
}

/// Result of evaluating one request against a rule bundle.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Outcome {
    /// The first rule whose threshold the request crossed.
    Exceeded(Rule),
    /// A count-based suppression is active; the hit must not be counted.
    IgnoreByCount(Scope),
    /// A time-based suppression is active; the hit must not be counted.
    IgnoreByTime(Scope),
    /// No violation.
    Clear,
}

/// Evaluate `rules` for an identity in `group`, with the request at `now`
/// already appended to `local.hits`.
///
/// Suppressions short-circuit rule matching; count-based ones are checked
/// before time-based ones, and the global record before the local one.
pub(crate) fn evaluate(
    rules: &[Rule],
    global: &EndpointRecord,
    local: &EndpointRecord,
    group: &str,
    now: DateTime<Utc>,
) -> Outcome {
    if global.ignore_times.is_some_and(|times| times > 0) {
        return Outcome::IgnoreByCount(Scope::Global);
    } else if local.ignore_times.is_some_and(|times| times > 0) {
        return Outcome::IgnoreByCount(Scope::Identity);
    }

    if global.ignore_until.is_some_and(|until| until >= now) {
        return Outcome::IgnoreByTime(Scope::Global);
    } else if local.ignore_until.is_some_and(|until| until >= now) {
        return Outcome::IgnoreByTime(Scope::Identity);
    }

    for rule in rules.iter().filter(|rule| rule.applies_to(group)) {
        if let (Some(hits), Some(batch_time)) = (rule.hits(), rule.batch_time()) {
            let window_start = now - secs(batch_time);
            let in_window = local
                .hits
                .iter()
                .filter(|hit| **hit >= window_start)
                .count();
            if in_window >= hits as usize {
                return Outcome::Exceeded(rule.clone());
            }
        }

        if let Some(delay) = rule.delay()
            && let [.., previous, last] = local.hits.as_slice()
            && *last - *previous < secs(delay)
        {
            return Outcome::Exceeded(rule.clone());
        }
    }

    Outcome::Clear
}
