//! Engine-wide defaults and the reason builder hook.

use crate::rule::Rule;
use std::sync::Arc;
use std::time::Duration;

/// Fallback `block_time` (seconds) for synthetic rules created by
/// [`RatelimitContext::limit`](crate::context::RatelimitContext::limit).
pub const DEFAULT_BLOCK_TIME: f64 = 300.0;

/// TTL applied when persisting the global endpoint record.
pub const ENDPOINT_TTL: Duration = Duration::from_secs(3600);

/// TTL applied when persisting an identity in the ranking store.
pub const USER_TTL: Duration = Duration::from_secs(3600);

/// TTL applied when persisting a per-identity endpoint record.
pub const USER_ENDPOINT_TTL: Duration = Duration::from_secs(3600);

/// Builds the human-readable `reason` string for a rejection.
pub type ReasonBuilder = Arc<dyn Fn(&Rule) -> String + Send + Sync>;

/// Default reason text, keyed off the kind of rule that fired.
pub fn default_reason_builder(rule: &Rule) -> String {
    if rule.delay().is_some() {
        "Delay between requests exceeded".to_owned()
    } else {
        "Max hits per time exceeded".to_owned()
    }
}
