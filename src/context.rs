//! In-handler mutation API for the current rate-limit decision.
//!
//! The middleware binds a [`RatelimitContext`] into a tokio task-local slot
//! around the wrapped handler, so handlers reach it without threading an
//! argument -- either via [`RatelimitContext::current`] or the [`RatelimitCtx`]
//! extractor. Handlers record *intents*; the engine applies them after the
//! handler returns, in the order ignore -> rank -> limit.

use crate::identity::Identity;
use crate::rule::Rule;
use axum::extract::FromRequestParts;
use axum::http::StatusCode;
use http::request::Parts;
use std::future::Future;
use std::sync::{Arc, Mutex};

/// Which record an ignore intent targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreLevel {
    /// The global endpoint record, shared by every identity.
    Global,
    /// The per-identity endpoint record.
    Identity,
}

/// Deferred suppression of future (and optionally the current) hits.
#[derive(Debug, Clone, PartialEq)]
pub struct IgnoreIntent {
    pub level: IgnoreLevel,
    pub times: Option<u32>,
    pub seconds: Option<f64>,
    pub count_this: bool,
}

/// Deferred rank adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RankIntent {
    Reset,
    IncreaseBy(i32),
}

/// Deferred block on future requests from this identity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LimitIntent {
    pub for_seconds: Option<f64>,
    pub message: Option<String>,
    pub reason: Option<String>,
}

/// Snapshot of the intents a handler recorded; at most one of each kind.
#[derive(Debug, Clone, Default)]
pub struct ContextData {
    pub ignore: Option<IgnoreIntent>,
    pub rank: Option<RankIntent>,
    pub limit: Option<LimitIntent>,
}

/// Per-request handle the handler uses to adjust the engine's decision.
///
/// Later calls of the same intent kind overwrite earlier ones.
#[derive(Debug)]
pub struct RatelimitContext {
    rule: Option<Rule>,
    identity: Identity,
    data: Mutex<ContextData>,
}

tokio::task_local! {
    static CURRENT: Arc<RatelimitContext>;
}

/// Run `future` with `ctx` bound as the ambient context.
pub(crate) async fn with_context<F: Future>(ctx: Arc<RatelimitContext>, future: F) -> F::Output {
    CURRENT.scope(ctx, future).await
}

impl RatelimitContext {
    pub(crate) fn new(rule: Option<Rule>, identity: Identity) -> Self {
        Self {
            rule,
            identity,
            data: Mutex::new(ContextData::default()),
        }
    }

    /// The context bound to the current task, if the request went through the
    /// rate-limit middleware.
    pub fn current() -> Option<Arc<Self>> {
        CURRENT.try_with(Arc::clone).ok()
    }

    /// The rule this request exceeded, if any.
    pub fn rule(&self) -> Option<&Rule> {
        self.rule.as_ref()
    }

    /// Copy of the identity the engine resolved for this request.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Snapshot of the recorded intents.
    pub fn data(&self) -> ContextData {
        self.data.lock().expect("ratelimit context poisoned").clone()
    }

    /// Do not count the current request against this identity.
    pub fn ignore_hit(&self) {
        self.ignore_user(None, Some(1), true);
    }

    /// Suppress counting for this identity on this endpoint, for a number of
    /// requests and/or a time span. `count_this` also uncounts the current
    /// request.
    pub fn ignore_user(&self, for_seconds: Option<f64>, for_times: Option<u32>, count_this: bool) {
        self.set_ignore(IgnoreIntent {
            level: IgnoreLevel::Identity,
            times: for_times,
            seconds: for_seconds,
            count_this,
        });
    }

    /// Suppress counting for every identity on this endpoint. When the current
    /// request is uncounted it is treated as one of the `for_times` ignores.
    pub fn ignore_all_users(
        &self,
        for_seconds: Option<f64>,
        for_times: Option<u32>,
        count_this: bool,
    ) {
        let times = match for_times {
            Some(times) if count_this => Some(times.saturating_sub(1)),
            other => other,
        };
        self.set_ignore(IgnoreIntent {
            level: IgnoreLevel::Global,
            times,
            seconds: for_seconds,
            count_this,
        });
    }

    /// Drop this identity's rank back to the first bundle.
    pub fn reset_rank(&self) {
        self.data.lock().expect("ratelimit context poisoned").rank = Some(RankIntent::Reset);
    }

    /// Shift this identity's rank by `by` (may be negative; floors at 0, with
    /// no upper bound -- unlike the automatic promotion on rule violations).
    pub fn increase_rank(&self, by: i32) {
        self.data.lock().expect("ratelimit context poisoned").rank =
            Some(RankIntent::IncreaseBy(by));
    }

    /// Block *future* requests from this identity on this endpoint. The
    /// current request still completes normally. Without `for_seconds` the
    /// block lasts the first bundle rule's `block_time`, or the engine
    /// default when the bundle is empty.
    pub fn limit(&self, for_seconds: Option<f64>, message: Option<&str>, reason: Option<&str>) {
        self.data.lock().expect("ratelimit context poisoned").limit = Some(LimitIntent {
            for_seconds,
            message: message.map(str::to_owned),
            reason: reason.map(str::to_owned),
        });
    }

    fn set_ignore(&self, intent: IgnoreIntent) {
        self.data.lock().expect("ratelimit context poisoned").ignore = Some(intent);
    }
}

/// Axum extractor for the ambient [`RatelimitContext`].
///
/// Rejects with a 500 when the route is not wrapped by the rate-limit
/// middleware.
#[derive(Debug, Clone)]
pub struct RatelimitCtx(pub Arc<RatelimitContext>);

impl<S: Send + Sync> FromRequestParts<S> for RatelimitCtx {
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(_parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        RatelimitContext::current().map(Self).ok_or((
            StatusCode::INTERNAL_SERVER_ERROR,
            "ratelimit context is not set for this request",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> RatelimitContext {
        RatelimitContext::new(None, Identity::new("u1", "default"))
    }

    #[test]
    fn intents_start_empty() {
        let ctx = ctx();
        let data = ctx.data();
        assert!(data.ignore.is_none());
        assert!(data.rank.is_none());
        assert!(data.limit.is_none());
    }

    #[test]
    fn ignore_hit_is_single_counted_identity_ignore() {
        let ctx = ctx();
        ctx.ignore_hit();
        assert_eq!(
            ctx.data().ignore,
            Some(IgnoreIntent {
                level: IgnoreLevel::Identity,
                times: Some(1),
                seconds: None,
                count_this: true,
            })
        );
    }

    #[test]
    fn ignore_all_users_counts_the_current_request() {
        let ctx = ctx();
        ctx.ignore_all_users(None, Some(3), true);
        assert_eq!(
            ctx.data().ignore,
            Some(IgnoreIntent {
                level: IgnoreLevel::Global,
                times: Some(2),
                seconds: None,
                count_this: true,
            })
        );

        ctx.ignore_all_users(Some(60.0), Some(3), false);
        assert_eq!(
            ctx.data().ignore,
            Some(IgnoreIntent {
                level: IgnoreLevel::Global,
                times: Some(3),
                seconds: Some(60.0),
                count_this: false,
            })
        );
    }

    #[test]
    fn rank_intents_overwrite() {
        let ctx = ctx();
        ctx.increase_rank(4);
        assert_eq!(ctx.data().rank, Some(RankIntent::IncreaseBy(4)));
        ctx.reset_rank();
        assert_eq!(ctx.data().rank, Some(RankIntent::Reset));
    }

    #[test]
    fn limit_records_overrides() {
        let ctx = ctx();
        ctx.limit(Some(20.0), Some("blocked"), Some("fortune"));
        let limit = ctx.data().limit.unwrap();
        assert_eq!(limit.for_seconds, Some(20.0));
        assert_eq!(limit.message.as_deref(), Some("blocked"));
        assert_eq!(limit.reason.as_deref(), Some("fortune"));
    }

    #[tokio::test]
    async fn current_is_scoped_to_the_task() {
        assert!(RatelimitContext::current().is_none());

        let ctx = Arc::new(RatelimitContext::new(
            None,
            Identity::new("u1", "default"),
        ));
        let seen = with_context(ctx.clone(), async {
            let current = RatelimitContext::current().expect("context bound");
            current.identity().unique_id.clone()
        })
        .await;
        assert_eq!(seen, "u1");

        assert!(RatelimitContext::current().is_none());
    }
}
