//! The decision engine: per-request load -> evaluate -> persist -> hand off ->
//! apply intents -> persist.
//!
//! An [`Engine`] is built once at startup and shared behind an `Arc`; all of
//! its configuration is immutable afterwards. Concurrent requests from the
//! same identity race on the store with last-writer-wins semantics -- a minor
//! under-count under contention is accepted, the store is the only
//! coordination point.

use crate::auth::{AuthFn, Authenticate};
use crate::clock::{Clock, SystemClock, secs};
use crate::config::{
    self, DEFAULT_BLOCK_TIME, ENDPOINT_TTL, ReasonBuilder, USER_ENDPOINT_TTL, USER_TTL,
};
use crate::context::{IgnoreLevel, RankIntent, RatelimitContext};
use crate::endpoint::EndpointRecord;
use crate::error::{Error, LimitedError};
use crate::evaluate::{Outcome, Scope, evaluate};
use crate::identity::Identity;
use crate::middleware::RatelimitLayer;
use crate::rule::{RankSet, Rule, max_hits};
use crate::store::{RankingStore, Store};
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use http::request::Parts;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Per-site (per rate-limited route) options.
#[derive(Clone)]
pub struct SiteOptions {
    /// The rule ladder; the identity's rank selects the active bundle.
    pub ranks: RankSet,
    /// When a delay rule fires, reject the request but do not persist a
    /// block -- otherwise the delay would re-trigger on every retry.
    pub no_block_delay: bool,
    /// Key records by the route template instead of the concrete URL path.
    pub use_raw_path: bool,
    /// Per-site override of the engine-wide `no_hit_on_status` set.
    pub no_hit_on_status: Option<Vec<StatusCode>>,
}

impl SiteOptions {
    pub fn new(ranks: impl Into<RankSet>) -> Self {
        Self {
            ranks: ranks.into(),
            no_block_delay: true,
            use_raw_path: false,
            no_hit_on_status: None,
        }
    }
}

/// Engine state for one admitted request, carried across the handler.
#[derive(Debug)]
pub struct Admission {
    now: DateTime<Utc>,
    identity: Identity,
    global: EndpointRecord,
    local: EndpointRecord,
    rule: Option<Rule>,
    bundle: Vec<Rule>,
}

impl Admission {
    /// The rule this request exceeded, if any.
    pub fn rule(&self) -> Option<&Rule> {
        self.rule.as_ref()
    }

    /// The identity the engine resolved for this request.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }
}

/// Missing configuration detected at build time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SetupError {
    #[error("no store configured")]
    MissingStore,
    #[error("no ranking store configured")]
    MissingRanking,
    #[error("no authenticate hook configured")]
    MissingAuthenticate,
}

/// Builder for [`Engine`]. Store, ranking store and authenticate hook are
/// mandatory; everything else has defaults.
pub struct EngineBuilder {
    store: Option<Arc<dyn Store>>,
    ranking: Option<Arc<dyn RankingStore>>,
    auth: Option<Arc<dyn Authenticate>>,
    reason_builder: ReasonBuilder,
    default_block_time: f64,
    endpoint_ttl: Duration,
    user_ttl: Duration,
    user_endpoint_ttl: Duration,
    no_hit_on_status: Vec<StatusCode>,
    clock: Arc<dyn Clock>,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self {
            store: None,
            ranking: None,
            auth: None,
            reason_builder: Arc::new(config::default_reason_builder),
            default_block_time: DEFAULT_BLOCK_TIME,
            endpoint_ttl: ENDPOINT_TTL,
            user_ttl: USER_TTL,
            user_endpoint_ttl: USER_ENDPOINT_TTL,
            no_hit_on_status: Vec::new(),
            clock: Arc::new(SystemClock),
        }
    }
}

impl EngineBuilder {
    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn ranking(mut self, ranking: Arc<dyn RankingStore>) -> Self {
        self.ranking = Some(ranking);
        self
    }

    pub fn authenticate(mut self, auth: Arc<dyn Authenticate>) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Sugar for a synchronous extraction closure.
    pub fn authenticate_fn<F>(self, f: F) -> Self
    where
        F: Fn(&Parts) -> anyhow::Result<Identity> + Send + Sync + 'static,
    {
        self.authenticate(Arc::new(AuthFn(f)))
    }

    pub fn reason_builder<F>(mut self, f: F) -> Self
    where
        F: Fn(&Rule) -> String + Send + Sync + 'static,
    {
        self.reason_builder = Arc::new(f);
        self
    }

    /// Fallback `block_time` (seconds) for synthetic limit rules.
    pub fn default_block_time(mut self, seconds: f64) -> Self {
        self.default_block_time = seconds;
        self
    }

    pub fn endpoint_ttl(mut self, ttl: Duration) -> Self {
        self.endpoint_ttl = ttl;
        self
    }

    pub fn user_ttl(mut self, ttl: Duration) -> Self {
        self.user_ttl = ttl;
        self
    }

    pub fn user_endpoint_ttl(mut self, ttl: Duration) -> Self {
        self.user_endpoint_ttl = ttl;
        self
    }

    /// Response statuses for which the current request's hit is removed
    /// after the handler runs.
    pub fn no_hit_on_status(mut self, statuses: impl IntoIterator<Item = StatusCode>) -> Self {
        self.no_hit_on_status = statuses.into_iter().collect();
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> Result<Engine, SetupError> {
        Ok(Engine {
            store: self.store.ok_or(SetupError::MissingStore)?,
            ranking: self.ranking.ok_or(SetupError::MissingRanking)?,
            auth: self.auth.ok_or(SetupError::MissingAuthenticate)?,
            reason_builder: self.reason_builder,
            default_block_time: self.default_block_time,
            endpoint_ttl: self.endpoint_ttl,
            user_ttl: self.user_ttl,
            user_endpoint_ttl: self.user_endpoint_ttl,
            no_hit_on_status: self.no_hit_on_status,
            clock: self.clock,
        })
    }
}

/// The rate-limit decision engine.
pub struct Engine {
    store: Arc<dyn Store>,
    ranking: Arc<dyn RankingStore>,
    auth: Arc<dyn Authenticate>,
    reason_builder: ReasonBuilder,
    default_block_time: f64,
    endpoint_ttl: Duration,
    user_ttl: Duration,
    user_endpoint_ttl: Duration,
    no_hit_on_status: Vec<StatusCode>,
    clock: Arc<dyn Clock>,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    /// A middleware layer for one rate-limited site with default options.
    pub fn layer(self: Arc<Self>, ranks: impl Into<RankSet>) -> RatelimitLayer {
        RatelimitLayer::new(self, ranks)
    }

    /// Resolve the identity candidate for a request.
    pub async fn authenticate(&self, parts: &Parts) -> Result<Identity, Error> {
        self.auth.authenticate(parts).await.map_err(Error::Auth)
    }

    /// Pre-handler half of the request flow: load state, reject already
    /// blocked identities, count the hit, evaluate the active bundle, apply
    /// promotions/blocks/suppressions, and persist.
    ///
    /// Delay rules reject immediately; a window rule that fires lets the
    /// crossing request through and blocks from the next request on.
    pub async fn admit(
        &self,
        method: &str,
        path: &str,
        candidate: Identity,
        site: &SiteOptions,
    ) -> Result<Admission, Error> {
        let now = self.clock.now();

        // The persisted identity wins over the request-derived candidate.
        let mut identity = self
            .ranking
            .load(&candidate.unique_id)
            .await
            .map_err(Error::Store)?
            .unwrap_or(candidate);

        debug!(
            uid = %identity.unique_id,
            rank = identity.rank,
            method = %method,
            path = %path,
            "incoming request"
        );

        let mut global = self
            .store
            .load_global(method, path)
            .await
            .map_err(Error::Store)?;
        let mut local = self
            .store
            .load_local(method, path, &identity.unique_id)
            .await
            .map_err(Error::Store)?;

        // Blocked identities are rejected up front and accrue no hits.
        if local.is_blocked(now)
            && let (Some(rule), Some(blocked_at)) = (local.blocked_by_rule.clone(), local.blocked_at)
        {
            debug!(
                uid = %identity.unique_id,
                method = %method,
                path = %path,
                "rejected blocked request"
            );
            let reason = rule
                .reason()
                .map(str::to_owned)
                .unwrap_or_else(|| (self.reason_builder)(&rule));
            let message = rule.message().map(str::to_owned);
            return Err(LimitedError::blocked(rule, blocked_at, now, reason, message).into());
        }

        let bundle: Vec<Rule> = site.ranks.bundle_for(identity.rank).to_vec();
        local.hits.push(now);

        let mut rule = None;
        match evaluate(&bundle, &global, &local, &identity.group, now) {
            Outcome::Exceeded(exceeded) => {
                local.trim_hits(max_hits(&bundle));

                if exceeded.increase_rank() {
                    identity.rank = (identity.rank + 1).min(site.ranks.len() as u32);
                    self.ranking
                        .save(&identity, self.user_ttl)
                        .await
                        .map_err(Error::Store)?;
                    debug!(
                        uid = %identity.unique_id,
                        rank = identity.rank,
                        method = %method,
                        path = %path,
                        "rank increased"
                    );
                }

                let is_delay = exceeded.delay().is_some();
                if is_delay && site.no_block_delay {
                    // Uncount the hit so the delay does not re-trigger on the
                    // next request.
                    local.hits.pop();
                } else {
                    local.blocked_by_rule = Some(exceeded.clone());
                    local.blocked_at = Some(now);
                    debug!(
                        uid = %identity.unique_id,
                        method = %method,
                        path = %path,
                        block_time = exceeded.block_time(),
                        "identity blocked"
                    );
                }

                self.store
                    .save_local(&local, &identity, self.user_endpoint_ttl)
                    .await
                    .map_err(Error::Store)?;

                if is_delay {
                    let reason = (self.reason_builder)(&exceeded);
                    let message = exceeded.message().map(str::to_owned);
                    return Err(LimitedError::delay_exceeded(
                        exceeded,
                        &local,
                        now,
                        reason,
                        message,
                        site.no_block_delay,
                    )
                    .into());
                }

                rule = Some(exceeded);
            }
            Outcome::Clear => {
                local.trim_hits(max_hits(&bundle));
                self.store
                    .save_local(&local, &identity, self.user_endpoint_ttl)
                    .await
                    .map_err(Error::Store)?;
            }
            Outcome::IgnoreByCount(scope) => {
                local.hits.clear();
                debug!(
                    uid = %identity.unique_id,
                    method = %method,
                    path = %path,
                    scope = ?scope,
                    "request suppressed by count"
                );
                match scope {
                    Scope::Identity => {
                        local.ignore_times = local.ignore_times.map(|times| times.saturating_sub(1));
                        self.store
                            .save_local(&local, &identity, self.user_endpoint_ttl)
                            .await
                            .map_err(Error::Store)?;
                    }
                    Scope::Global => {
                        global.ignore_times =
                            global.ignore_times.map(|times| times.saturating_sub(1));
                        self.store
                            .save_global(&global, self.endpoint_ttl)
                            .await
                            .map_err(Error::Store)?;
                    }
                }
            }
            Outcome::IgnoreByTime(scope) => {
                // Time suppressions only clear the in-memory hits; nothing is
                // persisted until some later intent or request saves.
                local.hits.clear();
                debug!(
                    uid = %identity.unique_id,
                    method = %method,
                    path = %path,
                    scope = ?scope,
                    "request suppressed until deadline"
                );
            }
        }

        Ok(Admission {
            now,
            identity,
            global,
            local,
            rule,
            bundle,
        })
    }

    /// Post-handler half: either take the no-hit path for listed response
    /// statuses, or apply the handler's intents in the order
    /// ignore -> rank -> limit.
    pub async fn finish(
        &self,
        admission: Admission,
        ctx: &RatelimitContext,
        status: StatusCode,
        site: &SiteOptions,
    ) -> Result<(), Error> {
        let Admission {
            now,
            mut identity,
            mut global,
            mut local,
            bundle,
            ..
        } = admission;

        let no_hit = site
            .no_hit_on_status
            .as_deref()
            .unwrap_or(&self.no_hit_on_status);
        if no_hit.contains(&status) {
            if local.remove_hit(now) {
                self.store
                    .save_local(&local, &identity, self.user_endpoint_ttl)
                    .await
                    .map_err(Error::Store)?;
            }
            debug!(
                uid = %identity.unique_id,
                status = %status,
                "hit removed for response status"
            );
            return Ok(());
        }

        let data = ctx.data();

        if let Some(intent) = data.ignore {
            let until = intent.seconds.map(|seconds| now + secs(seconds));
            match intent.level {
                IgnoreLevel::Global => {
                    global.ignore_times = intent.times;
                    global.ignore_until = until;
                    self.store
                        .save_global(&global, self.endpoint_ttl)
                        .await
                        .map_err(Error::Store)?;
                    if intent.count_this && local.remove_hit(now) {
                        self.store
                            .save_local(&local, &identity, self.user_endpoint_ttl)
                            .await
                            .map_err(Error::Store)?;
                    }
                }
                IgnoreLevel::Identity => {
                    local.ignore_times = intent.times;
                    local.ignore_until = until;
                    if intent.count_this {
                        local.remove_hit(now);
                    }
                    self.store
                        .save_local(&local, &identity, self.user_endpoint_ttl)
                        .await
                        .map_err(Error::Store)?;
                }
            }
            debug!(
                uid = %identity.unique_id,
                times = intent.times,
                seconds = intent.seconds,
                level = ?intent.level,
                "ignore intent applied"
            );
        }

        if let Some(intent) = data.rank {
            match intent {
                RankIntent::Reset => identity.rank = 0,
                RankIntent::IncreaseBy(by) if by != 0 => {
                    // Manual adjustment floors at 0 but has no upper bound,
                    // unlike the automatic promotion in `admit`.
                    identity.rank = (i64::from(identity.rank) + i64::from(by)).max(0) as u32;
                }
                RankIntent::IncreaseBy(_) => {}
            }
            self.ranking
                .save(&identity, self.user_ttl)
                .await
                .map_err(Error::Store)?;
            debug!(
                uid = %identity.unique_id,
                rank = identity.rank,
                "rank intent applied"
            );
        }

        if let Some(intent) = data.limit {
            let block_time = intent
                .for_seconds
                .or_else(|| bundle.first().map(|rule| rule.block_time()))
                .unwrap_or(self.default_block_time);
            let rule = Rule::synthetic(block_time, intent.message, intent.reason);
            local.blocked_by_rule = Some(rule);
            local.blocked_at = Some(now);
            self.store
                .save_local(&local, &identity, self.user_endpoint_ttl)
                .await
                .map_err(Error::Store)?;
            debug!(
                uid = %identity.unique_id,
                block_time,
                "limit intent applied, future requests blocked"
            );
        }

        Ok(())
    }
}
