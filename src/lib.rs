//! Per-endpoint, per-identity rate limiting for axum.
//!
//! The crate is built around a decision [`Engine`]: each request is resolved
//! to an [`Identity`], checked against the rule bundle for that identity's
//! rank, counted into a persisted hit log with sliding-window and delay
//! rules, and either admitted, rejected with a 429, or suppressed. Handlers
//! can retroactively adjust the decision through the ambient
//! [`RatelimitContext`] -- uncount the hit, suspend counting, move the
//! identity's rank, or block future requests.
//!
//! ```ignore
//! let engine = Arc::new(
//!     Engine::builder()
//!         .store(Arc::new(MemoryStore::new()))
//!         .ranking(Arc::new(MemoryRanking::new()))
//!         .authenticate_fn(|parts| {
//!             let ip = client_ip(&parts.headers);
//!             Ok(Identity::new(ip, "default"))
//!         })
//!         .build()?,
//! );
//!
//! let rules = vec![
//!     Rule::builder().hits(10).batch_time(5.0).block_time(120.0).build()?,
//!     Rule::builder().delay(1.0).increase_rank(false).build()?,
//! ];
//!
//! let app = Router::new()
//!     .route("/hello", get(handler))
//!     .route_layer(engine.layer(rules));
//! ```
//!
//! Persistence goes through the narrow [`Store`] and [`RankingStore`]
//! interfaces; the bundled [`MemoryStore`]/[`MemoryRanking`] are suitable for
//! single-process deployments and tests.

pub mod auth;
pub mod clock;
pub mod config;
pub mod context;
pub mod endpoint;
pub mod engine;
pub mod error;
mod evaluate;
pub mod identity;
pub mod middleware;
pub mod rule;
pub mod store;

pub use auth::{AuthFn, Authenticate};
pub use clock::{Clock, SystemClock, VirtualClock};
pub use context::{
    ContextData, IgnoreIntent, IgnoreLevel, LimitIntent, RankIntent, RatelimitContext, RatelimitCtx,
};
pub use endpoint::EndpointRecord;
pub use engine::{Admission, Engine, EngineBuilder, SetupError, SiteOptions};
pub use error::{ERROR_TYPE_DELAY, ERROR_TYPE_HITS, Error, LimitedError};
pub use identity::{Identity, MAX_RANK};
pub use middleware::{RatelimitLayer, RatelimitService};
pub use rule::{GroupSelector, RankSet, Rule, RuleBuilder, RuleError};
pub use store::{MemoryRanking, MemoryStore, RankingStore, Store};
