//! Identity extraction from the incoming request.
//!
//! The application decides what an identity is (session user, API key,
//! client IP behind a trusted proxy, ...); the engine only requires that
//! `unique_id` is stable for the caller.

use crate::identity::Identity;
use async_trait::async_trait;
use http::request::Parts;

/// Resolves the identity candidate for a request. May suspend (e.g. a
/// session lookup); the candidate's rank is superseded by the persisted one.
#[async_trait]
pub trait Authenticate: Send + Sync {
    async fn authenticate(&self, parts: &Parts) -> anyhow::Result<Identity>;
}

/// Adapter for synchronous extraction closures, the common case when the
/// identity comes straight from headers.
///
/// ```ignore
/// AuthFn(|parts: &Parts| {
///     let ip = parts
///         .headers
///         .get("x-forwarded-for")
///         .and_then(|v| v.to_str().ok())
///         .unwrap_or("unknown");
///     Ok(Identity::new(ip, "default"))
/// })
/// ```
pub struct AuthFn<F>(pub F);

#[async_trait]
impl<F> Authenticate for AuthFn<F>
where
    F: Fn(&Parts) -> anyhow::Result<Identity> + Send + Sync,
{
    async fn authenticate(&self, parts: &Parts) -> anyhow::Result<Identity> {
        (self.0)(parts)
    }
}
