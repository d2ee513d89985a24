//! Tower middleware wiring the engine into an axum request pipeline.
//!
//! Per rate-limited route:
//!
//! 1. resolve the identity candidate from the request head,
//! 2. `Engine::admit` -- may reject with a 429 before the handler runs,
//! 3. run the inner service with the [`RatelimitContext`] bound task-locally,
//! 4. `Engine::finish` -- applies whatever intents the handler recorded.
//!
//! Store failures never take the route down: the request proceeds (or the
//! response stands) and the failure is logged.

use crate::context::{RatelimitContext, with_context};
use crate::engine::{Engine, SiteOptions};
use crate::error::Error;
use crate::rule::RankSet;
use axum::body::Body;
use axum::extract::{MatchedPath, Request};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};
use tracing::{error, warn};

/// Layer applying one rate-limit site to the wrapped service.
#[derive(Clone)]
pub struct RatelimitLayer {
    engine: Arc<Engine>,
    site: Arc<SiteOptions>,
}

impl RatelimitLayer {
    pub fn new(engine: Arc<Engine>, ranks: impl Into<RankSet>) -> Self {
        Self {
            engine,
            site: Arc::new(SiteOptions::new(ranks)),
        }
    }

    fn site_mut(&mut self) -> &mut SiteOptions {
        Arc::make_mut(&mut self.site)
    }

    /// Persist blocks even when the triggering rule is a delay rule.
    pub fn block_on_delay(mut self) -> Self {
        self.site_mut().no_block_delay = false;
        self
    }

    /// Key records by the route template (e.g. `/items/{id}`) instead of the
    /// concrete request path.
    pub fn use_raw_path(mut self) -> Self {
        self.site_mut().use_raw_path = true;
        self
    }

    /// Override the engine-wide set of response statuses whose hit is
    /// removed after the handler runs.
    pub fn no_hit_on_status(mut self, statuses: impl IntoIterator<Item = StatusCode>) -> Self {
        self.site_mut().no_hit_on_status = Some(statuses.into_iter().collect());
        self
    }
}

impl<S> Layer<S> for RatelimitLayer {
    type Service = RatelimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RatelimitService {
            inner,
            engine: self.engine.clone(),
            site: self.site.clone(),
        }
    }
}

#[derive(Clone)]
pub struct RatelimitService<S> {
    inner: S,
    engine: Arc<Engine>,
    site: Arc<SiteOptions>,
}

impl<S, ResBody> Service<Request> for RatelimitService<S>
where
    S: Service<Request, Response = Response<ResBody>> + Send + Clone + 'static,
    S::Future: Send + 'static,
    S::Error: std::fmt::Debug + Send,
    ResBody: Send + 'static,
    Body: Into<ResBody>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let engine = self.engine.clone();
        let site = self.site.clone();
        // Take the ready service and leave the clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let (parts, body) = req.into_parts();

            let method = parts.method.as_str().to_owned();
            let path = if site.use_raw_path
                && let Some(matched) = parts.extensions.get::<MatchedPath>()
            {
                matched.as_str().to_owned()
            } else {
                parts.uri.path().to_owned()
            };

            let candidate = match engine.authenticate(&parts).await {
                Ok(candidate) => candidate,
                Err(err) => {
                    error!(error = %err, method = %method, path = %path, "authentication failed");
                    return Ok(StatusCode::INTERNAL_SERVER_ERROR.into_response().map(Into::into));
                }
            };
            let req = Request::from_parts(parts, body);

            match engine.admit(&method, &path, candidate, &site).await {
                Ok(admission) => {
                    let ctx = Arc::new(RatelimitContext::new(
                        admission.rule().cloned(),
                        admission.identity().clone(),
                    ));

                    let response = with_context(ctx.clone(), inner.call(req)).await?;

                    let status = response.status();
                    if let Err(err) = engine.finish(admission, &ctx, status, &site).await {
                        error!(
                            error = %err,
                            method = %method,
                            path = %path,
                            "failed to apply rate-limit intents"
                        );
                    }
                    Ok(response)
                }
                Err(Error::Limited(limited)) => {
                    warn!(
                        method = %method,
                        path = %path,
                        retry_after_secs = limited.limited_for,
                        "rate limit exceeded"
                    );
                    Ok(limited.into_response().map(Into::into))
                }
                Err(err) => {
                    error!(error = %err, method = %method, path = %path, "rate-limit engine failed");
                    Ok(StatusCode::INTERNAL_SERVER_ERROR.into_response().map(Into::into))
                }
            }
        })
    }
}
