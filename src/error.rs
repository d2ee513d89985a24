//! Error model: the rejection signal rendered to clients, and the engine's
//! operational failures.

use crate::clock::{ceil_seconds, secs};
use crate::endpoint::EndpointRecord;
use crate::rule::Rule;
use axum::Json;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Stable tag for delay-rule rejections.
pub const ERROR_TYPE_DELAY: &str = "ratelimit.delay_exceeded";
/// Stable tag for window-rule rejections.
pub const ERROR_TYPE_HITS: &str = "ratelimit.hits_exceeded";

/// The normal rejection signal; carries everything needed to render a 429.
#[derive(Debug, Clone, thiserror::Error)]
#[error("rate limited: {reason} (retry in {limited_for}s)")]
pub struct LimitedError {
    pub rule: Rule,
    pub limited_at: DateTime<Utc>,
    pub reason: String,
    pub message: Option<String>,
    /// Whole seconds until the limit lifts, rounded up, never negative.
    pub limited_for: i64,
}

impl LimitedError {
    /// Rejection for a persisted block: the limit lifts when
    /// `limited_at + block_time` passes.
    pub(crate) fn blocked(
        rule: Rule,
        limited_at: DateTime<Utc>,
        now: DateTime<Utc>,
        reason: String,
        message: Option<String>,
    ) -> Self {
        let limited_for = ceil_seconds(limited_at + secs(rule.block_time()) - now).max(0);
        Self {
            rule,
            limited_at,
            reason,
            message,
            limited_for,
        }
    }

    /// Immediate rejection for a delay rule. When the block was suppressed,
    /// the limit lifts once the required gap from the previous hit has
    /// passed; otherwise it behaves like a persisted block.
    pub(crate) fn delay_exceeded(
        rule: Rule,
        record: &EndpointRecord,
        now: DateTime<Utc>,
        reason: String,
        message: Option<String>,
        no_block_delay: bool,
    ) -> Self {
        if no_block_delay
            && let (Some(delay), Some(last_hit)) = (rule.delay(), record.hits.last())
        {
            let limited_for = ceil_seconds(*last_hit + secs(delay) - now).max(0);
            return Self {
                rule,
                limited_at: now,
                reason,
                message,
                limited_for,
            };
        }
        Self::blocked(rule, now, now, reason, message)
    }

    /// The `error_type` tag for the wire body.
    pub fn error_type(&self) -> &'static str {
        if self.rule.delay().is_some() {
            ERROR_TYPE_DELAY
        } else {
            ERROR_TYPE_HITS
        }
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    reason: &'a str,
    message: Option<&'a str>,
    limited_for: i64,
    error_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    delay: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    hits: Option<u32>,
}

#[derive(Serialize)]
struct ErrorDetail<'a> {
    error: ErrorBody<'a>,
}

#[derive(Serialize)]
struct WireError<'a> {
    detail: ErrorDetail<'a>,
}

impl IntoResponse for LimitedError {
    fn into_response(self) -> Response {
        let body = WireError {
            detail: ErrorDetail {
                error: ErrorBody {
                    reason: &self.reason,
                    message: self.message.as_deref(),
                    limited_for: self.limited_for,
                    error_type: self.error_type(),
                    delay: self.rule.delay(),
                    hits: if self.rule.delay().is_none() {
                        self.rule.hits()
                    } else {
                        None
                    },
                },
            },
        };

        (
            StatusCode::TOO_MANY_REQUESTS,
            [(header::RETRY_AFTER, self.limited_for.to_string())],
            Json(&body),
        )
            .into_response()
    }
}

/// Operational failures surfaced by the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The request was rejected; render it per the wire format.
    #[error(transparent)]
    Limited(#[from] LimitedError),
    /// The authenticate hook failed; the request cannot be attributed.
    #[error("authentication failed: {0}")]
    Auth(#[source] anyhow::Error),
    /// The store or ranking backend failed.
    #[error("persistence failed: {0}")]
    Store(#[source] anyhow::Error),
}
