//! Retry policies for the resiliency layer.
//!
//! A policy sees the outcome of every attempt and decides whether the
//! request is issued again and after which delay. The
//! [`ResiliencyLayer`](crate::ResiliencyLayer) owns the request replay; the
//! policy owns the retry count and the backoff curve.

use crate::config::{
    DEFAULT_RETRY_RESPONSE_DRAIN_LIMIT, ExponentialBackoff, RetryConfig, RetryTrigger,
};
use crate::error::HttpError;
use crate::response::parse_retry_after;
use async_trait::async_trait;
use http::{HeaderMap, Method, StatusCode, Uri};
use rand::Rng;
use std::time::Duration;

/// Outcome of a single attempt
#[derive(Debug, Clone, Copy)]
pub enum AttemptOutcome<'a> {
    /// The server answered; the body is not exposed to the policy.
    Response {
        status: StatusCode,
        headers: &'a HeaderMap,
    },
    /// The attempt failed before a response was received.
    Error(&'a HttpError),
}

impl AttemptOutcome<'_> {
    /// Classify the outcome into a [`RetryTrigger`].
    #[must_use]
    pub fn trigger(&self) -> RetryTrigger {
        match self {
            Self::Response { status, .. } => RetryTrigger::Status(status.as_u16()),
            Self::Error(HttpError::Transport(_)) => RetryTrigger::TransportError,
            Self::Error(HttpError::Timeout(_)) => RetryTrigger::Timeout,
            Self::Error(_) => RetryTrigger::NonRetryable,
        }
    }
}

/// What a policy is asked to decide on
#[derive(Debug, Clone, Copy)]
pub struct AttemptContext<'a> {
    pub method: &'a Method,
    pub uri: &'a Uri,
    pub request_headers: &'a HeaderMap,
    /// 1-based number of the attempt that just completed
    pub attempt: usize,
    pub outcome: AttemptOutcome<'a>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Hand the outcome to the caller
    Stop,
    /// Issue the request again after the delay
    Retry(Duration),
}

/// Asynchronous retry decision function.
///
/// Implementations must eventually return [`RetryDecision::Stop`]; the
/// resiliency layer retries for as long as the policy says so.
#[async_trait]
pub trait RetryPolicy: Send + Sync {
    async fn decide(&self, ctx: &AttemptContext<'_>) -> RetryDecision;

    /// Bytes drained from a discarded response before the next attempt.
    fn drain_limit(&self) -> usize {
        DEFAULT_RETRY_RESPONSE_DRAIN_LIMIT
    }
}

/// Exponential backoff policy driven by a [`RetryConfig`].
///
/// - stops after `1 + max_retries` attempts
/// - classifies outcomes with [`AttemptOutcome::trigger`] and applies the
///   idempotency rules of [`RetryConfig::should_retry`]
/// - honours `Retry-After` (capped at `backoff.max`) unless configured not to
#[derive(Debug, Clone, Default)]
pub struct BackoffPolicy {
    config: RetryConfig,
}

impl BackoffPolicy {
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }
}

#[async_trait]
impl RetryPolicy for BackoffPolicy {
    async fn decide(&self, ctx: &AttemptContext<'_>) -> RetryDecision {
        let config = &self.config;
        if ctx.attempt > config.max_retries {
            return RetryDecision::Stop;
        }

        let has_idempotency_key = config
            .idempotency_key_header
            .as_ref()
            .is_some_and(|name| ctx.request_headers.contains_key(name));
        if !config.should_retry(ctx.outcome.trigger(), ctx.method, has_idempotency_key) {
            return RetryDecision::Stop;
        }

        let retry_after = match ctx.outcome {
            AttemptOutcome::Response { headers, .. } if !config.ignore_retry_after => {
                parse_retry_after(headers).map(|d| d.min(config.backoff.max))
            }
            _ => None,
        };

        RetryDecision::Retry(
            retry_after.unwrap_or_else(|| calculate_backoff(&config.backoff, ctx.attempt - 1)),
        )
    }

    fn drain_limit(&self) -> usize {
        self.config.retry_response_drain_limit
    }
}

/// Backoff delay before retry number `retry` (0-based).
///
/// NaN, infinite and negative parameters fall back to safe values; the
/// result never exceeds `backoff.max` (itself capped at one day).
#[must_use]
pub fn calculate_backoff(backoff: &ExponentialBackoff, retry: usize) -> Duration {
    const MAX_BACKOFF_SECS: f64 = 86_400.0;

    fn sane(value: f64, fallback: f64) -> f64 {
        if value.is_finite() && value >= 0.0 {
            value
        } else {
            fallback
        }
    }

    let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
    let multiplier = sane(backoff.multiplier, 1.0);
    let initial = sane(backoff.initial.as_secs_f64(), 0.0);
    let max = sane(backoff.max.as_secs_f64(), MAX_BACKOFF_SECS).min(MAX_BACKOFF_SECS);

    let raw = initial * multiplier.powi(exponent);
    let secs = if raw.is_finite() { raw.clamp(0.0, max) } else { max };
    let delay = Duration::from_secs_f64(secs);

    let delay = if backoff.jitter {
        let factor = rand::rng().random_range(0.0..=0.25);
        delay + delay.mul_f64(factor)
    } else {
        delay
    };

    delay.min(Duration::from_secs_f64(max))
}
