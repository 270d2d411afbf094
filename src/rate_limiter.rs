//! Per-provider rate limiting (spec §4.11).
//!
//! Grounded on `dashflow-streaming::rate_limiter::TenantRateLimiter`'s
//! overall shape (`Arc<RwLock<HashMap<String, _>>>` per-key state,
//! builder-style limit registration) but adapted from its token-bucket
//! design to the sliding-window counters + strict concurrency semaphore
//! the spec calls for. Non-blocking: a denied request returns an error
//! with a retry hint rather than waiting inside the limiter.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{Error, Result};

/// Per-provider rate policy (spec §4.11).
#[derive(Debug, Clone, Copy, Default)]
pub struct RateLimitPolicy {
    /// Requests allowed per rolling minute, if limited.
    pub requests_per_minute: Option<u32>,
    /// Tokens allowed per rolling minute, if limited.
    pub tokens_per_minute: Option<u32>,
    /// Maximum concurrent in-flight requests, if limited.
    pub concurrency: Option<usize>,
}

struct SlidingWindow {
    window_start: Instant,
    request_count: u32,
    token_count: u64,
}

impl SlidingWindow {
    fn new(now: Instant) -> Self {
        Self {
            window_start: now,
            request_count: 0,
            token_count: 0,
        }
    }

    fn roll_if_expired(&mut self, now: Instant) {
        if now.duration_since(self.window_start) >= Duration::from_secs(60) {
            self.window_start = now;
            self.request_count = 0;
            self.token_count = 0;
        }
    }

    fn ms_until_reset(&self, now: Instant) -> u64 {
        let elapsed = now.duration_since(self.window_start);
        Duration::from_secs(60).saturating_sub(elapsed).as_millis() as u64
    }
}

struct ProviderState {
    policy: RateLimitPolicy,
    window: Mutex<SlidingWindow>,
    semaphore: Option<Arc<Semaphore>>,
}

/// A handle that must be released (via [`RateLimiter::end_request`] or by
/// dropping) on every exit path once [`RateLimiter::start_request`]
/// returns `allowed`.
pub struct RequestGuard {
    _permit: Option<OwnedSemaphorePermit>,
}

/// Outcome of [`RateLimiter::start_request`].
#[derive(Debug, Clone, Copy)]
pub struct AdmissionResult {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Milliseconds the caller should wait before retrying, if denied.
    pub retry_after_ms: Option<u64>,
}

/// Per-provider request/token/concurrency gate.
#[derive(Default)]
pub struct RateLimiter {
    providers: parking_lot::RwLock<HashMap<String, Arc<ProviderState>>>,
}

impl RateLimiter {
    /// Construct an empty limiter; providers with no registered policy are
    /// never throttled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the policy for `provider`.
    pub fn set_policy(&self, provider: &str, policy: RateLimitPolicy) {
        let state = Arc::new(ProviderState {
            policy,
            window: Mutex::new(SlidingWindow::new(Instant::now())),
            semaphore: policy.concurrency.map(|c| Arc::new(Semaphore::new(c))),
        });
        self.providers.write().insert(provider.to_string(), state);
    }

    fn state_for(&self, provider: &str) -> Option<Arc<ProviderState>> {
        self.providers.read().get(provider).cloned()
    }

    /// Attempt to admit a request estimated to cost `token_estimate`
    /// tokens. Non-blocking: returns immediately with `allowed=false` and
    /// a retry hint rather than waiting. On success, returns a
    /// [`RequestGuard`] that must be held until
    /// [`RateLimiter::end_request`] is called (or dropped, which releases
    /// the concurrency slot but does not decrement sliding-window
    /// counters — those expire on their own).
    pub fn start_request(&self, provider: &str, token_estimate: u64) -> Result<(AdmissionResult, Option<RequestGuard>)> {
        let Some(state) = self.state_for(provider) else {
            return Ok((AdmissionResult { allowed: true, retry_after_ms: None }, None));
        };

        let now = Instant::now();
        {
            let mut window = state.window.lock();
            window.roll_if_expired(now);

            if let Some(limit) = state.policy.requests_per_minute {
                if window.request_count >= limit {
                    let retry_after_ms = window.ms_until_reset(now);
                    return Ok((
                        AdmissionResult { allowed: false, retry_after_ms: Some(retry_after_ms) },
                        None,
                    ));
                }
            }
            if let Some(limit) = state.policy.tokens_per_minute {
                if window.token_count + token_estimate > u64::from(limit) {
                    let retry_after_ms = window.ms_until_reset(now);
                    return Ok((
                        AdmissionResult { allowed: false, retry_after_ms: Some(retry_after_ms) },
                        None,
                    ));
                }
            }

            window.request_count += 1;
            window.token_count += token_estimate;
        }

        let permit = match &state.semaphore {
            Some(sem) => match sem.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    // Roll back the counters we just took since this
                    // request will not proceed.
                    let mut window = state.window.lock();
                    window.request_count = window.request_count.saturating_sub(1);
                    window.token_count = window.token_count.saturating_sub(token_estimate);
                    return Ok((
                        AdmissionResult { allowed: false, retry_after_ms: Some(50) },
                        None,
                    ));
                }
            },
            None => None,
        };

        Ok((
            AdmissionResult { allowed: true, retry_after_ms: None },
            Some(RequestGuard { _permit: permit }),
        ))
    }

    /// Release the concurrency slot acquired by a successful
    /// `start_request`. Mandatory on every exit path (spec §4.11); dropping
    /// the [`RequestGuard`] has the same effect, so this is a convenience
    /// for explicit call sites.
    pub fn end_request(&self, guard: Option<RequestGuard>) {
        drop(guard);
    }

    /// Convenience wrapper that returns an [`Error::Admission`] directly
    /// instead of an `AdmissionResult`, for call sites that want `?`.
    pub fn admit(&self, provider: &str, token_estimate: u64) -> Result<Option<RequestGuard>> {
        let (result, guard) = self.start_request(provider, token_estimate)?;
        if result.allowed {
            Ok(guard)
        } else {
            Err(Error::admission(
                format!("rate limit exceeded for provider `{provider}`"),
                result.retry_after_ms,
            ))
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn unregistered_provider_is_never_limited() {
        let limiter = RateLimiter::new();
        let (result, _guard) = limiter.start_request("openai", 1000).unwrap();
        assert!(result.allowed);
    }

    #[test]
    fn requests_per_minute_limit_is_enforced() {
        let limiter = RateLimiter::new();
        limiter.set_policy(
            "openai",
            RateLimitPolicy {
                requests_per_minute: Some(1),
                ..Default::default()
            },
        );
        let (first, _g1) = limiter.start_request("openai", 10).unwrap();
        assert!(first.allowed);
        let (second, _g2) = limiter.start_request("openai", 10).unwrap();
        assert!(!second.allowed);
        assert!(second.retry_after_ms.is_some());
    }

    #[test]
    fn tokens_per_minute_limit_is_enforced() {
        let limiter = RateLimiter::new();
        limiter.set_policy(
            "openai",
            RateLimitPolicy {
                tokens_per_minute: Some(100),
                ..Default::default()
            },
        );
        let (first, _g1) = limiter.start_request("openai", 80).unwrap();
        assert!(first.allowed);
        let (second, _g2) = limiter.start_request("openai", 50).unwrap();
        assert!(!second.allowed);
    }

    #[test]
    fn concurrency_limit_is_enforced_and_released_on_drop() {
        let limiter = RateLimiter::new();
        limiter.set_policy(
            "openai",
            RateLimitPolicy {
                concurrency: Some(1),
                ..Default::default()
            },
        );
        let (first, guard1) = limiter.start_request("openai", 1).unwrap();
        assert!(first.allowed);
        let (second, _guard2) = limiter.start_request("openai", 1).unwrap();
        assert!(!second.allowed);

        drop(guard1);
        let (third, _guard3) = limiter.start_request("openai", 1).unwrap();
        assert!(third.allowed);
    }

    #[test]
    fn admit_returns_admission_error_with_retry_hint_when_denied() {
        let limiter = RateLimiter::new();
        limiter.set_policy(
            "openai",
            RateLimitPolicy {
                requests_per_minute: Some(0),
                ..Default::default()
            },
        );
        let err = limiter.admit("openai", 1).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Admission);
        assert!(err.retry_after_ms().is_some());
    }

    #[test]
    fn separate_providers_are_independently_limited() {
        let limiter = RateLimiter::new();
        limiter.set_policy(
            "openai",
            RateLimitPolicy {
                requests_per_minute: Some(1),
                ..Default::default()
            },
        );
        let (openai_first, _g) = limiter.start_request("openai", 1).unwrap();
        assert!(openai_first.allowed);
        let (anthropic_first, _g2) = limiter.start_request("anthropic", 1).unwrap();
        assert!(anthropic_first.allowed);
    }
}
