//! Rate-limit governor: every outbound call goes through [`RateLimitGovernor::execute`].
//!
//! On `429` the server's `Retry-After` is honored; without it, and for
//! network failures and `5xx`, the delay is `min(cap, base * 2^attempt + jitter)`
//! with `jitter` in `[0, base)`. Keeping the jitter inside the clamp makes the
//! delays non-decreasing from one attempt to the next.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::auth::TokenProvider;
use crate::config::RetrySettings;
use crate::error::{Result, SyncError};
use crate::http::{ApiRequest, ApiResponse, Transport};
use crate::sync::clock::Clock;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            base_delay: Duration::from_millis(settings.base_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `attempt + 1`; `jitter` is a sample in `[0, 1)`.
    pub fn backoff_delay(&self, attempt: u32, jitter: f64) -> Duration {
        let exponential = self
            .base_delay
            .checked_mul(2u32.saturating_pow(attempt.min(31)))
            .unwrap_or(self.max_delay);
        let jitter = self.base_delay.mul_f64(jitter.clamp(0.0, 0.999));
        exponential.saturating_add(jitter).min(self.max_delay)
    }
}

/// Delay requested by a `Retry-After` header, in delta-seconds or HTTP-date form.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

pub struct RateLimitGovernor {
    transport: Arc<dyn Transport>,
    tokens: Arc<dyn TokenProvider>,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
    shutdown: CancellationToken,
}

enum Outcome {
    Done(ApiResponse),
    RateLimited(Option<Duration>),
    Failed(SyncError),
}

impl RateLimitGovernor {
    pub fn new(
        transport: Arc<dyn Transport>,
        tokens: Arc<dyn TokenProvider>,
        clock: Arc<dyn Clock>,
        policy: RetryPolicy,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            transport,
            tokens,
            clock,
            policy,
            shutdown,
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn classify(&self, result: Result<ApiResponse>) -> Outcome {
        match result {
            Ok(response) if response.is_success() || response.is_not_modified() => {
                Outcome::Done(response)
            }
            Ok(response) if response.status == 429 => Outcome::RateLimited(
                response
                    .header("retry-after")
                    .and_then(|value| parse_retry_after(value, self.clock.now())),
            ),
            Ok(response) if response.status >= 500 => Outcome::Failed(SyncError::transient(
                format!("server error {}", response.status),
            )),
            Ok(response) => Outcome::Failed(SyncError::permanent(
                response.status,
                response.body.chars().take(200).collect::<String>(),
            )),
            Err(e) => Outcome::Failed(e),
        }
    }

    /// Send `request`, retrying what is safe to retry.
    pub async fn execute(&self, request: &ApiRequest) -> Result<ApiResponse> {
        let mut attempt = 0u32;
        loop {
            if self.shutdown.is_cancelled() {
                return Err(SyncError::Cancelled);
            }

            let token = self.tokens.get_valid_token().await?;
            let result = self.transport.send(request, &token.access_token).await;

            let delay = match self.classify(result) {
                Outcome::Done(response) => return Ok(response),
                Outcome::RateLimited(hint) => {
                    if attempt + 1 >= self.policy.max_attempts {
                        tracing::warn!(path = %request.path, attempts = attempt + 1, "Rate limit retry budget exhausted");
                        return Err(SyncError::RateLimitExhausted {
                            attempts: attempt + 1,
                        });
                    }
                    match hint {
                        Some(hint) if hint > self.policy.max_delay => {
                            tracing::warn!(path = %request.path, retry_after_secs = hint.as_secs(), "Retry-After exceeds the backoff cap");
                            return Err(SyncError::RateLimitExhausted {
                                attempts: attempt + 1,
                            });
                        }
                        Some(hint) => hint,
                        None => self.policy.backoff_delay(attempt, rand::rng().random::<f64>()),
                    }
                }
                Outcome::Failed(e) if e.is_retryable() => {
                    // A POST that may have reached the server is not replayed.
                    if !request.method.is_idempotent() || attempt + 1 >= self.policy.max_attempts {
                        return Err(e);
                    }
                    tracing::debug!(path = %request.path, error = %e, "Retrying after transient failure");
                    self.policy.backoff_delay(attempt, rand::rng().random::<f64>())
                }
                Outcome::Failed(e) => return Err(e),
            };

            tracing::debug!(
                method = request.method.as_str(),
                path = %request.path,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Backing off"
            );
            self.clock.sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::testing::StaticToken;
    use crate::http::HttpMethod;
    use crate::http::testing::FakeTransport;
    use crate::sync::clock::testing::ManualClock;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
        }
    }

    fn governor(transport: Arc<FakeTransport>, clock: Arc<ManualClock>) -> RateLimitGovernor {
        RateLimitGovernor::new(
            transport,
            Arc::new(StaticToken),
            clock,
            policy(),
            CancellationToken::new(),
        )
    }

    fn get() -> ApiRequest {
        ApiRequest::new(HttpMethod::Get, "/v1/me/tracks")
    }

    #[test]
    fn backoff_is_non_decreasing_up_to_the_cap() {
        let policy = policy();
        for jitters in [[0.0, 0.99], [0.99, 0.0], [0.5, 0.5]] {
            let mut previous = Duration::ZERO;
            for attempt in 0..12 {
                let delay = policy.backoff_delay(attempt, jitters[(attempt % 2) as usize]);
                assert!(delay >= previous, "attempt {attempt}: {delay:?} < {previous:?}");
                assert!(delay <= policy.max_delay);
                previous = delay;
            }
            assert_eq!(previous, policy.max_delay);
        }
    }

    #[test]
    fn backoff_starts_at_base() {
        let policy = policy();
        assert_eq!(policy.backoff_delay(0, 0.0), Duration::from_millis(100));
        assert_eq!(policy.backoff_delay(3, 0.0), Duration::from_millis(800));
        assert_eq!(policy.backoff_delay(40, 0.0), Duration::from_secs(2));
    }

    #[test]
    fn parses_retry_after_forms() {
        let now = DateTime::parse_from_rfc3339("2015-10-21T07:28:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(parse_retry_after("3", now), Some(Duration::from_secs(3)));
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:28:30 GMT", now),
            Some(Duration::from_secs(30))
        );
        assert_eq!(parse_retry_after("soon", now), None);
    }

    #[tokio::test]
    async fn honors_retry_after_then_succeeds() {
        let transport = Arc::new(FakeTransport::scripted(vec![
            Ok(ApiResponse::new(429, "").with_header("Retry-After", "1")),
            Ok(ApiResponse::new(200, "{}")),
        ]));
        let clock = ManualClock::new();
        let governor = governor(transport.clone(), clock.clone());

        let response = governor.execute(&get()).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(1)]);
        assert_eq!(transport.request_count(), 2);
    }

    #[tokio::test]
    async fn exhausts_rate_limit_budget() {
        let transport = Arc::new(FakeTransport::with_handler(|_| Ok(ApiResponse::new(429, ""))));
        let clock = ManualClock::new();
        let governor = governor(transport.clone(), clock.clone());

        let err = governor.execute(&get()).await.unwrap_err();
        assert_eq!(err, SyncError::RateLimitExhausted { attempts: 4 });
        assert_eq!(transport.request_count(), 4);

        let sleeps = clock.sleeps();
        assert_eq!(sleeps.len(), 3);
        assert!(sleeps.windows(2).all(|pair| pair[0] <= pair[1]));
    }

    #[tokio::test]
    async fn oversized_retry_after_fails_fast() {
        let transport = Arc::new(FakeTransport::scripted(vec![Ok(
            ApiResponse::new(429, "").with_header("retry-after", "3600"),
        )]));
        let clock = ManualClock::new();
        let governor = governor(transport.clone(), clock.clone());

        let err = governor.execute(&get()).await.unwrap_err();
        assert!(matches!(err, SyncError::RateLimitExhausted { attempts: 1 }));
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn retries_server_errors_for_idempotent_requests() {
        let transport = Arc::new(FakeTransport::scripted(vec![
            Ok(ApiResponse::new(502, "")),
            Err(SyncError::transient("connection reset")),
            Ok(ApiResponse::new(200, "{}")),
        ]));
        let clock = ManualClock::new();
        let governor = governor(transport.clone(), clock.clone());

        assert!(governor.execute(&get()).await.is_ok());
        assert_eq!(clock.sleeps().len(), 2);
    }

    #[tokio::test]
    async fn transient_failures_surface_after_the_budget() {
        let transport = Arc::new(FakeTransport::with_handler(|_| Ok(ApiResponse::new(503, ""))));
        let clock = ManualClock::new();
        let governor = governor(transport.clone(), clock);

        let err = governor.execute(&get()).await.unwrap_err();
        assert!(matches!(err, SyncError::Transient(_)));
        assert_eq!(transport.request_count(), 4);
    }

    #[tokio::test]
    async fn does_not_replay_posts_after_server_errors() {
        let transport = Arc::new(FakeTransport::scripted(vec![
            Ok(ApiResponse::new(500, "")),
            Ok(ApiResponse::new(201, "{}")),
        ]));
        let clock = ManualClock::new();
        let governor = governor(transport.clone(), clock);

        let post = ApiRequest::new(HttpMethod::Post, "/v1/playlists/p/tracks");
        let err = governor.execute(&post).await.unwrap_err();
        assert!(matches!(err, SyncError::Transient(_)));
        assert_eq!(transport.request_count(), 1);
    }

    #[tokio::test]
    async fn retries_posts_that_were_rate_limited() {
        let transport = Arc::new(FakeTransport::scripted(vec![
            Ok(ApiResponse::new(429, "")),
            Ok(ApiResponse::new(201, "{}")),
        ]));
        let clock = ManualClock::new();
        let governor = governor(transport.clone(), clock);

        let post = ApiRequest::new(HttpMethod::Post, "/v1/playlists/p/tracks");
        assert_eq!(governor.execute(&post).await.unwrap().status, 201);
    }

    #[tokio::test]
    async fn client_errors_are_permanent() {
        let transport = Arc::new(FakeTransport::scripted(vec![Ok(ApiResponse::new(404, "no such playlist"))]));
        let clock = ManualClock::new();
        let governor = governor(transport.clone(), clock);

        let err = governor.execute(&get()).await.unwrap_err();
        assert_eq!(err, SyncError::permanent(404, "no such playlist"));
        assert_eq!(transport.request_count(), 1);
    }

    #[tokio::test]
    async fn stops_when_shutdown_is_requested() {
        let transport = Arc::new(FakeTransport::with_handler(|_| Ok(ApiResponse::new(200, "{}"))));
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let governor = RateLimitGovernor::new(
            transport.clone(),
            Arc::new(StaticToken),
            ManualClock::new(),
            policy(),
            shutdown,
        );

        assert_eq!(governor.execute(&get()).await.unwrap_err(), SyncError::Cancelled);
        assert_eq!(transport.request_count(), 0);
    }
}
