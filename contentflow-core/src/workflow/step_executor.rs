//! Single-step execution with timeout, retry and circuit breaking

use crate::capability::Capability;
use crate::error::{CapabilityError, StepError};
use crate::models::configuration::RetryPolicy;
use crate::models::workflow::{StepOutput, StepPayload};
use crate::services::logging::log_dependency_error;
use crate::workflow::circuit_breaker::CircuitBreakerRegistry;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Successful step execution
#[derive(Debug, Clone)]
pub struct StepResult {
    pub output: StepOutput,
    /// Attempts used, the successful one included
    pub attempts: u32,
    /// Duration of the successful attempt
    pub duration: Duration,
}

/// Invokes capabilities under the retry policy and breaker registry
pub struct StepExecutor {
    breakers: Arc<CircuitBreakerRegistry>,
    policy: RetryPolicy,
}

impl StepExecutor {
    pub fn new(breakers: Arc<CircuitBreakerRegistry>, policy: RetryPolicy) -> Self {
        Self { breakers, policy }
    }

    pub fn breakers(&self) -> Arc<CircuitBreakerRegistry> {
        self.breakers.clone()
    }

    /// Delay before the retry that follows failed attempt `attempt` (1-based)
    ///
    /// `initial × multiplier^(attempt-1)`, capped, without jitter.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let delay_ms =
            self.policy.initial_delay_ms as f64 * self.policy.backoff_multiplier.powi(exponent);
        let capped = delay_ms.min(self.policy.max_delay_ms as f64);
        Duration::from_millis(capped as u64)
    }

    /// Add up to `jitter_factor × delay` on top of the delay
    fn apply_jitter(&self, delay: Duration) -> Duration {
        let range = delay.as_secs_f64() * self.policy.jitter_factor;
        if range <= 0.0 {
            return delay;
        }
        let extra = rand::rng().random_range(0.0..=range);
        delay + Duration::from_secs_f64(extra)
    }

    /// Execute one step
    ///
    /// Fails fast with `CircuitOpen` while the capability's breaker rejects
    /// calls. Every attempt is bounded by `timeout`; an attempt that overruns
    /// is dropped and counted as a failure. Cancellation is honored before
    /// each attempt and during backoff, never in the middle of a call.
    pub async fn execute(
        &self,
        capability: &dyn Capability,
        payload: &StepPayload,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<StepResult, StepError> {
        let step = payload.step;
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(StepError::cancelled(step, attempt));
            }

            if !self.breakers.allow(step) {
                tracing::warn!(
                    session_id = %payload.session_id,
                    step = %step,
                    attempt = attempt + 1,
                    "Circuit open, skipping capability call"
                );
                return Err(StepError::circuit_open(step, attempt));
            }

            attempt += 1;
            tracing::debug!(
                session_id = %payload.session_id,
                step = %step,
                "Invoking capability (attempt {}/{})",
                attempt,
                max_attempts
            );

            let started = Instant::now();
            let outcome = match tokio::time::timeout(timeout, capability.invoke(payload)).await {
                Ok(Ok(output)) if output.kind() == step => Ok(output),
                Ok(Ok(output)) => Err(CapabilityError::ServiceError(format!(
                    "capability returned {} output",
                    output.kind()
                ))),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(CapabilityError::Timeout),
            };

            match outcome {
                Ok(output) => {
                    self.breakers.record_success(step);
                    return Ok(StepResult {
                        output,
                        attempts: attempt,
                        duration: started.elapsed(),
                    });
                }
                Err(e) => {
                    self.breakers.record_failure(step);
                    log_dependency_error(payload.session_id, step, attempt, &e);

                    if !e.is_transient() || attempt >= max_attempts {
                        return Err(StepError {
                            step,
                            kind: e.kind(),
                            attempts: attempt,
                            retryable: false,
                            detail: e.to_string(),
                        });
                    }

                    let delay = self.apply_jitter(self.backoff_delay(attempt));
                    tracing::info!(
                        session_id = %payload.session_id,
                        step = %step,
                        "Retrying after {:?} (attempt {}/{})",
                        delay,
                        attempt,
                        max_attempts
                    );

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => {
                            return Err(StepError::cancelled(step, attempt));
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StepErrorKind;
    use crate::models::configuration::BreakerConfig;
    use crate::models::workflow::{StepKind, TextContent};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    /// Fails the first `failures` calls, then succeeds
    struct Flaky {
        calls: AtomicU32,
        failures: u32,
        error: CapabilityError,
    }

    impl Flaky {
        fn new(failures: u32, error: CapabilityError) -> Self {
            Self {
                calls: AtomicU32::new(0),
                failures,
                error,
            }
        }
    }

    #[async_trait]
    impl Capability for Flaky {
        async fn invoke(&self, _payload: &StepPayload) -> Result<StepOutput, CapabilityError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(self.error.clone());
            }
            Ok(StepOutput::ContentGeneration(TextContent {
                title: None,
                body: "generated".to_string(),
            }))
        }
    }

    struct Hangs;

    #[async_trait]
    impl Capability for Hangs {
        async fn invoke(&self, _payload: &StepPayload) -> Result<StepOutput, CapabilityError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Err(CapabilityError::ServiceError("unreachable".to_string()))
        }
    }

    fn executor() -> StepExecutor {
        let policy = RetryPolicy {
            jitter_factor: 0.0,
            ..RetryPolicy::default()
        };
        StepExecutor::new(
            Arc::new(CircuitBreakerRegistry::new(&BreakerConfig::default())),
            policy,
        )
    }

    fn payload() -> StepPayload {
        StepPayload {
            session_id: Uuid::new_v4(),
            step: StepKind::ContentGeneration,
            prompt: "launch post".to_string(),
            upstream: Vec::new(),
        }
    }

    #[test]
    fn test_backoff_doubles() {
        let executor = executor();
        assert_eq!(executor.backoff_delay(1), Duration::from_millis(500));
        assert_eq!(executor.backoff_delay(2), Duration::from_millis(1000));
        assert_eq!(executor.backoff_delay(3), Duration::from_millis(2000));
        assert_eq!(executor.backoff_delay(30), Duration::from_millis(10_000));
    }

    #[test]
    fn test_jitter_only_adds() {
        let executor = StepExecutor::new(
            Arc::new(CircuitBreakerRegistry::new(&BreakerConfig::default())),
            RetryPolicy::default(),
        );
        for _ in 0..50 {
            let delay = executor.apply_jitter(Duration::from_millis(500));
            assert!(delay >= Duration::from_millis(500));
            assert!(delay <= Duration::from_millis(600));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_retries() {
        let executor = executor();
        let capability = Flaky::new(2, CapabilityError::ServiceError("503".to_string()));

        let started = Instant::now();
        let result = executor
            .execute(
                &capability,
                &payload(),
                Duration::from_secs(10),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(result.attempts, 3);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(1500));
        assert!(elapsed < Duration::from_millis(1600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_exhaust_retries() {
        let executor = executor();

        let started = Instant::now();
        let err = executor
            .execute(
                &Hangs,
                &payload(),
                Duration::from_secs(10),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind, StepErrorKind::Timeout);
        assert_eq!(err.attempts, 3);
        assert!(!err.retryable);
        // Three 10s attempts plus 500ms and 1000ms of backoff
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(31_500));
        assert!(elapsed < Duration::from_millis(31_600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_payload_is_not_retried() {
        let executor = executor();
        let capability = Flaky::new(5, CapabilityError::InvalidPayload("bad".to_string()));

        let err = executor
            .execute(
                &capability,
                &payload(),
                Duration::from_secs(10),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind, StepErrorKind::InvalidPayload);
        assert_eq!(capability.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_open_breaker_fails_fast_without_calling() {
        let executor = executor();
        for _ in 0..5 {
            executor.breakers().record_failure(StepKind::ContentGeneration);
        }
        let capability = Flaky::new(0, CapabilityError::Timeout);

        let started = std::time::Instant::now();
        let err = executor
            .execute(
                &capability,
                &payload(),
                Duration::from_secs(10),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind, StepErrorKind::CircuitOpen);
        assert_eq!(capability.calls.load(Ordering::SeqCst), 0);
        assert!(started.elapsed() < Duration::from_millis(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let executor = executor();
        let capability = Flaky::new(5, CapabilityError::RateLimited("slow down".to_string()));
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let err = executor
            .execute(&capability, &payload(), Duration::from_secs(10), &cancel)
            .await
            .unwrap_err();

        assert_eq!(err.kind, StepErrorKind::Cancelled);
        assert_eq!(capability.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wrong_output_kind_is_a_failure() {
        let executor = executor();
        let capability = Flaky::new(0, CapabilityError::Timeout);
        let mut payload = payload();
        payload.step = StepKind::Packaging;

        let err = executor
            .execute(
                &capability,
                &payload,
                Duration::from_secs(10),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind, StepErrorKind::ServiceError);
    }
}
