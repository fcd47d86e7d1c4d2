use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use types::{Context, Decision, Provider, ProviderError, ProviderId, ReliabilityConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_millis(250),
            backoff_max: Duration::from_secs(2),
        }
    }
}

impl From<&ReliabilityConfig> for RetryPolicy {
    fn from(config: &ReliabilityConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            backoff_max: Duration::from_millis(config.backoff_max_ms),
        }
    }
}

impl RetryPolicy {
    fn normalized(self) -> Self {
        let max_attempts = self.max_attempts.max(1);
        let backoff_base = if self.backoff_base.is_zero() {
            Duration::from_millis(1)
        } else {
            self.backoff_base
        };
        let backoff_max = if self.backoff_max < backoff_base {
            backoff_base
        } else {
            self.backoff_max
        };
        Self {
            max_attempts,
            backoff_base,
            backoff_max,
        }
    }

    pub(crate) fn backoff_delay_for_attempt(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        let factor = 1_u128 << shift;
        let base = self.backoff_base.as_millis();
        let max = self.backoff_max.as_millis();
        let delay_ms = (base.saturating_mul(factor)).min(max);
        let delay_ms_u64 = u64::try_from(delay_ms).unwrap_or(u64::MAX);
        Duration::from_millis(delay_ms_u64)
    }
}

/// Retries transient provider failures with capped exponential backoff.
pub struct ReliableProvider {
    inner: Arc<dyn Provider>,
    retry_policy: RetryPolicy,
}

impl ReliableProvider {
    pub fn with_defaults(inner: Arc<dyn Provider>) -> Self {
        Self::from_arc(inner, RetryPolicy::default())
    }

    pub fn from_arc(inner: Arc<dyn Provider>, retry_policy: RetryPolicy) -> Self {
        Self {
            inner,
            retry_policy: retry_policy.normalized(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry_policy
    }

    async fn decide_with_retry(&self, context: &Context) -> Result<Decision, ProviderError> {
        let mut attempt = 1_u32;
        loop {
            match self.inner.decide(context).await {
                Ok(decision) => return Ok(decision),
                Err(error) => {
                    if !is_retriable_provider_error(&error)
                        || attempt >= self.retry_policy.max_attempts
                    {
                        return Err(error);
                    }

                    let delay = self.retry_policy.backoff_delay_for_attempt(attempt);
                    tracing::warn!(
                        provider = %self.inner.provider_id(),
                        attempt,
                        max_attempts = self.retry_policy.max_attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %error,
                        "retrying provider decision after transient failure"
                    );
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[async_trait]
impl Provider for ReliableProvider {
    fn provider_id(&self) -> &ProviderId {
        self.inner.provider_id()
    }

    async fn decide(&self, context: &Context) -> Result<Decision, ProviderError> {
        self.decide_with_retry(context).await
    }
}

pub(crate) fn is_retriable_provider_error(error: &ProviderError) -> bool {
    match error {
        ProviderError::Transport { .. } => true,
        ProviderError::HttpStatus { status, .. } => *status == 429 || *status >= 500,
        _ => false,
    }
}
