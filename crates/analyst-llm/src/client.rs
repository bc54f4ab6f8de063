//! Completion service seam and the retrying client
//!
//! [`CompletionService`] is one call to an external text-completion backend.
//! [`CompletionClient`] wraps a service with prompt truncation and the
//! workspace's bounded-retry combinator.

use crate::error::LlmError;
use crate::prompt::truncate_prompt;
use analyst_core::retry::{retry, Disposition, RetryPolicy};
use analyst_core::CompletionConfig;
use async_trait::async_trait;
use std::sync::Arc;

/// One completion call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionRequest {
    /// Optional system message
    pub system: Option<String>,
    pub prompt: String,
}

impl CompletionRequest {
    #[inline]
    #[must_use]
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            system: None,
            prompt: prompt.into(),
        }
    }

    #[inline]
    #[must_use]
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }
}

impl From<&str> for CompletionRequest {
    fn from(prompt: &str) -> Self {
        Self::new(prompt)
    }
}

impl From<String> for CompletionRequest {
    fn from(prompt: String) -> Self {
        Self::new(prompt)
    }
}

/// External text-completion backend
///
/// Implementations make exactly one attempt and classify failures via
/// [`LlmError::is_transient`] / [`LlmError::is_fatal`]; retrying is the
/// client's job.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CompletionService: Send + Sync {
    /// Single completion attempt
    async fn complete(
        &self,
        request: &CompletionRequest,
        config: &CompletionConfig,
    ) -> Result<String, LlmError>;
}

/// Successful completion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    /// Service calls it took
    pub attempts: u32,
}

/// Retrying completion client
#[derive(Clone)]
pub struct CompletionClient {
    service: Arc<dyn CompletionService>,
    policy: RetryPolicy,
}

impl std::fmt::Debug for CompletionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionClient")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

fn classify(error: &LlmError) -> Disposition {
    if error.is_transient() {
        Disposition::Retry
    } else {
        Disposition::Abort
    }
}

impl CompletionClient {
    /// Create client over `service`
    #[must_use]
    pub fn new(service: Arc<dyn CompletionService>, policy: RetryPolicy) -> Self {
        Self { service, policy }
    }

    /// Retry policy in force
    #[inline]
    #[must_use]
    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Complete `request`, retrying transient failures
    ///
    /// # Errors
    /// - `TransientExhausted` once the retry budget is spent
    /// - the fatal error itself, without retrying
    pub async fn complete(
        &self,
        request: impl Into<CompletionRequest>,
        config: &CompletionConfig,
    ) -> Result<Completion, LlmError> {
        let mut request = request.into();
        if request.prompt.trim().is_empty() {
            return Err(LlmError::InvalidRequest("empty prompt".into()));
        }
        if let std::borrow::Cow::Owned(cut) =
            truncate_prompt(&request.prompt, config.max_prompt_chars)
        {
            request.prompt = cut;
        }

        let service = &self.service;
        let request = &request;
        let outcome = retry(self.policy, classify, move |attempt| async move {
            tracing::info!(attempt, model = %config.model, "completion attempt");
            let result = service.complete(request, config).await;
            match &result {
                Ok(text) => tracing::info!(attempt, chars = text.len(), "completion succeeded"),
                Err(e) => tracing::warn!(
                    attempt,
                    transient = e.is_transient(),
                    error = %e,
                    "completion attempt failed"
                ),
            }
            result
        })
        .await;

        match outcome {
            Ok(done) => Ok(Completion {
                text: done.value,
                attempts: done.attempts,
            }),
            Err(failed) if failed.is_exhausted() => Err(LlmError::TransientExhausted {
                attempts: failed.attempts,
                last: Box::new(failed.error),
            }),
            Err(failed) => Err(failed.error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::Sequence;
    use std::time::Duration;

    fn rate_limited() -> LlmError {
        LlmError::RateLimited("429".into())
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_from_rate_limits() {
        let mut service = MockCompletionService::new();
        let mut seq = Sequence::new();
        service
            .expect_complete()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(rate_limited()));
        service
            .expect_complete()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok("1. load data".into()));

        let client = CompletionClient::new(Arc::new(service), RetryPolicy::linear(3, 1_000));
        let started = tokio::time::Instant::now();
        let completion = client
            .complete("plan this", &CompletionConfig::default())
            .await
            .unwrap();

        assert_eq!(completion.text, "1. load data");
        assert_eq!(completion.attempts, 3);
        assert!(started.elapsed() >= Duration::from_millis(3_000));
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_surfaces_transient_exhausted() {
        let mut service = MockCompletionService::new();
        service
            .expect_complete()
            .times(4)
            .returning(|_, _| Err(rate_limited()));

        let client = CompletionClient::new(Arc::new(service), RetryPolicy::linear(3, 10));
        let err = client
            .complete("x", &CompletionConfig::default())
            .await
            .unwrap_err();

        assert_eq!(
            err,
            LlmError::TransientExhausted {
                attempts: 4,
                last: Box::new(rate_limited())
            }
        );
    }

    #[tokio::test]
    async fn fatal_error_is_not_retried() {
        let mut service = MockCompletionService::new();
        service
            .expect_complete()
            .times(1)
            .returning(|_, _| Err(LlmError::Authentication("bad key".into())));

        let client = CompletionClient::new(Arc::new(service), RetryPolicy::linear(3, 1_000));
        let err = client
            .complete("x", &CompletionConfig::default())
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn long_prompts_are_truncated_before_sending() {
        let mut service = MockCompletionService::new();
        service
            .expect_complete()
            .withf(|req, _| req.prompt.contains("[TRUNCATED FOR LENGTH]") && req.prompt.len() < 400)
            .times(1)
            .returning(|_, _| Ok("ok".into()));

        let config = CompletionConfig {
            max_prompt_chars: 200,
            ..CompletionConfig::default()
        };
        let client = CompletionClient::new(Arc::new(service), RetryPolicy::immediate(0));
        client.complete("y".repeat(5_000), &config).await.unwrap();
    }

    #[tokio::test]
    async fn empty_prompt_is_rejected_without_calling() {
        let mut service = MockCompletionService::new();
        service.expect_complete().never();

        let client = CompletionClient::new(Arc::new(service), RetryPolicy::default());
        let err = client
            .complete("   ", &CompletionConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::InvalidRequest(_)));
    }
}
