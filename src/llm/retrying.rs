//! 带限流、超时与重试的 LLM 包装
//!
//! 每次调用先从 TaskScheduler 的 LLM 许可池拿许可（与工具执行池分开），再在超时内调用内层客户端；
//! 限流、超时、请求失败按 RetryPolicy 指数退避重试，Configuration 错误立即返回。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::core::{RetryPolicy, TaskScheduler};
use crate::llm::{LlmClient, LlmError};

pub struct RetryingLlmClient {
    inner: Arc<dyn LlmClient>,
    scheduler: Arc<TaskScheduler>,
    policy: RetryPolicy,
    timeout: Duration,
}

impl RetryingLlmClient {
    pub fn new(
        inner: Arc<dyn LlmClient>,
        scheduler: Arc<TaskScheduler>,
        policy: RetryPolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            inner,
            scheduler,
            policy,
            timeout,
        }
    }

    async fn attempt(&self, prompt: &str) -> Result<String, LlmError> {
        let _permit = self
            .scheduler
            .acquire_llm()
            .await
            .ok_or_else(|| LlmError::Request("llm limiter closed".to_string()))?;
        match tokio::time::timeout(self.timeout, self.inner.complete(prompt)).await {
            Ok(result) => result,
            Err(_) => Err(LlmError::Timeout(format!(
                "no response within {}ms",
                self.timeout.as_millis()
            ))),
        }
    }
}

#[async_trait]
impl LlmClient for RetryingLlmClient {
    async fn complete(&self, prompt: &str) -> Result<String, LlmError> {
        let mut retries = 0u32;
        loop {
            match self.attempt(prompt).await {
                Ok(text) => return Ok(text),
                Err(e) if e.is_retryable() && retries < self.policy.max_retries() => {
                    // 限流且服务端给出等待时间时以其为准
                    let delay = match &e {
                        LlmError::RateLimited {
                            retry_after_ms: Some(ms),
                        } => Duration::from_millis(*ms).min(self.policy.max_delay),
                        _ => self.policy.backoff(retries),
                    };
                    tracing::warn!(
                        llm = %self.inner.name(),
                        attempt = retries + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "llm call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    retries += 1;
                }
                Err(e) => {
                    tracing::error!(llm = %self.inner.name(), attempts = retries + 1, error = %e, "llm call failed");
                    return Err(e);
                }
            }
        }
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TaskKind;
    use crate::llm::MockLlmClient;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(1), Duration::from_millis(5))
    }

    #[tokio::test]
    async fn test_rate_limit_retried_until_success() {
        let mock = Arc::new(MockLlmClient::new());
        mock.push(Err(LlmError::RateLimited { retry_after_ms: Some(1) }));
        mock.push(Err(LlmError::Timeout("slow".into())));
        mock.push(Ok("done".into()));
        let client = RetryingLlmClient::new(
            mock.clone(),
            Arc::new(TaskScheduler::new(4, 1)),
            policy(3),
            Duration::from_secs(1),
        );
        assert_eq!(client.complete("p").await.unwrap(), "done");
        assert_eq!(mock.calls(), 3);
    }

    #[tokio::test]
    async fn test_budget_exhausted_returns_last_error() {
        let mock = Arc::new(MockLlmClient::new());
        mock.push(Err(LlmError::RateLimited { retry_after_ms: None }));
        let client = RetryingLlmClient::new(
            mock.clone(),
            Arc::new(TaskScheduler::new(4, 1)),
            policy(2),
            Duration::from_secs(1),
        );
        let err = client.complete("p").await.unwrap_err();
        assert!(matches!(err, LlmError::RateLimited { .. }));
        assert_eq!(mock.calls(), 2);
    }

    #[tokio::test]
    async fn test_configuration_error_not_retried() {
        let mock = Arc::new(MockLlmClient::new());
        mock.push(Err(LlmError::Configuration("no key".into())));
        let scheduler = Arc::new(TaskScheduler::new(4, 1));
        let client = RetryingLlmClient::new(mock.clone(), scheduler.clone(), policy(5), Duration::from_secs(1));
        assert!(client.complete("p").await.is_err());
        assert_eq!(mock.calls(), 1);
        assert_eq!(scheduler.running(TaskKind::LlmCall), 0);
    }
}
