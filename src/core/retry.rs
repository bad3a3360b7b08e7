//! 统一的重试退避策略
//!
//! 工具调用与 LLM 调用共用同一个 RetryPolicy：指数退避、上限截断、可选抖动。

use std::time::Duration;

use rand::Rng;

use crate::tools::Reliability;

/// 重试策略：max_attempts 为总尝试次数（含首次）
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// 抖动比例（0.0 ~ 1.0），实际延迟在 [d * (1 - jitter), d] 之间
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            jitter: 0.0,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// 按工具可靠性等级派生：HIGH 重试 1 次，MEDIUM 2 次，LOW 3 次
    pub fn for_reliability(&self, reliability: Reliability) -> Self {
        Self {
            max_attempts: reliability.max_retries() + 1,
            ..self.clone()
        }
    }

    /// 最多可重试次数
    pub fn max_retries(&self) -> u32 {
        self.max_attempts.saturating_sub(1)
    }

    /// 第 retries_used 次重试前的等待时间（从 0 开始计数）
    pub fn backoff(&self, retries_used: u32) -> Duration {
        let base_ms = self.base_delay.as_millis();
        if base_ms == 0 {
            return Duration::ZERO;
        }
        let max_ms = self.max_delay.as_millis().max(base_ms);
        let shift = retries_used.min(20);
        let backoff_ms = base_ms.saturating_mul(1u128 << shift).min(max_ms);
        let millis = u64::try_from(backoff_ms).unwrap_or(u64::MAX);
        if self.jitter <= 0.0 || millis == 0 {
            return Duration::from_millis(millis);
        }
        let floor = (millis as f64 * (1.0 - self.jitter)) as u64;
        Duration::from_millis(rand::thread_rng().gen_range(floor..=millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(350));
        assert_eq!(policy.backoff(10), Duration::from_millis(350));
    }

    #[test]
    fn test_backoff_jitter_stays_in_range() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100), Duration::from_secs(1))
            .with_jitter(0.5);
        for _ in 0..50 {
            let d = policy.backoff(1);
            assert!(d >= Duration::from_millis(100) && d <= Duration::from_millis(200));
        }
    }

    #[test]
    fn test_zero_base_delay_never_sleeps() {
        let policy = RetryPolicy::new(4, Duration::ZERO, Duration::from_secs(1)).with_jitter(0.3);
        assert_eq!(policy.backoff(3), Duration::ZERO);
    }

    #[test]
    fn test_budget_from_reliability() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.for_reliability(Reliability::High).max_retries(), 1);
        assert_eq!(policy.for_reliability(Reliability::Medium).max_retries(), 2);
        assert_eq!(policy.for_reliability(Reliability::Low).max_retries(), 3);
    }
}
