//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / Mock）实现 LlmClient：complete(prompt) -> text。
//! 规划与答案合成都只依赖这一个方法；超时与调用错误均视为可重试。

use async_trait::async_trait;
use thiserror::Error;

/// LLM 调用错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    /// 供应商限流（429），可带建议等待时间
    #[error("rate limited (retry after {retry_after_ms:?} ms)")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("llm timeout: {0}")]
    Timeout(String),

    #[error("llm request failed: {0}")]
    Request(String),

    /// 缺少凭据或配置错误：不可重试
    #[error("llm configuration error: {0}")]
    Configuration(String),
}

impl LlmError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, LlmError::Configuration(_))
    }
}

/// LLM 客户端 trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 非流式完成：单条提示词，返回完整文本
    async fn complete(&self, prompt: &str) -> Result<String, LlmError>;

    /// 后端名称，用于日志
    fn name(&self) -> &str {
        "llm"
    }
}
