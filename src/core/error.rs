//! 编排错误类型与恢复动作
//!
//! 与 RecoveryEngine 配合：根据 AgentError 决定重新提示 / 回退计划 / 重试 / 隔离分支 / 终止。
//! 只有 ConfigurationError 与「回退计划耗尽」会让请求以 error 状态结束，其余错误都降级为部分结果。

use thiserror::Error;

use crate::llm::LlmError;

/// 编排过程中可能出现的错误（规划、工具、超时、限流、配置、状态）
#[derive(Error, Debug)]
pub enum AgentError {
    /// 计划无法解析或校验失败（可通过重新提示与回退计划恢复）
    #[error("Planning error: {0}")]
    PlanningError(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Duplicate tool: {0}")]
    DuplicateTool(String),

    #[error("Tool execution failed ({tool}): {message}")]
    ToolExecutionFailed { tool: String, message: String },

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Rate limited (retry after {retry_after_ms:?} ms)")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("LLM error: {0}")]
    LlmError(LlmError),

    /// 缺少外部依赖或凭据：致命，立即上报，不重试
    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("All fallback plans exhausted: {0}")]
    FallbackExhausted(String),

    #[error("Duplicate execution: {0}")]
    DuplicateExecution(String),

    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("Checkpoint error: {0}")]
    CheckpointError(String),
}

impl AgentError {
    /// 是否应终止整个请求（其余错误一律降级处理）
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AgentError::ConfigError(_) | AgentError::FallbackExhausted(_)
        )
    }
}

impl From<LlmError> for AgentError {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::RateLimited { retry_after_ms } => AgentError::RateLimited { retry_after_ms },
            LlmError::Configuration(msg) => AgentError::ConfigError(msg),
            LlmError::Timeout(what) => AgentError::Timeout(what),
            other => AgentError::LlmError(other),
        }
    }
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryAction {
    /// 把校验错误附加到提示中，让 LLM 重新规划
    RetryWithPrompt(String),
    /// 放弃 LLM 计划，改用按查询类型选出的单步回退计划
    FallbackPlan,
    /// 按退避策略重试同一调用
    RetryWithBackoff,
    /// 记为终态失败并隔离在该分支内，其余分支继续执行
    IsolateBranch,
    /// 终止当前请求
    Abort,
}
