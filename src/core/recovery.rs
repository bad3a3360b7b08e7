//! 错误恢复引擎
//!
//! 根据 AgentError 类型返回 RecoveryAction，供 PlanningEngine 与 Orchestrator 决定是重新提示、
//! 回退计划、退避重试、隔离分支还是终止请求。

use crate::core::{AgentError, RecoveryAction};

/// 语义化错误恢复：将错误映射为可执行动作
#[derive(Debug, Default)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    /// 根据错误类型返回建议的恢复动作；replans_left 为规划阶段剩余的重新提示次数
    pub fn handle(&self, err: &AgentError, replans_left: usize) -> RecoveryAction {
        match err {
            AgentError::PlanningError(msg) | AgentError::ToolNotFound(msg) => {
                if replans_left > 0 {
                    RecoveryAction::RetryWithPrompt(format!(
                        "The previous plan was rejected: {msg}. \
                         Use only the tools listed above, reference outputs only as \
                         {{\"$ref\": \"<step_id>.output\"}} of earlier steps, and keep the \
                         dependencies acyclic. Return only the corrected JSON plan."
                    ))
                } else {
                    RecoveryAction::FallbackPlan
                }
            }
            AgentError::RateLimited { .. } | AgentError::LlmError(_) => {
                RecoveryAction::RetryWithBackoff
            }
            AgentError::ToolExecutionFailed { .. } | AgentError::Timeout(_) => {
                RecoveryAction::IsolateBranch
            }
            AgentError::ConfigError(_) | AgentError::FallbackExhausted(_) => RecoveryAction::Abort,
            _ => RecoveryAction::Abort,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recovery_planning_error_reprompts() {
        let engine = RecoveryEngine::new();
        let err = AgentError::PlanningError("cycle between s1 and s2".to_string());
        match engine.handle(&err, 1) {
            RecoveryAction::RetryWithPrompt(msg) => assert!(msg.contains("cycle between s1 and s2")),
            other => panic!("Expected RetryWithPrompt, got {other:?}"),
        }
    }

    #[test]
    fn test_recovery_planning_error_falls_back_when_budget_spent() {
        let engine = RecoveryEngine::new();
        let err = AgentError::ToolNotFound("chart_magic".to_string());
        assert_eq!(engine.handle(&err, 0), RecoveryAction::FallbackPlan);
    }

    #[test]
    fn test_recovery_rate_limit_backs_off() {
        let engine = RecoveryEngine::new();
        let err = AgentError::RateLimited { retry_after_ms: Some(500) };
        assert_eq!(engine.handle(&err, 0), RecoveryAction::RetryWithBackoff);
    }

    #[test]
    fn test_recovery_tool_failure_is_isolated() {
        let engine = RecoveryEngine::new();
        let err = AgentError::ToolExecutionFailed {
            tool: "search".to_string(),
            message: "boom".to_string(),
        };
        assert_eq!(engine.handle(&err, 0), RecoveryAction::IsolateBranch);
        assert_eq!(
            engine.handle(&AgentError::Timeout("search".to_string()), 0),
            RecoveryAction::IsolateBranch
        );
    }

    #[test]
    fn test_recovery_config_error_aborts() {
        let engine = RecoveryEngine::new();
        let err = AgentError::ConfigError("OPENAI_API_KEY missing".to_string());
        assert_eq!(engine.handle(&err, 3), RecoveryAction::Abort);
        assert!(err.is_fatal());
        assert!(!AgentError::Timeout("x".to_string()).is_fatal());
    }
}
