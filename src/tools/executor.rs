//! 工具执行器
//!
//! 持有只读 ToolRegistry，execute(tool_name, args, timeout) 在超时内调用工具，
//! 超时或失败时转为 AgentError（Timeout / ToolExecutionFailed）；每次调用输出结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::time::timeout;

use crate::core::AgentError;
use crate::tools::ToolRegistry;

const ARGS_PREVIEW_CHARS: usize = 200;

/// 工具执行器：对每次调用施加超时，并将结果映射为 AgentError
#[derive(Clone)]
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// 执行指定工具；未注册返回 ToolNotFound，超时返回 Timeout，工具返回 Err 则转为 ToolExecutionFailed
    pub async fn execute(
        &self,
        tool_name: &str,
        args: Value,
        limit: Duration,
    ) -> Result<Value, AgentError> {
        let entry = self.registry.lookup(tool_name)?;
        let start = Instant::now();
        let args_preview = args_preview(&args);
        let result = timeout(limit, entry.tool.execute(args)).await;

        let (ok, outcome): (bool, &str) = match &result {
            Ok(Ok(_)) => (true, "ok"),
            Ok(Err(_)) => (false, "error"),
            Err(_) => (false, "timeout"),
        };
        let duration_ms = start.elapsed().as_millis() as u64;
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": tool_name,
            "ok": ok,
            "outcome": outcome,
            "duration_ms": duration_ms,
            "args_preview": args_preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        match result {
            Ok(Ok(content)) => Ok(content),
            Ok(Err(message)) => Err(AgentError::ToolExecutionFailed {
                tool: tool_name.to_string(),
                message,
            }),
            Err(_) => Err(AgentError::Timeout(format!(
                "tool {tool_name} exceeded {}ms",
                limit.as_millis()
            ))),
        }
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > ARGS_PREVIEW_CHARS {
        format!("{}...", s.chars().take(ARGS_PREVIEW_CHARS).collect::<String>())
    } else {
        s
    }
}
