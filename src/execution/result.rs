//! 步骤结果与执行汇总

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::planning::{Plan, Step, StepView};

/// 步骤状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        }
    }
}

/// 单个步骤的执行结果（进行中或终态）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub tool: String,
    pub status: StepStatus,
    /// 工具输出；跳过或失败时为与输出形状匹配的空值
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// 跳过原因：条件不满足或计划截止
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    pub confidence: f64,
    pub execution_time_ms: u64,
    /// 实际调用次数（含首次）
    pub attempts: u32,
    /// 占位符解析后的参数
    #[serde(default)]
    pub params: Value,
}

impl StepResult {
    pub fn pending(step: &Step) -> Self {
        Self {
            step_id: step.id.clone(),
            tool: step.tool.clone(),
            status: StepStatus::Pending,
            output: Value::Null,
            error: None,
            skip_reason: None,
            confidence: 0.0,
            execution_time_ms: 0,
            attempts: 0,
            params: Value::Null,
        }
    }

    /// 已用掉的重试次数
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }

    /// 供条件求值的 JSON 视图
    pub fn view(&self) -> Value {
        let succeeded = self.status == StepStatus::Completed;
        let failed = self.status == StepStatus::Failed;
        serde_json::json!({
            "status": self.status.as_str(),
            "output": self.output,
            "error": self.error,
            "confidence": self.confidence,
            "attempts": self.attempts,
            "success": succeeded,
            "succeeded": succeeded,
            "failure": failed,
            "failed": failed,
        })
    }
}

impl StepView for HashMap<String, StepResult> {
    fn step_view(&self, step_id: &str) -> Option<Value> {
        self.get(step_id).map(StepResult::view)
    }
}

/// 执行汇总
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub total_steps: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub wall_time_ms: u64,
    /// 同时运行步骤数的峰值
    pub peak_parallelism: usize,
    /// 计划级置信度
    pub confidence: f64,
    pub deadline_exceeded: bool,
}

/// 一次计划执行的完整结果
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub plan_id: String,
    pub results: HashMap<String, StepResult>,
    /// 步骤进入终态的真实顺序
    pub completion_order: Vec<String>,
    pub summary: ExecutionSummary,
}

impl ExecutionReport {
    pub fn result(&self, step_id: &str) -> Option<&StepResult> {
        self.results.get(step_id)
    }

    /// 按计划声明顺序返回结果
    pub fn ordered<'a>(&'a self, plan: &'a Plan) -> impl Iterator<Item = &'a StepResult> + 'a {
        plan.steps.iter().filter_map(|s| self.results.get(&s.id))
    }
}
