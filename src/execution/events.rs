//! 执行生命周期事件
//!
//! ExecutionEngine 在每个状态变化时通过 EventSink 发出事件：写入 StateManager 的追踪日志，
//! 并转发给可选的调用方通道（流式接口使用）。

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::execution::{ExecutionSummary, StepResult};
use crate::state::{StateManager, TraceEvent};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ExecutionEvent {
    PlanStarted {
        plan_id: String,
        steps: usize,
    },
    StepDispatched {
        step_id: String,
        tool: String,
        params: Value,
    },
    StepRetrying {
        step_id: String,
        tool: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    StepCompleted {
        step_id: String,
        tool: String,
        attempts: u32,
        confidence: f64,
        execution_time_ms: u64,
    },
    StepFailed {
        step_id: String,
        tool: String,
        attempts: u32,
        error: String,
    },
    StepSkipped {
        step_id: String,
        tool: String,
        reason: String,
    },
    PlanFinished {
        summary: ExecutionSummary,
    },
}

impl ExecutionEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ExecutionEvent::PlanStarted { .. } => "plan_started",
            ExecutionEvent::StepDispatched { .. } => "step_dispatched",
            ExecutionEvent::StepRetrying { .. } => "step_retrying",
            ExecutionEvent::StepCompleted { .. } => "step_completed",
            ExecutionEvent::StepFailed { .. } => "step_failed",
            ExecutionEvent::StepSkipped { .. } => "step_skipped",
            ExecutionEvent::PlanFinished { .. } => "plan_finished",
        }
    }

    pub fn step_id(&self) -> Option<&str> {
        match self {
            ExecutionEvent::StepDispatched { step_id, .. }
            | ExecutionEvent::StepRetrying { step_id, .. }
            | ExecutionEvent::StepCompleted { step_id, .. }
            | ExecutionEvent::StepFailed { step_id, .. }
            | ExecutionEvent::StepSkipped { step_id, .. } => Some(step_id),
            ExecutionEvent::PlanStarted { .. } | ExecutionEvent::PlanFinished { .. } => None,
        }
    }
}

impl From<&ExecutionEvent> for TraceEvent {
    fn from(event: &ExecutionEvent) -> Self {
        let detail = serde_json::to_value(event).unwrap_or(Value::Null);
        TraceEvent::new(event.kind(), event.step_id().map(str::to_string), detail)
    }
}

/// 事件出口：状态管理器（按执行 ID）与调用方通道，均可选
#[derive(Clone, Default)]
pub struct EventSink {
    state: Option<(Arc<StateManager>, String)>,
    sender: Option<mpsc::UnboundedSender<ExecutionEvent>>,
}

impl EventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(mut self, state: Arc<StateManager>, execution_id: impl Into<String>) -> Self {
        self.state = Some((state, execution_id.into()));
        self
    }

    pub fn with_sender(mut self, sender: mpsc::UnboundedSender<ExecutionEvent>) -> Self {
        self.sender = Some(sender);
        self
    }

    pub fn emit(&self, event: ExecutionEvent) {
        if let Some((state, execution_id)) = &self.state {
            if let Err(e) = state.record_event(execution_id, TraceEvent::from(&event)) {
                tracing::warn!(execution_id = %execution_id, error = %e, "trace event dropped");
            }
        }
        if let Some(tx) = &self.sender {
            // 接收端已关闭时忽略
            let _ = tx.send(event);
        }
    }

    pub fn record_result(&self, result: &StepResult) {
        if let Some((state, execution_id)) = &self.state {
            if let Err(e) = state.record_step_result(execution_id, result.clone()) {
                tracing::warn!(execution_id = %execution_id, step_id = %result.step_id, error = %e, "step result dropped");
            }
        }
    }
}
