//! 执行上下文：单次请求的进度与追踪日志

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::execution::StepResult;

/// 上下文生命周期
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Active,
    Completed,
    Cleaned,
}

/// 追踪日志中的一条事件；seq 由 StateManager 追加时分配
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(default)]
    pub detail: Value,
}

impl TraceEvent {
    pub fn new(kind: impl Into<String>, step_id: Option<String>, detail: Value) -> Self {
        Self {
            seq: 0,
            timestamp: Utc::now(),
            kind: kind.into(),
            step_id,
            detail,
        }
    }
}

/// 单次执行的可追踪状态（也是检查点记录的内容）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub execution_id: String,
    pub session_id: String,
    pub query: String,
    pub active_documents: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub state: LifecycleState,
    /// 本次执行的计划（JSON），规划完成后写入
    #[serde(default)]
    pub plan: Option<Value>,
    #[serde(default)]
    pub steps: BTreeMap<String, StepResult>,
    /// 只追加
    #[serde(default)]
    pub events: Vec<TraceEvent>,
}

impl ExecutionContext {
    pub fn new(
        execution_id: impl Into<String>,
        session_id: impl Into<String>,
        query: impl Into<String>,
        active_documents: Vec<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            execution_id: execution_id.into(),
            session_id: session_id.into(),
            query: query.into(),
            active_documents,
            created_at: now,
            updated_at: now,
            state: LifecycleState::Active,
            plan: None,
            steps: BTreeMap::new(),
            events: Vec::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == LifecycleState::Active
    }

    /// 追加事件并返回分配的序号
    pub fn append(&mut self, mut event: TraceEvent) -> u64 {
        let seq = self.events.len() as u64;
        event.seq = seq;
        self.events.push(event);
        self.updated_at = Utc::now();
        seq
    }

    pub fn upsert_step(&mut self, result: StepResult) {
        self.steps.insert(result.step_id.clone(), result);
        self.updated_at = Utc::now();
    }
}
