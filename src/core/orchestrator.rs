//! 编排器：一次查询的完整生命周期
//!
//! 创建执行上下文 → PlanningEngine 生成计划 → ExecutionEngine 执行 → 汇总步骤结果合成答案 → 清理上下文。
//! 清理由 Drop 守卫保证，无论成功、出错还是调用方中途放弃 future 都会执行。
//! 流式变体在后台任务中运行同一流程，把推理步骤、工具执行事件与最终答案依次发到通道。

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::config::AppConfig;
use crate::core::{AgentError, TaskScheduler};
use crate::execution::{
    EventSink, ExecutionEngine, ExecutionEvent, ExecutionReport, ExecutionSummary, StepStatus,
};
use crate::llm::{LlmClient, RetryingLlmClient};
use crate::planning::{ConversationTurn, Plan, PlanningEngine};
use crate::state::{StateManager, TraceEvent};
use crate::tools::ToolRegistry;

/// 合成提示中单个步骤输出的最大字符数
const OUTPUT_PREVIEW_CHARS: usize = 2000;
/// 确定性摘要中单个步骤输出的最大字符数
const DIGEST_PREVIEW_CHARS: usize = 300;

/// 入站请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    pub session_id: String,
    #[serde(default)]
    pub active_documents: Vec<String>,
    #[serde(default)]
    pub history: Vec<ConversationTurn>,
}

impl QueryRequest {
    pub fn new(query: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            session_id: session_id.into(),
            active_documents: Vec::new(),
            history: Vec::new(),
        }
    }

    pub fn with_documents<I, S>(mut self, documents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.active_documents = documents.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_history(mut self, history: Vec<ConversationTurn>) -> Self {
        self.history = history;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    /// 没有失败步骤
    Success,
    /// 部分步骤失败或因截止被跳过，答案基于剩余结果
    Partial,
    /// 配置错误或回退计划耗尽
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub execution_id: String,
    pub status: ResponseStatus,
    pub final_answer: String,
    pub confidence_score: f64,
    pub execution_summary: ExecutionSummary,
    pub traceability_log: Vec<TraceEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<Plan>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// 流式事件
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    ReasoningStep {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<Value>,
    },
    ToolExecution {
        event: ExecutionEvent,
    },
    FinalAnswer {
        response: Box<QueryResponse>,
    },
    Error {
        message: String,
    },
}

/// 作用域结束时释放执行上下文
struct CleanupGuard<'a> {
    state: &'a StateManager,
    execution_id: &'a str,
}

impl Drop for CleanupGuard<'_> {
    fn drop(&mut self) {
        self.state.cleanup_execution(self.execution_id);
    }
}

pub struct Orchestrator {
    registry: Arc<ToolRegistry>,
    planner: PlanningEngine,
    executor: ExecutionEngine,
    synthesizer: Arc<dyn LlmClient>,
    state: Arc<StateManager>,
}

impl Orchestrator {
    /// 规划与合成共用一个带限流重试的 LLM 包装，工具执行与之分属不同许可池
    pub fn new(
        config: &AppConfig,
        registry: Arc<ToolRegistry>,
        llm: Arc<dyn LlmClient>,
        state: Arc<StateManager>,
    ) -> Self {
        let scheduler = Arc::new(TaskScheduler::new(
            config.execution.max_parallel_steps,
            config.llm_concurrency(),
        ));
        let llm: Arc<dyn LlmClient> = Arc::new(RetryingLlmClient::new(
            llm,
            Arc::clone(&scheduler),
            config.llm.retry_policy(),
            config.llm.request_timeout(),
        ));
        Self {
            planner: PlanningEngine::new(Arc::clone(&llm), Arc::clone(&registry), &config.planning),
            executor: ExecutionEngine::new(
                Arc::clone(&registry),
                scheduler,
                config.execution.clone(),
            ),
            synthesizer: llm,
            registry,
            state,
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn state(&self) -> &Arc<StateManager> {
        &self.state
    }

    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        self.executor.scheduler()
    }

    pub async fn execute_query(&self, request: QueryRequest) -> QueryResponse {
        self.run(request, None).await
    }

    /// 流式执行：返回事件接收端；出错时先发 error，最后一条总是 final_answer
    pub fn execute_query_stream(
        self: &Arc<Self>,
        request: QueryRequest,
    ) -> mpsc::UnboundedReceiver<StreamEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let response = this.run(request, Some(&tx)).await;
            if let Some(message) = &response.error {
                let _ = tx.send(StreamEvent::Error {
                    message: message.clone(),
                });
            }
            let _ = tx.send(StreamEvent::FinalAnswer {
                response: Box::new(response),
            });
        });
        rx
    }

    async fn run(
        &self,
        request: QueryRequest,
        stream: Option<&mpsc::UnboundedSender<StreamEvent>>,
    ) -> QueryResponse {
        let execution_id = uuid::Uuid::new_v4().to_string();
        if let Err(e) = self.state.create_execution_context(
            &execution_id,
            &request.session_id,
            &request.query,
            &request.active_documents,
        ) {
            return error_response(&execution_id, e, Vec::new());
        }
        let _guard = CleanupGuard {
            state: &self.state,
            execution_id: &execution_id,
        };
        tracing::info!(execution_id = %execution_id, session_id = %request.session_id, "query received");
        self.trace(
            &execution_id,
            "query_received",
            serde_json::json!({
                "query": request.query,
                "session_id": request.session_id,
                "active_documents": request.active_documents,
            }),
        );

        let mut response = self.run_tracked(&execution_id, &request, stream).await;
        if let Err(e) = self.state.complete_execution(&execution_id) {
            tracing::warn!(execution_id = %execution_id, error = %e, "complete_execution failed");
        }
        response.traceability_log = self.state.trace(&execution_id).unwrap_or_default();
        tracing::info!(
            execution_id = %execution_id,
            status = ?response.status,
            confidence = response.confidence_score,
            "query finished"
        );
        response
    }

    async fn run_tracked(
        &self,
        execution_id: &str,
        request: &QueryRequest,
        stream: Option<&mpsc::UnboundedSender<StreamEvent>>,
    ) -> QueryResponse {
        let ctx = self.planner.context(
            &request.query,
            &request.session_id,
            &request.active_documents,
            &request.history,
        );
        reason(
            stream,
            format!("query classified as {}", ctx.query_type),
            Some(serde_json::json!({ "available_tools": ctx.available_tools })),
        );

        let plan = match self.planner.plan(&ctx).await {
            Ok(plan) => plan,
            Err(e) => {
                tracing::error!(execution_id, error = %e, "planning failed");
                self.trace(execution_id, "planning_failed", serde_json::json!({ "error": e.to_string() }));
                return error_response(execution_id, e, Vec::new());
            }
        };
        if let Err(e) = self.state.record_plan(execution_id, &plan) {
            tracing::warn!(execution_id, error = %e, "plan not recorded");
        }
        let plan_detail = serde_json::json!({
            "plan_id": plan.id,
            "strategy": plan.strategy,
            "replans": plan.replans,
            "steps": plan.steps.iter().map(|s| serde_json::json!({
                "id": s.id,
                "tool": s.tool,
                "depends_on": s.dependencies,
                "condition": s.condition.to_string(),
            })).collect::<Vec<_>>(),
        });
        self.trace(execution_id, "plan_created", plan_detail.clone());
        reason(
            stream,
            format!("plan {} with {} step(s)", plan.id, plan.len()),
            Some(plan_detail),
        );

        let report = self.execute_plan(execution_id, &plan, stream).await;

        reason(stream, "synthesizing answer".to_string(), None);
        let (final_answer, source) = self.synthesize(request, &plan, &report).await;
        self.trace(
            execution_id,
            "answer_synthesized",
            serde_json::json!({ "source": source, "chars": final_answer.chars().count() }),
        );

        let status = if report.summary.failed > 0 || report.summary.deadline_exceeded {
            ResponseStatus::Partial
        } else {
            ResponseStatus::Success
        };
        QueryResponse {
            execution_id: execution_id.to_string(),
            status,
            final_answer,
            confidence_score: report.summary.confidence,
            execution_summary: report.summary,
            traceability_log: Vec::new(),
            plan: Some(plan),
            error: None,
        }
    }

    /// 执行计划；流式时把执行事件转发为 tool_execution
    async fn execute_plan(
        &self,
        execution_id: &str,
        plan: &Plan,
        stream: Option<&mpsc::UnboundedSender<StreamEvent>>,
    ) -> ExecutionReport {
        let sink = EventSink::new().with_state(Arc::clone(&self.state), execution_id);
        let Some(stream) = stream else {
            return self.executor.execute(plan, &sink).await;
        };

        let (tx, mut rx) = mpsc::unbounded_channel::<ExecutionEvent>();
        let out = stream.clone();
        let forward = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let _ = out.send(StreamEvent::ToolExecution { event });
            }
        });
        let sink = sink.with_sender(tx);
        let report = self.executor.execute(plan, &sink).await;
        drop(sink);
        // 等待转发完成，保证工具事件先于最终答案
        let _ = forward.await;
        report
    }

    /// LLM 合成答案；失败或为空时退回确定性摘要
    async fn synthesize(
        &self,
        request: &QueryRequest,
        plan: &Plan,
        report: &ExecutionReport,
    ) -> (String, &'static str) {
        if report.summary.completed == 0 {
            return (digest(request, plan, report), "digest");
        }
        let prompt = synthesis_prompt(request, plan, report);
        match self.synthesizer.complete(&prompt).await {
            Ok(text) if !text.trim().is_empty() => (text.trim().to_string(), "llm"),
            Ok(_) => {
                tracing::warn!("empty synthesis, using digest");
                (digest(request, plan, report), "digest")
            }
            Err(e) => {
                tracing::warn!(error = %e, "synthesis failed, using digest");
                (digest(request, plan, report), "digest")
            }
        }
    }

    fn trace(&self, execution_id: &str, kind: &str, detail: Value) {
        if let Err(e) = self
            .state
            .record_event(execution_id, TraceEvent::new(kind, None, detail))
        {
            tracing::warn!(execution_id, kind, error = %e, "trace event dropped");
        }
    }
}

fn reason(stream: Option<&mpsc::UnboundedSender<StreamEvent>>, message: String, detail: Option<Value>) {
    tracing::debug!(message = %message, "reasoning step");
    if let Some(tx) = stream {
        let _ = tx.send(StreamEvent::ReasoningStep { message, detail });
    }
}

fn error_response(execution_id: &str, err: AgentError, trace: Vec<TraceEvent>) -> QueryResponse {
    QueryResponse {
        execution_id: execution_id.to_string(),
        status: ResponseStatus::Error,
        final_answer: format!("I could not complete this request: {err}"),
        confidence_score: 0.0,
        execution_summary: ExecutionSummary::default(),
        traceability_log: trace,
        plan: None,
        error: Some(err.to_string()),
    }
}

fn preview(value: &Value, max_chars: usize) -> String {
    let text = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    if text.chars().count() > max_chars {
        format!("{}...", text.chars().take(max_chars).collect::<String>())
    } else {
        text
    }
}

fn synthesis_prompt(request: &QueryRequest, plan: &Plan, report: &ExecutionReport) -> String {
    let mut prompt = String::new();
    prompt.push_str("Answer the user's request using only the tool results below.\n");
    prompt.push_str("If some steps failed or were skipped, say what is missing instead of guessing.\n\n");
    prompt.push_str(&format!("## Request\n{}\n\n## Tool results\n", request.query));
    for result in report.ordered(plan) {
        match result.status {
            StepStatus::Completed => prompt.push_str(&format!(
                "### {} ({}) completed, confidence {:.2}\n{}\n\n",
                result.step_id,
                result.tool,
                result.confidence,
                preview(&result.output, OUTPUT_PREVIEW_CHARS)
            )),
            StepStatus::Failed => prompt.push_str(&format!(
                "### {} ({}) failed: {}\n\n",
                result.step_id,
                result.tool,
                result.error.as_deref().unwrap_or("unknown error")
            )),
            StepStatus::Skipped => prompt.push_str(&format!(
                "### {} ({}) skipped: {}\n\n",
                result.step_id,
                result.tool,
                result.skip_reason.as_deref().unwrap_or("not run")
            )),
            StepStatus::Pending | StepStatus::Running => {}
        }
    }
    prompt.push_str("## Answer\n");
    prompt
}

/// 不依赖 LLM 的确定性摘要：按计划顺序列出各步骤结果
pub fn digest(request: &QueryRequest, plan: &Plan, report: &ExecutionReport) -> String {
    let mut lines = vec![format!("Results for: {}", request.query)];
    for result in report.ordered(plan) {
        let line = match result.status {
            StepStatus::Completed => format!(
                "- [{}] {}: {}",
                result.step_id,
                result.tool,
                preview(&result.output, DIGEST_PREVIEW_CHARS)
            ),
            StepStatus::Failed => format!(
                "- [{}] {} failed: {}",
                result.step_id,
                result.tool,
                result.error.as_deref().unwrap_or("unknown error")
            ),
            StepStatus::Skipped => format!(
                "- [{}] {} skipped ({})",
                result.step_id,
                result.tool,
                result.skip_reason.as_deref().unwrap_or("not run")
            ),
            StepStatus::Pending | StepStatus::Running => continue,
        };
        lines.push(line);
    }
    if report.summary.completed == 0 {
        lines.push("No step produced a result.".to_string());
    }
    lines.join("\n")
}
