//! 执行引擎：按依赖关系并行执行计划
//!
//! 就绪队列 + 在途集合（FuturesUnordered）：步骤的全部依赖进入终态后进入就绪队列，
//! 先求值条件，不满足则直接标记跳过并继续向下释放；满足则在拿到工具许可后派发。
//! 在途步骤完成即登记结果并释放后继，与其他在途步骤的快慢无关。
//! 计划截止时间到达后：通过 CancellationToken 通知在途步骤（记为失败），其余未派发步骤记为跳过。
//! 依赖或条件指向计划外步骤、或处在依赖环上的步骤记为跳过（unreachable），结束时不留 pending 步骤。

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use futures_util::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::ExecutionSection;
use crate::core::{AgentError, RetryPolicy, TaskPermit, TaskScheduler};
use crate::execution::confidence::{plan_confidence, step_confidence};
use crate::execution::resolve::resolve_params;
use crate::execution::{
    EventSink, ExecutionEvent, ExecutionReport, ExecutionSummary, PlanGraph, StepResult,
    StepStatus,
};
use crate::planning::{Plan, Step};
use crate::tools::{ParamShape, Reliability, ToolExecutor, ToolMetadata, ToolRegistry};

const DEADLINE_REASON: &str = "plan deadline exceeded";
const UNREACHABLE_REASON: &str = "unreachable";

/// 一次步骤调用（含重试）的结果
struct StepOutcome {
    step_id: String,
    output: Result<Value, AgentError>,
    attempts: u32,
    elapsed: Duration,
}

/// 派发到在途集合的步骤调用
struct StepCall {
    step_id: String,
    tool: String,
    params: Value,
    limit: Duration,
    policy: RetryPolicy,
    executor: ToolExecutor,
    cancel: CancellationToken,
    sink: EventSink,
}

/// 单次计划执行的可变状态
struct Run<'a> {
    steps: HashMap<&'a str, &'a Step>,
    graph: PlanGraph,
    results: HashMap<String, StepResult>,
    order: Vec<String>,
    ready: VecDeque<String>,
}

pub struct ExecutionEngine {
    executor: ToolExecutor,
    scheduler: Arc<TaskScheduler>,
    settings: ExecutionSection,
    retry: RetryPolicy,
}

impl ExecutionEngine {
    pub fn new(
        registry: Arc<ToolRegistry>,
        scheduler: Arc<TaskScheduler>,
        settings: ExecutionSection,
    ) -> Self {
        let retry = settings.retry_policy();
        Self {
            executor: ToolExecutor::new(registry),
            scheduler,
            settings,
            retry,
        }
    }

    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    /// 以配置的截止时间执行计划
    pub async fn execute(&self, plan: &Plan, sink: &EventSink) -> ExecutionReport {
        self.execute_with_deadline(plan, sink, self.settings.plan_deadline())
            .await
    }

    pub async fn execute_with_deadline(
        &self,
        plan: &Plan,
        sink: &EventSink,
        deadline: Duration,
    ) -> ExecutionReport {
        let started = Instant::now();
        let cancel = CancellationToken::new();
        let mut run = Run {
            steps: plan.steps.iter().map(|s| (s.id.as_str(), s)).collect(),
            graph: PlanGraph::new(&plan.steps),
            results: plan
                .steps
                .iter()
                .map(|s| (s.id.clone(), StepResult::pending(s)))
                .collect(),
            order: Vec::with_capacity(plan.steps.len()),
            ready: VecDeque::new(),
        };
        let mut in_flight: FuturesUnordered<BoxFuture<'static, StepOutcome>> =
            FuturesUnordered::new();
        let mut peak = 0usize;
        let mut deadline_exceeded = false;
        let mut abort_reason: Option<&str> = None;

        tracing::info!(plan_id = %plan.id, steps = plan.steps.len(), deadline_ms = deadline.as_millis() as u64, "plan execution started");
        sink.emit(ExecutionEvent::PlanStarted {
            plan_id: plan.id.clone(),
            steps: plan.steps.len(),
        });

        for (step, missing) in dangling_steps(plan) {
            tracing::warn!(plan_id = %plan.id, step_id = %step.id, missing = %missing, "step references a step outside the plan");
            let reason = format!("{UNREACHABLE_REASON}: unknown step '{missing}'");
            self.skip(&mut run, step, reason, sink);
            run.graph.mark_terminal(&step.id);
        }
        let initial = run.graph.ready();
        self.admit(&mut run, initial, sink);

        let sleep = tokio::time::sleep(deadline);
        tokio::pin!(sleep);

        loop {
            while !run.ready.is_empty() {
                let Some(permit) = self.scheduler.try_acquire_tool() else {
                    break;
                };
                if let Some(id) = run.ready.pop_front() {
                    in_flight.push(self.dispatch(&mut run, &id, permit, &cancel, sink));
                    peak = peak.max(in_flight.len());
                }
            }
            if in_flight.is_empty() && run.ready.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                _ = &mut sleep => {
                    deadline_exceeded = true;
                    abort_reason = Some("deadline");
                    break;
                }
                Some(outcome) = in_flight.next(), if !in_flight.is_empty() => {
                    self.finish(&mut run, outcome, sink);
                }
                permit = self.scheduler.acquire_tool(), if !run.ready.is_empty() => {
                    match (permit, run.ready.pop_front()) {
                        (Some(permit), Some(id)) => {
                            in_flight.push(self.dispatch(&mut run, &id, permit, &cancel, sink));
                            peak = peak.max(in_flight.len());
                        }
                        (None, _) => {
                            tracing::error!(plan_id = %plan.id, "tool scheduler closed");
                            abort_reason = Some("tool scheduler closed");
                            break;
                        }
                        (Some(_), None) => {}
                    }
                }
            }
        }

        if deadline_exceeded {
            tracing::warn!(plan_id = %plan.id, in_flight = in_flight.len(), "plan deadline exceeded, cancelling");
            cancel.cancel();
        }
        while let Some(outcome) = in_flight.next().await {
            self.finish(&mut run, outcome, sink);
        }
        // 截止、调度器关闭，或成环导致永远等不到依赖的步骤
        let reason = abort_reason.unwrap_or(UNREACHABLE_REASON);
        for step in &plan.steps {
            let terminal = run
                .results
                .get(&step.id)
                .map(|r| r.status.is_terminal())
                .unwrap_or(false);
            if !terminal {
                if abort_reason.is_none() {
                    tracing::warn!(plan_id = %plan.id, step_id = %step.id, "step never became ready, dependency cycle");
                }
                self.skip(&mut run, step, reason.to_string(), sink);
            }
        }

        let summary = summarize(&run.results, started.elapsed(), peak, deadline_exceeded);
        tracing::info!(
            plan_id = %plan.id,
            completed = summary.completed,
            failed = summary.failed,
            skipped = summary.skipped,
            peak_parallelism = summary.peak_parallelism,
            wall_time_ms = summary.wall_time_ms,
            "plan execution finished"
        );
        sink.emit(ExecutionEvent::PlanFinished {
            summary: summary.clone(),
        });

        ExecutionReport {
            plan_id: plan.id.clone(),
            results: run.results,
            completion_order: run.order,
            summary,
        }
    }

    fn metadata(&self, tool: &str) -> Option<&ToolMetadata> {
        self.executor
            .registry()
            .lookup(tool)
            .ok()
            .map(|t| &t.metadata)
    }

    fn output_shape(&self, tool: &str) -> ParamShape {
        self.metadata(tool)
            .map(|m| m.output_shape)
            .unwrap_or_default()
    }

    /// 依赖已全部终态的步骤：条件满足进入就绪队列，否则跳过并继续释放其后继
    fn admit(&self, run: &mut Run<'_>, candidates: Vec<String>, sink: &EventSink) {
        let mut work: VecDeque<String> = candidates.into();
        while let Some(id) = work.pop_front() {
            let Some(step) = run.steps.get(id.as_str()).copied() else {
                continue;
            };
            let pending = run
                .results
                .get(&step.id)
                .is_some_and(|r| r.status == StepStatus::Pending);
            if !pending {
                continue;
            }
            if step.condition.evaluate(&run.results) {
                run.ready.push_back(id);
                continue;
            }
            let reason = format!("condition not met: {}", step.condition);
            self.skip(run, step, reason, sink);
            work.extend(run.graph.mark_terminal(&step.id));
        }
    }

    fn skip(&self, run: &mut Run<'_>, step: &Step, reason: String, sink: &EventSink) {
        let empty = self.output_shape(&step.tool).empty_value();
        let result = run
            .results
            .entry(step.id.clone())
            .or_insert_with(|| StepResult::pending(step));
        result.status = StepStatus::Skipped;
        result.output = empty;
        result.confidence = 0.0;
        result.skip_reason = Some(reason.clone());
        let snapshot = result.clone();
        run.order.push(step.id.clone());

        tracing::info!(step_id = %step.id, tool = %step.tool, reason = %reason, "step skipped");
        sink.record_result(&snapshot);
        sink.emit(ExecutionEvent::StepSkipped {
            step_id: step.id.clone(),
            tool: step.tool.clone(),
            reason,
        });
    }

    fn dispatch(
        &self,
        run: &mut Run<'_>,
        step_id: &str,
        permit: TaskPermit,
        cancel: &CancellationToken,
        sink: &EventSink,
    ) -> BoxFuture<'static, StepOutcome> {
        let step = run.steps.get(step_id).copied();
        let (tool, params, limit, reliability) = match step {
            Some(step) => {
                let metadata = self.metadata(&step.tool);
                let params = resolve_params(step, metadata, &run.results);
                let reliability = metadata
                    .map(|m| m.reliability)
                    .unwrap_or(Reliability::Medium);
                (
                    step.tool.clone(),
                    params,
                    self.settings.step_timeout(step.estimated_duration),
                    reliability,
                )
            }
            None => (
                String::new(),
                Value::Object(Default::default()),
                self.settings.step_timeout(Duration::ZERO),
                Reliability::Medium,
            ),
        };
        if let Some(result) = run.results.get_mut(step_id) {
            result.status = StepStatus::Running;
            result.params = params.clone();
        }

        tracing::info!(step_id = %step_id, tool = %tool, timeout_ms = limit.as_millis() as u64, "step dispatched");
        sink.emit(ExecutionEvent::StepDispatched {
            step_id: step_id.to_string(),
            tool: tool.clone(),
            params: params.clone(),
        });

        let call = StepCall {
            step_id: step_id.to_string(),
            tool,
            params,
            limit,
            policy: self.retry.for_reliability(reliability),
            executor: self.executor.clone(),
            cancel: cancel.clone(),
            sink: sink.clone(),
        };
        Box::pin(run_step(call, permit))
    }

    fn finish(&self, run: &mut Run<'_>, outcome: StepOutcome, sink: &EventSink) {
        let Some(step) = run.steps.get(outcome.step_id.as_str()).copied() else {
            return;
        };
        let metadata = self.metadata(&step.tool);
        let reliability = metadata
            .map(|m| m.reliability)
            .unwrap_or(Reliability::Medium);
        let output_shape = metadata.map(|m| m.output_shape).unwrap_or_default();

        let result = run
            .results
            .entry(step.id.clone())
            .or_insert_with(|| StepResult::pending(step));
        result.attempts = outcome.attempts;
        result.execution_time_ms = outcome.elapsed.as_millis() as u64;
        let event = match outcome.output {
            Ok(output) => {
                result.status = StepStatus::Completed;
                result.confidence = step_confidence(reliability, &output, result.retries());
                result.output = output;
                tracing::info!(
                    step_id = %step.id,
                    tool = %step.tool,
                    attempts = result.attempts,
                    confidence = result.confidence,
                    execution_time_ms = result.execution_time_ms,
                    "step completed"
                );
                ExecutionEvent::StepCompleted {
                    step_id: step.id.clone(),
                    tool: step.tool.clone(),
                    attempts: result.attempts,
                    confidence: result.confidence,
                    execution_time_ms: result.execution_time_ms,
                }
            }
            Err(e) => {
                let error = e.to_string();
                result.status = StepStatus::Failed;
                result.confidence = 0.0;
                result.output = output_shape.empty_value();
                result.error = Some(error.clone());
                tracing::warn!(step_id = %step.id, tool = %step.tool, attempts = result.attempts, error = %error, "step failed");
                ExecutionEvent::StepFailed {
                    step_id: step.id.clone(),
                    tool: step.tool.clone(),
                    attempts: result.attempts,
                    error,
                }
            }
        };
        let snapshot = result.clone();
        run.order.push(step.id.clone());
        sink.record_result(&snapshot);
        sink.emit(event);

        let released = run.graph.mark_terminal(&step.id);
        self.admit(run, released, sink);
    }
}

fn is_retryable(err: &AgentError) -> bool {
    matches!(
        err,
        AgentError::ToolExecutionFailed { .. } | AgentError::Timeout(_)
    )
}

fn deadline_error() -> AgentError {
    AgentError::Timeout(DEADLINE_REASON.to_string())
}

/// 执行单个步骤：超时内调用工具，按可靠性重试，截止时立即返回
async fn run_step(call: StepCall, permit: TaskPermit) -> StepOutcome {
    let _permit = permit;
    let started = Instant::now();
    let mut attempts = 0u32;

    let output = loop {
        attempts += 1;
        let attempt = tokio::select! {
            biased;
            _ = call.cancel.cancelled() => break Err(deadline_error()),
            r = call.executor.execute(&call.tool, call.params.clone(), call.limit) => r,
        };
        let err = match attempt {
            Ok(value) => break Ok(value),
            Err(e) => e,
        };
        if !is_retryable(&err) || attempts > call.policy.max_retries() {
            break Err(err);
        }

        let delay = call.policy.backoff(attempts - 1);
        tracing::warn!(step_id = %call.step_id, tool = %call.tool, attempt = attempts, delay_ms = delay.as_millis() as u64, error = %err, "step attempt failed, retrying");
        call.sink.emit(ExecutionEvent::StepRetrying {
            step_id: call.step_id.clone(),
            tool: call.tool.clone(),
            attempt: attempts,
            delay_ms: delay.as_millis() as u64,
            error: err.to_string(),
        });
        tokio::select! {
            biased;
            _ = call.cancel.cancelled() => break Err(deadline_error()),
            _ = tokio::time::sleep(delay) => {}
        }
    };

    StepOutcome {
        step_id: call.step_id,
        output,
        attempts,
        elapsed: started.elapsed(),
    }
}

/// 依赖或条件指向计划外步骤的步骤，连同第一个缺失的步骤 ID
fn dangling_steps(plan: &Plan) -> Vec<(&Step, String)> {
    let ids: HashSet<&str> = plan.steps.iter().map(|s| s.id.as_str()).collect();
    plan.steps
        .iter()
        .filter_map(|step| {
            step.dependencies
                .iter()
                .cloned()
                .chain(step.condition.referenced_steps())
                .find(|dep| !ids.contains(dep.as_str()))
                .map(|missing| (step, missing))
        })
        .collect()
}

fn summarize(
    results: &HashMap<String, StepResult>,
    elapsed: Duration,
    peak: usize,
    deadline_exceeded: bool,
) -> ExecutionSummary {
    let count = |status: StepStatus| results.values().filter(|r| r.status == status).count();
    ExecutionSummary {
        total_steps: results.len(),
        completed: count(StepStatus::Completed),
        failed: count(StepStatus::Failed),
        skipped: count(StepStatus::Skipped),
        wall_time_ms: elapsed.as_millis() as u64,
        peak_parallelism: peak,
        confidence: plan_confidence(results.values()),
        deadline_exceeded,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planning::{Condition, ParamValue, PlanStrategy, PlanningContext, StepOutputRef};
    use crate::tools::{FnTool, ParamSpec, ToolCategory};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn settings() -> ExecutionSection {
        ExecutionSection {
            retry_base_delay_ms: 1,
            retry_max_delay_ms: 5,
            retry_jitter: 0.0,
            ..ExecutionSection::default()
        }
    }

    fn plan(steps: Vec<Step>) -> Plan {
        Plan::new(&PlanningContext::new("q", "session"), PlanStrategy::Llm, steps)
    }

    fn engine(registry: ToolRegistry, parallel: usize) -> ExecutionEngine {
        ExecutionEngine::new(
            Arc::new(registry),
            Arc::new(TaskScheduler::new(parallel, 1)),
            settings(),
        )
    }

    #[tokio::test]
    async fn test_linear_plan_passes_outputs() {
        let mut registry = ToolRegistry::new();
        registry
            .register(
                "produce",
                FnTool::new(|_| async { Ok(json!(["a", "b"])) }),
                ToolMetadata::new("produce", ToolCategory::Search).output_shape(ParamShape::Sequence),
            )
            .unwrap();
        registry
            .register(
                "consume",
                FnTool::new(|args| async move { Ok(json!(args["items"].as_array().map(|a| a.len()).unwrap_or(0))) }),
                ToolMetadata::new("consume", ToolCategory::Synthesis)
                    .param(ParamSpec::required("items", ParamShape::Sequence)),
            )
            .unwrap();
        let plan = plan(vec![
            Step::new("s1", "produce"),
            Step::new("s2", "consume")
                .param("items", ParamValue::Ref(StepOutputRef::new("s1")))
                .depends_on("s1"),
        ]);
        let report = engine(registry, 2).execute(&plan, &EventSink::new()).await;
        assert_eq!(report.summary.completed, 2);
        assert_eq!(report.result("s2").unwrap().output, json!(2));
        assert_eq!(report.result("s2").unwrap().params["items"], json!(["a", "b"]));
        assert_eq!(report.completion_order, vec!["s1", "s2"]);
    }

    #[tokio::test]
    async fn test_retry_then_success_counts_attempts() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut registry = ToolRegistry::new();
        registry
            .register(
                "flaky",
                FnTool::new(move |_| {
                    let counter = Arc::clone(&counter);
                    async move {
                        if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                            Err("transient".to_string())
                        } else {
                            Ok(json!("ok"))
                        }
                    }
                }),
                ToolMetadata::new("flaky", ToolCategory::Utility).reliability(Reliability::Medium),
            )
            .unwrap();
        let plan = plan(vec![Step::new("s1", "flaky")]);
        let report = engine(registry, 1).execute(&plan, &EventSink::new()).await;
        let r = report.result("s1").unwrap();
        assert_eq!(r.status, StepStatus::Completed);
        assert_eq!(r.attempts, 3);
        assert!(r.confidence < Reliability::Medium.base_score());
    }

    #[tokio::test]
    async fn test_condition_false_skips_with_typed_empty() {
        let mut registry = ToolRegistry::new();
        registry
            .register(
                "fail",
                FnTool::new(|_| async { Err("boom".to_string()) }),
                ToolMetadata::new("fail", ToolCategory::Utility).reliability(Reliability::High),
            )
            .unwrap();
        registry
            .register(
                "list",
                FnTool::new(|_| async { Ok(json!([1])) }),
                ToolMetadata::new("list", ToolCategory::Utility).output_shape(ParamShape::Sequence),
            )
            .unwrap();
        let plan = plan(vec![
            Step::new("s1", "fail"),
            Step::new("s2", "list")
                .depends_on("s1")
                .condition(Condition::OnSuccess("s1".into())),
            Step::new("s3", "list")
                .depends_on("s1")
                .condition(Condition::OnFailure("s1".into())),
        ]);
        let report = engine(registry, 2).execute(&plan, &EventSink::new()).await;
        assert_eq!(report.result("s1").unwrap().status, StepStatus::Failed);
        assert_eq!(report.result("s1").unwrap().attempts, 2);
        let skipped = report.result("s2").unwrap();
        assert_eq!(skipped.status, StepStatus::Skipped);
        assert_eq!(skipped.output, json!([]));
        assert_eq!(report.result("s3").unwrap().status, StepStatus::Completed);
    }

    #[tokio::test]
    async fn test_events_are_forwarded_in_order() {
        let mut registry = ToolRegistry::new();
        registry
            .register(
                "noop",
                FnTool::new(|_| async { Ok(json!("x")) }),
                ToolMetadata::new("noop", ToolCategory::Utility),
            )
            .unwrap();
        let plan = plan(vec![Step::new("s1", "noop")]);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let sink = EventSink::new().with_sender(tx);
        engine(registry, 1).execute(&plan, &sink).await;
        drop(sink);
        let mut kinds = Vec::new();
        while let Some(event) = rx.recv().await {
            kinds.push(event.kind());
        }
        assert_eq!(
            kinds,
            vec!["plan_started", "step_dispatched", "step_completed", "plan_finished"]
        );
    }

    #[tokio::test]
    async fn test_malformed_plan_terminates_every_step() {
        let mut registry = ToolRegistry::new();
        registry
            .register(
                "noop",
                FnTool::new(|_| async { Ok(json!("x")) }),
                ToolMetadata::new("noop", ToolCategory::Utility),
            )
            .unwrap();
        let plan = plan(vec![
            Step::new("a", "noop").depends_on("b"),
            Step::new("b", "noop").depends_on("a"),
            Step::new("c", "noop")
                .depends_on("zzz")
                .condition(Condition::OnSuccess("d".into())),
            Step::new("d", "noop"),
            Step::new("e", "noop").depends_on("c"),
        ]);
        let report = tokio::time::timeout(
            Duration::from_secs(5),
            engine(registry, 2).execute(&plan, &EventSink::new()),
        )
        .await
        .expect("malformed plan must not hang");

        assert!(report.results.values().all(|r| r.status.is_terminal()));
        for id in ["a", "b", "c"] {
            let result = report.result(id).unwrap();
            assert_eq!(result.status, StepStatus::Skipped, "{id}");
            assert!(result.skip_reason.as_deref().unwrap_or_default().starts_with("unreachable"), "{id}");
        }
        assert!(report.result("c").unwrap().skip_reason.as_deref().unwrap_or_default().contains("zzz"));
        assert_eq!(report.result("d").unwrap().status, StepStatus::Completed);
        // 跳过的上游同样释放下游，条件默认 Always
        assert_eq!(report.result("e").unwrap().status, StepStatus::Completed);
        assert_eq!(report.completion_order.len(), 5);
        assert_eq!(report.summary.skipped, 3);
    }

    #[tokio::test]
    async fn test_condition_on_non_dependency_waits_for_it() {
        let mut registry = ToolRegistry::new();
        registry
            .register(
                "slow",
                FnTool::new(|_| async {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(json!("done"))
                }),
                ToolMetadata::new("slow", ToolCategory::Utility),
            )
            .unwrap();
        registry
            .register(
                "noop",
                FnTool::new(|_| async { Ok(json!("x")) }),
                ToolMetadata::new("noop", ToolCategory::Utility),
            )
            .unwrap();
        let plan = plan(vec![
            Step::new("s1", "slow"),
            Step::new("s2", "noop").condition(Condition::OnSuccess("s1".into())),
        ]);
        let report = engine(registry, 2).execute(&plan, &EventSink::new()).await;
        assert_eq!(report.result("s2").unwrap().status, StepStatus::Completed);
        assert_eq!(report.completion_order, vec!["s1", "s2"]);
    }
}
