//! 任务调度：工具执行池 / LLM 调用池
//!
//! 两类任务各用一个 Semaphore 限流：工具执行受 max_parallel_steps 约束（与 DAG 宽度无关），
//! LLM 调用（规划与答案合成）走另一个更小的许可池，二者竞争同一外部配额。
//! 许可在 Drop 时归还，并同步维护当前运行数与峰值，便于压测断言。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

/// 任务类型
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum TaskKind {
    /// 工具执行，可并行，受限
    ToolExecution,
    /// LLM 调用，单独限流
    LlmCall,
}

#[derive(Debug, Default)]
struct Gauge {
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl Gauge {
    fn enter(&self) {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
    }
}

/// 执行许可：持有期间计入运行数，Drop 时归还
#[derive(Debug)]
pub struct TaskPermit {
    _permit: OwnedSemaphorePermit,
    gauge: Arc<Gauge>,
    pub kind: TaskKind,
}

impl Drop for TaskPermit {
    fn drop(&mut self) {
        self.gauge.leave();
    }
}

/// 任务调度器
#[derive(Debug)]
pub struct TaskScheduler {
    tool_semaphore: Arc<Semaphore>,
    llm_semaphore: Arc<Semaphore>,
    tool_gauge: Arc<Gauge>,
    llm_gauge: Arc<Gauge>,
    max_tools: usize,
}

impl TaskScheduler {
    pub fn new(max_concurrent_tools: usize, max_concurrent_llm: usize) -> Self {
        let max_tools = max_concurrent_tools.max(1);
        Self {
            tool_semaphore: Arc::new(Semaphore::new(max_tools)),
            llm_semaphore: Arc::new(Semaphore::new(max_concurrent_llm.max(1))),
            tool_gauge: Arc::new(Gauge::default()),
            llm_gauge: Arc::new(Gauge::default()),
            max_tools,
        }
    }

    /// 获取工具执行许可（等待）
    pub async fn acquire_tool(&self) -> Option<TaskPermit> {
        let permit = self.tool_semaphore.clone().acquire_owned().await.ok()?;
        Some(self.wrap(permit, TaskKind::ToolExecution))
    }

    /// 非阻塞获取工具执行许可；池满时返回 None
    pub fn try_acquire_tool(&self) -> Option<TaskPermit> {
        match self.tool_semaphore.clone().try_acquire_owned() {
            Ok(permit) => Some(self.wrap(permit, TaskKind::ToolExecution)),
            Err(TryAcquireError::NoPermits) | Err(TryAcquireError::Closed) => None,
        }
    }

    /// 获取 LLM 调用许可（等待）
    pub async fn acquire_llm(&self) -> Option<TaskPermit> {
        let permit = self.llm_semaphore.clone().acquire_owned().await.ok()?;
        Some(self.wrap(permit, TaskKind::LlmCall))
    }

    fn wrap(&self, permit: OwnedSemaphorePermit, kind: TaskKind) -> TaskPermit {
        let gauge = match kind {
            TaskKind::ToolExecution => Arc::clone(&self.tool_gauge),
            TaskKind::LlmCall => Arc::clone(&self.llm_gauge),
        };
        gauge.enter();
        TaskPermit {
            _permit: permit,
            gauge,
            kind,
        }
    }

    pub fn max_parallel_tools(&self) -> usize {
        self.max_tools
    }

    /// 当前正在运行的任务数
    pub fn running(&self, kind: TaskKind) -> usize {
        match kind {
            TaskKind::ToolExecution => self.tool_gauge.running.load(Ordering::SeqCst),
            TaskKind::LlmCall => self.llm_gauge.running.load(Ordering::SeqCst),
        }
    }

    /// 自创建以来同时运行的峰值
    pub fn peak(&self, kind: TaskKind) -> usize {
        match kind {
            TaskKind::ToolExecution => self.tool_gauge.peak.load(Ordering::SeqCst),
            TaskKind::LlmCall => self.llm_gauge.peak.load(Ordering::SeqCst),
        }
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new(4, 2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_try_acquire_respects_cap() {
        let scheduler = TaskScheduler::new(2, 1);
        let a = scheduler.try_acquire_tool();
        let b = scheduler.try_acquire_tool();
        assert!(a.is_some() && b.is_some());
        assert!(scheduler.try_acquire_tool().is_none());
        assert_eq!(scheduler.running(TaskKind::ToolExecution), 2);

        drop(a);
        assert_eq!(scheduler.running(TaskKind::ToolExecution), 1);
        assert!(scheduler.try_acquire_tool().is_some());
        assert_eq!(scheduler.peak(TaskKind::ToolExecution), 2);
    }

    #[tokio::test]
    async fn test_llm_pool_is_separate() {
        let scheduler = TaskScheduler::new(1, 1);
        let _tool = scheduler.try_acquire_tool().unwrap();
        let llm = scheduler.acquire_llm().await;
        assert!(llm.is_some());
        assert_eq!(scheduler.running(TaskKind::LlmCall), 1);
        assert_eq!(scheduler.running(TaskKind::ToolExecution), 1);
    }
}
