//! StateManager：按执行 ID 持有 ExecutionContext 并管理其生命周期
//!
//! 追踪日志由并行步骤的完成回调并发追加，所有变更在同一把锁内完成，
//! 保证日志顺序即真实完成顺序。配置了检查点存储时，每次变更在锁内取快照并编号，
//! 释放锁后再落盘；编号落后于已写入快照的旧快照直接丢弃。落盘失败只记日志，不影响请求。
//! 清理操作幂等：重复清理是 no-op。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::core::AgentError;
use crate::execution::StepResult;
use crate::planning::Plan;
use crate::state::{CheckpointStore, ExecutionContext, LifecycleState, TraceEvent};

#[derive(Default)]
pub struct StateManager {
    contexts: Mutex<HashMap<String, ExecutionContext>>,
    checkpoint: Option<Arc<dyn CheckpointStore>>,
    /// 快照编号，只在 contexts 锁内递增
    revision: AtomicU64,
    /// 每个执行已落盘的最新快照编号
    written: Mutex<HashMap<String, u64>>,
}

/// 待落盘的上下文快照
struct Checkpoint {
    revision: u64,
    context: ExecutionContext,
}

impl StateManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_checkpoint(store: Arc<dyn CheckpointStore>) -> Self {
        Self {
            checkpoint: Some(store),
            ..Self::default()
        }
    }

    fn contexts(&self) -> MutexGuard<'_, HashMap<String, ExecutionContext>> {
        self.contexts.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 在 contexts 锁内调用：未配置检查点时不复制
    fn checkpoint_of(&self, context: &ExecutionContext) -> Option<Checkpoint> {
        self.checkpoint.as_ref()?;
        Some(Checkpoint {
            revision: self.revision.fetch_add(1, Ordering::SeqCst) + 1,
            context: context.clone(),
        })
    }

    /// 在 contexts 锁外调用
    fn persist(&self, checkpoint: Option<Checkpoint>) {
        let (Some(store), Some(Checkpoint { revision, context })) = (&self.checkpoint, checkpoint)
        else {
            return;
        };
        let mut written = self.written.lock().unwrap_or_else(|e| e.into_inner());
        if written
            .get(&context.execution_id)
            .is_some_and(|&latest| latest > revision)
        {
            tracing::debug!(execution_id = %context.execution_id, revision, "stale checkpoint dropped");
            return;
        }
        match store.save(&context) {
            Ok(()) => {
                written.insert(context.execution_id.clone(), revision);
            }
            Err(e) => {
                tracing::warn!(execution_id = %context.execution_id, error = %e, "checkpoint save failed")
            }
        }
    }

    /// 在锁内修改上下文，锁外落盘
    fn mutate<T>(
        &self,
        execution_id: &str,
        f: impl FnOnce(&mut ExecutionContext) -> T,
    ) -> Result<T, AgentError> {
        let (out, checkpoint) = {
            let mut contexts = self.contexts();
            let context = contexts
                .get_mut(execution_id)
                .ok_or_else(|| AgentError::ExecutionNotFound(execution_id.to_string()))?;
            let out = f(context);
            (out, self.checkpoint_of(context))
        };
        self.persist(checkpoint);
        Ok(out)
    }

    pub fn create_execution_context(
        &self,
        execution_id: &str,
        session_id: &str,
        query: &str,
        active_documents: &[String],
    ) -> Result<(), AgentError> {
        let checkpoint = {
            let mut contexts = self.contexts();
            if contexts.contains_key(execution_id) {
                return Err(AgentError::DuplicateExecution(execution_id.to_string()));
            }
            let context = ExecutionContext::new(
                execution_id,
                session_id,
                query,
                active_documents.to_vec(),
            );
            let checkpoint = self.checkpoint_of(&context);
            contexts.insert(execution_id.to_string(), context);
            checkpoint
        };
        self.persist(checkpoint);
        tracing::debug!(execution_id, session_id, "execution context created");
        Ok(())
    }

    /// 追加追踪事件，返回分配的序号
    pub fn record_event(&self, execution_id: &str, event: TraceEvent) -> Result<u64, AgentError> {
        self.mutate(execution_id, |ctx| ctx.append(event))
    }

    pub fn record_step_result(&self, execution_id: &str, result: StepResult) -> Result<(), AgentError> {
        self.mutate(execution_id, |ctx| ctx.upsert_step(result))
    }

    pub fn record_plan(&self, execution_id: &str, plan: &Plan) -> Result<(), AgentError> {
        let value = serde_json::to_value(plan).ok();
        self.mutate(execution_id, |ctx| {
            ctx.plan = value;
            ctx.updated_at = chrono::Utc::now();
        })
    }

    pub fn complete_execution(&self, execution_id: &str) -> Result<(), AgentError> {
        self.mutate(execution_id, |ctx| {
            ctx.state = LifecycleState::Completed;
            ctx.updated_at = chrono::Utc::now();
        })
    }

    pub fn snapshot(&self, execution_id: &str) -> Option<ExecutionContext> {
        self.contexts().get(execution_id).cloned()
    }

    pub fn trace(&self, execution_id: &str) -> Option<Vec<TraceEvent>> {
        self.contexts().get(execution_id).map(|c| c.events.clone())
    }

    pub fn is_active(&self, execution_id: &str) -> bool {
        self.contexts()
            .get(execution_id)
            .map(ExecutionContext::is_active)
            .unwrap_or(false)
    }

    /// 当前持有（未清理）的执行数
    pub fn len(&self) -> usize {
        self.contexts().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 某会话下未清理的执行 ID
    pub fn session_executions(&self, session_id: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .contexts()
            .values()
            .filter(|c| c.session_id == session_id)
            .map(|c| c.execution_id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// 释放内存中的上下文；已清理或不存在时返回 false
    pub fn cleanup_execution(&self, execution_id: &str) -> bool {
        let removed = {
            let mut contexts = self.contexts();
            contexts.remove(execution_id).map(|mut context| {
                context.state = LifecycleState::Cleaned;
                context.updated_at = chrono::Utc::now();
                let checkpoint = self.checkpoint_of(&context);
                (context.events.len(), checkpoint)
            })
        };
        match removed {
            Some((events, checkpoint)) => {
                self.persist(checkpoint);
                // 上下文已移出，之后不会再有该执行的快照
                self.written
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(execution_id);
                tracing::debug!(execution_id, events, "execution context cleaned");
                true
            }
            None => false,
        }
    }

    /// 级联清理会话下的所有执行，返回释放数量
    pub fn cleanup_session(&self, session_id: &str) -> usize {
        let released = self
            .session_executions(session_id)
            .iter()
            .filter(|id| self.cleanup_execution(id))
            .count();
        tracing::info!(session_id, released, "session cleaned");
        released
    }

    /// 从检查点恢复一次执行的持久化记录（进程重启后重放追踪）
    pub fn load_checkpoint(&self, execution_id: &str) -> Result<Option<ExecutionContext>, AgentError> {
        match &self.checkpoint {
            Some(store) => store.load(execution_id),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::InMemoryCheckpointStore;
    use serde_json::json;

    #[test]
    fn test_create_rejects_duplicate() {
        let manager = StateManager::new();
        manager.create_execution_context("e1", "s", "q", &[]).unwrap();
        let err = manager.create_execution_context("e1", "s", "q", &[]).unwrap_err();
        assert!(matches!(err, AgentError::DuplicateExecution(id) if id == "e1"));
    }

    #[test]
    fn test_cleanup_is_idempotent() {
        let manager = StateManager::new();
        manager.create_execution_context("e1", "s", "q", &[]).unwrap();
        assert!(manager.cleanup_execution("e1"));
        assert!(!manager.cleanup_execution("e1"));
        assert!(!manager.cleanup_execution("never-created"));
        assert!(manager.snapshot("e1").is_none());
        assert!(matches!(
            manager.record_event("e1", TraceEvent::new("late", None, json!(null))),
            Err(AgentError::ExecutionNotFound(_))
        ));
        // 清理后可用同一 ID 重新创建
        manager.create_execution_context("e1", "s", "q", &[]).unwrap();
    }

    #[test]
    fn test_events_get_sequence_numbers() {
        let manager = StateManager::new();
        manager.create_execution_context("e1", "s", "q", &[]).unwrap();
        for i in 0..3 {
            let seq = manager
                .record_event("e1", TraceEvent::new("tick", None, json!(i)))
                .unwrap();
            assert_eq!(seq, i);
        }
        let trace = manager.trace("e1").unwrap();
        assert_eq!(trace.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[test]
    fn test_cleanup_session_cascades() {
        let manager = StateManager::new();
        manager.create_execution_context("a1", "alpha", "q", &[]).unwrap();
        manager.create_execution_context("a2", "alpha", "q", &[]).unwrap();
        manager.create_execution_context("b1", "beta", "q", &[]).unwrap();
        assert_eq!(manager.cleanup_session("alpha"), 2);
        assert_eq!(manager.cleanup_session("alpha"), 0);
        assert_eq!(manager.len(), 1);
        assert!(manager.is_active("b1"));
    }

    #[test]
    fn test_checkpoint_after_each_mutation() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let manager = StateManager::with_checkpoint(store.clone());
        manager.create_execution_context("e1", "s", "q", &["d1".to_string()]).unwrap();
        assert!(store.load("e1").unwrap().is_some());

        manager
            .record_event("e1", TraceEvent::new("step_completed", Some("s1".into()), json!({})))
            .unwrap();
        manager.complete_execution("e1").unwrap();
        assert!(manager.cleanup_execution("e1"));

        let replayed = manager.load_checkpoint("e1").unwrap().unwrap();
        assert_eq!(replayed.state, LifecycleState::Cleaned);
        assert_eq!(replayed.events.len(), 1);
        assert_eq!(replayed.active_documents, vec!["d1"]);
    }

    #[test]
    fn test_concurrent_appends_are_not_lost() {
        let manager = Arc::new(StateManager::new());
        manager.create_execution_context("e1", "s", "q", &[]).unwrap();
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let manager = Arc::clone(&manager);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        manager
                            .record_event("e1", TraceEvent::new("tick", None, json!([t, i])))
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let trace = manager.trace("e1").unwrap();
        assert_eq!(trace.len(), 400);
        assert!(trace.iter().enumerate().all(|(i, e)| e.seq == i as u64));
    }

    /// save 在 gate 被占用时阻塞
    #[derive(Default)]
    struct GatedStore {
        gate: Mutex<()>,
        saves: std::sync::atomic::AtomicUsize,
        inner: InMemoryCheckpointStore,
    }

    impl CheckpointStore for GatedStore {
        fn save(&self, context: &ExecutionContext) -> Result<(), AgentError> {
            self.saves.fetch_add(1, Ordering::SeqCst);
            let _open = self.gate.lock().unwrap();
            self.inner.save(context)
        }

        fn load(&self, execution_id: &str) -> Result<Option<ExecutionContext>, AgentError> {
            self.inner.load(execution_id)
        }

        fn delete(&self, execution_id: &str) -> Result<(), AgentError> {
            self.inner.delete(execution_id)
        }

        fn list(&self) -> Result<Vec<String>, AgentError> {
            self.inner.list()
        }
    }

    #[test]
    fn test_slow_checkpoint_does_not_block_readers() {
        let store = Arc::new(GatedStore::default());
        let manager = Arc::new(StateManager::with_checkpoint(store.clone()));
        manager.create_execution_context("e1", "s", "q", &[]).unwrap();
        manager.create_execution_context("e2", "s", "q", &[]).unwrap();

        let gate = store.gate.lock().unwrap();
        let writer = {
            let manager = Arc::clone(&manager);
            std::thread::spawn(move || {
                manager.record_event("e1", TraceEvent::new("slow", None, json!({})))
            })
        };
        while store.saves.load(Ordering::SeqCst) < 3 {
            std::thread::yield_now();
        }

        // 落盘阻塞期间，读取与其它执行的内存变更照常进行
        let (tx, rx) = std::sync::mpsc::channel();
        let reader = {
            let manager = Arc::clone(&manager);
            std::thread::spawn(move || {
                let seen = manager.trace("e1").map(|t| t.len());
                let active = manager.is_active("e2");
                tx.send((seen, active)).unwrap();
            })
        };
        let (seen, active) = rx
            .recv_timeout(std::time::Duration::from_secs(2))
            .expect("reader blocked behind checkpoint write");
        assert_eq!(seen, Some(1));
        assert!(active);

        drop(gate);
        writer.join().unwrap().unwrap();
        reader.join().unwrap();
        assert_eq!(store.load("e1").unwrap().unwrap().events.len(), 1);
    }

    #[test]
    fn test_concurrent_checkpoints_keep_latest() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let manager = Arc::new(StateManager::with_checkpoint(store.clone()));
        manager.create_execution_context("e1", "s", "q", &[]).unwrap();
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let manager = Arc::clone(&manager);
                std::thread::spawn(move || {
                    for i in 0..25 {
                        manager
                            .record_event("e1", TraceEvent::new("tick", None, json!([t, i])))
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.load("e1").unwrap().unwrap().events.len(), 100);
    }
}
