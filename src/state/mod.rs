//! 执行状态：上下文、追踪日志、生命周期与检查点

pub mod checkpoint;
pub mod context;
pub mod manager;

pub use checkpoint::{
    CheckpointStore, InMemoryCheckpointStore, JsonFileCheckpointStore, SqliteCheckpointStore,
};
pub use context::{ExecutionContext, LifecycleState, TraceEvent};
pub use manager::StateManager;
