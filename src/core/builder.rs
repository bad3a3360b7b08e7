//! 编排器构建器：统一的初始化逻辑
//!
//! 配置 → 工具注册表（内置工具 + 配置声明的命令工具 + 调用方注入的工具）→ LLM 客户端 → 检查点存储 → Orchestrator。

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{AppConfig, CheckpointBackend};
use crate::core::{AgentError, Orchestrator};
use crate::llm::{create_llm_from_config, LlmClient};
use crate::state::{
    CheckpointStore, InMemoryCheckpointStore, JsonFileCheckpointStore, SqliteCheckpointStore,
    StateManager,
};
use crate::tools::{
    register_builtin_tools, CommandTool, Document, DocumentRepository,
    InMemoryDocumentRepository, Tool, ToolMetadata, ToolRegistry,
};

const DEFAULT_CHECKPOINT_DIR: &str = "data/checkpoints";
const DEFAULT_CHECKPOINT_DB: &str = "data/checkpoints.db";

pub struct OrchestratorBuilder {
    config: AppConfig,
    llm: Option<Arc<dyn LlmClient>>,
    documents: Option<Arc<dyn DocumentRepository>>,
    checkpoint: Option<Arc<dyn CheckpointStore>>,
    tools: Vec<(String, Arc<dyn Tool>, ToolMetadata)>,
    builtin_tools: bool,
}

impl OrchestratorBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            llm: None,
            documents: None,
            checkpoint: None,
            tools: Vec::new(),
            builtin_tools: true,
        }
    }

    /// 注入 LLM 客户端（否则按 [llm] 配置创建）
    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_documents(mut self, documents: Arc<dyn DocumentRepository>) -> Self {
        self.documents = Some(documents);
        self
    }

    /// 注入检查点存储（否则按 [state] 配置创建）
    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoint = Some(store);
        self
    }

    pub fn with_tool(
        mut self,
        name: impl Into<String>,
        tool: Arc<dyn Tool>,
        metadata: ToolMetadata,
    ) -> Self {
        self.tools.push((name.into(), tool, metadata));
        self
    }

    /// 不注册内置参考工具
    pub fn without_builtin_tools(mut self) -> Self {
        self.builtin_tools = false;
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    fn documents(&self) -> Result<Arc<dyn DocumentRepository>, AgentError> {
        if let Some(documents) = &self.documents {
            return Ok(Arc::clone(documents));
        }
        let repo: Arc<dyn DocumentRepository> = Arc::new(InMemoryDocumentRepository::new());
        if let Some(dir) = &self.config.tools.documents_dir {
            let loaded = load_documents(dir, repo.as_ref())?;
            tracing::info!(dir = %dir.display(), loaded, "documents loaded");
        }
        Ok(repo)
    }

    /// 构建工具注册表；启动后只读
    pub fn build_tool_registry(
        &self,
        documents: Arc<dyn DocumentRepository>,
    ) -> Result<ToolRegistry, AgentError> {
        let mut registry = ToolRegistry::new();
        if self.builtin_tools {
            register_builtin_tools(&mut registry, documents)?;
        }
        for entry in &self.config.tools.commands {
            let timeout = self
                .config
                .execution
                .step_timeout(Duration::from_millis(entry.estimated_duration_ms));
            registry.register(
                entry.name.clone(),
                Arc::new(CommandTool::new(entry, timeout)),
                CommandTool::metadata(entry),
            )?;
        }
        for (name, tool, metadata) in &self.tools {
            registry.register(name.clone(), Arc::clone(tool), metadata.clone())?;
        }
        let stats = registry.stats();
        tracing::info!(tools = stats.total, "tool registry ready");
        Ok(registry)
    }

    pub fn build_llm(&self) -> Result<Arc<dyn LlmClient>, AgentError> {
        match &self.llm {
            Some(llm) => Ok(Arc::clone(llm)),
            None => create_llm_from_config(&self.config.llm),
        }
    }

    pub fn build_checkpoint_store(&self) -> Result<Option<Arc<dyn CheckpointStore>>, AgentError> {
        if let Some(store) = &self.checkpoint {
            return Ok(Some(Arc::clone(store)));
        }
        let state = &self.config.state;
        let path = |default: &str| {
            state
                .checkpoint_path
                .clone()
                .unwrap_or_else(|| PathBuf::from(default))
        };
        let store: Option<Arc<dyn CheckpointStore>> = match state.checkpoint {
            CheckpointBackend::None => None,
            CheckpointBackend::Memory => Some(Arc::new(InMemoryCheckpointStore::new())),
            CheckpointBackend::File => Some(Arc::new(JsonFileCheckpointStore::new(path(
                DEFAULT_CHECKPOINT_DIR,
            ))?)),
            CheckpointBackend::Sqlite => Some(Arc::new(SqliteCheckpointStore::open(path(
                DEFAULT_CHECKPOINT_DB,
            ))?)),
        };
        tracing::info!(backend = ?state.checkpoint, "checkpoint store ready");
        Ok(store)
    }

    pub fn build(self) -> Result<Orchestrator, AgentError> {
        let documents = self.documents()?;
        let registry = Arc::new(self.build_tool_registry(documents)?);
        let llm = self.build_llm()?;
        let state = match self.build_checkpoint_store()? {
            Some(store) => StateManager::with_checkpoint(store),
            None => StateManager::new(),
        };
        Ok(Orchestrator::new(
            &self.config,
            registry,
            llm,
            Arc::new(state),
        ))
    }
}

/// 读取目录下的 .txt / .md 文件，文件名（不含扩展名）作为文档 ID
fn load_documents(dir: &Path, repo: &dyn DocumentRepository) -> Result<usize, AgentError> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| AgentError::ConfigError(format!("documents_dir {}: {e}", dir.display())))?;
    let mut loaded = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        let supported = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("txt") | Some("md")
        );
        if !supported {
            continue;
        }
        let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        match std::fs::read_to_string(&path) {
            Ok(content) => {
                repo.put(Document::new(id, content));
                loaded += 1;
            }
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "document skipped"),
        }
    }
    Ok(loaded)
}

/// 便捷函数：加载配置（失败时使用默认值）并创建构建器
pub fn create_orchestrator_builder(config_path: Option<PathBuf>) -> OrchestratorBuilder {
    let config = crate::config::load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });
    OrchestratorBuilder::new(config)
}
