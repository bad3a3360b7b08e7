//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `CONDUCTOR__*` 覆盖（双下划线表示嵌套，如 `CONDUCTOR__LLM__PROVIDER=openai`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::core::RetryPolicy;
use crate::tools::{ParamShape, ParamSpec, Reliability, ToolCategory};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub planning: PlanningSection,
    pub execution: ExecutionSection,
    pub state: StateSection,
    pub tools: ToolsSection,
}

impl AppConfig {
    /// 实际使用的 LLM 并发上限：需小于工具并发上限，否则告警并收紧
    pub fn llm_concurrency(&self) -> usize {
        let tools = self.execution.max_parallel_steps.max(1);
        let llm = self.llm.max_concurrent_calls.max(1);
        let cap = tools.saturating_sub(1).max(1);
        if llm > cap {
            tracing::warn!(
                max_concurrent_calls = llm,
                max_parallel_steps = tools,
                using = cap,
                "llm concurrency should stay below tool concurrency, clamping"
            );
            return cap;
        }
        llm
    }
}

/// [app] 段
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
}

/// [llm] 段：后端选择、超时、重试与并发
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 后端：mock / openai / deepseek
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    /// 读取 API Key 的环境变量名
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// 总尝试次数（含首次）
    #[serde(default = "default_llm_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_llm_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_llm_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    /// LLM 调用并发上限（应小于工具并发上限）
    #[serde(default = "default_max_concurrent_calls")]
    pub max_concurrent_calls: usize,
}

fn default_provider() -> String {
    "mock".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_llm_max_attempts() -> u32 {
    4
}

fn default_llm_retry_base_delay_ms() -> u64 {
    500
}

fn default_llm_retry_max_delay_ms() -> u64 {
    8000
}

fn default_max_concurrent_calls() -> usize {
    2
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            api_key_env: default_api_key_env(),
            request_timeout_secs: default_request_timeout_secs(),
            max_attempts: default_llm_max_attempts(),
            retry_base_delay_ms: default_llm_retry_base_delay_ms(),
            retry_max_delay_ms: default_llm_retry_max_delay_ms(),
            max_concurrent_calls: default_max_concurrent_calls(),
        }
    }
}

impl LlmSection {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.retry_base_delay_ms),
            Duration::from_millis(self.retry_max_delay_ms),
        )
        .with_jitter(0.2)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// [planning] 段
#[derive(Debug, Clone, Deserialize)]
pub struct PlanningSection {
    /// 校验失败后重新提示的次数，用尽后走回退计划
    #[serde(default = "default_max_replans")]
    pub max_replans: usize,
    /// 单个计划允许的最大步骤数
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    /// 拼入提示词的对话轮数
    #[serde(default = "default_history_turns")]
    pub history_turns: usize,
}

fn default_max_replans() -> usize {
    1
}

fn default_max_steps() -> usize {
    12
}

fn default_history_turns() -> usize {
    10
}

impl Default for PlanningSection {
    fn default() -> Self {
        Self {
            max_replans: default_max_replans(),
            max_steps: default_max_steps(),
            history_turns: default_history_turns(),
        }
    }
}

/// [execution] 段：并发、超时、重试退避
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionSection {
    #[serde(default = "default_max_parallel_steps")]
    pub max_parallel_steps: usize,
    /// 整个计划的截止时间（秒）
    #[serde(default = "default_plan_deadline_secs")]
    pub plan_deadline_secs: u64,
    /// 单步超时 = 预估耗时 × 该倍数（不低于 min_step_timeout_ms）
    #[serde(default = "default_step_timeout_multiplier")]
    pub step_timeout_multiplier: f64,
    #[serde(default = "default_min_step_timeout_ms")]
    pub min_step_timeout_ms: u64,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    #[serde(default = "default_retry_jitter")]
    pub retry_jitter: f64,
}

fn default_max_parallel_steps() -> usize {
    4
}

fn default_plan_deadline_secs() -> u64 {
    300
}

fn default_step_timeout_multiplier() -> f64 {
    3.0
}

fn default_min_step_timeout_ms() -> u64 {
    1000
}

fn default_retry_base_delay_ms() -> u64 {
    200
}

fn default_retry_max_delay_ms() -> u64 {
    5000
}

fn default_retry_jitter() -> f64 {
    0.2
}

impl Default for ExecutionSection {
    fn default() -> Self {
        Self {
            max_parallel_steps: default_max_parallel_steps(),
            plan_deadline_secs: default_plan_deadline_secs(),
            step_timeout_multiplier: default_step_timeout_multiplier(),
            min_step_timeout_ms: default_min_step_timeout_ms(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            retry_jitter: default_retry_jitter(),
        }
    }
}

impl ExecutionSection {
    /// 工具重试的基础策略；每步再按可靠性等级覆盖 max_attempts
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            1,
            Duration::from_millis(self.retry_base_delay_ms),
            Duration::from_millis(self.retry_max_delay_ms),
        )
        .with_jitter(self.retry_jitter)
    }

    pub fn plan_deadline(&self) -> Duration {
        Duration::from_secs(self.plan_deadline_secs)
    }

    /// 由预估耗时推导单步超时
    pub fn step_timeout(&self, estimated: Duration) -> Duration {
        let scaled = estimated.mul_f64(self.step_timeout_multiplier.max(1.0));
        scaled.max(Duration::from_millis(self.min_step_timeout_ms))
    }
}

/// 检查点后端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointBackend {
    #[default]
    None,
    Memory,
    File,
    Sqlite,
}

/// [state] 段
#[derive(Debug, Clone, Deserialize, Default)]
pub struct StateSection {
    #[serde(default)]
    pub checkpoint: CheckpointBackend,
    /// file 后端为目录，sqlite 后端为数据库文件
    pub checkpoint_path: Option<PathBuf>,
}

/// [tools] 段
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ToolsSection {
    /// 启动时把该目录下的文本文件载入文档仓库（文件名即文档 ID）
    pub documents_dir: Option<PathBuf>,
    #[serde(default)]
    pub commands: Vec<CommandEntry>,
}

/// [[tools.commands]] 条目：外部程序工具
#[derive(Debug, Clone, Deserialize)]
pub struct CommandEntry {
    pub name: String,
    pub description: String,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_command_category")]
    pub category: ToolCategory,
    #[serde(default = "default_command_reliability")]
    pub reliability: Reliability,
    #[serde(default = "default_command_duration_ms")]
    pub estimated_duration_ms: u64,
    #[serde(default)]
    pub parameters: Vec<ParamSpec>,
    #[serde(default)]
    pub output_shape: ParamShape,
}

fn default_command_category() -> ToolCategory {
    ToolCategory::Computation
}

fn default_command_reliability() -> Reliability {
    Reliability::Low
}

fn default_command_duration_ms() -> u64 {
    5000
}

/// 从 config 目录加载配置，环境变量 CONDUCTOR__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 CONDUCTOR__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("CONDUCTOR")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.llm.provider, "mock");
        assert!(cfg.llm.max_concurrent_calls < cfg.execution.max_parallel_steps);
        assert_eq!(cfg.planning.max_replans, 1);
        assert_eq!(cfg.state.checkpoint, CheckpointBackend::None);
    }

    #[test]
    fn test_llm_concurrency_clamped_below_tools() {
        let mut cfg = AppConfig::default();
        assert_eq!(cfg.llm_concurrency(), cfg.llm.max_concurrent_calls);

        cfg.llm.max_concurrent_calls = 10;
        cfg.execution.max_parallel_steps = 4;
        assert_eq!(cfg.llm_concurrency(), 3);

        cfg.llm.max_concurrent_calls = 4;
        assert_eq!(cfg.llm_concurrency(), 3);

        cfg.execution.max_parallel_steps = 1;
        assert_eq!(cfg.llm_concurrency(), 1);

        cfg.llm.max_concurrent_calls = 0;
        cfg.execution.max_parallel_steps = 8;
        assert_eq!(cfg.llm_concurrency(), 1);
    }

    #[test]
    fn test_step_timeout_has_floor() {
        let exec = ExecutionSection::default();
        assert_eq!(exec.step_timeout(Duration::from_millis(10)), Duration::from_millis(1000));
        assert_eq!(exec.step_timeout(Duration::from_secs(2)), Duration::from_secs(6));
    }

    #[test]
    fn test_load_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conductor.toml");
        std::fs::write(
            &path,
            r#"
[execution]
max_parallel_steps = 8

[state]
checkpoint = "sqlite"
checkpoint_path = "trace.db"

[[tools.commands]]
name = "python_exec"
description = "Run a python snippet"
program = "python3"
args = ["-c", "{{code}}"]
parameters = [{ name = "code", required = true, shape = "string" }]
"#,
        )
        .unwrap();
        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.execution.max_parallel_steps, 8);
        assert_eq!(cfg.state.checkpoint, CheckpointBackend::Sqlite);
        assert_eq!(cfg.tools.commands.len(), 1);
        let cmd = &cfg.tools.commands[0];
        assert_eq!(cmd.category, ToolCategory::Computation);
        assert_eq!(cmd.reliability, Reliability::Low);
        assert_eq!(cmd.parameters[0].shape, ParamShape::String);
    }
}
