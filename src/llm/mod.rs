//! LLM 层：客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）以及限流重试包装

pub mod mock;
pub mod openai;
pub mod retrying;
pub mod traits;

use std::sync::Arc;

pub use mock::MockLlmClient;
pub use openai::{OpenAiClient, TokenUsage};
pub use retrying::RetryingLlmClient;
pub use traits::{LlmClient, LlmError};

use crate::config::LlmSection;
use crate::core::AgentError;

pub const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com";
pub const DEEPSEEK_CHAT: &str = "deepseek-chat";

/// 根据配置选择 LLM 后端（mock / openai / deepseek）
///
/// 非 mock 后端缺少 API Key 时返回 ConfigError（致命，不重试）。
pub fn create_llm_from_config(cfg: &LlmSection) -> Result<Arc<dyn LlmClient>, AgentError> {
    match cfg.provider.to_lowercase().as_str() {
        "mock" => {
            tracing::warn!("Using Mock LLM");
            Ok(Arc::new(MockLlmClient::new()))
        }
        "openai" => {
            let key = read_api_key(&cfg.api_key_env)?;
            tracing::info!(model = %cfg.model, "Using OpenAI-compatible LLM");
            Ok(Arc::new(OpenAiClient::new(
                cfg.base_url.as_deref(),
                &cfg.model,
                &key,
            )))
        }
        "deepseek" => {
            let key = read_api_key("DEEPSEEK_API_KEY").or_else(|_| read_api_key(&cfg.api_key_env))?;
            let model = if cfg.model.starts_with("deepseek") {
                cfg.model.clone()
            } else {
                DEEPSEEK_CHAT.to_string()
            };
            let base = cfg.base_url.as_deref().unwrap_or(DEEPSEEK_BASE_URL);
            tracing::info!(model = %model, "Using DeepSeek LLM");
            Ok(Arc::new(OpenAiClient::new(Some(base), &model, &key)))
        }
        other => Err(AgentError::ConfigError(format!(
            "unknown llm provider '{other}'"
        ))),
    }
}

fn read_api_key(var: &str) -> Result<String, AgentError> {
    std::env::var(var)
        .ok()
        .filter(|k| !k.trim().is_empty())
        .ok_or_else(|| AgentError::ConfigError(format!("missing API key: set {var}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_provider_needs_no_key() {
        let cfg = LlmSection::default();
        let client = create_llm_from_config(&cfg).unwrap();
        assert_eq!(client.name(), "mock");
    }

    #[test]
    fn test_missing_key_is_config_error() {
        let cfg = LlmSection {
            provider: "openai".to_string(),
            api_key_env: "CONDUCTOR_TEST_KEY_THAT_IS_NOT_SET".to_string(),
            ..LlmSection::default()
        };
        let err = create_llm_from_config(&cfg).err().unwrap();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_unknown_provider() {
        let cfg = LlmSection {
            provider: "nope".to_string(),
            ..LlmSection::default()
        };
        assert!(matches!(
            create_llm_from_config(&cfg),
            Err(AgentError::ConfigError(_))
        ));
    }
}
