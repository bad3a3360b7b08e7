//! Mock LLM 客户端（用于测试，无需 API）
//!
//! 按顺序返回预设的回复脚本；脚本用完后重复最后一条（没有脚本时返回固定文本）。
//! 每次调用的提示词都会被记录，测试可据此断言规划提示中带上了工具清单或校验错误。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{LlmClient, LlmError};

/// Mock 客户端：脚本化回复 + 记录提示词
#[derive(Debug, Default)]
pub struct MockLlmClient {
    script: Mutex<VecDeque<Result<String, LlmError>>>,
    last: Mutex<Option<Result<String, LlmError>>>,
    prompts: Mutex<Vec<String>>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 依次返回这些文本
    pub fn with_responses<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let client = Self::default();
        for r in responses {
            client.push(Ok(r.into()));
        }
        client
    }

    /// 追加一条回复（可以是错误）
    pub fn push(&self, response: Result<String, LlmError>) {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(response);
    }

    /// 目前为止收到的全部提示词
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, prompt: &str) -> Result<String, LlmError> {
        self.prompts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(prompt.to_string());

        let next = self
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        match next {
            Some(response) => {
                *last = Some(response.clone());
                response
            }
            None => last
                .clone()
                .unwrap_or_else(|| Ok("(mock) no scripted response".to_string())),
        }
    }

    fn name(&self) -> &str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_script_then_repeat_last() {
        let mock = MockLlmClient::with_responses(["a", "b"]);
        assert_eq!(mock.complete("p1").await.unwrap(), "a");
        assert_eq!(mock.complete("p2").await.unwrap(), "b");
        assert_eq!(mock.complete("p3").await.unwrap(), "b");
        assert_eq!(mock.prompts(), vec!["p1", "p2", "p3"]);
    }

    #[tokio::test]
    async fn test_scripted_error() {
        let mock = MockLlmClient::new();
        mock.push(Err(LlmError::RateLimited { retry_after_ms: None }));
        mock.push(Ok("ok".to_string()));
        assert!(mock.complete("x").await.is_err());
        assert_eq!(mock.complete("x").await.unwrap(), "ok");
        assert_eq!(mock.calls(), 2);
    }
}
