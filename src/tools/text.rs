//! 文本工具：摘要（Synthesis）与文本统计（Analytics）
//!
//! 两者都接受「字符串 / 片段列表 / 任意 JSON」作为输入，前序步骤被跳过时收到的空列表或空串也能正常处理。

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tools::{ParamShape, ParamSpec, Reliability, Tool, ToolCategory, ToolMetadata};

/// 把输入展开为文本段：字符串原样，列表逐项取 text 字段或字符串，其它 JSON 序列化
fn collect_passages(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) if s.is_empty() => Vec::new(),
        Value::String(s) => vec![s.clone()],
        Value::Array(items) => items.iter().flat_map(collect_passages).collect(),
        Value::Object(map) => match map.get("text") {
            Some(text) => collect_passages(text),
            None => vec![value.to_string()],
        },
        Value::Null => Vec::new(),
        other => vec![other.to_string()],
    }
}

fn first_sentence(text: &str) -> &str {
    let end = text
        .find(|c: char| matches!(c, '.' | '!' | '?' | '。'))
        .map(|i| i + text[i..].chars().next().map(char::len_utf8).unwrap_or(1))
        .unwrap_or(text.len());
    text[..end].trim()
}

/// 抽取式摘要：每段取首句，最多 max_sentences 句
pub struct SummarizeTool;

impl SummarizeTool {
    pub const NAME: &'static str = "summarize";

    pub fn metadata() -> ToolMetadata {
        ToolMetadata::new(
            "Summarize passages (a string or a list of search hits) into a short extract.",
            ToolCategory::Synthesis,
        )
        .reliability(Reliability::Medium)
        .estimated_duration(Duration::from_secs(3))
        .param(ParamSpec::required("chunks", ParamShape::Sequence))
        .param(ParamSpec::optional("max_sentences", ParamShape::Number))
        .output_shape(ParamShape::String)
    }
}

#[async_trait]
impl Tool for SummarizeTool {
    async fn execute(&self, args: Value) -> Result<Value, String> {
        let chunks = args.get("chunks").ok_or("missing 'chunks'")?;
        let max = args
            .get("max_sentences")
            .and_then(|v| v.as_u64())
            .unwrap_or(3) as usize;
        let summary = collect_passages(chunks)
            .iter()
            .map(|p| first_sentence(p))
            .filter(|s| !s.is_empty())
            .take(max)
            .collect::<Vec<_>>()
            .join(" ");
        Ok(Value::String(summary))
    }
}

/// 文本统计：词数、句数、高频词
pub struct TextStatsTool;

impl TextStatsTool {
    pub const NAME: &'static str = "text_stats";

    pub fn metadata() -> ToolMetadata {
        ToolMetadata::new(
            "Compute word count, sentence count and the most frequent terms of a text or list of passages.",
            ToolCategory::Analytics,
        )
        .reliability(Reliability::High)
        .estimated_duration(Duration::from_secs(1))
        .param(ParamSpec::required("text", ParamShape::Any))
        .param(ParamSpec::optional("top_terms", ParamShape::Number))
        .output_shape(ParamShape::Mapping)
    }
}

#[async_trait]
impl Tool for TextStatsTool {
    async fn execute(&self, args: Value) -> Result<Value, String> {
        let text = args.get("text").ok_or("missing 'text'")?;
        let top = args.get("top_terms").and_then(|v| v.as_u64()).unwrap_or(5) as usize;
        let passages = collect_passages(text);

        let mut words = 0usize;
        let mut sentences = 0usize;
        let mut freq: HashMap<String, usize> = HashMap::new();
        for p in &passages {
            sentences += p
                .split(|c: char| matches!(c, '.' | '!' | '?' | '。'))
                .filter(|s| !s.trim().is_empty())
                .count();
            for w in p.split(|c: char| !c.is_alphanumeric()).filter(|w| !w.is_empty()) {
                words += 1;
                if w.chars().count() > 3 {
                    *freq.entry(w.to_lowercase()).or_insert(0) += 1;
                }
            }
        }
        let mut terms: Vec<(String, usize)> = freq.into_iter().collect();
        terms.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        let terms: Vec<Value> = terms
            .into_iter()
            .take(top)
            .map(|(term, count)| json!({ "term": term, "count": count }))
            .collect();

        Ok(json!({
            "passages": passages.len(),
            "words": words,
            "sentences": sentences,
            "top_terms": terms,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_summarize_search_hits() {
        let hits = json!([
            {"document": "a.pdf", "text": "Revenue grew. It was a good year."},
            {"document": "b.pdf", "text": "Costs fell! Nobody expected it."}
        ]);
        let out = SummarizeTool
            .execute(json!({"chunks": hits, "max_sentences": 5}))
            .await
            .unwrap();
        assert_eq!(out, json!("Revenue grew. Costs fell!"));
    }

    #[tokio::test]
    async fn test_summarize_empty_input() {
        let out = SummarizeTool.execute(json!({"chunks": []})).await.unwrap();
        assert_eq!(out, json!(""));
    }

    #[tokio::test]
    async fn test_text_stats() {
        let out = TextStatsTool
            .execute(json!({"text": "Revenue rose. Revenue fell again."}))
            .await
            .unwrap();
        assert_eq!(out["words"], json!(5));
        assert_eq!(out["sentences"], json!(2));
        assert_eq!(out["top_terms"][0], json!({"term": "revenue", "count": 2}));
    }
}
