//! 文档仓库与文档检索工具
//!
//! DocumentRepository 是显式注入给工具的仓库接口（get / put / delete / list），不存在进程级共享状态；
//! DocumentSearchTool 按关键词重叠对文档分段打分，返回片段列表。

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tools::{ParamShape, ParamSpec, Reliability, Tool, ToolCategory, ToolMetadata};

/// 「全部活动文档」哨兵：参数缺失且无法唯一确定文档时由规划器填入
pub const ALL_DOCUMENTS: &str = "__all_documents__";

/// 文档
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub title: String,
    pub content: String,
}

impl Document {
    pub fn new(id: impl Into<String>, content: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            title: id.clone(),
            id,
            content: content.into(),
        }
    }
}

/// 文档仓库接口
pub trait DocumentRepository: Send + Sync {
    fn get(&self, id: &str) -> Option<Document>;

    fn put(&self, doc: Document);

    /// 删除文档，返回是否存在
    fn delete(&self, id: &str) -> bool;

    /// 所有文档 ID（有序）
    fn list(&self) -> Vec<String>;
}

/// 内存实现
#[derive(Debug, Default)]
pub struct InMemoryDocumentRepository {
    docs: RwLock<BTreeMap<String, Document>>,
}

impl InMemoryDocumentRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DocumentRepository for InMemoryDocumentRepository {
    fn get(&self, id: &str) -> Option<Document> {
        let docs = self.docs.read().unwrap_or_else(|e| e.into_inner());
        docs.get(id).cloned()
    }

    fn put(&self, doc: Document) {
        let mut docs = self.docs.write().unwrap_or_else(|e| e.into_inner());
        docs.insert(doc.id.clone(), doc);
    }

    fn delete(&self, id: &str) -> bool {
        let mut docs = self.docs.write().unwrap_or_else(|e| e.into_inner());
        docs.remove(id).is_some()
    }

    fn list(&self) -> Vec<String> {
        let docs = self.docs.read().unwrap_or_else(|e| e.into_inner());
        docs.keys().cloned().collect()
    }
}

/// 将文本切分为小写词集合，用于简单相似度（词重叠数）
pub(crate) fn tokenize_lower(s: &str) -> HashSet<String> {
    s.split(|c: char| !c.is_alphanumeric())
        .map(|w| w.to_lowercase())
        .filter(|w| w.len() > 1)
        .collect()
}

/// 从参数中取文档 ID 列表；缺省、空或含哨兵时表示全部文档
fn requested_documents(args: &Value, repo: &dyn DocumentRepository) -> Vec<String> {
    let ids: Vec<String> = match args.get("documents") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect(),
        Some(Value::String(s)) if !s.is_empty() => vec![s.clone()],
        _ => Vec::new(),
    };
    if ids.is_empty() || ids.iter().any(|id| id == ALL_DOCUMENTS) {
        repo.list()
    } else {
        ids
    }
}

/// 文档检索：按段落切分，关键词重叠打分，返回 top_k 片段
pub struct DocumentSearchTool {
    repo: Arc<dyn DocumentRepository>,
}

impl DocumentSearchTool {
    pub const NAME: &'static str = "document_search";

    pub fn new(repo: Arc<dyn DocumentRepository>) -> Self {
        Self { repo }
    }

    pub fn metadata() -> ToolMetadata {
        ToolMetadata::new(
            "Search active documents for passages relevant to a query. \
             Returns a list of {document, chunk, text, score}.",
            ToolCategory::Search,
        )
        .reliability(Reliability::High)
        .estimated_duration(Duration::from_secs(2))
        .param(ParamSpec::required("query", ParamShape::String))
        .param(ParamSpec::optional("documents", ParamShape::Sequence))
        .param(ParamSpec::optional("top_k", ParamShape::Number))
        .output_shape(ParamShape::Sequence)
    }
}

#[async_trait]
impl Tool for DocumentSearchTool {
    async fn execute(&self, args: Value) -> Result<Value, String> {
        let query = args
            .get("query")
            .and_then(|v| v.as_str())
            .ok_or("missing 'query'")?;
        let top_k = args.get("top_k").and_then(|v| v.as_u64()).unwrap_or(5) as usize;
        let query_tokens = tokenize_lower(query);

        let mut hits: Vec<(usize, Value)> = Vec::new();
        for doc_id in requested_documents(&args, self.repo.as_ref()) {
            let doc = self
                .repo
                .get(&doc_id)
                .ok_or_else(|| format!("unknown document '{doc_id}'"))?;
            for (chunk, text) in doc
                .content
                .split("\n\n")
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .enumerate()
            {
                let score = tokenize_lower(text).intersection(&query_tokens).count();
                if score > 0 || query_tokens.is_empty() {
                    hits.push((
                        score,
                        serde_json::json!({
                            "document": doc.id,
                            "chunk": chunk,
                            "text": text,
                            "score": score,
                        }),
                    ));
                }
            }
        }
        // 稳定排序：同分保持文档与段落顺序
        hits.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(Value::Array(
            hits.into_iter().take(top_k).map(|(_, v)| v).collect(),
        ))
    }
}
