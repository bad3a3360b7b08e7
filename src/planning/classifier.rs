//! 查询分类：按关键词与活动文档数量推断 QueryType

use crate::planning::QueryType;

const STATUS_KEYWORDS: &[&str] = &[
    "status",
    "what can you do",
    "which tools",
    "available tools",
    "help",
    "are you there",
];

const VISUALIZATION_KEYWORDS: &[&str] = &[
    "chart", "plot", "graph", "visualize", "visualise", "diagram", "histogram", "图表", "可视化",
];

const COMPUTATION_KEYWORDS: &[&str] = &[
    "calculate",
    "compute",
    "sum of",
    "average",
    "mean of",
    "percentage",
    "percent",
    "how many",
    "total",
    "计算",
];

const COMPARISON_KEYWORDS: &[&str] = &[
    "compare",
    "comparison",
    "difference",
    "differences",
    "versus",
    " vs ",
    " vs.",
    "contrast",
    "对比",
    "比较",
];

const ANALYSIS_KEYWORDS: &[&str] = &[
    "analyze",
    "analyse",
    "analysis",
    "summarize",
    "summarise",
    "summary",
    "sentiment",
    "themes",
    "key points",
    "insights",
    "分析",
    "总结",
];

/// 轻量查询分类器
pub struct QueryClassifier;

impl QueryClassifier {
    /// 依次判断：状态 > 可视化 > 计算 > 多文档对比 > 文档分析 > 查找
    pub fn classify(query: &str, active_documents: usize) -> QueryType {
        let q = format!(" {} ", query.to_lowercase());
        let has = |words: &[&str]| words.iter().any(|w| q.contains(w));

        if has(STATUS_KEYWORDS) {
            return QueryType::Status;
        }
        if has(VISUALIZATION_KEYWORDS) {
            return QueryType::Visualization;
        }
        if has(COMPUTATION_KEYWORDS) || looks_like_arithmetic(query) {
            return QueryType::Computation;
        }
        if has(COMPARISON_KEYWORDS) && active_documents != 1 {
            return QueryType::Comparison;
        }
        if has(ANALYSIS_KEYWORDS) || has(COMPARISON_KEYWORDS) || active_documents > 0 {
            return QueryType::DocumentAnalysis;
        }
        QueryType::Lookup
    }
}

/// 形如 `12 * 7` 的算式
fn looks_like_arithmetic(query: &str) -> bool {
    let mut digits = 0;
    let mut ops = 0;
    for c in query.chars() {
        if c.is_ascii_digit() {
            digits += 1;
        } else if matches!(c, '+' | '*' | '/' | '^' | '=') {
            ops += 1;
        } else if !(c.is_whitespace() || c == '.' || c == '(' || c == ')' || c == '-' || c == '?') {
            return false;
        }
    }
    digits > 0 && ops > 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(QueryClassifier::classify("What tools are available? status", 0), QueryType::Status);
        assert_eq!(QueryClassifier::classify("Plot revenue by quarter", 1), QueryType::Visualization);
        assert_eq!(QueryClassifier::classify("Calculate the average margin", 1), QueryType::Computation);
        assert_eq!(QueryClassifier::classify("12 * (3 + 4)", 0), QueryType::Computation);
        assert_eq!(QueryClassifier::classify("Compare the two reports", 2), QueryType::Comparison);
        assert_eq!(QueryClassifier::classify("Compare sections of this report", 1), QueryType::DocumentAnalysis);
        assert_eq!(QueryClassifier::classify("What are the key points?", 0), QueryType::DocumentAnalysis);
        assert_eq!(QueryClassifier::classify("Who is the CEO?", 1), QueryType::DocumentAnalysis);
        assert_eq!(QueryClassifier::classify("Who is the CEO?", 0), QueryType::Lookup);
    }
}
