//! 置信度：步骤级与计划级
//!
//! 步骤 = 可靠性基数 × (输出为空 ? 0.6 : 1.0) × (1 − 0.1 × 重试次数)，截断到 [0, 1]。
//! 计划 = 已完成步骤置信度均值 × (1 − 失败数 / 总数)；没有完成步骤时为 0。

use serde_json::Value;

use crate::execution::{StepResult, StepStatus};
use crate::tools::Reliability;

const EMPTY_OUTPUT_FACTOR: f64 = 0.6;
const RETRY_PENALTY: f64 = 0.1;

/// 输出是否为空（null、空串、空集合）
pub fn is_empty_output(output: &Value) -> bool {
    match output {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(m) => m.is_empty(),
        _ => false,
    }
}

pub fn step_confidence(reliability: Reliability, output: &Value, retries: u32) -> f64 {
    let mut score = reliability.base_score();
    if is_empty_output(output) {
        score *= EMPTY_OUTPUT_FACTOR;
    }
    score *= 1.0 - RETRY_PENALTY * retries as f64;
    score.clamp(0.0, 1.0)
}

pub fn plan_confidence<'a>(results: impl IntoIterator<Item = &'a StepResult>) -> f64 {
    let mut total = 0usize;
    let mut failed = 0usize;
    let mut completed = Vec::new();
    for r in results {
        total += 1;
        match r.status {
            StepStatus::Completed => completed.push(r.confidence),
            StepStatus::Failed => failed += 1,
            _ => {}
        }
    }
    if completed.is_empty() || total == 0 {
        return 0.0;
    }
    let mean = completed.iter().sum::<f64>() / completed.len() as f64;
    (mean * (1.0 - failed as f64 / total as f64)).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn result(status: StepStatus, confidence: f64) -> StepResult {
        StepResult {
            step_id: "s".into(),
            tool: "t".into(),
            status,
            output: Value::Null,
            error: None,
            skip_reason: None,
            confidence,
            execution_time_ms: 0,
            attempts: 1,
            params: Value::Null,
        }
    }

    #[test]
    fn test_step_confidence() {
        let clean = step_confidence(Reliability::Medium, &json!("text"), 0);
        assert!((clean - 0.85).abs() < 1e-9);
        let retried = step_confidence(Reliability::Medium, &json!("text"), 2);
        assert!((retried - 0.68).abs() < 1e-9);
        assert!(retried < clean);
        let empty = step_confidence(Reliability::High, &json!([]), 0);
        assert!((empty - 0.57).abs() < 1e-9);
        assert_eq!(step_confidence(Reliability::Low, &json!(1), 50), 0.0);
    }

    #[test]
    fn test_plan_confidence() {
        let results = [
            result(StepStatus::Completed, 0.9),
            result(StepStatus::Completed, 0.7),
            result(StepStatus::Failed, 0.0),
            result(StepStatus::Skipped, 0.0),
        ];
        let c = plan_confidence(&results);
        assert!((c - 0.8 * 0.75).abs() < 1e-9);

        let none = [result(StepStatus::Failed, 0.0), result(StepStatus::Skipped, 0.0)];
        assert_eq!(plan_confidence(&none), 0.0);
    }
}
