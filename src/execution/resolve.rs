//! 占位符解析：派发前把步骤参数中的输出引用替换为被引用步骤的实际输出
//!
//! 被引用步骤已完成时取其输出（按路径取值），并按参数声明形状做保守转换；
//! 被引用步骤跳过、失败或路径不存在时，给出与声明形状匹配的空值，绝不传 null。

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::execution::{StepResult, StepStatus};
use crate::planning::{ParamValue, Step, StepOutputRef};
use crate::tools::{ParamShape, ToolMetadata};

/// 解析步骤的全部参数，返回 JSON 对象
pub fn resolve_params(
    step: &Step,
    metadata: Option<&ToolMetadata>,
    results: &HashMap<String, StepResult>,
) -> Value {
    let mut args = Map::new();
    for (name, value) in &step.params {
        let shape = metadata
            .map(|m| m.param_shape(name))
            .unwrap_or_default();
        args.insert(name.clone(), resolve_value(value, shape, results));
    }
    Value::Object(args)
}

fn resolve_value(value: &ParamValue, shape: ParamShape, results: &HashMap<String, StepResult>) -> Value {
    match value {
        ParamValue::Literal(v) => v.clone(),
        ParamValue::Ref(r) => resolve_ref(r, shape, results),
        ParamValue::List(items) => Value::Array(
            items
                .iter()
                .map(|v| resolve_value(v, ParamShape::Any, results))
                .collect(),
        ),
        ParamValue::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_value(v, ParamShape::Any, results)))
                .collect(),
        ),
    }
}

fn resolve_ref(r: &StepOutputRef, shape: ParamShape, results: &HashMap<String, StepResult>) -> Value {
    let completed = results
        .get(&r.step_id)
        .filter(|res| res.status == StepStatus::Completed);
    match completed.and_then(|res| r.select(&res.output)) {
        Some(v) => shape.coerce(v.clone()),
        None => {
            tracing::debug!(reference = %r, shape = ?shape, "reference unavailable, using typed empty value");
            shape.empty_value()
        }
    }
}
