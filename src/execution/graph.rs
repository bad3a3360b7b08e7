//! 计划依赖图
//!
//! 使用邻接表和入度表实现 DAG 拓扑排序；执行期间随步骤终结递减依赖方的入度。

use std::collections::{HashMap, HashSet, VecDeque};

use crate::planning::Step;

/// 计划依赖图
#[derive(Debug, Clone)]
pub struct PlanGraph {
    /// 邻接表：步骤 ID -> 依赖该步骤的步骤列表
    pub adjacency: HashMap<String, Vec<String>>,
    /// 入度表：步骤 ID -> 未终结的依赖数
    pub in_degree: HashMap<String, usize>,
    /// 声明顺序，用于让就绪集合的顺序稳定
    order: Vec<String>,
}

impl PlanGraph {
    /// 创建依赖图；条件里引用的步骤同样算作依赖边
    ///
    /// 重复依赖只计一次，指向计划外步骤的依赖被忽略（执行引擎会把这类步骤直接跳过）。
    pub fn new(steps: &[Step]) -> Self {
        let ids: HashSet<&str> = steps.iter().map(|s| s.id.as_str()).collect();
        let mut adjacency: HashMap<String, Vec<String>> = HashMap::new();
        let mut in_degree: HashMap<String, usize> = HashMap::new();

        for step in steps {
            in_degree.insert(step.id.clone(), 0);
            adjacency.entry(step.id.clone()).or_default();
        }
        for step in steps {
            let mut seen = HashSet::new();
            let edges = step
                .dependencies
                .iter()
                .cloned()
                .chain(step.condition.referenced_steps());
            for dep in edges {
                if !ids.contains(dep.as_str()) || !seen.insert(dep.clone()) {
                    continue;
                }
                adjacency.entry(dep.clone()).or_default().push(step.id.clone());
                *in_degree.entry(step.id.clone()).or_insert(0) += 1;
            }
        }

        Self {
            adjacency,
            in_degree,
            order: steps.iter().map(|s| s.id.clone()).collect(),
        }
    }

    /// 当前入度为 0 的步骤（按声明顺序）
    pub fn ready(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| self.in_degree.get(*id) == Some(&0))
            .cloned()
            .collect()
    }

    pub fn dependents(&self, step_id: &str) -> &[String] {
        self.adjacency
            .get(step_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// 步骤进入终态：递减依赖方入度，返回新变为 0 的步骤
    pub fn mark_terminal(&mut self, step_id: &str) -> Vec<String> {
        let mut newly_ready = Vec::new();
        let dependents = self.adjacency.get(step_id).cloned().unwrap_or_default();
        for dependent in dependents {
            if let Some(degree) = self.in_degree.get_mut(&dependent) {
                *degree = degree.saturating_sub(1);
                if *degree == 0 {
                    newly_ready.push(dependent);
                }
            }
        }
        newly_ready
    }

    /// Kahn 拓扑排序；存在环时返回环上（及其下游）无法排序的步骤
    pub fn topological_order(&self) -> Result<Vec<String>, Vec<String>> {
        let mut in_degree = self.in_degree.clone();
        let mut queue: VecDeque<String> = self
            .order
            .iter()
            .filter(|id| in_degree.get(*id) == Some(&0))
            .cloned()
            .collect();
        let mut sorted = Vec::with_capacity(self.order.len());

        while let Some(id) = queue.pop_front() {
            for dependent in self.dependents(&id) {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(dependent.clone());
                    }
                }
            }
            sorted.push(id);
        }

        if sorted.len() == self.order.len() {
            Ok(sorted)
        } else {
            let done: HashSet<&String> = sorted.iter().collect();
            Err(self
                .order
                .iter()
                .filter(|id| !done.contains(id))
                .cloned()
                .collect())
        }
    }
}
