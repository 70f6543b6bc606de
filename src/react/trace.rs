//! 执行轨迹与推理记录
//!
//! ExecutionTrace 只追加：对外只有 push 和只读访问，没有修改或删除接口。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::react::plan::{preview, DataSelector};

/// 步骤产物：沙箱内路径 + 可选内联内容
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl Artifact {
    pub fn path(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: None,
        }
    }

    pub fn inline(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: Some(content.into()),
        }
    }
}

/// 单步执行结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub executor: String,
    pub intent: String,
    pub output: Value,
    /// 错误标记：执行失败时为 true，output 为错误描述
    #[serde(default)]
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<Artifact>,
}

impl StepResult {
    pub fn ok(executor: impl Into<String>, intent: impl Into<String>, output: Value) -> Self {
        Self {
            executor: executor.into(),
            intent: intent.into(),
            output,
            is_error: false,
            artifacts: Vec::new(),
        }
    }

    pub fn error(
        executor: impl Into<String>,
        intent: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            executor: executor.into(),
            intent: intent.into(),
            output: Value::String(message.into()),
            is_error: true,
            artifacts: Vec::new(),
        }
    }

    /// 未知执行器的占位结果：不执行任何操作
    pub fn placeholder(executor: impl Into<String>, intent: impl Into<String>) -> Self {
        let executor = executor.into();
        let output = serde_json::json!({
            "skipped": true,
            "reason": format!("no executor named '{}'", executor),
        });
        Self {
            executor,
            intent: intent.into(),
            output,
            is_error: false,
            artifacts: Vec::new(),
        }
    }

    pub fn with_artifacts(mut self, artifacts: Vec<Artifact>) -> Self {
        self.artifacts = artifacts;
        self
    }

    pub fn output_text(&self) -> String {
        match &self.output {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

/// 只追加的执行轨迹
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExecutionTrace {
    results: Vec<StepResult>,
}

impl ExecutionTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, result: StepResult) {
        self.results.push(result);
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&StepResult> {
        self.results.get(index)
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &StepResult> {
        self.results.iter()
    }

    pub fn as_slice(&self) -> &[StepResult] {
        &self.results
    }

    pub fn error_count(&self) -> usize {
        self.results.iter().filter(|r| r.is_error).count()
    }

    pub fn artifacts(&self) -> Vec<Artifact> {
        self.results
            .iter()
            .flat_map(|r| r.artifacts.iter().cloned())
            .collect()
    }

    /// 按选择器取前序结果：(0 基序号, 结果)；越界的序号忽略
    pub fn select(&self, selector: &DataSelector) -> Vec<(usize, &StepResult)> {
        match selector {
            DataSelector::None => Vec::new(),
            DataSelector::All => self.results.iter().enumerate().collect(),
            DataSelector::Steps(idx) => idx
                .iter()
                .filter_map(|&i| self.results.get(i).map(|r| (i, r)))
                .collect(),
        }
    }

    /// 渲染选中的结果，供提示词使用；每条输出截断到 max_chars
    pub fn render_selected(&self, selector: &DataSelector, max_chars: usize) -> String {
        render_results(self.select(selector), max_chars)
    }

    pub fn render(&self, max_chars: usize) -> String {
        render_results(self.results.iter().enumerate().collect(), max_chars)
    }
}

fn render_results(items: Vec<(usize, &StepResult)>, max_chars: usize) -> String {
    items
        .into_iter()
        .map(|(i, r)| {
            let status = if r.is_error { "FAILED" } else { "ok" };
            format!(
                "Step {} [{}] {} ({}):\n{}",
                i + 1,
                r.executor,
                r.intent,
                status,
                preview(&r.output_text(), max_chars)
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// 推理记录所处的阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningPhase {
    PreStep,
    PostStep,
    Replan,
    Final,
}

/// (思考, 动作) 记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningEntry {
    pub step_index: Option<usize>,
    pub phase: ReasoningPhase,
    pub thought: String,
    pub action: String,
    #[serde(default)]
    pub is_error: bool,
    pub at: DateTime<Utc>,
}

impl ReasoningEntry {
    pub fn new(
        step_index: Option<usize>,
        phase: ReasoningPhase,
        thought: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            step_index,
            phase,
            thought: thought.into(),
            action: action.into(),
            is_error: false,
            at: Utc::now(),
        }
    }

    pub fn failed(mut self) -> Self {
        self.is_error = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_select_and_render() {
        let mut trace = ExecutionTrace::new();
        trace.push(StepResult::ok("research", "find", json!("facts")));
        trace.push(StepResult::error("codeExecution", "run", "exit 2"));
        trace.push(StepResult::ok("generation", "write", json!({"text": "done"})));

        assert!(trace.select(&DataSelector::None).is_empty());
        assert_eq!(trace.select(&DataSelector::All).len(), 3);
        let picked = trace.select(&DataSelector::Steps(vec![1, 7]));
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].0, 1);

        let text = trace.render_selected(&DataSelector::Steps(vec![0, 1]), 100);
        assert!(text.contains("Step 1 [research] find (ok)"));
        assert!(text.contains("FAILED"));
        assert_eq!(trace.error_count(), 1);
    }

    #[test]
    fn test_placeholder_is_noop() {
        let r = StepResult::placeholder("teleport", "beam me up");
        assert!(!r.is_error);
        assert_eq!(r.output["skipped"], true);
        assert!(r.output_text().contains("teleport"));
    }
}
