//! 计划数据模型与解析
//!
//! 模型给出的计划是一个对象：键为 step1、step2 …（按数字后缀排序），值为步骤描述；
//! 也接受 `{steps: [...]}`、裸数组和 ```json 代码块。`{directAnswer: true, answer}` 表示无需执行直接回答。

use schemars::{schema_for, JsonSchema};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::core::AgentError;
use crate::llm::LlmReply;

/// 步骤可以引用哪些前序结果（内部 0 基；JSON 中为 1 基步骤号）
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DataSelector {
    #[default]
    None,
    All,
    Steps(Vec<usize>),
}

impl DataSelector {
    /// 宽松解析："none" / "all" / null / 数字 / 数组 / "step2" / "1, 3"
    pub fn from_value(v: &Value) -> Self {
        match v {
            Value::Null => DataSelector::None,
            Value::Bool(true) => DataSelector::All,
            Value::Bool(false) => DataSelector::None,
            Value::Number(n) => match n.as_u64() {
                Some(n) if n >= 1 => DataSelector::Steps(vec![n as usize - 1]),
                _ => DataSelector::None,
            },
            Value::String(s) => {
                let lower = s.trim().to_lowercase();
                match lower.as_str() {
                    "" | "none" | "no" | "n/a" => DataSelector::None,
                    "all" | "*" | "yes" | "previous" => DataSelector::All,
                    _ => Self::from_numbers(step_numbers(&lower)),
                }
            }
            Value::Array(items) => {
                let mut nums = Vec::new();
                for item in items {
                    match item {
                        Value::Number(n) => nums.extend(n.as_u64()),
                        Value::String(s) => nums.extend(step_numbers(s)),
                        _ => {}
                    }
                }
                Self::from_numbers(nums)
            }
            Value::Object(_) => DataSelector::None,
        }
    }

    fn from_numbers(nums: Vec<u64>) -> Self {
        let mut idx: Vec<usize> = nums
            .into_iter()
            .filter(|n| *n >= 1)
            .map(|n| n as usize - 1)
            .collect();
        idx.sort_unstable();
        idx.dedup();
        if idx.is_empty() {
            DataSelector::None
        } else {
            DataSelector::Steps(idx)
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, DataSelector::None)
    }
}

/// 取出字符串中的所有十进制数字串
fn step_numbers(s: &str) -> Vec<u64> {
    s.split(|c: char| !c.is_ascii_digit())
        .filter(|p| !p.is_empty())
        .filter_map(|p| p.parse().ok())
        .collect()
}

impl<'de> Deserialize<'de> for DataSelector {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let v = Value::deserialize(d)?;
        Ok(DataSelector::from_value(&v))
    }
}

impl Serialize for DataSelector {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        match self {
            DataSelector::None => s.serialize_str("none"),
            DataSelector::All => s.serialize_str("all"),
            DataSelector::Steps(idx) => {
                let one_based: Vec<usize> = idx.iter().map(|i| i + 1).collect();
                one_based.serialize(s)
            }
        }
    }
}

/// 计划中的一步
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    /// 这一步要做什么
    #[serde(rename = "step", alias = "intent", default)]
    pub intent: String,
    /// 执行器名（codeExecution / fileSystem / research / generation / toolCall）
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub expected_output: String,
    #[serde(default)]
    pub using_data: DataSelector,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validations: Option<Value>,
    /// 强度，如检索深度（low / medium / high 或数字）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intensity: Option<Value>,
    /// 执行器参数，按执行器不同而不同
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

impl Step {
    pub fn new(intent: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            intent: intent.into(),
            action: action.into(),
            expected_output: String::new(),
            using_data: DataSelector::None,
            validations: None,
            intensity: None,
            params: Value::Null,
        }
    }

    pub fn using(mut self, selector: DataSelector) -> Self {
        self.using_data = selector;
        self
    }

    /// 取字符串参数
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }
}

/// 有序步骤列表；重规划时整体替换
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Plan {
    steps: Vec<Step>,
}

impl Plan {
    pub fn new(steps: Vec<Step>) -> Self {
        Self { steps }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Step> {
        self.steps.get(index)
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// 截断到 max 步，返回被丢弃的步数
    pub fn truncate(&mut self, max: usize) -> usize {
        let dropped = self.steps.len().saturating_sub(max);
        self.steps.truncate(max);
        dropped
    }

    /// 与模型输出同形的 JSON（step1、step2 …），用于重规划提示
    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        for (i, step) in self.steps.iter().enumerate() {
            map.insert(
                format!("step{}", i + 1),
                serde_json::to_value(step).unwrap_or(Value::Null),
            );
        }
        Value::Object(map)
    }

    /// 人类可读摘要，completed 之前的步骤标记为已完成
    pub fn render(&self, completed: usize) -> String {
        self.steps
            .iter()
            .enumerate()
            .map(|(i, s)| {
                let mark = if i < completed { "x" } else { " " };
                format!("[{}] {}. ({}) {}", mark, i + 1, s.action, s.intent)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// 规划结果
#[derive(Debug, Clone, PartialEq)]
pub enum PlannerOutput {
    /// 无需执行任何步骤
    DirectAnswer(String),
    Plan(Plan),
}

/// 解析模型回复为计划
pub fn parse_plan(reply: &LlmReply) -> Result<PlannerOutput, AgentError> {
    match reply {
        LlmReply::Structured(v) => parse_plan_value(v),
        LlmReply::Text(t) => Err(AgentError::Planning(format!(
            "model returned no JSON plan: {}",
            preview(t, 200)
        ))),
    }
}

pub fn parse_plan_value(v: &Value) -> Result<PlannerOutput, AgentError> {
    match v {
        Value::Object(map) => {
            if map.get("directAnswer").and_then(Value::as_bool) == Some(true) {
                let answer = match map.get("answer") {
                    Some(Value::String(s)) => s.clone(),
                    Some(Value::Null) | None => {
                        return Err(AgentError::Planning(
                            "directAnswer without an answer".to_string(),
                        ))
                    }
                    Some(other) => other.to_string(),
                };
                return Ok(PlannerOutput::DirectAnswer(answer));
            }
            for key in ["steps", "plan"] {
                if let Some(inner @ (Value::Array(_) | Value::Object(_))) = map.get(key) {
                    return parse_plan_value(inner);
                }
            }
            let mut keyed: Vec<(&String, &Value)> =
                map.iter().filter(|(_, v)| v.is_object()).collect();
            keyed.sort_by_key(|(k, _)| step_key_order(k));
            let steps = keyed
                .into_iter()
                .map(|(k, v)| parse_step(k, v))
                .collect::<Result<Vec<_>, _>>()?;
            non_empty(steps)
        }
        Value::Array(items) => {
            let steps = items
                .iter()
                .enumerate()
                .map(|(i, v)| parse_step(&format!("#{}", i + 1), v))
                .collect::<Result<Vec<_>, _>>()?;
            non_empty(steps)
        }
        other => Err(AgentError::Planning(format!(
            "unexpected plan shape: {}",
            preview(&other.to_string(), 200)
        ))),
    }
}

fn parse_step(key: &str, v: &Value) -> Result<Step, AgentError> {
    serde_json::from_value::<Step>(v.clone())
        .map_err(|e| AgentError::JsonParseError(format!("step {}: {}", key, e)))
}

fn non_empty(steps: Vec<Step>) -> Result<PlannerOutput, AgentError> {
    if steps.is_empty() {
        Err(AgentError::Planning("plan has no steps".to_string()))
    } else {
        Ok(PlannerOutput::Plan(Plan::new(steps)))
    }
}

/// 键的排序：按末尾数字（step2 < step10），没有数字的键排在最后并按名称排序
fn step_key_order(key: &str) -> (u64, String) {
    let digits: String = key
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    let n = digits.parse().unwrap_or(u64::MAX);
    (n, key.to_string())
}

pub(crate) fn preview(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_chars).collect();
        format!("{}...", cut)
    }
}

/// 单步 JSON 格式（仅用于生成 Schema 注入 system prompt）
#[allow(dead_code)]
#[derive(JsonSchema)]
struct PlanStepFormat {
    /// 这一步要完成的事情
    step: String,
    /// 执行器：codeExecution / fileSystem / research / generation / toolCall
    action: String,
    /// 期望产出
    #[serde(rename = "expectedOutput")]
    expected_output: String,
    /// 使用哪些前序步骤的结果："none"、"all" 或步骤号数组，如 [1, 2]
    #[serde(rename = "usingData")]
    using_data: Value,
    /// 可选：检查结果的条件
    validations: Option<Vec<String>>,
    /// 可选：强度（research 为 low / medium / high）
    intensity: Option<String>,
    /// 可选：执行器参数
    params: Option<Value>,
}

/// 单步格式的 JSON Schema 字符串
pub fn plan_step_schema_json() -> String {
    let schema = schema_for!(PlanStepFormat);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}
