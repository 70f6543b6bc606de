//! 模型回复解析：从文本中提取 JSON（```json 代码块、首个 { 或 [ 到末尾配对符号），
//! 提取失败时保留为纯文本。

use serde_json::Value;

/// 模型回复：结构化 JSON 或自由文本
#[derive(Debug, Clone, PartialEq)]
pub enum LlmReply {
    Structured(Value),
    Text(String),
}

impl LlmReply {
    pub fn parse(raw: &str) -> Self {
        match extract_json(raw) {
            Some(v) => LlmReply::Structured(v),
            None => LlmReply::Text(raw.trim().to_string()),
        }
    }

    /// 文本形式：结构化结果序列化为紧凑 JSON
    pub fn to_text(&self) -> String {
        match self {
            LlmReply::Structured(v) => match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            },
            LlmReply::Text(t) => t.clone(),
        }
    }
}

/// 尝试从模型输出中提取一个 JSON 值
pub fn extract_json(output: &str) -> Option<Value> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        let body = rest.find("```").map(|end| &rest[..end]).unwrap_or(rest);
        if let Ok(v) = serde_json::from_str(body.trim()) {
            return Some(v);
        }
    }

    if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
        if v.is_object() || v.is_array() {
            return Some(v);
        }
    }

    for (open, close) in [('{', '}'), ('[', ']')] {
        if let (Some(start), Some(end)) = (trimmed.find(open), trimmed.rfind(close)) {
            if start < end {
                if let Ok(v) = serde_json::from_str(&trimmed[start..=end]) {
                    return Some(v);
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fenced_block() {
        let raw = "Here is the plan:\n```json\n{\"a\": 1}\n```\nthanks";
        assert_eq!(extract_json(raw), Some(serde_json::json!({"a": 1})));
    }

    #[test]
    fn test_embedded_object() {
        let raw = "sure {\"changePlan\": false} done";
        assert_eq!(
            LlmReply::parse(raw),
            LlmReply::Structured(serde_json::json!({"changePlan": false}))
        );
    }

    #[test]
    fn test_plain_text_stays_text() {
        assert_eq!(LlmReply::parse("  OK  "), LlmReply::Text("OK".to_string()));
        assert_eq!(LlmReply::parse("broken {json"), LlmReply::Text("broken {json".to_string()));
    }
}
