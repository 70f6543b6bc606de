//! 线格式：按行分隔的 JSON-RPC 风格消息
//!
//! 请求：`{"jsonrpc":"2.0","id":N,"method":"...","params":{...}}`
//! 响应：`{"id":N,"result":...}` 或 `{"id":N,"error":{"message":"...","code":-1}}`

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 能力发现
pub const DISCOVERY_METHOD: &str = "tools/list";
/// 能力调用，params 为 `{name, arguments}`
pub const INVOKE_METHOD: &str = "tools/call";

#[derive(Debug, Clone, Serialize)]
pub struct Request {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

impl Request {
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method: method.into(),
            params,
        }
    }

    /// 序列化为单行（不含换行符）
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RemoteError {
    pub message: String,
    #[serde(default)]
    pub code: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Response {
    /// 通知类消息没有 id，读取端直接丢弃
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RemoteError>,
}

impl Response {
    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }

    /// 转成调用方关心的结果；既无 result 也无 error 视为 null 结果
    pub fn into_result(self) -> Result<Value, RemoteError> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// 外部服务器声明的一个能力
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Capability {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "inputSchema", alias = "input_schema")]
    pub input_schema: Value,
}

/// 解析 tools/list 的结果：裸数组或 `{tools: [...]}`；无法识别的条目跳过
pub fn parse_capabilities(result: &Value) -> Vec<Capability> {
    let list = match result {
        Value::Array(items) => items.as_slice(),
        Value::Object(map) => match map.get("tools") {
            Some(Value::Array(items)) => items.as_slice(),
            _ => &[],
        },
        _ => &[],
    };
    list.iter()
        .filter_map(|item| match serde_json::from_value::<Capability>(item.clone()) {
            Ok(c) => Some(c),
            Err(e) => {
                tracing::debug!(error = %e, item = %item, "skipping malformed capability");
                None
            }
        })
        .collect()
}
