//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / Mock）实现 LlmClient::complete；模型被视作不透明的外部服务，
//! 可能失败，也可能返回格式错误的输出，上层通过 LlmReply 同时接受结构化结果与纯文本。

use async_trait::async_trait;
use thiserror::Error;

use crate::memory::Message;

/// 模型边界上的错误
#[derive(Debug, Clone, Error)]
pub enum LlmError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("empty response")]
    Empty,

    #[error("malformed output: {0}")]
    Malformed(String),
}

/// LLM 客户端 trait：非流式完成
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError>;

    /// 获取累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    /// 默认返回 (0, 0, 0)，具体实现可覆盖
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}
