//! LLM 层：客户端抽象与实现（OpenAI 兼容 / Mock）及回复解析

pub mod mock;
pub mod openai;
pub mod reply;
pub mod traits;

use std::sync::Arc;

pub use mock::MockLlmClient;
pub use openai::OpenAiClient;
pub use reply::{extract_json, LlmReply};
pub use traits::{LlmClient, LlmError};

use crate::config::AppConfig;
use crate::memory::Message;

/// 根据配置与环境变量选择 LLM 后端（OpenAI 兼容 / Mock）
pub fn create_llm_from_config(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    let provider = cfg.llm.provider.to_lowercase();
    let api_key = std::env::var("OPENAI_API_KEY")
        .or_else(|_| std::env::var("DEEPSEEK_API_KEY"))
        .ok();

    match (provider.as_str(), api_key) {
        ("mock", _) => {
            tracing::info!("Using Mock LLM (configured)");
            Arc::new(MockLlmClient::new())
        }
        (_, Some(key)) => {
            tracing::info!(model = %cfg.llm.model, "Using OpenAI-compatible LLM");
            Arc::new(OpenAiClient::new(&cfg.llm, &key))
        }
        (_, None) => {
            tracing::warn!("No API key set, using Mock LLM");
            Arc::new(MockLlmClient::new())
        }
    }
}

/// 组装 system + 历史 + 本轮 prompt 后调用模型，并解析为结构化或文本回复
pub async fn ask(
    llm: &dyn LlmClient,
    system: &str,
    prompt: &str,
    history: &[Message],
) -> Result<LlmReply, LlmError> {
    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(Message::system(system.to_string()));
    messages.extend(history.iter().cloned());
    messages.push(Message::user(prompt.to_string()));
    let raw = llm.complete(&messages).await?;
    if raw.trim().is_empty() {
        return Err(LlmError::Empty);
    }
    Ok(LlmReply::parse(&raw))
}
