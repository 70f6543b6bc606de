//! 单个任务的执行上下文
//!
//! 持有 LLM、沙箱管理器、协议客户端的共享引用；沙箱在第一次被需要时才创建，
//! 由编排器在任务结束时通过 release 销毁。

use std::sync::Arc;

use crate::llm::LlmClient;
use crate::protocol::ToolProtocolClient;
use crate::sandbox::{SandboxError, SandboxManager};

pub struct TaskContext {
    task_id: String,
    llm: Arc<dyn LlmClient>,
    sandboxes: Arc<SandboxManager>,
    protocol: Arc<ToolProtocolClient>,
    sandbox_id: tokio::sync::Mutex<Option<String>>,
}

impl TaskContext {
    pub fn new(
        task_id: impl Into<String>,
        llm: Arc<dyn LlmClient>,
        sandboxes: Arc<SandboxManager>,
        protocol: Arc<ToolProtocolClient>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            llm,
            sandboxes,
            protocol,
            sandbox_id: tokio::sync::Mutex::new(None),
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn llm(&self) -> &dyn LlmClient {
        self.llm.as_ref()
    }

    pub fn sandboxes(&self) -> &SandboxManager {
        &self.sandboxes
    }

    pub fn protocol(&self) -> &ToolProtocolClient {
        &self.protocol
    }

    pub fn workdir(&self) -> &str {
        self.sandboxes.workdir()
    }

    /// 当前任务的沙箱；首次调用时创建
    pub async fn sandbox(&self) -> Result<String, SandboxError> {
        let mut slot = self.sandbox_id.lock().await;
        if let Some(id) = slot.as_ref() {
            return Ok(id.clone());
        }
        let id = self.sandboxes.provision(&self.task_id).await?;
        *slot = Some(id.clone());
        Ok(id)
    }

    /// 已创建的沙箱 id（不会触发创建）
    pub async fn sandbox_id(&self) -> Option<String> {
        self.sandbox_id.lock().await.clone()
    }

    /// 相对路径按沙箱工作目录解析
    pub fn resolve_path(&self, path: &str) -> String {
        let path = path.trim();
        if path.starts_with('/') {
            path.to_string()
        } else {
            let rel = path.trim_start_matches("./");
            let base = self.workdir().trim_end_matches('/');
            if rel.is_empty() || rel == "." {
                base.to_string()
            } else {
                format!("{}/{}", base, rel)
            }
        }
    }

    /// 销毁本任务的沙箱；没有创建过时返回 None
    pub async fn release(&self) -> Option<bool> {
        let id = self.sandbox_id.lock().await.take()?;
        Some(self.sandboxes.destroy(&id).await)
    }
}
