//! 外部工具协议客户端：按名称管理多个长生命周期的工具服务器会话
//!
//! 表锁只在查找 / 增删会话时持有，等待响应期间不持有任何全局锁。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::RwLock;

use crate::config::{ProtocolSection, ServerEntry};
use crate::protocol::{Capability, ProtocolError, ProtocolSession, SessionState};

/// 启动一个工具服务器所需的信息
#[derive(Debug, Clone, Default)]
pub struct ServerSpec {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

impl From<&ServerEntry> for ServerSpec {
    fn from(e: &ServerEntry) -> Self {
        Self {
            name: e.name.clone(),
            command: e.command.clone(),
            args: e.args.clone(),
            env: e.env.clone(),
        }
    }
}

pub struct ToolProtocolClient {
    sessions: RwLock<HashMap<String, Arc<ProtocolSession>>>,
    discovery_timeout: Duration,
    stop_grace: Duration,
    call_timeout: Option<Duration>,
}

impl Default for ToolProtocolClient {
    fn default() -> Self {
        Self::from_config(&ProtocolSection::default())
    }
}

impl ToolProtocolClient {
    pub fn new(discovery_timeout: Duration, stop_grace: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            discovery_timeout,
            stop_grace,
            call_timeout: None,
        }
    }

    pub fn from_config(cfg: &ProtocolSection) -> Self {
        let client = Self::new(
            Duration::from_secs(cfg.discovery_timeout_secs),
            Duration::from_secs(cfg.stop_grace_secs),
        );
        match cfg.call_timeout_secs {
            0 => client,
            secs => client.with_call_timeout(Duration::from_secs(secs)),
        }
    }

    /// 单次调用超时；未设置时由执行器外层的步骤超时兜底
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    async fn ensure_not_running(&self, name: &str) -> Result<(), ProtocolError> {
        match self.sessions.read().await.get(name) {
            Some(s) if s.state() != SessionState::Terminated => {
                Err(ProtocolError::AlreadyStarted(name.to_string()))
            }
            _ => Ok(()),
        }
    }

    /// 登记会话；若并发启动了同名会话，则停掉本次新建的那个
    async fn install(&self, session: Arc<ProtocolSession>) -> Result<(), ProtocolError> {
        let name = session.name().to_string();
        {
            let mut sessions = self.sessions.write().await;
            let live = sessions
                .get(&name)
                .map(|s| s.state() != SessionState::Terminated)
                .unwrap_or(false);
            if !live {
                sessions.insert(name, session);
                return Ok(());
            }
        }
        session.shutdown(self.stop_grace).await;
        Err(ProtocolError::AlreadyStarted(name))
    }

    /// 启动子进程服务器并立即做能力发现，返回发现的能力
    pub async fn start(
        &self,
        server: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> Result<Vec<Capability>, ProtocolError> {
        self.ensure_not_running(server).await?;
        let session = ProtocolSession::spawn(server, command, args, env)?;
        let caps = session.discover(self.discovery_timeout).await;
        self.install(session).await?;
        Ok(caps)
    }

    pub async fn start_with(&self, spec: &ServerSpec) -> Result<Vec<Capability>, ProtocolError> {
        self.start(&spec.name, &spec.command, &spec.args, &spec.env)
            .await
    }

    /// 启动配置中的全部服务器；单个失败只记日志，返回成功数量
    pub async fn start_all(&self, entries: &[ServerEntry]) -> usize {
        let mut started = 0;
        for entry in entries {
            match self.start_with(&ServerSpec::from(entry)).await {
                Ok(caps) => {
                    started += 1;
                    tracing::info!(server = %entry.name, capabilities = caps.len(), "tool server started");
                }
                Err(e) => tracing::warn!(server = %entry.name, error = %e, "failed to start tool server"),
            }
        }
        started
    }

    /// 在已有传输上建立会话（进程内服务器、测试）
    pub async fn attach<R, W>(
        &self,
        server: &str,
        reader: R,
        writer: W,
    ) -> Result<Vec<Capability>, ProtocolError>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        self.ensure_not_running(server).await?;
        let session = ProtocolSession::connect(server, reader, writer);
        let caps = session.discover(self.discovery_timeout).await;
        self.install(session).await?;
        Ok(caps)
    }

    async fn session(&self, server: &str) -> Result<Arc<ProtocolSession>, ProtocolError> {
        self.sessions
            .read()
            .await
            .get(server)
            .cloned()
            .ok_or_else(|| ProtocolError::UnknownServer(server.to_string()))
    }

    pub async fn list_capabilities(&self, server: &str) -> Result<Vec<Capability>, ProtocolError> {
        Ok(self.session(server).await?.capabilities())
    }

    /// 所有存活服务器的能力：(服务器名, 能力)
    pub async fn all_capabilities(&self) -> Vec<(String, Capability)> {
        let sessions = self.sessions.read().await;
        let mut out: Vec<(String, Capability)> = sessions
            .iter()
            .filter(|(_, s)| s.state() != SessionState::Terminated)
            .flat_map(|(name, s)| {
                s.capabilities()
                    .into_iter()
                    .map(move |c| (name.clone(), c))
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.name.cmp(&b.1.name)));
        out
    }

    /// 找到提供某能力的服务器（按名称排序取第一个）
    pub async fn find_capability(&self, capability: &str) -> Option<String> {
        self.all_capabilities()
            .await
            .into_iter()
            .find(|(_, c)| c.name == capability)
            .map(|(server, _)| server)
    }

    /// 调用能力；等待期间只持有会话的 Arc
    pub async fn invoke(
        &self,
        server: &str,
        capability: &str,
        arguments: Value,
    ) -> Result<Value, ProtocolError> {
        let session = self.session(server).await?;
        tracing::debug!(server, capability, "invoking capability");
        session.invoke(capability, arguments, self.call_timeout).await
    }

    /// 停止服务器：无论是否优雅退出，会话都会从表中移除
    pub async fn stop(&self, server: &str) -> Result<(), ProtocolError> {
        let session = self
            .sessions
            .write()
            .await
            .remove(server)
            .ok_or_else(|| ProtocolError::UnknownServer(server.to_string()))?;
        session.shutdown(self.stop_grace).await;
        tracing::info!(server, "tool server stopped");
        Ok(())
    }

    pub async fn stop_all(&self) {
        let sessions: Vec<Arc<ProtocolSession>> =
            self.sessions.write().await.drain().map(|(_, s)| s).collect();
        for s in sessions {
            s.shutdown(self.stop_grace).await;
        }
    }

    pub async fn pending_count(&self, server: &str) -> Option<usize> {
        self.sessions
            .read()
            .await
            .get(server)
            .map(|s| s.pending_count())
    }

    pub async fn state(&self, server: &str) -> Option<SessionState> {
        self.sessions.read().await.get(server).map(|s| s.state())
    }

    pub async fn pid(&self, server: &str) -> Option<u32> {
        self.sessions.read().await.get(server).and_then(|s| s.pid())
    }

    pub async fn servers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unknown_server() {
        let client = ToolProtocolClient::default();
        assert!(matches!(
            client.invoke("nope", "x", Value::Null).await,
            Err(ProtocolError::UnknownServer(_))
        ));
        assert!(matches!(
            client.stop("nope").await,
            Err(ProtocolError::UnknownServer(_))
        ));
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let client = ToolProtocolClient::default();
        let err = client
            .start("bad", "definitely-not-a-tool-server", &[], &HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Spawn { .. }));
        assert!(client.servers().await.is_empty());
    }
}
