//! 单个外部工具服务器的会话
//!
//! 会话核心只依赖 AsyncRead / AsyncWrite：子进程（stdin/stdout）与进程内 duplex 走同一套关联逻辑。
//! 每个请求分配单调递增的 id，在 pending 表里登记一个 oneshot；读取任务按 id 完成对应请求，
//! 与响应顺序无关。会话终止时 pending 表被关闭并整体清空，之后的登记直接失败，不会留下悬挂请求。

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};

use crate::protocol::message::{parse_capabilities, Request, Response, DISCOVERY_METHOD, INVOKE_METHOD};
use crate::protocol::{Capability, ProtocolError};

/// 单行消息上限
const MAX_LINE_BYTES: usize = 8 * 1024 * 1024;

/// 会话生命周期
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    Ready,
    /// 出现 I/O 错误，正在走向终止
    Degraded,
    Terminated,
}

type Waiter = oneshot::Sender<Result<Value, ProtocolError>>;

#[derive(Default)]
struct PendingInner {
    /// 非 None 表示会话已终止，值为服务器名
    closed: Option<String>,
    waiters: HashMap<u64, Waiter>,
}

/// 进行中请求表；关闭与登记在同一把锁下完成
#[derive(Default)]
struct PendingTable {
    inner: Mutex<PendingInner>,
}

impl PendingTable {
    fn lock(&self) -> std::sync::MutexGuard<'_, PendingInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn register(&self, id: u64) -> Result<oneshot::Receiver<Result<Value, ProtocolError>>, ProtocolError> {
        let mut inner = self.lock();
        if let Some(server) = &inner.closed {
            return Err(ProtocolError::ServerClosed(server.clone()));
        }
        let (tx, rx) = oneshot::channel();
        inner.waiters.insert(id, tx);
        Ok(rx)
    }

    fn complete(&self, id: u64, result: Result<Value, ProtocolError>) -> bool {
        let waiter = self.lock().waiters.remove(&id);
        match waiter {
            Some(tx) => {
                // 调用方可能刚好超时放弃，忽略发送失败
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    fn remove(&self, id: u64) {
        self.lock().waiters.remove(&id);
    }

    /// 关闭表并让所有进行中请求以 ServerClosed 失败，返回失败数量
    fn close(&self, server: &str) -> usize {
        let drained: Vec<Waiter> = {
            let mut inner = self.lock();
            if inner.closed.is_none() {
                inner.closed = Some(server.to_string());
            }
            inner.waiters.drain().map(|(_, tx)| tx).collect()
        };
        let n = drained.len();
        for tx in drained {
            let _ = tx.send(Err(ProtocolError::ServerClosed(server.to_string())));
        }
        n
    }

    fn len(&self) -> usize {
        self.lock().waiters.len()
    }
}

/// 请求返回（含超时、取消）时移除自己的 pending 项
struct PendingGuard<'a> {
    table: &'a PendingTable,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.table.remove(self.id);
    }
}

/// 读取任务与进程监视任务共享的终止逻辑
struct Shared {
    name: String,
    pending: PendingTable,
    state: watch::Sender<SessionState>,
}

impl Shared {
    fn terminate(&self, reason: &str) {
        let failed = self.pending.close(&self.name);
        let prev = self.state.send_replace(SessionState::Terminated);
        if prev != SessionState::Terminated {
            tracing::info!(server = %self.name, reason, failed_requests = failed, "tool server session terminated");
        }
    }

    fn degrade(&self) {
        self.state.send_if_modified(|s| {
            if matches!(s, SessionState::Starting | SessionState::Ready) {
                *s = SessionState::Degraded;
                true
            } else {
                false
            }
        });
    }
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

pub struct ProtocolSession {
    shared: Arc<Shared>,
    next_id: AtomicU64,
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    capabilities: RwLock<Vec<Capability>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    kill: Mutex<Option<oneshot::Sender<()>>>,
    pid: Option<u32>,
}

impl std::fmt::Debug for ProtocolSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolSession")
            .field("name", &self.shared.name)
            .field("state", &self.state())
            .field("pid", &self.pid)
            .finish()
    }
}

impl ProtocolSession {
    /// 在任意传输上建立会话并启动读取任务；状态为 Starting，需随后调用 discover
    pub fn connect<R, W>(name: impl Into<String>, reader: R, writer: W) -> Arc<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::connect_with_pid(name.into(), reader, Box::new(writer), None)
    }

    fn connect_with_pid<R>(name: String, reader: R, writer: BoxedWriter, pid: Option<u32>) -> Arc<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let (state, _) = watch::channel(SessionState::Starting);
        let shared = Arc::new(Shared {
            name,
            pending: PendingTable::default(),
            state,
        });
        let reader_task = tokio::spawn(read_loop(shared.clone(), reader));
        Arc::new(Self {
            shared,
            next_id: AtomicU64::new(1),
            writer: tokio::sync::Mutex::new(Some(writer)),
            capabilities: RwLock::new(Vec::new()),
            tasks: Mutex::new(vec![reader_task]),
            kill: Mutex::new(None),
            pid,
        })
    }

    /// 启动子进程：stdin/stdout 作为传输，stderr 转发到 tracing
    pub fn spawn(
        name: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> Result<Arc<Self>, ProtocolError> {
        let spawn_err = |message: String| ProtocolError::Spawn {
            server: name.to_string(),
            message,
        };
        let mut child = Command::new(command)
            .args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_err(format!("{}: {}", command, e)))?;

        let stdin = child.stdin.take().ok_or_else(|| spawn_err("stdin not captured".into()))?;
        let stdout = child.stdout.take().ok_or_else(|| spawn_err("stdout not captured".into()))?;
        let stderr = child.stderr.take().ok_or_else(|| spawn_err("stderr not captured".into()))?;
        let pid = child.id();

        let session = Self::connect_with_pid(name.to_string(), stdout, Box::new(stdin), pid);

        let server = name.to_string();
        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(server = %server, "stderr: {}", line);
            }
        });

        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let shared = session.shared.clone();
        let watcher = tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    if let Err(e) = child.start_kill() {
                        tracing::warn!(server = %shared.name, error = %e, "kill failed");
                    }
                    child.wait().await
                }
            };
            match status {
                Ok(s) => tracing::info!(server = %shared.name, status = %s, "tool server exited"),
                Err(e) => tracing::warn!(server = %shared.name, error = %e, "waiting for tool server failed"),
            }
            shared.terminate("process exited");
        });

        if let Ok(mut k) = session.kill.lock() {
            *k = Some(kill_tx);
        }
        if let Ok(mut tasks) = session.tasks.lock() {
            tasks.push(stderr_task);
            tasks.push(watcher);
        }
        tracing::info!(server = %name, command, pid = ?pid, "tool server spawned");
        Ok(session)
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    pub fn pending_count(&self) -> usize {
        self.shared.pending.len()
    }

    pub fn capabilities(&self) -> Vec<Capability> {
        self.capabilities
            .read()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    /// 能力发现；失败（超时、远端错误）只记日志，会话以空能力表进入 Ready
    pub async fn discover(&self, timeout: Duration) -> Vec<Capability> {
        let caps = match self.request(DISCOVERY_METHOD, json!({}), Some(timeout)).await {
            Ok(result) => parse_capabilities(&result),
            Err(e) => {
                tracing::warn!(server = %self.shared.name, error = %e, "capability discovery failed");
                Vec::new()
            }
        };
        if let Ok(mut c) = self.capabilities.write() {
            *c = caps.clone();
        }
        self.shared.state.send_if_modified(|s| {
            if *s == SessionState::Starting {
                *s = SessionState::Ready;
                true
            } else {
                false
            }
        });
        tracing::info!(server = %self.shared.name, capabilities = caps.len(), "tool server ready");
        caps
    }

    /// 调用一个能力：`tools/call {name, arguments}`
    pub async fn invoke(
        &self,
        capability: &str,
        arguments: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, ProtocolError> {
        self.request(
            INVOKE_METHOD,
            json!({ "name": capability, "arguments": arguments }),
            timeout,
        )
        .await
    }

    /// 发送请求并等待对应 id 的响应
    pub async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, ProtocolError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let rx = self.shared.pending.register(id)?;
        let _guard = PendingGuard {
            table: &self.shared.pending,
            id,
        };

        let line = Request::new(id, method, params)
            .to_line()
            .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        self.write_line(&line).await?;
        tracing::debug!(server = %self.shared.name, id, method, "request sent");

        let received = match timeout {
            Some(t) => tokio::time::timeout(t, rx).await.map_err(|_| ProtocolError::Timeout {
                server: self.shared.name.clone(),
                method: method.to_string(),
                secs: t.as_secs(),
            })?,
            None => rx.await,
        };
        match received {
            Ok(result) => result,
            // 发送端被丢弃只可能发生在会话被清理时
            Err(_) => Err(ProtocolError::ServerClosed(self.shared.name.clone())),
        }
    }

    async fn write_line(&self, line: &str) -> Result<(), ProtocolError> {
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(ProtocolError::ServerClosed(self.shared.name.clone()));
        };
        let written = async {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = written {
            *guard = None;
            self.shared.degrade();
            tracing::warn!(server = %self.shared.name, error = %e, "write to tool server failed");
            return Err(ProtocolError::Io {
                server: self.shared.name.clone(),
                message: e.to_string(),
            });
        }
        Ok(())
    }

    /// 停止会话：先关闭 stdin 等待自行退出，超过宽限期则强杀；无论如何最终清理状态
    pub async fn shutdown(&self, grace: Duration) {
        self.writer.lock().await.take();

        let mut rx = self.shared.state.subscribe();
        let exited = tokio::time::timeout(grace, rx.wait_for(|s| *s == SessionState::Terminated))
            .await
            .is_ok();

        if !exited {
            let kill = self.kill.lock().ok().and_then(|mut k| k.take());
            if let Some(kill) = kill {
                tracing::warn!(server = %self.shared.name, "tool server ignored stdin close, killing");
                let _ = kill.send(());
                let _ = tokio::time::timeout(grace, rx.wait_for(|s| *s == SessionState::Terminated)).await;
            }
        }

        self.shared.terminate("stopped");
        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .map(|mut t| t.drain(..).collect())
            .unwrap_or_default();
        for t in tasks {
            t.abort();
        }
    }
}

impl Drop for ProtocolSession {
    fn drop(&mut self) {
        self.shared.terminate("dropped");
        if let Ok(mut tasks) = self.tasks.lock() {
            for t in tasks.drain(..) {
                t.abort();
            }
        }
    }
}

async fn read_loop<R>(shared: Arc<Shared>, reader: R)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
    while let Some(item) = lines.next().await {
        match item {
            Ok(line) => handle_line(&shared, &line),
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                tracing::warn!(server = %shared.name, "oversized line from tool server skipped");
            }
            Err(LinesCodecError::Io(e)) => {
                tracing::warn!(server = %shared.name, error = %e, "read from tool server failed");
                shared.degrade();
                break;
            }
        }
    }
    shared.terminate("stdout closed");
}

fn handle_line(shared: &Shared, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    let response = match Response::parse(line) {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(server = %shared.name, error = %e, "skipping non-response line");
            return;
        }
    };
    let Some(id) = response.id else {
        tracing::debug!(server = %shared.name, "notification ignored");
        return;
    };
    let result = response.into_result().map_err(|e| ProtocolError::Remote {
        message: e.message,
        code: e.code,
    });
    if !shared.pending.complete(id, result) {
        tracing::debug!(server = %shared.name, id, "response for unknown request dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, split};

    #[test]
    fn test_pending_table_close_rejects_new() {
        let table = PendingTable::default();
        let _rx = table.register(1).unwrap();
        assert_eq!(table.close("srv"), 1);
        assert_eq!(table.len(), 0);
        assert!(matches!(table.register(2), Err(ProtocolError::ServerClosed(_))));
    }

    #[tokio::test]
    async fn test_timeout_removes_pending_entry() {
        let (client, _server) = duplex(4096);
        let (r, w) = split(client);
        let session = ProtocolSession::connect("silent", r, w);
        let err = session
            .request("tools/list", json!({}), Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Timeout { .. }));
        assert_eq!(session.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_remote_error_is_call_level() {
        let (client, server) = duplex(4096);
        let (r, w) = split(client);
        let session = ProtocolSession::connect("srv", r, w);

        let (sr, mut sw) = split(server);
        tokio::spawn(async move {
            let mut lines = BufReader::new(sr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let v: Value = serde_json::from_str(&line).unwrap();
                let reply = json!({"id": v["id"], "error": {"message": "no such tool"}});
                sw.write_all(format!("{}\n", reply).as_bytes()).await.unwrap();
            }
        });

        let err = session.invoke("missing", json!({}), None).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Remote { .. }));
        assert!(!err.is_session_level());
        assert_ne!(session.state(), SessionState::Terminated);
    }

    #[tokio::test]
    async fn test_eof_fails_pending_and_rejects_new() {
        let (client, server) = duplex(4096);
        let (r, w) = split(client);
        let session = ProtocolSession::connect("srv", r, w);

        let s = session.clone();
        let call = tokio::spawn(async move { s.invoke("slow", json!({}), None).await });
        while session.pending_count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        drop(server);

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, ProtocolError::ServerClosed(_)));
        assert_eq!(session.state(), SessionState::Terminated);
        assert!(matches!(
            session.invoke("again", json!({}), None).await,
            Err(ProtocolError::ServerClosed(_))
        ));
    }
}
