//! 沙箱管理器
//!
//! 每个任务独占一个沙箱；provision 对存活沙箱幂等，变更类操作共用 with_retry 重试循环。
//! 文件传输通过宿主机临时文件（tempfile）中转，临时文件随作用域结束删除。
//! destroy 总会尝试执行，失败只记日志。

use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::SandboxSection;
use crate::sandbox::runtime::shell_quote;
use crate::sandbox::{
    with_retry, ContainerRuntime, DockerRuntime, ExecOutput, InMemoryRuntime, RetryPolicy,
    SandboxError,
};

/// 沙箱生命周期
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SandboxStatus {
    Provisioning,
    Ready,
    InUse,
    Destroyed,
}

#[derive(Debug, Clone, Serialize)]
pub struct SandboxRecord {
    pub id: String,
    pub task_id: String,
    pub status: SandboxStatus,
    pub created_at: DateTime<Utc>,
}

type TaskSlot = Arc<tokio::sync::Mutex<Option<String>>>;

pub struct SandboxManager {
    runtime: Arc<dyn ContainerRuntime>,
    retry: RetryPolicy,
    name_prefix: String,
    workdir: String,
    /// task_id -> 该任务的沙箱槽位，仅用于幂等 provision。
    /// 外层表只在查找 / 插入槽位时短暂加锁；创建容器期间只持有本任务的槽位锁。
    by_task: Mutex<HashMap<String, TaskSlot>>,
    sandboxes: Mutex<HashMap<String, SandboxRecord>>,
}

impl SandboxManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        retry: RetryPolicy,
        name_prefix: impl Into<String>,
        workdir: impl Into<String>,
    ) -> Self {
        Self {
            runtime,
            retry,
            name_prefix: name_prefix.into(),
            workdir: workdir.into(),
            by_task: Mutex::new(HashMap::new()),
            sandboxes: Mutex::new(HashMap::new()),
        }
    }

    /// 按 [sandbox] 配置选择运行时（docker / memory）
    pub fn from_config(cfg: &SandboxSection) -> Self {
        let runtime: Arc<dyn ContainerRuntime> = match cfg.runtime.as_str() {
            "memory" | "in-memory" => Arc::new(InMemoryRuntime::new(cfg.workdir.clone())),
            "docker" => Arc::new(DockerRuntime::new(
                cfg.image.clone(),
                cfg.workdir.clone(),
                cfg.command_timeout_secs,
            )),
            other => {
                tracing::warn!(runtime = %other, "unknown sandbox runtime, using docker");
                Arc::new(DockerRuntime::new(
                    cfg.image.clone(),
                    cfg.workdir.clone(),
                    cfg.command_timeout_secs,
                ))
            }
        };
        let retry = RetryPolicy::new(cfg.max_attempts, cfg.base_delay(), cfg.max_delay());
        Self::new(runtime, retry, cfg.name_prefix.clone(), cfg.workdir.clone())
    }

    pub fn workdir(&self) -> &str {
        &self.workdir
    }

    pub fn runtime_name(&self) -> &str {
        self.runtime.name()
    }

    fn records(&self) -> std::sync::MutexGuard<'_, HashMap<String, SandboxRecord>> {
        self.sandboxes.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn slot(&self, task_id: &str) -> TaskSlot {
        self.by_task
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(task_id.to_string())
            .or_default()
            .clone()
    }

    fn set_status(&self, id: &str, status: SandboxStatus) {
        if let Some(r) = self.records().get_mut(id) {
            r.status = status;
        }
    }

    pub fn status(&self, id: &str) -> Option<SandboxStatus> {
        self.records().get(id).map(|r| r.status)
    }

    pub fn record(&self, id: &str) -> Option<SandboxRecord> {
        self.records().get(id).cloned()
    }

    /// 存活（未销毁）沙箱数量
    pub fn live_count(&self) -> usize {
        self.records()
            .values()
            .filter(|r| r.status != SandboxStatus::Destroyed)
            .count()
    }

    /// 校验 id 存活，返回容器名
    fn live(&self, id: &str) -> Result<String, SandboxError> {
        match self.records().get(id) {
            Some(r) if r.status != SandboxStatus::Destroyed => Ok(r.id.clone()),
            _ => Err(SandboxError::UnknownSandbox(id.to_string())),
        }
    }

    fn fresh_name(&self) -> String {
        let id = uuid::Uuid::new_v4().simple().to_string();
        format!("{}-{}", self.name_prefix, &id[..12])
    }

    /// 为任务创建沙箱；该任务已有存活沙箱时直接返回其 id
    ///
    /// 每次尝试都生成新名字，名字冲突因此可以安全重试。
    pub async fn provision(&self, task_id: &str) -> Result<String, SandboxError> {
        let slot = self.slot(task_id);
        let mut current = slot.lock().await;
        if let Some(id) = current.as_deref() {
            if matches!(
                self.status(id),
                Some(SandboxStatus::Ready) | Some(SandboxStatus::InUse)
            ) {
                tracing::debug!(task_id, sandbox = %id, "reusing live sandbox");
                return Ok(id.to_string());
            }
        }

        let runtime = self.runtime.clone();
        let id = with_retry(&self.retry, "provision", |attempt| {
            let name = self.fresh_name();
            let runtime = runtime.clone();
            async move {
                tracing::debug!(sandbox = %name, attempt, "creating sandbox");
                match runtime.create(&name).await {
                    Ok(()) => Ok(name),
                    Err(e) if e.is_name_conflict() => {
                        tracing::debug!(sandbox = %name, "name already in use, retrying with a fresh name");
                        Err(e)
                    }
                    Err(e) => Err(e),
                }
            }
        })
        .await?;

        self.records().insert(
            id.clone(),
            SandboxRecord {
                id: id.clone(),
                task_id: task_id.to_string(),
                status: SandboxStatus::Ready,
                created_at: Utc::now(),
            },
        );
        *current = Some(id.clone());
        tracing::info!(task_id, sandbox = %id, runtime = self.runtime.name(), "sandbox provisioned");
        Ok(id)
    }

    /// 在沙箱内执行命令；非零退出码通过 ExecOutput 返回而不是错误
    pub async fn exec(&self, id: &str, command: &str) -> Result<ExecOutput, SandboxError> {
        let name = self.live(id)?;
        self.set_status(id, SandboxStatus::InUse);
        let result = with_retry(&self.retry, "exec", |_| self.runtime.exec(&name, command)).await;
        self.set_status(id, SandboxStatus::Ready);
        result
    }

    /// 写文件：路径必须为绝对路径；父目录不存在时先创建
    pub async fn write_file(&self, id: &str, path: &str, content: &str) -> Result<(), SandboxError> {
        ensure_absolute(path)?;
        let name = self.live(id)?;

        let mut staged = tempfile::NamedTempFile::new()?;
        staged.write_all(content.as_bytes())?;
        staged.flush()?;

        self.set_status(id, SandboxStatus::InUse);
        let result = async {
            let mkdir = format!("mkdir -p {}", shell_quote(&parent_dir(path)));
            let mk = with_retry(&self.retry, "mkdir", |_| self.runtime.exec(&name, &mkdir)).await?;
            if !mk.success() {
                return Err(SandboxError::runtime("mkdir", mk.stderr.trim().to_string()));
            }
            with_retry(&self.retry, "copy_in", |_| {
                self.runtime.copy_in(&name, staged.path(), path)
            })
            .await
        }
        .await;
        self.set_status(id, SandboxStatus::Ready);

        match &result {
            Ok(()) => tracing::debug!(sandbox = %id, path, bytes = content.len(), "file written"),
            Err(e) => tracing::warn!(sandbox = %id, path, error = %e, "write_file failed"),
        }
        result
    }

    /// 读文件：先探测路径是否存在；不存在时错误里附带父目录状态与同级文件列表
    pub async fn read_file(&self, id: &str, path: &str) -> Result<String, SandboxError> {
        ensure_absolute(path)?;
        let name = self.live(id)?;

        let test = format!("test -e {}", shell_quote(path));
        let probe = with_retry(&self.retry, "exec", |_| self.runtime.exec(&name, &test)).await?;
        if !probe.success() {
            return Err(self.not_found(id, &name, path).await);
        }

        let staging = tempfile::tempdir()?;
        let host = staging.path().join("content");
        let copied = with_retry(&self.retry, "copy_out", |_| {
            self.runtime.copy_out(&name, path, &host)
        })
        .await;
        match copied {
            Ok(()) => {}
            Err(e) if e.class() == crate::sandbox::ErrorClass::Permanent => {
                tracing::debug!(sandbox = %id, path, error = %e, "copy_out failed after probe");
                return Err(self.not_found(id, &name, path).await);
            }
            Err(e) => return Err(e),
        }
        let bytes = tokio::fs::read(&host).await?;
        Ok(String::from_utf8_lossy(&bytes).to_string())
    }

    /// 构造带诊断信息的 NotFound；诊断本身失败不影响返回
    async fn not_found(&self, id: &str, name: &str, path: &str) -> SandboxError {
        let parent = parent_dir(path);
        let mut diagnostics = String::new();
        let parent_exists = self
            .runtime
            .exec(name, &format!("test -d {}", shell_quote(&parent)))
            .await
            .map(|o| o.success())
            .unwrap_or(false);
        if parent_exists {
            diagnostics.push_str(&format!(" (parent {} exists", parent));
            if let Ok(ls) = self
                .runtime
                .exec(name, &format!("ls -1a {}", shell_quote(&parent)))
                .await
            {
                let siblings: Vec<&str> = ls
                    .stdout
                    .lines()
                    .filter(|l| *l != "." && *l != "..")
                    .collect();
                diagnostics.push_str(&format!("; contents: [{}]", siblings.join(", ")));
            }
            diagnostics.push(')');
        } else {
            diagnostics.push_str(&format!(" (parent {} does not exist)", parent));
        }
        SandboxError::NotFound {
            sandbox: id.to_string(),
            path: path.to_string(),
            diagnostics,
        }
    }

    /// 列目录（不含 . 与 ..）
    pub async fn list_dir(&self, id: &str, path: &str) -> Result<Vec<String>, SandboxError> {
        ensure_absolute(path)?;
        let out = self.exec(id, &format!("ls -1a {}", shell_quote(path))).await?;
        if !out.success() {
            return Err(SandboxError::NotFound {
                sandbox: id.to_string(),
                path: path.to_string(),
                diagnostics: format!(" ({})", out.stderr.trim()),
            });
        }
        Ok(out
            .stdout
            .lines()
            .filter(|l| !l.is_empty() && *l != "." && *l != "..")
            .map(str::to_string)
            .collect())
    }

    pub async fn mkdir(&self, id: &str, path: &str) -> Result<(), SandboxError> {
        ensure_absolute(path)?;
        let out = self.exec(id, &format!("mkdir -p {}", shell_quote(path))).await?;
        if out.success() {
            Ok(())
        } else {
            Err(SandboxError::runtime("mkdir", out.stderr.trim().to_string()))
        }
    }

    pub async fn remove_path(&self, id: &str, path: &str) -> Result<(), SandboxError> {
        ensure_absolute(path)?;
        let out = self.exec(id, &format!("rm -rf {}", shell_quote(path))).await?;
        if out.success() {
            Ok(())
        } else {
            Err(SandboxError::runtime("delete", out.stderr.trim().to_string()))
        }
    }

    /// 销毁沙箱：总会尝试删除并标记为 Destroyed；返回运行时删除是否成功
    pub async fn destroy(&self, id: &str) -> bool {
        let task_id = match self.records().get(id) {
            Some(r) if r.status == SandboxStatus::Destroyed => {
                tracing::debug!(sandbox = %id, "sandbox already destroyed");
                return true;
            }
            Some(r) => Some(r.task_id.clone()),
            None => None,
        };

        let ok = match with_retry(&self.retry, "destroy", |_| self.runtime.remove(id)).await {
            Ok(()) => {
                tracing::info!(sandbox = %id, "sandbox destroyed");
                true
            }
            Err(e) => {
                tracing::warn!(sandbox = %id, error = %e, "failed to destroy sandbox");
                false
            }
        };

        self.set_status(id, SandboxStatus::Destroyed);
        if let Some(task_id) = task_id {
            // 槽位仍指向本沙箱时才移除；正在为该任务创建新沙箱的槽位保持不动
            let mut by_task = self.by_task.lock().unwrap_or_else(|p| p.into_inner());
            let stale = by_task
                .get(&task_id)
                .and_then(|slot| slot.try_lock().ok().map(|cur| cur.as_deref() == Some(id)))
                .unwrap_or(false);
            if stale {
                by_task.remove(&task_id);
            }
        }
        ok
    }

    /// 进程退出前销毁全部存活沙箱
    pub async fn shutdown(&self) {
        let live: Vec<String> = self
            .records()
            .values()
            .filter(|r| r.status != SandboxStatus::Destroyed)
            .map(|r| r.id.clone())
            .collect();
        if !live.is_empty() {
            tracing::info!(count = live.len(), "destroying remaining sandboxes");
        }
        for id in live {
            self.destroy(&id).await;
        }
    }
}

fn ensure_absolute(path: &str) -> Result<(), SandboxError> {
    if path.starts_with('/') {
        Ok(())
    } else {
        Err(SandboxError::RelativePath(path.to_string()))
    }
}

fn parent_dir(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(i) => trimmed[..i].to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn manager() -> (Arc<InMemoryRuntime>, SandboxManager) {
        let rt = Arc::new(InMemoryRuntime::default());
        let mgr = SandboxManager::new(
            rt.clone(),
            RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(10)),
            "test",
            "/workspace",
        );
        (rt, mgr)
    }

    #[test]
    fn test_parent_dir() {
        assert_eq!(parent_dir("/workspace/a.txt"), "/workspace");
        assert_eq!(parent_dir("/a.txt"), "/");
        assert_eq!(parent_dir("/workspace/out/"), "/workspace");
    }

    #[tokio::test]
    async fn test_provision_is_idempotent_per_task() {
        let (rt, mgr) = manager();
        let a = mgr.provision("t1").await.unwrap();
        let b = mgr.provision("t1").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(rt.created().len(), 1);
        assert_eq!(mgr.status(&a), Some(SandboxStatus::Ready));
    }

    #[tokio::test]
    async fn test_provision_retries_name_conflict() {
        let (rt, mgr) = manager();
        rt.inject_failure("provision", "Conflict. The container name is already in use", 2);
        let id = mgr.provision("t1").await.unwrap();
        assert_eq!(rt.attempts("provision"), 3);
        assert!(id.starts_with("test-"));
    }

    #[tokio::test]
    async fn test_relative_path_rejected_without_runtime_call() {
        let (rt, mgr) = manager();
        let id = mgr.provision("t1").await.unwrap();
        let err = mgr.write_file(&id, "notes.txt", "x").await.unwrap_err();
        assert!(matches!(err, SandboxError::RelativePath(_)));
        assert_eq!(rt.attempts("exec"), 0);
        assert_eq!(rt.attempts("copy_in"), 0);
    }

    #[tokio::test]
    async fn test_write_then_read_creates_parent() {
        let (rt, mgr) = manager();
        let id = mgr.provision("t1").await.unwrap();
        mgr.write_file(&id, "/workspace/out/report.md", "# hi").await.unwrap();
        assert_eq!(rt.file(&id, "/workspace/out/report.md").as_deref(), Some("# hi"));
        assert_eq!(mgr.read_file(&id, "/workspace/out/report.md").await.unwrap(), "# hi");
    }

    #[tokio::test]
    async fn test_read_missing_carries_diagnostics() {
        let (_rt, mgr) = manager();
        let id = mgr.provision("t1").await.unwrap();
        mgr.write_file(&id, "/workspace/present.txt", "x").await.unwrap();
        let err = mgr.read_file(&id, "/workspace/missing.txt").await.unwrap_err();
        match err {
            SandboxError::NotFound { diagnostics, .. } => {
                assert!(diagnostics.contains("parent /workspace exists"));
                assert!(diagnostics.contains("present.txt"));
            }
            other => panic!("unexpected: {other:?}"),
        }

        let err = mgr.read_file(&id, "/nowhere/x.txt").await.unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[tokio::test]
    async fn test_destroy_always_marks_destroyed() {
        let (rt, mgr) = manager();
        let id = mgr.provision("t1").await.unwrap();
        rt.inject_failure("destroy", "connection refused", 10);
        assert!(!mgr.destroy(&id).await);
        assert_eq!(mgr.status(&id), Some(SandboxStatus::Destroyed));
        assert!(matches!(
            mgr.exec(&id, "ls").await,
            Err(SandboxError::UnknownSandbox(_))
        ));

        // 销毁后同一任务可以重新申请新沙箱
        let again = mgr.provision("t1").await.unwrap();
        assert_ne!(again, id);
    }

    #[tokio::test]
    async fn test_shutdown_destroys_all() {
        let (rt, mgr) = manager();
        mgr.provision("a").await.unwrap();
        mgr.provision("b").await.unwrap();
        mgr.shutdown().await;
        assert_eq!(mgr.live_count(), 0);
        assert_eq!(rt.live_count(), 0);
    }
}
