//! Docker CLI 运行时
//!
//! 通过 tokio::process 调用 docker：run -d / exec sh -c / cp / rm -f。
//! 每条命令带超时；docker 自身的失败（daemon 错误、超时）映射为 SandboxError::Runtime，
//! 由上层按错误文本分类重试；容器内命令的非零退出码原样返回。

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::sandbox::{ContainerRuntime, ExecOutput, SandboxError};

/// docker CLI 驱动的容器运行时
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    binary: String,
    image: String,
    workdir: String,
    timeout: Duration,
}

impl DockerRuntime {
    pub fn new(image: impl Into<String>, workdir: impl Into<String>, timeout_secs: u64) -> Self {
        Self {
            binary: "docker".to_string(),
            image: image.into(),
            workdir: workdir.into(),
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    /// 使用兼容 CLI（如 podman）
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    async fn run(&self, op: &'static str, args: &[&str]) -> Result<ExecOutput, SandboxError> {
        tracing::debug!(op, args = ?args, "docker");
        let child = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SandboxError::runtime(op, format!("spawn {}: {}", self.binary, e)))?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| SandboxError::runtime(op, format!("timed out after {:?}", self.timeout)))?
            .map_err(|e| SandboxError::runtime(op, format!("wait failed: {}", e)))?;

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    /// 对 docker 管理命令：非零退出即失败
    async fn run_checked(&self, op: &'static str, args: &[&str]) -> Result<ExecOutput, SandboxError> {
        let out = self.run(op, args).await?;
        if out.success() {
            Ok(out)
        } else {
            Err(SandboxError::runtime(op, out.stderr.trim().to_string()))
        }
    }
}

/// docker exec 时区分「docker 自身失败」与「容器内命令非零退出」
fn is_daemon_failure(stderr: &str) -> bool {
    let s = stderr.trim_start();
    s.starts_with("Error response from daemon") || s.starts_with("Error: No such container")
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn name(&self) -> &str {
        "docker"
    }

    async fn create(&self, name: &str) -> Result<(), SandboxError> {
        self.run_checked(
            "provision",
            &[
                "run",
                "-d",
                "--name",
                name,
                "--network",
                "none",
                "-w",
                &self.workdir,
                &self.image,
                "sleep",
                "infinity",
            ],
        )
        .await?;
        Ok(())
    }

    async fn exec(&self, name: &str, command: &str) -> Result<ExecOutput, SandboxError> {
        let out = self
            .run("exec", &["exec", "-w", &self.workdir, name, "sh", "-c", command])
            .await?;
        if !out.success() && is_daemon_failure(&out.stderr) {
            return Err(SandboxError::runtime("exec", out.stderr.trim().to_string()));
        }
        Ok(out)
    }

    async fn copy_in(&self, name: &str, host: &Path, path: &str) -> Result<(), SandboxError> {
        let src = host.to_string_lossy();
        let dst = format!("{}:{}", name, path);
        self.run_checked("copy_in", &["cp", &src, &dst]).await?;
        Ok(())
    }

    async fn copy_out(&self, name: &str, path: &str, host: &Path) -> Result<(), SandboxError> {
        let src = format!("{}:{}", name, path);
        let dst = host.to_string_lossy();
        self.run_checked("copy_out", &["cp", &src, &dst]).await?;
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<(), SandboxError> {
        self.run_checked("destroy", &["rm", "-f", name]).await?;
        Ok(())
    }
}
