//! 容器运行时抽象
//!
//! SandboxManager 只依赖这组最小公共操作：创建 / 执行命令 / 拷入 / 拷出 / 删除。
//! 大文件不走命令参数，统一通过宿主机临时文件 + copy 传输。

use std::path::Path;

use async_trait::async_trait;

use crate::sandbox::SandboxError;

/// 一条命令的执行结果；非零退出码不是运行时错误
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// 运行时名称（日志用）
    fn name(&self) -> &str;

    /// 以给定名字创建并启动一个隔离环境；名字冲突时返回包含 "Conflict" 的错误
    async fn create(&self, name: &str) -> Result<(), SandboxError>;

    /// 在环境内通过 sh -c 执行命令
    async fn exec(&self, name: &str, command: &str) -> Result<ExecOutput, SandboxError>;

    /// 宿主机文件 host 拷贝到环境内绝对路径 path
    async fn copy_in(&self, name: &str, host: &Path, path: &str) -> Result<(), SandboxError>;

    /// 环境内绝对路径 path 拷贝到宿主机文件 host
    async fn copy_out(&self, name: &str, path: &str, host: &Path) -> Result<(), SandboxError>;

    /// 强制删除环境
    async fn remove(&self, name: &str) -> Result<(), SandboxError>;
}

/// 单引号转义，供拼接 sh -c 命令
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/workspace/a b.txt"), "'/workspace/a b.txt'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
