//! 进程内运行时：测试与离线运行用
//!
//! 每个「容器」是一份文件表 + 目录集合；exec 只理解一个很小的 shell 子集
//! （test -e/-d、mkdir -p、ls -1a、rm -f/-rf、cat），其余命令记录后返回 0。
//! 支持按操作注入失败并统计各操作的调用次数，错误文本与 docker CLI 保持一致以走同样的分类逻辑。

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::sandbox::{ContainerRuntime, ExecOutput, SandboxError};

#[derive(Debug, Default)]
struct Container {
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
}

impl Container {
    fn new(workdir: &str) -> Self {
        let mut c = Container::default();
        c.dirs.insert("/".to_string());
        c.mkdir_p(workdir);
        c
    }

    fn mkdir_p(&mut self, path: &str) {
        let mut cur = String::new();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            cur.push('/');
            cur.push_str(part);
            self.dirs.insert(cur.clone());
        }
    }

    fn is_dir(&self, path: &str) -> bool {
        self.dirs.contains(path)
    }

    fn exists(&self, path: &str) -> bool {
        self.files.contains_key(path) || self.is_dir(path)
    }

    fn children(&self, dir: &str) -> Vec<String> {
        let prefix = if dir == "/" {
            "/".to_string()
        } else {
            format!("{}/", dir)
        };
        let mut names: BTreeSet<String> = BTreeSet::new();
        for p in self.files.keys().chain(self.dirs.iter()) {
            if let Some(rest) = p.strip_prefix(&prefix) {
                if !rest.is_empty() && !rest.contains('/') {
                    names.insert(rest.to_string());
                }
            }
        }
        names.into_iter().collect()
    }

    fn remove_tree(&mut self, path: &str) {
        let prefix = format!("{}/", path);
        self.files.retain(|k, _| k != path && !k.starts_with(&prefix));
        self.dirs.retain(|k| k != path && !k.starts_with(&prefix));
    }
}

fn parent_of(path: &str) -> String {
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(i) => path[..i].to_string(),
    }
}

/// 解析单引号 / 双引号 / 空白分隔的参数；足够覆盖 SandboxManager 生成的命令
fn tokenize(command: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut cur = String::new();
    let mut in_token = false;
    let mut chars = command.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_token = true;
                for q in chars.by_ref() {
                    if q == '\'' {
                        break;
                    }
                    cur.push(q);
                }
            }
            '"' => {
                in_token = true;
                for q in chars.by_ref() {
                    if q == '"' {
                        break;
                    }
                    cur.push(q);
                }
            }
            '\\' => {
                in_token = true;
                if let Some(n) = chars.next() {
                    cur.push(n);
                }
            }
            c if c.is_whitespace() => {
                if in_token {
                    out.push(std::mem::take(&mut cur));
                    in_token = false;
                }
            }
            c => {
                in_token = true;
                cur.push(c);
            }
        }
    }
    if in_token {
        out.push(cur);
    }
    out
}

#[derive(Debug)]
struct Injected {
    message: String,
    remaining: u32,
}

#[derive(Debug, Default)]
struct State {
    containers: HashMap<String, Container>,
    failures: HashMap<String, Injected>,
    attempts: HashMap<String, u32>,
    created: Vec<String>,
    removed: Vec<String>,
    commands: Vec<(String, String)>,
}

/// 内存中的容器运行时
#[derive(Debug)]
pub struct InMemoryRuntime {
    workdir: String,
    state: Mutex<State>,
}

impl Default for InMemoryRuntime {
    fn default() -> Self {
        Self::new("/workspace")
    }
}

impl InMemoryRuntime {
    pub fn new(workdir: impl Into<String>) -> Self {
        Self {
            workdir: workdir.into(),
            state: Mutex::new(State::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// 让操作 op（provision / exec / copy_in / copy_out / destroy）接下来 times 次以 message 失败
    pub fn inject_failure(&self, op: &str, message: impl Into<String>, times: u32) {
        self.lock().failures.insert(
            op.to_string(),
            Injected {
                message: message.into(),
                remaining: times,
            },
        );
    }

    /// 操作 op 被调用的次数（含失败）
    pub fn attempts(&self, op: &str) -> u32 {
        self.lock().attempts.get(op).copied().unwrap_or(0)
    }

    pub fn created(&self) -> Vec<String> {
        self.lock().created.clone()
    }

    pub fn removed(&self) -> Vec<String> {
        self.lock().removed.clone()
    }

    /// 当前仍存活的容器数
    pub fn live_count(&self) -> usize {
        self.lock().containers.len()
    }

    /// 读取容器内文件内容（UTF-8）
    pub fn file(&self, name: &str, path: &str) -> Option<String> {
        let st = self.lock();
        st.containers
            .get(name)?
            .files
            .get(path)
            .map(|b| String::from_utf8_lossy(b).to_string())
    }

    /// 已删除容器也无法查询，返回 false
    pub fn exists(&self, name: &str, path: &str) -> bool {
        self.lock()
            .containers
            .get(name)
            .map(|c| c.exists(path))
            .unwrap_or(false)
    }

    /// 直接放置一个文件（测试准备数据用）
    pub fn put_file(&self, name: &str, path: &str, content: &str) -> bool {
        let mut st = self.lock();
        match st.containers.get_mut(name) {
            Some(c) => {
                c.mkdir_p(&parent_of(path));
                c.files.insert(path.to_string(), content.as_bytes().to_vec());
                true
            }
            None => false,
        }
    }

    /// exec 过的命令：(容器名, 命令)
    pub fn commands(&self) -> Vec<(String, String)> {
        self.lock().commands.clone()
    }

    /// 计数并检查注入的失败
    fn enter(&self, op: &'static str) -> Result<(), SandboxError> {
        let mut st = self.lock();
        *st.attempts.entry(op.to_string()).or_insert(0) += 1;
        if let Some(inj) = st.failures.get_mut(op) {
            if inj.remaining > 0 {
                inj.remaining -= 1;
                return Err(SandboxError::runtime(op, inj.message.clone()));
            }
        }
        Ok(())
    }

    fn no_such_container(op: &'static str, name: &str) -> SandboxError {
        SandboxError::runtime(op, format!("Error: No such container: {}", name))
    }
}

fn run_shell(c: &mut Container, command: &str) -> ExecOutput {
    let mut out = ExecOutput::default();
    // 只处理 `cd X && cmd` 前缀之后的主命令
    let main = command.rsplit("&&").next().unwrap_or(command).trim();
    let args = tokenize(main);
    let Some(cmd) = args.first().map(String::as_str) else {
        return out;
    };
    let rest = &args[1..];
    match cmd {
        "test" | "[" => {
            let ok = match rest {
                [flag, path, ..] if flag == "-e" => c.exists(path),
                [flag, path, ..] if flag == "-d" => c.is_dir(path),
                [flag, path, ..] if flag == "-f" => c.files.contains_key(path.as_str()),
                _ => false,
            };
            out.exit_code = if ok { 0 } else { 1 };
        }
        "mkdir" => {
            for p in rest.iter().filter(|a| !a.starts_with('-')) {
                c.mkdir_p(p);
            }
        }
        "ls" => {
            let show_all = rest.iter().any(|a| a.starts_with('-') && a.contains('a'));
            let target = rest
                .iter()
                .find(|a| !a.starts_with('-'))
                .cloned()
                .unwrap_or_else(|| "/".to_string());
            if c.is_dir(&target) {
                let mut names = Vec::new();
                if show_all {
                    names.push(".".to_string());
                    names.push("..".to_string());
                }
                names.extend(c.children(&target));
                out.stdout = names.iter().map(|n| format!("{}\n", n)).collect();
            } else if c.files.contains_key(&target) {
                out.stdout = format!("{}\n", target);
            } else {
                out.exit_code = 2;
                out.stderr = format!(
                    "ls: cannot access '{}': No such file or directory\n",
                    target
                );
            }
        }
        "rm" => {
            let recursive = rest.iter().any(|a| a.starts_with('-') && a.contains('r'));
            for p in rest.iter().filter(|a| !a.starts_with('-')) {
                if c.is_dir(p) && !recursive {
                    out.exit_code = 1;
                    out.stderr = format!("rm: '{}' is a directory\n", p);
                } else {
                    c.remove_tree(p);
                }
            }
        }
        "cat" => {
            for p in rest {
                match c.files.get(p.as_str()) {
                    Some(b) => out.stdout.push_str(&String::from_utf8_lossy(b)),
                    None => {
                        out.exit_code = 1;
                        out.stderr = format!("cat: {}: No such file or directory\n", p);
                    }
                }
            }
        }
        "echo" => {
            out.stdout = format!("{}\n", rest.join(" "));
        }
        other => {
            tracing::debug!(command = %other, "in-memory runtime: command not simulated");
        }
    }
    out
}

#[async_trait]
impl ContainerRuntime for InMemoryRuntime {
    fn name(&self) -> &str {
        "memory"
    }

    async fn create(&self, name: &str) -> Result<(), SandboxError> {
        self.enter("provision")?;
        let mut st = self.lock();
        if st.containers.contains_key(name) {
            return Err(SandboxError::runtime(
                "provision",
                format!(
                    "Conflict. The container name \"/{}\" is already in use",
                    name
                ),
            ));
        }
        st.containers
            .insert(name.to_string(), Container::new(&self.workdir));
        st.created.push(name.to_string());
        Ok(())
    }

    async fn exec(&self, name: &str, command: &str) -> Result<ExecOutput, SandboxError> {
        self.enter("exec")?;
        let mut st = self.lock();
        st.commands.push((name.to_string(), command.to_string()));
        let c = st
            .containers
            .get_mut(name)
            .ok_or_else(|| Self::no_such_container("exec", name))?;
        Ok(run_shell(c, command))
    }

    async fn copy_in(&self, name: &str, host: &Path, path: &str) -> Result<(), SandboxError> {
        self.enter("copy_in")?;
        let bytes = tokio::fs::read(host).await?;
        let mut st = self.lock();
        let c = st
            .containers
            .get_mut(name)
            .ok_or_else(|| Self::no_such_container("copy_in", name))?;
        let parent = parent_of(path);
        if !c.is_dir(&parent) {
            return Err(SandboxError::runtime(
                "copy_in",
                format!("Error: no such directory: {}", parent),
            ));
        }
        c.files.insert(path.to_string(), bytes);
        Ok(())
    }

    async fn copy_out(&self, name: &str, path: &str, host: &Path) -> Result<(), SandboxError> {
        self.enter("copy_out")?;
        let bytes = {
            let st = self.lock();
            let c = st
                .containers
                .get(name)
                .ok_or_else(|| Self::no_such_container("copy_out", name))?;
            c.files.get(path).cloned().ok_or_else(|| {
                SandboxError::runtime(
                    "copy_out",
                    format!("Error: Could not find the file {} in container {}", path, name),
                )
            })?
        };
        tokio::fs::write(host, bytes).await?;
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<(), SandboxError> {
        self.enter("destroy")?;
        let mut st = self.lock();
        if st.containers.remove(name).is_none() {
            return Err(Self::no_such_container("destroy", name));
        }
        st.removed.push(name.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_quotes() {
        assert_eq!(
            tokenize("ls -1a '/workspace/my dir'"),
            vec!["ls", "-1a", "/workspace/my dir"]
        );
        assert_eq!(tokenize(r"cat 'it'\''s'"), vec!["cat", "it's"]);
    }

    #[tokio::test]
    async fn test_shell_subset() {
        let rt = InMemoryRuntime::default();
        rt.create("c1").await.unwrap();
        rt.exec("c1", "mkdir -p '/workspace/out'").await.unwrap();
        assert!(rt.put_file("c1", "/workspace/out/a.txt", "hi"));

        let ls = rt.exec("c1", "ls -1a '/workspace/out'").await.unwrap();
        assert_eq!(ls.stdout, ".\n..\na.txt\n");

        let t = rt.exec("c1", "test -e '/workspace/out/b.txt'").await.unwrap();
        assert_eq!(t.exit_code, 1);

        let cat = rt.exec("c1", "cat '/workspace/out/a.txt'").await.unwrap();
        assert_eq!(cat.stdout, "hi");

        rt.exec("c1", "rm -rf '/workspace/out'").await.unwrap();
        assert!(!rt.exists("c1", "/workspace/out/a.txt"));
    }

    #[tokio::test]
    async fn test_conflict_and_injection() {
        let rt = InMemoryRuntime::default();
        rt.create("c1").await.unwrap();
        let err = rt.create("c1").await.unwrap_err();
        assert!(err.is_name_conflict());

        rt.inject_failure("exec", "connection refused", 1);
        assert!(rt.exec("c1", "true").await.is_err());
        assert!(rt.exec("c1", "true").await.is_ok());
        assert_eq!(rt.attempts("exec"), 2);
    }

    #[tokio::test]
    async fn test_copy_out_missing_file() {
        let rt = InMemoryRuntime::default();
        rt.create("c1").await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let err = rt
            .copy_out("c1", "/workspace/none.txt", &dir.path().join("x"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Could not find the file"));
    }
}
