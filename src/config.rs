//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `CONDUCTOR__*` 覆盖（双下划线表示嵌套，如 `CONDUCTOR__SANDBOX__RUNTIME=memory`）。

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
    #[serde(default)]
    pub sandbox: SandboxSection,
    #[serde(default)]
    pub protocol: ProtocolSection,
    #[serde(default)]
    pub tools: ToolsSection,
}

/// [app] 段：应用名、推理轨迹落盘目录
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
    /// ReasoningEntry 持久化目录；未设置时不落盘
    pub reasoning_dir: Option<PathBuf>,
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 后端：openai / mock；无 API Key 时回退到 mock
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
        }
    }
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

/// [orchestrator] 段：计划步数上限、重规划节奏、各阶段超时、推理落盘频率
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorSection {
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    /// 至少完成多少步之后才允许重规划
    #[serde(default = "default_replan_min_completed")]
    pub replan_min_completed: usize,
    /// 重规划节奏：仅在 step_index % replan_every == 0 时检查
    #[serde(default = "default_replan_every")]
    pub replan_every: usize,
    #[serde(default = "default_plan_timeout_secs")]
    pub plan_timeout_secs: u64,
    /// 反思与重规划（progress check）超时
    #[serde(default = "default_progress_timeout_secs")]
    pub progress_timeout_secs: u64,
    #[serde(default = "default_finalize_timeout_secs")]
    pub finalize_timeout_secs: u64,
    /// 每执行 N 步持久化一次推理轨迹（0 表示仅在结束时）
    #[serde(default = "default_persist_every")]
    pub persist_every: usize,
    /// 执行前是否调用 LLM 结合前序结果细化步骤指令
    #[serde(default = "default_true")]
    pub refine_steps: bool,
    /// 仅对这些执行器做反思；为空表示全部
    #[serde(default)]
    pub reflect_executors: Vec<String>,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            replan_min_completed: default_replan_min_completed(),
            replan_every: default_replan_every(),
            plan_timeout_secs: default_plan_timeout_secs(),
            progress_timeout_secs: default_progress_timeout_secs(),
            finalize_timeout_secs: default_finalize_timeout_secs(),
            persist_every: default_persist_every(),
            refine_steps: true,
            reflect_executors: Vec::new(),
        }
    }
}

fn default_max_steps() -> usize {
    20
}

fn default_replan_min_completed() -> usize {
    2
}

fn default_replan_every() -> usize {
    3
}

fn default_plan_timeout_secs() -> u64 {
    60
}

fn default_progress_timeout_secs() -> u64 {
    30
}

fn default_finalize_timeout_secs() -> u64 {
    60
}

fn default_persist_every() -> usize {
    3
}

fn default_true() -> bool {
    true
}

/// [sandbox] 段：容器运行时、镜像、工作目录、重试策略
#[derive(Debug, Clone, Deserialize)]
pub struct SandboxSection {
    /// docker / memory
    #[serde(default = "default_runtime")]
    pub runtime: String,
    #[serde(default = "default_image")]
    pub image: String,
    /// 沙箱内工作目录（绝对路径）
    #[serde(default = "default_workdir")]
    pub workdir: String,
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// 单条 docker 命令超时
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            runtime: default_runtime(),
            image: default_image(),
            workdir: default_workdir(),
            name_prefix: default_name_prefix(),
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            command_timeout_secs: default_command_timeout_secs(),
        }
    }
}

fn default_runtime() -> String {
    "docker".to_string()
}

fn default_image() -> String {
    "python:3.12-slim".to_string()
}

fn default_workdir() -> String {
    "/workspace".to_string()
}

fn default_name_prefix() -> String {
    "conductor".to_string()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    5_000
}

fn default_command_timeout_secs() -> u64 {
    120
}

/// [protocol] 段：外部工具服务器列表与生命周期超时
#[derive(Debug, Clone, Deserialize)]
pub struct ProtocolSection {
    #[serde(default = "default_discovery_timeout_secs")]
    pub discovery_timeout_secs: u64,
    /// stop 时关闭 stdin 后等待进程退出的宽限期
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,
    /// 单次 tools/call 的超时；0 表示不单独限制，由步骤超时兜底
    #[serde(default)]
    pub call_timeout_secs: u64,
    #[serde(default)]
    pub servers: Vec<ServerEntry>,
}

impl Default for ProtocolSection {
    fn default() -> Self {
        Self {
            discovery_timeout_secs: default_discovery_timeout_secs(),
            stop_grace_secs: default_stop_grace_secs(),
            call_timeout_secs: 0,
            servers: Vec::new(),
        }
    }
}

fn default_discovery_timeout_secs() -> u64 {
    10
}

fn default_stop_grace_secs() -> u64 {
    3
}

/// [[protocol.servers]] 条目：名称 + 程序 + 参数 + 环境变量
#[derive(Debug, Clone, Deserialize)]
pub struct ServerEntry {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// [tools] 段：单步执行超时、research 抓取设置
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    /// 单个步骤执行超时（秒）
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
    /// research 执行器优先使用的外部能力名
    #[serde(default = "default_research_capability")]
    pub research_capability: String,
    #[serde(default)]
    pub search: SearchSection,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: default_tool_timeout_secs(),
            research_capability: default_research_capability(),
            search: SearchSection::default(),
        }
    }
}

fn default_tool_timeout_secs() -> u64 {
    300
}

fn default_research_capability() -> String {
    "search".to_string()
}

/// [tools.search] 段：抓取 URL 的超时、最大字符数、允许的域名白名单
#[derive(Debug, Clone, Deserialize)]
pub struct SearchSection {
    #[serde(default = "default_search_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_result_chars")]
    pub max_result_chars: usize,
    #[serde(default = "default_allowed_domains")]
    pub allowed_domains: Vec<String>,
}

impl Default for SearchSection {
    fn default() -> Self {
        Self {
            timeout_secs: default_search_timeout_secs(),
            max_result_chars: default_max_result_chars(),
            allowed_domains: default_allowed_domains(),
        }
    }
}

fn default_search_timeout_secs() -> u64 {
    15
}

fn default_max_result_chars() -> usize {
    8000
}

fn default_allowed_domains() -> Vec<String> {
    vec![
        "en.wikipedia.org".into(),
        "github.com".into(),
        "raw.githubusercontent.com".into(),
        "stackoverflow.com".into(),
        "docs.rs".into(),
        "crates.io".into(),
        "doc.rust-lang.org".into(),
        "docs.python.org".into(),
        "pypi.org".into(),
        "developer.mozilla.org".into(),
        "arxiv.org".into(),
        "news.ycombinator.com".into(),
    ]
}

impl SandboxSection {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// 从 config 目录加载配置，环境变量 CONDUCTOR__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 CONDUCTOR__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("CONDUCTOR")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_cadence() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.orchestrator.replan_min_completed, 2);
        assert_eq!(cfg.orchestrator.replan_every, 3);
        assert_eq!(cfg.orchestrator.progress_timeout_secs, 30);
        assert_eq!(cfg.orchestrator.finalize_timeout_secs, 60);
        assert_eq!(cfg.sandbox.max_attempts, 3);
        assert!(cfg.protocol.servers.is_empty());
    }

    #[test]
    fn test_load_from_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conductor.toml");
        std::fs::write(
            &path,
            r#"
[sandbox]
runtime = "memory"
max_attempts = 5

[protocol]
call_timeout_secs = 45

[[protocol.servers]]
name = "fs"
command = "fs-server"
args = ["--stdio"]
"#,
        )
        .unwrap();

        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.sandbox.runtime, "memory");
        assert_eq!(cfg.sandbox.max_attempts, 5);
        assert_eq!(cfg.sandbox.workdir, "/workspace");
        assert_eq!(cfg.protocol.call_timeout_secs, 45);
        assert_eq!(cfg.protocol.servers.len(), 1);
        assert_eq!(cfg.protocol.servers[0].args, vec!["--stdio".to_string()]);
    }
}
