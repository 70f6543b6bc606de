//! research 执行器
//!
//! 信息来源依次尝试：外部工具服务器提供的检索能力（默认名 search）→ params.urls 中白名单域名的网页 → 模型自身知识。
//! intensity 控制深度：low=1、medium=3、high=5，数字取 1..=10。
//!
//! 网页抓取：域名白名单、超时、结果大小限制；HTML 用 html2text 提取可读文本，超过 max_result_chars 截断。

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use html2text::from_read;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE};
use reqwest::Client;
use serde_json::{json, Value};

use crate::config::ToolsSection;
use crate::core::AgentError;
use crate::llm::ask;
use crate::react::prompts;
use crate::tools::{ExecutorKind, StepExecutor, StepInput, StepOutput, TaskContext};

const DEFAULT_DEPTH: usize = 3;

/// intensity → 结果数量
pub fn depth_from(intensity: Option<&Value>) -> usize {
    match intensity {
        Some(Value::String(s)) => match s.trim().to_lowercase().as_str() {
            "low" | "shallow" | "quick" => 1,
            "medium" | "normal" => 3,
            "high" | "deep" | "thorough" => 5,
            other => other
                .parse::<usize>()
                .map(|n| n.clamp(1, 10))
                .unwrap_or(DEFAULT_DEPTH),
        },
        Some(Value::Number(n)) => n
            .as_u64()
            .map(|n| (n as usize).clamp(1, 10))
            .unwrap_or(DEFAULT_DEPTH),
        _ => DEFAULT_DEPTH,
    }
}

/// 简易去除 HTML 标签（html2text 失败时的回退）
fn strip_html_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn looks_like_html(s: &str) -> bool {
    let s = s.trim_start();
    s.starts_with("<!")
        || s.to_lowercase().starts_with("<html")
        || (s.contains('<') && (s.contains("</") || s.contains("<head") || s.contains("<title")))
}

/// 从 URL 中提取 host（小写，不含端口）
fn extract_domain(url: &str) -> Option<String> {
    let url = url.trim();
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))?;
    let host = rest.split('/').next()?.split(':').next()?;
    if host.is_empty() {
        None
    } else {
        Some(host.to_lowercase())
    }
}

/// 白名单网页抓取
pub struct WebFetcher {
    client: Client,
    allowed_domains: HashSet<String>,
    max_result_chars: usize,
}

impl WebFetcher {
    pub fn new(allowed_domains: Vec<String>, timeout_secs: u64, max_result_chars: usize) -> Self {
        const USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en;q=0.9,zh-CN;q=0.8"));
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .build()
            .unwrap_or_default();
        Self {
            client,
            allowed_domains: allowed_domains.into_iter().map(|d| d.to_lowercase()).collect(),
            max_result_chars,
        }
    }

    pub fn is_allowed(&self, url: &str) -> Result<(), String> {
        let domain = extract_domain(url).ok_or_else(|| format!("invalid URL: {}", url))?;
        if self.allowed_domains.contains(&domain) {
            Ok(())
        } else {
            Err(format!("domain not in allowlist: {}", domain))
        }
    }

    fn html_to_text(&self, html: &str) -> String {
        match from_read(html.as_bytes(), 120) {
            Ok(text) if !text.trim().is_empty() => text,
            _ => strip_html_tags(html),
        }
    }

    pub async fn fetch(&self, url: &str) -> Result<String, String> {
        self.is_allowed(url)?;
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| format!("request failed: {}", e))?;
        if !resp.status().is_success() {
            return Err(format!("HTTP {}", resp.status()));
        }
        let body = resp.text().await.map_err(|e| format!("read body: {}", e))?;
        let body = body.trim_start_matches('\u{FEFF}');
        let body = if looks_like_html(body) {
            self.html_to_text(body)
        } else {
            body.to_string()
        };
        if body.chars().count() > self.max_result_chars {
            Ok(body.chars().take(self.max_result_chars).collect::<String>() + "\n...[truncated]")
        } else {
            Ok(body)
        }
    }
}

pub struct ResearchExecutor {
    capability: String,
    fetcher: WebFetcher,
}

impl ResearchExecutor {
    pub fn new(capability: impl Into<String>, fetcher: WebFetcher) -> Self {
        Self {
            capability: capability.into(),
            fetcher,
        }
    }

    pub fn from_config(cfg: &ToolsSection) -> Self {
        Self::new(
            cfg.research_capability.clone(),
            WebFetcher::new(
                cfg.search.allowed_domains.clone(),
                cfg.search.timeout_secs,
                cfg.search.max_result_chars,
            ),
        )
    }

    async fn via_tool(&self, ctx: &TaskContext, query: &str, depth: usize) -> Option<Value> {
        let server = ctx.protocol().find_capability(&self.capability).await?;
        match ctx
            .protocol()
            .invoke(&server, &self.capability, json!({"query": query, "limit": depth}))
            .await
        {
            Ok(result) => Some(json!({
                "source": "tool",
                "server": server,
                "query": query,
                "results": result,
            })),
            Err(e) => {
                tracing::warn!(server = %server, error = %e, "research capability failed, falling back");
                None
            }
        }
    }

    async fn via_web(&self, urls: &[Value], query: &str, depth: usize) -> Option<Value> {
        let mut pages = Vec::new();
        let mut errors = Vec::new();
        for url in urls.iter().filter_map(Value::as_str).take(depth) {
            match self.fetcher.fetch(url).await {
                Ok(content) => pages.push(json!({"url": url, "content": content})),
                Err(e) => {
                    tracing::debug!(url, error = %e, "fetch failed");
                    errors.push(json!({"url": url, "error": e}));
                }
            }
        }
        if pages.is_empty() {
            tracing::warn!(failed = errors.len(), "no page could be fetched, falling back to model");
            return None;
        }
        Some(json!({
            "source": "web",
            "query": query,
            "pages": pages,
            "errors": errors,
        }))
    }
}

#[async_trait]
impl StepExecutor for ResearchExecutor {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Research
    }

    async fn execute(&self, input: &StepInput<'_>, ctx: &TaskContext) -> Result<StepOutput, AgentError> {
        let depth = depth_from(input.step.intensity.as_ref());
        let query = input
            .step
            .param_str("query")
            .map(str::to_string)
            .or_else(|| input.instruction.clone())
            .unwrap_or_else(|| input.step.intent.clone());

        if let Some(out) = self.via_tool(ctx, &query, depth).await {
            return Ok(StepOutput::new(out));
        }
        if let Some(Value::Array(urls)) = input.step.params.get("urls") {
            if let Some(out) = self.via_web(urls, &query, depth).await {
                return Ok(StepOutput::new(out));
            }
        }

        let prompt = format!(
            "{}\n\nResearch question: {}\nGive about {} key findings.",
            input.describe(),
            query,
            depth
        );
        let reply = ask(ctx.llm(), &prompts::research_system(), &prompt, &[]).await?;
        Ok(StepOutput::new(json!({
            "source": "model",
            "query": query,
            "answer": reply.to_text(),
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_depth_from_intensity() {
        assert_eq!(depth_from(Some(&json!("low"))), 1);
        assert_eq!(depth_from(Some(&json!("HIGH"))), 5);
        assert_eq!(depth_from(Some(&json!(42))), 10);
        assert_eq!(depth_from(Some(&json!("7"))), 7);
        assert_eq!(depth_from(None), 3);
    }

    #[test]
    fn test_allowlist() {
        let f = WebFetcher::new(vec!["docs.rs".into()], 5, 100);
        assert!(f.is_allowed("https://docs.rs/tokio").is_ok());
        assert!(f.is_allowed("https://evil.example.com/").is_err());
        assert!(f.is_allowed("ftp://docs.rs").is_err());
    }

    #[test]
    fn test_strip_tags() {
        assert_eq!(strip_html_tags("<p>hello <b>world</b></p>"), "hello world");
        assert!(looks_like_html("<!DOCTYPE html><html></html>"));
        assert!(!looks_like_html("plain text"));
    }
}
