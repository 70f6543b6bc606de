//! Conductor - 自主任务编排器
//!
//! 用法：
//! ```bash
//! conductor [--config path/to/conductor.toml] [--events] <task...>
//! ```
//! 初始化日志、加载配置、组装编排器并启动外部工具服务器，运行命令行给出的任务后打印最终回答。

use std::path::PathBuf;

use anyhow::{bail, Context};
use conductor::config::load_config;
use conductor::core::{create_orchestrator, TaskRequest};
use conductor::observability;
use conductor::react::TaskEvent;

struct Cli {
    config: Option<PathBuf>,
    events: bool,
    task: String,
}

fn parse_args() -> anyhow::Result<Cli> {
    let mut config = None;
    let mut events = false;
    let mut words = Vec::new();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let path = args.next().context("--config needs a path")?;
                config = Some(PathBuf::from(path));
            }
            "--events" => events = true,
            _ => words.push(arg),
        }
    }
    if words.is_empty() {
        bail!("usage: conductor [--config FILE] [--events] <task...>");
    }
    Ok(Cli {
        config,
        events,
        task: words.join(" "),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();
    let cli = parse_args()?;

    let cfg = load_config(cli.config.clone()).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        Default::default()
    });
    let orchestrator = create_orchestrator(&cfg)
        .await
        .context("Failed to create orchestrator")?;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<TaskEvent>();
    let printer = cli.events.then(|| {
        tokio::spawn(async move {
            while let Some(ev) = rx.recv().await {
                if let Ok(line) = serde_json::to_string(&ev) {
                    eprintln!("{}", line);
                }
            }
        })
    });

    let user = std::env::var("USER").unwrap_or_else(|_| "local".to_string());
    let req = TaskRequest::new(cli.task).user(user, uuid::Uuid::new_v4().to_string());
    let result = orchestrator
        .run_detailed(req, cli.events.then_some(&tx))
        .await;

    drop(tx);
    if let Some(p) = printer {
        let _ = p.await;
    }
    orchestrator.shutdown().await;

    let report = result.context("Task failed")?;
    println!("{}", report.answer);
    for a in &report.artifacts {
        eprintln!("artifact: {}", a.path);
    }
    Ok(())
}
