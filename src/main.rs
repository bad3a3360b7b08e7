//! conductor 命令行入口
//!
//! 加载配置、构建编排器，执行一次查询并把 JSON 响应（或事件流）打印到 stdout。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use conductor::core::{create_orchestrator_builder, QueryRequest};

/// Plan and execute a tool-orchestrated query.
#[derive(Parser, Debug)]
#[command(name = "conductor")]
#[command(version)]
#[command(about = "Plan-execute tool orchestration core.", long_about = None)]
struct Cli {
    /// Extra TOML config file layered over config/default.toml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Active document ID (repeatable)
    #[arg(short, long = "doc")]
    docs: Vec<String>,

    /// Session ID for this query
    #[arg(short, long, default_value = "cli")]
    session: String,

    /// Print lifecycle events as JSON lines while the query runs
    #[arg(long)]
    stream: bool,

    /// The natural-language query
    #[arg(required = true)]
    query: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    conductor::observability::init();
    let cli = Cli::parse();

    let orchestrator = create_orchestrator_builder(cli.config)
        .build()
        .context("Failed to build orchestrator")?;
    let request = QueryRequest::new(cli.query.join(" "), cli.session).with_documents(cli.docs);

    if cli.stream {
        let orchestrator = Arc::new(orchestrator);
        let mut events = orchestrator.execute_query_stream(request);
        while let Some(event) = events.recv().await {
            let line = serde_json::to_string(&event).context("Failed to encode event")?;
            println!("{line}");
        }
    } else {
        let response = orchestrator.execute_query(request).await;
        let body = serde_json::to_string_pretty(&response).context("Failed to encode response")?;
        println!("{body}");
    }
    Ok(())
}
