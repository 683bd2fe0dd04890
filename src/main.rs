//! Citywise CLI
//!
//! 逐行读取用户输入，每行跑一轮；进度事件以 JSON 行写到 stdout，最终回答单独打印。
//! 命令：/clear 清空对话，/quit 退出。Ctrl+C 取消正在运行的一轮。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use citywise::config::{load_config, AppConfig};
use citywise::memory::ConversationMemory;
use citywise::nodes::{ChannelSink, FanoutSink, TracingSink};
use citywise::{observability, ConversationService};
use tokio::io::{AsyncBufReadExt, BufReader};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });
    let max_turns = cfg.app.max_context_turns;

    let service = Arc::new(ConversationService::from_config(cfg));
    let conversation_id = uuid::Uuid::new_v4().to_string();
    let mut memory = ConversationMemory::new(max_turns);

    let (channel, mut events) = ChannelSink::channel();
    let sink = Arc::new(FanoutSink::new(vec![Arc::new(channel), Arc::new(TracingSink)]));
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let Ok(line) = serde_json::to_string(&event) {
                println!("{}", line);
            }
        }
    });

    {
        let service = service.clone();
        let id = conversation_id.clone();
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                if !service.cancel(&id) {
                    std::process::exit(0);
                }
            }
        });
    }

    tracing::info!(conversation_id = %conversation_id, "Citywise ready");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        let input = line.trim();
        match input {
            "" => continue,
            "/quit" | "/exit" => break,
            "/clear" => {
                memory.clear();
                eprintln!("(conversation cleared)");
                continue;
            }
            _ => {}
        }

        match service
            .submit(&conversation_id, &mut memory, input, sink.clone())
            .await
        {
            Ok(outcome) => eprintln!("\n{}\n", outcome.result.response),
            Err(e) => eprintln!("\n[error] {}\n", e),
        }
    }

    drop(sink);
    drop(service);
    let _ = printer.await;
    Ok(())
}
