mod chart;
mod chat_log;
mod command;
mod config;
mod context;
mod conversation;
mod error;
mod error_log;
mod llm;
mod prompt;
mod relaxed_json;
mod render;
mod session;
mod stream;
mod tui;

use std::io::Write;
use std::path::Path;

use anyhow::{Context, anyhow};
use clap::Parser;
use tracing_appender::non_blocking::WorkerGuard;

use crate::chat_log::ChatLogStore;
use crate::config::{AiSettings, CliParams};
use crate::context::DataContext;
use crate::conversation::TurnKind;
use crate::error_log::ErrorLogStore;
use crate::session::ChatSession;
use crate::tui::ChatApp;

const LOG_FILE_NAME: &str = "ask_ai.log";
const EXPORT_FILE_NAME: &str = "chat_export.html";

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let param = CliParams::parse();
    let _log_guard = init_tracing(&param.log_dir)?;

    let chat_log = ChatLogStore::new(param.log_dir.join(ChatLogStore::default_path()));
    if let Some(count) = param.print_log {
        return print_chat_log(chat_log, count);
    }

    let mut settings = AiSettings::load_or_init(&param.settings)?;
    param.apply_overrides(&mut settings);
    tracing::info!(backend = %settings.backend_label(), stream = settings.streaming_enabled, "settings loaded");

    let mut contexts = param
        .contexts
        .iter()
        .map(DataContext::load)
        .collect::<anyhow::Result<Vec<_>>>()?;
    if contexts.is_empty() {
        contexts.push(DataContext::default());
    }

    let error_log = ErrorLogStore::new(param.log_dir.join(ErrorLogStore::default_path()));
    let session = ChatSession::new(settings, contexts[0].clone())?.with_stores(chat_log, error_log);

    if let Some(question) = param.ask.as_deref() {
        return ask_once(session, question).await;
    }

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let mut app = ChatApp::new(session, contexts, tx, param.log_dir.join(EXPORT_FILE_NAME));
    app.run(&mut rx).await.map_err(|err| anyhow!("{err:?}"))?;
    Ok(())
}

fn init_tracing(log_dir: &Path) -> anyhow::Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("无法创建日志目录 {}", log_dir.display()))?;
    let appender = tracing_appender::rolling::never(log_dir, LOG_FILE_NAME);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .try_init()
        .map_err(|err| anyhow!("初始化日志失败: {err}"))?;
    Ok(guard)
}

fn print_chat_log(store: ChatLogStore, count: usize) -> anyhow::Result<()> {
    let entries = store.with_max_entries(count).load()?;
    if entries.is_empty() {
        println!("暂无对话记录");
        return Ok(());
    }
    for entry in entries {
        println!("{}", entry.summary());
    }
    Ok(())
}

async fn ask_once(mut session: ChatSession, question: &str) -> anyhow::Result<()> {
    session.check_ready()?;
    let mut stdout = std::io::stdout();
    let turn_id = session
        .send_with(question, &mut |delta: &str| {
            let _ = stdout.write_all(delta.as_bytes());
            let _ = stdout.flush();
        })
        .await
        .map_err(|rejection| anyhow!("{rejection}"))?;
    println!();

    let conversation = session.conversation();
    if let Some(chart) = conversation.get(turn_id).and_then(|turn| turn.chart()) {
        println!("\n{}", chart.brief());
    }
    if let Some(diagnostic) = conversation
        .turns()
        .iter()
        .rev()
        .find(|turn| turn.kind() == TurnKind::Diagnostic)
    {
        eprintln!("{}", diagnostic.content());
        return Err(anyhow!("请求失败"));
    }
    Ok(())
}
