//! Tutor 控制台前端
//!
//! 每行输入作为一条消息发给同一会话，事件以 SSE 帧打印到 stdout；日志写 stderr。
//! 命令：`/new` 新建会话，`/level <beginner|elementary|intermediate>` 切换难度，`/quit` 退出。
//!
//! 用法: tutor [config.toml]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use futures_util::StreamExt;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use tutor::config::load_config;
use tutor::core::{
    run_with_graceful_shutdown, CheckpointStoreCleanup, Difficulty, ShutdownCoordinator, ShutdownManager,
    ShutdownReason, TurnDrainCleanup,
};
use tutor::{encode, TurnRequest, TutorError, TutorOrchestrator};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tutor::observability::init_stderr();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path).context("Failed to load config")?;

    let shutdown = Arc::new(ShutdownManager::new());
    let orchestrator = TutorOrchestrator::from_config(&cfg)
        .await
        .context("Failed to create orchestrator")?
        .with_shutdown_token(shutdown.token());

    let mut coordinator = ShutdownCoordinator::new(Arc::clone(&shutdown));
    coordinator.register(TurnDrainCleanup::new(orchestrator.gate().clone()));
    coordinator.register(CheckpointStoreCleanup::new(orchestrator.store()));

    let console_shutdown = Arc::clone(&shutdown);
    run_with_graceful_shutdown(
        Arc::clone(&shutdown),
        async move {
            if let Err(e) = console_loop(&orchestrator, cfg.agent.default_difficulty).await {
                tracing::error!("console loop failed: {:#}", e);
            }
            console_shutdown.shutdown(ShutdownReason::UserInitiated);
        },
        move || async move { coordinator.run_cleanup().await },
    )
    .await;

    Ok(())
}

async fn console_loop(orchestrator: &TutorOrchestrator, default_difficulty: Difficulty) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let mut session_id: Option<String> = None;
    let mut difficulty = default_difficulty;

    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        let line = line.trim();
        match line {
            "" => continue,
            "/quit" => break,
            "/new" => {
                session_id = None;
                eprintln!("새 대화를 시작합니다.");
                continue;
            }
            _ => {}
        }
        if let Some(level) = line.strip_prefix("/level ") {
            match level.parse::<Difficulty>() {
                Ok(d) => {
                    difficulty = d;
                    eprintln!("난이도: {}", d.as_str());
                }
                Err(e) => eprintln!("{e}"),
            }
            continue;
        }

        let mut request = TurnRequest::new(line).with_difficulty(difficulty);
        if let Some(id) = &session_id {
            request = request.with_session(id.clone());
        }
        let mut stream = match orchestrator.handle_turn(request) {
            Ok(stream) => stream,
            Err(e @ (TutorError::Validation(_) | TutorError::SessionBusy(_))) => {
                eprintln!("{}", e.user_message());
                continue;
            }
            Err(e) => return Err(e).context("handle_turn failed"),
        };
        session_id = Some(stream.session_id().to_string());

        while let Some(event) = stream.next().await {
            stdout.write_all(encode(&event).to_sse().as_bytes()).await?;
            stdout.flush().await?;
        }
    }
    Ok(())
}
