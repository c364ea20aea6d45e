//! 导师编排器：每条消息一个生产者任务，经有界通道向调用方推送事件
//!
//! handle_turn 校验请求并占用会话租约，随后在后台任务中：加载（或新建）会话 →
//! RECEIVED 检查点 → TurnDriver（GUARDED / THINKING ⇄ TOOL_CALL / ANSWERING）→
//! DONE 或 ERROR 检查点 → 占住通道容量 → 释放租约 → 发送唯一的终止事件。
//! 调用方丢弃 TurnStream 即视为断开，生产者在下一个挂起点停止。

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures_util::Stream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::checkpoint::{open_checkpoint_store, CheckpointStore};
use crate::config::AppConfig;
use crate::core::session_supervisor::SessionLease;
use crate::core::{ContextRef, Difficulty, Session, SessionGate, TurnPhase, TutorError};
use crate::guardrail::{create_guardrail_from_config, Guardrail};
use crate::llm::{create_guardrail_llm_from_config, create_llm_from_config, LlmClient};
use crate::memory::HistoryWindow;
use crate::react::{Checkpointer, EventPayload, Planner, TurnDriver, TurnEmitter, TurnEvent, TurnSettings};
use crate::tools::{create_default_registry, InMemoryGlossary, ToolExecutor};

/// 一条用户消息
#[derive(Debug, Clone, Default)]
pub struct TurnRequest {
    /// 为空表示新建会话
    pub session_id: Option<String>,
    pub message: String,
    pub difficulty: Option<Difficulty>,
    pub context: Option<ContextRef>,
}

impl TurnRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_difficulty(mut self, difficulty: Difficulty) -> Self {
        self.difficulty = Some(difficulty);
        self
    }

    pub fn with_context(mut self, context: ContextRef) -> Self {
        self.context = Some(context);
        self
    }
}

/// 编排器运行参数
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub turn: TurnSettings,
    pub default_difficulty: Difficulty,
    pub event_buffer: usize,
    pub save_retries: u32,
    pub retry_backoff: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            turn: TurnSettings::default(),
            default_difficulty: Difficulty::Beginner,
            event_buffer: 32,
            save_retries: 3,
            retry_backoff: Duration::from_millis(50),
        }
    }
}

impl OrchestratorSettings {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            turn: TurnSettings {
                max_rounds: cfg.agent.max_rounds,
                guardrail_timeout: cfg.llm.timeouts.guardrail(),
                generation_timeout: cfg.llm.timeouts.generation(),
                history: HistoryWindow::new(cfg.app.max_history_messages),
            },
            default_difficulty: cfg.agent.default_difficulty,
            event_buffer: cfg.agent.event_buffer,
            save_retries: cfg.checkpoint.save_retries,
            retry_backoff: Duration::from_millis(cfg.checkpoint.retry_backoff_ms),
        }
    }
}

/// 一轮的事件流；按发出顺序产出，以一个 done / error 事件结束
pub struct TurnStream {
    session_id: String,
    rx: mpsc::Receiver<TurnEvent>,
}

impl TurnStream {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub async fn recv(&mut self) -> Option<TurnEvent> {
        self.rx.recv().await
    }
}

impl Stream for TurnStream {
    type Item = TurnEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

struct Inner {
    guardrail: Arc<dyn Guardrail>,
    planner: Planner,
    executor: ToolExecutor,
    checkpointer: Checkpointer,
    settings: OrchestratorSettings,
    gate: SessionGate,
}

/// 导师编排器（可克隆，克隆共享同一组件与会话租约表）
#[derive(Clone)]
pub struct TutorOrchestrator {
    inner: Arc<Inner>,
    shutdown: Option<CancellationToken>,
}

impl TutorOrchestrator {
    pub fn new(
        guardrail: Arc<dyn Guardrail>,
        llm: Arc<dyn LlmClient>,
        executor: ToolExecutor,
        store: Arc<dyn CheckpointStore>,
        settings: OrchestratorSettings,
    ) -> Self {
        let checkpointer = Checkpointer::new(store, settings.save_retries, settings.retry_backoff);
        Self {
            inner: Arc::new(Inner {
                guardrail,
                planner: Planner::new(llm),
                executor,
                checkpointer,
                settings,
                gate: SessionGate::new(),
            }),
            shutdown: None,
        }
    }

    /// 按配置组装：检查点后端、模型客户端、护栏、默认工具集
    pub async fn from_config(cfg: &AppConfig) -> Result<Self, TutorError> {
        cfg.validate()?;
        let store = open_checkpoint_store(&cfg.checkpoint.backend)
            .await
            .map_err(|e| TutorError::Config(e.to_string()))?;
        let llm = create_llm_from_config(&cfg.llm);
        let guardrail = create_guardrail_from_config(&cfg.guardrail, create_guardrail_llm_from_config(&cfg.llm));
        let registry = create_default_registry(Arc::new(InMemoryGlossary::with_defaults()));
        let executor = ToolExecutor::from_secs(registry, cfg.tools.tool_timeout_secs);
        tracing::info!(
            backend = %cfg.checkpoint.backend,
            guardrail = guardrail.name(),
            model = llm.model_name(),
            max_rounds = cfg.agent.max_rounds,
            "tutor orchestrator ready"
        );
        Ok(Self::new(guardrail, llm, executor, store, OrchestratorSettings::from_config(cfg)))
    }

    /// 停机令牌：触发后进行中的轮次停止发起新调用，写完检查点后以 error 事件结束
    pub fn with_shutdown_token(mut self, token: CancellationToken) -> Self {
        self.shutdown = Some(token);
        self
    }

    pub fn gate(&self) -> &SessionGate {
        &self.inner.gate
    }

    pub fn store(&self) -> Arc<dyn CheckpointStore> {
        Arc::clone(self.inner.checkpointer.store())
    }

    /// 处理一条消息。空消息返回 Validation；同一会话已有进行中的轮次返回 SessionBusy。
    pub fn handle_turn(&self, request: TurnRequest) -> Result<TurnStream, TutorError> {
        let message = request.message.trim();
        if message.is_empty() {
            return Err(TutorError::Validation("message must not be empty".to_string()));
        }
        let session_id = request
            .session_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let lease = self.inner.gate.try_acquire(&session_id).ok_or_else(|| {
            tracing::info!(session_id = %session_id, "turn rejected: session busy");
            TutorError::SessionBusy(session_id.clone())
        })?;

        let (tx, rx) = mpsc::channel(self.inner.settings.event_buffer.max(1));
        let emitter = TurnEmitter::new(session_id.clone(), tx, self.shutdown.clone());
        let inner = Arc::clone(&self.inner);
        let message = message.to_string();
        tokio::spawn(async move {
            inner
                .produce(lease, emitter, message, request.difficulty, request.context)
                .await;
        });

        Ok(TurnStream { session_id, rx })
    }

    /// 最近一次持久化的会话（历史查看）
    pub async fn session(&self, session_id: &str) -> Result<Option<Session>, TutorError> {
        match self.inner.checkpointer.store().load_latest(session_id).await? {
            Some(record) => Ok(Some(record.decode()?)),
            None => Ok(None),
        }
    }

    pub async fn close(&self) {
        self.inner.checkpointer.store().close().await;
    }
}

impl Inner {
    async fn produce(
        &self,
        lease: SessionLease,
        emitter: TurnEmitter,
        message: String,
        difficulty: Option<Difficulty>,
        context: Option<ContextRef>,
    ) {
        let started = Instant::now();
        let mut session = match self.load_session(emitter.session_id(), difficulty, context).await {
            Ok(session) => session,
            Err(err) => {
                tracing::error!(session_id = %emitter.session_id(), "failed to load session: {}", err);
                emitter
                    .emit_terminal(
                        EventPayload::Error {
                            message: err.user_message(),
                        },
                        lease,
                    )
                    .await;
                return;
            }
        };

        session.begin_turn(&message);
        tracing::info!(
            session_id = %session.id,
            turn = session.turn_count,
            message = %crate::guardrail::preview(&message),
            "turn received"
        );

        let driver = TurnDriver {
            guardrail: self.guardrail.as_ref(),
            planner: &self.planner,
            executor: &self.executor,
            checkpointer: &self.checkpointer,
            emitter: &emitter,
            settings: &self.settings.turn,
        };
        let result = match self.checkpointer.persist(&mut session).await {
            Ok(_) => driver.run(&mut session, &message).await,
            Err(e) => Err(e.into()),
        };

        let summary = match result {
            Ok(summary) => {
                session.advance(TurnPhase::Done);
                match self.checkpointer.persist(&mut session).await {
                    Ok(_) => summary,
                    Err(e) => return self.fail(session, lease, &emitter, e.into()).await,
                }
            }
            Err(err) => return self.fail(session, lease, &emitter, err).await,
        };

        tracing::info!(
            session_id = %session.id,
            turn = session.turn_count,
            total_tokens = summary.total_tokens,
            partial = summary.partial,
            blocked = summary.block.is_some(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "turn completed"
        );
        emitter.emit_terminal(EventPayload::Done(summary), lease).await;
    }

    /// ERROR 收尾：挂起的工具调用标记失败，尽力写入检查点，占位后释放租约并发送 error 事件
    async fn fail(&self, mut session: Session, lease: SessionLease, emitter: &TurnEmitter, err: TutorError) {
        let reason = match &err {
            TutorError::Cancelled => "cancelled".to_string(),
            other => other.to_string(),
        };
        session.fail_pending_tool_calls(&reason);
        session.last_error = Some(err.user_message());
        session.advance(TurnPhase::Error);
        if let Err(e) = self.checkpointer.persist(&mut session).await {
            tracing::error!(session_id = %session.id, "failed to checkpoint error state: {}", e);
        }

        match &err {
            TutorError::Cancelled => {
                tracing::info!(session_id = %session.id, turn = session.turn_count, "turn cancelled");
            }
            other => {
                tracing::warn!(session_id = %session.id, turn = session.turn_count, tool = ?other.tool_name(), "turn failed: {}", other);
            }
        }
        emitter
            .emit_terminal(
                EventPayload::Error {
                    message: err.user_message(),
                },
                lease,
            )
            .await;
    }

    /// 读取最新检查点；未知会话按新会话处理。未完成的上一轮先归为 ERROR。
    async fn load_session(
        &self,
        session_id: &str,
        difficulty: Option<Difficulty>,
        context: Option<ContextRef>,
    ) -> Result<Session, TutorError> {
        let mut session = match self.checkpointer.store().load_latest(session_id).await? {
            Some(record) => {
                let mut session = record.decode()?;
                session.last_checkpoint_seq = record.sequence_no;
                if session.recover_interrupted() {
                    tracing::warn!(session_id, seq = record.sequence_no, "recovered interrupted turn");
                }
                session
            }
            None => Session::new(
                session_id,
                difficulty.unwrap_or(self.settings.default_difficulty),
                context,
            ),
        };
        if let Some(difficulty) = difficulty {
            session.difficulty = difficulty;
        }
        if context.is_some() {
            session.context = context;
        }
        Ok(session)
    }
}
