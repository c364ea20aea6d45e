//! 轮次驱动：GUARDED → THINKING ⇄ TOOL_CALL → ANSWERING
//!
//! 每次状态迁移后写检查点；模型调用、工具调用与接收端关闭用 select 竞争，
//! 检查点写入本身从不参与竞争（已开始的写入总会完成）。
//! RECEIVED 之前与 DONE / ERROR 的收尾由 Orchestrator 负责。

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::time::{timeout, timeout_at, Instant};
use tokio_util::sync::CancellationToken;

use crate::checkpoint::{encode_state, CheckpointError, CheckpointStore};
use crate::core::{Session, SessionLease, TurnPhase, TutorError};
use crate::guardrail::{classify_with_timeout, Guardrail, UNAVAILABLE_BLOCK_MESSAGE};
use crate::llm::StreamChunk;
use crate::memory::{HistoryWindow, Message};
use crate::react::events::{BlockNotice, DoneSummary, EventPayload, TurnEvent};
use crate::react::planner::{Planner, PlannerOutput};
use crate::react::prompts::{build_planner_prompt, build_system_prompt, ROUND_LIMIT_NOTE, THINKING_STATUS};
use crate::tools::{tool_call_schema_json, ToolExecutor};

/// 单轮运行参数
#[derive(Debug, Clone)]
pub struct TurnSettings {
    pub max_rounds: usize,
    pub guardrail_timeout: Duration,
    pub generation_timeout: Duration,
    pub history: HistoryWindow,
}

impl Default for TurnSettings {
    fn default() -> Self {
        Self {
            max_rounds: 5,
            guardrail_timeout: Duration::from_secs(10),
            generation_timeout: Duration::from_secs(120),
            history: HistoryWindow::default(),
        }
    }
}

/// 事件发送端：有界通道 + 可选的进程级停机令牌
pub struct TurnEmitter {
    session_id: String,
    tx: mpsc::Sender<TurnEvent>,
    shutdown: Option<CancellationToken>,
}

impl TurnEmitter {
    pub fn new(session_id: impl Into<String>, tx: mpsc::Sender<TurnEvent>, shutdown: Option<CancellationToken>) -> Self {
        Self {
            session_id: session_id.into(),
            tx,
            shutdown,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// 发送一个事件；接收端已关闭或进程正在停机时返回 Cancelled
    pub async fn emit(&self, payload: EventPayload) -> Result<(), TutorError> {
        if self.is_cancelled() {
            return Err(TutorError::Cancelled);
        }
        self.tx
            .send(TurnEvent::new(self.session_id.clone(), payload))
            .await
            .map_err(|_| TutorError::Cancelled)
    }

    /// 发送终止事件并释放会话租约：停机时也照常投递，只有接收端已关闭才会失败。
    /// 先占住通道容量再释放租约，会话重新可用时终止事件已在队列中。
    pub async fn emit_terminal(&self, payload: EventPayload, lease: SessionLease) -> bool {
        match self.tx.reserve().await {
            Ok(permit) => {
                drop(lease);
                permit.send(TurnEvent::new(self.session_id.clone(), payload));
                true
            }
            Err(_) => {
                drop(lease);
                false
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.tx.is_closed() || self.shutdown.as_ref().is_some_and(|t| t.is_cancelled())
    }

    /// 接收端关闭或停机时完成
    pub async fn closed(&self) {
        match &self.shutdown {
            Some(token) => {
                tokio::select! {
                    _ = self.tx.closed() => {}
                    _ = token.cancelled() => {}
                }
            }
            None => self.tx.closed().await,
        }
    }

    /// 与取消竞争执行 fut；取消先到则返回 Cancelled（fut 被丢弃）
    pub async fn cancellable<F: std::future::Future>(&self, fut: F) -> Result<F::Output, TutorError> {
        tokio::select! {
            biased;
            _ = self.closed() => Err(TutorError::Cancelled),
            out = fut => Ok(out),
        }
    }
}

/// 检查点写入：序号 = last_checkpoint_seq + 1，失败时按线性退避重试
pub struct Checkpointer {
    store: Arc<dyn CheckpointStore>,
    save_retries: u32,
    backoff: Duration,
}

impl Checkpointer {
    pub fn new(store: Arc<dyn CheckpointStore>, save_retries: u32, backoff: Duration) -> Self {
        Self {
            store,
            save_retries,
            backoff,
        }
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    /// 保存当前会话快照，成功返回写入的序号；失败时 last_checkpoint_seq 保持原值
    pub async fn persist(&self, session: &mut Session) -> Result<u64, CheckpointError> {
        let previous = session.last_checkpoint_seq;
        let seq = previous + 1;
        session.last_checkpoint_seq = seq;
        let blob = match encode_state(session) {
            Ok(blob) => blob,
            Err(e) => {
                session.last_checkpoint_seq = previous;
                return Err(e);
            }
        };

        let mut attempt: u32 = 0;
        loop {
            match self.store.save(&session.id, seq, &blob).await {
                Ok(()) => {
                    tracing::debug!(session_id = %session.id, seq, phase = %session.phase, "checkpoint saved");
                    return Ok(seq);
                }
                Err(err @ CheckpointError::Stale { .. }) if attempt > 0 => {
                    // 上一次尝试可能已落盘但未返回成功
                    if let Ok(Some(latest)) = self.store.load_latest(&session.id).await {
                        if latest.sequence_no == seq && latest.state_blob == blob {
                            return Ok(seq);
                        }
                    }
                    session.last_checkpoint_seq = previous;
                    return Err(err);
                }
                Err(err @ CheckpointError::Stale { .. }) => {
                    tracing::error!(session_id = %session.id, seq, "stale checkpoint write rejected: {}", err);
                    session.last_checkpoint_seq = previous;
                    return Err(err);
                }
                Err(err) if attempt < self.save_retries => {
                    attempt += 1;
                    tracing::warn!(session_id = %session.id, seq, attempt, "checkpoint save failed, retrying: {}", err);
                    tokio::time::sleep(self.backoff * attempt).await;
                }
                Err(err) => {
                    tracing::error!(session_id = %session.id, seq, "checkpoint save failed after {} retries: {}", self.save_retries, err);
                    session.last_checkpoint_seq = previous;
                    return Err(err);
                }
            }
        }
    }
}

/// 一轮所需的协作方
pub struct TurnDriver<'a> {
    pub guardrail: &'a dyn Guardrail,
    pub planner: &'a Planner,
    pub executor: &'a ToolExecutor,
    pub checkpointer: &'a Checkpointer,
    pub emitter: &'a TurnEmitter,
    pub settings: &'a TurnSettings,
}

impl TurnDriver<'_> {
    /// 从 RECEIVED 驱动到 ANSWERING 结束（或护栏拦截）；返回 done 事件的摘要。
    /// 出错时 session 停留在出错时的阶段，由调用方迁移到 ERROR 并写检查点。
    pub async fn run(&self, session: &mut Session, message: &str) -> Result<DoneSummary, TutorError> {
        let decision = self
            .emitter
            .cancellable(classify_with_timeout(self.guardrail, message, self.settings.guardrail_timeout))
            .await?;
        session.advance(TurnPhase::Guarded);
        self.checkpointer.persist(session).await?;

        if !decision.is_allowed() {
            tracing::info!(
                session_id = %session.id,
                category = %decision.category(),
                reasoning = decision.reasoning(),
                "message blocked by guardrail"
            );
            let text = decision.block_message().unwrap_or(UNAVAILABLE_BLOCK_MESSAGE).to_string();
            session.messages.push(Message::assistant(text.clone()));
            return Ok(DoneSummary {
                total_tokens: 0,
                partial: false,
                block: Some(BlockNotice {
                    category: decision.category(),
                    message: text,
                }),
            });
        }

        let system = build_system_prompt(session.difficulty, session.context.as_ref());
        let planner_system = build_planner_prompt(
            &system,
            &self.executor.registry().to_schema_json(),
            &tool_call_schema_json(),
        );

        let mut rounds = 0usize;
        let mut total_tokens = 0u64;
        let mut partial = false;

        loop {
            session.advance(TurnPhase::Thinking);
            self.checkpointer.persist(session).await?;
            if rounds >= self.settings.max_rounds {
                tracing::warn!(session_id = %session.id, rounds, "tool round limit reached, answering with partial context");
                partial = true;
                break;
            }
            self.emitter
                .emit(EventPayload::Thinking {
                    content: THINKING_STATUS.to_string(),
                })
                .await?;

            let history = self.settings.history.apply(&session.messages);
            let step = self
                .emitter
                .cancellable(timeout(
                    self.settings.generation_timeout,
                    self.planner.decide(&planner_system, history),
                ))
                .await?
                .map_err(|_| TutorError::UpstreamTimeout("reasoning".to_string()))??;
            total_tokens += step.total_tokens;

            let call = match step.output {
                PlannerOutput::Response(raw) => {
                    tracing::debug!(session_id = %session.id, rounds, "planner ready to answer: {}", crate::guardrail::preview(&raw));
                    break;
                }
                PlannerOutput::ToolCall(call) => call,
            };

            rounds += 1;
            session.advance(TurnPhase::ToolCall);
            let index = session.push_tool_call(&call.tool, call.args.clone());
            self.checkpointer.persist(session).await?;
            self.emitter
                .emit(EventPayload::ToolCall {
                    tool: call.tool.clone(),
                    args: call.args.clone(),
                })
                .await?;

            let result = self
                .emitter
                .cancellable(self.executor.execute(&call.tool, call.args))
                .await?;
            match result {
                Ok(value) => {
                    session.complete_tool_call(index, Ok(value));
                    self.checkpointer.persist(session).await?;
                }
                Err(e) => {
                    tracing::warn!(session_id = %session.id, tool = %call.tool, "tool call failed: {}", e);
                    session.complete_tool_call(index, Err(e.to_string()));
                    return Err(e);
                }
            }
        }

        session.advance(TurnPhase::Answering);
        self.checkpointer.persist(session).await?;

        let answer_system = if partial {
            format!("{system}\n\n{ROUND_LIMIT_NOTE}")
        } else {
            system
        };
        let deadline = Instant::now() + self.settings.generation_timeout;
        let history = self.settings.history.apply(&session.messages);
        let mut stream = self
            .emitter
            .cancellable(timeout_at(deadline, self.planner.answer(&answer_system, history)))
            .await?
            .map_err(|_| TutorError::UpstreamTimeout("generation".to_string()))??;

        let mut text = String::new();
        loop {
            let next = self
                .emitter
                .cancellable(timeout_at(deadline, stream.next()))
                .await?
                .map_err(|_| TutorError::UpstreamTimeout("generation".to_string()))?;
            match next {
                None => break,
                Some(Ok(StreamChunk::Delta(delta))) => {
                    if delta.is_empty() {
                        continue;
                    }
                    text.push_str(&delta);
                    self.emitter.emit(EventPayload::TextDelta { content: delta }).await?;
                }
                Some(Ok(StreamChunk::Usage(tokens))) => total_tokens += tokens,
                Some(Err(e)) => return Err(e.into()),
            }
        }

        session.push_answer(text, partial);
        Ok(DoneSummary {
            total_tokens,
            partial,
            block: None,
        })
    }
}
