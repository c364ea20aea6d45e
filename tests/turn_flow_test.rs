//! 轮次流程集成测试：事件顺序、轮数上限、单会话互斥、护栏、取消与超时

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;

use tutor::checkpoint::{CheckpointStore, InMemoryCheckpointStore};
use tutor::core::{OrchestratorSettings, ToolCallStatus, TurnPhase};
use tutor::guardrail::{GuardCategory, Guardrail, GuardrailDecision, RuleGuardrail};
use tutor::llm::MockLlmClient;
use tutor::react::{EventPayload, TurnSettings};
use tutor::tools::{create_default_registry, InMemoryGlossary, ToolExecutor};
use tutor::{TurnEvent, TurnRequest, TutorError, TutorOrchestrator};

const LOOKUP_PER: &str = r#"{"tool": "lookup_term", "args": {"term": "PER"}}"#;

fn settings(max_rounds: usize) -> OrchestratorSettings {
    OrchestratorSettings {
        turn: TurnSettings {
            max_rounds,
            ..TurnSettings::default()
        },
        save_retries: 1,
        retry_backoff: Duration::from_millis(1),
        ..OrchestratorSettings::default()
    }
}

fn build(
    guardrail: Arc<dyn Guardrail>,
    llm: Arc<MockLlmClient>,
    store: Arc<dyn CheckpointStore>,
    settings: OrchestratorSettings,
) -> TutorOrchestrator {
    let executor = ToolExecutor::from_secs(
        create_default_registry(Arc::new(InMemoryGlossary::with_defaults())),
        5,
    );
    TutorOrchestrator::new(guardrail, llm, executor, store, settings)
}

fn simple(llm: Arc<MockLlmClient>) -> TutorOrchestrator {
    build(
        Arc::new(RuleGuardrail::new()),
        llm,
        Arc::new(InMemoryCheckpointStore::new()),
        settings(5),
    )
}

async fn run(orch: &TutorOrchestrator, request: TurnRequest) -> Vec<TurnEvent> {
    orch.handle_turn(request).unwrap().collect().await
}

fn kinds(events: &[TurnEvent]) -> Vec<&'static str> {
    events.iter().map(|e| e.kind()).collect()
}

async fn wait_idle(orch: &TutorOrchestrator) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while orch.gate().active_count() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("turn did not finish");
}

#[tokio::test]
async fn test_tool_turn_event_order() {
    let answer = "PER은 주가를 주당순이익으로 나눈 값입니다.";
    let llm = Arc::new(
        MockLlmClient::new()
            .push_reply(LOOKUP_PER)
            .with_answer(answer)
            .with_tokens_per_call(10),
    );
    let orch = simple(llm.clone());
    let events = run(&orch, TurnRequest::new("PER이 뭐야?").with_session("s1")).await;

    let k = kinds(&events);
    assert_eq!(&k[..3], ["thinking", "tool_call", "thinking"]);
    assert_eq!(k.last(), Some(&"done"));
    assert!(k[3..k.len() - 1].iter().all(|k| *k == "text_delta"));
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    assert!(events.iter().all(|e| e.session_id == "s1"));

    match &events[1].payload {
        EventPayload::ToolCall { tool, args } => {
            assert_eq!(tool, "lookup_term");
            assert_eq!(args["term"], "PER");
        }
        other => panic!("unexpected {other:?}"),
    }

    let text: String = events
        .iter()
        .filter_map(|e| match &e.payload {
            EventPayload::TextDelta { content } => Some(content.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(text, answer);

    match &events.last().unwrap().payload {
        EventPayload::Done(summary) => {
            // 两次推理 + 一次回答
            assert_eq!(summary.total_tokens, 30);
            assert!(!summary.partial);
            assert!(summary.block.is_none());
        }
        other => panic!("unexpected {other:?}"),
    }

    let session = orch.session("s1").await.unwrap().unwrap();
    assert_eq!(session.phase, TurnPhase::Done);
    assert_eq!(session.tool_calls.len(), 1);
    assert_eq!(session.tool_calls[0].status, ToolCallStatus::Succeeded);
    assert_eq!(session.messages.last().unwrap().content, answer);
}

#[tokio::test]
async fn test_round_limit_forces_partial_answer() {
    let llm = Arc::new(MockLlmClient::new().with_fallback(LOOKUP_PER));
    let orch = build(
        Arc::new(RuleGuardrail::new()),
        llm.clone(),
        Arc::new(InMemoryCheckpointStore::new()),
        settings(3),
    );
    let events = run(&orch, TurnRequest::new("PER을 계속 찾아봐").with_session("s1")).await;

    assert_eq!(events.iter().filter(|e| e.kind() == "tool_call").count(), 3);
    assert_eq!(llm.complete_calls(), 3);
    assert_eq!(llm.stream_calls(), 1);
    match &events.last().unwrap().payload {
        EventPayload::Done(summary) => assert!(summary.partial),
        other => panic!("unexpected {other:?}"),
    }
    assert!(orch.session("s1").await.unwrap().unwrap().partial);
}

#[tokio::test]
async fn test_same_session_is_busy_until_terminal_event() {
    let llm = Arc::new(MockLlmClient::new().with_delay(Duration::from_millis(150)));
    let orch = simple(llm);

    let first = orch.handle_turn(TurnRequest::new("금리가 뭐야?").with_session("s1")).unwrap();
    let err = orch
        .handle_turn(TurnRequest::new("배당은?").with_session("s1"))
        .err()
        .unwrap();
    assert!(matches!(err, TutorError::SessionBusy(ref id) if id == "s1"));

    // 其他会话不受影响
    let other = orch.handle_turn(TurnRequest::new("배당은?").with_session("s2")).unwrap();

    let events: Vec<TurnEvent> = first.collect().await;
    assert_eq!(events.last().unwrap().kind(), "done");
    // 收到终止事件后立即可以发送下一条
    let next: Vec<TurnEvent> = orch
        .handle_turn(TurnRequest::new("배당은?").with_session("s1"))
        .unwrap()
        .collect()
        .await;
    assert_eq!(next.last().unwrap().kind(), "done");

    let other_events: Vec<TurnEvent> = other.collect().await;
    assert_eq!(other_events.last().unwrap().kind(), "done");
    assert_eq!(orch.session("s1").await.unwrap().unwrap().turn_count, 2);
}

#[tokio::test]
async fn test_session_stays_busy_while_terminal_event_is_queued_behind_slow_reader() {
    let llm = Arc::new(MockLlmClient::new().with_answer("금리"));
    let orch = build(
        Arc::new(RuleGuardrail::new()),
        llm,
        Arc::new(InMemoryCheckpointStore::new()),
        OrchestratorSettings {
            event_buffer: 2,
            ..settings(5)
        },
    );

    // thinking + text_delta 占满通道，done 无处可放
    let first = orch.handle_turn(TurnRequest::new("금리가 뭐야?").with_session("s1")).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let second = orch.handle_turn(TurnRequest::new("배당은?").with_session("s1"));
    assert!(matches!(second, Err(TutorError::SessionBusy(_))));

    let events: Vec<TurnEvent> = first.collect().await;
    assert_eq!(kinds(&events), ["thinking", "text_delta", "done"]);
    let next: Vec<TurnEvent> = orch
        .handle_turn(TurnRequest::new("배당은?").with_session("s1"))
        .unwrap()
        .collect()
        .await;
    assert_eq!(next.last().unwrap().kind(), "done");
}

#[tokio::test]
async fn test_advice_request_blocked_without_model_calls() {
    let llm = Arc::new(MockLlmClient::new());
    let orch = simple(llm.clone());
    let events = run(&orch, TurnRequest::new("삼성전자 지금 사도 될까요?").with_session("s1")).await;

    assert_eq!(kinds(&events), ["done"]);
    match &events[0].payload {
        EventPayload::Done(summary) => {
            let block = summary.block.as_ref().unwrap();
            assert_eq!(block.category, GuardCategory::SensitiveAdvice);
            assert!(!block.message.is_empty());
            assert_eq!(summary.total_tokens, 0);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(llm.complete_calls() + llm.stream_calls(), 0);

    let session = orch.session("s1").await.unwrap().unwrap();
    assert_eq!(session.phase, TurnPhase::Done);
}

struct SlowGuardrail;

#[async_trait]
impl Guardrail for SlowGuardrail {
    async fn classify(&self, _message: &str) -> GuardrailDecision {
        tokio::time::sleep(Duration::from_secs(5)).await;
        GuardrailDecision::allow("too late")
    }

    fn name(&self) -> &str {
        "slow"
    }
}

#[tokio::test]
async fn test_guardrail_timeout_fails_closed() {
    let llm = Arc::new(MockLlmClient::new());
    let mut s = settings(5);
    s.turn.guardrail_timeout = Duration::from_millis(50);
    let orch = build(Arc::new(SlowGuardrail), llm.clone(), Arc::new(InMemoryCheckpointStore::new()), s);

    let events = run(&orch, TurnRequest::new("금리가 뭐야?")).await;
    match &events[0].payload {
        EventPayload::Done(summary) => {
            assert_eq!(summary.block.as_ref().unwrap().category, GuardCategory::Unavailable);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(llm.complete_calls(), 0);
}

#[tokio::test]
async fn test_tool_error_names_tool_and_session_stays_usable() {
    let llm = Arc::new(MockLlmClient::new().push_reply(r#"{"tool": "lookup_term", "args": {"term": 5}}"#));
    let orch = simple(llm);
    let events = run(&orch, TurnRequest::new("PER이 뭐야?").with_session("s1")).await;

    assert_eq!(kinds(&events), ["thinking", "tool_call", "error"]);
    match &events[2].payload {
        EventPayload::Error { message } => assert!(message.contains("lookup_term")),
        other => panic!("unexpected {other:?}"),
    }

    let session = orch.session("s1").await.unwrap().unwrap();
    assert_eq!(session.phase, TurnPhase::Error);
    assert_eq!(session.tool_calls[0].status, ToolCallStatus::Failed);
    assert!(session.last_error.is_some());

    let next = run(&orch, TurnRequest::new("그럼 PBR은?").with_session("s1")).await;
    assert_eq!(next.last().unwrap().kind(), "done");
}

#[tokio::test]
async fn test_generation_timeout_is_error() {
    let llm = Arc::new(MockLlmClient::new().with_delay(Duration::from_millis(500)));
    let mut s = settings(5);
    s.turn.generation_timeout = Duration::from_millis(50);
    let orch = build(Arc::new(RuleGuardrail::new()), llm, Arc::new(InMemoryCheckpointStore::new()), s);

    let events = run(&orch, TurnRequest::new("금리가 뭐야?").with_session("s1")).await;
    assert_eq!(kinds(&events), ["thinking", "error"]);
    match &events[1].payload {
        EventPayload::Error { message } => {
            assert_eq!(message, &TutorError::UpstreamTimeout(String::new()).user_message());
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(orch.session("s1").await.unwrap().unwrap().phase, TurnPhase::Error);
}

#[tokio::test]
async fn test_disconnect_stops_further_model_calls() {
    let llm = Arc::new(
        MockLlmClient::new()
            .with_fallback(LOOKUP_PER)
            .with_delay(Duration::from_millis(200)),
    );
    let orch = simple(llm.clone());
    let mut stream = orch.handle_turn(TurnRequest::new("PER이 뭐야?").with_session("s1")).unwrap();

    let first = stream.next().await.unwrap();
    assert_eq!(first.kind(), "thinking");
    drop(stream);

    wait_idle(&orch).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    // 断开可能早于推理调用开始
    assert!(llm.complete_calls() <= 1);
    assert_eq!(llm.stream_calls(), 0);

    let session = orch.session("s1").await.unwrap().unwrap();
    assert_eq!(session.phase, TurnPhase::Error);
    assert!(session.tool_calls.is_empty());
}

#[tokio::test]
async fn test_disconnect_mid_answer_keeps_session_resumable() {
    let answer = "금리 인하는 대출 이자를 낮추고 채권 가격을 올리며 주식 시장에도 영향을 줍니다.";
    let llm = Arc::new(
        MockLlmClient::new()
            .with_answer(answer)
            .with_chunk_delay(Duration::from_millis(40)),
    );
    let orch = simple(llm.clone());
    let mut stream = orch
        .handle_turn(TurnRequest::new("금리 인하의 영향은?").with_session("s1"))
        .unwrap();
    loop {
        let ev = stream.next().await.unwrap();
        if ev.kind() == "text_delta" {
            break;
        }
    }
    drop(stream);
    wait_idle(&orch).await;

    let session = orch.session("s1").await.unwrap().unwrap();
    assert_eq!(session.phase, TurnPhase::Error);
    assert_ne!(session.messages.last().unwrap().content, answer);

    let next = run(&orch, TurnRequest::new("다시 설명해줘").with_session("s1")).await;
    assert_eq!(next.last().unwrap().kind(), "done");
    assert_eq!(orch.session("s1").await.unwrap().unwrap().turn_count, 2);
}

#[tokio::test]
async fn test_empty_message_is_validation_error() {
    let orch = simple(Arc::new(MockLlmClient::new()));
    for msg in ["", "  \n\t "] {
        let err = orch.handle_turn(TurnRequest::new(msg).with_session("s1")).err().unwrap();
        assert!(matches!(err, TutorError::Validation(_)));
    }
    assert!(orch.session("s1").await.unwrap().is_none());
}
