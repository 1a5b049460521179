use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use pretty_assertions::assert_eq;
use timeline_core::AgentPhase;
use timeline_core::AgentTransport;
use timeline_core::ExecutionStatus;
use timeline_core::HistoryApi;
use timeline_core::HistoryPage;
use timeline_core::MemoryStateStore;
use timeline_core::Result;
use timeline_core::Session;
use timeline_core::SessionEvent;
use timeline_core::SessionEventSender;
use timeline_core::StreamStatus;
use timeline_core::TimelineConfig;
use timeline_core::TimelineError;
use timeline_core::ToolStatus;
use timeline_protocol::ActEvent;
use timeline_protocol::ClarificationAnsweredEvent;
use timeline_protocol::ClarificationAskedEvent;
use timeline_protocol::CompleteEvent;
use timeline_protocol::ConversationId;
use timeline_protocol::ErrorEvent;
use timeline_protocol::HitlAnswer;
use timeline_protocol::HitlKind;
use timeline_protocol::ObserveEvent;
use timeline_protocol::OrderKey;
use timeline_protocol::PermissionAskedEvent;
use timeline_protocol::TextDeltaEvent;
use timeline_protocol::TextEndEvent;
use timeline_protocol::TextStartEvent;
use timeline_protocol::ThoughtDeltaEvent;
use timeline_protocol::TimelineEvent;
use timeline_protocol::TimelineItem;
use timeline_protocol::WireEvent;
use timeline_protocol::WireMsg;
use tokio::sync::mpsc::UnboundedReceiver;

#[derive(Default)]
struct MockTransport {
    connected: AtomicBool,
    fail_send: AtomicBool,
    sent: Mutex<Vec<(ConversationId, String)>>,
    responses: Mutex<Vec<(ConversationId, HitlKind, String, HitlAnswer)>>,
    subscriptions: Mutex<Vec<ConversationId>>,
}

#[async_trait]
impl AgentTransport for MockTransport {
    async fn connect(&self) -> Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn subscribe(&self, id: ConversationId, _events: SessionEventSender) -> Result<()> {
        self.subscriptions.lock().unwrap().push(id);
        Ok(())
    }

    async fn send_message(&self, id: ConversationId, content: String) -> Result<()> {
        if self.fail_send.load(Ordering::SeqCst) {
            return Err(TimelineError::Transport("send refused".to_string()));
        }
        self.sent.lock().unwrap().push((id, content));
        Ok(())
    }

    async fn respond(
        &self,
        id: ConversationId,
        kind: HitlKind,
        request_id: String,
        answer: HitlAnswer,
    ) -> Result<()> {
        self.responses
            .lock()
            .unwrap()
            .push((id, kind, request_id, answer));
        Ok(())
    }

    async fn abort(&self, _id: ConversationId) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct MockHistory {
    pages: Mutex<HashMap<ConversationId, HistoryPage>>,
    running: Mutex<HashSet<ConversationId>>,
}

impl MockHistory {
    fn set_page(&self, id: ConversationId, page: HistoryPage) {
        self.pages.lock().unwrap().insert(id, page);
    }

    fn set_running(&self, id: ConversationId) {
        self.running.lock().unwrap().insert(id);
    }
}

#[async_trait]
impl HistoryApi for MockHistory {
    async fn fetch_messages(
        &self,
        id: ConversationId,
        _limit: usize,
        _before: Option<OrderKey>,
    ) -> Result<HistoryPage> {
        Ok(self.pages.lock().unwrap().get(&id).cloned().unwrap_or_default())
    }

    async fn execution_status(
        &self,
        id: ConversationId,
        _include_recovery: bool,
        _last_known_time_us: Option<i64>,
    ) -> Result<ExecutionStatus> {
        Ok(ExecutionStatus {
            is_running: self.running.lock().unwrap().contains(&id),
        })
    }
}

struct Harness {
    session: Session,
    rx: UnboundedReceiver<SessionEvent>,
    transport: Arc<MockTransport>,
    history: Arc<MockHistory>,
    durable: Arc<MemoryStateStore>,
}

fn harness(config: TimelineConfig) -> Harness {
    let transport = Arc::new(MockTransport::default());
    let history = Arc::new(MockHistory::default());
    let durable = Arc::new(MemoryStateStore::new());
    let (session, rx) = Session::new(
        config,
        transport.clone(),
        history.clone(),
        durable.clone(),
    );
    Harness {
        session,
        rx,
        transport,
        history,
        durable,
    }
}

impl Harness {
    fn wire(&mut self, id: ConversationId, time_us: i64, msg: WireMsg) {
        self.session.handle_wire_event(
            id,
            WireEvent {
                time_us,
                counter: 0,
                msg,
            },
        );
    }

    /// Feed every event the timer tasks have posted back into the loop.
    async fn drain(&mut self) {
        while let Ok(event) = self.rx.try_recv() {
            self.session.handle_session_event(event).await;
        }
    }
}

fn history_entry(id: &str, time_us: i64) -> TimelineEvent {
    TimelineEvent {
        id: id.to_string(),
        order: OrderKey::new(time_us, 0),
        received_at_us: 0,
        item: TimelineItem::UserMessage {
            content: format!("msg {id}"),
        },
    }
}

fn page_of(n: usize) -> HistoryPage {
    HistoryPage {
        timeline: (0..n).map(|i| history_entry(&format!("h{i}"), i as i64)).collect(),
        has_more: false,
        ..Default::default()
    }
}

#[tokio::test(start_paused = true)]
async fn text_deltas_coalesce_into_one_flush() {
    let mut h = harness(TimelineConfig::default());
    let id = ConversationId::new();

    h.wire(id, 10, WireMsg::TextStart(TextStartEvent {}));
    for (i, piece) in ["He", "llo", " wo", "rld"].iter().enumerate() {
        h.wire(
            id,
            11 + i as i64,
            WireMsg::TextDelta(TextDeltaEvent {
                delta: (*piece).to_string(),
            }),
        );
    }
    // Nothing visible until the flush timer fires.
    assert_eq!(h.session.store().get(&id).streaming_assistant_content, "");

    tokio::time::sleep(Duration::from_millis(60)).await;
    h.drain().await;

    assert_eq!(
        h.session.store().get(&id).streaming_assistant_content,
        "Hello world"
    );
}

#[tokio::test(start_paused = true)]
async fn thought_deltas_use_their_own_interval() {
    let mut h = harness(TimelineConfig::default());
    let id = ConversationId::new();

    h.wire(
        id,
        10,
        WireMsg::ThoughtDelta(ThoughtDeltaEvent {
            delta: "considering".to_string(),
        }),
    );
    assert_eq!(h.session.store().get(&id).agent_phase, AgentPhase::Thinking);

    // The text interval has elapsed but the thought interval has not.
    tokio::time::sleep(Duration::from_millis(60)).await;
    h.drain().await;
    assert_eq!(h.session.store().get(&id).streaming_thought, "");

    tokio::time::sleep(Duration::from_millis(150)).await;
    h.drain().await;
    assert_eq!(h.session.store().get(&id).streaming_thought, "considering");
}

#[tokio::test(start_paused = true)]
async fn delta_buffers_are_isolated_per_conversation() {
    let mut h = harness(TimelineConfig::default());
    let a = ConversationId::new();
    let b = ConversationId::new();

    h.wire(a, 10, WireMsg::TextDelta(TextDeltaEvent { delta: "from A".to_string() }));
    h.wire(b, 10, WireMsg::TextDelta(TextDeltaEvent { delta: "from B".to_string() }));

    tokio::time::sleep(Duration::from_millis(60)).await;
    h.drain().await;

    assert_eq!(h.session.store().get(&a).streaming_assistant_content, "from A");
    assert_eq!(h.session.store().get(&b).streaming_assistant_content, "from B");
}

#[tokio::test(start_paused = true)]
async fn text_end_with_full_payload_replaces_flushed_partials() {
    let mut h = harness(TimelineConfig::default());
    let id = ConversationId::new();

    h.wire(id, 10, WireMsg::TextStart(TextStartEvent {}));
    h.wire(
        id,
        11,
        WireMsg::TextDelta(TextDeltaEvent {
            delta: "Hello".to_string(),
        }),
    );
    tokio::time::sleep(Duration::from_millis(60)).await;
    h.drain().await;
    assert_eq!(h.session.store().get(&id).streaming_assistant_content, "Hello");

    // Some transports repeat the whole final text in the terminal frame;
    // the partials already flushed must not be counted twice.
    h.wire(
        id,
        12,
        WireMsg::TextEnd(TextEndEvent {
            content: Some("Hello world".to_string()),
        }),
    );
    assert_eq!(
        h.session.store().get(&id).streaming_assistant_content,
        "Hello world"
    );

    h.wire(id, 20, WireMsg::Complete(CompleteEvent { message: None }));
    match &h.session.store().get(&id).timeline.last().unwrap().item {
        TimelineItem::AssistantMessage { content } => assert_eq!(content, "Hello world"),
        other => panic!("unexpected final entry: {other:?}"),
    }
}

#[tokio::test]
async fn complete_strips_transient_entries_and_appends_final_message() {
    let mut h = harness(TimelineConfig::default());
    let id = ConversationId::new();

    let submission = h.session.send_message(id, "hi there".to_string()).await;
    assert!(submission.is_some());
    assert!(h.session.store().get(&id).is_streaming);

    h.wire(id, 10, WireMsg::TextStart(TextStartEvent {}));
    h.wire(
        id,
        11,
        WireMsg::TextDelta(TextDeltaEvent {
            delta: "final answer".to_string(),
        }),
    );
    h.wire(id, 20, WireMsg::Complete(CompleteEvent { message: None }));

    let state = h.session.store().get(&id);
    assert!(!state.is_streaming);
    assert_eq!(state.agent_phase, AgentPhase::Idle);
    assert_eq!(state.streaming_assistant_content, "");
    assert!(state.timeline.iter().all(|e| !e.is_transient_text()));
    match &state.timeline.last().unwrap().item {
        TimelineItem::AssistantMessage { content } => assert_eq!(content, "final answer"),
        other => panic!("unexpected final entry: {other:?}"),
    }
    // The user message survived as the first entry.
    match &state.timeline[0].item {
        TimelineItem::UserMessage { content } => assert_eq!(content, "hi there"),
        other => panic!("unexpected first entry: {other:?}"),
    }
}

#[tokio::test]
async fn concurrent_stream_cap_refuses_new_sends() {
    let mut h = harness(TimelineConfig {
        max_concurrent_streams: 1,
        ..Default::default()
    });
    let a = ConversationId::new();
    let b = ConversationId::new();

    assert!(h.session.send_message(a, "first".to_string()).await.is_some());
    let refused = h.session.send_message(b, "second".to_string()).await;

    assert_eq!(refused, None);
    let state = h.session.store().get(&b);
    assert!(state.error.as_deref().unwrap().contains("streaming limit"));
    assert!(!state.is_streaming);
    // Only the first message reached the transport, and no subscription was
    // opened for the refused conversation.
    assert_eq!(h.transport.sent.lock().unwrap().len(), 1);
    assert!(!h.transport.subscriptions.lock().unwrap().contains(&b));

    // A conversation already streaming may keep sending.
    assert!(h.session.send_message(a, "follow-up".to_string()).await.is_some());
}

#[tokio::test]
async fn observe_without_tool_name_pops_the_pending_stack() {
    let mut h = harness(TimelineConfig::default());
    let id = ConversationId::new();

    h.wire(
        id,
        10,
        WireMsg::Act(ActEvent {
            tool_name: "search".to_string(),
            tool_input: Some(serde_json::json!({"q": "rust"})),
        }),
    );
    let state = h.session.store().get(&id);
    assert_eq!(state.pending_tools_stack, vec!["search".to_string()]);
    assert_eq!(
        state.active_tool_calls.get("search").unwrap().status,
        ToolStatus::Running
    );
    assert_eq!(state.agent_phase, AgentPhase::Acting);

    h.wire(
        id,
        11,
        WireMsg::Observe(ObserveEvent {
            tool_name: None,
            tool_output: Some(serde_json::json!({"hits": 3})),
            success: true,
        }),
    );
    let state = h.session.store().get(&id);
    assert!(state.pending_tools_stack.is_empty());
    let call = state.active_tool_calls.get("search").unwrap();
    assert_eq!(call.status, ToolStatus::Success);
    assert!(call.completed_at_us.is_some());
    assert_eq!(state.agent_phase, AgentPhase::Observing);
    // The result entry carries the resolved tool name.
    match &state.timeline.last().unwrap().item {
        TimelineItem::ToolResult { tool_name, success, .. } => {
            assert_eq!(tool_name.as_deref(), Some("search"));
            assert!(success);
        }
        other => panic!("unexpected entry: {other:?}"),
    }
}

#[tokio::test]
async fn failed_send_resets_to_idle_with_error() {
    let mut h = harness(TimelineConfig::default());
    let id = ConversationId::new();
    h.transport.fail_send.store(true, Ordering::SeqCst);

    assert_eq!(h.session.send_message(id, "hi".to_string()).await, None);

    let state = h.session.store().get(&id);
    assert!(!state.is_streaming);
    assert_eq!(state.stream_status, StreamStatus::Idle);
    assert_eq!(state.agent_phase, AgentPhase::Idle);
    assert!(state.error.as_deref().unwrap().contains("send refused"));
}

#[tokio::test]
async fn clarification_flow_reconciles_request_and_response() {
    let mut h = harness(TimelineConfig::default());
    let id = ConversationId::new();

    h.wire(
        id,
        10,
        WireMsg::ClarificationAsked(ClarificationAskedEvent {
            request_id: "r1".to_string(),
            question: "which color?".to_string(),
            options: vec!["blue".to_string(), "red".to_string()],
        }),
    );
    let state = h.session.store().get(&id);
    assert_eq!(state.agent_phase, AgentPhase::AwaitingInput);
    assert!(!state.is_streaming);
    assert_eq!(state.pending_hitl.as_ref().unwrap().request_id, "r1");

    h.session
        .respond(
            id,
            HitlKind::Clarification,
            HitlAnswer::Text {
                text: "blue".to_string(),
            },
        )
        .await
        .unwrap();

    let state = h.session.store().get(&id);
    assert_eq!(state.pending_hitl, None);
    assert_eq!(state.agent_phase, AgentPhase::Thinking);
    assert!(state.is_streaming);
    // Exactly one entry for r1, marked answered in place.
    let requests: Vec<_> = state
        .timeline
        .iter()
        .filter(|e| e.hitl_request_id() == Some("r1"))
        .collect();
    assert_eq!(requests.len(), 1);
    match &requests[0].item {
        TimelineItem::HitlRequest(req) => {
            assert!(req.answered);
            assert_eq!(
                req.answer,
                Some(HitlAnswer::Text {
                    text: "blue".to_string()
                })
            );
        }
        other => panic!("unexpected entry: {other:?}"),
    }
    assert_eq!(h.transport.responses.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn answer_arriving_on_the_wire_clears_pending_and_resumes() {
    let mut h = harness(TimelineConfig::default());
    let id = ConversationId::new();

    h.wire(
        id,
        10,
        WireMsg::ClarificationAsked(ClarificationAskedEvent {
            request_id: "r1".to_string(),
            question: "which color?".to_string(),
            options: vec![],
        }),
    );
    assert_eq!(h.session.store().get(&id).agent_phase, AgentPhase::AwaitingInput);

    // Answered from another device: the answer shows up as a wire event
    // without any local respond call.
    h.wire(
        id,
        11,
        WireMsg::ClarificationAnswered(ClarificationAnsweredEvent {
            request_id: "r1".to_string(),
            answer: "blue".to_string(),
        }),
    );

    let state = h.session.store().get(&id);
    assert_eq!(state.pending_hitl, None);
    assert_eq!(state.pending_request_id(HitlKind::Clarification), None);
    assert_eq!(state.agent_phase, AgentPhase::Thinking);
    assert!(state.is_streaming);
    let requests: Vec<_> = state
        .timeline
        .iter()
        .filter(|e| e.hitl_request_id() == Some("r1"))
        .collect();
    assert_eq!(requests.len(), 1);
    match &requests[0].item {
        TimelineItem::HitlRequest(req) => assert!(req.answered),
        other => panic!("unexpected entry: {other:?}"),
    }
    assert!(h.transport.responses.lock().unwrap().is_empty());
}

#[tokio::test]
async fn permission_denial_stops_the_turn() {
    let mut h = harness(TimelineConfig::default());
    let id = ConversationId::new();

    h.wire(
        id,
        10,
        WireMsg::PermissionAsked(PermissionAskedEvent {
            request_id: "p1".to_string(),
            action: "rm -rf build".to_string(),
            detail: None,
        }),
    );
    h.session
        .respond(id, HitlKind::Permission, HitlAnswer::Granted { granted: false })
        .await
        .unwrap();

    let state = h.session.store().get(&id);
    assert_eq!(state.agent_phase, AgentPhase::Idle);
    assert!(!state.is_streaming);
    assert_eq!(state.pending_hitl, None);
}

#[tokio::test]
async fn responding_with_nothing_pending_is_an_error() {
    let mut h = harness(TimelineConfig::default());
    let id = ConversationId::new();

    let result = h
        .session
        .respond(
            id,
            HitlKind::Decision,
            HitlAnswer::Choice {
                choice: "yes".to_string(),
            },
        )
        .await;
    assert_matches!(result, Err(TimelineError::UnknownRequest { .. }));
}

#[tokio::test]
async fn retryable_error_keeps_the_stream_alive() {
    let mut h = harness(TimelineConfig::default());
    let id = ConversationId::new();

    h.session.send_message(id, "go".to_string()).await.unwrap();
    h.wire(
        id,
        10,
        WireMsg::Error(ErrorEvent {
            message: "rate limited".to_string(),
            retryable: true,
        }),
    );

    let state = h.session.store().get(&id);
    assert!(state.is_streaming);
    assert_eq!(state.agent_phase, AgentPhase::Retrying);
    assert_eq!(state.error.as_deref(), Some("rate limited"));
}

#[tokio::test]
async fn fatal_error_preserves_partial_content() {
    let mut h = harness(TimelineConfig::default());
    let id = ConversationId::new();

    h.session.send_message(id, "go".to_string()).await.unwrap();
    h.wire(
        id,
        10,
        WireMsg::TextDelta(TextDeltaEvent {
            delta: "partial answ".to_string(),
        }),
    );
    h.wire(
        id,
        11,
        WireMsg::Error(ErrorEvent {
            message: "backend exploded".to_string(),
            retryable: false,
        }),
    );

    let state = h.session.store().get(&id);
    assert!(!state.is_streaming);
    assert_eq!(state.stream_status, StreamStatus::Error);
    assert_eq!(state.agent_phase, AgentPhase::Idle);
    // Unflushed buffered text was folded in rather than lost.
    assert_eq!(state.streaming_assistant_content, "partial answ");
    assert_matches!(
        state.timeline.last().unwrap().item,
        TimelineItem::Error { .. }
    );
}

#[tokio::test]
async fn reload_merges_history_and_reattaches_to_running_stream() {
    let mut h = harness(TimelineConfig::default());
    let id = ConversationId::new();

    // First visit loads a 12-entry page.
    h.history.set_page(id, page_of(12));
    h.session.load_messages(id).await.unwrap();
    assert_eq!(h.session.store().get(&id).timeline.len(), 12);

    // Reload: the server now has 15 entries and the agent is still running.
    h.history.set_page(id, page_of(15));
    h.history.set_running(id);
    h.session.reload_conversation(id).await.unwrap();

    let state = h.session.store().get(&id);
    assert_eq!(state.timeline.len(), 15);
    assert!(state.is_streaming);
    assert_eq!(state.stream_status, StreamStatus::Streaming);
    assert_eq!(h.transport.subscriptions.lock().unwrap().as_slice(), &[id]);
}

#[tokio::test]
async fn history_load_schedules_a_debounced_save() {
    let mut h = harness(TimelineConfig::default());
    let id = ConversationId::new();

    h.history.set_page(id, page_of(5));
    h.session.load_messages(id).await.unwrap();
    assert!(h.durable.is_empty());

    // Page-unload flush must capture a conversation that only ever loaded
    // history, not just ones that saw live events.
    h.session.flush_pending_saves().await;
    assert_eq!(h.durable.len(), 1);
}

#[tokio::test]
async fn switching_evicts_past_the_bound_and_restores_later() {
    let mut h = harness(TimelineConfig {
        max_cached_conversations: 1,
        ..Default::default()
    });
    let a = ConversationId::new();
    let b = ConversationId::new();

    h.history.set_page(a, page_of(3));
    h.session.load_messages(a).await.unwrap();
    h.session.switch_conversation(Some(a)).await;

    h.history.set_page(b, page_of(2));
    h.session.load_messages(b).await.unwrap();
    h.session.switch_conversation(Some(b)).await;

    // A went over the bound: persisted and dropped.
    assert!(!h.session.store().contains(&a));
    assert_eq!(h.durable.len(), 1);
    assert_eq!(h.session.snapshot().timeline.len(), 2);

    // Switching back restores A from the durable store.
    h.session.switch_conversation(Some(a)).await;
    assert_eq!(h.session.snapshot().conversation_id, Some(a));
    assert_eq!(h.session.snapshot().timeline.len(), 3);
}

#[tokio::test]
async fn delete_purges_state_and_durable_document() {
    let mut h = harness(TimelineConfig::default());
    let id = ConversationId::new();

    h.history.set_page(id, page_of(2));
    h.session.load_messages(id).await.unwrap();
    h.session.pin_entry(id, "h0");
    h.session.flush_pending_saves().await;
    assert_eq!(h.durable.len(), 1);

    h.session.delete_conversation(id).await;

    assert!(!h.session.store().contains(&id));
    assert!(h.durable.is_empty());
}

#[tokio::test]
async fn events_for_background_conversations_never_touch_the_active_view() {
    let mut h = harness(TimelineConfig::default());
    let active = ConversationId::new();
    let background = ConversationId::new();
    h.session.switch_conversation(Some(active)).await;

    h.wire(
        background,
        10,
        WireMsg::TextStart(TextStartEvent {}),
    );
    h.wire(
        background,
        11,
        WireMsg::Complete(CompleteEvent {
            message: Some("done in background".to_string()),
        }),
    );

    assert!(h.session.snapshot().timeline.is_empty());
    assert!(!h.session.snapshot().is_streaming);
    // The background conversation accumulated normally.
    let state = h.session.store().get(&background);
    assert_eq!(state.timeline.len(), 1);
    assert_eq!(state.agent_phase, AgentPhase::Idle);
}
