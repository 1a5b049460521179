//! The session owns everything with a lifecycle: the conversation store, the
//! per-conversation delta buffers, armed flush timers and debounced save
//! timers. All mutation funnels through one event loop so handlers never
//! race; user actions are async methods on the same owner.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use timeline_protocol::ConversationId;
use timeline_protocol::HitlAnswer;
use timeline_protocol::HitlKind;
use timeline_protocol::OrderKey;
use timeline_protocol::UserMessageEvent;
use timeline_protocol::WireEvent;
use timeline_protocol::WireMsg;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::mpsc::unbounded_channel;
use tokio::task::AbortHandle;
use tracing::error;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

use crate::cache;
use crate::coalescer::DeltaBuffers;
use crate::coalescer::DeltaChannel;
use crate::codec;
use crate::config::TimelineConfig;
use crate::error::Result;
use crate::error::TimelineError;
use crate::history;
use crate::persist::DurableStateStore;
use crate::persist::JsonStateStore;
use crate::persist::StateSnapshot;
use crate::reconcile;
use crate::state::AgentPhase;
use crate::state::ConversationUpdate;
use crate::state::StreamStatus;
use crate::store::ActiveSnapshot;
use crate::store::ConversationStore;
use crate::transport::AgentTransport;
use crate::transport::HistoryApi;
use crate::util::now_us;

/// Everything the event loop processes. Wire events carry the conversation
/// they belong to; handlers are bound to that id, never to "whichever
/// conversation is visible right now".
#[derive(Debug)]
pub enum SessionEvent {
    Wire {
        conversation_id: ConversationId,
        event: WireEvent,
    },
    FlushDelta {
        conversation_id: ConversationId,
        channel: DeltaChannel,
    },
    PersistNow {
        conversation_id: ConversationId,
    },
}

/// Cloneable handle for posting events into the loop. A send failure means
/// the loop is gone; it is logged, not propagated, so timer tasks and
/// transport callbacks stay infallible.
#[derive(Clone)]
pub struct SessionEventSender {
    tx: UnboundedSender<SessionEvent>,
}

impl SessionEventSender {
    pub fn send(&self, event: SessionEvent) {
        if let Err(e) = self.tx.send(event) {
            error!("failed to post session event: {e}");
        }
    }
}

pub struct Session {
    pub(crate) config: TimelineConfig,
    pub(crate) store: ConversationStore,
    pub(crate) buffers: HashMap<ConversationId, DeltaBuffers>,
    save_timers: HashMap<ConversationId, AbortHandle>,
    subscribed: HashSet<ConversationId>,
    transport: Arc<dyn AgentTransport>,
    history: Arc<dyn HistoryApi>,
    durable: Arc<dyn DurableStateStore>,
    tx: SessionEventSender,
}

impl Session {
    pub fn new(
        config: TimelineConfig,
        transport: Arc<dyn AgentTransport>,
        history: Arc<dyn HistoryApi>,
        durable: Arc<dyn DurableStateStore>,
    ) -> (Self, UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = unbounded_channel();
        let session = Self {
            config,
            store: ConversationStore::new(),
            buffers: HashMap::new(),
            save_timers: HashMap::new(),
            subscribed: HashSet::new(),
            transport,
            history,
            durable,
            tx: SessionEventSender { tx },
        };
        (session, rx)
    }

    /// Session backed by the JSON file store at the config's state
    /// directory.
    pub fn with_default_store(
        config: TimelineConfig,
        transport: Arc<dyn AgentTransport>,
        history: Arc<dyn HistoryApi>,
    ) -> (Self, UnboundedReceiver<SessionEvent>) {
        let durable = Arc::new(JsonStateStore::new(&config.state_dir));
        Self::new(config, transport, history, durable)
    }

    pub fn event_sender(&self) -> SessionEventSender {
        self.tx.clone()
    }

    /// The flat projection of the active conversation, for UI bindings.
    pub fn snapshot(&self) -> &ActiveSnapshot {
        self.store.snapshot()
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    pub async fn run(&mut self, mut rx: UnboundedReceiver<SessionEvent>) {
        while let Some(event) = rx.recv().await {
            self.handle_session_event(event).await;
        }
    }

    pub async fn handle_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Wire {
                conversation_id,
                event,
            } => self.handle_wire_event(conversation_id, event),
            SessionEvent::FlushDelta {
                conversation_id,
                channel,
            } => self.on_flush_tick(conversation_id, channel),
            SessionEvent::PersistNow { conversation_id } => {
                self.persist_now(conversation_id).await;
            }
        }
    }

    pub(crate) fn buffers_mut(&mut self, id: ConversationId) -> &mut DeltaBuffers {
        self.buffers.entry(id).or_default()
    }

    /// Arm the flush timer for one channel. Caller guarantees none is armed
    /// (the buffer's push/replace return value).
    pub(crate) fn arm_flush(&mut self, id: ConversationId, channel: DeltaChannel) {
        let interval = match channel {
            DeltaChannel::Text | DeltaChannel::ToolArgs => self.config.token_batch_interval,
            DeltaChannel::Thought => self.config.thought_batch_interval,
        };
        let tx = self.tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            tx.send(SessionEvent::FlushDelta {
                conversation_id: id,
                channel,
            });
        });
        self.buffers_mut(id).set_flush_task(channel, task.abort_handle());
    }

    /// Timer fired: drain the channel into one state mutation.
    fn on_flush_tick(&mut self, id: ConversationId, channel: DeltaChannel) {
        let Some(buffers) = self.buffers.get_mut(&id) else {
            return;
        };
        let Some(content) = buffers.take(channel) else {
            return;
        };

        let state = self.store.get(&id);
        let update = match channel {
            DeltaChannel::Text => {
                let mut acc = state.streaming_assistant_content;
                acc.push_str(&content);
                ConversationUpdate {
                    streaming_assistant_content: Some(acc),
                    ..Default::default()
                }
            }
            DeltaChannel::Thought => {
                let mut acc = state.streaming_thought;
                acc.push_str(&content);
                ConversationUpdate {
                    streaming_thought: Some(acc),
                    ..Default::default()
                }
            }
            DeltaChannel::ToolArgs => {
                let Some(tool) = buffers.tool_args_tool().map(str::to_string) else {
                    return;
                };
                let mut calls = state.active_tool_calls;
                if let Some(call) = calls.get_mut(&tool) {
                    call.partial_arguments = Some(content);
                }
                ConversationUpdate {
                    active_tool_calls: Some(calls),
                    ..Default::default()
                }
            }
        };
        self.store.update(&id, update);
    }

    /// Debounced write-through: at most one save timer per conversation.
    pub(crate) fn schedule_save(&mut self, id: ConversationId) {
        if self.save_timers.contains_key(&id) {
            return;
        }
        let delay = self.config.save_debounce;
        let tx = self.tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            tx.send(SessionEvent::PersistNow {
                conversation_id: id,
            });
        });
        self.save_timers.insert(id, task.abort_handle());
    }

    async fn persist_now(&mut self, id: ConversationId) {
        if let Some(timer) = self.save_timers.remove(&id) {
            timer.abort();
        }
        if !self.store.contains(&id) {
            return;
        }
        let snapshot = StateSnapshot::capture(&self.store.get(&id));
        if let Err(e) = self.durable.save(id, &snapshot).await {
            warn!(%id, error = %e, "debounced save failed");
        }
    }

    /// Force every pending debounced save to disk, e.g. before shutdown or
    /// page hide.
    pub async fn flush_pending_saves(&mut self) {
        let ids: Vec<ConversationId> = self.save_timers.keys().copied().collect();
        for id in ids {
            self.persist_now(id).await;
        }
    }

    async fn ensure_subscribed(&mut self, id: ConversationId) -> Result<()> {
        if !self.transport.is_connected() {
            self.transport.connect().await?;
        }
        if !self.subscribed.contains(&id) {
            self.transport.subscribe(id, self.tx.clone()).await?;
            self.subscribed.insert(id);
        }
        Ok(())
    }

    /// Send a user message and open a stream for the reply. Returns the
    /// submission id, or `None` when the message was refused; refusal reasons
    /// land in the conversation's `error` field.
    pub async fn send_message(&mut self, id: ConversationId, content: String) -> Option<String> {
        let already_streaming = self.store.is_streaming(&id);
        if !already_streaming
            && self.store.streaming_count() >= self.config.max_concurrent_streams
        {
            let limit = TimelineError::StreamLimit(self.config.max_concurrent_streams);
            warn!(%id, "{limit}");
            self.store.update(
                &id,
                ConversationUpdate {
                    error: Some(Some(limit.to_string())),
                    ..Default::default()
                },
            );
            return None;
        }

        // New turn: stale partials from the previous turn must not bleed in.
        self.buffers_mut(id).clear_all();

        if let Err(e) = self.ensure_subscribed(id).await {
            warn!(%id, error = %e, "failed to open stream");
            self.store.update(
                &id,
                ConversationUpdate {
                    error: Some(Some(e.to_string())),
                    is_streaming: Some(false),
                    stream_status: Some(StreamStatus::Idle),
                    agent_phase: Some(AgentPhase::Idle),
                    ..Default::default()
                },
            );
            return None;
        }

        let mut timeline = self.store.get(&id).timeline;
        let wire = WireEvent {
            time_us: now_us(),
            counter: 0,
            msg: WireMsg::UserMessage(UserMessageEvent {
                content: content.clone(),
            }),
        };
        codec::append(&mut timeline, &wire, wire.time_us);
        self.store.update(
            &id,
            ConversationUpdate {
                timeline: Some(timeline),
                is_streaming: Some(true),
                stream_status: Some(StreamStatus::Connecting),
                streaming_assistant_content: Some(String::new()),
                streaming_thought: Some(String::new()),
                agent_phase: Some(AgentPhase::Thinking),
                error: Some(None),
                ..Default::default()
            },
        );

        if let Err(e) = self.transport.send_message(id, content).await {
            warn!(%id, error = %e, "send failed");
            self.store.update(
                &id,
                ConversationUpdate {
                    error: Some(Some(e.to_string())),
                    is_streaming: Some(false),
                    stream_status: Some(StreamStatus::Idle),
                    agent_phase: Some(AgentPhase::Idle),
                    ..Default::default()
                },
            );
            return None;
        }

        self.store.update(
            &id,
            ConversationUpdate {
                stream_status: Some(StreamStatus::Streaming),
                ..Default::default()
            },
        );
        self.schedule_save(id);
        Some(Uuid::new_v4().to_string())
    }

    /// Answer the pending HITL request of `kind`. On acknowledgement the
    /// request entry is marked answered, the pending slot clears, and the
    /// agent resumes (unless the answer was a permission denial). On failure
    /// the pending request stays so the user can retry.
    pub async fn respond(
        &mut self,
        id: ConversationId,
        kind: HitlKind,
        answer: HitlAnswer,
    ) -> Result<()> {
        let state = self.store.get(&id);
        let Some(request_id) = state.pending_request_id(kind).map(str::to_string) else {
            return Err(TimelineError::UnknownRequest {
                kind,
                request_id: "<none pending>".to_string(),
            });
        };

        let sent = match self.ensure_subscribed(id).await {
            Ok(()) => {
                self.transport
                    .respond(id, kind, request_id.clone(), answer.clone())
                    .await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            warn!(%id, request_id, error = %e, "response delivery failed");
            self.store.update(
                &id,
                ConversationUpdate {
                    agent_phase: Some(AgentPhase::Idle),
                    is_streaming: Some(false),
                    stream_status: Some(StreamStatus::Idle),
                    ..Default::default()
                },
            );
            return Err(e);
        }

        self.buffers_mut(id).clear_all();
        let mut timeline = self.store.get(&id).timeline;
        reconcile::mark_answered(&mut timeline, &request_id, &answer);
        let resumes = answer.resumes_agent();

        let mut update = ConversationUpdate {
            timeline: Some(timeline),
            agent_phase: Some(if resumes {
                AgentPhase::Thinking
            } else {
                AgentPhase::Idle
            }),
            is_streaming: Some(resumes),
            stream_status: Some(if resumes {
                StreamStatus::Streaming
            } else {
                StreamStatus::Idle
            }),
            error: Some(None),
            ..Default::default()
        };
        match kind {
            HitlKind::Clarification => update.pending_clarification = Some(None),
            HitlKind::Decision => update.pending_decision = Some(None),
            HitlKind::EnvVar => update.pending_env_var = Some(None),
            HitlKind::Permission => update.pending_permission = Some(None),
        }
        self.store.update(&id, update);
        self.schedule_save(id);
        Ok(())
    }

    pub async fn respond_clarification(&mut self, id: ConversationId, text: String) -> Result<()> {
        self.respond(id, HitlKind::Clarification, HitlAnswer::Text { text })
            .await
    }

    pub async fn respond_decision(&mut self, id: ConversationId, choice: String) -> Result<()> {
        self.respond(id, HitlKind::Decision, HitlAnswer::Choice { choice })
            .await
    }

    /// Confirm an env var was provided out of band. Only the name crosses
    /// the wire; the value never enters the timeline.
    pub async fn provide_env_var(&mut self, id: ConversationId, name: String) -> Result<()> {
        self.respond(id, HitlKind::EnvVar, HitlAnswer::Provided { name })
            .await
    }

    pub async fn respond_permission(&mut self, id: ConversationId, granted: bool) -> Result<()> {
        self.respond(id, HitlKind::Permission, HitlAnswer::Granted { granted })
            .await
    }

    /// Change which conversation is visible. Outgoing buffers are purged;
    /// the incoming conversation is restored from the durable store when it
    /// was evicted; the LRU bound is re-enforced afterwards.
    pub async fn switch_conversation(&mut self, incoming: Option<ConversationId>) {
        if let Some(outgoing) = self.store.active_id()
            && Some(outgoing) != incoming
            && let Some(buffers) = self.buffers.get_mut(&outgoing)
        {
            buffers.clear_all();
        }

        if let Some(id) = incoming
            && !self.store.contains(&id)
        {
            cache::restore(&mut self.store, self.durable.as_ref(), id).await;
        }
        self.store.switch_active(incoming);

        let evicted = cache::enforce_bound(
            &mut self.store,
            self.durable.as_ref(),
            self.config.max_cached_conversations,
        )
        .await;
        for id in evicted {
            self.drop_runtime(&id);
        }
    }

    /// Stop the in-flight stream. The historical timeline is untouched;
    /// transient streaming state and pending tool calls are discarded.
    pub async fn abort_stream(&mut self, id: ConversationId) {
        if let Err(e) = self.transport.abort(id).await {
            warn!(%id, error = %e, "abort request failed");
        }
        self.buffers_mut(id).clear_all();
        self.store.update(
            &id,
            ConversationUpdate {
                is_streaming: Some(false),
                stream_status: Some(StreamStatus::Idle),
                agent_phase: Some(AgentPhase::Idle),
                streaming_assistant_content: Some(String::new()),
                streaming_thought: Some(String::new()),
                active_tool_calls: Some(HashMap::new()),
                pending_tools_stack: Some(Vec::new()),
                ..Default::default()
            },
        );
        self.schedule_save(id);
    }

    /// Make a conversation's messages available in memory: cached state
    /// wins, then the durable store, then the first page from the
    /// historical API.
    pub async fn load_messages(&mut self, id: ConversationId) -> Result<()> {
        if self.store.contains(&id) {
            self.store.touch(&id);
            return Ok(());
        }
        if cache::restore(&mut self.store, self.durable.as_ref(), id).await {
            return Ok(());
        }

        let page = self
            .history
            .fetch_messages(id, self.config.history_page_size, None)
            .await?;
        let merged = history::merge_history(Vec::new(), page.timeline.clone());
        let cursor = history::earliest_cursor(&page, &merged);
        self.store.update(
            &id,
            ConversationUpdate {
                timeline: Some(merged),
                has_earlier: Some(page.has_more),
                earliest_time_us: Some(cursor.map(|k| k.time_us)),
                earliest_counter: Some(cursor.map(|k| k.counter)),
                ..Default::default()
            },
        );
        self.schedule_save(id);
        Ok(())
    }

    /// Fetch the page before the oldest loaded entry. Returns whether any
    /// older entries were added.
    pub async fn load_earlier(&mut self, id: ConversationId) -> Result<bool> {
        let state = self.store.get(&id);
        if !state.has_earlier {
            return Ok(false);
        }
        let before = state
            .earliest_time_us
            .map(|t| OrderKey::new(t, state.earliest_counter.unwrap_or(0)));
        let page = self
            .history
            .fetch_messages(id, self.config.history_page_size, before)
            .await?;
        if page.timeline.is_empty() {
            self.store.update(
                &id,
                ConversationUpdate {
                    has_earlier: Some(false),
                    ..Default::default()
                },
            );
            return Ok(false);
        }

        let cached_len = state.timeline.len();
        let merged = history::merge_history(state.timeline, page.timeline.clone());
        let grew = merged.len() > cached_len;
        let cursor = history::earliest_cursor(&page, &merged);
        self.store.update(
            &id,
            ConversationUpdate {
                timeline: Some(merged),
                has_earlier: Some(page.has_more),
                earliest_time_us: Some(cursor.map(|k| k.time_us)),
                earliest_counter: Some(cursor.map(|k| k.counter)),
                ..Default::default()
            },
        );
        self.schedule_save(id);
        Ok(grew)
    }

    /// Reconcile after a cold start or page reload: merge the newest
    /// historical page over whatever is cached, then re-attach to the live
    /// stream if the agent is still running server-side.
    pub async fn reload_conversation(&mut self, id: ConversationId) -> Result<()> {
        if !self.store.contains(&id) {
            cache::restore(&mut self.store, self.durable.as_ref(), id).await;
        }
        let state = self.store.get(&id);
        let had_cached = !state.timeline.is_empty();

        let page = self
            .history
            .fetch_messages(id, self.config.history_page_size, None)
            .await?;
        let merged = history::merge_history(state.timeline, page.timeline.clone());
        let last_time_us = merged.last().map(|e| e.order.time_us);

        let mut update = ConversationUpdate {
            timeline: Some(merged),
            ..Default::default()
        };
        if !had_cached {
            let cursor = update
                .timeline
                .as_deref()
                .and_then(|t| history::earliest_cursor(&page, t));
            update.has_earlier = Some(page.has_more);
            update.earliest_time_us = Some(cursor.map(|k| k.time_us));
            update.earliest_counter = Some(cursor.map(|k| k.counter));
        }
        self.store.update(&id, update);
        self.schedule_save(id);

        let status = match self
            .history
            .execution_status(id, true, last_time_us)
            .await
        {
            Ok(status) => status,
            Err(e) => {
                warn!(%id, error = %e, "execution status check failed");
                return Ok(());
            }
        };
        if status.is_running {
            info!(%id, "agent still running; re-attaching to stream");
            self.ensure_subscribed(id).await?;
            self.store.update(
                &id,
                ConversationUpdate {
                    is_streaming: Some(true),
                    stream_status: Some(StreamStatus::Streaming),
                    agent_phase: Some(AgentPhase::Thinking),
                    ..Default::default()
                },
            );
        }
        Ok(())
    }

    /// Remove every trace of a conversation: in-memory state, buffers,
    /// timers, subscription and the durable document.
    pub async fn delete_conversation(&mut self, id: ConversationId) {
        if self.store.is_streaming(&id)
            && let Err(e) = self.transport.abort(id).await
        {
            warn!(%id, error = %e, "abort during delete failed");
        }
        if self.store.active_id() == Some(id) {
            self.store.switch_active(None);
        }
        self.store.remove(&id);
        self.drop_runtime(&id);
        self.subscribed.remove(&id);
        if let Err(e) = self.durable.delete(id).await {
            warn!(%id, error = %e, "failed to delete durable state");
        }
    }

    pub fn pin_entry(&mut self, id: ConversationId, entry_id: &str) {
        let mut pinned = self.store.get(&id).pinned;
        pinned.insert(entry_id.to_string());
        self.store.update(
            &id,
            ConversationUpdate {
                pinned: Some(pinned),
                ..Default::default()
            },
        );
        self.schedule_save(id);
    }

    pub fn unpin_entry(&mut self, id: ConversationId, entry_id: &str) {
        let mut pinned = self.store.get(&id).pinned;
        if pinned.remove(entry_id) {
            self.store.update(
                &id,
                ConversationUpdate {
                    pinned: Some(pinned),
                    ..Default::default()
                },
            );
            self.schedule_save(id);
        }
    }

    fn drop_runtime(&mut self, id: &ConversationId) {
        if let Some(mut buffers) = self.buffers.remove(id) {
            buffers.clear_all();
        }
        if let Some(timer) = self.save_timers.remove(id) {
            timer.abort();
        }
    }
}
