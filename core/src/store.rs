//! The conversation state store and the active-conversation mirror.
//!
//! The store is the sole mutation surface for all event handlers: reads via
//! [`ConversationStore::get`], writes via [`ConversationStore::update`].
//! When the updated conversation is the active one, the same call atomically
//! re-projects the flat [`ActiveSnapshot`] so simple UI bindings stay
//! current without consulting the per-conversation map.

use lru::LruCache;
use timeline_protocol::ConversationId;
use timeline_protocol::HitlSummary;
use timeline_protocol::TaskState;
use timeline_protocol::TimelineEvent;
use timeline_protocol::WorkPlan;
use tracing::debug;

use crate::state::AgentPhase;
use crate::state::ConversationState;
use crate::state::ConversationUpdate;
use crate::state::CostTracking;
use crate::state::StreamStatus;

/// Denormalized projection of the one currently visible conversation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActiveSnapshot {
    pub conversation_id: Option<ConversationId>,
    pub timeline: Vec<TimelineEvent>,
    pub is_streaming: bool,
    pub stream_status: StreamStatus,
    pub streaming_assistant_content: String,
    pub streaming_thought: String,
    pub agent_phase: AgentPhase,
    pub pending_hitl: Option<HitlSummary>,
    pub work_plan: Option<WorkPlan>,
    pub tasks: Vec<TaskState>,
    pub cost: CostTracking,
    pub error: Option<String>,
}

impl ActiveSnapshot {
    fn project(id: ConversationId, state: &ConversationState) -> Self {
        Self {
            conversation_id: Some(id),
            timeline: state.timeline.clone(),
            is_streaming: state.is_streaming,
            stream_status: state.stream_status,
            streaming_assistant_content: state.streaming_assistant_content.clone(),
            streaming_thought: state.streaming_thought.clone(),
            agent_phase: state.agent_phase,
            pending_hitl: state.pending_hitl.clone(),
            work_plan: state.work_plan.clone(),
            tasks: state.tasks.clone(),
            cost: state.cost,
            error: state.error.clone(),
        }
    }

    fn fold_into(&self, state: &mut ConversationState) {
        state.timeline = self.timeline.clone();
        state.is_streaming = self.is_streaming;
        state.stream_status = self.stream_status;
        state.streaming_assistant_content = self.streaming_assistant_content.clone();
        state.streaming_thought = self.streaming_thought.clone();
        state.agent_phase = self.agent_phase;
        state.pending_hitl = self.pending_hitl.clone();
        state.work_plan = self.work_plan.clone();
        state.tasks = self.tasks.clone();
        state.cost = self.cost;
        state.error = self.error.clone();
    }
}

pub struct ConversationStore {
    states: LruCache<ConversationId, ConversationState>,
    active_id: Option<ConversationId>,
    snapshot: ActiveSnapshot,
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationStore {
    pub fn new() -> Self {
        Self {
            states: LruCache::unbounded(),
            active_id: None,
            snapshot: ActiveSnapshot::default(),
        }
    }

    /// Existing state or a freshly constructed default. Never inserts.
    pub fn get(&self, id: &ConversationId) -> ConversationState {
        self.states.peek(id).cloned().unwrap_or_default()
    }

    pub fn contains(&self, id: &ConversationId) -> bool {
        self.states.contains(id)
    }

    pub fn is_streaming(&self, id: &ConversationId) -> bool {
        self.states.peek(id).is_some_and(|s| s.is_streaming)
    }

    pub fn active_id(&self) -> Option<ConversationId> {
        self.active_id
    }

    /// How many conversations currently hold a live stream.
    pub fn streaming_count(&self) -> usize {
        self.states.iter().filter(|(_, s)| s.is_streaming).count()
    }

    pub fn snapshot(&self) -> &ActiveSnapshot {
        &self.snapshot
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Apply a partial update and, if `id` is the active conversation,
    /// re-project the mirror in the same call. No intermediate state is
    /// observable between the two writes.
    pub fn update(&mut self, id: &ConversationId, update: ConversationUpdate) {
        let state = self.states.get_or_insert_mut(*id, ConversationState::default);
        update.apply_to(state);
        if self.active_id == Some(*id) {
            self.snapshot = ActiveSnapshot::project(*id, state);
        }
    }

    /// Insert (or overwrite) a full state, e.g. when restoring from the
    /// durable store. Mirrors like `update` does.
    pub fn insert(&mut self, id: ConversationId, state: ConversationState) {
        if self.active_id == Some(id) {
            self.snapshot = ActiveSnapshot::project(id, &state);
        }
        self.states.put(id, state);
    }

    /// Mark `id` most-recently-touched without mutating it.
    pub fn touch(&mut self, id: &ConversationId) {
        self.states.promote(id);
    }

    /// Conversation ids from least- to most-recently touched.
    pub fn ids_lru_first(&self) -> Vec<ConversationId> {
        // LruCache iterates MRU-first.
        let mut ids: Vec<ConversationId> = self.states.iter().map(|(id, _)| *id).collect();
        ids.reverse();
        ids
    }

    pub fn remove(&mut self, id: &ConversationId) -> Option<ConversationState> {
        if self.active_id == Some(*id) {
            self.active_id = None;
            self.snapshot = ActiveSnapshot::default();
        }
        self.states.pop(id)
    }

    /// Switch the visible conversation. Folds the outgoing snapshot back
    /// into its map entry, then unfolds the incoming state — or resets the
    /// flat fields to defaults so the previous conversation's content never
    /// leaks into a fresh one.
    pub fn switch_active(&mut self, incoming: Option<ConversationId>) {
        if let Some(outgoing) = self.active_id
            && let Some(state) = self.states.get_mut(&outgoing)
        {
            self.snapshot.fold_into(state);
        }

        self.active_id = incoming;
        self.snapshot = match incoming {
            Some(id) => {
                self.states.promote(&id);
                match self.states.peek(&id) {
                    Some(state) => ActiveSnapshot::project(id, state),
                    None => ActiveSnapshot {
                        conversation_id: Some(id),
                        ..Default::default()
                    },
                }
            }
            None => ActiveSnapshot::default(),
        };
        debug!(active = ?incoming, "switched active conversation");
    }
}
