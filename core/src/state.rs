//! Per-conversation authoritative state and the typed partial-update applied
//! through the store's single mutation surface.

use std::collections::BTreeSet;
use std::collections::HashMap;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use timeline_protocol::ClarificationAskedEvent;
use timeline_protocol::DecisionAskedEvent;
use timeline_protocol::EnvVarRequestedEvent;
use timeline_protocol::HitlKind;
use timeline_protocol::HitlSummary;
use timeline_protocol::OrderKey;
use timeline_protocol::PermissionAskedEvent;
use timeline_protocol::TaskState;
use timeline_protocol::TimelineEvent;
use timeline_protocol::WorkPlan;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    #[default]
    Idle,
    Connecting,
    Streaming,
    Error,
}

/// Where the agent currently is in its loop. `AwaitingInput` is
/// terminal-until-user-response: only an explicit respond action leaves it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentPhase {
    #[default]
    Idle,
    Thinking,
    Preparing,
    Acting,
    Observing,
    AwaitingInput,
    Retrying,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Preparing,
    Running,
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallState {
    pub status: ToolStatus,
    pub arguments: Option<Value>,
    /// Latest buffered argument snapshot while the call is still streaming.
    pub partial_arguments: Option<String>,
    pub started_at_us: i64,
    pub completed_at_us: Option<i64>,
    pub output: Option<Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CostTracking {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

impl CostTracking {
    pub fn add(&mut self, input_tokens: u64, output_tokens: u64, cost_usd: Option<f64>) {
        self.input_tokens += input_tokens;
        self.output_tokens += output_tokens;
        if let Some(cost) = cost_usd {
            self.cost_usd += cost;
        }
    }
}

/// A pending HITL request together with the order key it was raised at, so
/// the derived summary can pick the newest among the four kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pending<T> {
    pub order: OrderKey,
    pub request: T,
}

impl<T> Pending<T> {
    pub fn new(order: OrderKey, request: T) -> Self {
        Self { order, request }
    }
}

/// Authoritative state for one conversation. Created with defaults on first
/// reference; mutated exclusively through [`crate::store::ConversationStore`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationState {
    pub timeline: Vec<TimelineEvent>,
    pub is_streaming: bool,
    pub stream_status: StreamStatus,
    /// Transient accumulated assistant text for the in-flight turn. Never
    /// persisted.
    pub streaming_assistant_content: String,
    /// Transient accumulated reasoning for the in-flight turn. Never
    /// persisted.
    pub streaming_thought: String,
    pub active_tool_calls: HashMap<String, ToolCallState>,
    /// LIFO of in-flight tool names; popped when a result frame arrives
    /// without a tool name.
    pub pending_tools_stack: Vec<String>,
    pub agent_phase: AgentPhase,
    pub pending_clarification: Option<Pending<ClarificationAskedEvent>>,
    pub pending_decision: Option<Pending<DecisionAskedEvent>>,
    pub pending_env_var: Option<Pending<EnvVarRequestedEvent>>,
    pub pending_permission: Option<Pending<PermissionAskedEvent>>,
    /// Derived from the four pending fields; recomputed on every update that
    /// touches one of them.
    pub pending_hitl: Option<HitlSummary>,
    pub work_plan: Option<WorkPlan>,
    pub tasks: Vec<TaskState>,
    pub cost: CostTracking,
    pub has_earlier: bool,
    pub earliest_time_us: Option<i64>,
    pub earliest_counter: Option<u32>,
    pub pinned: BTreeSet<String>,
    pub error: Option<String>,
}

impl ConversationState {
    pub fn recompute_hitl_summary(&mut self) {
        let mut newest: Option<(OrderKey, HitlSummary)> = None;
        let mut consider = |order: OrderKey, summary: HitlSummary| match &newest {
            Some((existing, _)) if *existing >= order => {}
            _ => newest = Some((order, summary)),
        };

        if let Some(p) = &self.pending_clarification {
            consider(
                p.order,
                HitlSummary {
                    kind: HitlKind::Clarification,
                    request_id: p.request.request_id.clone(),
                    prompt: p.request.question.clone(),
                },
            );
        }
        if let Some(p) = &self.pending_decision {
            consider(
                p.order,
                HitlSummary {
                    kind: HitlKind::Decision,
                    request_id: p.request.request_id.clone(),
                    prompt: p.request.prompt.clone(),
                },
            );
        }
        if let Some(p) = &self.pending_env_var {
            consider(
                p.order,
                HitlSummary {
                    kind: HitlKind::EnvVar,
                    request_id: p.request.request_id.clone(),
                    prompt: p.request.name.clone(),
                },
            );
        }
        if let Some(p) = &self.pending_permission {
            consider(
                p.order,
                HitlSummary {
                    kind: HitlKind::Permission,
                    request_id: p.request.request_id.clone(),
                    prompt: p.request.action.clone(),
                },
            );
        }

        self.pending_hitl = newest.map(|(_, summary)| summary);
    }

    /// The pending request id for `kind`, if one is awaiting a response.
    pub fn pending_request_id(&self, kind: HitlKind) -> Option<&str> {
        match kind {
            HitlKind::Clarification => self
                .pending_clarification
                .as_ref()
                .map(|p| p.request.request_id.as_str()),
            HitlKind::Decision => self
                .pending_decision
                .as_ref()
                .map(|p| p.request.request_id.as_str()),
            HitlKind::EnvVar => self
                .pending_env_var
                .as_ref()
                .map(|p| p.request.request_id.as_str()),
            HitlKind::Permission => self
                .pending_permission
                .as_ref()
                .map(|p| p.request.request_id.as_str()),
        }
    }
}

/// Typed partial update. `None` leaves a field untouched; `Some` replaces it
/// wholesale (map-valued fields included — they are never merged key-by-key).
#[derive(Debug, Default)]
pub struct ConversationUpdate {
    pub timeline: Option<Vec<TimelineEvent>>,
    pub is_streaming: Option<bool>,
    pub stream_status: Option<StreamStatus>,
    pub streaming_assistant_content: Option<String>,
    pub streaming_thought: Option<String>,
    pub active_tool_calls: Option<HashMap<String, ToolCallState>>,
    pub pending_tools_stack: Option<Vec<String>>,
    pub agent_phase: Option<AgentPhase>,
    pub pending_clarification: Option<Option<Pending<ClarificationAskedEvent>>>,
    pub pending_decision: Option<Option<Pending<DecisionAskedEvent>>>,
    pub pending_env_var: Option<Option<Pending<EnvVarRequestedEvent>>>,
    pub pending_permission: Option<Option<Pending<PermissionAskedEvent>>>,
    pub work_plan: Option<Option<WorkPlan>>,
    pub tasks: Option<Vec<TaskState>>,
    pub cost: Option<CostTracking>,
    pub has_earlier: Option<bool>,
    pub earliest_time_us: Option<Option<i64>>,
    pub earliest_counter: Option<Option<u32>>,
    pub pinned: Option<BTreeSet<String>>,
    pub error: Option<Option<String>>,
}

impl ConversationUpdate {
    pub fn touches_pending(&self) -> bool {
        self.pending_clarification.is_some()
            || self.pending_decision.is_some()
            || self.pending_env_var.is_some()
            || self.pending_permission.is_some()
    }

    pub fn apply_to(self, state: &mut ConversationState) {
        let recompute = self.touches_pending();

        if let Some(v) = self.timeline {
            state.timeline = v;
        }
        if let Some(v) = self.is_streaming {
            state.is_streaming = v;
        }
        if let Some(v) = self.stream_status {
            state.stream_status = v;
        }
        if let Some(v) = self.streaming_assistant_content {
            state.streaming_assistant_content = v;
        }
        if let Some(v) = self.streaming_thought {
            state.streaming_thought = v;
        }
        if let Some(v) = self.active_tool_calls {
            state.active_tool_calls = v;
        }
        if let Some(v) = self.pending_tools_stack {
            state.pending_tools_stack = v;
        }
        if let Some(v) = self.agent_phase {
            state.agent_phase = v;
        }
        if let Some(v) = self.pending_clarification {
            state.pending_clarification = v;
        }
        if let Some(v) = self.pending_decision {
            state.pending_decision = v;
        }
        if let Some(v) = self.pending_env_var {
            state.pending_env_var = v;
        }
        if let Some(v) = self.pending_permission {
            state.pending_permission = v;
        }
        if let Some(v) = self.work_plan {
            state.work_plan = v;
        }
        if let Some(v) = self.tasks {
            state.tasks = v;
        }
        if let Some(v) = self.cost {
            state.cost = v;
        }
        if let Some(v) = self.has_earlier {
            state.has_earlier = v;
        }
        if let Some(v) = self.earliest_time_us {
            state.earliest_time_us = v;
        }
        if let Some(v) = self.earliest_counter {
            state.earliest_counter = v;
        }
        if let Some(v) = self.pinned {
            state.pinned = v;
        }
        if let Some(v) = self.error {
            state.error = v;
        }

        if recompute {
            state.recompute_hitl_summary();
        }
    }
}
