//! The closed union of events the transport can deliver.
//!
//! Every event carries the origin-server order key (`time_us`, `counter`) in
//! its envelope; the payload is an internally tagged union so a server can
//! add new event types without breaking older clients (`Unknown` catch-all).

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::plan::PlanStep;
use crate::plan::StepStatus;
use crate::plan::TaskStatus;

/// One unit of agent progress as delivered by the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireEvent {
    pub time_us: i64,
    #[serde(default)]
    pub counter: u32,
    pub msg: WireMsg,
}

impl WireEvent {
    pub fn order_key(&self) -> crate::OrderKey {
        crate::OrderKey::new(self.time_us, self.counter)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, strum_macros::AsRefStr)]
#[serde(tag = "type", rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum WireMsg {
    UserMessage(UserMessageEvent),
    AssistantMessage(AssistantMessageEvent),

    TextStart(TextStartEvent),
    TextDelta(TextDeltaEvent),
    TextEnd(TextEndEvent),

    Thought(ThoughtEvent),
    ThoughtDelta(ThoughtDeltaEvent),

    Act(ActEvent),
    ActDelta(ActDeltaEvent),
    Observe(ObserveEvent),

    WorkPlan(WorkPlanEvent),
    StepStart(StepStartEvent),
    StepEnd(StepEndEvent),

    ClarificationAsked(ClarificationAskedEvent),
    ClarificationAnswered(ClarificationAnsweredEvent),
    DecisionAsked(DecisionAskedEvent),
    DecisionReplied(DecisionRepliedEvent),
    EnvVarRequested(EnvVarRequestedEvent),
    EnvVarProvided(EnvVarProvidedEvent),
    PermissionAsked(PermissionAskedEvent),
    PermissionGranted(PermissionGrantedEvent),

    ArtifactCreated(ArtifactCreatedEvent),
    TaskStart(TaskStartEvent),
    TaskComplete(TaskCompleteEvent),
    SubagentStart(SubagentStartEvent),
    SubagentComplete(SubagentCompleteEvent),
    ChainStart(ChainStartEvent),
    ChainEnd(ChainEndEvent),

    CostUpdate(CostUpdateEvent),
    Complete(CompleteEvent),
    Error(ErrorEvent),

    /// Forward-compatibility catch-all for event types this client does not
    /// know about. Dropped by the codec.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserMessageEvent {
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantMessageEvent {
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextStartEvent {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextDeltaEvent {
    pub delta: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextEndEvent {
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThoughtEvent {
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThoughtDeltaEvent {
    pub delta: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActEvent {
    pub tool_name: String,
    #[serde(default)]
    pub tool_input: Option<Value>,
}

/// Growing tool-argument JSON. `partial_input` is the latest accumulated
/// snapshot, not an increment; merging is last-write-wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActDeltaEvent {
    pub tool_name: String,
    pub partial_input: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObserveEvent {
    /// Some transports omit the tool name on the result frame; the dispatcher
    /// then pops the pending-tools stack instead.
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub tool_output: Option<Value>,
    #[serde(default = "default_true")]
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkPlanEvent {
    #[serde(default)]
    pub name: Option<String>,
    pub plan: Vec<PlanStep>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepStartEvent {
    pub index: u32,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepEndEvent {
    pub index: u32,
    #[serde(default)]
    pub status: StepStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClarificationAskedEvent {
    pub request_id: String,
    pub question: String,
    #[serde(default)]
    pub options: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClarificationAnsweredEvent {
    pub request_id: String,
    pub answer: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionAskedEvent {
    pub request_id: String,
    pub prompt: String,
    pub choices: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRepliedEvent {
    pub request_id: String,
    pub choice: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvVarRequestedEvent {
    pub request_id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// Confirms an env var was supplied. The value itself never crosses this
/// protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvVarProvidedEvent {
    pub request_id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionAskedEvent {
    pub request_id: String,
    pub action: String,
    #[serde(default)]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionGrantedEvent {
    pub request_id: String,
    pub granted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactCreatedEvent {
    pub artifact_id: String,
    pub name: String,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub uri: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStartEvent {
    pub task_id: String,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskCompleteEvent {
    pub task_id: String,
    #[serde(default = "TaskCompleteEvent::default_status")]
    pub status: TaskStatus,
}

impl TaskCompleteEvent {
    fn default_status() -> TaskStatus {
        TaskStatus::Completed
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubagentStartEvent {
    pub subagent_id: String,
    pub task: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubagentCompleteEvent {
    pub subagent_id: String,
    #[serde(default = "TaskCompleteEvent::default_status")]
    pub status: TaskStatus,
    #[serde(default)]
    pub summary: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainStartEvent {
    pub chain_id: String,
    #[serde(default)]
    pub length: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainEndEvent {
    pub chain_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostUpdateEvent {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default)]
    pub cost_usd: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompleteEvent {
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub message: String,
    /// Rate-limit-class errors are transient: the transport retries on its
    /// own and the UI shows a retry affordance.
    #[serde(default)]
    pub retryable: bool,
}

fn default_true() -> bool {
    true
}
