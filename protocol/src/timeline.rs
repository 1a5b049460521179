//! Canonical timeline entries: the durable-shaped sequence downstream UI
//! renders. Entries are produced from wire events by the codec and ordered by
//! [`OrderKey`] within one conversation.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::OrderKey;
use crate::hitl::HitlAnswer;
use crate::hitl::HitlKind;
use crate::plan::StepStatus;
use crate::plan::TaskStatus;
use crate::plan::WorkPlan;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEvent {
    /// Unique within a session; never collides after a merge.
    pub id: String,
    pub order: OrderKey,
    /// Client receipt time in microseconds, display-only.
    pub received_at_us: i64,
    pub item: TimelineItem,
}

impl TimelineEvent {
    /// Streaming-only entries that are stripped when the turn completes,
    /// since the server never persists them.
    pub fn is_transient_text(&self) -> bool {
        matches!(
            self.item,
            TimelineItem::TextStart | TimelineItem::TextDelta { .. } | TimelineItem::TextEnd { .. }
        )
    }

    /// The HITL request id this entry carries, if it is a request or
    /// response entry.
    pub fn hitl_request_id(&self) -> Option<&str> {
        match &self.item {
            TimelineItem::HitlRequest(req) => Some(&req.request_id),
            TimelineItem::HitlResponse(resp) => Some(&resp.request_id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TimelineItem {
    UserMessage {
        content: String,
    },
    AssistantMessage {
        content: String,
    },
    Thought {
        content: String,
    },

    TextStart,
    TextDelta {
        delta: String,
    },
    TextEnd {
        #[serde(default)]
        content: Option<String>,
    },

    ToolUse {
        tool_name: String,
        #[serde(default)]
        input: Option<Value>,
    },
    ToolResult {
        #[serde(default)]
        tool_name: Option<String>,
        #[serde(default)]
        output: Option<Value>,
        success: bool,
    },

    WorkPlan(WorkPlan),
    StepStart {
        index: u32,
        title: String,
    },
    StepEnd {
        index: u32,
        status: StepStatus,
    },

    HitlRequest(HitlRequestItem),
    HitlResponse(HitlResponseItem),

    Artifact {
        artifact_id: String,
        name: String,
        #[serde(default)]
        kind: Option<String>,
        #[serde(default)]
        uri: Option<String>,
    },
    TaskStart {
        task_id: String,
        title: String,
    },
    TaskComplete {
        task_id: String,
        status: TaskStatus,
    },
    SubagentStart {
        subagent_id: String,
        task: String,
    },
    SubagentComplete {
        subagent_id: String,
        status: TaskStatus,
        #[serde(default)]
        summary: Option<String>,
    },
    ChainStart {
        chain_id: String,
        #[serde(default)]
        length: Option<u32>,
    },
    ChainEnd {
        chain_id: String,
    },

    Error {
        message: String,
    },
}

/// A HITL request entry. After reconciliation this is the single visible
/// entry for its `request_id`, carrying the answer fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HitlRequestItem {
    pub kind: HitlKind,
    pub request_id: String,
    pub prompt: String,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub answered: bool,
    #[serde(default)]
    pub answer: Option<HitlAnswer>,
}

/// A standalone HITL response entry as converted from the wire. Removed from
/// the timeline once merged into its request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HitlResponseItem {
    pub kind: HitlKind,
    pub request_id: String,
    pub answer: HitlAnswer,
}
