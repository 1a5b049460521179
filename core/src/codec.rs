//! Pure conversion of wire events into canonical timeline entries.
//!
//! The codec never assigns order on its own: the caller provides the order
//! key (taken from the wire envelope, or synthesized strictly above the last
//! entry when appending). Unsupported event types convert to `None` and must
//! not affect the ordering of subsequent entries.

use timeline_protocol::HitlAnswer;
use timeline_protocol::HitlKind;
use timeline_protocol::HitlRequestItem;
use timeline_protocol::HitlResponseItem;
use timeline_protocol::OrderKey;
use timeline_protocol::TimelineEvent;
use timeline_protocol::TimelineItem;
use timeline_protocol::WireEvent;
use timeline_protocol::WireMsg;
use timeline_protocol::WorkPlan;
use tracing::warn;
use uuid::Uuid;

/// Convert one wire payload into zero-or-one timeline entries.
///
/// High-frequency partials (`thought_delta`, `act_delta`), bookkeeping events
/// (`cost_update`, `complete`) and unknown types yield `None`; they mutate
/// conversation state through other paths or not at all.
pub fn to_timeline_event(
    msg: &WireMsg,
    order: OrderKey,
    received_at_us: i64,
) -> Option<TimelineEvent> {
    let item = match msg {
        WireMsg::UserMessage(ev) => TimelineItem::UserMessage {
            content: ev.content.clone(),
        },
        WireMsg::AssistantMessage(ev) => TimelineItem::AssistantMessage {
            content: ev.content.clone(),
        },
        WireMsg::Thought(ev) => TimelineItem::Thought {
            content: ev.content.clone(),
        },
        WireMsg::TextStart(_) => TimelineItem::TextStart,
        WireMsg::TextDelta(ev) => TimelineItem::TextDelta {
            delta: ev.delta.clone(),
        },
        WireMsg::TextEnd(ev) => TimelineItem::TextEnd {
            content: ev.content.clone(),
        },
        WireMsg::Act(ev) => TimelineItem::ToolUse {
            tool_name: ev.tool_name.clone(),
            input: ev.tool_input.clone(),
        },
        WireMsg::Observe(ev) => TimelineItem::ToolResult {
            tool_name: ev.tool_name.clone(),
            output: ev.tool_output.clone(),
            success: ev.success,
        },
        WireMsg::WorkPlan(ev) => TimelineItem::WorkPlan(WorkPlan {
            name: ev.name.clone(),
            plan: ev.plan.clone(),
        }),
        WireMsg::StepStart(ev) => TimelineItem::StepStart {
            index: ev.index,
            title: ev.title.clone(),
        },
        WireMsg::StepEnd(ev) => TimelineItem::StepEnd {
            index: ev.index,
            status: ev.status,
        },
        WireMsg::ClarificationAsked(ev) => TimelineItem::HitlRequest(HitlRequestItem {
            kind: HitlKind::Clarification,
            request_id: ev.request_id.clone(),
            prompt: ev.question.clone(),
            options: ev.options.clone(),
            answered: false,
            answer: None,
        }),
        WireMsg::DecisionAsked(ev) => TimelineItem::HitlRequest(HitlRequestItem {
            kind: HitlKind::Decision,
            request_id: ev.request_id.clone(),
            prompt: ev.prompt.clone(),
            options: ev.choices.clone(),
            answered: false,
            answer: None,
        }),
        WireMsg::EnvVarRequested(ev) => TimelineItem::HitlRequest(HitlRequestItem {
            kind: HitlKind::EnvVar,
            request_id: ev.request_id.clone(),
            prompt: ev.name.clone(),
            options: Vec::new(),
            answered: false,
            answer: None,
        }),
        WireMsg::PermissionAsked(ev) => TimelineItem::HitlRequest(HitlRequestItem {
            kind: HitlKind::Permission,
            request_id: ev.request_id.clone(),
            prompt: ev.action.clone(),
            options: Vec::new(),
            answered: false,
            answer: None,
        }),
        WireMsg::ClarificationAnswered(ev) => TimelineItem::HitlResponse(HitlResponseItem {
            kind: HitlKind::Clarification,
            request_id: ev.request_id.clone(),
            answer: HitlAnswer::Text {
                text: ev.answer.clone(),
            },
        }),
        WireMsg::DecisionReplied(ev) => TimelineItem::HitlResponse(HitlResponseItem {
            kind: HitlKind::Decision,
            request_id: ev.request_id.clone(),
            answer: HitlAnswer::Choice {
                choice: ev.choice.clone(),
            },
        }),
        WireMsg::EnvVarProvided(ev) => TimelineItem::HitlResponse(HitlResponseItem {
            kind: HitlKind::EnvVar,
            request_id: ev.request_id.clone(),
            answer: HitlAnswer::Provided {
                name: ev.name.clone(),
            },
        }),
        WireMsg::PermissionGranted(ev) => TimelineItem::HitlResponse(HitlResponseItem {
            kind: HitlKind::Permission,
            request_id: ev.request_id.clone(),
            answer: HitlAnswer::Granted {
                granted: ev.granted,
            },
        }),
        WireMsg::ArtifactCreated(ev) => TimelineItem::Artifact {
            artifact_id: ev.artifact_id.clone(),
            name: ev.name.clone(),
            kind: ev.kind.clone(),
            uri: ev.uri.clone(),
        },
        WireMsg::TaskStart(ev) => TimelineItem::TaskStart {
            task_id: ev.task_id.clone(),
            title: ev.title.clone(),
        },
        WireMsg::TaskComplete(ev) => TimelineItem::TaskComplete {
            task_id: ev.task_id.clone(),
            status: ev.status,
        },
        WireMsg::SubagentStart(ev) => TimelineItem::SubagentStart {
            subagent_id: ev.subagent_id.clone(),
            task: ev.task.clone(),
        },
        WireMsg::SubagentComplete(ev) => TimelineItem::SubagentComplete {
            subagent_id: ev.subagent_id.clone(),
            status: ev.status,
            summary: ev.summary.clone(),
        },
        WireMsg::ChainStart(ev) => TimelineItem::ChainStart {
            chain_id: ev.chain_id.clone(),
            length: ev.length,
        },
        WireMsg::ChainEnd(ev) => TimelineItem::ChainEnd {
            chain_id: ev.chain_id.clone(),
        },
        WireMsg::Error(ev) => TimelineItem::Error {
            message: ev.message.clone(),
        },
        WireMsg::ThoughtDelta(_)
        | WireMsg::ActDelta(_)
        | WireMsg::CostUpdate(_)
        | WireMsg::Complete(_)
        | WireMsg::Unknown => return None,
    };

    Some(TimelineEvent {
        id: Uuid::new_v4().to_string(),
        order,
        received_at_us,
        item,
    })
}

/// The order key to assign to the next appended entry: the wire event's own
/// key, bumped to stay strictly greater than the last entry's.
pub fn next_order_key(timeline: &[TimelineEvent], wire_key: OrderKey) -> OrderKey {
    match timeline.last() {
        Some(last) if wire_key <= last.order => last.order.successor(),
        _ => wire_key,
    }
}

/// Convert and append, preserving the strict-ordering invariant. Returns the
/// appended entry's id, or `None` when the event does not map to an entry.
pub fn append(
    timeline: &mut Vec<TimelineEvent>,
    event: &WireEvent,
    received_at_us: i64,
) -> Option<String> {
    let order = next_order_key(timeline, event.order_key());
    let entry = to_timeline_event(&event.msg, order, received_at_us)?;
    let id = entry.id.clone();
    timeline.push(entry);
    Some(id)
}

/// Defensive re-sort by order key plus de-duplication by entry id, applied on
/// every historical load/merge rather than trusting the API's declared
/// order. Detected disorder is logged, not fatal.
pub fn sort_and_dedup(timeline: &mut Vec<TimelineEvent>) {
    let sorted = timeline.windows(2).all(|w| w[0].order <= w[1].order);
    if !sorted {
        warn!("timeline arrived out of order; re-sorting by order key");
        timeline.sort_by_key(|e| e.order);
    }
    let mut seen = std::collections::HashSet::new();
    timeline.retain(|e| seen.insert(e.id.clone()));
}
