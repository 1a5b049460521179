//! Live wire-event dispatch.
//!
//! Each handler is bound to the conversation id the event arrived for. A
//! background conversation accumulates state exactly as the visible one does;
//! the store decides whether the active mirror is re-projected. Handlers are
//! synchronous: anything that needs a timer posts back into the event loop.

use std::collections::HashMap;

use serde_json::Value;
use timeline_protocol::ActEvent;
use timeline_protocol::AssistantMessageEvent;
use timeline_protocol::ConversationId;
use timeline_protocol::HitlAnswer;
use timeline_protocol::HitlKind;
use timeline_protocol::ObserveEvent;
use timeline_protocol::OrderKey;
use timeline_protocol::TaskState;
use timeline_protocol::TaskStatus;
use timeline_protocol::TimelineEvent;
use timeline_protocol::WireEvent;
use timeline_protocol::WireMsg;
use timeline_protocol::WorkPlan;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use crate::coalescer::DeltaChannel;
use crate::codec;
use crate::reconcile;
use crate::session::Session;
use crate::state::AgentPhase;
use crate::state::ConversationUpdate;
use crate::state::Pending;
use crate::state::StreamStatus;
use crate::state::ToolCallState;
use crate::state::ToolStatus;
use crate::util::now_us;

impl Session {
    pub fn handle_wire_event(&mut self, id: ConversationId, event: WireEvent) {
        trace!(%id, event = event.msg.as_ref(), "wire event");
        let received = now_us();
        match &event.msg {
            WireMsg::UserMessage(_)
            | WireMsg::ArtifactCreated(_)
            | WireMsg::StepStart(_)
            | WireMsg::SubagentStart(_)
            | WireMsg::SubagentComplete(_)
            | WireMsg::ChainStart(_)
            | WireMsg::ChainEnd(_) => {
                let mut timeline = self.store.get(&id).timeline;
                codec::append(&mut timeline, &event, received);
                self.store.update(
                    &id,
                    ConversationUpdate {
                        timeline: Some(timeline),
                        ..Default::default()
                    },
                );
            }

            WireMsg::AssistantMessage(ev) => self.on_assistant_message(id, &event, ev, received),
            WireMsg::TextStart(_) => self.on_text_start(id, &event, received),
            WireMsg::TextDelta(ev) => self.on_text_delta(id, &ev.delta),
            WireMsg::TextEnd(ev) => self.on_text_end(id, &event, ev.content.clone(), received),
            WireMsg::Thought(ev) => self.on_thought(id, &event, &ev.content, received),
            WireMsg::ThoughtDelta(ev) => self.on_thought_delta(id, &ev.delta),
            WireMsg::Act(ev) => self.on_act(id, &event, ev, received),
            WireMsg::ActDelta(ev) => {
                self.on_act_delta(id, &ev.tool_name, &ev.partial_input, received);
            }
            WireMsg::Observe(ev) => self.on_observe(id, &event, ev, received),
            WireMsg::WorkPlan(ev) => {
                let mut timeline = self.store.get(&id).timeline;
                codec::append(&mut timeline, &event, received);
                self.store.update(
                    &id,
                    ConversationUpdate {
                        timeline: Some(timeline),
                        work_plan: Some(Some(WorkPlan {
                            name: ev.name.clone(),
                            plan: ev.plan.clone(),
                        })),
                        ..Default::default()
                    },
                );
            }
            WireMsg::StepEnd(ev) => {
                let state = self.store.get(&id);
                let mut timeline = state.timeline;
                codec::append(&mut timeline, &event, received);
                let mut work_plan = state.work_plan;
                if let Some(plan) = &mut work_plan
                    && let Some(step) = plan.plan.get_mut(ev.index as usize)
                {
                    step.status = ev.status;
                }
                self.store.update(
                    &id,
                    ConversationUpdate {
                        timeline: Some(timeline),
                        work_plan: Some(work_plan),
                        ..Default::default()
                    },
                );
            }

            WireMsg::ClarificationAsked(ev) => {
                let order = self.append_hitl_request(&id, &event, received);
                self.store.update(
                    &id,
                    ConversationUpdate {
                        pending_clarification: Some(Some(Pending::new(order, ev.clone()))),
                        ..suspended_for_input()
                    },
                );
            }
            WireMsg::DecisionAsked(ev) => {
                let order = self.append_hitl_request(&id, &event, received);
                self.store.update(
                    &id,
                    ConversationUpdate {
                        pending_decision: Some(Some(Pending::new(order, ev.clone()))),
                        ..suspended_for_input()
                    },
                );
            }
            WireMsg::EnvVarRequested(ev) => {
                let order = self.append_hitl_request(&id, &event, received);
                self.store.update(
                    &id,
                    ConversationUpdate {
                        pending_env_var: Some(Some(Pending::new(order, ev.clone()))),
                        ..suspended_for_input()
                    },
                );
            }
            WireMsg::PermissionAsked(ev) => {
                let order = self.append_hitl_request(&id, &event, received);
                self.store.update(
                    &id,
                    ConversationUpdate {
                        pending_permission: Some(Some(Pending::new(order, ev.clone()))),
                        ..suspended_for_input()
                    },
                );
            }

            WireMsg::ClarificationAnswered(ev) => {
                let answer = HitlAnswer::Text {
                    text: ev.answer.clone(),
                };
                self.on_hitl_response(
                    id,
                    &event,
                    HitlKind::Clarification,
                    &ev.request_id,
                    answer,
                    received,
                );
            }
            WireMsg::DecisionReplied(ev) => {
                let answer = HitlAnswer::Choice {
                    choice: ev.choice.clone(),
                };
                self.on_hitl_response(
                    id,
                    &event,
                    HitlKind::Decision,
                    &ev.request_id,
                    answer,
                    received,
                );
            }
            WireMsg::EnvVarProvided(ev) => {
                let answer = HitlAnswer::Provided {
                    name: ev.name.clone(),
                };
                self.on_hitl_response(
                    id,
                    &event,
                    HitlKind::EnvVar,
                    &ev.request_id,
                    answer,
                    received,
                );
            }
            WireMsg::PermissionGranted(ev) => {
                let answer = HitlAnswer::Granted {
                    granted: ev.granted,
                };
                self.on_hitl_response(
                    id,
                    &event,
                    HitlKind::Permission,
                    &ev.request_id,
                    answer,
                    received,
                );
            }

            WireMsg::TaskStart(ev) => {
                let state = self.store.get(&id);
                let mut timeline = state.timeline;
                codec::append(&mut timeline, &event, received);
                let mut tasks = state.tasks;
                if !tasks.iter().any(|t| t.task_id == ev.task_id) {
                    tasks.push(TaskState {
                        task_id: ev.task_id.clone(),
                        title: ev.title.clone(),
                        status: TaskStatus::Running,
                    });
                }
                self.store.update(
                    &id,
                    ConversationUpdate {
                        timeline: Some(timeline),
                        tasks: Some(tasks),
                        ..Default::default()
                    },
                );
            }
            WireMsg::TaskComplete(ev) => {
                let state = self.store.get(&id);
                let mut timeline = state.timeline;
                codec::append(&mut timeline, &event, received);
                let mut tasks = state.tasks;
                if let Some(task) = tasks.iter_mut().find(|t| t.task_id == ev.task_id) {
                    task.status = ev.status;
                }
                self.store.update(
                    &id,
                    ConversationUpdate {
                        timeline: Some(timeline),
                        tasks: Some(tasks),
                        ..Default::default()
                    },
                );
            }

            WireMsg::CostUpdate(ev) => {
                let mut cost = self.store.get(&id).cost;
                cost.add(ev.input_tokens, ev.output_tokens, ev.cost_usd);
                self.store.update(
                    &id,
                    ConversationUpdate {
                        cost: Some(cost),
                        ..Default::default()
                    },
                );
            }
            WireMsg::Complete(ev) => self.on_complete(id, &event, ev.message.clone()),
            WireMsg::Error(ev) => {
                self.on_error(id, &event, &ev.message, ev.retryable, received);
            }

            WireMsg::Unknown => {
                debug!(%id, "dropping unrecognized event type");
                return;
            }
        }
        self.schedule_save(id);
    }

    fn on_assistant_message(
        &mut self,
        id: ConversationId,
        event: &WireEvent,
        ev: &AssistantMessageEvent,
        received: i64,
    ) {
        // The terminal message supersedes whatever was still buffered.
        self.buffers_mut(id)
            .take_terminal(DeltaChannel::Text, Some(ev.content.clone()));
        let mut timeline = self.store.get(&id).timeline;
        codec::append(&mut timeline, event, received);
        self.store.update(
            &id,
            ConversationUpdate {
                timeline: Some(timeline),
                streaming_assistant_content: Some(String::new()),
                ..Default::default()
            },
        );
    }

    fn on_text_start(&mut self, id: ConversationId, event: &WireEvent, received: i64) {
        let state = self.store.get(&id);
        let mut timeline = state.timeline;
        codec::append(&mut timeline, event, received);
        self.store.update(
            &id,
            ConversationUpdate {
                timeline: Some(timeline),
                streaming_assistant_content: Some(String::new()),
                is_streaming: Some(true),
                stream_status: Some(StreamStatus::Streaming),
                agent_phase: Some(thinking_from(state.agent_phase)),
                ..Default::default()
            },
        );
    }

    fn on_text_delta(&mut self, id: ConversationId, delta: &str) {
        if self.buffers_mut(id).push(DeltaChannel::Text, delta) {
            self.arm_flush(id, DeltaChannel::Text);
        }
        let phase = self.store.get(&id).agent_phase;
        if phase != thinking_from(phase) {
            self.store.update(
                &id,
                ConversationUpdate {
                    agent_phase: Some(thinking_from(phase)),
                    ..Default::default()
                },
            );
        }
    }

    fn on_text_end(
        &mut self,
        id: ConversationId,
        event: &WireEvent,
        terminal: Option<String>,
        received: i64,
    ) {
        // A non-empty terminal payload carries the full final text; earlier
        // timer flushes of the same stream must not be counted twice.
        let authoritative = terminal.as_deref().is_some_and(|c| !c.is_empty());
        let flushed = self
            .buffers_mut(id)
            .take_terminal(DeltaChannel::Text, terminal);
        let state = self.store.get(&id);
        let content = if authoritative {
            flushed.unwrap_or_default()
        } else {
            let mut acc = state.streaming_assistant_content;
            if let Some(flushed) = flushed {
                acc.push_str(&flushed);
            }
            acc
        };
        let mut timeline = state.timeline;
        codec::append(&mut timeline, event, received);
        self.store.update(
            &id,
            ConversationUpdate {
                timeline: Some(timeline),
                streaming_assistant_content: Some(content),
                ..Default::default()
            },
        );
    }

    fn on_thought(&mut self, id: ConversationId, event: &WireEvent, content: &str, received: i64) {
        // A full thought replaces any buffered fragments of it.
        self.buffers_mut(id)
            .take_terminal(DeltaChannel::Thought, Some(content.to_string()));
        let state = self.store.get(&id);
        let mut timeline = state.timeline;
        codec::append(&mut timeline, event, received);
        self.store.update(
            &id,
            ConversationUpdate {
                timeline: Some(timeline),
                streaming_thought: Some(String::new()),
                agent_phase: Some(thinking_from(state.agent_phase)),
                ..Default::default()
            },
        );
    }

    fn on_thought_delta(&mut self, id: ConversationId, delta: &str) {
        if self.buffers_mut(id).push(DeltaChannel::Thought, delta) {
            self.arm_flush(id, DeltaChannel::Thought);
        }
        let phase = self.store.get(&id).agent_phase;
        if phase != thinking_from(phase) {
            self.store.update(
                &id,
                ConversationUpdate {
                    agent_phase: Some(thinking_from(phase)),
                    ..Default::default()
                },
            );
        }
    }

    fn on_act(&mut self, id: ConversationId, event: &WireEvent, ev: &ActEvent, received: i64) {
        // An explicit act supersedes any still-buffered argument snapshot;
        // the snapshot is only a fallback when the act carries no input.
        let buffered = self.buffers_mut(id).take_terminal(DeltaChannel::ToolArgs, None);
        let input: Option<Value> = ev.tool_input.clone().or_else(|| {
            buffered.and_then(|s| match serde_json::from_str(&s) {
                Ok(value) => Some(value),
                Err(e) => {
                    debug!(tool_name = %ev.tool_name, error = %e, "discarding partial tool arguments");
                    None
                }
            })
        });

        let state = self.store.get(&id);
        let mut timeline = state.timeline;
        let resolved = WireEvent {
            time_us: event.time_us,
            counter: event.counter,
            msg: WireMsg::Act(ActEvent {
                tool_name: ev.tool_name.clone(),
                tool_input: input.clone(),
            }),
        };
        codec::append(&mut timeline, &resolved, received);

        let mut calls = state.active_tool_calls;
        calls.insert(
            ev.tool_name.clone(),
            ToolCallState {
                status: ToolStatus::Running,
                arguments: input,
                partial_arguments: None,
                started_at_us: received,
                completed_at_us: None,
                output: None,
            },
        );
        let mut stack = state.pending_tools_stack;
        stack.push(ev.tool_name.clone());

        self.store.update(
            &id,
            ConversationUpdate {
                timeline: Some(timeline),
                active_tool_calls: Some(calls),
                pending_tools_stack: Some(stack),
                agent_phase: Some(AgentPhase::Acting),
                ..Default::default()
            },
        );
    }

    fn on_act_delta(&mut self, id: ConversationId, tool_name: &str, snapshot: &str, received: i64) {
        if self.buffers_mut(id).replace_tool_args(tool_name, snapshot) {
            self.arm_flush(id, DeltaChannel::ToolArgs);
        }
        let state = self.store.get(&id);
        if !state.active_tool_calls.contains_key(tool_name) {
            let mut calls = state.active_tool_calls;
            calls.insert(
                tool_name.to_string(),
                ToolCallState {
                    status: ToolStatus::Preparing,
                    arguments: None,
                    partial_arguments: None,
                    started_at_us: received,
                    completed_at_us: None,
                    output: None,
                },
            );
            self.store.update(
                &id,
                ConversationUpdate {
                    active_tool_calls: Some(calls),
                    agent_phase: Some(AgentPhase::Preparing),
                    ..Default::default()
                },
            );
        }
    }

    fn on_observe(&mut self, id: ConversationId, event: &WireEvent, ev: &ObserveEvent, received: i64) {
        let state = self.store.get(&id);
        let mut stack = state.pending_tools_stack;
        let name = match &ev.tool_name {
            Some(name) => {
                if let Some(pos) = stack.iter().rposition(|n| n == name) {
                    stack.remove(pos);
                }
                Some(name.clone())
            }
            // Nameless result frame: resolve against the most recent call.
            None => stack.pop(),
        };
        if name.is_none() {
            warn!(%id, "observe with no resolvable tool call");
        }

        let mut calls = state.active_tool_calls;
        if let Some(name) = &name
            && let Some(call) = calls.get_mut(name)
        {
            call.status = if ev.success {
                ToolStatus::Success
            } else {
                ToolStatus::Failed
            };
            call.output = ev.tool_output.clone();
            call.completed_at_us = Some(received);
            call.partial_arguments = None;
        }

        let mut timeline = state.timeline;
        let resolved = WireEvent {
            time_us: event.time_us,
            counter: event.counter,
            msg: WireMsg::Observe(ObserveEvent {
                tool_name: name,
                tool_output: ev.tool_output.clone(),
                success: ev.success,
            }),
        };
        codec::append(&mut timeline, &resolved, received);

        self.store.update(
            &id,
            ConversationUpdate {
                timeline: Some(timeline),
                active_tool_calls: Some(calls),
                pending_tools_stack: Some(stack),
                agent_phase: Some(AgentPhase::Observing),
                ..Default::default()
            },
        );
    }

    /// Append the request entry and return the order key it was stored
    /// under, so the pending slot sorts identically to the timeline.
    fn append_hitl_request(
        &mut self,
        id: &ConversationId,
        event: &WireEvent,
        received: i64,
    ) -> OrderKey {
        let mut timeline = self.store.get(id).timeline;
        codec::append(&mut timeline, event, received);
        let order = timeline
            .last()
            .map(|e| e.order)
            .unwrap_or_else(|| event.order_key());
        self.store.update(
            id,
            ConversationUpdate {
                timeline: Some(timeline),
                ..Default::default()
            },
        );
        order
    }

    /// A response observed on the wire, e.g. answered from another device.
    /// Reconciled immediately so at most one entry per request id exists.
    fn on_hitl_response(
        &mut self,
        id: ConversationId,
        event: &WireEvent,
        kind: HitlKind,
        request_id: &str,
        answer: HitlAnswer,
        received: i64,
    ) {
        let state = self.store.get(&id);
        let pending_matches = state.pending_request_id(kind) == Some(request_id);
        let mut timeline = state.timeline;
        if !reconcile::mark_answered(&mut timeline, request_id, &answer) {
            codec::append(&mut timeline, event, received);
            timeline = reconcile::merge_responses(timeline);
        }

        let mut update = ConversationUpdate {
            timeline: Some(timeline),
            ..Default::default()
        };
        if pending_matches {
            let resumes = answer.resumes_agent();
            update.agent_phase = Some(if resumes {
                AgentPhase::Thinking
            } else {
                AgentPhase::Idle
            });
            update.is_streaming = Some(resumes);
            update.stream_status = Some(if resumes {
                StreamStatus::Streaming
            } else {
                StreamStatus::Idle
            });
            match kind {
                HitlKind::Clarification => update.pending_clarification = Some(None),
                HitlKind::Decision => update.pending_decision = Some(None),
                HitlKind::EnvVar => update.pending_env_var = Some(None),
                HitlKind::Permission => update.pending_permission = Some(None),
            }
        }
        self.store.update(&id, update);
    }

    fn on_complete(&mut self, id: ConversationId, event: &WireEvent, message: Option<String>) {
        let flushed = self.buffers_mut(id).take_terminal(DeltaChannel::Text, None);
        self.buffers_mut(id).clear_all();

        let state = self.store.get(&id);
        let mut timeline: Vec<TimelineEvent> = state
            .timeline
            .into_iter()
            .filter(|e| !e.is_transient_text())
            .collect();

        let final_message = message.filter(|m| !m.is_empty()).or_else(|| {
            let mut acc = state.streaming_assistant_content;
            if let Some(flushed) = flushed {
                acc.push_str(&flushed);
            }
            if acc.is_empty() { None } else { Some(acc) }
        });
        if let Some(content) = final_message {
            let duplicate = matches!(
                timeline.last().map(|e| &e.item),
                Some(timeline_protocol::TimelineItem::AssistantMessage { content: last })
                    if *last == content
            );
            if !duplicate {
                let synthesized = WireEvent {
                    time_us: event.time_us,
                    counter: event.counter,
                    msg: WireMsg::AssistantMessage(AssistantMessageEvent { content }),
                };
                codec::append(&mut timeline, &synthesized, now_us());
            }
        }

        self.store.update(
            &id,
            ConversationUpdate {
                timeline: Some(timeline),
                is_streaming: Some(false),
                stream_status: Some(StreamStatus::Idle),
                agent_phase: Some(AgentPhase::Idle),
                streaming_assistant_content: Some(String::new()),
                streaming_thought: Some(String::new()),
                active_tool_calls: Some(HashMap::new()),
                pending_tools_stack: Some(Vec::new()),
                error: Some(None),
                ..Default::default()
            },
        );
    }

    fn on_error(
        &mut self,
        id: ConversationId,
        event: &WireEvent,
        message: &str,
        retryable: bool,
        received: i64,
    ) {
        if retryable {
            // Transient: the transport retries on its own. Surface the
            // indicator and keep the stream alive.
            self.store.update(
                &id,
                ConversationUpdate {
                    error: Some(Some(message.to_string())),
                    agent_phase: Some(AgentPhase::Retrying),
                    ..Default::default()
                },
            );
            return;
        }

        // Fatal: keep whatever streamed so far visible, fail in-flight tool
        // calls, stop the stream.
        let text = self.buffers_mut(id).take(DeltaChannel::Text);
        let thought = self.buffers_mut(id).take(DeltaChannel::Thought);
        self.buffers_mut(id).clear_all();

        let state = self.store.get(&id);
        let mut assistant = state.streaming_assistant_content;
        if let Some(text) = text {
            assistant.push_str(&text);
        }
        let mut thinking = state.streaming_thought;
        if let Some(thought) = thought {
            thinking.push_str(&thought);
        }

        let mut calls = state.active_tool_calls;
        for call in calls.values_mut() {
            if matches!(call.status, ToolStatus::Preparing | ToolStatus::Running) {
                call.status = ToolStatus::Failed;
                call.completed_at_us = Some(received);
            }
        }

        let mut timeline = state.timeline;
        codec::append(&mut timeline, event, received);

        self.store.update(
            &id,
            ConversationUpdate {
                timeline: Some(timeline),
                streaming_assistant_content: Some(assistant),
                streaming_thought: Some(thinking),
                active_tool_calls: Some(calls),
                pending_tools_stack: Some(Vec::new()),
                is_streaming: Some(false),
                stream_status: Some(StreamStatus::Error),
                agent_phase: Some(AgentPhase::Idle),
                error: Some(Some(message.to_string())),
                ..Default::default()
            },
        );
    }
}

/// Delta and thought activity puts a quiet agent back into `Thinking`;
/// `Acting` and `AwaitingInput` are left to their own transitions.
fn thinking_from(phase: AgentPhase) -> AgentPhase {
    match phase {
        AgentPhase::Idle
        | AgentPhase::Observing
        | AgentPhase::Retrying
        | AgentPhase::Thinking
        | AgentPhase::Preparing => AgentPhase::Thinking,
        AgentPhase::Acting | AgentPhase::AwaitingInput => phase,
    }
}

fn suspended_for_input() -> ConversationUpdate {
    ConversationUpdate {
        agent_phase: Some(AgentPhase::AwaitingInput),
        is_streaming: Some(false),
        stream_status: Some(StreamStatus::Idle),
        ..Default::default()
    }
}
