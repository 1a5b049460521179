//! Durable per-conversation snapshots.
//!
//! Evicted or backgrounded conversations are written as one JSON document per
//! conversation so a later switch-back restores instantly without a network
//! round trip. Transient streaming fields are deliberately not captured; a
//! restored conversation always comes back idle.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use timeline_protocol::ClarificationAskedEvent;
use timeline_protocol::ConversationId;
use timeline_protocol::DecisionAskedEvent;
use timeline_protocol::EnvVarRequestedEvent;
use timeline_protocol::PermissionAskedEvent;
use timeline_protocol::TaskState;
use timeline_protocol::TimelineEvent;
use timeline_protocol::WorkPlan;
use tracing::warn;

use crate::error::Result;
use crate::error::TimelineError;
use crate::state::AgentPhase;
use crate::state::ConversationState;
use crate::state::CostTracking;
use crate::state::Pending;
use crate::state::ToolCallState;

/// The serialized form of a conversation. Maps become sorted entry lists so
/// documents are byte-stable across saves of the same state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub timeline: Vec<TimelineEvent>,
    #[serde(default)]
    pub active_tool_calls: Vec<(String, ToolCallState)>,
    #[serde(default)]
    pub pending_tools_stack: Vec<String>,
    #[serde(default)]
    pub agent_phase: AgentPhase,
    #[serde(default)]
    pub pending_clarification: Option<Pending<ClarificationAskedEvent>>,
    #[serde(default)]
    pub pending_decision: Option<Pending<DecisionAskedEvent>>,
    #[serde(default)]
    pub pending_env_var: Option<Pending<EnvVarRequestedEvent>>,
    #[serde(default)]
    pub pending_permission: Option<Pending<PermissionAskedEvent>>,
    #[serde(default)]
    pub work_plan: Option<WorkPlan>,
    #[serde(default)]
    pub tasks: Vec<TaskState>,
    #[serde(default)]
    pub cost: CostTracking,
    #[serde(default)]
    pub has_earlier: bool,
    #[serde(default)]
    pub earliest_time_us: Option<i64>,
    #[serde(default)]
    pub earliest_counter: Option<u32>,
    #[serde(default)]
    pub pinned: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl StateSnapshot {
    pub fn capture(state: &ConversationState) -> Self {
        let mut active_tool_calls: Vec<(String, ToolCallState)> = state
            .active_tool_calls
            .iter()
            .map(|(name, call)| (name.clone(), call.clone()))
            .collect();
        active_tool_calls.sort_by(|(a, _), (b, _)| a.cmp(b));

        Self {
            timeline: state.timeline.clone(),
            active_tool_calls,
            pending_tools_stack: state.pending_tools_stack.clone(),
            agent_phase: state.agent_phase,
            pending_clarification: state.pending_clarification.clone(),
            pending_decision: state.pending_decision.clone(),
            pending_env_var: state.pending_env_var.clone(),
            pending_permission: state.pending_permission.clone(),
            work_plan: state.work_plan.clone(),
            tasks: state.tasks.clone(),
            cost: state.cost,
            has_earlier: state.has_earlier,
            earliest_time_us: state.earliest_time_us,
            earliest_counter: state.earliest_counter,
            pinned: state.pinned.iter().cloned().collect(),
            error: state.error.clone(),
        }
    }

    /// Rebuild a full state. Streaming fields come back at their defaults and
    /// the derived HITL summary is recomputed from the pending requests.
    pub fn restore(self) -> ConversationState {
        let mut state = ConversationState {
            timeline: self.timeline,
            active_tool_calls: self
                .active_tool_calls
                .into_iter()
                .collect::<HashMap<String, ToolCallState>>(),
            pending_tools_stack: self.pending_tools_stack,
            agent_phase: self.agent_phase,
            pending_clarification: self.pending_clarification,
            pending_decision: self.pending_decision,
            pending_env_var: self.pending_env_var,
            pending_permission: self.pending_permission,
            work_plan: self.work_plan,
            tasks: self.tasks,
            cost: self.cost,
            has_earlier: self.has_earlier,
            earliest_time_us: self.earliest_time_us,
            earliest_counter: self.earliest_counter,
            pinned: self.pinned.into_iter().collect::<BTreeSet<String>>(),
            error: self.error,
            ..Default::default()
        };
        state.recompute_hitl_summary();
        state
    }
}

#[async_trait]
pub trait DurableStateStore: Send + Sync {
    async fn save(&self, id: ConversationId, snapshot: &StateSnapshot) -> Result<()>;
    async fn load(&self, id: ConversationId) -> Result<Option<StateSnapshot>>;
    async fn delete(&self, id: ConversationId) -> Result<()>;
}

/// File-per-conversation JSON store under a state directory.
pub struct JsonStateStore {
    dir: PathBuf,
}

impl JsonStateStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, id: ConversationId) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }
}

#[async_trait]
impl DurableStateStore for JsonStateStore {
    async fn save(&self, id: ConversationId, snapshot: &StateSnapshot) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| TimelineError::Persistence(e.to_string()))?;
        let json = serde_json::to_vec(snapshot)
            .map_err(|e| TimelineError::Persistence(e.to_string()))?;
        tokio::fs::write(self.path_for(id), json)
            .await
            .map_err(|e| TimelineError::Persistence(e.to_string()))?;
        Ok(())
    }

    async fn load(&self, id: ConversationId) -> Result<Option<StateSnapshot>> {
        let path = self.path_for(id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(TimelineError::Persistence(e.to_string())),
        };
        // A corrupt document is not fatal; treat it as absent and let the
        // caller fall back to the historical API.
        match serde_json::from_slice(&bytes) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(e) => {
                warn!(%id, error = %e, "discarding unreadable state document");
                Ok(None)
            }
        }
    }

    async fn delete(&self, id: ConversationId) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(TimelineError::Persistence(e.to_string())),
        }
    }
}

/// In-memory store for contexts without a filesystem.
#[derive(Default)]
pub struct MemoryStateStore {
    snapshots: Mutex<HashMap<ConversationId, StateSnapshot>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.snapshots.lock().map(|map| map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DurableStateStore for MemoryStateStore {
    async fn save(&self, id: ConversationId, snapshot: &StateSnapshot) -> Result<()> {
        let mut map = self
            .snapshots
            .lock()
            .map_err(|_| TimelineError::Persistence("state store poisoned".to_string()))?;
        map.insert(id, snapshot.clone());
        Ok(())
    }

    async fn load(&self, id: ConversationId) -> Result<Option<StateSnapshot>> {
        let map = self
            .snapshots
            .lock()
            .map_err(|_| TimelineError::Persistence("state store poisoned".to_string()))?;
        Ok(map.get(&id).cloned())
    }

    async fn delete(&self, id: ConversationId) -> Result<()> {
        let mut map = self
            .snapshots
            .lock()
            .map_err(|_| TimelineError::Persistence("state store poisoned".to_string()))?;
        map.remove(&id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StreamStatus;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;
    use timeline_protocol::OrderKey;
    use timeline_protocol::TimelineItem;

    fn streaming_state() -> ConversationState {
        ConversationState {
            timeline: vec![TimelineEvent {
                id: "e1".to_string(),
                order: OrderKey::new(10, 0),
                received_at_us: 10,
                item: TimelineItem::UserMessage {
                    content: "hi".to_string(),
                },
            }],
            is_streaming: true,
            stream_status: StreamStatus::Streaming,
            streaming_assistant_content: "partial answer".to_string(),
            streaming_thought: "hmm".to_string(),
            agent_phase: AgentPhase::Thinking,
            pinned: BTreeSet::from(["e1".to_string()]),
            ..Default::default()
        }
    }

    #[test]
    fn snapshot_drops_transient_streaming_fields() {
        let snapshot = StateSnapshot::capture(&streaming_state());
        let restored = snapshot.restore();

        assert!(!restored.is_streaming);
        assert_eq!(restored.stream_status, StreamStatus::Idle);
        assert_eq!(restored.streaming_assistant_content, "");
        assert_eq!(restored.streaming_thought, "");
        // Durable fields survive.
        assert_eq!(restored.timeline.len(), 1);
        assert_eq!(restored.agent_phase, AgentPhase::Thinking);
        assert!(restored.pinned.contains("e1"));
    }

    #[test]
    fn restore_recomputes_hitl_summary() {
        let snapshot = StateSnapshot {
            pending_clarification: Some(Pending::new(
                OrderKey::new(5, 0),
                ClarificationAskedEvent {
                    request_id: "r1".to_string(),
                    question: "which?".to_string(),
                    options: vec![],
                },
            )),
            ..Default::default()
        };
        let restored = snapshot.restore();
        let summary = restored.pending_hitl.expect("summary");
        assert_eq!(summary.request_id, "r1");
    }

    #[tokio::test]
    async fn json_store_round_trips() {
        let dir = TempDir::new().expect("tempdir");
        let store = JsonStateStore::new(dir.path());
        let id = ConversationId::new();
        let snapshot = StateSnapshot::capture(&streaming_state());

        store.save(id, &snapshot).await.expect("save");
        let loaded = store.load(id).await.expect("load").expect("present");
        assert_eq!(loaded, snapshot);

        store.delete(id).await.expect("delete");
        assert_eq!(store.load(id).await.expect("load"), None);
        // Deleting twice is fine.
        store.delete(id).await.expect("delete again");
    }

    #[tokio::test]
    async fn corrupt_document_reads_as_absent() {
        let dir = TempDir::new().expect("tempdir");
        let store = JsonStateStore::new(dir.path());
        let id = ConversationId::new();
        tokio::fs::create_dir_all(dir.path()).await.expect("mkdir");
        tokio::fs::write(dir.path().join(format!("{id}.json")), b"not json")
            .await
            .expect("write");

        assert_eq!(store.load(id).await.expect("load"), None);
    }
}
