//! External collaborator interfaces: the streaming transport and the
//! paginated historical API. The engine never implements reconnection or
//! retry itself; those belong to the collaborator behind these traits.

use async_trait::async_trait;
use timeline_protocol::ConversationId;
use timeline_protocol::HitlAnswer;
use timeline_protocol::HitlKind;
use timeline_protocol::OrderKey;
use timeline_protocol::TimelineEvent;

use crate::error::Result;
use crate::session::SessionEventSender;

#[async_trait]
pub trait AgentTransport: Send + Sync {
    async fn connect(&self) -> Result<()>;
    fn is_connected(&self) -> bool;
    /// Register for live wire events of one conversation. Delivered events
    /// must be posted through the given sender in arrival order.
    async fn subscribe(&self, id: ConversationId, events: SessionEventSender) -> Result<()>;
    async fn send_message(&self, id: ConversationId, content: String) -> Result<()>;
    async fn respond(
        &self,
        id: ConversationId,
        kind: HitlKind,
        request_id: String,
        answer: HitlAnswer,
    ) -> Result<()>;
    async fn abort(&self, id: ConversationId) -> Result<()>;
}

/// One page of historical conversation messages, newest page first.
#[derive(Debug, Clone, Default)]
pub struct HistoryPage {
    pub timeline: Vec<TimelineEvent>,
    pub has_more: bool,
    pub first_time_us: Option<i64>,
    pub first_counter: Option<u32>,
    pub last_time_us: Option<i64>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ExecutionStatus {
    /// Whether the agent is currently running server-side; decides whether
    /// to re-subscribe after a page reload.
    pub is_running: bool,
}

#[async_trait]
pub trait HistoryApi: Send + Sync {
    async fn fetch_messages(
        &self,
        id: ConversationId,
        limit: usize,
        before: Option<OrderKey>,
    ) -> Result<HistoryPage>;

    async fn execution_status(
        &self,
        id: ConversationId,
        include_recovery: bool,
        last_known_time_us: Option<i64>,
    ) -> Result<ExecutionStatus>;
}
