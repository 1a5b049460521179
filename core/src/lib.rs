//! Event-sourced conversation timeline engine.
//!
//! Wire events from an agent transport are folded into per-conversation
//! state: an ordered timeline, coalesced streaming partials, tool-call
//! tracking and human-in-the-loop reconciliation. One conversation's state is
//! mirrored into a flat snapshot for the visible view; the rest accumulate in
//! the background under an LRU bound with durable spill-over.

mod cache;
mod coalescer;
mod codec;
mod config;
mod dispatch;
mod error;
mod history;
mod persist;
mod reconcile;
mod session;
mod state;
mod store;
mod transport;
mod util;

pub use cache::enforce_bound;
pub use cache::restore;
pub use coalescer::DeltaBuffers;
pub use coalescer::DeltaChannel;
pub use codec::append;
pub use codec::next_order_key;
pub use codec::sort_and_dedup;
pub use codec::to_timeline_event;
pub use config::TimelineConfig;
pub use error::Result;
pub use error::TimelineError;
pub use history::earliest_cursor;
pub use history::merge_history;
pub use persist::DurableStateStore;
pub use persist::JsonStateStore;
pub use persist::MemoryStateStore;
pub use persist::StateSnapshot;
pub use reconcile::mark_answered;
pub use reconcile::merge_responses;
pub use session::Session;
pub use session::SessionEvent;
pub use session::SessionEventSender;
pub use state::AgentPhase;
pub use state::ConversationState;
pub use state::ConversationUpdate;
pub use state::CostTracking;
pub use state::Pending;
pub use state::StreamStatus;
pub use state::ToolCallState;
pub use state::ToolStatus;
pub use store::ActiveSnapshot;
pub use store::ConversationStore;
pub use transport::AgentTransport;
pub use transport::ExecutionStatus;
pub use transport::HistoryApi;
pub use transport::HistoryPage;
