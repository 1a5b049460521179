//! Wire and timeline data model for the conversation timeline engine.
//!
//! This crate is intentionally free of business logic: it defines the closed
//! union of events the transport can deliver, the canonical timeline entry
//! types the engine produces from them, and the order key that establishes
//! total order within one conversation.

mod conversation_id;
mod hitl;
mod order;
mod plan;
mod timeline;
mod wire;

pub use conversation_id::ConversationId;
pub use hitl::HitlAnswer;
pub use hitl::HitlKind;
pub use hitl::HitlSummary;
pub use order::OrderKey;
pub use plan::PlanStep;
pub use plan::StepStatus;
pub use plan::TaskState;
pub use plan::TaskStatus;
pub use plan::WorkPlan;
pub use timeline::HitlRequestItem;
pub use timeline::HitlResponseItem;
pub use timeline::TimelineEvent;
pub use timeline::TimelineItem;
pub use wire::*;
