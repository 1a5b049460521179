use thiserror::Error;

#[derive(Debug, Error)]
pub enum TimelineError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("history api error: {0}")]
    History(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("concurrent streaming limit reached ({0})")]
    StreamLimit(usize),

    #[error("no pending {kind:?} request with id {request_id}")]
    UnknownRequest {
        kind: timeline_protocol::HitlKind,
        request_id: String,
    },
}

pub type Result<T> = std::result::Result<T, TimelineError>;
