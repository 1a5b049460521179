use serde::Deserialize;
use serde::Serialize;

/// The four kinds of human-in-the-loop requests an agent can raise. Each
/// suspends agent progress until the user responds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HitlKind {
    Clarification,
    Decision,
    EnvVar,
    Permission,
}

/// Answer payload for a HITL request. Env var values are deliberately not
/// representable here; only the variable name is echoed back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HitlAnswer {
    Text { text: String },
    Choice { choice: String },
    Granted { granted: bool },
    Provided { name: String },
}

impl HitlAnswer {
    /// Whether this answer lets the agent resume work. Only an explicit
    /// permission denial stops the turn.
    pub fn resumes_agent(&self) -> bool {
        !matches!(self, HitlAnswer::Granted { granted: false })
    }
}

/// Derived summary of the most recent pending HITL request, recomputed by the
/// store whenever any pending field changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HitlSummary {
    pub kind: HitlKind,
    pub request_id: String,
    pub prompt: String,
}
