//! HITL request/response reconciliation.
//!
//! A request entry (`*_asked` / `*_requested`) and its later response entry
//! share a `request_id`. After merging, exactly one timeline entry per
//! `request_id` remains: the request, carrying `answered: true` and the
//! answer payload. Applied on every historical load/merge so cold-started
//! and live-streamed views render identically.

use std::collections::HashMap;

use timeline_protocol::HitlAnswer;
use timeline_protocol::TimelineEvent;
use timeline_protocol::TimelineItem;
use tracing::debug;

/// Merge response entries into their requests and drop the responses.
/// Idempotent: after one pass no response entries remain, so a second pass
/// is a no-op. Ordering and count of other entries are untouched.
pub fn merge_responses(timeline: Vec<TimelineEvent>) -> Vec<TimelineEvent> {
    let mut answers: HashMap<String, HitlAnswer> = HashMap::new();
    for event in &timeline {
        if let TimelineItem::HitlResponse(resp) = &event.item {
            answers.insert(resp.request_id.clone(), resp.answer.clone());
        }
    }
    if answers.is_empty() {
        return timeline;
    }
    debug!(count = answers.len(), "merging HITL responses into requests");

    timeline
        .into_iter()
        .filter_map(|mut event| {
            match &mut event.item {
                TimelineItem::HitlResponse(_) => return None,
                TimelineItem::HitlRequest(req) => {
                    if let Some(answer) = answers.get(&req.request_id) {
                        req.answered = true;
                        req.answer = Some(answer.clone());
                    }
                }
                _ => {}
            }
            Some(event)
        })
        .collect()
}

/// Mark the single request entry with `request_id` answered in place. Used
/// by the respond actions, where the answer is known locally before any
/// response event arrives.
pub fn mark_answered(
    timeline: &mut [TimelineEvent],
    request_id: &str,
    answer: &HitlAnswer,
) -> bool {
    for event in timeline.iter_mut() {
        if let TimelineItem::HitlRequest(req) = &mut event.item
            && req.request_id == request_id
        {
            req.answered = true;
            req.answer = Some(answer.clone());
            return true;
        }
    }
    false
}
