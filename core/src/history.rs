//! Merging historical pages into cached timelines.
//!
//! A fetched page and the in-memory timeline may overlap arbitrarily: both
//! can hold the same entries (reload after a live session), either can hold
//! entries the other lacks. The merge is by entry id with a defensive
//! re-sort, followed by HITL response reconciliation so a cold-started view
//! renders identically to one that streamed live.

use timeline_protocol::OrderKey;
use timeline_protocol::TimelineEvent;

use crate::codec;
use crate::reconcile;
use crate::transport::HistoryPage;

pub fn merge_history(
    cached: Vec<TimelineEvent>,
    fetched: Vec<TimelineEvent>,
) -> Vec<TimelineEvent> {
    let mut merged = cached;
    merged.extend(fetched);
    codec::sort_and_dedup(&mut merged);
    reconcile::merge_responses(merged)
}

/// Pagination cursor derived from the oldest loaded entry. `None` when the
/// page carried no cursor fields; callers then fall back to the merged
/// timeline's first entry.
pub fn earliest_cursor(page: &HistoryPage, merged: &[TimelineEvent]) -> Option<OrderKey> {
    match page.first_time_us {
        Some(time_us) => Some(OrderKey::new(time_us, page.first_counter.unwrap_or(0))),
        None => merged.first().map(|e| e.order),
    }
}
