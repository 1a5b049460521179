//! LRU eviction over the conversation store.
//!
//! The in-memory map is bounded; beyond the bound, the oldest-touched
//! conversations are persisted and dropped. The active conversation and any
//! conversation still streaming are never eviction candidates, so the map
//! may transiently exceed the bound while several streams run.

use timeline_protocol::ConversationId;
use tracing::debug;
use tracing::warn;

use crate::persist::DurableStateStore;
use crate::persist::StateSnapshot;
use crate::store::ConversationStore;

/// Persist-then-drop conversations past `bound`, oldest-touched first.
/// Returns the ids evicted. A failed save is logged and the conversation is
/// dropped anyway; the historical API remains the fallback source.
pub async fn enforce_bound(
    store: &mut ConversationStore,
    durable: &dyn DurableStateStore,
    bound: usize,
) -> Vec<ConversationId> {
    let mut evicted = Vec::new();
    while store.len() > bound {
        let candidate = store
            .ids_lru_first()
            .into_iter()
            .find(|id| Some(*id) != store.active_id() && !store.is_streaming(id));
        let Some(id) = candidate else {
            debug!(len = store.len(), bound, "no evictable conversation");
            break;
        };

        let state = store.get(&id);
        if let Err(e) = durable.save(id, &StateSnapshot::capture(&state)).await {
            warn!(%id, error = %e, "failed to persist evicted conversation");
        }
        store.remove(&id);
        debug!(%id, "evicted conversation");
        evicted.push(id);
    }
    evicted
}

/// Bring a conversation back into the map from the durable store. Returns
/// `true` when it is in memory afterwards.
pub async fn restore(
    store: &mut ConversationStore,
    durable: &dyn DurableStateStore,
    id: ConversationId,
) -> bool {
    if store.contains(&id) {
        return true;
    }
    match durable.load(id).await {
        Ok(Some(snapshot)) => {
            store.insert(id, snapshot.restore());
            debug!(%id, "restored conversation from durable store");
            true
        }
        Ok(None) => false,
        Err(e) => {
            warn!(%id, error = %e, "failed to load durable conversation state");
            false
        }
    }
}
