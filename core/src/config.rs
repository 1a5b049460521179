use std::path::PathBuf;
use std::time::Duration;

/// Tunables for the timeline engine. Defaults match the production client;
/// tests shrink the intervals or raise the caps as needed.
#[derive(Debug, Clone)]
pub struct TimelineConfig {
    /// Flush interval for buffered assistant-text deltas.
    pub token_batch_interval: Duration,
    /// Flush interval for buffered reasoning deltas.
    pub thought_batch_interval: Duration,
    /// Bound on in-memory conversation states (LRU by last touch).
    pub max_cached_conversations: usize,
    /// How many conversations may stream concurrently.
    pub max_concurrent_streams: usize,
    /// Debounce window for write-through persistence.
    pub save_debounce: Duration,
    /// Page size for historical fetches.
    pub history_page_size: usize,
    /// Directory for the durable per-conversation state files.
    pub state_dir: PathBuf,
}

impl Default for TimelineConfig {
    fn default() -> Self {
        Self {
            token_batch_interval: Duration::from_millis(50),
            thought_batch_interval: Duration::from_millis(150),
            max_cached_conversations: 10,
            max_concurrent_streams: 3,
            save_debounce: Duration::from_millis(300),
            history_page_size: 50,
            state_dir: PathBuf::from(".timeline-state"),
        }
    }
}
