//! Per-conversation delta buffers.
//!
//! Rapid partial updates (text tokens, reasoning fragments, growing
//! tool-argument JSON) are accumulated here and flushed on a bounded timer
//! into a single state mutation, so N deltas become ~1 update per interval.
//! Invariant: at most one armed flush timer per channel per conversation; a
//! cancelled timer must never fire into a torn-down conversation.

use tokio::task::AbortHandle;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeltaChannel {
    Text,
    Thought,
    ToolArgs,
}

#[derive(Default)]
struct ChannelBuffer {
    value: String,
    armed: bool,
    flush_task: Option<AbortHandle>,
}

impl ChannelBuffer {
    /// Swap the buffer out and disarm. Aborting an already-finished timer
    /// task is a no-op, so this is safe on both timer fire and cancellation.
    fn take(&mut self) -> Option<String> {
        self.armed = false;
        if let Some(task) = self.flush_task.take() {
            task.abort();
        }
        if self.value.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.value))
        }
    }

    fn clear(&mut self) {
        self.armed = false;
        if let Some(task) = self.flush_task.take() {
            task.abort();
        }
        self.value.clear();
    }
}

/// The three independent delta channels for one conversation.
#[derive(Default)]
pub struct DeltaBuffers {
    text: ChannelBuffer,
    thought: ChannelBuffer,
    tool_args: ChannelBuffer,
    /// Tool the buffered argument snapshot belongs to.
    tool_name: Option<String>,
}

impl DeltaBuffers {
    fn channel(&self, channel: DeltaChannel) -> &ChannelBuffer {
        match channel {
            DeltaChannel::Text => &self.text,
            DeltaChannel::Thought => &self.thought,
            DeltaChannel::ToolArgs => &self.tool_args,
        }
    }

    fn channel_mut(&mut self, channel: DeltaChannel) -> &mut ChannelBuffer {
        match channel {
            DeltaChannel::Text => &mut self.text,
            DeltaChannel::Thought => &mut self.thought,
            DeltaChannel::ToolArgs => &mut self.tool_args,
        }
    }

    /// Append a text or reasoning fragment. Returns `true` when the caller
    /// must arm a flush timer (none is currently armed for the channel).
    pub fn push(&mut self, channel: DeltaChannel, delta: &str) -> bool {
        let buf = self.channel_mut(channel);
        buf.value.push_str(delta);
        if buf.armed {
            false
        } else {
            buf.armed = true;
            true
        }
    }

    /// Replace the tool-argument snapshot (last-write-wins, not
    /// concatenation). Returns `true` when a flush timer must be armed.
    pub fn replace_tool_args(&mut self, tool_name: &str, snapshot: &str) -> bool {
        if self.tool_name.as_deref() != Some(tool_name) {
            debug!(tool_name, "tool-arg buffer switching tools");
            self.tool_name = Some(tool_name.to_string());
        }
        let buf = &mut self.tool_args;
        buf.value.clear();
        buf.value.push_str(snapshot);
        if buf.armed {
            false
        } else {
            buf.armed = true;
            true
        }
    }

    /// Record the timer task armed for `channel` so teardown can cancel it.
    pub fn set_flush_task(&mut self, channel: DeltaChannel, task: AbortHandle) {
        self.channel_mut(channel).flush_task = Some(task);
    }

    /// Atomically swap out the buffered content and disarm the channel.
    /// Flushing an empty buffer is a no-op (`None`).
    pub fn take(&mut self, channel: DeltaChannel) -> Option<String> {
        self.channel_mut(channel).take()
    }

    /// Flush for a terminal event: the terminal payload wins when present,
    /// otherwise whatever was still buffered. Cancels the pending timer and
    /// clears the buffer either way.
    pub fn take_terminal(&mut self, channel: DeltaChannel, terminal: Option<String>) -> Option<String> {
        let buffered = self.take(channel);
        match terminal {
            Some(content) if !content.is_empty() => Some(content),
            _ => buffered,
        }
    }

    pub fn tool_args_tool(&self) -> Option<&str> {
        self.tool_name.as_deref()
    }

    pub fn is_armed(&self, channel: DeltaChannel) -> bool {
        self.channel(channel).armed
    }

    /// Purge everything: new turn, stream error, delete, or active switch.
    /// Prevents residual partial content from bleeding into the next context.
    pub fn clear_all(&mut self) {
        self.text.clear();
        self.thought.clear();
        self.tool_args.clear();
        self.tool_name = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn coalesces_rapid_deltas_into_one_flush() {
        let mut buffers = DeltaBuffers::default();
        // Only the first push within an interval asks for a timer.
        assert!(buffers.push(DeltaChannel::Text, "He"));
        assert!(!buffers.push(DeltaChannel::Text, "llo"));
        assert!(!buffers.push(DeltaChannel::Text, " wo"));
        assert!(!buffers.push(DeltaChannel::Text, "rld"));

        assert_eq!(buffers.take(DeltaChannel::Text), Some("Hello world".to_string()));
        // Buffer cleared with the flush; next delta re-arms.
        assert!(buffers.push(DeltaChannel::Text, "!"));
    }

    #[test]
    fn empty_flush_is_a_noop() {
        let mut buffers = DeltaBuffers::default();
        assert_eq!(buffers.take(DeltaChannel::Thought), None);
    }

    #[test]
    fn tool_args_are_last_write_wins() {
        let mut buffers = DeltaBuffers::default();
        assert!(buffers.replace_tool_args("search", r#"{"q":"ru"#));
        assert!(!buffers.replace_tool_args("search", r#"{"q":"rust"}"#));

        assert_eq!(buffers.tool_args_tool(), Some("search"));
        assert_eq!(
            buffers.take(DeltaChannel::ToolArgs),
            Some(r#"{"q":"rust"}"#.to_string())
        );
    }

    #[test]
    fn terminal_flush_prefers_terminal_payload() {
        let mut buffers = DeltaBuffers::default();
        buffers.push(DeltaChannel::Text, "partial");
        assert_eq!(
            buffers.take_terminal(DeltaChannel::Text, Some("full final".to_string())),
            Some("full final".to_string())
        );
        // Buffer is gone afterwards.
        assert_eq!(buffers.take(DeltaChannel::Text), None);
    }

    #[test]
    fn terminal_flush_falls_back_to_buffered_content() {
        let mut buffers = DeltaBuffers::default();
        buffers.push(DeltaChannel::Text, "partial");
        assert_eq!(
            buffers.take_terminal(DeltaChannel::Text, None),
            Some("partial".to_string())
        );
    }

    #[test]
    fn clear_all_purges_and_disarms_every_channel() {
        let mut buffers = DeltaBuffers::default();
        buffers.push(DeltaChannel::Text, "a");
        buffers.push(DeltaChannel::Thought, "b");
        buffers.replace_tool_args("search", "{}");
        buffers.clear_all();

        assert!(!buffers.is_armed(DeltaChannel::Text));
        assert!(!buffers.is_armed(DeltaChannel::Thought));
        assert!(!buffers.is_armed(DeltaChannel::ToolArgs));
        assert_eq!(buffers.take(DeltaChannel::Text), None);
        assert_eq!(buffers.take(DeltaChannel::ToolArgs), None);
        assert_eq!(buffers.tool_args_tool(), None);
    }
}
