//! Normalized inbound events and the delivery tasks that carry them.

use serde::Serialize;
use tokio::time::Instant;

/// Placeholder body used when an inbound message carries no text.
pub const EMPTY_BODY_PLACEHOLDER: &str = "[no text content]";

/// Fallback label for chats or senders whose name cannot be resolved.
pub const UNKNOWN_LABEL: &str = "Unknown";

/// One inbound message as seen by the pipeline.
///
/// Built once by an event source and never mutated afterwards; sinks clone
/// the fields they need into their own wire types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedEvent {
    /// Source conversation or channel identifier.
    pub origin_id: i64,
    /// Human-readable conversation label, may be empty.
    pub origin_title: String,
    /// Display name of the sender, may be empty.
    pub sender_name: String,
    /// Message text.
    pub body: String,
    /// Message identifier, unique within the origin.
    pub message_id: i64,
    /// Whether the origin was muted when the message arrived.
    pub is_muted: bool,
}

impl NormalizedEvent {
    /// Canonical JSON projection sent by the custom HTTP sink.
    pub fn projection(&self) -> EventProjection<'_> {
        EventProjection {
            chat_title: &self.origin_title,
            sender: &self.sender_name,
            message: &self.body,
            chat_id: self.origin_id,
            message_id: self.message_id,
        }
    }

    /// Short prefix of the body for log lines.
    pub fn preview(&self) -> String {
        const PREVIEW_CHARS: usize = 10;
        self.body.chars().take(PREVIEW_CHARS).collect()
    }
}

/// Wire shape `{chat_title, sender, message, chat_id, message_id}`.
#[derive(Debug, Serialize)]
pub struct EventProjection<'a> {
    /// Origin title.
    pub chat_title: &'a str,
    /// Sender display name.
    pub sender: &'a str,
    /// Message text.
    pub message: &'a str,
    /// Origin identifier.
    pub chat_id: i64,
    /// Message identifier.
    pub message_id: i64,
}

/// A queued event together with its retry bookkeeping.
#[derive(Debug, Clone)]
pub struct DeliveryTask {
    /// The event being delivered.
    pub event: NormalizedEvent,
    /// Number of failed attempts so far.
    pub attempt: u32,
    /// When the event first entered the queue.
    pub first_enqueued_at: Instant,
}

impl DeliveryTask {
    /// Wrap a freshly accepted event.
    pub fn new(event: NormalizedEvent) -> Self {
        Self {
            event,
            attempt: 0,
            first_enqueued_at: Instant::now(),
        }
    }

    /// The same task, one attempt later.
    #[must_use]
    pub fn next_attempt(self) -> Self {
        Self {
            attempt: self.attempt.saturating_add(1),
            ..self
        }
    }
}

#[cfg(test)]
pub(crate) fn sample_event(origin_id: i64, body: &str) -> NormalizedEvent {
    NormalizedEvent {
        origin_id,
        origin_title: "Ops".to_owned(),
        sender_name: "Alice".to_owned(),
        body: body.to_owned(),
        message_id: 7,
        is_muted: false,
    }
}
