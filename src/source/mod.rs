//! Upstream event sources.
//!
//! The service pulls events with [`EventSource::next_event`]. A source that
//! only produces when asked is *pausable*: while the delivery queue is full
//! the service simply stops asking. A push-based source that keeps buffering
//! regardless reports `supports_backpressure() == false`, and the service
//! falls back to bounded-wait enqueue with drop-oldest.
//!
//! Two sources are provided:
//! - [`telegram::TelegramSource`]: Bot API long polling, pausable
//! - [`ChannelSource`]: in-process channel, not pausable

use std::collections::BTreeSet;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::event::NormalizedEvent;

pub mod telegram;

/// Source failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    /// Initial connection failed; may be retried.
    #[error("source connection failed: {0}")]
    Connect(String),
    /// Established connection was lost; may be retried.
    #[error("source disconnected: {0}")]
    Disconnected(String),
    /// Credentials were refused; retrying will not help.
    #[error("source rejected credentials: {0}")]
    Unauthorized(String),
}

impl SourceError {
    /// Whether reconnecting cannot succeed.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unauthorized(_))
    }
}

/// Stream of normalized inbound events.
#[async_trait]
pub trait EventSource: Send {
    /// Establish or re-establish the upstream connection.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] when the upstream is unreachable or refuses
    /// the credentials.
    async fn connect(&mut self) -> Result<(), SourceError>;

    /// Wait for the next event. `Ok(None)` means the source has ended.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Disconnected`] when the connection drops.
    async fn next_event(&mut self) -> Result<Option<NormalizedEvent>, SourceError>;

    /// Whether the source stops producing while it is not polled.
    fn supports_backpressure(&self) -> bool;

    /// Stop accepting upstream events and return the ones already buffered
    /// locally but not yet handed out. Called once when the service stops
    /// reading.
    fn close(&mut self) -> Vec<NormalizedEvent> {
        Vec::new()
    }

    /// Short name for logs.
    fn name(&self) -> &str;
}

/// Mute state of an origin at receipt time.
pub trait MuteLookup: Send + Sync {
    /// Whether `origin_id` is currently muted.
    fn is_muted(&self, origin_id: i64) -> bool;
}

/// Mute state from a fixed list of chat ids.
#[derive(Debug, Clone, Default)]
pub struct StaticMuteList {
    muted: BTreeSet<i64>,
}

impl StaticMuteList {
    /// Treat the given chats as muted.
    pub fn new(muted: BTreeSet<i64>) -> Self {
        Self { muted }
    }
}

impl MuteLookup for StaticMuteList {
    fn is_muted(&self, origin_id: i64) -> bool {
        self.muted.contains(&origin_id)
    }
}

/// Producer half of a [`ChannelSource`].
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<NormalizedEvent>,
}

impl EventSender {
    /// Push an event. Returns `false` once the source has been closed or
    /// dropped.
    pub fn send(&self, event: NormalizedEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

/// Push-based in-process source. Events are buffered without limit on the
/// sender side, so it cannot apply backpressure.
#[derive(Debug)]
pub struct ChannelSource {
    rx: mpsc::UnboundedReceiver<NormalizedEvent>,
}

impl ChannelSource {
    /// Create a connected sender/source pair. The source ends when every
    /// sender is dropped.
    pub fn new() -> (EventSender, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (EventSender { tx }, Self { rx })
    }
}

#[async_trait]
impl EventSource for ChannelSource {
    async fn connect(&mut self) -> Result<(), SourceError> {
        Ok(())
    }

    async fn next_event(&mut self) -> Result<Option<NormalizedEvent>, SourceError> {
        Ok(self.rx.recv().await)
    }

    fn supports_backpressure(&self) -> bool {
        false
    }

    fn close(&mut self) -> Vec<NormalizedEvent> {
        self.rx.close();
        let mut unread = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            unread.push(event);
        }
        unread
    }

    fn name(&self) -> &str {
        "channel"
    }
}
