//! Telegram Bot API source using `getUpdates` long polling.
//!
//! Updates are only fetched when the service asks for the next event, so the
//! bot server buffers for us while the delivery queue is full. The offset is
//! acknowledged on the next `getUpdates` call, which only happens once the
//! current batch has been handed out. After a crash, unacknowledged updates
//! are delivered again, so a restart can duplicate part of a batch.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::{AllowedUpdate, Chat, MessageKind, UpdateKind};
use teloxide::{ApiError, RequestError};
use tracing::{debug, info};

use super::{EventSource, MuteLookup, SourceError};
use crate::event::{NormalizedEvent, EMPTY_BODY_PLACEHOLDER, UNKNOWN_LABEL};

/// Bot API long-polling source.
pub struct TelegramSource {
    bot: Bot,
    offset: i32,
    poll_timeout_secs: u32,
    pending: VecDeque<NormalizedEvent>,
    mutes: Arc<dyn MuteLookup>,
}

impl std::fmt::Debug for TelegramSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramSource")
            .field("offset", &self.offset)
            .field("poll_timeout_secs", &self.poll_timeout_secs)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

/// Slack on top of the long-poll timeout before the HTTP client gives up.
const CLIENT_TIMEOUT_MARGIN: Duration = Duration::from_secs(10);

/// HTTP timeout for a bot whose `getUpdates` waits `poll_timeout_secs`.
///
/// The client timeout has to outlast the server-side poll, otherwise every
/// quiet poll ends as a network error.
pub fn client_timeout(poll_timeout_secs: u32) -> Duration {
    Duration::from_secs(u64::from(poll_timeout_secs)).saturating_add(CLIENT_TIMEOUT_MARGIN)
}

impl TelegramSource {
    /// Create a source for `bot_token`.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Connect`] when the HTTP client cannot be built.
    pub fn new(
        bot_token: &str,
        poll_timeout_secs: u32,
        mutes: Arc<dyn MuteLookup>,
    ) -> Result<Self, SourceError> {
        let client = teloxide::net::default_reqwest_settings()
            .timeout(client_timeout(poll_timeout_secs))
            .build()
            .map_err(|e| SourceError::Connect(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            bot: Bot::with_client(bot_token, client),
            offset: 0,
            poll_timeout_secs,
            pending: VecDeque::new(),
            mutes,
        })
    }

    async fn poll(&mut self) -> Result<(), SourceError> {
        let updates = self
            .bot
            .get_updates()
            .offset(self.offset)
            .timeout(self.poll_timeout_secs)
            .allowed_updates(vec![AllowedUpdate::Message, AllowedUpdate::ChannelPost])
            .await
            .map_err(|e| classify(&e, SourceError::Disconnected))?;

        for update in updates {
            let next = i32::try_from(update.id.0)
                .ok()
                .and_then(|id| id.checked_add(1))
                .unwrap_or(i32::MAX);
            self.offset = self.offset.max(next);

            let message = match &update.kind {
                UpdateKind::Message(message) | UpdateKind::ChannelPost(message) => message,
                _ => continue,
            };
            match normalize_message(message, self.mutes.as_ref()) {
                Some(event) => self.pending.push_back(event),
                None => debug!(chat_id = message.chat.id.0, "skipping service message"),
            }
        }
        Ok(())
    }
}

fn classify(err: &RequestError, wrap: fn(String) -> SourceError) -> SourceError {
    match err {
        RequestError::Api(ApiError::InvalidToken) => SourceError::Unauthorized(err.to_string()),
        other => wrap(other.to_string()),
    }
}

#[async_trait]
impl EventSource for TelegramSource {
    async fn connect(&mut self) -> Result<(), SourceError> {
        let me = self
            .bot
            .get_me()
            .await
            .map_err(|e| classify(&e, SourceError::Connect))?;
        info!(
            bot = %me.username(),
            offset = self.offset,
            "connected to Telegram Bot API"
        );
        Ok(())
    }

    async fn next_event(&mut self) -> Result<Option<NormalizedEvent>, SourceError> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(Some(event));
            }
            self.poll().await?;
        }
    }

    fn supports_backpressure(&self) -> bool {
        true
    }

    fn close(&mut self) -> Vec<NormalizedEvent> {
        self.pending.drain(..).collect()
    }

    fn name(&self) -> &str {
        "telegram"
    }
}

/// Convert a message into an event. Service messages yield `None`.
pub fn normalize_message(message: &Message, mutes: &dyn MuteLookup) -> Option<NormalizedEvent> {
    if !matches!(message.kind, MessageKind::Common(_)) {
        return None;
    }

    let sender = match &message.from {
        Some(user) => Some(user.full_name()),
        None => message
            .sender_chat
            .as_ref()
            .and_then(|chat| chat.title())
            .map(str::to_owned),
    };

    Some(compose_event(
        message.chat.id.0,
        chat_title(&message.chat),
        sender,
        message.text().or_else(|| message.caption()),
        i64::from(message.id.0),
        mutes,
    ))
}

/// Display title of a chat: group/channel title, or the user's full name.
pub fn chat_title(chat: &Chat) -> String {
    if let Some(title) = chat.title() {
        return title.to_owned();
    }
    match (chat.first_name(), chat.last_name()) {
        (Some(first), Some(last)) => format!("{first} {last}"),
        (Some(first), None) => first.to_owned(),
        _ => UNKNOWN_LABEL.to_owned(),
    }
}

/// Apply placeholder and fallback rules to raw message parts.
pub fn compose_event(
    origin_id: i64,
    origin_title: String,
    sender_name: Option<String>,
    text: Option<&str>,
    message_id: i64,
    mutes: &dyn MuteLookup,
) -> NormalizedEvent {
    let body = text
        .filter(|t| !t.trim().is_empty())
        .unwrap_or(EMPTY_BODY_PLACEHOLDER)
        .to_owned();
    let sender_name = sender_name
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| UNKNOWN_LABEL.to_owned());
    NormalizedEvent {
        origin_id,
        origin_title,
        sender_name,
        body,
        message_id,
        is_muted: mutes.is_muted(origin_id),
    }
}
