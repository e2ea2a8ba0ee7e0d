//! Outbound delivery backends.
//!
//! Every backend implements [`SinkAdapter`]. Exactly one adapter is built at
//! startup by [`build_sink`] from the configured forwarder type, and the
//! dispatcher only ever sees the trait object.
//!
//! Three adapters are implemented:
//! - [`webhook::GroupWebhookAdapter`]: WeCom and Feishu group bot webhooks
//! - [`app::AuthenticatedAppAdapter`]: WeCom application push with an access token
//! - [`custom::CustomHttpAdapter`]: arbitrary HTTP endpoint with configured headers

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::StatusCode;

use crate::config::{Config, ConfigError, SinkKind};
use crate::event::NormalizedEvent;

pub mod app;
pub mod custom;
pub mod webhook;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Outcome of a failed delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    /// Network failure, timeout, 5xx or rate limiting. Worth retrying.
    #[error("transient delivery failure: {0}")]
    Transient(String),
    /// Bad configuration, 4xx or a backend error code. Never retried.
    #[error("permanent delivery failure: {0}")]
    Permanent(String),
    /// Backend rejected the access token. Only produced inside the app sink.
    #[error("access token rejected by backend (code {code})")]
    AuthExpired {
        /// Backend error code.
        code: i64,
    },
}

impl DeliveryError {
    /// Whether the dispatcher should schedule another attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Permanent(_))
    }
}

impl From<reqwest::Error> for DeliveryError {
    fn from(err: reqwest::Error) -> Self {
        // Request URLs may carry access tokens.
        let err = err.without_url();
        if err.is_builder() {
            Self::Permanent(format!("invalid request: {err}"))
        } else {
            Self::Transient(format!("request failed: {err}"))
        }
    }
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// A pluggable outbound delivery backend.
///
/// Implementations must be `Send + Sync`; one instance is shared by every
/// dispatcher worker.
#[async_trait]
pub trait SinkAdapter: Send + Sync {
    /// Deliver one event.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::Transient`] for failures worth retrying and
    /// [`DeliveryError::Permanent`] for failures that never will succeed.
    async fn send(&self, event: &NormalizedEvent) -> Result<(), DeliveryError>;

    /// Short backend name used in logs.
    fn name(&self) -> &str;
}

/// Build the adapter selected by `config.forwarder.kind`.
///
/// # Errors
///
/// Returns [`ConfigError`] when the selected backend's section is missing or
/// invalid, or the HTTP client cannot be built.
pub fn build_sink(config: &Config) -> Result<Arc<dyn SinkAdapter>, ConfigError> {
    let client = http_client(config.pipeline.request_timeout())?;
    let sink: Arc<dyn SinkAdapter> = match config.forwarder.kind {
        SinkKind::Wecom => {
            let section = config.wecom.as_ref().ok_or(ConfigError::MissingSection("wecom"))?;
            Arc::new(webhook::GroupWebhookAdapter::wecom(
                client,
                section.webhook_url.clone(),
            ))
        }
        SinkKind::Feishu => {
            let section = config
                .feishu
                .as_ref()
                .ok_or(ConfigError::MissingSection("feishu"))?;
            Arc::new(webhook::GroupWebhookAdapter::feishu(
                client,
                section.webhook_url.clone(),
            ))
        }
        SinkKind::WecomApp => {
            let section = config
                .wecom_app
                .as_ref()
                .ok_or(ConfigError::MissingSection("wecom_app"))?;
            Arc::new(app::AuthenticatedAppAdapter::from_config(client, section))
        }
        SinkKind::Custom => {
            let section = config
                .custom
                .as_ref()
                .ok_or(ConfigError::MissingSection("custom"))?;
            Arc::new(custom::CustomHttpAdapter::from_config(client, section)?)
        }
    };
    Ok(sink)
}

/// Shared HTTP client with the configured per-request timeout.
///
/// # Errors
///
/// Returns [`ConfigError::HttpClient`] if the TLS backend cannot initialise.
pub fn http_client(timeout: Duration) -> Result<reqwest::Client, ConfigError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| ConfigError::HttpClient(e.to_string()))
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// Text block shared by the group and app templates.
pub fn render_text(event: &NormalizedEvent, bold_title: bool) -> String {
    let title = if bold_title {
        format!("**{}**", event.origin_title)
    } else {
        event.origin_title.clone()
    };
    format!(
        "{title}\nMessage: {}\nSender: {}",
        event.body, event.sender_name
    )
}

/// Map a non-success HTTP status to a delivery error.
///
/// Server errors, 408 and 429 are transient; every other status is permanent.
pub fn classify_status(status: StatusCode, body: &str) -> DeliveryError {
    let detail = format!("status {}: {}", status.as_u16(), sanitize_body(body));
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        DeliveryError::Transient(detail)
    } else {
        DeliveryError::Permanent(detail)
    }
}

/// Check the response status and return the body text.
///
/// # Errors
///
/// Returns [`DeliveryError::Transient`] on transport failure while reading the
/// body, and the [`classify_status`] result on non-2xx statuses.
pub async fn read_success_body(response: reqwest::Response) -> Result<String, DeliveryError> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(classify_status(status, &body));
    }
    Ok(body)
}

/// Collapse whitespace, redact token-like values and truncate a response body.
pub fn sanitize_body(raw: &str) -> String {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");

    let mut sanitized = collapsed;
    for pattern in [
        r"access_token=[A-Za-z0-9_\-\.]+",
        r#""access_token"\s*:\s*"[^"]*""#,
        r"(?i)bearer\s+[A-Za-z0-9_\-\.=]{8,}",
    ] {
        if let Ok(regex) = Regex::new(pattern) {
            sanitized = regex.replace_all(&sanitized, "[REDACTED]").into_owned();
        }
    }

    const MAX_ERROR_BODY_CHARS: usize = 256;
    if sanitized.chars().count() > MAX_ERROR_BODY_CHARS {
        let shortened = sanitized
            .chars()
            .take(MAX_ERROR_BODY_CHARS)
            .collect::<String>();
        return format!("{shortened}...[truncated]");
    }

    sanitized
}
