//! Group bot webhooks (WeCom and Feishu).
//!
//! Both backends accept a POST with a fixed JSON template and answer `200`
//! with an error code in the body, so a 2xx is not enough to call a delivery
//! successful.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::{read_success_body, render_text, sanitize_body, DeliveryError, SinkAdapter};
use crate::event::NormalizedEvent;

/// WeCom group bot "API frequency exceeded" code.
const WECOM_RATE_LIMITED: i64 = 45009;

/// Feishu custom bot "request frequency limited" code.
const FEISHU_RATE_LIMITED: i64 = 11232;

/// Which group bot dialect to speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookFlavor {
    /// WeCom group robot, markdown message.
    Wecom,
    /// Feishu custom bot, text message.
    Feishu,
}

impl WebhookFlavor {
    fn name(self) -> &'static str {
        match self {
            Self::Wecom => "wecom",
            Self::Feishu => "feishu",
        }
    }

    fn rate_limit_code(self) -> i64 {
        match self {
            Self::Wecom => WECOM_RATE_LIMITED,
            Self::Feishu => FEISHU_RATE_LIMITED,
        }
    }
}

/// Acknowledgement body returned by both group bots.
///
/// WeCom uses `errcode`/`errmsg`, Feishu `code`/`msg` (older Feishu
/// deployments answer `StatusCode`/`StatusMessage`).
#[doc(hidden)]
#[derive(Debug, Deserialize)]
pub struct WebhookAck {
    /// WeCom error code.
    pub errcode: Option<i64>,
    /// WeCom error message.
    pub errmsg: Option<String>,
    /// Feishu error code.
    pub code: Option<i64>,
    /// Feishu error message.
    pub msg: Option<String>,
    /// Legacy Feishu status code.
    #[serde(rename = "StatusCode")]
    pub status_code: Option<i64>,
}

impl WebhookAck {
    fn code(&self) -> Option<i64> {
        self.errcode.or(self.code).or(self.status_code)
    }

    fn message(&self) -> &str {
        self.errmsg
            .as_deref()
            .or(self.msg.as_deref())
            .unwrap_or_default()
    }
}

/// Stateless group bot sink.
#[derive(Debug, Clone)]
pub struct GroupWebhookAdapter {
    url: String,
    flavor: WebhookFlavor,
    client: reqwest::Client,
}

impl GroupWebhookAdapter {
    /// WeCom group robot posting markdown to `url`.
    pub fn wecom(client: reqwest::Client, url: String) -> Self {
        Self {
            url,
            flavor: WebhookFlavor::Wecom,
            client,
        }
    }

    /// Feishu custom bot posting text to `url`.
    pub fn feishu(client: reqwest::Client, url: String) -> Self {
        Self {
            url,
            flavor: WebhookFlavor::Feishu,
            client,
        }
    }

    /// The dialect this adapter speaks.
    pub fn flavor(&self) -> WebhookFlavor {
        self.flavor
    }
}

/// Build the request body for a group bot.
#[doc(hidden)]
pub fn build_body(flavor: WebhookFlavor, event: &NormalizedEvent) -> Value {
    let text = render_text(event, true);
    match flavor {
        WebhookFlavor::Wecom => json!({
            "msgtype": "markdown",
            "markdown": { "content": text },
        }),
        WebhookFlavor::Feishu => json!({
            "msg_type": "text",
            "content": { "text": text },
        }),
    }
}

/// Interpret a 2xx acknowledgement body.
///
/// # Errors
///
/// Returns [`DeliveryError::Permanent`] for unparsable bodies and backend
/// error codes, except the backend's rate-limit code which is transient.
#[doc(hidden)]
pub fn check_ack(flavor: WebhookFlavor, body: &str) -> Result<(), DeliveryError> {
    let ack: WebhookAck = serde_json::from_str(body).map_err(|e| {
        DeliveryError::Permanent(format!(
            "malformed {} response ({e}): {}",
            flavor.name(),
            sanitize_body(body)
        ))
    })?;

    match ack.code() {
        Some(0) | None => Ok(()),
        Some(code) if code == flavor.rate_limit_code() => Err(DeliveryError::Transient(
            format!("{} rate limited: {}", flavor.name(), ack.message()),
        )),
        Some(code) => Err(DeliveryError::Permanent(format!(
            "{} rejected message: code {code}: {}",
            flavor.name(),
            ack.message()
        ))),
    }
}

#[async_trait]
impl SinkAdapter for GroupWebhookAdapter {
    async fn send(&self, event: &NormalizedEvent) -> Result<(), DeliveryError> {
        let body = build_body(self.flavor, event);
        let response = self.client.post(&self.url).json(&body).send().await?;
        let text = read_success_body(response).await?;
        check_ack(self.flavor, &text)?;
        debug!(sink = self.flavor.name(), response = %sanitize_body(&text), "webhook accepted message");
        Ok(())
    }

    fn name(&self) -> &str {
        self.flavor.name()
    }
}
