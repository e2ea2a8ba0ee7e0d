//! WeCom application push with a cached access token.
//!
//! Sending requires an `access_token` obtained from the `gettoken` endpoint
//! with the corp id and secret. Tokens live for about two hours; the shared
//! [`CredentialCache`] refreshes them ahead of expiry. When the backend still
//! rejects a token, the adapter invalidates it, acquires a new one and resends
//! exactly once before reporting a failure.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{read_success_body, render_text, sanitize_body, DeliveryError, SinkAdapter};
use crate::config::WecomAppConfig;
use crate::credentials::{AcquiredToken, AcquisitionError, CredentialCache, TokenSource};
use crate::event::NormalizedEvent;

/// Public WeCom API host.
pub const WECOM_API_BASE: &str = "https://qyapi.weixin.qq.com";

/// Codes WeCom returns for invalid, malformed or expired access tokens.
const AUTH_REJECTED_CODES: [i64; 3] = [40001, 40014, 42001];

/// API frequency exceeded.
const RATE_LIMITED: i64 = 45009;

/// Default token lifetime when the endpoint omits `expires_in`.
const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(7200);

/// Who receives an application message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipients {
    /// Every member visible to the application (`@all`).
    All,
    /// Explicit member ids.
    Users(Vec<String>),
}

impl Recipients {
    /// Build from a list of ids; an empty list or `@all` means everyone.
    pub fn from_ids(ids: &[String]) -> Self {
        let ids: Vec<String> = ids
            .iter()
            .map(|id| id.trim())
            .filter(|id| !id.is_empty())
            .map(str::to_owned)
            .collect();
        if ids.is_empty() || ids.iter().any(|id| id == "@all") {
            Self::All
        } else {
            Self::Users(ids)
        }
    }

    /// Wire value of the `touser` field.
    pub fn selector(&self) -> String {
        match self {
            Self::All => "@all".to_owned(),
            Self::Users(ids) => ids.join("|"),
        }
    }
}

// ---------------------------------------------------------------------------
// Token endpoint
// ---------------------------------------------------------------------------

/// `gettoken` response body.
#[doc(hidden)]
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    /// Error code, `0` on success.
    #[serde(default)]
    pub errcode: i64,
    /// Error message.
    #[serde(default)]
    pub errmsg: String,
    /// Issued token.
    pub access_token: Option<String>,
    /// Lifetime in seconds.
    pub expires_in: Option<u64>,
}

/// Parse a `gettoken` response body.
///
/// # Errors
///
/// Returns [`AcquisitionError::Parse`] for malformed bodies and
/// [`AcquisitionError::Rejected`] for non-zero error codes.
#[doc(hidden)]
pub fn parse_token_response(body: &str) -> Result<AcquiredToken, AcquisitionError> {
    let parsed: TokenResponse = serde_json::from_str(body)
        .map_err(|e| AcquisitionError::Parse(format!("{e}: {}", sanitize_body(body))))?;
    if parsed.errcode != 0 {
        return Err(AcquisitionError::Rejected {
            code: parsed.errcode,
            message: parsed.errmsg,
        });
    }
    let token = parsed
        .access_token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| AcquisitionError::Parse("response has no access_token".to_owned()))?;
    Ok(AcquiredToken {
        token,
        expires_in: parsed
            .expires_in
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TOKEN_LIFETIME),
    })
}

/// Acquires WeCom application tokens from `gettoken`.
pub struct WecomTokenSource {
    client: reqwest::Client,
    api_base: String,
    corp_id: String,
    corp_secret: String,
}

impl std::fmt::Debug for WecomTokenSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WecomTokenSource")
            .field("api_base", &self.api_base)
            .field("corp_id", &self.corp_id)
            .field("corp_secret", &"[REDACTED]")
            .finish()
    }
}

impl WecomTokenSource {
    /// Create a token source against `api_base`.
    pub fn new(
        client: reqwest::Client,
        api_base: impl Into<String>,
        corp_id: impl Into<String>,
        corp_secret: impl Into<String>,
    ) -> Self {
        Self {
            client,
            api_base: api_base.into(),
            corp_id: corp_id.into(),
            corp_secret: corp_secret.into(),
        }
    }
}

#[async_trait]
impl TokenSource for WecomTokenSource {
    async fn acquire(&self) -> Result<AcquiredToken, AcquisitionError> {
        let url = format!("{}/cgi-bin/gettoken", self.api_base.trim_end_matches('/'));
        let response = self
            .client
            .get(url)
            .query(&[
                ("corpid", self.corp_id.as_str()),
                ("corpsecret", self.corp_secret.as_str()),
            ])
            .send()
            .await
            .map_err(|e| AcquisitionError::Transport(e.without_url().to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AcquisitionError::Transport(e.without_url().to_string()))?;
        if !status.is_success() {
            return Err(AcquisitionError::HttpStatus {
                status: status.as_u16(),
                body: sanitize_body(&body),
            });
        }
        parse_token_response(&body)
    }
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

/// `message/send` response body.
#[derive(Debug, Deserialize)]
struct SendResponse {
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: String,
}

/// Build the `message/send` request body.
#[doc(hidden)]
pub fn build_body(agent_id: i64, recipients: &Recipients, event: &NormalizedEvent) -> Value {
    json!({
        "touser": recipients.selector(),
        "msgtype": "text",
        "agentid": agent_id,
        "text": { "content": render_text(event, false) },
        "safe": 0,
        "enable_id_trans": 0,
        "enable_duplicate_check": 0,
    })
}

/// Interpret a `message/send` response body.
///
/// # Errors
///
/// Returns [`DeliveryError::AuthExpired`] for token rejections,
/// [`DeliveryError::Transient`] for rate limiting and
/// [`DeliveryError::Permanent`] otherwise.
#[doc(hidden)]
pub fn check_send_response(body: &str) -> Result<(), DeliveryError> {
    let parsed: SendResponse = serde_json::from_str(body).map_err(|e| {
        DeliveryError::Permanent(format!("malformed send response ({e}): {}", sanitize_body(body)))
    })?;
    match parsed.errcode {
        0 => Ok(()),
        code if AUTH_REJECTED_CODES.contains(&code) => Err(DeliveryError::AuthExpired { code }),
        RATE_LIMITED => Err(DeliveryError::Transient(format!(
            "wecom-app rate limited: {}",
            parsed.errmsg
        ))),
        code => Err(DeliveryError::Permanent(format!(
            "wecom-app rejected message: code {code}: {}",
            parsed.errmsg
        ))),
    }
}

/// WeCom application sink.
#[derive(Debug)]
pub struct AuthenticatedAppAdapter {
    client: reqwest::Client,
    api_base: String,
    agent_id: i64,
    recipients: Recipients,
    credentials: Arc<CredentialCache>,
}

impl AuthenticatedAppAdapter {
    /// Create an adapter using an existing credential cache.
    pub fn new(
        client: reqwest::Client,
        api_base: impl Into<String>,
        agent_id: i64,
        recipients: Recipients,
        credentials: Arc<CredentialCache>,
    ) -> Self {
        Self {
            client,
            api_base: api_base.into(),
            agent_id,
            recipients,
            credentials,
        }
    }

    /// Create an adapter and its own token cache from configuration.
    pub fn from_config(client: reqwest::Client, config: &WecomAppConfig) -> Self {
        let source = WecomTokenSource::new(
            client.clone(),
            config.api_base.clone(),
            config.corp_id.clone(),
            config.corp_secret.clone(),
        );
        let credentials = Arc::new(CredentialCache::new(Arc::new(source)));
        Self::new(
            client,
            config.api_base.clone(),
            config.agent_id,
            Recipients::from_ids(&config.recipients),
            credentials,
        )
    }

    /// The cache holding this adapter's access token.
    pub fn credentials(&self) -> &CredentialCache {
        &self.credentials
    }

    async fn token(&self) -> Result<String, DeliveryError> {
        self.credentials
            .get_valid()
            .await
            .map_err(|e| DeliveryError::Transient(format!("token acquisition failed: {e}")))
    }

    async fn send_with_token(
        &self,
        token: &str,
        event: &NormalizedEvent,
    ) -> Result<(), DeliveryError> {
        let url = format!("{}/cgi-bin/message/send", self.api_base.trim_end_matches('/'));
        let body = build_body(self.agent_id, &self.recipients, event);
        let response = self
            .client
            .post(url)
            .query(&[("access_token", token)])
            .json(&body)
            .send()
            .await?;
        let text = read_success_body(response).await?;
        check_send_response(&text)
    }
}

#[async_trait]
impl SinkAdapter for AuthenticatedAppAdapter {
    async fn send(&self, event: &NormalizedEvent) -> Result<(), DeliveryError> {
        let token = self.token().await?;
        match self.send_with_token(&token, event).await {
            Err(DeliveryError::AuthExpired { code }) => {
                warn!(code, "access token rejected, refreshing once");
                self.credentials.invalidate_rejected(&token).await;
                let fresh = self.token().await?;
                match self.send_with_token(&fresh, event).await {
                    Err(DeliveryError::AuthExpired { code }) => Err(DeliveryError::Transient(
                        format!("access token rejected again after refresh (code {code})"),
                    )),
                    other => other,
                }
            }
            Ok(()) => {
                debug!(message_id = event.message_id, "wecom-app accepted message");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn name(&self) -> &str {
        "wecom-app"
    }
}
