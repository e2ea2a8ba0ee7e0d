//! Generic HTTP sink with a configured method, URL and headers.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::Method;

use super::{read_success_body, DeliveryError, SinkAdapter};
use crate::config::{ConfigError, CustomConfig};
use crate::event::NormalizedEvent;

/// Sends the canonical event projection to an arbitrary endpoint.
#[derive(Debug, Clone)]
pub struct CustomHttpAdapter {
    client: reqwest::Client,
    method: Method,
    url: String,
    headers: HeaderMap,
}

impl CustomHttpAdapter {
    /// Create an adapter with pre-validated method and headers.
    pub fn new(client: reqwest::Client, method: Method, url: String, headers: HeaderMap) -> Self {
        Self {
            client,
            method,
            url,
            headers,
        }
    }

    /// Validate the configured method and headers and build the adapter.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidMethod`] or [`ConfigError::InvalidHeader`].
    pub fn from_config(client: reqwest::Client, config: &CustomConfig) -> Result<Self, ConfigError> {
        let method = parse_method(&config.method)?;
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        for (name, value) in &config.headers {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| ConfigError::InvalidHeader(name.clone()))?;
            let header_value =
                HeaderValue::from_str(value).map_err(|_| ConfigError::InvalidHeader(name.clone()))?;
            headers.insert(header_name, header_value);
        }
        Ok(Self::new(client, method, config.url.clone(), headers))
    }

    /// Configured HTTP method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Headers applied to every request.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }
}

/// Parse an HTTP method name, case-insensitively.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidMethod`] for names that are not valid tokens.
pub fn parse_method(raw: &str) -> Result<Method, ConfigError> {
    let upper = raw.trim().to_ascii_uppercase();
    if upper.is_empty() {
        return Err(ConfigError::InvalidMethod(raw.to_owned()));
    }
    Method::from_bytes(upper.as_bytes()).map_err(|_| ConfigError::InvalidMethod(raw.to_owned()))
}

#[async_trait]
impl SinkAdapter for CustomHttpAdapter {
    async fn send(&self, event: &NormalizedEvent) -> Result<(), DeliveryError> {
        let response = self
            .client
            .request(self.method.clone(), &self.url)
            .headers(self.headers.clone())
            .json(&event.projection())
            .send()
            .await?;
        read_success_body(response).await?;
        Ok(())
    }

    fn name(&self) -> &str {
        "custom"
    }
}
