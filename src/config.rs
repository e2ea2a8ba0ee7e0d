//! Configuration loading and validation.
//!
//! Settings come from `courier.toml` (path from `--config`, then
//! `$COURIER_CONFIG`, then `./courier.toml`). Environment variables override
//! file values; file values override defaults. The variable names follow the
//! forwarder's established `.env` layout (`FORWARDER_TYPE`, `WHITELIST_CHATS`,
//! `WECOM_CORPID`, ...), so an existing `.env` keeps working.
//!
//! Configuration is read once at startup. There is no hot reload.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use tracing::{info, warn};

use crate::dispatcher::RetryPolicy;
use crate::filter::FilterPolicy;
use crate::sinks::app::WECOM_API_BASE;

/// Default config file name in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "courier.toml";

/// Environment variable naming an alternative config file.
pub const CONFIG_PATH_ENV: &str = "COURIER_CONFIG";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Invalid or unreadable configuration. Always fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file exists but cannot be read.
    #[error("failed to read config at {}: {source}", path.display())]
    Read {
        /// File path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// Config file is not valid TOML or does not match the schema.
    #[error("failed to parse config: {0}")]
    Parse(String),
    /// `forwarder.type` / `FORWARDER_TYPE` names no known backend.
    #[error("unknown forwarder type {0:?} (expected wecom, wecom-app, feishu or custom)")]
    UnknownForwarder(String),
    /// The selected backend has no configuration section.
    #[error("missing [{0}] section for the selected forwarder")]
    MissingSection(&'static str),
    /// A required value is empty.
    #[error("{0} must not be empty")]
    EmptyField(&'static str),
    /// A URL does not parse or is not http(s).
    #[error("invalid URL for {field}: {value:?}")]
    InvalidUrl {
        /// Config key.
        field: &'static str,
        /// Offending value.
        value: String,
    },
    /// Custom sink method is not a valid HTTP method.
    #[error("invalid HTTP method: {0:?}")]
    InvalidMethod(String),
    /// Custom sink header name or value is not valid HTTP.
    #[error("invalid header: {0:?}")]
    InvalidHeader(String),
    /// A numeric setting must be positive.
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    /// HTTP client could not be constructed.
    #[error("failed to build HTTP client: {0}")]
    HttpClient(String),
    /// The Telegram source needs a bot token.
    #[error("telegram bot token is not configured (set TELEGRAM_BOT_TOKEN or [telegram].bot_token)")]
    MissingBotToken,
    /// Home directory cannot be resolved for default paths.
    #[error("cannot determine home directory")]
    NoHomeDir,
}

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Backend selection.
    pub forwarder: ForwarderConfig,
    /// Which events are forwarded.
    pub filter: FilterPolicy,
    /// Queue, worker and retry tuning.
    pub pipeline: PipelineConfig,
    /// Telegram event source.
    pub telegram: TelegramConfig,
    /// Log file location.
    pub logging: LoggingConfig,
    /// WeCom group robot.
    pub wecom: Option<WebhookConfig>,
    /// Feishu custom bot.
    pub feishu: Option<WebhookConfig>,
    /// WeCom application push.
    pub wecom_app: Option<WecomAppConfig>,
    /// Custom HTTP endpoint.
    pub custom: Option<CustomConfig>,
}

/// Backend selection.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ForwarderConfig {
    /// Selected backend.
    #[serde(rename = "type", default)]
    pub kind: SinkKind,
}

/// Supported delivery backends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum SinkKind {
    /// WeCom group robot webhook.
    #[default]
    Wecom,
    /// WeCom application push.
    WecomApp,
    /// Feishu custom bot webhook.
    Feishu,
    /// Custom HTTP API.
    Custom,
}

impl SinkKind {
    /// Canonical lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Wecom => "wecom",
            Self::WecomApp => "wecom-app",
            Self::Feishu => "feishu",
            Self::Custom => "custom",
        }
    }
}

impl fmt::Display for SinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SinkKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "wecom" => Ok(Self::Wecom),
            "wecom-app" | "wecom_app" => Ok(Self::WecomApp),
            "feishu" => Ok(Self::Feishu),
            "custom" => Ok(Self::Custom),
            _ => Err(ConfigError::UnknownForwarder(s.to_owned())),
        }
    }
}

impl TryFrom<String> for SinkKind {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Queue, worker and retry tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Maximum queued deliveries.
    pub queue_capacity: usize,
    /// Number of dispatcher workers.
    pub workers: usize,
    /// Retries after the first failed attempt.
    pub max_retries: u32,
    /// First backoff delay in milliseconds.
    pub backoff_base_ms: u64,
    /// Backoff ceiling in milliseconds.
    pub backoff_max_ms: u64,
    /// How long a non-pausable source waits for queue space before evicting.
    pub enqueue_timeout_ms: u64,
    /// How long shutdown waits for the queue to drain.
    pub shutdown_grace_secs: u64,
    /// Per-request HTTP timeout.
    pub request_timeout_secs: u64,
    /// Reconnect attempts before a source disconnection becomes fatal.
    pub max_reconnects: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            workers: 2,
            max_retries: 5,
            backoff_base_ms: 500,
            backoff_max_ms: 60_000,
            enqueue_timeout_ms: 5_000,
            shutdown_grace_secs: 10,
            request_timeout_secs: 10,
            max_reconnects: 5,
        }
    }
}

impl PipelineConfig {
    /// Retry policy derived from the backoff settings.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_max_ms),
            self.max_retries,
        )
    }

    /// Per-request HTTP timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Bounded wait before drop-oldest.
    pub fn enqueue_timeout(&self) -> Duration {
        Duration::from_millis(self.enqueue_timeout_ms)
    }

    /// Drain grace period.
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Telegram event source settings.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    /// Bot API token.
    pub bot_token: Option<String>,
    /// Long-poll timeout passed to `getUpdates`.
    pub poll_timeout_secs: u32,
    /// Chats treated as muted.
    pub muted_chats: BTreeSet<i64>,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: None,
            poll_timeout_secs: 30,
            muted_chats: BTreeSet::new(),
        }
    }
}

impl fmt::Debug for TelegramConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelegramConfig")
            .field("bot_token", &self.bot_token.as_ref().map(|_| "[REDACTED]"))
            .field("poll_timeout_secs", &self.poll_timeout_secs)
            .field("muted_chats", &self.muted_chats)
            .finish()
    }
}

/// Log file location.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Directory for rotated JSON logs. Defaults to `~/.courier/logs`.
    pub logs_dir: Option<PathBuf>,
}

impl LoggingConfig {
    /// Resolve the logs directory.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NoHomeDir`] when no directory is configured and
    /// the home directory cannot be determined.
    pub fn resolve_logs_dir(&self) -> Result<PathBuf, ConfigError> {
        if let Some(dir) = &self.logs_dir {
            return Ok(dir.clone());
        }
        let home = directories::BaseDirs::new().ok_or(ConfigError::NoHomeDir)?;
        Ok(home.home_dir().join(".courier").join("logs"))
    }
}

/// Group bot webhook.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookConfig {
    /// Full webhook URL including the bot key.
    pub webhook_url: String,
}

/// WeCom application push.
#[derive(Clone, Deserialize)]
pub struct WecomAppConfig {
    /// Corp id.
    #[serde(default)]
    pub corp_id: String,
    /// Application secret.
    #[serde(default)]
    pub corp_secret: String,
    /// Application agent id.
    #[serde(default)]
    pub agent_id: i64,
    /// Member ids; empty means `@all`.
    #[serde(default)]
    pub recipients: Vec<String>,
    /// API host, overridable for private deployments.
    #[serde(default = "default_wecom_api_base")]
    pub api_base: String,
}

impl Default for WecomAppConfig {
    fn default() -> Self {
        Self {
            corp_id: String::new(),
            corp_secret: String::new(),
            agent_id: 0,
            recipients: Vec::new(),
            api_base: default_wecom_api_base(),
        }
    }
}

impl fmt::Debug for WecomAppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WecomAppConfig")
            .field("corp_id", &self.corp_id)
            .field("corp_secret", &"[REDACTED]")
            .field("agent_id", &self.agent_id)
            .field("recipients", &self.recipients)
            .field("api_base", &self.api_base)
            .finish()
    }
}

fn default_wecom_api_base() -> String {
    WECOM_API_BASE.to_owned()
}

/// Custom HTTP endpoint.
#[derive(Clone, Deserialize)]
pub struct CustomConfig {
    /// Target URL.
    #[serde(default)]
    pub url: String,
    /// HTTP method, case-insensitive.
    #[serde(default = "default_custom_method")]
    pub method: String,
    /// Headers applied verbatim.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl Default for CustomConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            method: default_custom_method(),
            headers: BTreeMap::new(),
        }
    }
}

impl fmt::Debug for CustomConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomConfig")
            .field("url", &self.url)
            .field("method", &self.method)
            .field("headers", &self.headers.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn default_custom_method() -> String {
    "POST".to_owned()
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration: file, then environment overrides, then validation.
    ///
    /// An explicit `path` must exist. Without one, `$COURIER_CONFIG` or
    /// `./courier.toml` is used, and a missing default file means defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the file cannot be read or parsed, or the
    /// resulting configuration is invalid.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with(path, |key| std::env::var(key).ok())
    }

    /// [`load`](Self::load) with an injectable environment resolver.
    ///
    /// # Errors
    ///
    /// See [`load`](Self::load).
    pub fn load_with(
        path: Option<&Path>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(explicit) => Self::from_file(explicit)?,
            None => {
                let resolved = env(CONFIG_PATH_ENV)
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
                if resolved.exists() {
                    Self::from_file(&resolved)?
                } else {
                    info!(path = %resolved.display(), "no config file found, using defaults and environment");
                    Self::default()
                }
            }
        };
        config.apply_overrides(env)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a config file without environment overrides or validation.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] or [`ConfigError::Parse`].
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        info!(path = %path.display(), "loading config from file");
        Self::from_toml(&contents)
    }

    /// Parse a TOML string without environment overrides or validation.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] on invalid TOML or schema mismatch.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Apply environment overrides (env > file > defaults).
    ///
    /// Malformed numeric or boolean values are ignored with a warning.
    /// An unknown `FORWARDER_TYPE` is an error.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownForwarder`].
    pub fn apply_overrides(
        &mut self,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(v) = env("FORWARDER_TYPE") {
            self.forwarder.kind = v.parse()?;
        }

        // Filter.
        if let Some(v) = env("FILTER_MUTED") {
            match parse_bool(&v) {
                Some(b) => self.filter.filter_muted = b,
                None => warn!(var = "FILTER_MUTED", value = %v, "ignoring invalid env override"),
            }
        }
        if let Some(v) = env("WHITELIST_CHATS") {
            self.filter.whitelist = parse_id_list("WHITELIST_CHATS", &v);
        }
        if let Some(v) = env("BLACKLIST_CHATS") {
            self.filter.blacklist = parse_id_list("BLACKLIST_CHATS", &v);
        }

        // Telegram.
        if let Some(v) = env("TELEGRAM_BOT_TOKEN") {
            self.telegram.bot_token = Some(v);
        }
        if let Some(v) = env("MUTED_CHATS") {
            self.telegram.muted_chats = parse_id_list("MUTED_CHATS", &v);
        }

        // Group webhooks.
        if let Some(v) = env("WECOM_WEBHOOK_URL") {
            self.wecom = Some(WebhookConfig { webhook_url: v });
        }
        if let Some(v) = env("FEISHU_WEBHOOK_URL") {
            self.feishu = Some(WebhookConfig { webhook_url: v });
        }

        // WeCom application.
        let app_vars = ["WECOM_CORPID", "WECOM_CORPSECRET", "WECOM_AGENTID", "WECOM_TOUSER"];
        if app_vars.iter().any(|key| env(key).is_some()) {
            let app = self.wecom_app.get_or_insert_with(WecomAppConfig::default);
            if let Some(v) = env("WECOM_CORPID") {
                app.corp_id = v;
            }
            if let Some(v) = env("WECOM_CORPSECRET") {
                app.corp_secret = v;
            }
            if let Some(v) = env("WECOM_AGENTID") {
                match v.trim().parse() {
                    Ok(id) => app.agent_id = id,
                    Err(_) => warn!(var = "WECOM_AGENTID", value = %v, "ignoring invalid env override"),
                }
            }
            if let Some(v) = env("WECOM_TOUSER") {
                app.recipients = v.split('|').map(|s| s.trim().to_owned()).collect();
            }
        }

        // Custom HTTP.
        let custom_vars = ["CUSTOM_API_URL", "CUSTOM_API_METHOD", "CUSTOM_API_HEADERS"];
        if custom_vars.iter().any(|key| env(key).is_some()) {
            let custom = self.custom.get_or_insert_with(CustomConfig::default);
            if let Some(v) = env("CUSTOM_API_URL") {
                custom.url = v;
            }
            if let Some(v) = env("CUSTOM_API_METHOD") {
                custom.method = v;
            }
            if let Some(v) = env("CUSTOM_API_HEADERS") {
                custom.headers = parse_header_list(&v);
            }
        }

        // Pipeline.
        override_number(&env, "COURIER_QUEUE_CAPACITY", &mut self.pipeline.queue_capacity);
        override_number(&env, "COURIER_WORKERS", &mut self.pipeline.workers);
        override_number(&env, "COURIER_MAX_RETRIES", &mut self.pipeline.max_retries);
        override_number(
            &env,
            "COURIER_SHUTDOWN_GRACE_SECS",
            &mut self.pipeline.shutdown_grace_secs,
        );

        Ok(())
    }

    /// Check the settings the selected backend and the pipeline depend on.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let pipeline = &self.pipeline;
        if pipeline.queue_capacity == 0 {
            return Err(ConfigError::Zero("pipeline.queue_capacity"));
        }
        if pipeline.workers == 0 {
            return Err(ConfigError::Zero("pipeline.workers"));
        }
        if pipeline.backoff_base_ms == 0 {
            return Err(ConfigError::Zero("pipeline.backoff_base_ms"));
        }
        if pipeline.request_timeout_secs == 0 {
            return Err(ConfigError::Zero("pipeline.request_timeout_secs"));
        }

        match self.forwarder.kind {
            SinkKind::Wecom => {
                let section = self.wecom.as_ref().ok_or(ConfigError::MissingSection("wecom"))?;
                validate_url("wecom.webhook_url", &section.webhook_url)
            }
            SinkKind::Feishu => {
                let section = self
                    .feishu
                    .as_ref()
                    .ok_or(ConfigError::MissingSection("feishu"))?;
                validate_url("feishu.webhook_url", &section.webhook_url)
            }
            SinkKind::WecomApp => {
                let app = self
                    .wecom_app
                    .as_ref()
                    .ok_or(ConfigError::MissingSection("wecom_app"))?;
                if app.corp_id.trim().is_empty() {
                    return Err(ConfigError::EmptyField("wecom_app.corp_id"));
                }
                if app.corp_secret.trim().is_empty() {
                    return Err(ConfigError::EmptyField("wecom_app.corp_secret"));
                }
                if app.agent_id <= 0 {
                    return Err(ConfigError::Zero("wecom_app.agent_id"));
                }
                validate_url("wecom_app.api_base", &app.api_base)
            }
            SinkKind::Custom => {
                let custom = self
                    .custom
                    .as_ref()
                    .ok_or(ConfigError::MissingSection("custom"))?;
                validate_url("custom.url", &custom.url)?;
                crate::sinks::custom::parse_method(&custom.method)?;
                Ok(())
            }
        }
    }

    /// The Telegram bot token, required by the Telegram source.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingBotToken`] when unset or blank.
    pub fn bot_token(&self) -> Result<&str, ConfigError> {
        self.telegram
            .bot_token
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .ok_or(ConfigError::MissingBotToken)
    }
}

/// Load `.env` from the working directory if present.
///
/// Existing process variables win over file entries.
pub fn load_dotenv() {
    match dotenvy::dotenv() {
        Ok(path) => info!(path = %path.display(), "loaded environment file"),
        Err(e) if e.not_found() => {}
        Err(e) => warn!(error = %e, "failed to load .env file"),
    }
}

// ---------------------------------------------------------------------------
// Parsing helpers
// ---------------------------------------------------------------------------

fn validate_url(field: &'static str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::EmptyField(field));
    }
    match url::Url::parse(value) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => Ok(()),
        _ => Err(ConfigError::InvalidUrl {
            field,
            value: value.to_owned(),
        }),
    }
}

fn override_number<T: FromStr>(
    env: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    target: &mut T,
) {
    if let Some(v) = env(key) {
        match v.trim().parse() {
            Ok(n) => *target = n,
            Err(_) => warn!(var = key, value = %v, "ignoring invalid env override"),
        }
    }
}

/// Parse `true/false`, `1/0`, `yes/no`, case-insensitively.
pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a comma-separated list of chat ids, skipping malformed entries.
pub fn parse_id_list(var: &str, raw: &str) -> BTreeSet<i64> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .filter_map(|item| match item.parse() {
            Ok(id) => Some(id),
            Err(_) => {
                warn!(var, entry = item, "ignoring malformed chat id");
                None
            }
        })
        .collect()
}

/// Parse `Key1:Value1,Key2:Value2` into a header map.
///
/// Entries without a colon are skipped; only the first colon splits, so
/// values may contain colons.
pub fn parse_header_list(raw: &str) -> BTreeMap<String, String> {
    raw.split(',')
        .filter_map(|pair| pair.split_once(':'))
        .map(|(key, value)| (key.trim().to_owned(), value.trim().to_owned()))
        .filter(|(key, _)| !key.is_empty())
        .collect()
}
