//! Configuration loading and validation.
//!
//! Loads `tblwatch.toml` (or `$TBLWATCH_CONFIG`). Secrets never live in the
//! file: sections name the environment variables that hold them
//! (`bot_token_env`, `password_env`, ...). Environment overrides take
//! precedence over file values; file values override defaults.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::capture::sanitizer::{FieldAction, FieldRule};
use crate::outbound::DestinationLimits;

/// Errors from resolving configuration into runnable settings.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A credential the destination cannot run without is not set.
    #[error("{destination}: missing required credential {var}")]
    MissingCredential {
        /// Destination or component name.
        destination: &'static str,
        /// Environment variable that should hold the value.
        var: String,
    },

    /// A URL in the configuration does not parse.
    #[error("{field}: invalid url: {reason}")]
    InvalidUrl {
        /// Config field holding the URL.
        field: &'static str,
        /// Parser message.
        reason: String,
    },

    /// A value is present but unusable.
    #[error("invalid {field}: {reason}")]
    Invalid {
        /// Config field.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Which notifications are relayed.
    #[serde(default)]
    pub capture: CaptureConfig,

    /// Database connections to listen on.
    #[serde(default)]
    pub databases: Vec<DatabaseConfig>,

    /// One-time-code lookup. Absent disables the compact code messages.
    #[serde(default)]
    pub otp: Option<OtpConfig>,

    /// Field rules applied to inserted rows.
    #[serde(default)]
    pub sanitizer: SanitizerConfig,

    /// Default per-destination delivery limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Telegram destination.
    #[serde(default)]
    pub telegram: Option<TelegramConfig>,

    /// Rocket.Chat destination.
    #[serde(default)]
    pub rocketchat: Option<RocketChatConfig>,

    /// Audit trail.
    #[serde(default)]
    pub audit: AuditConfig,
}

/// Logging settings.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Directory for the rolling JSON log.
    #[serde(default = "default_logs_dir")]
    pub dir: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dir: default_logs_dir(),
        }
    }
}

/// Notification channel and allow-list.
#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    /// `LISTEN` channel the triggers publish on.
    #[serde(default = "default_channel")]
    pub channel: String,

    /// The only table whose changes are relayed.
    #[serde(default)]
    pub table: String,

    /// Database names whose notifications are accepted.
    #[serde(default)]
    pub databases: BTreeSet<String>,

    /// Row key kept in every update diff.
    #[serde(default = "default_key_field")]
    pub key_field: String,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            channel: default_channel(),
            table: String::new(),
            databases: BTreeSet::new(),
            key_field: default_key_field(),
        }
    }
}

/// Supported database kinds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseKind {
    /// PostgreSQL `LISTEN/NOTIFY`.
    #[default]
    Postgres,
}

/// One database connection to listen on.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Label used in logs.
    pub name: String,

    /// Database kind.
    #[serde(rename = "type", default)]
    pub kind: DatabaseKind,

    /// Connection URL inline (no password recommended).
    #[serde(default)]
    pub url: Option<String>,

    /// Environment variable holding the connection URL.
    #[serde(default)]
    pub url_env: Option<String>,
}

/// Resolved database connection.
#[derive(Clone)]
pub struct DatabaseSettings {
    /// Label used in logs.
    pub name: String,
    /// Connection URL.
    pub url: String,
}

impl std::fmt::Debug for DatabaseSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseSettings")
            .field("name", &self.name)
            .field("url", &"[REDACTED]")
            .finish()
    }
}

impl DatabaseConfig {
    /// Resolve the connection URL, preferring the environment variable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingCredential`] when neither source is set.
    pub fn resolve(
        &self,
        env: &impl Fn(&str) -> Option<String>,
    ) -> Result<DatabaseSettings, ConfigError> {
        let from_env = self.url_env.as_deref().and_then(env);
        let url = from_env.or_else(|| self.url.clone()).ok_or_else(|| {
            ConfigError::MissingCredential {
                destination: "database",
                var: self
                    .url_env
                    .clone()
                    .unwrap_or_else(|| format!("databases.{}.url", self.name)),
            }
        })?;
        Ok(DatabaseSettings {
            name: self.name.clone(),
            url,
        })
    }
}

/// One-time-code table and the columns read by the secondary lookup.
#[derive(Debug, Clone, Deserialize)]
pub struct OtpConfig {
    /// Table holding the codes.
    pub table: String,

    /// Primary key column used for the lookup.
    #[serde(default = "default_key_field")]
    pub id_column: String,

    /// Column naming who the code is for (e.g. an email address).
    #[serde(default = "default_identifier_column")]
    pub identifier_column: String,

    /// Column holding the code itself.
    #[serde(default = "default_code_column")]
    pub code_column: String,

    /// Databases the lookup is allowed for; empty means `capture.databases`.
    #[serde(default)]
    pub databases: BTreeSet<String>,

    /// Environment variable with the base connection URL. The database name
    /// of each event replaces the URL's database.
    #[serde(default = "default_otp_url_env")]
    pub url_env: String,
}

/// Field redaction rules.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SanitizerConfig {
    /// Rules applied in order.
    #[serde(default)]
    pub rules: Vec<FieldRuleConfig>,
}

/// A single `[[sanitizer.rules]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct FieldRuleConfig {
    /// Field name, matched case-insensitively.
    pub field: String,
    /// `redact`, `mask` or `drop`.
    pub action: String,
    /// Characters left visible by `mask`.
    #[serde(default = "default_mask_keep")]
    pub keep: usize,
}

impl SanitizerConfig {
    /// Convert the raw entries into sanitizer rules.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for an unknown action.
    pub fn rules(&self) -> Result<Vec<FieldRule>, ConfigError> {
        self.rules
            .iter()
            .map(|raw| {
                let action = match raw.action.to_ascii_lowercase().as_str() {
                    "redact" => FieldAction::Redact,
                    "mask" => FieldAction::Mask { keep: raw.keep },
                    "drop" => FieldAction::Drop,
                    other => {
                        return Err(ConfigError::Invalid {
                            field: "sanitizer.rules.action",
                            reason: format!("unknown action '{other}' for field '{}'", raw.field),
                        })
                    }
                };
                Ok(FieldRule::new(&raw.field, action))
            })
            .collect()
    }
}

/// Delivery limits for one destination.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Maximum fragment size reachable by merging.
    #[serde(default = "default_soft_limit")]
    pub soft_limit: usize,

    /// Maximum size of a single send.
    #[serde(default = "default_hard_limit")]
    pub hard_limit: usize,

    /// Minimum gap between rate-limited sends.
    #[serde(default = "default_interval_ms")]
    pub rate_interval_ms: u64,

    /// Delivery scheduler tick.
    #[serde(default = "default_interval_ms")]
    pub tick_interval_ms: u64,

    /// Delay before the scheduled re-authentication attempt.
    #[serde(default = "default_auth_retry_secs")]
    pub auth_retry_secs: u64,

    /// Ceiling for the failure backoff.
    #[serde(default = "default_backoff_max_secs")]
    pub backoff_max_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            soft_limit: default_soft_limit(),
            hard_limit: default_hard_limit(),
            rate_interval_ms: default_interval_ms(),
            tick_interval_ms: default_interval_ms(),
            auth_retry_secs: default_auth_retry_secs(),
            backoff_max_secs: default_backoff_max_secs(),
        }
    }
}

impl LimitsConfig {
    /// Build validated runtime limits.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when the limits cannot work together.
    pub fn to_limits(&self) -> Result<DestinationLimits, ConfigError> {
        let limits = DestinationLimits {
            soft_limit: self.soft_limit,
            hard_limit: self.hard_limit,
            rate_interval: Duration::from_millis(self.rate_interval_ms),
            auth_retry_delay: Duration::from_secs(self.auth_retry_secs),
            backoff_max: Duration::from_secs(self.backoff_max_secs),
        };
        limits.validate()?;
        Ok(limits)
    }

    /// Scheduler tick as a duration (never zero).
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }
}

/// Telegram destination.
#[derive(Debug, Clone, Deserialize)]
pub struct TelegramConfig {
    /// Disable without deleting the section.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Environment variable holding the bot token.
    #[serde(default = "default_telegram_token_env")]
    pub bot_token_env: String,

    /// Group chat id that receives the messages.
    pub chat_id: i64,

    /// Overrides the global `[limits]` section for this destination.
    #[serde(default)]
    pub limits: Option<LimitsConfig>,
}

/// Resolved Telegram settings.
#[derive(Clone)]
pub struct TelegramSettings {
    /// Bot token.
    pub bot_token: String,
    /// Target chat.
    pub chat_id: i64,
}

impl std::fmt::Debug for TelegramSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramSettings")
            .field("bot_token", &"[REDACTED]")
            .field("chat_id", &self.chat_id)
            .finish()
    }
}

impl TelegramConfig {
    /// Resolve the bot token from the environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingCredential`] when the token is unset or empty.
    pub fn resolve(
        &self,
        env: &impl Fn(&str) -> Option<String>,
    ) -> Result<TelegramSettings, ConfigError> {
        let bot_token = required(env, "telegram", &self.bot_token_env)?;
        Ok(TelegramSettings {
            bot_token,
            chat_id: self.chat_id,
        })
    }
}

/// Rocket.Chat destination.
#[derive(Debug, Clone, Deserialize)]
pub struct RocketChatConfig {
    /// Disable without deleting the section.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Server base URL, e.g. `https://chat.example.com`.
    #[serde(default)]
    pub server_url: Option<String>,

    /// Environment variable holding the login name.
    #[serde(default = "default_rocket_username_env")]
    pub username_env: String,

    /// Environment variable holding the password.
    #[serde(default = "default_rocket_password_env")]
    pub password_env: String,

    /// Room id or channel name (`rid`).
    #[serde(default)]
    pub channel: Option<String>,

    /// Overrides the global `[limits]` section for this destination.
    #[serde(default)]
    pub limits: Option<LimitsConfig>,
}

/// Resolved Rocket.Chat settings.
#[derive(Clone)]
pub struct RocketChatSettings {
    /// Server base URL.
    pub server_url: Url,
    /// Login name.
    pub username: String,
    /// Password.
    pub password: String,
    /// Target room.
    pub channel: String,
}

impl std::fmt::Debug for RocketChatSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocketChatSettings")
            .field("server_url", &self.server_url.as_str())
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("channel", &self.channel)
            .finish()
    }
}

impl RocketChatConfig {
    /// Resolve server, credentials and channel. All four are required.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingCredential`] for any missing value and
    /// [`ConfigError::InvalidUrl`] when the server URL does not parse.
    pub fn resolve(
        &self,
        env: &impl Fn(&str) -> Option<String>,
    ) -> Result<RocketChatSettings, ConfigError> {
        let raw_url = self
            .server_url
            .clone()
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingCredential {
                destination: "rocketchat",
                var: "rocketchat.server_url".to_owned(),
            })?;
        let server_url = Url::parse(&raw_url).map_err(|e| ConfigError::InvalidUrl {
            field: "rocketchat.server_url",
            reason: e.to_string(),
        })?;
        let username = required(env, "rocketchat", &self.username_env)?;
        let password = required(env, "rocketchat", &self.password_env)?;
        let channel = self
            .channel
            .clone()
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingCredential {
                destination: "rocketchat",
                var: "rocketchat.channel".to_owned(),
            })?;
        Ok(RocketChatSettings {
            server_url,
            username,
            password,
            channel,
        })
    }
}

/// Audit trail settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuditConfig {
    /// SQLite file for audit records. Absent routes records to the log.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

fn required(
    env: &impl Fn(&str) -> Option<String>,
    destination: &'static str,
    var: &str,
) -> Result<String, ConfigError> {
    env(var)
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| ConfigError::MissingCredential {
            destination,
            var: var.to_owned(),
        })
}

// Default value functions for serde

fn default_log_level() -> String {
    "info".to_owned()
}
fn default_logs_dir() -> PathBuf {
    PathBuf::from("logs")
}
fn default_channel() -> String {
    "tbl_changes".to_owned()
}
fn default_key_field() -> String {
    "id".to_owned()
}
fn default_identifier_column() -> String {
    "identification_value".to_owned()
}
fn default_code_column() -> String {
    "code".to_owned()
}
fn default_otp_url_env() -> String {
    "TBLWATCH_OTP_DB_URL".to_owned()
}
fn default_mask_keep() -> usize {
    4
}
fn default_soft_limit() -> usize {
    3800
}
fn default_hard_limit() -> usize {
    4090
}
fn default_interval_ms() -> u64 {
    1000
}
fn default_auth_retry_secs() -> u64 {
    30
}
fn default_backoff_max_secs() -> u64 {
    30
}
fn default_true() -> bool {
    true
}
fn default_telegram_token_env() -> String {
    "TBLWATCH_TELEGRAM_TOKEN".to_owned()
}
fn default_rocket_username_env() -> String {
    "TBLWATCH_ROCKETCHAT_USERNAME".to_owned()
}
fn default_rocket_password_env() -> String {
    "TBLWATCH_ROCKETCHAT_PASSWORD".to_owned()
}

impl Config {
    /// Load configuration with precedence: env vars > TOML file > defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read config at {}: {e}", path.display()))?;
        let mut config = Self::from_toml(&contents)
            .map_err(|e| anyhow::anyhow!("failed to parse config at {}: {e}", path.display()))?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Parse a TOML string into config without env overrides.
    ///
    /// # Errors
    ///
    /// Returns the TOML parse error.
    pub fn from_toml(toml_str: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(toml_str)
    }

    /// Resolve the config file path: explicit argument, `$TBLWATCH_CONFIG`,
    /// then `./tblwatch.toml`.
    pub fn resolve_path(
        explicit: Option<&Path>,
        env: impl Fn(&str) -> Option<String>,
    ) -> PathBuf {
        if let Some(p) = explicit {
            return p.to_path_buf();
        }
        if let Some(p) = env("TBLWATCH_CONFIG") {
            return PathBuf::from(p);
        }
        PathBuf::from("tblwatch.toml")
    }

    /// Apply environment variable overrides (env > config > defaults).
    ///
    /// Takes a resolver function for testability.
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("TBLWATCH_LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Some(v) = env("TBLWATCH_LOG_DIR") {
            self.logging.dir = PathBuf::from(v);
        }
        if let Some(v) = env("TBLWATCH_CHANNEL") {
            self.capture.channel = v;
        }
        if let Some(v) = env("TBLWATCH_TABLE") {
            self.capture.table = v;
        }
        // Comma-separated, same shape as the trigger-side allow-list.
        if let Some(v) = env("TBLWATCH_DATABASES") {
            self.capture.databases = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
                .collect();
        }
        if let Some(v) = env("TBLWATCH_AUDIT_PATH") {
            self.audit.path = Some(PathBuf::from(v));
        }
        if let Some(v) = env("TBLWATCH_ROCKETCHAT_SERVER_URL") {
            if let Some(rc) = self.rocketchat.as_mut() {
                rc.server_url = Some(v);
            }
        }
        if let Some(v) = env("TBLWATCH_ROCKETCHAT_CHANNEL") {
            if let Some(rc) = self.rocketchat.as_mut() {
                rc.channel = Some(v);
            }
        }
        if let Some(v) = env("TBLWATCH_TELEGRAM_CHAT_ID") {
            match (v.parse::<i64>(), self.telegram.as_mut()) {
                (Ok(id), Some(tg)) => tg.chat_id = id,
                (Ok(_), None) => {}
                (Err(_), _) => tracing::warn!(
                    var = "TBLWATCH_TELEGRAM_CHAT_ID",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
    }

    /// Databases the one-time-code lookup may query.
    pub fn otp_databases(&self) -> BTreeSet<String> {
        match &self.otp {
            Some(otp) if !otp.databases.is_empty() => otp.databases.clone(),
            _ => self.capture.databases.clone(),
        }
    }

    /// Limits for a destination: its own section, else the global one.
    pub fn limits_for<'a>(&'a self, own: Option<&'a LimitsConfig>) -> &'a LimitsConfig {
        own.unwrap_or(&self.limits)
    }
}
