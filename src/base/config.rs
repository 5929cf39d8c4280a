//! Load configuration via `config` crate with env-override support.

use std::{ops::Deref, path::PathBuf, sync::Arc};

use chrono::TimeDelta;
use serde::Deserialize;

use super::types::Res;

/// Default digest interval, in minutes (24 hours).
fn default_digest_interval_minutes() -> u64 {
    1440
}

/// Default scheduler tick, in seconds.
fn default_tick_interval_secs() -> u64 {
    60
}

/// Default location of the persisted server configurations.
fn default_config_file() -> PathBuf {
    PathBuf::from("bot_config.json")
}

/// Default cap on digests produced at the same time.
fn default_max_concurrent_digests() -> usize {
    4
}

/// Empty digests are sent by default so recipients can rely on the schedule.
fn default_send_empty_digests() -> bool {
    true
}

/// Default SMTP submission port (STARTTLS).
fn default_smtp_port() -> u16 {
    587
}

/// Configuration for the message-digester application.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub inner: Arc<ConfigInner>,
}

impl Deref for Config {
    type Target = ConfigInner;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ConfigInner {
    /// Digest interval for servers that never set one (`DEFAULT_DIGEST_INTERVAL_MINUTES`).
    #[serde(default = "default_digest_interval_minutes")]
    pub default_digest_interval_minutes: u64,
    /// How often the scheduler looks for due servers (`TICK_INTERVAL_SECS`).
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    /// Path of the JSON file holding every server configuration (`CONFIG_FILE`).
    #[serde(default = "default_config_file")]
    pub config_file: PathBuf,
    /// Maximum number of digests produced concurrently (`MAX_CONCURRENT_DIGESTS`).
    #[serde(default = "default_max_concurrent_digests")]
    pub max_concurrent_digests: usize,
    /// Whether a digest with no messages is still mailed (`SEND_EMPTY_DIGESTS`).
    #[serde(default = "default_send_empty_digests")]
    pub send_empty_digests: bool,
    /// Users allowed to run commands; empty means everyone (`ADMIN_USER_IDS`).
    #[serde(default)]
    pub admin_user_ids: Vec<String>,
    /// Slack app token (`SLACK_APP_TOKEN`).
    pub slack_app_token: String,
    /// Slack bot token (`SLACK_BOT_TOKEN`).
    pub slack_bot_token: String,
    /// Sender address; email is disabled when unset (`EMAIL_SENDER`).
    #[serde(default)]
    pub email_sender: Option<String>,
    /// Sender password or app-specific password (`EMAIL_PASSWORD`).
    #[serde(default)]
    pub email_password: Option<String>,
    /// SMTP relay host (`SMTP_SERVER`).
    #[serde(default)]
    pub smtp_server: Option<String>,
    /// SMTP relay port (`SMTP_PORT`).
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
}

impl ConfigInner {
    /// The process-wide default digest interval.
    ///
    /// Saturates at [`TimeDelta::MAX`]; [`Config::load`] rejects values that large.
    pub fn default_digest_interval(&self) -> TimeDelta {
        checked_minutes(self.default_digest_interval_minutes).unwrap_or(TimeDelta::MAX)
    }

    /// The scheduler tick cadence.
    pub fn tick_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.tick_interval_secs)
    }
}

impl Config {
    pub fn load(explicit_path: Option<&std::path::Path>) -> Res<Self> {
        let mut cfg = config::Config::builder().add_source(config::Environment::default().prefix("MESSAGE_DIGESTER"));

        if let Some(p) = explicit_path {
            cfg = cfg.add_source(config::File::from(p.to_path_buf()));
        } else if std::path::Path::new(".hidden/config.toml").exists() {
            cfg = cfg.add_source(config::File::with_name(".hidden/config.toml"));
        }

        let result = Config {
            inner: Arc::new(cfg.build()?.try_deserialize()?),
        };

        result.validate()?;

        Ok(result)
    }

    fn validate(&self) -> Res<()> {
        if self.default_digest_interval_minutes < 1 {
            return Err(anyhow::anyhow!("Default digest interval must be at least 1 minute."));
        }

        if checked_minutes(self.default_digest_interval_minutes).is_none() {
            return Err(anyhow::anyhow!("Default digest interval of {} minutes is too large.", self.default_digest_interval_minutes));
        }

        if self.tick_interval_secs < 1 {
            return Err(anyhow::anyhow!("Tick interval must be at least 1 second."));
        }

        if self.max_concurrent_digests < 1 {
            return Err(anyhow::anyhow!("Max concurrent digests must be at least 1."));
        }

        if self.email_sender.is_some() && (self.smtp_server.is_none() || self.email_password.is_none()) {
            return Err(anyhow::anyhow!("An email sender requires both an SMTP server and a password."));
        }

        Ok(())
    }
}

fn checked_minutes(minutes: u64) -> Option<TimeDelta> {
    i64::try_from(minutes).ok().and_then(TimeDelta::try_minutes)
}

// Tests.
