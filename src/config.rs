//! Configuration: a `[defaults]` table plus an ordered list of
//! `[[feed]]` tables, each of which may override any default.
//!
//! The file is TOML. Feed order in the file is feed order everywhere
//! else: the store mirrors it and the run command processes feeds in
//! it. Unlike the optional preferences file of a desktop reader, this
//! file is the subscription database, so most commands require it to
//! exist; only `add` will create it.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::util::write_atomic;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("no config file at {0} (run `feedmail add` to create one)")]
    Missing(PathBuf),

    #[error("invalid feed name '{0}' (allowed: letters, digits, '.', '_', '-')")]
    InvalidFeedName(String),

    #[error("duplicate feed name '{0}'")]
    DuplicateFeedName(String),

    #[error("no feed named '{0}'")]
    UnknownFeed(String),

    #[error("feed '{feed}': invalid delivery configuration: {message}")]
    InvalidDelivery { feed: String, message: String },
}

// ============================================================================
// Defaults and per-feed overrides
// ============================================================================

/// Options every feed inherits unless its `[[feed]]` table overrides
/// them. All fields use `#[serde(default)]` so any subset of keys can
/// be specified.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Defaults {
    /// Destination mailbox. Required before a feed can run.
    pub to: Option<String>,
    /// Sender address used when the entry has none (or always, with
    /// `force_from`).
    pub from: String,
    /// Ignore entry author addresses and always send from `from`.
    pub force_from: bool,
    /// Use the entry's native id as the dedup key when present.
    pub trust_guid: bool,
    /// Use the entry's link as the dedup key when present (wins over
    /// `trust_guid`).
    pub trust_link: bool,
    /// Re-send entries whose content hash changed, threaded as replies.
    pub reply_changes: bool,
    /// Bundle each run's new entries into one digest message.
    pub digest: bool,
    /// Date messages from the entry's published date instead of now.
    pub date_header: bool,
    /// Extra `Name: value` header lines appended to every message.
    pub bonus_header: Option<String>,
    /// Hard wall-clock limit for one feed fetch, in seconds.
    pub feed_timeout: u64,
    /// Pause between consecutive fetches that hit the same host, in
    /// seconds. 0 disables throttling.
    pub same_server_fetch_interval: f64,
    /// HTTP proxy URL for fetching.
    pub proxy: Option<String>,
    /// Delivery backend: "maildir", "sendmail", "smtp", or "imap".
    pub protocol: String,
    pub maildir_path: Option<PathBuf>,
    pub sendmail_path: PathBuf,
    pub smtp_host: Option<String>,
    pub smtp_port: u16,
    pub smtp_username: Option<String>,
    pub smtp_password: Option<String>,
    pub imap_host: Option<String>,
    pub imap_port: u16,
    pub imap_username: Option<String>,
    pub imap_password: Option<String>,
    /// Mailbox messages are appended to with the "imap" protocol.
    pub imap_mailbox: String,
    /// Name of a registered post-process hook applied per entry.
    pub post_process: Option<String>,
    /// Name of a registered hook applied to a whole digest.
    pub digest_post_process: Option<String>,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            to: None,
            from: "user@feedmail.invalid".to_string(),
            force_from: false,
            trust_guid: true,
            trust_link: false,
            reply_changes: false,
            digest: false,
            date_header: false,
            bonus_header: None,
            feed_timeout: 60,
            same_server_fetch_interval: 0.0,
            proxy: None,
            protocol: "sendmail".to_string(),
            maildir_path: None,
            sendmail_path: PathBuf::from("/usr/sbin/sendmail"),
            smtp_host: None,
            smtp_port: 587,
            smtp_username: None,
            smtp_password: None,
            imap_host: None,
            imap_port: 993,
            imap_username: None,
            imap_password: None,
            imap_mailbox: "INBOX".to_string(),
            post_process: None,
            digest_post_process: None,
        }
    }
}

/// One subscription. Every optional field falls back to [`Defaults`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    pub name: String,
    pub url: String,
    /// Paused feeds stay configured but are skipped by `run`.
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub force_from: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trust_guid: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trust_link: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_changes: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_header: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bonus_header: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feed_timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub same_server_fetch_interval: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maildir_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sendmail_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smtp_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smtp_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smtp_username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smtp_password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imap_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imap_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imap_username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imap_password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imap_mailbox: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_process: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest_post_process: Option<String>,
}

fn default_true() -> bool {
    true
}

impl FeedConfig {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            active: true,
            to: None,
            from: None,
            force_from: None,
            trust_guid: None,
            trust_link: None,
            reply_changes: None,
            digest: None,
            date_header: None,
            bonus_header: None,
            feed_timeout: None,
            same_server_fetch_interval: None,
            proxy: None,
            protocol: None,
            maildir_path: None,
            sendmail_path: None,
            smtp_host: None,
            smtp_port: None,
            smtp_username: None,
            smtp_password: None,
            imap_host: None,
            imap_port: None,
            imap_username: None,
            imap_password: None,
            imap_mailbox: None,
            post_process: None,
            digest_post_process: None,
        }
    }
}

// ============================================================================
// Resolved settings
// ============================================================================

/// Which backend carries a feed's mail, with everything it needs.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryTarget {
    Maildir {
        path: PathBuf,
    },
    Sendmail {
        command: PathBuf,
    },
    Smtp {
        host: String,
        port: u16,
        username: Option<String>,
        password: Option<String>,
    },
    Imap {
        host: String,
        port: u16,
        username: String,
        password: String,
        mailbox: String,
    },
}

/// Concrete per-feed settings after merging defaults with overrides.
/// The runner never reads ambient configuration: everything it needs is
/// in here.
#[derive(Debug, Clone)]
pub struct Settings {
    pub to: Option<String>,
    pub from: String,
    pub force_from: bool,
    pub trust_guid: bool,
    pub trust_link: bool,
    pub reply_changes: bool,
    pub digest: bool,
    pub date_header: bool,
    pub bonus_header: Option<String>,
    pub feed_timeout: Duration,
    pub same_server_fetch_interval: Duration,
    pub proxy: Option<String>,
    pub delivery: DeliveryTarget,
    pub post_process: Option<String>,
    pub digest_post_process: Option<String>,
}

// ============================================================================
// Config
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub defaults: Defaults,
    #[serde(rename = "feed", skip_serializing_if = "Vec::is_empty")]
    pub feeds: Vec<FeedConfig>,
}

/// Feed names end up in filenames, config keys, and log lines, so the
/// charset is restricted.
pub fn valid_feed_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

impl Config {
    /// Load configuration; a missing file is an error.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ConfigError::Missing(path.to_path_buf()));
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        tracing::debug!(path = %path.display(), feeds = config.feeds.len(), "loaded configuration");
        Ok(config)
    }

    /// Load configuration, treating a missing file as empty (used by
    /// `add`, which may be creating the very first feed).
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        match Self::load(path) {
            Err(ConfigError::Missing(_)) => {
                tracing::debug!(path = %path.display(), "no config file, starting empty");
                Ok(Self::default())
            }
            other => other,
        }
    }

    /// Atomically write the config back out.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        let rendered = toml::to_string_pretty(self)?;
        write_atomic(path, rendered.as_bytes())?;
        tracing::debug!(path = %path.display(), "saved configuration");
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut names = std::collections::HashSet::new();
        for feed in &self.feeds {
            if !valid_feed_name(&feed.name) {
                return Err(ConfigError::InvalidFeedName(feed.name.clone()));
            }
            if !names.insert(feed.name.as_str()) {
                return Err(ConfigError::DuplicateFeedName(feed.name.clone()));
            }
        }
        Ok(())
    }

    pub fn feed(&self, name: &str) -> Option<&FeedConfig> {
        self.feeds.iter().find(|f| f.name == name)
    }

    pub fn feed_mut(&mut self, name: &str) -> Option<&mut FeedConfig> {
        self.feeds.iter_mut().find(|f| f.name == name)
    }

    /// Append a new feed, enforcing the name invariants.
    pub fn add_feed(&mut self, feed: FeedConfig) -> Result<(), ConfigError> {
        if !valid_feed_name(&feed.name) {
            return Err(ConfigError::InvalidFeedName(feed.name));
        }
        if self.feed(&feed.name).is_some() {
            return Err(ConfigError::DuplicateFeedName(feed.name));
        }
        self.feeds.push(feed);
        Ok(())
    }

    pub fn remove_feed(&mut self, name: &str) -> Result<FeedConfig, ConfigError> {
        let idx = self
            .feeds
            .iter()
            .position(|f| f.name == name)
            .ok_or_else(|| ConfigError::UnknownFeed(name.to_string()))?;
        Ok(self.feeds.remove(idx))
    }

    /// Merge defaults with one feed's overrides into concrete settings.
    pub fn resolve(&self, feed: &FeedConfig) -> Result<Settings, ConfigError> {
        let d = &self.defaults;
        let protocol = feed.protocol.as_deref().unwrap_or(&d.protocol);
        let delivery = match protocol {
            "maildir" => {
                let path = feed
                    .maildir_path
                    .clone()
                    .or_else(|| d.maildir_path.clone())
                    .ok_or_else(|| ConfigError::InvalidDelivery {
                        feed: feed.name.clone(),
                        message: "protocol is maildir but maildir_path is unset".into(),
                    })?;
                DeliveryTarget::Maildir { path }
            }
            "sendmail" => DeliveryTarget::Sendmail {
                command: feed
                    .sendmail_path
                    .clone()
                    .unwrap_or_else(|| d.sendmail_path.clone()),
            },
            "smtp" => {
                let host = feed
                    .smtp_host
                    .clone()
                    .or_else(|| d.smtp_host.clone())
                    .ok_or_else(|| ConfigError::InvalidDelivery {
                        feed: feed.name.clone(),
                        message: "protocol is smtp but smtp_host is unset".into(),
                    })?;
                DeliveryTarget::Smtp {
                    host,
                    port: feed.smtp_port.unwrap_or(d.smtp_port),
                    username: feed
                        .smtp_username
                        .clone()
                        .or_else(|| d.smtp_username.clone()),
                    password: feed
                        .smtp_password
                        .clone()
                        .or_else(|| d.smtp_password.clone()),
                }
            }
            "imap" => {
                let host = feed
                    .imap_host
                    .clone()
                    .or_else(|| d.imap_host.clone())
                    .ok_or_else(|| ConfigError::InvalidDelivery {
                        feed: feed.name.clone(),
                        message: "protocol is imap but imap_host is unset".into(),
                    })?;
                // APPENDing requires an authenticated session.
                let username = feed
                    .imap_username
                    .clone()
                    .or_else(|| d.imap_username.clone())
                    .ok_or_else(|| ConfigError::InvalidDelivery {
                        feed: feed.name.clone(),
                        message: "protocol is imap but imap_username is unset".into(),
                    })?;
                let password = feed
                    .imap_password
                    .clone()
                    .or_else(|| d.imap_password.clone())
                    .ok_or_else(|| ConfigError::InvalidDelivery {
                        feed: feed.name.clone(),
                        message: "protocol is imap but imap_password is unset".into(),
                    })?;
                DeliveryTarget::Imap {
                    host,
                    port: feed.imap_port.unwrap_or(d.imap_port),
                    username,
                    password,
                    mailbox: feed
                        .imap_mailbox
                        .clone()
                        .unwrap_or_else(|| d.imap_mailbox.clone()),
                }
            }
            other => {
                return Err(ConfigError::InvalidDelivery {
                    feed: feed.name.clone(),
                    message: format!("unknown protocol '{other}'"),
                })
            }
        };

        Ok(Settings {
            to: feed.to.clone().or_else(|| d.to.clone()),
            from: feed.from.clone().unwrap_or_else(|| d.from.clone()),
            force_from: feed.force_from.unwrap_or(d.force_from),
            trust_guid: feed.trust_guid.unwrap_or(d.trust_guid),
            trust_link: feed.trust_link.unwrap_or(d.trust_link),
            reply_changes: feed.reply_changes.unwrap_or(d.reply_changes),
            digest: feed.digest.unwrap_or(d.digest),
            date_header: feed.date_header.unwrap_or(d.date_header),
            bonus_header: feed.bonus_header.clone().or_else(|| d.bonus_header.clone()),
            feed_timeout: Duration::from_secs(feed.feed_timeout.unwrap_or(d.feed_timeout)),
            same_server_fetch_interval: Duration::from_secs_f64(
                feed.same_server_fetch_interval
                    .unwrap_or(d.same_server_fetch_interval)
                    .max(0.0),
            ),
            proxy: feed.proxy.clone().or_else(|| d.proxy.clone()),
            delivery,
            post_process: feed.post_process.clone().or_else(|| d.post_process.clone()),
            digest_post_process: feed
                .digest_post_process
                .clone()
                .or_else(|| d.digest_post_process.clone()),
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
