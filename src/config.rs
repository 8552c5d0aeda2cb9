use std::fs;
use std::path::{Path, PathBuf};

use chrono::{Duration, Utc};
use log::{debug, info};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Everything a run needs, built once at startup and then only read.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub feed: FeedConfig,
    pub source: SourceConfig,
    pub state: StateConfig,
    /// Loaded from the channels file, in configured order.
    #[serde(skip)]
    pub channels: Vec<String>,
    /// Loaded from the keywords file. Empty disables filtering.
    #[serde(skip)]
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub title: String,
    pub link: String,
    pub description: String,
    pub language: String,
    /// Maximum number of items in the document
    pub limit: usize,
    /// Only posts from the last N days are kept
    pub days: i64,
    pub output: PathBuf,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            title: "Telegram Tech Channels Feed".to_string(),
            link: "https://github.com".to_string(),
            description: "Aggregated posts from Telegram channels for the last 7 days".to_string(),
            language: "en".to_string(),
            limit: 200,
            days: 7,
            output: PathBuf::from("feed.xml"),
        }
    }
}

impl FeedConfig {
    pub fn retention(&self) -> Duration {
        Duration::days(self.days)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub base_url: String,
    /// Upper bound of messages read per channel and run
    pub page_limit: usize,
    pub user_agent: String,
    pub timeout_secs: u64,
    /// How often one channel may be retried after a rate-limit pause
    pub max_rate_limit_retries: u32,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: "https://t.me".to_string(),
            page_limit: 500,
            user_agent: concat!("tgrss/", env!("CARGO_PKG_VERSION")).to_string(),
            timeout_secs: 30,
            max_rate_limit_retries: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    #[default]
    Json,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    pub backend: StateBackend,
    pub path: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            backend: StateBackend::Json,
            path: PathBuf::from("state/state.json"),
        }
    }
}

/// Where the configuration pieces live on disk.
#[derive(Debug, Clone)]
pub struct ConfigPaths {
    pub config: PathBuf,
    pub channels: PathBuf,
    pub keywords: PathBuf,
}

#[derive(Debug, Default, Deserialize)]
struct ChannelsFile {
    channels: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
struct KeywordsFile {
    keywords: Option<Vec<String>>,
}

impl Config {
    /// Reads the config file, applies `FEED_*` overrides from `env` and loads
    /// the channel and keyword lists. Fails when no channel is configured.
    pub fn load<F>(paths: &ConfigPaths, env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config: Config = load_yaml(&paths.config)?.unwrap_or_else(|| {
            info!("Config file {} not found, using defaults", paths.config.display());
            Config::default()
        });
        config.apply_env(env)?;

        let channels: ChannelsFile = load_yaml(&paths.channels)?.unwrap_or_default();
        config.channels = channels
            .channels
            .unwrap_or_default()
            .into_iter()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty() && c != "@")
            .collect();

        let keywords: KeywordsFile = load_yaml(&paths.keywords)?.unwrap_or_default();
        config.keywords = keywords
            .keywords
            .unwrap_or_default()
            .into_iter()
            .filter(|k| !k.is_empty())
            .collect();

        if config.channels.is_empty() {
            return Err(ConfigError::EmptyChannels(paths.channels.display().to_string()));
        }
        config.validate()?;

        debug!(
            "Loaded {} channels and {} keywords",
            config.channels.len(),
            config.keywords.len()
        );
        Ok(config)
    }

    fn apply_env<F>(&mut self, env: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(title) = env("FEED_TITLE") {
            self.feed.title = title;
        }
        if let Some(link) = env("FEED_LINK") {
            self.feed.link = link;
        }
        if let Some(desc) = env("FEED_DESC") {
            self.feed.description = desc;
        }
        if let Some(limit) = env("FEED_LIMIT") {
            self.feed.limit = parse_number("FEED_LIMIT", &limit)?;
        }
        if let Some(days) = env("FEED_DAYS") {
            self.feed.days = parse_number("FEED_DAYS", &days)?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.feed.limit == 0 {
            return Err(invalid("feed.limit", self.feed.limit));
        }
        // The window has to fit before today on the calendar, or the cutoff
        // arithmetic overflows.
        let cutoff = Duration::try_days(self.feed.days).and_then(|d| Utc::now().checked_sub_signed(d));
        if self.feed.days < 1 || cutoff.is_none() {
            return Err(invalid("feed.days", self.feed.days));
        }
        if self.source.page_limit == 0 {
            return Err(invalid("source.page_limit", self.source.page_limit));
        }
        Ok(())
    }
}

fn invalid(key: &str, value: impl ToString) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| invalid(key, value))
}

/// `None` when the file does not exist. An empty file parses as the default.
fn load_yaml<T>(path: &Path) -> Result<Option<T>, ConfigError>
where
    T: DeserializeOwned + Default,
{
    if !path.exists() {
        return Ok(None);
    }

    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    if contents.trim().is_empty() {
        return Ok(Some(T::default()));
    }

    serde_yaml::from_str(&contents)
        .map(Some)
        .map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
}
