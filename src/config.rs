//! Environment-driven configuration.
//!
//! Every knob is read from the environment (a `.env` file is honored by the
//! binary). A channel section is only constructed when its anchor variables
//! are present; validation of required key combinations happens here and is
//! fatal.

use crate::error::ConfigError;

const YOUTUBE_API_BASE: &str = "https://www.googleapis.com/youtube/v3";
const YOUTUBE_FEED_BASE: &str = "https://www.youtube.com/feeds/videos.xml";
const YOUTUBE_WATCH_BASE: &str = "https://www.youtube.com";

const MIN_POLL_INTERVAL_SECS: u64 = 5;
const DEFAULT_POLL_INTERVAL_SECS: u64 = 20;
const DEFAULT_MESSAGE_FORMAT: &str = "[YT] {author}: {message}";
const DEFAULT_MIN_ACCUMULATE_SECS: u64 = 3;
const DEFAULT_MAX_ACCUMULATE_SECS: u64 = 30;
const DEFAULT_WS_PATH: &str = "/ws";
const DEFAULT_EMOTION: &str = "neutral";
const DEFAULT_QUEUE_SIZE: usize = 10;

/// Top-level configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub youtube: Option<YouTubeConfig>,
    pub avatar: Option<AvatarConfig>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            youtube: YouTubeConfig::from_env()?,
            avatar: AvatarConfig::from_env()?,
        })
    }
}

/// Chat acquisition transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChatSource {
    /// Zero-quota scraping of the public watch page.
    #[default]
    Scrape,
    /// Quota-metered Data API v3 polling. Requires an API key.
    Rest,
}

impl std::str::FromStr for ChatSource {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "scrape" | "innertube" => Ok(Self::Scrape),
            "rest" | "data_api" => Ok(Self::Rest),
            _ => Err(ConfigError::InvalidValue {
                key: "YT_CHAT_SOURCE".to_string(),
                message: format!("unknown chat source: {s}, expected 'scrape' or 'rest'"),
            }),
        }
    }
}

/// Comment selection strategy when a poll yields more than the per-poll cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectionStrategy {
    /// Keep the last N in arrival order.
    #[default]
    Latest,
    /// Super-chats, owner and moderator messages first.
    Priority,
    /// Uniform shuffle, then take N.
    Random,
}

impl std::str::FromStr for SelectionStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "latest" => Ok(Self::Latest),
            "priority" => Ok(Self::Priority),
            "random" => Ok(Self::Random),
            _ => Err(ConfigError::InvalidValue {
                key: "YT_SELECTION_STRATEGY".to_string(),
                message: format!(
                    "unknown strategy: {s}, expected 'latest', 'priority', or 'random'"
                ),
            }),
        }
    }
}

/// Quality-filter thresholds. All-zero means the filter is a pass-through.
#[derive(Debug, Clone, Default)]
pub struct FilterConfig {
    pub ng_words: Vec<String>,
    pub min_message_length: usize,
    pub max_repeat_ratio: f64,
    pub block_urls: bool,
}

impl FilterConfig {
    pub fn is_noop(&self) -> bool {
        self.ng_words.is_empty()
            && self.min_message_length == 0
            && self.max_repeat_ratio == 0.0
            && !self.block_urls
    }
}

/// Per-poll selection settings.
#[derive(Debug, Clone, Default)]
pub struct SelectionConfig {
    /// Cap per poll; zero or negative disables capping.
    pub max_comments_per_poll: i64,
    pub strategy: SelectionStrategy,
}

/// YouTube Live chat ingestion settings.
#[derive(Debug, Clone)]
pub struct YouTubeConfig {
    pub chat_source: ChatSource,
    pub api_key: Option<String>,
    pub video_id: String,
    pub channel_id: String,
    pub live_chat_id: String,
    pub poll_interval_seconds: u64,
    pub superchat_poll_seconds: u64,
    pub forward_channel: String,
    pub forward_chat_id: String,
    pub message_format: String,
    pub allow_from: Vec<String>,
    pub filter: FilterConfig,
    pub selection: SelectionConfig,
    pub batch_comments: bool,
    pub accumulate_comments: bool,
    pub min_accumulate_seconds: u64,
    pub max_accumulate_seconds: u64,
    /// Overridable endpoints (tests point these at a mock server).
    pub api_base: String,
    pub feed_base: String,
    pub watch_base: String,
}

impl YouTubeConfig {
    fn from_env() -> Result<Option<Self>, ConfigError> {
        let video_id = optional_env("YT_VIDEO_ID")?.unwrap_or_default();
        let channel_id = optional_env("YT_CHANNEL_ID")?.unwrap_or_default();
        if video_id.is_empty() && channel_id.is_empty() {
            return Ok(None);
        }

        let chat_source: ChatSource = optional_env("YT_CHAT_SOURCE")?
            .map(|s| s.parse())
            .transpose()?
            .unwrap_or_default();
        let api_key = optional_env("YT_API_KEY")?;

        if chat_source == ChatSource::Rest && api_key.is_none() {
            return Err(ConfigError::InvalidValue {
                key: "YT_API_KEY".to_string(),
                message: "required when YT_CHAT_SOURCE=rest".to_string(),
            });
        }
        if api_key.is_none() {
            tracing::warn!("YT_API_KEY not set: no search fallback, no super-chat polling");
        }

        let poll_interval_seconds =
            match parse_optional_env::<u64>("YT_POLL_INTERVAL_SECONDS", DEFAULT_POLL_INTERVAL_SECS)?
            {
                n if n < MIN_POLL_INTERVAL_SECS => DEFAULT_POLL_INTERVAL_SECS,
                n => n,
            };

        let accumulate_comments = parse_optional_env("YT_ACCUMULATE_COMMENTS", false)?;
        let min_accumulate_seconds = match parse_optional_env::<u64>(
            "YT_MIN_ACCUMULATE_SECONDS",
            DEFAULT_MIN_ACCUMULATE_SECS,
        )? {
            0 => DEFAULT_MIN_ACCUMULATE_SECS,
            n => n,
        };
        let max_accumulate_seconds = match parse_optional_env::<u64>(
            "YT_MAX_ACCUMULATE_SECONDS",
            DEFAULT_MAX_ACCUMULATE_SECS,
        )? {
            0 => DEFAULT_MAX_ACCUMULATE_SECS,
            n => n,
        };

        Ok(Some(Self {
            chat_source,
            api_key,
            video_id,
            channel_id,
            live_chat_id: optional_env("YT_LIVE_CHAT_ID")?.unwrap_or_default(),
            poll_interval_seconds,
            superchat_poll_seconds: parse_optional_env("YT_SUPERCHAT_POLL_SECONDS", 0)?,
            forward_channel: optional_env("YT_FORWARD_CHANNEL")?.unwrap_or_default(),
            forward_chat_id: optional_env("YT_FORWARD_CHAT_ID")?.unwrap_or_default(),
            message_format: optional_env("YT_MESSAGE_FORMAT")?
                .unwrap_or_else(|| DEFAULT_MESSAGE_FORMAT.to_string()),
            allow_from: list_env("YT_ALLOW_FROM")?,
            filter: FilterConfig {
                ng_words: list_env("YT_NG_WORDS")?,
                min_message_length: parse_optional_env("YT_MIN_MESSAGE_LENGTH", 0)?,
                max_repeat_ratio: parse_optional_env("YT_MAX_REPEAT_RATIO", 0.0)?,
                block_urls: parse_optional_env("YT_BLOCK_URLS", false)?,
            },
            selection: SelectionConfig {
                max_comments_per_poll: parse_optional_env("YT_MAX_COMMENTS_PER_POLL", 0)?,
                strategy: optional_env("YT_SELECTION_STRATEGY")?
                    .map(|s| s.parse())
                    .transpose()?
                    .unwrap_or_default(),
            },
            batch_comments: parse_optional_env("YT_BATCH_COMMENTS", false)?,
            accumulate_comments,
            min_accumulate_seconds,
            max_accumulate_seconds,
            api_base: optional_env("YT_API_BASE")?.unwrap_or_else(|| YOUTUBE_API_BASE.to_string()),
            feed_base: optional_env("YT_FEED_BASE")?
                .unwrap_or_else(|| YOUTUBE_FEED_BASE.to_string()),
            watch_base: optional_env("YT_WATCH_BASE")?
                .unwrap_or_else(|| YOUTUBE_WATCH_BASE.to_string()),
        }))
    }
}

/// Avatar WebSocket server settings.
#[derive(Debug, Clone)]
pub struct AvatarConfig {
    pub ws_host: String,
    pub ws_port: u16,
    pub ws_path: String,
    pub default_emotion: String,
    pub max_queue_size: usize,
}

impl AvatarConfig {
    fn from_env() -> Result<Option<Self>, ConfigError> {
        let Some(port) = optional_env("AVATAR_WS_PORT")? else {
            return Ok(None);
        };
        let ws_port: u16 = port.parse().map_err(|e| ConfigError::InvalidValue {
            key: "AVATAR_WS_PORT".to_string(),
            message: format!("must be a valid port number: {e}"),
        })?;

        Ok(Some(Self {
            ws_host: optional_env("AVATAR_WS_HOST")?.unwrap_or_else(|| "0.0.0.0".to_string()),
            ws_port,
            ws_path: optional_env("AVATAR_WS_PATH")?
                .unwrap_or_else(|| DEFAULT_WS_PATH.to_string()),
            default_emotion: optional_env("AVATAR_DEFAULT_EMOTION")?
                .unwrap_or_else(|| DEFAULT_EMOTION.to_string()),
            max_queue_size: match parse_optional_env::<i64>("AVATAR_MAX_QUEUE_SIZE", 0)? {
                n if n <= 0 => DEFAULT_QUEUE_SIZE,
                n => n as usize,
            },
        }))
    }
}

// Helper functions

fn optional_env(key: &str) -> Result<Option<String>, ConfigError> {
    match std::env::var(key) {
        Ok(val) if val.is_empty() => Ok(None),
        Ok(val) => Ok(Some(val)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("failed to read: {e}"),
        }),
    }
}

fn parse_optional_env<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    optional_env(key)?
        .map(|s| {
            s.parse().map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{e}"),
            })
        })
        .transpose()
        .map(|opt| opt.unwrap_or(default))
}

fn list_env(key: &str) -> Result<Vec<String>, ConfigError> {
    Ok(optional_env(key)?
        .map(|s| {
            s.split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default())
}
