use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::errors::BotError;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub bot: BotConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub status: StatusConfig,
    #[serde(default)]
    pub auto_responder: AutoResponderConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BotConfig {
    #[serde(default = "default_prefix")]
    pub prefix: String,
    /// Privileged senders, as bare numbers or full addresses
    #[serde(default)]
    pub sudo: Vec<String>,
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: usize,
    /// Handlers may react to messages only when this is set
    #[serde(default)]
    pub enable_reactions: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default)]
    pub always_online: bool,
    /// Own address announced by the console transport
    #[serde(default = "default_console_identity")]
    pub console_identity: String,
    /// Sender of plain-text lines typed into the console
    #[serde(default = "default_console_sender")]
    pub console_sender: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StatusConfig {
    #[serde(default)]
    pub auto_view: bool,
    #[serde(default)]
    pub auto_react: bool,
    #[serde(default = "default_status_emojis")]
    pub emojis: Vec<String>,
    #[serde(default = "default_capacity")]
    pub seen_capacity: usize,
    #[serde(default = "default_retain_ratio")]
    pub retain_ratio: f64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AutoResponderConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub ignore_numbers: Vec<String>,
    #[serde(default = "default_personality")]
    pub personality: String,
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Characters per second
    #[serde(default = "default_typing_speed")]
    pub typing_speed: u64,
    #[serde(default = "default_max_typing_time_ms")]
    pub max_typing_time_ms: u64,
    #[serde(default = "default_rate_limit")]
    pub rate_limit: usize,
    #[serde(default = "default_rate_window_ms")]
    pub rate_window_ms: u64,
    /// Canned reply; `{name}` is replaced with the sender's display name
    #[serde(default = "default_reply")]
    pub reply: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_capacity")]
    pub message_capacity: usize,
    #[serde(default = "default_message_max_age_secs")]
    pub message_max_age_secs: u64,
    #[serde(default = "default_settings_ttl_secs")]
    pub settings_ttl_secs: u64,
    #[serde(default = "default_cleanup_cron")]
    pub cleanup_cron: String,
    #[serde(default = "default_capacity")]
    pub forwarded_capacity: usize,
    #[serde(default = "default_retain_ratio")]
    pub retain_ratio: f64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub database_path: PathBuf,
}

fn default_prefix() -> String {
    ".".to_string()
}

fn default_concurrency_limit() -> usize {
    5
}

fn default_reconnect_delay_ms() -> u64 {
    3000
}

fn default_console_identity() -> String {
    "10000000000@s.whatsapp.net".to_string()
}

fn default_console_sender() -> String {
    "10000000001@s.whatsapp.net".to_string()
}

fn default_status_emojis() -> Vec<String> {
    ["😀", "👍", "❤️", "🔥", "💯", "✨", "🎉", "👏", "💪", "🙌"]
        .iter()
        .map(|e| e.to_string())
        .collect()
}

fn default_capacity() -> usize {
    1000
}

fn default_retain_ratio() -> f64 {
    0.8
}

fn default_personality() -> String {
    "You are a helpful and friendly assistant. Respond naturally and conversationally.".to_string()
}

fn default_min_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    3000
}

fn default_typing_speed() -> u64 {
    50
}

fn default_max_typing_time_ms() -> u64 {
    10_000
}

fn default_rate_limit() -> usize {
    5
}

fn default_rate_window_ms() -> u64 {
    60_000
}

fn default_reply() -> String {
    "Hi {name}, I'm away right now and will get back to you soon.".to_string()
}

fn default_message_max_age_secs() -> u64 {
    3600
}

fn default_settings_ttl_secs() -> u64 {
    600
}

fn default_cleanup_cron() -> String {
    "0 */10 * * * *".to_string()
}

fn default_db_path() -> PathBuf {
    PathBuf::from("wabot.db")
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            sudo: Vec::new(),
            concurrency_limit: default_concurrency_limit(),
            enable_reactions: false,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: default_reconnect_delay_ms(),
            always_online: false,
            console_identity: default_console_identity(),
            console_sender: default_console_sender(),
        }
    }
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            auto_view: false,
            auto_react: false,
            emojis: default_status_emojis(),
            seen_capacity: default_capacity(),
            retain_ratio: default_retain_ratio(),
        }
    }
}

impl Default for AutoResponderConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ignore_numbers: Vec::new(),
            personality: default_personality(),
            min_delay_ms: default_min_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            typing_speed: default_typing_speed(),
            max_typing_time_ms: default_max_typing_time_ms(),
            rate_limit: default_rate_limit(),
            rate_window_ms: default_rate_window_ms(),
            reply: default_reply(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            message_capacity: default_capacity(),
            message_max_age_secs: default_message_max_age_secs(),
            settings_ttl_secs: default_settings_ttl_secs(),
            cleanup_cron: default_cleanup_cron(),
            forwarded_capacity: default_capacity(),
            retain_ratio: default_retain_ratio(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_path: default_db_path(),
        }
    }
}

impl StatusConfig {
    /// Reaction symbols with blanks removed.
    pub fn reaction_symbols(&self) -> Vec<&str> {
        self.emojis
            .iter()
            .map(|e| e.trim())
            .filter(|e| !e.is_empty())
            .collect()
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.bot.prefix.is_empty() {
            anyhow::bail!(BotError::Config("bot.prefix must not be empty".into()));
        }
        if self.bot.concurrency_limit == 0 {
            anyhow::bail!(BotError::Config(
                "bot.concurrency_limit must be at least 1".into()
            ));
        }
        for (name, ratio) in [
            ("status.retain_ratio", self.status.retain_ratio),
            ("cache.retain_ratio", self.cache.retain_ratio),
        ] {
            if !(ratio > 0.0 && ratio <= 1.0) {
                anyhow::bail!(BotError::Config(format!(
                    "{} must be in (0, 1], got {}",
                    name, ratio
                )));
            }
        }
        let ar = &self.auto_responder;
        if ar.min_delay_ms > ar.max_delay_ms {
            anyhow::bail!(BotError::Config(format!(
                "auto_responder.min_delay_ms ({}) exceeds max_delay_ms ({})",
                ar.min_delay_ms, ar.max_delay_ms
            )));
        }
        Ok(())
    }
}
