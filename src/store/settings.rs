//! Typed settings documents kept in the record store.
//!
//! Each settings kind is a singleton record (`id = 1`) in its own collection.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{criteria, Record, RecordStore};
use crate::config::AutoResponderConfig;
use crate::errors::{BotError, BotResult};
use crate::platform;

pub const AUTO_RESPONDER: &str = "auto_responder";
pub const ANTI_DELETE: &str = "anti_delete";
pub const VIEW_ONCE: &str = "view_once";
pub const STICKER_COMMANDS: &str = "sticker_commands";

const SINGLETON_ID: u64 = 1;

/// A settings document stored as a singleton record.
pub trait SettingsDocument: Serialize + DeserializeOwned + Default {
    const COLLECTION: &'static str;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoResponderSettings {
    #[serde(default)]
    pub enabled: bool,
    /// Bare numbers, digits only
    #[serde(default)]
    pub ignore_numbers: Vec<String>,
    #[serde(default)]
    pub personality: String,
}

impl AutoResponderSettings {
    pub fn from_config(config: &AutoResponderConfig) -> Self {
        Self {
            enabled: config.enabled,
            ignore_numbers: config
                .ignore_numbers
                .iter()
                .map(|n| digits(n))
                .filter(|n| !n.is_empty())
                .collect(),
            personality: config.personality.clone(),
        }
    }

    pub fn is_ignored(&self, number: &str) -> bool {
        self.ignore_numbers.iter().any(|n| n == number)
    }
}

impl Default for AutoResponderSettings {
    fn default() -> Self {
        Self::from_config(&AutoResponderConfig::default())
    }
}

impl SettingsDocument for AutoResponderSettings {
    const COLLECTION: &'static str = AUTO_RESPONDER;
}

/// Where forwarded content (deleted or view-once messages) goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ForwardMode {
    #[default]
    #[serde(rename = "null")]
    Off,
    /// First privileged sender, falling back to the bot's own chat
    #[serde(rename = "p")]
    Owner,
    /// Back into the chat the message came from
    #[serde(rename = "g")]
    Chat,
    /// A configured address
    #[serde(rename = "jid")]
    Jid,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub mode: ForwardMode,
    #[serde(default)]
    pub jid: Option<String>,
}

impl ForwardSettings {
    /// Parse a command argument: `p`/`sudo`, `g`, `null`/`false`, or an address.
    pub fn parse_mode(arg: &str) -> Option<Self> {
        let arg = arg.trim().to_lowercase();
        let (enabled, mode, jid) = match arg.as_str() {
            "null" | "false" | "off" => (false, ForwardMode::Off, None),
            "p" | "sudo" => (true, ForwardMode::Owner, None),
            "g" => (true, ForwardMode::Chat, None),
            address if platform::is_valid_address(address) => {
                (true, ForwardMode::Jid, Some(address.to_string()))
            }
            _ => return None,
        };
        Some(Self { enabled, mode, jid })
    }

    pub fn is_active(&self) -> bool {
        self.enabled && self.mode != ForwardMode::Off
    }

    pub fn describe(&self) -> String {
        if !self.is_active() {
            return "disabled".to_string();
        }
        match self.mode {
            ForwardMode::Owner => "forward to owner".to_string(),
            ForwardMode::Chat => "forward to the same chat".to_string(),
            ForwardMode::Jid => format!(
                "forward to {}",
                self.jid.as_deref().unwrap_or("(unset address)")
            ),
            ForwardMode::Off => "disabled".to_string(),
        }
    }
}

/// Anti-delete forwarding settings.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AntiDeleteSettings(pub ForwardSettings);

impl SettingsDocument for AntiDeleteSettings {
    const COLLECTION: &'static str = ANTI_DELETE;
}

/// View-once forwarding settings.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ViewOnceSettings(pub ForwardSettings);

impl SettingsDocument for ViewOnceSettings {
    const COLLECTION: &'static str = VIEW_ONCE;
}

/// A sticker bound to a command line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StickerCommand {
    pub sticker_hash: String,
    pub command: String,
}

pub fn digits(s: &str) -> String {
    s.chars().filter(|c| c.is_ascii_digit()).collect()
}

fn singleton_criteria() -> Record {
    criteria([("id", json!(SINGLETON_ID))])
}

/// Stored document for `T`, or `None` if it was never saved.
pub async fn load<T: SettingsDocument>(store: &dyn RecordStore) -> BotResult<Option<Value>> {
    Ok(store
        .find_one(T::COLLECTION, &singleton_criteria())
        .await?
        .map(|mut record| {
            record.remove("id");
            Value::Object(record)
        }))
}

/// Create or overwrite the singleton record for `T`.
pub async fn save<T: SettingsDocument>(store: &dyn RecordStore, settings: &T) -> BotResult<()> {
    let Value::Object(mut fields) = serde_json::to_value(settings)? else {
        return Err(BotError::Store(format!(
            "{} settings must serialize to an object",
            T::COLLECTION
        )));
    };
    let key = singleton_criteria();
    let updated = store.update(T::COLLECTION, &key, &fields).await?;
    if updated == 0 {
        fields.insert("id".to_string(), json!(SINGLETON_ID));
        store.create(T::COLLECTION, fields).await?;
    }
    Ok(())
}

pub async fn find_sticker_command(
    store: &dyn RecordStore,
    sticker_hash: &str,
) -> BotResult<Option<StickerCommand>> {
    let found = store
        .find_one(
            STICKER_COMMANDS,
            &criteria([("stickerHash", json!(sticker_hash))]),
        )
        .await?;
    found
        .map(|record| serde_json::from_value(Value::Object(record)).map_err(BotError::from))
        .transpose()
}
