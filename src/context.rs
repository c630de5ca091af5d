use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde_json::Value;
use tracing::warn;

use crate::cache::settings::SettingsCache;
use crate::config::Config;
use crate::errors::BotResult;
use crate::message::Message;
use crate::platform::{self, OutgoingPayload, Presence, Receipt, Transport};
use crate::store::settings::{
    self as settings_store, AntiDeleteSettings, AutoResponderSettings, SettingsDocument,
    ViewOnceSettings,
};
use crate::store::RecordStore;

/// Services shared by the pipeline and every command handler.
pub struct BotContext {
    pub config: Config,
    pub transport: Arc<dyn Transport>,
    pub store: Arc<dyn RecordStore>,
    pub settings: SettingsCache,
    identity: RwLock<Option<String>>,
}

impl BotContext {
    pub fn new(config: Config, transport: Arc<dyn Transport>, store: Arc<dyn RecordStore>) -> Self {
        let settings = SettingsCache::new(Duration::from_secs(config.cache.settings_ttl_secs));
        Self {
            config,
            transport,
            store,
            settings,
            identity: RwLock::new(None),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.config.bot.prefix
    }

    /// Own address, known once the session has opened.
    pub fn identity(&self) -> Option<String> {
        match self.identity.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn set_identity(&self, identity: &str) {
        let normalized = platform::normalize_address(identity);
        match self.identity.write() {
            Ok(mut guard) => *guard = Some(normalized),
            Err(poisoned) => *poisoned.into_inner() = Some(normalized),
        }
    }

    /// Whether `sender` is a privileged sender, by address or bare number.
    pub fn is_sudo(&self, sender: &str) -> bool {
        let address = platform::normalize_address(sender);
        let number = platform::address_number(&address);
        self.config
            .bot
            .sudo
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .any(|s| platform::normalize_address(s) == address || s == number)
    }

    /// Address of the first privileged sender, else the bot's own address.
    pub fn owner_address(&self) -> Option<String> {
        let first = self
            .config
            .bot
            .sudo
            .iter()
            .map(|s| s.trim())
            .find(|s| !s.is_empty());
        match first {
            Some(sudo) => Some(platform::user_address(sudo)),
            None => {
                warn!("No sudo configured, falling back to own address");
                self.identity()
            }
        }
    }

    pub async fn send(&self, target: &str, payload: OutgoingPayload) -> BotResult<Receipt> {
        self.transport.send(target, payload).await
    }

    /// Reply in the message's chat, quoting it.
    pub async fn reply(&self, message: &Message, text: impl Into<String>) -> BotResult<Receipt> {
        self.transport
            .send(
                &message.chat_id,
                OutgoingPayload::Text {
                    text: text.into(),
                    mentions: Vec::new(),
                    quoted: Some(message.key.clone()),
                },
            )
            .await
    }

    /// React to a message; a no-op unless reactions are enabled.
    pub async fn react(&self, message: &Message, emoji: &str) -> BotResult<Option<Receipt>> {
        if !self.config.bot.enable_reactions {
            return Ok(None);
        }
        let receipt = self
            .transport
            .send(
                &message.chat_id,
                OutgoingPayload::Reaction {
                    emoji: emoji.to_string(),
                    key: message.key.clone(),
                },
            )
            .await?;
        Ok(Some(receipt))
    }

    pub async fn presence(&self, target: &str, presence: Presence) -> BotResult<()> {
        self.transport.send_presence(target, presence).await
    }

    pub async fn auto_responder_settings(&self) -> BotResult<AutoResponderSettings> {
        let stored = self.cached::<AutoResponderSettings>().await?;
        Ok(stored.unwrap_or_else(|| AutoResponderSettings::from_config(&self.config.auto_responder)))
    }

    pub async fn anti_delete_settings(&self) -> BotResult<AntiDeleteSettings> {
        Ok(self.cached::<AntiDeleteSettings>().await?.unwrap_or_default())
    }

    pub async fn view_once_settings(&self) -> BotResult<ViewOnceSettings> {
        Ok(self.cached::<ViewOnceSettings>().await?.unwrap_or_default())
    }

    /// Persist a settings document and drop its cached copy.
    pub async fn save_settings<T: SettingsDocument + Sync>(&self, settings: &T) -> BotResult<()> {
        settings_store::save(self.store.as_ref(), settings).await?;
        self.settings.invalidate(T::COLLECTION).await;
        Ok(())
    }

    async fn cached<T: SettingsDocument>(&self) -> BotResult<Option<T>> {
        let store = self.store.as_ref();
        let value: Option<Value> = self
            .settings
            .get_or_load(T::COLLECTION, || settings_store::load::<T>(store))
            .await?;
        value
            .map(|v| serde_json::from_value(v).map_err(Into::into))
            .transpose()
    }
}
