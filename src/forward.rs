//! Re-sending content the sender tried to hide: deleted messages and
//! view-once media.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cache::{BoundedMap, BoundedSet};
use crate::context::BotContext;
use crate::errors::BotResult;
use crate::message::{ContentType, Message};
use crate::platform::{self, MessageKey, OutgoingPayload};
use crate::store::settings::{ForwardMode, ForwardSettings};

/// Where forwarded content for a message from `origin_chat` should go.
pub fn destination(
    ctx: &BotContext,
    settings: &ForwardSettings,
    origin_chat: &str,
) -> Option<String> {
    if !settings.is_active() {
        return None;
    }
    match settings.mode {
        ForwardMode::Off => None,
        ForwardMode::Owner => ctx.owner_address(),
        ForwardMode::Chat => Some(origin_chat.to_string()),
        ForwardMode::Jid => settings
            .jid
            .as_deref()
            .filter(|jid| platform::is_valid_address(jid))
            .map(str::to_string),
    }
}

fn cache_key(chat: &str, id: &str) -> String {
    format!("{}/{}", chat, id)
}

struct CachedMessage {
    message: Message,
    cached_at: Instant,
}

/// Keeps recent messages so a deletion can be answered with the original.
pub struct AntiDelete {
    ctx: Arc<BotContext>,
    cache: Mutex<BoundedMap<String, CachedMessage>>,
    forwarded: Mutex<BoundedSet<String>>,
    max_age: Duration,
}

impl AntiDelete {
    pub fn new(ctx: Arc<BotContext>) -> Self {
        let config = &ctx.config.cache;
        let cache = BoundedMap::new(config.message_capacity, config.retain_ratio);
        let forwarded = BoundedSet::new(config.forwarded_capacity, config.retain_ratio);
        let max_age = Duration::from_secs(config.message_max_age_secs);
        Self {
            ctx,
            cache: Mutex::new(cache),
            forwarded: Mutex::new(forwarded),
            max_age,
        }
    }

    /// Remember a message in case it gets deleted later.
    pub async fn cache_message(&self, message: &Message) {
        if message.kind.is_none() || message.revokes.is_some() || message.from_self {
            return;
        }
        self.cache.lock().await.insert(
            cache_key(&message.chat_id, &message.id),
            CachedMessage {
                message: message.clone(),
                cached_at: Instant::now(),
            },
        );
    }

    /// Forward the cached copy of a revoked message. Returns whether
    /// anything was sent; each deleted message is forwarded at most once.
    pub async fn handle_revoke(&self, key: &MessageKey) -> BotResult<bool> {
        let settings = self.ctx.anti_delete_settings().await?.0;
        if !settings.is_active() {
            return Ok(false);
        }

        let id = cache_key(&key.remote_jid, &key.id);
        let original = match self.cache.lock().await.get(&id) {
            Some(cached) => cached.message.clone(),
            None => {
                debug!(id = %id, "Deleted message not in cache");
                return Ok(false);
            }
        };
        let Some(target) = destination(&self.ctx, &settings, &original.chat_id) else {
            warn!("Anti-delete enabled but no destination resolved");
            return Ok(false);
        };
        if !self.forwarded.lock().await.insert(id.clone()) {
            return Ok(false);
        }

        let header = format!(
            "🗑️ *Deleted Message*\nFrom: @{}\nChat: {}",
            original.sender_number(),
            original.chat_id
        );
        let mentions = vec![original.sender_id.clone()];
        let payload = if original.has_media() {
            let caption = match original.payload_caption() {
                Some(caption) => format!("{}\n\n{}", header, caption),
                None => header,
            };
            OutgoingPayload::Forward {
                content: original.content.clone(),
                caption: Some(caption),
                mentions,
            }
        } else {
            OutgoingPayload::Text {
                text: format!("{}\n\n{}", header, original.body),
                mentions,
                quoted: None,
            }
        };

        if let Err(e) = self.ctx.send(&target, payload).await {
            self.forwarded.lock().await.remove(&id);
            return Err(e);
        }
        info!(chat = %original.chat_id, target = %target, "Deleted message forwarded");
        Ok(true)
    }

    /// Drop cached messages older than the configured age.
    pub async fn sweep(&self) -> usize {
        let max_age = self.max_age;
        self.cache
            .lock()
            .await
            .retain(|_, cached| cached.cached_at.elapsed() < max_age)
    }

    pub async fn cached_len(&self) -> usize {
        self.cache.lock().await.len()
    }
}

/// Forwards view-once images and videos from others.
pub struct ViewOnceForwarder {
    ctx: Arc<BotContext>,
    forwarded: Mutex<BoundedSet<String>>,
}

impl ViewOnceForwarder {
    pub fn new(ctx: Arc<BotContext>) -> Self {
        let config = &ctx.config.cache;
        let forwarded = BoundedSet::new(config.forwarded_capacity, config.retain_ratio);
        Self {
            ctx,
            forwarded: Mutex::new(forwarded),
        }
    }

    /// Returns whether the message was forwarded.
    pub async fn handle(&self, message: &Message) -> BotResult<bool> {
        if !message.view_once
            || message.from_self
            || !matches!(message.content_type, ContentType::Image | ContentType::Video)
        {
            return Ok(false);
        }
        let settings = self.ctx.view_once_settings().await?.0;
        let Some(target) = destination(&self.ctx, &settings, &message.chat_id) else {
            return Ok(false);
        };

        let id = cache_key(&message.chat_id, &message.id);
        if !self.forwarded.lock().await.insert(id.clone()) {
            debug!(id = %id, "View-once message already forwarded");
            return Ok(false);
        }

        let caption = message
            .payload_caption()
            .map(str::to_string)
            .unwrap_or_else(|| {
                format!("📸 *View-Once Message*\nFrom: @{}", message.sender_number())
            });
        let payload = OutgoingPayload::Forward {
            content: strip_view_once(&message.content, message.kind.as_deref()),
            caption: Some(caption),
            mentions: vec![message.sender_id.clone()],
        };
        if let Err(e) = self.ctx.send(&target, payload).await {
            self.forwarded.lock().await.remove(&id);
            return Err(e);
        }
        info!(chat = %message.chat_id, target = %target, "View-once message forwarded");
        Ok(true)
    }
}

fn strip_view_once(content: &Value, kind: Option<&str>) -> Value {
    let mut content = content.clone();
    if let Some(payload) = kind
        .and_then(|k| content.get_mut(k))
        .and_then(Value::as_object_mut)
    {
        payload.remove("viewOnce");
    }
    content
}
