//! Auto-responder for direct chats: ignore list, per-sender rate window,
//! and a typing delay before the reply.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::AutoResponderConfig;
use crate::context::BotContext;
use crate::errors::BotResult;
use crate::message::Message;
use crate::platform::Presence;
use crate::store::settings::AutoResponderSettings;

/// Timestamps of recent responses to one sender.
#[derive(Debug, Default)]
pub struct RateWindow {
    stamps: VecDeque<Instant>,
}

impl RateWindow {
    /// Record an attempt at `now` unless `limit` attempts already fall inside
    /// the trailing `window`. Expired stamps are dropped first.
    pub fn try_acquire(&mut self, now: Instant, limit: usize, window: Duration) -> bool {
        while let Some(&oldest) = self.stamps.front() {
            if now.saturating_duration_since(oldest) >= window {
                self.stamps.pop_front();
            } else {
                break;
            }
        }
        if self.stamps.len() >= limit {
            return false;
        }
        self.stamps.push_back(now);
        true
    }

    /// Give back the slot taken at `stamp`.
    pub fn release(&mut self, stamp: Instant) -> bool {
        match self.stamps.iter().rposition(|&s| s == stamp) {
            Some(pos) => self.stamps.remove(pos).is_some(),
            None => false,
        }
    }

    pub fn is_idle(&self, now: Instant, window: Duration) -> bool {
        self.stamps
            .back()
            .map_or(true, |&last| now.saturating_duration_since(last) >= window)
    }
}

pub struct RateLimiter {
    windows: Mutex<HashMap<String, RateWindow>>,
    limit: usize,
    window: Duration,
}

impl RateLimiter {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            limit,
            window,
        }
    }

    pub async fn try_acquire(&self, sender: &str, now: Instant) -> bool {
        let mut windows = self.windows.lock().await;
        windows
            .entry(sender.to_string())
            .or_default()
            .try_acquire(now, self.limit, self.window)
    }

    pub async fn release(&self, sender: &str, stamp: Instant) {
        if let Some(window) = self.windows.lock().await.get_mut(sender) {
            window.release(stamp);
        }
    }

    /// Drop windows with no live stamps; returns how many were dropped.
    pub async fn sweep(&self, now: Instant) -> usize {
        let mut windows = self.windows.lock().await;
        let before = windows.len();
        windows.retain(|_, w| !w.is_idle(now, self.window));
        before - windows.len()
    }
}

/// Human-looking response delay.
#[derive(Debug, Clone, Copy)]
pub struct DelayPolicy {
    pub min: Duration,
    pub max: Duration,
    /// Characters per second; zero disables the typing bound
    pub typing_speed: u64,
    pub max_typing: Duration,
}

impl DelayPolicy {
    pub fn from_config(config: &AutoResponderConfig) -> Self {
        Self {
            min: Duration::from_millis(config.min_delay_ms),
            max: Duration::from_millis(config.max_delay_ms.max(config.min_delay_ms)),
            typing_speed: config.typing_speed,
            max_typing: Duration::from_millis(config.max_typing_time_ms),
        }
    }

    /// A random delay in `[min, max]`, capped by the time it takes to type
    /// `text_len` characters (itself capped by `max_typing`).
    pub fn delay(&self, text_len: usize, rng: &mut fastrand::Rng) -> Duration {
        let min = self.min.as_millis() as u64;
        let max = self.max.as_millis() as u64;
        let random = Duration::from_millis(rng.u64(min..=max.max(min)));
        let typing = match self.typing_speed {
            0 => self.max_typing,
            speed => Duration::from_millis(text_len as u64 * 1000 / speed).min(self.max_typing),
        };
        random.min(typing)
    }
}

/// Produces the auto-reply text for a message.
#[async_trait]
pub trait ReplySource: Send + Sync {
    async fn reply(
        &self,
        message: &Message,
        settings: &AutoResponderSettings,
    ) -> anyhow::Result<Option<String>>;
}

/// Fixed reply with `{name}` replaced by the sender's display name.
pub struct CannedReply {
    template: String,
}

impl CannedReply {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }
}

#[async_trait]
impl ReplySource for CannedReply {
    async fn reply(
        &self,
        message: &Message,
        _settings: &AutoResponderSettings,
    ) -> anyhow::Result<Option<String>> {
        let name = message
            .push_name
            .as_deref()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| message.sender_number());
        let text = self.template.replace("{name}", name);
        Ok(Some(text).filter(|t| !t.trim().is_empty()))
    }
}

/// Why the auto-responder stayed quiet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Allowed,
    Ignored,
    Limited,
}

pub struct AutoResponder {
    ctx: Arc<BotContext>,
    limiter: RateLimiter,
    delay: DelayPolicy,
    source: Arc<dyn ReplySource>,
}

impl AutoResponder {
    pub fn new(ctx: Arc<BotContext>, source: Arc<dyn ReplySource>) -> Self {
        let config = &ctx.config.auto_responder;
        let limiter = RateLimiter::new(
            config.rate_limit,
            Duration::from_millis(config.rate_window_ms),
        );
        let delay = DelayPolicy::from_config(config);
        Self {
            ctx,
            limiter,
            delay,
            source,
        }
    }

    /// Ignore list first, then the sender's rate window.
    pub async fn gate(
        &self,
        settings: &AutoResponderSettings,
        sender_number: &str,
        now: Instant,
    ) -> Gate {
        if settings.is_ignored(sender_number) {
            return Gate::Ignored;
        }
        if !self.limiter.try_acquire(sender_number, now).await {
            return Gate::Limited;
        }
        Gate::Allowed
    }

    /// Reply to `message` if it qualifies. Returns whether a reply was sent.
    ///
    /// The rate slot is held while the reply is produced and handed back if
    /// nothing ends up being sent.
    pub async fn respond(&self, message: &Message) -> BotResult<bool> {
        if message.from_self
            || message.is_group
            || message.body.trim().is_empty()
            || message.body.starts_with(self.ctx.prefix())
        {
            return Ok(false);
        }
        let settings = self.ctx.auto_responder_settings().await?;
        if !settings.enabled {
            return Ok(false);
        }

        let sender = message.sender_number();
        let now = Instant::now();
        match self.gate(&settings, sender, now).await {
            Gate::Allowed => {}
            gate => {
                debug!(sender, ?gate, "Auto-response skipped");
                return Ok(false);
            }
        }

        let text = match self.source.reply(message, &settings).await {
            Ok(Some(text)) => text,
            Ok(None) => {
                self.limiter.release(sender, now).await;
                return Ok(false);
            }
            Err(e) => {
                warn!(sender, "Reply source failed: {:#}", e);
                self.limiter.release(sender, now).await;
                return Ok(false);
            }
        };

        if let Err(e) = self.deliver(message, text).await {
            self.limiter.release(sender, now).await;
            return Err(e);
        }
        Ok(true)
    }

    async fn deliver(&self, message: &Message, text: String) -> BotResult<()> {
        let delay = self.delay.delay(text.chars().count(), &mut fastrand::Rng::new());
        self.ctx.presence(&message.chat_id, Presence::Composing).await?;
        tokio::time::sleep(delay).await;
        self.ctx.reply(message, text).await?;
        if let Err(e) = self.ctx.presence(&message.chat_id, Presence::Paused).await {
            debug!("Failed to clear typing state: {}", e);
        }
        info!(
            sender = message.sender_number(),
            delay_ms = delay.as_millis() as u64,
            "Auto-response sent"
        );
        Ok(())
    }

    pub async fn sweep(&self) -> usize {
        self.limiter.sweep(Instant::now()).await
    }
}
