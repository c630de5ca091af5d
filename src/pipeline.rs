//! Inbound message pipeline.
//!
//! Batches from the session are cut into windows of `concurrency_limit`
//! messages. Every message in a window runs as its own task; the next
//! window starts once all of them have settled.

use std::future::Future;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::commands::{CommandRegistry, DispatchOutcome};
use crate::context::BotContext;
use crate::errors::BotResult;
use crate::forward::{AntiDelete, ViewOnceForwarder};
use crate::message::{self, Message};
use crate::platform::{RawEvent, RawUpdate};
use crate::responder::{AutoResponder, ReplySource};
use crate::session::SessionEvent;
use crate::store::settings as settings_store;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchReport {
    pub succeeded: usize,
    pub failed: usize,
}

/// Run `task` over `items` in contiguous windows of `limit`.
///
/// A failing or panicking task is counted and logged; it never cancels its
/// siblings.
pub async fn process_in_windows<T, F, Fut>(items: Vec<T>, limit: usize, task: F) -> BatchReport
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let limit = limit.max(1);
    let mut report = BatchReport::default();
    let mut items = items.into_iter().peekable();

    while items.peek().is_some() {
        let handles: Vec<_> = items
            .by_ref()
            .take(limit)
            .map(|item| tokio::spawn(task(item)))
            .collect();
        for result in join_all(handles).await {
            match result {
                Ok(Ok(())) => report.succeeded += 1,
                Ok(Err(e)) => {
                    report.failed += 1;
                    error!("Message processing failed: {:#}", e);
                }
                Err(e) => {
                    report.failed += 1;
                    error!("Message task aborted: {}", e);
                }
            }
        }
    }
    report
}

/// What the pipeline did with one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Skipped,
    Revoke { forwarded: bool },
    Intercepted,
    Sticker(DispatchOutcome),
    AutoResponded,
    Dispatched(DispatchOutcome),
}

pub struct Pipeline {
    ctx: Arc<BotContext>,
    registry: Arc<CommandRegistry>,
    responder: AutoResponder,
    anti_delete: AntiDelete,
    view_once: ViewOnceForwarder,
}

impl Pipeline {
    pub fn new(
        ctx: Arc<BotContext>,
        registry: Arc<CommandRegistry>,
        reply_source: Arc<dyn ReplySource>,
    ) -> Self {
        Self {
            responder: AutoResponder::new(ctx.clone(), reply_source),
            anti_delete: AntiDelete::new(ctx.clone()),
            view_once: ViewOnceForwarder::new(ctx.clone()),
            registry,
            ctx,
        }
    }

    /// Consume session events until logout or until the session goes away.
    ///
    /// Each batch runs as its own task so a slow handler never holds up the
    /// batches behind it. Outstanding batches are drained before returning.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<SessionEvent>) {
        let mut in_flight = JoinSet::new();
        loop {
            tokio::select! {
                Some(done) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = done {
                        error!("Batch task aborted: {}", e);
                    }
                }
                event = events.recv() => {
                    let Some(event) = event else { break };
                    match event {
                        SessionEvent::Ready { identity } => info!("Pipeline ready for {}", identity),
                        SessionEvent::Messages(batch) => {
                            let pipeline = self.clone();
                            in_flight.spawn(async move {
                                let size = batch.len();
                                let report = pipeline.process_batch(batch).await;
                                debug!(
                                    size,
                                    succeeded = report.succeeded,
                                    failed = report.failed,
                                    "Batch processed"
                                );
                            });
                        }
                        SessionEvent::Updates(updates) => {
                            let pipeline = self.clone();
                            in_flight.spawn(async move { pipeline.handle_updates(updates).await });
                        }
                        SessionEvent::LoggedOut => {
                            info!("Session logged out, pipeline stopping");
                            break;
                        }
                    }
                }
            }
        }

        while let Some(done) = in_flight.join_next().await {
            if let Err(e) = done {
                error!("Batch task aborted: {}", e);
            }
        }
    }

    pub async fn process_batch(self: &Arc<Self>, events: Vec<RawEvent>) -> BatchReport {
        let limit = self.ctx.config.bot.concurrency_limit;
        process_in_windows(events, limit, |event| {
            let pipeline = self.clone();
            async move {
                pipeline.process_message(event).await?;
                Ok(())
            }
        })
        .await
    }

    /// Run one raw event through every stage, stopping at the first stage
    /// that consumes it.
    pub async fn process_message(&self, event: RawEvent) -> BotResult<Outcome> {
        if event.is_status_broadcast() {
            return Ok(Outcome::Skipped);
        }

        let identity = self.ctx.identity();
        let message = message::normalize(&event, identity.as_deref());
        debug!(
            chat = %message.chat_id,
            sender = %message.sender_id,
            timestamp = ?message.timestamp,
            "Message normalized"
        );
        self.anti_delete.cache_message(&message).await;

        if let Some(revoked) = &message.revokes {
            let forwarded = self.anti_delete.handle_revoke(revoked).await?;
            return Ok(Outcome::Revoke { forwarded });
        }

        if let Err(e) = self.view_once.handle(&message).await {
            warn!(chat = %message.chat_id, "View-once forwarding failed: {}", e);
        }

        if self.registry.intercept(&self.ctx, &message).await {
            return Ok(Outcome::Intercepted);
        }

        if let Some(outcome) = self.run_sticker_command(&message).await? {
            return Ok(Outcome::Sticker(outcome));
        }

        let is_command = message.body.starts_with(self.ctx.prefix());
        if !message.from_self && !is_command && self.responder.respond(&message).await? {
            return Ok(Outcome::AutoResponded);
        }

        let outcome = self.registry.dispatch(&self.ctx, &message).await;
        Ok(Outcome::Dispatched(outcome))
    }

    async fn run_sticker_command(&self, message: &Message) -> BotResult<Option<DispatchOutcome>> {
        let Some(hash) = message.sticker_hash.as_deref() else {
            return Ok(None);
        };
        let found = settings_store::find_sticker_command(self.ctx.store.as_ref(), hash).await?;
        let Some(binding) = found else {
            return Ok(None);
        };
        debug!(command = %binding.command, "Sticker bound to command");
        let rewritten = message.with_body(format!("{}{}", self.ctx.prefix(), binding.command));
        Ok(Some(self.registry.dispatch(&self.ctx, &rewritten).await))
    }

    pub async fn handle_updates(&self, updates: Vec<RawUpdate>) {
        for update in updates.iter().filter(|u| u.is_revoke()) {
            if let Err(e) = self.anti_delete.handle_revoke(&update.key).await {
                warn!(chat = %update.key.remote_jid, "Anti-delete failed: {}", e);
            }
        }
    }

    /// Periodic maintenance of every time-bounded cache.
    pub async fn sweep_caches(&self) -> usize {
        let settings = self.ctx.settings.sweep().await;
        let messages = self.anti_delete.sweep().await;
        let windows = self.responder.sweep().await;
        let cached = self.anti_delete.cached_len().await;
        info!(settings, messages, windows, cached, "Cache sweep finished");
        settings + messages + windows
    }
}
