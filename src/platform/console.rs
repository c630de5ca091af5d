//! Line-oriented transport over stdin/stdout for running the bot locally.
//!
//! Each input line is either a JSON raw event, a JSON message update (a line
//! with an `update` field), a control line (`/drop`, `/logout` and friends),
//! or plain text delivered as a direct message from the configured console
//! sender. Outgoing payloads are printed one per line.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    DisconnectReason, MessageKey, OutgoingPayload, Presence, RawEvent, RawUpdate, Receipt,
    Transport, TransportEvent,
};
use crate::errors::{BotError, BotResult};

const EVENT_BUFFER: usize = 64;

/// What one input line turns into.
#[derive(Debug)]
enum ConsoleInput {
    Event(RawEvent),
    Update(RawUpdate),
    Close(DisconnectReason),
    Skip,
}

pub struct ConsoleTransport {
    identity: String,
    sender: String,
    lines: Arc<Mutex<Lines<BufReader<Stdin>>>>,
}

impl ConsoleTransport {
    pub fn new(identity: impl Into<String>, sender: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            sender: sender.into(),
            lines: Arc::new(Mutex::new(BufReader::new(tokio::io::stdin()).lines())),
        }
    }

    async fn write_line(line: String) -> BotResult<()> {
        let mut stdout = tokio::io::stdout();
        stdout
            .write_all(format!("{}\n", line).as_bytes())
            .await
            .map_err(|e| BotError::transport(e.to_string()))?;
        stdout
            .flush()
            .await
            .map_err(|e| BotError::transport(e.to_string()))
    }
}

fn parse_line(line: &str, sender: &str) -> ConsoleInput {
    let line = line.trim();
    match line {
        "" => ConsoleInput::Skip,
        "/drop" => ConsoleInput::Close(DisconnectReason::ConnectionLost),
        "/close" => ConsoleInput::Close(DisconnectReason::ConnectionClosed),
        "/replaced" => ConsoleInput::Close(DisconnectReason::ConnectionReplaced),
        "/timeout" => ConsoleInput::Close(DisconnectReason::TimedOut),
        "/restart" => ConsoleInput::Close(DisconnectReason::RestartRequired),
        "/logout" => ConsoleInput::Close(DisconnectReason::LoggedOut),
        json_line if json_line.starts_with('{') => parse_json_line(json_line),
        text => ConsoleInput::Event(RawEvent {
            key: MessageKey {
                remote_jid: sender.to_string(),
                from_me: false,
                id: Uuid::new_v4().simple().to_string().to_uppercase(),
                participant: None,
            },
            message: Some(json!({ "conversation": text })),
            push_name: Some("console".to_string()),
            message_timestamp: Some(chrono::Utc::now().timestamp()),
        }),
    }
}

/// Lines carrying an `update` field are message updates; anything else is an event.
fn parse_json_line(line: &str) -> ConsoleInput {
    let parsed = serde_json::from_str::<Value>(line).and_then(|value| {
        if value.get("update").is_some() {
            serde_json::from_value(value).map(ConsoleInput::Update)
        } else {
            serde_json::from_value(value).map(ConsoleInput::Event)
        }
    });
    parsed.unwrap_or_else(|e| {
        warn!("Ignoring malformed event line: {}", e);
        ConsoleInput::Skip
    })
}

fn render(target: &str, payload: &OutgoingPayload) -> String {
    match payload {
        OutgoingPayload::Text { text, .. } => format!("[{}] {}", target, text),
        OutgoingPayload::Reaction { emoji, key } => {
            format!("[{}] reacted {} to {}", target, emoji, key.id)
        }
        OutgoingPayload::Forward { content, caption, .. } => format!(
            "[{}] forward {}{}",
            target,
            content,
            caption
                .as_deref()
                .map(|c| format!(" ({})", c))
                .unwrap_or_default()
        ),
    }
}

#[async_trait]
impl Transport for ConsoleTransport {
    async fn connect(&self) -> BotResult<mpsc::Receiver<TransportEvent>> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let lines = self.lines.clone();
        let identity = self.identity.clone();
        let sender = self.sender.clone();

        tokio::spawn(async move {
            if tx.send(TransportEvent::Connecting).await.is_err() {
                return;
            }
            if tx.send(TransportEvent::Open { identity }).await.is_err() {
                return;
            }
            let mut lines = lines.lock().await;
            loop {
                let line = match lines.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) => {
                        info!("Console input closed");
                        let _ = tx
                            .send(TransportEvent::Closed(DisconnectReason::LoggedOut))
                            .await;
                        return;
                    }
                    Err(e) => {
                        warn!("Console read failed: {}", e);
                        let _ = tx
                            .send(TransportEvent::Closed(DisconnectReason::Other(e.to_string())))
                            .await;
                        return;
                    }
                };
                let event = match parse_line(&line, &sender) {
                    ConsoleInput::Event(raw) => TransportEvent::Messages(vec![raw]),
                    ConsoleInput::Update(update) => TransportEvent::Updates(vec![update]),
                    ConsoleInput::Close(reason) => {
                        let _ = tx.send(TransportEvent::Closed(reason)).await;
                        return;
                    }
                    ConsoleInput::Skip => continue,
                };
                if tx.send(event).await.is_err() {
                    debug!("Console connection dropped by receiver");
                    return;
                }
            }
        });

        Ok(rx)
    }

    async fn send(&self, target: &str, payload: OutgoingPayload) -> BotResult<Receipt> {
        Self::write_line(render(target, &payload)).await?;
        Ok(Receipt {
            id: Uuid::new_v4().to_string(),
        })
    }

    async fn mark_read(&self, keys: &[MessageKey]) -> BotResult<()> {
        for key in keys {
            debug!(chat = %key.remote_jid, id = %key.id, "Marked read");
        }
        Ok(())
    }

    async fn send_presence(&self, target: &str, presence: Presence) -> BotResult<()> {
        debug!(chat = target, ?presence, "Presence update");
        Ok(())
    }
}
