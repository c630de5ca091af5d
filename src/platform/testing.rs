//! In-memory transport for tests: scripted connections, recorded sends.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{DisconnectReason, MessageKey, OutgoingPayload, Presence, Receipt, Transport, TransportEvent};
use crate::errors::{BotError, BotResult};

/// What the next `connect` call does. Once the scripts run out every
/// connection reports a logout.
pub enum Script {
    Events(Vec<TransportEvent>),
    Fail(BotError),
}

#[derive(Default)]
pub struct RecordingTransport {
    scripts: Mutex<VecDeque<Script>>,
    sent: Mutex<Vec<(String, OutgoingPayload)>>,
    reads: Mutex<Vec<MessageKey>>,
    presences: Mutex<Vec<(String, Presence)>>,
    connects: Mutex<usize>,
    fail_sends: Mutex<bool>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_scripts(scripts: Vec<Script>) -> Self {
        let transport = Self::default();
        *transport.scripts.lock().unwrap() = scripts.into();
        transport
    }

    pub fn set_fail_sends(&self, fail: bool) {
        *self.fail_sends.lock().unwrap() = fail;
    }

    pub fn sent(&self) -> Vec<(String, OutgoingPayload)> {
        self.sent.lock().unwrap().clone()
    }

    /// Texts of all `Text` payloads, in send order.
    pub fn sent_texts(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter_map(|(_, payload)| match payload {
                OutgoingPayload::Text { text, .. } => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn reactions(&self) -> Vec<(String, String)> {
        self.sent()
            .into_iter()
            .filter_map(|(target, payload)| match payload {
                OutgoingPayload::Reaction { emoji, .. } => Some((target, emoji)),
                _ => None,
            })
            .collect()
    }

    pub fn reads(&self) -> Vec<MessageKey> {
        self.reads.lock().unwrap().clone()
    }

    pub fn presences(&self) -> Vec<(String, Presence)> {
        self.presences.lock().unwrap().clone()
    }

    pub fn connect_count(&self) -> usize {
        *self.connects.lock().unwrap()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn connect(&self) -> BotResult<mpsc::Receiver<TransportEvent>> {
        *self.connects.lock().unwrap() += 1;
        let script = self.scripts.lock().unwrap().pop_front();
        match script {
            Some(Script::Events(events)) => {
                let (tx, rx) = mpsc::channel(events.len().max(1));
                for event in events {
                    tx.send(event)
                        .await
                        .map_err(|e| BotError::transport(e.to_string()))?;
                }
                Ok(rx)
            }
            Some(Script::Fail(err)) => Err(err),
            None => {
                let (tx, rx) = mpsc::channel(1);
                tx.send(TransportEvent::Closed(DisconnectReason::LoggedOut))
                    .await
                    .map_err(|e| BotError::transport(e.to_string()))?;
                Ok(rx)
            }
        }
    }

    async fn send(&self, target: &str, payload: OutgoingPayload) -> BotResult<Receipt> {
        if *self.fail_sends.lock().unwrap() {
            return Err(BotError::transport("send failed"));
        }
        let mut sent = self.sent.lock().unwrap();
        sent.push((target.to_string(), payload));
        Ok(Receipt {
            id: format!("sent-{}", sent.len()),
        })
    }

    async fn mark_read(&self, keys: &[MessageKey]) -> BotResult<()> {
        self.reads.lock().unwrap().extend_from_slice(keys);
        Ok(())
    }

    async fn send_presence(&self, target: &str, presence: Presence) -> BotResult<()> {
        self.presences
            .lock()
            .unwrap()
            .push((target.to_string(), presence));
        Ok(())
    }
}
