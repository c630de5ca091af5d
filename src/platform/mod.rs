pub mod console;
#[cfg(test)]
pub mod testing;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::errors::BotResult;

/// Chat id used by the transport for status broadcasts.
pub const STATUS_BROADCAST: &str = "status@broadcast";

const USER_SERVER: &str = "s.whatsapp.net";
const GROUP_SERVER: &str = "g.us";

/// Addressing key of one protocol message
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageKey {
    pub remote_jid: String,
    #[serde(default)]
    pub from_me: bool,
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant: Option<String>,
}

/// One raw inbound event as delivered by the transport.
///
/// `message` is kept as opaque JSON; the normalizer decides what it means.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEvent {
    pub key: MessageKey,
    #[serde(default)]
    pub message: Option<Value>,
    #[serde(default)]
    pub push_name: Option<String>,
    #[serde(default)]
    pub message_timestamp: Option<i64>,
}

impl RawEvent {
    pub fn is_status_broadcast(&self) -> bool {
        self.key.remote_jid == STATUS_BROADCAST
    }
}

/// An in-place update to a previously delivered message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawUpdate {
    pub key: MessageKey,
    #[serde(default)]
    pub update: Value,
}

impl RawUpdate {
    /// Stub type the protocol uses for "message revoked".
    const REVOKE_STUB: u64 = 1;

    pub fn is_revoke(&self) -> bool {
        let stub = self.update.get("messageStubType");
        let stub_is_revoke = stub.and_then(Value::as_u64) == Some(Self::REVOKE_STUB)
            || stub.and_then(Value::as_str) == Some("REVOKE");
        let message_cleared = self
            .update
            .as_object()
            .is_some_and(|o| o.contains_key("message") && o["message"].is_null());
        stub_is_revoke || message_cleared
    }
}

/// Why a connection closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    LoggedOut,
    ConnectionLost,
    ConnectionClosed,
    ConnectionReplaced,
    TimedOut,
    RestartRequired,
    Other(String),
}

impl DisconnectReason {
    /// Only an explicit logout ends the session; everything else reconnects.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DisconnectReason::LoggedOut)
    }
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisconnectReason::LoggedOut => write!(f, "logged out"),
            DisconnectReason::ConnectionLost => write!(f, "connection lost"),
            DisconnectReason::ConnectionClosed => write!(f, "connection closed"),
            DisconnectReason::ConnectionReplaced => write!(f, "connection replaced"),
            DisconnectReason::TimedOut => write!(f, "timed out"),
            DisconnectReason::RestartRequired => write!(f, "restart required"),
            DisconnectReason::Other(reason) => write!(f, "{}", reason),
        }
    }
}

/// Signals a live connection emits, in delivery order.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connecting,
    Open { identity: String },
    Closed(DisconnectReason),
    Messages(Vec<RawEvent>),
    Updates(Vec<RawUpdate>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutgoingPayload {
    Text {
        text: String,
        mentions: Vec<String>,
        quoted: Option<MessageKey>,
    },
    Reaction {
        emoji: String,
        key: MessageKey,
    },
    /// Re-send previously received content (media or otherwise) with a caption.
    Forward {
        content: Value,
        caption: Option<String>,
        mentions: Vec<String>,
    },
}

impl OutgoingPayload {
    #[cfg(test)]
    pub fn text(text: impl Into<String>) -> Self {
        OutgoingPayload::Text {
            text: text.into(),
            mentions: Vec::new(),
            quoted: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Available,
    Composing,
    Paused,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub id: String,
}

/// The chat-protocol client the session drives.
///
/// Every `connect` builds a fresh connection; its events arrive on the
/// returned channel until the connection closes.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self) -> BotResult<mpsc::Receiver<TransportEvent>>;

    async fn send(&self, target: &str, payload: OutgoingPayload) -> BotResult<Receipt>;

    async fn mark_read(&self, keys: &[MessageKey]) -> BotResult<()>;

    async fn send_presence(&self, target: &str, presence: Presence) -> BotResult<()>;
}

/// Strip the device suffix from an address and canonicalize the user server.
///
/// `"123:4@s.whatsapp.net"` and `"123@c.us"` both become `"123@s.whatsapp.net"`.
/// Inputs without a server part are returned trimmed and unchanged.
pub fn normalize_address(address: &str) -> String {
    let address = address.trim();
    let Some((user, server)) = address.split_once('@') else {
        return address.to_string();
    };
    let user = user.split(':').next().unwrap_or(user);
    let server = if server == "c.us" { USER_SERVER } else { server };
    format!("{}@{}", user, server)
}

/// Bare numeric identifier of an address (`"123@s.whatsapp.net"` → `"123"`).
pub fn address_number(address: &str) -> &str {
    let user = address.split('@').next().unwrap_or(address);
    user.split(':').next().unwrap_or(user)
}

/// Address for a bare number, or the input itself when it already has a server.
pub fn user_address(number_or_address: &str) -> String {
    if number_or_address.contains('@') {
        normalize_address(number_or_address)
    } else {
        let digits: String = number_or_address
            .chars()
            .filter(|c| c.is_ascii_digit())
            .collect();
        format!("{}@{}", digits, USER_SERVER)
    }
}

pub fn is_group_address(address: &str) -> bool {
    address.ends_with(&format!("@{}", GROUP_SERVER))
}

/// Whether `address` is a user or group address this bot can send to.
pub fn is_valid_address(address: &str) -> bool {
    match address.split_once('@') {
        Some((user, server)) => {
            !user.is_empty() && (server == USER_SERVER || server == GROUP_SERVER)
        }
        None => false,
    }
}
