//! Canonical view over one raw inbound event.
//!
//! Normalization never fails: events without usable content (receipts,
//! reactions, unknown protocol stanzas) become a `Message` with an empty
//! body and no media.

use std::collections::BTreeSet;

use serde_json::Value;

use crate::platform::{self, MessageKey, RawEvent};

/// Wrappers whose inner `message` holds the real content.
const WRAPPERS: &[&str] = &[
    "ephemeralMessage",
    "viewOnceMessage",
    "viewOnceMessageV2",
    "viewOnceMessageV2Extension",
    "documentWithCaptionMessage",
    "editedMessage",
];

/// Content kinds, most specific first.
const CONTENT_KINDS: &[&str] = &[
    "conversation",
    "extendedTextMessage",
    "imageMessage",
    "videoMessage",
    "audioMessage",
    "stickerMessage",
    "documentMessage",
    "buttonsResponseMessage",
    "listResponseMessage",
    "templateButtonReplyMessage",
    "interactiveResponseMessage",
    "reactionMessage",
    "protocolMessage",
];

/// Keys that carry metadata, never content.
const NON_CONTENT_KEYS: &[&str] = &["senderKeyDistributionMessage", "messageContextInfo"];

/// Maximum wrapper nesting unwrapped before giving up.
const MAX_WRAPPER_DEPTH: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentType {
    Text,
    Image,
    Video,
    Audio,
    Sticker,
    Document,
    Other,
}

impl ContentType {
    fn from_kind(kind: &str) -> Self {
        match kind {
            "conversation" | "extendedTextMessage" => ContentType::Text,
            "imageMessage" => ContentType::Image,
            "videoMessage" => ContentType::Video,
            "audioMessage" => ContentType::Audio,
            "stickerMessage" => ContentType::Sticker,
            "documentMessage" => ContentType::Document,
            _ => ContentType::Other,
        }
    }

    pub fn is_media(self) -> bool {
        matches!(
            self,
            ContentType::Image
                | ContentType::Video
                | ContentType::Audio
                | ContentType::Sticker
                | ContentType::Document
        )
    }
}

/// The message a reply quotes.
#[derive(Debug, Clone, PartialEq)]
pub struct QuotedRef {
    pub id: Option<String>,
    pub sender: Option<String>,
    pub payload: Value,
}

#[derive(Debug, Clone)]
pub struct Message {
    pub key: MessageKey,
    pub id: String,
    pub chat_id: String,
    pub sender_id: String,
    pub from_self: bool,
    pub is_group: bool,
    pub content_type: ContentType,
    /// Raw content kind, e.g. `"imageMessage"`; `None` for content-less events
    pub kind: Option<String>,
    pub body: String,
    pub quoted: Option<QuotedRef>,
    pub mentioned_ids: BTreeSet<String>,
    pub view_once: bool,
    /// Hex digest identifying a sticker image
    pub sticker_hash: Option<String>,
    /// Key of the message this event revokes, if it is a revoke notice
    pub revokes: Option<MessageKey>,
    pub push_name: Option<String>,
    pub timestamp: Option<i64>,
    /// Unwrapped content object (`{ "<kind>": payload }`), `Null` when absent
    pub content: Value,
}

impl Message {
    pub fn has_media(&self) -> bool {
        self.content_type.is_media()
    }

    /// Bare number of the sender.
    pub fn sender_number(&self) -> &str {
        platform::address_number(&self.sender_id)
    }

    /// Caption or text attached to the content payload.
    pub fn payload_caption(&self) -> Option<&str> {
        self.payload()
            .and_then(|p| p.get("caption"))
            .and_then(Value::as_str)
            .filter(|c| !c.is_empty())
    }

    fn payload(&self) -> Option<&Value> {
        self.kind.as_deref().and_then(|k| self.content.get(k))
    }

    /// Copy of this message with a different body, used for command rewrites.
    pub fn with_body(&self, body: impl Into<String>) -> Message {
        Message {
            body: body.into(),
            ..self.clone()
        }
    }
}

/// Build the canonical `Message` for one raw event.
///
/// `own_identity` is the session's own address; it becomes the sender of
/// self-sent direct messages.
pub fn normalize(event: &RawEvent, own_identity: Option<&str>) -> Message {
    let key = event.key.clone();
    let chat_id = key.remote_jid.clone();
    let is_group = platform::is_group_address(&chat_id);
    let sender_id = resolve_sender(&key, own_identity);

    let (content, view_once_wrapper) = match event.message.as_ref() {
        Some(message) => unwrap_content(message),
        None => (Value::Null, false),
    };

    let mut message = Message {
        key: key.clone(),
        id: key.id.clone(),
        chat_id,
        sender_id,
        from_self: key.from_me,
        is_group,
        content_type: ContentType::Other,
        kind: None,
        body: String::new(),
        quoted: None,
        mentioned_ids: BTreeSet::new(),
        view_once: false,
        sticker_hash: None,
        revokes: None,
        push_name: event.push_name.clone(),
        timestamp: event.message_timestamp,
        content: Value::Null,
    };

    let Some(kind) = content_kind(&content) else {
        return message;
    };
    let payload = &content[kind.as_str()];

    message.content_type = ContentType::from_kind(&kind);
    message.body = extract_text(payload);
    message.view_once = view_once_wrapper
        || payload.get("viewOnce").and_then(Value::as_bool) == Some(true);

    if let Some(context) = payload.get("contextInfo").filter(|c| c.is_object()) {
        message.quoted = extract_quoted(context);
        message.mentioned_ids = context
            .get("mentionedJid")
            .and_then(Value::as_array)
            .map(|ids| {
                ids.iter()
                    .filter_map(Value::as_str)
                    .filter(|id| !id.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
    }

    if message.content_type == ContentType::Sticker {
        message.sticker_hash = payload.get("fileSha256").and_then(digest_hex);
    }
    if kind == "protocolMessage" {
        message.revokes = extract_revoke(payload);
    }

    message.kind = Some(kind);
    message.content = content;
    message
}

fn resolve_sender(key: &MessageKey, own_identity: Option<&str>) -> String {
    if let Some(participant) = key.participant.as_deref().filter(|p| !p.trim().is_empty()) {
        return platform::normalize_address(participant);
    }
    if key.from_me {
        if let Some(own) = own_identity.filter(|o| !o.is_empty()) {
            return platform::normalize_address(own);
        }
    }
    platform::normalize_address(&key.remote_jid)
}

/// Peel wrapper layers; the flag reports whether a view-once wrapper was seen.
fn unwrap_content(message: &Value) -> (Value, bool) {
    let mut current = message;
    let mut view_once = false;
    for _ in 0..MAX_WRAPPER_DEPTH {
        let inner = WRAPPERS.iter().find_map(|wrapper| {
            current
                .get(*wrapper)
                .and_then(|w| w.get("message"))
                .filter(|m| m.is_object())
                .map(|m| (*wrapper, m))
        });
        match inner {
            Some((wrapper, inner)) => {
                view_once |= wrapper.starts_with("viewOnce");
                current = inner;
            }
            None => break,
        }
    }
    if current.is_object() {
        (current.clone(), view_once)
    } else {
        (Value::Null, view_once)
    }
}

fn content_kind(content: &Value) -> Option<String> {
    let object = content.as_object()?;
    if let Some(kind) = CONTENT_KINDS
        .iter()
        .find(|k| object.get(**k).is_some_and(|v| !v.is_null()))
    {
        return Some(kind.to_string());
    }
    object
        .iter()
        .find(|(k, v)| !NON_CONTENT_KEYS.contains(&k.as_str()) && !v.is_null())
        .map(|(k, _)| k.clone())
}

/// Text field precedence: text, caption, conversation, then interactive selection ids.
fn extract_text(payload: &Value) -> String {
    if let Some(text) = payload.as_str() {
        return text.to_string();
    }
    let candidates = [
        payload.get("text"),
        payload.get("caption"),
        payload.get("conversation"),
        payload.get("selectedButtonId"),
        payload
            .get("singleSelectReply")
            .and_then(|r| r.get("selectedRowId")),
        payload.get("selectedId"),
    ];
    candidates
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
        .find(|s| !s.is_empty())
        .unwrap_or_default()
        .to_string()
}

fn extract_quoted(context: &Value) -> Option<QuotedRef> {
    let payload = context.get("quotedMessage").filter(|q| q.is_object())?;
    Some(QuotedRef {
        id: context
            .get("stanzaId")
            .and_then(Value::as_str)
            .map(str::to_string),
        sender: context
            .get("participant")
            .and_then(Value::as_str)
            .filter(|p| !p.is_empty())
            .map(platform::normalize_address),
        payload: payload.clone(),
    })
}

fn extract_revoke(payload: &Value) -> Option<MessageKey> {
    let kind = payload.get("type");
    let is_revoke = kind.and_then(Value::as_u64) == Some(0)
        || kind.and_then(Value::as_str) == Some("REVOKE");
    if !is_revoke {
        return None;
    }
    payload
        .get("key")
        .and_then(|k| serde_json::from_value::<MessageKey>(k.clone()).ok())
        .filter(|k| !k.id.is_empty())
}

/// Digests arrive either as hex/base64 strings or as raw byte arrays.
fn digest_hex(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.to_lowercase()),
        Value::Array(bytes) => {
            let bytes: Option<Vec<u8>> = bytes
                .iter()
                .map(|b| b.as_u64().and_then(|b| u8::try_from(b).ok()))
                .collect();
            let bytes = bytes.filter(|b| !b.is_empty())?;
            Some(bytes.iter().map(|b| format!("{:02x}", b)).collect())
        }
        _ => None,
    }
}
