//! Shared test fixtures.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::config::Config;
use crate::context::BotContext;
use crate::message::{self, Message};
use crate::platform::testing::RecordingTransport;
use crate::platform::RawEvent;
use crate::store::SqliteStore;

pub const OWN_IDENTITY: &str = "15550000000:2@s.whatsapp.net";
pub const GROUP: &str = "120363000000@g.us";

pub fn context_with(config: Config) -> (Arc<BotContext>, Arc<RecordingTransport>) {
    let transport = Arc::new(RecordingTransport::new());
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let ctx = Arc::new(BotContext::new(config, transport.clone(), store));
    ctx.set_identity(OWN_IDENTITY);
    (ctx, transport)
}

fn next_id() -> String {
    use std::sync::atomic::{AtomicUsize, Ordering};
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    format!("MSG{}", COUNTER.fetch_add(1, Ordering::SeqCst))
}

pub fn raw(key: Value, message: Value) -> RawEvent {
    serde_json::from_value(json!({ "key": key, "message": message, "pushName": "Tester" }))
        .unwrap()
}

pub fn raw_direct(number: &str, body: &str) -> RawEvent {
    raw(
        json!({ "remoteJid": format!("{}@s.whatsapp.net", number), "id": next_id() }),
        json!({ "conversation": body }),
    )
}

pub fn raw_group(number: &str, body: &str) -> RawEvent {
    raw(
        json!({
            "remoteJid": GROUP,
            "id": next_id(),
            "participant": format!("{}@s.whatsapp.net", number)
        }),
        json!({ "conversation": body }),
    )
}

pub fn raw_self(chat_number: &str, body: &str) -> RawEvent {
    raw(
        json!({
            "remoteJid": format!("{}@s.whatsapp.net", chat_number),
            "fromMe": true,
            "id": next_id()
        }),
        json!({ "conversation": body }),
    )
}

pub fn raw_status(participant: &str, id: &str) -> RawEvent {
    raw(
        json!({
            "remoteJid": "status@broadcast",
            "id": id,
            "participant": participant
        }),
        json!({ "imageMessage": { "caption": "my day" } }),
    )
}

pub fn direct_text(number: &str, body: &str) -> Message {
    message::normalize(&raw_direct(number, body), Some(OWN_IDENTITY))
}

pub fn group_text(number: &str, body: &str) -> Message {
    message::normalize(&raw_group(number, body), Some(OWN_IDENTITY))
}

pub fn self_text(chat_number: &str, body: &str) -> Message {
    message::normalize(&raw_self(chat_number, body), Some(OWN_IDENTITY))
}
