//! Connection lifecycle to the chat transport.
//!
//! `Session::run` keeps a connection alive: every close or failed attempt
//! other than an explicit logout leads to a fresh `connect` after the
//! configured delay. Inbound batches are handed to the pipeline over a channel; status
//! broadcasts are handled here first by the [`StatusWatcher`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::BoundedSet;
use crate::context::BotContext;
use crate::errors::{BotError, BotResult};
use crate::platform::{
    DisconnectReason, OutgoingPayload, Presence, RawEvent, RawUpdate, Receipt, TransportEvent,
    STATUS_BROADCAST,
};

const EVENT_CHANNEL_SIZE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Open,
    Closing,
}

/// Signals the session hands to its consumer.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Ready { identity: String },
    Messages(Vec<RawEvent>),
    Updates(Vec<RawUpdate>),
    LoggedOut,
}

/// How a single connection attempt ended.
#[derive(Debug)]
pub enum ConnectOutcome {
    Closed(DisconnectReason),
    Failed(BotError),
    /// Another `connect` call is already driving a connection.
    AlreadyRunning,
}

/// Auto-view and auto-react for status broadcasts.
///
/// Reactions are gated by a bounded set of status keys so a status is
/// reacted to at most once, even when the transport redelivers it after a
/// reconnect or two tasks race on the same event.
pub struct StatusWatcher {
    ctx: Arc<BotContext>,
    reacted: Arc<Mutex<BoundedSet<String>>>,
}

impl StatusWatcher {
    pub fn new(ctx: Arc<BotContext>) -> Self {
        let status = &ctx.config.status;
        let reacted = BoundedSet::new(status.seen_capacity, status.retain_ratio);
        Self {
            ctx,
            reacted: Arc::new(Mutex::new(reacted)),
        }
    }

    /// Identity of one status post: its poster and its id.
    pub fn status_key(event: &RawEvent) -> String {
        let poster = event
            .key
            .participant
            .as_deref()
            .unwrap_or(&event.key.remote_jid);
        json!({ "participant": poster, "id": event.key.id }).to_string()
    }

    /// Handle the status events of one batch.
    ///
    /// Network sends run detached; the handles are returned so callers that
    /// care (tests) can wait for them.
    pub async fn observe(&self, events: &[RawEvent]) -> Vec<JoinHandle<()>> {
        let statuses: Vec<&RawEvent> = events
            .iter()
            .filter(|e| e.is_status_broadcast() && !e.key.from_me)
            .collect();
        if statuses.is_empty() {
            return Vec::new();
        }

        let config = &self.ctx.config.status;
        let mut handles = Vec::new();

        if config.auto_view {
            let keys: Vec<_> = statuses.iter().map(|e| e.key.clone()).collect();
            let transport = self.ctx.transport.clone();
            handles.push(tokio::spawn(async move {
                if let Err(e) = transport.mark_read(&keys).await {
                    warn!("Failed to view {} status update(s): {}", keys.len(), e);
                }
            }));
        }

        if config.auto_react {
            for event in statuses {
                if let Some(handle) = self.react(event).await {
                    handles.push(handle);
                }
            }
        }

        handles
    }

    async fn react(&self, event: &RawEvent) -> Option<JoinHandle<()>> {
        let symbols = self.ctx.config.status.reaction_symbols();
        if symbols.is_empty() {
            debug!("No status reaction symbols configured");
            return None;
        }

        let status_key = Self::status_key(event);
        if !self.reacted.lock().await.insert(status_key.clone()) {
            debug!(status_key = %status_key, "Status already reacted to");
            return None;
        }

        let emoji = symbols[fastrand::usize(..symbols.len())].to_string();
        let payload = OutgoingPayload::Reaction {
            emoji,
            key: event.key.clone(),
        };
        let transport = self.ctx.transport.clone();
        let reacted = self.reacted.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = transport.send(STATUS_BROADCAST, payload).await {
                warn!(status_key = %status_key, "Status reaction failed: {}", e);
                // Allow a retry when the status is delivered again.
                reacted.lock().await.remove(&status_key);
            }
        }))
    }

    pub async fn reacted_len(&self) -> usize {
        self.reacted.lock().await.len()
    }

    pub async fn clear(&self) {
        self.reacted.lock().await.clear();
    }
}

pub struct Session {
    ctx: Arc<BotContext>,
    status: StatusWatcher,
    state: watch::Sender<SessionState>,
    events: mpsc::Sender<SessionEvent>,
    active: AtomicBool,
}

impl Session {
    pub fn new(ctx: Arc<BotContext>) -> (Self, mpsc::Receiver<SessionEvent>) {
        let (events, rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let (state, _) = watch::channel(SessionState::Disconnected);
        let session = Self {
            status: StatusWatcher::new(ctx.clone()),
            ctx,
            state,
            events,
            active: AtomicBool::new(false),
        };
        (session, rx)
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn status_watcher(&self) -> &StatusWatcher {
        &self.status
    }

    /// Keep the session connected until logout. Every other close or failed
    /// connection attempt is retried after the reconnect delay.
    pub async fn run(&self) -> BotResult<()> {
        let delay = Duration::from_millis(self.ctx.config.session.reconnect_delay_ms);
        loop {
            match self.connect().await {
                ConnectOutcome::Closed(reason) if reason.is_terminal() => {
                    warn!("Session logged out; re-authentication required");
                    self.set_state(SessionState::Disconnected);
                    if self.events.send(SessionEvent::LoggedOut).await.is_err() {
                        debug!("Session event consumer already gone");
                    }
                    return Ok(());
                }
                ConnectOutcome::Closed(reason) => {
                    warn!("Connection closed ({}), reconnecting in {:?}", reason, delay);
                }
                ConnectOutcome::Failed(e) => {
                    warn!("Connection failed ({}), retrying in {:?}", e, delay);
                }
                ConnectOutcome::AlreadyRunning => return Ok(()),
            }
            self.set_state(SessionState::Connecting);
            tokio::time::sleep(delay).await;
        }
    }

    /// Drive one connection until it closes.
    ///
    /// Calling this while a connection is already being driven is a no-op.
    pub async fn connect(&self) -> ConnectOutcome {
        if self
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("connect() called while a connection is active");
            return ConnectOutcome::AlreadyRunning;
        }
        let outcome = self.drive().await;
        self.active.store(false, Ordering::SeqCst);
        outcome
    }

    async fn drive(&self) -> ConnectOutcome {
        self.set_state(SessionState::Connecting);
        info!("Connecting to transport...");

        let mut rx = match self.ctx.transport.connect().await {
            Ok(rx) => rx,
            Err(e) => return ConnectOutcome::Failed(e),
        };

        while let Some(event) = rx.recv().await {
            match event {
                TransportEvent::Connecting => self.set_state(SessionState::Connecting),
                TransportEvent::Open { identity } => self.on_open(identity).await,
                TransportEvent::Messages(batch) => {
                    self.on_inbound_batch(batch).await;
                }
                TransportEvent::Updates(updates) => {
                    self.forward(SessionEvent::Updates(updates)).await;
                }
                TransportEvent::Closed(reason) => return ConnectOutcome::Closed(reason),
            }
        }
        ConnectOutcome::Closed(DisconnectReason::ConnectionLost)
    }

    async fn on_open(&self, identity: String) {
        self.ctx.set_identity(&identity);
        self.set_state(SessionState::Open);
        info!("Connected as {}", identity);

        if self.ctx.config.session.always_online {
            if let Err(e) = self.ctx.presence(&identity, Presence::Available).await {
                warn!("Failed to announce presence: {}", e);
            }
        }
        self.forward(SessionEvent::Ready { identity }).await;
    }

    /// Handle one inbound batch: status side channel first, then hand the
    /// batch to the pipeline. Never fails.
    pub async fn on_inbound_batch(&self, batch: Vec<RawEvent>) -> Vec<JoinHandle<()>> {
        if batch.is_empty() {
            return Vec::new();
        }
        let handles = self.status.observe(&batch).await;
        self.forward(SessionEvent::Messages(batch)).await;
        handles
    }

    /// Pass-through to the transport.
    pub async fn send(&self, target: &str, payload: OutgoingPayload) -> BotResult<Receipt> {
        self.ctx.send(target, payload).await
    }

    pub async fn shutdown(&self) {
        self.set_state(SessionState::Closing);
        self.status.clear().await;
        self.set_state(SessionState::Disconnected);
        info!("Session stopped");
    }

    async fn forward(&self, event: SessionEvent) {
        if self.events.send(event).await.is_err() {
            warn!("Dropping session event: consumer closed");
        }
    }

    fn set_state(&self, state: SessionState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            debug!("Session state {:?} -> {:?}", current, state);
            *current = state;
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::platform::testing::{RecordingTransport, Script};
    use crate::store::SqliteStore;
    use crate::testing::{raw_direct, raw_status, OWN_IDENTITY};
    use proptest::prelude::*;

    fn status_config() -> Config {
        let mut config = Config::default();
        config.status.auto_view = true;
        config.status.auto_react = true;
        config
    }

    fn session_with(
        config: Config,
        scripts: Vec<Script>,
    ) -> (Session, mpsc::Receiver<SessionEvent>, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport::with_scripts(scripts));
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let ctx = Arc::new(BotContext::new(config, transport.clone(), store));
        let (session, rx) = Session::new(ctx);
        (session, rx, transport)
    }

    fn drain(rx: &mut mpsc::Receiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    async fn settle(handles: Vec<JoinHandle<()>>) {
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_until_logout() {
        let scripts = vec![
            Script::Events(vec![
                TransportEvent::Connecting,
                TransportEvent::Open {
                    identity: OWN_IDENTITY.into(),
                },
                TransportEvent::Messages(vec![raw_direct("15551234567", "hi")]),
            ]),
            Script::Fail(BotError::transport("stream errored")),
            Script::Events(vec![
                TransportEvent::Open {
                    identity: OWN_IDENTITY.into(),
                },
                TransportEvent::Closed(DisconnectReason::LoggedOut),
            ]),
        ];
        let (session, mut rx, transport) = session_with(Config::default(), scripts);

        session.run().await.unwrap();

        assert_eq!(transport.connect_count(), 3);
        assert_eq!(session.state(), SessionState::Disconnected);
        let events = drain(&mut rx);
        assert!(matches!(events[0], SessionEvent::Ready { .. }));
        assert!(matches!(&events[1], SessionEvent::Messages(batch) if batch.len() == 1));
        assert!(matches!(events[2], SessionEvent::Ready { .. }));
        assert!(matches!(events[3], SessionEvent::LoggedOut));
        assert_eq!(events.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_any_connect_failure_is_retried() {
        let scripts = vec![
            Script::Fail(BotError::Config("handshake rejected".into())),
            Script::Fail(BotError::Store("credentials unreadable".into())),
        ];
        let (session, mut rx, transport) = session_with(Config::default(), scripts);

        session.run().await.unwrap();

        // two failures, then the logout that ends the run
        assert_eq!(transport.connect_count(), 3);
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], SessionEvent::LoggedOut));
    }

    #[tokio::test]
    async fn test_open_sets_identity() {
        let scripts = vec![Script::Events(vec![TransportEvent::Open {
            identity: "15550000000:7@s.whatsapp.net".into(),
        }])];
        let (session, _rx, _) = session_with(Config::default(), scripts);
        let outcome = session.connect().await;
        assert!(matches!(
            outcome,
            ConnectOutcome::Closed(DisconnectReason::ConnectionLost)
        ));
        assert_eq!(
            session.ctx.identity().as_deref(),
            Some("15550000000@s.whatsapp.net")
        );
    }

    #[tokio::test]
    async fn test_status_reacted_once_and_viewed() {
        let (session, mut rx, transport) = session_with(status_config(), Vec::new());
        let status = raw_status("15557654321@s.whatsapp.net", "S1");

        let first = session
            .on_inbound_batch(vec![status.clone(), raw_direct("15551234567", "hi")])
            .await;
        settle(first).await;
        let again = session.on_inbound_batch(vec![status.clone()]).await;
        settle(again).await;

        let reactions = transport.reactions();
        assert_eq!(reactions.len(), 1);
        assert_eq!(reactions[0].0, STATUS_BROADCAST);
        assert!(status_config()
            .status
            .reaction_symbols()
            .contains(&reactions[0].1.as_str()));
        // viewed on every delivery, reacted once
        assert_eq!(transport.reads().len(), 2);
        // the pipeline still receives both batches
        assert_eq!(drain(&mut rx).len(), 2);
    }

    #[tokio::test]
    async fn test_failed_reaction_can_retry() {
        let (session, _rx, transport) = session_with(status_config(), Vec::new());
        let status = raw_status("15557654321@s.whatsapp.net", "S2");

        transport.set_fail_sends(true);
        settle(session.on_inbound_batch(vec![status.clone()]).await).await;
        assert_eq!(session.status_watcher().reacted_len().await, 0);

        transport.set_fail_sends(false);
        settle(session.on_inbound_batch(vec![status]).await).await;
        assert_eq!(transport.reactions().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_deliveries_react_once() {
        let transport = Arc::new(RecordingTransport::new());
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let ctx = Arc::new(BotContext::new(status_config(), transport.clone(), store));
        let watcher = Arc::new(StatusWatcher::new(ctx));
        let status = raw_status("15557654321@s.whatsapp.net", "S3");

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let watcher = watcher.clone();
                let status = status.clone();
                tokio::spawn(async move { watcher.observe(&[status]).await })
            })
            .collect();
        for task in tasks {
            settle(task.await.unwrap()).await;
        }
        assert_eq!(transport.reactions().len(), 1);
    }

    #[tokio::test]
    async fn test_status_side_channel_off_by_default() {
        let (session, _rx, transport) = session_with(Config::default(), Vec::new());
        settle(
            session
                .on_inbound_batch(vec![raw_status("15557654321@s.whatsapp.net", "S4")])
                .await,
        )
        .await;
        assert!(transport.sent().is_empty());
        assert!(transport.reads().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_clears_reacted_set() {
        let (session, _rx, _) = session_with(status_config(), Vec::new());
        settle(
            session
                .on_inbound_batch(vec![raw_status("15557654321@s.whatsapp.net", "S5")])
                .await,
        )
        .await;
        assert_eq!(session.status_watcher().reacted_len().await, 1);
        session.shutdown().await;
        assert_eq!(session.status_watcher().reacted_len().await, 0);
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[test]
    fn test_status_key_prefers_participant() {
        let event = raw_status("15557654321@s.whatsapp.net", "S6");
        let key: serde_json::Value = serde_json::from_str(&StatusWatcher::status_key(&event)).unwrap();
        assert_eq!(key["participant"], "15557654321@s.whatsapp.net");
        assert_eq!(key["id"], "S6");
    }

    proptest! {
        #[test]
        fn prop_status_reacted_at_most_once(ids in proptest::collection::vec((0u8..4, 0u8..6), 1..40)) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            rt.block_on(async {
                let transport = Arc::new(RecordingTransport::new());
                let store = Arc::new(SqliteStore::open_in_memory().unwrap());
                let ctx = Arc::new(BotContext::new(status_config(), transport.clone(), store));
                let watcher = StatusWatcher::new(ctx);

                let mut distinct = std::collections::HashSet::new();
                for (poster, id) in &ids {
                    let event = raw_status(&format!("1555000000{}@s.whatsapp.net", poster), &format!("S{}", id));
                    distinct.insert(StatusWatcher::status_key(&event));
                    settle(watcher.observe(&[event]).await).await;
                }
                assert_eq!(transport.reactions().len(), distinct.len());
            });
        }
    }
}
