//! WebSocket push channel: one transport per session, rooms, and local
//! publish/subscribe for server events.

pub mod events;
pub mod mailbox;
pub mod registry;
pub mod subscription;

pub use events::{
    ClientFrame, ConnectionStatusPayload, EventKind, EventStarted, ParticipantEvent,
    PointerChanged, PushEvent, SubmissionEvent,
};
pub use registry::{subscriber, Subscriber, SubscriptionRegistry};
pub use subscription::{ChannelSubscription, Handler, SubscriptionConfig};

use crate::error::SyncError;
use crate::types::ConnectionStatus;
use futures_util::{SinkExt, StreamExt};
use mailbox::Mailboxes;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long `disconnect` waits for the close handshake before dropping the
/// transport.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Identifies who asked to be in a room. The server is asked to leave a room
/// only once its last holder has left.
pub type RoomHolder = u64;

/// Holder used by the plain [`RealtimeChannel::join_room`] and
/// [`RealtimeChannel::leave_room`] calls.
const DIRECT_HOLDER: RoomHolder = 0;

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub url: String,
    /// Reconnect attempts after a drop or a failed connect. Zero disables
    /// automatic reconnection.
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    pub connect_timeout: Duration,
}

impl ChannelConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reconnect_attempts: 5,
            reconnect_delay: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.reconnect_attempts = attempts;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

struct Shared {
    config: ChannelConfig,
    registry: SubscriptionRegistry,
    mailboxes: Mailboxes,
    status: watch::Sender<ConnectionStatus>,
    rooms: Mutex<BTreeMap<String, BTreeSet<RoomHolder>>>,
    next_holder: AtomicU64,
    /// Present only while a transport session is up.
    outbound: Mutex<Option<mpsc::UnboundedSender<ClientFrame>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Session-wide push channel.
///
/// Construct one per session and share it behind an `Arc`; every page-level
/// [`ChannelSubscription`] registers against the same instance.
pub struct RealtimeChannel {
    shared: Arc<Shared>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl RealtimeChannel {
    pub fn new(config: ChannelConfig) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::default());
        Self {
            shared: Arc::new(Shared {
                config,
                registry: SubscriptionRegistry::new(),
                mailboxes: Mailboxes::new(),
                status,
                rooms: Mutex::new(BTreeMap::new()),
                next_holder: AtomicU64::new(DIRECT_HOLDER + 1),
                outbound: Mutex::new(None),
            }),
            driver: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.shared.config
    }

    /// Open the transport. Resolves once the first attempt has settled; the
    /// outcome is visible through [`status`](Self::status). Reconnection then
    /// continues in the background. No-op while a driver is already running.
    pub async fn connect(&self) {
        let ready = {
            let mut driver = lock(&self.driver);
            if driver.as_ref().is_some_and(|h| !h.is_finished()) {
                tracing::debug!("[WS] connect() ignored: already running");
                return;
            }
            let (ready_tx, ready_rx) = oneshot::channel();
            *driver = Some(tokio::spawn(run_driver(
                Arc::clone(&self.shared),
                ready_tx,
            )));
            ready_rx
        };
        let _ = ready.await;
    }

    /// Close the transport and stop reconnecting. Safe to call repeatedly.
    pub async fn disconnect(&self) {
        let handle = lock(&self.driver).take();
        let sender = lock(&self.shared.outbound).take();
        let graceful = sender.is_some();
        drop(sender);

        if let Some(mut handle) = handle {
            if !graceful || tokio::time::timeout(CLOSE_GRACE, &mut handle).await.is_err() {
                handle.abort();
            }
            tracing::info!("[WS] disconnected from {}", self.shared.config.url);
        }

        lock(&self.shared.rooms).clear();
        self.shared.status.send_modify(|s| {
            s.connected = false;
            s.connection_id = None;
        });
    }

    pub fn is_connected(&self) -> bool {
        self.shared.status.borrow().connected
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status.subscribe()
    }

    /// Rooms joined on the current transport session.
    pub fn rooms(&self) -> Vec<String> {
        lock(&self.shared.rooms).keys().cloned().collect()
    }

    /// How many holders currently keep `room_id` joined.
    pub fn room_holders(&self, room_id: &str) -> usize {
        lock(&self.shared.rooms).get(room_id).map_or(0, BTreeSet::len)
    }

    /// A fresh identity for [`join_room_as`](Self::join_room_as).
    pub fn new_room_holder(&self) -> RoomHolder {
        self.shared.next_holder.fetch_add(1, Ordering::Relaxed)
    }

    /// Ask the server to deliver `room_id`'s events. Dropped with a warning
    /// while disconnected; returns whether the room is now held.
    pub fn join_room(&self, room_id: &str) -> bool {
        self.join_room_as(room_id, DIRECT_HOLDER)
    }

    pub fn leave_room(&self, room_id: &str) -> bool {
        self.leave_room_as(room_id, DIRECT_HOLDER)
    }

    /// Join `room_id` on behalf of `holder`. Only the first holder of a room
    /// sends `join-room` over the wire.
    pub fn join_room_as(&self, room_id: &str, holder: RoomHolder) -> bool {
        let outbound = lock(&self.shared.outbound);
        let Some(tx) = outbound.as_ref() else {
            tracing::warn!("[WS] join_room({}) dropped: not connected", room_id);
            return false;
        };

        let mut rooms = lock(&self.shared.rooms);
        let held_by = rooms.get(room_id).map_or(0, BTreeSet::len);
        if held_by == 0 {
            let frame = ClientFrame::JoinRoom {
                room_id: room_id.to_string(),
            };
            if tx.send(frame).is_err() {
                tracing::warn!("[WS] join_room({}) dropped: session closing", room_id);
                return false;
            }
        } else {
            tracing::debug!("[WS] room {} already joined ({} holders)", room_id, held_by);
        }
        rooms.entry(room_id.to_string()).or_default().insert(holder);
        true
    }

    /// Release `holder`'s claim on `room_id`. Returns whether `leave-room`
    /// was sent, which happens only when the last holder leaves.
    pub fn leave_room_as(&self, room_id: &str, holder: RoomHolder) -> bool {
        let outbound = lock(&self.shared.outbound);
        let mut rooms = lock(&self.shared.rooms);
        let Some(holders) = rooms.get_mut(room_id) else {
            tracing::debug!("[WS] leave_room({}) skipped: not joined", room_id);
            return false;
        };
        if !holders.remove(&holder) {
            return false;
        }
        if !holders.is_empty() {
            tracing::debug!("[WS] room {} still held by {}", room_id, holders.len());
            return false;
        }
        rooms.remove(room_id);

        let Some(tx) = outbound.as_ref() else {
            return false;
        };
        tx.send(ClientFrame::LeaveRoom {
            room_id: room_id.to_string(),
        })
        .is_ok()
    }

    /// Register `handler` for `kind`. Registering the same handle twice is a
    /// no-op.
    pub fn on(&self, kind: EventKind, handler: &Subscriber) {
        if !self.shared.registry.on(kind, handler) {
            tracing::debug!("[WS] handler already registered for {}", kind);
        }
    }

    pub fn off(&self, kind: EventKind, handler: &Subscriber) {
        if self.shared.registry.off(kind, handler) && !self.shared.registry.is_registered(handler) {
            self.shared.mailboxes.close(handler);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.registry.total()
    }

    /// Deliver `event` to local subscribers as if the server had pushed it.
    ///
    /// Handlers run on the current Tokio runtime; called outside one, the
    /// event is dropped with a warning.
    pub fn emit_local(&self, event: PushEvent) {
        handle_event(&self.shared, event);
    }
}

impl Drop for RealtimeChannel {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.driver).take() {
            handle.abort();
        }
    }
}

fn handle_event(shared: &Shared, event: PushEvent) {
    if let PushEvent::ConnectionStatus(payload) = &event {
        if let Some(id) = &payload.connection_id {
            shared.status.send_if_modified(|s| {
                if s.connection_id.as_deref() == Some(id.as_str()) {
                    return false;
                }
                s.connection_id = Some(id.clone());
                true
            });
        }
    }
    dispatch(shared, event);
}

/// Queue `event` for every subscriber of its kind, in registration order.
/// Never waits on a handler.
fn dispatch(shared: &Shared, event: PushEvent) {
    let subscribers = shared.registry.subscribers(event.kind());
    shared.mailboxes.post(&subscribers, event);
}

enum SessionEnd {
    ClientClosed,
    Dropped(String),
}

async fn run_driver(shared: Arc<Shared>, ready: oneshot::Sender<()>) {
    let config = &shared.config;
    let mut ready = Some(ready);
    let mut attempts: u32 = 0;

    loop {
        match open_transport(config).await {
            Ok(ws) => {
                attempts = 0;
                let connection_id = uuid::Uuid::new_v4().to_string();
                let (tx, rx) = mpsc::unbounded_channel();
                *lock(&shared.outbound) = Some(tx);
                shared.status.send_replace(ConnectionStatus {
                    connected: true,
                    connection_id: Some(connection_id.clone()),
                    last_error: None,
                    reconnect_exhausted: false,
                });
                tracing::info!("[WS {}] connected to {}", connection_id, config.url);
                if let Some(ready) = ready.take() {
                    let _ = ready.send(());
                }

                let end = run_session(&shared, ws, rx).await;
                *lock(&shared.outbound) = None;
                lock(&shared.rooms).clear();

                match end {
                    SessionEnd::ClientClosed => {
                        shared.status.send_modify(|s| {
                            s.connected = false;
                            s.connection_id = None;
                        });
                        return;
                    }
                    SessionEnd::Dropped(reason) => {
                        tracing::warn!("[WS {}] connection lost: {}", connection_id, reason);
                        shared.status.send_modify(|s| {
                            s.connected = false;
                            s.connection_id = None;
                            s.last_error = Some(reason);
                        });
                    }
                }
            }
            Err(e) => {
                tracing::warn!("[WS] connect to {} failed: {}", config.url, e);
                shared.status.send_modify(|s| {
                    s.connected = false;
                    s.connection_id = None;
                    s.last_error = Some(e.to_string());
                });
                if let Some(ready) = ready.take() {
                    let _ = ready.send(());
                }
            }
        }

        if attempts >= config.reconnect_attempts {
            let err = SyncError::ReconnectExhausted { attempts };
            tracing::error!("[WS] {}; giving up on {}", err, config.url);
            shared.status.send_modify(|s| {
                s.reconnect_exhausted = true;
                s.last_error = Some(err.to_string());
            });
            return;
        }

        attempts += 1;
        tracing::info!(
            "[WS] reconnecting in {:?} (attempt {}/{})",
            config.reconnect_delay,
            attempts,
            config.reconnect_attempts
        );
        tokio::time::sleep(config.reconnect_delay).await;
    }
}

async fn open_transport(config: &ChannelConfig) -> Result<WsStream, SyncError> {
    match tokio::time::timeout(config.connect_timeout, connect_async(config.url.as_str())).await {
        Ok(Ok((ws, _response))) => Ok(ws),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(SyncError::Transport(format!(
            "connect timed out after {:?}",
            config.connect_timeout
        ))),
    }
}

async fn run_session(
    shared: &Shared,
    ws: WsStream,
    mut outbound: mpsc::UnboundedReceiver<ClientFrame>,
) -> SessionEnd {
    let (mut sink, mut stream) = ws.split();

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    let _ = sink.send(Message::Close(None)).await;
                    return SessionEnd::ClientClosed;
                };
                let text = match frame.encode() {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::error!("[WS] failed to encode {:?}: {}", frame, e);
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    return SessionEnd::Dropped(format!("send failed: {}", e));
                }
            }
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => handle_text(shared, text.as_str()),
                Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                    Ok(text) => handle_text(shared, text),
                    Err(_) => tracing::debug!("[WS] ignoring non-UTF-8 binary frame"),
                },
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame
                        .map(|f| format!("closed by server ({}): {}", u16::from(f.code), f.reason.as_str()))
                        .unwrap_or_else(|| "closed by server".to_string());
                    return SessionEnd::Dropped(reason);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return SessionEnd::Dropped(e.to_string()),
                None => return SessionEnd::Dropped("stream ended".to_string()),
            }
        }
    }
}

fn handle_text(shared: &Shared, text: &str) {
    match PushEvent::decode(text) {
        Ok(Some(event)) => {
            tracing::debug!("[WS] received {}", event.kind());
            handle_event(shared, event);
        }
        Ok(None) => tracing::debug!("[WS] ignoring unknown event: {}", text),
        Err(e) => tracing::warn!("[WS] malformed frame: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pointer(room: &str, wine: u32) -> PushEvent {
        PushEvent::PointerChanged(PointerChanged {
            room_id: room.to_string(),
            wine_number: wine,
            timestamp: Some(1_000),
        })
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn test_channel_config_builder() {
        let config = ChannelConfig::new("ws://localhost:3001/ws")
            .with_reconnect_attempts(0)
            .with_reconnect_delay(Duration::from_millis(250))
            .with_connect_timeout(Duration::from_secs(2));

        assert_eq!(config.reconnect_attempts, 0);
        assert_eq!(config.reconnect_delay, Duration::from_millis(250));
        assert_eq!(config.connect_timeout, Duration::from_secs(2));
    }

    #[test]
    fn test_join_while_disconnected_is_dropped() {
        let channel = RealtimeChannel::new(ChannelConfig::new("ws://127.0.0.1:1/ws"));
        assert!(!channel.is_connected());
        assert!(!channel.join_room("event-42"));
        assert!(channel.rooms().is_empty());
        assert!(!channel.leave_room("event-42"));
    }

    #[tokio::test]
    async fn test_duplicate_registration_delivers_once() {
        let channel = RealtimeChannel::new(ChannelConfig::new("ws://127.0.0.1:1/ws"));
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let handler = subscriber(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        channel.on(EventKind::PointerChanged, &handler);
        channel.on(EventKind::PointerChanged, &handler);
        assert_eq!(channel.subscriber_count(), 1);

        channel.emit_local(pointer("e1", 2));
        settle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        channel.off(EventKind::PointerChanged, &handler);
        channel.emit_local(pointer("e1", 3));
        settle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(channel.subscriber_count(), 0);
    }

    #[test]
    fn test_emit_local_outside_runtime_is_dropped() {
        let channel = RealtimeChannel::new(ChannelConfig::new("ws://127.0.0.1:1/ws"));
        let handler = subscriber(|_| panic!("must not run"));
        channel.on(EventKind::PointerChanged, &handler);

        channel.emit_local(pointer("e1", 1));
        assert_eq!(channel.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_panicking_subscriber_does_not_block_others() {
        let channel = RealtimeChannel::new(ChannelConfig::new("ws://127.0.0.1:1/ws"));
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);

        let bad = subscriber(|_| panic!("handler bug"));
        let good = subscriber(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        channel.on(EventKind::PointerChanged, &bad);
        channel.on(EventKind::PointerChanged, &good);

        channel.emit_local(pointer("e1", 1));
        channel.emit_local(pointer("e1", 2));
        settle().await;

        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(channel.shared.mailboxes.len(), 2);

        // leaving closes the mailbox
        channel.off(EventKind::PointerChanged, &bad);
        assert_eq!(channel.shared.mailboxes.len(), 1);
    }

    #[tokio::test]
    async fn test_connection_status_push_updates_id() {
        let channel = RealtimeChannel::new(ChannelConfig::new("ws://127.0.0.1:1/ws"));
        let mut rx = channel.subscribe_status();

        channel.emit_local(PushEvent::ConnectionStatus(ConnectionStatusPayload {
            connection_id: Some("srv-17".to_string()),
            status: Some("connected".to_string()),
            extra: Default::default(),
        }));

        assert!(rx.has_changed().unwrap());
        assert_eq!(
            rx.borrow_and_update().connection_id.as_deref(),
            Some("srv-17")
        );
    }

    #[tokio::test]
    async fn test_connect_refused_exhausts_reconnects() {
        let config = ChannelConfig::new("ws://127.0.0.1:1/ws")
            .with_reconnect_attempts(0)
            .with_connect_timeout(Duration::from_secs(2));
        let channel = RealtimeChannel::new(config);

        channel.connect().await;
        let mut rx = channel.subscribe_status();
        let status = rx
            .wait_for(|s| s.reconnect_exhausted)
            .await
            .unwrap()
            .clone();

        assert!(!status.connected);
        assert!(status.last_error.is_some());
        assert!(!channel.is_connected());

        // redundant disconnects are harmless
        channel.disconnect().await;
        channel.disconnect().await;
    }
}
