use super::events::{EventKind, EventStarted, ParticipantEvent, PointerChanged, PushEvent, SubmissionEvent};
use super::registry::{subscriber, Subscriber};
use super::{RealtimeChannel, RoomHolder};
use crate::types::ConnectionStatus;
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;

pub type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Which room a page wants and which callbacks it cares about.
#[derive(Clone, Default)]
pub struct SubscriptionConfig {
    pub room_id: String,
    pub on_pointer_changed: Option<Handler<PointerChanged>>,
    pub on_participant_joined: Option<Handler<ParticipantEvent>>,
    pub on_participant_left: Option<Handler<ParticipantEvent>>,
    pub on_participant_ready: Option<Handler<ParticipantEvent>>,
    pub on_score_submitted: Option<Handler<SubmissionEvent>>,
    pub on_guess_submitted: Option<Handler<SubmissionEvent>>,
    pub on_event_started: Option<Handler<EventStarted>>,
    pub on_connection_status_change: Option<Handler<ConnectionStatus>>,
}

impl std::fmt::Debug for SubscriptionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionConfig")
            .field("room_id", &self.room_id)
            .field("on_pointer_changed", &self.on_pointer_changed.is_some())
            .field("on_score_submitted", &self.on_score_submitted.is_some())
            .field("on_guess_submitted", &self.on_guess_submitted.is_some())
            .field(
                "on_connection_status_change",
                &self.on_connection_status_change.is_some(),
            )
            .finish_non_exhaustive()
    }
}

impl SubscriptionConfig {
    pub fn new(room_id: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            ..Self::default()
        }
    }

    pub fn on_pointer_changed(mut self, f: impl Fn(&PointerChanged) + Send + Sync + 'static) -> Self {
        self.on_pointer_changed = Some(Arc::new(f));
        self
    }

    pub fn on_participant_joined(
        mut self,
        f: impl Fn(&ParticipantEvent) + Send + Sync + 'static,
    ) -> Self {
        self.on_participant_joined = Some(Arc::new(f));
        self
    }

    pub fn on_participant_left(
        mut self,
        f: impl Fn(&ParticipantEvent) + Send + Sync + 'static,
    ) -> Self {
        self.on_participant_left = Some(Arc::new(f));
        self
    }

    pub fn on_participant_ready(
        mut self,
        f: impl Fn(&ParticipantEvent) + Send + Sync + 'static,
    ) -> Self {
        self.on_participant_ready = Some(Arc::new(f));
        self
    }

    pub fn on_score_submitted(mut self, f: impl Fn(&SubmissionEvent) + Send + Sync + 'static) -> Self {
        self.on_score_submitted = Some(Arc::new(f));
        self
    }

    pub fn on_guess_submitted(mut self, f: impl Fn(&SubmissionEvent) + Send + Sync + 'static) -> Self {
        self.on_guess_submitted = Some(Arc::new(f));
        self
    }

    pub fn on_event_started(mut self, f: impl Fn(&EventStarted) + Send + Sync + 'static) -> Self {
        self.on_event_started = Some(Arc::new(f));
        self
    }

    pub fn on_connection_status_change(
        mut self,
        f: impl Fn(&ConnectionStatus) + Send + Sync + 'static,
    ) -> Self {
        self.on_connection_status_change = Some(Arc::new(f));
        self
    }
}

fn route<T: 'static>(
    room_id: &str,
    handler: Handler<T>,
    extract: fn(&PushEvent) -> Option<&T>,
) -> Subscriber {
    let room_id = room_id.to_string();
    subscriber(move |event| {
        if !event.is_for_room(&room_id) {
            return;
        }
        if let Some(payload) = extract(event) {
            handler(payload);
        }
    })
}

/// A page's scoped attachment to the shared channel.
///
/// Attaching joins the room (now if connected, otherwise on the next
/// connect) and registers the configured callbacks; detaching (or dropping)
/// leaves the room and removes exactly those callbacks.
pub struct ChannelSubscription {
    channel: Arc<RealtimeChannel>,
    room_id: String,
    holder: RoomHolder,
    registered: Vec<(EventKind, Subscriber)>,
    status_task: Option<JoinHandle<()>>,
}

impl ChannelSubscription {
    /// Must be called inside a Tokio runtime.
    pub fn attach(channel: Arc<RealtimeChannel>, config: SubscriptionConfig) -> Self {
        let room = config.room_id.as_str();
        let mut registered = Vec::new();

        if let Some(h) = config.on_pointer_changed.clone() {
            registered.push((
                EventKind::PointerChanged,
                route(room, h, PushEvent::as_pointer_changed),
            ));
        }
        if let Some(h) = config.on_participant_joined.clone() {
            registered.push((
                EventKind::ParticipantJoined,
                route(room, h, PushEvent::as_participant_joined),
            ));
        }
        if let Some(h) = config.on_participant_left.clone() {
            registered.push((
                EventKind::ParticipantLeft,
                route(room, h, PushEvent::as_participant_left),
            ));
        }
        if let Some(h) = config.on_participant_ready.clone() {
            registered.push((
                EventKind::ParticipantReady,
                route(room, h, PushEvent::as_participant_ready),
            ));
        }
        if let Some(h) = config.on_score_submitted.clone() {
            registered.push((
                EventKind::ScoreSubmitted,
                route(room, h, PushEvent::as_score_submitted),
            ));
        }
        if let Some(h) = config.on_guess_submitted.clone() {
            registered.push((
                EventKind::GuessSubmitted,
                route(room, h, PushEvent::as_guess_submitted),
            ));
        }
        if let Some(h) = config.on_event_started.clone() {
            registered.push((
                EventKind::EventStarted,
                route(room, h, PushEvent::as_event_started),
            ));
        }

        for (kind, handler) in &registered {
            channel.on(*kind, handler);
        }

        let holder = channel.new_room_holder();
        let status_rx = channel.subscribe_status();
        let was_connected = status_rx.borrow().connected;
        if was_connected {
            channel.join_room_as(room, holder);
        }

        let status_task = tokio::spawn(watch_status(
            Arc::downgrade(&channel),
            config.room_id.clone(),
            holder,
            status_rx,
            was_connected,
            config.on_connection_status_change,
        ));

        tracing::debug!(
            "[WS] attached to room {} ({} handlers)",
            config.room_id,
            registered.len()
        );

        Self {
            channel,
            room_id: config.room_id,
            holder,
            registered,
            status_task: Some(status_task),
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn is_attached(&self) -> bool {
        self.status_task.is_some()
    }

    /// Leave the room and unregister this subscription's handlers.
    /// Idempotent.
    pub fn detach(&mut self) {
        let Some(task) = self.status_task.take() else {
            return;
        };
        task.abort();

        for (kind, handler) in self.registered.drain(..) {
            self.channel.off(kind, &handler);
        }
        self.channel.leave_room_as(&self.room_id, self.holder);
        tracing::debug!("[WS] detached from room {}", self.room_id);
    }
}

impl Drop for ChannelSubscription {
    fn drop(&mut self) {
        self.detach();
    }
}

/// Rejoin after every reconnect and forward status changes.
async fn watch_status(
    channel: Weak<RealtimeChannel>,
    room_id: String,
    holder: RoomHolder,
    mut status_rx: tokio::sync::watch::Receiver<ConnectionStatus>,
    mut was_connected: bool,
    on_change: Option<Handler<ConnectionStatus>>,
) {
    while status_rx.changed().await.is_ok() {
        let status = status_rx.borrow_and_update().clone();

        if status.connected && !was_connected {
            let Some(channel) = channel.upgrade() else {
                return;
            };
            tracing::info!("[WS] rejoining room {} after reconnect", room_id);
            channel.join_room_as(&room_id, holder);
        }
        was_connected = status.connected;

        if let Some(cb) = &on_change {
            cb(&status);
        }
    }
}
