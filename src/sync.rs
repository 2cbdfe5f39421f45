//! Facade that keeps one event's view in step with the server.
//!
//! Three inputs feed the view: a cache-aware read at mount, periodic polling,
//! and push events from the shared [`RealtimeChannel`]. The pointer is
//! reconciled by version so a late poll can never undo a newer push.

use crate::api::FetchMode;
use crate::error::Result;
use crate::polling::{PageVisibility, PollingConfig, PollingScheduler};
use crate::realtime::{ChannelSubscription, RealtimeChannel, SubscriptionConfig};
use crate::types::{
    now_ms, ConnectionStatus, EventId, EventSnapshot, PointerSource, PointerState,
    PointerUpdate,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Read side of the tasting API, as the facade needs it.
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn fetch_event(&self, event_id: &str, mode: FetchMode) -> Result<EventSnapshot>;

    /// Results for one wine of the flight.
    async fn fetch_round(
        &self,
        event_id: &str,
        wine_number: u32,
        mode: FetchMode,
    ) -> Result<serde_json::Value>;
}

/// What a page renders.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncView {
    pub event: Option<EventSnapshot>,
    pub pointer: Option<PointerState>,
    /// Results for the wine `pointer` names.
    pub round: Option<serde_json::Value>,
    pub connection: ConnectionStatus,
    pub last_error: Option<String>,
}

impl SyncView {
    pub fn current_wine(&self) -> Option<u32> {
        self.pointer.map(|p| p.value)
    }
}

pub type UpdateCallback = Arc<dyn Fn(&SyncView) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Refresh {
    Event,
    Round,
}

struct SyncContext {
    event_id: EventId,
    source: Arc<dyn EventSource>,
    view: Mutex<SyncView>,
    on_update: Mutex<Option<UpdateCallback>>,
    active: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl SyncContext {
    fn view(&self) -> MutexGuard<'_, SyncView> {
        lock(&self.view)
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Hand the current view to the page. Silent once stopped.
    fn publish(&self) {
        if !self.is_active() {
            return;
        }
        let Some(callback) = lock(&self.on_update).clone() else {
            return;
        };
        let view = self.view().clone();
        callback(&view);
    }

    fn record_error(&self, message: String) {
        self.view().last_error = Some(message);
        self.publish();
    }

    fn apply_pointer(&self, incoming: PointerState) -> PointerUpdate {
        let mut view = self.view();
        let (kept, update) = PointerState::reconcile(view.pointer, incoming);
        view.pointer = Some(kept);
        update
    }
}

/// Read the event, reconcile its pointer, and re-fetch the round when the
/// pointer moved.
async fn sync_event(ctx: &SyncContext, mode: FetchMode) -> Result<()> {
    let issued_at = now_ms();
    let snapshot = ctx.source.fetch_event(&ctx.event_id, mode).await?;
    let incoming = PointerState::new(
        snapshot.current_wine,
        snapshot.observed_at_ms.unwrap_or(issued_at),
        PointerSource::Poll,
    )
    .with_version(snapshot.pointer_updated_at);

    let (update, needs_round) = {
        let mut view = ctx.view();
        let (kept, update) = PointerState::reconcile(view.pointer, incoming);
        view.pointer = Some(kept);
        if update != PointerUpdate::Stale {
            view.event = Some(snapshot);
        }
        view.last_error = None;
        (update, update == PointerUpdate::Changed || view.round.is_none())
    };

    match update {
        PointerUpdate::Changed => tracing::debug!(
            "[SYNC {}] poll moved pointer to {}",
            ctx.event_id,
            incoming.value
        ),
        PointerUpdate::Stale => tracing::debug!(
            "[SYNC {}] poll pointer {} is older than applied state, ignored",
            ctx.event_id,
            incoming.value
        ),
        PointerUpdate::Confirmed => {}
    }

    if needs_round {
        refresh_round(ctx, mode).await
    } else {
        ctx.publish();
        Ok(())
    }
}

async fn refresh_round(ctx: &SyncContext, mode: FetchMode) -> Result<()> {
    let Some(wine) = ctx.view().pointer.map(|p| p.value) else {
        return Ok(());
    };
    let round = ctx.source.fetch_round(&ctx.event_id, wine, mode).await?;

    {
        let mut view = ctx.view();
        // the pointer may have moved while the request was in flight
        if view.pointer.map(|p| p.value) != Some(wine) {
            tracing::debug!("[SYNC {}] dropping results for wine {}", ctx.event_id, wine);
            return Ok(());
        }
        view.round = Some(round);
    }
    ctx.publish();
    Ok(())
}

/// Serializes push-triggered re-fetches. Requests that pile up while one is
/// in flight collapse into a single fetch.
async fn run_refresh_worker(ctx: Arc<SyncContext>, mut rx: mpsc::UnboundedReceiver<Refresh>) {
    while let Some(first) = rx.recv().await {
        let mut want_event = first == Refresh::Event;
        while let Ok(next) = rx.try_recv() {
            want_event |= next == Refresh::Event;
        }

        let result = if want_event {
            sync_event(&ctx, FetchMode::Revalidate).await
        } else {
            refresh_round(&ctx, FetchMode::Revalidate).await
        };
        if let Err(e) = result {
            tracing::warn!("[SYNC {}] push-triggered refresh failed: {}", ctx.event_id, e);
            ctx.record_error(e.to_string());
        }
    }
}

/// Per-page orchestration of cache, polling, and push for one event.
pub struct SyncFacade {
    ctx: Arc<SyncContext>,
    channel: Arc<RealtimeChannel>,
    scheduler: PollingScheduler,
    subscription: Mutex<Option<ChannelSubscription>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SyncFacade {
    pub fn new(
        event_id: impl Into<EventId>,
        source: Arc<dyn EventSource>,
        channel: Arc<RealtimeChannel>,
        polling: PollingConfig,
        visibility: PageVisibility,
    ) -> Self {
        let ctx = Arc::new(SyncContext {
            event_id: event_id.into(),
            source,
            view: Mutex::new(SyncView::default()),
            on_update: Mutex::new(None),
            active: AtomicBool::new(false),
        });

        let user_on_error = polling.on_error.clone();
        let error_ctx = Arc::downgrade(&ctx);
        let polling = polling.on_error(move |e| {
            if let Some(ctx) = error_ctx.upgrade() {
                ctx.record_error(e.to_string());
            }
            if let Some(cb) = &user_on_error {
                cb(e);
            }
        });

        Self {
            ctx,
            channel,
            scheduler: PollingScheduler::new(polling, visibility),
            subscription: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    pub fn event_id(&self) -> &str {
        &self.ctx.event_id
    }

    pub fn is_active(&self) -> bool {
        self.ctx.is_active()
    }

    pub fn view(&self) -> SyncView {
        self.ctx.view().clone()
    }

    pub fn scheduler(&self) -> &PollingScheduler {
        &self.scheduler
    }

    /// Mount: read once through the cache, attach to the event's room, and
    /// start polling. `on_update` receives every new view until
    /// [`stop_sync`](Self::stop_sync). A second call while running is a no-op.
    pub async fn start_sync<F>(&self, on_update: F)
    where
        F: Fn(&SyncView) + Send + Sync + 'static,
    {
        if self.ctx.active.swap(true, Ordering::SeqCst) {
            tracing::debug!("[SYNC {}] start_sync ignored: already running", self.ctx.event_id);
            return;
        }
        *lock(&self.ctx.on_update) = Some(Arc::new(on_update));
        self.ctx.view().connection = self.channel.status();
        tracing::info!("[SYNC {}] starting", self.ctx.event_id);

        let (refresh_tx, refresh_rx) = mpsc::unbounded_channel();
        *lock(&self.worker) = Some(tokio::spawn(run_refresh_worker(
            Arc::clone(&self.ctx),
            refresh_rx,
        )));

        if let Err(e) = sync_event(&self.ctx, FetchMode::Cached).await {
            tracing::warn!("[SYNC {}] initial read failed: {}", self.ctx.event_id, e);
            self.ctx.record_error(e.to_string());
        }

        // stop_sync may have run while the initial read was in flight
        if !self.ctx.is_active() {
            return;
        }

        let subscription = ChannelSubscription::attach(
            Arc::clone(&self.channel),
            self.subscription_config(refresh_tx),
        );
        *lock(&self.subscription) = Some(subscription);

        let ctx = Arc::clone(&self.ctx);
        self.scheduler.start(move || {
            let ctx = Arc::clone(&ctx);
            async move { sync_event(&ctx, FetchMode::Cached).await }
        });
    }

    fn subscription_config(&self, refresh: mpsc::UnboundedSender<Refresh>) -> SubscriptionConfig {
        let ctx = Arc::downgrade(&self.ctx);
        let pointer_ctx = ctx.clone();
        let pointer_refresh = refresh.clone();
        let round_refresh = refresh.clone();
        let guess_refresh = refresh.clone();
        let ready_refresh = refresh.clone();
        let joined_refresh = refresh.clone();
        let left_refresh = refresh.clone();
        let started_refresh = refresh;

        SubscriptionConfig::new(self.ctx.event_id.clone())
            .on_pointer_changed(move |p| {
                let Some(ctx) = pointer_ctx.upgrade().filter(|ctx| ctx.is_active()) else {
                    return;
                };
                let incoming = PointerState::new(p.wine_number, now_ms(), PointerSource::Push)
                    .with_version(p.timestamp);
                match ctx.apply_pointer(incoming) {
                    PointerUpdate::Changed => {
                        tracing::info!("[SYNC {}] pushed pointer {}", ctx.event_id, p.wine_number);
                        {
                            let mut view = ctx.view();
                            view.round = None;
                        }
                        ctx.publish();
                        let _ = pointer_refresh.send(Refresh::Round);
                    }
                    PointerUpdate::Confirmed => {}
                    PointerUpdate::Stale => tracing::debug!(
                        "[SYNC {}] pushed pointer {} is stale, ignored",
                        ctx.event_id,
                        p.wine_number
                    ),
                }
            })
            .on_score_submitted(move |_| {
                let _ = round_refresh.send(Refresh::Round);
            })
            .on_guess_submitted(move |_| {
                let _ = guess_refresh.send(Refresh::Round);
            })
            .on_participant_ready(move |_| {
                let _ = ready_refresh.send(Refresh::Round);
            })
            .on_participant_joined(move |_| {
                let _ = joined_refresh.send(Refresh::Event);
            })
            .on_participant_left(move |_| {
                let _ = left_refresh.send(Refresh::Event);
            })
            .on_event_started(move |_| {
                let _ = started_refresh.send(Refresh::Event);
            })
            .on_connection_status_change(move |status| {
                let Some(ctx) = ctx.upgrade() else {
                    return;
                };
                ctx.view().connection = status.clone();
                ctx.publish();
            })
    }

    /// Unmount: stop polling, detach from the room, and silence `on_update`.
    /// Nothing fires after this returns. Idempotent.
    pub fn stop_sync(&self) {
        let was_active = self.ctx.active.swap(false, Ordering::SeqCst);

        self.scheduler.stop();
        if let Some(mut subscription) = lock(&self.subscription).take() {
            subscription.detach();
        }
        if let Some(worker) = lock(&self.worker).take() {
            worker.abort();
        }
        *lock(&self.ctx.on_update) = None;

        if was_active {
            tracing::info!("[SYNC {}] stopped", self.ctx.event_id);
        }
    }
}

impl Drop for SyncFacade {
    fn drop(&mut self) {
        self.stop_sync();
    }
}
