//! Adaptive polling with exponential backoff and page-visibility pause.
//!
//! A [`PollingScheduler`] owns one background driver task. The driver runs
//! the unit of work, waits `current_interval` after it settles, and repeats.
//! Failures stretch the interval (clamped to `max_interval`); any success
//! snaps it back to `base_interval`. While the page is hidden the driver
//! parks without a timer and fires once, immediately, when it becomes
//! visible again.

use crate::error::{Result, SyncError};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub type ErrorCallback = Arc<dyn Fn(&SyncError) + Send + Sync>;
pub type SuccessCallback = Arc<dyn Fn() + Send + Sync>;
pub type VisibilityCallback = Arc<dyn Fn(bool) + Send + Sync>;

/// Scheduler configuration. Callbacks run on the driver task.
#[derive(Clone)]
pub struct PollingConfig {
    pub enabled: bool,
    pub interval: Duration,
    pub max_interval: Duration,
    pub backoff_multiplier: f64,
    pub on_error: Option<ErrorCallback>,
    pub on_success: Option<SuccessCallback>,
    pub on_visibility_change: Option<VisibilityCallback>,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_millis(3_000),
            max_interval: Duration::from_millis(30_000),
            backoff_multiplier: 1.5,
            on_error: None,
            on_success: None,
            on_visibility_change: None,
        }
    }
}

impl fmt::Debug for PollingConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollingConfig")
            .field("enabled", &self.enabled)
            .field("interval", &self.interval)
            .field("max_interval", &self.max_interval)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .field("on_error", &self.on_error.is_some())
            .field("on_success", &self.on_success.is_some())
            .field("on_visibility_change", &self.on_visibility_change.is_some())
            .finish()
    }
}

impl PollingConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_max_interval(mut self, max_interval: Duration) -> Self {
        self.max_interval = max_interval;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn on_error(mut self, callback: impl Fn(&SyncError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(callback));
        self
    }

    pub fn on_success(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_success = Some(Arc::new(callback));
        self
    }

    pub fn on_visibility_change(mut self, callback: impl Fn(bool) + Send + Sync + 'static) -> Self {
        self.on_visibility_change = Some(Arc::new(callback));
        self
    }
}

/// Host page-visibility primitive.
///
/// Cloning shares the same underlying signal; the host calls
/// [`set_visible`](Self::set_visible) from its visibility listener.
#[derive(Clone)]
pub struct PageVisibility {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for PageVisibility {
    fn default() -> Self {
        Self::new(true)
    }
}

impl PageVisibility {
    pub fn new(visible: bool) -> Self {
        let (tx, _rx) = watch::channel(visible);
        Self { tx: Arc::new(tx) }
    }

    pub fn set_visible(&self, visible: bool) {
        self.tx.send_if_modified(|current| {
            if *current == visible {
                false
            } else {
                *current = visible;
                true
            }
        });
    }

    pub fn is_visible(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerPhase {
    Idle,
    Running,
    Paused,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PollingState {
    pub base_interval: Duration,
    pub current_interval: Duration,
    pub max_interval: Duration,
    pub backoff_multiplier: f64,
    pub consecutive_error_count: u32,
    pub is_running: bool,
    pub is_page_visible: bool,
    pub phase: SchedulerPhase,
}

impl PollingState {
    /// Build the initial state. A `max_interval` below the base is raised to
    /// the base and a multiplier below 1.0 is treated as 1.0.
    pub fn new(config: &PollingConfig, is_page_visible: bool) -> Self {
        let base = config.interval;
        let multiplier = if config.backoff_multiplier.is_finite() && config.backoff_multiplier >= 1.0
        {
            config.backoff_multiplier
        } else {
            1.0
        };

        Self {
            base_interval: base,
            current_interval: base,
            max_interval: config.max_interval.max(base),
            backoff_multiplier: multiplier,
            consecutive_error_count: 0,
            is_running: false,
            is_page_visible,
            phase: SchedulerPhase::Idle,
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive_error_count = 0;
        self.current_interval = self.base_interval;
    }

    pub fn record_failure(&mut self) {
        self.consecutive_error_count = self.consecutive_error_count.saturating_add(1);
        let scaled = self.current_interval.as_secs_f64() * self.backoff_multiplier;
        let next = Duration::try_from_secs_f64(scaled).unwrap_or(self.max_interval);
        self.current_interval = next.clamp(self.base_interval, self.max_interval);
    }

    pub fn reset_interval(&mut self) {
        self.current_interval = self.base_interval;
    }
}

fn lock(state: &Mutex<PollingState>) -> MutexGuard<'_, PollingState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Re-invokes an async unit of work on an adaptive interval.
pub struct PollingScheduler {
    config: PollingConfig,
    visibility: PageVisibility,
    state: Arc<Mutex<PollingState>>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl PollingScheduler {
    pub fn new(config: PollingConfig, visibility: PageVisibility) -> Self {
        let state = PollingState::new(&config, visibility.is_visible());
        Self {
            config,
            visibility,
            state: Arc::new(Mutex::new(state)),
            driver: Mutex::new(None),
        }
    }

    /// Start polling. The first invocation happens immediately.
    ///
    /// No-op when already active, when disabled, or while the page is hidden.
    /// Must be called from within a tokio runtime.
    pub fn start<F, Fut>(&self, work: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let mut driver = self.driver.lock().unwrap_or_else(PoisonError::into_inner);

        if !self.config.enabled {
            tracing::debug!("[POLL] start ignored: scheduler disabled");
            return;
        }
        if driver.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        if !self.visibility.is_visible() {
            tracing::debug!("[POLL] start ignored: page hidden");
            return;
        }

        {
            let mut state = lock(&self.state);
            state.record_success();
            state.phase = SchedulerPhase::Running;
            state.is_running = true;
            state.is_page_visible = true;
        }

        let rx = self.visibility.subscribe();
        *driver = Some(tokio::spawn(run_loop(
            work,
            self.config.clone(),
            Arc::clone(&self.state),
            rx,
        )));
    }

    /// Cancel the pending timer (and any in-flight tick) and go idle.
    /// Safe to call at any time, including repeatedly.
    pub fn stop(&self) {
        let handle = self
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }

        let mut state = lock(&self.state);
        state.phase = SchedulerPhase::Idle;
        state.is_running = false;
    }

    /// True while Running or Paused.
    pub fn is_active(&self) -> bool {
        lock(&self.state).phase != SchedulerPhase::Idle
    }

    pub fn phase(&self) -> SchedulerPhase {
        lock(&self.state).phase
    }

    pub fn state(&self) -> PollingState {
        lock(&self.state).clone()
    }

    pub fn visibility(&self) -> &PageVisibility {
        &self.visibility
    }
}

impl Drop for PollingScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_loop<F, Fut>(
    work: F,
    config: PollingConfig,
    state: Arc<Mutex<PollingState>>,
    mut visibility: watch::Receiver<bool>,
) where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    loop {
        let result = work().await;

        let delay = {
            let mut s = lock(&state);
            match &result {
                Ok(()) => s.record_success(),
                Err(_) => s.record_failure(),
            }
            s.current_interval
        };

        match result {
            Ok(()) => {
                if let Some(cb) = &config.on_success {
                    cb();
                }
            }
            Err(e) => {
                let errors = lock(&state).consecutive_error_count;
                tracing::warn!(
                    consecutive_errors = errors,
                    next_in_ms = delay.as_millis() as u64,
                    "[POLL] tick failed: {}",
                    e
                );
                if let Some(cb) = &config.on_error {
                    cb(&e);
                }
            }
        }

        if !sleep_while_visible(delay, &mut visibility).await
            && !wait_until_visible(&config, &state, &mut visibility).await
        {
            return;
        }
    }
}

/// Sleep for `delay` unless the page is hidden first. Returns false as soon
/// as the page is hidden; the timer is gone by the time this returns.
async fn sleep_while_visible(delay: Duration, visibility: &mut watch::Receiver<bool>) -> bool {
    if !*visibility.borrow_and_update() {
        return false;
    }

    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            changed = visibility.changed() => {
                if changed.is_err() {
                    // visibility source is gone; keep polling on the timer
                    (&mut sleep).await;
                    return true;
                }
                if !*visibility.borrow_and_update() {
                    return false;
                }
            }
        }
    }
}

/// Park until the page is visible again, then reset the interval so the
/// caller fires immediately. Returns false if the visibility source is gone.
async fn wait_until_visible(
    config: &PollingConfig,
    state: &Mutex<PollingState>,
    visibility: &mut watch::Receiver<bool>,
) -> bool {
    {
        let mut s = lock(state);
        s.phase = SchedulerPhase::Paused;
        s.is_running = false;
        s.is_page_visible = false;
    }
    tracing::debug!("[POLL] page hidden, pausing");
    if let Some(cb) = &config.on_visibility_change {
        cb(false);
    }

    loop {
        if visibility.changed().await.is_err() {
            return false;
        }
        if *visibility.borrow_and_update() {
            break;
        }
    }

    {
        let mut s = lock(state);
        s.reset_interval();
        s.phase = SchedulerPhase::Running;
        s.is_running = true;
        s.is_page_visible = true;
    }
    tracing::debug!("[POLL] page visible, resuming");
    if let Some(cb) = &config.on_visibility_change {
        cb(true);
    }
    true
}
