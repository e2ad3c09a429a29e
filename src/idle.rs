//! User inactivity detection.
//!
//! Tracks qualifying input events (pointer, key, scroll, touch) and fires an
//! idle callback after a configurable window without activity. Activity
//! cancels and reschedules the pending timeout; the idle→active and
//! active→idle edges each fire their callback exactly once per transition.
//! Disabling the timer cancels the pending timeout; re-enabling restarts
//! from a fresh window.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// Input classes that count as user activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    /// Mouse press, move, or click.
    Pointer,
    /// Key press.
    Key,
    /// Scroll.
    Scroll,
    /// Touch start.
    Touch,
}

type Callback = Arc<dyn Fn() + Send + Sync>;

struct TimerState {
    enabled: bool,
    is_idle: bool,
    last_activity: Instant,
    epoch: u64,
    pending: Option<JoinHandle<()>>,
}

struct Inner {
    timeout: Duration,
    on_idle: Callback,
    on_active: Callback,
    state: Mutex<TimerState>,
}

/// Inactivity timer over user input events.
///
/// Created disabled; call [`set_enabled`](Self::set_enabled) to arm it.
pub struct IdleTimer {
    inner: Arc<Inner>,
}

impl IdleTimer {
    /// Create a timer firing `on_idle` after `timeout` without activity and
    /// `on_active` when activity resumes after an idle period.
    pub fn new(
        timeout: Duration,
        on_idle: impl Fn() + Send + Sync + 'static,
        on_active: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                timeout,
                on_idle: Arc::new(on_idle),
                on_active: Arc::new(on_active),
                state: Mutex::new(TimerState {
                    enabled: false,
                    is_idle: false,
                    last_activity: Instant::now(),
                    epoch: 0,
                    pending: None,
                }),
            }),
        }
    }

    /// `true` once the idle window elapsed with no qualifying event.
    pub fn is_idle(&self) -> bool {
        self.inner.state.lock().is_idle
    }

    /// Time since the last qualifying event.
    pub fn since_last_activity(&self) -> Duration {
        self.inner.state.lock().last_activity.elapsed()
    }

    /// Record a qualifying input event.
    ///
    /// Cancels and reschedules the pending timeout; on an idle→active
    /// transition fires `on_active` exactly once.
    pub fn record_activity(&self, kind: InputKind) {
        let was_idle = {
            let mut state = self.inner.state.lock();
            if !state.enabled {
                return;
            }
            state.last_activity = Instant::now();
            let was_idle = state.is_idle;
            state.is_idle = false;
            Self::reschedule(&self.inner, &mut state);
            was_idle
        };
        if was_idle {
            debug!(?kind, "user became active");
            (self.inner.on_active)();
        }
    }

    /// Arm or disarm the timer.
    ///
    /// Disabling cancels the pending timeout; enabling starts a fresh
    /// window from now.
    pub fn set_enabled(&self, enabled: bool) {
        let mut state = self.inner.state.lock();
        if state.enabled == enabled {
            return;
        }
        state.enabled = enabled;
        if enabled {
            state.is_idle = false;
            state.last_activity = Instant::now();
            Self::reschedule(&self.inner, &mut state);
        } else {
            state.epoch += 1;
            if let Some(pending) = state.pending.take() {
                pending.abort();
            }
        }
    }

    fn reschedule(inner: &Arc<Inner>, state: &mut TimerState) {
        state.epoch += 1;
        if let Some(pending) = state.pending.take() {
            pending.abort();
        }
        let epoch = state.epoch;
        let inner = Arc::clone(inner);
        state.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(inner.timeout).await;
            let fire = {
                let mut state = inner.state.lock();
                // A reset or disable since scheduling voids this timeout.
                if !state.enabled || state.epoch != epoch || state.is_idle {
                    false
                } else {
                    state.is_idle = true;
                    true
                }
            };
            if fire {
                debug!(timeout = ?inner.timeout, "user became idle");
                (inner.on_idle)();
            }
        }));
    }
}

impl Drop for IdleTimer {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        if let Some(pending) = state.pending.take() {
            pending.abort();
        }
    }
}
