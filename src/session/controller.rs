//! Session lifecycle state machine.
//!
//! Composes the session store, the idle timer, the cross-tab synchronizer,
//! and a periodic validation task into one controller per tab. The session
//! moves through four states:
//!
//! ```text
//! NoSession --login--> Active --idle timeout--> IdleLocked
//!                        |  \--TTL expiry-----> Expired
//!                        \---manual logout----> NoSession
//! ```
//!
//! `IdleLocked` and `Expired` are terminal until the next login. Every
//! terminal transition deletes the persisted record (idempotently) and emits
//! exactly one logout notification carrying the reason.

use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::SessionError;
use crate::idle::{IdleTimer, InputKind};
use crate::session::record::{Role, SessionInfo, SessionPolicy, SessionRecord, SessionStore};
use crate::session::sync::{SessionSyncEvent, SessionSynchronizer};
use crate::storage::OriginTab;

/// Where the session currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No session exists.
    NoSession,
    /// A valid session is in place.
    Active,
    /// The session ended because the user went idle.
    IdleLocked,
    /// The session ended because its absolute TTL ran out.
    Expired,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogoutReason {
    /// The user logged out, here or in another tab.
    Manual,
    /// The idle timeout elapsed without activity.
    Idle,
    /// The absolute session TTL ran out.
    Expired,
}

impl LogoutReason {
    /// User-facing notice shown when a session ends for this reason.
    pub fn message(&self) -> &'static str {
        match self {
            Self::Manual => "Você saiu da sua conta.",
            Self::Idle => "Sessão encerrada por inatividade. Faça login novamente.",
            Self::Expired => "Sessão expirada. Faça login novamente.",
        }
    }

    fn terminal_state(&self) -> SessionState {
        match self {
            Self::Manual => SessionState::NoSession,
            Self::Idle => SessionState::IdleLocked,
            Self::Expired => SessionState::Expired,
        }
    }
}

type LogoutCallback = Arc<dyn Fn(LogoutReason) + Send + Sync>;
type SessionChangeCallback = Arc<dyn Fn(bool) + Send + Sync>;

struct ControllerInner {
    store: SessionStore,
    state: Mutex<SessionState>,
    idle: OnceLock<IdleTimer>,
    on_logout: LogoutCallback,
    on_session_change: SessionChangeCallback,
}

impl ControllerInner {
    /// Apply a terminal transition: delete the record and notify once.
    ///
    /// Safe to call from any state and from concurrent paths (idle task,
    /// validation task, storage listener); only the first caller that finds
    /// a session to end performs the transition and emits callbacks.
    fn terminal(&self, reason: LogoutReason) {
        let transitioned = {
            let mut state = self.state.lock();
            match *state {
                SessionState::Active => {
                    *state = reason.terminal_state();
                    true
                }
                // Startup can find a stale record before any login.
                SessionState::NoSession if matches!(self.store.load(), Ok(Some(_))) => {
                    *state = reason.terminal_state();
                    true
                }
                _ => false,
            }
        };
        if !transitioned {
            return;
        }
        self.store.clear();
        if let Some(timer) = self.idle.get() {
            timer.set_enabled(false);
        }
        info!(?reason, "session ended");
        (self.on_logout)(reason);
        (self.on_session_change)(false);
    }

    fn touch_if_active(&self) {
        if *self.state.lock() == SessionState::Active {
            self.store.touch();
        }
    }

    fn handle_sync_event(&self, event: SessionSyncEvent) {
        match event {
            SessionSyncEvent::RemovedElsewhere => {
                info!("session removed in another tab, logging out");
                self.terminal(LogoutReason::Manual);
            }
            SessionSyncEvent::CreatedElsewhere | SessionSyncEvent::RefreshedElsewhere => {
                if self.store.validate().is_err() {
                    return;
                }
                let became_active = {
                    let mut state = self.state.lock();
                    let was_active = *state == SessionState::Active;
                    *state = SessionState::Active;
                    !was_active
                };
                if became_active {
                    info!("session adopted from another tab");
                    if let Some(timer) = self.idle.get() {
                        timer.set_enabled(true);
                    }
                    (self.on_session_change)(true);
                }
            }
        }
    }

    fn periodic_validate(&self) {
        if *self.state.lock() != SessionState::Active {
            return;
        }
        match self.store.validate() {
            Ok(_) => {}
            Err(SessionError::IdleTimeout) => self.terminal(LogoutReason::Idle),
            Err(err) => {
                warn!(error = %err, "periodic session validation failed");
                self.terminal(LogoutReason::Expired);
            }
        }
    }
}

/// One tab's session controller.
///
/// Construct with [`SessionController::new`], then call
/// [`start`](Self::start) inside a tokio runtime to attach the cross-tab
/// listener and the periodic validation task. Dropping the controller (or
/// calling [`shutdown`](Self::shutdown)) detaches both.
pub struct SessionController {
    inner: Arc<ControllerInner>,
    tab: OriginTab,
    synchronizer: Mutex<Option<SessionSynchronizer>>,
    validation: Mutex<Option<JoinHandle<()>>>,
}

impl SessionController {
    /// Create a controller over `tab`'s view of the shared session.
    ///
    /// `on_logout` fires exactly once per session end with the reason;
    /// `on_session_change` reports `true` on login or adoption and `false`
    /// on logout.
    pub fn new(
        tab: OriginTab,
        policy: SessionPolicy,
        on_logout: impl Fn(LogoutReason) + Send + Sync + 'static,
        on_session_change: impl Fn(bool) + Send + Sync + 'static,
    ) -> Self {
        let inner = Arc::new(ControllerInner {
            store: SessionStore::new(Arc::new(tab.clone()), policy),
            state: Mutex::new(SessionState::NoSession),
            idle: OnceLock::new(),
            on_logout: Arc::new(on_logout),
            on_session_change: Arc::new(on_session_change),
        });

        // The timer's callbacks point back at the controller; weak references
        // keep the two from owning each other.
        let on_idle: Weak<ControllerInner> = Arc::downgrade(&inner);
        let on_active: Weak<ControllerInner> = Arc::downgrade(&inner);
        let timer = IdleTimer::new(
            policy.idle_timeout,
            move || {
                if let Some(inner) = on_idle.upgrade() {
                    inner.terminal(LogoutReason::Idle);
                }
            },
            move || {
                if let Some(inner) = on_active.upgrade() {
                    inner.touch_if_active();
                }
            },
        );
        let _ = inner.idle.set(timer);

        Self {
            inner,
            tab,
            synchronizer: Mutex::new(None),
            validation: Mutex::new(None),
        }
    }

    /// Adopt any persisted session and attach the background machinery.
    ///
    /// A structurally valid, unexpired record becomes the active session
    /// with its activity refreshed; an invalid one is logged out with
    /// reason [`LogoutReason::Expired`].
    pub fn start(&self) {
        match self.inner.store.validate() {
            Ok(record) => {
                *self.inner.state.lock() = SessionState::Active;
                self.inner.store.touch();
                if let Some(timer) = self.inner.idle.get() {
                    timer.set_enabled(true);
                }
                info!(role = ?record.role, "existing session adopted on startup");
            }
            Err(SessionError::Missing) => {}
            Err(err) => {
                warn!(error = %err, "invalid session on startup");
                self.inner.terminal(LogoutReason::Expired);
            }
        }

        let weak = Arc::downgrade(&self.inner);
        *self.synchronizer.lock() = Some(SessionSynchronizer::start(&self.tab, move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_sync_event(event);
            }
        }));

        let weak = Arc::downgrade(&self.inner);
        let interval = self.inner.store.policy().validation_interval;
        *self.validation.lock() = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately; skip it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                inner.periodic_validate();
            }
        }));
    }

    /// Detach the cross-tab listener and stop the validation task.
    pub fn shutdown(&self) {
        if let Some(mut synchronizer) = self.synchronizer.lock().take() {
            synchronizer.stop();
        }
        if let Some(task) = self.validation.lock().take() {
            task.abort();
        }
        if let Some(timer) = self.inner.idle.get() {
            timer.set_enabled(false);
        }
    }

    /// Issue a new session for `role` and make it active.
    pub fn login(&self, token: impl Into<String>, role: Role) {
        let record = SessionRecord::new(token, role);
        self.inner.store.save(&record);
        *self.inner.state.lock() = SessionState::Active;
        if let Some(timer) = self.inner.idle.get() {
            // Force a fresh idle window even if the timer was already armed.
            timer.set_enabled(false);
            timer.set_enabled(true);
        }
        info!(?role, "session created");
        (self.inner.on_session_change)(true);
    }

    /// End the session at the user's request.
    pub fn logout(&self) {
        self.inner.terminal(LogoutReason::Manual);
    }

    /// Record a qualifying user input event.
    ///
    /// Refreshes the persisted activity timestamp and resets the idle
    /// window. Ignored outside the `Active` state.
    pub fn record_input(&self, kind: InputKind) {
        if *self.inner.state.lock() != SessionState::Active {
            return;
        }
        self.inner.store.touch();
        if let Some(timer) = self.inner.idle.get() {
            timer.record_activity(kind);
        }
    }

    /// Explicit activity ping, equivalent to a pointer event.
    pub fn update_activity(&self) {
        self.record_input(InputKind::Pointer);
    }

    /// Re-derive the session-change signal from what is persisted now.
    pub fn force_sync(&self) {
        let has_session = matches!(self.inner.store.load(), Ok(Some(_)));
        (self.inner.on_session_change)(has_session);
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.inner.state.lock()
    }

    /// `true` while a session is active.
    pub fn has_session(&self) -> bool {
        self.state() == SessionState::Active
    }

    /// Role of the persisted session, if any.
    pub fn role(&self) -> Option<Role> {
        self.inner.store.load().ok().flatten().map(|record| record.role)
    }

    /// Token of the persisted session, if any.
    pub fn token(&self) -> Option<String> {
        self.inner.store.load().ok().flatten().map(|record| record.token)
    }

    /// Diagnostic snapshot for debug panels.
    pub fn session_info(&self) -> SessionInfo {
        self.inner.store.info()
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use chrono::Utc;

    use crate::storage::{KeyValueStore, OriginStore};

    struct Harness {
        controller: SessionController,
        logouts: Arc<Mutex<Vec<LogoutReason>>>,
        changes: Arc<AtomicUsize>,
    }

    fn harness(tab: OriginTab, policy: SessionPolicy) -> Harness {
        let logouts = Arc::new(Mutex::new(Vec::new()));
        let changes = Arc::new(AtomicUsize::new(0));
        let logout_sink = Arc::clone(&logouts);
        let change_sink = Arc::clone(&changes);
        let controller = SessionController::new(
            tab,
            policy,
            move |reason| logout_sink.lock().push(reason),
            move |_| {
                change_sink.fetch_add(1, Ordering::SeqCst);
            },
        );
        Harness {
            controller,
            logouts,
            changes,
        }
    }

    fn idle_policy(idle_ms: u64) -> SessionPolicy {
        SessionPolicy {
            max_ttl: Duration::from_secs(3600),
            idle_timeout: Duration::from_millis(idle_ms),
            validation_interval: Duration::from_secs(3600),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn manual_logout_clears_record_and_notifies_once() {
        let origin = OriginStore::new();
        let tab = origin.tab();
        let h = harness(tab.clone(), SessionPolicy::default());
        h.controller.start();

        h.controller.login("tok", Role::Teacher);
        assert_eq!(h.controller.state(), SessionState::Active);
        assert!(tab.get("auth_session").is_some());

        h.controller.logout();
        h.controller.logout();

        assert_eq!(h.controller.state(), SessionState::NoSession);
        assert!(tab.get("auth_session").is_none());
        assert_eq!(*h.logouts.lock(), vec![LogoutReason::Manual]);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timeout_locks_the_session() {
        let origin = OriginStore::new();
        let h = harness(origin.tab(), idle_policy(100));
        h.controller.start();
        h.controller.login("tok", Role::Student);

        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(h.controller.state(), SessionState::IdleLocked);
        assert_eq!(*h.logouts.lock(), vec![LogoutReason::Idle]);
        assert!(!h.controller.has_session());
    }

    #[tokio::test(start_paused = true)]
    async fn activity_defers_the_idle_logout() {
        let origin = OriginStore::new();
        let h = harness(origin.tab(), idle_policy(100));
        h.controller.start();
        h.controller.login("tok", Role::Teacher);

        tokio::time::sleep(Duration::from_millis(50)).await;
        h.controller.update_activity();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(h.controller.state(), SessionState::Active);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(h.controller.state(), SessionState::IdleLocked);
        assert_eq!(*h.logouts.lock(), vec![LogoutReason::Idle]);
    }

    #[tokio::test(start_paused = true)]
    async fn startup_with_expired_record_logs_out() {
        let origin = OriginStore::new();
        let tab = origin.tab();
        let mut record = SessionRecord::new("tok", Role::Teacher);
        record.issued_at = Utc::now() - chrono::Duration::hours(9);
        tab.set("auth_session", &serde_json::to_string(&record).unwrap());

        let h = harness(tab.clone(), SessionPolicy::default());
        h.controller.start();

        assert_eq!(h.controller.state(), SessionState::Expired);
        assert!(tab.get("auth_session").is_none());
        assert_eq!(*h.logouts.lock(), vec![LogoutReason::Expired]);
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_validation_catches_ttl_expiry() {
        let origin = OriginStore::new();
        let tab = origin.tab();
        let policy = SessionPolicy {
            max_ttl: Duration::from_secs(3600),
            idle_timeout: Duration::from_secs(3600),
            validation_interval: Duration::from_secs(30),
        };
        let h = harness(tab.clone(), policy);
        h.controller.start();
        h.controller.login("tok", Role::Teacher);

        // Backdate the record past the TTL, then let a validation tick run.
        let mut record = SessionRecord::new("tok", Role::Teacher);
        record.issued_at = Utc::now() - chrono::Duration::hours(2);
        tab.set("auth_session", &serde_json::to_string(&record).unwrap());
        tokio::time::sleep(Duration::from_secs(31)).await;

        assert_eq!(h.controller.state(), SessionState::Expired);
        assert_eq!(*h.logouts.lock(), vec![LogoutReason::Expired]);
    }

    #[tokio::test(start_paused = true)]
    async fn login_after_idle_lock_starts_a_fresh_session() {
        let origin = OriginStore::new();
        let h = harness(origin.tab(), idle_policy(100));
        h.controller.start();
        h.controller.login("tok-1", Role::Teacher);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(h.controller.state(), SessionState::IdleLocked);

        h.controller.login("tok-2", Role::Teacher);
        assert_eq!(h.controller.state(), SessionState::Active);
        assert_eq!(h.controller.token().as_deref(), Some("tok-2"));

        // The new session gets its own full idle window.
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(h.controller.state(), SessionState::Active);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(h.controller.state(), SessionState::IdleLocked);
        assert_eq!(
            *h.logouts.lock(),
            vec![LogoutReason::Idle, LogoutReason::Idle]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn logout_messages_name_the_reason() {
        assert!(LogoutReason::Idle.message().contains("inatividade"));
        assert!(LogoutReason::Expired.message().contains("expirada"));
    }
}
