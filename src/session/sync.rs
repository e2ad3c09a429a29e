//! Cross-tab session synchronization.
//!
//! Watches the origin-scoped store for changes to the session key made by
//! *other* tabs and classifies each `(old, new)` pair into a transition.
//! Same-tab writes never reach the listener, so a tab only reacts to what
//! its siblings did.

use tracing::debug;

use crate::session::record::SESSION_KEY;
use crate::storage::{OriginTab, StorageEvent, StorageSubscription};

/// What another tab did to the shared session record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionSyncEvent {
    /// The record appeared: another tab logged in.
    CreatedElsewhere,
    /// The record disappeared: another tab logged out.
    RemovedElsewhere,
    /// The record was overwritten: another tab refreshed activity or
    /// re-issued the session.
    RefreshedElsewhere,
}

fn classify(event: &StorageEvent) -> Option<SessionSyncEvent> {
    match (&event.old_value, &event.new_value) {
        (None, Some(_)) => Some(SessionSyncEvent::CreatedElsewhere),
        (Some(_), None) => Some(SessionSyncEvent::RemovedElsewhere),
        (Some(_), Some(_)) => Some(SessionSyncEvent::RefreshedElsewhere),
        (None, None) => None,
    }
}

/// Listens for session-key changes made by sibling tabs.
///
/// Dropping the synchronizer (or calling [`stop`](Self::stop)) detaches the
/// storage listener.
pub struct SessionSynchronizer {
    subscription: Option<StorageSubscription>,
}

impl SessionSynchronizer {
    /// Start watching `tab`'s siblings for session changes.
    ///
    /// `on_event` runs synchronously at the point of the foreign write.
    pub fn start(
        tab: &OriginTab,
        on_event: impl Fn(SessionSyncEvent) + Send + Sync + 'static,
    ) -> Self {
        let subscription = tab.subscribe(move |event| {
            if event.key != SESSION_KEY {
                return;
            }
            if let Some(transition) = classify(event) {
                debug!(?transition, "session changed in another tab");
                on_event(transition);
            }
        });
        Self {
            subscription: Some(subscription),
        }
    }

    /// Detach the storage listener.
    pub fn stop(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
    }
}

impl Drop for SessionSynchronizer {
    fn drop(&mut self) {
        self.stop();
    }
}
