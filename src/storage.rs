//! Key-value storage adapters.
//!
//! The host environment provides two string-keyed stores: a *tab-scoped*
//! store private to one tab, and an *origin-scoped* store shared by every
//! tab of the same origin. This module wraps both behind the
//! [`KeyValueStore`] trait and reproduces the origin store's change
//! notification semantics: a write through one tab's handle is observed by
//! listeners registered on *other* tabs, never by the writing tab itself.
//!
//! # Examples
//!
//! ```rust
//! use turma_client::storage::{KeyValueStore, OriginStore};
//!
//! let origin = OriginStore::new();
//! let tab_a = origin.tab();
//! let tab_b = origin.tab();
//!
//! tab_a.set("auth_session", "{}");
//! assert_eq!(tab_b.get("auth_session").as_deref(), Some("{}"));
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

/// String-keyed storage, the shape both host stores expose.
pub trait KeyValueStore: Send + Sync {
    /// Return the value stored under `key`, if any.
    fn get(&self, key: &str) -> Option<String>;

    /// Store `value` under `key`, replacing any previous value.
    fn set(&self, key: &str, value: &str);

    /// Remove the value stored under `key`, if any.
    fn remove(&self, key: &str);
}

/// Tab-scoped store: private to one tab, no change notifications.
#[derive(Debug, Default)]
pub struct TabStore {
    map: RwLock<HashMap<String, String>>,
}

impl TabStore {
    /// Create an empty tab-scoped store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys currently present, in no particular order.
    pub fn keys(&self) -> Vec<String> {
        self.map.read().keys().cloned().collect()
    }
}

impl KeyValueStore for TabStore {
    fn get(&self, key: &str) -> Option<String> {
        self.map.read().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        self.map.write().insert(key.to_string(), value.to_string());
    }

    fn remove(&self, key: &str) {
        self.map.write().remove(key);
    }
}

/// A change observed on the origin-scoped store.
///
/// Mirrors the browser `storage` event payload: the affected key plus the
/// value before and after the write. `new_value` is `None` for removals and
/// `old_value` is `None` when the key was previously absent.
#[derive(Debug, Clone)]
pub struct StorageEvent {
    /// The key that changed.
    pub key: String,
    /// Value before the write.
    pub old_value: Option<String>,
    /// Value after the write.
    pub new_value: Option<String>,
}

type StorageListener = Arc<dyn Fn(&StorageEvent) + Send + Sync>;

struct ListenerEntry {
    id: u64,
    tab_id: u64,
    callback: StorageListener,
}

struct OriginShared {
    map: RwLock<HashMap<String, String>>,
    listeners: RwLock<Vec<ListenerEntry>>,
    next_tab_id: AtomicU64,
    next_listener_id: AtomicU64,
}

/// Origin-scoped store shared by every tab of the same origin.
///
/// Hand out one [`OriginTab`] per simulated tab via [`OriginStore::tab`];
/// all handles read and write the same underlying map.
pub struct OriginStore {
    shared: Arc<OriginShared>,
}

impl Default for OriginStore {
    fn default() -> Self {
        Self::new()
    }
}

impl OriginStore {
    /// Create an empty origin-scoped store.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(OriginShared {
                map: RwLock::new(HashMap::new()),
                listeners: RwLock::new(Vec::new()),
                next_tab_id: AtomicU64::new(0),
                next_listener_id: AtomicU64::new(0),
            }),
        }
    }

    /// Open a new tab-local handle onto this store.
    pub fn tab(&self) -> OriginTab {
        OriginTab {
            shared: Arc::clone(&self.shared),
            tab_id: self.shared.next_tab_id.fetch_add(1, Ordering::Relaxed),
        }
    }
}

/// One tab's handle onto the shared origin-scoped store.
///
/// Writes through this handle notify subscriptions registered on *other*
/// tabs synchronously, in registration order. Same-tab writes never loop
/// back; callers that need same-tab state read it directly.
#[derive(Clone)]
pub struct OriginTab {
    shared: Arc<OriginShared>,
    tab_id: u64,
}

impl OriginTab {
    /// Subscribe to changes made by other tabs.
    ///
    /// The callback runs synchronously at the point of the write. Drop the
    /// returned handle via [`StorageSubscription::unsubscribe`] for
    /// deterministic teardown.
    pub fn subscribe(
        &self,
        callback: impl Fn(&StorageEvent) + Send + Sync + 'static,
    ) -> StorageSubscription {
        let id = self.shared.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.shared.listeners.write().push(ListenerEntry {
            id,
            tab_id: self.tab_id,
            callback: Arc::new(callback),
        });
        StorageSubscription {
            shared: Arc::clone(&self.shared),
            id,
        }
    }

    fn notify_other_tabs(&self, event: &StorageEvent) {
        // Snapshot outside the lock so a callback may re-enter the store.
        let targets: Vec<StorageListener> = self
            .shared
            .listeners
            .read()
            .iter()
            .filter(|entry| entry.tab_id != self.tab_id)
            .map(|entry| Arc::clone(&entry.callback))
            .collect();
        for callback in targets {
            callback(event);
        }
    }
}

impl KeyValueStore for OriginTab {
    fn get(&self, key: &str) -> Option<String> {
        self.shared.map.read().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        let old_value = self
            .shared
            .map
            .write()
            .insert(key.to_string(), value.to_string());
        self.notify_other_tabs(&StorageEvent {
            key: key.to_string(),
            old_value,
            new_value: Some(value.to_string()),
        });
    }

    fn remove(&self, key: &str) {
        let old_value = self.shared.map.write().remove(key);
        if old_value.is_none() {
            // Removing an absent key is not a change; no event is fired.
            return;
        }
        self.notify_other_tabs(&StorageEvent {
            key: key.to_string(),
            old_value,
            new_value: None,
        });
    }
}

/// Handle for a registered storage listener.
pub struct StorageSubscription {
    shared: Arc<OriginShared>,
    id: u64,
}

impl StorageSubscription {
    /// Detach the listener; no further events are delivered to it.
    pub fn unsubscribe(self) {
        self.shared.listeners.write().retain(|entry| entry.id != self.id);
    }
}
