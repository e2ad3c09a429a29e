//! Stale-while-revalidate cache engine.
//!
//! Maps a string key to a cached value, a fetch timestamp, and a TTL. An
//! entry is *fresh* while its age is below the TTL and *stale* afterwards;
//! stale entries are never evicted by age — they stay servable until
//! overwritten or explicitly cleared, trading memory for never flashing an
//! empty screen during revalidation. To bound long-lived sessions the
//! engine carries a `max_entries` limit and drops the oldest entry when a
//! write would exceed it.
//!
//! Writes are atomic whole-entry swaps and notify key subscribers
//! synchronously, in registration order.
//!
//! # Examples
//!
//! ```rust
//! use std::time::Duration;
//! use turma_client::cache::CacheEngine;
//!
//! let cache: CacheEngine<Vec<String>> = CacheEngine::default();
//! cache.set("students:class-1", vec!["ana".to_string()], Duration::from_secs(30));
//! assert!(cache.is_fresh("students:class-1"));
//! assert_eq!(cache.get("students:class-1").unwrap().len(), 1);
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::storage::{KeyValueStore, TabStore};

/// Storage-key prefix used when snapshotting entries to a tab-scoped store.
const SNAPSHOT_PREFIX: &str = "cache_";

/// Configuration for the cache engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// TTL applied by [`CacheEngine::set_with_default_ttl`].
    pub default_ttl: Duration,
    /// Upper bound on resident entries; the oldest entry is evicted when a
    /// write would exceed it.
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(30),
            max_entries: 100,
        }
    }
}

/// Aggregate freshness counts, for diagnostics panels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Total resident entries.
    pub entries: usize,
    /// Entries whose age is below their TTL.
    pub fresh: usize,
    /// Entries past their TTL but still servable.
    pub stale: usize,
}

#[derive(Debug, Clone)]
struct CacheSlot<T> {
    value: T,
    fetched_at: Instant,
    ttl: Duration,
}

impl<T> CacheSlot<T> {
    fn is_fresh(&self) -> bool {
        self.fetched_at.elapsed() < self.ttl
    }
}

struct Subscriber<T> {
    id: u64,
    callback: Arc<dyn Fn(&T) + Send + Sync>,
}

type SubscriberMap<T> = Arc<RwLock<HashMap<String, Vec<Subscriber<T>>>>>;

/// In-memory cache keyed by string, generic over the payload type.
///
/// The engine is shared (behind `Arc`) by every query coordinator in the
/// tab; all methods take `&self`.
pub struct CacheEngine<T> {
    config: CacheConfig,
    entries: RwLock<HashMap<String, CacheSlot<T>>>,
    subscribers: SubscriberMap<T>,
    next_subscriber_id: AtomicU64,
}

impl<T> Default for CacheEngine<T> {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl<T> CacheEngine<T> {
    /// Create an engine with the given configuration.
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: RwLock::new(HashMap::new()),
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            next_subscriber_id: AtomicU64::new(0),
        }
    }

    /// The configured default TTL.
    pub fn default_ttl(&self) -> Duration {
        self.config.default_ttl
    }
}

impl<T: Clone> CacheEngine<T> {
    /// Return the entry's value regardless of freshness, or `None` if absent.
    pub fn get(&self, key: &str) -> Option<T> {
        self.entries.read().get(key).map(|slot| slot.value.clone())
    }

    /// Atomically replace the entry under `key`, stamping `fetched_at = now`.
    ///
    /// Subscribers registered on `key` are notified synchronously, in
    /// registration order. Writes are last-write-wins by call order; no
    /// staleness comparison is performed.
    pub fn set(&self, key: &str, value: T, ttl: Duration) {
        {
            let mut entries = self.entries.write();
            entries.insert(
                key.to_string(),
                CacheSlot {
                    value: value.clone(),
                    fetched_at: Instant::now(),
                    ttl,
                },
            );
            if entries.len() > self.config.max_entries {
                // Evict the entry fetched longest ago, never the new one.
                let oldest = entries
                    .iter()
                    .filter(|(k, _)| k.as_str() != key)
                    .min_by_key(|(_, slot)| slot.fetched_at)
                    .map(|(k, _)| k.clone());
                if let Some(victim) = oldest {
                    debug!(key = %victim, "cache entry evicted by max_entries bound");
                    entries.remove(&victim);
                }
            }
        }
        self.notify(key, &value);
    }

    /// Replace the entry under `key` using the configured default TTL.
    pub fn set_with_default_ttl(&self, key: &str, value: T) {
        self.set(key, value, self.config.default_ttl);
    }

    /// `true` iff an entry exists and its age is below its TTL.
    pub fn is_fresh(&self, key: &str) -> bool {
        self.entries.read().get(key).is_some_and(CacheSlot::is_fresh)
    }

    /// `true` iff an entry exists and is past its TTL.
    ///
    /// Mutually exclusive with [`is_fresh`](Self::is_fresh); both are false
    /// for an absent key.
    pub fn is_stale(&self, key: &str) -> bool {
        self.entries
            .read()
            .get(key)
            .is_some_and(|slot| !slot.is_fresh())
    }

    /// Remove the entry under `key`, if any.
    pub fn remove(&self, key: &str) {
        self.entries.write().remove(key);
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Drop every entry whose key satisfies `predicate`.
    ///
    /// Used for resource-group invalidation, e.g. all `students:` keys
    /// after a student mutation. Returns the number of entries removed.
    pub fn clear_matching(&self, predicate: impl Fn(&str) -> bool) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|key, _| !predicate(key));
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, "cache entries invalidated");
        }
        removed
    }

    /// Register a callback invoked synchronously whenever `key` is `set`.
    pub fn subscribe(
        &self,
        key: &str,
        callback: impl Fn(&T) + Send + Sync + 'static,
    ) -> CacheSubscription<T> {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .write()
            .entry(key.to_string())
            .or_default()
            .push(Subscriber {
                id,
                callback: Arc::new(callback),
            });
        CacheSubscription {
            subscribers: Arc::clone(&self.subscribers),
            key: key.to_string(),
            id,
        }
    }

    /// Freshness counts over the resident entries.
    pub fn stats(&self) -> CacheStats {
        let entries = self.entries.read();
        let fresh = entries.values().filter(|slot| slot.is_fresh()).count();
        CacheStats {
            entries: entries.len(),
            fresh,
            stale: entries.len() - fresh,
        }
    }

    fn notify(&self, key: &str, value: &T) {
        // Snapshot outside the lock so a callback may re-enter the engine.
        let callbacks: Vec<Arc<dyn Fn(&T) + Send + Sync>> = self
            .subscribers
            .read()
            .get(key)
            .map(|subs| subs.iter().map(|s| Arc::clone(&s.callback)).collect())
            .unwrap_or_default();
        for callback in callbacks {
            callback(value);
        }
    }
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct SnapshotEntry<T> {
    value: T,
    stored_at: DateTime<Utc>,
    ttl_ms: u64,
}

impl<T: Clone + Serialize + DeserializeOwned> CacheEngine<T> {
    /// Snapshot resident entries into a tab-scoped store.
    ///
    /// Ages are preserved through a wall-clock timestamp so a restored
    /// entry resumes with the staleness it had when saved.
    pub fn save_to(&self, store: &TabStore) {
        let entries = self.entries.read();
        for (key, slot) in entries.iter() {
            let stored_at = Utc::now()
                - chrono::Duration::from_std(slot.fetched_at.elapsed())
                    .unwrap_or_else(|_| chrono::Duration::zero());
            let snapshot = SnapshotEntry {
                value: slot.value.clone(),
                stored_at,
                ttl_ms: slot.ttl.as_millis() as u64,
            };
            match serde_json::to_string(&snapshot) {
                Ok(json) => store.set(&format!("{SNAPSHOT_PREFIX}{key}"), &json),
                Err(err) => warn!(key = %key, error = %err, "failed to snapshot cache entry"),
            }
        }
    }

    /// Restore entries previously saved with [`save_to`](Self::save_to).
    ///
    /// Entries that fully expired while persisted are skipped. Returns the
    /// number of entries restored.
    pub fn restore_from(&self, store: &TabStore) -> usize {
        let mut restored = 0;
        for store_key in store.keys() {
            let Some(key) = store_key.strip_prefix(SNAPSHOT_PREFIX) else {
                continue;
            };
            let Some(json) = store.get(&store_key) else {
                continue;
            };
            let snapshot: SnapshotEntry<T> = match serde_json::from_str(&json) {
                Ok(snapshot) => snapshot,
                Err(err) => {
                    warn!(key = %key, error = %err, "skipping corrupt cache snapshot");
                    continue;
                }
            };
            let age = (Utc::now() - snapshot.stored_at)
                .to_std()
                .unwrap_or(Duration::ZERO);
            let ttl = Duration::from_millis(snapshot.ttl_ms);
            if age >= ttl {
                continue;
            }
            let fetched_at = Instant::now()
                .checked_sub(age)
                .unwrap_or_else(Instant::now);
            self.entries.write().insert(
                key.to_string(),
                CacheSlot {
                    value: snapshot.value,
                    fetched_at,
                    ttl,
                },
            );
            restored += 1;
        }
        debug!(restored, "cache snapshot restored");
        restored
    }
}

/// Handle for a registered cache subscriber.
pub struct CacheSubscription<T> {
    subscribers: SubscriberMap<T>,
    key: String,
    id: u64,
}

impl<T> CacheSubscription<T> {
    /// Detach the subscriber; no further notifications are delivered.
    pub fn unsubscribe(self) {
        let mut subscribers = self.subscribers.write();
        if let Some(subs) = subscribers.get_mut(&self.key) {
            subs.retain(|s| s.id != self.id);
            if subs.is_empty() {
                subscribers.remove(&self.key);
            }
        }
    }
}
