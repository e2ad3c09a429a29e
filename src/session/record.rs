//! Persisted session record and its storage wrapper.
//!
//! The session is one flat JSON record under the fixed key
//! [`SESSION_KEY`] in origin-scoped storage, so every tab of the origin
//! observes the same value. Two clocks bound its life: `now - issued_at`
//! against the absolute TTL, and `now - last_activity_at` against the idle
//! timeout. Exceeding either invalidates the session.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{SessionError, StorageError};
use crate::storage::KeyValueStore;

/// Fixed origin-scoped storage key holding the session record.
pub const SESSION_KEY: &str = "auth_session";

/// Who the signed-in user is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// A teacher account.
    #[serde(rename = "professor")]
    Teacher,
    /// A student account.
    #[serde(rename = "aluno")]
    Student,
}

/// The persisted session state shared by all tabs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Opaque auth token issued at login.
    pub token: String,
    /// Account role.
    pub role: Role,
    /// When the session was issued.
    pub issued_at: DateTime<Utc>,
    /// Last qualifying user activity or explicit activity ping.
    pub last_activity_at: DateTime<Utc>,
}

impl SessionRecord {
    /// Create a record for a session issued now.
    pub fn new(token: impl Into<String>, role: Role) -> Self {
        let now = Utc::now();
        Self {
            token: token.into(),
            role,
            issued_at: now,
            last_activity_at: now,
        }
    }

    /// Time since the session was issued.
    pub fn age(&self) -> Duration {
        (Utc::now() - self.issued_at).to_std().unwrap_or(Duration::ZERO)
    }

    /// Time since the last recorded activity.
    pub fn idle_for(&self) -> Duration {
        (Utc::now() - self.last_activity_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

/// Lifetime bounds applied to the session record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionPolicy {
    /// Absolute session lifetime measured from `issued_at`.
    pub max_ttl: Duration,
    /// Idle lifetime measured from `last_activity_at`.
    pub idle_timeout: Duration,
    /// How often the controller re-validates the record locally.
    pub validation_interval: Duration,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            max_ttl: Duration::from_secs(8 * 60 * 60),
            idle_timeout: Duration::from_secs(30 * 60),
            validation_interval: Duration::from_secs(30),
        }
    }
}

/// Diagnostic view of the current session, for debug panels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// A record exists in storage.
    pub has_session: bool,
    /// The record passes TTL and idle validation.
    pub is_valid: bool,
    /// Role from the record, when present.
    pub role: Option<Role>,
    /// Issue timestamp, when present.
    pub issued_at: Option<DateTime<Utc>>,
    /// Last-activity timestamp, when present.
    pub last_activity_at: Option<DateTime<Utc>>,
    /// Time left before the absolute TTL expires the session.
    pub time_until_expiry: Option<Duration>,
    /// Time left before inactivity expires the session.
    pub time_until_idle: Option<Duration>,
}

/// Reads and writes the session record through an origin-scoped store.
///
/// Only the session controller deletes records; every other component
/// treats the store as read-mostly.
pub struct SessionStore {
    store: Arc<dyn KeyValueStore>,
    policy: SessionPolicy,
}

impl SessionStore {
    /// Wrap an origin-scoped store handle.
    pub fn new(store: Arc<dyn KeyValueStore>, policy: SessionPolicy) -> Self {
        Self { store, policy }
    }

    /// The configured lifetime bounds.
    pub fn policy(&self) -> SessionPolicy {
        self.policy
    }

    /// Load the persisted record.
    ///
    /// Structurally invalid payloads (unparseable JSON, empty token) are
    /// reported as [`StorageError::Corrupt`] rather than served.
    pub fn load(&self) -> Result<Option<SessionRecord>, StorageError> {
        let Some(raw) = self.store.get(SESSION_KEY) else {
            return Ok(None);
        };
        let record: SessionRecord =
            serde_json::from_str(&raw).map_err(|err| StorageError::Corrupt {
                key: SESSION_KEY.to_string(),
                reason: err.to_string(),
            })?;
        if record.token.is_empty() {
            return Err(StorageError::Corrupt {
                key: SESSION_KEY.to_string(),
                reason: "empty token".to_string(),
            });
        }
        Ok(Some(record))
    }

    /// Persist `record` under the session key.
    pub fn save(&self, record: &SessionRecord) {
        match serde_json::to_string(record) {
            Ok(json) => {
                self.store.set(SESSION_KEY, &json);
                debug!(role = ?record.role, "session record saved");
            }
            Err(err) => warn!(error = %err, "failed to serialize session record"),
        }
    }

    /// Delete the persisted record. Idempotent.
    pub fn clear(&self) {
        self.store.remove(SESSION_KEY);
    }

    /// Stamp `last_activity_at = now` on the persisted record, if any.
    pub fn touch(&self) {
        if let Ok(Some(mut record)) = self.load() {
            record.last_activity_at = Utc::now();
            self.save(&record);
        }
    }

    /// Validate the persisted record against the policy.
    ///
    /// Distinguishes absence, absolute expiry, and idle expiry; corrupt
    /// records count as absent.
    pub fn validate(&self) -> Result<SessionRecord, SessionError> {
        let record = match self.load() {
            Ok(Some(record)) => record,
            Ok(None) => return Err(SessionError::Missing),
            Err(err) => {
                warn!(error = %err, "discarding unreadable session record");
                return Err(SessionError::Missing);
            }
        };
        if record.age() >= self.policy.max_ttl {
            return Err(SessionError::Expired);
        }
        if record.idle_for() >= self.policy.idle_timeout {
            return Err(SessionError::IdleTimeout);
        }
        Ok(record)
    }

    /// Diagnostic snapshot of the current session.
    pub fn info(&self) -> SessionInfo {
        let record = match self.load() {
            Ok(Some(record)) => record,
            _ => {
                return SessionInfo {
                    has_session: false,
                    is_valid: false,
                    role: None,
                    issued_at: None,
                    last_activity_at: None,
                    time_until_expiry: None,
                    time_until_idle: None,
                };
            }
        };
        SessionInfo {
            has_session: true,
            is_valid: self.validate().is_ok(),
            role: Some(record.role),
            issued_at: Some(record.issued_at),
            last_activity_at: Some(record.last_activity_at),
            time_until_expiry: Some(self.policy.max_ttl.saturating_sub(record.age())),
            time_until_idle: Some(self.policy.idle_timeout.saturating_sub(record.idle_for())),
        }
    }
}
