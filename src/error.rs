//! Error types for the Turma client data layer.
//!
//! The hierarchy mirrors the layers of the crate:
//!
//! ```text
//! Error (top-level)
//! ├── Validation(ValidationError)
//! ├── Fetch(FetchError)
//! ├── Mutation(MutationError)
//! ├── Session(SessionError)
//! └── Storage(StorageError)
//! ```
//!
//! Validation errors never reach the network; fetch errors leave previously
//! cached data servable; mutation errors trigger an optimistic rollback;
//! session errors force the session state machine into a terminal state.

use std::collections::BTreeMap;
use thiserror::Error;

/// Top-level error type for the Turma client data layer.
///
/// All sub-error types convert into `Error` via `From`, so fallible
/// operations across the crate can share one `Result` alias.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Local input validation failure; no network call was made.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Remote read failure surfaced per query.
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    /// Remote mutation failure; the optimistic change was rolled back.
    #[error("Mutation error: {0}")]
    Mutation(#[from] MutationError),

    /// Session lifecycle failure; requires re-authentication.
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Storage adapter failure (corrupt or unreadable persisted state).
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Local, pre-mutation validation failure.
///
/// Carries field-level messages so the caller can surface them next to the
/// offending inputs. A validation error is always raised before any network
/// call and before any optimistic state change.
#[derive(Debug, Clone, Error)]
#[error("invalid {subject}: {}", summary(.fields))]
pub struct ValidationError {
    /// What was being validated, e.g. `"student"` or `"invite"`.
    pub subject: String,
    /// Field name to human-readable message.
    pub fields: BTreeMap<String, String>,
}

impl ValidationError {
    /// Create a validation error for `subject` with one offending field.
    pub fn field(subject: impl Into<String>, name: impl Into<String>, message: impl Into<String>) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert(name.into(), message.into());
        Self {
            subject: subject.into(),
            fields,
        }
    }
}

fn summary(fields: &BTreeMap<String, String>) -> String {
    fields
        .iter()
        .map(|(k, v)| format!("{k}: {v}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Network/remote failure while reading data.
///
/// A fetch error never evicts cached data: the last known good value stays
/// servable while the error is reported to the caller.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// The remote call failed.
    #[error("remote fetch failed: {reason}")]
    Remote {
        /// Human-readable failure description from the remote collaborator.
        reason: String,
    },

    /// The caller's cancellation signal fired before the fetch settled.
    #[error("fetch cancelled")]
    Cancelled,
}

impl FetchError {
    /// Convenience constructor for a remote failure.
    pub fn remote(reason: impl Into<String>) -> Self {
        Self::Remote {
            reason: reason.into(),
        }
    }
}

/// Remote mutation failure; triggers rollback of the optimistic change.
#[derive(Debug, Clone, Error)]
pub enum MutationError {
    /// The remote call rejected the mutation.
    #[error("remote mutation failed: {reason}")]
    Remote {
        /// Human-readable failure description from the remote collaborator.
        reason: String,
    },

    /// Another mutation for the same entity is still in flight.
    ///
    /// Only one optimistic mutation per entity may be outstanding; the
    /// collection is untouched when this is returned.
    #[error("a mutation for entity {id} is already in flight")]
    MutationInFlight {
        /// Identifier of the entity with a pending mutation.
        id: String,
    },
}

impl MutationError {
    /// Convenience constructor for a remote failure.
    pub fn remote(reason: impl Into<String>) -> Self {
        Self::Remote {
            reason: reason.into(),
        }
    }
}

/// Session lifecycle errors.
///
/// These are terminal with respect to the current session record: the
/// controller deletes the record and the user must sign in again.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// No session record exists.
    #[error("no active session")]
    Missing,

    /// Absolute session lifetime exceeded (`now - issued_at >= max_ttl`).
    #[error("session expired")]
    Expired,

    /// Idle lifetime exceeded (`now - last_activity_at >= idle_timeout`).
    #[error("session idle timeout")]
    IdleTimeout,

    /// Another tab removed the session record.
    #[error("session removed by another tab")]
    ExternalLogout,
}

/// Storage adapter errors.
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    /// A persisted record could not be deserialized.
    #[error("corrupt record under key {key}: {reason}")]
    Corrupt {
        /// Storage key holding the unreadable value.
        key: String,
        /// Parse failure description.
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_lists_fields() {
        let mut fields = BTreeMap::new();
        fields.insert("name".to_string(), "required".to_string());
        fields.insert("email".to_string(), "invalid format".to_string());
        let err = ValidationError {
            subject: "student".to_string(),
            fields,
        };
        let msg = err.to_string();
        assert!(msg.contains("invalid student"));
        assert!(msg.contains("email: invalid format"));
        assert!(msg.contains("name: required"));
    }

    #[test]
    fn sub_errors_convert_to_top_level() {
        let err: Error = FetchError::Cancelled.into();
        assert!(matches!(err, Error::Fetch(FetchError::Cancelled)));

        let err: Error = SessionError::Expired.into();
        assert!(matches!(err, Error::Session(SessionError::Expired)));
    }

    #[test]
    fn mutation_in_flight_names_entity() {
        let err = MutationError::MutationInFlight {
            id: "s-1".to_string(),
        };
        assert!(err.to_string().contains("s-1"));
    }
}
