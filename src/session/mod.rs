//! Session lifecycle: persistence, cross-tab sync, and the state machine.
//!
//! The session layer has three parts. [`record`] persists one
//! [`SessionRecord`](record::SessionRecord) in origin-scoped storage and
//! validates it against a [`SessionPolicy`](record::SessionPolicy). [`sync`]
//! classifies foreign-tab changes to that record. [`controller`] ties both
//! to the idle timer and a periodic validation task, driving the
//! `NoSession / Active / IdleLocked / Expired` state machine.

pub mod controller;
pub mod record;
pub mod sync;

pub use controller::{LogoutReason, SessionController, SessionState};
pub use record::{Role, SESSION_KEY, SessionInfo, SessionPolicy, SessionRecord, SessionStore};
pub use sync::{SessionSyncEvent, SessionSynchronizer};
