//! # Turma client data layer
//!
//! Client-side data layer for a school management app: a TTL cache with
//! stale-while-revalidate queries, optimistic mutations with rollback, and a
//! cross-tab session lifecycle with idle and TTL expiry.
//!
//! ## Features
//!
//! - **Cached queries**: fresh values served locally, stale values served
//!   immediately while one background refetch runs
//! - **Request de-duplication**: concurrent callers for the same key share a
//!   single in-flight fetch
//! - **Optimistic mutations**: local changes apply instantly and roll back
//!   exactly on remote failure
//! - **Session lifecycle**: one shared session record per origin, idle and
//!   TTL expiry, synchronized logout across tabs
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! use turma_client::prelude::*;
//!
//! #[tokio::main]
//! async fn main() {
//!     let client: QueryClient<Vec<String>> = QueryClient::default();
//!
//!     let coordinator = client.query(
//!         "classes",
//!         || async { Ok(vec!["Turma A".to_string(), "Turma B".to_string()]) },
//!         QueryOptions {
//!             ttl: Some(Duration::from_secs(30)),
//!             ..QueryOptions::default()
//!         },
//!     );
//!     coordinator.refresh().await;
//!     assert!(coordinator.state().data.is_some());
//! }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod cache;
pub mod error;
pub mod idle;
pub mod mutation;
pub mod query;
pub mod result;
pub mod session;
pub mod storage;
pub mod students;

pub use error::{Error, FetchError, MutationError, SessionError, StorageError, ValidationError};
pub use result::Result;

pub use cache::{CacheConfig, CacheEngine, CacheStats, CacheSubscription};
pub use query::{
    PendingRegistry, QueryClient, QueryCoordinator, QueryOptions, QueryState, RevalidationConfig,
};
pub use session::{
    LogoutReason, Role, SessionController, SessionPolicy, SessionRecord, SessionState,
    SessionStore, SessionSynchronizer,
};
pub use storage::{KeyValueStore, OriginStore, OriginTab, StorageEvent, TabStore};

/// Convenience re-exports for typical callers.
pub mod prelude {
    pub use crate::cache::{CacheConfig, CacheEngine};
    pub use crate::error::{Error, FetchError, MutationError, SessionError, ValidationError};
    pub use crate::idle::{IdleTimer, InputKind};
    pub use crate::mutation::with_optimistic_update;
    pub use crate::query::{QueryClient, QueryOptions, QueryState, RevalidationConfig};
    pub use crate::result::Result;
    pub use crate::session::{
        LogoutReason, Role, SessionController, SessionPolicy, SessionState,
    };
    pub use crate::storage::{KeyValueStore, OriginStore, OriginTab};
    pub use crate::students::{Student, StudentApi, StudentPayload, StudentRoster};
}
