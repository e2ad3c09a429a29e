//! Result type alias for the Turma client data layer.
//!
//! # Examples
//!
//! ```rust
//! use turma_client::Result;
//!
//! fn load_roster_key() -> Result<String> {
//!     Ok("students:class-1".to_string())
//! }
//! ```

/// Result type alias for data-layer operations.
///
/// Convenience alias for `std::result::Result<T, crate::Error>`; the error
/// parameter can still be overridden where a narrower error is appropriate.
pub type Result<T, E = crate::Error> = std::result::Result<T, E>;
