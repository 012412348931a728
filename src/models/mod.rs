//! Data models for the connection manager.
//!
//! This module re-exports all model types used throughout the crate.

pub mod connection;
pub mod query;
pub mod record;

// Re-export commonly used types
pub use connection::{Dialect, ManagerState};
pub use query::{ExecSummary, QueryParam, Row, RowsAffected};
pub use record::{CallKind, CloseReason, Outcome, PoolEvent, QueryRecord};
