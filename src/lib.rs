//! Multi-backend database connection manager.
//!
//! Resolves a declarative configuration into a driver target for
//! PostgreSQL, MySQL or SQLite, maintains a bounded and verified pool of
//! physical connections, and runs statements through an executor that
//! reports every call to an instrumentation sink.

pub mod config;
pub mod db;
pub mod error;
pub mod models;

pub use config::DatabaseConfig;
pub use db::{CallOptions, ConnectionManager, RowSet};
pub use error::{DbError, DbResult};
