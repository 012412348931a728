//! Database access layer.
//!
//! This module provides:
//! - Dialect resolution from configuration to a connection target
//! - The backend seam and its sqlx implementation
//! - Connection pool management
//! - Instrumented statement execution
//! - The connection manager facade
//! - Type mappings and dispatch macros

pub mod backend;
pub mod dialect;
pub mod executor;
pub mod instrument;
#[macro_use]
pub mod macros;
pub mod manager;
pub mod pool;
pub mod sqlx_backend;
pub mod types;

pub use backend::{BackendConnection, Connector};
pub use dialect::{ConnectionTarget, resolve};
pub use executor::{CallOptions, QueryExecutor, RowSet};
pub use instrument::{InstrumentSink, TracingSink};
pub use manager::ConnectionManager;
pub use pool::{Pool, PoolLimits, PoolStats, PooledConnection};
pub use sqlx_backend::{SqlxConnection, SqlxConnector};
