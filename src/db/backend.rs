//! Backend seam.
//!
//! The pool never talks to a driver directly: it opens physical connections
//! through a [`Connector`] and drives them through [`BackendConnection`].
//! [`SqlxConnector`](crate::db::SqlxConnector) is the production
//! implementation; tests substitute an in-memory double.

use crate::db::dialect::ConnectionTarget;
use crate::error::BackendError;
use crate::models::{ExecSummary, QueryParam, Row};
use async_trait::async_trait;

/// Opens physical connections to a resolved target.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: BackendConnection;

    async fn connect(&self, target: &ConnectionTarget) -> Result<Self::Connection, BackendError>;

    /// Release any per-target state once the pool for `target` is closed.
    async fn close_target(&self, _target: &ConnectionTarget) {}
}

/// One physical connection.
///
/// Statements are forwarded as-is and arguments are bound positionally by the
/// driver.
#[async_trait]
pub trait BackendConnection: Send + 'static {
    /// Round-trip to the server to prove the connection is alive.
    async fn ping(&mut self) -> Result<(), BackendError>;

    async fn fetch(
        &mut self,
        statement: &str,
        params: &[QueryParam],
    ) -> Result<Vec<Row>, BackendError>;

    async fn execute(
        &mut self,
        statement: &str,
        params: &[QueryParam],
    ) -> Result<ExecSummary, BackendError>;

    /// Gracefully terminate the connection.
    async fn close(self) -> Result<(), BackendError>;
}
