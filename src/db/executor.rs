//! Instrumented statement execution.
//!
//! Every call checks out a connection, runs one statement with positional
//! parameters and emits exactly one [`QueryRecord`], whatever the outcome:
//!
//! - `query` hands back a [`RowSet`] that keeps its connection checked out
//!   until [`RowSet::release`] is called
//! - `execute` returns the connection immediately and reports an
//!   [`ExecSummary`]
//!
//! Backend failures surface as [`DbError::ExecutionFailed`] carrying the
//! statement, the argument count and the elapsed time.

use crate::db::backend::{BackendConnection, Connector};
use crate::db::instrument::InstrumentSink;
use crate::db::pool::{Pool, PooledConnection};
use crate::error::{BackendError, DbError, DbResult};
use crate::models::{CallKind, ExecSummary, Outcome, QueryParam, QueryRecord, Row};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::debug;

/// Per-call overrides of the configured timeouts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallOptions {
    /// Upper bound on waiting for a pooled connection
    pub acquire_timeout: Option<Duration>,
    /// Upper bound on the statement itself
    pub statement_timeout: Option<Duration>,
}

impl CallOptions {
    pub fn with_acquire_timeout(mut self, limit: Duration) -> Self {
        self.acquire_timeout = Some(limit);
        self
    }

    pub fn with_statement_timeout(mut self, limit: Duration) -> Self {
        self.statement_timeout = Some(limit);
        self
    }
}

/// Query executor that wraps every call with instrumentation.
#[derive(Clone)]
pub struct QueryExecutor {
    sink: Arc<dyn InstrumentSink>,
    default_acquire_timeout: Option<Duration>,
    default_statement_timeout: Option<Duration>,
}

impl std::fmt::Debug for QueryExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryExecutor")
            .field("default_acquire_timeout", &self.default_acquire_timeout)
            .field("default_statement_timeout", &self.default_statement_timeout)
            .finish_non_exhaustive()
    }
}

impl QueryExecutor {
    pub fn new(sink: Arc<dyn InstrumentSink>) -> Self {
        Self {
            sink,
            default_acquire_timeout: None,
            default_statement_timeout: None,
        }
    }

    /// Create an executor with configured default timeouts.
    pub fn with_defaults(
        sink: Arc<dyn InstrumentSink>,
        acquire_timeout: Option<Duration>,
        statement_timeout: Option<Duration>,
    ) -> Self {
        Self {
            sink,
            default_acquire_timeout: acquire_timeout,
            default_statement_timeout: statement_timeout,
        }
    }

    pub fn sink(&self) -> &Arc<dyn InstrumentSink> {
        &self.sink
    }

    fn acquire_timeout(&self, options: CallOptions) -> Option<Duration> {
        options.acquire_timeout.or(self.default_acquire_timeout)
    }

    fn statement_timeout(&self, options: CallOptions) -> Option<Duration> {
        options.statement_timeout.or(self.default_statement_timeout)
    }

    /// Run a statement that returns rows.
    pub async fn query<C: Connector>(
        &self,
        pool: &Pool<C>,
        statement: &str,
        params: &[QueryParam],
        options: CallOptions,
    ) -> DbResult<RowSet<C>> {
        let start = Instant::now();
        debug!(sql = %statement, params = params.len(), "Executing query");

        let mut conn = match pool.acquire(self.acquire_timeout(options)).await {
            Ok(conn) => conn,
            Err(e) => {
                self.emit(CallKind::Query, statement, params.len(), start, None, failure(&e));
                return Err(e);
            }
        };
        let connection_id = conn.id();

        let result = match conn.connection_mut() {
            Ok(backend) => {
                bounded(
                    self.statement_timeout(options),
                    backend.fetch(statement, params),
                )
                .await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(rows) => {
                self.emit(
                    CallKind::Query,
                    statement,
                    params.len(),
                    start,
                    Some(connection_id),
                    Outcome::Success {
                        rows: Some(rows.len() as u64),
                    },
                );
                Ok(RowSet::new(rows, conn))
            }
            Err(e) => Err(self
                .fail(pool, conn, CallKind::Query, statement, params.len(), start, e)
                .await),
        }
    }

    /// Run a statement that modifies data.
    pub async fn execute<C: Connector>(
        &self,
        pool: &Pool<C>,
        statement: &str,
        params: &[QueryParam],
        options: CallOptions,
    ) -> DbResult<ExecSummary> {
        let start = Instant::now();
        debug!(sql = %statement, params = params.len(), "Executing statement");

        let mut conn = match pool.acquire(self.acquire_timeout(options)).await {
            Ok(conn) => conn,
            Err(e) => {
                self.emit(CallKind::Execute, statement, params.len(), start, None, failure(&e));
                return Err(e);
            }
        };
        let connection_id = conn.id();

        let result = match conn.connection_mut() {
            Ok(backend) => {
                bounded(
                    self.statement_timeout(options),
                    backend.execute(statement, params),
                )
                .await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(summary) => {
                self.emit(
                    CallKind::Execute,
                    statement,
                    params.len(),
                    start,
                    Some(connection_id),
                    Outcome::Success {
                        rows: summary.rows_affected.known(),
                    },
                );
                conn.release().await;
                Ok(summary)
            }
            Err(e) => Err(self
                .fail(pool, conn, CallKind::Execute, statement, params.len(), start, e)
                .await),
        }
    }

    /// Record a call that was rejected before reaching the pool.
    pub fn record_rejection(
        &self,
        kind: CallKind,
        statement: &str,
        arg_count: usize,
        error: &DbError,
    ) {
        self.sink.on_query(&QueryRecord {
            kind,
            statement: statement.to_string(),
            arg_count,
            elapsed: Duration::ZERO,
            connection_id: None,
            outcome: failure(error),
        });
    }

    #[allow(clippy::too_many_arguments)]
    async fn fail<C: Connector>(
        &self,
        pool: &Pool<C>,
        conn: PooledConnection<C>,
        kind: CallKind,
        statement: &str,
        arg_count: usize,
        start: Instant,
        error: BackendError,
    ) -> DbError {
        let elapsed = start.elapsed();
        let connection_id = conn.id();
        let message = pool.redact(&error.message);
        let err = DbError::execution_failed(
            statement,
            arg_count,
            elapsed,
            message,
            error.sql_state.clone(),
        );
        self.emit(kind, statement, arg_count, start, Some(connection_id), failure(&err));

        if error.broken {
            conn.discard().await;
        } else {
            conn.release().await;
        }
        err
    }

    fn emit(
        &self,
        kind: CallKind,
        statement: &str,
        arg_count: usize,
        start: Instant,
        connection_id: Option<u64>,
        outcome: Outcome,
    ) {
        self.sink.on_query(&QueryRecord {
            kind,
            statement: statement.to_string(),
            arg_count,
            elapsed: start.elapsed(),
            connection_id,
            outcome,
        });
    }
}

fn failure(error: &DbError) -> Outcome {
    Outcome::Failure {
        error: error.to_string(),
    }
}

/// Apply the statement timeout. A timed-out connection is in an unknown
/// protocol state and is reported as broken.
async fn bounded<T>(
    limit: Option<Duration>,
    fut: impl Future<Output = Result<T, BackendError>>,
) -> Result<T, BackendError> {
    match limit {
        Some(limit) => timeout(limit, fut).await.unwrap_or_else(|_| {
            Err(BackendError::broken(format!(
                "statement timed out after {}ms",
                limit.as_millis()
            )))
        }),
        None => fut.await,
    }
}

/// Forward-only rows of a query.
///
/// The connection that produced the rows stays checked out until the set is
/// released, so it counts against max-open the whole time.
pub struct RowSet<C: Connector> {
    columns: Option<Arc<[String]>>,
    rows: std::vec::IntoIter<Row>,
    conn: Option<PooledConnection<C>>,
}

impl<C: Connector> std::fmt::Debug for RowSet<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowSet")
            .field("columns", &self.columns())
            .field("remaining", &self.rows.len())
            .field("released", &self.conn.is_none())
            .finish()
    }
}

impl<C: Connector> RowSet<C> {
    fn new(rows: Vec<Row>, conn: PooledConnection<C>) -> Self {
        let columns = rows.first().map(Row::shared_columns);
        Self {
            columns,
            rows: rows.into_iter(),
            conn: Some(conn),
        }
    }

    /// Column names, empty when the result had no rows.
    pub fn columns(&self) -> &[String] {
        self.columns.as_deref().unwrap_or(&[])
    }

    /// Rows not yet consumed.
    pub fn remaining(&self) -> usize {
        self.rows.len()
    }

    /// Physical connection holding this result.
    pub fn connection_id(&self) -> Option<u64> {
        self.conn.as_ref().map(|c| c.id())
    }

    /// Give the connection back to the pool. Unconsumed rows are dropped.
    pub async fn release(mut self) {
        if let Some(conn) = self.conn.take() {
            conn.release().await;
        }
    }
}

impl<C: Connector> Iterator for RowSet<C> {
    type Item = Row;

    fn next(&mut self) -> Option<Row> {
        self.rows.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.rows.size_hint()
    }
}

impl<C: Connector> ExactSizeIterator for RowSet<C> {}
