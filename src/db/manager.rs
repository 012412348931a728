//! Connection manager.
//!
//! The single facade callers use. It owns the configuration, resolves the
//! target, opens the pool, proves liveness and then routes statements
//! through the instrumented executor.
//!
//! ```text
//! Unopened -> Opening -> Verifying -> Ready -> Closed
//!                |            |
//!                +-> Failed <-+
//! ```
//!
//! There is no way back from `Ready` to `Opening`: a manager is opened once.
//! The lifecycle lock is never held across an await point.

use crate::config::DatabaseConfig;
use crate::db::backend::Connector;
use crate::db::dialect;
use crate::db::executor::{CallOptions, QueryExecutor, RowSet};
use crate::db::instrument::{InstrumentSink, TracingSink};
use crate::db::pool::{Pool, PoolLimits, PoolStats};
use crate::db::sqlx_backend::SqlxConnector;
use crate::error::{DbError, DbResult};
use crate::models::{CallKind, ExecSummary, ManagerState, QueryParam};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info, warn};

struct Lifecycle<C: Connector> {
    state: ManagerState,
    pool: Option<Pool<C>>,
}

/// Manages the pooled connection to one database.
pub struct ConnectionManager<C: Connector = SqlxConnector> {
    config: DatabaseConfig,
    connector: Arc<C>,
    sink: Arc<dyn InstrumentSink>,
    executor: QueryExecutor,
    lifecycle: Mutex<Lifecycle<C>>,
}

impl<C: Connector> std::fmt::Debug for ConnectionManager<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ConnectionManager<SqlxConnector> {
    /// Create an unopened manager backed by sqlx.
    pub fn new(config: DatabaseConfig) -> Self {
        Self::with_connector(config, SqlxConnector::new())
    }

    /// Create a manager and open it.
    pub async fn connect(config: DatabaseConfig) -> DbResult<Self> {
        let manager = Self::new(config);
        manager.open().await?;
        Ok(manager)
    }
}

impl<C: Connector> ConnectionManager<C> {
    /// Create an unopened manager with a custom connector.
    pub fn with_connector(config: DatabaseConfig, connector: C) -> Self {
        let sink: Arc<dyn InstrumentSink> = Arc::new(TracingSink::new(
            config.log_level,
            config.slow_threshold(),
        ));
        let executor = Self::build_executor(&config, Arc::clone(&sink));
        Self {
            config,
            connector: Arc::new(connector),
            sink,
            executor,
            lifecycle: Mutex::new(Lifecycle {
                state: ManagerState::Unopened,
                pool: None,
            }),
        }
    }

    /// Replace the instrumentation sink. Takes effect for the pool opened
    /// afterwards.
    pub fn with_sink(mut self, sink: Arc<dyn InstrumentSink>) -> Self {
        self.executor = Self::build_executor(&self.config, Arc::clone(&sink));
        self.sink = sink;
        self
    }

    fn build_executor(config: &DatabaseConfig, sink: Arc<dyn InstrumentSink>) -> QueryExecutor {
        QueryExecutor::with_defaults(
            sink,
            config.pool.acquire_timeout_or_default(),
            config.pool.statement_timeout(),
        )
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle<C>> {
        self.lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    pub fn state(&self) -> ManagerState {
        self.lifecycle().state
    }

    /// Pool counters, `None` until the pool exists.
    pub fn stats(&self) -> Option<PoolStats> {
        self.lifecycle().pool.as_ref().map(Pool::stats)
    }

    /// Masked connection URL, `None` until the target is resolved.
    pub fn target(&self) -> Option<String> {
        self.lifecycle()
            .pool
            .as_ref()
            .map(|pool| pool.target().masked().to_string())
    }

    /// Resolve the target, create the pool and verify liveness.
    ///
    /// Only valid on an unopened manager. On failure the manager ends up
    /// `Failed` with no connection left open.
    ///
    /// Verification dials the first connection, so a failure there is
    /// `ConnectFailed` (dial error), `PoolTimeout` (dial slower than the
    /// acquire timeout) or `VerifyFailed` (ping failed on a live connection).
    pub async fn open(&self) -> DbResult<()> {
        {
            let mut lifecycle = self.lifecycle();
            if lifecycle.state != ManagerState::Unopened {
                return Err(DbError::invalid_state("open", lifecycle.state));
            }
            lifecycle.state = ManagerState::Opening;
        }

        info!(driver = %self.config.driver, "Opening database connection");

        let target = match dialect::resolve(&self.config) {
            Ok(target) => target,
            Err(e) => {
                self.lifecycle().state = ManagerState::Failed;
                error!(driver = %self.config.driver, error = %e, "Failed to resolve connection target");
                return Err(e);
            }
        };

        let limits = PoolLimits::from_options(&self.config.pool);
        let pool = Pool::open(
            target,
            Arc::clone(&self.connector),
            limits,
            Arc::clone(&self.sink),
        );
        {
            let mut lifecycle = self.lifecycle();
            lifecycle.state = ManagerState::Verifying;
            lifecycle.pool = Some(pool.clone());
        }

        debug!(target_url = %pool.target(), "Verifying connection");

        if let Err(e) = pool
            .verify(self.config.pool.acquire_timeout_or_default())
            .await
        {
            if let Err(close_err) = pool.close().await {
                warn!(error = %close_err, "Failed to close pool after verification failure");
            }
            {
                let mut lifecycle = self.lifecycle();
                lifecycle.state = ManagerState::Failed;
                lifecycle.pool = None;
            }
            error!(target_url = %pool.target(), error = %e, "Connection verification failed");
            return Err(e);
        }

        self.lifecycle().state = ManagerState::Ready;
        info!(
            dialect = %pool.target().dialect(),
            target_url = %pool.target(),
            "Database connection ready"
        );
        Ok(())
    }

    /// Pool handle for a call, or the rejection to report.
    fn ready_pool(&self, operation: &'static str) -> DbResult<Pool<C>> {
        let lifecycle = self.lifecycle();
        match (lifecycle.state, &lifecycle.pool) {
            (ManagerState::Ready, Some(pool)) => Ok(pool.clone()),
            (ManagerState::Closed, _) => Err(DbError::ManagerClosed),
            (state, _) => Err(DbError::invalid_state(operation, state)),
        }
    }

    /// Run a statement that returns rows. Release the [`RowSet`] when done.
    pub async fn query(&self, statement: &str, params: &[QueryParam]) -> DbResult<RowSet<C>> {
        self.query_with(statement, params, CallOptions::default())
            .await
    }

    pub async fn query_with(
        &self,
        statement: &str,
        params: &[QueryParam],
        options: CallOptions,
    ) -> DbResult<RowSet<C>> {
        let pool = match self.ready_pool("query") {
            Ok(pool) => pool,
            Err(e) => {
                self.executor
                    .record_rejection(CallKind::Query, statement, params.len(), &e);
                return Err(e);
            }
        };
        self.executor
            .query(&pool, statement, params, options)
            .await
    }

    /// Run a statement that modifies data.
    pub async fn execute(&self, statement: &str, params: &[QueryParam]) -> DbResult<ExecSummary> {
        self.execute_with(statement, params, CallOptions::default())
            .await
    }

    pub async fn execute_with(
        &self,
        statement: &str,
        params: &[QueryParam],
        options: CallOptions,
    ) -> DbResult<ExecSummary> {
        let pool = match self.ready_pool("execute") {
            Ok(pool) => pool,
            Err(e) => {
                self.executor
                    .record_rejection(CallKind::Execute, statement, params.len(), &e);
                return Err(e);
            }
        };
        self.executor
            .execute(&pool, statement, params, options)
            .await
    }

    /// Check liveness of a pooled connection on demand.
    pub async fn ping(&self) -> DbResult<()> {
        let pool = self.ready_pool("ping")?;
        pool.verify(self.config.pool.acquire_timeout_or_default())
            .await
    }

    /// Close the manager and its pool.
    ///
    /// Idle connections are closed immediately. Connections still held by
    /// callers (including unreleased row sets) are closed as they are
    /// released; waiters and new calls fail with `ManagerClosed`. Closing a
    /// closed manager also fails with `ManagerClosed`.
    pub async fn close(&self) -> DbResult<()> {
        let pool = {
            let mut lifecycle = self.lifecycle();
            match lifecycle.state {
                ManagerState::Ready => {
                    lifecycle.state = ManagerState::Closed;
                    lifecycle.pool.take()
                }
                ManagerState::Closed => return Err(DbError::ManagerClosed),
                state => return Err(DbError::invalid_state("close", state)),
            }
        };

        if let Some(pool) = pool {
            pool.close().await?;
            info!(target_url = %pool.target(), "Database connection closed");
        }
        Ok(())
    }
}

impl<C: Connector> Drop for ConnectionManager<C> {
    fn drop(&mut self) {
        let lifecycle = self.lifecycle();
        if lifecycle.state == ManagerState::Ready {
            warn!(
                open = lifecycle.pool.as_ref().map(|p| p.stats().open),
                "Connection manager dropped without close()"
            );
        }
    }
}
