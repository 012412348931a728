//! sqlx-backed physical connections.
//!
//! Each dialect uses its own concrete connection type (`PgConnection`,
//! `MySqlConnection`, `SqliteConnection`) for full type support.

use crate::db::backend::{BackendConnection, Connector};
use crate::db::dialect::ConnectionTarget;
use crate::db::types::decode_rows;
use crate::error::BackendError;
use crate::models::{Dialect, ExecSummary, QueryParam, Row};
use async_trait::async_trait;
use sqlx::mysql::MySqlConnectOptions;
use sqlx::postgres::PgConnectOptions;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{Connection, MySqlConnection, PgConnection, SqliteConnection};
use std::collections::HashMap;
use std::str::FromStr;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Opens connections through sqlx using the resolved target's dialect.
///
/// In-memory SQLite targets are parsed once and kept alive by an anchor
/// connection, so every pooled connection sees the same database until the
/// target is closed.
#[derive(Debug, Default)]
pub struct SqlxConnector {
    memory: Mutex<HashMap<String, MemoryDatabase>>,
}

#[derive(Debug)]
struct MemoryDatabase {
    options: SqliteConnectOptions,
    anchor: SqliteConnection,
}

impl SqlxConnector {
    pub fn new() -> Self {
        Self::default()
    }

    async fn connect_memory(
        &self,
        target: &ConnectionTarget,
    ) -> Result<SqliteConnection, BackendError> {
        let options = {
            let mut memory = self.memory.lock().await;
            match memory.get(target.expose()) {
                Some(db) => db.options.clone(),
                None => {
                    // Each parse names a new database; reuse the first one
                    let options = SqliteConnectOptions::from_str(target.expose())?;
                    let anchor = SqliteConnection::connect_with(&options).await?;
                    debug!("Created shared in-memory SQLite database");
                    memory.insert(
                        target.expose().to_string(),
                        MemoryDatabase {
                            options: options.clone(),
                            anchor,
                        },
                    );
                    options
                }
            }
        };
        Ok(SqliteConnection::connect_with(&options).await?)
    }
}

/// Dialect-specific physical connection.
#[derive(Debug)]
pub enum SqlxConnection {
    Postgres(PgConnection),
    MySql(MySqlConnection),
    Sqlite(SqliteConnection),
}

impl SqlxConnection {
    pub fn dialect(&self) -> Dialect {
        match self {
            Self::Postgres(_) => Dialect::Postgres,
            Self::MySql(_) => Dialect::MySql,
            Self::Sqlite(_) => Dialect::Sqlite,
        }
    }
}

#[async_trait]
impl Connector for SqlxConnector {
    type Connection = SqlxConnection;

    async fn connect(&self, target: &ConnectionTarget) -> Result<SqlxConnection, BackendError> {
        match target.dialect() {
            Dialect::Postgres => {
                let options = PgConnectOptions::from_str(target.expose())?;
                let conn = PgConnection::connect_with(&options).await?;
                Ok(SqlxConnection::Postgres(conn))
            }
            Dialect::MySql => {
                let options = MySqlConnectOptions::from_str(target.expose())?.charset("utf8mb4");
                let conn = MySqlConnection::connect_with(&options).await?;
                Ok(SqlxConnection::MySql(conn))
            }
            Dialect::Sqlite if target.is_sqlite_memory() => {
                let conn = self.connect_memory(target).await?;
                Ok(SqlxConnection::Sqlite(conn))
            }
            Dialect::Sqlite => {
                let options = SqliteConnectOptions::from_str(target.expose())?;
                let conn = SqliteConnection::connect_with(&options).await?;
                Ok(SqlxConnection::Sqlite(conn))
            }
        }
    }

    async fn close_target(&self, target: &ConnectionTarget) {
        let removed = self.memory.lock().await.remove(target.expose());
        if let Some(db) = removed {
            if let Err(e) = db.anchor.close().await {
                warn!(error = %e, "Failed to close in-memory SQLite anchor connection");
            }
        }
    }
}

#[async_trait]
impl BackendConnection for SqlxConnection {
    async fn ping(&mut self) -> Result<(), BackendError> {
        dispatch_connection!(self, conn => conn.ping().await.map_err(BackendError::from))
    }

    async fn fetch(
        &mut self,
        statement: &str,
        params: &[QueryParam],
    ) -> Result<Vec<Row>, BackendError> {
        match self {
            Self::Postgres(conn) => postgres::fetch(conn, statement, params).await,
            Self::MySql(conn) => mysql::fetch(conn, statement, params).await,
            Self::Sqlite(conn) => sqlite::fetch(conn, statement, params).await,
        }
    }

    async fn execute(
        &mut self,
        statement: &str,
        params: &[QueryParam],
    ) -> Result<ExecSummary, BackendError> {
        match self {
            Self::Postgres(conn) => postgres::execute(conn, statement, params).await,
            Self::MySql(conn) => mysql::execute(conn, statement, params).await,
            Self::Sqlite(conn) => sqlite::execute(conn, statement, params).await,
        }
    }

    async fn close(self) -> Result<(), BackendError> {
        dispatch_connection!(self, conn => conn.close().await.map_err(BackendError::from))
    }
}

// =============================================================================
// Dialect-Specific Implementations
// =============================================================================
//
// Without parameters the statement is sent as-is (simple query protocol),
// since some statements cannot be prepared.

mod postgres {
    use super::*;
    use sqlx::Executor;
    use sqlx::postgres::PgArguments;

    pub async fn fetch(
        conn: &mut PgConnection,
        sql: &str,
        params: &[QueryParam],
    ) -> Result<Vec<Row>, BackendError> {
        let rows = if params.is_empty() {
            conn.fetch_all(sql).await?
        } else {
            let mut query = sqlx::query(sql);
            for param in params {
                query = bind_param(query, param);
            }
            query.fetch_all(&mut *conn).await?
        };
        Ok(decode_rows(rows))
    }

    pub async fn execute(
        conn: &mut PgConnection,
        sql: &str,
        params: &[QueryParam],
    ) -> Result<ExecSummary, BackendError> {
        let result = if params.is_empty() {
            conn.execute(sql).await?
        } else {
            let mut query = sqlx::query(sql);
            for param in params {
                query = bind_param(query, param);
            }
            query.execute(&mut *conn).await?
        };
        Ok(ExecSummary::new(crate::models::RowsAffected::Known(
            result.rows_affected(),
        )))
    }

    fn bind_param<'q>(
        query: sqlx::query::Query<'q, sqlx::Postgres, PgArguments>,
        param: &'q QueryParam,
    ) -> sqlx::query::Query<'q, sqlx::Postgres, PgArguments> {
        match param {
            QueryParam::Null => query.bind(None::<String>),
            QueryParam::Bool(v) => query.bind(*v),
            QueryParam::Int(v) => query.bind(*v),
            QueryParam::Float(v) => query.bind(*v),
            QueryParam::String(v) => query.bind(v.as_str()),
            QueryParam::Bytes(v) => query.bind(v.as_slice()),
            QueryParam::Json(v) => query.bind(sqlx::types::Json(v)),
        }
    }
}

mod mysql {
    use super::*;
    use sqlx::Executor;
    use sqlx::mysql::MySqlArguments;

    pub async fn fetch(
        conn: &mut MySqlConnection,
        sql: &str,
        params: &[QueryParam],
    ) -> Result<Vec<Row>, BackendError> {
        let rows = if params.is_empty() {
            conn.fetch_all(sql).await?
        } else {
            let mut query = sqlx::query(sql);
            for param in params {
                query = bind_param(query, param);
            }
            query.fetch_all(&mut *conn).await?
        };
        Ok(decode_rows(rows))
    }

    pub async fn execute(
        conn: &mut MySqlConnection,
        sql: &str,
        params: &[QueryParam],
    ) -> Result<ExecSummary, BackendError> {
        let result = if params.is_empty() {
            conn.execute(sql).await?
        } else {
            let mut query = sqlx::query(sql);
            for param in params {
                query = bind_param(query, param);
            }
            query.execute(&mut *conn).await?
        };
        let summary = ExecSummary::new(crate::models::RowsAffected::Known(result.rows_affected()));
        // LAST_INSERT_ID() is 0 when the statement generated no id
        Ok(match i64::try_from(result.last_insert_id()) {
            Ok(id) if id > 0 => summary.with_last_insert_id(id),
            _ => summary,
        })
    }

    fn bind_param<'q>(
        query: sqlx::query::Query<'q, sqlx::MySql, MySqlArguments>,
        param: &'q QueryParam,
    ) -> sqlx::query::Query<'q, sqlx::MySql, MySqlArguments> {
        match param {
            QueryParam::Null => query.bind(None::<String>),
            QueryParam::Bool(v) => query.bind(*v),
            QueryParam::Int(v) => query.bind(*v),
            QueryParam::Float(v) => query.bind(*v),
            QueryParam::String(v) => query.bind(v.as_str()),
            QueryParam::Bytes(v) => query.bind(v.as_slice()),
            QueryParam::Json(v) => query.bind(sqlx::types::Json(v)),
        }
    }
}

mod sqlite {
    use super::*;
    use sqlx::Executor;
    use sqlx::sqlite::SqliteArguments;

    pub async fn fetch(
        conn: &mut SqliteConnection,
        sql: &str,
        params: &[QueryParam],
    ) -> Result<Vec<Row>, BackendError> {
        let rows = if params.is_empty() {
            conn.fetch_all(sql).await?
        } else {
            let mut query = sqlx::query(sql);
            for param in params {
                query = bind_param(query, param);
            }
            query.fetch_all(&mut *conn).await?
        };
        Ok(decode_rows(rows))
    }

    pub async fn execute(
        conn: &mut SqliteConnection,
        sql: &str,
        params: &[QueryParam],
    ) -> Result<ExecSummary, BackendError> {
        let result = if params.is_empty() {
            conn.execute(sql).await?
        } else {
            let mut query = sqlx::query(sql);
            for param in params {
                query = bind_param(query, param);
            }
            query.execute(&mut *conn).await?
        };
        let summary = ExecSummary::new(crate::models::RowsAffected::Known(result.rows_affected()));
        let rowid = result.last_insert_rowid();
        Ok(if result.rows_affected() > 0 && rowid > 0 {
            summary.with_last_insert_id(rowid)
        } else {
            summary
        })
    }

    fn bind_param<'q>(
        query: sqlx::query::Query<'q, sqlx::Sqlite, SqliteArguments<'q>>,
        param: &'q QueryParam,
    ) -> sqlx::query::Query<'q, sqlx::Sqlite, SqliteArguments<'q>> {
        match param {
            QueryParam::Null => query.bind(None::<String>),
            QueryParam::Bool(v) => query.bind(*v),
            QueryParam::Int(v) => query.bind(*v),
            QueryParam::Float(v) => query.bind(*v),
            QueryParam::String(v) => query.bind(v.as_str()),
            QueryParam::Bytes(v) => query.bind(v.as_slice()),
            // SQLite doesn't have native JSON type, store as string
            QueryParam::Json(v) => query.bind(v.to_string()),
        }
    }
}
