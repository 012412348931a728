//! Shared test doubles: an in-memory connector that counts physical
//! connections and a sink that records everything it receives.

#![allow(dead_code)]

use async_trait::async_trait;
use dbconn::config::{LogLevel, PoolOptions};
use dbconn::db::{BackendConnection, ConnectionManager, Connector, InstrumentSink};
use dbconn::db::ConnectionTarget;
use dbconn::error::BackendError;
use dbconn::models::{ExecSummary, PoolEvent, QueryParam, QueryRecord, Row, RowsAffected};
use dbconn::DatabaseConfig;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const PASSWORD: &str = "s3cret-pw";

/// Statements the fake backend recognizes.
pub const FAIL: &str = "FAIL";
pub const BROKEN: &str = "BROKEN";
pub const SLEEP: &str = "SLEEP";

#[derive(Default)]
pub struct FakeState {
    live: AtomicUsize,
    peak: AtomicUsize,
    opened: AtomicUsize,
    closed: AtomicUsize,
    dropped: AtomicUsize,
    targets_closed: AtomicUsize,
    next_id: AtomicU64,
    pub fail_connect: AtomicBool,
    pub fail_ping: AtomicBool,
    pub unknown_rows: AtomicBool,
    hold: Mutex<Duration>,
    ping_delay: Mutex<Duration>,
    close_delay: Mutex<Duration>,
    connect_delay: Mutex<Duration>,
}

/// Connector that never leaves the process.
#[derive(Clone, Default)]
pub struct FakeConnector {
    pub state: Arc<FakeState>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connections currently alive (opened and neither closed nor dropped).
    pub fn live(&self) -> usize {
        self.state.live.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.state.peak.load(Ordering::SeqCst)
    }

    pub fn opened(&self) -> usize {
        self.state.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.state.closed.load(Ordering::SeqCst)
    }

    pub fn dropped(&self) -> usize {
        self.state.dropped.load(Ordering::SeqCst)
    }

    /// Make every fetch take this long.
    pub fn set_hold(&self, hold: Duration) {
        *self.state.hold.lock().unwrap() = hold;
    }

    /// Times a pool handed its target back through `close_target`.
    pub fn targets_closed(&self) -> usize {
        self.state.targets_closed.load(Ordering::SeqCst)
    }

    pub fn set_ping_delay(&self, delay: Duration) {
        *self.state.ping_delay.lock().unwrap() = delay;
    }

    /// Make every dial take this long.
    pub fn set_connect_delay(&self, delay: Duration) {
        *self.state.connect_delay.lock().unwrap() = delay;
    }

    /// Make every graceful close take this long.
    pub fn set_close_delay(&self, delay: Duration) {
        *self.state.close_delay.lock().unwrap() = delay;
    }

    pub fn fail_connect(&self) {
        self.state.fail_connect.store(true, Ordering::SeqCst);
    }

    pub fn fail_ping(&self) {
        self.state.fail_ping.store(true, Ordering::SeqCst);
    }

    pub fn report_unknown_rows(&self) {
        self.state.unknown_rows.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for FakeConnector {
    type Connection = FakeConnection;

    async fn connect(&self, target: &ConnectionTarget) -> Result<FakeConnection, BackendError> {
        let delay = *self.state.connect_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.state.fail_connect.load(Ordering::SeqCst) {
            // Drivers tend to echo the address they failed to reach
            return Err(BackendError::broken(format!(
                "connection refused: {}",
                target.expose()
            )));
        }
        let live = self.state.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.peak.fetch_max(live, Ordering::SeqCst);
        self.state.opened.fetch_add(1, Ordering::SeqCst);
        Ok(FakeConnection {
            backend_id: self.state.next_id.fetch_add(1, Ordering::SeqCst) + 1,
            state: Arc::clone(&self.state),
            closed: false,
        })
    }

    async fn close_target(&self, _target: &ConnectionTarget) {
        self.state.targets_closed.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct FakeConnection {
    backend_id: u64,
    state: Arc<FakeState>,
    closed: bool,
}

impl FakeConnection {
    async fn run(&self, statement: &str) -> Result<(), BackendError> {
        let hold = *self.state.hold.lock().unwrap();
        if !hold.is_zero() {
            tokio::time::sleep(hold).await;
        }
        match statement {
            FAIL => Err(BackendError::new(format!("syntax error at or near \"{FAIL}\"")).with_sql_state("42601")),
            BROKEN => Err(BackendError::broken("connection reset by peer")),
            SLEEP => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl BackendConnection for FakeConnection {
    async fn ping(&mut self) -> Result<(), BackendError> {
        let delay = *self.state.ping_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.state.fail_ping.load(Ordering::SeqCst) {
            return Err(BackendError::new(format!(
                "password authentication failed (password \"{PASSWORD}\")"
            )));
        }
        Ok(())
    }

    async fn fetch(&mut self, statement: &str, params: &[QueryParam]) -> Result<Vec<Row>, BackendError> {
        self.run(statement).await?;
        let columns: Arc<[String]> = Arc::from(vec!["backend_id".to_string(), "args".to_string()]);
        Ok(vec![
            Row::new(Arc::clone(&columns), vec![json!(self.backend_id), json!(params.len())]),
            Row::new(columns, vec![json!(self.backend_id), json!(params.len())]),
        ])
    }

    async fn execute(&mut self, statement: &str, params: &[QueryParam]) -> Result<ExecSummary, BackendError> {
        self.run(statement).await?;
        if self.state.unknown_rows.load(Ordering::SeqCst) {
            Ok(ExecSummary::new(RowsAffected::Unknown))
        } else {
            Ok(ExecSummary::new(RowsAffected::Known(params.len() as u64)))
        }
    }

    async fn close(mut self) -> Result<(), BackendError> {
        let delay = *self.state.close_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.closed = true;
        self.state.live.fetch_sub(1, Ordering::SeqCst);
        self.state.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for FakeConnection {
    fn drop(&mut self) {
        if !self.closed {
            self.state.live.fetch_sub(1, Ordering::SeqCst);
            self.state.dropped.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Sink that keeps every record and event.
#[derive(Default)]
pub struct RecordingSink {
    records: Mutex<Vec<QueryRecord>>,
    events: Mutex<Vec<PoolEvent>>,
}

impl RecordingSink {
    pub fn records(&self) -> Vec<QueryRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn events(&self) -> Vec<PoolEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl InstrumentSink for RecordingSink {
    fn on_query(&self, record: &QueryRecord) {
        self.records.lock().unwrap().push(record.clone());
    }

    fn on_pool_event(&self, event: &PoolEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

/// Postgres-shaped configuration carrying [`PASSWORD`].
pub fn config(pool: PoolOptions) -> DatabaseConfig {
    DatabaseConfig {
        host: "db.internal".to_string(),
        port: 5432,
        user: "app".to_string(),
        password: PASSWORD.to_string(),
        dbname: "orders".to_string(),
        pool,
        log_level: LogLevel::Debug,
        ..DatabaseConfig::new("postgres")
    }
}

/// An unopened manager over a fresh fake backend.
pub fn manager(
    pool: PoolOptions,
) -> (ConnectionManager<FakeConnector>, FakeConnector, Arc<RecordingSink>) {
    let connector = FakeConnector::new();
    let sink = Arc::new(RecordingSink::default());
    let manager = ConnectionManager::with_connector(config(pool), connector.clone())
        .with_sink(sink.clone());
    (manager, connector, sink)
}

/// An opened manager over a fresh fake backend.
pub async fn ready_manager(
    pool: PoolOptions,
) -> (ConnectionManager<FakeConnector>, FakeConnector, Arc<RecordingSink>) {
    let (manager, connector, sink) = manager(pool);
    manager.open().await.expect("open should succeed");
    (manager, connector, sink)
}
