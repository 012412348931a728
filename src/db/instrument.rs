//! Instrumentation sinks.
//!
//! The executor hands every [`QueryRecord`] and the pool every [`PoolEvent`]
//! to an [`InstrumentSink`]. The default [`TracingSink`] turns them into
//! structured `tracing` events gated by the configured [`LogLevel`].

use crate::config::LogLevel;
use crate::models::{CloseReason, Outcome, PoolEvent, QueryRecord};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Receiver of instrumentation records.
///
/// Implementations must be cheap and must not block: they run inline on the
/// calling task.
pub trait InstrumentSink: Send + Sync + 'static {
    fn on_query(&self, record: &QueryRecord);

    fn on_pool_event(&self, _event: &PoolEvent) {}
}

/// Emits records as `tracing` events.
#[derive(Debug, Clone)]
pub struct TracingSink {
    level: LogLevel,
    slow_threshold: Option<Duration>,
}

impl TracingSink {
    pub fn new(level: LogLevel, slow_threshold: Option<Duration>) -> Self {
        Self {
            level,
            slow_threshold,
        }
    }

    fn is_slow(&self, elapsed: Duration) -> bool {
        self.slow_threshold.is_some_and(|t| elapsed >= t)
    }
}

impl Default for TracingSink {
    fn default() -> Self {
        Self::new(LogLevel::default(), None)
    }
}

impl InstrumentSink for TracingSink {
    fn on_query(&self, record: &QueryRecord) {
        let elapsed_ms = record.elapsed.as_secs_f64() * 1000.0;
        match &record.outcome {
            Outcome::Failure { error } if self.level >= LogLevel::Error => {
                error!(
                    kind = %record.kind,
                    statement = %record.statement,
                    args = record.arg_count,
                    elapsed_ms,
                    connection_id = ?record.connection_id,
                    error = %error,
                    "Statement failed"
                );
            }
            Outcome::Success { rows } if self.is_slow(record.elapsed) => {
                if self.level >= LogLevel::Warn {
                    warn!(
                        kind = %record.kind,
                        statement = %record.statement,
                        args = record.arg_count,
                        elapsed_ms,
                        connection_id = ?record.connection_id,
                        rows = ?rows,
                        "Slow statement"
                    );
                }
            }
            Outcome::Success { rows } if self.level >= LogLevel::Info => {
                info!(
                    kind = %record.kind,
                    statement = %record.statement,
                    args = record.arg_count,
                    elapsed_ms,
                    connection_id = ?record.connection_id,
                    rows = ?rows,
                    "Statement executed"
                );
            }
            _ => {}
        }
    }

    fn on_pool_event(&self, event: &PoolEvent) {
        match event {
            PoolEvent::Opened { connection_id } if self.level >= LogLevel::Debug => {
                debug!(connection_id, "Opened physical connection");
            }
            PoolEvent::Closed {
                connection_id,
                reason,
                age,
                error: Some(error),
            } if self.level >= LogLevel::Warn => {
                warn!(
                    connection_id,
                    reason = %reason,
                    age_ms = age.as_millis() as u64,
                    error = %error,
                    "Physical connection closed with error"
                );
            }
            PoolEvent::Closed {
                connection_id,
                reason: CloseReason::PoolClosed,
                age,
                ..
            } if self.level >= LogLevel::Debug => {
                debug!(
                    connection_id,
                    age_ms = age.as_millis() as u64,
                    "Closed physical connection on shutdown"
                );
            }
            PoolEvent::Closed {
                connection_id,
                reason,
                age,
                ..
            } if *reason != CloseReason::PoolClosed && self.level >= LogLevel::Info => {
                info!(
                    connection_id,
                    reason = %reason,
                    age_ms = age.as_millis() as u64,
                    "Evicted physical connection"
                );
            }
            _ => {}
        }
    }
}
