//! Instrumentation records.
//!
//! A [`QueryRecord`] is produced for every query/execute call and a
//! [`PoolEvent`] for every physical connection opened or closed. Both are
//! handed to an `InstrumentSink` and not retained afterwards.

use serde::Serialize;
use std::time::Duration;

/// Which surface produced a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    Query,
    Execute,
}

impl CallKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::Execute => "execute",
        }
    }
}

impl std::fmt::Display for CallKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum Outcome {
    /// `rows` is the number of rows returned (query) or affected (execute),
    /// when known.
    Success { rows: Option<u64> },
    Failure { error: String },
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// One instrumentation event per query/execute call.
#[derive(Debug, Clone, Serialize)]
pub struct QueryRecord {
    pub kind: CallKind,
    pub statement: String,
    pub arg_count: usize,
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
    /// Physical connection used, absent when the call never acquired one
    pub connection_id: Option<u64>,
    pub outcome: Outcome,
}

/// Why a physical connection was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// Returned to a pool already holding max-idle connections
    MaxIdleExceeded,
    LifetimeExpired,
    IdleTimeout,
    /// The connection reported a transport-level failure or timed out mid-statement
    Broken,
    PoolClosed,
    /// Dropped without release where no runtime was left to close it
    Abandoned,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MaxIdleExceeded => "max_idle_exceeded",
            Self::LifetimeExpired => "lifetime_expired",
            Self::IdleTimeout => "idle_timeout",
            Self::Broken => "broken",
            Self::PoolClosed => "pool_closed",
            Self::Abandoned => "abandoned",
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum PoolEvent {
    Opened {
        connection_id: u64,
    },
    Closed {
        connection_id: u64,
        reason: CloseReason,
        #[serde(with = "humantime_serde")]
        age: Duration,
        /// Error reported while closing, if any
        error: Option<String>,
    },
}

impl PoolEvent {
    pub fn connection_id(&self) -> u64 {
        match self {
            Self::Opened { connection_id } | Self::Closed { connection_id, .. } => *connection_id,
        }
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        match self {
            Self::Closed { reason, .. } => Some(*reason),
            Self::Opened { .. } => None,
        }
    }
}
