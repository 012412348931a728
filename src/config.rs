//! Configuration handling.
//!
//! A [`DatabaseConfig`] describes exactly one backend. It can be built as a
//! literal, or loaded from a YAML file and/or `DB_*` environment variables
//! through figment, with the environment taking precedence over the file.
//! The command-line arguments of the `dbconn` binary live here as well.

use crate::db::dialect;
use crate::error::{DbError, DbResult};
use clap::{Parser, Subcommand};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::value::{Uncased, UncasedStr};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_PREFIX: &str = "DB_";

// Pool configuration defaults
pub const DEFAULT_MAX_IDLE_CONNS: u32 = 2;
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_SLOW_THRESHOLD: Duration = Duration::from_millis(200);

/// Connection pool limits.
///
/// Zero durations and `max_open_conns = 0` mean "no limit".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolOptions {
    /// Maximum simultaneously open physical connections (0 = unlimited)
    pub max_open_conns: u32,
    /// Maximum idle connections kept warm (default: 2, clamped to max_open_conns)
    pub max_idle_conns: Option<u32>,
    #[serde(with = "humantime_serde", alias = "max_lifetime")]
    pub conn_max_lifetime: Option<Duration>,
    #[serde(with = "humantime_serde", alias = "max_idle_time")]
    pub conn_max_idle_time: Option<Duration>,
    /// How long a call waits for a free slot (default: 30s, 0 = forever)
    #[serde(with = "humantime_serde")]
    pub acquire_timeout: Option<Duration>,
    #[serde(with = "humantime_serde")]
    pub statement_timeout: Option<Duration>,
}

impl PoolOptions {
    /// Get max_open_conns, `None` when unlimited.
    pub fn max_open(&self) -> Option<u32> {
        (self.max_open_conns > 0).then_some(self.max_open_conns)
    }

    /// Get max_idle_conns with its default, never above max_open_conns.
    pub fn max_idle_or_default(&self) -> u32 {
        let idle = self.max_idle_conns.unwrap_or(DEFAULT_MAX_IDLE_CONNS);
        match self.max_open() {
            Some(max_open) => idle.min(max_open),
            None => idle,
        }
    }

    pub fn conn_max_lifetime(&self) -> Option<Duration> {
        self.conn_max_lifetime.filter(|d| !d.is_zero())
    }

    pub fn conn_max_idle_time(&self) -> Option<Duration> {
        self.conn_max_idle_time.filter(|d| !d.is_zero())
    }

    /// Get acquire_timeout with default value, `None` when waiting forever.
    pub fn acquire_timeout_or_default(&self) -> Option<Duration> {
        Some(self.acquire_timeout.unwrap_or(DEFAULT_ACQUIRE_TIMEOUT)).filter(|d| !d.is_zero())
    }

    pub fn statement_timeout(&self) -> Option<Duration> {
        self.statement_timeout.filter(|d| !d.is_zero())
    }
}

/// Verbosity of the default instrumentation sink.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Silent,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
}

/// Everything needed to reach one backend.
///
/// Never mutated after the manager takes ownership of it.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Driver identifier, e.g. "postgres", "mysql", "sqlite"
    pub driver: String,
    pub host: String,
    /// 0 selects the dialect's default port
    pub port: u16,
    pub user: String,
    /// Contains sensitive data - never log
    #[serde(skip_serializing)]
    pub password: String,
    /// Database name, or the file path for SQLite
    #[serde(alias = "name", alias = "database")]
    pub dbname: String,
    pub sslmode: Option<String>,
    /// Extra dialect parameters appended to the target in key order
    pub params: BTreeMap<String, String>,
    pub pool: PoolOptions,
    pub log_level: LogLevel,
    /// Successful calls slower than this are reported as slow (0 disables)
    #[serde(with = "humantime_serde")]
    pub slow_threshold: Option<Duration>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            driver: String::new(),
            host: String::new(),
            port: 0,
            user: String::new(),
            password: String::new(),
            dbname: String::new(),
            sslmode: None,
            params: BTreeMap::new(),
            pool: PoolOptions::default(),
            log_level: LogLevel::default(),
            slow_threshold: Some(DEFAULT_SLOW_THRESHOLD),
        }
    }
}

impl std::fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("driver", &self.driver)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &if self.password.is_empty() { "" } else { "****" })
            .field("dbname", &self.dbname)
            .field("sslmode", &self.sslmode)
            .field("params", &self.params)
            .field("pool", &self.pool)
            .field("log_level", &self.log_level)
            .field("slow_threshold", &self.slow_threshold)
            .finish()
    }
}

impl DatabaseConfig {
    /// Create a configuration for the given driver with all other fields defaulted.
    pub fn new(driver: impl Into<String>) -> Self {
        Self {
            driver: driver.into(),
            ..Self::default()
        }
    }

    /// Load from a YAML file, then apply `DB_*` environment overrides.
    ///
    /// The file may hold the fields at top level or nested under `database:`.
    pub fn load(path: impl AsRef<Path>) -> DbResult<Self> {
        Self::load_from(Some(path.as_ref()), ENV_PREFIX)
    }

    /// Load from `DB_*` environment variables only.
    pub fn from_env() -> DbResult<Self> {
        Self::load_from(None, ENV_PREFIX)
    }

    pub(crate) fn load_from(path: Option<&Path>, env_prefix: &str) -> DbResult<Self> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Some(path) = path {
            if !path.exists() {
                return Err(DbError::invalid_config(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            let file = Figment::from(Yaml::file(path));
            let file = if file.contains("database") {
                file.focus("database")
            } else {
                file
            };
            figment = figment.merge(file);
        }

        figment = figment.merge(Env::prefixed(env_prefix).map(nest_pool_key));

        let config: Self = figment
            .extract()
            .map_err(|e| DbError::invalid_config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration by resolving its connection target.
    ///
    /// An unsupported driver is reported here, before any manager exists.
    pub fn validate(&self) -> DbResult<()> {
        dialect::resolve(self).map(|_| ())
    }

    /// Port to connect to, falling back to the dialect default.
    pub fn port_or_default(&self, default: Option<u16>) -> Option<u16> {
        if self.port > 0 {
            Some(self.port)
        } else {
            default
        }
    }

    pub fn slow_threshold(&self) -> Option<Duration> {
        self.slow_threshold.filter(|d| !d.is_zero())
    }
}

/// Map flat pool variables (`DB_POOL_MAX_OPEN_CONNS`) onto the nested `pool` table.
fn nest_pool_key(key: &UncasedStr) -> Uncased<'_> {
    const POOL: &str = "pool_";
    let raw = key.as_str();
    match raw.get(..POOL.len()) {
        Some(head) if head.eq_ignore_ascii_case(POOL) && raw.len() > POOL.len() => {
            Uncased::from(format!("pool.{}", &raw[POOL.len()..]))
        }
        _ => key.into(),
    }
}

/// Command-line interface of the `dbconn` binary.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "dbconn",
    about = "Open a pooled, verified database connection and run statements through it",
    version
)]
pub struct Cli {
    /// YAML configuration file (DB_* environment variables override it)
    #[arg(short = 'f', long = "config", value_name = "FILE", env = "DB_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log filter (trace, debug, info, warn, error or an EnvFilter directive)
    #[arg(long, default_value = "info", env = "DBCONN_LOG")]
    pub log: String,

    /// Enable JSON logging format
    #[arg(long, env = "DBCONN_JSON_LOGS")]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Open the connection, verify it and report pool statistics
    Ping,
    /// Run a statement that returns rows and print them as JSON lines
    Query {
        sql: String,
        /// Positional parameter; typed as null, bool, int, float or string
        #[arg(short = 'p', long = "param", value_name = "VALUE")]
        params: Vec<String>,
    },
    /// Run a statement that modifies data and print the summary
    Exec {
        sql: String,
        #[arg(short = 'p', long = "param", value_name = "VALUE")]
        params: Vec<String>,
    },
}

impl Cli {
    /// Parse configuration from command line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Resolve the database configuration from the file (if any) and environment.
    pub fn database_config(&self) -> DbResult<DatabaseConfig> {
        match &self.config {
            Some(path) => DatabaseConfig::load(path),
            None => DatabaseConfig::from_env(),
        }
    }
}
