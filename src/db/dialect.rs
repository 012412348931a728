//! Dialect resolution.
//!
//! Maps a [`DatabaseConfig`] to the connection target its dialect expects.
//! Resolution is pure: the same configuration always yields the same target,
//! and nothing here touches the network.
//!
//! Target shapes (fields in order host, port, user, password, database, then
//! dialect extras):
//!
//! ```text
//! postgres://{user}:{password}@{host}:{port}/{dbname}?sslmode=..&k=v
//! mysql://{user}:{password}@{host}:{port}/{dbname}?ssl-mode=..&k=v
//! sqlite://{path}?k=v          (or sqlite::memory:)
//! ```

use crate::config::DatabaseConfig;
use crate::error::{DbError, DbResult};
use crate::models::Dialect;
use url::Url;

const MASK: &str = "****";
const SQLITE_MEMORY: &str = ":memory:";

/// A resolved, dialect-specific connection address.
///
/// `Display` and `Debug` mask the password; use [`ConnectionTarget::expose`]
/// only to hand the address to a driver.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionTarget {
    dialect: Dialect,
    url: String,
    masked: String,
    /// Raw and percent-encoded password, longest first
    secrets: Vec<String>,
}

impl ConnectionTarget {
    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// The full address including credentials. Never log this value.
    pub fn expose(&self) -> &str {
        &self.url
    }

    /// True for a private SQLite database that lives only in memory.
    pub fn is_sqlite_memory(&self) -> bool {
        self.dialect == Dialect::Sqlite
            && self
                .url
                .strip_prefix("sqlite:")
                .is_some_and(|rest| rest.starts_with(SQLITE_MEMORY))
    }

    /// The address with the password replaced by `****`.
    pub fn masked(&self) -> &str {
        &self.masked
    }

    /// Scrub every occurrence of the password from `text`.
    pub fn redact(&self, text: &str) -> String {
        let mut out = text.replace(&self.url, &self.masked);
        for secret in &self.secrets {
            out = out.replace(secret.as_str(), MASK);
        }
        out
    }
}

impl std::fmt::Display for ConnectionTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.masked)
    }
}

impl std::fmt::Debug for ConnectionTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionTarget")
            .field("dialect", &self.dialect)
            .field("url", &self.masked)
            .finish()
    }
}

/// Resolve a configuration into its connection target.
///
/// Unknown driver identifiers fail with [`DbError::UnsupportedDriver`];
/// missing required fields fail with [`DbError::InvalidConfig`].
pub fn resolve(config: &DatabaseConfig) -> DbResult<ConnectionTarget> {
    let dialect = Dialect::from_driver(&config.driver)
        .ok_or_else(|| DbError::unsupported_driver(config.driver.trim()))?;

    match dialect {
        Dialect::Postgres => network_target(dialect, "postgres", "sslmode", config),
        Dialect::MySql => network_target(dialect, "mysql", "ssl-mode", config),
        Dialect::Sqlite => sqlite_target(config),
    }
}

fn network_target(
    dialect: Dialect,
    scheme: &str,
    ssl_key: &str,
    config: &DatabaseConfig,
) -> DbResult<ConnectionTarget> {
    let host = config.host.trim();
    if host.is_empty() {
        return Err(DbError::invalid_config(format!(
            "host is required for {}",
            dialect
        )));
    }

    let mut extras: Vec<(&str, &str)> = Vec::with_capacity(config.params.len() + 1);
    if let Some(mode) = config.sslmode.as_deref().filter(|m| !m.is_empty()) {
        extras.push((ssl_key, mode));
    }
    extras.extend(config.params.iter().map(|(k, v)| (k.as_str(), v.as_str())));

    let port = config.port_or_default(dialect.default_port());
    let url = build_network_url(scheme, host, port, config, &config.password, &extras)?;
    let masked = if config.password.is_empty() {
        url.clone()
    } else {
        build_network_url(scheme, host, port, config, MASK, &extras)?
    };

    let mut secrets = Vec::new();
    if !config.password.is_empty() {
        let encoded = encoded_password(&url);
        if let Some(encoded) = encoded.filter(|e| e != &config.password) {
            secrets.push(encoded);
        }
        secrets.push(config.password.clone());
        secrets.sort_by_key(|s| std::cmp::Reverse(s.len()));
    }

    Ok(ConnectionTarget {
        dialect,
        url,
        masked,
        secrets,
    })
}

fn build_network_url(
    scheme: &str,
    host: &str,
    port: Option<u16>,
    config: &DatabaseConfig,
    password: &str,
    extras: &[(&str, &str)],
) -> DbResult<String> {
    let invalid = |what: &str| DbError::invalid_config(format!("invalid {}: {}", what, host));

    let mut url = Url::parse(&format!("{}://localhost", scheme))
        .map_err(|e| DbError::invalid_config(e.to_string()))?;

    // IPv6 literals must be bracketed
    let host = if host.contains(':') && !host.starts_with('[') {
        format!("[{}]", host)
    } else {
        host.to_string()
    };
    url.set_host(Some(&host)).map_err(|_| invalid("host"))?;
    url.set_port(port).map_err(|_| invalid("port"))?;

    if !config.user.is_empty() {
        url.set_username(&config.user).map_err(|_| invalid("user"))?;
        if !password.is_empty() {
            url.set_password(Some(password))
                .map_err(|_| invalid("password"))?;
        }
    }

    let dbname = config.dbname.trim();
    if !dbname.is_empty() {
        url.set_path(&format!("/{}", dbname));
    }

    if !extras.is_empty() {
        url.query_pairs_mut().extend_pairs(extras.iter().copied());
    }

    Ok(url.to_string())
}

fn encoded_password(url: &str) -> Option<String> {
    Url::parse(url)
        .ok()
        .and_then(|u| u.password().map(String::from))
}

fn sqlite_target(config: &DatabaseConfig) -> DbResult<ConnectionTarget> {
    let path = config.dbname.trim();
    if path.is_empty() {
        return Err(DbError::invalid_config(
            "dbname (the database file path) is required for SQLite",
        ));
    }

    let mut url = if path == SQLITE_MEMORY {
        format!("sqlite:{}", SQLITE_MEMORY)
    } else {
        format!("sqlite://{}", path)
    };

    if !config.params.is_empty() {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(config.params.iter())
            .finish();
        url.push('?');
        url.push_str(&query);
    }

    Ok(ConnectionTarget {
        dialect: Dialect::Sqlite,
        masked: url.clone(),
        url,
        secrets: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn postgres_config() -> DatabaseConfig {
        DatabaseConfig {
            host: "h".to_string(),
            port: 5432,
            user: "u".to_string(),
            password: "p".to_string(),
            dbname: "d".to_string(),
            ..DatabaseConfig::new("postgres")
        }
    }

    #[test]
    fn test_postgres_scenario() {
        let target = resolve(&postgres_config()).unwrap();
        assert_eq!(target.dialect(), Dialect::Postgres);
        assert_eq!(target.expose(), "postgres://u:p@h:5432/d");
        assert_eq!(target.to_string(), "postgres://u:****@h:5432/d");
    }

    #[test]
    fn test_resolve_is_deterministic() {
        let mut mysql = postgres_config();
        mysql.driver = "mysql".to_string();
        let mut sqlite = postgres_config();
        sqlite.driver = "sqlite3".to_string();

        for config in [postgres_config(), mysql, sqlite] {
            let a = resolve(&config).unwrap();
            let b = resolve(&config.clone()).unwrap();
            assert_eq!(a, b);
            assert_eq!(a.expose(), b.expose());
        }
    }

    #[test]
    fn test_default_ports() {
        let config = DatabaseConfig {
            port: 0,
            ..postgres_config()
        };
        assert_eq!(resolve(&config).unwrap().expose(), "postgres://u:p@h:5432/d");

        let config = DatabaseConfig {
            driver: "mariadb".to_string(),
            port: 0,
            ..postgres_config()
        };
        let target = resolve(&config).unwrap();
        assert_eq!(target.dialect(), Dialect::MySql);
        assert_eq!(target.expose(), "mysql://u:p@h:3306/d");
    }

    #[test]
    fn test_extras_follow_fields_in_order() {
        let mut config = postgres_config();
        config.sslmode = Some("disable".to_string());
        config
            .params
            .insert("connect_timeout".to_string(), "5".to_string());
        config
            .params
            .insert("application_name".to_string(), "svc".to_string());
        assert_eq!(
            resolve(&config).unwrap().expose(),
            "postgres://u:p@h:5432/d?sslmode=disable&application_name=svc&connect_timeout=5"
        );

        config.driver = "mysql".to_string();
        config.port = 3306;
        config.params.clear();
        assert_eq!(
            resolve(&config).unwrap().expose(),
            "mysql://u:p@h:3306/d?ssl-mode=disable"
        );
    }

    #[test]
    fn test_credentials_are_percent_encoded() {
        let config = DatabaseConfig {
            user: "app user".to_string(),
            password: "p@ss:w/rd".to_string(),
            ..postgres_config()
        };
        let target = resolve(&config).unwrap();
        assert_eq!(
            target.expose(),
            "postgres://app%20user:p%40ss%3Aw%2Frd@h:5432/d"
        );
        assert!(!target.to_string().contains("p%40ss"));
        assert!(!format!("{:?}", target).contains("p%40ss"));
    }

    #[test]
    fn test_empty_password_and_user() {
        let config = DatabaseConfig {
            password: String::new(),
            ..postgres_config()
        };
        assert_eq!(resolve(&config).unwrap().expose(), "postgres://u@h:5432/d");

        let config = DatabaseConfig {
            user: String::new(),
            password: String::new(),
            ..postgres_config()
        };
        assert_eq!(resolve(&config).unwrap().expose(), "postgres://h:5432/d");
    }

    #[test]
    fn test_ipv6_host() {
        let config = DatabaseConfig {
            host: "::1".to_string(),
            ..postgres_config()
        };
        assert_eq!(
            resolve(&config).unwrap().expose(),
            "postgres://u:p@[::1]:5432/d"
        );
    }

    #[test]
    fn test_sqlite_targets() {
        let mut config = DatabaseConfig {
            dbname: "/var/lib/app/data.db".to_string(),
            // Network fields are ignored
            host: "ignored".to_string(),
            password: "ignored".to_string(),
            ..DatabaseConfig::new("sqlite")
        };
        assert_eq!(
            resolve(&config).unwrap().expose(),
            "sqlite:///var/lib/app/data.db"
        );

        config.params.insert("mode".to_string(), "rwc".to_string());
        assert_eq!(
            resolve(&config).unwrap().expose(),
            "sqlite:///var/lib/app/data.db?mode=rwc"
        );

        let config = DatabaseConfig {
            dbname: ":memory:".to_string(),
            ..DatabaseConfig::new("sqlite3")
        };
        let target = resolve(&config).unwrap();
        assert_eq!(target.expose(), "sqlite::memory:");
        assert!(target.is_sqlite_memory());
    }

    #[test]
    fn test_unsupported_driver() {
        for driver in ["oracle", "mssql", ""] {
            let config = DatabaseConfig {
                driver: driver.to_string(),
                ..postgres_config()
            };
            match resolve(&config) {
                Err(DbError::UnsupportedDriver { driver: d }) => assert_eq!(d, driver),
                other => panic!("expected UnsupportedDriver, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_missing_required_fields() {
        let config = DatabaseConfig {
            host: "  ".to_string(),
            ..postgres_config()
        };
        assert!(matches!(
            resolve(&config),
            Err(DbError::InvalidConfig { .. })
        ));

        let config = DatabaseConfig::new("sqlite");
        assert!(matches!(
            resolve(&config),
            Err(DbError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_redact_scrubs_raw_and_encoded_password() {
        let config = DatabaseConfig {
            password: "top secret".to_string(),
            ..postgres_config()
        };
        let target = resolve(&config).unwrap();
        let message = format!(
            "auth failed for 'top secret' via {} (top%20secret)",
            target.expose()
        );
        let redacted = target.redact(&message);
        assert!(!redacted.contains("top secret"));
        assert!(!redacted.contains("top%20secret"));
        assert!(redacted.contains("postgres://u:****@h:5432/d"));
    }
}
