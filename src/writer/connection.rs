//! Connection string handling.
//!
//! Accepts either a `postgres://` URL or libpq-style `key=value` pairs.

use crate::error::ConfigError;
use log::LevelFilter;
use sqlx::ConnectOptions;
use sqlx::postgres::{PgConnectOptions, PgSslMode};
use std::str::FromStr;

pub const DEFAULT_CONNECTION: &str = "host=localhost user=postgres sslmode=disable";

/// Build connect options from `conn`, with `db_name` overriding any database
/// named in the string.
pub fn parse_connection(
    conn: &str,
    db_name: Option<&str>,
) -> Result<PgConnectOptions, ConfigError> {
    let conn = conn.trim();
    let options = if conn.starts_with("postgres://") || conn.starts_with("postgresql://") {
        PgConnectOptions::from_str(conn).map_err(|e| ConfigError::Connection(e.to_string()))?
    } else {
        parse_key_value(conn)?
    };

    let options = match db_name {
        Some(name) if !name.trim().is_empty() => options.database(name.trim()),
        _ => options,
    };

    Ok(options.log_statements(LevelFilter::Trace))
}

fn parse_key_value(conn: &str) -> Result<PgConnectOptions, ConfigError> {
    let mut options = PgConnectOptions::new();

    for pair in conn.split_whitespace() {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| ConfigError::Connection(format!("expected key=value, got {pair:?}")))?;
        let value = value.trim_matches('\'');

        options = match key {
            "host" => options.host(value),
            "port" => {
                let port = value
                    .parse::<u16>()
                    .map_err(|_| ConfigError::Connection(format!("invalid port {value:?}")))?;
                options.port(port)
            }
            "user" => options.username(value),
            "password" => options.password(value),
            "dbname" => options.database(value),
            "sslmode" => {
                let mode = PgSslMode::from_str(value)
                    .map_err(|e| ConfigError::Connection(e.to_string()))?;
                options.ssl_mode(mode)
            }
            "application_name" => options.application_name(value),
            other => {
                log::warn!("ignoring unsupported connection parameter {:?}", other);
                options
            }
        };
    }

    Ok(options)
}
