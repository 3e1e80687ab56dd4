use std::{env, path::PathBuf, str::FromStr, time::Duration};

use anyhow::Context;
use rearch::{CData, CapsuleHandle, Container};
use sea_orm::{ConnectOptions, Database, DbConn};
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::url_repo;

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_DB_PORT: u16 = 5432;

/// Process-wide settings, read once at startup and passed down explicitly.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub addr: String,
    pub database_url: String,
    pub pool: PoolConfig,
    pub request_timeout: Duration,
    pub static_dir: PathBuf,
}

/// Bounds on the shared database connection pool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub max_lifetime: Duration,
    pub idle_timeout: Duration,
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 20,
            min_connections: 5,
            max_lifetime: Duration::from_secs(60 * 60),
            idle_timeout: Duration::from_secs(30 * 60),
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} is not set (set DB_URL or all of DB_USER, DB_PASSWORD, DB_HOST, DB_NAME)")]
    MissingDatabaseSetting(&'static str),
    #[error("{name} has invalid value {value:?}")]
    InvalidValue { name: &'static str, value: String },
    #[error("DB_MIN_CONNECTIONS ({min}) exceeds DB_MAX_CONNECTIONS ({max})")]
    PoolBounds { min: u32, max: u32 },
}

impl Config {
    /// Reads the configuration from the process environment.
    ///
    /// # Errors
    /// Will return [`Err`] if a required variable is missing or a value does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Reads the configuration through `lookup`, which maps a variable name to its value.
    ///
    /// # Errors
    /// Will return [`Err`] if a required variable is missing or a value does not parse.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let addr = match lookup("ADDR") {
            Some(addr) => addr,
            None => {
                let port = parse_or(&lookup, "APP_PORT", DEFAULT_PORT)?;
                format!("0.0.0.0:{port}")
            }
        };

        let database_url = match lookup("DB_URL") {
            Some(url) => url,
            None => {
                let require = |name: &'static str| {
                    lookup(name).ok_or(ConfigError::MissingDatabaseSetting(name))
                };
                let user = require("DB_USER")?;
                let password = require("DB_PASSWORD")?;
                let host = require("DB_HOST")?;
                let name = require("DB_NAME")?;
                let port = parse_or(&lookup, "DB_PORT", DEFAULT_DB_PORT)?;
                format!("postgres://{user}:{password}@{host}:{port}/{name}")
            }
        };

        let defaults = PoolConfig::default();
        let pool = PoolConfig {
            max_connections: parse_or(&lookup, "DB_MAX_CONNECTIONS", defaults.max_connections)?,
            min_connections: parse_or(&lookup, "DB_MIN_CONNECTIONS", defaults.min_connections)?,
            max_lifetime: secs_or(&lookup, "DB_MAX_LIFETIME_SECS", defaults.max_lifetime)?,
            idle_timeout: secs_or(&lookup, "DB_IDLE_TIMEOUT_SECS", defaults.idle_timeout)?,
            acquire_timeout: secs_or(&lookup, "DB_ACQUIRE_TIMEOUT_SECS", defaults.acquire_timeout)?,
        };
        if pool.min_connections > pool.max_connections {
            return Err(ConfigError::PoolBounds {
                min: pool.min_connections,
                max: pool.max_connections,
            });
        }

        let request_timeout = secs_or(&lookup, "REQUEST_TIMEOUT_SECS", Duration::from_secs(10))?;
        if request_timeout.is_zero() {
            // NOTE: a zero deadline would time out every request
            return Err(ConfigError::InvalidValue {
                name: "REQUEST_TIMEOUT_SECS",
                value: "0".to_owned(),
            });
        }

        Ok(Self {
            addr,
            database_url,
            pool,
            request_timeout,
            static_dir: lookup("STATIC_DIR")
                .map_or_else(|| PathBuf::from("./static"), PathBuf::from),
        })
    }

    #[must_use]
    pub fn connect_options(&self) -> ConnectOptions {
        let mut options = ConnectOptions::new(self.database_url.clone());
        options
            .max_connections(self.pool.max_connections)
            .min_connections(self.pool.min_connections)
            .max_lifetime(self.pool.max_lifetime)
            .idle_timeout(self.pool.idle_timeout)
            .acquire_timeout(self.pool.acquire_timeout);
        options
    }
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    lookup(name).map_or(Ok(default), |value| {
        value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { name, value })
    })
}

fn secs_or(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    parse_or(lookup, name, default.as_secs()).map(Duration::from_secs)
}

/// Connects the pool, applies the schema and wires the capsules.
///
/// # Errors
/// Will return [`Err`] if the connection to the database or the migration fails.
#[instrument(skip(config))]
pub async fn init_container(config: &Config) -> anyhow::Result<Container> {
    info!("Initializing container");
    let container = Container::new();
    let set_db_conn = container.read(db_conn_init_action);

    info!(pool = ?config.pool, "Connecting to database");
    let db = Database::connect(config.connect_options())
        .await
        .context("Failed to connect to database")?;

    if let Err(err) = db.ping().await {
        warn!(?err, "Database unreachable after connecting");
    }
    url_repo::migrate(&db)
        .await
        .context("Failed to apply schema migration")?;

    set_db_conn(db);
    info!("Container initialized");
    Ok(container)
}

fn db_conn_manager(
    CapsuleHandle { register, .. }: CapsuleHandle,
) -> (Option<DbConn>, impl use<> + CData + Fn(Option<DbConn>)) {
    register.register(rearch_effects::state::<rearch_effects::Cloned<_>>(None))
}

pub fn db_conn_init_action(
    CapsuleHandle { mut get, .. }: CapsuleHandle,
) -> impl use<> + CData + Fn(DbConn) {
    let set_db_conn = get.as_ref(db_conn_manager).1.clone();
    move |db| set_db_conn(Some(db))
}

/// # Panics
/// Panics when the [`DbConn`] was not set via [`db_conn_init_action`].
pub fn db_conn_capsule(CapsuleHandle { mut get, .. }: CapsuleHandle) -> DbConn {
    let db_conn = get.as_ref(db_conn_manager).0.clone();
    db_conn.expect("DbConn should've been set via db_conn_init_action!")
}
