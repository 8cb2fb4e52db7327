//! Environment-driven configuration
//!
//! Both databases are described by `<PREFIX>_{HOST,PORT,NAME,USER,PASSWORD}`
//! variables. A `.env` file is honoured by the binary through `dotenvy` before
//! anything here is read.

use std::fmt;

use sqlx::postgres::PgConnectOptions;

use crate::error::{MigrationError, Result};

pub const SOURCE_PREFIX: &str = "SOURCE_DB";
pub const DESTINATION_PREFIX: &str = "DESTINATION_DB";

const DEFAULT_HOST: &str = "localhost";
const DEFAULT_PORT: u16 = 5432;
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_SUMMARY_COMMIT_BATCH: usize = 10;
const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// Connection parameters for one Postgres database
#[derive(Clone, PartialEq, Eq)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    pub password: String,
}

impl DbConfig {
    /// Read `<prefix>_HOST` .. `<prefix>_PASSWORD` through `lookup`.
    pub fn from_lookup<F>(prefix: &str, lookup: &F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |suffix: &str| lookup(&format!("{prefix}_{suffix}"));
        let required = |suffix: &str| {
            var(suffix)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| MigrationError::Config(format!("{prefix}_{suffix} is not set")))
        };

        let port = match var("PORT") {
            Some(raw) => raw.trim().parse::<u16>().map_err(|_| {
                MigrationError::Config(format!("{prefix}_PORT is not a valid port: {raw}"))
            })?,
            None => DEFAULT_PORT,
        };

        Ok(Self {
            host: var("HOST").unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port,
            name: required("NAME")?,
            user: required("USER")?,
            password: var("PASSWORD").unwrap_or_default(),
        })
    }

    pub fn connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.name)
            .username(&self.user)
            .password(&self.password)
    }
}

// Keep passwords out of logs.
impl fmt::Debug for DbConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("name", &self.name)
            .field("user", &self.user)
            .field("password", &"***")
            .finish()
    }
}

/// Knobs that change how components behave, not where they connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationOptions {
    /// Run every write, then roll the destination transaction back
    pub dry_run: bool,
    /// Successful summary updates between commits
    pub summary_commit_batch: usize,
    /// Read Schedule B rows from SQL when a report has no snapshot
    pub fuel_supply_sql_fallback: bool,
    pub max_connections: u32,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            summary_commit_batch: DEFAULT_SUMMARY_COMMIT_BATCH,
            fuel_supply_sql_fallback: false,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MigrationConfig {
    pub source: DbConfig,
    pub destination: DbConfig,
    pub log_level: String,
    pub options: MigrationOptions,
}

impl MigrationConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = MigrationOptions::default();

        let summary_commit_batch = match lookup("SUMMARY_COMMIT_BATCH") {
            Some(raw) => match raw.trim().parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => {
                    return Err(MigrationError::Config(format!(
                        "SUMMARY_COMMIT_BATCH must be a positive integer: {raw}"
                    )))
                }
            },
            None => defaults.summary_commit_batch,
        };

        let max_connections = match lookup("DB_MAX_CONNECTIONS") {
            Some(raw) => raw.trim().parse::<u32>().map_err(|_| {
                MigrationError::Config(format!("DB_MAX_CONNECTIONS is not a number: {raw}"))
            })?,
            None => defaults.max_connections,
        };

        Ok(Self {
            source: DbConfig::from_lookup(SOURCE_PREFIX, &lookup)?,
            destination: DbConfig::from_lookup(DESTINATION_PREFIX, &lookup)?,
            log_level: lookup("LOG_LEVEL").unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
            options: MigrationOptions {
                dry_run: false,
                summary_commit_batch,
                fuel_supply_sql_fallback: lookup("FUEL_SUPPLY_SQL_FALLBACK")
                    .map(|v| parse_flag(&v))
                    .unwrap_or(defaults.fuel_supply_sql_fallback),
                max_connections,
            },
        })
    }
}

fn parse_flag(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
