//! Error types for the migration engine
//!
//! The variants follow how a failure propagates: configuration and connection
//! errors abort the run, a missing source table aborts one component, and
//! everything row-level is counted by the component and never surfaces here.

use thiserror::Error;

/// Main error type for the migration engine
#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Cannot connect to {database} database: {source}")]
    Connection {
        database: &'static str,
        #[source]
        source: sqlx::Error,
    },

    #[error("Required {database} table '{table}' does not exist")]
    MissingTable {
        database: &'static str,
        table: String,
    },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] serde_json::Error),

    #[error("Invalid data: {0}")]
    InvalidData(String),
}

impl MigrationError {
    /// Whether this error must stop the whole run rather than a single component.
    pub fn aborts_run(&self) -> bool {
        matches!(
            self,
            MigrationError::Config(_) | MigrationError::Connection { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, MigrationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_config_and_connection_abort_the_run() {
        assert!(MigrationError::Config("SOURCE_DB_NAME".into()).aborts_run());
        assert!(!MigrationError::MissingTable {
            database: "source",
            table: "compliance_report".into(),
        }
        .aborts_run());
        assert!(!MigrationError::InvalidData("bad quantity".into()).aborts_run());
    }

    #[test]
    fn missing_table_message_names_table() {
        let err = MigrationError::MissingTable {
            database: "source",
            table: "compliance_report_snapshot".into(),
        };
        assert_eq!(
            err.to_string(),
            "Required source table 'compliance_report_snapshot' does not exist"
        );
    }
}
