//! Connection management for the source (TFRS) and destination (LCFS) databases.

use sqlx::postgres::{PgArguments, PgPoolOptions};
use sqlx::query::Query;
use sqlx::{Connection, PgPool, Postgres, Transaction};

use crate::config::MigrationConfig;
use crate::error::{MigrationError, Result};

pub const SOURCE: &str = "source";
pub const DESTINATION: &str = "destination";

/// The two pools a run works with. Source sessions are read-only.
#[derive(Clone)]
pub struct Connections {
    pub source: PgPool,
    pub destination: PgPool,
}

impl Connections {
    pub async fn open(config: &MigrationConfig) -> Result<Self> {
        let max = config.options.max_connections.max(1);

        let source_options = config
            .source
            .connect_options()
            .options([("default_transaction_read_only", "on")]);
        let source = PgPoolOptions::new()
            .max_connections(max)
            .connect_with(source_options)
            .await
            .map_err(|source| MigrationError::Connection {
                database: SOURCE,
                source,
            })?;

        let destination = PgPoolOptions::new()
            .max_connections(max)
            .connect_with(config.destination.connect_options())
            .await
            .map_err(|source| MigrationError::Connection {
                database: DESTINATION,
                source,
            })?;

        tracing::info!(
            source = %config.source.name,
            destination = %config.destination.name,
            "Connected to source and destination databases"
        );

        Ok(Self {
            source,
            destination,
        })
    }

    pub async fn close(&self) {
        self.source.close().await;
        self.destination.close().await;
    }
}

pub async fn table_exists(pool: &PgPool, table: &str) -> Result<bool> {
    let exists: bool = sqlx::query_scalar("SELECT to_regclass($1) IS NOT NULL")
        .bind(table)
        .fetch_one(pool)
        .await?;
    Ok(exists)
}

/// Fail with `MissingTable` for the first table that is not present.
pub async fn require_tables(pool: &PgPool, database: &'static str, tables: &[&str]) -> Result<()> {
    for table in tables {
        if !table_exists(pool, table).await? {
            return Err(MigrationError::MissingTable {
                database,
                table: (*table).to_string(),
            });
        }
    }
    Ok(())
}

/// Execute one statement inside a savepoint of `tx`.
///
/// A failing statement rolls back to the savepoint only, so the surrounding
/// transaction stays usable and the caller can count the error and move on.
pub async fn execute_in_savepoint<'q>(
    tx: &mut Transaction<'_, Postgres>,
    query: Query<'q, Postgres, PgArguments>,
) -> Result<u64> {
    let mut savepoint = tx.begin().await?;
    match query.execute(&mut *savepoint).await {
        Ok(done) => {
            savepoint.commit().await?;
            Ok(done.rows_affected())
        }
        Err(e) => {
            savepoint.rollback().await?;
            Err(e.into())
        }
    }
}

/// Commit, or roll back when the run is a dry run.
pub async fn finish(tx: Transaction<'_, Postgres>, dry_run: bool) -> Result<()> {
    if dry_run {
        tx.rollback().await?;
        tracing::info!("Dry run: destination changes rolled back");
    } else {
        tx.commit().await?;
    }
    Ok(())
}
