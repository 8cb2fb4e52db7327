//! TFRS → LCFS compliance report migration
//!
//! Moves compliance reports from the legacy TFRS database into the versioned
//! LCFS schema. Each sub-migration is a [`runner::Migrator`]; the
//! [`runner::Runner`] executes them in their fixed dependency order against a
//! read-only source pool and a transactional destination pool.
//!
//! ```rust,no_run
//! use tfrs_lcfs_migration::{Connections, MigrationConfig, MigrationContext, Runner, Selection};
//!
//! # async fn run() -> tfrs_lcfs_migration::Result<()> {
//! let config = MigrationConfig::from_env()?;
//! let connections = Connections::open(&config).await?;
//! let ctx = MigrationContext::new(connections, config.options.clone());
//! let summary = Runner::new(Selection::default()).run(&ctx).await;
//! assert!(!summary.any_failed());
//! # Ok(())
//! # }
//! ```

// Core error handling
pub mod error;

// Environment configuration and database pools
pub mod config;
pub mod db;

// Closed mappings between the TFRS and LCFS vocabularies
pub mod reference;

// Shared engine pieces
pub mod legacy_map;
pub mod stats;
pub mod summary;
pub mod versioning;

// Sub-migrations and their orchestration
pub mod migrators;
pub mod runner;

// Post-run checks
pub mod verify;

pub use config::{MigrationConfig, MigrationOptions};
pub use db::Connections;
pub use error::{MigrationError, Result};
pub use runner::{MigrationContext, Migrator, Runner, Selection, COMPONENT_ORDER};
pub use stats::{ComponentReport, ComponentStats, ComponentStatus, RunSummary};
pub use verify::{verify_destination, VerifyReport, Violation};
