//! Runs the migrators in their fixed dependency order
//!
//! Each component gets the shared [`MigrationContext`], runs inside its own
//! tracing span and reports its counters. A component failure is recorded and
//! the runner moves on to the next one; only configuration and connection
//! errors stop the run.

use std::time::Instant;

use async_trait::async_trait;
use tracing::Instrument;

use crate::config::MigrationOptions;
use crate::db::{self, Connections};
use crate::error::Result;
use crate::migrators;
use crate::stats::{ComponentReport, ComponentStats, ComponentStatus, RunSummary};

/// Everything a migrator needs, passed explicitly
#[derive(Clone)]
pub struct MigrationContext {
    pub connections: Connections,
    pub options: MigrationOptions,
}

impl MigrationContext {
    pub fn new(connections: Connections, options: MigrationOptions) -> Self {
        Self {
            connections,
            options,
        }
    }

    pub fn source(&self) -> &sqlx::PgPool {
        &self.connections.source
    }

    pub fn destination(&self) -> &sqlx::PgPool {
        &self.connections.destination
    }

    pub fn dry_run(&self) -> bool {
        self.options.dry_run
    }
}

/// One sub-migration
#[async_trait]
pub trait Migrator: Send {
    /// Stable component name used in logs, reports and `--only` / `--skip`
    fn name(&self) -> &'static str;

    /// Source tables that must exist before the component may run
    fn required_source_tables(&self) -> &'static [&'static str] {
        &[]
    }

    async fn run(&mut self, ctx: &MigrationContext) -> Result<ComponentStats>;
}

/// Component names in run order.
pub const COMPONENT_ORDER: [&str; 8] = [
    migrators::summary_seed::NAME,
    migrators::summary_update::NAME,
    migrators::report_history::NAME,
    migrators::allocation_agreement::NAME,
    migrators::notional_transfer::NAME,
    migrators::other_uses::NAME,
    migrators::fuel_supply::NAME,
    migrators::orphan_exclusion::NAME,
];

/// Which components to run. The order is never changed by the selection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    pub only: Vec<String>,
    pub skip: Vec<String>,
}

impl Selection {
    /// Reject names that are not components.
    pub fn validate(&self) -> std::result::Result<(), String> {
        for name in self.only.iter().chain(self.skip.iter()) {
            if !COMPONENT_ORDER.contains(&name.as_str()) {
                return Err(format!(
                    "unknown component '{name}', expected one of: {}",
                    COMPONENT_ORDER.join(", ")
                ));
            }
        }
        Ok(())
    }

    pub fn includes(&self, component: &str) -> bool {
        let wanted = self.only.is_empty() || self.only.iter().any(|n| n == component);
        wanted && !self.skip.iter().any(|n| n == component)
    }
}

pub fn default_migrators() -> Vec<Box<dyn Migrator>> {
    vec![
        Box::new(migrators::summary_seed::SummarySeedMigrator::new()),
        Box::new(migrators::summary_update::SummaryUpdateMigrator::new()),
        Box::new(migrators::report_history::ReportHistoryMigrator::new()),
        Box::new(migrators::allocation_agreement::AllocationAgreementMigrator::new()),
        Box::new(migrators::notional_transfer::NotionalTransferMigrator::new()),
        Box::new(migrators::other_uses::OtherUsesMigrator::new()),
        Box::new(migrators::fuel_supply::FuelSupplyMigrator::new()),
        Box::new(migrators::orphan_exclusion::OrphanExclusionMigrator::new()),
    ]
}

pub struct Runner {
    migrators: Vec<Box<dyn Migrator>>,
    selection: Selection,
}

impl Runner {
    pub fn new(selection: Selection) -> Self {
        Self::with_migrators(default_migrators(), selection)
    }

    pub fn with_migrators(migrators: Vec<Box<dyn Migrator>>, selection: Selection) -> Self {
        Self {
            migrators,
            selection,
        }
    }

    pub async fn run(&mut self, ctx: &MigrationContext) -> RunSummary {
        let started = Instant::now();
        let mut components = Vec::with_capacity(self.migrators.len());

        if ctx.dry_run() {
            tracing::warn!("Dry run: no destination change will be committed");
        }

        let mut aborted = false;
        for migrator in self.migrators.iter_mut() {
            let name = migrator.name();
            if aborted || !self.selection.includes(name) {
                components.push(ComponentReport {
                    component: name,
                    status: ComponentStatus::NotRun,
                    stats: ComponentStats::default(),
                    duration_ms: 0,
                });
                continue;
            }

            let span = tracing::info_span!("component", name = name);
            let (report, fatal) = run_component(migrator.as_mut(), ctx).instrument(span).await;
            components.push(report);
            if fatal {
                tracing::error!(component = name, "Run aborted; remaining components not run");
                aborted = true;
            }
        }

        let summary = RunSummary {
            dry_run: ctx.dry_run(),
            components,
            total_duration_ms: started.elapsed().as_millis() as u64,
        };

        for report in &summary.components {
            match &report.status {
                ComponentStatus::Succeeded => tracing::info!(
                    component = report.component,
                    duration_ms = report.duration_ms,
                    "succeeded: {}",
                    report.stats.summary_line()
                ),
                ComponentStatus::Failed { error } => tracing::error!(
                    component = report.component,
                    duration_ms = report.duration_ms,
                    "failed: {error}"
                ),
                ComponentStatus::NotRun => {
                    tracing::debug!(component = report.component, "not selected")
                }
            }
        }
        tracing::info!(
            total_duration_ms = summary.total_duration_ms,
            failed = summary.any_failed(),
            "Migration run finished"
        );

        summary
    }
}

/// Run one component. The flag is set when its error must stop the whole run.
async fn run_component(migrator: &mut dyn Migrator, ctx: &MigrationContext) -> (ComponentReport, bool) {
    let name = migrator.name();
    let started = Instant::now();
    tracing::info!("Starting");

    let result = match db::require_tables(ctx.source(), db::SOURCE, migrator.required_source_tables()).await {
        Ok(()) => migrator.run(ctx).await,
        Err(e) => Err(e),
    };

    let duration_ms = started.elapsed().as_millis() as u64;
    match result {
        Ok(stats) => {
            tracing::info!("Completed: {}", stats.summary_line());
            let report = ComponentReport {
                component: name,
                status: ComponentStatus::Succeeded,
                stats,
                duration_ms,
            };
            (report, false)
        }
        Err(e) => {
            tracing::error!(error = %e, "Component failed");
            let report = ComponentReport {
                component: name,
                status: ComponentStatus::Failed {
                    error: e.to_string(),
                },
                stats: ComponentStats::default(),
                duration_ms,
            };
            (report, e.aborts_run())
        }
    }
}
