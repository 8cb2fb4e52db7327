//! TFRS → LCFS migration CLI
//!
//! Usage:
//!   cargo run --bin tfrs_migrate -- run --dry-run
//!   cargo run --bin tfrs_migrate -- run --only summary-seed --only summary-update
//!   cargo run --bin tfrs_migrate -- run --skip fuel-supply --json
//!   cargo run --bin tfrs_migrate -- verify
//!   cargo run --bin tfrs_migrate -- components
//!
//! Database settings come from `SOURCE_DB_*` / `DESTINATION_DB_*` (a `.env`
//! file is read first). `LOG_LEVEL` sets the tracing filter.

use std::process::ExitCode;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing_subscriber::EnvFilter;

use tfrs_lcfs_migration::{
    verify_destination, ComponentStatus, Connections, MigrationConfig, MigrationContext,
    RunSummary, Runner, Selection, VerifyReport, COMPONENT_ORDER,
};

/// Migrate TFRS compliance reports into the LCFS schema
#[derive(Parser, Debug)]
#[command(name = "tfrs_migrate")]
#[command(about = "Migrate TFRS compliance reports into the LCFS schema")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the migration components in order
    Run(RunArgs),

    /// Check version and legacy-id invariants in the destination
    Verify {
        /// Output the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// List components in run order
    Components,
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Execute everything, then roll the destination back
    #[arg(long, short = 'n')]
    dry_run: bool,

    /// Run only this component (repeatable)
    #[arg(long, value_name = "COMPONENT")]
    only: Vec<String>,

    /// Skip this component (repeatable)
    #[arg(long, value_name = "COMPONENT")]
    skip: Vec<String>,

    /// Output the run summary as JSON
    #[arg(long)]
    json: bool,

    /// Read Schedule B from SQL for reports without a snapshot
    #[arg(long)]
    fuel_supply_sql_fallback: bool,

    /// Summary updates per commit
    #[arg(long, value_name = "N")]
    summary_batch: Option<usize>,
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match execute(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

/// Returns whether the command succeeded.
async fn execute(cli: Cli) -> Result<bool> {
    if let Command::Components = cli.command {
        for (i, name) in COMPONENT_ORDER.iter().enumerate() {
            println!("{:>2}. {}", i + 1, name);
        }
        return Ok(true);
    }

    let mut config = MigrationConfig::from_env().context("Loading configuration")?;
    init_tracing(&config.log_level);

    match cli.command {
        Command::Run(args) => {
            let selection = Selection {
                only: args.only,
                skip: args.skip,
            };
            selection.validate().map_err(|e| anyhow!(e))?;

            config.options.dry_run = args.dry_run;
            if args.fuel_supply_sql_fallback {
                config.options.fuel_supply_sql_fallback = true;
            }
            if let Some(batch) = args.summary_batch {
                if batch == 0 {
                    return Err(anyhow!("--summary-batch must be at least 1"));
                }
                config.options.summary_commit_batch = batch;
            }

            let connections = Connections::open(&config).await?;
            let ctx = MigrationContext::new(connections.clone(), config.options.clone());
            let summary = Runner::new(selection).run(&ctx).await;
            connections.close().await;

            if args.json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print_summary(&summary);
            }
            Ok(!summary.any_failed())
        }
        Command::Verify { json } => {
            let connections = Connections::open(&config).await?;
            let report = verify_destination(&connections.destination).await?;
            connections.close().await;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_verify(&report);
            }
            Ok(report.is_clean())
        }
        Command::Components => Ok(true),
    }
}

fn print_summary(summary: &RunSummary) {
    println!();
    if summary.dry_run {
        println!("{}", "DRY RUN - destination changes were rolled back".yellow().bold());
    }
    println!("{}", "Migration summary".bold());
    println!("{}", "─".repeat(72));

    for report in &summary.components {
        let status = match &report.status {
            ComponentStatus::Succeeded if report.stats.errors > 0 => "WARN".yellow(),
            ComponentStatus::Succeeded => "OK".green(),
            ComponentStatus::Failed { .. } => "FAILED".red().bold(),
            ComponentStatus::NotRun => "SKIP".dimmed(),
        };
        println!(
            "{:<8} {:<24} {:>8}ms  {}",
            status,
            report.component,
            report.duration_ms,
            report.stats.summary_line()
        );
        if let ComponentStatus::Failed { error } = &report.status {
            println!("         {}", error.red());
        }
    }

    let totals = summary.totals();
    println!("{}", "─".repeat(72));
    println!(
        "{:<33} {:>8}ms  {}",
        "total",
        summary.total_duration_ms,
        totals.summary_line()
    );
    if totals.parse_errors > 0 || totals.warnings > 0 {
        println!(
            "  parse errors: {}  defaulted values: {}",
            totals.parse_errors, totals.warnings
        );
    }

    if summary.any_failed() {
        println!("\n{}", "Migration finished with failed components".red().bold());
    } else {
        println!("\n{}", "Migration finished".green().bold());
    }
}

fn print_verify(report: &VerifyReport) {
    println!(
        "Checked {} rows in {} groups, {} reports",
        report.rows_checked, report.groups_checked, report.reports_checked
    );
    if report.is_clean() {
        println!("{}", "No violations".green().bold());
        return;
    }
    println!(
        "{}",
        format!("{} violation(s)", report.violations.len()).red().bold()
    );
    for violation in &report.violations {
        match serde_json::to_string(violation) {
            Ok(line) => println!("  {line}"),
            Err(_) => println!("  {violation:?}"),
        }
    }
}
