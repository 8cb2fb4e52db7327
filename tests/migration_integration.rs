//! Migration integration tests
//!
//! These run the engine against a real TFRS source database and an LCFS
//! destination database that already has its schema and reference data.
//! The ledger and orphan tests build their own fixtures in a scratch schema
//! on the same servers and drop it afterwards. All are ignored by default:
//!
//!   TEST_SOURCE_DATABASE_URL=postgresql:///tfrs \
//!   TEST_DESTINATION_DATABASE_URL=postgresql:///lcfs \
//!   cargo test --test migration_integration -- --ignored --test-threads=1

use std::str::FromStr;

use anyhow::Result;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use uuid::Uuid;

use tfrs_lcfs_migration::db;
use tfrs_lcfs_migration::summary::record::summary_columns;
use tfrs_lcfs_migration::summary::{available_balance, SummaryContext};
use tfrs_lcfs_migration::verify::VERSIONED_TABLES;
use tfrs_lcfs_migration::{
    verify_destination, ComponentStatus, Connections, MigrationContext, MigrationError,
    MigrationOptions, RunSummary, Runner, Selection,
};

// =========================================================================
// TEST INFRASTRUCTURE
// =========================================================================

fn source_url() -> String {
    std::env::var("TEST_SOURCE_DATABASE_URL").unwrap_or_else(|_| "postgresql:///tfrs".into())
}

fn destination_url() -> String {
    std::env::var("TEST_DESTINATION_DATABASE_URL").unwrap_or_else(|_| "postgresql:///lcfs".into())
}

struct TestDb {
    connections: Connections,
}

impl TestDb {
    async fn new() -> Result<Self> {
        Ok(Self {
            connections: Connections {
                source: PgPool::connect(&source_url()).await?,
                destination: PgPool::connect(&destination_url()).await?,
            },
        })
    }

    fn context(&self, dry_run: bool) -> MigrationContext {
        MigrationContext::new(
            self.connections.clone(),
            MigrationOptions {
                dry_run,
                ..Default::default()
            },
        )
    }

    async fn run(&self, dry_run: bool, selection: Selection) -> RunSummary {
        Runner::new(selection).run(&self.context(dry_run)).await
    }

    async fn count(&self, table: &str) -> Result<i64> {
        let sql = format!("SELECT COUNT(*) FROM {table}");
        let count: i64 = sqlx::query_scalar(&sql)
            .fetch_one(&self.connections.destination)
            .await?;
        Ok(count)
    }

    async fn counts(&self) -> Result<Vec<(&'static str, i64)>> {
        let mut counts = Vec::new();
        for table in VERSIONED_TABLES
            .into_iter()
            .chain(["compliance_report", "compliance_report_summary"])
        {
            counts.push((table, self.count(table).await?));
        }
        Ok(counts)
    }
}

/// A throwaway schema with a pool whose `search_path` points at it, so
/// fixture tables shadow nothing in the real databases.
struct Scratch {
    admin: PgPool,
    pool: PgPool,
    schema: String,
}

impl Scratch {
    async fn new(url: &str, prefix: &str) -> Result<Self> {
        let admin = PgPool::connect(url).await?;
        let schema = format!("{prefix}_{}", &Uuid::new_v4().simple().to_string()[..12]);
        sqlx::query(&format!("CREATE SCHEMA {schema}"))
            .execute(&admin)
            .await?;

        let options = PgConnectOptions::from_str(url)?.options([("search_path", schema.as_str())]);
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await?;
        Ok(Self {
            admin,
            pool,
            schema,
        })
    }

    async fn execute(&self, sql: &str) -> Result<()> {
        sqlx::raw_sql(sql).execute(&self.pool).await?;
        Ok(())
    }

    async fn cleanup(self) -> Result<()> {
        self.pool.close().await;
        sqlx::query(&format!("DROP SCHEMA {} CASCADE", self.schema))
            .execute(&self.admin)
            .await?;
        self.admin.close().await;
        Ok(())
    }
}

fn assert_no_failures(summary: &RunSummary) {
    for report in &summary.components {
        assert!(
            !report.failed(),
            "{} failed: {:?}",
            report.component,
            report.status
        );
    }
}

// =========================================================================
// TESTS
// =========================================================================

#[tokio::test]
#[ignore]
async fn dry_run_leaves_destination_untouched() -> Result<()> {
    let db = TestDb::new().await?;
    let before = db.counts().await?;

    let summary = db.run(true, Selection::default()).await;
    assert!(summary.dry_run);
    assert_no_failures(&summary);

    assert_eq!(db.counts().await?, before);
    Ok(())
}

#[tokio::test]
#[ignore]
async fn second_run_writes_no_schedule_rows() -> Result<()> {
    let db = TestDb::new().await?;

    let first = db.run(false, Selection::default()).await;
    assert_no_failures(&first);
    let after_first = db.counts().await?;

    let second = db.run(false, Selection::default()).await;
    assert_no_failures(&second);
    assert_eq!(db.counts().await?, after_first);

    for component in [
        "summary-seed",
        "allocation-agreements",
        "notional-transfers",
        "other-uses",
        "fuel-supply",
        "orphan-exclusions",
    ] {
        let report = second
            .components
            .iter()
            .find(|r| r.component == component)
            .expect("component reported");
        assert_eq!(report.stats.rows_written, 0, "{component} wrote on re-run");
    }
    Ok(())
}

#[tokio::test]
#[ignore]
async fn migrated_destination_verifies_clean() -> Result<()> {
    let db = TestDb::new().await?;
    let summary = db.run(false, Selection::default()).await;
    assert_no_failures(&summary);

    let report = verify_destination(&db.connections.destination).await?;
    assert!(report.is_clean(), "{:#?}", report.violations);
    Ok(())
}

#[tokio::test]
#[ignore]
async fn only_selected_components_run() -> Result<()> {
    let db = TestDb::new().await?;
    let selection = Selection {
        only: vec!["report-history".into()],
        skip: vec![],
    };
    let summary = db.run(true, selection).await;

    for report in &summary.components {
        if report.component == "report-history" {
            assert_eq!(report.status, ComponentStatus::Succeeded);
        } else {
            assert_eq!(report.status, ComponentStatus::NotRun);
        }
    }
    Ok(())
}

#[tokio::test]
#[ignore]
async fn missing_source_table_is_reported() -> Result<()> {
    let db = TestDb::new().await?;
    let result = db::require_tables(
        &db.connections.source,
        db::SOURCE,
        &["compliance_report", "no_such_table_in_tfrs"],
    )
    .await;

    match result {
        Err(MigrationError::MissingTable { database, table }) => {
            assert_eq!(database, "source");
            assert_eq!(table, "no_such_table_in_tfrs");
        }
        other => panic!("expected MissingTable, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
#[ignore]
async fn report_history_reads_timestamptz_columns() -> Result<()> {
    let db = TestDb::new().await?;

    let column_type: String = sqlx::query_scalar(
        "SELECT data_type FROM information_schema.columns \
         WHERE table_name = 'compliance_report_history' AND column_name = 'create_timestamp' \
         LIMIT 1",
    )
    .fetch_one(&db.connections.source)
    .await?;
    assert_eq!(column_type, "timestamp with time zone");

    let selection = Selection {
        only: vec!["report-history".into()],
        skip: vec![],
    };
    let summary = db.run(true, selection).await;
    let report = summary
        .components
        .iter()
        .find(|r| r.component == "report-history")
        .expect("component reported");

    assert_eq!(report.status, ComponentStatus::Succeeded);
    assert_eq!(report.stats.errors, 0);
    assert!(report.stats.found > 0, "no history rows in source");
    Ok(())
}

const LEDGER_SCHEMA: &str = r#"
CREATE TABLE compliance_report_status (compliance_report_status_id INT PRIMARY KEY, status TEXT NOT NULL);
CREATE TABLE transfer_status (transfer_status_id INT PRIMARY KEY, status TEXT NOT NULL);
CREATE TABLE initiative_agreement_status (initiative_agreement_status_id INT PRIMARY KEY, status TEXT NOT NULL);
CREATE TABLE admin_adjustment_status (admin_adjustment_status_id INT PRIMARY KEY, status TEXT NOT NULL);
CREATE TABLE "transaction" (
    transaction_id INT PRIMARY KEY,
    organization_id INT NOT NULL,
    compliance_units BIGINT NOT NULL,
    transaction_action TEXT NOT NULL,
    create_date TIMESTAMPTZ NOT NULL
);
CREATE TABLE compliance_report (
    compliance_report_id INT PRIMARY KEY,
    transaction_id INT,
    current_status_id INT
);
CREATE TABLE transfer (
    transfer_id INT PRIMARY KEY,
    from_organization_id INT NOT NULL,
    to_organization_id INT NOT NULL,
    quantity BIGINT NOT NULL,
    current_status_id INT NOT NULL,
    transaction_effective_date DATE,
    create_date TIMESTAMPTZ NOT NULL,
    from_transaction_id INT,
    to_transaction_id INT
);
CREATE TABLE initiative_agreement (
    initiative_agreement_id INT PRIMARY KEY,
    to_organization_id INT NOT NULL,
    compliance_units BIGINT NOT NULL,
    current_status_id INT NOT NULL,
    transaction_effective_date DATE
);
CREATE TABLE admin_adjustment (
    admin_adjustment_id INT PRIMARY KEY,
    to_organization_id INT NOT NULL,
    compliance_units BIGINT NOT NULL,
    current_status_id INT NOT NULL,
    transaction_effective_date DATE
);

INSERT INTO compliance_report_status VALUES (1, 'Draft'), (5, 'Assessed');
INSERT INTO transfer_status VALUES (1, 'Sent'), (6, 'Recorded');
INSERT INTO initiative_agreement_status VALUES (1, 'Approved');
INSERT INTO admin_adjustment_status VALUES (1, 'Approved');
"#;

async fn balance_for(pool: &PgPool, organization_id: i32, year: i32) -> Result<i64> {
    let ctx = SummaryContext::for_year(organization_id, year - 2000, year)?;
    Ok(available_balance(pool, &ctx).await?)
}

#[tokio::test]
#[ignore]
async fn balance_counts_transfer_out_by_effective_date() -> Result<()> {
    let scratch = Scratch::new(&destination_url(), "ledger").await?;
    scratch.execute(LEDGER_SCHEMA).await?;
    scratch
        .execute(
            r#"
            INSERT INTO "transaction" VALUES
                (1, 1, 100, 'Adjustment', '2023-06-01 12:00:00+00'),
                (2, 1, -30, 'Adjustment', '2023-12-01 12:00:00+00'),
                (3, 2, 30, 'Adjustment', '2023-12-01 12:00:00+00');
            INSERT INTO compliance_report VALUES (1, 1, 5);
            INSERT INTO transfer VALUES
                (1, 1, 2, 30, 6, '2023-12-01', '2023-11-20 12:00:00+00', 2, 3);
            "#,
        )
        .await?;

    let in_2023 = balance_for(&scratch.pool, 1, 2023).await?;
    let in_2022 = balance_for(&scratch.pool, 1, 2022).await?;
    scratch.cleanup().await?;

    assert_eq!(in_2023, 70);
    assert_eq!(in_2022, 0);
    Ok(())
}

#[tokio::test]
#[ignore]
async fn balance_ignores_transfer_effective_after_period() -> Result<()> {
    let scratch = Scratch::new(&destination_url(), "ledger").await?;
    scratch.execute(LEDGER_SCHEMA).await?;
    scratch
        .execute(
            r#"
            INSERT INTO "transaction" VALUES
                (10, 3, 500, 'Adjustment', '2023-03-01 12:00:00+00'),
                (11, 3, -200, 'Adjustment', '2024-06-01 12:00:00+00'),
                (12, 4, 200, 'Adjustment', '2024-06-01 12:00:00+00');
            INSERT INTO compliance_report VALUES (10, 10, 5);
            INSERT INTO transfer VALUES
                (2, 3, 4, 200, 6, '2024-06-01', '2024-05-15 12:00:00+00', 11, 12);
            "#,
        )
        .await?;

    let in_2023 = balance_for(&scratch.pool, 3, 2023).await?;
    let in_2024 = balance_for(&scratch.pool, 3, 2024).await?;
    scratch.cleanup().await?;

    assert_eq!(in_2023, 500);
    assert_eq!(in_2024, 300);
    Ok(())
}

const ORPHAN_SOURCE_SCHEMA: &str = r#"
CREATE TABLE organization (id INT PRIMARY KEY, name TEXT NOT NULL);
CREATE TABLE compliance_period (id INT PRIMARY KEY, description TEXT NOT NULL);
CREATE TABLE compliance_report_workflow_state (id INT PRIMARY KEY, director_status_id TEXT);
CREATE TABLE compliance_report (
    id INT PRIMARY KEY,
    root_report_id INT,
    traversal INT,
    organization_id INT NOT NULL,
    compliance_period_id INT NOT NULL,
    status_id INT,
    exclusion_agreement_id INT
);
CREATE TABLE organization_address (
    id INT PRIMARY KEY,
    organization_id INT NOT NULL,
    address_line_1 TEXT,
    address_line_2 TEXT,
    address_line_3 TEXT,
    city TEXT,
    state TEXT,
    postal_code TEXT,
    country TEXT,
    effective_date DATE,
    expiration_date DATE
);
CREATE TABLE transaction_type (id INT PRIMARY KEY, the_type TEXT NOT NULL);
CREATE TABLE unit_of_measure (id INT PRIMARY KEY, name TEXT NOT NULL);
CREATE TABLE approved_fuel_type (id INT PRIMARY KEY, name TEXT NOT NULL, unit_of_measure_id INT);
CREATE TABLE compliance_report_exclusion_agreement_record (
    id INT PRIMARY KEY,
    exclusion_agreement_id INT NOT NULL,
    transaction_type_id INT NOT NULL,
    fuel_type_id INT NOT NULL,
    transaction_partner TEXT NOT NULL,
    postal_address TEXT,
    quantity INT NOT NULL,
    quantity_not_sold INT
);

INSERT INTO organization VALUES (3, 'Acme Fuels');
INSERT INTO compliance_period VALUES (13, '2022');
INSERT INTO compliance_report_workflow_state VALUES (70, 'Accepted');
INSERT INTO compliance_report VALUES (500, NULL, 1, 3, 13, 70, 900);
INSERT INTO organization_address VALUES
    (1, 3, '123 Main St', NULL, NULL, 'Victoria', 'BC', 'V8V 1A1', 'Canada', '2019-01-01', NULL);
INSERT INTO transaction_type VALUES (1, 'Purchased'), (2, 'Sold');
INSERT INTO unit_of_measure VALUES (1, 'L');
INSERT INTO approved_fuel_type VALUES (14, 'Petroleum-based gasoline', 1);
INSERT INTO compliance_report_exclusion_agreement_record VALUES
    (1, 900, 2, 14, 'Partner Ltd', '1 Depot Rd', 2500, NULL);
"#;

const ORPHAN_DESTINATION_TYPES: &str = r#"
CREATE TYPE reportingfrequency AS ENUM ('ANNUAL', 'QUARTERLY');
CREATE TYPE actiontypeenum AS ENUM ('CREATE', 'UPDATE', 'DELETE');
CREATE TYPE compliancereportstatusenum AS ENUM (
    'Draft', 'Submitted', 'Recommended_by_analyst', 'Recommended_by_manager', 'Assessed', 'Rejected'
);
CREATE TYPE quantityunitsenum AS ENUM ('Litres', 'Kilograms', 'Kilowatt_hour', 'Cubic_metres');

CREATE TABLE organization (
    organization_id INT PRIMARY KEY,
    name TEXT NOT NULL,
    operating_name TEXT,
    email TEXT,
    phone TEXT
);
CREATE TABLE compliance_period (compliance_period_id INT PRIMARY KEY, description TEXT NOT NULL);
CREATE TABLE compliance_report_status (
    compliance_report_status_id INT PRIMARY KEY,
    status compliancereportstatusenum NOT NULL
);
CREATE TABLE allocation_transaction_type (allocation_transaction_type_id INT PRIMARY KEY, type TEXT NOT NULL);
CREATE TABLE compliance_report (
    compliance_report_id SERIAL PRIMARY KEY,
    compliance_period_id INT NOT NULL,
    organization_id INT NOT NULL,
    current_status_id INT NOT NULL,
    reporting_frequency reportingfrequency NOT NULL,
    compliance_report_group_uuid VARCHAR(36) NOT NULL,
    version INT NOT NULL,
    legacy_id INT,
    nickname TEXT,
    create_user TEXT,
    update_user TEXT
);
CREATE TABLE compliance_report_organization_snapshot (
    compliance_report_organization_snapshot_id SERIAL PRIMARY KEY,
    compliance_report_id INT NOT NULL,
    name TEXT NOT NULL,
    operating_name TEXT,
    email TEXT,
    phone TEXT,
    service_address TEXT,
    head_office_address TEXT,
    records_address TEXT,
    is_edited BOOLEAN NOT NULL,
    create_user TEXT,
    update_user TEXT
);
CREATE TABLE allocation_agreement (
    allocation_agreement_id SERIAL PRIMARY KEY,
    compliance_report_id INT NOT NULL,
    transaction_partner TEXT NOT NULL,
    postal_address TEXT,
    allocation_transaction_type_id INT,
    fuel_type_id INT,
    fuel_category_id INT,
    quantity DOUBLE PRECISION,
    quantity_not_sold DOUBLE PRECISION,
    units quantityunitsenum,
    group_uuid VARCHAR(36) NOT NULL,
    version INT NOT NULL,
    action_type actiontypeenum NOT NULL,
    create_user TEXT,
    update_user TEXT
);

INSERT INTO organization VALUES (31, 'Acme Fuels', 'Acme', 'ops@acme.test', '250-555-0100');
INSERT INTO compliance_period VALUES (14, '2022');
INSERT INTO compliance_report_status VALUES
    (1, 'Draft'), (2, 'Submitted'), (3, 'Recommended_by_analyst'),
    (4, 'Recommended_by_manager'), (5, 'Assessed'), (6, 'Rejected');
INSERT INTO allocation_transaction_type VALUES (1, 'Allocated from'), (2, 'Allocated to');
"#;

fn summary_table_sql() -> String {
    let columns: Vec<String> = summary_columns()
        .into_iter()
        .map(|column| format!("{column} DOUBLE PRECISION"))
        .collect();
    format!(
        "CREATE TABLE compliance_report_summary (\
         compliance_report_summary_id SERIAL PRIMARY KEY, \
         compliance_report_id INT NOT NULL, is_locked BOOLEAN NOT NULL, {})",
        columns.join(", ")
    )
}

#[tokio::test]
#[ignore]
async fn orphan_exclusion_report_is_created_assessed() -> Result<()> {
    let source = Scratch::new(&source_url(), "orphan_src").await?;
    let destination = Scratch::new(&destination_url(), "orphan_dst").await?;
    source.execute(ORPHAN_SOURCE_SCHEMA).await?;
    destination.execute(ORPHAN_DESTINATION_TYPES).await?;
    destination.execute(&summary_table_sql()).await?;

    let ctx = MigrationContext::new(
        Connections {
            source: source.pool.clone(),
            destination: destination.pool.clone(),
        },
        MigrationOptions::default(),
    );
    let selection = Selection {
        only: vec!["orphan-exclusions".into()],
        skip: vec![],
    };
    let summary = Runner::new(selection).run(&ctx).await;
    assert_no_failures(&summary);

    let report: (i32, i32, i32, i32, String) = sqlx::query_as(
        r#"
        SELECT cr.compliance_report_id, cr.legacy_id, cr.version, cr.organization_id,
               crs.status::text
        FROM compliance_report cr
        JOIN compliance_report_status crs
          ON crs.compliance_report_status_id = cr.current_status_id
        "#,
    )
    .fetch_one(&destination.pool)
    .await?;
    let (report_id, legacy_id, version, organization_id, status) = report;
    assert_eq!(legacy_id, 500);
    assert_eq!(version, 0);
    assert_eq!(organization_id, 31);
    assert_eq!(status, "Assessed");

    let allocations: Vec<(String, i32, String, f64)> = sqlx::query_as(
        "SELECT action_type::text, version, transaction_partner, quantity \
         FROM allocation_agreement WHERE compliance_report_id = $1",
    )
    .bind(report_id)
    .fetch_all(&destination.pool)
    .await?;
    assert_eq!(
        allocations,
        vec![("CREATE".to_string(), 0, "Partner Ltd".to_string(), 2500.0)]
    );

    let snapshot: (String, String, Option<String>) = sqlx::query_as(
        "SELECT name, operating_name, service_address \
         FROM compliance_report_organization_snapshot WHERE compliance_report_id = $1",
    )
    .bind(report_id)
    .fetch_one(&destination.pool)
    .await?;
    assert_eq!(snapshot.0, "Acme Fuels");
    assert_eq!(snapshot.1, "Acme");
    assert!(snapshot
        .2
        .as_deref()
        .is_some_and(|address| address.contains("Victoria")));

    let summaries: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM compliance_report_summary WHERE compliance_report_id = $1",
    )
    .bind(report_id)
    .fetch_one(&destination.pool)
    .await?;
    assert_eq!(summaries, 1);

    source.cleanup().await?;
    destination.cleanup().await?;
    Ok(())
}
