
use common::{write_rentals_csv, FakeService};
use mlharness_core::fixtures::{
    ColumnType, CsvExcerptFixture, DatabaseFixture, DatasourceFixture, TableFixture,
};
use mlharness_core::{
    AdminApiClient, DatasourceSource, FixtureProvisioner, HarnessError, ProvisionOutcome, SqlClient,
};
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;
use tokio::test;

fn sql_client(service: &FakeService) -> SqlClient {
    SqlClient::new(format!("http://{}", service.addr), None, None, Duration::from_secs(2)).unwrap()
}

fn rentals_table(sql: SqlClient, csv: &Path) -> TableFixture {
    TableFixture::new(sql, "test", "home_rentals", csv)
        .with_id_column("id", ColumnType::Int16)
        .column("number_of_rooms", ColumnType::Int8)
        .column("number_of_bathrooms", ColumnType::Int8)
        .column("sqft", ColumnType::Int32)
        .column("location", ColumnType::String)
        .column("days_on_market", ColumnType::Int16)
        .column("initial_price", ColumnType::Int32)
        .column("neighborhood", ColumnType::String)
        .column("rental_price", ColumnType::Int32)
        .batch_size(2)
}

#[test]
async fn test_table_provisioning_is_idempotent() {
    let service = FakeService::start().await;
    let dir = TempDir::new().unwrap();
    let csv = write_rentals_csv(dir.path(), "home_rentals.csv");
    let sql = sql_client(&service);

    let database = DatabaseFixture::new(sql.clone(), "test");
    let table = rentals_table(sql.clone(), &csv);

    let mut provisioner = FixtureProvisioner::new();
    assert_eq!(provisioner.ensure(&database).await.unwrap(), ProvisionOutcome::Created);
    assert_eq!(provisioner.ensure(&table).await.unwrap(), ProvisionOutcome::Created);
    assert_eq!(sql.count_rows("test", "home_rentals").await.unwrap(), 5);

    // Five rows in batches of two
    assert_eq!(service.state.lock().insert_statements, 3);

    // Same run: not even checked again
    let statements = service.state.lock().statements.len();
    assert_eq!(provisioner.ensure(&table).await.unwrap(), ProvisionOutcome::AlreadyPresent);
    assert_eq!(service.state.lock().statements.len(), statements);

    // A later run finds the rows and leaves them alone
    let mut next_run = FixtureProvisioner::new();
    assert_eq!(next_run.ensure(&database).await.unwrap(), ProvisionOutcome::AlreadyPresent);
    assert_eq!(next_run.ensure(&table).await.unwrap(), ProvisionOutcome::AlreadyPresent);
    assert_eq!(sql.count_rows("test", "home_rentals").await.unwrap(), 5);
    assert_eq!(service.state.lock().insert_statements, 3);
    assert_eq!(next_run.ensured(), 2);
}

#[test]
async fn test_partially_loaded_table_is_reloaded_next_run() {
    let service = FakeService::start().await;
    let dir = TempDir::new().unwrap();
    let csv = write_rentals_csv(dir.path(), "home_rentals.csv");
    let sql = sql_client(&service);

    let database = DatabaseFixture::new(sql.clone(), "test");
    let table = rentals_table(sql.clone(), &csv);

    // The store rejects the second batch, after the first one landed
    service.state.lock().fail_insert_at = Some(2);

    let mut provisioner = FixtureProvisioner::new();
    provisioner.ensure(&database).await.unwrap();
    let err = provisioner.ensure(&table).await.unwrap_err();
    assert!(matches!(err, HarnessError::Fixture { .. }), "{:?}", err);
    assert_eq!(sql.count_rows("test", "home_rentals").await.unwrap(), 2);

    service.state.lock().fail_insert_at = None;

    // Two of five rows is not a provisioned table
    let mut next_run = FixtureProvisioner::new();
    assert_eq!(next_run.ensure(&table).await.unwrap(), ProvisionOutcome::Created);
    assert_eq!(sql.count_rows("test", "home_rentals").await.unwrap(), 5);

    let state = service.state.lock();
    let rows = state.table_rows("test.home_rentals");
    assert!(rows[0].starts_with("(1, "), "{}", rows[0]);
    assert!(rows[4].starts_with("(5, "), "{}", rows[4]);
}

#[test]
async fn test_loaded_rows_are_coerced() {
    let service = FakeService::start().await;
    let dir = TempDir::new().unwrap();
    let csv = write_rentals_csv(dir.path(), "home_rentals.csv");
    let sql = sql_client(&service);

    let mut provisioner = FixtureProvisioner::new();
    provisioner.ensure(&DatabaseFixture::new(sql.clone(), "test")).await.unwrap();
    provisioner.ensure(&rentals_table(sql, &csv)).await.unwrap();

    let state = service.state.lock();
    let rows = state.table_rows("test.home_rentals");
    assert_eq!(rows.len(), 5);
    assert_eq!(rows[0], "(1, 0, 1, 484, 'great', 10, 2271, 'south_side', 2271)");
    // Grouped thousands, truncated fraction
    assert_eq!(rows[3], "(4, 2, 1, 1234, 'great', 3, 4333, 'westbrae', 4333)");
    // Decimal comma
    assert_eq!(rows[4], "(5, 3, 2, 1105, 'great', 25, 4405, 'berkeley_hills', 4405)");
}

#[test]
async fn test_table_without_database_fails_as_fixture_error() {
    let service = FakeService::start().await;
    let dir = TempDir::new().unwrap();
    let csv = write_rentals_csv(dir.path(), "home_rentals.csv");

    let table = TableFixture::new(sql_client(&service), "missing_db", "home_rentals", &csv)
        .column("number_of_rooms", ColumnType::Int8);

    let err = FixtureProvisioner::new().ensure(&table).await.unwrap_err();
    match &err {
        HarnessError::Fixture { fixture, .. } => assert_eq!(fixture, "table missing_db.home_rentals"),
        other => panic!("Expected Fixture error, got {:?}", other),
    }
    assert!(err.is_fatal());
}

#[test]
async fn test_bad_cell_is_reported_before_anything_is_created() {
    let service = FakeService::start().await;
    let dir = TempDir::new().unwrap();
    let csv = dir.path().join("bad.csv");
    std::fs::write(&csv, "number_of_rooms,location\n1,good\nlots,great\n").unwrap();

    let table = TableFixture::new(sql_client(&service), "default", "bad", &csv)
        .column("number_of_rooms", ColumnType::Int8)
        .column("location", ColumnType::String);

    let err = FixtureProvisioner::new().ensure(&table).await.unwrap_err();
    assert!(err.to_string().contains("row 2 column number_of_rooms"));
    assert!(!service.state.lock().tables.contains_key("default.bad"));
}

#[test]
async fn test_file_datasource_uploaded_once() {
    let service = FakeService::start().await;
    let dir = TempDir::new().unwrap();
    let training = write_rentals_csv(dir.path(), "home_rentals.csv");
    let excerpt = dir.path().join("test_external.csv");

    let api = AdminApiClient::new(format!("http://{}", service.addr), Duration::from_secs(2)).unwrap();
    let file = CsvExcerptFixture::new(&training, &excerpt, 3);
    let datasource = DatasourceFixture::new(api, "test_external", DatasourceSource::File(excerpt.clone()));

    let mut provisioner = FixtureProvisioner::new();
    assert_eq!(provisioner.ensure(&file).await.unwrap(), ProvisionOutcome::Created);
    assert_eq!(provisioner.ensure(&datasource).await.unwrap(), ProvisionOutcome::Created);

    let written = std::fs::read_to_string(&excerpt).unwrap();
    assert_eq!(written.lines().count(), 4);
    assert_eq!(
        service.state.lock().datasources.get("test_external").map(String::as_str),
        Some("file")
    );

    let mut next_run = FixtureProvisioner::new();
    assert_eq!(next_run.ensure(&file).await.unwrap(), ProvisionOutcome::AlreadyPresent);
    assert_eq!(next_run.ensure(&datasource).await.unwrap(), ProvisionOutcome::AlreadyPresent);
}
