//! Idempotent provisioning of external test state
//!
//! A [`Fixture`] knows how to check whether it already exists and how to
//! create itself. The [`FixtureProvisioner`] only runs the creation recipe
//! when the existence check says the resource is absent, so provisioning can
//! be repeated across runs without duplicating rows.

use async_trait::async_trait;
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::api::{AdminApiClient, DatasourceSource};
use crate::error::{HarnessError, HarnessResult};
use crate::sql::{quote, SqlClient};

/// A named external resource with an existence check and a creation recipe
#[async_trait]
pub trait Fixture: Send + Sync {
    fn name(&self) -> String;

    async fn exists(&self) -> HarnessResult<bool>;

    /// Create the resource; only called when `exists` returned false
    async fn create(&self) -> HarnessResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionOutcome {
    Created,
    AlreadyPresent,
}

/// Ensures fixtures exist, remembering which ones this run already handled
#[derive(Debug, Default)]
pub struct FixtureProvisioner {
    ensured: HashSet<String>,
}

impl FixtureProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn ensure(&mut self, fixture: &dyn Fixture) -> HarnessResult<ProvisionOutcome> {
        let name = fixture.name();

        if self.ensured.contains(&name) {
            debug!(fixture = %name, "fixture already ensured in this run");
            return Ok(ProvisionOutcome::AlreadyPresent);
        }

        let present = fixture.exists().await.map_err(|e| wrap(&name, e))?;
        let outcome = if present {
            info!("📦 Fixture {} already present", name);
            ProvisionOutcome::AlreadyPresent
        } else {
            info!("📦 Creating fixture {}", name);
            fixture.create().await.map_err(|e| wrap(&name, e))?;
            ProvisionOutcome::Created
        };

        self.ensured.insert(name);
        Ok(outcome)
    }

    pub fn ensured(&self) -> usize {
        self.ensured.len()
    }
}

fn wrap(name: &str, err: HarnessError) -> HarnessError {
    match err {
        HarnessError::Fixture { .. } => err,
        other => HarnessError::fixture(name, other.to_string()),
    }
}

/// A database in the SQL datastore
pub struct DatabaseFixture {
    sql: SqlClient,
    database: String,
}

impl DatabaseFixture {
    pub fn new(sql: SqlClient, database: impl Into<String>) -> Self {
        Self {
            sql,
            database: database.into(),
        }
    }
}

#[async_trait]
impl Fixture for DatabaseFixture {
    fn name(&self) -> String {
        format!("database {}", self.database)
    }

    async fn exists(&self) -> HarnessResult<bool> {
        Ok(self.sql.show_databases().await?.contains(&self.database))
    }

    async fn create(&self) -> HarnessResult<()> {
        self.sql
            .execute(&format!("create database if not exists {}", self.database))
            .await
    }
}

/// Column types the bulk loader can coerce CSV text into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Int8,
    Int16,
    Int32,
    Int64,
    Float64,
    String,
}

impl ColumnType {
    fn integer_range(self) -> Option<(i64, i64)> {
        match self {
            ColumnType::Int8 => Some((i8::MIN as i64, i8::MAX as i64)),
            ColumnType::Int16 => Some((i16::MIN as i64, i16::MAX as i64)),
            ColumnType::Int32 => Some((i32::MIN as i64, i32::MAX as i64)),
            ColumnType::Int64 => Some((i64::MIN, i64::MAX)),
            ColumnType::Float64 | ColumnType::String => None,
        }
    }

    /// Render one CSV cell as a SQL literal of this type
    pub fn literal(self, raw: &str) -> Result<String, String> {
        if let Some((min, max)) = self.integer_range() {
            let value = parse_integer(raw).ok_or_else(|| format!("'{}' is not a number", raw))?;
            if value < min || value > max {
                return Err(format!("{} does not fit {}", value, self));
            }
            return Ok(value.to_string());
        }

        match self {
            ColumnType::Float64 => parse_float(raw)
                .map(|v| v.to_string())
                .ok_or_else(|| format!("'{}' is not a number", raw)),
            _ => Ok(quote(raw)),
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ColumnType::Int8 => "Int8",
            ColumnType::Int16 => "Int16",
            ColumnType::Int32 => "Int32",
            ColumnType::Int64 => "Int64",
            ColumnType::Float64 => "Float64",
            ColumnType::String => "String",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub column_type: ColumnType,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }
}

/// A table created from a schema and bulk loaded from a CSV file.
///
/// CSV columns map onto `columns` by position; the header row is skipped.
/// When an id column is set it is prepended and filled with the 1-based
/// row number.
pub struct TableFixture {
    sql: SqlClient,
    database: String,
    table: String,
    id_column: Option<ColumnDef>,
    columns: Vec<ColumnDef>,
    engine: String,
    source: PathBuf,
    batch_size: usize,
}

impl TableFixture {
    pub fn new(
        sql: SqlClient,
        database: impl Into<String>,
        table: impl Into<String>,
        source: impl Into<PathBuf>,
    ) -> Self {
        Self {
            sql,
            database: database.into(),
            table: table.into(),
            id_column: None,
            columns: Vec::new(),
            engine: "Memory".to_string(),
            source: source.into(),
            batch_size: 500,
        }
    }

    pub fn with_id_column(mut self, name: impl Into<String>, column_type: ColumnType) -> Self {
        self.id_column = Some(ColumnDef::new(name, column_type));
        self
    }

    pub fn column(mut self, name: impl Into<String>, column_type: ColumnType) -> Self {
        self.columns.push(ColumnDef::new(name, column_type));
        self
    }

    /// Engine clause including ordering/partitioning, e.g. `MergeTree() ORDER BY id`
    pub fn engine(mut self, engine: impl Into<String>) -> Self {
        self.engine = engine.into();
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.database, self.table)
    }

    pub fn create_statement(&self) -> String {
        let columns: Vec<String> = self
            .id_column
            .iter()
            .chain(self.columns.iter())
            .map(|c| format!("{} {}", c.name, c.column_type))
            .collect();

        format!(
            "CREATE TABLE IF NOT EXISTS {} ({}) ENGINE = {}",
            self.qualified_name(),
            columns.join(", "),
            self.engine
        )
    }

    pub fn truncate_statement(&self) -> String {
        format!("TRUNCATE TABLE IF EXISTS {}", self.qualified_name())
    }

    /// Number of data records in the source file
    pub fn source_rows(&self) -> HarnessResult<u64> {
        let mut reader = csv::Reader::from_path(&self.source)?;
        let mut count = 0;
        for record in reader.records() {
            record?;
            count += 1;
        }
        Ok(count)
    }

    /// Coerce every CSV row into a `(v1, v2, ...)` value tuple
    pub fn value_rows(&self) -> HarnessResult<Vec<String>> {
        let mut reader = csv::Reader::from_path(&self.source)?;
        let mut rows = Vec::new();

        for (index, record) in reader.records().enumerate() {
            let record = record?;
            let row_number = index + 1;

            if record.len() < self.columns.len() {
                return Err(HarnessError::fixture(
                    self.qualified_name(),
                    format!(
                        "row {} has {} columns, expected {}",
                        row_number,
                        record.len(),
                        self.columns.len()
                    ),
                ));
            }

            let mut values = Vec::with_capacity(self.columns.len() + 1);
            if let Some(id) = &self.id_column {
                values.push(self.literal(id, row_number, &row_number.to_string())?);
            }
            for (column, raw) in self.columns.iter().zip(record.iter()) {
                values.push(self.literal(column, row_number, raw)?);
            }

            rows.push(format!("({})", values.join(", ")));
        }

        Ok(rows)
    }

    fn literal(&self, column: &ColumnDef, row_number: usize, raw: &str) -> HarnessResult<String> {
        column.column_type.literal(raw).map_err(|reason| {
            HarnessError::fixture(
                self.qualified_name(),
                format!("row {} column {}: {}", row_number, column.name, reason),
            )
        })
    }
}

#[async_trait]
impl Fixture for TableFixture {
    fn name(&self) -> String {
        format!("table {}", self.qualified_name())
    }

    /// Present means listed and holding exactly the source file's rows.
    /// A table left partly loaded by an earlier failure is refilled.
    async fn exists(&self) -> HarnessResult<bool> {
        if !self.sql.table_exists(&self.database, &self.table).await? {
            return Ok(false);
        }

        let loaded = self.sql.count_rows(&self.database, &self.table).await?;
        let expected = self.source_rows()?;
        if loaded != expected {
            debug!(
                table = %self.qualified_name(),
                loaded,
                expected,
                "row count differs from source, reloading"
            );
            return Ok(false);
        }
        Ok(true)
    }

    async fn create(&self) -> HarnessResult<()> {
        let rows = self.value_rows()?;

        self.sql.execute(&self.create_statement()).await?;
        self.sql.execute(&self.truncate_statement()).await?;

        for (batch_index, batch) in rows.chunks(self.batch_size).enumerate() {
            debug!(
                table = %self.qualified_name(),
                batch = batch_index,
                rows = batch.len(),
                "inserting batch"
            );
            self.sql
                .execute(&format!(
                    "INSERT INTO {} VALUES {}",
                    self.qualified_name(),
                    batch.join(", ")
                ))
                .await?;
        }

        info!("✅ Loaded {} rows into {}", rows.len(), self.qualified_name());
        Ok(())
    }
}

/// A dataset registered with the service through the administrative API
pub struct DatasourceFixture {
    api: AdminApiClient,
    name: String,
    source: DatasourceSource,
}

impl DatasourceFixture {
    pub fn new(api: AdminApiClient, name: impl Into<String>, source: DatasourceSource) -> Self {
        Self {
            api,
            name: name.into(),
            source,
        }
    }
}

#[async_trait]
impl Fixture for DatasourceFixture {
    fn name(&self) -> String {
        format!("datasource {}", self.name)
    }

    async fn exists(&self) -> HarnessResult<bool> {
        let response = self.api.get_datasource(&self.name).await?;
        match response.status.as_u16() {
            200 => Ok(true),
            404 => Ok(false),
            _ => Err(HarnessError::mismatch(format!(
                "datasource lookup returned {}",
                response.status
            ))),
        }
    }

    async fn create(&self) -> HarnessResult<()> {
        self.api
            .put_datasource(&self.name, &self.source)
            .await?
            .expect_status(200)
            .map(|_| ())
    }
}

/// A local CSV file holding the first rows of a larger one
pub struct CsvExcerptFixture {
    source: PathBuf,
    target: PathBuf,
    rows: usize,
}

impl CsvExcerptFixture {
    pub fn new(source: impl Into<PathBuf>, target: impl Into<PathBuf>, rows: usize) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            rows,
        }
    }
}

#[async_trait]
impl Fixture for CsvExcerptFixture {
    fn name(&self) -> String {
        format!("file {}", self.target.display())
    }

    async fn exists(&self) -> HarnessResult<bool> {
        Ok(self.target.is_file())
    }

    async fn create(&self) -> HarnessResult<()> {
        let written = write_csv_head(&self.source, &self.target, self.rows)?;
        debug!(target = %self.target.display(), rows = written, "wrote CSV excerpt");
        Ok(())
    }
}

/// Copy the header and first `rows` records of one CSV file into another
pub fn write_csv_head(source: &Path, target: &Path, rows: usize) -> HarnessResult<usize> {
    let mut reader = csv::Reader::from_path(source)?;
    let mut writer = csv::Writer::from_path(target)?;

    writer.write_record(reader.headers()?)?;

    let mut written = 0;
    for record in reader.records().take(rows) {
        writer.write_record(&record?)?;
        written += 1;
    }
    writer.flush()?;

    Ok(written)
}

/// Parse an integer written with either a decimal comma or digit grouping.
///
/// When both `.` and `,` appear, the last one is the decimal point and the
/// other groups digits (`1,234.5`, `1.234,5`). A lone comma groups digits
/// when every group after the first has exactly three digits (`1,234`,
/// `1,234,567`) and is a decimal point otherwise (`12,5`). Fractions are
/// truncated toward zero.
pub fn parse_integer(raw: &str) -> Option<i64> {
    let value = parse_float(raw)?;
    let truncated = value.trunc();

    if truncated < i64::MIN as f64 || truncated > i64::MAX as f64 {
        return None;
    }
    Some(truncated as i64)
}

/// Parse a float under the same comma rules as [`parse_integer`]
pub fn parse_float(raw: &str) -> Option<f64> {
    let text = raw.trim();
    if text.is_empty() {
        return None;
    }

    let normalized = match (text.rfind('.'), text.rfind(',')) {
        (_, None) => text.to_string(),
        (Some(dot), Some(comma)) if dot > comma => text.replace(',', ""),
        (Some(_), Some(_)) => text.replace('.', "").replace(',', "."),
        (None, Some(_)) if is_digit_grouped(text) => text.replace(',', ""),
        (None, Some(_)) => text.replace(',', "."),
    };

    normalized.parse::<f64>().ok().filter(|v| v.is_finite())
}

fn is_digit_grouped(text: &str) -> bool {
    let unsigned = text.strip_prefix(|c| c == '-' || c == '+').unwrap_or(text);
    let mut groups = unsigned.split(',');

    let leading_ok = groups
        .next()
        .map(|g| (1..=3).contains(&g.len()) && g.chars().all(|c| c.is_ascii_digit()))
        .unwrap_or(false);

    leading_ok && groups.all(|g| g.len() == 3 && g.chars().all(|c| c.is_ascii_digit()))
}
