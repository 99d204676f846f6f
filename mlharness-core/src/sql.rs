//! SQL over HTTP against the analytical datastore
//!
//! Statements are POSTed as the request body. Reads get ` FORMAT JSON`
//! appended and the rows are taken from the `data` array of the reply.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::config::HarnessConfig;
use crate::error::{HarnessError, HarnessResult};
use crate::validator::ResponseRecord;
use crate::waiter::{OperationStatus, StatusSource};

#[derive(Debug, Clone)]
pub struct SqlClient {
    client: Client,
    endpoint: String,
    user: Option<String>,
    password: Option<String>,
}

impl SqlClient {
    pub fn new(
        endpoint: impl Into<String>,
        user: Option<String>,
        password: Option<String>,
        timeout: Duration,
    ) -> HarnessResult<Self> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            user,
            password,
        })
    }

    pub fn from_config(config: &HarnessConfig) -> HarnessResult<Self> {
        Self::new(
            config.sql_root(),
            config.datastore.user.clone(),
            config.datastore.password.clone(),
            config.sql_request_timeout(),
        )
    }

    /// Run a read and return its rows
    pub async fn query(&self, sql: &str) -> HarnessResult<Vec<ResponseRecord>> {
        let statement = with_json_format(sql);
        let body = self.send(&statement).await?;

        if !statement.to_uppercase().ends_with(FORMAT_SUFFIX) {
            return Ok(Vec::new());
        }

        let reply: Value = serde_json::from_str(&body)?;
        match reply.get("data") {
            Some(Value::Array(rows)) => rows.iter().cloned().map(ResponseRecord::from_value).collect(),
            _ => Err(HarnessError::mismatch(format!(
                "SQL reply has no data array: {}",
                truncate(&body, 200)
            ))),
        }
    }

    /// Run a statement and discard its output
    pub async fn execute(&self, sql: &str) -> HarnessResult<()> {
        self.send(sql).await.map(|_| ())
    }

    /// Names from a `show tables` style listing
    pub async fn show_tables(&self, database: &str) -> HarnessResult<Vec<String>> {
        let rows = self.query(&format!("show tables from {}", database)).await?;
        Ok(names(&rows))
    }

    pub async fn show_databases(&self) -> HarnessResult<Vec<String>> {
        let rows = self.query("show databases").await?;
        Ok(names(&rows))
    }

    pub async fn table_exists(&self, database: &str, table: &str) -> HarnessResult<bool> {
        Ok(self.show_tables(database).await?.iter().any(|t| t == table))
    }

    /// Row count of `database.table`; counts may come back as strings
    pub async fn count_rows(&self, database: &str, table: &str) -> HarnessResult<u64> {
        let rows = self
            .query(&format!("select count() as row_count from {}.{}", database, table))
            .await?;

        let value = rows
            .first()
            .and_then(|row| row.get("row_count"))
            .ok_or_else(|| HarnessError::mismatch("count query returned no rows"))?;

        match value {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
        .ok_or_else(|| HarnessError::mismatch(format!("row count is not a number: {}", value)))
    }

    async fn send(&self, statement: &str) -> HarnessResult<String> {
        debug!(endpoint = %self.endpoint, statement = %truncate(statement, 120), "sending SQL");

        let mut params: Vec<(&str, &str)> = Vec::new();
        if let Some(user) = &self.user {
            params.push(("user", user.as_str()));
        }
        if let Some(password) = &self.password {
            params.push(("password", password.as_str()));
        }

        let response = self
            .client
            .post(&self.endpoint)
            .query(&params)
            .body(statement.to_string())
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(HarnessError::Sql {
                status: status.as_u16(),
                body,
            });
        }

        Ok(body)
    }
}

/// Predictor training status read from the `predictors` virtual table
pub struct SqlPredictorStatus<'a> {
    sql: &'a SqlClient,
    schema: String,
}

impl<'a> SqlPredictorStatus<'a> {
    pub fn new(sql: &'a SqlClient, schema: impl Into<String>) -> Self {
        Self {
            sql,
            schema: schema.into(),
        }
    }
}

#[async_trait]
impl StatusSource for SqlPredictorStatus<'_> {
    async fn status(&self, key: &str) -> HarnessResult<Option<OperationStatus>> {
        let rows = self
            .sql
            .query(&format!(
                "select status from {}.predictors where name = {}",
                self.schema,
                quote(key)
            ))
            .await?;

        match rows.first() {
            None => Ok(None),
            Some(row) => match row.str("status") {
                Some(raw) => OperationStatus::parse(raw).map(Some),
                None => Err(HarnessError::mismatch(format!(
                    "predictor row without status: {:?}",
                    row.fields()
                ))),
            },
        }
    }
}

const FORMAT_SUFFIX: &str = " FORMAT JSON";

/// Append the JSON output format unless the statement produces no rows
pub fn with_json_format(sql: &str) -> String {
    let statement = sql.trim().trim_end_matches(';').trim_end();
    let upper = statement.to_uppercase();

    if upper.contains("CREATE ") || upper.contains("INSERT ") || upper.ends_with(FORMAT_SUFFIX) {
        statement.to_string()
    } else {
        format!("{}{}", statement, FORMAT_SUFFIX)
    }
}

/// Quote a string literal for embedding in a statement
pub fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

fn names(rows: &[ResponseRecord]) -> Vec<String> {
    rows.iter()
        .filter_map(|row| row.str("name").map(str::to_string))
        .collect()
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
