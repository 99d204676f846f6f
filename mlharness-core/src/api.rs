//! Client for the administrative HTTP API of the service under test
//!
//! Calls never fail on a non-success status: the suites assert on status
//! codes (including expected 404s), so every call returns an [`ApiResponse`]
//! and only transport problems surface as errors.

use async_trait::async_trait;
use reqwest::{multipart, Client, Method, StatusCode};
use serde::Serialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

use crate::config::HarnessConfig;
use crate::error::{HarnessError, HarnessResult};
use crate::validator::ResponseRecord;
use crate::waiter::{OperationStatus, StatusSource};

/// Status and decoded body of one API call
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub method: Method,
    pub path: String,
    pub status: StatusCode,
    /// JSON body, a JSON string for non-JSON text, or null when empty
    pub body: Value,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Fail with a protocol mismatch unless the status is `expected`
    pub fn expect_status(self, expected: u16) -> HarnessResult<Self> {
        if self.status.as_u16() == expected {
            Ok(self)
        } else {
            Err(HarnessError::mismatch(format!(
                "{} {} returned {} (expected {}): {}",
                self.method, self.path, self.status, expected, self.body
            )))
        }
    }

    pub fn expect_success(self) -> HarnessResult<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(HarnessError::mismatch(format!(
                "{} {} returned {}: {}",
                self.method, self.path, self.status, self.body
            )))
        }
    }

    /// The body as a single record
    pub fn record(&self) -> HarnessResult<ResponseRecord> {
        ResponseRecord::from_value(self.body.clone())
    }

    /// The body as a list of records
    pub fn records(&self) -> HarnessResult<Vec<ResponseRecord>> {
        match &self.body {
            Value::Array(items) => items.iter().cloned().map(ResponseRecord::from_value).collect(),
            other => Err(HarnessError::mismatch(format!(
                "{} {} returned a non-array body: {}",
                self.method, self.path, other
            ))),
        }
    }
}

/// Where a datasource reads its rows from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatasourceSource {
    Url(String),
    File(PathBuf),
}

/// Body of a predictor training request
#[derive(Debug, Clone, Serialize)]
pub struct PredictorRequest {
    pub data_source_name: String,
    pub to_predict: String,
    pub kwargs: TrainingOptions,
}

/// Options forwarded to the training process
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TrainingOptions {
    pub stop_training_in_x_seconds: u64,
    /// Block the request until training ends
    pub join_learn_process: bool,
}

impl TrainingOptions {
    pub fn synchronous(budget_secs: u64) -> Self {
        Self {
            stop_training_in_x_seconds: budget_secs,
            join_learn_process: true,
        }
    }

    /// JSON form used inside SQL statements
    pub fn to_json_string(&self) -> String {
        json!({
            "join_learn_process": self.join_learn_process,
            "stop_training_in_x_seconds": self.stop_training_in_x_seconds,
        })
        .to_string()
    }
}

#[derive(Debug, Clone)]
pub struct AdminApiClient {
    client: Client,
    root: String,
}

impl AdminApiClient {
    pub fn new(root: impl Into<String>, timeout: Duration) -> HarnessResult<Self> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            root: root.into().trim_end_matches('/').to_string(),
        })
    }

    /// Training requests block for the whole training budget, so the
    /// request timeout follows the training deadline.
    pub fn from_config(config: &HarnessConfig) -> HarnessResult<Self> {
        Self::new(config.api_root(), config.training_deadline())
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub async fn ping(&self) -> HarnessResult<ApiResponse> {
        self.send(Method::GET, "/util/ping", None).await
    }

    // Integrations

    pub async fn list_integrations(&self) -> HarnessResult<ApiResponse> {
        self.send(Method::GET, "/config/integrations", None).await
    }

    /// Names listed under `integrations`
    pub async fn integration_names(&self) -> HarnessResult<Vec<String>> {
        let response = self.list_integrations().await?.expect_status(200)?;
        string_list(&response.body["integrations"]).ok_or_else(|| {
            HarnessError::mismatch(format!("integration listing has no name list: {}", response.body))
        })
    }

    pub async fn get_integration(&self, name: &str) -> HarnessResult<ApiResponse> {
        self.send(Method::GET, &format!("/config/integrations/{}", name), None)
            .await
    }

    pub async fn create_integration(&self, name: &str, params: &Value) -> HarnessResult<ApiResponse> {
        self.send(
            Method::PUT,
            &format!("/config/integrations/{}", name),
            Some(json!({ "params": params })),
        )
        .await
    }

    pub async fn modify_integration(&self, name: &str, params: &Value) -> HarnessResult<ApiResponse> {
        self.send(
            Method::POST,
            &format!("/config/integrations/{}", name),
            Some(json!({ "params": params })),
        )
        .await
    }

    pub async fn delete_integration(&self, name: &str) -> HarnessResult<ApiResponse> {
        self.send(Method::DELETE, &format!("/config/integrations/{}", name), None)
            .await
    }

    // Datasources

    pub async fn list_datasources(&self) -> HarnessResult<ApiResponse> {
        self.send(Method::GET, "/datasources/", None).await
    }

    pub async fn get_datasource(&self, name: &str) -> HarnessResult<ApiResponse> {
        self.send(Method::GET, &format!("/datasources/{}", name), None)
            .await
    }

    pub async fn put_datasource(&self, name: &str, source: &DatasourceSource) -> HarnessResult<ApiResponse> {
        let path = format!("/datasources/{}", name);

        match source {
            DatasourceSource::Url(url) => {
                let body = json!({
                    "name": name,
                    "source_type": "url",
                    "source": url,
                });
                self.send(Method::PUT, &path, Some(body)).await
            }
            DatasourceSource::File(file) => {
                let bytes = tokio::fs::read(file).await?;
                let file_name = file
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| format!("{}.csv", name));

                let form = multipart::Form::new()
                    .text("name", name.to_string())
                    .text("source_type", "file")
                    .text("source", file_name.clone())
                    .part("file", multipart::Part::bytes(bytes).file_name(file_name));

                debug!(path = %path, file = %file.display(), "uploading datasource file");
                let request = self.client.put(self.url(&path)).multipart(form);
                self.finish(Method::PUT, &path, request).await
            }
        }
    }

    pub async fn analyze_datasource(&self, name: &str) -> HarnessResult<ApiResponse> {
        self.send(Method::GET, &format!("/datasources/{}/analyze", name), None)
            .await
    }

    // Predictors

    pub async fn list_predictors(&self) -> HarnessResult<ApiResponse> {
        self.send(Method::GET, "/predictors/", None).await
    }

    pub async fn predictor_names(&self) -> HarnessResult<Vec<String>> {
        let response = self.list_predictors().await?.expect_status(200)?;
        Ok(response
            .records()?
            .iter()
            .filter_map(|r| r.str("name").map(str::to_string))
            .collect())
    }

    pub async fn get_predictor(&self, name: &str) -> HarnessResult<ApiResponse> {
        self.send(Method::GET, &format!("/predictors/{}", name), None)
            .await
    }

    pub async fn put_predictor(&self, name: &str, request: &PredictorRequest) -> HarnessResult<ApiResponse> {
        self.send(
            Method::PUT,
            &format!("/predictors/{}", name),
            Some(serde_json::to_value(request)?),
        )
        .await
    }

    pub async fn delete_predictor(&self, name: &str) -> HarnessResult<ApiResponse> {
        self.send(Method::DELETE, &format!("/predictors/{}", name), None)
            .await
    }

    pub async fn predict(&self, name: &str, when: Value) -> HarnessResult<ApiResponse> {
        self.send(
            Method::POST,
            &format!("/predictors/{}/predict", name),
            Some(json!({ "when": when })),
        )
        .await
    }

    /// Raw call for paths without a dedicated helper
    pub async fn send(&self, method: Method, path: &str, body: Option<Value>) -> HarnessResult<ApiResponse> {
        let mut request = self.client.request(method.clone(), self.url(path));
        if let Some(body) = body {
            request = request.json(&body);
        }
        self.finish(method, path, request).await
    }

    async fn finish(
        &self,
        method: Method,
        path: &str,
        request: reqwest::RequestBuilder,
    ) -> HarnessResult<ApiResponse> {
        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;

        debug!(method = %method, path, status = %status, "API call finished");

        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };

        Ok(ApiResponse {
            method,
            path: path.to_string(),
            status,
            body,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.root, path)
    }
}

/// Predictor training status read from `GET /predictors/{name}`
pub struct ApiPredictorStatus<'a> {
    api: &'a AdminApiClient,
}

impl<'a> ApiPredictorStatus<'a> {
    pub fn new(api: &'a AdminApiClient) -> Self {
        Self { api }
    }
}

#[async_trait]
impl StatusSource for ApiPredictorStatus<'_> {
    async fn status(&self, key: &str) -> HarnessResult<Option<OperationStatus>> {
        let response = self.api.get_predictor(key).await?;

        if response.status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if response.status.is_server_error() {
            return Err(HarnessError::Connectivity(format!(
                "predictor status returned {}",
                response.status
            )));
        }

        let response = response.expect_status(200)?;
        match response.body.get("status").and_then(|s| s.as_str()) {
            Some(raw) => OperationStatus::parse(raw).map(Some),
            None => Err(HarnessError::mismatch(format!(
                "predictor {} has no status field: {}",
                key, response.body
            ))),
        }
    }
}

fn string_list(value: &Value) -> Option<Vec<String>> {
    value
        .as_array()?
        .iter()
        .map(|v| v.as_str().map(str::to_string))
        .collect()
}
