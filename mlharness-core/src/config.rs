use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::scenario::FailurePolicy;

/// Configuration for one orchestrated run
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct HarnessConfig {
    /// How the service under test is launched
    pub service: ServiceConfig,

    /// Liveness gate settings
    pub readiness: ReadinessConfig,

    /// Long-running training settings
    pub training: TrainingConfig,

    /// SQL-over-HTTP datastore settings
    pub datastore: DatastoreConfig,

    /// Local fixture files
    pub fixtures: FixtureConfig,

    /// Runner behaviour
    pub suite: SuiteConfig,
}

/// Service process configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Interpreter or launcher binary
    pub runtime: String,

    /// Module passed with `-m`
    pub module: String,

    /// API kinds passed with `--api`
    pub apis: Vec<String>,

    /// Optional config file passed with `--config`
    pub config_path: Option<PathBuf>,

    /// Working directory for the child process
    pub workdir: Option<PathBuf>,

    /// Host the HTTP API binds to
    pub host: String,

    /// Port the HTTP API binds to
    pub http_port: u16,

    /// Spawn the service; when false the harness attaches to a running one
    pub spawn: bool,

    /// File receiving the child's stdout and stderr
    pub log_path: Option<PathBuf>,
}

/// Readiness probe configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessConfig {
    /// Maximum liveness attempts before giving up
    pub max_attempts: u32,

    /// Fixed delay between attempts in milliseconds
    pub interval_ms: u64,

    /// Timeout of a single liveness request in milliseconds
    pub request_timeout_ms: u64,

    /// Liveness path on the HTTP API
    pub health_path: String,
}

/// Training wait configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Wall-clock deadline for a training run to reach a terminal state
    pub deadline_secs: u64,

    /// Delay between status polls in milliseconds
    pub poll_interval_ms: u64,

    /// Training budget handed to the service
    pub stop_training_in_x_seconds: u64,
}

/// SQL datastore configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatastoreConfig {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,

    /// Database holding the seeded test tables
    pub test_database: String,

    /// Reserved schema exposing `predictors` and `commands`
    pub predictor_schema: String,

    /// Rows per INSERT statement during bulk load
    pub insert_batch_size: usize,

    /// Liveness path of the SQL-over-HTTP endpoint
    pub ping_path: String,

    /// Timeout of a single SQL request in milliseconds
    pub request_timeout_ms: u64,

    /// Container running the datastore, if the harness manages it
    pub container: Option<ContainerConfig>,
}

/// Externally managed container
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Container name used to detect a running instance
    pub name: String,

    /// Command starting the container
    pub start_command: Vec<String>,

    /// Command stopping the container
    pub stop_command: Vec<String>,

    /// Directory the commands run in
    pub workdir: Option<PathBuf>,
}

/// Fixture file configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FixtureConfig {
    /// Directory containing fixture CSV files
    pub data_dir: PathBuf,

    /// Training data file inside `data_dir`
    pub training_csv: String,

    /// Remote copy of the training data, used for URL-backed datasources
    pub training_url: String,

    /// Short training data file registered as a file-backed datasource
    pub external_csv: String,
}

/// Runner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SuiteConfig {
    pub failure_policy: FailurePolicy,

    /// Integrations the service ships with
    pub expected_integrations: Vec<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            runtime: "python3".to_string(),
            module: "mindsdb".to_string(),
            apis: vec!["http".to_string()],
            config_path: None,
            workdir: None,
            host: "127.0.0.1".to_string(),
            http_port: 47334,
            spawn: true,
            log_path: None,
        }
    }
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            max_attempts: 20,
            interval_ms: 1000,
            request_timeout_ms: 2000,
            health_path: "/util/ping".to_string(),
        }
    }
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            deadline_secs: 600,
            poll_interval_ms: 2000,
            stop_training_in_x_seconds: 5,
        }
    }
}

impl Default for DatastoreConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8123,
            user: Some("default".to_string()),
            password: None,
            test_database: "test".to_string(),
            predictor_schema: "mindsdb".to_string(),
            insert_batch_size: 500,
            ping_path: "/ping".to_string(),
            request_timeout_ms: 30000,
            container: None,
        }
    }
}

impl Default for FixtureConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("tests/data"),
            training_csv: "home_rentals.csv".to_string(),
            training_url: "https://s3.eu-west-2.amazonaws.com/mindsdb-example-data/home_rentals.csv"
                .to_string(),
            external_csv: "test_external.csv".to_string(),
        }
    }
}

impl Default for SuiteConfig {
    fn default() -> Self {
        Self {
            failure_policy: FailurePolicy::FailFast,
            expected_integrations: vec![
                "default_mariadb".to_string(),
                "default_clickhouse".to_string(),
            ],
        }
    }
}

impl HarnessConfig {
    /// Load configuration from file, environment variables, and defaults
    pub fn load() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(config_path) = env::var("MLHARNESS_CONFIG") {
            config = Self::load_from_file(&config_path)?;
        } else if std::path::Path::new("config/e2e.yaml").exists() {
            config = Self::load_from_file("config/e2e.yaml")?;
        }

        config.apply_env_overrides()?;
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a YAML file
    pub fn load_from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config: Self = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path))?;

        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(runtime) = env::var("MLHARNESS_RUNTIME") {
            self.service.runtime = runtime;
        }

        if let Ok(apis) = env::var("MLHARNESS_APIS") {
            self.service.apis = apis
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        if let Ok(port) = env::var("MLHARNESS_HTTP_PORT") {
            self.service.http_port = port.parse()?;
        }

        if let Ok(spawn) = env::var("MLHARNESS_SPAWN") {
            self.service.spawn = spawn.parse()?;
        }

        if let Ok(attempts) = env::var("MLHARNESS_READY_ATTEMPTS") {
            self.readiness.max_attempts = attempts.parse()?;
        }

        if let Ok(deadline) = env::var("MLHARNESS_TRAINING_DEADLINE_SECS") {
            self.training.deadline_secs = deadline.parse()?;
        }

        if let Ok(host) = env::var("MLHARNESS_SQL_HOST") {
            self.datastore.host = host;
        }

        if let Ok(port) = env::var("MLHARNESS_SQL_PORT") {
            self.datastore.port = port.parse()?;
        }

        if let Ok(user) = env::var("MLHARNESS_SQL_USER") {
            self.datastore.user = Some(user);
        }

        if let Ok(password) = env::var("MLHARNESS_SQL_PASSWORD") {
            self.datastore.password = Some(password);
        }

        if let Ok(data_dir) = env::var("MLHARNESS_DATA_DIR") {
            self.fixtures.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(policy) = env::var("MLHARNESS_FAILURE_POLICY") {
            self.suite.failure_policy = match policy.to_lowercase().as_str() {
                "fail_fast" => FailurePolicy::FailFast,
                "continue" => FailurePolicy::Continue,
                _ => {
                    return Err(anyhow::anyhow!(
                        "Invalid failure policy: {}. Valid options: fail_fast, continue",
                        policy
                    ))
                }
            };
        }

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.service.runtime.is_empty() || self.service.module.is_empty() {
            return Err(anyhow::anyhow!("Service runtime and module are required"));
        }

        if self.service.apis.is_empty() {
            return Err(anyhow::anyhow!("At least one API kind is required"));
        }

        if self.readiness.max_attempts == 0 {
            return Err(anyhow::anyhow!("Readiness attempts must be greater than 0"));
        }

        if !self.readiness.health_path.starts_with('/') {
            return Err(anyhow::anyhow!("Health path must start with '/'"));
        }

        if self.training.deadline_secs == 0 {
            return Err(anyhow::anyhow!("Training deadline must be greater than 0"));
        }

        if self.datastore.insert_batch_size == 0 {
            return Err(anyhow::anyhow!("Insert batch size must be greater than 0"));
        }

        Ok(())
    }

    /// Root URL of the administrative HTTP API
    pub fn api_root(&self) -> String {
        format!("http://{}:{}", self.service.host, self.service.http_port)
    }

    /// Liveness URL of the administrative HTTP API
    pub fn liveness_url(&self) -> String {
        format!("{}{}", self.api_root(), self.readiness.health_path)
    }

    /// Root URL of the SQL-over-HTTP endpoint
    pub fn sql_root(&self) -> String {
        format!("http://{}:{}", self.datastore.host, self.datastore.port)
    }

    /// Liveness URL of the SQL-over-HTTP endpoint
    pub fn sql_liveness_url(&self) -> String {
        format!("{}{}", self.sql_root(), self.datastore.ping_path)
    }

    pub fn readiness_interval(&self) -> Duration {
        Duration::from_millis(self.readiness.interval_ms)
    }

    pub fn readiness_request_timeout(&self) -> Duration {
        Duration::from_millis(self.readiness.request_timeout_ms)
    }

    pub fn training_deadline(&self) -> Duration {
        Duration::from_secs(self.training.deadline_secs)
    }

    pub fn training_poll_interval(&self) -> Duration {
        Duration::from_millis(self.training.poll_interval_ms)
    }

    pub fn sql_request_timeout(&self) -> Duration {
        Duration::from_millis(self.datastore.request_timeout_ms)
    }

    /// Full path of a fixture file
    pub fn fixture_path(&self, file_name: &str) -> PathBuf {
        self.fixtures.data_dir.join(file_name)
    }
}
