//! # ML Harness Core Library
//!
//! Orchestration core for black-box integration tests of an ML-capable query
//! service that exposes an administrative HTTP API and a SQL-over-HTTP
//! surface backed by an analytical datastore.
//!
//! ## Components
//!
//! - **ProcessSupervisor**: spawns the service (and its datastore container) and
//!   tears both down on every exit path
//! - **ReadinessProbe**: bounded, fixed-interval liveness gate
//! - **FixtureProvisioner**: idempotent databases, tables and datasources
//! - **AsyncOperationWaiter**: drives long-running operations to a terminal state
//!   and rejects backwards progress
//! - **ResponseValidator**: declarative field/type checks with the protocol's
//!   nullable-as-string quirk
//! - **SuiteRunner**: ordered cases with dependencies and a failure policy
//!
//! Polling is shared through [`retry::RetryPolicy`]; both protocol clients live
//! in [`api`] and [`sql`].

pub mod api;
pub mod config;
pub mod error;
pub mod fixtures;
pub mod readiness;
pub mod retry;
pub mod scenario;
pub mod sql;
pub mod supervisor;
pub mod validator;
pub mod waiter;

// Re-export commonly used types
pub use api::{AdminApiClient, ApiPredictorStatus, ApiResponse, DatasourceSource};
pub use config::HarnessConfig;
pub use error::{HarnessError, HarnessResult};
pub use fixtures::{Fixture, FixtureProvisioner, ProvisionOutcome};
pub use readiness::ReadinessProbe;
pub use retry::{Attempt, RetryPolicy};
pub use scenario::{CaseOutcome, FailurePolicy, Suite, SuiteContext, SuiteReport, SuiteRunner, TestCase};
pub use sql::{SqlClient, SqlPredictorStatus};
pub use supervisor::{ProcessSupervisor, ServiceCommand, ServiceGuard, ServiceHandle};
pub use validator::{FieldType, FieldRule, RecordSchema, ResponseRecord, ResponseValidator};
pub use waiter::{AsyncOperationWaiter, OperationStatus, StatusSource, TerminalState};
