//! Ordered suite execution
//!
//! A [`Suite`] bundles how to bring the service up, which fixtures and setup
//! steps must succeed first, and the ordered [`TestCase`]s. The
//! [`SuiteRunner`] walks the suite through
//! `NotStarted -> ServiceUp -> Provisioned -> Running(i) -> Completed | Aborted`
//! and always tears the service down exactly once.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::api::AdminApiClient;
use crate::config::HarnessConfig;
use crate::error::{HarnessError, HarnessResult};
use crate::fixtures::{Fixture, FixtureProvisioner};
use crate::readiness::ReadinessProbe;
use crate::sql::SqlClient;
use crate::supervisor::{ProcessSupervisor, ServiceCommand, ServiceGuard};
use crate::waiter::AsyncOperationWaiter;

/// What happens after a case fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop at the first failed case; the rest are not run
    FailFast,
    /// Keep going; cases depending on a failed case are blocked
    Continue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuiteState {
    NotStarted,
    ServiceUp,
    Provisioned,
    Running(usize),
    Completed,
    Aborted,
}

impl fmt::Display for SuiteState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SuiteState::NotStarted => write!(f, "not started"),
            SuiteState::ServiceUp => write!(f, "service up"),
            SuiteState::Provisioned => write!(f, "provisioned"),
            SuiteState::Running(i) => write!(f, "running case {}", i + 1),
            SuiteState::Completed => write!(f, "completed"),
            SuiteState::Aborted => write!(f, "aborted"),
        }
    }
}

/// Shared clients and names handed to every step of a suite
pub struct SuiteContext {
    pub config: HarnessConfig,
    pub api: AdminApiClient,
    pub sql: SqlClient,
    pub waiter: AsyncOperationWaiter,
    /// Unique per run, used to keep resource names from colliding
    pub run_id: String,
}

impl SuiteContext {
    pub fn new(config: HarnessConfig) -> HarnessResult<Self> {
        let api = AdminApiClient::from_config(&config)?;
        let sql = SqlClient::from_config(&config)?;
        let waiter = AsyncOperationWaiter::from_config(&config);
        let run_id = Utc::now().timestamp_millis().to_string();

        Ok(Self {
            config,
            api,
            sql,
            waiter,
            run_id,
        })
    }

    /// `<prefix>_<run id>`
    pub fn unique_name(&self, prefix: &str) -> String {
        format!("{}_{}", prefix, self.run_id)
    }
}

pub type CaseFuture<'a> = Pin<Box<dyn Future<Output = HarnessResult<()>> + 'a>>;

type CaseAction = Box<dyn for<'a> Fn(&'a SuiteContext) -> CaseFuture<'a>>;

/// One ordered step: an action plus its assertions, failing with an error
pub struct TestCase {
    name: String,
    depends_on: Vec<String>,
    action: CaseAction,
}

impl TestCase {
    pub fn new<F>(name: impl Into<String>, action: F) -> Self
    where
        F: for<'a> Fn(&'a SuiteContext) -> CaseFuture<'a> + 'static,
    {
        Self {
            name: name.into(),
            depends_on: Vec::new(),
            action: Box::new(action),
        }
    }

    /// Block this case when `case` did not pass
    pub fn depends_on(mut self, case: impl Into<String>) -> Self {
        self.depends_on.push(case.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dependencies(&self) -> &[String] {
        &self.depends_on
    }
}

/// Declarative description of one suite
pub struct Suite {
    name: String,
    service: Option<ServiceCommand>,
    datastore: bool,
    fixtures: Vec<Box<dyn Fixture>>,
    setup: Vec<TestCase>,
    cases: Vec<TestCase>,
}

impl Suite {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            service: None,
            datastore: false,
            fixtures: Vec::new(),
            setup: Vec::new(),
            cases: Vec::new(),
        }
    }

    /// Launch the service with `command` (unless the config says to attach)
    pub fn service(mut self, command: ServiceCommand) -> Self {
        self.service = Some(command);
        self
    }

    /// Bring up and gate on the SQL datastore before the service
    pub fn with_datastore(mut self) -> Self {
        self.datastore = true;
        self
    }

    pub fn fixture(mut self, fixture: impl Fixture + 'static) -> Self {
        self.fixtures.push(Box::new(fixture));
        self
    }

    /// Runs after provisioning and before the first case; failure aborts
    pub fn setup(mut self, step: TestCase) -> Self {
        self.setup.push(step);
        self
    }

    pub fn case(mut self, case: TestCase) -> Self {
        self.cases.push(case);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn case_names(&self) -> Vec<&str> {
        self.cases.iter().map(TestCase::name).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaseOutcome {
    Passed,
    Failed(String),
    /// A case it depends on did not pass
    Blocked(String),
    /// Skipped after an abort
    NotRun,
}

#[derive(Debug, Clone)]
pub struct CaseReport {
    pub name: String,
    pub outcome: CaseOutcome,
    pub duration: Duration,
}

/// Result of one suite run
#[derive(Debug)]
pub struct SuiteReport {
    pub suite: String,
    pub state: SuiteState,
    pub cases: Vec<CaseReport>,
    pub abort: Option<HarnessError>,
    pub teardown_done: bool,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
}

impl SuiteReport {
    fn new(suite: &Suite) -> Self {
        Self {
            suite: suite.name.clone(),
            state: SuiteState::NotStarted,
            cases: suite
                .cases
                .iter()
                .map(|c| CaseReport {
                    name: c.name.clone(),
                    outcome: CaseOutcome::NotRun,
                    duration: Duration::ZERO,
                })
                .collect(),
            abort: None,
            teardown_done: false,
            started_at: Utc::now(),
            duration: Duration::ZERO,
        }
    }

    pub fn outcome(&self, case: &str) -> Option<&CaseOutcome> {
        self.cases.iter().find(|c| c.name == case).map(|c| &c.outcome)
    }

    pub fn count(&self, matches: impl Fn(&CaseOutcome) -> bool) -> usize {
        self.cases.iter().filter(|c| matches(&c.outcome)).count()
    }

    pub fn passed(&self) -> usize {
        self.count(|o| *o == CaseOutcome::Passed)
    }

    pub fn is_success(&self) -> bool {
        self.state == SuiteState::Completed && self.passed() == self.cases.len()
    }

    pub fn log_summary(&self) {
        info!("📊 Suite {} finished: {} ({:.1}s)", self.suite, self.state, self.duration.as_secs_f64());

        for (i, case) in self.cases.iter().enumerate() {
            match &case.outcome {
                CaseOutcome::Passed => info!("  ✅ {}. {} ({} ms)", i + 1, case.name, case.duration.as_millis()),
                CaseOutcome::Failed(reason) => error!("  ❌ {}. {}: {}", i + 1, case.name, reason),
                CaseOutcome::Blocked(reason) => warn!("  ⛔ {}. {}: {}", i + 1, case.name, reason),
                CaseOutcome::NotRun => info!("  ⏭️  {}. {} not run", i + 1, case.name),
            }
        }

        if let Some(abort) = &self.abort {
            error!("  Abort reason [{}]: {}", abort.category(), abort);
        }
    }

    /// The abort error, or an assertion listing failed cases, or the report
    pub fn into_result(self) -> HarnessResult<Self> {
        if let Some(abort) = self.abort {
            return Err(abort);
        }

        let failed: Vec<&str> = self
            .cases
            .iter()
            .filter(|c| c.outcome != CaseOutcome::Passed)
            .map(|c| c.name.as_str())
            .collect();

        if failed.is_empty() {
            Ok(self)
        } else {
            Err(HarnessError::assertion(format!(
                "suite {}: {} of {} cases did not pass: {}",
                self.suite,
                failed.len(),
                self.cases.len(),
                failed.join(", ")
            )))
        }
    }
}

/// Runs suites against one configuration
pub struct SuiteRunner {
    context: SuiteContext,
    policy: FailurePolicy,
}

impl SuiteRunner {
    pub fn new(config: HarnessConfig) -> HarnessResult<Self> {
        let policy = config.suite.failure_policy;
        Ok(Self {
            context: SuiteContext::new(config)?,
            policy,
        })
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn context(&self) -> &SuiteContext {
        &self.context
    }

    pub async fn run(&self, suite: Suite) -> SuiteReport {
        let started = Instant::now();
        let mut report = SuiteReport::new(&suite);
        let mut guard = ServiceGuard::new(ProcessSupervisor::from_config(&self.context.config));

        info!("🧪 Running suite {} ({} cases)", suite.name, suite.cases.len());

        if let Err(e) = self.execute(&suite, &mut guard, &mut report).await {
            error!("💥 Suite {} aborted in state {}: {}", suite.name, report.state, e);
            report.state = SuiteState::Aborted;
            report.abort = Some(e);
        }

        report.teardown_done = guard.release();
        report.duration = started.elapsed();
        report
    }

    async fn execute(
        &self,
        suite: &Suite,
        guard: &mut ServiceGuard,
        report: &mut SuiteReport,
    ) -> HarnessResult<()> {
        self.bring_up(suite, guard).await?;
        report.state = SuiteState::ServiceUp;

        let mut provisioner = FixtureProvisioner::new();
        for fixture in &suite.fixtures {
            provisioner.ensure(fixture.as_ref()).await?;
        }

        for step in &suite.setup {
            info!("🔧 Setup: {}", step.name);
            (step.action)(&self.context).await.map_err(|e| {
                HarnessError::fixture(format!("setup '{}'", step.name), e.to_string())
            })?;
        }
        report.state = SuiteState::Provisioned;

        self.run_cases(suite, report).await
    }

    async fn bring_up(&self, suite: &Suite, guard: &mut ServiceGuard) -> HarnessResult<()> {
        let config = &self.context.config;
        let probe = ReadinessProbe::from_config(config)?;

        if suite.datastore {
            if let Some(container) = &config.datastore.container {
                guard.supervisor_mut().start_container(container)?;
            }
            probe.wait_ready(&config.sql_liveness_url()).await?;
        }

        let liveness_url = match (&suite.service, config.service.spawn) {
            (Some(command), true) => guard.start(command)?.liveness_url().to_string(),
            _ => guard.attach().liveness_url().to_string(),
        };

        probe.wait_ready(&liveness_url).await?;
        Ok(())
    }

    async fn run_cases(&self, suite: &Suite, report: &mut SuiteReport) -> HarnessResult<()> {
        let mut outcomes: HashMap<&str, bool> = HashMap::new();

        for (index, case) in suite.cases.iter().enumerate() {
            report.state = SuiteState::Running(index);

            let unmet: Vec<&str> = case
                .depends_on
                .iter()
                .map(String::as_str)
                .filter(|dep| !outcomes.get(dep).copied().unwrap_or(false))
                .collect();

            if !unmet.is_empty() {
                warn!("⛔ {} blocked by {}", case.name, unmet.join(", "));
                report.cases[index].outcome =
                    CaseOutcome::Blocked(format!("depends on {}", unmet.join(", ")));
                outcomes.insert(&case.name, false);
                continue;
            }

            info!("▶️  {}. {}", index + 1, case.name);
            let started = Instant::now();
            let result = (case.action)(&self.context).await;
            report.cases[index].duration = started.elapsed();

            match result {
                Ok(()) => {
                    info!("✅ {} passed", case.name);
                    report.cases[index].outcome = CaseOutcome::Passed;
                    outcomes.insert(&case.name, true);
                }
                Err(e) => {
                    error!("❌ {} failed [{}]: {}", case.name, e.category(), e);
                    report.cases[index].outcome = CaseOutcome::Failed(e.to_string());
                    outcomes.insert(&case.name, false);

                    if e.is_fatal() || self.policy == FailurePolicy::FailFast {
                        return Err(e);
                    }
                }
            }
        }

        report.state = SuiteState::Completed;
        Ok(())
    }
}
