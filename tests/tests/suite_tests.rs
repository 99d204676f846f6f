
use common::{write_rentals_csv, FakeService};
use mlharness_core::scenario::{CaseFuture, SuiteState};
use mlharness_core::supervisor::find_listener_pid;
use mlharness_core::{
    CaseOutcome, FailurePolicy, HarnessConfig, HarnessError, ServiceCommand, Suite, SuiteContext,
    SuiteRunner, TestCase,
};
use mlharness_e2e_tests::{http_api, sql_flow};
use reqwest::Method;
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;
use tokio::test;

fn fixture_dir() -> TempDir {
    let dir = TempDir::new().unwrap();
    write_rentals_csv(dir.path(), "home_rentals.csv");
    dir
}

/// A port nobody listens on once the reservation is dropped
fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn python_available() -> bool {
    std::process::Command::new("python3")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Stand-in service: a shell whose background job serves HTTP on `port`,
/// so the spawned process and the port listener differ
fn stand_in_service(port: u16, dir: &Path) -> ServiceCommand {
    let mut command = ServiceCommand::new("sh").arg("-c").arg(format!(
        "python3 -m http.server {} --bind 127.0.0.1 & wait",
        port
    ));
    command.workdir = Some(dir.to_path_buf());
    command
}

fn spawning_config(port: u16, dir: &Path) -> HarnessConfig {
    let mut config = HarnessConfig::default();
    config.service.host = "127.0.0.1".to_string();
    config.service.http_port = port;
    config.service.spawn = true;
    config.readiness.max_attempts = 100;
    config.readiness.interval_ms = 50;
    config.readiness.request_timeout_ms = 500;
    config.readiness.health_path = "/".to_string();
    config.fixtures.data_dir = dir.to_path_buf();
    config
}

async fn port_released(port: u16) -> bool {
    for _ in 0..100 {
        if find_listener_pid(port).is_none() && TcpStream::connect(("127.0.0.1", port)).is_err() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

fn serves_root(ctx: &SuiteContext) -> CaseFuture<'_> {
    Box::pin(async move {
        ctx.api.send(Method::GET, "/", None).await?.expect_status(200)?;
        Ok(())
    })
}

fn passing(_ctx: &SuiteContext) -> CaseFuture<'_> {
    Box::pin(async { Ok(()) })
}

fn failing(_ctx: &SuiteContext) -> CaseFuture<'_> {
    Box::pin(async { Err(HarnessError::assertion("expected 3 rows, got 2")) })
}

fn timing_out(_ctx: &SuiteContext) -> CaseFuture<'_> {
    Box::pin(async {
        Err(HarnessError::Timeout {
            operation: "train p1".to_string(),
            waited_ms: 10,
            last_state: "in_progress".to_string(),
        })
    })
}

fn pings(ctx: &SuiteContext) -> CaseFuture<'_> {
    Box::pin(async move {
        ctx.api.ping().await?.expect_status(200)?;
        Ok(())
    })
}

#[test]
async fn test_http_suite_passes() {
    let service = FakeService::start().await;
    let dir = fixture_dir();

    let runner = SuiteRunner::new(service.config(dir.path())).unwrap();
    let report = runner.run(http_api::suite(runner.context())).await;
    report.log_summary();

    assert_eq!(report.state, SuiteState::Completed);
    assert!(report.is_success(), "cases: {:?}", report.cases);
    assert!(report.teardown_done);

    // Integrations were restored after the password round trip
    let state = service.state.lock();
    assert_eq!(state.integrations.len(), 2);
    assert_eq!(state.integrations["default_mariadb"]["password"], "");
    assert!(state.predictors.contains_key(&http_api::predictor_name(runner.context())));
}

#[test]
async fn test_sql_suite_passes_and_reruns_cleanly() {
    let service = FakeService::start().await;
    let dir = fixture_dir();

    let runner = SuiteRunner::new(service.config(dir.path())).unwrap();
    let report = runner.run(sql_flow::suite(runner.context())).await;
    report.log_summary();
    assert!(report.is_success(), "cases: {:?}", report.cases);

    {
        let state = service.state.lock();
        assert_eq!(state.table_rows("test.home_rentals").len(), 5);
        assert!(!state.predictors.contains_key(sql_flow::PREDICTOR));
        assert!(state.predictors.contains_key(&sql_flow::external_predictor()));
        assert_eq!(state.datasources.get(sql_flow::EXTERNAL_DATASOURCE).map(String::as_str), Some("file"));
    }
    assert!(dir.path().join("test_external.csv").is_file());
    let inserts = service.state.lock().insert_statements;

    // Second run: fixtures are found, the leftover predictor is cleaned up first
    let runner = SuiteRunner::new(service.config(dir.path())).unwrap();
    let report = runner.run(sql_flow::suite(runner.context())).await;
    assert!(report.is_success(), "cases: {:?}", report.cases);

    let state = service.state.lock();
    assert_eq!(state.table_rows("test.home_rentals").len(), 5);
    assert_eq!(state.insert_statements, inserts);
}

#[test]
async fn test_unavailable_service_aborts_before_any_case() {
    let port = free_port();

    let mut config = HarnessConfig::default();
    config.service.http_port = port;
    config.service.spawn = false;
    config.readiness.max_attempts = 2;
    config.readiness.interval_ms = 10;

    let runner = SuiteRunner::new(config).unwrap();
    let report = runner.run(http_api::suite(runner.context())).await;

    assert_eq!(report.state, SuiteState::Aborted);
    assert!(matches!(report.abort, Some(HarnessError::ServiceUnavailable { attempts: 2, .. })));
    assert_eq!(report.count(|o| *o == CaseOutcome::NotRun), report.cases.len());
    assert!(report.teardown_done);
    assert!(report.into_result().is_err());
}

#[test]
async fn test_fail_fast_stops_at_first_failure() {
    let service = FakeService::start().await;
    let dir = fixture_dir();

    let suite = Suite::new("fail_fast")
        .case(TestCase::new("first", pings))
        .case(TestCase::new("second", failing))
        .case(TestCase::new("third", passing));

    let runner = SuiteRunner::new(service.config(dir.path()))
        .unwrap()
        .with_policy(FailurePolicy::FailFast);
    let report = runner.run(suite).await;

    assert_eq!(report.state, SuiteState::Aborted);
    assert_eq!(report.outcome("first"), Some(&CaseOutcome::Passed));
    assert!(matches!(report.outcome("second"), Some(CaseOutcome::Failed(_))));
    assert_eq!(report.outcome("third"), Some(&CaseOutcome::NotRun));
    assert!(matches!(report.abort, Some(HarnessError::Assertion(_))));
}

#[test]
async fn test_continue_blocks_dependents_only() {
    let service = FakeService::start().await;
    let dir = fixture_dir();

    let suite = Suite::new("continue")
        .case(TestCase::new("train", failing))
        .case(TestCase::new("query", passing).depends_on("train"))
        .case(TestCase::new("ping", pings));

    let runner = SuiteRunner::new(service.config(dir.path()))
        .unwrap()
        .with_policy(FailurePolicy::Continue);
    let report = runner.run(suite).await;

    assert_eq!(report.state, SuiteState::Completed);
    assert!(matches!(report.outcome("train"), Some(CaseOutcome::Failed(_))));
    assert!(matches!(report.outcome("query"), Some(CaseOutcome::Blocked(_))));
    assert_eq!(report.outcome("ping"), Some(&CaseOutcome::Passed));
    assert_eq!(report.passed(), 1);

    let err = report.into_result().unwrap_err();
    assert!(err.to_string().contains("2 of 3 cases did not pass: train, query"));
}

#[test]
async fn test_timeout_aborts_even_when_continuing() {
    let service = FakeService::start().await;
    let dir = fixture_dir();

    let suite = Suite::new("fatal")
        .case(TestCase::new("train", timing_out))
        .case(TestCase::new("ping", pings));

    let runner = SuiteRunner::new(service.config(dir.path()))
        .unwrap()
        .with_policy(FailurePolicy::Continue);
    let report = runner.run(suite).await;

    assert_eq!(report.state, SuiteState::Aborted);
    assert_eq!(report.outcome("ping"), Some(&CaseOutcome::NotRun));
    assert!(matches!(report.abort, Some(HarnessError::Timeout { .. })));
    assert!(report.teardown_done);
}

#[cfg(target_os = "linux")]
#[test]
async fn test_spawned_service_is_stopped_after_every_run() {
    if !python_available() {
        eprintln!("python3 not found, skipping");
        return;
    }
    let dir = TempDir::new().unwrap();

    // Passing run
    let port = free_port();
    let suite = Suite::new("spawned")
        .service(stand_in_service(port, dir.path()))
        .case(TestCase::new("serves", serves_root));

    let runner = SuiteRunner::new(spawning_config(port, dir.path())).unwrap();
    let report = runner.run(suite).await;

    assert_eq!(report.state, SuiteState::Completed);
    assert!(report.is_success(), "cases: {:?}", report.cases);
    assert!(report.teardown_done);
    assert!(port_released(port).await, "service still listening on {}", port);

    // Aborted run
    let port = free_port();
    let suite = Suite::new("spawned_abort")
        .service(stand_in_service(port, dir.path()))
        .case(TestCase::new("serves", serves_root))
        .case(TestCase::new("fails", failing))
        .case(TestCase::new("never", passing));

    let runner = SuiteRunner::new(spawning_config(port, dir.path()))
        .unwrap()
        .with_policy(FailurePolicy::FailFast);
    let report = runner.run(suite).await;

    assert_eq!(report.state, SuiteState::Aborted);
    assert_eq!(report.outcome("serves"), Some(&CaseOutcome::Passed));
    assert_eq!(report.outcome("never"), Some(&CaseOutcome::NotRun));
    assert!(report.teardown_done);
    assert!(port_released(port).await, "service still listening on {}", port);
}
