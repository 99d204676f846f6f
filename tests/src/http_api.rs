//! Administrative HTTP API suite
//!
//! Walks the integration config, datasource and predictor endpoints in
//! order. Later cases reuse the datasource and predictor created earlier.

use mlharness_core::api::{PredictorRequest, TrainingOptions};
use mlharness_core::ensure_that;
use mlharness_core::scenario::CaseFuture;
use mlharness_core::{
    ApiPredictorStatus, DatasourceSource, FieldRule, FieldType, HarnessResult, RecordSchema,
    ResponseRecord, ResponseValidator, ServiceCommand, Suite, SuiteContext, TestCase,
};
use reqwest::Method;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use tracing::info;

pub const SUITE_NAME: &str = "http";

/// Column the predictor learns
pub const TARGET: &str = "rental_price";

const TEST_INTEGRATION: &str = "test_integration";

/// Keys every default integration must expose with a value
const INTEGRATION_KEYS: [&str; 6] = ["enabled", "host", "port", "password", "type", "user"];

pub fn datasource_name(ctx: &SuiteContext) -> String {
    ctx.unique_name("hr_ds")
}

pub fn predictor_name(ctx: &SuiteContext) -> String {
    ctx.unique_name("hr_predictor")
}

pub fn suite(ctx: &SuiteContext) -> Suite {
    let mut service = ctx.config.service.clone();
    if !service.apis.iter().any(|a| a == "http") {
        service.apis.push("http".to_string());
    }

    Suite::new(SUITE_NAME)
        .service(ServiceCommand::from_config(&service))
        .case(TestCase::new("integrations_config", integrations_config))
        .case(TestCase::new("put_datasource", put_datasource))
        .case(TestCase::new("analyze_datasource", analyze_datasource).depends_on("put_datasource"))
        .case(TestCase::new("put_predictor_and_predict", put_predictor_and_predict).depends_on("put_datasource"))
        .case(TestCase::new("list_datasources", list_datasources))
        .case(TestCase::new("datasource_not_found", datasource_not_found))
        .case(TestCase::new("ping", ping))
        .case(TestCase::new("list_predictors", list_predictors))
        .case(TestCase::new("predictor_not_found", predictor_not_found))
}

fn integrations_config(ctx: &SuiteContext) -> CaseFuture<'_> {
    Box::pin(async move {
        let api = &ctx.api;

        let names: BTreeSet<String> = api.integration_names().await?.into_iter().collect();
        let expected: BTreeSet<String> = ctx.config.suite.expected_integrations.iter().cloned().collect();
        ensure_that!(names == expected, "integrations {:?}, expected {:?}", names, expected);

        info!("🔧 Creating integration {}", TEST_INTEGRATION);
        let params = json!({"enabled": false, "host": "test", "type": "clickhouse"});
        api.create_integration(TEST_INTEGRATION, &params)
            .await?
            .expect_status(200)?;

        let created = api
            .get_integration(TEST_INTEGRATION)
            .await?
            .expect_status(200)?
            .record()?;
        ensure_that!(created.len() == 3, "test integration has {} fields, expected 3", created.len());

        api.delete_integration(TEST_INTEGRATION)
            .await?
            .expect_status(200)?;
        let gone = api.get_integration(TEST_INTEGRATION).await?;
        ensure_that!(!gone.is_success(), "deleted integration still returned {}", gone.status);

        if let Value::Object(sent) = &params {
            for (key, value) in sent {
                ensure_that!(
                    created.get(key) == Some(value),
                    "integration field {} is {:?}, sent {}",
                    key,
                    created.get(key),
                    value
                );
            }
        }

        let schema = INTEGRATION_KEYS
            .iter()
            .fold(RecordSchema::new(), |schema, key| schema.require(key, FieldType::Any));

        for name in &ctx.config.suite.expected_integrations {
            let original = api.get_integration(name).await?.expect_status(200)?.record()?;
            ResponseValidator::validate(&original, &schema)?;

            api.modify_integration(name, &json!({"password": "test"})).await?;
            let modified = api.get_integration(name).await?.expect_status(200)?.record()?;
            ensure_that!(
                modified.str("password") == Some("test"),
                "{} password not modified",
                name
            );
            for (key, value) in original.fields() {
                if key != "password" {
                    ensure_that!(
                        modified.get(key) == Some(value),
                        "{}.{} changed by a password update",
                        name,
                        key
                    );
                }
            }

            let restore = Value::Object(original.fields().clone());
            api.modify_integration(name, &restore).await?;
            let restored = api.get_integration(name).await?.expect_status(200)?.record()?;
            for (key, value) in original.fields() {
                ensure_that!(restored.get(key) == Some(value), "{}.{} not restored", name, key);
            }
        }

        Ok(())
    })
}

fn put_datasource(ctx: &SuiteContext) -> CaseFuture<'_> {
    Box::pin(async move {
        let source = DatasourceSource::Url(ctx.config.fixtures.training_url.clone());
        ctx.api
            .put_datasource(&datasource_name(ctx), &source)
            .await?
            .expect_status(200)?;
        Ok(())
    })
}

fn analyze_datasource(ctx: &SuiteContext) -> CaseFuture<'_> {
    Box::pin(async move {
        ctx.api
            .analyze_datasource(&datasource_name(ctx))
            .await?
            .expect_status(200)?;
        Ok(())
    })
}

fn put_predictor_and_predict(ctx: &SuiteContext) -> CaseFuture<'_> {
    Box::pin(async move {
        let name = predictor_name(ctx);
        let request = PredictorRequest {
            data_source_name: datasource_name(ctx),
            to_predict: TARGET.to_string(),
            kwargs: TrainingOptions::synchronous(ctx.config.training.stop_training_in_x_seconds),
        };

        info!("🧠 Training predictor {}", name);
        ctx.api.put_predictor(&name, &request).await?.expect_status(200)?;
        ctx.waiter
            .await_complete(&name, &ApiPredictorStatus::new(&ctx.api))
            .await?;

        let response = ctx
            .api
            .predict(&name, json!({"sqft": 500}))
            .await?
            .expect_status(200)?;

        let prediction = ResponseRecord::at(&response.body, &format!("/0/{}", TARGET))?;
        let schema = RecordSchema::new().field(FieldRule::new("predicted_value", FieldType::Float));
        let validated = ResponseValidator::validate(&prediction, &schema)?;

        info!(
            "🔮 Predicted {} = {:?}",
            TARGET,
            validated.float("predicted_value")
        );
        Ok(())
    })
}

fn list_datasources(ctx: &SuiteContext) -> CaseFuture<'_> {
    Box::pin(async move {
        ctx.api.list_datasources().await?.expect_status(200)?;
        Ok(())
    })
}

fn datasource_not_found(ctx: &SuiteContext) -> CaseFuture<'_> {
    Box::pin(async move {
        ctx.api
            .send(Method::GET, "/datasource/dummy_source", None)
            .await?
            .expect_status(404)?;
        Ok(())
    })
}

fn ping(ctx: &SuiteContext) -> CaseFuture<'_> {
    Box::pin(async move {
        ctx.api.ping().await?.expect_status(200)?;
        Ok(())
    })
}

fn list_predictors(ctx: &SuiteContext) -> CaseFuture<'_> {
    Box::pin(async move {
        ctx.api.list_predictors().await?.expect_status(200)?;
        Ok(())
    })
}

fn predictor_not_found(ctx: &SuiteContext) -> CaseFuture<'_> {
    Box::pin(async move { check_predictor_absent(ctx, "dummy_predictor").await })
}

async fn check_predictor_absent(ctx: &SuiteContext, name: &str) -> HarnessResult<()> {
    ctx.api.get_predictor(name).await?.expect_status(404)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlharness_core::{HarnessConfig, SuiteRunner};

    fn context() -> SuiteContext {
        SuiteContext::new(HarnessConfig::default()).unwrap()
    }

    #[test]
    fn test_suite_case_order() {
        let suite = suite(&context());
        assert_eq!(
            suite.case_names(),
            vec![
                "integrations_config",
                "put_datasource",
                "analyze_datasource",
                "put_predictor_and_predict",
                "list_datasources",
                "datasource_not_found",
                "ping",
                "list_predictors",
                "predictor_not_found",
            ]
        );
    }

    #[test]
    fn test_names_are_stable_within_a_run() {
        let ctx = context();
        assert_eq!(datasource_name(&ctx), datasource_name(&ctx));
        assert!(predictor_name(&ctx).starts_with("hr_predictor_"));
    }

    #[tokio::test]
    #[ignore] // Run with --ignored flag, requires the service runtime installed
    async fn test_http_suite_live() {
        let config = HarnessConfig::load().expect("Failed to load harness config");
        let runner = SuiteRunner::new(config).expect("Failed to create runner");

        let report = runner.run(suite(runner.context())).await;
        report.log_summary();

        report.into_result().expect("HTTP suite failed");
    }
}
