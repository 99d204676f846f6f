//! Common utilities for E2E suites

use anyhow::Result;
use mlharness_core::{FailurePolicy, HarnessConfig, Suite, SuiteContext};
use tracing::Level;

use crate::{http_api, sql_flow};

/// Suite names accepted by the CLI
pub const SUITE_NAMES: [&str; 2] = [http_api::SUITE_NAME, sql_flow::SUITE_NAME];

/// Run-time switches layered over the loaded configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Use an already running service instead of spawning one
    pub attach: bool,
    pub continue_on_failure: bool,
}

/// Load the harness configuration and apply CLI switches
pub fn load_config(options: RunOptions) -> Result<HarnessConfig> {
    let mut config = HarnessConfig::load()?;

    if options.attach {
        config.service.spawn = false;
    }
    if options.continue_on_failure {
        config.suite.failure_policy = FailurePolicy::Continue;
    }

    Ok(config)
}

/// Build a suite by name
pub fn build_suite(name: &str, ctx: &SuiteContext) -> Option<Suite> {
    match name {
        http_api::SUITE_NAME => Some(http_api::suite(ctx)),
        sql_flow::SUITE_NAME => Some(sql_flow::suite(ctx)),
        _ => None,
    }
}

pub fn init_tracing(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let _ = tracing_subscriber::fmt().with_max_level(level).try_init();
}
