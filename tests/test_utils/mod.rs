//! Shared test utilities
//!
//! Note: clippy reports false-positive dead_code warnings because it can't
//! trace usage across test binaries. These utilities are used by multiple tests.

#![allow(dead_code)]

pub mod billing;
pub mod wire;

use std::time::Duration;

use pgharness::bootstrap::SeedSet;
use pgharness::FixtureConfig;
use tracing_subscriber::EnvFilter;

/// Billing application schema, including a `CREATE EXTENSION` line
pub const SCHEMA: &str = include_str!("../fixtures/schema.sql");

/// Install a subscriber once per test binary; `RUST_LOG` selects the level
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Config with the billing schema and the alice/bob seed rows
pub fn billing_config() -> FixtureConfig {
    FixtureConfig::new()
        .with_schema(SCHEMA)
        .with_seed(SeedSet::invited_users())
        .with_ready_timeout(Duration::from_secs(10))
}

/// Poll `check` until it holds or `timeout` passes
pub async fn eventually<F: FnMut() -> bool>(timeout: Duration, mut check: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
