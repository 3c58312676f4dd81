//! Schema bootstrapping
//!
//! Brings a freshly started engine to the state tests expect, in three steps
//! that each abort the whole bootstrap on failure:
//!
//! 1. install the credential stubs the schema and seed call into
//! 2. apply the sanitized schema as one batch
//! 3. insert the seed rows

pub mod credentials;
pub mod schema;
pub mod seed;

use thiserror::Error;
use tracing::info;

use crate::engine::{EngineError, EngineHandle};

pub use credentials::{install_credential_stubs, CredentialStubs, HASH_PREFIX, STUB_SALT};
pub use schema::sanitize;
pub use seed::{insert_seed, SeedRow, SeedSet, SeedValue};

#[derive(Error, Debug)]
pub enum BootstrapError {
    #[error("Installing credential stubs failed: {0}")]
    CredentialStubs(#[source] EngineError),
    #[error("Applying schema failed: {0}")]
    Schema(#[source] EngineError),
    #[error("Inserting seed rows failed: {0}")]
    Seed(#[source] EngineError),
}

/// Install stubs, apply `schema` and insert `seed`; returns the rows inserted
pub async fn bootstrap(
    engine: &EngineHandle,
    schema: &str,
    stubs: &CredentialStubs,
    seed: &SeedSet,
) -> Result<usize, BootstrapError> {
    install_credential_stubs(engine, stubs)
        .await
        .map_err(BootstrapError::CredentialStubs)?;

    let sanitized = sanitize(schema).into_owned();
    engine
        .exec_batch(sanitized)
        .await
        .map_err(BootstrapError::Schema)?;

    let inserted = reseed(engine, seed).await?;
    info!(seed_rows = inserted, "Bootstrap complete");
    Ok(inserted)
}

/// Apply the seed step again; rows already present are left alone
pub async fn reseed(engine: &EngineHandle, seed: &SeedSet) -> Result<usize, BootstrapError> {
    if seed.is_empty() {
        return Ok(0);
    }

    let seed = seed.clone();
    engine
        .call(move |conn| insert_seed(conn, &seed).map_err(EngineError::from))
        .await
        .map_err(BootstrapError::Seed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EmbeddedEngine, EngineConfig};

    const SCHEMA: &str = "
        CREATE EXTENSION IF NOT EXISTS pgcrypto;
        CREATE TABLE users (
            id TEXT PRIMARY KEY,
            email TEXT NOT NULL UNIQUE,
            name TEXT,
            password_hash TEXT,
            invited_by TEXT REFERENCES users(id)
        );";

    #[tokio::test]
    async fn test_bootstrap_then_reseed() {
        let engine = EmbeddedEngine::start(EngineConfig::default()).unwrap();
        engine.ready().await.unwrap();
        let handle = engine.handle();

        let inserted = bootstrap(
            &handle,
            SCHEMA,
            &CredentialStubs::default(),
            &SeedSet::invited_users(),
        )
        .await
        .unwrap();
        assert_eq!(inserted, 2);
        assert_eq!(reseed(&handle, &SeedSet::invited_users()).await.unwrap(), 0);

        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_schema_failure_is_reported() {
        let engine = EmbeddedEngine::start(EngineConfig::default()).unwrap();
        let handle = engine.handle();

        let err = bootstrap(
            &handle,
            "CREATE TABLE broken (",
            &CredentialStubs::default(),
            &SeedSet::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, BootstrapError::Schema(_)));

        engine.shutdown().await.unwrap();
    }
}
