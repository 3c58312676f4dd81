//! Fixture error types

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::bootstrap::BootstrapError;
use crate::engine::EngineError;
use crate::server::ServerError;

/// Failure before the test body runs; everything already started is released
#[derive(Error, Debug)]
pub enum SetupError {
    #[error("Invalid fixture configuration: {0}")]
    Config(String),
    #[error("No free port after {attempts} attempts: {last}")]
    PortExhausted { attempts: usize, last: String },
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
    #[error("Engine not ready after {0:?}")]
    EngineNotReady(Duration),
    #[error("Bootstrap failed: {0}")]
    Bootstrap(#[from] BootstrapError),
    #[error("Bridge error: {0}")]
    Server(#[from] ServerError),
    #[error("Application factory failed: {0}")]
    App(String),
    #[error("Client connection failed: {0}")]
    Client(#[from] tokio_postgres::Error),
}

/// One resource that failed to close
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownFailure {
    pub resource: &'static str,
    pub message: String,
}

impl TeardownFailure {
    pub fn new(resource: &'static str, message: impl Into<String>) -> Self {
        Self {
            resource,
            message: message.into(),
        }
    }
}

impl fmt::Display for TeardownFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.resource, self.message)
    }
}

/// Every close step that failed, collected after all were attempted
#[derive(Error, Debug)]
#[error("Teardown failed: {}", join_failures(.failures))]
pub struct TeardownError {
    pub failures: Vec<TeardownFailure>,
}

fn join_failures(failures: &[TeardownFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Error, Debug)]
pub enum FixtureError {
    #[error(transparent)]
    Setup(#[from] SetupError),
    #[error(transparent)]
    Teardown(#[from] TeardownError),
}
