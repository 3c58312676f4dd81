//! pgharness - disposable Postgres-wire database fixture for integration tests
//!
//! Features:
//! - Postgres v3 wire protocol bridge over a real TCP socket
//! - Embedded in-process SQLite engine, one per fixture session
//! - Schema bootstrapping with credential stubs and idempotent seed rows
//! - Stub and HTTP checkout gateways for the application under test

pub mod app;
pub mod bootstrap;
pub mod engine;
pub mod fixture;
pub mod gateway;
pub mod protocol;
pub mod server;

pub use app::{AppRequest, AppResponse, AppWiring, CookieSecret, RequestDispatch};
pub use engine::{EmbeddedEngine, EngineConfig, EngineError, EngineHandle};
pub use fixture::{
    no_app, with_fixture, FixtureConfig, FixtureError, FixtureSession, FixtureState,
    GatewayMode, SetupError, TeardownError,
};
pub use server::{AuthMode, Bridge, ServerHandle};
