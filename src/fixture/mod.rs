//! Fixture lifecycle
//!
//! A [`FixtureSession`] owns one embedded engine, one bridge listener and one
//! client connected through it. Sessions move through
//!
//! ```text
//! Idle -> PortAllocated -> EngineStarting -> EngineReady -> Bootstrapped
//!      -> Serving -> TearingDown -> Closed
//! ```
//!
//! Setup failures release whatever was already started before the error is
//! returned. [`with_fixture`] runs a test body between start and close and
//! closes the session even when the body panics.

pub mod config;
pub mod error;
pub mod port;

use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, error, info, warn};

use crate::app::{AppWiring, CookieSecret};
use crate::bootstrap::{self, BootstrapError, SeedSet};
use crate::engine::{EmbeddedEngine, EngineHandle};
use crate::gateway::CheckoutGateway;
use crate::server::{Bridge, ServerHandle};

pub use config::{FixtureConfig, GatewayMode};
pub use error::{FixtureError, SetupError, TeardownError, TeardownFailure};

/// Boxed test body future borrowing the session
pub type BodyFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixtureState {
    Idle,
    PortAllocated,
    EngineStarting,
    EngineReady,
    Bootstrapped,
    Serving,
    TearingDown,
    Closed,
}

impl FixtureState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FixtureState::Idle => "idle",
            FixtureState::PortAllocated => "port_allocated",
            FixtureState::EngineStarting => "engine_starting",
            FixtureState::EngineReady => "engine_ready",
            FixtureState::Bootstrapped => "bootstrapped",
            FixtureState::Serving => "serving",
            FixtureState::TearingDown => "tearing_down",
            FixtureState::Closed => "closed",
        }
    }
}

impl fmt::Display for FixtureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn transition(state: FixtureState, port: Option<u16>) {
    info!(state = state.as_str(), port, "Fixture state");
}

/// Resources that must not outlive the session.
///
/// Dropping the guard aborts the accept loop and asks the engine to stop;
/// orderly release goes through [`Resources::release`] or `close`.
#[derive(Default)]
struct Resources {
    engine: Option<EmbeddedEngine>,
    server: Option<ServerHandle>,
    client_task: Option<JoinHandle<()>>,
}

impl Resources {
    /// Release after a setup failure; errors are logged, not returned
    async fn release(mut self) {
        if let Some(task) = self.client_task.take() {
            task.abort();
        }
        if let Some(server) = self.server.take() {
            if let Err(e) = server.shutdown().await {
                warn!(error = %e, "Bridge did not stop cleanly after setup failure");
            }
        }
        if let Some(engine) = self.engine.take() {
            if let Err(e) = engine.shutdown().await {
                warn!(error = %e, "Engine did not stop cleanly after setup failure");
            }
        }
    }
}

impl Drop for Resources {
    fn drop(&mut self) {
        if let Some(task) = self.client_task.take() {
            task.abort();
        }
        if let Some(server) = self.server.take() {
            warn!("Fixture dropped without close; aborting bridge");
            server.abort();
        }
        // EmbeddedEngine requests its own stop on drop
        drop(self.engine.take());
    }
}

/// One running fixture
pub struct FixtureSession<A> {
    state: FixtureState,
    port: u16,
    addr: SocketAddr,
    connection_string: String,
    database_url: String,
    engine: EngineHandle,
    client: Client,
    app: A,
    gateway: Arc<dyn CheckoutGateway>,
    cookie_secret: CookieSecret,
    seed: SeedSet,
    teardown_timeout: Duration,
    resources: Resources,
}

impl<A> FixtureSession<A> {
    /// Bring a session up to `Serving`.
    ///
    /// `factory` receives the connection targets, the gateway and the cookie
    /// secret and builds the application handle passed to tests.
    pub async fn start<F, E>(config: FixtureConfig, factory: F) -> Result<Self, SetupError>
    where
        F: FnOnce(AppWiring) -> Result<A, E>,
        E: fmt::Display,
    {
        let mut resources = Resources::default();
        match Self::assemble(config, factory, &mut resources).await {
            Ok(session) => Ok(session),
            Err(e) => {
                error!(error = %e, "Fixture setup failed");
                resources.release().await;
                Err(e)
            }
        }
    }

    async fn assemble<F, E>(
        config: FixtureConfig,
        factory: F,
        resources: &mut Resources,
    ) -> Result<Self, SetupError>
    where
        F: FnOnce(AppWiring) -> Result<A, E>,
        E: fmt::Display,
    {
        transition(FixtureState::Idle, None);
        let (listener, port) = port::bind_random_port(
            &config.host,
            &config.port_range,
            config.max_port_attempts,
        )
        .await?;
        transition(FixtureState::PortAllocated, Some(port));

        let engine = EmbeddedEngine::start(config.engine.clone())?;
        let handle = engine.handle();
        resources.engine = Some(engine);
        transition(FixtureState::EngineStarting, Some(port));

        match config.ready_timeout {
            Some(limit) => tokio::time::timeout(limit, handle.ready())
                .await
                .map_err(|_| SetupError::EngineNotReady(limit))??,
            None => handle.ready().await?,
        }
        transition(FixtureState::EngineReady, Some(port));

        bootstrap::bootstrap(
            &handle,
            &config.schema,
            &config.credential_stubs,
            &config.seed,
        )
        .await?;

        let server = Bridge::from_listener(listener, handle.clone(), config.auth_mode)
            .with_drain_timeout(config.teardown_timeout)
            .spawn()?;
        let addr = server.addr();
        resources.server = Some(server);

        let connection_string = config.connection_string(port);
        let database_url = config.database_url(port);
        let gateway = config.gateway.build();
        let wiring = AppWiring {
            connection_string: connection_string.clone(),
            database_url: database_url.clone(),
            gateway: Arc::clone(&gateway),
            cookie_secret: config.cookie_secret.clone(),
        };
        let app = factory(wiring).map_err(|e| SetupError::App(e.to_string()))?;
        transition(FixtureState::Bootstrapped, Some(port));

        let (client, client_task) = open_client(&connection_string).await?;
        resources.client_task = Some(client_task);
        transition(FixtureState::Serving, Some(port));

        Ok(Self {
            state: FixtureState::Serving,
            port,
            addr,
            connection_string,
            database_url,
            engine: handle,
            client,
            app,
            gateway,
            cookie_secret: config.cookie_secret,
            seed: config.seed,
            teardown_timeout: config.teardown_timeout,
            resources: std::mem::take(resources),
        })
    }

    pub fn state(&self) -> FixtureState {
        self.state
    }

    /// Client connected through the bridge
    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn app(&self) -> &A {
        &self.app
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    pub fn gateway(&self) -> &Arc<dyn CheckoutGateway> {
        &self.gateway
    }

    pub fn cookie_secret(&self) -> &CookieSecret {
        &self.cookie_secret
    }

    /// Direct handle to the embedded engine
    pub fn engine(&self) -> &EngineHandle {
        &self.engine
    }

    /// Bridge connections currently open, including the session's own client
    pub fn open_connections(&self) -> usize {
        self.resources
            .server
            .as_ref()
            .map_or(0, ServerHandle::open_connections)
    }

    /// Open another independent client through the bridge
    pub async fn connect(&self) -> Result<(Client, JoinHandle<()>), tokio_postgres::Error> {
        open_client(&self.connection_string).await
    }

    /// Insert the session's seed rows again; existing rows are left alone
    pub async fn reseed(&self) -> Result<usize, BootstrapError> {
        bootstrap::reseed(&self.engine, &self.seed).await
    }

    /// Tear the session down: client first, then the bridge, then the engine.
    ///
    /// Every step is attempted; failures are collected into one error.
    pub async fn close(self) -> Result<(), TeardownError> {
        let FixtureSession {
            port,
            client,
            teardown_timeout,
            mut resources,
            ..
        } = self;
        transition(FixtureState::TearingDown, Some(port));

        let mut failures = Vec::new();

        drop(client);
        if let Some(mut task) = resources.client_task.take() {
            match tokio::time::timeout(teardown_timeout, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => failures.push(TeardownFailure::new("client", e.to_string())),
                Err(_) => {
                    task.abort();
                    failures.push(TeardownFailure::new(
                        "client",
                        format!("connection did not close within {:?}", teardown_timeout),
                    ));
                }
            }
        }

        if let Some(server) = resources.server.take() {
            if let Err(e) = server.shutdown().await {
                failures.push(TeardownFailure::new("listener", e.to_string()));
            }
        }

        if let Some(engine) = resources.engine.take() {
            if let Err(e) = engine.shutdown().await {
                failures.push(TeardownFailure::new("engine", e.to_string()));
            }
        }

        transition(FixtureState::Closed, Some(port));
        if failures.is_empty() {
            Ok(())
        } else {
            for failure in &failures {
                warn!(resource = failure.resource, error = %failure.message, "Teardown step failed");
            }
            Err(TeardownError { failures })
        }
    }
}

async fn open_client(
    connection_string: &str,
) -> Result<(Client, JoinHandle<()>), tokio_postgres::Error> {
    let (client, connection) = tokio_postgres::connect(connection_string, NoTls).await?;
    let task = tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!(error = %e, "Client connection ended with error");
        }
    });
    Ok((client, task))
}

/// Factory for tests that need no application
pub fn no_app(_: AppWiring) -> Result<(), Infallible> {
    Ok(())
}

/// Start a session, run `body` against it and close it.
///
/// The session is closed whether the body returns or panics; a panic is
/// resumed after teardown. Teardown errors are only reported when the body
/// returned normally.
pub async fn with_fixture<A, F, E, B, T>(
    config: FixtureConfig,
    factory: F,
    body: B,
) -> Result<T, FixtureError>
where
    A: Send + Sync,
    F: FnOnce(AppWiring) -> Result<A, E>,
    E: fmt::Display,
    B: for<'a> FnOnce(&'a FixtureSession<A>) -> BodyFuture<'a, T>,
{
    let session = FixtureSession::start(config, factory).await?;

    let outcome = {
        let mut run = body(&session);
        std::future::poll_fn(|cx| {
            match panic::catch_unwind(AssertUnwindSafe(|| run.as_mut().poll(cx))) {
                Ok(Poll::Pending) => Poll::Pending,
                Ok(Poll::Ready(value)) => Poll::Ready(Ok(value)),
                Err(payload) => Poll::Ready(Err(payload)),
            }
        })
        .await
    };

    let closed = session.close().await;
    match outcome {
        Ok(value) => {
            closed?;
            Ok(value)
        }
        Err(payload) => {
            if let Err(e) = closed {
                error!(error = %e, "Teardown failed after test body panicked");
            }
            panic::resume_unwind(payload)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_start_serves_and_closes() {
        let session = FixtureSession::start(FixtureConfig::default(), no_app)
            .await
            .unwrap();
        assert_eq!(session.state(), FixtureState::Serving);
        assert!((20000..=29999).contains(&session.port()));
        assert_eq!(session.addr().port(), session.port());

        let row = session.client().query_one("SELECT 1", &[]).await.unwrap();
        let one: i64 = row.get(0);
        assert_eq!(one, 1);

        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_factory_failure_is_setup_error() {
        let err = FixtureSession::<()>::start(FixtureConfig::default(), |_| {
            Err::<(), _>("no application today")
        })
        .await
        .err()
        .unwrap();
        assert!(matches!(err, SetupError::App(ref msg) if msg == "no application today"));
    }

    #[tokio::test]
    async fn test_with_fixture_returns_body_value() {
        let value = with_fixture(FixtureConfig::default(), no_app, |fx| {
            Box::pin(async move { fx.port() })
        })
        .await
        .unwrap();
        assert!((20000..=29999).contains(&value));
    }

    #[test]
    fn test_state_names() {
        assert_eq!(FixtureState::PortAllocated.to_string(), "port_allocated");
        assert_eq!(FixtureState::Closed.as_str(), "closed");
    }
}
