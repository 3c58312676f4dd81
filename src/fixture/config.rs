//! Fixture configuration
//!
//! `FixtureConfig` is the only source of settings for a session. Nothing is
//! read from the environment; the cookie secret in particular is generated
//! once here and handed to both the application and the test.

use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;

use crate::app::CookieSecret;
use crate::bootstrap::{CredentialStubs, SeedSet};
use crate::engine::EngineConfig;
use crate::gateway::{CheckoutGateway, HttpCheckoutGateway, StubCheckoutGateway};
use crate::server::AuthMode;

pub const DEFAULT_PORT_RANGE: RangeInclusive<u16> = 20000..=29999;
pub const DEFAULT_MAX_PORT_ATTEMPTS: usize = 8;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_TEARDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Which payment gateway the application is wired to
#[derive(Debug, Clone)]
pub enum GatewayMode {
    Stub(StubCheckoutGateway),
    Live(HttpCheckoutGateway),
}

impl Default for GatewayMode {
    fn default() -> Self {
        GatewayMode::Stub(StubCheckoutGateway::default())
    }
}

impl GatewayMode {
    pub fn build(&self) -> Arc<dyn CheckoutGateway> {
        match self {
            GatewayMode::Stub(stub) => Arc::new(stub.clone()),
            GatewayMode::Live(http) => Arc::new(http.clone()),
        }
    }
}

/// Settings for one fixture session
#[derive(Debug, Clone)]
pub struct FixtureConfig {
    /// Ports tried when allocating the bridge listener
    pub port_range: RangeInclusive<u16>,
    pub max_port_attempts: usize,
    pub host: String,
    pub auth_mode: AuthMode,
    pub user: String,
    pub password: String,
    pub database: String,
    /// Schema text, applied after extension statements are stripped
    pub schema: String,
    pub seed: SeedSet,
    pub credential_stubs: CredentialStubs,
    pub cookie_secret: CookieSecret,
    pub gateway: GatewayMode,
    pub engine: EngineConfig,
    /// Limit on waiting for engine readiness; unbounded when `None`
    pub ready_timeout: Option<Duration>,
    /// Limit on each teardown step that waits on connections
    pub teardown_timeout: Duration,
}

impl Default for FixtureConfig {
    fn default() -> Self {
        Self {
            port_range: DEFAULT_PORT_RANGE,
            max_port_attempts: DEFAULT_MAX_PORT_ATTEMPTS,
            host: DEFAULT_HOST.to_string(),
            auth_mode: AuthMode::AnyPassword,
            user: "postgres".to_string(),
            password: "postgres".to_string(),
            database: "postgres".to_string(),
            schema: String::new(),
            seed: SeedSet::new(),
            credential_stubs: CredentialStubs::default(),
            cookie_secret: CookieSecret::random(),
            gateway: GatewayMode::default(),
            engine: EngineConfig::default(),
            ready_timeout: None,
            teardown_timeout: DEFAULT_TEARDOWN_TIMEOUT,
        }
    }
}

impl FixtureConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    pub fn with_seed(mut self, seed: SeedSet) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_port_range(mut self, range: RangeInclusive<u16>) -> Self {
        self.port_range = range;
        self
    }

    pub fn with_max_port_attempts(mut self, attempts: usize) -> Self {
        self.max_port_attempts = attempts;
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_auth_mode(mut self, mode: AuthMode) -> Self {
        self.auth_mode = mode;
        self
    }

    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = user.into();
        self.password = password.into();
        self
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    pub fn with_credential_stubs(mut self, stubs: CredentialStubs) -> Self {
        self.credential_stubs = stubs;
        self
    }

    pub fn with_cookie_secret(mut self, secret: CookieSecret) -> Self {
        self.cookie_secret = secret;
        self
    }

    pub fn with_gateway(mut self, gateway: GatewayMode) -> Self {
        self.gateway = gateway;
        self
    }

    pub fn with_engine(mut self, engine: EngineConfig) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = Some(timeout);
        self
    }

    pub fn with_teardown_timeout(mut self, timeout: Duration) -> Self {
        self.teardown_timeout = timeout;
        self
    }

    /// Key/value connection string for a bridge on `port`
    pub fn connection_string(&self, port: u16) -> String {
        format!(
            "host={} port={} user={} password={} dbname={}",
            self.host, port, self.user, self.password, self.database
        )
    }

    /// `postgres://` URL for a bridge on `port`
    pub fn database_url(&self, port: u16) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, port, self.database
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = FixtureConfig::default();
        assert_eq!(config.port_range, 20000..=29999);
        assert_eq!(config.max_port_attempts, 8);
        assert_eq!(config.auth_mode, AuthMode::AnyPassword);
        assert!(config.ready_timeout.is_none());
        assert!(matches!(config.gateway, GatewayMode::Stub(_)));
    }

    #[test]
    fn test_connection_targets() {
        let config = FixtureConfig::new()
            .with_credentials("app", "pw")
            .with_database("billing");
        assert_eq!(
            config.connection_string(20001),
            "host=127.0.0.1 port=20001 user=app password=pw dbname=billing"
        );
        assert_eq!(
            config.database_url(20001),
            "postgres://app:pw@127.0.0.1:20001/billing"
        );
    }

    #[test]
    fn test_each_config_gets_its_own_secret() {
        let a = FixtureConfig::default();
        let b = FixtureConfig::default();
        assert_ne!(a.cookie_secret, b.cookie_secret);

        let shared = CookieSecret::new("fixed");
        let c = FixtureConfig::new().with_cookie_secret(shared.clone());
        assert_eq!(c.cookie_secret, shared);
    }
}
