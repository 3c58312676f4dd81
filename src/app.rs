//! Boundary to the application under test
//!
//! The fixture never builds application values. It hands an [`AppWiring`] to a
//! caller-supplied factory and passes whatever comes back to the test body.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use rand::RngCore;

use crate::gateway::CheckoutGateway;

/// Request dispatched into the application
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl AppRequest {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new("GET", path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new("POST", path)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// First header with this name, compared case-insensitively
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Status and headers returned by the application
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
}

impl AppResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Request dispatch handle of the application under test
#[async_trait]
pub trait RequestDispatch: Send + Sync {
    async fn dispatch(&self, request: AppRequest) -> AppResponse;
}

/// Secret used to sign session cookies, shared by the application and the test
#[derive(Clone, PartialEq, Eq)]
pub struct CookieSecret(String);

impl CookieSecret {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// Fresh random secret, hex encoded
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes.iter().map(|b| format!("{:02x}", b)).collect())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for CookieSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CookieSecret(<redacted>)")
    }
}

/// Everything an application factory receives from the fixture
#[derive(Clone)]
pub struct AppWiring {
    /// Key/value connection string, e.g. `host=127.0.0.1 port=20001 ...`
    pub connection_string: String,
    /// Same target as a `postgres://` URL
    pub database_url: String,
    pub gateway: Arc<dyn CheckoutGateway>,
    pub cookie_secret: CookieSecret,
}

impl fmt::Debug for AppWiring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppWiring")
            .field("connection_string", &self.connection_string)
            .field("database_url", &self.database_url)
            .field("cookie_secret", &self.cookie_secret)
            .finish_non_exhaustive()
    }
}
