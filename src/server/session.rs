//! Session state for bridged connections

use crate::engine::ContextId;
use crate::protocol::message::ErrorFields;
use crate::protocol::startup::{server_parameters, StartupParams};
use crate::protocol::{sqlstate, BackendMessage, TransactionStatus};

/// How the bridge authenticates clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthMode {
    /// AuthenticationOk right after startup
    #[default]
    Trust,
    /// Request a cleartext password and accept any value
    AnyPassword,
}

/// Authentication progress of one connection; set once, never reverts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    AwaitingPassword,
    Authenticated,
}

/// Per-connection session state
#[derive(Debug, Clone)]
pub struct Session {
    /// Unique connection identifier, also the engine execution context
    pub connection_id: u32,
    /// User from the startup parameters
    pub user: String,
    /// Database from the startup parameters
    pub database: String,
    pub application_name: Option<String>,
    /// Secret announced in BackendKeyData
    pub secret_key: i32,
    auth: AuthState,
}

impl Session {
    /// Create a session from a startup request
    pub fn new(connection_id: u32, params: &StartupParams, secret_key: i32) -> Self {
        Self {
            connection_id,
            user: params.user().unwrap_or_default().to_string(),
            database: params.database().unwrap_or_default().to_string(),
            application_name: params.application_name().map(str::to_string),
            secret_key,
            auth: AuthState::AwaitingPassword,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.auth == AuthState::Authenticated
    }

    pub fn authenticate(&mut self) {
        self.auth = AuthState::Authenticated;
    }

    /// Engine execution context used for this connection's frames
    pub fn context(&self) -> ContextId {
        self.connection_id
    }

    /// Messages completing the handshake once the client is authenticated
    pub fn welcome(&self) -> Vec<BackendMessage> {
        let mut messages = vec![BackendMessage::AuthenticationOk];
        messages.extend(
            server_parameters(self.application_name.as_deref())
                .into_iter()
                .map(|(name, value)| BackendMessage::ParameterStatus {
                    name: name.to_string(),
                    value,
                }),
        );
        messages.push(BackendMessage::BackendKeyData {
            process_id: self.connection_id as i32,
            secret_key: self.secret_key,
        });
        messages.push(BackendMessage::ReadyForQuery(TransactionStatus::Idle));
        messages
    }

    /// Fatal error sent when the engine never became ready
    pub fn engine_unavailable(reason: &str) -> BackendMessage {
        BackendMessage::ErrorResponse(ErrorFields::fatal(
            sqlstate::CANNOT_CONNECT_NOW,
            format!("database engine is not available: {}", reason),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::startup::{StartupRequest, PROTOCOL_VERSION_3};

    fn params() -> StartupParams {
        let mut body = PROTOCOL_VERSION_3.to_be_bytes().to_vec();
        body.extend_from_slice(b"user\0tester\0database\0app\0\0");
        match StartupRequest::parse(&body).unwrap() {
            StartupRequest::Startup(params) => params,
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_new_session_is_unauthenticated() {
        let mut session = Session::new(3, &params(), 42);
        assert_eq!(session.user, "tester");
        assert_eq!(session.database, "app");
        assert!(!session.is_authenticated());

        session.authenticate();
        assert!(session.is_authenticated());
        assert_eq!(session.context(), 3);
    }

    #[test]
    fn test_welcome_ends_with_ready_for_query() {
        let session = Session::new(9, &params(), 7);
        let welcome = session.welcome();
        assert_eq!(welcome.first(), Some(&BackendMessage::AuthenticationOk));
        assert!(welcome.contains(&BackendMessage::BackendKeyData {
            process_id: 9,
            secret_key: 7
        }));
        assert_eq!(
            welcome.last(),
            Some(&BackendMessage::ReadyForQuery(TransactionStatus::Idle))
        );
    }
}
