//! Protocol bridge
//!
//! Accepts client connections and relays their frames to the embedded engine.

pub mod handler;
pub mod listener;
pub mod session;

use thiserror::Error;

use crate::engine::EngineError;
use crate::protocol::ProtocolError;

pub use listener::{Bridge, ServerHandle, DEFAULT_DRAIN_TIMEOUT};
pub use session::{AuthMode, Session};

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
    #[error("Accept loop failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
