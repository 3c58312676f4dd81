//! PostgreSQL wire protocol
//!
//! Framing is shared by the bridge (which only reads tags and lengths) and the
//! engine (which decodes message bodies and encodes replies).

pub mod error;
pub mod frame;
pub mod message;
pub mod startup;
pub mod types;

pub use error::{sqlstate, ProtocolError, ProtocolResult};
pub use frame::{Frame, FrameReader, FrameWriter};
pub use message::{BackendMessage, FrontendMessage, TransactionStatus};
