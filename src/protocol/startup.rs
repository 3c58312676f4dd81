//! Startup phase of the connection
//!
//! The first frame a client sends has no tag. Its leading int32 selects what
//! kind of request it is: a protocol 3.0 startup with key/value parameters,
//! an SSL or GSS encryption request, or a cancel request.

use std::collections::BTreeMap;

use super::error::{ProtocolError, ProtocolResult};
use super::message::BodyReader;

/// Protocol 3.0
pub const PROTOCOL_VERSION_3: i32 = 196_608;

/// Request codes that share the startup frame slot
pub const CANCEL_REQUEST_CODE: i32 = 80_877_102;
pub const SSL_REQUEST_CODE: i32 = 80_877_103;
pub const GSSENC_REQUEST_CODE: i32 = 80_877_104;

/// Single-byte reply refusing SSL/GSS encryption
pub const ENCRYPTION_NOT_SUPPORTED: u8 = b'N';

/// Server version announced in ParameterStatus
pub const SERVER_VERSION: &str = "16.0 (pgharness)";

/// Decoded startup frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartupRequest {
    Startup(StartupParams),
    SslRequest,
    GssEncRequest,
    Cancel { process_id: i32, secret_key: i32 },
}

impl StartupRequest {
    /// Parse the bytes following the length word
    pub fn parse(body: &[u8]) -> ProtocolResult<Self> {
        let mut reader = BodyReader::new(body);
        let code = reader.read_i32()?;

        match code {
            SSL_REQUEST_CODE => Ok(StartupRequest::SslRequest),
            GSSENC_REQUEST_CODE => Ok(StartupRequest::GssEncRequest),
            CANCEL_REQUEST_CODE => Ok(StartupRequest::Cancel {
                process_id: reader.read_i32()?,
                secret_key: reader.read_i32()?,
            }),
            version if version >> 16 == 3 => {
                let mut params = BTreeMap::new();
                loop {
                    let key = reader.read_cstr()?;
                    if key.is_empty() {
                        break;
                    }
                    let value = reader.read_cstr()?;
                    params.insert(key, value);
                }
                Ok(StartupRequest::Startup(StartupParams { params }))
            }
            other => Err(ProtocolError::Unsupported(format!(
                "protocol version {}.{}",
                other >> 16,
                other & 0xffff
            ))),
        }
    }
}

/// Key/value parameters from the startup frame
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartupParams {
    params: BTreeMap<String, String>,
}

impl StartupParams {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    pub fn user(&self) -> Option<&str> {
        self.get("user")
    }

    /// Requested database, defaulting to the user name like the server does
    pub fn database(&self) -> Option<&str> {
        self.get("database").or_else(|| self.user())
    }

    pub fn application_name(&self) -> Option<&str> {
        self.get("application_name")
    }
}

/// ParameterStatus values sent once authentication completes
pub fn server_parameters(application_name: Option<&str>) -> Vec<(&'static str, String)> {
    vec![
        ("server_version", SERVER_VERSION.to_string()),
        ("server_encoding", "UTF8".to_string()),
        ("client_encoding", "UTF8".to_string()),
        ("DateStyle", "ISO, MDY".to_string()),
        ("integer_datetimes", "on".to_string()),
        ("standard_conforming_strings", "on".to_string()),
        ("TimeZone", "UTC".to_string()),
        (
            "application_name",
            application_name.unwrap_or_default().to_string(),
        ),
    ]
}
