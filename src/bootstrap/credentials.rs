//! Deterministic password-hashing stubs
//!
//! Schemas and seed data written for pgcrypto call `gen_salt(..)` and
//! `crypt(password, salt)`. The embedded engine has neither, so both are
//! registered as plain scalar functions that never touch real cryptography.

use rusqlite::functions::FunctionFlags;
use rusqlite::Connection;

use crate::engine::{EngineHandle, EngineResult};

/// Salt returned by `gen_salt`
pub const STUB_SALT: &str = "fixture-salt";

/// Marker that identifies an already "hashed" value
pub const HASH_PREFIX: &str = "$fixture$";

/// Replacement `gen_salt` / `crypt` functions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialStubs {
    pub salt: String,
    pub hash_prefix: String,
}

impl Default for CredentialStubs {
    fn default() -> Self {
        Self {
            salt: STUB_SALT.to_string(),
            hash_prefix: HASH_PREFIX.to_string(),
        }
    }
}

impl CredentialStubs {
    pub fn gen_salt(&self) -> String {
        self.salt.clone()
    }

    /// Prefix the plaintext with the hash marker, unless the salt is itself a
    /// previous hash, in which case the plaintext comes back unchanged
    pub fn crypt(&self, plaintext: &str, salt: &str) -> String {
        if salt.starts_with(&self.hash_prefix) {
            plaintext.to_string()
        } else {
            format!("{}{}", self.hash_prefix, plaintext)
        }
    }

    /// Register both functions on a connection; NULL in gives NULL out
    pub fn install(&self, conn: &Connection) -> rusqlite::Result<()> {
        let flags = FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC;

        let salt = self.gen_salt();
        conn.create_scalar_function("gen_salt", -1, flags, move |_| Ok(salt.clone()))?;

        let stubs = self.clone();
        conn.create_scalar_function("crypt", 2, flags, move |ctx| {
            let plaintext: Option<String> = ctx.get(0)?;
            let salt: Option<String> = ctx.get(1)?;
            Ok(plaintext
                .zip(salt)
                .map(|(plaintext, salt)| stubs.crypt(&plaintext, &salt)))
        })?;
        Ok(())
    }
}

/// Install the stubs on the engine's connection
pub async fn install_credential_stubs(
    engine: &EngineHandle,
    stubs: &CredentialStubs,
) -> EngineResult<()> {
    let stubs = stubs.clone();
    engine
        .call(move |conn| stubs.install(conn).map_err(Into::into))
        .await
}
