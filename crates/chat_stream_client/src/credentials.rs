//! Where the connection credential comes from. Refresh and expiry belong to
//! the source; the client only asks for the current token when it has to
//! open a connection.

use crate::error::{ClientError, Result};

pub trait CredentialSource: Send + Sync {
    fn credential(&self) -> Result<String>;
}

/// A fixed token.
#[derive(Debug, Clone)]
pub struct StaticCredential(String);

impl StaticCredential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl CredentialSource for StaticCredential {
    fn credential(&self) -> Result<String> {
        if self.0.is_empty() {
            return Err(ClientError::Credential("token is empty".into()));
        }
        Ok(self.0.clone())
    }
}

/// Reads the token from an environment variable on every call.
#[derive(Debug, Clone)]
pub struct EnvCredential {
    var: String,
}

impl EnvCredential {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl CredentialSource for EnvCredential {
    fn credential(&self) -> Result<String> {
        match std::env::var(&self.var) {
            Ok(token) if !token.is_empty() => Ok(token),
            _ => Err(ClientError::Credential(format!("{} is not set", self.var))),
        }
    }
}

impl<F> CredentialSource for F
where
    F: Fn() -> Result<String> + Send + Sync,
{
    fn credential(&self) -> Result<String> {
        self()
    }
}
