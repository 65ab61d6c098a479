//! Credential lookup for provider API keys

use crate::error::{Result, VoiceError};
use secrecy::SecretString;
use std::collections::HashMap;

/// Resolves a named secret, e.g. `OPENAI_API_KEY`.
pub trait CredentialProvider: Send + Sync {
    fn credential(&self, name: &str) -> Result<SecretString>;
}

/// Reads credentials from process environment variables.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvCredentials;

impl CredentialProvider for EnvCredentials {
    fn credential(&self, name: &str) -> Result<SecretString> {
        match std::env::var(name) {
            Ok(value) if !value.trim().is_empty() => Ok(SecretString::from(value)),
            Ok(_) => Err(VoiceError::Credential(format!("{} is empty", name))),
            Err(e) => Err(VoiceError::Credential(format!("{}: {}", name, e))),
        }
    }
}

/// Fixed set of credentials, mostly useful in tests and embedded setups.
#[derive(Default)]
pub struct StaticCredentials {
    values: HashMap<String, String>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }
}

impl CredentialProvider for StaticCredentials {
    fn credential(&self, name: &str) -> Result<SecretString> {
        self.values
            .get(name)
            .map(|v| SecretString::from(v.clone()))
            .ok_or_else(|| VoiceError::Credential(format!("no credential named {}", name)))
    }
}
