//! Session configuration, read from a connection file.

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

/// Configuration error.
#[derive(Debug, Error)]
pub enum OptionsError {
    #[error("cannot read connection file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid connection file: {0}")]
    Json(#[from] serde_json::Error),
}

fn default_transport() -> String {
    "tcp".into()
}

fn default_scheme() -> String {
    "hmac-sha256".into()
}

/// Endpoint and signing configuration for one session.
///
/// Mirrors the connection-file document a frontend writes before
/// launching the kernel. A port of `0` binds an ephemeral port; the
/// actually bound endpoints are reported by the session after binding.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionOptions {
    /// Address every channel binds on.
    pub ip: String,
    #[serde(default = "default_transport")]
    pub transport: String,
    pub control_port: u16,
    pub shell_port: u16,
    pub iopub_port: u16,
    pub hb_port: u16,
    /// Accepted for connection-file compatibility; interactive input
    /// is not supported and no socket is bound for it.
    #[serde(default)]
    pub stdin_port: u16,
    /// Signing key; empty disables signing.
    #[serde(default)]
    pub key: String,
    #[serde(default = "default_scheme")]
    pub signature_scheme: String,
}

impl SessionOptions {
    /// Parse options from a connection-file document.
    ///
    /// # Errors
    /// Returns [`OptionsError::Json`] for a malformed document.
    pub fn parse(document: &str) -> Result<Self, OptionsError> {
        Ok(serde_json::from_str(document)?)
    }

    /// Read and parse a connection file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, OptionsError> {
        let document = std::fs::read_to_string(path)?;
        Self::parse(&document)
    }

    /// Bind endpoint for the given port.
    #[must_use]
    pub fn endpoint(&self, port: u16) -> String {
        format!("{}:{port}", self.ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_connection_file() {
        let options = SessionOptions::parse(
            r#"{
                "ip": "127.0.0.1",
                "transport": "tcp",
                "control_port": 50160,
                "shell_port": 57503,
                "iopub_port": 40885,
                "hb_port": 43276,
                "stdin_port": 52597,
                "key": "a0436f6c-1916-498b-8eb9-e81ab9368e84",
                "signature_scheme": "hmac-sha256"
            }"#,
        )
        .unwrap();

        assert_eq!(options.ip, "127.0.0.1");
        assert_eq!(options.shell_port, 57503);
        assert_eq!(options.endpoint(options.shell_port), "127.0.0.1:57503");
        assert_eq!(options.signature_scheme, "hmac-sha256");
    }

    #[test]
    fn test_defaults_for_omitted_fields() {
        let options = SessionOptions::parse(
            r#"{
                "ip": "127.0.0.1",
                "control_port": 1,
                "shell_port": 2,
                "iopub_port": 3,
                "hb_port": 4
            }"#,
        )
        .unwrap();

        assert_eq!(options.transport, "tcp");
        assert_eq!(options.signature_scheme, "hmac-sha256");
        assert!(options.key.is_empty());
        assert_eq!(options.stdin_port, 0);
    }

    #[test]
    fn test_malformed_document_is_an_error() {
        assert!(matches!(
            SessionOptions::parse("not json"),
            Err(OptionsError::Json(_))
        ));
    }
}
