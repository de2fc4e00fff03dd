//! Error types for the mail server

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SmtpError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(#[source] io::Error),

    #[error("Line too long (max {max} characters)")]
    LineTooLong { max: usize },

    #[error("Command timeout exceeded")]
    Timeout,

    #[error("Server is shutting down")]
    Shutdown,

    #[error("Failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SmtpError {
    /// Reply code sent to the client before the session is torn down.
    pub fn to_response_code(&self) -> u16 {
        match self {
            SmtpError::LineTooLong { .. } => 500,
            SmtpError::Config(_) => 451,
            _ => 421,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid TLS material: {0}")]
    Tls(String),

    #[error("Invalid DKIM key for {domain}: {reason}")]
    DkimKey { domain: String, reason: String },

    #[error("{0}")]
    Invalid(String),
}
