//! Server configuration, loaded from a TOML file.

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::BufReader as StdBufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use openssl::pkey::PKey;
use rustls::{Certificate, PrivateKey, ServerConfig};
use rustls_pemfile::{certs, pkcs8_private_keys, rsa_private_keys};
use serde::Deserialize;
use tokio_rustls::TlsAcceptor;

use crate::dkim::DkimKey;
use crate::error::ConfigError;

/// How a listening port protects its connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityMode {
    /// Plaintext; STARTTLS may still be offered.
    None,
    /// Plaintext until STARTTLS, which is mandatory before any mail transaction.
    StartTls,
    /// TLS handshake immediately after accept.
    Tls,
}

impl fmt::Display for SecurityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SecurityMode::None => "plain",
            SecurityMode::StartTls => "starttls",
            SecurityMode::Tls => "tls",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PortConfig {
    #[serde(default = "default_host")]
    pub host: String,
    pub port: u16,
    #[serde(default = "default_security")]
    pub security: SecurityMode,
}

impl PortConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    pub certificate_path: PathBuf,
    pub private_key_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DkimDomainConfig {
    #[serde(default = "default_selector")]
    pub selector: String,
    pub private_key_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub hostname: String,
    pub storage_path: PathBuf,
    pub user_store_path: Option<PathBuf>,
    pub mailing_list_path: Option<PathBuf>,
    pub max_message_size: usize,
    pub max_recipients: usize,
    pub command_timeout_seconds: u64,
    pub enable_auth: bool,
    pub enable_starttls: bool,
    pub enable_vrfy: bool,
    pub enable_expn: bool,
    /// Enforces SPF at MAIL FROM and DKIM at end of data.
    pub require_dkim: bool,
    pub enforce_dmarc: bool,
    pub spf_fail_open: bool,
    pub dmarc_fail_open: bool,
    pub blocked_subject_phrases: Vec<String>,
    pub tls: Option<TlsConfig>,
    pub ports: Vec<PortConfig>,
    pub dkim: HashMap<String, DkimDomainConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            storage_path: PathBuf::from("spool"),
            user_store_path: None,
            mailing_list_path: None,
            max_message_size: 10 * 1024 * 1024,
            max_recipients: 100,
            command_timeout_seconds: 300,
            enable_auth: true,
            enable_starttls: true,
            enable_vrfy: false,
            enable_expn: false,
            require_dkim: false,
            enforce_dmarc: false,
            spf_fail_open: false,
            dmarc_fail_open: false,
            blocked_subject_phrases: vec!["Buy now".to_string()],
            tls: None,
            ports: vec![PortConfig {
                host: default_host(),
                port: 25,
                security: SecurityMode::None,
            }],
            dkim: HashMap::new(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_security() -> SecurityMode {
    SecurityMode::None
}

fn default_selector() -> String {
    "default".to_string()
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(text)?;
        if config.ports.is_empty() {
            return Err(ConfigError::Invalid("at least one port must be configured".into()));
        }
        if config.command_timeout_seconds == 0 {
            return Err(ConfigError::Invalid("command_timeout_seconds must be positive".into()));
        }
        Ok(config)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_seconds)
    }

    /// Builds the TLS acceptor shared by STARTTLS and implicit TLS ports.
    ///
    /// Returns `None` when no certificate is configured; an implicit TLS port
    /// without one is an error, STARTTLS is merely not offered.
    pub fn load_tls_acceptor(&self) -> Result<Option<TlsAcceptor>, ConfigError> {
        let Some(tls) = &self.tls else {
            if self.ports.iter().any(|p| p.security == SecurityMode::Tls) {
                return Err(ConfigError::Tls(
                    "implicit TLS port configured without [tls] certificate".into(),
                ));
            }
            if self.enable_starttls {
                warn!("STARTTLS enabled but no certificate configured; it will not be offered");
            }
            return Ok(None);
        };

        let acceptor = load_tls_acceptor(&tls.certificate_path, &tls.private_key_path)?;
        info!("TLS enabled with certificate: {:?}", tls.certificate_path);
        Ok(Some(acceptor))
    }

    /// Reads every configured DKIM signing key, keyed by lowercase domain.
    pub fn load_dkim_keys(&self) -> Result<HashMap<String, DkimKey>, ConfigError> {
        let mut keys = HashMap::new();
        for (domain, entry) in &self.dkim {
            let pem = std::fs::read(&entry.private_key_path).map_err(|source| ConfigError::Read {
                path: entry.private_key_path.clone(),
                source,
            })?;
            let private_key =
                PKey::private_key_from_pem(&pem).map_err(|e| ConfigError::DkimKey {
                    domain: domain.clone(),
                    reason: e.to_string(),
                })?;
            if private_key.rsa().is_err() {
                return Err(ConfigError::DkimKey {
                    domain: domain.clone(),
                    reason: "not an RSA key".into(),
                });
            }
            keys.insert(
                domain.to_lowercase(),
                DkimKey {
                    selector: entry.selector.clone(),
                    private_key,
                },
            );
        }
        Ok(keys)
    }
}

/// Loads a PEM certificate chain and private key into a rustls acceptor.
pub fn load_tls_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor, ConfigError> {
    let cert_file = File::open(cert_path).map_err(|source| ConfigError::Read {
        path: cert_path.to_path_buf(),
        source,
    })?;
    let mut cert_reader = StdBufReader::new(cert_file);
    let cert_chain: Vec<Certificate> = certs(&mut cert_reader)
        .map_err(|_| ConfigError::Tls("failed to parse certificate".into()))?
        .into_iter()
        .map(Certificate)
        .collect();
    if cert_chain.is_empty() {
        return Err(ConfigError::Tls(format!("no certificate found in {:?}", cert_path)));
    }

    let key_pem = std::fs::read(key_path).map_err(|source| ConfigError::Read {
        path: key_path.to_path_buf(),
        source,
    })?;
    let mut keys = pkcs8_private_keys(&mut key_pem.as_slice())
        .map_err(|_| ConfigError::Tls("failed to parse private key".into()))?;
    if keys.is_empty() {
        keys = rsa_private_keys(&mut key_pem.as_slice())
            .map_err(|_| ConfigError::Tls("failed to parse private key".into()))?;
    }
    if keys.is_empty() {
        return Err(ConfigError::Tls(format!("no private key found in {:?}", key_path)));
    }
    let private_key = PrivateKey(keys.remove(0));

    let config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(cert_chain, private_key)
        .map_err(|e| ConfigError::Tls(format!("failed to build TLS config: {}", e)))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}
