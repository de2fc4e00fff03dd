//! An SMTP mail transfer agent: a per-connection protocol state machine with
//! inline STARTTLS, SMTP AUTH and SPF / DKIM / DMARC checks, spooling
//! accepted mail to disk for relay.

pub mod command;
pub mod config;
pub mod daemon;
pub mod dkim;
pub mod dmarc;
pub mod dns;
pub mod error;
pub mod metrics;
pub mod response;
pub mod server;
pub mod session;
pub mod spf;
pub mod store;
pub mod stream;
pub mod utils;

pub use config::{Config, SecurityMode};
pub use error::{ConfigError, SmtpError};
pub use metrics::Metrics;
pub use server::{MailContext, ShutdownHandle, SmtpServer};
pub use session::SmtpSession;
