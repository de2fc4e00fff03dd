use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{error, info, warn};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, SecurityMode};
use crate::dkim::{DkimKey, DkimSigner, DkimVerifier};
use crate::dmarc::DmarcChecker;
use crate::dns::TxtResolver;
use crate::error::SmtpError;
use crate::metrics::Metrics;
use crate::session::SmtpSession;
use crate::spf::SpfChecker;
use crate::store::{FileMessageStore, JsonUserStore, MailingLists, MessageStore, RelayQueue, UserStore};

/// Everything a session needs besides its own connection, shared by all
/// sessions of a server.
pub struct MailContext {
    pub config: Config,
    pub tls: Option<TlsAcceptor>,
    pub resolver: Arc<dyn TxtResolver>,
    pub spf: SpfChecker,
    pub dkim_verifier: DkimVerifier,
    pub dkim_signer: DkimSigner,
    pub dmarc: DmarcChecker,
    pub users: Arc<dyn UserStore>,
    pub lists: MailingLists,
    pub store: Arc<dyn MessageStore>,
    pub relay: Arc<dyn RelayQueue>,
    pub metrics: Arc<Metrics>,
}

impl MailContext {
    pub fn new(
        config: Config,
        tls: Option<TlsAcceptor>,
        resolver: Arc<dyn TxtResolver>,
        dkim_keys: HashMap<String, DkimKey>,
        relay: Arc<dyn RelayQueue>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let spf = SpfChecker::new(resolver.clone(), config.spf_fail_open);
        let dkim_verifier = DkimVerifier::new(resolver.clone());
        let dmarc = DmarcChecker::new(
            resolver.clone(),
            spf.clone(),
            dkim_verifier.clone(),
            metrics.clone(),
            config.dmarc_fail_open,
        );

        Self {
            users: Arc::new(JsonUserStore::new(config.user_store_path.clone())),
            lists: MailingLists::new(config.mailing_list_path.clone()),
            store: Arc::new(FileMessageStore::new(config.storage_path.clone())),
            dkim_signer: DkimSigner::new(dkim_keys),
            config,
            tls,
            resolver,
            spf,
            dkim_verifier,
            dmarc,
            relay,
            metrics,
        }
    }
}

/// Stops a running server. Listeners and sessions have separate tokens so
/// that open sessions can drain after accepting has stopped.
#[derive(Clone)]
pub struct ShutdownHandle {
    listeners: CancellationToken,
    sessions: CancellationToken,
}

impl ShutdownHandle {
    pub fn stop_accepting(&self) {
        self.listeners.cancel();
    }

    /// Ends every open session with a 421 reply at its next read.
    pub fn terminate_sessions(&self) {
        self.sessions.cancel();
    }
}

pub struct SmtpServer {
    ctx: Arc<MailContext>,
    listeners: Vec<(TcpListener, SecurityMode)>,
    next_id: Arc<AtomicU64>,
    shutdown: ShutdownHandle,
}

impl SmtpServer {
    /// Binds one listener per configured port.
    pub async fn bind(ctx: Arc<MailContext>) -> Result<Self, SmtpError> {
        let mut listeners = Vec::new();

        for port in &ctx.config.ports {
            if port.security == SecurityMode::Tls && ctx.tls.is_none() {
                return Err(SmtpError::Config(format!(
                    "port {} uses implicit TLS but no certificate is configured",
                    port.port
                )));
            }

            let addr = port.addr();
            let listener = TcpListener::bind(&addr)
                .await
                .map_err(|source| SmtpError::Bind {
                    addr: addr.clone(),
                    source,
                })?;
            info!("Listening on {} ({})", listener.local_addr()?, port.security);
            listeners.push((listener, port.security));
        }

        Ok(Self {
            ctx,
            listeners,
            next_id: Arc::new(AtomicU64::new(1)),
            shutdown: ShutdownHandle {
                listeners: CancellationToken::new(),
                sessions: CancellationToken::new(),
            },
        })
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .iter()
            .filter_map(|(listener, _)| listener.local_addr().ok())
            .collect()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Accepts on every listener until `stop_accepting` is called.
    pub async fn run(self) {
        self.ctx.metrics.set_running(true);

        let mut loops = Vec::new();
        for (listener, security) in self.listeners {
            loops.push(tokio::spawn(accept_loop(
                listener,
                security,
                self.ctx.clone(),
                self.next_id.clone(),
                self.shutdown.clone(),
            )));
        }
        for handle in loops {
            if let Err(e) = handle.await {
                error!("Listener task failed: {}", e);
            }
        }

        self.ctx.metrics.set_running(false);
        info!("All listeners stopped");
    }
}

async fn accept_loop(
    listener: TcpListener,
    security: SecurityMode,
    ctx: Arc<MailContext>,
    next_id: Arc<AtomicU64>,
    shutdown: ShutdownHandle,
) {
    let local = listener
        .local_addr()
        .map_or_else(|_| "?".to_string(), |addr| addr.to_string());

    loop {
        tokio::select! {
            _ = shutdown.listeners.cancelled() => break,
            result = listener.accept() => match result {
                Ok((stream, peer)) => {
                    ctx.metrics.increment_connections();
                    let id = next_id.fetch_add(1, Ordering::Relaxed);
                    info!("[{}] {} New connection on {}", id, peer, local);

                    let ctx = ctx.clone();
                    let cancel = shutdown.sessions.clone();
                    tokio::spawn(async move {
                        match SmtpSession::accept(stream, peer, id, security, ctx, cancel).await {
                            Ok(session) => session.run().await,
                            Err(e) => warn!("[{}] {} {}", id, peer, e),
                        }
                    });
                }
                Err(e) => error!("Accept error on {}: {}", local, e),
            },
        }
    }

    info!("Stopped listening on {}", local);
}
