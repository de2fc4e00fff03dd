use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{info, LevelFilter};
use structopt::StructOpt;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;

use mailsharp::daemon;
use mailsharp::dkim::DkimKey;
use mailsharp::dns::DnsResolver;
use mailsharp::utils::Logger;
use mailsharp::{Config, MailContext, Metrics, SmtpServer};

#[derive(Debug, StructOpt)]
#[structopt(
    name = "mailsharp",
    about = "SMTP mail transfer agent with STARTTLS, AUTH, SPF, DKIM and DMARC"
)]
struct Opt {
    /// Configuration file
    #[structopt(short = "c", long = "config", parse(from_os_str), default_value = "mailsharp.toml")]
    config: PathBuf,

    /// Run as daemon
    #[structopt(short = "d", long = "daemon")]
    daemon: bool,

    /// PID file written in daemon mode
    #[structopt(long = "pid-file", parse(from_os_str), default_value = "/tmp/mailsharp.pid")]
    pid_file: PathBuf,

    /// Log file path
    #[structopt(long = "logs", parse(from_os_str))]
    log_file: Option<PathBuf>,

    /// Verbose mode - log replies and message bodies
    #[structopt(short = "v", long = "verbose")]
    verbose: bool,

    /// Enable raw display (not filtered) - DANGEROUS
    #[structopt(short = "r", long = "raw")]
    raw_display: bool,
}

fn main() -> Result<()> {
    let opt = Opt::from_args();

    let config = Config::load(&opt.config)
        .with_context(|| format!("Failed to load configuration from {:?}", opt.config))?;

    let level = if opt.verbose { LevelFilter::Debug } else { LevelFilter::Info };
    Logger::new(opt.log_file.as_deref(), opt.raw_display, level)
        .context("Failed to open log file")?
        .init()
        .context("Failed to install logger")?;

    // Key material is read before daemonizing so that errors reach the terminal.
    let tls = config.load_tls_acceptor()?;
    let dkim_keys = config.load_dkim_keys()?;

    if opt.daemon {
        daemon::daemonize(&opt.pid_file)?;
    }

    // The runtime is created after the fork.
    let runtime = tokio::runtime::Runtime::new().context("Failed to start tokio runtime")?;
    runtime.block_on(serve(config, tls, dkim_keys))
}

async fn serve(config: Config, tls: Option<TlsAcceptor>, dkim_keys: HashMap<String, DkimKey>) -> Result<()> {
    info!("mailsharp v{} starting, PID {}", env!("CARGO_PKG_VERSION"), std::process::id());

    let resolver = DnsResolver::from_system_conf().context("Failed to read system DNS configuration")?;
    let metrics = Arc::new(Metrics::new());

    let (relay_tx, mut relay_rx) = mpsc::unbounded_channel::<PathBuf>();
    let relay_metrics = metrics.clone();
    tokio::spawn(async move {
        while let Some(path) = relay_rx.recv().await {
            info!("Queued {:?} for relay", path);
            relay_metrics.increment_relayed();
        }
    });

    let ctx = Arc::new(MailContext::new(
        config,
        tls,
        Arc::new(resolver),
        dkim_keys,
        Arc::new(relay_tx),
        metrics.clone(),
    ));
    let server = SmtpServer::bind(ctx).await?;
    let shutdown = server.shutdown_handle();
    let running = tokio::spawn(server.run());

    info!("Waiting for connections, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl+C")?;

    info!("Shutting down");
    shutdown.stop_accepting();
    shutdown.terminate_sessions();
    running.await?;

    info!("{}", metrics.snapshot());
    Ok(())
}
