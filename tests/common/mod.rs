#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::hash::MessageDigest;
use openssl::pkey::PKey;
use openssl::rsa::Rsa;
use openssl::x509::{X509Builder, X509NameBuilder};
use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{Certificate, ClientConfig, ServerName};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use mailsharp::config::{PortConfig, TlsConfig};
use mailsharp::dkim::DkimKey;
use mailsharp::dns::StaticResolver;
use mailsharp::{Config, MailContext, Metrics, SecurityMode, ShutdownHandle, SmtpServer};

pub const MESSAGE: &[&str] = &[
    "From: alice@x.com",
    "To: bob@y.org",
    "Date: Mon, 19 Oct 2026 10:00:00 +0000",
    "Subject: quarterly report",
    "",
    "Hello Bob,",
    "..see attached.",
];

pub struct TestServer {
    pub addr: SocketAddr,
    pub ctx: Arc<MailContext>,
    pub shutdown: ShutdownHandle,
    pub relay: UnboundedReceiver<PathBuf>,
    pub resolver: Arc<StaticResolver>,
    _dir: TempDir,
}

impl TestServer {
    /// Starts a server on one loopback port. The resolver always gets the
    /// public key for selector `s1` of `x.com`, the only signing domain.
    pub async fn start(
        security: SecurityMode,
        with_tls: bool,
        mut resolver: StaticResolver,
        configure: impl FnOnce(&mut Config),
    ) -> Self {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("users.json"),
            r#"[{"username": "alice", "password": "secret"}]"#,
        )
        .unwrap();

        let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
        let txt = format!("v=DKIM1; k=rsa; p={}", BASE64.encode(key.public_key_to_der().unwrap()));
        resolver.insert("s1._domainkey.x.com", &txt);

        let mut config = Config {
            hostname: "mx.test".to_string(),
            storage_path: dir.path().join("spool"),
            user_store_path: Some(dir.path().join("users.json")),
            command_timeout_seconds: 10,
            ports: vec![PortConfig {
                host: "127.0.0.1".to_string(),
                port: 0,
                security,
            }],
            ..Config::default()
        };
        if with_tls {
            config.tls = Some(write_certificate(dir.path()));
        }
        configure(&mut config);
        let tls = config.load_tls_acceptor().unwrap();

        let mut keys = HashMap::new();
        keys.insert(
            "x.com".to_string(),
            DkimKey {
                selector: "s1".to_string(),
                private_key: key,
            },
        );

        let resolver = Arc::new(resolver);
        let (tx, relay) = unbounded_channel();
        let ctx = Arc::new(MailContext::new(
            config,
            tls,
            resolver.clone(),
            keys,
            Arc::new(tx),
            Arc::new(Metrics::new()),
        ));
        let server = SmtpServer::bind(ctx.clone()).await.unwrap();
        let addr = server.local_addrs()[0];
        let shutdown = server.shutdown_handle();
        tokio::spawn(server.run());

        Self {
            addr,
            ctx,
            shutdown,
            relay,
            resolver,
            _dir: dir,
        }
    }

    pub async fn connect(&self) -> SmtpClient<TcpStream> {
        SmtpClient::new(TcpStream::connect(self.addr).await.unwrap())
    }

    pub fn spooled(&self) -> usize {
        std::fs::read_dir(&self.ctx.config.storage_path)
            .map(|dir| dir.count())
            .unwrap_or(0)
    }
}

/// Self-signed certificate for `mx.test`, key in PKCS#8 PEM.
pub fn write_certificate(dir: &Path) -> TlsConfig {
    let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();

    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_text("CN", "mx.test").unwrap();
    let name = name.build();

    let mut builder = X509Builder::new().unwrap();
    builder.set_version(2).unwrap();
    let serial = BigNum::from_u32(1).unwrap().to_asn1_integer().unwrap();
    builder.set_serial_number(&serial).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder.set_not_before(&Asn1Time::days_from_now(0).unwrap()).unwrap();
    builder.set_not_after(&Asn1Time::days_from_now(1).unwrap()).unwrap();
    builder.sign(&key, MessageDigest::sha256()).unwrap();
    let cert = builder.build();

    let certificate_path = dir.join("cert.pem");
    let private_key_path = dir.join("key.pem");
    std::fs::write(&certificate_path, cert.to_pem().unwrap()).unwrap();
    std::fs::write(&private_key_path, key.private_key_to_pem_pkcs8().unwrap()).unwrap();
    TlsConfig {
        certificate_path,
        private_key_path,
    }
}

struct AcceptAnyCertificate;

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

pub async fn tls_connect<S>(stream: S) -> std::io::Result<TlsStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let config = ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate))
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));
    let name = ServerName::try_from("mx.test").unwrap();
    connector.connect(name, stream).await
}

pub struct SmtpClient<S> {
    io: BufReader<S>,
}

impl<S> SmtpClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            io: BufReader::new(stream),
        }
    }

    pub fn into_inner(self) -> S {
        self.io.into_inner()
    }

    /// Reads one possibly multi-line reply, lines joined with `\n`.
    pub async fn read_reply(&mut self) -> String {
        let mut reply = Vec::new();
        loop {
            let mut line = String::new();
            let read = self.io.read_line(&mut line).await.unwrap();
            assert!(read > 0, "connection closed while waiting for a reply");
            let line = line.trim_end().to_string();
            let last = line.len() < 4 || line.as_bytes()[3] != b'-';
            reply.push(line);
            if last {
                return reply.join("\n");
            }
        }
    }

    pub async fn send(&mut self, line: &str) {
        self.io.write_all(format!("{}\r\n", line).as_bytes()).await.unwrap();
        self.io.flush().await.unwrap();
    }

    pub async fn cmd(&mut self, line: &str) -> String {
        self.send(line).await;
        self.read_reply().await
    }

    /// True once the server has closed its side.
    pub async fn is_closed(&mut self) -> bool {
        let mut rest = String::new();
        matches!(self.io.read_line(&mut rest).await, Ok(0) | Err(_))
    }
}

pub fn code(reply: &str) -> &str {
    &reply[..3]
}
