mod common;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use common::{code, tls_connect, SmtpClient, TestServer, MESSAGE};
use mailsharp::dns::StaticResolver;
use mailsharp::SecurityMode;

#[tokio::test]
async fn starttls_upgrades_and_rejects_second_attempt() {
    let server = TestServer::start(SecurityMode::None, true, StaticResolver::new(), |_| {}).await;
    let mut client = server.connect().await;
    client.read_reply().await;

    let reply = client.cmd("EHLO client").await;
    assert!(reply.contains("250-STARTTLS"));
    assert_eq!(client.cmd("STARTTLS").await, "220 Ready to start TLS");

    let tls = tls_connect(client.into_inner()).await.unwrap();
    let mut client = SmtpClient::new(tls);

    // Session state was reset: a fresh EHLO is required.
    assert_eq!(code(&client.cmd("RCPT TO:<bob@y.org>").await), "503");
    let reply = client.cmd("EHLO client").await;
    assert!(!reply.contains("STARTTLS"));
    assert_eq!(code(&client.cmd("STARTTLS").await), "503");

    client.cmd("MAIL FROM:<alice@x.com>").await;
    client.cmd("RCPT TO:<bob@y.org>").await;
    client.cmd("DATA").await;
    for line in MESSAGE {
        client.send(line).await;
    }
    assert_eq!(code(&client.cmd(".").await), "250");
    assert_eq!(server.spooled(), 1);
}

#[tokio::test]
async fn starttls_port_requires_tls_before_mail() {
    let server = TestServer::start(SecurityMode::StartTls, true, StaticResolver::new(), |_| {}).await;
    let mut client = server.connect().await;
    client.read_reply().await;

    client.cmd("EHLO client").await;
    assert_eq!(code(&client.cmd("MAIL FROM:<alice@x.com>").await), "530");
    assert_eq!(code(&client.cmd("AUTH PLAIN").await), "530");
    client.cmd("STARTTLS").await;

    let tls = tls_connect(client.into_inner()).await.unwrap();
    let mut client = SmtpClient::new(tls);
    client.cmd("EHLO client").await;
    let plain = BASE64.encode("\0alice\0secret");
    assert_eq!(code(&client.cmd(&format!("AUTH PLAIN {}", plain)).await), "235");
    assert_eq!(code(&client.cmd("MAIL FROM:<alice@x.com>").await), "250");
    assert_eq!(server.ctx.metrics.snapshot().auth_success, 1);
}

#[tokio::test]
async fn implicit_tls_port_greets_over_tls() {
    let server = TestServer::start(SecurityMode::Tls, true, StaticResolver::new(), |_| {}).await;
    let tcp = TcpStream::connect(server.addr).await.unwrap();
    let mut client = SmtpClient::new(tls_connect(tcp).await.unwrap());

    assert_eq!(client.read_reply().await, "220 mx.test ESMTP ready");
    // TlsStarted permits MAIL before any greeting.
    assert_eq!(code(&client.cmd("STARTTLS").await), "503");
    assert_eq!(code(&client.cmd("MAIL FROM:<alice@x.com>").await), "250");
}

#[tokio::test]
async fn failed_handshake_closes_connection() {
    let server = TestServer::start(SecurityMode::None, true, StaticResolver::new(), |_| {}).await;
    let mut client = server.connect().await;
    client.read_reply().await;
    client.cmd("EHLO client").await;
    client.cmd("STARTTLS").await;

    let mut tcp = client.into_inner();
    tcp.write_all(b"this is not a TLS ClientHello\r\n").await.unwrap();
    let mut client = SmtpClient::new(tcp);
    assert!(client.is_closed().await);
}

#[tokio::test]
async fn auth_mechanisms_over_tls() {
    let server = TestServer::start(SecurityMode::Tls, true, StaticResolver::new(), |_| {}).await;
    let tcp = TcpStream::connect(server.addr).await.unwrap();
    let mut client = SmtpClient::new(tls_connect(tcp).await.unwrap());
    client.read_reply().await;
    client.cmd("EHLO client").await;

    assert_eq!(client.cmd("AUTH LOGIN").await, "334 VXNlcm5hbWU6");
    client.cmd(&BASE64.encode("alice")).await;
    assert_eq!(code(&client.cmd(&BASE64.encode("wrong")).await), "535");

    let reply = client.cmd("AUTH CRAM-MD5").await;
    let challenge = String::from_utf8(BASE64.decode(&reply[4..]).unwrap()).unwrap();
    let digest = mailsharp::session::cram_md5_digest(&challenge, "secret").unwrap();
    let answer = BASE64.encode(format!("alice {}", digest));
    assert_eq!(code(&client.cmd(&answer).await), "235");

    let snapshot = server.ctx.metrics.snapshot();
    assert_eq!(snapshot.auth_failed, 1);
    assert_eq!(snapshot.auth_success, 1);
}
