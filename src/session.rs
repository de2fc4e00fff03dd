//! Per-connection SMTP state machine.
//!
//! A session owns its stream exclusively. Command lines are dispatched on
//! [`Verb`] to one handler per command; while a message is being received,
//! lines bypass dispatch and accumulate in the data buffer until the lone
//! dot, where the message is validated, checked, signed and spooled.

use std::io;
use std::mem;
use std::net::SocketAddr;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use log::{debug, error, info, warn};
use openssl::error::ErrorStack;
use openssl::hash::MessageDigest;
use openssl::pkey::PKey;
use openssl::sign::Signer;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::command::{self, Verb};
use crate::config::SecurityMode;
use crate::error::SmtpError;
use crate::response::SmtpResponse;
use crate::server::MailContext;
use crate::stream::MailStream;
use crate::utils::safe_log_string;

/// Longest accepted line, CRLF excluded.
pub const MAX_LINE: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmtpState {
    Initial,
    HeloReceived,
    MailFromReceived,
    RcptToReceived,
    /// DATA accepted, still inside the client's header block.
    HeaderStarted,
    DataStarted,
    /// TLS negotiated (implicitly or by STARTTLS), no HELO yet.
    TlsStarted,
}

enum Flow {
    Continue,
    Close,
}

enum AuthOutcome {
    Authenticated(String),
    Rejected,
    Cancelled,
}

pub struct SmtpSession<S> {
    id: u64,
    peer: SocketAddr,
    security: SecurityMode,
    ctx: Arc<MailContext>,
    cancel: CancellationToken,
    io: BufReader<MailStream<S>>,
    state: SmtpState,
    helo: Option<String>,
    mail_from: Option<String>,
    rcpt_to: Vec<String>,
    data: String,
    /// Length of the client's header block, known once the blank line is seen.
    header_len: Option<usize>,
    oversized: bool,
    authenticated: bool,
}

impl<S> SmtpSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wraps an accepted connection. On implicit-TLS ports the handshake runs
    /// here, bounded by the command timeout.
    pub async fn accept(
        stream: S,
        peer: SocketAddr,
        id: u64,
        security: SecurityMode,
        ctx: Arc<MailContext>,
        cancel: CancellationToken,
    ) -> Result<Self, SmtpError> {
        let mut stream = MailStream::Plain(stream);
        let mut state = SmtpState::Initial;

        if security == SecurityMode::Tls {
            let acceptor = ctx
                .tls
                .clone()
                .ok_or_else(|| SmtpError::Config("implicit TLS port without a certificate".to_string()))?;
            stream = tokio::time::timeout(ctx.config.command_timeout(), stream.upgrade(&acceptor))
                .await
                .map_err(|_| SmtpError::Timeout)?
                .map_err(SmtpError::TlsHandshake)?;
            state = SmtpState::TlsStarted;
        }

        Ok(Self {
            id,
            peer,
            security,
            ctx,
            cancel,
            io: BufReader::new(stream),
            state,
            helo: None,
            mail_from: None,
            rcpt_to: Vec::new(),
            data: String::new(),
            header_len: None,
            oversized: false,
            authenticated: false,
        })
    }

    fn tls_active(&self) -> bool {
        self.io.get_ref().is_tls()
    }

    /// Port requires STARTTLS before any mail transaction.
    fn tls_missing(&self) -> bool {
        self.security == SecurityMode::StartTls && !self.tls_active()
    }

    /// Runs the session to completion and closes the stream.
    pub async fn run(mut self) {
        let metrics = self.ctx.metrics.clone();
        let _active = metrics.track_session();
        info!("[{}] {} Session started ({})", self.id, self.peer, self.security);

        match self.serve().await {
            Ok(()) => {}
            Err(SmtpError::Timeout) => {
                warn!("[{}] {} Command timeout", self.id, self.peer);
                let _ = self.reply(SmtpResponse::timeout()).await;
            }
            Err(SmtpError::Shutdown) => {
                info!("[{}] {} Closing for shutdown", self.id, self.peer);
                let _ = self.reply(SmtpResponse::shutdown()).await;
            }
            Err(e @ SmtpError::LineTooLong { .. }) => {
                warn!("[{}] {} {}", self.id, self.peer, e);
                let _ = self.reply(SmtpResponse::new(e.to_response_code(), e.to_string())).await;
            }
            Err(e) => error!("[{}] {} Session error: {}", self.id, self.peer, e),
        }

        let _ = self.io.shutdown().await;
        info!("[{}] {} Connection closed", self.id, self.peer);
    }

    async fn serve(&mut self) -> Result<(), SmtpError> {
        self.reply(SmtpResponse::greeting(&self.ctx.config.hostname)).await?;

        while let Some(line) = self.read_line().await? {
            if matches!(self.state, SmtpState::HeaderStarted | SmtpState::DataStarted) {
                self.data_line(&line).await?;
                continue;
            }
            if line.trim().is_empty() {
                debug!("[{}] {} Empty command line, disconnecting", self.id, self.peer);
                break;
            }
            if let Flow::Close = self.dispatch(&line).await? {
                break;
            }
        }
        Ok(())
    }

    async fn dispatch(&mut self, line: &str) -> Result<Flow, SmtpError> {
        let (word, args) = command::split(line);
        let Some(verb) = Verb::parse(word) else {
            info!("[{}] {} >> {}", self.id, self.peer, line);
            self.reply(SmtpResponse::not_recognized()).await?;
            return Ok(Flow::Continue);
        };

        if verb == Verb::Auth {
            // Only the mechanism; initial responses carry credentials.
            info!("[{}] {} >> AUTH {}", self.id, self.peer, command::split(args).0);
        } else {
            info!("[{}] {} >> {}", self.id, self.peer, line);
        }

        match verb {
            Verb::Helo => self.greet(args, false).await?,
            Verb::Ehlo => self.greet(args, true).await?,
            Verb::Mail => self.mail(args).await?,
            Verb::Rcpt => self.rcpt(args).await?,
            Verb::Data => self.begin_data().await?,
            Verb::Rset => self.rset().await?,
            Verb::Noop => self.reply(SmtpResponse::ok()).await?,
            Verb::Help => self.reply(SmtpResponse::help()).await?,
            Verb::Vrfy => self.vrfy(args).await?,
            Verb::Expn => self.expn(args).await?,
            Verb::Auth => self.auth(args).await?,
            Verb::StartTls => self.starttls().await?,
            Verb::Quit => {
                self.reply(SmtpResponse::quit()).await?;
                return Ok(Flow::Close);
            }
        }
        Ok(Flow::Continue)
    }

    async fn reply(&mut self, response: SmtpResponse) -> Result<(), SmtpError> {
        let text = response.format();
        debug!("[{}] {} << {}", self.id, self.peer, text.trim_end());
        self.io.write_all(text.as_bytes()).await?;
        self.io.flush().await?;
        Ok(())
    }

    /// Reads one line without its terminator. `None` means the peer closed
    /// the connection.
    async fn read_line(&mut self) -> Result<Option<String>, SmtpError> {
        let timeout = self.ctx.config.command_timeout();
        let limit = (MAX_LINE + 2) as u64;
        let mut buf = Vec::new();
        let mut limited = (&mut self.io).take(limit);

        let read = tokio::select! {
            _ = self.cancel.cancelled() => Err(SmtpError::Shutdown),
            res = tokio::time::timeout(timeout, limited.read_until(b'\n', &mut buf)) => match res {
                Ok(read) => read.map_err(SmtpError::from),
                Err(_) => Err(SmtpError::Timeout),
            },
        }?;

        if read == 0 {
            return Ok(None);
        }
        if buf.last() != Some(&b'\n') && buf.len() as u64 >= limit {
            return Err(SmtpError::LineTooLong { max: MAX_LINE });
        }

        let line = String::from_utf8_lossy(&buf);
        Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
    }

    fn reset_envelope(&mut self) {
        self.mail_from = None;
        self.rcpt_to.clear();
        self.data.clear();
        self.oversized = false;
    }

    /// Where a session rests between transactions.
    fn ready_state(&self) -> SmtpState {
        if self.helo.is_some() {
            SmtpState::HeloReceived
        } else if self.tls_active() {
            SmtpState::TlsStarted
        } else {
            SmtpState::Initial
        }
    }

    async fn greet(&mut self, args: &str, extended: bool) -> Result<(), SmtpError> {
        if !matches!(self.state, SmtpState::Initial | SmtpState::TlsStarted) {
            return self.reply(SmtpResponse::bad_sequence()).await;
        }
        let Some(client) = args.split_whitespace().next().map(str::to_string) else {
            return self.reply(SmtpResponse::syntax_error()).await;
        };

        let config = &self.ctx.config;
        let response = if extended {
            let mut capabilities = vec![format!("SIZE {}", config.max_message_size)];
            if config.enable_auth {
                capabilities.push("AUTH PLAIN LOGIN CRAM-MD5".to_string());
            }
            if config.enable_starttls && self.ctx.tls.is_some() && !self.tls_active() {
                capabilities.push("STARTTLS".to_string());
            }
            capabilities.push("HELP".to_string());
            SmtpResponse::ehlo(&config.hostname, &client, capabilities)
        } else {
            SmtpResponse::helo(&config.hostname, &client)
        };

        self.helo = Some(client);
        self.state = SmtpState::HeloReceived;
        self.reply(response).await
    }

    async fn mail(&mut self, args: &str) -> Result<(), SmtpError> {
        if self.tls_missing() {
            return self.reply(SmtpResponse::tls_required()).await;
        }
        if !matches!(self.state, SmtpState::HeloReceived | SmtpState::TlsStarted) {
            return self.reply(SmtpResponse::bad_sequence()).await;
        }
        let Some(from) = command::extract_path(args, "FROM:") else {
            return self.reply(SmtpResponse::syntax_error()).await;
        };

        if self.ctx.config.require_dkim {
            let domain = command::domain_of(&from);
            let helo = self.helo.as_deref().unwrap_or(domain);
            if !self.ctx.spf.check(self.peer.ip(), domain, helo).await {
                self.ctx.metrics.increment_rejected_spf();
                warn!("[{}] {} SPF failed for <{}>", self.id, self.peer, from);
                return self.reply(SmtpResponse::spf_failed()).await;
            }
        }

        self.mail_from = Some(from);
        self.state = SmtpState::MailFromReceived;
        self.reply(SmtpResponse::ok()).await
    }

    async fn rcpt(&mut self, args: &str) -> Result<(), SmtpError> {
        if self.tls_missing() {
            return self.reply(SmtpResponse::tls_required()).await;
        }
        if !matches!(self.state, SmtpState::MailFromReceived | SmtpState::RcptToReceived) {
            return self.reply(SmtpResponse::bad_sequence()).await;
        }
        let to = match command::extract_path(args, "TO:") {
            Some(to) if !to.is_empty() => to,
            _ => return self.reply(SmtpResponse::syntax_error()).await,
        };

        let max = self.ctx.config.max_recipients;
        if self.rcpt_to.len() >= max {
            return self.reply(SmtpResponse::too_many_recipients(max)).await;
        }

        self.rcpt_to.push(to);
        self.state = SmtpState::RcptToReceived;
        self.reply(SmtpResponse::ok()).await
    }

    async fn begin_data(&mut self) -> Result<(), SmtpError> {
        if self.tls_missing() {
            return self.reply(SmtpResponse::tls_required()).await;
        }
        if self.state != SmtpState::RcptToReceived {
            return self.reply(SmtpResponse::bad_sequence()).await;
        }
        self.data.clear();
        self.header_len = None;
        self.oversized = false;
        self.state = SmtpState::HeaderStarted;
        self.reply(SmtpResponse::data_start()).await
    }

    async fn data_line(&mut self, line: &str) -> Result<(), SmtpError> {
        if line == "." {
            return self.end_of_data().await;
        }
        if self.state == SmtpState::HeaderStarted && line.is_empty() {
            self.state = SmtpState::DataStarted;
            self.header_len = Some(self.data.len());
        }
        if self.oversized {
            return Ok(());
        }

        let line = if line.starts_with("..") { &line[1..] } else { line };
        if self.data.len() + line.len() + 2 > self.ctx.config.max_message_size {
            self.oversized = true;
            self.data = String::new();
            return Ok(());
        }
        self.data.push_str(line);
        self.data.push_str("\r\n");
        Ok(())
    }

    async fn end_of_data(&mut self) -> Result<(), SmtpError> {
        let data = mem::take(&mut self.data);
        let mail_from = self.mail_from.take().unwrap_or_default();
        let rcpt_to = mem::take(&mut self.rcpt_to);
        let header_len = self.header_len.take();
        let oversized = mem::replace(&mut self.oversized, false);
        self.state = self.ready_state();

        let response = if oversized {
            warn!("[{}] {} Message from <{}> over size limit", self.id, self.peer, mail_from);
            SmtpResponse::message_too_big(self.ctx.config.max_message_size)
        } else {
            self.commit(&data, header_len, &mail_from, &rcpt_to).await
        };
        self.reply(response).await
    }

    /// Runs the end-of-data pipeline and returns the reply for the client.
    /// `header_len` is `None` when the data ended inside the header block.
    async fn commit(
        &self,
        data: &str,
        header_len: Option<usize>,
        mail_from: &str,
        rcpt_to: &[String],
    ) -> SmtpResponse {
        let config = &self.ctx.config;
        let header_block = &data[..header_len.unwrap_or(data.len())];
        let headers: Vec<&str> = header_block.lines().collect();

        let has = |name: &str| headers.iter().any(|line| starts_with_ignore_case(line, name));
        if !(has("From:") && has("To:") && has("Date:")) {
            warn!("[{}] {} Message from <{}> lacks required headers", self.id, self.peer, mail_from);
            return SmtpResponse::missing_headers();
        }

        let spam = headers.iter().any(|line| {
            starts_with_ignore_case(line, "Subject:") && {
                let subject = line.to_lowercase();
                config
                    .blocked_subject_phrases
                    .iter()
                    .any(|phrase| subject.contains(&phrase.to_lowercase()))
            }
        });
        if spam {
            warn!("[{}] {} Message from <{}> rejected as spam", self.id, self.peer, mail_from);
            return SmtpResponse::spam_detected();
        }

        let client_ip = self.peer.ip();
        let origin = match self.ctx.resolver.reverse_lookup(client_ip).await {
            Some(name) => name,
            None => self.helo.clone().unwrap_or_else(|| "unknown".to_string()),
        };
        let message = self.compose(data, header_len.is_some(), &origin, mail_from, rcpt_to);
        let domain = command::domain_of(mail_from);

        if !self.ctx.dkim_verifier.verify(&message, client_ip).await {
            if config.require_dkim {
                self.ctx.metrics.increment_rejected_dkim();
                warn!("[{}] {} DKIM verification failed for <{}>", self.id, self.peer, mail_from);
                return SmtpResponse::dkim_failed();
            }
            debug!("[{}] {} No valid DKIM signature (advisory)", self.id, self.peer);
        }

        if config.enforce_dmarc {
            let helo = self.helo.as_deref().unwrap_or(domain);
            if !self.ctx.dmarc.check(&message, client_ip, domain, helo).await {
                warn!("[{}] {} DMARC rejected <{}>", self.id, self.peer, mail_from);
                return SmtpResponse::dmarc_failed();
            }
        }

        let selector = self.ctx.dkim_signer.selector_for(domain).unwrap_or("default");
        let signed = match self.ctx.dkim_signer.sign(&message, selector, domain) {
            Ok(signed) => signed,
            Err(e) => {
                error!("[{}] {} DKIM signing failed for {}: {}", self.id, self.peer, domain, e);
                return SmtpResponse::local_error();
            }
        };
        debug!("[{}] {} Message body:\n{}", self.id, self.peer, safe_log_string(&signed));

        let path = match self.ctx.store.store(&signed).await {
            Ok(path) => path,
            Err(e) => {
                error!("[{}] {} Failed to store message: {}", self.id, self.peer, e);
                return SmtpResponse::local_error();
            }
        };
        info!(
            "[{}] {} Saved message from <{}> to {} as {:?}",
            self.id,
            self.peer,
            mail_from,
            rcpt_to.join(", "),
            path
        );

        self.ctx.relay.enqueue(path);
        self.ctx.metrics.increment_received();
        SmtpResponse::message_accepted()
    }

    /// Prepends the trace and envelope headers to the client's data.
    /// `origin` is the client's PTR name, or its HELO name when none resolves.
    fn compose(&self, data: &str, has_body: bool, origin: &str, mail_from: &str, rcpt_to: &[String]) -> String {
        let hostname = &self.ctx.config.hostname;
        let date = Utc::now().to_rfc2822();

        let mut message = format!(
            "Received: from {} ({}) by {} with SMTP; {}\r\n",
            self.peer.ip(),
            origin,
            hostname,
            date
        );
        message.push_str(&format!("From: {}\r\n", mail_from));
        message.push_str(&format!("To: {}\r\n", rcpt_to.join(", ")));
        message.push_str(&format!("Date: {}\r\n", date));
        message.push_str(&format!("Message-Id: <{}@{}>\r\n", Uuid::new_v4(), hostname));
        message.push_str(data);
        if !has_body {
            message.push_str("\r\n");
        }
        message
    }

    async fn rset(&mut self) -> Result<(), SmtpError> {
        self.reset_envelope();
        self.state = self.ready_state();
        self.reply(SmtpResponse::ok()).await
    }

    async fn vrfy(&mut self, args: &str) -> Result<(), SmtpError> {
        if !self.ctx.config.enable_vrfy {
            return self.reply(SmtpResponse::vrfy_disabled()).await;
        }
        if self.state != SmtpState::HeloReceived {
            return self.reply(SmtpResponse::bad_sequence()).await;
        }
        let user = args.trim().trim_start_matches('<').trim_end_matches('>');
        if user.is_empty() {
            return self.reply(SmtpResponse::syntax_error()).await;
        }

        let response = if self.ctx.users.exists(user).await {
            SmtpResponse::new(250, user)
        } else {
            SmtpResponse::vrfy_failed()
        };
        self.reply(response).await
    }

    async fn expn(&mut self, args: &str) -> Result<(), SmtpError> {
        if !self.ctx.config.enable_expn {
            return self.reply(SmtpResponse::expn_disabled()).await;
        }
        if self.state != SmtpState::HeloReceived {
            return self.reply(SmtpResponse::bad_sequence()).await;
        }
        let list = args.trim();
        if list.is_empty() {
            return self.reply(SmtpResponse::syntax_error()).await;
        }

        let response = match self.ctx.lists.members(list).await {
            Some(members) => SmtpResponse::new(250, members.join(", ")),
            None => SmtpResponse::expn_failed(),
        };
        self.reply(response).await
    }

    async fn starttls(&mut self) -> Result<(), SmtpError> {
        if self.tls_active() {
            return self.reply(SmtpResponse::tls_already_active()).await;
        }
        let acceptor = if self.ctx.config.enable_starttls {
            self.ctx.tls.clone()
        } else {
            None
        };
        let Some(acceptor) = acceptor else {
            return self.reply(SmtpResponse::tls_unavailable()).await;
        };
        if self.state != SmtpState::HeloReceived {
            return self.reply(SmtpResponse::bad_sequence()).await;
        }

        self.reply(SmtpResponse::start_tls()).await?;

        // Anything pipelined after STARTTLS is discarded with the buffer.
        let plain = mem::replace(&mut self.io, BufReader::new(MailStream::Closed)).into_inner();
        let upgraded = tokio::time::timeout(self.ctx.config.command_timeout(), plain.upgrade(&acceptor))
            .await
            .map_err(|_| SmtpError::Timeout)?
            .map_err(SmtpError::TlsHandshake)?;
        self.io = BufReader::new(upgraded);

        self.helo = None;
        self.authenticated = false;
        self.reset_envelope();
        self.state = SmtpState::TlsStarted;
        info!("[{}] {} TLS established", self.id, self.peer);
        Ok(())
    }

    async fn auth(&mut self, args: &str) -> Result<(), SmtpError> {
        if !self.ctx.config.enable_auth {
            return self.reply(SmtpResponse::not_recognized()).await;
        }
        if self.tls_missing() {
            return self.reply(SmtpResponse::tls_required()).await;
        }
        if self.state != SmtpState::HeloReceived || self.authenticated {
            return self.reply(SmtpResponse::bad_sequence()).await;
        }

        let (mechanism, initial) = command::split(args);
        let outcome = match mechanism.to_ascii_uppercase().as_str() {
            "PLAIN" => self.auth_plain(initial).await?,
            "LOGIN" => self.auth_login(initial).await?,
            "CRAM-MD5" => self.auth_cram_md5().await?,
            "" => return self.reply(SmtpResponse::syntax_error()).await,
            _ => return self.reply(SmtpResponse::auth_unknown_mechanism()).await,
        };

        match outcome {
            AuthOutcome::Authenticated(user) => {
                self.authenticated = true;
                self.ctx.metrics.increment_auth_success();
                info!("[{}] {} Authenticated as {}", self.id, self.peer, user);
                self.reply(SmtpResponse::auth_success()).await
            }
            AuthOutcome::Rejected => {
                self.ctx.metrics.increment_auth_failed();
                warn!("[{}] {} Authentication failed ({})", self.id, self.peer, mechanism);
                self.reply(SmtpResponse::auth_failed()).await
            }
            AuthOutcome::Cancelled => self.reply(SmtpResponse::auth_cancelled()).await,
        }
    }

    /// Sends a 334 challenge and reads the client's answer; `None` if the
    /// client cancelled with `*`.
    async fn auth_exchange(&mut self, challenge: &str) -> Result<Option<String>, SmtpError> {
        self.reply(SmtpResponse::auth_prompt(challenge)).await?;
        let line = self
            .read_line()
            .await?
            .ok_or_else(|| SmtpError::Io(io::ErrorKind::UnexpectedEof.into()))?;
        let line = line.trim();
        if line == "*" {
            return Ok(None);
        }
        Ok(Some(line.to_string()))
    }

    async fn verify_password(&self, user: String, password: &str) -> AuthOutcome {
        if self.ctx.users.authenticate(&user, password).await {
            AuthOutcome::Authenticated(user)
        } else {
            AuthOutcome::Rejected
        }
    }

    async fn auth_plain(&mut self, initial: &str) -> Result<AuthOutcome, SmtpError> {
        let encoded = if initial.is_empty() {
            match self.auth_exchange("").await? {
                Some(encoded) => encoded,
                None => return Ok(AuthOutcome::Cancelled),
            }
        } else {
            initial.to_string()
        };

        Ok(match decode_plain(&encoded) {
            Some((user, password)) => self.verify_password(user, &password).await,
            None => AuthOutcome::Rejected,
        })
    }

    async fn auth_login(&mut self, initial: &str) -> Result<AuthOutcome, SmtpError> {
        let encoded_user = if initial.is_empty() {
            match self.auth_exchange("VXNlcm5hbWU6").await? {
                Some(encoded) => encoded,
                None => return Ok(AuthOutcome::Cancelled),
            }
        } else {
            initial.to_string()
        };
        let Some(encoded_password) = self.auth_exchange("UGFzc3dvcmQ6").await? else {
            return Ok(AuthOutcome::Cancelled);
        };

        Ok(match (decode_text(&encoded_user), decode_text(&encoded_password)) {
            (Some(user), Some(password)) if !user.is_empty() => self.verify_password(user, &password).await,
            _ => AuthOutcome::Rejected,
        })
    }

    async fn auth_cram_md5(&mut self) -> Result<AuthOutcome, SmtpError> {
        let challenge = format!(
            "<{}.{}@{}>",
            Uuid::new_v4().simple(),
            Utc::now().timestamp(),
            self.ctx.config.hostname
        );
        let Some(encoded) = self.auth_exchange(&BASE64.encode(&challenge)).await? else {
            return Ok(AuthOutcome::Cancelled);
        };

        let Some((user, digest)) = decode_text(&encoded)
            .as_deref()
            .and_then(|text| text.rsplit_once(' '))
            .map(|(user, digest)| (user.to_string(), digest.to_ascii_lowercase()))
        else {
            return Ok(AuthOutcome::Rejected);
        };
        let Some(password) = self.ctx.users.password(&user).await else {
            return Ok(AuthOutcome::Rejected);
        };

        let expected = match cram_md5_digest(&challenge, &password) {
            Ok(expected) => expected,
            Err(e) => {
                error!("[{}] {} CRAM-MD5 digest failed: {}", self.id, self.peer, e);
                return Ok(AuthOutcome::Rejected);
            }
        };
        if expected.len() == digest.len() && openssl::memcmp::eq(expected.as_bytes(), digest.as_bytes()) {
            Ok(AuthOutcome::Authenticated(user))
        } else {
            Ok(AuthOutcome::Rejected)
        }
    }
}

fn starts_with_ignore_case(line: &str, prefix: &str) -> bool {
    line.len() >= prefix.len() && line.is_char_boundary(prefix.len()) && line[..prefix.len()].eq_ignore_ascii_case(prefix)
}

fn decode_text(encoded: &str) -> Option<String> {
    let bytes = BASE64.decode(encoded.trim()).ok()?;
    String::from_utf8(bytes).ok()
}

/// Decodes a SASL PLAIN response, `authzid \0 authcid \0 password`, into
/// the authentication identity and password.
pub fn decode_plain(encoded: &str) -> Option<(String, String)> {
    let text = decode_text(encoded)?;
    let mut parts = text.split('\0');
    let (_authzid, user, password) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() || user.is_empty() {
        return None;
    }
    Some((user.to_string(), password.to_string()))
}

/// Lowercase hex HMAC-MD5 of the challenge keyed with the password.
pub fn cram_md5_digest(challenge: &str, password: &str) -> Result<String, ErrorStack> {
    let key = PKey::hmac(password.as_bytes())?;
    let mut signer = Signer::new(MessageDigest::md5(), &key)?;
    signer.update(challenge.as_bytes())?;
    let mac = signer.sign_to_vec()?;
    Ok(mac.iter().map(|b| format!("{:02x}", b)).collect())
}
