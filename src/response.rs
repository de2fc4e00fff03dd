//! SMTP replies sent by a session.

/// Represents an SMTP reply that can be sent to a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpResponse {
    pub code: u16,
    pub message: String,
    /// Continuation lines after the first; the last one closes the reply.
    pub multiline: Option<Vec<String>>,
}

impl SmtpResponse {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            multiline: None,
        }
    }

    pub fn new_multiline(code: u16, message: impl Into<String>, lines: Vec<String>) -> Self {
        Self {
            code,
            message: message.into(),
            multiline: Some(lines),
        }
    }

    pub fn greeting(hostname: &str) -> Self {
        Self::new(220, format!("{} ESMTP ready", hostname))
    }

    pub fn ok() -> Self {
        Self::new(250, "OK")
    }

    pub fn helo(hostname: &str, client: &str) -> Self {
        Self::new(250, format!("{} Hello {}", hostname, client))
    }

    pub fn ehlo(hostname: &str, client: &str, capabilities: Vec<String>) -> Self {
        Self::new_multiline(250, format!("{} Hello {}", hostname, client), capabilities)
    }

    pub fn help() -> Self {
        Self::new(
            214,
            "Commands: HELO EHLO MAIL RCPT DATA RSET NOOP QUIT HELP VRFY EXPN AUTH STARTTLS",
        )
    }

    pub fn quit() -> Self {
        Self::new(221, "Bye")
    }

    pub fn not_recognized() -> Self {
        Self::new(500, "Command not recognized")
    }

    pub fn syntax_error() -> Self {
        Self::new(501, "Syntax error in parameters")
    }

    pub fn bad_sequence() -> Self {
        Self::new(503, "Bad sequence of commands")
    }

    pub fn tls_required() -> Self {
        Self::new(530, "Must issue a STARTTLS command first")
    }

    pub fn data_start() -> Self {
        Self::new(354, "Start mail input; end with <CRLF>.<CRLF>")
    }

    pub fn message_accepted() -> Self {
        Self::new(250, "OK: Message accepted")
    }

    pub fn too_many_recipients(max: usize) -> Self {
        Self::new(452, format!("Too many recipients (max {})", max))
    }

    pub fn message_too_big(max: usize) -> Self {
        Self::new(552, format!("Message exceeds fixed maximum message size ({} bytes)", max))
    }

    pub fn missing_headers() -> Self {
        Self::new(550, "Message rejected: From, To and Date headers are required")
    }

    pub fn spam_detected() -> Self {
        Self::new(554, "Message rejected as spam")
    }

    pub fn spf_failed() -> Self {
        Self::new(550, "SPF check failed")
    }

    pub fn dkim_failed() -> Self {
        Self::new(550, "DKIM verification failed")
    }

    pub fn dmarc_failed() -> Self {
        Self::new(550, "Message rejected by DMARC policy")
    }

    pub fn local_error() -> Self {
        Self::new(451, "Requested action aborted: local error in processing")
    }

    pub fn start_tls() -> Self {
        Self::new(220, "Ready to start TLS")
    }

    pub fn tls_unavailable() -> Self {
        Self::new(454, "TLS not available")
    }

    pub fn tls_already_active() -> Self {
        Self::new(503, "TLS already active")
    }

    pub fn auth_prompt(challenge: &str) -> Self {
        Self::new(334, challenge)
    }

    pub fn auth_success() -> Self {
        Self::new(235, "Authentication successful")
    }

    pub fn auth_failed() -> Self {
        Self::new(535, "Authentication credentials invalid")
    }

    pub fn auth_unknown_mechanism() -> Self {
        Self::new(504, "Unrecognized authentication type")
    }

    pub fn auth_cancelled() -> Self {
        Self::new(501, "Authentication cancelled")
    }

    pub fn vrfy_disabled() -> Self {
        Self::new(252, "Cannot VRFY user")
    }

    pub fn vrfy_failed() -> Self {
        Self::new(550, "User not found")
    }

    pub fn expn_disabled() -> Self {
        Self::new(502, "EXPN command disabled")
    }

    pub fn expn_failed() -> Self {
        Self::new(550, "Mailing list not found")
    }

    pub fn timeout() -> Self {
        Self::new(421, "Timeout exceeded, closing connection")
    }

    pub fn shutdown() -> Self {
        Self::new(421, "Service shutting down, closing connection")
    }

    /// Format the reply for sending over the wire
    pub fn format(&self) -> String {
        match &self.multiline {
            Some(lines) if !lines.is_empty() => {
                let mut result = format!("{}-{}\r\n", self.code, self.message);
                for (i, line) in lines.iter().enumerate() {
                    let separator = if i == lines.len() - 1 { ' ' } else { '-' };
                    result.push_str(&format!("{}{}{}\r\n", self.code, separator, line));
                }
                result
            }
            _ => format!("{} {}\r\n", self.code, self.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format() {
        assert_eq!(SmtpResponse::ok().format(), "250 OK\r\n");
        assert_eq!(SmtpResponse::auth_prompt("").format(), "334 \r\n");
    }

    #[test]
    fn test_multiline_format() {
        let response = SmtpResponse::ehlo(
            "mx.local",
            "client.local",
            vec!["SIZE 1000".to_string(), "HELP".to_string()],
        );
        assert_eq!(
            response.format(),
            "250-mx.local Hello client.local\r\n250-SIZE 1000\r\n250 HELP\r\n"
        );
    }

    #[test]
    fn test_empty_multiline_is_single_line() {
        let response = SmtpResponse::new_multiline(250, "Hello", Vec::new());
        assert_eq!(response.format(), "250 Hello\r\n");
    }
}
