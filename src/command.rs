//! Command-line parsing for the session dispatcher.

/// Commands understood by a session; the dispatch key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Helo,
    Ehlo,
    Mail,
    Rcpt,
    Data,
    Rset,
    Noop,
    Quit,
    Help,
    Vrfy,
    Expn,
    Auth,
    StartTls,
}

impl Verb {
    pub fn parse(word: &str) -> Option<Self> {
        let verb = match word.to_ascii_uppercase().as_str() {
            "HELO" => Verb::Helo,
            "EHLO" => Verb::Ehlo,
            "MAIL" => Verb::Mail,
            "RCPT" => Verb::Rcpt,
            "DATA" => Verb::Data,
            "RSET" => Verb::Rset,
            "NOOP" => Verb::Noop,
            "QUIT" => Verb::Quit,
            "HELP" => Verb::Help,
            "VRFY" => Verb::Vrfy,
            "EXPN" => Verb::Expn,
            "AUTH" => Verb::Auth,
            "STARTTLS" => Verb::StartTls,
            _ => return None,
        };
        Some(verb)
    }
}

/// Splits a command line into its verb word and the trimmed remainder.
pub fn split(line: &str) -> (&str, &str) {
    let line = line.trim();
    match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    }
}

/// Extracts the address following `FROM:` / `TO:` in MAIL and RCPT
/// arguments. Angle brackets and trailing ESMTP parameters are dropped.
pub fn extract_path(args: &str, keyword: &str) -> Option<String> {
    let upper = args.to_ascii_uppercase();
    let start = upper.find(&keyword.to_ascii_uppercase())? + keyword.len();
    let rest = args[start..].trim_start();

    let address = if let Some(inner) = rest.strip_prefix('<') {
        &inner[..inner.find('>')?]
    } else {
        rest.split_whitespace().next().unwrap_or("")
    };
    Some(address.trim().to_string())
}

/// Domain part of an address, empty when there is none.
pub fn domain_of(address: &str) -> &str {
    address.rsplit_once('@').map_or("", |(_, domain)| domain)
}
