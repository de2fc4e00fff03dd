//! DKIM signing and verification with simple/simple canonicalization.
//!
//! The signed data is the selected header lines, in message order and taken
//! verbatim, followed by the `DKIM-Signature` header up to and including
//! `b=`, all joined with CRLF.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use log::debug;
use openssl::error::ErrorStack;
use openssl::hash::{hash, MessageDigest};
use openssl::pkey::{PKey, Private, Public};
use openssl::sign::{Signer, Verifier};
use thiserror::Error;

use crate::dns::TxtResolver;

/// Headers covered by outbound signatures, when present.
pub const SIGNED_HEADERS: [&str; 5] = ["from", "to", "subject", "date", "message-id"];

const SIGNATURE_HEADER: &str = "DKIM-Signature:";
const SIGNATURE_MARKER: &str = "; b=";

#[derive(Error, Debug)]
pub enum DkimError {
    #[error("No DKIM private key configured for {0}")]
    MissingKey(String),

    #[error("Invalid message format: no header-body separator")]
    NoHeaderSeparator,

    #[error("Signing failed: {0}")]
    Crypto(#[from] ErrorStack),
}

/// Signing key and selector for one domain.
#[derive(Clone)]
pub struct DkimKey {
    pub selector: String,
    pub private_key: PKey<Private>,
}

/// Splits a message at the first blank line into header block and body.
pub fn split_message(message: &str) -> Option<(&str, &str)> {
    message
        .find("\r\n\r\n")
        .map(|pos| (&message[..pos], &message[pos + 4..]))
}

/// Simple body canonicalization: CRLF line endings, no trailing empty lines,
/// exactly one final CRLF.
pub fn canonicalize_body(body: &str) -> String {
    let trimmed = body.trim_end_matches(['\r', '\n']);
    let mut canonical = trimmed.replace("\r\n", "\n").replace('\n', "\r\n");
    canonical.push_str("\r\n");
    canonical
}

/// Base64 SHA-256 of the canonicalized body, the `bh=` value.
pub fn body_hash(body: &str) -> Result<String, ErrorStack> {
    let digest = hash(MessageDigest::sha256(), canonicalize_body(body).as_bytes())?;
    Ok(BASE64.encode(&digest[..]))
}

/// Parses `tag=value; tag=value` text. Entries without `=` are ignored and a
/// repeated tag keeps its last value.
pub fn parse_tag_list(text: &str) -> HashMap<String, String> {
    text.split(';')
        .filter_map(|part| {
            let (key, value) = part.trim().split_once('=')?;
            Some((key.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

/// The `d=` domain of the first DKIM-Signature header, if any.
pub fn signature_domain(message: &str) -> Option<String> {
    let headers = split_message(message).map_or(message, |(headers, _)| headers);
    let line = find_signature_header(headers)?;
    parse_tag_list(&line[SIGNATURE_HEADER.len()..]).remove("d")
}

fn find_signature_header(headers: &str) -> Option<&str> {
    headers.split("\r\n").find(|line| {
        line.len() >= SIGNATURE_HEADER.len()
            && line.is_char_boundary(SIGNATURE_HEADER.len())
            && line[..SIGNATURE_HEADER.len()].eq_ignore_ascii_case(SIGNATURE_HEADER)
    })
}

fn header_name(line: &str) -> Option<String> {
    let (name, _) = line.split_once(':')?;
    if name.is_empty() || name.starts_with([' ', '\t']) {
        return None;
    }
    Some(name.trim().to_ascii_lowercase())
}

/// Picks the first occurrence of each wanted header, in message order.
fn select_headers<'a>(headers: &'a str, wanted: &[String]) -> (Vec<&'a str>, Vec<String>) {
    let mut seen = HashSet::new();
    let mut lines = Vec::new();
    let mut names = Vec::new();
    for line in headers.split("\r\n") {
        let Some(name) = header_name(line) else {
            continue;
        };
        if wanted.contains(&name) && seen.insert(name.clone()) {
            lines.push(line);
            names.push(name);
        }
    }
    (lines, names)
}

fn signing_input(headers: &[&str], signature_header: &str) -> String {
    let mut parts: Vec<&str> = headers.to_vec();
    parts.push(signature_header);
    parts.join("\r\n")
}

#[derive(Clone, Default)]
pub struct DkimSigner {
    keys: Arc<HashMap<String, DkimKey>>,
}

impl DkimSigner {
    pub fn new(keys: HashMap<String, DkimKey>) -> Self {
        Self { keys: Arc::new(keys) }
    }

    pub fn selector_for(&self, domain: &str) -> Option<&str> {
        self.keys
            .get(&domain.to_ascii_lowercase())
            .map(|key| key.selector.as_str())
    }

    /// Prepends a `DKIM-Signature` header signed with the domain's key.
    pub fn sign(&self, message: &str, selector: &str, domain: &str) -> Result<String, DkimError> {
        let key = self
            .keys
            .get(&domain.to_ascii_lowercase())
            .ok_or_else(|| DkimError::MissingKey(domain.to_string()))?;
        let (headers, body) = split_message(message).ok_or(DkimError::NoHeaderSeparator)?;

        let bh = body_hash(body)?;
        let wanted: Vec<String> = SIGNED_HEADERS.iter().map(|h| h.to_string()).collect();
        let (lines, names) = select_headers(headers, &wanted);

        let template = format!(
            "DKIM-Signature: v=1; a=rsa-sha256; d={}; s={}; c=simple/simple; q=dns/txt; t={}; bh={}; h={}; b=",
            domain,
            selector,
            Utc::now().timestamp(),
            bh,
            names.join(":")
        );

        let mut signer = Signer::new(MessageDigest::sha256(), &key.private_key)?;
        signer.update(signing_input(&lines, &template).as_bytes())?;
        let signature = signer.sign_to_vec()?;

        Ok(format!("{}{}\r\n{}", template, BASE64.encode(signature), message))
    }
}

#[derive(Clone)]
pub struct DkimVerifier {
    resolver: Arc<dyn TxtResolver>,
}

impl DkimVerifier {
    pub fn new(resolver: Arc<dyn TxtResolver>) -> Self {
        Self { resolver }
    }

    /// Verifies the first DKIM-Signature of `message`. Every failure, including
    /// malformed input and crypto errors, yields `false`.
    pub async fn verify(&self, message: &str, client_ip: IpAddr) -> bool {
        let Some((headers, body)) = split_message(message) else {
            debug!("DKIM from {}: no header-body separator", client_ip);
            return false;
        };
        let Some(signature_line) = find_signature_header(headers) else {
            debug!("DKIM from {}: no signature", client_ip);
            return false;
        };

        let fields = parse_tag_list(&signature_line[SIGNATURE_HEADER.len()..]);
        let (Some(domain), Some(selector), Some(b), Some(bh), Some(h)) = (
            fields.get("d"),
            fields.get("s"),
            fields.get("b"),
            fields.get("bh"),
            fields.get("h"),
        ) else {
            debug!("DKIM from {}: incomplete signature header", client_ip);
            return false;
        };

        match body_hash(body) {
            Ok(computed) if &computed == bh => {}
            _ => {
                debug!("DKIM from {}: body hash mismatch for {}", client_ip, domain);
                return false;
            }
        }

        let Some(public_key) = self.fetch_public_key(selector, domain).await else {
            debug!("DKIM from {}: no public key for {}._domainkey.{}", client_ip, selector, domain);
            return false;
        };

        let Some(marker) = signature_line.find(SIGNATURE_MARKER) else {
            return false;
        };
        let unsigned = &signature_line[..marker + SIGNATURE_MARKER.len()];

        let wanted: Vec<String> = h.split(':').map(|name| name.trim().to_ascii_lowercase()).collect();
        let (lines, _) = select_headers(headers, &wanted);
        let data = signing_input(&lines, unsigned);

        let result = verify_signature(&public_key, data.as_bytes(), b).unwrap_or(false);
        debug!("DKIM {} for {} from {}", if result { "pass" } else { "fail" }, domain, client_ip);
        result
    }

    async fn fetch_public_key(&self, selector: &str, domain: &str) -> Option<PKey<Public>> {
        let name = format!("{}._domainkey.{}", selector, domain);
        let records = self.resolver.resolve_txt_records(&name).await;
        let record = records.iter().find(|record| record.contains("p="))?;
        let encoded: String = parse_tag_list(record)
            .remove("p")?
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        let der = BASE64.decode(encoded).ok()?;
        PKey::public_key_from_der(&der).ok()
    }
}

fn verify_signature(key: &PKey<Public>, data: &[u8], signature: &str) -> Option<bool> {
    let compact: String = signature.chars().filter(|c| !c.is_whitespace()).collect();
    let signature = BASE64.decode(compact).ok()?;
    let mut verifier = Verifier::new(MessageDigest::sha256(), key).ok()?;
    verifier.update(data).ok()?;
    verifier.verify(&signature).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::StaticResolver;
    use openssl::rsa::Rsa;

    const MESSAGE: &str = "From: alice@x.com\r\n\
        To: bob@y.org\r\n\
        Subject: Hello\r\n\
        Date: Mon, 19 Oct 2026 10:00:00 +0000\r\n\
        X-Mailer: test\r\n\
        \r\n\
        Hi Bob,\r\n\
        \r\n\
        see you soon.\r\n\
        \r\n\
        \r\n";

    fn keypair() -> (PKey<Private>, String) {
        let rsa = Rsa::generate(2048).unwrap();
        let key = PKey::from_rsa(rsa).unwrap();
        let public_der = key.public_key_to_der().unwrap();
        let txt = format!("v=DKIM1; k=rsa; p={}", BASE64.encode(public_der));
        (key, txt)
    }

    fn signer_for(domain: &str, selector: &str, key: PKey<Private>) -> DkimSigner {
        let mut keys = HashMap::new();
        keys.insert(
            domain.to_string(),
            DkimKey {
                selector: selector.to_string(),
                private_key: key,
            },
        );
        DkimSigner::new(keys)
    }

    fn localhost() -> IpAddr {
        "127.0.0.1".parse().unwrap()
    }

    #[test]
    fn test_canonicalize_body() {
        assert_eq!(canonicalize_body("a\nb\n\n\n"), "a\r\nb\r\n");
        assert_eq!(canonicalize_body("a\r\nb"), "a\r\nb\r\n");
        assert_eq!(canonicalize_body(""), "\r\n");
        assert_eq!(canonicalize_body("line  \r\n\r\n"), "line  \r\n");
    }

    #[test]
    fn test_parse_tag_list() {
        let fields = parse_tag_list(" v=1; a=rsa-sha256 ;d=x.com; b=abc==; junk; ");
        assert_eq!(fields["v"], "1");
        assert_eq!(fields["a"], "rsa-sha256");
        assert_eq!(fields["d"], "x.com");
        assert_eq!(fields["b"], "abc==");
        assert!(!fields.contains_key("junk"));
    }

    #[test]
    fn test_sign_selects_present_headers_once() {
        let (key, _) = keypair();
        let signer = signer_for("x.com", "s1", key);
        let message = format!("From: second@x.com\r\n{}", MESSAGE);
        let signed = signer.sign(&message, "s1", "X.com").unwrap();

        let first = signed.split("\r\n").next().unwrap();
        assert!(first.starts_with("DKIM-Signature: v=1; a=rsa-sha256; d=X.com; s=s1;"));
        let fields = parse_tag_list(&first[SIGNATURE_HEADER.len()..]);
        assert_eq!(fields["h"], "from:to:subject:date");
        assert_eq!(fields["c"], "simple/simple");
        assert!(!fields["b"].is_empty());
        assert!(signed.ends_with(&message));
    }

    #[test]
    fn test_sign_errors() {
        let (key, _) = keypair();
        let signer = signer_for("x.com", "s1", key);
        assert!(matches!(
            signer.sign(MESSAGE, "s1", "other.com"),
            Err(DkimError::MissingKey(_))
        ));
        assert!(matches!(
            signer.sign("From: a@x.com\r\nTo: b@y.org\r\n", "s1", "x.com"),
            Err(DkimError::NoHeaderSeparator)
        ));
    }

    #[tokio::test]
    async fn test_round_trip() {
        let (key, txt) = keypair();
        let signer = signer_for("x.com", "s1", key);
        let verifier = DkimVerifier::new(Arc::new(
            StaticResolver::new().with_record("s1._domainkey.x.com", &txt),
        ));

        let signed = signer.sign(MESSAGE, "s1", "x.com").unwrap();
        assert!(verifier.verify(&signed, localhost()).await);
        assert_eq!(signature_domain(&signed).as_deref(), Some("x.com"));
    }

    #[tokio::test]
    async fn test_body_mutation_fails() {
        let (key, txt) = keypair();
        let signer = signer_for("x.com", "s1", key);
        let verifier = DkimVerifier::new(Arc::new(
            StaticResolver::new().with_record("s1._domainkey.x.com", &txt),
        ));

        let signed = signer.sign(MESSAGE, "s1", "x.com").unwrap();
        let tampered = signed.replace("see you soon", "see you sooN");
        assert!(!verifier.verify(&tampered, localhost()).await);
    }

    #[tokio::test]
    async fn test_header_mutation_fails() {
        let (key, txt) = keypair();
        let signer = signer_for("x.com", "s1", key);
        let verifier = DkimVerifier::new(Arc::new(
            StaticResolver::new().with_record("s1._domainkey.x.com", &txt),
        ));

        let signed = signer.sign(MESSAGE, "s1", "x.com").unwrap();
        let tampered = signed.replace("Subject: Hello", "Subject: Hellp");
        assert!(!verifier.verify(&tampered, localhost()).await);
    }

    #[tokio::test]
    async fn test_wrong_public_key_fails() {
        let (key, _) = keypair();
        let (_, other_txt) = keypair();
        let signer = signer_for("x.com", "s1", key);
        let verifier = DkimVerifier::new(Arc::new(
            StaticResolver::new().with_record("s1._domainkey.x.com", &other_txt),
        ));

        let signed = signer.sign(MESSAGE, "s1", "x.com").unwrap();
        assert!(!verifier.verify(&signed, localhost()).await);
    }

    #[tokio::test]
    async fn test_unsigned_and_incomplete() {
        let verifier = DkimVerifier::new(Arc::new(StaticResolver::new()));
        assert!(!verifier.verify(MESSAGE, localhost()).await);

        let incomplete = format!("DKIM-Signature: v=1; d=x.com; s=s1; b=abc\r\n{}", MESSAGE);
        assert!(!verifier.verify(&incomplete, localhost()).await);
        assert!(!verifier.verify("no separator at all", localhost()).await);
    }

    #[tokio::test]
    async fn test_missing_public_key_fails() {
        let (key, _) = keypair();
        let signer = signer_for("x.com", "s1", key);
        let verifier = DkimVerifier::new(Arc::new(StaticResolver::new()));
        let signed = signer.sign(MESSAGE, "s1", "x.com").unwrap();
        assert!(!verifier.verify(&signed, localhost()).await);
    }
}
