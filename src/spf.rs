//! Sender Policy Framework evaluation.
//!
//! Only a subset of the mechanism grammar is understood: `ip4`, `include`,
//! `+all` and `-all`. Everything else is skipped, and a record that runs out
//! of mechanisms without a match fails.

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};
use std::pin::Pin;
use std::sync::Arc;

use log::debug;

use crate::dns::TxtResolver;

/// Maximum nesting of `include:` mechanisms.
pub const MAX_INCLUDE_DEPTH: usize = 10;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One whitespace-separated term of an SPF record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpfMechanism<'a> {
    Ip4(&'a str),
    Include(&'a str),
    PassAll,
    FailAll,
    Unsupported(&'a str),
}

impl<'a> SpfMechanism<'a> {
    pub fn parse(term: &'a str) -> Self {
        if let Some(range) = term.strip_prefix("ip4:") {
            SpfMechanism::Ip4(range)
        } else if let Some(domain) = term.strip_prefix("include:") {
            SpfMechanism::Include(domain)
        } else if term == "+all" {
            SpfMechanism::PassAll
        } else if term == "-all" {
            SpfMechanism::FailAll
        } else {
            SpfMechanism::Unsupported(term)
        }
    }
}

#[derive(Clone)]
pub struct SpfChecker {
    resolver: Arc<dyn TxtResolver>,
    fail_open: bool,
}

impl SpfChecker {
    pub fn new(resolver: Arc<dyn TxtResolver>, fail_open: bool) -> Self {
        Self { resolver, fail_open }
    }

    /// Checks whether `client_ip` may send for the MAIL FROM domain, falling
    /// back to the HELO domain's record when the former publishes none.
    pub async fn check(&self, client_ip: IpAddr, mail_from_domain: &str, helo_domain: &str) -> bool {
        let record = match self.lookup(mail_from_domain).await {
            Some(record) => Some(record),
            None => self.lookup(helo_domain).await,
        };

        let Some(record) = record else {
            debug!(
                "No SPF record for {} or {}, defaulting to {}",
                mail_from_domain,
                helo_domain,
                if self.fail_open { "pass" } else { "fail" }
            );
            return self.fail_open;
        };

        let result = self.evaluate(&record, client_ip, 0).await;
        debug!("SPF {} for {} from {}", if result { "pass" } else { "fail" }, mail_from_domain, client_ip);
        result
    }

    async fn lookup(&self, domain: &str) -> Option<String> {
        if domain.is_empty() {
            return None;
        }
        self.resolver
            .resolve_txt_records(domain)
            .await
            .into_iter()
            .find(|record| starts_with_ignore_case(record, "v=spf1"))
    }

    fn evaluate<'a>(&'a self, record: &'a str, client_ip: IpAddr, depth: usize) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            if !starts_with_ignore_case(record, "v=spf1") {
                return false;
            }

            for term in record.split_whitespace().skip(1) {
                match SpfMechanism::parse(term) {
                    SpfMechanism::Ip4(range) => {
                        if ip_in_range(client_ip, range) {
                            return true;
                        }
                    }
                    SpfMechanism::Include(domain) => {
                        if depth >= MAX_INCLUDE_DEPTH {
                            debug!("SPF include depth exceeded at {}", domain);
                            continue;
                        }
                        if let Some(included) = self.lookup(domain).await {
                            if self.evaluate(&included, client_ip, depth + 1).await {
                                return true;
                            }
                        }
                    }
                    SpfMechanism::FailAll => return false,
                    SpfMechanism::PassAll => return true,
                    SpfMechanism::Unsupported(term) => debug!("Ignoring SPF term {}", term),
                }
            }

            false
        })
    }
}

/// Matches an address against `a.b.c.d` or `a.b.c.d/bits` by comparing the
/// leading `bits` of both addresses.
pub fn ip_in_range(client_ip: IpAddr, range: &str) -> bool {
    let IpAddr::V4(client) = client_ip else {
        return false;
    };

    let (network, bits) = match range.split_once('/') {
        Some((network, bits)) => match bits.parse::<usize>() {
            Ok(bits) => (network, bits),
            Err(_) => return false,
        },
        None => (range, 32),
    };
    let Ok(network) = network.parse::<Ipv4Addr>() else {
        return false;
    };
    if bits > 32 {
        return false;
    }

    let network = network.octets();
    let client = client.octets();
    let whole = bits / 8;
    let remainder = bits % 8;

    if network[..whole] != client[..whole] {
        return false;
    }
    if remainder > 0 {
        let mask = 0xffu8 << (8 - remainder);
        return network[whole] & mask == client[whole] & mask;
    }
    true
}

fn starts_with_ignore_case(text: &str, prefix: &str) -> bool {
    text.len() >= prefix.len()
        && text.is_char_boundary(prefix.len())
        && text[..prefix.len()].eq_ignore_ascii_case(prefix)
}
