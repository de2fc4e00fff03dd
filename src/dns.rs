//! TXT record lookups used by SPF, DKIM and DMARC, and the PTR lookup for
//! the `Received` trace header.

use std::collections::HashMap;
use std::net::IpAddr;

use async_trait::async_trait;
use hickory_resolver::error::ResolveError;
use hickory_resolver::TokioAsyncResolver;
use log::debug;

/// Source of DNS TXT records.
///
/// Lookup failures of any kind are reported as an empty list; the policy
/// checkers decide what a missing record means.
#[async_trait]
pub trait TxtResolver: Send + Sync {
    async fn resolve_txt_records(&self, name: &str) -> Vec<String>;

    /// First PTR name for `ip`, without the trailing dot.
    async fn reverse_lookup(&self, _ip: IpAddr) -> Option<String> {
        None
    }
}

/// Resolver backed by the system DNS configuration.
pub struct DnsResolver {
    inner: TokioAsyncResolver,
}

impl DnsResolver {
    pub fn from_system_conf() -> Result<Self, ResolveError> {
        Ok(Self {
            inner: TokioAsyncResolver::tokio_from_system_conf()?,
        })
    }
}

#[async_trait]
impl TxtResolver for DnsResolver {
    async fn resolve_txt_records(&self, name: &str) -> Vec<String> {
        match self.inner.txt_lookup(name).await {
            Ok(lookup) => lookup
                .iter()
                .map(|txt| {
                    // A TXT record may be split into several character-strings.
                    txt.txt_data()
                        .iter()
                        .map(|chunk| String::from_utf8_lossy(chunk))
                        .collect::<String>()
                })
                .collect(),
            Err(e) => {
                debug!("TXT lookup for {} failed: {}", name, e);
                Vec::new()
            }
        }
    }

    async fn reverse_lookup(&self, ip: IpAddr) -> Option<String> {
        match self.inner.reverse_lookup(ip).await {
            Ok(lookup) => lookup.iter().next().map(|name| normalize(&name.to_utf8())),
            Err(e) => {
                debug!("PTR lookup for {} failed: {}", ip, e);
                None
            }
        }
    }
}

/// Fixed set of TXT records, keyed by lowercase name.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    records: HashMap<String, Vec<String>>,
    pointers: HashMap<IpAddr, String>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_record(mut self, name: &str, value: &str) -> Self {
        self.insert(name, value);
        self
    }

    pub fn with_pointer(mut self, ip: IpAddr, name: &str) -> Self {
        self.pointers.insert(ip, normalize(name));
        self
    }

    pub fn insert(&mut self, name: &str, value: &str) {
        self.records
            .entry(normalize(name))
            .or_default()
            .push(value.to_string());
    }
}

#[async_trait]
impl TxtResolver for StaticResolver {
    async fn resolve_txt_records(&self, name: &str) -> Vec<String> {
        self.records.get(&normalize(name)).cloned().unwrap_or_default()
    }

    async fn reverse_lookup(&self, ip: IpAddr) -> Option<String> {
        self.pointers.get(&ip).cloned()
    }
}

fn normalize(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_resolver_is_case_insensitive() {
        let resolver = StaticResolver::new()
            .with_record("Example.com.", "v=spf1 -all")
            .with_record("example.com", "google-site-verification=abc");

        let records = resolver.resolve_txt_records("EXAMPLE.COM").await;
        assert_eq!(records, vec!["v=spf1 -all", "google-site-verification=abc"]);
        assert!(resolver.resolve_txt_records("other.com").await.is_empty());
    }

    #[tokio::test]
    async fn test_static_resolver_pointer() {
        let ip: IpAddr = "192.0.2.7".parse().unwrap();
        let resolver = StaticResolver::new().with_pointer(ip, "Relay.Example.net.");

        assert_eq!(resolver.reverse_lookup(ip).await.as_deref(), Some("relay.example.net"));
        let other: IpAddr = "192.0.2.8".parse().unwrap();
        assert_eq!(resolver.reverse_lookup(other).await, None);
    }
}
