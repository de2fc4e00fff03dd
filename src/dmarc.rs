//! DMARC policy evaluation on top of the SPF and DKIM verdicts.
//!
//! Alignment is relaxed-only: `aspf=s` and `adkim=s` are parsed but disable
//! the corresponding alignment path instead of tightening it.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use log::{info, warn};

use crate::dkim::{parse_tag_list, signature_domain, DkimVerifier};
use crate::dns::TxtResolver;
use crate::metrics::Metrics;
use crate::spf::SpfChecker;

/// Requested disposition from the `p=` tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DmarcPolicy {
    None,
    Quarantine,
    Reject,
    Unknown(String),
}

impl DmarcPolicy {
    pub fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "none" => DmarcPolicy::None,
            "quarantine" => DmarcPolicy::Quarantine,
            "reject" => DmarcPolicy::Reject,
            other => DmarcPolicy::Unknown(other.to_string()),
        }
    }
}

#[derive(Clone)]
pub struct DmarcChecker {
    resolver: Arc<dyn TxtResolver>,
    spf: SpfChecker,
    dkim: DkimVerifier,
    metrics: Arc<Metrics>,
    fail_open: bool,
}

impl DmarcChecker {
    pub fn new(
        resolver: Arc<dyn TxtResolver>,
        spf: SpfChecker,
        dkim: DkimVerifier,
        metrics: Arc<Metrics>,
        fail_open: bool,
    ) -> Self {
        Self {
            resolver,
            spf,
            dkim,
            metrics,
            fail_open,
        }
    }

    pub async fn check(
        &self,
        message: &str,
        client_ip: IpAddr,
        mail_from_domain: &str,
        helo_domain: &str,
    ) -> bool {
        info!("DMARC check for {}", mail_from_domain);

        let Some(record) = self.lookup(mail_from_domain).await else {
            warn!("No DMARC record for {}", mail_from_domain);
            return self.fail_open;
        };

        let fields = parse_tag_list(&record);
        if fields.get("v").map(String::as_str) != Some("DMARC1") {
            warn!("Invalid DMARC record for {}", mail_from_domain);
            return self.fail_open;
        }
        let Some(policy) = fields.get("p") else {
            warn!("DMARC record for {} has no policy", mail_from_domain);
            return self.fail_open;
        };

        let spf_pass = self.spf.check(client_ip, mail_from_domain, helo_domain).await;
        if !spf_pass {
            self.metrics.increment_rejected_spf();
        }
        let dkim_pass = self.dkim.verify(message, client_ip).await;
        if !dkim_pass {
            self.metrics.increment_rejected_dkim();
        }

        let spf_aligned = spf_pass && is_spf_aligned(mail_from_domain, helo_domain);
        let dkim_aligned = dkim_pass && is_dkim_aligned(message, mail_from_domain);
        let dmarc_pass = (spf_aligned && relaxed(&fields, "aspf")) || (dkim_aligned && relaxed(&fields, "adkim"));
        if !dmarc_pass {
            self.metrics.increment_rejected_dmarc();
        }

        match DmarcPolicy::parse(policy) {
            DmarcPolicy::None => true,
            DmarcPolicy::Quarantine | DmarcPolicy::Reject => {
                if !dmarc_pass {
                    warn!("DMARC policy {} failed for {}", policy, mail_from_domain);
                }
                dmarc_pass
            }
            DmarcPolicy::Unknown(other) => {
                warn!("Unknown DMARC policy {} for {}", other, mail_from_domain);
                self.fail_open
            }
        }
    }

    async fn lookup(&self, domain: &str) -> Option<String> {
        if domain.is_empty() {
            return None;
        }
        self.resolver
            .resolve_txt_records(&format!("_dmarc.{}", domain))
            .await
            .into_iter()
            .find(|record| {
                record.len() >= 8 && record.is_char_boundary(8) && record[..8].eq_ignore_ascii_case("v=DMARC1")
            })
    }
}

fn relaxed(fields: &HashMap<String, String>, tag: &str) -> bool {
    fields.get(tag).map_or("r", String::as_str) == "r"
}

pub fn is_spf_aligned(mail_from_domain: &str, helo_domain: &str) -> bool {
    mail_from_domain.eq_ignore_ascii_case(helo_domain)
}

pub fn is_dkim_aligned(message: &str, mail_from_domain: &str) -> bool {
    signature_domain(message).map_or(false, |d| d.eq_ignore_ascii_case(mail_from_domain))
}
