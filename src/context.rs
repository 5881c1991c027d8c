use crate::dns::{self, DnsResolver, DnsResult};
use crate::patterns::PatternSource;
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

/// Reverse DNS results for the remote IP.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReverseDns {
    /// Names whose forward lookup includes the remote IP.
    pub verified: Vec<String>,
    /// Names with no forward lookup at all.
    pub nofwd: Vec<String>,
    /// Names that resolve, but not to the remote IP.
    pub inconsistent: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeloVerb {
    Helo,
    Ehlo,
}

/// Everything the rules can look at for one connection.
///
/// The protocol layer fills fields in as the conversation goes on; the
/// rule scan reads them and writes back with-properties, DNSBL hits and
/// the data-unavailable signal. A Context belongs to exactly one
/// connection and is never shared.
pub struct Context {
    pub remote_ip: Option<IpAddr>,
    pub local_ip: Option<IpAddr>,
    pub rdns: ReverseDns,
    pub tls_on: bool,
    pub helo_verb: Option<HeloVerb>,
    pub heloname: String,
    pub from: String,
    /// The RCPT TO address currently being checked.
    pub rcptto: String,
    /// With-properties accumulated from matching clauses.
    pub withprops: HashMap<String, String>,
    /// DNS blocklist domains that have produced a hit, in first-hit order.
    pub dnsbl_hits: Vec<String>,
    pub(crate) rulemiss: bool,
    listed: HashMap<String, bool>,
    domains: HashMap<String, DnsResult>,
    dns: Arc<dyn DnsResolver>,
    patterns: Arc<dyn PatternSource>,
}

impl Context {
    pub fn new(dns: Arc<dyn DnsResolver>, patterns: Arc<dyn PatternSource>) -> Self {
        Self {
            remote_ip: None,
            local_ip: None,
            rdns: ReverseDns::default(),
            tls_on: false,
            helo_verb: None,
            heloname: String::new(),
            from: String::new(),
            rcptto: String::new(),
            withprops: HashMap::new(),
            dnsbl_hits: Vec::new(),
            rulemiss: false,
            listed: HashMap::new(),
            domains: HashMap::new(),
            dns,
            patterns,
        }
    }

    /// Whether the last rule check ran into a matcher with no data to
    /// match against (an empty or missing pattern file).
    pub fn data_unavailable(&self) -> bool {
        self.rulemiss
    }

    pub fn dns(&self) -> &dyn DnsResolver {
        self.dns.as_ref()
    }

    pub async fn pattern_list(&self, arg: &str) -> Vec<String> {
        self.patterns.resolve(arg).await
    }

    /// Probe a DNS list name, remembering the answer for this connection.
    pub async fn listed(&mut self, name: &str) -> bool {
        if let Some(hit) = self.listed.get(name) {
            return *hit;
        }
        let hit = self.dns.is_listed(name).await;
        self.listed.insert(name.to_string(), hit);
        hit
    }

    pub fn add_dnsbl_hit(&mut self, domain: &str) {
        if !self.dnsbl_hits.iter().any(|d| d == domain) {
            self.dnsbl_hits.push(domain.to_string());
        }
    }

    /// Mail-domain validity of `domain`, remembered for this connection.
    pub async fn domain_validity(&mut self, domain: &str) -> DnsResult {
        let key = domain.to_lowercase();
        if let Some(result) = self.domains.get(&key) {
            return *result;
        }
        let (result, reason) = dns::valid_domain(self.dns.as_ref(), &key).await;
        match &reason {
            Some(reason) => log::debug!("Domain {key} is {result}: {reason}"),
            None => log::debug!("Domain {key} is {result}"),
        }
        self.domains.insert(key, result);
        result
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("remote_ip", &self.remote_ip)
            .field("local_ip", &self.local_ip)
            .field("rdns", &self.rdns)
            .field("tls_on", &self.tls_on)
            .field("helo_verb", &self.helo_verb)
            .field("heloname", &self.heloname)
            .field("from", &self.from)
            .field("rcptto", &self.rcptto)
            .field("withprops", &self.withprops)
            .field("dnsbl_hits", &self.dnsbl_hits)
            .finish()
    }
}
